//! Shared state between the ingest loop and HTTP handlers
//!
//! One mutex guards both the pending barcode queue and the latest weight, so
//! no reader can observe a half-applied update. Critical sections are a few
//! pointer moves; nothing awaits while holding the lock.

use crate::domain::types::{BarcodeEvent, WeightReading};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Default)]
struct Inner {
    barcodes: VecDeque<BarcodeEvent>,
    weight: Option<WeightReading>,
}

#[derive(Debug)]
pub struct SharedState {
    inner: Mutex<Inner>,
    stale_after: Duration,
    max_pending: usize,
}

impl SharedState {
    pub fn new(stale_after: Duration, max_pending: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            stale_after,
            max_pending: max_pending.max(1),
        }
    }

    /// Queue a scan. Never blocks on readers; when the queue is full the
    /// oldest scan is evicted and returned.
    pub fn push_barcode(&self, event: BarcodeEvent) -> Option<BarcodeEvent> {
        let mut inner = self.inner.lock();
        let evicted = if inner.barcodes.len() >= self.max_pending {
            inner.barcodes.pop_front()
        } else {
            None
        };
        inner.barcodes.push_back(event);
        drop(inner);

        if let Some(ref old) = evicted {
            warn!(barcode = %old.code, max_pending = %self.max_pending, "barcode_queue_full_dropped_oldest");
        }
        evicted
    }

    /// Remove and return the oldest pending scan
    pub fn pop_barcode(&self) -> Option<BarcodeEvent> {
        self.inner.lock().barcodes.pop_front()
    }

    pub fn pending_barcodes(&self) -> usize {
        self.inner.lock().barcodes.len()
    }

    /// Overwrite the latest reading (last writer wins)
    pub fn set_weight(&self, reading: WeightReading) {
        self.inner.lock().weight = Some(reading);
    }

    /// Latest weight, or None if never seen or older than the staleness threshold
    pub fn get_weight(&self) -> Option<f64> {
        self.get_weight_at(Instant::now())
    }

    pub fn get_weight_at(&self, now: Instant) -> Option<f64> {
        self.fresh_reading_at(now).map(|r| r.value)
    }

    /// Latest reading if it is within the staleness threshold at `now`
    pub fn fresh_reading_at(&self, now: Instant) -> Option<WeightReading> {
        let reading = self.inner.lock().weight?;
        let age = now.saturating_duration_since(reading.measured_at);
        (age <= self.stale_after).then_some(reading)
    }
}
