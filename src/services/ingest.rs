//! Serial ingest loop
//!
//! The single reader of the scanner/scale port. Each pass:
//! 1. If the port is down, reopen it (paced by backoff, interruptible by shutdown)
//! 2. If a weight poll is due, write the weight request command
//! 3. Read with a short timeout, reassemble frames, classify, update shared state
//!
//! Malformed frames are logged and dropped; the loop never exits on bad input
//! or I/O errors, only on shutdown.

use crate::domain::frame::{Classified, FrameAssembler, FrameParser, SerialFrame};
use crate::domain::types::{BarcodeEvent, WeightReading};
use crate::infra::config::Config;
use crate::infra::error::BridgeError;
use crate::infra::metrics::Metrics;
use crate::io::serial::{Backoff, SerialConnector, SerialHandle};
use crate::services::state::SharedState;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

const READ_BUF_LEN: usize = 256;

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub divisor: f64,
    pub weight_request: Vec<u8>,
    /// None disables polling (scale streams on its own, or no scale fitted)
    pub weight_poll_interval: Option<Duration>,
    pub backoff: Backoff,
}

impl IngestSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            divisor: config.weight_divisor(),
            weight_request: config.weight_request().to_vec(),
            weight_poll_interval: config.weight_poll_interval(),
            backoff: Backoff::from_config(config),
        }
    }
}

pub struct IngestLoop<C: SerialConnector> {
    handle: SerialHandle<C>,
    parser: Arc<dyn FrameParser>,
    state: Arc<SharedState>,
    metrics: Arc<Metrics>,
    settings: IngestSettings,
    assembler: FrameAssembler,
    last_weight_poll: Option<Instant>,
}

impl<C: SerialConnector> IngestLoop<C> {
    pub fn new(
        handle: SerialHandle<C>,
        parser: Arc<dyn FrameParser>,
        state: Arc<SharedState>,
        metrics: Arc<Metrics>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            handle,
            parser,
            state,
            metrics,
            settings,
            assembler: FrameAssembler::default(),
            last_weight_poll: None,
        }
    }

    /// Run until the shutdown flag flips to true
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            device = %self.handle.device(),
            divisor = %self.settings.divisor,
            weight_poll_ms = ?self.settings.weight_poll_interval.map(|d| d.as_millis()),
            "serial_ingest_started"
        );

        let mut buf = [0u8; READ_BUF_LEN];

        loop {
            if *shutdown.borrow() {
                break;
            }

            if !self.handle.is_healthy() && !self.reopen(&mut shutdown).await {
                break;
            }

            if self.weight_poll_due() {
                self.last_weight_poll = Some(Instant::now());
                if let Err(e) = self.handle.write(&self.settings.weight_request).await {
                    self.on_port_lost(&e);
                    continue;
                }
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                result = self.handle.read(&mut buf) => match result {
                    Ok(Some(n)) => self.ingest(&buf[..n]),
                    Ok(None) => {}
                    Err(e) => self.on_port_lost(&e),
                }
            }
        }

        info!("serial_ingest_shutdown");
    }

    /// Reopen the port, waiting out the backoff between failures.
    /// Returns false if shutdown was requested while waiting.
    async fn reopen(&mut self, shutdown: &mut watch::Receiver<bool>) -> bool {
        loop {
            match self.handle.reconnect() {
                Ok(()) => {
                    self.settings.backoff.reset();
                    self.assembler.clear();
                    self.last_weight_poll = None;
                    self.metrics.record_serial_connect();
                    return true;
                }
                Err(e) => {
                    self.metrics.record_serial_open_failure();
                    let delay = self.settings.backoff.next_delay();
                    debug!(error = %e, retry_in_ms = %delay.as_millis(), "serial_reconnect_scheduled");

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                return false;
                            }
                        }
                    }
                    if *shutdown.borrow() {
                        return false;
                    }
                }
            }
        }
    }

    fn on_port_lost(&mut self, error: &BridgeError) {
        warn!(error = %error, "serial_port_lost");
        self.metrics.record_serial_disconnect();
        self.assembler.clear();
    }

    fn weight_poll_due(&self) -> bool {
        match (self.settings.weight_poll_interval, self.last_weight_poll) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(interval), Some(last)) => last.elapsed() >= interval,
        }
    }

    /// Feed raw bytes through reassembly and classification
    pub fn ingest(&mut self, data: &[u8]) {
        for frame in self.assembler.push(data) {
            self.handle_frame(frame);
        }
    }

    fn handle_frame(&self, frame: SerialFrame) {
        match self.parser.classify(&frame.bytes) {
            Classified::Barcode(code) => {
                info!(barcode = %code, "barcode_scanned");
                self.metrics.record_barcode_scanned();
                let event = BarcodeEvent { code, scanned_at: frame.received_wall };
                if self.state.push_barcode(event).is_some() {
                    self.metrics.record_barcode_dropped();
                }
            }
            Classified::Weight(raw) => {
                let reading = WeightReading::from_raw(raw, self.settings.divisor, frame.received_at);
                trace!(raw = %raw, weight = %reading.value, "weight_frame");
                self.metrics.record_weight_frame();
                self.state.set_weight(reading);
            }
            Classified::ScaleStatus(code) => {
                debug!(code = %code, "scale_status_frame");
                self.metrics.record_scale_status();
            }
            Classified::Malformed(reason) => {
                let error = BridgeError::MalformedFrame { reason: reason.to_string() };
                warn!(error = %error, raw_hex = %hex::encode(&frame.bytes), "serial_frame_dropped");
                self.metrics.record_malformed_frame();
            }
        }
    }
}
