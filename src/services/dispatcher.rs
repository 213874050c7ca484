//! Printer dispatcher - one job at a time, direct device first, spooler fallback
//!
//! Interleaved writes to a raw printer device corrupt both receipts, so a
//! second job arriving while one is in flight is rejected with `Busy` rather
//! than queued. Each job re-probes both transports; a failed direct write
//! only affects the job that hit it.

use crate::domain::types::{
    fallback, first_choice, select_transport, JobKind, JobOutcome, PrinterJob, Transport,
    TransportHealth,
};
use crate::infra::error::{BridgeError, BridgeResult};
use crate::infra::metrics::Metrics;
use crate::io::printer::{PrinterHandles, DRAWER_KICK};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Snapshot for `/printer_status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrinterStatus {
    /// "ready" or "unavailable"
    pub status: &'static str,
    /// Device path or queue name of the selected transport
    pub printer: Option<String>,
    pub method: Transport,
    pub direct_available: bool,
    pub spooler_available: bool,
}

pub struct PrinterDispatcher {
    handles: PrinterHandles,
    in_flight: Mutex<()>,
    metrics: Arc<Metrics>,
}

impl PrinterDispatcher {
    pub fn new(handles: PrinterHandles, metrics: Arc<Metrics>) -> Self {
        Self { handles, in_flight: Mutex::new(()), metrics }
    }

    /// Send a raw control stream to the printer
    pub async fn print(&self, payload: &[u8]) -> BridgeResult<PrinterJob> {
        self.run_job(JobKind::Raw, payload).await
    }

    /// Kick the cash drawer through the same path as any print job
    pub async fn open_drawer(&self) -> BridgeResult<PrinterJob> {
        self.run_job(JobKind::DrawerKick, &DRAWER_KICK).await
    }

    /// True while a job holds the printer
    pub fn is_busy(&self) -> bool {
        self.in_flight.try_lock().is_err()
    }

    /// Probe both transports and report which one a job would use now.
    /// Never writes to the printer. While a job holds the printer the device
    /// is left alone and the health recorded by that job is reported.
    pub async fn status(&self) -> PrinterStatus {
        if self.is_busy() {
            return self.describe(&self.handles.health());
        }
        let health = self.handles.probe().await;
        self.describe(&health)
    }

    fn describe(&self, health: &TransportHealth) -> PrinterStatus {
        let method = select_transport(health);
        PrinterStatus {
            status: if method == Transport::Unavailable { "unavailable" } else { "ready" },
            printer: self.handles.get(method).map(|t| t.target().to_string()),
            method,
            direct_available: health.direct,
            spooler_available: health.spooler,
        }
    }

    async fn run_job(&self, kind: JobKind, payload: &[u8]) -> BridgeResult<PrinterJob> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            self.metrics.record_print_busy();
            warn!(kind = %kind.as_str(), bytes = %payload.len(), "print_job_rejected_busy");
            return Err(BridgeError::Busy);
        };

        let mut job = PrinterJob::new(kind, payload.len());
        let start = Instant::now();
        let health = self.handles.probe().await;

        let result = self.deliver(&mut job, &health, payload).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(()) => {
                job.outcome = JobOutcome::Success;
                self.metrics.record_print_success(job.transport, job.fell_back);
                info!(
                    job_id = %job.id,
                    kind = %kind.as_str(),
                    bytes = %job.bytes,
                    method = %job.transport,
                    fell_back = %job.fell_back,
                    elapsed_ms = %elapsed_ms,
                    "print_job_completed"
                );
                Ok(job)
            }
            Err(e) => {
                self.metrics.record_print_failure();
                error!(
                    job_id = %job.id,
                    kind = %kind.as_str(),
                    bytes = %job.bytes,
                    error = %e,
                    elapsed_ms = %elapsed_ms,
                    "print_job_failed"
                );
                Err(e)
            }
        }
    }

    /// Try the first-choice transport, then the fallback. Never drops a job
    /// silently: if nothing delivers it the last error is returned.
    async fn deliver(
        &self,
        job: &mut PrinterJob,
        health: &TransportHealth,
        payload: &[u8],
    ) -> BridgeResult<()> {
        let mut transport = first_choice(health);
        let mut last_error = None;

        while let Some(handle) = self.handles.get(transport) {
            job.transport = transport;
            let result = handle.send(payload).await;

            if transport == Transport::DirectUsb {
                self.handles.record_direct_result(result.is_ok());
            }

            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(job_id = %job.id, method = %transport, error = %e, "print_transport_failed");
                    last_error = Some(e);
                    transport = fallback(health, transport);
                    job.fell_back = transport != Transport::Unavailable;
                }
            }
        }

        job.transport = Transport::Unavailable;
        job.fell_back = false;
        Err(match last_error {
            Some(e) => e,
            None => BridgeError::device_unavailable(
                "printer",
                "no direct device or spooler queue available",
            ),
        })
    }
}
