//! Lock-free bridge counters
//!
//! Uses atomics so the ingest loop and request handlers never contend on a
//! lock just to count something. Exposed in Prometheus text format at
//! `/metrics` and logged periodically.
//!
//! NOTE: All atomics use Relaxed ordering intentionally, these are statistical
//! counters only. Do NOT use them for coordination.

use crate::domain::types::Transport;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

#[derive(Debug)]
pub struct Metrics {
    started_at: Instant,
    barcodes_scanned: AtomicU64,
    barcodes_delivered: AtomicU64,
    /// Oldest pending scan evicted because the queue was full
    barcodes_dropped: AtomicU64,
    weight_frames: AtomicU64,
    scale_status_frames: AtomicU64,
    malformed_frames: AtomicU64,
    serial_connects: AtomicU64,
    serial_disconnects: AtomicU64,
    serial_open_failures: AtomicU64,
    print_jobs_direct: AtomicU64,
    print_jobs_spooler: AtomicU64,
    print_fallbacks: AtomicU64,
    print_jobs_failed: AtomicU64,
    print_busy_rejections: AtomicU64,
}

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub barcodes_scanned: u64,
    pub barcodes_delivered: u64,
    pub barcodes_dropped: u64,
    pub weight_frames: u64,
    pub scale_status_frames: u64,
    pub malformed_frames: u64,
    pub serial_connects: u64,
    pub serial_disconnects: u64,
    pub serial_open_failures: u64,
    pub print_jobs_direct: u64,
    pub print_jobs_spooler: u64,
    pub print_fallbacks: u64,
    pub print_jobs_failed: u64,
    pub print_busy_rejections: u64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            barcodes_scanned: AtomicU64::new(0),
            barcodes_delivered: AtomicU64::new(0),
            barcodes_dropped: AtomicU64::new(0),
            weight_frames: AtomicU64::new(0),
            scale_status_frames: AtomicU64::new(0),
            malformed_frames: AtomicU64::new(0),
            serial_connects: AtomicU64::new(0),
            serial_disconnects: AtomicU64::new(0),
            serial_open_failures: AtomicU64::new(0),
            print_jobs_direct: AtomicU64::new(0),
            print_jobs_spooler: AtomicU64::new(0),
            print_fallbacks: AtomicU64::new(0),
            print_jobs_failed: AtomicU64::new(0),
            print_busy_rejections: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_barcode_scanned(&self) {
        self.barcodes_scanned.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_barcode_delivered(&self) {
        self.barcodes_delivered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_barcode_dropped(&self) {
        self.barcodes_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_weight_frame(&self) {
        self.weight_frames.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_scale_status(&self) {
        self.scale_status_frames.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_malformed_frame(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_serial_connect(&self) {
        self.serial_connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_serial_disconnect(&self) {
        self.serial_disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_serial_open_failure(&self) {
        self.serial_open_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_print_success(&self, transport: Transport, fell_back: bool) {
        match transport {
            Transport::DirectUsb => self.print_jobs_direct.fetch_add(1, Ordering::Relaxed),
            Transport::Spooler => self.print_jobs_spooler.fetch_add(1, Ordering::Relaxed),
            Transport::Unavailable => return,
        };
        if fell_back {
            self.print_fallbacks.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_print_failure(&self) {
        self.print_jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_print_busy(&self) {
        self.print_busy_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            barcodes_scanned: self.barcodes_scanned.load(Ordering::Relaxed),
            barcodes_delivered: self.barcodes_delivered.load(Ordering::Relaxed),
            barcodes_dropped: self.barcodes_dropped.load(Ordering::Relaxed),
            weight_frames: self.weight_frames.load(Ordering::Relaxed),
            scale_status_frames: self.scale_status_frames.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            serial_connects: self.serial_connects.load(Ordering::Relaxed),
            serial_disconnects: self.serial_disconnects.load(Ordering::Relaxed),
            serial_open_failures: self.serial_open_failures.load(Ordering::Relaxed),
            print_jobs_direct: self.print_jobs_direct.load(Ordering::Relaxed),
            print_jobs_spooler: self.print_jobs_spooler.load(Ordering::Relaxed),
            print_fallbacks: self.print_fallbacks.load(Ordering::Relaxed),
            print_jobs_failed: self.print_jobs_failed.load(Ordering::Relaxed),
            print_busy_rejections: self.print_busy_rejections.load(Ordering::Relaxed),
        }
    }

    /// Prometheus text exposition format
    pub fn render_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut output = String::with_capacity(2048);

        write_metric(&mut output, "bridge_uptime_seconds", "Process uptime", MetricType::Gauge, s.uptime_secs);
        write_metric(&mut output, "bridge_barcodes_scanned_total", "Barcodes read from the scanner", MetricType::Counter, s.barcodes_scanned);
        write_metric(&mut output, "bridge_barcodes_delivered_total", "Barcodes handed to pollers", MetricType::Counter, s.barcodes_delivered);
        write_metric(&mut output, "bridge_barcodes_dropped_total", "Pending barcodes evicted by a full queue", MetricType::Counter, s.barcodes_dropped);
        write_metric(&mut output, "bridge_weight_frames_total", "Weight frames received", MetricType::Counter, s.weight_frames);
        write_metric(&mut output, "bridge_scale_status_frames_total", "Scale status frames received", MetricType::Counter, s.scale_status_frames);
        write_metric(&mut output, "bridge_malformed_frames_total", "Serial frames discarded as malformed", MetricType::Counter, s.malformed_frames);
        write_metric(&mut output, "bridge_serial_connects_total", "Successful serial port opens", MetricType::Counter, s.serial_connects);
        write_metric(&mut output, "bridge_serial_disconnects_total", "Serial port losses", MetricType::Counter, s.serial_disconnects);
        write_metric(&mut output, "bridge_serial_open_failures_total", "Failed serial port opens", MetricType::Counter, s.serial_open_failures);

        let _ = writeln!(output, "# HELP bridge_print_jobs_total Print jobs delivered per transport");
        let _ = writeln!(output, "# TYPE bridge_print_jobs_total counter");
        let _ = writeln!(output, "bridge_print_jobs_total{{method=\"direct\"}} {}", s.print_jobs_direct);
        let _ = writeln!(output, "bridge_print_jobs_total{{method=\"cups\"}} {}", s.print_jobs_spooler);

        write_metric(&mut output, "bridge_print_fallbacks_total", "Jobs delivered by the spooler after a direct write failed", MetricType::Counter, s.print_fallbacks);
        write_metric(&mut output, "bridge_print_jobs_failed_total", "Jobs no transport could deliver", MetricType::Counter, s.print_jobs_failed);
        write_metric(&mut output, "bridge_print_busy_total", "Jobs rejected because another was in flight", MetricType::Counter, s.print_busy_rejections);

        output
    }
}

impl MetricsSnapshot {
    pub fn log(&self) {
        info!(
            uptime_secs = %self.uptime_secs,
            barcodes_scanned = %self.barcodes_scanned,
            barcodes_delivered = %self.barcodes_delivered,
            barcodes_dropped = %self.barcodes_dropped,
            weight_frames = %self.weight_frames,
            malformed_frames = %self.malformed_frames,
            serial_disconnects = %self.serial_disconnects,
            print_direct = %self.print_jobs_direct,
            print_cups = %self.print_jobs_spooler,
            print_failed = %self.print_jobs_failed,
            print_busy = %self.print_busy_rejections,
            "metrics_summary"
        );
    }
}

enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name} {val}");
}
