//! Shared types for the POS bridge

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;
use uuid::Uuid;

/// A decoded scan waiting to be picked up by a poller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarcodeEvent {
    pub code: String,
    pub scanned_at: DateTime<Utc>,
}

impl BarcodeEvent {
    pub fn new(code: impl Into<String>) -> Self {
        Self { code: code.into(), scanned_at: Utc::now() }
    }
}

/// Latest scale reading. Only one is ever retained.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightReading {
    /// Raw integer as sent by the scale
    pub raw: u64,
    /// `raw / divisor`
    pub value: f64,
    /// Arrival time of the frame, used for the staleness cutoff
    pub measured_at: Instant,
}

impl WeightReading {
    pub fn from_raw(raw: u64, divisor: f64, measured_at: Instant) -> Self {
        Self { raw, value: raw as f64 / divisor, measured_at }
    }
}

/// Connection state of a hardware handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl DeviceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Disconnected => "disconnected",
            DeviceState::Connecting => "connecting",
            DeviceState::Connected => "connected",
            DeviceState::Error => "error",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, DeviceState::Connected)
    }
}

/// Route a print job takes to paper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Transport {
    /// Raw USB character device (e.g. /dev/usb/lp0)
    #[serde(rename = "direct")]
    DirectUsb,
    /// OS print spooler queue
    #[serde(rename = "cups")]
    Spooler,
    #[serde(rename = "none")]
    Unavailable,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::DirectUsb => "direct",
            Transport::Spooler => "cups",
            Transport::Unavailable => "none",
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of probing both printer transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportHealth {
    /// Raw device file exists and opens for writing
    pub direct: bool,
    /// Spooler queue exists and is enabled
    pub spooler: bool,
    /// The most recent direct write failed
    pub direct_failed_last: bool,
}

/// Transport a new job tries first.
///
/// Ignores `direct_failed_last`: a failed direct write never disables the
/// device for later jobs, each job re-probes.
pub fn first_choice(health: &TransportHealth) -> Transport {
    if health.direct {
        Transport::DirectUsb
    } else if health.spooler {
        Transport::Spooler
    } else {
        Transport::Unavailable
    }
}

/// Transport to try after `failed` did not deliver the job.
pub fn fallback(health: &TransportHealth, failed: Transport) -> Transport {
    match failed {
        Transport::DirectUsb if health.spooler => Transport::Spooler,
        _ => Transport::Unavailable,
    }
}

/// Transport reported as "currently selected" by the status endpoint.
pub fn select_transport(health: &TransportHealth) -> Transport {
    if health.direct_failed_last && health.spooler {
        return Transport::Spooler;
    }
    first_choice(health)
}

/// What a print job carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Raw,
    DrawerKick,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Raw => "raw",
            JobKind::DrawerKick => "drawer_kick",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Success,
    Failed,
}

/// A single in-flight print submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrinterJob {
    pub id: Uuid,
    pub kind: JobKind,
    pub bytes: usize,
    pub transport: Transport,
    pub outcome: JobOutcome,
    /// Direct write failed and the spooler delivered the job
    pub fell_back: bool,
}

impl PrinterJob {
    pub fn new(kind: JobKind, bytes: usize) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind,
            bytes,
            transport: Transport::Unavailable,
            outcome: JobOutcome::Failed,
            fell_back: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health(direct: bool, spooler: bool, direct_failed_last: bool) -> TransportHealth {
        TransportHealth { direct, spooler, direct_failed_last }
    }

    #[test]
    fn test_weight_from_raw() {
        let reading = WeightReading::from_raw(45, 100.0, Instant::now());
        assert_eq!(reading.value, 0.45);
        assert_eq!(reading.raw, 45);

        let reading = WeightReading::from_raw(4500, 1000.0, Instant::now());
        assert_eq!(reading.value, 4.5);
    }

    #[test]
    fn test_first_choice_prefers_direct() {
        assert_eq!(first_choice(&health(true, true, false)), Transport::DirectUsb);
        assert_eq!(first_choice(&health(true, false, false)), Transport::DirectUsb);
        assert_eq!(first_choice(&health(false, true, false)), Transport::Spooler);
        assert_eq!(first_choice(&health(false, false, false)), Transport::Unavailable);
    }

    #[test]
    fn test_first_choice_retries_direct_after_failure() {
        assert_eq!(first_choice(&health(true, true, true)), Transport::DirectUsb);
    }

    #[test]
    fn test_fallback() {
        assert_eq!(fallback(&health(true, true, false), Transport::DirectUsb), Transport::Spooler);
        assert_eq!(
            fallback(&health(true, false, false), Transport::DirectUsb),
            Transport::Unavailable
        );
        assert_eq!(fallback(&health(true, true, false), Transport::Spooler), Transport::Unavailable);
    }

    #[test]
    fn test_select_transport_reports_spooler_after_direct_failure() {
        assert_eq!(select_transport(&health(true, true, true)), Transport::Spooler);
        assert_eq!(select_transport(&health(true, true, false)), Transport::DirectUsb);
        // Nothing better to report when the spooler is down too
        assert_eq!(select_transport(&health(true, false, true)), Transport::DirectUsb);
        assert_eq!(select_transport(&health(false, false, true)), Transport::Unavailable);
    }

    #[test]
    fn test_transport_wire_names() {
        assert_eq!(serde_json::to_string(&Transport::DirectUsb).unwrap(), "\"direct\"");
        assert_eq!(serde_json::to_string(&Transport::Spooler).unwrap(), "\"cups\"");
        assert_eq!(serde_json::to_string(&Transport::Unavailable).unwrap(), "\"none\"");
        assert_eq!(Transport::Spooler.to_string(), "cups");
    }

    #[test]
    fn test_device_state_as_str() {
        assert_eq!(DeviceState::Connected.as_str(), "connected");
        assert_eq!(DeviceState::Error.as_str(), "error");
        assert!(DeviceState::Connected.is_connected());
        assert!(!DeviceState::Connecting.is_connected());
    }
}
