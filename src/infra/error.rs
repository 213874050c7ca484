//! Bridge error taxonomy
//!
//! Hardware errors are recovered locally where a safe default exists (stale
//! weight reads as null, malformed frames are dropped). Only the variants that
//! reach an HTTP caller carry a status code mapping.

use crate::domain::types::Transport;
use hyper::StatusCode;

pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Device missing, permission denied, or dropped mid-operation
    #[error("{device} unavailable: {reason}")]
    DeviceUnavailable { device: String, reason: String },

    /// Unparseable serial data. Never leaves the ingest loop.
    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: String },

    /// Write to the raw device or spooler submission failed
    #[error("{transport} transport failed: {reason}")]
    PrinterTransportFailure { transport: Transport, reason: String },

    /// Another print job is in flight
    #[error("printer busy, retry shortly")]
    Busy,

    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: &'static str, after_ms: u64 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl BridgeError {
    pub fn device_unavailable(device: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::DeviceUnavailable { device: device.into(), reason: reason.to_string() }
    }

    pub fn transport_failure(transport: Transport, reason: impl std::fmt::Display) -> Self {
        Self::PrinterTransportFailure { transport, reason: reason.to_string() }
    }

    pub fn timeout(operation: &'static str, after: std::time::Duration) -> Self {
        Self::Timeout { operation, after_ms: after.as_millis() as u64 }
    }

    /// Stable code clients can switch on
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::DeviceUnavailable { .. } => "device_unavailable",
            BridgeError::MalformedFrame { .. } => "malformed_frame",
            BridgeError::PrinterTransportFailure { .. } => "printer_failure",
            BridgeError::Busy => "busy",
            BridgeError::Timeout { .. } => "timeout",
            BridgeError::InvalidRequest(_) => "invalid_request",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            BridgeError::DeviceUnavailable { .. } | BridgeError::PrinterTransportFailure { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            BridgeError::Busy => StatusCode::CONFLICT,
            BridgeError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            BridgeError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            BridgeError::MalformedFrame { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
