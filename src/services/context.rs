//! Explicit bridge context
//!
//! Built once at startup and handed to the HTTP layer. Holds the shared state
//! store, the printer dispatcher, and a read-only view of the serial handle's
//! state; the ingest loop gets its own clones of the same `Arc`s.

use crate::domain::types::DeviceState;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::dispatcher::PrinterDispatcher;
use crate::services::state::SharedState;
use hyper::header::HeaderValue;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::warn;

/// Limits and headers for the HTTP layer
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub max_payload_bytes: usize,
    pub request_timeout: Duration,
    pub print_timeout: Duration,
    pub cors_origin: HeaderValue,
}

impl HttpSettings {
    pub fn from_config(config: &Config) -> Self {
        let cors_origin = HeaderValue::from_str(config.cors_origin()).unwrap_or_else(|_| {
            warn!(origin = %config.cors_origin(), "cors_origin_invalid_using_wildcard");
            HeaderValue::from_static("*")
        });
        Self {
            max_payload_bytes: config.max_payload_bytes(),
            request_timeout: config.request_timeout(),
            print_timeout: config.print_timeout(),
            cors_origin,
        }
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub struct BridgeContext {
    pub state: Arc<SharedState>,
    pub dispatcher: Arc<PrinterDispatcher>,
    pub metrics: Arc<Metrics>,
    pub http: HttpSettings,
    serial_port: String,
    serial_state: watch::Receiver<DeviceState>,
    started_at: Instant,
}

impl BridgeContext {
    pub fn new(
        state: Arc<SharedState>,
        dispatcher: Arc<PrinterDispatcher>,
        metrics: Arc<Metrics>,
        serial_port: &str,
        serial_state: watch::Receiver<DeviceState>,
        http: HttpSettings,
    ) -> Self {
        Self {
            state,
            dispatcher,
            metrics,
            http,
            serial_port: serial_port.to_string(),
            serial_state,
            started_at: Instant::now(),
        }
    }

    pub fn serial_port(&self) -> &str {
        &self.serial_port
    }

    pub fn serial_state(&self) -> DeviceState {
        *self.serial_state.borrow()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}
