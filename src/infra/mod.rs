//! Infrastructure - configuration, errors, and metrics
//!
//! - `config` - Application configuration (TOML loading, env overrides, defaults)
//! - `error` - Bridge error taxonomy and HTTP status mapping
//! - `metrics` - Lock-free counters

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::Config;
pub use error::{BridgeError, BridgeResult};
pub use metrics::Metrics;
