//! IO modules - hardware handles and the HTTP surface
//!
//! - `serial` - Scanner/scale serial handle, connector trait, reconnect backoff
//! - `printer` - Direct USB and spooler print transports
//! - `http` - JSON API for POS terminals

pub mod http;
pub mod printer;
pub mod serial;

// Re-export commonly used types
pub use http::{serve, start_http_server};
pub use printer::{DirectUsbTransport, PrintTransport, PrinterHandles, SpoolerTransport, DRAWER_KICK};
pub use serial::{Backoff, SerialConnector, SerialHandle, TtyConnector};
