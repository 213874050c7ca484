//! Services - state, ingest, and printer dispatch
//!
//! - `state` - Shared barcode queue and latest weight behind one lock
//! - `ingest` - Serial ingest loop (sole reader of the scanner/scale port)
//! - `dispatcher` - Printer dispatcher with direct/spooler failover
//! - `context` - Explicit context handed to the HTTP layer

pub mod context;
pub mod dispatcher;
pub mod ingest;
pub mod state;

// Re-export commonly used types
pub use context::{BridgeContext, HttpSettings};
pub use dispatcher::{PrinterDispatcher, PrinterStatus};
pub use ingest::{IngestLoop, IngestSettings};
pub use state::SharedState;
