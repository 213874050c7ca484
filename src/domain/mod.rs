//! Domain models - core types and the serial frame grammar
//!
//! - `types` - barcode/weight values, device state, printer transports and jobs
//! - `frame` - frame reassembly and barcode/weight classification

pub mod frame;
pub mod types;

// Re-export commonly used types at module level
pub use frame::{Classified, FrameAssembler, FrameParser, MagellanParser, SerialFrame};
pub use types::{
    BarcodeEvent, DeviceState, JobKind, JobOutcome, PrinterJob, Transport, TransportHealth,
    WeightReading,
};
