//! Backend abstraction layer
//!
//! Provides the device and command-context traits the pipeline records
//! against, plus a headless recording implementation.

pub mod recording;
pub mod traits;
pub mod types;

pub use recording::{GpuCommand, RecordingContext, RecordingDevice};
pub use traits::*;
pub use types::*;
