//! Profiling core modules
//!
//! - Buffer pool: preallocated slots shared by sampler and writer
//! - Stack capture: the signal-safe sampling path
//! - Trace writer: slot serialization onto the output descriptor
//! - Shadow stack: a reference frame source for interpreters

pub mod buffer_pool;
pub mod shadow_stack;
pub mod stack_capture;
pub mod trace_writer;

// Re-export common types
pub use buffer_pool::{BufferPool, FillingSlot, FlushingSlot, SlotRecord, SlotState};
pub use shadow_stack::{FrameGuard, ShadowStack};
pub use stack_capture::{CaptureOutcome, SampleSource, Sampler};
pub(crate) use stack_capture::SamplerShared;
pub use trace_writer::TraceWriter;
