//! # sampletrace - Statistical Sampling Profiler Core
//!
//! Periodically captures the call stack of a running interpreter, buffers the
//! samples in preallocated memory and streams them to a file descriptor in a
//! compact, versioned binary format, optionally through a compressor.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │            Timer / signal handler (restricted context)        │
//! │   Sampler::capture ──▶ SampleSource::walk_frames              │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ CAS FREE→FILLING, rotate →FULL
//!                                ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                  BufferPool (preallocated slots)              │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ take_next_full (commit order)
//!                                ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │   TraceWriter (flusher thread or manual drain)                │
//! │   header ─ stacktrace / virtual-ip records ─ trailer          │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ one write per record
//!                                ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │   Transport: passthrough │ gzip child process │ gzip relay    │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                ▼
//!                          destination fd
//! ```
//!
//! ## Module Structure
//!
//! - [`profiling`]: buffer pool, signal-safe capture, trace serialization and
//!   a reference shadow-stack frame source
//! - [`transport`]: compression between the writer and the destination
//! - [`session`]: configuration and the `configure → start → stop` lifecycle
//! - [`trace_data`]: decoder for finished traces, used for verification
//! - [`domain`]: validated value types and error enums
//! - [`cli`] / [`preflight`]: the `sampletrace` demo binary's plumbing
//!
//! ## Typical Usage
//!
//! ```no_run
//! use std::fs::File;
//! use std::os::fd::OwnedFd;
//! use sampletrace::profiling::ShadowStack;
//!
//! # fn main() -> Result<(), sampletrace::domain::SessionError> {
//! let file = File::create("trace.prof")?;
//! let mut session = sampletrace::init(OwnedFd::from(file), 0.01, false, "toy")?;
//! let sampler = session.sampler().expect("configured");
//!
//! let stack = ShadowStack::new(128);
//! let _main = stack.enter(1);
//! sampler.capture(&stack); // from the timer handler
//!
//! session.stop()?;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod domain;
pub mod preflight;
pub mod profiling;
pub mod session;
pub mod trace_data;
pub mod transport;

pub use session::{init, Session, SessionConfig, SessionState, SessionStats};
