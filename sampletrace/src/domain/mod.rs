//! Domain model for sampletrace
//!
//! This module contains core domain types and errors that provide:
//! - Validation at construction (interval range, label length)
//! - Self-documenting function signatures
//! - Structured error handling

pub mod errors;
pub mod types;

// Re-export common types for convenience
pub use types::{Interval, RuntimeLabel, SlotIndex, ThreadId};

pub use errors::{ErrorKind, PoolError, SessionError, StreamError, TransportError};
