//! Structured error types for sampletrace
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Dropped samples are not errors and never show up here; see
//! [`CaptureOutcome`](crate::profiling::CaptureOutcome).

use std::process::ExitStatus;

use thiserror::Error;

/// Error classes callers react to differently
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input to `configure`/`init`, never retried
    Configuration,
    /// Pool, transport or descriptor could not be set up, session never runs
    Resource,
    /// Output stream failed while running, session is forced to stop
    Stream,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("bad value for 'interval': {0} (expected 1e-6 <= interval < 1.0)")]
    InvalidInterval(f64),

    #[error("{0} not supported on this platform")]
    UnsupportedOption(&'static str),

    #[error("invalid buffer pool geometry: {0}")]
    InvalidPoolGeometry(String),

    #[error("out of memory: cannot preallocate {slots} slots of {slot_bytes} bytes")]
    ResourceExhausted { slots: usize, slot_bytes: usize },

    #[error("cannot {action} session in state {state}")]
    InvalidTransition { action: &'static str, state: &'static str },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Classify the error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInterval(_)
            | Self::UnsupportedOption(_)
            | Self::InvalidPoolGeometry(_)
            | Self::InvalidTransition { .. } => ErrorKind::Configuration,
            Self::ResourceExhausted { .. }
            | Self::Io(_)
            | Self::Transport(TransportError::Unavailable(_)) => ErrorKind::Resource,
            Self::Transport(_) | Self::Stream(_) => ErrorKind::Stream,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("no free slot available")]
    Exhausted,
}

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("output descriptor closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("compression transport unavailable: {0}")]
    Unavailable(#[source] std::io::Error),

    #[error("compressor exited with {0}")]
    ChildFailed(ExitStatus),

    #[error("failed to wait for compressor: {0}")]
    Wait(#[source] std::io::Error),

    #[error("compression relay failed: {0}")]
    RelayFailed(#[source] std::io::Error),

    #[error("compression relay thread panicked")]
    RelayPanicked,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_interval_display() {
        let err = SessionError::InvalidInterval(1.0);
        assert!(err.to_string().contains("bad value for 'interval'"));
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_error_kinds() {
        let err = SessionError::ResourceExhausted { slots: 4, slot_bytes: 64 };
        assert_eq!(err.kind(), ErrorKind::Resource);
        assert!(err.to_string().contains("4 slots of 64 bytes"));

        let err = SessionError::Transport(TransportError::Unavailable(std::io::Error::from(
            std::io::ErrorKind::NotFound,
        )));
        assert_eq!(err.kind(), ErrorKind::Resource);

        let err = SessionError::from(StreamError::ShortWrite { written: 3, expected: 9 });
        assert_eq!(err.kind(), ErrorKind::Stream);
        assert_eq!(err.to_string(), "short write: 3 of 9 bytes");

        let err = SessionError::Transport(TransportError::Wait(std::io::Error::from(
            std::io::ErrorKind::Interrupted,
        )));
        assert_eq!(err.kind(), ErrorKind::Stream);
        assert!(err.to_string().starts_with("failed to wait for compressor"));
    }

    #[test]
    fn test_unsupported_option_display() {
        let err = SessionError::UnsupportedOption("memory tracking");
        assert_eq!(err.to_string(), "memory tracking not supported on this platform");
    }
}
