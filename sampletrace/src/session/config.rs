//! Session configuration
//!
//! [`SessionConfig`] is what callers fill in; [`SessionConfig::validate`]
//! turns it into the checked values the session runs on.

use std::time::Duration;

use log::warn;
use sampletrace_common::FeatureVersion;

use crate::domain::{Interval, RuntimeLabel, SessionError};
use crate::transport::Compression;

/// Slots preallocated by default
pub const DEFAULT_SLOT_COUNT: usize = 20;

/// Bytes per slot by default
pub const DEFAULT_SLOT_BYTES: usize = 8192;

/// What the host platform's frame source can provide
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Allocation events are available, so memory tracking can be honored
    pub allocation_events: bool,
}

impl Capabilities {
    /// Capabilities of the current platform
    ///
    /// Memory tracking is only offered on Linux.
    #[must_use]
    pub fn host() -> Self {
        Self { allocation_events: cfg!(target_os = "linux") }
    }
}

/// How filled slots reach the trace writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Dedicated thread drains the pool every `interval`
    Background { interval: Duration },
    /// Caller drains explicitly with `Session::drain`
    Manual,
}

impl Default for FlushMode {
    fn default() -> Self {
        Self::Background { interval: Duration::from_millis(25) }
    }
}

/// Controls how a session samples and where the trace goes
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Sampling interval in seconds, `1e-6 <= interval < 1.0`
    pub interval_secs: f64,
    /// Record allocation samples and per-sample memory
    pub memory_tracking: bool,
    /// Runtime/interpreter name for the header (truncated to 255 bytes)
    pub runtime_label: String,
    /// Number of preallocated slots
    pub slot_count: usize,
    /// Size of each slot in bytes; bounds the stack depth
    pub slot_bytes: usize,
    /// Optional cap on captured frames, below what a slot can hold
    pub max_depth: Option<usize>,
    pub compression: Compression,
    pub flush: FlushMode,
    /// Longest `stop` waits for in-flight captures to land
    pub stop_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            interval_secs: 0.01,
            memory_tracking: false,
            runtime_label: String::new(),
            slot_count: DEFAULT_SLOT_COUNT,
            slot_bytes: DEFAULT_SLOT_BYTES,
            max_depth: None,
            compression: Compression::default(),
            flush: FlushMode::default(),
            stop_timeout: Duration::from_millis(500),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn with_interval(mut self, secs: f64) -> Self {
        self.interval_secs = secs;
        self
    }

    #[must_use]
    pub fn with_memory_tracking(mut self, enabled: bool) -> Self {
        self.memory_tracking = enabled;
        self
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.runtime_label = label.into();
        self
    }

    /// Builder-style helper to adjust the pool geometry
    #[must_use]
    pub fn with_pool(mut self, slot_count: usize, slot_bytes: usize) -> Self {
        self.slot_count = slot_count;
        self.slot_bytes = slot_bytes;
        self
    }

    #[must_use]
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    #[must_use]
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    #[must_use]
    pub fn with_flush(mut self, flush: FlushMode) -> Self {
        self.flush = flush;
        self
    }

    #[must_use]
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Check the configuration against what the platform supports
    ///
    /// # Errors
    /// - [`SessionError::InvalidInterval`] outside `[1e-6, 1.0)`
    /// - [`SessionError::UnsupportedOption`] for memory tracking without
    ///   allocation events
    pub fn validate(&self, capabilities: Capabilities) -> Result<ValidatedConfig, SessionError> {
        let interval = Interval::from_secs_f64(self.interval_secs)?;
        if self.memory_tracking && !capabilities.allocation_events {
            return Err(SessionError::UnsupportedOption("memory tracking"));
        }
        let (label, truncated) = RuntimeLabel::truncated(&self.runtime_label);
        if truncated {
            warn!("Runtime label truncated to {} bytes", label.len());
        }
        let version =
            if self.memory_tracking { FeatureVersion::Memory } else { FeatureVersion::ThreadId };
        Ok(ValidatedConfig { interval, label, memory_tracking: self.memory_tracking, version })
    }
}

/// Configuration after validation
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub interval: Interval,
    pub label: RuntimeLabel,
    pub memory_tracking: bool,
    /// Feature byte for the header and layout of every record
    pub version: FeatureVersion,
}
