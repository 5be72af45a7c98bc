//! # Session Lifecycle
//!
//! A session owns the buffer pool, the output descriptor and the compression
//! transport. It moves strictly forward:
//!
//! ```text
//! UNINITIALIZED --configure--> CONFIGURED --start--> RUNNING --stop--> STOPPED
//! ```
//!
//! ## Stopping
//!
//! `stop` flips the state first, so any capture that has not yet observed
//! `Running` backs off. It then waits (bounded by the stop timeout) for
//! captures already in flight, drains every committed slot, writes the
//! trailer, closes the writer descriptor and only then closes the transport.
//! Closing the descriptor first is what lets a compressor see end of input.
//!
//! ## Stream Failures
//!
//! A write error while running forces the session to `Stopped` immediately;
//! sampling stops at once. The error itself is reported by the next call to
//! [`Session::drain`], [`Session::check`] or [`Session::stop`], which also
//! tears down the transport. After that, `stop` is a no-op.

mod config;
mod flusher;

use std::fmt;
use std::fs::File;
use std::os::fd::OwnedFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;

pub use config::{
    Capabilities, FlushMode, SessionConfig, ValidatedConfig, DEFAULT_SLOT_BYTES,
    DEFAULT_SLOT_COUNT,
};
use flusher::{Consumer, Flusher};

use crate::domain::{SessionError, StreamError};
use crate::profiling::{BufferPool, Sampler, SamplerShared, TraceWriter};
use crate::transport::Transport;

/// Lifecycle state, stored as a byte so captures can read it atomically
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionState {
    Uninitialized = 0,
    Configured = 1,
    Running = 2,
    Stopped = 3,
}

impl SessionState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Uninitialized,
            1 => Self::Configured,
            2 => Self::Running,
            _ => Self::Stopped,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Configured => "configured",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters for a session, serializable for reporting
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub state: SessionState,
    /// Samples and virtual-ip records that made it into a slot
    pub committed: u64,
    /// Samples lost to pool exhaustion
    pub dropped: u64,
    /// Committed records handed to the writer so far
    pub drained: u64,
    /// Bytes the writer produced (before compression); known once stopped
    pub bytes_written: Option<u64>,
    pub interval_usec: Option<usize>,
    pub compression: Option<&'static str>,
}

/// Parts that exist once the session is configured
struct Configured {
    shared: Arc<SamplerShared>,
    config: ValidatedConfig,
    flush: FlushMode,
    stop_timeout: Duration,
    destination: Option<OwnedFd>,
    transport: Box<dyn Transport>,
}

/// One profiling session
pub struct Session {
    capabilities: Capabilities,
    inner: Option<Configured>,
    consumer: Option<Consumer>,
    bytes_written: Option<u64>,
}

impl Session {
    #[must_use]
    pub fn new(capabilities: Capabilities) -> Self {
        Self { capabilities, inner: None, consumer: None, bytes_written: None }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.as_ref().map_or(SessionState::Uninitialized, |inner| inner.shared.state())
    }

    /// Validate `config` and preallocate the pool
    ///
    /// `destination` is owned by the session from here on.
    ///
    /// # Errors
    /// - configuration errors for a bad interval or unsupported option
    /// - [`SessionError::InvalidPoolGeometry`] / [`SessionError::ResourceExhausted`]
    ///   when the pool cannot be built
    /// - [`SessionError::InvalidTransition`] unless the session is uninitialized
    pub fn configure(
        &mut self,
        config: &SessionConfig,
        destination: OwnedFd,
    ) -> Result<(), SessionError> {
        self.expect_state("configure", SessionState::Uninitialized)?;
        let validated = config.validate(self.capabilities)?;
        let pool = BufferPool::new(config.slot_count, config.slot_bytes, config.max_depth)?;
        info!(
            "Configured session: interval={} version={:?} pool={}x{}B depth={} label={}",
            validated.interval,
            validated.version,
            pool.slot_count(),
            pool.slot_bytes(),
            pool.max_depth(),
            validated.label,
        );

        let shared = Arc::new(SamplerShared::new(pool, validated.memory_tracking));
        self.inner = Some(Configured {
            shared,
            config: validated,
            flush: config.flush,
            stop_timeout: config.stop_timeout,
            destination: Some(destination),
            transport: config.compression.transport(),
        });
        Ok(())
    }

    /// Handle for capture sites, available once configured
    #[must_use]
    pub fn sampler(&self) -> Option<Sampler> {
        self.inner.as_ref().map(|inner| Sampler::new(Arc::clone(&inner.shared)))
    }

    /// Open the transport, write the header and begin accepting samples
    ///
    /// # Errors
    /// - [`SessionError::Transport`] if the compressor cannot be set up; the
    ///   session never runs and there is no fallback to uncompressed output
    /// - [`SessionError::Stream`] if the header cannot be written
    /// - [`SessionError::InvalidTransition`] unless the session is configured
    pub fn start(&mut self) -> Result<(), SessionError> {
        self.expect_state("start", SessionState::Configured)?;
        let Some(inner) = self.inner.as_mut() else {
            return Err(invalid("start", SessionState::Uninitialized));
        };
        let Some(destination) = inner.destination.take() else {
            return Err(SessionError::Stream(StreamError::Closed));
        };

        let fd = inner.transport.open(destination)?;
        let mut writer =
            TraceWriter::new(File::from(fd), inner.config.version, inner.shared.pool.slot_bytes());
        if let Err(e) = writer.write_header(inner.config.interval, &inner.config.label) {
            drop(writer);
            close_transport(inner.transport.as_mut());
            return Err(e.into());
        }

        let consumer = match inner.flush {
            FlushMode::Manual => Consumer::Manual(writer),
            FlushMode::Background { interval } => {
                match Flusher::spawn(Arc::clone(&inner.shared), writer, interval) {
                    Ok(flusher) => Consumer::Background(flusher),
                    Err(e) => {
                        close_transport(inner.transport.as_mut());
                        return Err(e.into());
                    }
                }
            }
        };
        self.consumer = Some(consumer);
        inner.shared.set_state(SessionState::Running);
        info!("Session running (compression: {})", inner.transport.name());
        Ok(())
    }

    /// Write every ready slot now
    ///
    /// With a background flusher this only checks for a stream failure.
    ///
    /// # Errors
    /// Returns the stream error that forced the session to stop
    pub fn drain(&mut self) -> Result<usize, SessionError> {
        if matches!(self.consumer, Some(Consumer::Background(_))) {
            return self.check().map(|()| 0);
        }
        let (Some(Consumer::Manual(writer)), Some(inner)) =
            (self.consumer.as_mut(), self.inner.as_ref())
        else {
            return Ok(0);
        };
        match writer.drain(&inner.shared.pool) {
            Ok(written) => Ok(written),
            Err(e) => {
                self.fail();
                Err(e.into())
            }
        }
    }

    /// Surface a stream failure from the background flusher, if any
    ///
    /// # Errors
    /// Returns the stream error that forced the session to stop
    pub fn check(&mut self) -> Result<(), SessionError> {
        let finished = matches!(&self.consumer, Some(Consumer::Background(f)) if f.is_finished());
        if !finished {
            return Ok(());
        }
        let Some(Consumer::Background(flusher)) = self.consumer.take() else {
            return Ok(());
        };
        match flusher.stop() {
            Ok(writer) => {
                // Exited without an error: put it back for stop()
                self.consumer = Some(Consumer::Manual(writer));
                Ok(())
            }
            Err(e) => {
                self.fail();
                Err(e.into())
            }
        }
    }

    /// Stop sampling and finish the stream
    ///
    /// Stopping a session that never started, or one already stopped, is a
    /// no-op.
    ///
    /// # Errors
    /// Returns the first stream or transport error hit while finishing
    pub fn stop(&mut self) -> Result<(), SessionError> {
        let Some(inner) = self.inner.as_ref() else {
            return Ok(());
        };
        match inner.shared.state() {
            SessionState::Uninitialized | SessionState::Configured => {
                debug!("stop() before start(), nothing to do");
                return Ok(());
            }
            SessionState::Stopped if self.consumer.is_none() => return Ok(()),
            SessionState::Running => {
                inner.shared.set_state(SessionState::Stopped);
                wait_in_flight(&inner.shared, inner.stop_timeout);
            }
            SessionState::Stopped => {}
        }
        self.finish()
    }

    /// Current counters
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        let Some(inner) = self.inner.as_ref() else {
            return SessionStats {
                state: SessionState::Uninitialized,
                committed: 0,
                dropped: 0,
                drained: 0,
                bytes_written: None,
                interval_usec: None,
                compression: None,
            };
        };
        let pool = &inner.shared.pool;
        SessionStats {
            state: inner.shared.state(),
            committed: pool.committed(),
            dropped: pool.dropped(),
            drained: pool.committed().saturating_sub(pool.pending()),
            bytes_written: self.bytes_written,
            interval_usec: Some(inner.config.interval.as_micros()),
            compression: Some(inner.transport.name()),
        }
    }

    fn expect_state(
        &self,
        action: &'static str,
        expected: SessionState,
    ) -> Result<(), SessionError> {
        let state = self.state();
        if state == expected {
            Ok(())
        } else {
            Err(invalid(action, state))
        }
    }

    /// Final drain, trailer, descriptor close, transport close
    fn finish(&mut self) -> Result<(), SessionError> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(());
        };
        let writer = match self.consumer.take() {
            Some(Consumer::Manual(writer)) => Ok(writer),
            Some(Consumer::Background(flusher)) => flusher.stop(),
            None => return Ok(()),
        };

        let stream_result = writer.and_then(|mut writer| {
            drain_pending(&mut writer, &inner.shared.pool, inner.stop_timeout)?;
            writer.write_trailer()?;
            let records = writer.records_written;
            let bytes = writer.bytes_written;
            // Dropping the file closes the writer descriptor
            drop(writer.finish()?);
            Ok((records, bytes))
        });
        if let Ok((records, bytes)) = stream_result {
            self.bytes_written = Some(bytes);
            info!(
                "Session stopped: {records} records, {bytes} bytes, {} dropped",
                inner.shared.pool.dropped()
            );
        }

        let transport_result = inner.transport.close();
        stream_result?;
        transport_result?;
        Ok(())
    }

    /// Tear down after a stream error, keeping the first error for the caller
    fn fail(&mut self) {
        self.consumer = None;
        if let Some(inner) = self.inner.as_mut() {
            inner.shared.set_state(SessionState::Stopped);
            close_transport(inner.transport.as_mut());
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state() == SessionState::Running {
            if let Err(e) = self.stop() {
                warn!("Session dropped while running, stop failed: {e}");
            }
        }
    }
}

/// Configure and start a session with default pool and compression
///
/// # Errors
/// Any error from [`Session::configure`] or [`Session::start`]
pub fn init(
    destination: OwnedFd,
    interval_secs: f64,
    memory_tracking: bool,
    runtime_label: &str,
) -> Result<Session, SessionError> {
    let config = SessionConfig::default()
        .with_interval(interval_secs)
        .with_memory_tracking(memory_tracking)
        .with_label(runtime_label);
    let mut session = Session::new(Capabilities::host());
    session.configure(&config, destination)?;
    session.start()?;
    Ok(session)
}

fn invalid(action: &'static str, state: SessionState) -> SessionError {
    SessionError::InvalidTransition { action, state: state.as_str() }
}

fn close_transport(transport: &mut dyn Transport) {
    if let Err(e) = transport.close() {
        warn!("Closing {} transport failed: {e}", transport.name());
    }
}

fn wait_in_flight(shared: &SamplerShared, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while shared.in_flight.load(Ordering::SeqCst) > 0 {
        if Instant::now() >= deadline {
            warn!(
                "{} captures still in flight after {timeout:?}",
                shared.in_flight.load(Ordering::SeqCst)
            );
            return;
        }
        thread::yield_now();
    }
}

/// Drain until every committed slot is written or the timeout expires
fn drain_pending(
    writer: &mut TraceWriter<File>,
    pool: &BufferPool,
    timeout: Duration,
) -> Result<(), StreamError> {
    let deadline = Instant::now() + timeout;
    loop {
        writer.drain(pool)?;
        let pending = pool.pending();
        if pending == 0 {
            return Ok(());
        }
        if Instant::now() >= deadline {
            warn!("{pending} committed samples never became ready, leaving them out");
            return Ok(());
        }
        thread::yield_now();
    }
}
