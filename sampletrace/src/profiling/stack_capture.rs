//! # Sample Capture
//!
//! Runs once per sampling tick, typically inside a signal handler. Everything
//! reachable from [`Sampler::capture`] is restricted to:
//!
//! - atomic loads, stores and compare-and-swap
//! - writes into preallocated slot memory
//! - calls into the [`SampleSource`], which carries the same restrictions
//!
//! No allocation, no locks, no logging. When the pool has no free slot the
//! sample is counted as dropped and the call returns immediately.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use sampletrace_common::{SlotHeader, ALLOCATION_THREAD_BIT, MARKER_STACKTRACE, MARKER_VIRTUAL_IP};

use super::buffer_pool::BufferPool;
use crate::session::SessionState;

/// Frame walker supplied by the embedding runtime
///
/// Every method may be called from a signal handler and must not allocate,
/// block or take locks.
pub trait SampleSource {
    /// Write frame identifiers into `frames`, innermost first
    ///
    /// Returns how many were written; anything past `frames.len()` is ignored.
    /// Returning 0 is valid and records an empty stack.
    fn walk_frames(&self, frames: &mut [usize]) -> usize;

    /// Identifier of the sampled thread
    fn thread_id(&self) -> usize;

    /// Collaborator-defined tag, written when the stream carries tags
    fn tag(&self) -> usize {
        0
    }

    /// Kilobytes currently allocated, written when memory tracking is on
    fn allocated_kb(&self) -> usize {
        0
    }
}

/// Result of one capture invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Sample written to a slot and queued for the writer
    Captured,
    /// No free slot, sample counted in the drop counter
    Dropped,
    /// Session not running, nothing recorded
    Inactive,
}

/// State shared between the session, its sampler handles and the flusher
pub(crate) struct SamplerShared {
    pub(crate) pool: BufferPool,
    pub(crate) state: AtomicU8,
    /// Captures that observed `Running` and have not finished yet
    pub(crate) in_flight: AtomicUsize,
    pub(crate) memory_tracking: bool,
}

impl SamplerShared {
    pub(crate) fn new(pool: BufferPool, memory_tracking: bool) -> Self {
        Self {
            pool,
            state: AtomicU8::new(SessionState::Configured as u8),
            in_flight: AtomicUsize::new(0),
            memory_tracking,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

/// Marks a capture as in flight for the lifetime of the guard
struct InFlight<'a>(&'a SamplerShared);

impl<'a> InFlight<'a> {
    fn enter(shared: &'a SamplerShared) -> Option<Self> {
        // Increment before checking the state: `stop` stores the state and
        // then waits for this counter, so one of the two sides always sees
        // the other.
        shared.in_flight.fetch_add(1, Ordering::SeqCst);
        if shared.state() == SessionState::Running {
            Some(Self(shared))
        } else {
            shared.in_flight.fetch_sub(1, Ordering::SeqCst);
            None
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Capture handle for timer/signal handlers
///
/// Cheap to clone; holds the session's pool alive.
#[derive(Clone)]
pub struct Sampler {
    shared: Arc<SamplerShared>,
}

impl Sampler {
    pub(crate) fn new(shared: Arc<SamplerShared>) -> Self {
        Self { shared }
    }

    /// Capture one stack sample from `source`
    pub fn capture(&self, source: &dyn SampleSource) -> CaptureOutcome {
        self.capture_stack(source, 0)
    }

    /// Capture a sample triggered by an allocation event
    ///
    /// The thread id carries [`ALLOCATION_THREAD_BIT`] so readers can tell it
    /// apart from timer samples. Returns [`CaptureOutcome::Inactive`] when the
    /// session does not track memory.
    pub fn capture_allocation(&self, source: &dyn SampleSource) -> CaptureOutcome {
        if !self.shared.memory_tracking {
            return CaptureOutcome::Inactive;
        }
        self.capture_stack(source, ALLOCATION_THREAD_BIT)
    }

    /// Queue a virtual-ip record, ordered with the samples around it
    ///
    /// `payload` is truncated to the slot capacity.
    pub fn emit_virtual_ip(&self, id: usize, payload: &[u8]) -> CaptureOutcome {
        let Some(_in_flight) = InFlight::enter(&self.shared) else {
            return CaptureOutcome::Inactive;
        };
        let pool = &self.shared.pool;
        let Ok(mut slot) = pool.acquire_current_slot() else {
            pool.record_drop();
            return CaptureOutcome::Dropped;
        };
        let record = slot.record_mut();
        record.header =
            SlotHeader { marker: MARKER_VIRTUAL_IP, virtual_ip: id, ..SlotHeader::default() };
        record.set_payload(payload);
        slot.rotate();
        CaptureOutcome::Captured
    }

    /// Samples dropped so far
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.shared.pool.dropped()
    }

    /// Frame capacity of a sample
    #[must_use]
    pub fn max_depth(&self) -> usize {
        self.shared.pool.max_depth()
    }

    fn capture_stack(&self, source: &dyn SampleSource, thread_bits: usize) -> CaptureOutcome {
        let Some(_in_flight) = InFlight::enter(&self.shared) else {
            return CaptureOutcome::Inactive;
        };
        let pool = &self.shared.pool;
        let Ok(mut slot) = pool.acquire_current_slot() else {
            pool.record_drop();
            return CaptureOutcome::Dropped;
        };

        let memory_tracking = self.shared.memory_tracking;
        let record = slot.record_mut();
        let frames = record.words_mut();
        let depth = source.walk_frames(frames).min(frames.len());

        let mut thread_id = source.thread_id();
        if memory_tracking {
            thread_id = (thread_id & !ALLOCATION_THREAD_BIT) | thread_bits;
        }
        record.header = SlotHeader {
            marker: MARKER_STACKTRACE,
            count: 1,
            depth,
            thread_id,
            tag: source.tag(),
            memory_kb: if memory_tracking { source.allocated_kb() } else { 0 },
            ..SlotHeader::default()
        };
        slot.rotate();
        CaptureOutcome::Captured
    }
}
