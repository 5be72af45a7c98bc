//! # Preallocated Slot Pool
//!
//! Fixed set of record slots shared between the sampler (producer) and the
//! trace writer (consumer). All memory is allocated up front; nothing on the
//! producer side allocates, blocks or takes a lock.
//!
//! ## Slot Lifecycle
//!
//! ```text
//! FREE ──acquire──▶ FILLING ──rotate──▶ FULL ──take──▶ FLUSHING ──release──▶ FREE
//!                      │
//!                      └──drop (abandoned)──▶ FREE   (counted as a drop)
//! ```
//!
//! Every transition out of `FREE` and `FULL` is a compare-and-swap on the
//! slot's state tag, so a capture that interrupts another capture can never
//! claim the same slot. `rotate` stamps the slot with a commit sequence
//! number and the consumer drains strictly in sequence order, which is the
//! order slots became `FULL`.

#![allow(unsafe_code)] // UnsafeCell access guarded by the slot state tag

use std::cell::UnsafeCell;
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

use log::debug;
use sampletrace_common::{max_depth_for_slot, SlotHeader, MAX_STACKTRACE_OVERHEAD, WORD_SIZE};

use crate::domain::{PoolError, SessionError, SlotIndex};

/// Per-slot state tag
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free = 0,
    Filling = 1,
    Full = 2,
    Flushing = 3,
}

impl SlotState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Free,
            1 => Self::Filling,
            2 => Self::Full,
            _ => Self::Flushing,
        }
    }
}

/// Raw contents of one slot: fixed header plus a word array
///
/// For stack samples the words are frame identifiers; for virtual-ip records
/// they hold the payload bytes packed in native order.
pub struct SlotRecord {
    pub header: SlotHeader,
    words: Box<[usize]>,
}

impl SlotRecord {
    /// Number of frame words this slot can hold
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.words.len()
    }

    /// Payload capacity in bytes for virtual-ip records
    #[must_use]
    pub fn payload_capacity(&self) -> usize {
        self.words.len() * WORD_SIZE
    }

    /// Frame identifiers, innermost first
    #[must_use]
    pub fn frames(&self) -> &[usize] {
        &self.words[..self.header.depth.min(self.words.len())]
    }

    /// Full word array for a frame walker to fill
    pub fn words_mut(&mut self) -> &mut [usize] {
        &mut self.words
    }

    /// Copy `payload` into the word array, truncating to capacity
    ///
    /// Returns the number of bytes stored.
    pub fn set_payload(&mut self, payload: &[u8]) -> usize {
        let len = payload.len().min(self.payload_capacity());
        for (word, chunk) in self.words.iter_mut().zip(payload[..len].chunks(WORD_SIZE)) {
            let mut bytes = [0u8; WORD_SIZE];
            bytes[..chunk.len()].copy_from_slice(chunk);
            *word = usize::from_ne_bytes(bytes);
        }
        self.header.payload_len = len;
        len
    }

    /// Stored virtual-ip payload bytes
    pub fn payload_bytes(&self) -> impl Iterator<Item = u8> + '_ {
        self.words
            .iter()
            .flat_map(|word| word.to_ne_bytes())
            .take(self.header.payload_len.min(self.payload_capacity()))
    }
}

struct Slot {
    state: AtomicU8,
    seq: AtomicU64,
    record: UnsafeCell<SlotRecord>,
}

/// Fixed-size pool of record slots
pub struct BufferPool {
    slots: Box<[Slot]>,
    /// Slot the next acquire tries first
    current: AtomicUsize,
    /// Next commit sequence number to hand out
    commit_seq: AtomicU64,
    /// Next commit sequence number the consumer will drain
    drain_seq: AtomicU64,
    dropped: AtomicU64,
    slot_bytes: usize,
    max_depth: usize,
}

// SAFETY: slot records are only reached through `FillingSlot`/`FlushingSlot`,
// which are handed out by a successful CAS on the slot state. At most one of
// either guard exists per slot at any time.
unsafe impl Sync for BufferPool {}

impl BufferPool {
    /// Preallocate `slot_count` slots of `slot_bytes` bytes each
    ///
    /// `max_depth` optionally caps the frame capacity below what the slot size
    /// allows.
    ///
    /// # Errors
    /// - [`SessionError::InvalidPoolGeometry`] for zero slots, slots too small
    ///   to hold a record header, or a zero depth cap
    /// - [`SessionError::ResourceExhausted`] if the memory cannot be reserved
    pub fn new(
        slot_count: usize,
        slot_bytes: usize,
        max_depth: Option<usize>,
    ) -> Result<Self, SessionError> {
        if slot_count == 0 {
            return Err(SessionError::InvalidPoolGeometry(
                "slot count must be at least 1".to_string(),
            ));
        }
        let slot_depth = max_depth_for_slot(slot_bytes);
        if slot_depth == 0 {
            return Err(SessionError::InvalidPoolGeometry(format!(
                "slot of {slot_bytes} bytes cannot hold a record \
                 (need more than {MAX_STACKTRACE_OVERHEAD})"
            )));
        }
        if max_depth == Some(0) {
            return Err(SessionError::InvalidPoolGeometry(
                "max depth must be at least 1".to_string(),
            ));
        }
        let depth = max_depth.map_or(slot_depth, |cap| cap.min(slot_depth));

        let exhausted = || SessionError::ResourceExhausted { slots: slot_count, slot_bytes };
        slot_count.checked_mul(slot_bytes).ok_or_else(exhausted)?;

        let mut slots = Vec::new();
        slots.try_reserve_exact(slot_count).map_err(|_| exhausted())?;
        for _ in 0..slot_count {
            let mut words = Vec::new();
            words.try_reserve_exact(depth).map_err(|_| exhausted())?;
            words.resize(depth, 0);
            slots.push(Slot {
                state: AtomicU8::new(SlotState::Free as u8),
                seq: AtomicU64::new(0),
                record: UnsafeCell::new(SlotRecord {
                    header: SlotHeader::default(),
                    words: words.into_boxed_slice(),
                }),
            });
        }

        debug!("Preallocated {slot_count} slots of {slot_bytes} bytes (max depth {depth})");
        Ok(Self {
            slots: slots.into_boxed_slice(),
            current: AtomicUsize::new(0),
            commit_seq: AtomicU64::new(0),
            drain_seq: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            slot_bytes,
            max_depth: depth,
        })
    }

    /// Claim a free slot for filling, starting from the current slot
    ///
    /// Safe to call from a signal handler, including one that interrupted
    /// another capture holding a slot.
    ///
    /// # Errors
    /// Returns [`PoolError::Exhausted`] when every slot is in use; the caller
    /// drops the sample.
    pub fn acquire_current_slot(&self) -> Result<FillingSlot<'_>, PoolError> {
        let count = self.slots.len();
        let start = self.current.load(Ordering::Relaxed);
        for offset in 0..count {
            let index = (start + offset) % count;
            if self.slots[index]
                .state
                .compare_exchange(
                    SlotState::Free as u8,
                    SlotState::Filling as u8,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                let mut slot = FillingSlot { pool: self, index };
                slot.record_mut().header = SlotHeader::default();
                return Ok(slot);
            }
        }
        Err(PoolError::Exhausted)
    }

    /// Claim the next `FULL` slot in commit order
    ///
    /// Returns `None` when the next slot in sequence has not been published
    /// yet, even if later ones have.
    pub fn take_next_full(&self) -> Option<FlushingSlot<'_>> {
        let expected = self.drain_seq.load(Ordering::Acquire);
        if expected >= self.commit_seq.load(Ordering::Acquire) {
            return None;
        }
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.state.load(Ordering::Acquire) == SlotState::Full as u8
                && slot.seq.load(Ordering::Relaxed) == expected
                && slot
                    .state
                    .compare_exchange(
                        SlotState::Full as u8,
                        SlotState::Flushing as u8,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                return Some(FlushingSlot { pool: self, index });
            }
        }
        None
    }

    /// Return a serialized slot to the pool
    pub fn release(slot: FlushingSlot<'_>) {
        drop(slot);
    }

    /// Count a sample that never reached a slot
    pub fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Samples dropped so far (monotonic)
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Slots rotated to `FULL` so far (monotonic)
    #[must_use]
    pub fn committed(&self) -> u64 {
        self.commit_seq.load(Ordering::Acquire)
    }

    /// Committed slots the consumer has not released yet
    #[must_use]
    pub fn pending(&self) -> u64 {
        self.committed().saturating_sub(self.drain_seq.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn slot_bytes(&self) -> usize {
        self.slot_bytes
    }

    /// Frame capacity of every slot
    #[must_use]
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Current state of a slot
    ///
    /// # Panics
    /// Panics if `index` is out of range.
    #[must_use]
    pub fn state_of(&self, index: SlotIndex) -> SlotState {
        SlotState::from_u8(self.slots[index.0].state.load(Ordering::Acquire))
    }
}

/// Producer-side guard for a slot in `FILLING`
///
/// Must be finished with [`FillingSlot::rotate`]; dropping it instead frees
/// the slot and counts the sample as dropped.
pub struct FillingSlot<'a> {
    pool: &'a BufferPool,
    index: usize,
}

impl FillingSlot<'_> {
    #[must_use]
    pub fn index(&self) -> SlotIndex {
        SlotIndex(self.index)
    }

    /// Mutable access to the slot contents
    pub fn record_mut(&mut self) -> &mut SlotRecord {
        // SAFETY: the FREE -> FILLING CAS in `acquire_current_slot` made this
        // guard the only accessor of the slot until it is rotated or dropped.
        unsafe { &mut *self.pool.slots[self.index].record.get() }
    }

    /// Publish the slot as `FULL` and move the current slot past it
    ///
    /// Returns the commit sequence number.
    pub fn rotate(self) -> u64 {
        let this = ManuallyDrop::new(self);
        let pool = this.pool;
        let slot = &pool.slots[this.index];

        let seq = pool.commit_seq.fetch_add(1, Ordering::AcqRel);
        slot.seq.store(seq, Ordering::Relaxed);
        slot.state.store(SlotState::Full as u8, Ordering::Release);

        let next = (this.index + 1) % pool.slots.len();
        let _ =
            pool.current.compare_exchange(this.index, next, Ordering::Relaxed, Ordering::Relaxed);
        seq
    }
}

impl Drop for FillingSlot<'_> {
    fn drop(&mut self) {
        self.pool.slots[self.index].state.store(SlotState::Free as u8, Ordering::Release);
        self.pool.record_drop();
    }
}

/// Consumer-side guard for a slot in `FLUSHING`
///
/// Dropping it releases the slot back to `FREE` and advances the drain order.
pub struct FlushingSlot<'a> {
    pool: &'a BufferPool,
    index: usize,
}

impl FlushingSlot<'_> {
    #[must_use]
    pub fn index(&self) -> SlotIndex {
        SlotIndex(self.index)
    }

    #[must_use]
    pub fn record(&self) -> &SlotRecord {
        // SAFETY: the FULL -> FLUSHING CAS in `take_next_full` made this guard
        // the only accessor of the slot until it is released.
        unsafe { &*self.pool.slots[self.index].record.get() }
    }
}

impl Drop for FlushingSlot<'_> {
    fn drop(&mut self) {
        self.pool.slots[self.index].state.store(SlotState::Free as u8, Ordering::Release);
        self.pool.drain_seq.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sampletrace_common::MARKER_STACKTRACE;

    fn fill(pool: &BufferPool, tag: usize) -> u64 {
        let mut slot = pool.acquire_current_slot().unwrap();
        let record = slot.record_mut();
        record.header.marker = MARKER_STACKTRACE;
        record.header.tag = tag;
        slot.rotate()
    }

    #[test]
    fn test_geometry_validation() {
        assert!(matches!(
            BufferPool::new(0, 8192, None),
            Err(SessionError::InvalidPoolGeometry(_))
        ));
        assert!(matches!(
            BufferPool::new(2, MAX_STACKTRACE_OVERHEAD, None),
            Err(SessionError::InvalidPoolGeometry(_))
        ));
        assert!(matches!(
            BufferPool::new(2, 8192, Some(0)),
            Err(SessionError::InvalidPoolGeometry(_))
        ));
        assert!(matches!(
            BufferPool::new(usize::MAX / 16, 8192, None),
            Err(SessionError::ResourceExhausted { .. })
        ));
    }

    #[test]
    fn test_depth_cap() {
        let pool = BufferPool::new(1, 8192, Some(16)).unwrap();
        assert_eq!(pool.max_depth(), 16);
        let pool = BufferPool::new(1, 8192, Some(1_000_000)).unwrap();
        assert_eq!(pool.max_depth(), max_depth_for_slot(8192));
    }

    #[test]
    fn test_slot_lifecycle() {
        let pool = BufferPool::new(2, 256, None).unwrap();
        let slot = pool.acquire_current_slot().unwrap();
        let index = slot.index();
        assert_eq!(pool.state_of(index), SlotState::Filling);

        slot.rotate();
        assert_eq!(pool.state_of(index), SlotState::Full);
        assert_eq!(pool.pending(), 1);

        let flushing = pool.take_next_full().unwrap();
        assert_eq!(flushing.index(), index);
        assert_eq!(pool.state_of(index), SlotState::Flushing);

        BufferPool::release(flushing);
        assert_eq!(pool.state_of(index), SlotState::Free);
        assert_eq!(pool.pending(), 0);
        assert!(pool.take_next_full().is_none());
    }

    #[test]
    fn test_exhaustion_does_not_block() {
        let pool = BufferPool::new(2, 256, None).unwrap();
        fill(&pool, 1);
        fill(&pool, 2);
        assert_eq!(pool.acquire_current_slot().err(), Some(PoolError::Exhausted));

        // Draining one slot makes room again
        BufferPool::release(pool.take_next_full().unwrap());
        assert!(pool.acquire_current_slot().is_ok());
    }

    #[test]
    fn test_abandoned_slot_counts_as_drop() {
        let pool = BufferPool::new(1, 256, None).unwrap();
        let slot = pool.acquire_current_slot().unwrap();
        drop(slot);
        assert_eq!(pool.dropped(), 1);
        assert_eq!(pool.committed(), 0);
        assert!(pool.acquire_current_slot().is_ok());
    }

    #[test]
    fn test_nested_acquire_gets_distinct_slot_and_drains_in_commit_order() {
        let pool = BufferPool::new(3, 256, None).unwrap();

        let mut outer = pool.acquire_current_slot().unwrap();
        outer.record_mut().header.tag = 1;

        // Simulated interrupt: a second capture completes while the first is in flight
        let mut inner = pool.acquire_current_slot().unwrap();
        assert_ne!(inner.index(), outer.index());
        inner.record_mut().header.tag = 2;
        inner.rotate();

        outer.rotate();

        let first = pool.take_next_full().unwrap();
        assert_eq!(first.record().header.tag, 2);
        drop(first);
        let second = pool.take_next_full().unwrap();
        assert_eq!(second.record().header.tag, 1);
    }

    #[test]
    fn test_fifo_across_wraparound() {
        let pool = BufferPool::new(2, 256, None).unwrap();
        let mut seen = Vec::new();
        for tag in 0..10 {
            fill(&pool, tag);
            let slot = pool.take_next_full().unwrap();
            seen.push(slot.record().header.tag);
        }
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_reused_slot_starts_clean() {
        let pool = BufferPool::new(1, 256, None).unwrap();
        fill(&pool, 9);
        BufferPool::release(pool.take_next_full().unwrap());

        let mut slot = pool.acquire_current_slot().unwrap();
        assert_eq!(slot.record_mut().header, SlotHeader::default());
    }

    #[test]
    fn test_payload_packing() {
        let pool = BufferPool::new(1, MAX_STACKTRACE_OVERHEAD + 2 * WORD_SIZE, None).unwrap();
        let mut slot = pool.acquire_current_slot().unwrap();
        let record = slot.record_mut();
        assert_eq!(record.payload_capacity(), 2 * WORD_SIZE);

        let stored = record.set_payload(b"py:main:1:app.py");
        assert_eq!(stored, 2 * WORD_SIZE);
        let bytes: Vec<u8> = record.payload_bytes().collect();
        assert_eq!(bytes, b"py:main:1:app.py"[..stored].to_vec());

        let stored = record.set_payload(b"abc");
        assert_eq!(stored, 3);
        assert_eq!(record.payload_bytes().collect::<Vec<_>>(), b"abc".to_vec());
        slot.rotate();
    }
}
