//! # Shared Trace Format Definitions (Capture Path ↔ Writer)
//!
//! Defines the record markers, feature bytes and fixed layouts shared between
//! the restricted-context sampler and the trace writer. Everything here is
//! `no_std` and allocation free so it can be used from a signal handler.
//!
//! ## Stream Grammar
//!
//! ```text
//! stream     := header (stacktrace | virtual_ip)* trailer
//! header     := word[5] MARKER_HEADER feature:u8 len:u8 label[len]
//! stacktrace := MARKER_STACKTRACE count depth [thread_id] frame[depth] [tag] [memory_kb]
//! virtual_ip := MARKER_VIRTUAL_IP id len payload[len]
//! trailer    := MARKER_TRAILER
//! ```
//!
//! Every integer field is one native word (`usize`) in little-endian order.
//! Optional fields are present when the header's feature byte is at least
//! `VERSION_THREAD_ID` (thread id), `VERSION_TAG` (tag) or `VERSION_MEMORY`
//! (memory).
//!
//! ## Key Types
//!
//! - [`FeatureVersion`] - Which optional fields every record carries
//! - [`SlotHeader`] - Fixed part of a record as filled by the sampler

#![no_std]

// ============================================================================
// Record Markers
// ============================================================================

/// Stack sample record
pub const MARKER_STACKTRACE: u8 = 0x01;

/// Synthetic code region record (id + opaque payload)
pub const MARKER_VIRTUAL_IP: u8 = 0x02;

/// End of stream, exactly one per trace
pub const MARKER_TRAILER: u8 = 0x03;

/// Legacy runtime-name record
///
/// Superseded by the label carried in the header. Never written; reserved so
/// readers do not mistake it for a new record kind.
pub const MARKER_INTERP_NAME: u8 = 0x04;

/// Stream header record
pub const MARKER_HEADER: u8 = 0x05;

// ============================================================================
// Feature Bytes
// ============================================================================

/// Base layout: count, depth, frames
pub const VERSION_BASE: u8 = 0x00;

/// Adds a thread identifier before the frames
pub const VERSION_THREAD_ID: u8 = 0x01;

/// Adds a tag word after the frames
pub const VERSION_TAG: u8 = 0x02;

/// Adds an allocated-kilobytes word after the tag
pub const VERSION_MEMORY: u8 = 0x03;

// ============================================================================
// Layout Constants
// ============================================================================

/// Value of the second header word
pub const FORMAT_MAJOR_VERSION: usize = 3;

/// Size in bytes of every integer field in the stream
pub const WORD_SIZE: usize = core::mem::size_of::<usize>();

/// Number of leading words in the header record
pub const HEADER_WORDS: usize = 5;

/// Longest runtime label the header can carry (length is a single byte)
pub const MAX_LABEL_LEN: usize = 255;

/// Set on the thread id of samples triggered by an allocation event
///
/// Keeps the allocation-sample identifier space disjoint from plain thread
/// ids when memory tracking is active.
pub const ALLOCATION_THREAD_BIT: usize = 1 << (usize::BITS - 1);

/// Worst-case fixed part of a stacktrace record: marker plus five words
/// (count, depth, thread id, tag, memory)
pub const MAX_STACKTRACE_OVERHEAD: usize = 1 + 5 * WORD_SIZE;

/// Size of the trailer record
pub const TRAILER_RECORD_LEN: usize = 1;

// ============================================================================
// Feature Version
// ============================================================================

/// Feature byte carried by the header
///
/// Each variant is a strict superset of the one before it, so field presence
/// is a simple ordering check.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FeatureVersion {
    Base = VERSION_BASE,
    ThreadId = VERSION_THREAD_ID,
    Tag = VERSION_TAG,
    Memory = VERSION_MEMORY,
}

impl FeatureVersion {
    /// Decode a feature byte, `None` for values newer than this crate knows
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            VERSION_BASE => Some(Self::Base),
            VERSION_THREAD_ID => Some(Self::ThreadId),
            VERSION_TAG => Some(Self::Tag),
            VERSION_MEMORY => Some(Self::Memory),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn has_thread_id(self) -> bool {
        self as u8 >= VERSION_THREAD_ID
    }

    #[must_use]
    pub const fn has_tag(self) -> bool {
        self as u8 >= VERSION_TAG
    }

    #[must_use]
    pub const fn has_memory(self) -> bool {
        self as u8 >= VERSION_MEMORY
    }

    /// Number of optional words a stacktrace record carries at this version
    #[must_use]
    pub const fn optional_words(self) -> usize {
        self.has_thread_id() as usize + self.has_tag() as usize + self.has_memory() as usize
    }
}

// ============================================================================
// Record Lengths
// ============================================================================

/// Encoded size of the header record for a label of `label_len` bytes
#[must_use]
pub const fn header_record_len(label_len: usize) -> usize {
    HEADER_WORDS * WORD_SIZE + 3 + label_len
}

/// Encoded size of a stacktrace record with `depth` frames
#[must_use]
pub const fn stacktrace_record_len(version: FeatureVersion, depth: usize) -> usize {
    1 + (2 + version.optional_words() + depth) * WORD_SIZE
}

/// Encoded size of a virtual-ip record carrying `payload_len` bytes
#[must_use]
pub const fn virtual_ip_record_len(payload_len: usize) -> usize {
    1 + 2 * WORD_SIZE + payload_len
}

/// Deepest stack a slot of `slot_bytes` can hold under any feature version
///
/// Returns 0 when the slot cannot even hold the fixed part of a record.
#[must_use]
pub const fn max_depth_for_slot(slot_bytes: usize) -> usize {
    if slot_bytes <= MAX_STACKTRACE_OVERHEAD {
        0
    } else {
        (slot_bytes - MAX_STACKTRACE_OVERHEAD) / WORD_SIZE
    }
}

// ============================================================================
// Slot Layout
// ============================================================================

/// Fixed part of a record as written by the sampler into a pool slot
///
/// The frames (or virtual-ip payload) live in the slot's word array; this
/// header says how many of them are valid.
///
/// **Memory Layout**: `#[repr(C)]`, word-sized fields only
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SlotHeader {
    /// Record kind (`MARKER_STACKTRACE` or `MARKER_VIRTUAL_IP`)
    pub marker: u8,

    /// Padding for word alignment
    #[allow(clippy::pub_underscore_fields)]
    pub _padding: [u8; 7],

    /// Repeat count, always 1 from the sampler
    pub count: usize,

    /// Number of valid frame words
    pub depth: usize,

    /// Thread id supplied by the frame source
    ///
    /// Carries [`ALLOCATION_THREAD_BIT`] for allocation-triggered samples.
    pub thread_id: usize,

    /// Collaborator-defined tag
    pub tag: usize,

    /// Allocated kilobytes reported by the frame source (memory tracking)
    pub memory_kb: usize,

    /// Virtual-ip identifier (`MARKER_VIRTUAL_IP` only)
    pub virtual_ip: usize,

    /// Number of valid payload bytes (`MARKER_VIRTUAL_IP` only)
    pub payload_len: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_versions_are_supersets() {
        assert!(!FeatureVersion::Base.has_thread_id());
        assert!(FeatureVersion::ThreadId.has_thread_id());
        assert!(!FeatureVersion::ThreadId.has_tag());
        assert!(FeatureVersion::Tag.has_thread_id() && FeatureVersion::Tag.has_tag());
        assert!(FeatureVersion::Memory.has_tag() && FeatureVersion::Memory.has_memory());
        assert_eq!(FeatureVersion::from_byte(4), None);
    }

    #[test]
    fn test_record_lengths() {
        assert_eq!(stacktrace_record_len(FeatureVersion::Base, 0), 1 + 2 * WORD_SIZE);
        assert_eq!(stacktrace_record_len(FeatureVersion::Memory, 3), 1 + 8 * WORD_SIZE);
        assert_eq!(header_record_len(6), 5 * WORD_SIZE + 3 + 6);
        assert_eq!(virtual_ip_record_len(4), 1 + 2 * WORD_SIZE + 4);
    }

    #[test]
    fn test_max_depth_for_slot() {
        assert_eq!(max_depth_for_slot(MAX_STACKTRACE_OVERHEAD), 0);
        assert_eq!(max_depth_for_slot(MAX_STACKTRACE_OVERHEAD + WORD_SIZE), 1);
        let depth = max_depth_for_slot(8192);
        assert!(stacktrace_record_len(FeatureVersion::Memory, depth) <= 8192);
    }
}
