//! Newtype wrappers for values that cross the session boundary
//!
//! Validation happens once, in the constructors, so the rest of the crate can
//! treat an [`Interval`] or [`RuntimeLabel`] as already checked.

use std::fmt;

use sampletrace_common::MAX_LABEL_LEN;

use super::errors::SessionError;

/// Sampling interval, validated to `1e-6 <= secs < 1.0`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interval {
    secs: f64,
}

impl Interval {
    /// Smallest accepted interval (one microsecond)
    pub const MIN_SECS: f64 = 1e-6;
    /// First rejected interval (one second)
    pub const MAX_SECS_EXCLUSIVE: f64 = 1.0;

    /// Validate an interval given in seconds
    ///
    /// # Errors
    /// Returns [`SessionError::InvalidInterval`] outside `[1e-6, 1.0)`, and for NaN
    pub fn from_secs_f64(secs: f64) -> Result<Self, SessionError> {
        // Written so that NaN fails both comparisons and is rejected.
        if secs >= Self::MIN_SECS && secs < Self::MAX_SECS_EXCLUSIVE {
            Ok(Self { secs })
        } else {
            Err(SessionError::InvalidInterval(secs))
        }
    }

    #[must_use]
    pub fn as_secs_f64(self) -> f64 {
        self.secs
    }

    /// Interval in whole microseconds, as written into the header
    ///
    /// Truncated, so an accepted interval never reads back as one second.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn as_micros(self) -> usize {
        (self.secs * 1_000_000.0) as usize
    }

    #[must_use]
    pub fn as_duration(self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.secs)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.as_micros())
    }
}

/// Runtime/interpreter label carried by the header, at most 255 bytes
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RuntimeLabel(Vec<u8>);

impl RuntimeLabel {
    /// Build a label, truncating to [`MAX_LABEL_LEN`] bytes
    ///
    /// Returns the label and whether truncation happened.
    #[must_use]
    pub fn truncated(label: &str) -> (Self, bool) {
        let bytes = label.as_bytes();
        let len = bytes.len().min(MAX_LABEL_LEN);
        (Self(bytes[..len].to_vec()), len < bytes.len())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RuntimeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Thread identifier as supplied by the frame source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub usize);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TID:{}", self.0)
    }
}

/// Index of a slot in the buffer pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotIndex(pub usize);

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_boundaries() {
        assert!(Interval::from_secs_f64(1e-6).is_ok());
        assert!(Interval::from_secs_f64(0.999_999).is_ok());
        assert!(Interval::from_secs_f64(1.0).is_err());
        assert!(Interval::from_secs_f64(9.9e-7).is_err());
        assert!(Interval::from_secs_f64(0.0).is_err());
        assert!(Interval::from_secs_f64(-0.5).is_err());
        assert!(Interval::from_secs_f64(f64::NAN).is_err());
    }

    #[test]
    fn test_interval_micros() {
        assert_eq!(Interval::from_secs_f64(1e-6).unwrap().as_micros(), 1);
        assert_eq!(Interval::from_secs_f64(0.01).unwrap().as_micros(), 10_000);
        assert_eq!(Interval::from_secs_f64(0.999_999_5).unwrap().as_micros(), 999_999);
    }

    #[test]
    fn test_label_truncation() {
        let (label, truncated) = RuntimeLabel::truncated("worker");
        assert_eq!(label.as_bytes(), b"worker");
        assert!(!truncated);

        let long = "x".repeat(300);
        let (label, truncated) = RuntimeLabel::truncated(&long);
        assert_eq!(label.len(), 255);
        assert!(truncated);
    }

    #[test]
    fn test_display() {
        assert_eq!(ThreadId(42).to_string(), "TID:42");
        assert_eq!(SlotIndex(3).to_string(), "slot#3");
    }
}
