//! The monotonic progress counter shared between pipeline stages.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use crossbeam_utils::CachePadded;

/// The value of a [`Sequence`] before anything has been published through it.
pub const INITIAL_SEQUENCE_VALUE: i64 = -1;

/// A monotonic progress counter advanced by one pipeline stage and observed by others.
///
/// A producer publishes progress by calling [`set()`][Self::set] with ever-increasing
/// values; consumers observe that progress via [`value()`][Self::value]. The counter
/// starts at [`INITIAL_SEQUENCE_VALUE`], meaning nothing has been published yet.
///
/// Reads use acquire ordering and writes use release ordering, so any memory writes a
/// stage performs before advancing its sequence are visible to every stage that reads
/// the advanced value. The counter is cache-line padded to avoid false sharing between
/// the stages hammering on it.
///
/// # Example
///
/// ```rust
/// use seq_wait::{INITIAL_SEQUENCE_VALUE, Sequence};
///
/// let cursor = Sequence::new();
/// assert_eq!(cursor.value(), INITIAL_SEQUENCE_VALUE);
///
/// cursor.set(0);
/// assert_eq!(cursor.value(), 0);
/// ```
pub struct Sequence {
    value: CachePadded<AtomicI64>,
}

impl Sequence {
    /// Creates a new sequence at the initial position (nothing published).
    #[must_use]
    pub fn new() -> Self {
        Self::with_value(INITIAL_SEQUENCE_VALUE)
    }

    /// Creates a new sequence starting at a specific value.
    #[must_use]
    pub fn with_value(value: i64) -> Self {
        Self {
            value: CachePadded::new(AtomicI64::new(value)),
        }
    }

    /// Reads the current value.
    ///
    /// Acquire ordering: all writes performed by the stage that set this value are
    /// visible to the caller once the value is observed.
    #[must_use]
    #[inline]
    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    /// Publishes a new value.
    ///
    /// Release ordering: write your data first, then set the sequence.
    #[inline]
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Release);
    }

    /// Atomically advances the sequence by one, returning the new value.
    ///
    /// A convenience for single-producer stages that publish one item at a time.
    #[must_use]
    #[inline]
    pub fn increment(&self) -> i64 {
        self.value.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sequence")
            .field("value", &self.value.load(Ordering::Relaxed))
            .finish()
    }
}
