//! Monotonic cursors for ring-buffer coordination.
//!
//! A [`Sequence`] is a cache-line-aligned atomic counter identifying a slot in
//! a ring buffer. Producers publish data by release-storing the cursor after
//! writing slots; consumers acquire-load the cursor before reading them. This
//! release–acquire pairing is the only synchronisation the single-producer
//! ring needs — no per-slot atomics.
//!
//! [`minimum_sequence`] is the canonical gating query: a producer asks for the
//! slowest reader before reusing slots.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Value of a freshly created cursor: no element has ever been published.
pub const INITIAL_CURSOR_VALUE: i64 = -1;

/// A monotonically non-decreasing atomic counter, padded to a cache line to
/// avoid false sharing between producer and consumer cursors.
///
/// # Example
///
/// ```rust
/// use caudal_core::sequence::{Sequence, INITIAL_CURSOR_VALUE};
///
/// let seq = Sequence::default();
/// assert_eq!(seq.value(), INITIAL_CURSOR_VALUE);
///
/// seq.set(3);
/// assert!(seq.compare_and_set(3, 4));
/// assert!(!seq.compare_and_set(3, 5));
/// assert_eq!(seq.add_and_get(2), 6);
/// ```
#[repr(C, align(64))]
pub struct Sequence {
    value: AtomicI64,
}

impl Sequence {
    /// Creates a sequence starting at `initial`.
    pub const fn new(initial: i64) -> Self {
        Self {
            value: AtomicI64::new(initial),
        }
    }

    /// Current value (acquire: pairs with the producer's release store).
    #[inline]
    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    /// Sets the value (release: publishes everything written before).
    #[inline]
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Release);
    }

    /// Atomically replaces `expected` with `new`. Returns `true` on success.
    #[inline]
    pub fn compare_and_set(&self, expected: i64, new: i64) -> bool {
        self.value
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Atomically adds `n` and returns the value *before* the addition.
    #[inline]
    pub fn fetch_add(&self, n: i64) -> i64 {
        self.value.fetch_add(n, Ordering::AcqRel)
    }

    /// Atomically adds 1 and returns the new value.
    #[inline]
    pub fn increment_and_get(&self) -> i64 {
        self.fetch_add(1) + 1
    }

    /// Atomically adds `n` and returns the new value.
    #[inline]
    pub fn add_and_get(&self, n: i64) -> i64 {
        self.fetch_add(n) + n
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new(INITIAL_CURSOR_VALUE)
    }
}

impl std::fmt::Debug for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Sequence").field(&self.value()).finish()
    }
}

impl std::fmt::Display for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// Returns `min(floor, min over sequences)`.
///
/// This is the gating-sequence query: producers call it with the published
/// cursor as `floor` so that an empty reader list gates on nothing, and a
/// populated one gates on the slowest reader.
pub fn minimum_sequence(sequences: &[Arc<Sequence>], floor: i64) -> i64 {
    sequences
        .iter()
        .map(|s| s.value())
        .fold(floor, std::cmp::min)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_and_initial_value() {
        assert_eq!(std::mem::align_of::<Sequence>(), 64);
        assert_eq!(INITIAL_CURSOR_VALUE, -1);
        assert_eq!(Sequence::default().value(), -1);
        assert_eq!(Sequence::new(2).value(), 2);
    }

    #[test]
    fn test_set_and_cas() {
        let s = Sequence::default();
        s.set(3);
        assert_eq!(s.value(), 3);

        assert!(s.compare_and_set(3, 4));
        assert_eq!(s.value(), 4);
        assert!(!s.compare_and_set(3, 5));
        assert_eq!(s.value(), 4);
    }

    #[test]
    fn test_arithmetic() {
        let s = Sequence::new(4);
        assert_eq!(s.increment_and_get(), 5);
        assert_eq!(s.value(), 5);
        assert_eq!(s.add_and_get(2), 7);
        assert_eq!(s.value(), 7);
        assert_eq!(s.fetch_add(3), 7);
        assert_eq!(s.value(), 10);
    }

    #[test]
    fn test_minimum_sequence() {
        let mut sequences: Vec<Arc<Sequence>> = Vec::new();
        assert_eq!(minimum_sequence(&sequences, i64::MAX), i64::MAX);
        assert_eq!(minimum_sequence(&sequences, 2), 2);

        sequences.push(Arc::new(Sequence::new(4)));
        assert_eq!(minimum_sequence(&sequences, i64::MAX), 4);
        assert_eq!(minimum_sequence(&sequences, 5), 4);
        assert_eq!(minimum_sequence(&sequences, 2), 2);

        sequences.push(Arc::new(Sequence::new(1)));
        assert_eq!(minimum_sequence(&sequences, i64::MAX), 1);
    }

    #[test]
    fn test_display() {
        let s = Sequence::new(42);
        assert_eq!(format!("{s}"), "42");
        assert!(!format!("{s:?}").is_empty());
    }
}
