//! Scoped reservation tokens for the circular buffer.
//!
//! A [`ProducerSpan`] is a claimed, writable window of slots that becomes
//! visible to readers only through [`publish`](ProducerSpan::publish). A
//! [`ConsumerSpan`] is a read view whose destruction settles how much was
//! consumed, governed by its [`SpanReleasePolicy`].

use std::ops::{Deref, DerefMut};

use super::{BufferError, BufferReader, BufferWriter, ProducerKind, RingElement};

/// What a [`ConsumerSpan`] does when it is dropped without an explicit
/// consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpanReleasePolicy {
    /// Consume the entire view (the default).
    #[default]
    ProcessAll,
    /// Consume nothing; the same samples are visible again next time.
    ProcessNone,
    /// Abort the process (debug builds only): the caller promised to
    /// consume explicitly and did not.
    Terminate,
}

/// Writable window over claimed slots, yielded by
/// [`BufferWriter::reserve`](super::BufferWriter::reserve).
///
/// Publish in one or more steps; the sum must not exceed the reservation.
/// On drop, an unpublished suffix is abandoned (single producer) or
/// published as-is (multi producer, so the cursor can never wedge behind an
/// abandoned claim).
pub struct ProducerSpan<'a, T: RingElement> {
    writer: &'a BufferWriter<T>,
    start: i64,
    len: usize,
    published: usize,
}

impl<'a, T: RingElement> ProducerSpan<'a, T> {
    pub(crate) fn new(writer: &'a BufferWriter<T>, start: i64, len: usize) -> Self {
        Self {
            writer,
            start,
            len,
            published: 0,
        }
    }

    /// Number of claimed slots.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Sequence of the first claimed slot.
    pub fn start_sequence(&self) -> i64 {
        self.start
    }

    /// Slots published so far from this reservation.
    pub fn published(&self) -> usize {
        self.published
    }

    /// Makes the next `n` written slots visible to readers, with release
    /// ordering, and signals the wait strategy.
    ///
    /// # Panics
    ///
    /// Panics when the total published would exceed the reservation.
    pub fn publish(&mut self, n: usize) {
        assert!(
            self.published + n <= self.len,
            "published {} + {} exceeds reservation of {}",
            self.published,
            n,
            self.len
        );
        if n == 0 {
            return;
        }
        let inner = self.writer.inner();
        let first = self.start + self.published as i64;
        inner.storage().sync_mirror(inner.index(first), n);
        match inner.kind() {
            ProducerKind::Single => inner.publish_single(first + n as i64 - 1),
            ProducerKind::Multi => {
                for sequence in first..first + n as i64 {
                    inner.set_available(sequence);
                }
                inner.advance_published();
                inner.signal_all();
            }
        }
        self.published += n;
        self.writer.note_published(self.published);
    }
}

impl<T: RingElement> Deref for ProducerSpan<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        let inner = self.writer.inner();
        // SAFETY: the range [start, start + len) is exclusively claimed by
        // this reservation and fits the mirrored window.
        unsafe { inner.storage().slice(inner.index(self.start), self.len) }
    }
}

impl<T: RingElement> DerefMut for ProducerSpan<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        let inner = self.writer.inner();
        // SAFETY: as above, and `&mut self` guarantees exclusivity.
        unsafe { inner.storage().slice_mut(inner.index(self.start), self.len) }
    }
}

impl<T: RingElement> Drop for ProducerSpan<'_, T> {
    fn drop(&mut self) {
        if self.published == self.len {
            return;
        }
        if self.writer.inner().kind() == ProducerKind::Multi {
            // A multi-producer claim cannot be withdrawn: later claims sit
            // behind it. Publish the suffix with its current slot contents.
            let remaining = self.len - self.published;
            self.publish(remaining);
        }
    }
}

/// Read view yielded by [`BufferReader::get`](super::BufferReader::get) and
/// friends. Nested views taken before the first consume share one cycle; the
/// release policy of the last view standing settles the cycle.
pub struct ConsumerSpan<'a, T: RingElement> {
    reader: &'a BufferReader<T>,
    start: i64,
    len: usize,
    policy: SpanReleasePolicy,
}

impl<'a, T: RingElement> ConsumerSpan<'a, T> {
    pub(crate) fn new(
        reader: &'a BufferReader<T>,
        start: i64,
        len: usize,
        policy: SpanReleasePolicy,
    ) -> Self {
        Self {
            reader,
            start,
            len,
            policy,
        }
    }

    /// Number of visible samples.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether an explicit consume already happened in this cycle.
    pub fn is_consume_requested(&self) -> bool {
        self.reader.is_consume_requested()
    }

    /// Consumes `n` samples: advances the reader cursor with release
    /// ordering and frees the slots for the producer. `consume(0)` is a
    /// valid way of saying "keep everything for the next round" while still
    /// suppressing the drop policy.
    ///
    /// # Errors
    ///
    /// [`BufferError::ConsumeExceedsView`] when `n` exceeds this view;
    /// [`BufferError::ConsumeAlreadyRequested`] on a second explicit consume
    /// within one cycle.
    pub fn consume(self, n: usize) -> Result<(), BufferError> {
        if n > self.len {
            return Err(BufferError::ConsumeExceedsView {
                requested: n,
                view: self.len,
            });
        }
        let (outstanding, consume_requested, pending) = self.reader.cycle_get();
        if consume_requested {
            return Err(BufferError::ConsumeAlreadyRequested);
        }
        self.reader.cycle_set(outstanding, true, pending);
        self.reader.advance(n);
        Ok(())
    }
}

impl<T: RingElement> Deref for ConsumerSpan<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        let inner = self.reader.inner();
        // SAFETY: the range [start, start + len) is published (gated by the
        // cursor) and cannot be reclaimed while this reader has not consumed
        // past it.
        unsafe { inner.storage().slice(inner.index(self.start), self.len) }
    }
}

impl<T: RingElement> Drop for ConsumerSpan<'_, T> {
    fn drop(&mut self) {
        let (outstanding, consume_requested, pending) = self.reader.cycle_get();
        let outstanding = outstanding.saturating_sub(1);
        if outstanding > 0 {
            self.reader.cycle_set(outstanding, consume_requested, pending);
            return;
        }
        if !consume_requested {
            match self.policy {
                SpanReleasePolicy::ProcessAll => self.reader.advance(pending),
                SpanReleasePolicy::ProcessNone => {}
                SpanReleasePolicy::Terminate => {
                    if cfg!(debug_assertions) {
                        eprintln!("consumer span dropped without an explicit consume");
                        std::process::abort();
                    }
                }
            }
        }
        self.reader.cycle_set(0, false, 0);
    }
}
