//! Lock-free circular buffer backing every graph edge.
//!
//! A [`CircularBuffer`] is a bounded, power-of-two-sized queue coordinated
//! entirely by [`Sequence`] cursors: the writer gates on the slowest reader
//! before reusing slots, readers gate on the published cursor before viewing
//! them. Claims and publishes are wait-free for a single producer and
//! lock-free for multiple producers; threads only ever park inside the
//! buffer's [`WaitStrategy`].
//!
//! Storage is mirrored (double-mapped where the platform allows it, see
//! [`storage`]) so every reservation and every read view of up to `capacity`
//! elements is one contiguous slice, wrap-around included.
//!
//! # Example
//!
//! ```rust
//! use caudal_core::ring::CircularBuffer;
//!
//! let buffer = CircularBuffer::<i32>::new(64)?;
//! let mut writer = buffer.new_writer();
//! let reader = buffer.new_reader();
//!
//! let mut span = writer.reserve(4)?;
//! span.copy_from_slice(&[1, 2, 3, 4]);
//! span.publish(4);
//! drop(span);
//!
//! let view = reader.get();
//! assert_eq!(&*view, &[1, 2, 3, 4]);
//! view.consume(4)?;
//! # Ok::<(), caudal_core::ring::BufferError>(())
//! ```

mod span;
mod storage;

pub use span::{ConsumerSpan, ProducerSpan, SpanReleasePolicy};

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::sequence::{minimum_sequence, Sequence};
use crate::wait::{WaitStrategy, WaitTimeout};
use storage::RingStorage;

/// Marker bound for types that can travel through a ring.
///
/// Slots are default-initialised at construction and refreshed into the
/// mirror by cloning, hence `Default + Clone`; buffers are shared across
/// threads, hence `Send + Sync`.
pub trait RingElement: Default + Clone + Send + Sync + 'static {}
impl<T: Default + Clone + Send + Sync + 'static> RingElement for T {}

/// How many threads may claim slots concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerKind {
    /// Exactly one writer; claims and publishes are wait-free.
    Single,
    /// Any number of writers; slots publish out of order, the observable
    /// cursor only advances through the contiguous published prefix.
    Multi,
}

/// Errors reported by buffer operations. All of them are caller mistakes or
/// explicit flow-control outcomes, never internal failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    /// Requested capacity was zero.
    #[error("buffer capacity must be non-zero")]
    InvalidCapacity,

    /// A reservation asked for more slots than the whole buffer holds.
    #[error("cannot reserve {requested} slots in a buffer of capacity {capacity}")]
    ReserveExceedsCapacity { requested: usize, capacity: usize },

    /// Non-blocking reservation found insufficient headroom.
    #[error("not enough space: requested {requested}, available {available}")]
    NotEnoughSpace { requested: usize, available: usize },

    /// `consume(k)` asked for more samples than the view holds.
    #[error("cannot consume {requested} samples from a view of {view}")]
    ConsumeExceedsView { requested: usize, view: usize },

    /// A second explicit consume within the same read cycle.
    #[error("consume was already requested for this view")]
    ConsumeAlreadyRequested,

    /// A bounded wait strategy gave up.
    #[error(transparent)]
    Timeout(#[from] WaitTimeout),
}

pub(crate) struct RingInner<T> {
    storage: RingStorage<T>,
    capacity: usize,
    mask: i64,
    shift: u32,
    kind: ProducerKind,
    /// Published cursor: the highest sequence visible to readers.
    cursor: Sequence,
    /// Multi-producer claim counter (unused for `Single`).
    claim: Sequence,
    /// Per-slot publication rounds for `Multi` (empty for `Single`).
    available: Box<[AtomicI32]>,
    readers: RwLock<Vec<Arc<Sequence>>>,
    wait: WaitStrategy,
    writer_taken: AtomicBool,
}

impl<T> RingInner<T> {
    #[inline]
    pub(crate) fn index(&self, sequence: i64) -> usize {
        (sequence & self.mask) as usize
    }

    #[inline]
    fn round(&self, sequence: i64) -> i32 {
        (sequence >> self.shift) as i32
    }

    /// Slowest reader, or `floor` when no readers are registered.
    fn gating_sequence(&self, floor: i64) -> i64 {
        let readers = self.readers.read().expect("reader registry poisoned");
        minimum_sequence(&readers, floor)
    }

    pub(crate) fn set_available(&self, sequence: i64) {
        self.available[self.index(sequence)].store(self.round(sequence), Ordering::Release);
    }

    fn is_available(&self, sequence: i64) -> bool {
        self.available[self.index(sequence)].load(Ordering::Acquire) == self.round(sequence)
    }

    /// Advances the published cursor through the contiguous prefix of
    /// published slots (multi-producer only).
    pub(crate) fn advance_published(&self) {
        loop {
            let current = self.cursor.value();
            let mut next = current + 1;
            while self.is_available(next) {
                next += 1;
            }
            let target = next - 1;
            if target == current {
                return;
            }
            if self.cursor.compare_and_set(current, target) {
                self.wait.signal_all();
            }
            // Re-scan either way: more slots may have been published, or
            // another producer advanced the cursor first.
        }
    }

    pub(crate) fn publish_single(&self, up_to: i64) {
        self.cursor.set(up_to);
        self.wait.signal_all();
    }

    pub(crate) fn storage(&self) -> &RingStorage<T> {
        &self.storage
    }

    pub(crate) fn kind(&self) -> ProducerKind {
        self.kind
    }

    pub(crate) fn signal_all(&self) {
        self.wait.signal_all();
    }
}

/// Bounded lock-free buffer with mirrored storage. Cheap to clone; all
/// clones, writers and readers share the same slots.
pub struct CircularBuffer<T> {
    inner: Arc<RingInner<T>>,
}

impl<T> Clone for CircularBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: RingElement> CircularBuffer<T> {
    /// Creates a single-producer buffer of at least `capacity` slots
    /// (rounded up to the next power of two).
    pub fn new(capacity: usize) -> Result<Self, BufferError> {
        Self::with_wait_strategy(capacity, ProducerKind::Single, WaitStrategy::default())
    }

    /// Creates a multi-producer buffer of at least `capacity` slots.
    pub fn new_multi(capacity: usize) -> Result<Self, BufferError> {
        Self::with_wait_strategy(capacity, ProducerKind::Multi, WaitStrategy::default())
    }

    /// Full-control constructor.
    pub fn with_wait_strategy(
        capacity: usize,
        kind: ProducerKind,
        wait: WaitStrategy,
    ) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::InvalidCapacity);
        }
        let capacity = capacity.next_power_of_two();
        let available = match kind {
            ProducerKind::Single => Vec::new().into_boxed_slice(),
            ProducerKind::Multi => (0..capacity)
                .map(|_| AtomicI32::new(-1))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        };
        Ok(Self {
            inner: Arc::new(RingInner {
                storage: RingStorage::allocate(capacity),
                capacity,
                mask: capacity as i64 - 1,
                shift: capacity.trailing_zeros(),
                kind,
                cursor: Sequence::default(),
                claim: Sequence::default(),
                available,
                readers: RwLock::new(Vec::new()),
                wait,
                writer_taken: AtomicBool::new(false),
            }),
        })
    }

    /// Number of slots (always a power of two `>=` the requested size).
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Currently registered readers.
    pub fn reader_count(&self) -> usize {
        self.inner
            .readers
            .read()
            .expect("reader registry poisoned")
            .len()
    }

    /// Value of the published cursor.
    pub fn cursor_value(&self) -> i64 {
        self.inner.cursor.value()
    }

    /// Creates a writer.
    ///
    /// # Panics
    ///
    /// For [`ProducerKind::Single`] buffers, panics on the second call:
    /// two writers on a single-producer buffer would race on slot claims.
    pub fn new_writer(&self) -> BufferWriter<T> {
        if self.inner.kind == ProducerKind::Single
            && self.inner.writer_taken.swap(true, Ordering::AcqRel)
        {
            panic!("single-producer buffer already has a writer");
        }
        BufferWriter {
            inner: Arc::clone(&self.inner),
            cached_gate: Cell::new(crate::sequence::INITIAL_CURSOR_VALUE),
            last_published: Cell::new(0),
        }
    }

    /// Creates a reader positioned at the current published cursor. Readers
    /// never see history written before they joined.
    pub fn new_reader(&self) -> BufferReader<T> {
        let mut readers = self.inner.readers.write().expect("reader registry poisoned");
        let sequence = Arc::new(Sequence::new(self.inner.cursor.value()));
        readers.push(Arc::clone(&sequence));
        drop(readers);
        BufferReader {
            inner: Arc::clone(&self.inner),
            sequence,
            cycle: Cell::new(ConsumeCycle::default()),
        }
    }
}

/// Producer endpoint. Obtained from [`CircularBuffer::new_writer`].
pub struct BufferWriter<T> {
    inner: Arc<RingInner<T>>,
    /// Cached slowest-reader position; refreshed only when insufficient.
    cached_gate: Cell<i64>,
    /// Samples published from the most recent reservation.
    last_published: Cell<usize>,
}

impl<T: RingElement> BufferWriter<T> {
    /// Handle back to the owning buffer.
    pub fn buffer(&self) -> CircularBuffer<T> {
        CircularBuffer {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Slots that could be reserved right now without waiting.
    pub fn available(&self) -> usize {
        let produced = match self.inner.kind {
            ProducerKind::Single => self.inner.cursor.value(),
            ProducerKind::Multi => self.inner.claim.value(),
        };
        let gate = self.inner.gating_sequence(produced);
        self.inner.capacity - (produced - gate) as usize
    }

    /// Value of the published cursor.
    pub fn position(&self) -> i64 {
        self.inner.cursor.value()
    }

    /// Samples published from the most recent reservation.
    pub fn samples_published(&self) -> usize {
        self.last_published.get()
    }

    /// Reserves `n` contiguous slots, waiting for reader headroom per the
    /// buffer's wait strategy. Satisfied immediately when no readers are
    /// registered or enough slots are free.
    ///
    /// # Errors
    ///
    /// [`BufferError::ReserveExceedsCapacity`] when `n` can never fit;
    /// [`BufferError::Timeout`] when a bounded wait strategy gives up.
    pub fn reserve(&mut self, n: usize) -> Result<ProducerSpan<'_, T>, BufferError> {
        self.claim_slots(n, true)
    }

    /// Non-blocking [`reserve`](Self::reserve): fails with
    /// [`BufferError::NotEnoughSpace`] instead of waiting.
    pub fn try_reserve(&mut self, n: usize) -> Result<ProducerSpan<'_, T>, BufferError> {
        self.claim_slots(n, false)
    }

    fn claim_slots(&mut self, n: usize, blocking: bool) -> Result<ProducerSpan<'_, T>, BufferError> {
        let capacity = self.inner.capacity;
        if n > capacity {
            return Err(BufferError::ReserveExceedsCapacity {
                requested: n,
                capacity,
            });
        }

        let start = match (self.inner.kind, blocking) {
            (ProducerKind::Single, _) => {
                let produced = self.inner.cursor.value();
                let end = produced + n as i64;
                self.ensure_headroom(end - capacity as i64, n, blocking)?;
                produced + 1
            }
            (ProducerKind::Multi, true) => {
                // Claim unconditionally, then wait for our range to clear the
                // slowest reader. The claim itself can never be withdrawn.
                let end = self.inner.claim.add_and_get(n as i64);
                self.ensure_headroom(end - capacity as i64, n, true)?;
                end - n as i64 + 1
            }
            (ProducerKind::Multi, false) => loop {
                // CAS claim so a failed headroom check claims nothing.
                let current = self.inner.claim.value();
                let end = current + n as i64;
                self.ensure_headroom(end - capacity as i64, n, false)?;
                if self.inner.claim.compare_and_set(current, end) {
                    break current + 1;
                }
            },
        };

        self.last_published.set(0);
        Ok(ProducerSpan::new(self, start, n))
    }

    fn ensure_headroom(&self, wrap_point: i64, n: usize, blocking: bool) -> Result<(), BufferError> {
        if self.cached_gate.get() >= wrap_point {
            return Ok(());
        }
        let inner = &self.inner;
        if blocking {
            let gate = inner
                .wait
                .wait_until(wrap_point, || inner.gating_sequence(inner.cursor.value()))?;
            self.cached_gate.set(gate);
        } else {
            let gate = inner.gating_sequence(inner.cursor.value());
            if gate < wrap_point {
                return Err(BufferError::NotEnoughSpace {
                    requested: n,
                    available: self.available(),
                });
            }
            self.cached_gate.set(gate);
        }
        Ok(())
    }

    pub(crate) fn inner(&self) -> &RingInner<T> {
        &self.inner
    }

    pub(crate) fn note_published(&self, total: usize) {
        self.last_published.set(total);
    }
}

impl<T> Drop for BufferWriter<T> {
    fn drop(&mut self) {
        if self.inner.kind == ProducerKind::Single {
            self.inner.writer_taken.store(false, Ordering::Release);
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ConsumeCycle {
    outstanding: u32,
    consume_requested: bool,
    /// Size of the first view handed out in this cycle; later views clamp
    /// to it so a consumer cannot grow its window mid-processing.
    pending: usize,
}

/// Consumer endpoint with its own gating sequence. Dropping the reader
/// deregisters it and wakes any producer blocked on it.
pub struct BufferReader<T> {
    inner: Arc<RingInner<T>>,
    sequence: Arc<Sequence>,
    cycle: Cell<ConsumeCycle>,
}

impl<T: RingElement> BufferReader<T> {
    /// Handle back to the owning buffer.
    pub fn buffer(&self) -> CircularBuffer<T> {
        CircularBuffer {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Samples published but not yet consumed by this reader.
    pub fn available(&self) -> usize {
        (self.inner.cursor.value() - self.sequence.value()) as usize
    }

    /// Sequence of the last consumed sample (`-1` before the first).
    pub fn position(&self) -> i64 {
        self.sequence.value()
    }

    /// Whether an explicit consume happened in the current read cycle.
    pub fn is_consume_requested(&self) -> bool {
        self.cycle.get().consume_requested
    }

    /// View over everything currently available, with the default
    /// [`SpanReleasePolicy::ProcessAll`]. Never blocks.
    pub fn get(&self) -> ConsumerSpan<'_, T> {
        self.get_with(SpanReleasePolicy::ProcessAll, None)
    }

    /// View over at most `n` samples, clamped to [`available`](Self::available).
    pub fn get_n(&self, n: usize) -> ConsumerSpan<'_, T> {
        self.get_with(SpanReleasePolicy::ProcessAll, Some(n))
    }

    /// View with an explicit release policy. Repeated calls before the first
    /// consume are clamped to the size of the first outstanding view.
    pub fn get_with(&self, policy: SpanReleasePolicy, n: Option<usize>) -> ConsumerSpan<'_, T> {
        let mut cycle = self.cycle.get();
        let len = if cycle.outstanding == 0 {
            cycle.consume_requested = false;
            let available = self.available();
            let len = n.map_or(available, |n| n.min(available));
            cycle.pending = len;
            len
        } else if cycle.consume_requested {
            0
        } else {
            n.map_or(cycle.pending, |n| n.min(cycle.pending))
        };
        cycle.outstanding += 1;
        self.cycle.set(cycle);
        ConsumerSpan::new(self, self.sequence.value() + 1, len, policy)
    }

    pub(crate) fn inner(&self) -> &RingInner<T> {
        &self.inner
    }

    pub(crate) fn advance(&self, n: usize) {
        if n > 0 {
            self.sequence.set(self.sequence.value() + n as i64);
            self.inner.signal_all();
        }
    }

    pub(crate) fn cycle_get(&self) -> (u32, bool, usize) {
        let c = self.cycle.get();
        (c.outstanding, c.consume_requested, c.pending)
    }

    pub(crate) fn cycle_set(&self, outstanding: u32, consume_requested: bool, pending: usize) {
        self.cycle.set(ConsumeCycle {
            outstanding,
            consume_requested,
            pending,
        });
    }
}

impl<T> Drop for BufferReader<T> {
    fn drop(&mut self) {
        let mut readers = self.inner.readers.write().expect("reader registry poisoned");
        readers.retain(|r| !Arc::ptr_eq(r, &self.sequence));
        drop(readers);
        // A producer gated on this reader must re-evaluate.
        self.inner.wait.signal_all();
    }
}
