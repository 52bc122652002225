//! Slot storage for the circular buffer.
//!
//! Every view of up to `capacity` slots must be contiguous, even when it
//! wraps. Two backends provide that contract:
//!
//! - **Double-mapped** (Linux): a `memfd` region mapped twice back-to-back,
//!   so index arithmetic never has to care about the wrap at all. Only used
//!   when the slot region is an exact multiple of the page size and `T` has
//!   no drop glue (the two halves alias the same physical memory).
//! - **Mirrored heap** (everywhere else): a real `2 × capacity` allocation
//!   whose upper half is refreshed from the lower on publish, before the
//!   cursor makes the slots visible.
//!
//! Callers index with `sequence & (capacity - 1)` and may read/write windows
//! of up to `capacity` slots starting anywhere below `capacity`.

use std::mem;
use std::ptr::NonNull;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    #[cfg(target_os = "linux")]
    DoubleMapped {
        region_bytes: usize,
    },
    MirroredHeap,
}

pub(crate) struct RingStorage<T> {
    ptr: NonNull<T>,
    capacity: usize,
    backend: Backend,
}

// Access is coordinated entirely by the ring's sequences: a slot is never
// written and read concurrently, and distinct producers claim distinct slots.
unsafe impl<T: Send + Sync> Send for RingStorage<T> {}
unsafe impl<T: Send + Sync> Sync for RingStorage<T> {}

impl<T: Default> RingStorage<T> {
    /// Allocates storage for `capacity` slots (power of two, non-zero),
    /// default-initialised.
    pub(crate) fn allocate(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());

        #[cfg(target_os = "linux")]
        {
            let slot_bytes = mem::size_of::<T>();
            let region_bytes = capacity * slot_bytes;
            if !mem::needs_drop::<T>()
                && slot_bytes > 0
                && region_bytes % page_size() == 0
            {
                if let Some(base) = double_map(region_bytes) {
                    let ptr = base.cast::<T>();
                    // Initialise the primary half only; the upper half is the
                    // same physical memory.
                    for i in 0..capacity {
                        unsafe { ptr.as_ptr().add(i).write(T::default()) };
                    }
                    return Self {
                        ptr,
                        capacity,
                        backend: Backend::DoubleMapped { region_bytes },
                    };
                }
            }
        }

        let mut slots: Vec<T> = (0..2 * capacity).map(|_| T::default()).collect();
        let ptr = NonNull::new(slots.as_mut_ptr()).expect("vec pointer is non-null");
        mem::forget(slots);
        Self {
            ptr,
            capacity,
            backend: Backend::MirroredHeap,
        }
    }
}

impl<T> RingStorage<T> {
    /// Whether the mirror is a true aliased mapping (no copy on publish).
    #[allow(dead_code)]
    pub(crate) fn is_double_mapped(&self) -> bool {
        self.backend != Backend::MirroredHeap
    }

    /// Raw pointer to the slot at `index`.
    ///
    /// # Safety
    ///
    /// `index < 2 * capacity`, and the caller must hold the exclusive claim
    /// (writers) or visibility (readers) the ring's sequences grant.
    #[inline]
    pub(crate) unsafe fn slot_ptr(&self, index: usize) -> *mut T {
        debug_assert!(index < 2 * self.capacity);
        self.ptr.as_ptr().add(index)
    }

    /// Shared view over `len` slots starting at `index`.
    ///
    /// # Safety
    ///
    /// `index < capacity`, `len <= capacity`, and the range must be published
    /// and not concurrently claimed for writing.
    #[inline]
    pub(crate) unsafe fn slice(&self, index: usize, len: usize) -> &[T] {
        debug_assert!(index < self.capacity.max(1) && len <= self.capacity);
        std::slice::from_raw_parts(self.slot_ptr(index), len)
    }

    /// Mutable view over `len` slots starting at `index`.
    ///
    /// # Safety
    ///
    /// Same as [`slice`](Self::slice), plus the range must be exclusively
    /// claimed by the caller.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut(&self, index: usize, len: usize) -> &mut [T] {
        debug_assert!(index < self.capacity.max(1) && len <= self.capacity);
        std::slice::from_raw_parts_mut(self.slot_ptr(index), len)
    }
}

impl<T: Clone> RingStorage<T> {
    /// Refreshes the mirror for `len` slots starting at `index`, so the
    /// contiguity contract holds for readers. Must run before the cursor
    /// publishes the slots. No-op on the double-mapped backend.
    pub(crate) fn sync_mirror(&self, index: usize, len: usize) {
        if self.backend != Backend::MirroredHeap {
            return;
        }
        for i in index..index + len {
            let alias = if i >= self.capacity {
                i - self.capacity
            } else {
                i + self.capacity
            };
            // The alias slot belongs to a sequence no live reader can still
            // see (the producer gated on the slowest reader), so this write
            // cannot race a read.
            unsafe {
                let value = (*self.slot_ptr(i)).clone();
                *self.slot_ptr(alias) = value;
            }
        }
    }
}

impl<T> Drop for RingStorage<T> {
    fn drop(&mut self) {
        match self.backend {
            #[cfg(target_os = "linux")]
            Backend::DoubleMapped { region_bytes } => unsafe {
                // T has no drop glue on this path; just unmap both halves.
                libc::munmap(self.ptr.as_ptr().cast(), 2 * region_bytes);
            },
            Backend::MirroredHeap => unsafe {
                drop(Vec::from_raw_parts(
                    self.ptr.as_ptr(),
                    2 * self.capacity,
                    2 * self.capacity,
                ));
            },
        }
    }
}

#[cfg(target_os = "linux")]
fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Maps a `memfd` region of `bytes` twice, back to back. Returns the base of
/// the doubled window, or `None` if any step fails (callers fall back to the
/// mirrored heap).
#[cfg(target_os = "linux")]
fn double_map(bytes: usize) -> Option<NonNull<u8>> {
    unsafe {
        let name = b"caudal-ring\0";
        let fd = libc::memfd_create(name.as_ptr().cast(), libc::MFD_CLOEXEC);
        if fd < 0 {
            return None;
        }
        if libc::ftruncate(fd, bytes as libc::off_t) != 0 {
            libc::close(fd);
            return None;
        }
        let base = libc::mmap(
            std::ptr::null_mut(),
            2 * bytes,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if base == libc::MAP_FAILED {
            libc::close(fd);
            return None;
        }
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let flags = libc::MAP_SHARED | libc::MAP_FIXED;
        let lo = libc::mmap(base, bytes, prot, flags, fd, 0);
        let hi = libc::mmap(base.cast::<u8>().add(bytes).cast(), bytes, prot, flags, fd, 0);
        libc::close(fd);
        if lo == libc::MAP_FAILED || hi == libc::MAP_FAILED {
            libc::munmap(base, 2 * bytes);
            return None;
        }
        NonNull::new(base.cast())
    }
}
