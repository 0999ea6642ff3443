//! The public allocator: request validation, size-class routing between the
//! two arenas, and the aggregate counters.

use crate::growers::{BrkGrower, Grower};
use crate::header::{BlockHeader, HEADER_SIZE};
use crate::heap::HeapArena;
use crate::mapped::MappedArena;
use crate::mappers::{MmapMapper, PageMapper};
use crate::util::raw_ptr;

use core::cell::UnsafeCell;
use core::cmp::min;
use core::fmt;
use core::ptr::{self, null_mut, NonNull};

use static_assertions::const_assert;
use tracing::{debug, instrument, Level};

/// Largest request size honored by any entry point; anything above (or a
/// zero request) yields a null pointer.
pub const MAX_REQUEST: usize = 100_000_000;

/// Requests of at least this many bytes are served as independent mappings
/// instead of heap blocks.
pub const MMAP_THRESHOLD: usize = 128 * 1024;

const_assert!(MMAP_THRESHOLD <= MAX_REQUEST);

#[inline(always)]
fn request_ok(size: usize) -> bool {
    size != 0 && size <= MAX_REQUEST
}

/// A two-tier memory allocator.
///
/// Small requests are served from a [`HeapArena`] over the grower `G`, large
/// ones from a [`MappedArena`] over the mapper `M`; the split point is
/// [`MMAP_THRESHOLD`]. The allocator is single-threaded and non-reentrant:
/// the arenas sit in [`UnsafeCell`]s so every entry point can take `&self`,
/// and the type is deliberately not `Sync`.
pub struct TieredMalloc<G: Grower, M: PageMapper> {
    heap: UnsafeCell<HeapArena<G>>,
    mapped: UnsafeCell<MappedArena<M>>,
}

impl TieredMalloc<BrkGrower, MmapMapper> {
    /// Creates an allocator over the program break and anonymous mappings.
    ///
    /// # Safety
    /// Callers must make sure nothing else moves the program break for the
    /// lifetime of the allocator.
    pub const unsafe fn new() -> Self {
        TieredMalloc::with_capabilities(BrkGrower::new(), MmapMapper::new())
    }
}

impl<G: Grower, M: PageMapper> TieredMalloc<G, M> {
    /// Creates an allocator over the provided grower and mapper.
    ///
    /// # Safety
    /// Callers must make sure the grower and mapper will be the only objects
    /// managing their underlying memory for the lifetime of the allocator.
    pub const unsafe fn with_capabilities(grower: G, mapper: M) -> Self {
        TieredMalloc {
            heap: UnsafeCell::new(HeapArena::new(grower)),
            mapped: UnsafeCell::new(MappedArena::new(mapper)),
        }
    }

    /// Allocates `size` bytes and returns the payload pointer, or null when
    /// the size is invalid or memory cannot be obtained.
    pub fn alloc(&self, size: usize) -> *mut u8 {
        if !request_ok(size) {
            return null_mut();
        }
        unsafe {
            let result = if size >= MMAP_THRESHOLD {
                (*self.mapped.get()).alloc(size)
            } else {
                (*self.heap.get()).alloc(size)
            };
            raw_ptr(result.ok())
        }
    }

    /// Allocates `count * size` bytes with the requested span zero-filled.
    /// Null when either argument is zero, either argument or the product
    /// exceeds [`MAX_REQUEST`], or memory cannot be obtained.
    pub fn alloc_zeroed(&self, count: usize, size: usize) -> *mut u8 {
        if count == 0 || size == 0 || count > MAX_REQUEST || size > MAX_REQUEST {
            return null_mut();
        }
        let total = match count.checked_mul(size) {
            Some(total) if total <= MAX_REQUEST => total,
            _ => return null_mut(),
        };
        unsafe {
            let result = if total >= MMAP_THRESHOLD {
                // Fresh mappings are zero-initialized already.
                (*self.mapped.get()).alloc(total)
            } else {
                (*self.heap.get()).alloc_zeroed(total)
            };
            raw_ptr(result.ok())
        }
    }

    /// Releases the block whose payload starts at `payload`. Null pointers
    /// and already-free heap blocks are silently ignored.
    ///
    /// # Safety
    /// A non-null `payload` must have been produced by this allocator, and
    /// the caller must not touch the payload afterwards.
    pub unsafe fn free(&self, payload: *mut u8) {
        let Some(payload) = NonNull::new(payload) else {
            return;
        };
        let block = BlockHeader::of_payload(payload);
        if (*block).active_payload < MMAP_THRESHOLD {
            (*self.heap.get()).dealloc(payload);
        } else {
            (*self.mapped.get()).dealloc(payload);
        }
    }

    /// Resizes the block at `payload` to `size` bytes, relocating it when it
    /// cannot grow where it is, including across the two arenas when the new
    /// size falls on the other side of [`MMAP_THRESHOLD`]. A null `payload`
    /// behaves like [`alloc`](TieredMalloc::alloc); an invalid size returns
    /// null with the old block untouched, as does any allocation failure.
    ///
    /// # Safety
    /// A non-null `payload` must point to a live block of this allocator.
    /// On success the old pointer must no longer be used (the returned one
    /// may differ); on failure it remains valid.
    #[instrument(level = "info", ret(level = Level::INFO))]
    pub unsafe fn realloc(&self, payload: *mut u8, size: usize) -> *mut u8 {
        if !request_ok(size) {
            return null_mut();
        }
        let Some(old_payload) = NonNull::new(payload) else {
            return self.alloc(size);
        };

        let heap = &mut *self.heap.get();
        let mapped = &mut *self.mapped.get();
        let old_block = BlockHeader::of_payload(old_payload);
        let old_is_mapped = (*old_block).active_payload >= MMAP_THRESHOLD;
        let new_is_mapped = size >= MMAP_THRESHOLD;

        let result = match (old_is_mapped, new_is_mapped) {
            (false, false) => heap.realloc(old_payload, size),
            (true, true) => mapped.realloc(old_payload, size),
            (false, true) => {
                debug!("Block leaves the heap region for a mapping.");
                let copy_len = min(size, (*old_block).active_payload);
                match mapped.alloc(size) {
                    Ok(new_payload) => {
                        ptr::copy_nonoverlapping(
                            old_payload.as_ptr(),
                            new_payload.as_ptr(),
                            copy_len,
                        );
                        heap.dealloc(old_payload);
                        Ok(new_payload)
                    }
                    Err(()) => Err(()),
                }
            }
            (true, false) => {
                debug!("Block leaves its mapping for the heap region.");
                let copy_len = min(size, (*old_block).active_payload);
                match heap.alloc(size) {
                    Ok(new_payload) => {
                        ptr::copy_nonoverlapping(
                            old_payload.as_ptr(),
                            new_payload.as_ptr(),
                            copy_len,
                        );
                        mapped.dealloc(old_payload);
                        Ok(new_payload)
                    }
                    Err(()) => Err(()),
                }
            }
        };
        raw_ptr(result.ok())
    }

    /// Number of free heap blocks. Mapped blocks are never free.
    pub fn free_blocks(&self) -> usize {
        unsafe { (*self.heap.get()).free_blocks() }
    }

    /// Sum of the capacities of all free heap blocks.
    pub fn free_bytes(&self) -> usize {
        unsafe { (*self.heap.get()).free_bytes() }
    }

    /// Number of blocks in both arenas, free and live.
    pub fn total_blocks(&self) -> usize {
        unsafe { (*self.heap.get()).total_blocks() + (*self.mapped.get()).total_blocks() }
    }

    /// Payload bytes owned by both arenas; header bytes are excluded.
    pub fn total_bytes(&self) -> usize {
        unsafe {
            (*self.heap.get()).total_bytes() + (*self.mapped.get()).total_bytes()
                - self.metadata_bytes()
        }
    }

    /// Header bytes spent across both arenas.
    pub fn metadata_bytes(&self) -> usize {
        self.total_blocks() * HEADER_SIZE
    }

    /// Size of the per-block metadata record.
    pub const fn metadata_size(&self) -> usize {
        HEADER_SIZE
    }
}

impl<G: Grower, M: PageMapper> fmt::Debug for TieredMalloc<G, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TieredMalloc")
            .field("free_blocks", &self.free_blocks())
            .field("free_bytes", &self.free_bytes())
            .field("total_blocks", &self.total_blocks())
            .field("total_bytes", &self.total_bytes())
            .finish()
    }
}
