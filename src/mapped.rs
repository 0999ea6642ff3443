//! The mapped-block arena.
//!
//! Large blocks bypass the heap region entirely: each one is an independent
//! zero-initialized mapping holding a header and its payload. There is no
//! list and no reuse; free returns the mapping, and resize is always a fresh
//! mapping plus a copy.

use crate::header::{BlockHeader, HEADER_SIZE};
use crate::mappers::PageMapper;

use core::cmp::min;
use core::fmt;
use core::ptr::{self, null_mut, NonNull};

use tracing::{error, instrument, Level};

/// Registry of independently mapped blocks. Blocks are self-describing, so
/// only the aggregate counters live here; byte counts include the header of
/// every mapping.
pub struct MappedArena<M: PageMapper> {
    mapper: M,
    total_blocks: usize,
    total_bytes: usize,
}

impl<M: PageMapper> fmt::Debug for MappedArena<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedArena")
            .field("total_blocks", &self.total_blocks)
            .field("total_bytes", &self.total_bytes)
            .finish()
    }
}

impl<M: PageMapper> MappedArena<M> {
    /// Creates an empty arena over `mapper`.
    pub const fn new(mapper: M) -> Self {
        MappedArena {
            mapper,
            total_blocks: 0,
            total_bytes: 0,
        }
    }

    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Maps a fresh block with `size` payload bytes. The payload is
    /// zero-initialized by the mapper's contract.
    ///
    /// # Safety
    /// Assumes `size` is non-zero.
    #[instrument(level = "info", ret(level = Level::INFO), err(Debug, level = Level::ERROR))]
    pub unsafe fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, ()> {
        debug_assert!(size > 0);
        let total_len = HEADER_SIZE + size;
        let addr = match self.mapper.map(total_len) {
            Ok(addr) => addr,
            Err(()) => {
                error!(total_len, "Mapping failed.");
                return Err(());
            }
        };
        let block: *mut BlockHeader = addr.as_ptr().cast();
        block.write(BlockHeader {
            total_payload: size,
            active_payload: size,
            is_free: false,
            next: null_mut(),
            prev: null_mut(),
        });
        self.total_blocks += 1;
        self.total_bytes += total_len;
        Ok(BlockHeader::payload_of(block))
    }

    /// Returns the whole mapping behind `payload` to the mapper.
    ///
    /// # Safety
    /// `payload` must have been produced by this arena and not freed before;
    /// the mapping is gone when this returns.
    #[instrument(level = "info")]
    pub unsafe fn dealloc(&mut self, payload: NonNull<u8>) {
        let block = BlockHeader::of_payload(payload);
        let total_len = HEADER_SIZE + (*block).total_payload;
        self.mapper
            .unmap(NonNull::new_unchecked(block.cast()), total_len);
        self.total_blocks -= 1;
        self.total_bytes -= total_len;
    }

    /// Relocates the block to a fresh mapping of `size` payload bytes,
    /// copying the lesser of the new size and the bytes in use. The old
    /// mapping survives if the new one cannot be obtained.
    ///
    /// # Safety
    /// `payload` must point to a live block of this arena and `size` must be
    /// non-zero.
    #[instrument(level = "info", ret(level = Level::INFO), err(Debug, level = Level::ERROR))]
    pub unsafe fn realloc(&mut self, payload: NonNull<u8>, size: usize) -> Result<NonNull<u8>, ()> {
        let block = BlockHeader::of_payload(payload);
        let copy_len = min(size, (*block).active_payload);
        let new_payload = self.alloc(size)?;
        ptr::copy_nonoverlapping(payload.as_ptr(), new_payload.as_ptr(), copy_len);
        self.dealloc(payload);
        Ok(new_payload)
    }
}
