//! The heap-resident block arena.
//!
//! All small allocations live in one contiguous region at the end of the
//! process image, carved into blocks threaded on a doubly linked list kept
//! in ascending address order. The ordering holds by construction: blocks
//! are only ever appended at the break or produced by splitting an existing
//! block in place. The last block is the wilderness block, the only one that
//! can grow without moving.

use crate::growers::Grower;
use crate::header::{BlockHeader, HEADER_SIZE};

use core::fmt;
use core::ptr::{self, null_mut, NonNull};

use static_assertions::const_assert;
use tracing::{debug, error, instrument, Level};

/// Minimum payload a split remainder must have to be worth tracking as a
/// free block of its own. Remainders below this are left inside the live
/// block's capacity.
pub const SPLIT_THRESHOLD: usize = 128;

// A tracked remainder always outweighs the header spent on it.
const_assert!(SPLIT_THRESHOLD > HEADER_SIZE);

/// Payload bytes left over when a block of `capacity` is trimmed to
/// `new_size`, after paying for the remainder's own header. Zero when the
/// slack cannot even hold a header.
#[inline]
fn split_remainder(capacity: usize, new_size: usize) -> usize {
    if capacity - new_size > HEADER_SIZE {
        capacity - new_size - HEADER_SIZE
    } else {
        0
    }
}

/// Block registry over a [`Grower`]-managed region.
///
/// Byte counters track payload sizes exactly as requested, except
/// `total_bytes`, which accrues header and payload for every byte taken
/// from the grower.
pub struct HeapArena<G: Grower> {
    head: *mut BlockHeader,
    tail: *mut BlockHeader,
    free_blocks: usize,
    total_blocks: usize,
    free_bytes: usize,
    total_bytes: usize,
    grower: G,
}

impl<G: Grower> fmt::Debug for HeapArena<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapArena")
            .field("free_blocks", &self.free_blocks)
            .field("total_blocks", &self.total_blocks)
            .field("free_bytes", &self.free_bytes)
            .field("total_bytes", &self.total_bytes)
            .finish()
    }
}

impl<G: Grower> HeapArena<G> {
    /// Creates an empty arena over `grower`.
    ///
    /// # Safety
    /// Callers must make sure the grower is the only object managing its
    /// underlying region for the lifetime of the arena.
    pub const unsafe fn new(grower: G) -> Self {
        HeapArena {
            head: null_mut(),
            tail: null_mut(),
            free_blocks: 0,
            total_blocks: 0,
            free_bytes: 0,
            total_bytes: 0,
            grower,
        }
    }

    pub fn free_blocks(&self) -> usize {
        self.free_blocks
    }

    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    /// Header and payload bytes obtained from the grower so far.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Allocates a block with at least `size` payload bytes.
    ///
    /// # Safety
    /// Assumes `size` is non-zero and that no returned payload pointer is
    /// accessed beyond the size it was requested with.
    #[instrument(level = "info", ret(level = Level::INFO), err(Debug, level = Level::ERROR))]
    pub unsafe fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, ()> {
        debug_assert!(size > 0);
        match self.first_fit(size) {
            Some(block) => {
                debug!(block = ?block.as_ptr(), "Reusing free block.");
                Ok(self.claim_free_block(block, size))
            }
            None if !self.tail.is_null() && (*self.tail).is_free => self.extend_wilderness(size),
            None => self.grow_new_block(size),
        }
    }

    /// Allocates like [`alloc`](HeapArena::alloc) and zero-fills exactly the
    /// `size` bytes that were asked for, leaving any extra reused capacity
    /// untouched.
    ///
    /// # Safety
    /// Same as [`alloc`](HeapArena::alloc).
    pub unsafe fn alloc_zeroed(&mut self, size: usize) -> Result<NonNull<u8>, ()> {
        let payload = self.alloc(size)?;
        ptr::write_bytes(payload.as_ptr(), 0, size);
        Ok(payload)
    }

    /// Releases the block whose payload starts at `payload`, merging it with
    /// any free neighbor. Releasing an already-free block is a no-op.
    ///
    /// # Safety
    /// `payload` must have been produced by this arena and, if the block is
    /// live, the caller must not touch the payload afterwards.
    #[instrument(level = "info")]
    pub unsafe fn dealloc(&mut self, payload: NonNull<u8>) {
        let block = BlockHeader::of_payload(payload);
        if (*block).is_free {
            debug!("Block already free, tolerating double free.");
            return;
        }
        let prev = (*block).prev;
        let next = (*block).next;
        let merge_prev = !prev.is_null() && (*prev).is_free;
        let merge_next = !next.is_null() && (*next).is_free;
        match (merge_prev, merge_next) {
            (true, true) => self.merge_with_both(block),
            (false, true) => self.absorb_next(block),
            (true, false) => self.merge_into_prev(block),
            (false, false) => self.mark_free(block),
        }
    }

    /// Resizes the block at `payload` to `size` payload bytes, preferring
    /// every in-place option over moving data and moving data over growing
    /// the region. Returns the possibly relocated payload pointer; on
    /// failure the old block is left live and untouched.
    ///
    /// # Safety
    /// `payload` must point to a live block of this arena and `size` must be
    /// non-zero.
    #[instrument(level = "info", ret(level = Level::INFO), err(Debug, level = Level::ERROR))]
    pub unsafe fn realloc(&mut self, payload: NonNull<u8>, size: usize) -> Result<NonNull<u8>, ()> {
        debug_assert!(size > 0);
        let block = BlockHeader::of_payload(payload);
        debug_assert!(!(*block).is_free, "Resized blocks should be live.");

        if (*block).total_payload >= size {
            return Ok(self.realloc_in_place(block, size));
        }
        if self.tail == block {
            if self.extend_live_wilderness(block, size).is_ok() {
                return Ok(payload);
            }
            debug!("Wilderness growth failed, trying neighbors.");
        }
        if self.fits_in_prev(block, size) {
            return Ok(self.realloc_into_prev(block, size));
        }
        if self.fits_with_next(block, size) {
            return Ok(self.realloc_absorbing_next(block, size));
        }
        if self.fits_between_neighbors(block, size) {
            return Ok(self.realloc_into_neighbors(block, size));
        }
        self.realloc_elsewhere(block, payload, size)
    }

    /// First block in address order that is free and can hold `size` bytes.
    unsafe fn first_fit(&self, size: usize) -> Option<NonNull<BlockHeader>> {
        let mut cur = self.head;
        while !cur.is_null() {
            if (*cur).is_free && (*cur).total_payload >= size {
                return NonNull::new(cur);
            }
            cur = (*cur).next;
        }
        None
    }

    /// Turns the free block into a live one for `size` bytes, carving off
    /// the tail as a new free block when it is big enough to track.
    unsafe fn claim_free_block(&mut self, block: NonNull<BlockHeader>, size: usize) -> NonNull<u8> {
        let block = block.as_ptr();
        let capacity = (*block).total_payload;
        debug_assert!((*block).is_free && capacity >= size);

        let remainder = split_remainder(capacity, size);
        if remainder < SPLIT_THRESHOLD {
            (*block).is_free = false;
            (*block).active_payload = size;
            self.free_blocks -= 1;
            self.free_bytes -= capacity;
        } else {
            self.carve_remainder(block, size, remainder);
            (*block).is_free = false;
            (*block).active_payload = size;
            self.total_blocks += 1;
            self.free_bytes -= size + HEADER_SIZE;
        }
        BlockHeader::payload_of(block)
    }

    /// Grows the free tail block in place so it can hold `size` bytes.
    #[instrument(level = "debug", ret(level = Level::DEBUG), err(Debug, level = Level::ERROR))]
    unsafe fn extend_wilderness(&mut self, size: usize) -> Result<NonNull<u8>, ()> {
        let tail = self.tail;
        debug_assert!((*tail).is_free);
        let old_capacity = (*tail).total_payload;
        debug_assert!(old_capacity < size);

        let growth = size - old_capacity;
        if self.grower.grow(growth).is_err() {
            error!(growth, "Region could not grow.");
            return Err(());
        }
        self.free_blocks -= 1;
        self.free_bytes -= old_capacity;
        self.total_bytes += growth;
        (*tail).is_free = false;
        (*tail).total_payload = size;
        (*tail).active_payload = size;
        Ok(BlockHeader::payload_of(tail))
    }

    /// Appends a fresh live block of `size` payload bytes at the old end of
    /// the region.
    #[instrument(level = "debug", ret(level = Level::DEBUG), err(Debug, level = Level::ERROR))]
    unsafe fn grow_new_block(&mut self, size: usize) -> Result<NonNull<u8>, ()> {
        let total_len = HEADER_SIZE + size;
        let old_end = match self.grower.grow(total_len) {
            Ok(end) => end,
            Err(()) => {
                error!(total_len, "Region could not grow.");
                return Err(());
            }
        };
        let block: *mut BlockHeader = old_end.as_ptr().cast();
        block.write(BlockHeader {
            total_payload: size,
            active_payload: size,
            is_free: false,
            next: null_mut(),
            prev: self.tail,
        });
        if self.head.is_null() {
            self.head = block;
        } else {
            (*self.tail).next = block;
        }
        self.tail = block;
        self.total_blocks += 1;
        self.total_bytes += total_len;
        Ok(BlockHeader::payload_of(block))
    }

    /// Carves the tail of `block` into a new free block of `remainder`
    /// payload bytes, leaving `block` with exactly `new_size`. Only the two
    /// headers and the list structure are touched; callers settle the
    /// counters, which differ per call site.
    unsafe fn carve_remainder(
        &mut self,
        block: *mut BlockHeader,
        new_size: usize,
        remainder: usize,
    ) {
        debug_assert!(remainder >= SPLIT_THRESHOLD);
        let total_payload = (*block).total_payload;
        debug_assert_eq!(total_payload, new_size + HEADER_SIZE + remainder);

        let rest: *mut BlockHeader = block.cast::<u8>().add(HEADER_SIZE + new_size).cast();
        let next = (*block).next;
        rest.write(BlockHeader {
            total_payload: remainder,
            active_payload: 0,
            is_free: true,
            next,
            prev: block,
        });
        if !next.is_null() {
            (*next).prev = rest;
        }
        (*block).next = rest;
        (*block).total_payload = new_size;
        if self.tail == block {
            self.tail = rest;
        }
        debug!(remainder, rest = ?rest, "Carved free remainder.");
    }

    unsafe fn mark_free(&mut self, block: *mut BlockHeader) {
        (*block).is_free = true;
        (*block).active_payload = 0;
        self.free_blocks += 1;
        self.free_bytes += (*block).total_payload;
    }

    /// The block absorbs its free successor and becomes free itself; the
    /// successor's header turns into payload of the merged block.
    unsafe fn absorb_next(&mut self, block: *mut BlockHeader) {
        let succ = (*block).next;
        debug_assert!(!succ.is_null() && (*succ).is_free);
        let succ_next = (*succ).next;

        if !succ_next.is_null() {
            (*succ_next).prev = block;
        }
        (*block).next = succ_next;
        if self.tail == succ {
            self.tail = block;
        }
        self.total_blocks -= 1;
        self.free_bytes += HEADER_SIZE + (*block).total_payload;
        (*block).is_free = true;
        (*block).total_payload += HEADER_SIZE + (*succ).total_payload;
        (*block).active_payload = 0;
    }

    /// The free predecessor absorbs the block; the block's header turns into
    /// payload of the predecessor.
    unsafe fn merge_into_prev(&mut self, block: *mut BlockHeader) {
        let pred = (*block).prev;
        debug_assert!(!pred.is_null() && (*pred).is_free);
        let next = (*block).next;

        if !next.is_null() {
            (*next).prev = pred;
        }
        (*pred).next = next;
        if self.tail == block {
            self.tail = pred;
        }
        (*pred).total_payload += HEADER_SIZE + (*block).total_payload;
        self.total_blocks -= 1;
        self.free_bytes += HEADER_SIZE + (*block).total_payload;
    }

    /// Both neighbors are free: merge right, then left, then undo the double
    /// count of the middle block the two merges produced.
    unsafe fn merge_with_both(&mut self, block: *mut BlockHeader) {
        self.absorb_next(block);
        let middle_total = (*block).total_payload;
        self.merge_into_prev(block);
        self.free_blocks -= 1;
        self.free_bytes -= middle_total;
    }

    /// The block already has the capacity; trim it and keep the pointer.
    unsafe fn realloc_in_place(&mut self, block: *mut BlockHeader, new_size: usize) -> NonNull<u8> {
        let remainder = split_remainder((*block).total_payload, new_size);
        if remainder >= SPLIT_THRESHOLD {
            self.carve_remainder(block, new_size, remainder);
            self.total_blocks += 1;
            self.free_blocks += 1;
            self.free_bytes += remainder;
        }
        (*block).active_payload = new_size;
        BlockHeader::payload_of(block)
    }

    /// Grows the live tail block in place by advancing the region end.
    #[instrument(level = "debug", err(Debug, level = Level::DEBUG))]
    unsafe fn extend_live_wilderness(
        &mut self,
        block: *mut BlockHeader,
        new_size: usize,
    ) -> Result<(), ()> {
        debug_assert!(self.tail == block);
        let growth = new_size - (*block).total_payload;
        self.grower.grow(growth).map(|_| ())?;
        (*block).total_payload = new_size;
        (*block).active_payload = new_size;
        self.total_bytes += growth;
        Ok(())
    }

    unsafe fn fits_in_prev(&self, block: *mut BlockHeader, new_size: usize) -> bool {
        let pred = (*block).prev;
        if pred.is_null() || !(*pred).is_free {
            return false;
        }
        (*pred).total_payload + HEADER_SIZE + (*block).total_payload >= new_size
    }

    unsafe fn fits_with_next(&self, block: *mut BlockHeader, new_size: usize) -> bool {
        let succ = (*block).next;
        if succ.is_null() || !(*succ).is_free {
            return false;
        }
        (*block).total_payload + HEADER_SIZE + (*succ).total_payload >= new_size
    }

    unsafe fn fits_between_neighbors(&self, block: *mut BlockHeader, new_size: usize) -> bool {
        let pred = (*block).prev;
        let succ = (*block).next;
        if pred.is_null() || succ.is_null() || !(*pred).is_free || !(*succ).is_free {
            return false;
        }
        (*pred).total_payload + HEADER_SIZE + (*block).total_payload + HEADER_SIZE
            + (*succ).total_payload
            >= new_size
    }

    /// Slides the block into its free predecessor. The payload moves to the
    /// predecessor's payload address, so the returned pointer differs from
    /// the old one.
    unsafe fn realloc_into_prev(&mut self, block: *mut BlockHeader, new_size: usize) -> NonNull<u8> {
        let pred = (*block).prev;
        let pred_capacity = (*pred).total_payload;
        let moved_len = (*block).total_payload;
        let combined = pred_capacity + HEADER_SIZE + moved_len;
        let next = (*block).next;

        (*pred).next = next;
        if self.tail == block {
            self.tail = pred;
        } else {
            (*next).prev = pred;
        }
        (*pred).is_free = false;
        (*pred).total_payload = combined;
        (*pred).active_payload = new_size;

        // Overlap-safe copy; must run before any remainder header is
        // written into the not-yet-moved bytes.
        let old_payload = BlockHeader::payload_of(block);
        let new_payload = BlockHeader::payload_of(pred);
        ptr::copy(old_payload.as_ptr(), new_payload.as_ptr(), moved_len);

        let remainder = split_remainder(combined, new_size);
        if remainder >= SPLIT_THRESHOLD {
            self.carve_remainder(pred, new_size, remainder);
            self.free_bytes -= pred_capacity;
            self.free_bytes += remainder;
        } else {
            self.total_blocks -= 1;
            self.free_blocks -= 1;
            self.free_bytes -= pred_capacity;
        }
        new_payload
    }

    /// Absorbs the free successor into the block; the payload stays put.
    unsafe fn realloc_absorbing_next(
        &mut self,
        block: *mut BlockHeader,
        new_size: usize,
    ) -> NonNull<u8> {
        let succ = (*block).next;
        let succ_capacity = (*succ).total_payload;
        let combined = (*block).total_payload + HEADER_SIZE + succ_capacity;
        let succ_next = (*succ).next;

        (*block).next = succ_next;
        if self.tail == succ {
            self.tail = block;
        } else {
            (*succ_next).prev = block;
        }
        (*block).total_payload = combined;
        (*block).active_payload = new_size;

        let remainder = split_remainder(combined, new_size);
        if remainder >= SPLIT_THRESHOLD {
            self.carve_remainder(block, new_size, remainder);
            self.free_bytes -= succ_capacity;
            self.free_bytes += remainder;
        } else {
            self.total_blocks -= 1;
            self.free_blocks -= 1;
            self.free_bytes -= succ_capacity;
        }
        BlockHeader::payload_of(block)
    }

    /// Merges predecessor, block, and successor into the predecessor and
    /// moves the payload there.
    unsafe fn realloc_into_neighbors(
        &mut self,
        block: *mut BlockHeader,
        new_size: usize,
    ) -> NonNull<u8> {
        let pred = (*block).prev;
        let succ = (*block).next;
        let pred_capacity = (*pred).total_payload;
        let succ_capacity = (*succ).total_payload;
        let moved_len = (*block).total_payload;
        let combined =
            pred_capacity + HEADER_SIZE + moved_len + HEADER_SIZE + succ_capacity;
        let succ_next = (*succ).next;

        (*pred).next = succ_next;
        if self.tail == succ {
            self.tail = pred;
        } else {
            (*succ_next).prev = pred;
        }
        (*pred).is_free = false;
        (*pred).total_payload = combined;
        (*pred).active_payload = new_size;

        let old_payload = BlockHeader::payload_of(block);
        let new_payload = BlockHeader::payload_of(pred);
        ptr::copy(old_payload.as_ptr(), new_payload.as_ptr(), moved_len);

        let remainder = split_remainder(combined, new_size);
        if remainder >= SPLIT_THRESHOLD {
            self.carve_remainder(pred, new_size, remainder);
            self.total_blocks -= 1;
            self.free_blocks -= 1;
            self.free_bytes -= pred_capacity + succ_capacity;
            self.free_bytes += remainder;
        } else {
            self.total_blocks -= 2;
            self.free_blocks -= 2;
            self.free_bytes -= pred_capacity + succ_capacity;
        }
        new_payload
    }

    /// Last resort: claim or append a different block, move the payload and
    /// release the old block. Failure to obtain the new block leaves the old
    /// one untouched.
    #[instrument(level = "debug", ret(level = Level::DEBUG), err(Debug, level = Level::DEBUG))]
    unsafe fn realloc_elsewhere(
        &mut self,
        block: *mut BlockHeader,
        old_payload: NonNull<u8>,
        new_size: usize,
    ) -> Result<NonNull<u8>, ()> {
        let moved_len = (*block).total_payload;
        let new_payload = match self.first_fit(new_size) {
            Some(free_block) => self.claim_free_block(free_block, new_size),
            None => self.grow_new_block(new_size)?,
        };
        ptr::copy(old_payload.as_ptr(), new_payload.as_ptr(), moved_len);
        self.dealloc(old_payload);
        Ok(new_payload)
    }
}

#[cfg(test)]
mod tests;
