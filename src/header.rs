//! Defines the [`BlockHeader`] record and associated constants and functions.

use core::fmt;
use core::mem::size_of;
use core::ptr::NonNull;

pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Bookkeeping record stored immediately before every payload.
///
/// `total_payload` is the capacity of the payload region and
/// `active_payload` the portion the client asked for at the most recent
/// allocation or resize; a free block has `active_payload == 0`. The `next`
/// and `prev` links thread heap-arena blocks into a single address-ordered
/// list; mapped blocks leave them null.
///
/// Payload sizes are tracked exactly as requested, so a header starts
/// wherever the preceding payload ends and may land at any byte address.
/// The record is therefore packed, and all access goes through raw
/// pointers; taking a reference to a field would be unsound.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct BlockHeader {
    pub(crate) total_payload: usize,
    pub(crate) active_payload: usize,
    pub(crate) is_free: bool,
    pub(crate) next: *mut BlockHeader,
    pub(crate) prev: *mut BlockHeader,
}

impl BlockHeader {
    /// Returns the first payload byte of the block headed by `block`.
    ///
    /// # Safety
    /// `block` must point to the header of a block whose payload region
    /// exists, i.e. the header is followed by at least one mapped byte.
    #[inline(always)]
    pub(crate) unsafe fn payload_of(block: *mut BlockHeader) -> NonNull<u8> {
        NonNull::new_unchecked(block.cast::<u8>().add(HEADER_SIZE))
    }

    /// Returns the header of the block whose payload starts at `payload`.
    ///
    /// # Safety
    /// `payload` must be a pointer previously produced by this allocator,
    /// so that a header actually precedes it.
    #[inline(always)]
    pub(crate) unsafe fn of_payload(payload: NonNull<u8>) -> *mut BlockHeader {
        payload.as_ptr().sub(HEADER_SIZE).cast()
    }
}

impl fmt::Debug for BlockHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Copy out of the packed record; the derive would borrow fields.
        let BlockHeader {
            total_payload,
            active_payload,
            is_free,
            next,
            prev,
        } = *self;
        f.debug_struct("BlockHeader")
            .field("total_payload", &total_payload)
            .field("active_payload", &active_payload)
            .field("is_free", &is_free)
            .field("next", &next)
            .field("prev", &prev)
            .finish()
    }
}
