//! A two-tier dynamic memory allocator written in Rust.
//!
//! This crate provides a malloc-style four-call interface (allocate, zeroed
//! allocate, free, resize) backed by two independent arenas: small requests
//! share one contiguous region at the end of the process image, while
//! requests of 128 KiB and above each get their own anonymous mapping. A set
//! of read-only counters exposes the allocator's bookkeeping for inspection.
//!
//! # Usage
//! ```no_run
//! use tiered_malloc::TieredMalloc;
//!
//! let allocator = unsafe { TieredMalloc::new() };
//!
//! let p = allocator.alloc(256);
//! assert!(!p.is_null());
//! assert_eq!(allocator.total_blocks(), 1);
//!
//! let p = unsafe { allocator.realloc(p, 512) };
//! unsafe { allocator.free(p) };
//! assert_eq!(allocator.free_blocks(), 1);
//! ```
//!
//! Construction is `unsafe` because the allocator assumes it is the only
//! thing moving the program break for its lifetime. Every failure, whether a
//! bad request size or refused memory, surfaces as a null pointer; nothing
//! panics and nothing retries.
//!
//! # Mode of operation
//!
//! ## Blocks
//! The heap region is divided into blocks, each a fixed metadata header
//! followed by a payload. The pointer handed to callers addresses the first
//! payload byte; the header sits immediately before it and records the
//! payload capacity, the portion currently in use, the liveness flag, and
//! the list links. Block positions are determined entirely by the payload
//! sizes that came before them, so nothing is rounded and the counters
//! account for every byte exactly.
//!
//! ## The heap arena
//! All blocks below the mapping threshold live on one doubly linked list in
//! ascending address order. Allocation scans it first-fit; an oversized hit
//! is split when the cut-off tail is worth tracking (128 payload bytes or
//! more), otherwise the whole capacity is handed out. When nothing fits,
//! the allocator prefers enlarging a free tail block in place (the
//! wilderness optimization) over appending a brand new block at the break.
//! Freeing marks the block and immediately merges it with any free
//! neighbor, so two free blocks are never adjacent. Resizing walks a
//! decision tree that tries every option that keeps the data in place
//! before any option that moves it: the block itself, growing the tail,
//! absorbing the successor, sliding into the predecessor, taking both
//! neighbors, and finally relocating.
//!
//! ## The mapped arena
//! Blocks of 128 KiB and above are one private anonymous mapping each,
//! sized to hold the header and the payload. They are never linked into a
//! list and never split or coalesce; free unmaps the whole region and
//! resize is always map-copy-unmap. Routing between the arenas happens per
//! call: by requested size on allocation and resize, by the size stored in
//! the header on free. A resize whose new size falls on the other side of
//! the threshold migrates the block, releasing the old one through the
//! arena that owns it.
//!
//! ## Growers and mappers
//! The arenas do not talk to the operating system directly. The heap arena
//! is generic over a [`Grower`] (anything that acts as a contiguous region
//! whose end can be pushed forward) and the mapped arena over a
//! [`PageMapper`] that hands out and reclaims independent zeroed regions.
//! Production code uses [`BrkGrower`] and [`MmapMapper`] over `brk` and
//! `mmap`; tests construct a fresh allocator per case over plain buffers.
//!
//! [`Grower`]: growers::Grower
//! [`PageMapper`]: mappers::PageMapper
//! [`BrkGrower`]: growers::BrkGrower
//! [`MmapMapper`]: mappers::MmapMapper

pub use crate::allocator::{TieredMalloc, MAX_REQUEST, MMAP_THRESHOLD};

pub mod allocator;
pub mod growers;
mod header;
pub mod heap;
pub mod mapped;
pub mod mappers;
mod util;
