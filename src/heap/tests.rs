use super::*;
use crate::growers::arena_grower::ArenaGrower;

unsafe fn fill(payload: NonNull<u8>, len: usize, byte: u8) {
    ptr::write_bytes(payload.as_ptr(), byte, len);
}

unsafe fn assert_filled(payload: NonNull<u8>, len: usize, byte: u8) {
    for i in 0..len {
        assert_eq!(*payload.as_ptr().add(i), byte, "byte {i} differs");
    }
}

unsafe fn total_payload_of(payload: NonNull<u8>) -> usize {
    (*BlockHeader::of_payload(payload)).total_payload
}

#[test]
fn reuse_without_split() {
    let mut buf = [0_u8; 4096];
    let mut heap = unsafe { HeapArena::new(ArenaGrower::new(buf.as_mut_ptr(), buf.len())) };
    unsafe {
        let p1 = heap.alloc(200).unwrap();
        assert_eq!(heap.total_blocks(), 1);
        assert_eq!(heap.total_bytes(), HEADER_SIZE + 200);

        heap.dealloc(p1);
        assert_eq!(heap.free_blocks(), 1);
        assert_eq!(heap.free_bytes(), 200);

        // 200 - 100 - HEADER_SIZE is below the split threshold, so the
        // whole capacity is handed back.
        let p2 = heap.alloc(100).unwrap();
        assert_eq!(p2, p1);
        assert_eq!(heap.free_blocks(), 0);
        assert_eq!(heap.free_bytes(), 0);
        assert_eq!(heap.total_blocks(), 1);
        assert_eq!(total_payload_of(p2), 200);
    }
}

#[test]
fn split_keeps_remainder_at_threshold() {
    let mut buf = [0_u8; 4096];
    let mut heap = unsafe { HeapArena::new(ArenaGrower::new(buf.as_mut_ptr(), buf.len())) };
    unsafe {
        let p1 = heap.alloc(400).unwrap();
        heap.dealloc(p1);

        let size = 400 - HEADER_SIZE - 128;
        let p2 = heap.alloc(size).unwrap();
        assert_eq!(p2, p1);
        assert_eq!(heap.total_blocks(), 2);
        assert_eq!(heap.free_blocks(), 1);
        assert_eq!(heap.free_bytes(), 128);
        assert_eq!(total_payload_of(p2), size);

        // The carved remainder is a reusable block right after p2.
        let p3 = heap.alloc(100).unwrap();
        assert_eq!(p3.as_ptr(), p2.as_ptr().add(size + HEADER_SIZE));
        assert_eq!(heap.free_blocks(), 0);
    }
}

#[test]
fn split_skipped_below_threshold() {
    let mut buf = [0_u8; 4096];
    let mut heap = unsafe { HeapArena::new(ArenaGrower::new(buf.as_mut_ptr(), buf.len())) };
    unsafe {
        let p1 = heap.alloc(400).unwrap();
        heap.dealloc(p1);

        // One byte more and the remainder drops to 127: no split.
        let size = 400 - HEADER_SIZE - 127;
        let p2 = heap.alloc(size).unwrap();
        assert_eq!(p2, p1);
        assert_eq!(heap.total_blocks(), 1);
        assert_eq!(heap.free_blocks(), 0);
        assert_eq!(heap.free_bytes(), 0);
        assert_eq!(total_payload_of(p2), 400);
    }
}

#[test]
fn wilderness_grows_in_place() {
    let mut buf = [0_u8; 4096];
    let mut heap = unsafe { HeapArena::new(ArenaGrower::new(buf.as_mut_ptr(), buf.len())) };
    unsafe {
        let p1 = heap.alloc(50).unwrap();
        heap.dealloc(p1);

        let p2 = heap.alloc(500).unwrap();
        assert_eq!(p2, p1);
        assert_eq!(heap.total_blocks(), 1);
        assert_eq!(heap.free_blocks(), 0);
        assert_eq!(heap.total_bytes(), HEADER_SIZE + 500);
    }
}

#[test]
fn wilderness_preferred_over_fresh_block() {
    let mut buf = [0_u8; 4096];
    let mut heap = unsafe { HeapArena::new(ArenaGrower::new(buf.as_mut_ptr(), buf.len())) };
    unsafe {
        let a = heap.alloc(100).unwrap();
        let b = heap.alloc(64).unwrap();
        heap.dealloc(b);

        // No free block fits 200 but the free tail only needs 136 more.
        let p = heap.alloc(200).unwrap();
        assert_eq!(p, b);
        assert_eq!(heap.total_blocks(), 2);
        assert_eq!(heap.free_blocks(), 0);
        assert_eq!(heap.total_bytes(), (HEADER_SIZE + 100) + (HEADER_SIZE + 200));
        heap.dealloc(a);
    }
}

#[test]
fn free_coalesces_with_predecessor() {
    let mut buf = [0_u8; 4096];
    let mut heap = unsafe { HeapArena::new(ArenaGrower::new(buf.as_mut_ptr(), buf.len())) };
    unsafe {
        let a = heap.alloc(64).unwrap();
        let b = heap.alloc(64).unwrap();
        let _guard = heap.alloc(64).unwrap();

        heap.dealloc(a);
        heap.dealloc(b);
        assert_eq!(heap.free_blocks(), 1);
        assert_eq!(heap.free_bytes(), 128 + HEADER_SIZE);
        assert_eq!(heap.total_blocks(), 2);
    }
}

#[test]
fn free_coalesces_with_successor() {
    let mut buf = [0_u8; 4096];
    let mut heap = unsafe { HeapArena::new(ArenaGrower::new(buf.as_mut_ptr(), buf.len())) };
    unsafe {
        let _a = heap.alloc(64).unwrap();
        let b = heap.alloc(64).unwrap();
        let c = heap.alloc(64).unwrap();

        heap.dealloc(c);
        heap.dealloc(b);
        assert_eq!(heap.free_blocks(), 1);
        assert_eq!(heap.free_bytes(), 128 + HEADER_SIZE);
        assert_eq!(heap.total_blocks(), 2);

        // The merged block is found first-fit and handed back whole.
        let p = heap.alloc(120).unwrap();
        assert_eq!(p, b);
        assert_eq!(heap.free_blocks(), 0);
        assert_eq!(heap.free_bytes(), 0);
    }
}

#[test]
fn free_coalesces_both_sides() {
    let mut buf = [0_u8; 4096];
    let mut heap = unsafe { HeapArena::new(ArenaGrower::new(buf.as_mut_ptr(), buf.len())) };
    unsafe {
        let a = heap.alloc(64).unwrap();
        let b = heap.alloc(64).unwrap();
        let c = heap.alloc(64).unwrap();
        let d = heap.alloc(64).unwrap();

        heap.dealloc(a);
        heap.dealloc(c);
        assert_eq!(heap.free_blocks(), 2);
        assert_eq!(heap.free_bytes(), 128);

        heap.dealloc(b);
        assert_eq!(heap.free_blocks(), 1);
        assert_eq!(heap.free_bytes(), 192 + 2 * HEADER_SIZE);
        assert_eq!(heap.total_blocks(), 2);

        // d is untouched and the merged block is reusable as one piece.
        let p = heap.alloc(192 + 2 * HEADER_SIZE).unwrap();
        assert_eq!(p, a);
        assert_eq!(heap.free_blocks(), 0);
        heap.dealloc(d);
    }
}

#[test]
fn double_free_is_tolerated() {
    let mut buf = [0_u8; 4096];
    let mut heap = unsafe { HeapArena::new(ArenaGrower::new(buf.as_mut_ptr(), buf.len())) };
    unsafe {
        let a = heap.alloc(64).unwrap();
        let _guard = heap.alloc(64).unwrap();
        heap.dealloc(a);
        let (free_blocks, free_bytes) = (heap.free_blocks(), heap.free_bytes());
        heap.dealloc(a);
        assert_eq!(heap.free_blocks(), free_blocks);
        assert_eq!(heap.free_bytes(), free_bytes);
    }
}

#[test]
fn alloc_zeroed_clears_only_requested_span() {
    let mut buf = [0_u8; 4096];
    let mut heap = unsafe { HeapArena::new(ArenaGrower::new(buf.as_mut_ptr(), buf.len())) };
    unsafe {
        let p = heap.alloc(300).unwrap();
        fill(p, 300, 0xAA);
        heap.dealloc(p);

        let q = heap.alloc_zeroed(250).unwrap();
        assert_eq!(q, p);
        assert_filled(q, 250, 0);
        // The reused capacity past the request keeps its stale bytes.
        assert_filled(NonNull::new_unchecked(q.as_ptr().add(250)), 50, 0xAA);
    }
}

#[test]
fn realloc_with_current_size_is_noop() {
    let mut buf = [0_u8; 4096];
    let mut heap = unsafe { HeapArena::new(ArenaGrower::new(buf.as_mut_ptr(), buf.len())) };
    unsafe {
        let p = heap.alloc(100).unwrap();
        let total_bytes = heap.total_bytes();
        let q = heap.realloc(p, 100).unwrap();
        assert_eq!(q, p);
        assert_eq!(heap.total_blocks(), 1);
        assert_eq!(heap.free_blocks(), 0);
        assert_eq!(heap.total_bytes(), total_bytes);
    }
}

#[test]
fn realloc_shrink_carves_remainder() {
    let mut buf = [0_u8; 4096];
    let mut heap = unsafe { HeapArena::new(ArenaGrower::new(buf.as_mut_ptr(), buf.len())) };
    unsafe {
        let p = heap.alloc(300).unwrap();
        fill(p, 300, 0x42);

        let q = heap.realloc(p, 100).unwrap();
        assert_eq!(q, p);
        assert_filled(q, 100, 0x42);
        assert_eq!(total_payload_of(q), 100);
        assert_eq!(heap.total_blocks(), 2);
        assert_eq!(heap.free_blocks(), 1);
        assert_eq!(heap.free_bytes(), 300 - 100 - HEADER_SIZE);

        // The remainder is the new wilderness block.
        let r = heap.alloc(150).unwrap();
        assert_eq!(r.as_ptr(), q.as_ptr().add(100 + HEADER_SIZE));
    }
}

#[test]
fn realloc_grows_wilderness_in_place() {
    let mut buf = [0_u8; 4096];
    let mut heap = unsafe { HeapArena::new(ArenaGrower::new(buf.as_mut_ptr(), buf.len())) };
    unsafe {
        let p = heap.alloc(100).unwrap();
        fill(p, 100, 0x17);
        let q = heap.realloc(p, 400).unwrap();
        assert_eq!(q, p);
        assert_filled(q, 100, 0x17);
        assert_eq!(heap.total_blocks(), 1);
        assert_eq!(heap.total_bytes(), HEADER_SIZE + 400);
    }
}

#[test]
fn realloc_absorbs_free_successor() {
    let mut buf = [0_u8; 4096];
    let mut heap = unsafe { HeapArena::new(ArenaGrower::new(buf.as_mut_ptr(), buf.len())) };
    unsafe {
        let p1 = heap.alloc(100).unwrap();
        let p2 = heap.alloc(100).unwrap();
        fill(p1, 100, 0x33);
        heap.dealloc(p2);

        let q = heap.realloc(p1, 180).unwrap();
        assert_eq!(q, p1);
        assert_filled(q, 100, 0x33);
        assert_eq!(total_payload_of(q), 200 + HEADER_SIZE);
        assert_eq!(heap.total_blocks(), 1);
        assert_eq!(heap.free_blocks(), 0);
        assert_eq!(heap.free_bytes(), 0);
        assert_eq!(heap.total_bytes(), 2 * (HEADER_SIZE + 100));
    }
}

#[test]
fn realloc_slides_into_free_predecessor() {
    let mut buf = [0_u8; 4096];
    let mut heap = unsafe { HeapArena::new(ArenaGrower::new(buf.as_mut_ptr(), buf.len())) };
    unsafe {
        let a = heap.alloc(150).unwrap();
        let b = heap.alloc(100).unwrap();
        let _guard = heap.alloc(50).unwrap();
        fill(b, 100, 0x77);
        heap.dealloc(a);

        let q = heap.realloc(b, 250).unwrap();
        assert_eq!(q, a);
        assert_filled(q, 100, 0x77);
        assert_eq!(total_payload_of(q), 250 + HEADER_SIZE);
        assert_eq!(heap.total_blocks(), 2);
        assert_eq!(heap.free_blocks(), 0);
        assert_eq!(heap.free_bytes(), 0);
    }
}

#[test]
fn realloc_merges_both_neighbors() {
    let mut buf = [0_u8; 4096];
    let mut heap = unsafe { HeapArena::new(ArenaGrower::new(buf.as_mut_ptr(), buf.len())) };
    unsafe {
        let a = heap.alloc(100).unwrap();
        let b = heap.alloc(100).unwrap();
        let c = heap.alloc(200).unwrap();
        let _guard = heap.alloc(50).unwrap();
        fill(b, 100, 0x55);
        heap.dealloc(a);
        heap.dealloc(c);
        assert_eq!(heap.free_bytes(), 300);

        // Neither neighbor suffices alone; together they do.
        let q = heap.realloc(b, 400).unwrap();
        assert_eq!(q, a);
        assert_filled(q, 100, 0x55);
        assert_eq!(total_payload_of(q), 400 + 2 * HEADER_SIZE);
        assert_eq!(heap.total_blocks(), 2);
        assert_eq!(heap.free_blocks(), 0);
        assert_eq!(heap.free_bytes(), 0);
    }
}

#[test]
fn realloc_relocates_when_stuck() {
    let mut buf = [0_u8; 4096];
    let mut heap = unsafe { HeapArena::new(ArenaGrower::new(buf.as_mut_ptr(), buf.len())) };
    unsafe {
        let a = heap.alloc(100).unwrap();
        let _b = heap.alloc(50).unwrap();
        fill(a, 100, 0x11);

        let q = heap.realloc(a, 300).unwrap();
        assert_ne!(q, a);
        assert_filled(q, 100, 0x11);
        assert_eq!(heap.total_blocks(), 3);
        assert_eq!(heap.free_blocks(), 1);
        assert_eq!(heap.free_bytes(), 100);
    }
}

#[test]
fn realloc_failure_leaves_block_alive() {
    let mut buf = [0_u8; HEADER_SIZE + 100];
    let len = buf.len();
    let mut heap = unsafe { HeapArena::new(ArenaGrower::new(buf.as_mut_ptr(), len)) };
    unsafe {
        let p = heap.alloc(100).unwrap();
        fill(p, 100, 0x99);

        assert!(heap.realloc(p, 200).is_err());
        assert_filled(p, 100, 0x99);
        assert_eq!(heap.total_blocks(), 1);
        assert_eq!(heap.free_blocks(), 0);

        heap.dealloc(p);
        assert_eq!(heap.free_blocks(), 1);
        assert_eq!(heap.free_bytes(), 100);
    }
}

#[test]
fn alloc_failure_keeps_counters() {
    let mut buf = [0_u8; 256];
    let len = buf.len();
    let mut heap = unsafe { HeapArena::new(ArenaGrower::new(buf.as_mut_ptr(), len)) };
    unsafe {
        assert!(heap.alloc(4096).is_err());
        assert_eq!(heap.total_blocks(), 0);
        assert_eq!(heap.total_bytes(), 0);

        let p = heap.alloc(64).unwrap();
        assert_eq!(heap.total_blocks(), 1);
        heap.dealloc(p);
    }
}
