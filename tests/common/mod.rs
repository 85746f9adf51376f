//! Shared fixture and heap-consistency checker for the integration tests.
#![allow(dead_code)]

use core::mem::size_of;
use core::ptr::NonNull;

use segfit::{Allocator, BufferSource, MIN_BLOCK_SIZE, size_class};

/// Page size used throughout the integration tests. Small enough that the
/// expected block sizes can be worked out by hand.
pub const PAGE: usize = 2048;

#[repr(align(32))]
#[derive(Clone)]
struct Page([u8; PAGE]);

/// An allocator over a leaked arena of exactly `pages` pages.
pub fn allocator(pages: usize) -> Allocator<BufferSource> {
    let arena = vec![Page([0; PAGE]); pages].leak();
    let base = NonNull::new(arena.as_mut_ptr().cast::<u8>()).unwrap();
    // SAFETY: the arena is leaked, so it outlives the allocator, and nothing
    // else ever touches it.
    let source = unsafe { BufferSource::new(base, pages * PAGE, PAGE) };
    Allocator::new(source)
}

/// Sizes of every bucket-resident free block, in registry order.
pub fn free_sizes(heap: &Allocator<BufferSource>) -> Vec<usize> {
    heap.free_blocks().map(|f| f.size).collect()
}

/// Walks the whole heap and cross-checks it against the free lists.
pub fn check_invariants(heap: &Allocator<BufferSource>) {
    let blocks: Vec<_> = heap.blocks().collect();
    if blocks.is_empty() {
        assert!(heap.heap_range().is_none());
        return;
    }

    let range = heap.heap_range().unwrap();
    let prologue = blocks.first().unwrap();
    assert_eq!(prologue.size, MIN_BLOCK_SIZE);
    assert!(prologue.allocated);
    assert!(prologue.addr - range.start < MIN_BLOCK_SIZE);
    let epilogue = blocks.last().unwrap();
    assert_eq!(epilogue.size, 0);
    assert!(epilogue.allocated);
    // The blocks tile everything between the leading pad and the heap end.
    assert_eq!(epilogue.addr + size_of::<usize>(), range.end);

    for pair in blocks.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        assert_eq!(b.addr, a.addr + a.size, "blocks must tile the heap");
        assert_eq!(
            b.prev_allocated, a.allocated,
            "prev_alloc bit out of sync at {:#x}",
            b.addr
        );
        assert!(
            a.allocated || b.allocated,
            "uncoalesced free neighbors at {:#x}",
            a.addr
        );
        if b.size != 0 {
            assert!(b.size >= MIN_BLOCK_SIZE && b.size % MIN_BLOCK_SIZE == 0);
        }
    }

    // Every free block in the walk is bucket resident, in the right bucket.
    let listed: Vec<_> = heap.free_blocks().collect();
    let walk_free: Vec<_> = blocks.iter().filter(|b| !b.allocated && b.size != 0).collect();
    assert_eq!(listed.len(), walk_free.len());
    for f in &listed {
        assert_eq!(f.class, size_class(f.size));
        assert!(
            walk_free
                .iter()
                .any(|b| b.size == f.size && b.addr + size_of::<usize>() == f.payload),
            "bucket-resident block missing from the heap walk"
        );
    }
}
