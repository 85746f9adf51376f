//! Scenarios for alignment-constrained allocation.

mod common;

use common::{allocator, check_invariants, free_sizes};
use segfit::{AllocError, MIN_BLOCK_SIZE};

#[test]
fn rejects_alignments_below_the_minimum_or_not_a_power_of_two() {
    let mut heap = allocator(1);
    assert_eq!(heap.aligned_allocate(100, 16), Err(AllocError::InvalidArgument));
    assert_eq!(heap.aligned_allocate(100, 48), Err(AllocError::InvalidArgument));
    assert_eq!(heap.aligned_allocate(100, 0), Err(AllocError::InvalidArgument));
    // Nothing was mapped by the rejected calls.
    assert!(heap.heap_range().is_none());
}

#[test]
fn zero_size_allocates_nothing() {
    let mut heap = allocator(1);
    assert_eq!(heap.aligned_allocate(0, 64), Ok(None));
    assert!(heap.heap_range().is_none());
}

#[test]
fn minimum_alignment_trims_the_padding_back_off() {
    let mut heap = allocator(1);
    let p = heap.aligned_allocate(300, MIN_BLOCK_SIZE).unwrap().unwrap();
    assert_eq!(p.as_ptr() as usize % MIN_BLOCK_SIZE, 0);

    // Every payload is already 32-aligned, so only a 320-byte block remains
    // allocated and all the padding went back to the wilderness.
    assert_eq!(free_sizes(&heap), vec![1664]);
    check_invariants(&heap);
}

#[test]
fn stricter_alignments_are_honored() {
    for align in [64usize, 128, 256] {
        let mut heap = allocator(1);
        let p = heap.aligned_allocate(300, align).unwrap().unwrap();
        assert_eq!(p.as_ptr() as usize % align, 0);
        unsafe {
            p.as_ptr().write_bytes(0x7E, 300);
            assert_eq!(p.as_ptr().add(299).read(), 0x7E);
        }
        check_invariants(&heap);

        unsafe { heap.free(p) };
        assert_eq!(free_sizes(&heap), vec![1984]);
        check_invariants(&heap);
    }
}

#[test]
fn alignments_up_to_a_page_are_honored() {
    let mut heap = allocator(4);
    let p = heap.aligned_allocate(100, 1024).unwrap().unwrap();
    assert_eq!(p.as_ptr() as usize % 1024, 0);
    check_invariants(&heap);
}

#[test]
fn carved_fragments_interleave_with_ordinary_traffic() {
    let mut heap = allocator(2);
    let a = heap.allocate(200).unwrap().unwrap();
    let p = heap.aligned_allocate(64, 128).unwrap().unwrap();
    let b = heap.allocate(40).unwrap().unwrap();
    assert_eq!(p.as_ptr() as usize % 128, 0);
    unsafe {
        a.as_ptr().write_bytes(0x01, 200);
        p.as_ptr().write_bytes(0x02, 64);
        b.as_ptr().write_bytes(0x03, 40);
    }
    check_invariants(&heap);

    unsafe {
        assert_eq!(a.as_ptr().add(199).read(), 0x01);
        assert_eq!(p.as_ptr().add(63).read(), 0x02);
        assert_eq!(b.as_ptr().add(39).read(), 0x03);
        heap.free(p);
        heap.free(a);
        heap.free(b);
    }
    assert_eq!(free_sizes(&heap), vec![1984]);
    check_invariants(&heap);
}

#[test]
fn aligned_blocks_resize_like_any_other() {
    let mut heap = allocator(2);
    let p = heap.aligned_allocate(100, 128).unwrap().unwrap();
    unsafe {
        p.cast::<u64>().write(42);
        let q = heap.resize(p, 600).unwrap().unwrap();
        assert_eq!(q.cast::<u64>().read(), 42);
        heap.free(q);
    }
    assert_eq!(free_sizes(&heap), vec![1984]);
    check_invariants(&heap);
}
