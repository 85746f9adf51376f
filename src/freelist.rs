//! The bank of segregated free lists.
//!
//! Each bucket is a circular doubly-linked list headed by a sentinel node; an
//! empty bucket's sentinel points to itself, and that circular invariant holds
//! at every instant, including mid-unlink. Blocks within a bucket sit in LIFO
//! order: the most recently freed block is the first entry.

use core::cell::UnsafeCell;
use core::ptr;

use alloc::boxed::Box;

use crate::block::{Block, Links, MIN_BLOCK_SIZE};

/// Number of segregated buckets; the last one is the catch-all class.
pub const NUM_SIZE_CLASSES: usize = 9;

/// Upper bound of each non-catch-all class: a Fibonacci ladder in units of
/// the minimum block size.
pub const SIZE_CLASS_LIMITS: [usize; NUM_SIZE_CLASSES - 1] = [
    MIN_BLOCK_SIZE,
    2 * MIN_BLOCK_SIZE,
    3 * MIN_BLOCK_SIZE,
    5 * MIN_BLOCK_SIZE,
    8 * MIN_BLOCK_SIZE,
    13 * MIN_BLOCK_SIZE,
    21 * MIN_BLOCK_SIZE,
    34 * MIN_BLOCK_SIZE,
];

/// Maps a block size to the index of the bucket that holds it.
pub fn size_class(size: usize) -> usize {
    SIZE_CLASS_LIMITS
        .iter()
        .position(|&limit| size <= limit)
        .unwrap_or(NUM_SIZE_CLASSES - 1)
}

/// The registry of free blocks, one sentinel-headed bucket per size class.
pub(crate) struct FreeLists {
    // Boxed so the sentinel self-pointers stay valid when the allocator
    // value moves; UnsafeCell because resident nodes alias the array.
    heads: Box<UnsafeCell<[Links; NUM_SIZE_CLASSES]>>,
}

impl FreeLists {
    pub(crate) fn new() -> Self {
        let lists = FreeLists {
            heads: Box::new(UnsafeCell::new([Links::unlinked(); NUM_SIZE_CLASSES])),
        };
        for class in 0..NUM_SIZE_CLASSES {
            let head = lists.head(class);
            // SAFETY: `head` points at one of our freshly boxed sentinels.
            unsafe {
                (*head).next = head;
                (*head).prev = head;
            }
        }
        lists
    }

    /// The sentinel node of a bucket.
    pub(crate) fn head(&self, class: usize) -> *mut Links {
        debug_assert!(class < NUM_SIZE_CLASSES);
        // SAFETY: in bounds per the assertion above.
        unsafe { self.heads.get().cast::<Links>().add(class) }
    }

    /// Inserts at the front of the owning bucket.
    ///
    /// # Safety
    ///
    /// `block` must be a free block with a valid header and nulled links.
    pub(crate) unsafe fn insert_lifo(&mut self, block: Block) {
        // SAFETY: the sentinel and any resident nodes form a valid circular
        // list, and the block's link words are writable.
        unsafe {
            let head = self.head(size_class(block.size()));
            let node = block.links();
            debug_assert!(
                (*node).next.is_null() && (*node).prev.is_null(),
                "block is already resident in a bucket"
            );
            (*node).next = (*head).next;
            (*node).prev = head;
            (*(*head).next).prev = node;
            (*head).next = node;
        }
    }

    /// Removes a block from whatever bucket currently holds it, restoring the
    /// circular invariant and nulling the block's links.
    ///
    /// # Safety
    ///
    /// `block` must currently be resident in one of the buckets.
    pub(crate) unsafe fn unlink(&mut self, block: Block) {
        // SAFETY: residency means the links point at live neighbor nodes.
        unsafe {
            let node = block.links();
            debug_assert!(
                !(*node).next.is_null() && !(*node).prev.is_null(),
                "block is not resident in any bucket"
            );
            (*(*node).prev).next = (*node).next;
            (*(*node).next).prev = (*node).prev;
            (*node).next = ptr::null_mut();
            (*node).prev = ptr::null_mut();
        }
    }

    /// Scans the one bucket that could hold an exact match and takes the
    /// first block whose size equals the request.
    ///
    /// # Safety
    ///
    /// The buckets must contain only valid free blocks.
    pub(crate) unsafe fn take_exact(&mut self, size: usize) -> Option<Block> {
        // SAFETY: per this function's contract.
        unsafe {
            let head = self.head(size_class(size));
            let mut node = (*head).next;
            while !ptr::eq(node, head) {
                let block = Block::from_links(node);
                if block.size() == size {
                    self.unlink(block);
                    return Some(block);
                }
                node = (*node).next;
            }
            None
        }
    }

    /// Scans buckets in ascending class order from `start_class` and takes
    /// the first block at least `min_size` large. List order decides ties:
    /// most recently freed wins, addresses are never compared.
    ///
    /// # Safety
    ///
    /// The buckets must contain only valid free blocks.
    pub(crate) unsafe fn take_at_least(&mut self, start_class: usize, min_size: usize) -> Option<Block> {
        for class in start_class..NUM_SIZE_CLASSES {
            // SAFETY: per this function's contract.
            unsafe {
                let head = self.head(class);
                let mut node = (*head).next;
                while !ptr::eq(node, head) {
                    let block = Block::from_links(node);
                    if block.size() >= min_size {
                        self.unlink(block);
                        return Some(block);
                    }
                    node = (*node).next;
                }
            }
        }
        None
    }
}
