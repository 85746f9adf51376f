//! Boundary-tag codec: the packed header/footer word and raw block handle.
//!
//! A block starts with one header word. Free blocks mirror the header into a
//! footer occupying their last word, which lets a successor find its
//! predecessor without any side table. The two payload words after the header
//! double as intrusive list links while the block is free.

use core::ptr::{self, NonNull};

/// Smallest legal block; every block size is a multiple of this.
pub const MIN_BLOCK_SIZE: usize = 32;

/// Width of one boundary-tag word (header or footer).
pub(crate) const WORD: usize = core::mem::size_of::<usize>();

const SIZE_MASK: usize = !(MIN_BLOCK_SIZE - 1);
const CURR_ALLOC: usize = 0x10;
const PREV_ALLOC: usize = 0x8;

/// Rounds a payload request up to a whole block: one header word added, then
/// rounded to the size granularity. `None` on overflow.
pub(crate) fn align_request(size: usize) -> Option<usize> {
    let padded = size.checked_add(WORD + (MIN_BLOCK_SIZE - 1))?;
    Some(padded & SIZE_MASK)
}

/// A packed boundary-tag word: block size in the upper bits, status flags in
/// the low bits freed up by the 32-byte size granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tag(usize);

impl Tag {
    pub(crate) fn new(size: usize, prev_alloc: bool, curr_alloc: bool) -> Self {
        debug_assert_eq!(size & !SIZE_MASK, 0, "block size must be a multiple of 32");
        let mut word = size & SIZE_MASK;
        if prev_alloc {
            word |= PREV_ALLOC;
        }
        if curr_alloc {
            word |= CURR_ALLOC;
        }
        Tag(word)
    }

    pub(crate) fn from_word(word: usize) -> Self {
        Tag(word)
    }

    pub(crate) fn word(self) -> usize {
        self.0
    }

    pub(crate) fn size(self) -> usize {
        self.0 & SIZE_MASK
    }

    pub(crate) fn is_alloc(self) -> bool {
        self.0 & CURR_ALLOC != 0
    }

    pub(crate) fn prev_alloc(self) -> bool {
        self.0 & PREV_ALLOC != 0
    }

    fn with_prev_alloc(self, prev_alloc: bool) -> Self {
        Tag(if prev_alloc {
            self.0 | PREV_ALLOC
        } else {
            self.0 & !PREV_ALLOC
        })
    }
}

/// Intrusive list node living in the first two payload words of a free
/// block. Null links mean the block is not resident in any bucket.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub(crate) struct Links {
    pub(crate) next: *mut Links,
    pub(crate) prev: *mut Links,
}

impl Links {
    pub(crate) const fn unlinked() -> Self {
        Links {
            next: ptr::null_mut(),
            prev: ptr::null_mut(),
        }
    }
}

/// Pointer to a block's header word inside the heap.
///
/// All accessors read or write heap memory and are therefore `unsafe`; the
/// invariant they rely on is that `self` names the header of a block whose
/// bytes are owned by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Block(NonNull<u8>);

impl Block {
    /// # Safety
    ///
    /// `header` must point at a block header word inside the heap.
    pub(crate) unsafe fn from_header(header: NonNull<u8>) -> Self {
        Block(header)
    }

    /// # Safety
    ///
    /// `payload` must have been produced by [`Block::payload`].
    pub(crate) unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        // SAFETY: a payload is always preceded by its header word.
        Block(unsafe { payload.sub(WORD) })
    }

    /// # Safety
    ///
    /// `node` must be the link node of a free block, never a bucket sentinel.
    pub(crate) unsafe fn from_links(node: *mut Links) -> Self {
        // SAFETY: the link node occupies the first payload words, one header
        // word past the block start.
        unsafe { Block(NonNull::new_unchecked(node.cast::<u8>().sub(WORD))) }
    }

    pub(crate) fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// # Safety
    ///
    /// The block must be at least one word long past its header.
    pub(crate) unsafe fn payload(self) -> NonNull<u8> {
        // SAFETY: stays within the block per this function's contract.
        unsafe { self.0.add(WORD) }
    }

    fn word(self) -> *mut usize {
        self.0.as_ptr().cast()
    }

    /// # Safety
    ///
    /// The header word must be initialized.
    pub(crate) unsafe fn tag(self) -> Tag {
        // SAFETY: per this function's contract.
        Tag::from_word(unsafe { self.word().read() })
    }

    pub(crate) unsafe fn size(self) -> usize {
        unsafe { self.tag() }.size()
    }

    pub(crate) unsafe fn is_alloc(self) -> bool {
        unsafe { self.tag() }.is_alloc()
    }

    pub(crate) unsafe fn prev_alloc(self) -> bool {
        unsafe { self.tag() }.prev_alloc()
    }

    /// Writes the header as one unit and mirrors it into the footer when the
    /// block is free, so header and footer never disagree once this returns.
    ///
    /// # Safety
    ///
    /// The `size` bytes starting at the header must belong to this block.
    pub(crate) unsafe fn write(self, size: usize, prev_alloc: bool, curr_alloc: bool) {
        let tag = Tag::new(size, prev_alloc, curr_alloc);
        // SAFETY: header and footer both lie inside the block.
        unsafe {
            self.word().write(tag.word());
            if !curr_alloc {
                self.footer().write(tag.word());
            }
        }
    }

    /// Flips only the `prev_alloc` bit, keeping the footer in sync for free
    /// blocks.
    pub(crate) unsafe fn set_prev_alloc(self, prev_alloc: bool) {
        // SAFETY: same as `write`.
        unsafe {
            let tag = self.tag().with_prev_alloc(prev_alloc);
            self.word().write(tag.word());
            if !tag.is_alloc() {
                self.footer().write(tag.word());
            }
        }
    }

    /// Location of the footer word: the last word of the block.
    unsafe fn footer(self) -> *mut usize {
        // SAFETY: the size field was validated when the header was written.
        unsafe { self.0.as_ptr().add(self.size() - WORD).cast() }
    }

    /// The adjacent higher-address block, derived purely from the size field.
    ///
    /// # Safety
    ///
    /// The header must be initialized and the successor header must belong
    /// to the heap (always true between prologue and epilogue).
    pub(crate) unsafe fn next(self) -> Block {
        // SAFETY: per this function's contract.
        unsafe {
            let size = self.size();
            debug_assert!(size >= MIN_BLOCK_SIZE, "cannot step past a sentinel");
            Block(self.0.add(size))
        }
    }

    /// The adjacent lower-address block, located through its footer. Only
    /// meaningful while `prev_alloc` is clear, i.e. the predecessor is free
    /// and carries a valid footer.
    pub(crate) unsafe fn prev(self) -> Block {
        // SAFETY: a clear prev_alloc bit guarantees the word before this
        // header is the predecessor's footer.
        unsafe {
            debug_assert!(!self.prev_alloc());
            let footer = self.0.as_ptr().sub(WORD).cast::<usize>().read();
            let size = Tag::from_word(footer).size();
            debug_assert!(size >= MIN_BLOCK_SIZE);
            Block(self.0.sub(size))
        }
    }

    /// The intrusive list node of a free block.
    pub(crate) unsafe fn links(self) -> *mut Links {
        // SAFETY: free blocks are at least MIN_BLOCK_SIZE long, so the two
        // link words fit after the header.
        unsafe { self.0.as_ptr().add(WORD).cast() }
    }

    /// Nulls the links to mark the block as not resident in any bucket.
    pub(crate) unsafe fn clear_links(self) {
        // SAFETY: as for `links`.
        unsafe { self.links().write(Links::unlinked()) }
    }
}
