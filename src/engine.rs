//! The allocation engine: fit search, splitting, coalescing, and the four
//! public operations.

use core::marker::PhantomData;
use core::ptr::NonNull;

use crate::AllocError;
use crate::block::{Block, Links, MIN_BLOCK_SIZE, Tag, WORD, align_request};
use crate::freelist::{FreeLists, NUM_SIZE_CLASSES, size_class};
use crate::heap::{Heap, PageSource};

/// Offset from the heap base to the prologue header, chosen so that every
/// payload address is a multiple of the minimum block size.
fn prologue_offset(start: usize) -> usize {
    (MIN_BLOCK_SIZE - WORD).wrapping_sub(start) % MIN_BLOCK_SIZE
}

/// A segregated-fit allocator over one growable boundary-tagged heap.
///
/// One instance owns one heap; independent instances never share state.
/// Every operation runs to completion on the calling thread with no internal
/// locking, so concurrent callers must serialize access externally.
///
/// The heap is mapped lazily on the first allocation and extended one page at
/// a time from the [`PageSource`]; it is never returned to the source until
/// the allocator (and its source) is dropped.
pub struct Allocator<P: PageSource> {
    heap: Heap<P>,
    free: FreeLists,
}

impl<P: PageSource> Allocator<P> {
    /// Creates an allocator over `source`. Nothing is mapped yet.
    ///
    /// # Panics
    ///
    /// Panics if the source's page size is not a multiple of
    /// [`MIN_BLOCK_SIZE`] or is too small to hold the initial heap layout.
    pub fn new(source: P) -> Self {
        let page = source.page_size();
        assert!(
            page % MIN_BLOCK_SIZE == 0 && page >= 4 * MIN_BLOCK_SIZE,
            "page size must be a multiple of the minimum block size"
        );
        Allocator {
            heap: Heap::new(source),
            free: FreeLists::new(),
        }
    }

    /// Allocates `size` usable bytes and returns a payload pointer aligned
    /// to [`MIN_BLOCK_SIZE`].
    ///
    /// A zero `size` allocates nothing and returns `Ok(None)`. Exhaustion of
    /// the page source reports [`AllocError::OutOfMemory`]; the heap stays
    /// consistent and smaller requests may still succeed afterwards.
    pub fn allocate(&mut self, size: usize) -> Result<Option<NonNull<u8>>, AllocError> {
        if size == 0 {
            return Ok(None);
        }
        self.allocate_block(size).map(Some)
    }

    fn allocate_block(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.ensure_heap()?;
        let request = align_request(size).ok_or(AllocError::OutOfMemory)?;
        loop {
            if let Some(block) = self.find_fit(request) {
                // SAFETY: `find_fit` wrote an allocated header covering at
                // least one payload word.
                return Ok(unsafe { block.payload() });
            }
            // One page may not be enough; retry the whole search after each
            // successful growth.
            self.grow_heap()?;
        }
    }

    /// Returns a block to the free universe: marks it free, merges it with
    /// any free neighbor, and LIFO-inserts the result.
    ///
    /// An invalid pointer is an unrecoverable contract violation. The free
    /// lists could already be poisoned, so this panics instead of returning
    /// an error.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator and not freed since.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        // SAFETY: per this function's contract.
        unsafe {
            let block = Block::from_payload(ptr);
            if let Err(fault) = self.validate(ptr, block) {
                panic!("free of invalid pointer {ptr:p}: {fault}");
            }
            self.release(block);
        }
    }

    /// Resizes an allocation to at least `new_size` usable bytes.
    ///
    /// Growing always relocates: a fresh block is allocated, the old payload
    /// copied (never more bytes than it held), and the old block freed.
    /// Shrinking splits in place and frees the tail, unless the tail would be
    /// smaller than a minimum block, in which case the block is left
    /// oversized and the same pointer returned. A `new_size` of zero frees
    /// the block and returns `Ok(None)`.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator and not freed since.
    pub unsafe fn resize(
        &mut self,
        ptr: NonNull<u8>,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        // SAFETY: per this function's contract.
        unsafe {
            let block = Block::from_payload(ptr);
            if self.validate(ptr, block).is_err() {
                return Err(AllocError::InvalidArgument);
            }
            if new_size == 0 {
                self.release(block);
                return Ok(None);
            }
            let current = block.size();
            let request = align_request(new_size).ok_or(AllocError::OutOfMemory)?;
            if request == current {
                Ok(Some(ptr))
            } else if request > current {
                let dst = self.allocate_block(new_size)?;
                // The old payload capacity, never more.
                core::ptr::copy_nonoverlapping(ptr.as_ptr(), dst.as_ptr(), current - WORD);
                self.release(block);
                Ok(Some(dst))
            } else {
                self.trim_tail(block, request);
                Ok(Some(ptr))
            }
        }
    }

    /// Allocates `size` bytes whose payload address is a multiple of
    /// `align`.
    ///
    /// `align` must be a power of two no smaller than [`MIN_BLOCK_SIZE`];
    /// anything else reports [`AllocError::InvalidArgument`] without
    /// touching the heap. A zero `size` returns `Ok(None)`.
    pub fn aligned_allocate(
        &mut self,
        size: usize,
        align: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        if align < MIN_BLOCK_SIZE || !align.is_power_of_two() {
            return Err(AllocError::InvalidArgument);
        }
        if size == 0 {
            return Ok(None);
        }
        // Over-allocate enough that an aligned sub-block of the requested
        // size can be carved out wherever the fit search lands.
        let padded = size
            .checked_add(align + MIN_BLOCK_SIZE + WORD)
            .ok_or(AllocError::OutOfMemory)?;
        let payload = self.allocate_block(padded)?;
        let keep = align_request(size).ok_or(AllocError::OutOfMemory)?;
        // SAFETY: `payload` names the live allocated block just produced.
        unsafe {
            let block = Block::from_payload(payload);
            if payload.as_ptr() as usize % align == 0 {
                self.trim_tail(block, keep);
                return Ok(Some(payload));
            }

            // Walk forward one minimum block at a time until the carved
            // payload address satisfies the alignment. The front skip is a
            // whole block of its own, so it starts at one minimum block.
            let mut offset = MIN_BLOCK_SIZE;
            while (block.addr() + offset + WORD) % align != 0 {
                offset += MIN_BLOCK_SIZE;
            }
            debug_assert!(offset <= align);

            let total = block.size();
            let rest = total - offset - keep;
            // All three parts are 32-multiples, so a nonzero tail is never a
            // splinter.
            debug_assert!(rest == 0 || rest >= MIN_BLOCK_SIZE);

            let front = block;
            let inner = Block::from_header(NonNull::new_unchecked(
                (block.addr() + offset) as *mut u8,
            ));

            // Headers first: releasing the front reads its successor.
            front.write(offset, front.prev_alloc(), false);
            front.clear_links();
            inner.write(keep, false, true);
            if rest >= MIN_BLOCK_SIZE {
                let tail = inner.next();
                tail.write(rest, true, false);
                tail.clear_links();
                self.release(tail);
            }
            self.release(front);
            Ok(Some(inner.payload()))
        }
    }

    /// The page size of the underlying source.
    pub fn page_size(&self) -> usize {
        self.heap.page_size()
    }

    /// The address range currently owned by the heap, or `None` before the
    /// first allocation maps it.
    pub fn heap_range(&self) -> Option<core::ops::Range<usize>> {
        self.heap
            .is_mapped()
            .then(|| self.heap.start() as usize..self.heap.end() as usize)
    }

    /// Walks the heap in address order, yielding every block from the
    /// prologue through the epilogue sentinel. Empty before first use.
    pub fn blocks(&self) -> Blocks<'_> {
        if !self.heap.is_mapped() {
            return Blocks {
                cur: core::ptr::null(),
                epilogue: core::ptr::null(),
                done: true,
                _heap: PhantomData,
            };
        }
        let start = self.heap.start() as usize;
        let prologue = start + prologue_offset(start);
        let epilogue = self.heap.end() as usize - WORD;
        Blocks {
            cur: prologue as *const u8,
            epilogue: epilogue as *const u8,
            done: false,
            _heap: PhantomData,
        }
    }

    /// Walks the free-list registry in ascending class order, LIFO within
    /// each bucket.
    pub fn free_blocks(&self) -> FreeBlocks<'_> {
        FreeBlocks {
            lists: &self.free,
            class: 0,
            node: core::ptr::null(),
        }
    }

    /// Maps the first page and writes the initial layout: prologue sentinel,
    /// one wilderness free block, epilogue sentinel.
    fn ensure_heap(&mut self) -> Result<(), AllocError> {
        if self.heap.is_mapped() {
            return Ok(());
        }
        let (start, end) = self.heap.extend()?;
        // SAFETY: the page just mapped is owned by the heap and unaliased;
        // every write below stays inside it.
        unsafe {
            let start_addr = start as usize;
            let prologue =
                Block::from_header(NonNull::new_unchecked(start.add(prologue_offset(start_addr))));
            prologue.write(MIN_BLOCK_SIZE, false, true);

            let epilogue_addr = end.sub(WORD);
            let epilogue = Block::from_header(NonNull::new_unchecked(epilogue_addr));
            epilogue.write(0, false, true);

            let wilderness = prologue.next();
            let size = epilogue_addr as usize - wilderness.addr();
            debug_assert!(size >= MIN_BLOCK_SIZE && size % MIN_BLOCK_SIZE == 0);
            wilderness.write(size, true, false);
            wilderness.clear_links();
            self.free.insert_lifo(wilderness);
        }
        Ok(())
    }

    /// Extends the heap by one page. The old epilogue becomes the header of
    /// a page-sized free block, a new epilogue is written at the new end,
    /// and the block is folded into the free universe (coalescing with the
    /// wilderness when there is one).
    fn grow_heap(&mut self) -> Result<(), AllocError> {
        let (old_end, new_end) = self.heap.extend()?;
        // SAFETY: the old epilogue word and the fresh page both belong to
        // the heap.
        unsafe {
            let block = Block::from_header(NonNull::new_unchecked(old_end.sub(WORD)));
            let prev_alloc = block.prev_alloc();

            let epilogue = Block::from_header(NonNull::new_unchecked(new_end.sub(WORD)));
            epilogue.write(0, false, true);

            block.write(self.heap.page_size(), prev_alloc, false);
            block.clear_links();
            let block = self.coalesce(block);
            self.free.insert_lifo(block);
        }
        Ok(())
    }

    /// The three-pass fit search over the registry. Returns a block with a
    /// freshly written allocated header of at least `request` bytes, or
    /// `None` when the heap must grow.
    fn find_fit(&mut self, request: usize) -> Option<Block> {
        // SAFETY: the registry only ever holds valid free blocks.
        unsafe {
            // Exact match consumes a whole block with no split.
            if let Some(block) = self.free.take_exact(request) {
                return Some(self.take_whole(block));
            }
            // Split without a splinter: the remainder must itself be a
            // legal block.
            if let Some(split_size) = request.checked_add(MIN_BLOCK_SIZE) {
                if let Some(block) = self.free.take_at_least(size_class(split_size), split_size) {
                    return Some(self.split(block, request));
                }
            }
            // No split is possible without a splinter; take any block large
            // enough and waste the tail inside the allocation.
            if let Some(block) = self.free.take_at_least(size_class(request), request) {
                return Some(self.take_whole(block));
            }
            None
        }
    }

    /// Marks an unlinked free block fully allocated, tail and all.
    unsafe fn take_whole(&mut self, block: Block) -> Block {
        // SAFETY: `block` is unlinked and its successor is a valid block.
        unsafe {
            block.write(block.size(), block.prev_alloc(), true);
            block.next().set_prev_alloc(true);
            block
        }
    }

    /// Splits an unlinked free block into an allocated front of exactly
    /// `request` bytes and a free remainder that goes back into its bucket.
    unsafe fn split(&mut self, block: Block, request: usize) -> Block {
        // SAFETY: the caller found `block` at least `request` plus one
        // minimum block large.
        unsafe {
            let total = block.size();
            debug_assert!(total >= request + MIN_BLOCK_SIZE);
            block.write(request, block.prev_alloc(), true);
            let rest = block.next();
            rest.write(total - request, true, false);
            rest.clear_links();
            self.free.insert_lifo(rest);
            block
        }
    }

    /// Splits an allocated block in place, keeping the first `keep` bytes
    /// allocated and releasing the tail. Leaves the block oversized when the
    /// tail would be a splinter.
    unsafe fn trim_tail(&mut self, block: Block, keep: usize) {
        // SAFETY: `block` is a live allocated block of at least `keep` bytes.
        unsafe {
            let total = block.size();
            debug_assert!(keep <= total && keep % MIN_BLOCK_SIZE == 0);
            let rest = total - keep;
            if rest < MIN_BLOCK_SIZE {
                return;
            }
            block.write(keep, block.prev_alloc(), true);
            let tail = block.next();
            tail.write(rest, true, false);
            tail.clear_links();
            self.release(tail);
        }
    }

    /// Shared free path: mark free, coalesce to fixpoint, LIFO insert.
    unsafe fn release(&mut self, block: Block) {
        // SAFETY: `block` is a live block owned by the heap and not resident
        // in any bucket.
        unsafe {
            block.write(block.size(), block.prev_alloc(), false);
            block.clear_links();
            let block = self.coalesce(block);
            self.free.insert_lifo(block);
        }
    }

    /// Merges `block` with free neighbors until neither side is free, then
    /// propagates the free state into the follower's `prev_alloc` bit.
    ///
    /// The block must carry a free header and must not be bucket resident;
    /// the result satisfies the same conditions.
    unsafe fn coalesce(&mut self, mut block: Block) -> Block {
        // SAFETY: headers and footers along the way are maintained by the
        // codec; neighbors found free are bucket resident by invariant.
        unsafe {
            while !block.prev_alloc() {
                let prev = block.prev();
                debug_assert!(!prev.is_alloc());
                self.free.unlink(prev);
                prev.write(prev.size() + block.size(), prev.prev_alloc(), false);
                block = prev;
            }
            loop {
                let next = block.next();
                if next.is_alloc() {
                    break;
                }
                self.free.unlink(next);
                block.write(block.size() + next.size(), block.prev_alloc(), false);
            }
            block.next().set_prev_alloc(false);
            block
        }
    }

    /// Checks every rule a live allocated pointer must satisfy. A failure
    /// means the caller handed over a pointer this allocator never produced,
    /// or the bookkeeping around it was trampled.
    fn validate(&self, ptr: NonNull<u8>, block: Block) -> Result<(), &'static str> {
        if ptr.as_ptr() as usize % MIN_BLOCK_SIZE != 0 {
            return Err("payload address is misaligned");
        }
        if !self.heap.is_mapped() {
            return Err("heap has no blocks");
        }
        let start = self.heap.start() as usize;
        let end = self.heap.end() as usize;
        let first = start + prologue_offset(start) + MIN_BLOCK_SIZE;
        if block.addr() < first || block.addr() + MIN_BLOCK_SIZE > end {
            return Err("block lies outside the heap");
        }
        // SAFETY: the header word is in bounds per the check above.
        unsafe {
            let size = block.size();
            if size < MIN_BLOCK_SIZE || size % MIN_BLOCK_SIZE != 0 {
                return Err("header size is not a multiple of the minimum block size");
            }
            if block.addr() + size > end - WORD {
                return Err("block extends past the end of the heap");
            }
            if !block.is_alloc() {
                return Err("allocated bit is not set");
            }
            if !block.prev_alloc() {
                let footer = ((block.addr() - WORD) as *const usize).read();
                let prev_size = Tag::from_word(footer).size();
                if prev_size < MIN_BLOCK_SIZE || block.addr() - start < prev_size {
                    return Err("previous block footer is corrupt");
                }
                let prev = Block::from_header(NonNull::new_unchecked(
                    (block.addr() - prev_size) as *mut u8,
                ));
                if prev.is_alloc() {
                    return Err("prev_alloc bit disagrees with the previous block");
                }
            }
        }
        Ok(())
    }
}

/// Snapshot of one block, reported by [`Allocator::blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub addr: usize,
    pub size: usize,
    pub allocated: bool,
    pub prev_allocated: bool,
}

/// Address-ordered walk over every block, prologue through epilogue.
pub struct Blocks<'a> {
    cur: *const u8,
    epilogue: *const u8,
    done: bool,
    _heap: PhantomData<&'a ()>,
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        if self.done {
            return None;
        }
        // SAFETY: `cur` steps header to header between the prologue and the
        // epilogue, all owned by the borrowed heap.
        unsafe {
            let block = Block::from_header(NonNull::new_unchecked(self.cur as *mut u8));
            let info = BlockInfo {
                addr: block.addr(),
                size: block.size(),
                allocated: block.is_alloc(),
                prev_allocated: block.prev_alloc(),
            };
            if core::ptr::eq(self.cur, self.epilogue) {
                self.done = true;
            } else {
                self.cur = self.cur.add(info.size);
            }
            Some(info)
        }
    }
}

/// Snapshot of one bucket-resident free block, reported by
/// [`Allocator::free_blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlockInfo {
    pub class: usize,
    pub size: usize,
    pub payload: usize,
}

/// Bucket-ordered walk over the free-list registry.
pub struct FreeBlocks<'a> {
    lists: &'a FreeLists,
    class: usize,
    node: *const Links,
}

impl Iterator for FreeBlocks<'_> {
    type Item = FreeBlockInfo;

    fn next(&mut self) -> Option<FreeBlockInfo> {
        loop {
            let head = self.lists.head(self.class);
            // SAFETY: sentinels and resident nodes form valid circular
            // lists for as long as the registry is borrowed.
            unsafe {
                if self.node.is_null() {
                    self.node = (*head).next;
                }
                if !core::ptr::eq(self.node, head) {
                    let block = Block::from_links(self.node as *mut Links);
                    let info = FreeBlockInfo {
                        class: self.class,
                        size: block.size(),
                        payload: block.payload().as_ptr() as usize,
                    };
                    self.node = (*self.node).next;
                    return Some(info);
                }
            }
            if self.class + 1 == NUM_SIZE_CLASSES {
                return None;
            }
            self.class += 1;
            self.node = core::ptr::null();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::BufferSource;

    const PAGE: usize = 2048;

    #[repr(align(32))]
    struct Arena([u8; 2 * PAGE]);

    fn allocator(arena: &mut Arena) -> Allocator<BufferSource> {
        let base = NonNull::new(arena.0.as_mut_ptr()).unwrap();
        // SAFETY: every test keeps the arena alive past the allocator.
        let source = unsafe { BufferSource::new(base, arena.0.len(), PAGE) };
        Allocator::new(source)
    }

    #[test]
    fn first_allocation_splits_the_wilderness() {
        let mut arena = Arena([0; 2 * PAGE]);
        let mut heap = allocator(&mut arena);

        let p = heap.allocate(4).unwrap().unwrap();
        assert_eq!(p.as_ptr() as usize % MIN_BLOCK_SIZE, 0);

        let free: Vec<_> = heap.free_blocks().collect();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].size, PAGE - 64 - MIN_BLOCK_SIZE);
        // Only one page was mapped.
        let range = heap.heap_range().unwrap();
        assert_eq!(range.end - range.start, PAGE);
    }

    #[test]
    fn exact_match_is_preferred_over_splitting() {
        let mut arena = Arena([0; 2 * PAGE]);
        let mut heap = allocator(&mut arena);

        let a = heap.allocate(56).unwrap().unwrap();
        let _guard = heap.allocate(8).unwrap().unwrap();
        unsafe { heap.free(a) };

        // A 64-byte hole exists; the wilderness would also fit but would
        // have to split.
        let b = heap.allocate(56).unwrap().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn lifo_means_most_recently_freed_first() {
        let mut arena = Arena([0; 2 * PAGE]);
        let mut heap = allocator(&mut arena);

        let a = heap.allocate(56).unwrap().unwrap();
        let _g1 = heap.allocate(8).unwrap().unwrap();
        let b = heap.allocate(56).unwrap().unwrap();
        let _g2 = heap.allocate(8).unwrap().unwrap();
        unsafe {
            heap.free(a);
            heap.free(b);
        }

        let holes: Vec<_> = heap.free_blocks().filter(|f| f.size == 64).collect();
        assert_eq!(holes.len(), 2);
        assert_eq!(holes[0].payload, b.as_ptr() as usize);
        assert_eq!(holes[1].payload, a.as_ptr() as usize);
    }

    #[test]
    fn zero_size_is_not_an_error() {
        let mut arena = Arena([0; 2 * PAGE]);
        let mut heap = allocator(&mut arena);
        assert_eq!(heap.allocate(0), Ok(None));
        // Nothing was mapped for it either.
        assert!(heap.heap_range().is_none());
    }
}
