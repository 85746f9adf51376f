//! Heap bounds and the page-provider seam.

use core::ptr::{self, NonNull};

use crate::AllocError;
use crate::block::MIN_BLOCK_SIZE;

/// Supplies raw memory to the heap, one page per call.
///
/// Pages must appear at sequentially increasing addresses, each starting
/// exactly where the previous one ended, so the heap stays one contiguous
/// range. `None` from [`grow`](PageSource::grow) means the source is
/// exhausted; the engine reports that as [`AllocError::OutOfMemory`] and the
/// heap remains usable.
pub trait PageSource {
    /// Size in bytes of every page; must be a nonzero multiple of
    /// [`MIN_BLOCK_SIZE`].
    fn page_size(&self) -> usize;

    /// Makes one more page available and returns its base address.
    fn grow(&mut self) -> Option<NonNull<u8>>;
}

/// The contiguous address range currently owned by the allocator. Grows in
/// whole-page increments; never shrinks.
pub(crate) struct Heap<P> {
    source: P,
    start: *mut u8,
    end: *mut u8,
}

impl<P: PageSource> Heap<P> {
    pub(crate) fn new(source: P) -> Self {
        Heap {
            source,
            start: ptr::null_mut(),
            end: ptr::null_mut(),
        }
    }

    pub(crate) fn is_mapped(&self) -> bool {
        !self.start.is_null()
    }

    pub(crate) fn start(&self) -> *mut u8 {
        self.start
    }

    pub(crate) fn end(&self) -> *mut u8 {
        self.end
    }

    pub(crate) fn page_size(&self) -> usize {
        self.source.page_size()
    }

    /// Extends the heap by one page, returning the old and new end
    /// addresses. On the very first call the "old end" is the heap base.
    pub(crate) fn extend(&mut self) -> Result<(*mut u8, *mut u8), AllocError> {
        let page = self.source.grow().ok_or(AllocError::OutOfMemory)?.as_ptr();
        let size = self.source.page_size();
        if self.start.is_null() {
            self.start = page;
        } else {
            debug_assert!(
                ptr::eq(page, self.end),
                "page source must extend the heap contiguously"
            );
        }
        let old_end = if self.end.is_null() { page } else { self.end };
        // SAFETY: the source just made `size` bytes at `page` available.
        self.end = unsafe { page.add(size) };
        Ok((old_end, self.end))
    }
}

/// A [`PageSource`] drawing pages from a caller-provided memory region.
///
/// Useful for deterministic tests and for embedders that manage their own
/// backing memory. Exhaustion is simply running off the end of the region.
pub struct BufferSource {
    base: NonNull<u8>,
    capacity: usize,
    page_size: usize,
    used: usize,
}

impl BufferSource {
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `capacity` bytes for as
    /// long as the source (and any allocator built on it) is in use, aligned
    /// to [`MIN_BLOCK_SIZE`], and not accessed through any other path in the
    /// meantime.
    pub unsafe fn new(base: NonNull<u8>, capacity: usize, page_size: usize) -> Self {
        assert!(page_size > 0 && page_size % MIN_BLOCK_SIZE == 0);
        assert!(base.as_ptr() as usize % MIN_BLOCK_SIZE == 0);
        BufferSource {
            base,
            capacity,
            page_size,
            used: 0,
        }
    }
}

impl PageSource for BufferSource {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn grow(&mut self) -> Option<NonNull<u8>> {
        let next = self.used.checked_add(self.page_size)?;
        if next > self.capacity {
            return None;
        }
        // SAFETY: within the region the caller vouched for in `new`.
        let page = unsafe { self.base.add(self.used) };
        self.used = next;
        Some(page)
    }
}
