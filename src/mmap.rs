//! An anonymous-mapping page source.

use core::ptr::{self, NonNull};

use rustix::io::Errno;
use rustix::mm::{MapFlags, MprotectFlags, ProtFlags, mmap_anonymous, mprotect, munmap};
use thiserror::Error;

use crate::heap::PageSource;

/// Errors from setting up the backing reservation.
#[derive(Debug, Error)]
pub enum MapError {
    #[error("mmap failed with {0}")]
    Os(#[from] Errno),
    #[error("overflow")]
    Overflow,
}

/// A [`PageSource`] backed by one anonymous mapping.
///
/// The whole region is reserved inaccessible up front and pages are committed
/// read-write one `mprotect` at a time, which guarantees that successive
/// pages are contiguous and sequentially increasing. The reservation is
/// unmapped on drop, invalidating every pointer the allocator handed out.
pub struct MmapSource {
    base: NonNull<u8>,
    reserved: usize,
    committed: usize,
    page_size: usize,
}

impl MmapSource {
    /// Reserves address space for at most `max_pages` system pages.
    pub fn new(max_pages: usize) -> Result<Self, MapError> {
        let page_size = rustix::param::page_size();
        let reserved = page_size.checked_mul(max_pages).ok_or(MapError::Overflow)?;
        let nil = ptr::null_mut();
        // SAFETY: passing `ptr::null_mut()` means the kernel will choose a
        // page-aligned address at which to create the mapping. See mmap(2).
        let addr = unsafe {
            mmap_anonymous(
                nil,
                reserved,
                ProtFlags::empty(),
                MapFlags::PRIVATE | MapFlags::NORESERVE,
            )
        }?;
        Ok(MmapSource {
            base: NonNull::new(addr.cast()).unwrap(),
            reserved,
            committed: 0,
            page_size,
        })
    }
}

impl PageSource for MmapSource {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn grow(&mut self) -> Option<NonNull<u8>> {
        let next = self.committed.checked_add(self.page_size)?;
        if next > self.reserved {
            return None;
        }
        // SAFETY: the page lies inside the reservation made in `new` and is
        // page-aligned because `committed` is a page multiple.
        let page = unsafe { self.base.add(self.committed) };
        unsafe {
            mprotect(
                page.as_ptr().cast(),
                self.page_size,
                MprotectFlags::READ | MprotectFlags::WRITE,
            )
        }
        .ok()?;
        self.committed = next;
        Some(page)
    }
}

impl Drop for MmapSource {
    fn drop(&mut self) {
        // SAFETY: `base` is the start of the reservation of `reserved` bytes
        // created in `new`, and nothing else unmaps it.
        let _ = unsafe { munmap(self.base.as_ptr().cast(), self.reserved) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_are_contiguous_and_writable() {
        let mut source = MmapSource::new(3).unwrap();
        let page_size = source.page_size();

        let first = source.grow().unwrap();
        let second = source.grow().unwrap();
        assert_eq!(second.as_ptr() as usize, first.as_ptr() as usize + page_size);

        unsafe {
            first.as_ptr().write_bytes(0xA5, page_size);
            second.as_ptr().write_bytes(0x5A, page_size);
            assert_eq!(first.as_ptr().read(), 0xA5);
            assert_eq!(second.as_ptr().read(), 0x5A);
        }
    }

    #[test]
    fn reservation_exhaustion_reports_none() {
        let mut source = MmapSource::new(1).unwrap();
        assert!(source.grow().is_some());
        assert!(source.grow().is_none());
    }
}
