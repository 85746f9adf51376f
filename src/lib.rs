//! A segregated-fit memory allocator with boundary-tagged blocks.
//!
//! Free blocks live in nine size-class buckets with Fibonacci-spaced
//! thresholds, each a LIFO circular list. Allocation prefers an exact-size
//! match, then the smallest-class block that can be split without leaving a
//! splinter, and only then accepts internal waste. Freed blocks are
//! immediately coalesced with both neighbors using header/footer boundary
//! tags, and the heap grows one page at a time from a pluggable
//! [`PageSource`].
//!
//! All payload pointers are aligned to [`MIN_BLOCK_SIZE`]; stricter
//! alignments are available through [`Allocator::aligned_allocate`].
//!
//! ```
//! use core::ptr::NonNull;
//! use segfit::{Allocator, BufferSource};
//!
//! #[repr(align(32))]
//! struct Arena([u8; 4096]);
//!
//! let mut arena = Arena([0; 4096]);
//! let base = NonNull::new(arena.0.as_mut_ptr()).unwrap();
//! // SAFETY: the arena outlives the allocator and is not touched otherwise.
//! let source = unsafe { BufferSource::new(base, 4096, 1024) };
//! let mut heap = Allocator::new(source);
//!
//! let p = heap.allocate(100).unwrap().unwrap();
//! assert_eq!(p.as_ptr() as usize % 32, 0);
//! // SAFETY: `p` came from this allocator and is freed exactly once.
//! unsafe { heap.free(p) };
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use thiserror::Error;

mod block;
mod engine;
mod freelist;
mod heap;
mod mmap;

pub use block::MIN_BLOCK_SIZE;
pub use engine::{Allocator, BlockInfo, Blocks, FreeBlockInfo, FreeBlocks};
pub use freelist::{NUM_SIZE_CLASSES, SIZE_CLASS_LIMITS, size_class};
pub use heap::{BufferSource, PageSource};
pub use mmap::{MapError, MmapSource};

/// Failures reported by the allocation operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The page source could not supply enough memory for the request.
    #[error("out of memory")]
    OutOfMemory,
    /// A parameter violated the operation's contract, such as an alignment
    /// that is not a power of two.
    #[error("invalid argument")]
    InvalidArgument,
}
