//! Kernel heap allocator
//!
//! This crate implements the dynamic memory allocator behind `kmalloc`/`kfree`,
//! featuring:
//! - Buddy engine over an implicit, pointer-free binary tree of node states
//! - Multiple heaps with a fixed priority order
//! - On-demand heap growth through a virtual backing provider
//! - Node trees kept in caller-supplied metadata, so no heap operation
//!   allocates from the global allocator
//! - Consistency checking and tree dumps for testing

#![no_std]

extern crate alloc;

use core::fmt;

// Logging support - conditionally import log crate
#[cfg(feature = "log")]
extern crate log;

// Stub macros when log is disabled - these become no-ops
#[cfg(not(feature = "log"))]
macro_rules! error {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! info {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

/// Default page size for backward compatibility
pub const DEFAULT_PAGE_SIZE: usize = 0x1000;

/// Smallest block handed out by a heap unless configured otherwise.
pub const DEFAULT_MIN_BLOCK_SIZE: usize = 32;

/// Maximum number of heaps a registry can hold.
pub const MAX_HEAPS: usize = 8;

/// The error type used for allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Invalid `size`, geometry or call sequence (e.g. zero-sized request).
    InvalidParam,
    /// A heap added to the registry overlaps an existing heap's reserved range.
    MemoryOverlap,
    /// The request exceeds the capacity of every heap, even if fully free.
    TooLarge,
    /// No free block large enough is currently available.
    OutOfMemory,
    /// The virtual backing provider could not supply more pages.
    GrowthFailed,
    /// The address/size pair does not name a live allocation.
    InvalidFree,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            AllocError::InvalidParam => "invalid parameter",
            AllocError::MemoryOverlap => "heap ranges overlap",
            AllocError::TooLarge => "request larger than any heap",
            AllocError::OutOfMemory => "out of memory",
            AllocError::GrowthFailed => "heap growth failed",
            AllocError::InvalidFree => "free of an unallocated block",
        };
        f.write_str(msg)
    }
}

/// A [`Result`] type with [`AllocError`] as the error type.
pub type AllocResult<T = ()> = Result<T, AllocError>;

/// Maps and unmaps physical frames behind a virtual range.
///
/// Implemented by the kernel's virtual memory manager. Heaps call it only when
/// they grow or shrink, always with page-aligned addresses.
pub trait VirtualBackingProvider: Sync {
    /// Back `page_count` pages starting at `vaddr`. Returns `false` when
    /// physical memory is exhausted; nothing must stay mapped in that case.
    fn map_pages(&self, vaddr: usize, page_count: usize) -> bool;

    /// Release `page_count` pages starting at `vaddr`.
    fn unmap_pages(&self, vaddr: usize, page_count: usize);
}

/// Something that can satisfy `kmalloc`-style requests.
///
/// The front end in [`kmalloc`] is generic over this, so a reference engine can
/// stand in for the buddy heaps without touching call sites.
pub trait KmallocEngine: Sync {
    /// Allocate at least `size` bytes, returning the block address.
    fn allocate(&self, size: usize) -> AllocResult<usize>;

    /// Release a block previously returned by [`allocate`](Self::allocate)
    /// for the same `size`.
    fn free(&self, addr: usize, size: usize) -> AllocResult;

    /// Bytes actually usable in the live block `(addr, size)`, which is more
    /// than `size` when the engine rounds requests up.
    fn usable_size(&self, _addr: usize, size: usize) -> usize {
        size
    }
}

/// Size of the buddy block that serves a `size`-byte request: the smallest
/// power of two `>= max(size, min_block_size)`. `None` on overflow.
#[inline]
pub const fn round_block_size(size: usize, min_block_size: usize) -> Option<usize> {
    let size = if size < min_block_size {
        min_block_size
    } else {
        size
    };
    size.checked_next_power_of_two()
}

/// Checks whether the address has the demanded alignment.
///
/// Equivalent to `addr % align == 0`, but the alignment must be a power of two.
#[inline]
const fn is_aligned(base_addr: usize, align: usize) -> bool {
    base_addr & (align - 1) == 0
}

pub mod buddy;
pub use buddy::{DescentPolicy, HeapStats, NodeState, NodeStateTree, ORDER_SLOTS};

pub mod heap;
pub use heap::{Heap, HeapConfig, HeapSnapshot};

pub mod registry;
pub use registry::HeapRegistry;

pub mod kmalloc;
pub use kmalloc::Kmalloc;
