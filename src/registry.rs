//! Multi-heap registry
//!
//! Holds every kmalloc heap in a fixed priority order, routes allocations to
//! the first heap able to serve them and frees back to the heap owning the
//! address. Each heap has its own lock, so different heaps never contend.

use alloc::vec::Vec;

use kspin::SpinNoIrq;

use crate::buddy::{HeapStats, InconsistentNode, MemoryStatsReporter};
use crate::heap::{invalid_free, Heap, HeapSnapshot};
use crate::{round_block_size, AllocError, AllocResult, KmallocEngine, MAX_HEAPS};

#[cfg(feature = "log")]
use log::{debug, error, info};

/// A registered heap and the parts of its geometry that never change, kept
/// outside the lock for routing.
struct HeapSlot<const PAGE_SIZE: usize> {
    base: usize,
    reserved_end: usize,
    capacity: usize,
    min_block_size: usize,
    heap: SpinNoIrq<Heap<PAGE_SIZE>>,
}

impl<const PAGE_SIZE: usize> HeapSlot<PAGE_SIZE> {
    fn reserved_contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.reserved_end
    }

    /// Whether a request of `size` bytes could ever be served by this heap.
    fn can_hold(&self, size: usize) -> bool {
        matches!(round_block_size(size, self.min_block_size), Some(block) if block <= self.capacity)
    }
}

/// Ordered collection of heaps serving kernel allocations.
///
/// Heaps are added while the registry is built; once it is shared the set of
/// heaps is fixed and only their contents (and sizes, by growing) change.
/// The slots are inline, so a registry can live in a `static` and routing
/// never touches the global allocator.
pub struct HeapRegistry<const PAGE_SIZE: usize = { crate::DEFAULT_PAGE_SIZE }> {
    /// The first `len` entries are occupied, sorted by capacity, smallest
    /// first, then by base address.
    heaps: [Option<HeapSlot<PAGE_SIZE>>; MAX_HEAPS],
    len: usize,
}

impl<const PAGE_SIZE: usize> HeapRegistry<PAGE_SIZE> {
    pub const fn new() -> Self {
        Self {
            heaps: [const { None }; MAX_HEAPS],
            len: 0,
        }
    }

    fn slots(&self) -> impl Iterator<Item = &HeapSlot<PAGE_SIZE>> + '_ {
        self.heaps[..self.len].iter().flatten()
    }

    fn slot(&self, index: usize) -> Option<&HeapSlot<PAGE_SIZE>> {
        self.heaps[..self.len].get(index)?.as_ref()
    }

    /// Build a registry from a set of heaps.
    pub fn from_heaps<I>(heaps: I) -> AllocResult<Self>
    where
        I: IntoIterator<Item = Heap<PAGE_SIZE>>,
    {
        let mut registry = Self::new();
        for heap in heaps {
            registry.add_heap(heap)?;
        }
        Ok(registry)
    }

    /// Register a heap. Its reserved range must not overlap any other heap's.
    pub fn add_heap(&mut self, heap: Heap<PAGE_SIZE>) -> AllocResult {
        if self.len >= MAX_HEAPS {
            error!(
                "kmalloc registry: cannot add heap: maximum heaps ({}) reached",
                MAX_HEAPS
            );
            return Err(AllocError::InvalidParam);
        }

        let base = heap.base();
        let reserved_end = base + heap.max_size();
        for slot in self.slots() {
            if !(reserved_end <= slot.base || base >= slot.reserved_end) {
                error!(
                    "kmalloc registry: heap [{:#x}, {:#x}) overlaps heap [{:#x}, {:#x})",
                    base, reserved_end, slot.base, slot.reserved_end
                );
                return Err(AllocError::MemoryOverlap);
            }
        }

        let slot = HeapSlot {
            base,
            reserved_end,
            capacity: heap.max_size(),
            min_block_size: heap.min_block_size(),
            heap: SpinNoIrq::new(heap),
        };
        let pos = self
            .slots()
            .position(|s| (s.capacity, s.base) > (slot.capacity, slot.base))
            .unwrap_or(self.len);
        info!(
            "kmalloc registry: heap {} at [{:#x}, {:#x}), capacity {:#x}",
            pos, base, reserved_end, slot.capacity
        );
        self.heaps[self.len] = Some(slot);
        self.heaps[pos..=self.len].rotate_right(1);
        self.len += 1;
        Ok(())
    }

    pub const fn heap_count(&self) -> usize {
        self.len
    }

    /// Index (in priority order) of the heap whose reserved range holds `addr`.
    pub fn find_heap_for_addr(&self, addr: usize) -> Option<usize> {
        self.slots().position(|slot| slot.reserved_contains(addr))
    }

    /// Run `f` on heap `index` with its lock held.
    pub fn with_heap<R>(&self, index: usize, f: impl FnOnce(&mut Heap<PAGE_SIZE>) -> R) -> Option<R> {
        self.slot(index).map(|slot| f(&mut slot.heap.lock()))
    }

    /// Allocate `size` bytes from the first heap, in priority order, that can
    /// serve the request, letting heaps grow when they are exhausted.
    pub fn allocate(&self, size: usize) -> AllocResult<usize> {
        if size == 0 {
            return Err(AllocError::InvalidParam);
        }

        let mut candidates = 0;
        for (_i, slot) in self.slots().enumerate() {
            if !slot.can_hold(size) {
                continue;
            }
            candidates += 1;
            match slot.heap.lock().try_allocate(size) {
                Ok(addr) => return Ok(addr),
                Err(AllocError::GrowthFailed) => {
                    debug!(
                        "kmalloc registry: heap {} could not grow for {} bytes",
                        _i, size
                    );
                }
                Err(_) => {}
            }
        }

        if candidates == 0 {
            debug!("kmalloc registry: {} bytes exceed every heap", size);
            return Err(AllocError::TooLarge);
        }

        debug!("kmalloc registry: allocation failure: {} bytes", size);
        self.print_alloc_failure_stats(size);
        Err(AllocError::OutOfMemory)
    }

    /// Free the allocation `(addr, size)` in the heap that owns `addr`.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if the pair does not name a live allocation.
    pub fn free(&self, addr: usize, size: usize) -> AllocResult {
        match self.slots().find(|slot| slot.reserved_contains(addr)) {
            Some(slot) => slot.heap.lock().free(addr, size),
            None => {
                error!("kmalloc registry: {:#x} is not in any heap", addr);
                invalid_free(addr, size)
            }
        }
    }

    /// Hand back unused grown memory of every heap. Returns bytes released.
    pub fn reclaim(&self) -> usize {
        self.slots().map(|slot| slot.heap.lock().shrink()).sum()
    }

    /// Utilization of every heap, in priority order.
    ///
    /// The result is allocated before any heap lock is taken.
    pub fn stats(&self) -> Vec<HeapStats> {
        let mut stats = Vec::with_capacity(self.len);
        for slot in self.slots() {
            let heap_stats = slot.heap.lock().stats();
            stats.push(heap_stats);
        }
        stats
    }

    /// Node state tree of every heap, in priority order.
    ///
    /// Buffers are allocated with no heap lock held. A heap that grew in the
    /// meantime is measured again.
    pub fn dump(&self) -> Vec<HeapSnapshot> {
        let mut snapshots = Vec::with_capacity(self.len);
        for slot in self.slots() {
            let mut nodes = Vec::new();
            loop {
                let needed = slot.heap.lock().node_count();
                nodes.reserve(needed);
                let heap = slot.heap.lock();
                if nodes.capacity() >= heap.node_count() {
                    snapshots.push(heap.snapshot_into(nodes));
                    break;
                }
            }
        }
        snapshots
    }

    /// Check every heap, returning the index of the first inconsistent one.
    pub fn check(&self) -> Result<(), (usize, InconsistentNode)> {
        for (i, slot) in self.slots().enumerate() {
            slot.heap.lock().check().map_err(|node| (i, node))?;
        }
        Ok(())
    }

    /// Log the utilization of every heap.
    pub fn print_heap_stats(&self) {
        MemoryStatsReporter::print_header();
        for (i, slot) in self.slots().enumerate() {
            let stats = slot.heap.lock().stats();
            MemoryStatsReporter::print_heap(i, &stats);
        }
        MemoryStatsReporter::print_footer();
    }

    /// Print detailed allocation failure statistics
    ///
    /// Streams one heap at a time and never allocates, since it runs when the
    /// allocator has just failed.
    #[cfg(feature = "tracking")]
    pub fn print_alloc_failure_stats(&self, size: usize) {
        let mut total = 0;
        let mut used = 0;
        for slot in self.slots() {
            let heap = slot.heap.lock();
            total += heap.size();
            used += heap.alloced_bytes();
        }
        MemoryStatsReporter::print_alloc_failure_summary(size, self.len, total, used);
        for (i, slot) in self.slots().enumerate() {
            let stats = slot.heap.lock().stats();
            MemoryStatsReporter::print_heap_failure(i, &stats);
        }
        error!("========================================");
    }

    #[cfg(not(feature = "tracking"))]
    pub fn print_alloc_failure_stats(&self, _size: usize) {
        // No-op when tracking is disabled
    }
}

impl<const PAGE_SIZE: usize> Default for HeapRegistry<PAGE_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const PAGE_SIZE: usize> KmallocEngine for HeapRegistry<PAGE_SIZE> {
    fn allocate(&self, size: usize) -> AllocResult<usize> {
        HeapRegistry::allocate(self, size)
    }

    fn free(&self, addr: usize, size: usize) -> AllocResult {
        HeapRegistry::free(self, addr, size)
    }

    fn usable_size(&self, addr: usize, size: usize) -> usize {
        self.slots()
            .find(|slot| slot.reserved_contains(addr))
            .and_then(|slot| round_block_size(size, slot.min_block_size))
            .unwrap_or(size)
    }
}
