//! Statistics and debugging for the kmalloc heaps
//!
//! Provides per-heap utilization snapshots and failure reporting.

use super::tree::ORDER_SLOTS;

#[cfg(feature = "log")]
use log::{error, info};

/// Event counters kept per heap when the `tracking` feature is on.
#[cfg(feature = "tracking")]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapCounters {
    pub allocations: usize,
    pub frees: usize,
    pub failures: usize,
    pub grows: usize,
    pub shrinks: usize,
    pub peak_bytes: usize,
}

/// Utilization of one heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub base: usize,
    pub size: usize,
    pub max_size: usize,
    pub min_block_size: usize,
    pub alloced_bytes: usize,
    pub growable: bool,
    /// Largest block that can be allocated right now without growing.
    pub largest_free_block: usize,
    /// Maximal free blocks, indexed by order (block size `min_block_size << order`).
    pub free_blocks_by_order: [usize; ORDER_SLOTS],
    #[cfg(feature = "tracking")]
    pub counters: HeapCounters,
}

impl HeapStats {
    pub fn free_bytes(&self) -> usize {
        self.size - self.alloced_bytes
    }

    /// Size of the blocks counted at `order` in `free_blocks_by_order`.
    pub fn block_size(&self, order: usize) -> usize {
        self.min_block_size << order
    }
}

/// Detailed memory statistics reporter
///
/// Reports are streamed one heap at a time so that nothing has to be collected
/// while the allocator is failing.
pub struct MemoryStatsReporter;

impl MemoryStatsReporter {
    pub fn print_header() {
        info!("========== kmalloc heaps ==========");
    }

    pub fn print_footer() {
        info!("===================================");
    }

    /// Print the utilization of heap `index`.
    #[allow(unused_variables)]
    pub fn print_heap(index: usize, stats: &HeapStats) {
        info!(
            "Heap {}: [{:#x}, {:#x}) reserved up to {:#x}{}",
            index,
            stats.base,
            stats.base + stats.size,
            stats.base + stats.max_size,
            if stats.growable { " (growable)" } else { "" }
        );
        info!(
            "  Used: {} / {} KB, min block {} bytes, largest free block {} bytes",
            stats.alloced_bytes / 1024,
            stats.size / 1024,
            stats.min_block_size,
            stats.largest_free_block
        );
        #[cfg(feature = "tracking")]
        info!(
            "  Allocs: {}, frees: {}, failures: {}, grows: {}, shrinks: {}, peak {} KB",
            stats.counters.allocations,
            stats.counters.frees,
            stats.counters.failures,
            stats.counters.grows,
            stats.counters.shrinks,
            stats.counters.peak_bytes / 1024
        );
    }

    /// Print the overall state at an allocation failure, before the per-heap
    /// details.
    #[allow(unused_variables)]
    pub fn print_alloc_failure_summary(request: usize, heaps: usize, total: usize, used: usize) {
        error!("========================================");
        error!("Request: {} bytes ({} KB)", request, request / 1024);
        error!("Overall Memory State:");
        error!("  Total heaps: {}", heaps);
        error!("  Total: {} KB", total / 1024);
        error!("  Used: {} KB", used / 1024);
        error!("  Free: {} KB", total.saturating_sub(used) / 1024);
        error!("========================================");
    }

    /// Print the free block breakdown of heap `index` at an allocation failure.
    #[allow(unused_variables)]
    pub fn print_heap_failure(index: usize, stats: &HeapStats) {
        error!("Heap {}:", index);
        error!(
            "  Range: [{:#x}, {:#x})",
            stats.base,
            stats.base + stats.size
        );
        error!(
            "  Free: {} / {} bytes",
            stats.free_bytes(),
            stats.size
        );
        error!("  Free blocks by order:");

        for (order, &count) in stats.free_blocks_by_order.iter().enumerate().rev() {
            if count > 0 {
                let block_size = stats.block_size(order);
                error!(
                    "    Order {}: {} blocks ({} bytes each, {} KB total)",
                    order,
                    count,
                    block_size,
                    (count * block_size) / 1024
                );
            }
        }
        error!("----------------------------------------");
    }
}
