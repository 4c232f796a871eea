//! Single kmalloc heap
//!
//! A heap owns one contiguous virtual range, the node state tree describing it,
//! and the policy for growing that range through a [`VirtualBackingProvider`].

use alloc::vec::Vec;

use crate::buddy::node::{self, NodeState};
use crate::buddy::tree::MAX_TREE_ORDER;
use crate::buddy::{DescentPolicy, HeapStats, InconsistentNode, NodeStateTree};
use crate::{is_aligned, round_block_size, AllocError, AllocResult, VirtualBackingProvider};

#[cfg(feature = "tracking")]
use crate::buddy::HeapCounters;

#[cfg(feature = "log")]
use log::{debug, error, trace, warn};

/// Geometry and policy of a heap, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    pub base: usize,
    pub size: usize,
    pub min_block_size: usize,
    /// Size of the reserved range the heap may grow into.
    pub max_size: usize,
    pub growable: bool,
    pub policy: DescentPolicy,
}

impl HeapConfig {
    /// A non-growable heap of `size` bytes at `base`.
    pub const fn new(base: usize, size: usize) -> Self {
        Self {
            base,
            size,
            min_block_size: crate::DEFAULT_MIN_BLOCK_SIZE,
            max_size: size,
            growable: false,
            policy: DescentPolicy::BestFit,
        }
    }

    pub const fn min_block_size(mut self, min_block_size: usize) -> Self {
        self.min_block_size = min_block_size;
        self
    }

    /// Let the heap grow, by doubling, up to `max_size` bytes.
    pub const fn growable(mut self, max_size: usize) -> Self {
        self.growable = true;
        self.max_size = max_size;
        self
    }

    pub const fn policy(mut self, policy: DescentPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Largest size the heap can reach.
    pub const fn effective_max_size(&self) -> usize {
        if self.growable {
            self.max_size
        } else {
            self.size
        }
    }

    /// Bytes of metadata the heap needs for its node tree, one per node of
    /// the tree at [`effective_max_size`](Self::effective_max_size).
    pub const fn metadata_size(&self) -> usize {
        node::node_count(self.effective_max_size(), self.min_block_size)
    }
}

/// Full node state tree of a heap, with the geometry needed to interpret it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapSnapshot {
    pub base: usize,
    pub size: usize,
    pub min_block_size: usize,
    pub nodes: Vec<NodeState>,
}

impl HeapSnapshot {
    pub fn is_pristine(&self) -> bool {
        self.nodes.iter().all(|s| s.is_free())
    }

    /// Block size covered by `node`.
    pub fn node_size(&self, node: usize) -> usize {
        node::node_size(self.size, node)
    }

    /// Address of the block covered by `node`.
    pub fn node_address(&self, node: usize) -> usize {
        self.base + node::node_offset(self.size, node)
    }

    /// Nodes whose state differs from `other`'s, with both states.
    ///
    /// Returns `None` when the two snapshots describe different geometries,
    /// for instance one taken before and one after the heap grew.
    pub fn diff(&self, other: &HeapSnapshot) -> Option<Vec<(usize, NodeState, NodeState)>> {
        if self.base != other.base
            || self.size != other.size
            || self.min_block_size != other.min_block_size
            || self.nodes.len() != other.nodes.len()
        {
            return None;
        }
        Some(
            self.nodes
                .iter()
                .zip(other.nodes.iter())
                .enumerate()
                .filter(|(_, (a, b))| a != b)
                .map(|(i, (a, b))| (i, *a, *b))
                .collect(),
        )
    }
}

/// A buddy heap over `[base, base + size)`, reserved up to `base + max_size`.
pub struct Heap<const PAGE_SIZE: usize = { crate::DEFAULT_PAGE_SIZE }> {
    base: usize,
    size: usize,
    initial_size: usize,
    max_size: usize,
    min_block_size: usize,
    growable: bool,
    policy: DescentPolicy,
    tree: NodeStateTree,
    alloced_bytes: usize,
    backing: Option<&'static dyn VirtualBackingProvider>,
    #[cfg(feature = "tracking")]
    counters: HeapCounters,
}

impl<const PAGE_SIZE: usize> Heap<PAGE_SIZE> {
    /// Create a heap over an already backed range.
    ///
    /// `metadata` holds the node tree and must span at least
    /// [`HeapConfig::metadata_size`] bytes, so that growth never allocates.
    pub fn new(config: HeapConfig, metadata: &'static mut [u8]) -> AllocResult<Self> {
        let max_size = config.effective_max_size();

        let geometry_ok = config.size.is_power_of_two()
            && config.min_block_size.is_power_of_two()
            && config.size >= config.min_block_size
            && max_size.is_power_of_two()
            && max_size >= config.size
            && (max_size / config.min_block_size).trailing_zeros() <= MAX_TREE_ORDER
            && is_aligned(config.base, config.min_block_size)
            && config.base.checked_add(max_size).is_some();
        // Growth maps whole pages right after the current end.
        let growth_ok = !config.growable
            || (config.size >= PAGE_SIZE && is_aligned(config.base, PAGE_SIZE));

        if !geometry_ok || !growth_ok {
            warn!(
                "kmalloc heap {:#x}: invalid geometry size={:#x} max={:#x} min_block={}",
                config.base, config.size, max_size, config.min_block_size
            );
            return Err(AllocError::InvalidParam);
        }

        if metadata.len() < config.metadata_size() {
            warn!(
                "kmalloc heap {:#x}: {} bytes of metadata, {} needed",
                config.base,
                metadata.len(),
                config.metadata_size()
            );
            return Err(AllocError::InvalidParam);
        }

        let max_order = (config.size / config.min_block_size).trailing_zeros();
        let tree = NodeStateTree::new(max_order, metadata).ok_or(AllocError::InvalidParam)?;
        Ok(Self {
            base: config.base,
            size: config.size,
            initial_size: config.size,
            max_size,
            min_block_size: config.min_block_size,
            growable: config.growable,
            policy: config.policy,
            tree,
            alloced_bytes: 0,
            backing: None,
            #[cfg(feature = "tracking")]
            counters: HeapCounters::default(),
        })
    }

    /// Create a heap whose initial pages are mapped by `provider`, which is
    /// also used for later growth.
    pub fn with_backing(
        config: HeapConfig,
        metadata: &'static mut [u8],
        provider: &'static dyn VirtualBackingProvider,
    ) -> AllocResult<Self> {
        if !is_aligned(config.base, PAGE_SIZE) {
            return Err(AllocError::InvalidParam);
        }
        let mut heap = Self::new(config, metadata)?;
        let pages = heap.size.div_ceil(PAGE_SIZE);
        if !provider.map_pages(heap.base, pages) {
            warn!(
                "kmalloc heap {:#x}: cannot map {} initial pages",
                heap.base, pages
            );
            return Err(AllocError::GrowthFailed);
        }
        heap.backing = Some(provider);
        Ok(heap)
    }

    /// Set the provider used to map pages when the heap grows.
    pub fn set_backing_provider(&mut self, provider: &'static dyn VirtualBackingProvider) {
        self.backing = Some(provider);
    }

    pub const fn base(&self) -> usize {
        self.base
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    pub const fn min_block_size(&self) -> usize {
        self.min_block_size
    }

    pub const fn alloced_bytes(&self) -> usize {
        self.alloced_bytes
    }

    pub const fn is_growable(&self) -> bool {
        self.growable
    }

    pub const fn policy(&self) -> DescentPolicy {
        self.policy
    }

    pub fn tree(&self) -> &NodeStateTree {
        &self.tree
    }

    /// Whether `addr` lies in the currently managed range.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr - self.base < self.size
    }

    /// Whether `addr` lies in the reserved range, including room to grow.
    pub fn reserved_contains(&self, addr: usize) -> bool {
        addr >= self.base && addr - self.base < self.max_size
    }

    /// Block size serving a `size`-byte request, if it fits in this heap's
    /// reserved range at all.
    pub fn block_size(&self, size: usize) -> Option<usize> {
        if size == 0 || size > self.max_size {
            return None;
        }
        round_block_size(size, self.min_block_size)
    }

    #[inline]
    fn order_of_block(&self, block: usize) -> u32 {
        block.trailing_zeros() - self.min_block_size.trailing_zeros()
    }

    /// Allocate from the current range only, without growing.
    pub fn allocate(&mut self, size: usize) -> AllocResult<usize> {
        if size == 0 {
            return Err(AllocError::InvalidParam);
        }
        let block = match self.block_size(size) {
            Some(block) if block <= self.size => block,
            _ => return Err(AllocError::TooLarge),
        };

        match self.tree.alloc_block(self.order_of_block(block), self.policy) {
            Some(node) => {
                self.alloced_bytes += block;
                #[cfg(feature = "tracking")]
                {
                    self.counters.allocations += 1;
                    self.counters.peak_bytes = self.counters.peak_bytes.max(self.alloced_bytes);
                }
                let addr = self.base + node::node_offset(self.size, node);
                trace!(
                    "kmalloc heap {:#x}: node {} -> [{:#x}, {:#x})",
                    self.base,
                    node,
                    addr,
                    addr + block
                );
                Ok(addr)
            }
            None => Err(AllocError::OutOfMemory),
        }
    }

    /// Allocate, growing the heap once if it is growable and the current
    /// range cannot serve the request.
    pub fn try_allocate(&mut self, size: usize) -> AllocResult<usize> {
        let result = match self.allocate(size) {
            Err(AllocError::OutOfMemory) | Err(AllocError::TooLarge) if self.growable => {
                match self.block_size(size) {
                    Some(block) => self.grow_for(block).and_then(|_| self.allocate(size)),
                    None => Err(AllocError::TooLarge),
                }
            }
            other => other,
        };
        #[cfg(feature = "tracking")]
        {
            if result.is_err() {
                self.counters.failures += 1;
            }
        }
        result
    }

    /// Smallest doubled size after which a free block of `block` bytes exists.
    fn growth_target(&self, block: usize) -> Option<usize> {
        let root_free = self.tree.state(0).is_free();
        let mut target = self.size;
        loop {
            if target >= self.max_size {
                return None;
            }
            target *= 2;
            let largest_free = if root_free { target } else { target / 2 };
            if largest_free >= block {
                return Some(target);
            }
        }
    }

    fn grow_for(&mut self, block: usize) -> AllocResult {
        match self.growth_target(block) {
            Some(target) => self.grow_to(target),
            None => {
                debug!(
                    "kmalloc heap {:#x}: cannot grow past {:#x} for a {} byte block",
                    self.base, self.max_size, block
                );
                Err(AllocError::GrowthFailed)
            }
        }
    }

    /// Map `extra_bytes` more pages right after the current range and extend
    /// the tree over them. The heap always doubles, so `extra_bytes` must
    /// equal the current size.
    pub fn grow(&mut self, extra_bytes: usize) -> AllocResult {
        if extra_bytes != self.size {
            return Err(AllocError::InvalidParam);
        }
        if !self.growable || self.size >= self.max_size {
            return Err(AllocError::GrowthFailed);
        }
        self.grow_to(self.size + extra_bytes)
    }

    /// Double the heap until it spans `target` bytes. The whole extension is
    /// mapped by a single provider call, so a refusal leaves the heap as it was.
    fn grow_to(&mut self, target: usize) -> AllocResult {
        let provider = match self.backing {
            Some(provider) => provider,
            None => {
                warn!("kmalloc heap {:#x}: no backing provider to grow", self.base);
                return Err(AllocError::GrowthFailed);
            }
        };

        let vaddr = self.base + self.size;
        let pages = (target - self.size) / PAGE_SIZE;
        if !provider.map_pages(vaddr, pages) {
            warn!(
                "kmalloc heap {:#x}: failed to map {} pages at {:#x}",
                self.base, pages, vaddr
            );
            return Err(AllocError::GrowthFailed);
        }

        while self.size < target {
            if !self.tree.grow() {
                // Metadata is sized for max_size at creation.
                error!(
                    "kmalloc heap {:#x}: node tree cannot grow past {:#x} bytes",
                    self.base, self.size
                );
                provider.unmap_pages(self.base + self.size, (target - self.size) / PAGE_SIZE);
                return Err(AllocError::GrowthFailed);
            }
            self.size *= 2;
        }
        #[cfg(feature = "tracking")]
        {
            self.counters.grows += 1;
        }
        debug!(
            "kmalloc heap {:#x}: grew to {:#x} bytes",
            self.base, self.size
        );
        Ok(())
    }

    /// Give back the upper half of the range while it is unused and the heap
    /// is larger than it started. Returns the number of bytes unmapped.
    pub fn shrink(&mut self) -> usize {
        let provider = match self.backing {
            Some(provider) => provider,
            None => return 0,
        };
        let old_size = self.size;
        while self.size > self.initial_size && self.tree.shrink() {
            self.size /= 2;
        }
        let released = old_size - self.size;
        if released > 0 {
            provider.unmap_pages(self.base + self.size, released / PAGE_SIZE);
            #[cfg(feature = "tracking")]
            {
                self.counters.shrinks += 1;
            }
            debug!(
                "kmalloc heap {:#x}: shrank to {:#x} bytes",
                self.base, self.size
            );
        }
        released
    }

    /// Node of the live allocation `(addr, size)`, or `InvalidFree`.
    pub fn validate_free(&self, addr: usize, size: usize) -> AllocResult<usize> {
        if size == 0 || !self.contains(addr) {
            return Err(AllocError::InvalidFree);
        }
        let block = match self.block_size(size) {
            Some(block) if block <= self.size => block,
            _ => return Err(AllocError::InvalidFree),
        };
        let offset = addr - self.base;
        if !is_aligned(offset, block) {
            return Err(AllocError::InvalidFree);
        }
        let node = node::node_for_block(self.size, offset, block);
        if self.tree.state(node) != NodeState::Full {
            return Err(AllocError::InvalidFree);
        }
        Ok(node)
    }

    /// Release the allocation `(addr, size)`.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if the pair does not name a live allocation.
    /// Release builds log the error and leave the heap untouched.
    pub fn free(&mut self, addr: usize, size: usize) -> AllocResult {
        let node = match self.validate_free(addr, size) {
            Ok(node) => node,
            Err(_) => {
                error!("kmalloc heap {:#x}: no live block at {:#x}", self.base, addr);
                return invalid_free(addr, size);
            }
        };
        self.tree.free_block(node)?;
        self.alloced_bytes -= node::node_size(self.size, node);
        #[cfg(feature = "tracking")]
        {
            self.counters.frees += 1;
        }
        Ok(())
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            base: self.base,
            size: self.size,
            max_size: self.max_size,
            min_block_size: self.min_block_size,
            alloced_bytes: self.alloced_bytes,
            growable: self.growable,
            largest_free_block: self
                .tree
                .largest_free_order(0)
                .map_or(0, |order| self.min_block_size << order),
            free_blocks_by_order: self.tree.free_blocks_by_order(),
            #[cfg(feature = "tracking")]
            counters: self.counters,
        }
    }

    pub fn snapshot(&self) -> HeapSnapshot {
        self.snapshot_into(Vec::with_capacity(self.tree.len()))
    }

    /// Like [`snapshot`](Self::snapshot), but fills `nodes`. Does not allocate
    /// when `nodes` has room for every node of the current tree.
    pub fn snapshot_into(&self, mut nodes: Vec<NodeState>) -> HeapSnapshot {
        self.tree.snapshot_into(&mut nodes);
        HeapSnapshot {
            base: self.base,
            size: self.size,
            min_block_size: self.min_block_size,
            nodes,
        }
    }

    /// Number of nodes in the current tree.
    pub fn node_count(&self) -> usize {
        self.tree.len()
    }

    /// Check the tree invariants and that `alloced_bytes` matches the
    /// allocated blocks.
    pub fn check(&self) -> Result<(), InconsistentNode> {
        self.tree.check()?;
        let used: usize = self
            .tree
            .full_blocks_by_order()
            .iter()
            .enumerate()
            .map(|(order, count)| count * (self.min_block_size << order))
            .sum();
        if used != self.alloced_bytes || self.min_block_size << self.tree.max_order() != self.size {
            return Err(InconsistentNode {
                node: 0,
                state: self.tree.state(0),
                reason: "heap accounting does not match the tree",
            });
        }
        Ok(())
    }

    /// Log every node that is not free.
    pub fn dump(&self) {
        debug!(
            "kmalloc heap {:#x}: size {:#x}, {} nodes, {} bytes used",
            self.base,
            self.size,
            self.tree.len(),
            self.alloced_bytes
        );
        for (node, state) in self.tree.states().enumerate() {
            if state.is_free() {
                continue;
            }
            let _addr = self.base + node::node_offset(self.size, node);
            debug!(
                "  node {:>6} {:?} [{:#x}, +{:#x})",
                node,
                state,
                _addr,
                node::node_size(self.size, node)
            );
        }
    }
}

/// Report a free that names no live allocation.
pub(crate) fn invalid_free(addr: usize, size: usize) -> AllocResult {
    error!("kmalloc: invalid free of {:#x} ({} bytes)", addr, size);
    if cfg!(debug_assertions) {
        panic!("invalid free of {:#x} ({} bytes)", addr, size);
    }
    Err(AllocError::InvalidFree)
}
