//! Node state tree
//!
//! A complete binary tree stored as one flat byte per node, indexed by node.
//! The two low bits hold the allocation state and the upper six bits cache the
//! largest free block order found in the node's subtree. Orders are relative
//! to the heap's minimum block size, so a node of order `k` covers
//! `min_block_size << k` bytes.
//!
//! The bytes live in storage handed over by the owner of the tree. A heap uses
//! a `'static` metadata region sized for its largest extent, so growing and
//! shrinking rewrite the region in place and never allocate.

use alloc::vec::Vec;

use super::node::{depth, left, level_start, parent, right, NodeState};

/// Cache value meaning "no free block in this subtree".
const NO_FREE_BLOCK: u8 = 0;

const STATE_MASK: u8 = 0b11;
const CACHE_SHIFT: u32 = 2;

/// Orders must fit the cache encoding (`order + 1` in six bits) and `usize` shifts.
pub const MAX_TREE_ORDER: u32 = usize::BITS - 2;

/// Length of the per-order count arrays.
pub const ORDER_SLOTS: usize = MAX_TREE_ORDER as usize + 1;

/// A node that breaks one of the tree invariants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InconsistentNode {
    pub node: usize,
    pub state: NodeState,
    pub reason: &'static str,
}

/// Bytes of storage a tree whose root has order `max_order` needs.
pub const fn storage_size(max_order: u32) -> usize {
    level_start(max_order + 1)
}

#[inline]
const fn pack(state: NodeState, cache: u8) -> u8 {
    (cache << CACHE_SHIFT) | state as u8
}

/// Per-heap tree of node states over the byte storage `S`.
#[derive(Clone)]
pub struct NodeStateTree<S = &'static mut [u8]> {
    nodes: S,
    max_order: u32,
}

impl<S> NodeStateTree<S> {
    #[inline]
    const fn free_mark(order: u32) -> u8 {
        (order + 1) as u8
    }

    /// Order of the root, i.e. `log2(heap size / min block size)`.
    pub const fn max_order(&self) -> u32 {
        self.max_order
    }

    /// Number of nodes in use, which is less than the storage while the tree
    /// can still grow.
    pub const fn len(&self) -> usize {
        storage_size(self.max_order)
    }

    pub const fn is_empty(&self) -> bool {
        false
    }

    #[inline]
    pub const fn order_of(&self, node: usize) -> u32 {
        self.max_order - depth(node)
    }

    #[inline]
    pub(crate) const fn is_leaf(&self, node: usize) -> bool {
        left(node) >= self.len()
    }
}

impl<S: AsRef<[u8]> + AsMut<[u8]>> NodeStateTree<S> {
    /// Create an all-free tree whose root has order `max_order` over `storage`.
    ///
    /// Returns `None` if the order is out of range or the storage is smaller
    /// than [`storage_size`].
    pub fn new(max_order: u32, mut storage: S) -> Option<Self> {
        if max_order > MAX_TREE_ORDER || storage.as_ref().len() < storage_size(max_order) {
            return None;
        }
        let nodes = storage.as_mut();
        for d in 0..=max_order {
            nodes[level_start(d)..level_start(d + 1)]
                .fill(pack(NodeState::Free, Self::free_mark(max_order - d)));
        }
        Some(Self {
            nodes: storage,
            max_order,
        })
    }

    #[inline]
    fn byte(&self, node: usize) -> u8 {
        self.nodes.as_ref()[node]
    }

    #[inline]
    fn cache(&self, node: usize) -> u8 {
        self.byte(node) >> CACHE_SHIFT
    }

    #[inline]
    pub fn state(&self, node: usize) -> NodeState {
        NodeState::from_bits(self.byte(node) & STATE_MASK)
    }

    /// All node states in node order.
    pub fn states(&self) -> impl Iterator<Item = NodeState> + '_ {
        self.nodes.as_ref()[..self.len()]
            .iter()
            .map(|&b| NodeState::from_bits(b & STATE_MASK))
    }

    /// Owned copy of the node states, for before/after comparisons.
    pub fn snapshot(&self) -> Vec<NodeState> {
        let mut states = Vec::with_capacity(self.len());
        self.snapshot_into(&mut states);
        states
    }

    /// Replace the contents of `states` with the node states. Does not
    /// allocate when `states` already has room for [`len`](Self::len) entries.
    pub fn snapshot_into(&self, states: &mut Vec<NodeState>) {
        states.clear();
        states.extend(self.states());
    }

    /// Order of the largest free block inside `node`'s subtree.
    #[inline]
    pub fn largest_free_order(&self, node: usize) -> Option<u32> {
        (self.cache(node) as u32).checked_sub(1)
    }

    /// Whether `node`'s subtree holds a free block of at least `order`.
    #[inline]
    pub fn fits(&self, node: usize, order: u32) -> bool {
        self.cache(node) as u32 > order
    }

    /// True when every node is free, i.e. the tree is as freshly created.
    pub fn is_pristine(&self) -> bool {
        self.states().all(|s| s.is_free())
    }

    #[inline]
    pub(crate) fn set_state(&mut self, node: usize, state: NodeState) {
        let cache = self.cache(node);
        self.nodes.as_mut()[node] = pack(state, cache);
        self.refresh(node);
    }

    /// Cache value `node` should hold given its state and its children.
    #[inline]
    fn expected_cache(&self, node: usize) -> u8 {
        match self.state(node) {
            NodeState::Free => Self::free_mark(self.order_of(node)),
            NodeState::Full => NO_FREE_BLOCK,
            NodeState::Split => self.cache(left(node)).max(self.cache(right(node))),
        }
    }

    /// Recompute the cache of `node` from its state and its children.
    #[inline]
    fn refresh(&mut self, node: usize) {
        let cache = self.expected_cache(node);
        let state = self.state(node);
        self.nodes.as_mut()[node] = pack(state, cache);
    }

    /// Recompute the caches of every strict ancestor of `node`.
    pub(crate) fn refresh_ancestors(&mut self, mut node: usize) {
        while node > 0 {
            node = parent(node);
            self.refresh(node);
        }
    }

    /// Whether the storage has room for one more level.
    pub fn can_grow(&self) -> bool {
        self.max_order < MAX_TREE_ORDER
            && self.nodes.as_ref().len() >= storage_size(self.max_order + 1)
    }

    /// Double the covered range: the current tree becomes the left subtree of a
    /// new root and the right subtree is entirely free. Returns `false` without
    /// touching anything if the storage has no room for another level.
    pub fn grow(&mut self) -> bool {
        if !self.can_grow() {
            return false;
        }
        let old_max = self.max_order;
        let root_busy = !self.state(0).is_free();
        let nodes = self.nodes.as_mut();
        // Deepest level first, so no level is overwritten before it moves.
        for d in (0..=old_max).rev() {
            let start = level_start(d);
            let width = 1usize << d;
            let dest = level_start(d + 1);
            nodes.copy_within(start..start + width, dest);
            nodes[dest + width..dest + 2 * width]
                .fill(pack(NodeState::Free, Self::free_mark(old_max - d)));
        }
        let root = if root_busy {
            NodeState::Split
        } else {
            NodeState::Free
        };
        nodes[0] = pack(root, NO_FREE_BLOCK);
        self.max_order = old_max + 1;
        self.refresh(0);
        true
    }

    /// Whether the upper half of the range is unused, so the tree can be
    /// replaced by its left subtree.
    pub fn can_shrink(&self) -> bool {
        self.max_order > 0
            && match self.state(0) {
                NodeState::Free => true,
                NodeState::Split => self.state(right(0)).is_free(),
                NodeState::Full => false,
            }
    }

    /// Halve the covered range, keeping the left subtree. Returns `false`
    /// without touching anything if the upper half is in use.
    pub fn shrink(&mut self) -> bool {
        if !self.can_shrink() {
            return false;
        }
        let new_max = self.max_order - 1;
        let nodes = self.nodes.as_mut();
        // Shallowest level first: the left half of level d + 1 becomes level d.
        for d in 0..=new_max {
            let start = level_start(d + 1);
            nodes.copy_within(start..start + (1usize << d), level_start(d));
        }
        self.max_order = new_max;
        true
    }

    /// Number of maximal free blocks (free nodes that are the root or the
    /// child of a split node), indexed by order.
    pub fn free_blocks_by_order(&self) -> [usize; ORDER_SLOTS] {
        let mut counts = [0; ORDER_SLOTS];
        for (node, state) in self.states().enumerate() {
            if state.is_free() && (node == 0 || self.state(parent(node)) == NodeState::Split) {
                counts[self.order_of(node) as usize] += 1;
            }
        }
        counts
    }

    /// Number of allocated blocks, indexed by order.
    pub fn full_blocks_by_order(&self) -> [usize; ORDER_SLOTS] {
        let mut counts = [0; ORDER_SLOTS];
        for (node, state) in self.states().enumerate() {
            if state == NodeState::Full {
                counts[self.order_of(node) as usize] += 1;
            }
        }
        counts
    }

    /// Verify the structural invariants of every node:
    /// - children of a free or full node are free;
    /// - a split node is not a leaf and does not have two free children;
    /// - the largest-free cache matches the node's state and children.
    pub fn check(&self) -> Result<(), InconsistentNode> {
        for (node, state) in self.states().enumerate() {
            let fail = |reason| {
                Err(InconsistentNode {
                    node,
                    state,
                    reason,
                })
            };
            if self.byte(node) & STATE_MASK == STATE_MASK {
                return fail("undefined state bits");
            }
            let leaf = self.is_leaf(node);
            let children_free =
                leaf || (self.state(left(node)).is_free() && self.state(right(node)).is_free());
            match state {
                NodeState::Free if !children_free => {
                    return fail("free node with a used descendant")
                }
                NodeState::Full if !children_free => {
                    return fail("allocated node with a used descendant")
                }
                NodeState::Split if leaf => return fail("split leaf"),
                NodeState::Split if children_free => {
                    return fail("split node with two free children")
                }
                _ => {}
            }
            if self.cache(node) != self.expected_cache(node) {
                return fail("stale largest-free cache");
            }
        }
        Ok(())
    }
}

impl<S: AsRef<[u8]> + AsMut<[u8]>> core::fmt::Debug for NodeStateTree<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NodeStateTree")
            .field("max_order", &self.max_order)
            .field("nodes", &self.len())
            .field("capacity", &self.nodes.as_ref().len())
            .field("largest_free_order", &self.largest_free_order(0))
            .finish()
    }
}
