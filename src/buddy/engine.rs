//! Buddy engine
//!
//! Split, coalesce and search-by-size over a [`NodeStateTree`]. Every search
//! is guided by the largest-free cache, so it walks a single root-to-node path.

use crate::{AllocError, AllocResult};

use super::node::{depth, left, parent, right, sibling, NodeState};
use super::tree::NodeStateTree;

/// Which child of a split node a search descends into when both could hold
/// the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DescentPolicy {
    /// Always the left child. Packs allocations towards low addresses.
    LeftFirst,
    /// The child whose largest free block is the smallest one that still
    /// fits, keeping big free blocks intact. Ties go left.
    #[default]
    BestFit,
}

/// One of the two children of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Child {
    Left,
    Right,
}

impl DescentPolicy {
    /// Pick the child to descend into, given the largest free order of each
    /// child's subtree and the order being searched for. `None` when neither
    /// child can satisfy the request.
    pub fn choose(self, left: Option<u32>, right: Option<u32>, order: u32) -> Option<Child> {
        let left = left.filter(|&o| o >= order);
        let right = right.filter(|&o| o >= order);
        match (left, right) {
            (None, None) => None,
            (Some(_), None) => Some(Child::Left),
            (None, Some(_)) => Some(Child::Right),
            (Some(l), Some(r)) => match self {
                DescentPolicy::LeftFirst => Some(Child::Left),
                DescentPolicy::BestFit if r < l => Some(Child::Right),
                DescentPolicy::BestFit => Some(Child::Left),
            },
        }
    }
}

impl<S: AsRef<[u8]> + AsMut<[u8]>> NodeStateTree<S> {
    /// Mark a free block of `order` as allocated and return its node.
    ///
    /// Free nodes above the target order met on the way down are split. Only
    /// nodes that were free are ever split, and a split is never undone here,
    /// so a `None` result leaves the tree untouched.
    pub fn alloc_block(&mut self, order: u32, policy: DescentPolicy) -> Option<usize> {
        if order > self.max_order() || !self.fits(0, order) {
            return None;
        }

        let target_depth = self.max_order() - order;
        let mut node = 0;
        while depth(node) < target_depth {
            match self.state(node) {
                NodeState::Free => {
                    // Children of a free node are already free.
                    self.set_state(node, NodeState::Split);
                    node = left(node);
                }
                NodeState::Split => {
                    let choice = policy.choose(
                        self.largest_free_order(left(node)),
                        self.largest_free_order(right(node)),
                        order,
                    );
                    node = match choice {
                        Some(Child::Left) => left(node),
                        Some(Child::Right) => right(node),
                        None => {
                            debug_assert!(false, "largest-free cache out of sync at node {}", node);
                            return None;
                        }
                    };
                }
                NodeState::Full => {
                    debug_assert!(false, "search reached allocated node {}", node);
                    return None;
                }
            }
        }

        debug_assert!(self.state(node).is_free());
        self.set_state(node, NodeState::Full);
        self.refresh_ancestors(node);
        Some(node)
    }

    /// Release the allocated block at `node` and merge it with free buddies.
    ///
    /// Returns the topmost node that ended up free. Fails with
    /// [`AllocError::InvalidFree`] if `node` is not an allocated block, in
    /// which case nothing changes.
    pub fn free_block(&mut self, node: usize) -> AllocResult<usize> {
        if node >= self.len() || self.state(node) != NodeState::Full {
            return Err(AllocError::InvalidFree);
        }

        self.set_state(node, NodeState::Free);
        let mut node = node;
        while node > 0 && self.state(sibling(node)).is_free() {
            node = parent(node);
            self.set_state(node, NodeState::Free);
        }
        self.refresh_ancestors(node);
        Ok(node)
    }
}
