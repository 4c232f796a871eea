//! Node states and index arithmetic
//!
//! The tree is never linked by pointers. Every relation between nodes, and
//! between a node and the address range it covers, is computed from its index.

/// Allocation state of one node of the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeState {
    /// The whole range is free and unsplit.
    Free = 0,
    /// The range is divided in two buddies, at least one of them in use.
    Split = 1,
    /// The range is one allocated block.
    Full = 2,
}

impl NodeState {
    pub const fn is_free(self) -> bool {
        matches!(self, NodeState::Free)
    }

    /// Decode the two low bits of a packed node byte.
    #[inline]
    pub(crate) const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => NodeState::Free,
            1 => NodeState::Split,
            _ => NodeState::Full,
        }
    }
}

/// Index of the left child of `node`.
#[inline]
pub const fn left(node: usize) -> usize {
    2 * node + 1
}

/// Index of the right child of `node`.
#[inline]
pub const fn right(node: usize) -> usize {
    2 * node + 2
}

/// Index of the parent of `node`. The root has no parent.
#[inline]
pub const fn parent(node: usize) -> usize {
    debug_assert!(node > 0);
    (node - 1) / 2
}

#[inline]
pub const fn is_left(node: usize) -> bool {
    node & 1 != 0
}

/// The buddy of `node`: the other child of its parent.
#[inline]
pub const fn sibling(node: usize) -> usize {
    debug_assert!(node > 0);
    if is_left(node) {
        node + 1
    } else {
        node - 1
    }
}

/// Depth of `node`, the root being at depth 0.
#[inline]
pub const fn depth(node: usize) -> u32 {
    usize::BITS - 1 - (node + 1).leading_zeros()
}

/// Index of the first (leftmost) node at `depth`.
#[inline]
pub const fn level_start(depth: u32) -> usize {
    (1usize << depth) - 1
}

/// Block size covered by `node` in a tree spanning `heap_size` bytes.
#[inline]
pub const fn node_size(heap_size: usize, node: usize) -> usize {
    heap_size >> depth(node)
}

/// Offset from the heap base of the block covered by `node`.
#[inline]
pub const fn node_offset(heap_size: usize, node: usize) -> usize {
    let d = depth(node);
    (node - level_start(d)) * (heap_size >> d)
}

/// Node covering the block of `block_size` bytes at `offset` from the heap base.
///
/// Both sizes must be powers of two with `block_size <= heap_size`, and
/// `offset` must be a multiple of `block_size` below `heap_size`.
#[inline]
pub const fn node_for_block(heap_size: usize, offset: usize, block_size: usize) -> usize {
    let d = heap_size.trailing_zeros() - block_size.trailing_zeros();
    level_start(d) + offset / block_size
}

/// Number of nodes needed to describe `heap_size` bytes down to `min_block_size`.
/// Zero when `heap_size` cannot hold a single block.
#[inline]
pub const fn node_count(heap_size: usize, min_block_size: usize) -> usize {
    if min_block_size == 0 || heap_size < min_block_size {
        return 0;
    }
    (heap_size / min_block_size).saturating_mul(2) - 1
}

/// Index that `node` takes when the tree gains a new root above the current
/// one and the current tree becomes its left subtree.
#[inline]
pub const fn index_under_new_root(node: usize) -> usize {
    let d = depth(node);
    level_start(d + 1) + (node - level_start(d))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: usize = 1024 * 1024;

    #[test]
    fn test_family_relations() {
        assert_eq!(left(0), 1);
        assert_eq!(right(0), 2);
        assert_eq!(parent(1), 0);
        assert_eq!(parent(2), 0);
        assert_eq!(parent(left(5)), 5);
        assert_eq!(parent(right(5)), 5);
        assert_eq!(sibling(1), 2);
        assert_eq!(sibling(2), 1);
        assert_eq!(sibling(11), 12);
        assert!(is_left(11));
        assert!(!is_left(12));
    }

    #[test]
    fn test_depth_and_level_start() {
        assert_eq!(depth(0), 0);
        assert_eq!(depth(1), 1);
        assert_eq!(depth(2), 1);
        assert_eq!(depth(3), 2);
        assert_eq!(depth(6), 2);
        assert_eq!(depth(7), 3);
        assert_eq!(level_start(0), 0);
        assert_eq!(level_start(3), 7);
    }

    #[test]
    fn test_node_geometry() {
        assert_eq!(node_size(MIB, 0), MIB);
        assert_eq!(node_size(MIB, 2), MIB / 2);
        assert_eq!(node_size(MIB, 6), MIB / 4);
        assert_eq!(node_offset(MIB, 0), 0);
        assert_eq!(node_offset(MIB, 2), MIB / 2);
        assert_eq!(node_offset(MIB, 5), MIB / 2);
        assert_eq!(node_offset(MIB, 6), 3 * MIB / 4);
    }

    #[test]
    fn test_node_for_block_inverts_geometry() {
        for node in 0..node_count(MIB, MIB / 64) {
            let size = node_size(MIB, node);
            let offset = node_offset(MIB, node);
            assert_eq!(node_for_block(MIB, offset, size), node);
        }
    }

    #[test]
    fn test_node_count() {
        assert_eq!(node_count(MIB, 32), 2 * (MIB / 32) - 1);
        assert_eq!(node_count(64, 64), 1);
        assert_eq!(node_count(16, 32), 0);
        assert_eq!(node_count(64, 0), 0);
    }

    #[test]
    fn test_index_under_new_root() {
        assert_eq!(index_under_new_root(0), 1);
        assert_eq!(index_under_new_root(1), 3);
        assert_eq!(index_under_new_root(2), 4);
        assert_eq!(index_under_new_root(6), 10);
        // Same offset and size once the heap doubles.
        for node in 0..15 {
            let moved = index_under_new_root(node);
            assert_eq!(node_size(2 * MIB, moved), node_size(MIB, node));
            assert_eq!(node_offset(2 * MIB, moved), node_offset(MIB, node));
        }
    }
}
