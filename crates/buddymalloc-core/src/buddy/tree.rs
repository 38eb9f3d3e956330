//! Recursive buddy search over one bin.

use super::nodes::NodeStates;
use super::state::{NodeState, Side};

const ROOT: usize = 0;

/// A block handed out by [`BuddyTree::allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    /// Start address of the block.
    pub addr: usize,
    /// Block size in bytes (the node size, not the request).
    pub size: usize,
}

/// Outcome of [`BuddyTree::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseResult {
    /// A granted block started at the address; its size in bytes.
    Freed(usize),
    /// The address is inside the bin but no granted block starts there
    /// (interior pointer or already released).
    NotFound,
}

/// View of a bin's buddy tree: the region `[base, base + size)` and the packed
/// node states describing it.
///
/// `size` and `leaf` are powers of two with `leaf <= size`; the state buffer
/// must hold at least `2 * size / leaf - 1` nodes.
#[derive(Debug)]
pub struct BuddyTree<'m> {
    nodes: NodeStates<'m>,
    base: usize,
    size: usize,
    leaf: usize,
}

#[inline]
const fn child(node: usize, side: Side) -> usize {
    match side {
        Side::Left => 2 * node + 1,
        Side::Right => 2 * node + 2,
    }
}

impl<'m> BuddyTree<'m> {
    /// Bytes of node metadata a bin of `size` bytes split down to `leaf`
    /// needs. A tree with `n` leaves has `2n - 1` nodes, which packs into
    /// exactly `n` bytes.
    #[must_use]
    pub const fn metadata_len(size: usize, leaf: usize) -> usize {
        NodeStates::bytes_for(2 * (size / leaf) - 1)
    }

    #[must_use]
    pub fn new(nodes: NodeStates<'m>, base: usize, size: usize, leaf: usize) -> Self {
        debug_assert!(size.is_power_of_two() && leaf.is_power_of_two() && leaf <= size);
        debug_assert!(nodes.capacity() >= 2 * (size / leaf) - 1);
        Self {
            nodes,
            base,
            size,
            leaf,
        }
    }

    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr - self.base < self.size
    }

    #[must_use]
    pub fn root_state(&self) -> NodeState {
        self.nodes.get(ROOT)
    }

    /// Grant the leftmost free block of the smallest size that still holds
    /// `request` bytes, never splitting below `min_block`.
    ///
    /// `min_block` is floored at the tree's leaf size.
    pub fn allocate(&mut self, request: usize, min_block: usize) -> Option<Grant> {
        let min_block = min_block.max(self.leaf);
        self.allocate_at(ROOT, self.base, self.size, request, min_block)
    }

    fn allocate_at(
        &mut self,
        node: usize,
        base: usize,
        size: usize,
        request: usize,
        min_block: usize,
    ) -> Option<Grant> {
        if size < min_block || size < request {
            return None;
        }
        let state = self.nodes.get(node);
        if state.is_exhausted() {
            return None;
        }

        let half = size / 2;
        if half < request || half < min_block {
            if state != NodeState::Free {
                return None;
            }
            self.nodes.set(node, NodeState::GrantedWhole);
            return Some(Grant { addr: base, size });
        }

        let left = self.allocate_at(child(node, Side::Left), base, half, request, min_block);
        let (side, grant) = match left {
            Some(grant) => (Side::Left, grant),
            None => {
                let right_base = base + half;
                let grant =
                    self.allocate_at(child(node, Side::Right), right_base, half, request, min_block)?;
                (Side::Right, grant)
            }
        };
        let occupancy = self.nodes.get(child(node, side)).occupancy();
        self.nodes.set(node, state.with_child(side, occupancy));
        Some(grant)
    }

    /// Free the granted block starting at `addr`.
    ///
    /// The caller has already established that the address lies inside this
    /// bin; addresses outside it are reported as [`ReleaseResult::NotFound`].
    pub fn release(&mut self, addr: usize) -> ReleaseResult {
        if !self.contains(addr) {
            return ReleaseResult::NotFound;
        }
        match self.release_at(ROOT, self.base, self.size, addr) {
            Some(bytes) => ReleaseResult::Freed(bytes),
            None => ReleaseResult::NotFound,
        }
    }

    fn release_at(&mut self, node: usize, base: usize, size: usize, addr: usize) -> Option<usize> {
        if size < self.leaf {
            return None;
        }
        let state = self.nodes.get(node);
        match state {
            NodeState::GrantedWhole if addr == base => {
                self.nodes.set(node, NodeState::Free);
                return Some(size);
            }
            // Nothing below a granted or free node is handed out.
            NodeState::GrantedWhole | NodeState::Free => return None,
            _ => {}
        }

        let half = size / 2;
        let (side, child_base) = if addr < base + half {
            (Side::Left, base)
        } else {
            (Side::Right, base + half)
        };
        let freed = self.release_at(child(node, side), child_base, half, addr)?;
        let occupancy = self.nodes.get(child(node, side)).occupancy();
        self.nodes.set(node, state.with_child(side, occupancy));
        Some(freed)
    }

    /// Size of the granted block starting at `addr`, if any.
    #[must_use]
    pub fn block_size(&self, addr: usize) -> Option<usize> {
        if !self.contains(addr) {
            return None;
        }
        let (mut node, mut base, mut size) = (ROOT, self.base, self.size);
        while size >= self.leaf {
            match self.nodes.get(node) {
                NodeState::GrantedWhole => return (addr == base).then_some(size),
                NodeState::Free => return None,
                _ => {}
            }
            size /= 2;
            if addr < base + size {
                node = child(node, Side::Left);
            } else {
                node = child(node, Side::Right);
                base += size;
            }
        }
        None
    }
}
