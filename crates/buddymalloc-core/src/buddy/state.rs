//! Node states and the transition rule.
//!
//! A node's state is always a function of its children's occupancy, except
//! for [`NodeState::GrantedWhole`] which records that the whole subtree was
//! handed out as one block. Allocation and release therefore share a single
//! rule: take the prior state, replace the occupancy of the side that changed,
//! and re-encode.

/// Occupancy of a subtree as seen from its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Occupancy {
    /// Nothing below is handed out.
    Free,
    /// Partially handed out; may still satisfy a request.
    Used,
    /// Nothing below can be handed out.
    Full,
}

/// Which half of a node a change happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Left,
    Right,
}

/// Packed 4-bit node state. The numeric values are part of the metadata
/// layout and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NodeState {
    Free = 0,
    RightUsedLeftFree = 1,
    LeftUsedRightFree = 2,
    BothUsed = 3,
    RightFullLeftFree = 4,
    LeftFullRightFree = 5,
    RightFullLeftUsed = 6,
    LeftFullRightUsed = 7,
    BothFull = 8,
    GrantedWhole = 9,
}

impl NodeState {
    /// Every state in numeric order.
    pub const ALL: [NodeState; 10] = [
        Self::Free,
        Self::RightUsedLeftFree,
        Self::LeftUsedRightFree,
        Self::BothUsed,
        Self::RightFullLeftFree,
        Self::LeftFullRightFree,
        Self::RightFullLeftUsed,
        Self::LeftFullRightUsed,
        Self::BothFull,
        Self::GrantedWhole,
    ];

    /// Decode a nibble. Values above 9 never appear in well-formed metadata.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Option<Self> {
        if (bits as usize) < Self::ALL.len() {
            Some(Self::ALL[bits as usize])
        } else {
            None
        }
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        self as u8
    }

    /// Occupancy of the (left, right) halves.
    ///
    /// A granted node reports both halves full: nothing below it may be
    /// handed out separately.
    #[must_use]
    pub const fn halves(self) -> (Occupancy, Occupancy) {
        use Occupancy::{Free, Full, Used};
        match self {
            Self::Free => (Free, Free),
            Self::RightUsedLeftFree => (Free, Used),
            Self::LeftUsedRightFree => (Used, Free),
            Self::BothUsed => (Used, Used),
            Self::RightFullLeftFree => (Free, Full),
            Self::LeftFullRightFree => (Full, Free),
            Self::RightFullLeftUsed => (Used, Full),
            Self::LeftFullRightUsed => (Full, Used),
            Self::BothFull | Self::GrantedWhole => (Full, Full),
        }
    }

    /// Encode a pair of half occupancies.
    #[must_use]
    pub const fn from_halves(left: Occupancy, right: Occupancy) -> Self {
        use Occupancy::{Free, Full, Used};
        match (left, right) {
            (Free, Free) => Self::Free,
            (Free, Used) => Self::RightUsedLeftFree,
            (Used, Free) => Self::LeftUsedRightFree,
            (Used, Used) => Self::BothUsed,
            (Free, Full) => Self::RightFullLeftFree,
            (Full, Free) => Self::LeftFullRightFree,
            (Used, Full) => Self::RightFullLeftUsed,
            (Full, Used) => Self::LeftFullRightUsed,
            (Full, Full) => Self::BothFull,
        }
    }

    /// How this node looks to its parent.
    #[must_use]
    pub const fn occupancy(self) -> Occupancy {
        match self {
            Self::Free => Occupancy::Free,
            Self::BothFull | Self::GrantedWhole => Occupancy::Full,
            _ => Occupancy::Used,
        }
    }

    /// True when no request can be satisfied anywhere in this subtree.
    #[must_use]
    pub const fn is_exhausted(self) -> bool {
        matches!(self, Self::BothFull | Self::GrantedWhole)
    }

    /// State after the child on `side` changed to `child`, the other half
    /// keeping its prior occupancy.
    #[must_use]
    pub const fn with_child(self, side: Side, child: Occupancy) -> Self {
        let (left, right) = self.halves();
        match side {
            Side::Left => Self::from_halves(child, right),
            Side::Right => Self::from_halves(left, child),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Occupancy::{Free, Full, Used};

    #[test]
    fn test_bits_roundtrip_and_rejects_out_of_range() {
        for (i, state) in NodeState::ALL.iter().enumerate() {
            assert_eq!(state.bits() as usize, i);
            assert_eq!(NodeState::from_bits(i as u8), Some(*state));
        }
        for bits in 10..=15u8 {
            assert_eq!(NodeState::from_bits(bits), None, "nibble {bits}");
        }
    }

    #[test]
    fn test_halves_encoding_is_bijective_on_summary_states() {
        for state in NodeState::ALL {
            if state == NodeState::GrantedWhole {
                continue;
            }
            let (l, r) = state.halves();
            assert_eq!(NodeState::from_halves(l, r), state);
        }
    }

    #[test]
    fn test_occupancy_classification() {
        assert_eq!(NodeState::Free.occupancy(), Free);
        assert_eq!(NodeState::BothFull.occupancy(), Full);
        assert_eq!(NodeState::GrantedWhole.occupancy(), Full);
        for state in &NodeState::ALL[1..8] {
            assert_eq!(state.occupancy(), Used, "{state:?}");
        }
    }

    // Left-child allocation transitions, one row per prior state that can
    // still route a request left: (prior, child becomes Used, child becomes Full).
    const LEFT_ALLOC: [(NodeState, NodeState, NodeState); 6] = [
        (
            NodeState::Free,
            NodeState::LeftUsedRightFree,
            NodeState::LeftFullRightFree,
        ),
        (
            NodeState::RightUsedLeftFree,
            NodeState::BothUsed,
            NodeState::LeftFullRightUsed,
        ),
        (
            NodeState::LeftUsedRightFree,
            NodeState::LeftUsedRightFree,
            NodeState::LeftFullRightFree,
        ),
        (
            NodeState::BothUsed,
            NodeState::BothUsed,
            NodeState::LeftFullRightUsed,
        ),
        (
            NodeState::RightFullLeftFree,
            NodeState::RightFullLeftUsed,
            NodeState::BothFull,
        ),
        (
            NodeState::RightFullLeftUsed,
            NodeState::RightFullLeftUsed,
            NodeState::BothFull,
        ),
    ];

    #[test]
    fn test_left_allocation_table() {
        for (prior, used, full) in LEFT_ALLOC {
            assert_eq!(prior.with_child(Side::Left, Used), used, "{prior:?} + used");
            assert_eq!(prior.with_child(Side::Left, Full), full, "{prior:?} + full");
        }
    }

    #[test]
    fn test_right_allocation_table() {
        let table = [
            (
                NodeState::Free,
                NodeState::RightUsedLeftFree,
                NodeState::RightFullLeftFree,
            ),
            (
                NodeState::LeftUsedRightFree,
                NodeState::BothUsed,
                NodeState::RightFullLeftUsed,
            ),
            (
                NodeState::LeftFullRightFree,
                NodeState::LeftFullRightUsed,
                NodeState::BothFull,
            ),
            (
                NodeState::LeftFullRightUsed,
                NodeState::LeftFullRightUsed,
                NodeState::BothFull,
            ),
            (
                NodeState::BothUsed,
                NodeState::BothUsed,
                NodeState::RightFullLeftUsed,
            ),
        ];
        for (prior, used, full) in table {
            assert_eq!(prior.with_child(Side::Right, Used), used, "{prior:?} + used");
            assert_eq!(prior.with_child(Side::Right, Full), full, "{prior:?} + full");
        }
    }

    #[test]
    fn test_release_transitions_never_leave_side_full() {
        for prior in NodeState::ALL {
            if prior == NodeState::GrantedWhole {
                continue;
            }
            for child in [Free, Used] {
                let left = prior.with_child(Side::Left, child);
                assert_eq!(left.halves().0, child, "{prior:?} left <- {child:?}");
                assert_eq!(left.halves().1, prior.halves().1);
                let right = prior.with_child(Side::Right, child);
                assert_eq!(right.halves().1, child, "{prior:?} right <- {child:?}");
                assert_eq!(right.halves().0, prior.halves().0);
            }
        }
        assert_eq!(
            NodeState::LeftFullRightFree.with_child(Side::Left, Free),
            NodeState::Free
        );
        assert_eq!(
            NodeState::BothFull.with_child(Side::Right, Used),
            NodeState::LeftFullRightUsed
        );
    }

    #[test]
    fn test_exhausted_states() {
        let exhausted: Vec<_> = NodeState::ALL
            .into_iter()
            .filter(|s| s.is_exhausted())
            .collect();
        assert_eq!(exhausted, vec![NodeState::BothFull, NodeState::GrantedWhole]);
    }
}
