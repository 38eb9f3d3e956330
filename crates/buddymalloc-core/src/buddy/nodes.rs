//! Packed node-state storage.
//!
//! Two nodes share one byte: node `i` lives in byte `i / 2`, even indices in
//! the high nibble and odd indices in the low nibble. A zeroed buffer is a
//! tree with every node free.

use super::state::NodeState;

/// Bounds-checked 4-bit accessor over a bin's metadata bytes.
#[derive(Debug)]
pub struct NodeStates<'m> {
    bytes: &'m mut [u8],
}

impl<'m> NodeStates<'m> {
    #[must_use]
    pub fn new(bytes: &'m mut [u8]) -> Self {
        Self { bytes }
    }

    /// Bytes needed to store `nodes` states.
    #[must_use]
    pub const fn bytes_for(nodes: usize) -> usize {
        nodes.div_ceil(2)
    }

    /// Number of node slots the buffer can hold.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.bytes.len() * 2
    }

    /// Read node `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is outside the buffer.
    #[must_use]
    pub fn get(&self, index: usize) -> NodeState {
        let byte = self.bytes[index / 2];
        let bits = if index % 2 == 0 { byte >> 4 } else { byte & 0x0f };
        debug_assert!(bits < 10, "corrupt node nibble {bits} at {index}");
        // Only this type writes the buffer; an unknown nibble is treated as
        // unusable rather than handed out.
        NodeState::from_bits(bits).unwrap_or(NodeState::BothFull)
    }

    /// Write node `index`, leaving its byte-mate untouched.
    ///
    /// # Panics
    ///
    /// Panics if `index` is outside the buffer.
    pub fn set(&mut self, index: usize, state: NodeState) {
        let byte = &mut self.bytes[index / 2];
        let bits = state.bits();
        *byte = if index % 2 == 0 {
            (*byte & 0x0f) | (bits << 4)
        } else {
            (*byte & 0xf0) | bits
        };
    }
}
