//! Allocation failure kinds.

use thiserror::Error;

use crate::errno;

/// Why an allocation request could not be satisfied.
///
/// Release never fails: unknown and already-released addresses are ignored,
/// so this type only describes the allocate side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The OS refused to map the pages a new bin or metadata page needed.
    #[error("out of memory: could not map {bytes} bytes")]
    OutOfMemory { bytes: usize },
    /// Alignment was not a power of two or was below the minimum alignment.
    #[error("invalid alignment {alignment} (minimum {minimum})")]
    InvalidAlignment { alignment: usize, minimum: usize },
    /// Size arithmetic (element count times size, or page rounding) overflowed.
    #[error("requested size overflows the address space")]
    SizeOverflow,
    /// The arena handle was registered with a different heap.
    #[error("arena handle belongs to a different heap")]
    ForeignArena,
}

impl AllocError {
    /// The errno value the C surface reports for this failure.
    #[must_use]
    pub const fn errno(self) -> i32 {
        match self {
            Self::OutOfMemory { .. } | Self::SizeOverflow => errno::ENOMEM,
            Self::InvalidAlignment { .. } | Self::ForeignArena => errno::EINVAL,
        }
    }
}
