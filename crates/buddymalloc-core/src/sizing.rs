//! Bin sizing rules.
//!
//! Bins are always a power-of-two number of pages, never fewer than the
//! configured minimum, so every bin (and every block inside it) is naturally
//! aligned once the bin itself is mapped at a multiple of its size.

use crate::error::AllocError;

/// Page size used when the OS cannot be asked.
pub const DEFAULT_PAGE_SIZE: usize = 4096;
/// Smallest block the buddy tree tracks.
pub const MIN_BLOCK_SIZE: usize = 8;
/// Smallest alignment handed out; the platform word size.
pub const MIN_ALIGNMENT: usize = size_of::<usize>();
/// Smallest bin, in pages.
pub const MIN_BIN_PAGES: usize = 128;

/// Check a caller-supplied alignment.
pub fn validate_alignment(alignment: usize, minimum: usize) -> Result<(), AllocError> {
    if alignment.is_power_of_two() && alignment >= minimum {
        Ok(())
    } else {
        Err(AllocError::InvalidAlignment { alignment, minimum })
    }
}

/// Page count of the bin that would serve a `size`-byte request whose blocks
/// may not be smaller than `min_block`.
///
/// This is the smallest power of two `p` with `p * page_size >= max(size,
/// min_block)`, floored at `min_pages`.
pub fn bin_pages(
    size: usize,
    min_block: usize,
    page_size: usize,
    min_pages: usize,
) -> Result<usize, AllocError> {
    let bytes = size.max(min_block);
    let pages = bytes
        .div_ceil(page_size)
        .checked_next_power_of_two()
        .ok_or(AllocError::SizeOverflow)?
        .max(min_pages);
    pages
        .checked_mul(page_size)
        .ok_or(AllocError::SizeOverflow)?;
    Ok(pages)
}

/// Byte length of a bin of `pages` pages.
#[must_use]
pub const fn bin_bytes(pages: usize, page_size: usize) -> usize {
    pages * page_size
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 4096;

    #[test]
    fn test_small_requests_use_minimum_bin() {
        assert_eq!(bin_pages(1, 8, PAGE, MIN_BIN_PAGES), Ok(128));
        assert_eq!(bin_pages(128 * PAGE, 8, PAGE, MIN_BIN_PAGES), Ok(128));
    }

    #[test]
    fn test_large_requests_round_to_power_of_two_pages() {
        assert_eq!(bin_pages(128 * PAGE + 1, 8, PAGE, MIN_BIN_PAGES), Ok(256));
        assert_eq!(bin_pages(300 * PAGE, 8, PAGE, MIN_BIN_PAGES), Ok(512));
        assert_eq!(bin_pages(PAGE + 1, 8, PAGE, 1), Ok(2));
        assert_eq!(bin_pages(1, 8, PAGE, 1), Ok(1));
    }

    #[test]
    fn test_alignment_can_drive_bin_size() {
        assert_eq!(bin_pages(8, 4 * PAGE, PAGE, 1), Ok(4));
    }

    #[test]
    fn test_overflow_is_reported() {
        assert_eq!(
            bin_pages(usize::MAX - 10, 8, PAGE, MIN_BIN_PAGES),
            Err(AllocError::SizeOverflow)
        );
        assert_eq!(
            bin_pages(usize::MAX / 2 + 2, 8, PAGE, MIN_BIN_PAGES),
            Err(AllocError::SizeOverflow)
        );
    }

    #[test]
    fn test_validate_alignment() {
        assert!(validate_alignment(8, MIN_ALIGNMENT).is_ok());
        assert!(validate_alignment(4096, MIN_ALIGNMENT).is_ok());
        assert_eq!(
            validate_alignment(12, 8),
            Err(AllocError::InvalidAlignment {
                alignment: 12,
                minimum: 8
            })
        );
        assert!(validate_alignment(4, 8).is_err());
        assert!(validate_alignment(0, 8).is_err());
    }
}
