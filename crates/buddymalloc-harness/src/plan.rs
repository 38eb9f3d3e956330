//! Where a single request would land, without touching a heap.

use buddymalloc_core::sizing;
use buddymalloc_heap::HeapConfig;
use serde::Serialize;

use crate::error::HarnessError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RequestPlan {
    pub size: usize,
    pub alignment: usize,
    /// Bytes the request will actually occupy.
    pub block_size: usize,
    /// Pages of a freshly created bin able to hold the request.
    pub bin_pages: usize,
    pub bin_bytes: usize,
    /// Blocks of this size one such bin holds.
    pub blocks_per_bin: usize,
}

/// Block and bin size for `size` bytes at `alignment` (`None` = the minimum).
pub fn plan_request(
    config: &HeapConfig,
    size: usize,
    alignment: Option<usize>,
) -> Result<RequestPlan, HarnessError> {
    let alignment = alignment.unwrap_or(config.min_alignment());
    sizing::validate_alignment(alignment, config.min_alignment())?;
    let request = size.max(1);
    let min_block = alignment.max(config.min_block_size());
    let bin_pages = sizing::bin_pages(request, min_block, config.page_size(), config.min_bin_pages())?;
    let bin_bytes = sizing::bin_bytes(bin_pages, config.page_size());
    let block_size = request.max(min_block).next_power_of_two();
    Ok(RequestPlan {
        size,
        alignment,
        block_size,
        bin_pages,
        bin_bytes,
        blocks_per_bin: bin_bytes / block_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HeapConfig {
        HeapConfig::builder().build().expect("defaults")
    }

    #[test]
    fn small_request_rounds_to_power_of_two() {
        let c = config();
        let plan = plan_request(&c, 100, None).expect("plan");
        assert_eq!(plan.block_size, 128);
        assert_eq!(plan.bin_pages, 128);
        assert_eq!(plan.blocks_per_bin, 128 * c.page_size() / 128);
    }

    #[test]
    fn zero_byte_request_takes_minimum_block() {
        let plan = plan_request(&config(), 0, None).expect("plan");
        assert_eq!(plan.block_size, 8);
    }

    #[test]
    fn alignment_raises_block_size() {
        let plan = plan_request(&config(), 3, Some(512)).expect("plan");
        assert_eq!(plan.block_size, 512);
    }

    #[test]
    fn large_request_fills_its_bin() {
        let c = config();
        let plan = plan_request(&c, 300 * c.page_size(), None).expect("plan");
        assert_eq!(plan.bin_pages, 512);
        assert_eq!(plan.blocks_per_bin, 1);
    }

    #[test]
    fn bad_alignment_is_rejected() {
        assert!(matches!(
            plan_request(&config(), 8, Some(24)),
            Err(HarnessError::Alloc(_))
        ));
    }
}
