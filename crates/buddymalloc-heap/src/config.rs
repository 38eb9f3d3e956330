//! Heap configuration.
//!
//! The heap reads no environment variables or files. The page size comes from
//! the OS once per process; everything else is fixed at construction through
//! [`HeapConfig::builder`].

#![allow(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};

use buddymalloc_core::AllocatorLogLevel;
use buddymalloc_core::sizing::{DEFAULT_PAGE_SIZE, MIN_ALIGNMENT, MIN_BIN_PAGES, MIN_BLOCK_SIZE};
use thiserror::Error;

// 0 = not yet probed. sysconf is idempotent, so racing probes agree.
static CACHED_PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// The OS page size, probed on first call and cached thereafter.
///
/// Falls back to 4096 when `sysconf` fails or reports something that is not a
/// power of two.
#[must_use]
pub fn page_size() -> usize {
    let cached = CACHED_PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    // SAFETY: sysconf has no memory-safety preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let probed = usize::try_from(raw)
        .ok()
        .filter(|p| p.is_power_of_two())
        .unwrap_or(DEFAULT_PAGE_SIZE);
    CACHED_PAGE_SIZE.store(probed, Ordering::Relaxed);
    probed
}

/// Rejected configuration values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("minimum block size {0} must be a power of two between 8 and the page size")]
    MinBlockSize(usize),
    #[error("minimum alignment {0} must be a power of two between the word size and the page size")]
    MinAlignment(usize),
    #[error("minimum bin pages {0} must be a non-zero power of two")]
    MinBinPages(usize),
}

/// Validated heap parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    page_size: usize,
    min_block_size: usize,
    min_alignment: usize,
    min_bin_pages: usize,
    log_level: AllocatorLogLevel,
}

impl HeapConfig {
    /// Defaults on the probed page size.
    #[must_use]
    pub fn detect() -> Self {
        Self {
            page_size: page_size(),
            min_block_size: MIN_BLOCK_SIZE,
            min_alignment: MIN_ALIGNMENT,
            min_bin_pages: MIN_BIN_PAGES,
            log_level: AllocatorLogLevel::Warn,
        }
    }

    #[must_use]
    pub fn builder() -> HeapConfigBuilder {
        HeapConfigBuilder {
            inner: Self::detect(),
        }
    }

    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Leaf size of every buddy tree.
    #[must_use]
    pub const fn min_block_size(&self) -> usize {
        self.min_block_size
    }

    #[must_use]
    pub const fn min_alignment(&self) -> usize {
        self.min_alignment
    }

    #[must_use]
    pub const fn min_bin_pages(&self) -> usize {
        self.min_bin_pages
    }

    /// Lowest lifecycle level that is recorded.
    #[must_use]
    pub const fn log_level(&self) -> AllocatorLogLevel {
        self.log_level
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::detect()
    }
}

/// Builder for [`HeapConfig`]; starts from [`HeapConfig::detect`].
#[derive(Debug, Clone, Copy)]
pub struct HeapConfigBuilder {
    inner: HeapConfig,
}

impl HeapConfigBuilder {
    #[must_use]
    pub const fn min_block_size(mut self, bytes: usize) -> Self {
        self.inner.min_block_size = bytes;
        self
    }

    #[must_use]
    pub const fn min_alignment(mut self, bytes: usize) -> Self {
        self.inner.min_alignment = bytes;
        self
    }

    #[must_use]
    pub const fn min_bin_pages(mut self, pages: usize) -> Self {
        self.inner.min_bin_pages = pages;
        self
    }

    #[must_use]
    pub const fn log_level(mut self, level: AllocatorLogLevel) -> Self {
        self.inner.log_level = level;
        self
    }

    pub fn build(self) -> Result<HeapConfig, ConfigError> {
        let c = self.inner;
        if !c.min_block_size.is_power_of_two()
            || c.min_block_size < MIN_BLOCK_SIZE
            || c.min_block_size > c.page_size
        {
            return Err(ConfigError::MinBlockSize(c.min_block_size));
        }
        if !c.min_alignment.is_power_of_two()
            || c.min_alignment < MIN_ALIGNMENT
            || c.min_alignment > c.page_size
        {
            return Err(ConfigError::MinAlignment(c.min_alignment));
        }
        if !c.min_bin_pages.is_power_of_two() {
            return Err(ConfigError::MinBinPages(c.min_bin_pages));
        }
        Ok(c)
    }
}
