//! Page provider.
//!
//! Anonymous private mappings from the OS. Pages are zeroed on arrival and
//! never returned once handed out: the heap only grows. Two ranges are
//! unmapped before anything touches them: the slop around an over-sized
//! mapping made to get a naturally aligned bin, and a bin whose metadata
//! could not be mapped.

#![allow(unsafe_code)]

use std::ffi::c_void;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use buddymalloc_core::AllocError;

/// Maps page-granular memory and counts what it mapped.
#[derive(Debug)]
pub struct PageProvider {
    page_size: usize,
    map_calls: AtomicU64,
    mapped_bytes: AtomicUsize,
    /// Lowest start and highest end of any range ever mapped.
    span_low: AtomicUsize,
    span_high: AtomicUsize,
    #[cfg(test)]
    map_budget: AtomicU64,
}

impl PageProvider {
    #[must_use]
    pub const fn new(page_size: usize) -> Self {
        Self {
            page_size,
            map_calls: AtomicU64::new(0),
            mapped_bytes: AtomicUsize::new(0),
            span_low: AtomicUsize::new(usize::MAX),
            span_high: AtomicUsize::new(0),
            #[cfg(test)]
            map_budget: AtomicU64::new(u64::MAX),
        }
    }

    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of `mmap` calls made so far.
    #[must_use]
    pub fn map_calls(&self) -> u64 {
        self.map_calls.load(Ordering::Relaxed)
    }

    /// Bytes currently committed (slop excluded).
    #[must_use]
    pub fn mapped_bytes(&self) -> usize {
        self.mapped_bytes.load(Ordering::Relaxed)
    }

    /// Whether `addr` lies between the lowest and highest address ever
    /// mapped. Lock-free and conservative: `false` means the address was
    /// never ours, `true` only that it might be.
    #[must_use]
    pub fn spans(&self, addr: usize) -> bool {
        self.span_low.load(Ordering::Acquire) <= addr && addr < self.span_high.load(Ordering::Acquire)
    }

    /// Map `bytes` rounded up to whole pages.
    pub fn map(&self, bytes: usize) -> Result<NonNull<u8>, AllocError> {
        self.map_aligned(bytes, self.page_size)
    }

    /// Map `bytes` rounded up to whole pages, starting at a multiple of
    /// `align` (a power of two).
    pub fn map_aligned(&self, bytes: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        debug_assert!(align.is_power_of_two());
        let len = bytes
            .checked_next_multiple_of(self.page_size)
            .ok_or(AllocError::SizeOverflow)?;
        if align <= self.page_size {
            let start = self.mmap(len)?;
            self.note_mapped(start.as_ptr() as usize, len);
            return Ok(start);
        }

        let span = len
            .checked_add(align - self.page_size)
            .ok_or(AllocError::SizeOverflow)?;
        let raw = self.mmap(span)?.as_ptr() as usize;
        let aligned = raw.next_multiple_of(align);
        let head = aligned - raw;
        let tail = span - head - len;
        if head > 0 {
            // SAFETY: [raw, aligned) is the untouched page-aligned prefix of
            // the mapping made above.
            unsafe { libc::munmap(raw as *mut c_void, head) };
        }
        if tail > 0 {
            // SAFETY: [aligned + len, raw + span) is the untouched suffix.
            unsafe { libc::munmap((aligned + len) as *mut c_void, tail) };
        }
        self.note_mapped(aligned, len);
        NonNull::new(aligned as *mut u8).ok_or(AllocError::OutOfMemory { bytes: len })
    }

    /// Give back a range returned by [`PageProvider::map_aligned`] with the
    /// same `bytes`. The span keeps covering it.
    ///
    /// # Safety
    ///
    /// Nothing may refer to the range, now or later.
    pub(crate) unsafe fn unmap(&self, start: NonNull<u8>, bytes: usize) {
        let len = bytes.next_multiple_of(self.page_size);
        // SAFETY: the caller hands over an untouched mapping of exactly len bytes.
        unsafe { libc::munmap(start.as_ptr().cast::<c_void>(), len) };
        self.mapped_bytes.fetch_sub(len, Ordering::Relaxed);
    }

    fn note_mapped(&self, start: usize, len: usize) {
        self.mapped_bytes.fetch_add(len, Ordering::Relaxed);
        self.span_low.fetch_min(start, Ordering::AcqRel);
        self.span_high.fetch_max(start + len, Ordering::AcqRel);
    }

    /// Fail every `mmap` once `calls` of them have been made.
    #[cfg(test)]
    pub(crate) fn limit_map_calls(&self, calls: u64) {
        self.map_budget.store(calls, Ordering::Relaxed);
    }

    fn mmap(&self, len: usize) -> Result<NonNull<u8>, AllocError> {
        #[cfg(test)]
        if self.map_calls() >= self.map_budget.load(Ordering::Relaxed) {
            return Err(AllocError::OutOfMemory { bytes: len });
        }
        self.map_calls.fetch_add(1, Ordering::Relaxed);
        // SAFETY: anonymous private mapping with no address hint; the kernel
        // picks a fresh range that aliases nothing we hold.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(AllocError::OutOfMemory { bytes: len });
        }
        NonNull::new(ptr.cast::<u8>()).ok_or(AllocError::OutOfMemory { bytes: len })
    }
}

// ---------------------------------------------------------------------------
// Page chains
// ---------------------------------------------------------------------------

/// Header shared by registry and arena metadata pages: a self-pointer that
/// marks the page as initialised and the link to the next page in the chain.
#[repr(C)]
pub(crate) struct PageLink {
    self_addr: usize,
    next: AtomicPtr<PageLink>,
}

impl PageLink {
    /// Write a fresh header at the start of `page`.
    ///
    /// # Safety
    ///
    /// `page` must be a page-aligned mapping of at least one page that nothing
    /// else references yet.
    pub(crate) unsafe fn init(page: NonNull<u8>) -> NonNull<PageLink> {
        let link = page.cast::<PageLink>();
        // SAFETY: caller guarantees exclusive, aligned, large-enough memory.
        unsafe {
            link.as_ptr().write(PageLink {
                self_addr: page.as_ptr() as usize,
                next: AtomicPtr::new(ptr::null_mut()),
            });
        }
        link
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.self_addr == ptr::from_ref(self) as usize
    }

    pub(crate) fn next(&self) -> Option<NonNull<PageLink>> {
        NonNull::new(self.next.load(Ordering::Acquire))
    }

    pub(crate) fn set_next(&self, next: NonNull<PageLink>) {
        self.next.store(next.as_ptr(), Ordering::Release);
    }
}
