//! Process-wide heap and the implicit per-thread arena.
//!
//! Everything below [`Heap`] takes an explicit [`ArenaHandle`]. This module is
//! the only place that keeps one in thread-local storage: the first call on a
//! thread registers it with the global heap, and the handle is reused for the
//! thread's lifetime. Arenas outlive their threads.

#![allow(unsafe_code)]

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::io;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::OnceLock;

use buddymalloc_core::AllocError;

use crate::heap::{ArenaHandle, FreeResult, Heap};

static GLOBAL_HEAP: OnceLock<Heap> = OnceLock::new();

thread_local! {
    static THREAD_ARENA: Cell<Option<ArenaHandle<'static>>> = const { Cell::new(None) };
    static REENTRY_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// The process heap, created on first use with [`HeapConfig::detect`].
///
/// [`HeapConfig::detect`]: crate::config::HeapConfig::detect
#[must_use]
pub fn global_heap() -> &'static Heap {
    GLOBAL_HEAP.get_or_init(Heap::default)
}

/// The calling thread's arena in the global heap, registering it on first use.
pub fn thread_arena() -> Result<ArenaHandle<'static>, AllocError> {
    THREAD_ARENA.with(|cell| {
        if let Some(arena) = cell.get() {
            return Ok(arena);
        }
        let arena = global_heap().register_thread()?;
        cell.set(Some(arena));
        Ok(arena)
    })
}

/// Marks the calling thread as inside the allocator.
pub struct ReentryGuard {
    _thread_bound: PhantomData<*const ()>,
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        REENTRY_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// `None` when the calling thread is already inside an allocator entry point
/// (for example a lock that allocates while parking). Callers fall back to the
/// system allocator in that case.
#[inline]
#[must_use]
pub fn enter_reentry_guard() -> Option<ReentryGuard> {
    REENTRY_DEPTH.with(|depth| {
        if depth.get() > 0 {
            None
        } else {
            depth.set(1);
            Some(ReentryGuard {
                _thread_bound: PhantomData,
            })
        }
    })
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Allocate `size` bytes at the minimum alignment.
pub fn allocate(size: usize) -> Result<NonNull<u8>, AllocError> {
    global_heap().allocate(thread_arena()?, size)
}

/// Allocate `size` bytes at a multiple of `alignment`.
pub fn allocate_aligned(alignment: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
    global_heap().allocate_aligned(thread_arena()?, alignment, size)
}

/// Allocate `count * size` zeroed bytes.
pub fn zero_allocate(count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
    global_heap().zero_allocate(thread_arena()?, count, size)
}

/// Release a block from any thread. Null and unknown addresses are ignored.
pub fn release(ptr: *mut u8) -> FreeResult {
    if ptr.is_null() {
        return FreeResult::Null;
    }
    match thread_arena() {
        Ok(arena) => global_heap().release(arena, ptr),
        // Without an arena of our own the block stays allocated.
        Err(_) => FreeResult::Unknown,
    }
}

/// See [`Heap::reallocate`].
///
/// # Safety
///
/// `ptr` must be null or a live block from the global heap that no other
/// thread is accessing.
pub unsafe fn reallocate(ptr: *mut u8, new_size: usize) -> Result<Option<NonNull<u8>>, AllocError> {
    let arena = thread_arena()?;
    // SAFETY: forwarded to the caller.
    unsafe { global_heap().reallocate(arena, ptr, new_size) }
}

/// Granted size of the live block at `ptr`.
#[must_use]
pub fn usable_size(ptr: *mut u8) -> Option<usize> {
    if ptr.is_null() {
        return None;
    }
    global_heap().usable_size(thread_arena().ok()?, ptr)
}

/// Print the global heap's report to stderr.
pub fn print_stats() -> io::Result<()> {
    global_heap().print_stats()
}

// ---------------------------------------------------------------------------
// GlobalAlloc adapter
// ---------------------------------------------------------------------------

/// Installs the global heap as a Rust global allocator.
///
/// ```ignore
/// #[global_allocator]
/// static ALLOC: buddymalloc_heap::BuddyMalloc = buddymalloc_heap::BuddyMalloc;
/// ```
///
/// Requests that arrive while the same thread is already inside the heap are
/// served by [`System`]; such blocks are recognised on release because no bin
/// contains them.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuddyMalloc;

impl BuddyMalloc {
    fn alignment(layout: Layout) -> usize {
        layout.align().max(global_heap().config().min_alignment())
    }
}

unsafe impl GlobalAlloc for BuddyMalloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let Some(_guard) = enter_reentry_guard() else {
            // SAFETY: forwarded GlobalAlloc contract.
            return unsafe { System.alloc(layout) };
        };
        allocate_aligned(Self::alignment(layout), layout.size()).map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let Some(_guard) = enter_reentry_guard() else {
            // SAFETY: forwarded GlobalAlloc contract.
            return unsafe { System.alloc_zeroed(layout) };
        };
        match allocate_aligned(Self::alignment(layout), layout.size()) {
            Ok(block) => {
                // SAFETY: fresh block of at least layout.size() bytes.
                unsafe { ptr::write_bytes(block.as_ptr(), 0, layout.size()) };
                block.as_ptr()
            }
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let Some(_guard) = enter_reentry_guard() else {
            // SAFETY: forwarded GlobalAlloc contract.
            unsafe { System.dealloc(ptr, layout) };
            return;
        };
        let Ok(arena) = thread_arena() else {
            return;
        };
        if global_heap().release(arena, ptr) == FreeResult::Unknown {
            // SAFETY: no bin holds ptr, so it came from the System fallback.
            unsafe { System.dealloc(ptr, layout) };
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(_guard) = enter_reentry_guard() else {
            // SAFETY: forwarded GlobalAlloc contract.
            return unsafe { System.realloc(ptr, layout, new_size) };
        };
        let Ok(arena) = thread_arena() else {
            return ptr::null_mut();
        };
        let heap = global_heap();
        if heap.usable_size(arena, ptr).is_none() {
            // SAFETY: no bin holds ptr, so it came from the System fallback.
            return unsafe { System.realloc(ptr, layout, new_size) };
        }
        if layout.align() <= heap.config().min_alignment() {
            // SAFETY: GlobalAlloc grants exclusive ownership of ptr.
            return match unsafe { heap.reallocate(arena, ptr, new_size) } {
                Ok(Some(block)) => block.as_ptr(),
                Ok(None) | Err(_) => ptr::null_mut(),
            };
        }
        let Ok(block) = heap.allocate_aligned(arena, layout.align(), new_size) else {
            return ptr::null_mut();
        };
        // SAFETY: both blocks are live and disjoint; ptr holds layout.size() bytes.
        unsafe { ptr::copy_nonoverlapping(ptr, block.as_ptr(), layout.size().min(new_size)) };
        heap.release(arena, ptr);
        block.as_ptr()
    }
}
