//! ABI layer for the malloc family (`malloc`, `free`, `calloc`, `realloc`,
//! the aligned variants, `malloc_usable_size` and `malloc_stats`).
//!
//! Every entry point runs on the calling thread's arena in the global buddy
//! heap. A call that re-enters the allocator on the same thread (the heap's own
//! locks may allocate the first time they park) is served by the native libc
//! allocator instead.
//!
//! Blocks the heap does not recognise are never handed to libc's `free`:
//! unknown, interior and already-released addresses are ignored, which also
//! means the rare reentrant fallback block is leaked rather than freed. A
//! reentrant `realloc` only forwards pointers outside every range the heap has
//! mapped.

use std::ffi::{c_int, c_void};
use std::ptr;

use buddymalloc_core::errno::{EINVAL, ENOMEM};
use buddymalloc_core::AllocError;
use buddymalloc_heap::global::{self, enter_reentry_guard};

unsafe extern "C" {
    #[link_name = "__libc_malloc"]
    fn native_libc_malloc_sym(size: usize) -> *mut c_void;
    #[link_name = "__libc_calloc"]
    fn native_libc_calloc_sym(nmemb: usize, size: usize) -> *mut c_void;
    #[link_name = "__libc_realloc"]
    fn native_libc_realloc_sym(ptr: *mut c_void, size: usize) -> *mut c_void;
    #[link_name = "__libc_memalign"]
    fn native_libc_memalign_sym(alignment: usize, size: usize) -> *mut c_void;
}

#[inline]
unsafe fn native_libc_malloc(size: usize) -> *mut c_void {
    // SAFETY: direct call to libc allocator symbol.
    unsafe { native_libc_malloc_sym(size) }
}

#[inline]
unsafe fn native_libc_calloc(nmemb: usize, size: usize) -> *mut c_void {
    // SAFETY: direct call to libc allocator symbol.
    unsafe { native_libc_calloc_sym(nmemb, size) }
}

#[inline]
unsafe fn native_libc_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    // SAFETY: direct call to libc allocator symbol.
    unsafe { native_libc_realloc_sym(ptr, size) }
}

#[inline]
unsafe fn native_libc_memalign(alignment: usize, size: usize) -> *mut c_void {
    // SAFETY: direct call to libc allocator symbol.
    unsafe { native_libc_memalign_sym(alignment, size) }
}

#[inline]
fn set_abi_errno(val: c_int) {
    // SAFETY: __errno_location always returns the calling thread's errno slot.
    unsafe { *libc::__errno_location() = val };
}

#[inline]
fn fail(err: AllocError) -> *mut c_void {
    set_abi_errno(err.errno());
    ptr::null_mut()
}

#[inline]
fn granted(result: Result<ptr::NonNull<u8>, AllocError>) -> *mut c_void {
    match result {
        Ok(block) => block.as_ptr().cast(),
        Err(err) => fail(err),
    }
}

// ---------------------------------------------------------------------------
// malloc
// ---------------------------------------------------------------------------

/// POSIX `malloc` -- allocates `size` bytes of uninitialized memory.
///
/// A zero-byte request still returns a unique minimum-size block. Returns null
/// with `errno = ENOMEM` when no bin can be mapped.
///
/// # Safety
///
/// Caller must eventually `free` the returned pointer.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    let Some(_reentry_guard) = enter_reentry_guard() else {
        // SAFETY: reentrant path bypasses the heap to avoid allocator recursion.
        return unsafe { native_libc_malloc(size.max(1)) };
    };
    granted(global::allocate(size))
}

// ---------------------------------------------------------------------------
// free
// ---------------------------------------------------------------------------

/// POSIX `free` -- returns a block to whichever thread's arena granted it.
///
/// Null, unknown, interior and already-released pointers are ignored.
///
/// # Safety
///
/// `ptr` must be null or a pointer this allocator returned; the block must not
/// be accessed afterwards.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    let Some(_reentry_guard) = enter_reentry_guard() else {
        return;
    };
    global::release(ptr.cast());
}

// ---------------------------------------------------------------------------
// calloc
// ---------------------------------------------------------------------------

/// POSIX `calloc` -- allocates `nmemb * size` zeroed bytes.
///
/// Returns null with `errno = ENOMEM` if the multiplication overflows or the
/// allocation fails.
///
/// # Safety
///
/// Caller must eventually `free` the returned pointer.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    let Some(_reentry_guard) = enter_reentry_guard() else {
        // SAFETY: reentrant path bypasses the heap to avoid allocator recursion.
        return unsafe { native_libc_calloc(nmemb.max(1), size.max(1)) };
    };
    granted(global::zero_allocate(nmemb, size))
}

// ---------------------------------------------------------------------------
// realloc
// ---------------------------------------------------------------------------

/// POSIX `realloc` -- moves a block to one of at least `size` bytes.
///
/// - `realloc(NULL, size)` behaves like `malloc(size)`.
/// - `realloc(ptr, 0)` frees `ptr` and returns null.
/// - On failure sets `errno = ENOMEM` and returns `ptr` itself, still valid
///   and unchanged.
///
/// The new block always comes from the calling thread's arena, even when the
/// old one belonged to another thread.
///
/// # Safety
///
/// `ptr` must be null or a live pointer this allocator returned, not in use by
/// any other thread.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    let Some(_reentry_guard) = enter_reentry_guard() else {
        if global::global_heap().may_contain(ptr.cast_const().cast()) {
            // A heap block cannot be moved without the arena locks.
            set_abi_errno(ENOMEM);
            return ptr;
        }
        // SAFETY: ptr is null or a native block; the heap never mapped it.
        return unsafe { native_libc_realloc(ptr, size.max(1)) };
    };
    // SAFETY: caller contract above.
    match unsafe { global::reallocate(ptr.cast(), size) } {
        Ok(Some(block)) => block.as_ptr().cast(),
        Ok(None) => ptr::null_mut(),
        Err(err) => {
            set_abi_errno(err.errno());
            ptr
        }
    }
}

// ---------------------------------------------------------------------------
// memalign / aligned_alloc / posix_memalign
// ---------------------------------------------------------------------------

/// Legacy `memalign` -- `size` bytes at a multiple of `alignment`.
///
/// `alignment` must be a power of two no smaller than the word size;
/// anything else fails with `EINVAL`.
///
/// # Safety
///
/// Caller must eventually `free` the returned pointer.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut c_void {
    let Some(_reentry_guard) = enter_reentry_guard() else {
        // SAFETY: reentrant path bypasses the heap to avoid allocator recursion.
        return unsafe { native_libc_memalign(alignment, size.max(1)) };
    };
    granted(global::allocate_aligned(alignment, size))
}

/// C11 `aligned_alloc`. Same rules as [`memalign`].
///
/// # Safety
///
/// Caller must eventually `free` the returned pointer.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    // SAFETY: identical contract.
    unsafe { memalign(alignment, size) }
}

/// POSIX `posix_memalign` -- stores a block aligned to `alignment` in
/// `*memptr`.
///
/// Returns 0 on success, `EINVAL` when `alignment` is not a power of two
/// multiple of `sizeof(void *)`, `ENOMEM` when allocation fails. `*memptr` is
/// left untouched on failure and `errno` is not modified.
///
/// # Safety
///
/// `memptr` must be valid for a pointer-sized write.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> c_int {
    if memptr.is_null() {
        return EINVAL;
    }
    if !alignment.is_power_of_two() || alignment % size_of::<*mut c_void>() != 0 {
        return EINVAL;
    }
    let block = match enter_reentry_guard() {
        // SAFETY: reentrant path bypasses the heap to avoid allocator recursion.
        None => unsafe { native_libc_memalign(alignment, size.max(1)) },
        Some(_reentry_guard) => match global::allocate_aligned(alignment, size) {
            Ok(block) => block.as_ptr().cast(),
            Err(err) => return err.errno(),
        },
    };
    if block.is_null() {
        return ENOMEM;
    }
    // SAFETY: caller guarantees memptr is writable.
    unsafe { *memptr = block };
    0
}

// ---------------------------------------------------------------------------
// introspection
// ---------------------------------------------------------------------------

/// GNU `malloc_usable_size` -- granted size of the block at `ptr`, or 0 for
/// null and unknown pointers.
///
/// # Safety
///
/// `ptr` must be null or a pointer this allocator returned.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    let Some(_reentry_guard) = enter_reentry_guard() else {
        return 0;
    };
    global::usable_size(ptr.cast()).unwrap_or(0)
}

/// GNU `malloc_stats` -- per-arena and per-bin report on stderr.
///
/// # Safety
///
/// Always safe to call; `unsafe` only for symmetry with the C prototype.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn malloc_stats() {
    let Some(_reentry_guard) = enter_reentry_guard() else {
        return;
    };
    // Nothing sensible to report if stderr is gone.
    let _ = global::print_stats();
}
