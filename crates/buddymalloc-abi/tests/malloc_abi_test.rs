//! C entry points, called through their Rust paths (debug builds keep the
//! symbols mangled, so the test binary's own allocator is untouched).

use std::ffi::c_void;
use std::ptr;

use buddymalloc_abi::malloc_abi::{
    aligned_alloc, calloc, free, malloc, malloc_stats, malloc_usable_size, memalign,
    posix_memalign, realloc,
};
use buddymalloc_heap::global::enter_reentry_guard;

fn errno() -> i32 {
    // SAFETY: thread-local errno slot.
    unsafe { *libc::__errno_location() }
}

fn clear_errno() {
    // SAFETY: thread-local errno slot.
    unsafe { *libc::__errno_location() = 0 };
}

#[test]
fn malloc_free_round_trip() {
    // SAFETY: every block is freed once and only accessed within its size.
    unsafe {
        let p = malloc(100);
        assert!(!p.is_null());
        assert_eq!(p as usize % 8, 0);
        assert_eq!(malloc_usable_size(p), 128);
        ptr::write_bytes(p.cast::<u8>(), 0xAB, 100);
        free(p);
        assert_eq!(malloc_usable_size(p), 0, "released block is no longer live");
        free(ptr::null_mut());
        free(p);
    }
}

#[test]
fn zero_byte_malloc_returns_unique_blocks() {
    // SAFETY: blocks are freed below.
    unsafe {
        let a = malloc(0);
        let b = malloc(0);
        assert!(!a.is_null() && !b.is_null());
        assert_ne!(a, b);
        assert_eq!(malloc_usable_size(a), 8);
        free(a);
        free(b);
    }
}

#[test]
fn calloc_zeroes_reused_memory() {
    // SAFETY: block sizes respected; each block freed once.
    unsafe {
        let dirty = malloc(256);
        ptr::write_bytes(dirty.cast::<u8>(), 0xFF, 256);
        free(dirty);
        let clean = calloc(16, 16);
        assert!(!clean.is_null());
        let bytes = std::slice::from_raw_parts(clean.cast::<u8>(), 256);
        assert!(bytes.iter().all(|&b| b == 0));
        free(clean);
    }
}

#[test]
fn calloc_overflow_sets_enomem() {
    clear_errno();
    // SAFETY: no block is returned.
    let p = unsafe { calloc(usize::MAX / 2, 3) };
    assert!(p.is_null());
    assert_eq!(errno(), libc::ENOMEM);
}

#[test]
fn realloc_preserves_prefix_and_handles_edges() {
    // SAFETY: sizes respected; every live block freed once.
    unsafe {
        let p = realloc(ptr::null_mut(), 16);
        assert!(!p.is_null());
        for i in 0..16u8 {
            p.cast::<u8>().add(usize::from(i)).write(i);
        }
        let q = realloc(p, 4000);
        assert!(!q.is_null());
        assert!(malloc_usable_size(q) >= 4000);
        for i in 0..16u8 {
            assert_eq!(q.cast::<u8>().add(usize::from(i)).read(), i);
        }
        let r = realloc(q, 4);
        assert!(!r.is_null());
        assert_eq!(r.cast::<u8>().add(3).read(), 3);
        assert!(realloc(r, 0).is_null());
        assert_eq!(malloc_usable_size(r), 0);
    }
}

#[test]
fn failed_realloc_returns_original_pointer() {
    // SAFETY: original block stays live until freed below.
    unsafe {
        let p = malloc(32);
        p.cast::<u8>().write(0x42);
        clear_errno();
        let q = realloc(p, 1 << 60);
        assert_eq!(q, p);
        assert_eq!(errno(), libc::ENOMEM);
        assert_eq!(malloc_usable_size(p), 32);
        assert_eq!(p.cast::<u8>().read(), 0x42);
        free(p);
        assert_eq!(malloc_usable_size(p), 0);
    }
}

#[test]
fn failed_realloc_of_null_returns_null() {
    clear_errno();
    // SAFETY: no block is returned.
    let q = unsafe { realloc(ptr::null_mut(), 1 << 60) };
    assert!(q.is_null());
    assert_eq!(errno(), libc::ENOMEM);
}

#[test]
fn nested_realloc_leaves_heap_blocks_in_place() {
    // SAFETY: the block stays live until freed below.
    unsafe {
        let p = malloc(32);
        p.cast::<u8>().write(0x17);
        {
            let _outer = enter_reentry_guard().expect("not inside the allocator yet");
            clear_errno();
            assert_eq!(realloc(p, 64), p);
            assert_eq!(errno(), libc::ENOMEM);
        }
        assert_eq!(malloc_usable_size(p), 32);
        assert_eq!(p.cast::<u8>().read(), 0x17);
        free(p);
    }
}

#[test]
fn aligned_variants_honour_alignment() {
    // SAFETY: each block freed once.
    unsafe {
        for align in [8usize, 16, 64, 512, 4096, 65536] {
            let p = memalign(align, 24);
            assert!(!p.is_null(), "memalign({align})");
            assert_eq!(p as usize % align, 0);
            free(p);

            let q = aligned_alloc(align, 24);
            assert_eq!(q as usize % align, 0);
            free(q);
        }
    }
}

#[test]
fn aligned_variants_reject_bad_alignment() {
    clear_errno();
    // SAFETY: no block is returned.
    assert!(unsafe { memalign(48, 8) }.is_null());
    assert_eq!(errno(), libc::EINVAL);

    for align in [0usize, 1, 2, 4] {
        clear_errno();
        // SAFETY: no block is returned.
        assert!(unsafe { memalign(align, 24) }.is_null(), "memalign({align})");
        assert_eq!(errno(), libc::EINVAL);
        clear_errno();
        // SAFETY: no block is returned.
        assert!(unsafe { aligned_alloc(align, 24) }.is_null(), "aligned_alloc({align})");
        assert_eq!(errno(), libc::EINVAL);
    }

    let mut out: *mut c_void = ptr::null_mut();
    // SAFETY: `out` is a valid slot.
    unsafe {
        assert_eq!(posix_memalign(&mut out, 4, 8), libc::EINVAL);
        assert_eq!(posix_memalign(&mut out, 24, 8), libc::EINVAL);
    }
    assert!(out.is_null(), "slot untouched on failure");
}

#[test]
fn posix_memalign_stores_block() {
    let mut out: *mut c_void = ptr::null_mut();
    // SAFETY: `out` is a valid slot; block freed below.
    unsafe {
        assert_eq!(posix_memalign(&mut out, 256, 1000), 0);
        assert!(!out.is_null());
        assert_eq!(out as usize % 256, 0);
        assert_eq!(malloc_usable_size(out), 1024);
        free(out);
        assert_eq!(posix_memalign(&mut out, 64, 1 << 60), libc::ENOMEM);
    }
}

#[test]
fn blocks_released_from_other_threads() {
    // SAFETY: each block is freed exactly once, by the spawned thread.
    let addrs: Vec<usize> = (0..64).map(|i| unsafe { malloc(8 + i * 16) } as usize).collect();
    let sizes: Vec<usize> = addrs
        .iter()
        // SAFETY: live blocks.
        .map(|&a| unsafe { malloc_usable_size(a as *mut c_void) })
        .collect();
    assert!(sizes.iter().all(|&s| s > 0));
    std::thread::spawn(move || {
        for &a in &addrs {
            // SAFETY: owned by this thread from here on.
            unsafe { free(a as *mut c_void) };
        }
        for &a in &addrs {
            // SAFETY: query only.
            assert_eq!(unsafe { malloc_usable_size(a as *mut c_void) }, 0);
        }
    })
    .join()
    .expect("releasing thread");
}

#[test]
fn malloc_stats_does_not_panic() {
    // SAFETY: no pointers involved.
    unsafe {
        let p = malloc(10);
        malloc_stats();
        free(p);
    }
}
