//! # buddymalloc-abi
//!
//! C-compatible allocator entry points over the process-wide buddy heap.
//!
//! Release builds export `malloc`, `free`, `calloc`, `realloc`, `memalign`,
//! `aligned_alloc`, `posix_memalign`, `malloc_usable_size` and `malloc_stats`
//! unmangled, so the `cdylib` can be preloaded in front of libc:
//!
//! ```text
//! LD_PRELOAD=target/release/libbuddymalloc_abi.so ./program
//! ```
//!
//! Debug builds keep the Rust-mangled names, which lets the integration tests
//! call the entry points without replacing the test binary's own allocator.

// Gated behind cfg(not(test)) so the unit-test binary of this crate never
// links a second malloc.
#[cfg(not(test))]
pub mod malloc_abi;
