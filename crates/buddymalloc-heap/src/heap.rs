//! The heap object and its allocate / release protocol.
//!
//! A [`Heap`] owns the page provider, the process registry and every arena
//! registered with it. Callers register once per thread to get an
//! [`ArenaHandle`] and pass it to every call:
//!
//! - allocation only ever touches the caller's own arena, under that arena's
//!   lock;
//! - release tries the caller's arena first and, if no bin there contains the
//!   address, walks the other arenas oldest first, locking each one only for
//!   its own search.

#![allow(unsafe_code)]

use std::fmt;
use std::io::{self, Write as _};
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use buddymalloc_core::sizing;
use buddymalloc_core::{
    AllocError, AllocatorLogLevel, AllocatorLogRecord, ArenaStats, ReportWriter, StatsCollector,
    StatsVisitor,
};

use crate::arena::{self, ArenaEnv, ArenaGuard, ArenaLayout, ArenaRelease, BinCreation};
use crate::config::HeapConfig;
use crate::lifecycle::LifecycleLog;
use crate::metrics::{HeapMetrics, MetricsSnapshot};
use crate::pages::PageProvider;
use crate::registry::{Registry, RegistrySlot};

/// A thread's registration with a [`Heap`].
///
/// Handles are `Copy` but not `Send`: allocation stays on the thread that
/// registered. A handle passed to a heap other than the one that issued it
/// is refused with [`AllocError::ForeignArena`].
#[derive(Clone, Copy)]
pub struct ArenaHandle<'h> {
    heap: &'h Heap,
    slot: &'h RegistrySlot,
    index: usize,
    thread: u64,
    _owner: PhantomData<*const ()>,
}

impl ArenaHandle<'_> {
    /// Registry index of the arena (registration order).
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Thread tag assigned at registration (starts at 1).
    #[must_use]
    pub fn thread(&self) -> u64 {
        self.thread
    }
}

impl fmt::Debug for ArenaHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaHandle")
            .field("index", &self.index)
            .field("thread", &self.thread)
            .finish()
    }
}

/// Outcome of a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeResult {
    /// Null pointer; nothing to do.
    Null,
    /// Freed from the caller's own arena.
    Freed { bytes: usize },
    /// Freed from another thread's arena.
    FreedForeign { bytes: usize, arena: usize },
    /// Not a live block start: unknown, interior or already released. Ignored.
    Unknown,
}

impl FreeResult {
    /// Bytes returned to a bin, if any.
    #[must_use]
    pub const fn freed_bytes(self) -> Option<usize> {
        match self {
            Self::Freed { bytes } | Self::FreedForeign { bytes, .. } => Some(bytes),
            Self::Null | Self::Unknown => None,
        }
    }
}

/// Multithreaded buddy heap.
pub struct Heap {
    config: HeapConfig,
    pages: PageProvider,
    registry: Registry,
    arena_layout: ArenaLayout,
    next_thread: AtomicU64,
    metrics: HeapMetrics,
    lifecycle: LifecycleLog,
}

impl Heap {
    /// Create an empty heap. Nothing is mapped until the first registration.
    #[must_use]
    pub fn new(config: HeapConfig) -> Self {
        let page_size = config.page_size();
        Self {
            config,
            pages: PageProvider::new(page_size),
            registry: Registry::new(page_size),
            arena_layout: ArenaLayout::new(page_size),
            next_thread: AtomicU64::new(1),
            metrics: HeapMetrics::new(),
            lifecycle: LifecycleLog::new(config.log_level()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Number of arenas published in the registry.
    #[must_use]
    pub fn arena_count(&self) -> usize {
        self.registry.len()
    }

    /// Bin records held by one arena metadata page.
    #[must_use]
    pub fn bins_per_metadata_page(&self) -> usize {
        self.arena_layout.capacity()
    }

    /// Arena slots held by one registry page.
    #[must_use]
    pub fn arenas_per_registry_page(&self) -> usize {
        self.registry.slots_per_page()
    }

    /// Whether `ptr` might belong to this heap, answered without taking any
    /// lock. `false` is definite: no arena ever held the address.
    #[must_use]
    pub fn may_contain(&self, ptr: *const u8) -> bool {
        self.pages.spans(ptr as usize)
    }

    fn env(&self) -> ArenaEnv<'_> {
        ArenaEnv {
            pages: &self.pages,
            layout: self.arena_layout,
            leaf: self.config.min_block_size(),
            min_bin_pages: self.config.min_bin_pages(),
        }
    }

    fn lock<'s>(&'s self, slot: &'s RegistrySlot) -> Option<ArenaGuard<'s>> {
        ArenaGuard::lock(self.env(), slot)
    }

    fn check_handle(
        &self,
        arena: ArenaHandle<'_>,
        symbol: &'static str,
        op: &'static str,
    ) -> Result<(), AllocError> {
        if ptr::eq(arena.heap, self) {
            return Ok(());
        }
        HeapMetrics::inc(&self.metrics.foreign_handles);
        self.lifecycle.record(
            AllocatorLogRecord::new(AllocatorLogLevel::Warn, symbol, op, "foreign_handle")
                .thread(arena.thread),
        );
        Err(AllocError::ForeignArena)
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Create an arena for the calling thread and publish it.
    pub fn register_thread(&self) -> Result<ArenaHandle<'_>, AllocError> {
        let thread = self.next_thread.fetch_add(1, Ordering::Relaxed);
        let registered = arena::create_arena(&self.pages)
            .and_then(|head| self.registry.register(&self.pages, thread, head));
        let registered = match registered {
            Ok(registered) => registered,
            Err(err) => {
                self.note_failure("register", thread, None, err);
                return Err(err);
            }
        };

        HeapMetrics::inc(&self.metrics.arenas_registered);
        if registered.linked_page {
            self.lifecycle.record(
                AllocatorLogRecord::new(
                    AllocatorLogLevel::Info,
                    "register",
                    "registry_page_linked",
                    "mapped",
                )
                .thread(thread)
                .arena(registered.index),
            );
        }
        self.lifecycle.record(
            AllocatorLogRecord::new(
                AllocatorLogLevel::Info,
                "register",
                "arena_registered",
                "published",
            )
            .thread(thread)
            .arena(registered.index),
        );
        Ok(ArenaHandle {
            heap: self,
            slot: registered.slot,
            index: registered.index,
            thread,
            _owner: PhantomData,
        })
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Allocate at least `size` bytes aligned to the minimum alignment.
    /// A zero-byte request is served as one byte.
    pub fn allocate(&self, arena: ArenaHandle<'_>, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.allocate_with(arena, self.config.min_alignment(), size, "malloc")
    }

    /// Allocate at least `size` bytes at a multiple of `alignment`.
    pub fn allocate_aligned(
        &self,
        arena: ArenaHandle<'_>,
        alignment: usize,
        size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        self.allocate_with(arena, alignment, size, "memalign")
    }

    /// Allocate `count * size` zeroed bytes.
    pub fn zero_allocate(
        &self,
        arena: ArenaHandle<'_>,
        count: usize,
        size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let Some(total) = count.checked_mul(size) else {
            self.check_handle(arena, "calloc", "alloc")?;
            self.note_failure("calloc", arena.thread, Some(arena.index), AllocError::SizeOverflow);
            return Err(AllocError::SizeOverflow);
        };
        let block = self.allocate_with(arena, self.config.min_alignment(), total, "calloc")?;
        // SAFETY: the block was just granted with at least `total` bytes and
        // nobody else holds it.
        unsafe { ptr::write_bytes(block.as_ptr(), 0, total) };
        Ok(block)
    }

    fn allocate_with(
        &self,
        arena: ArenaHandle<'_>,
        alignment: usize,
        size: usize,
        symbol: &'static str,
    ) -> Result<NonNull<u8>, AllocError> {
        self.check_handle(arena, symbol, "alloc")?;
        if let Err(err) = sizing::validate_alignment(alignment, self.config.min_alignment()) {
            self.note_failure(symbol, arena.thread, Some(arena.index), err);
            return Err(err);
        }
        let request = size.max(1);
        let min_block = alignment.max(self.config.min_block_size());

        let placement = self
            .lock(arena.slot)
            .ok_or(AllocError::OutOfMemory { bytes: request })
            .and_then(|mut guard| guard.allocate(request, min_block));
        let placement = match placement {
            Ok(placement) => placement,
            Err(err) => {
                self.note_failure(symbol, arena.thread, Some(arena.index), err);
                return Err(err);
            }
        };

        HeapMetrics::inc(&self.metrics.allocations);
        if let Some(created) = placement.created {
            self.note_bin_created(arena, symbol, placement.bin, created);
        }
        self.lifecycle.record(
            AllocatorLogRecord::new(AllocatorLogLevel::Trace, symbol, "alloc", "granted")
                .thread(arena.thread)
                .arena(arena.index)
                .bin(placement.bin)
                .ptr(placement.grant.addr)
                .size(placement.grant.size),
        );
        NonNull::new(placement.grant.addr as *mut u8).ok_or(AllocError::OutOfMemory { bytes: request })
    }

    // -----------------------------------------------------------------------
    // Release
    // -----------------------------------------------------------------------

    /// Return a block to whichever arena granted it. Null, unknown, interior
    /// and already-released addresses are ignored.
    pub fn release(&self, arena: ArenaHandle<'_>, ptr: *mut u8) -> FreeResult {
        self.release_with(arena, ptr, "free")
    }

    fn release_with(&self, arena: ArenaHandle<'_>, ptr: *mut u8, symbol: &'static str) -> FreeResult {
        if ptr.is_null() {
            return FreeResult::Null;
        }
        if self.check_handle(arena, symbol, "free").is_err() {
            return FreeResult::Unknown;
        }
        let addr = ptr as usize;

        let own = self
            .lock(arena.slot)
            .map_or(ArenaRelease::NotOwned, |mut guard| guard.release(addr));
        match own {
            ArenaRelease::Freed { bytes, bin } => {
                HeapMetrics::inc(&self.metrics.releases);
                self.lifecycle.record(
                    AllocatorLogRecord::new(AllocatorLogLevel::Trace, symbol, "free", "freed")
                        .thread(arena.thread)
                        .arena(arena.index)
                        .bin(bin)
                        .ptr(addr)
                        .size(bytes),
                );
                return FreeResult::Freed { bytes };
            }
            // Bins never overlap, so no other arena can own this address.
            ArenaRelease::NotFound { bin } => return self.note_unknown(arena, symbol, addr, Some(bin)),
            ArenaRelease::NotOwned => {}
        }

        for (index, slot) in self.registry.published() {
            if ptr::eq(slot, arena.slot) {
                continue;
            }
            let Some(mut guard) = self.lock(slot) else {
                continue;
            };
            let outcome = guard.release(addr);
            drop(guard);
            match outcome {
                ArenaRelease::Freed { bytes, bin } => {
                    HeapMetrics::inc(&self.metrics.foreign_releases);
                    self.lifecycle.record(
                        AllocatorLogRecord::new(
                            AllocatorLogLevel::Debug,
                            symbol,
                            "foreign_free",
                            "freed",
                        )
                        .thread(arena.thread)
                        .arena(index)
                        .bin(bin)
                        .ptr(addr)
                        .size(bytes),
                    );
                    return FreeResult::FreedForeign {
                        bytes,
                        arena: index,
                    };
                }
                ArenaRelease::NotFound { bin } => {
                    return self.note_unknown(arena, symbol, addr, Some(bin));
                }
                ArenaRelease::NotOwned => {}
            }
        }
        self.note_unknown(arena, symbol, addr, None)
    }

    /// Granted size of the live block starting at `ptr`, searching the
    /// caller's arena first and then every other arena.
    pub fn usable_size(&self, arena: ArenaHandle<'_>, ptr: *mut u8) -> Option<usize> {
        let addr = NonNull::new(ptr)?.as_ptr() as usize;
        self.check_handle(arena, "malloc_usable_size", "query").ok()?;
        if let Some(found) = self.lock(arena.slot).and_then(|mut g| g.block_size(addr)) {
            return found;
        }
        for (_, slot) in self.registry.published() {
            if ptr::eq(slot, arena.slot) {
                continue;
            }
            if let Some(found) = self.lock(slot).and_then(|mut g| g.block_size(addr)) {
                return found;
            }
        }
        None
    }

    /// Resize a block by moving it.
    ///
    /// - null `ptr`: behaves as [`Heap::allocate`];
    /// - `new_size == 0`: releases `ptr` and returns `Ok(None)`;
    /// - otherwise allocates a new block, copies the overlapping prefix,
    ///   releases the old block and returns the new one.
    ///
    /// On failure the original block is left untouched. An address the heap
    /// does not know is not copied from.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a block granted by this heap that no other thread
    /// is reading or writing.
    pub unsafe fn reallocate(
        &self,
        arena: ArenaHandle<'_>,
        ptr: *mut u8,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let min_alignment = self.config.min_alignment();
        if ptr.is_null() {
            return self
                .allocate_with(arena, min_alignment, new_size, "realloc")
                .map(Some);
        }
        if new_size == 0 {
            self.release_with(arena, ptr, "realloc");
            return Ok(None);
        }

        let old_size = self.usable_size(arena, ptr);
        let fresh = self.allocate_with(arena, min_alignment, new_size, "realloc")?;
        if let Some(old_size) = old_size {
            // SAFETY: `ptr` is a live block of `old_size` bytes (caller
            // contract), `fresh` a disjoint new block of at least `new_size`.
            unsafe { ptr::copy_nonoverlapping(ptr, fresh.as_ptr(), old_size.min(new_size)) };
        }
        self.release_with(arena, ptr, "realloc");
        HeapMetrics::inc(&self.metrics.reallocations);
        self.lifecycle.record(
            AllocatorLogRecord::new(AllocatorLogLevel::Debug, "realloc", "realloc", "moved")
                .thread(arena.thread)
                .arena(arena.index)
                .ptr(fresh.as_ptr() as usize)
                .size(new_size),
        );
        Ok(Some(fresh))
    }

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    /// Walk every published arena, locking each while it is read.
    pub fn visit_stats<V: StatsVisitor + ?Sized>(&self, visitor: &mut V) {
        for (index, slot) in self.registry.published() {
            if let Some(mut guard) = self.lock(slot) {
                guard.visit_stats(index, visitor);
            }
        }
        visitor.finish();
    }

    /// Collected snapshot of every arena.
    ///
    /// This allocates while arena locks are held; a process that installed
    /// this heap as its global allocator should use [`Heap::visit_stats`]
    /// with a non-allocating visitor or [`Heap::print_stats`] instead.
    #[must_use]
    pub fn stats(&self) -> Vec<ArenaStats> {
        let mut collector = StatsCollector::new();
        self.visit_stats(&mut collector);
        collector.into_arenas()
    }

    /// Render the text report into `out`.
    pub fn write_report<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        let mut writer = ReportWriter::new(out);
        self.visit_stats(&mut writer);
        writer.into_inner().1
    }

    /// Write the text report to stderr.
    pub fn print_stats(&self) -> io::Result<()> {
        let stderr = io::stderr();
        let mut sink = IoSink {
            out: stderr.lock(),
            error: None,
        };
        let formatted = self.write_report(&mut sink);
        if let Some(err) = sink.error {
            return Err(err);
        }
        formatted.map_err(|_| io::Error::other("stats report formatting failed"))?;
        sink.out.flush()
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics
            .snapshot(self.pages.map_calls(), self.pages.mapped_bytes())
    }

    /// Take the buffered lifecycle records, oldest first.
    pub fn drain_lifecycle_logs(&self) -> Vec<AllocatorLogRecord> {
        self.lifecycle.drain()
    }

    /// Lifecycle records lost to ring overwrites.
    #[must_use]
    pub fn lifecycle_overwritten(&self) -> u64 {
        self.lifecycle.overwritten()
    }

    // -----------------------------------------------------------------------
    // Logging helpers
    // -----------------------------------------------------------------------

    fn note_failure(&self, symbol: &'static str, thread: u64, arena: Option<usize>, err: AllocError) {
        let (counter, outcome, size) = match err {
            AllocError::OutOfMemory { bytes } => (&self.metrics.out_of_memory, "out_of_memory", bytes),
            AllocError::InvalidAlignment { alignment, .. } => {
                (&self.metrics.invalid_alignment, "invalid_alignment", alignment)
            }
            AllocError::SizeOverflow => (&self.metrics.size_overflow, "size_overflow", usize::MAX),
            AllocError::ForeignArena => (&self.metrics.foreign_handles, "foreign_handle", 0),
        };
        HeapMetrics::inc(counter);
        let mut record = AllocatorLogRecord::new(AllocatorLogLevel::Warn, symbol, "alloc", outcome)
            .thread(thread)
            .size(size);
        if let Some(arena) = arena {
            record = record.arena(arena);
        }
        self.lifecycle.record(record);
    }

    fn note_bin_created(
        &self,
        arena: ArenaHandle<'_>,
        symbol: &'static str,
        bin: usize,
        created: BinCreation,
    ) {
        HeapMetrics::inc(&self.metrics.bins_created);
        let bytes = sizing::bin_bytes(created.pages, self.config.page_size());
        let outcome = if created.metadata_mapped {
            "metadata_mapped"
        } else {
            "metadata_pooled"
        };
        self.lifecycle.record(
            AllocatorLogRecord::new(AllocatorLogLevel::Info, symbol, "bin_created", outcome)
                .thread(arena.thread)
                .arena(arena.index)
                .bin(bin)
                .size(bytes),
        );
        if created.page_linked {
            self.lifecycle.record(
                AllocatorLogRecord::new(AllocatorLogLevel::Info, symbol, "arena_page_linked", "mapped")
                    .thread(arena.thread)
                    .arena(arena.index)
                    .bin(bin),
            );
        }
    }

    fn note_unknown(
        &self,
        arena: ArenaHandle<'_>,
        symbol: &'static str,
        addr: usize,
        bin: Option<usize>,
    ) -> FreeResult {
        HeapMetrics::inc(&self.metrics.ignored_releases);
        let mut record = AllocatorLogRecord::new(AllocatorLogLevel::Warn, symbol, "free", "unknown")
            .thread(arena.thread)
            .ptr(addr);
        if let Some(bin) = bin {
            record = record.bin(bin);
        }
        self.lifecycle.record(record);
        FreeResult::Unknown
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new(HeapConfig::detect())
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("config", &self.config)
            .field("arenas", &self.registry.len())
            .finish_non_exhaustive()
    }
}

/// `fmt::Write` over an `io::Write`, keeping the first I/O error.
struct IoSink<W> {
    out: W,
    error: Option<io::Error>,
}

impl<W: io::Write> fmt::Write for IoSink<W> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.out.write_all(s.as_bytes()).map_err(|err| {
            self.error = Some(err);
            fmt::Error
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_bins() -> HeapConfig {
        HeapConfig::builder()
            .min_bin_pages(1)
            .log_level(AllocatorLogLevel::Trace)
            .build()
            .expect("valid config")
    }

    #[test]
    fn registration_assigns_increasing_tags() {
        let heap = Heap::default();
        let a = heap.register_thread().expect("register");
        let b = heap.register_thread().expect("register");
        assert_eq!((a.index(), a.thread()), (0, 1));
        assert_eq!((b.index(), b.thread()), (1, 2));
        assert_eq!(heap.arena_count(), 2);
    }

    #[test]
    fn zero_size_is_one_minimum_block() {
        let heap = Heap::default();
        let arena = heap.register_thread().expect("register");
        let p = heap.allocate(arena, 0).expect("allocate");
        assert_eq!(heap.usable_size(arena, p.as_ptr()), Some(8));
    }

    #[test]
    fn invalid_alignment_changes_nothing() {
        let heap = Heap::default();
        let arena = heap.register_thread().expect("register");
        let before = heap.metrics();
        assert_eq!(
            heap.allocate_aligned(arena, 24, 10),
            Err(AllocError::InvalidAlignment {
                alignment: 24,
                minimum: 8
            })
        );
        assert!(heap.allocate_aligned(arena, 4, 10).is_err());
        let after = heap.metrics();
        assert_eq!(after.invalid_alignment, 2);
        assert_eq!(after.map_calls, before.map_calls, "nothing was mapped");
        assert!(heap.stats()[0].bins.is_empty());
    }

    #[test]
    fn own_release_reports_bytes() {
        let heap = Heap::default();
        let arena = heap.register_thread().expect("register");
        let p = heap.allocate(arena, 100).expect("allocate");
        assert_eq!(heap.release(arena, p.as_ptr()), FreeResult::Freed { bytes: 128 });
        assert_eq!(heap.release(arena, p.as_ptr()), FreeResult::Unknown);
        assert_eq!(heap.release(arena, ptr::null_mut()), FreeResult::Null);
        let m = heap.metrics();
        assert_eq!((m.releases, m.ignored_releases), (1, 1));
    }

    #[test]
    fn foreign_release_finds_owner() {
        let heap = Heap::default();
        let owner = heap.register_thread().expect("register");
        let other = heap.register_thread().expect("register");
        let p = heap.allocate(owner, 64).expect("allocate");
        heap.allocate(other, 64).expect("allocate");
        assert_eq!(
            heap.release(other, p.as_ptr()),
            FreeResult::FreedForeign { bytes: 64, arena: 0 }
        );
        assert_eq!(heap.metrics().foreign_releases, 1);
        let again = heap.allocate(owner, 64).expect("allocate");
        assert_eq!(again, p, "owner reuses the block");
    }

    #[test]
    fn release_without_any_bins_is_ignored() {
        let heap = Heap::default();
        let arena = heap.register_thread().expect("register");
        let mut local = 0u64;
        let addr = ptr::from_mut(&mut local).cast::<u8>();
        assert_eq!(heap.release(arena, addr), FreeResult::Unknown);
    }

    #[test]
    fn zero_allocate_clears_reused_memory() {
        let heap = Heap::default();
        let arena = heap.register_thread().expect("register");
        let p = heap.allocate(arena, 64).expect("allocate");
        // SAFETY: 64 writable bytes.
        unsafe { ptr::write_bytes(p.as_ptr(), 0xAB, 64) };
        heap.release(arena, p.as_ptr());
        let z = heap.zero_allocate(arena, 8, 8).expect("calloc");
        assert_eq!(z, p, "same block handed out again");
        // SAFETY: 64 readable bytes.
        let bytes = unsafe { std::slice::from_raw_parts(z.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn zero_allocate_overflow() {
        let heap = Heap::default();
        let arena = heap.register_thread().expect("register");
        assert_eq!(
            heap.zero_allocate(arena, usize::MAX / 2, 3),
            Err(AllocError::SizeOverflow)
        );
        assert_eq!(heap.metrics().size_overflow, 1);
    }

    #[test]
    fn reallocate_copies_prefix_and_frees_old() {
        let heap = Heap::default();
        let arena = heap.register_thread().expect("register");
        let p = heap.allocate(arena, 16).expect("allocate");
        // SAFETY: 16 writable bytes.
        unsafe {
            for i in 0..16u8 {
                p.as_ptr().add(i as usize).write(i);
            }
        }
        // SAFETY: p is ours and unshared.
        let q = unsafe { heap.reallocate(arena, p.as_ptr(), 200) }
            .expect("realloc")
            .expect("non-zero size");
        assert_ne!(q, p);
        // SAFETY: q holds at least 200 bytes, the first 16 copied.
        let copied = unsafe { std::slice::from_raw_parts(q.as_ptr(), 16) };
        assert_eq!(copied, (0..16u8).collect::<Vec<_>>().as_slice());
        assert_eq!(heap.usable_size(arena, p.as_ptr()), None, "old block released");
        assert_eq!(heap.usable_size(arena, q.as_ptr()), Some(256));
    }

    #[test]
    fn reallocate_edge_cases() {
        let heap = Heap::default();
        let arena = heap.register_thread().expect("register");
        // SAFETY: null is always allowed.
        let p = unsafe { heap.reallocate(arena, ptr::null_mut(), 32) }
            .expect("acts as allocate")
            .expect("block");
        // SAFETY: p is ours.
        let none = unsafe { heap.reallocate(arena, p.as_ptr(), 0) }.expect("release");
        assert_eq!(none, None);
        assert_eq!(heap.usable_size(arena, p.as_ptr()), None);
    }

    #[test]
    fn reallocate_failure_keeps_original() {
        let heap = Heap::default();
        let arena = heap.register_thread().expect("register");
        let p = heap.allocate(arena, 32).expect("allocate");
        // SAFETY: p is ours.
        let err = unsafe { heap.reallocate(arena, p.as_ptr(), 1 << 60) }.expect_err("too big");
        assert!(matches!(err, AllocError::OutOfMemory { .. } | AllocError::SizeOverflow));
        assert_eq!(heap.usable_size(arena, p.as_ptr()), Some(32));
    }

    #[test]
    fn lifecycle_records_bin_creation_and_unknown_free() {
        let heap = Heap::new(small_bins());
        let arena = heap.register_thread().expect("register");
        let p = heap.allocate(arena, 8).expect("allocate");
        heap.release(arena, p.as_ptr());
        heap.release(arena, p.as_ptr());
        let logs = heap.drain_lifecycle_logs();
        let events: Vec<(&str, &str)> = logs.iter().map(|r| (r.event, r.outcome)).collect();
        assert_eq!(
            events,
            vec![
                ("registry_page_linked", "mapped"),
                ("arena_registered", "published"),
                ("bin_created", "metadata_mapped"),
                ("alloc", "granted"),
                ("free", "freed"),
                ("free", "unknown"),
            ]
        );
        assert!(logs.windows(2).all(|w| w[0].decision_id < w[1].decision_id));
        assert_eq!(logs[5].level, AllocatorLogLevel::Warn);
        assert!(logs[3].trace_id().starts_with("heap::malloc::malloc::"));
    }

    #[test]
    fn text_report_lists_arenas_and_bins() {
        let heap = Heap::default();
        let arena = heap.register_thread().expect("register");
        heap.allocate(arena, 7).expect("allocate");
        heap.register_thread().expect("register");
        let mut text = String::new();
        heap.write_report(&mut text).expect("report");
        assert!(text.contains("Arena 0 Info"));
        assert!(text.contains("Arena 1 Info"));
        assert!(text.contains("Number of Bins : 1"));
        assert!(text.contains("Used Space : 8\n"));
        assert!(text.contains("Total Allocation Requests : 1\n"));
    }

    #[test]
    fn may_contain_is_lock_free_superset() {
        let heap = Heap::default();
        assert!(!heap.may_contain(ptr::null()));
        let arena = heap.register_thread().expect("register");
        let block = heap.allocate(arena, 64).expect("allocate");
        assert!(heap.may_contain(block.as_ptr()));
        heap.release(arena, block.as_ptr());
        assert!(heap.may_contain(block.as_ptr()), "released blocks stay in the span");
        assert!(!Heap::default().may_contain(block.as_ptr()));
    }

    #[test]
    fn handle_from_other_heap_is_rejected() {
        let first = Heap::default();
        let second = Heap::default();
        let arena = first.register_thread().expect("register");
        let own = first.allocate(arena, 8).expect("allocate");

        assert_eq!(second.allocate(arena, 8), Err(AllocError::ForeignArena));
        assert_eq!(second.zero_allocate(arena, usize::MAX, 2), Err(AllocError::ForeignArena));
        assert_eq!(second.release(arena, own.as_ptr()), FreeResult::Unknown);
        assert_eq!(second.usable_size(arena, own.as_ptr()), None);
        assert_eq!(second.metrics().foreign_handles, 4);
        assert_eq!(second.metrics().allocations, 0);

        // The block is still live in the heap that granted it.
        assert_eq!(first.usable_size(arena, own.as_ptr()), Some(8));
        assert_eq!(first.release(arena, own.as_ptr()), FreeResult::Freed { bytes: 8 });
        assert_eq!(first.metrics().foreign_handles, 0);
    }
}
