//! Thread arenas.
//!
//! An arena is a chain of metadata pages. Each page starts with an
//! [`ArenaHeader`] followed by a fixed number of bin records and the same
//! number of metadata-pool records; only the head page's scalar fields are
//! meaningful. Bin records are kept in creation order, which is also the
//! first-fit search order.
//!
//! All access goes through an [`ArenaGuard`], which holds the arena's
//! registry lock for its lifetime.

#![allow(unsafe_code)]

use std::ptr::{self, NonNull};
use std::slice;

use buddymalloc_core::sizing;
use buddymalloc_core::{AllocError, BinStats, BuddyTree, Grant, NodeStates, ReleaseResult, StatsVisitor};

use crate::pages::{PageLink, PageProvider};
use crate::registry::RegistrySlot;

#[repr(C)]
pub(crate) struct ArenaHeader {
    link: PageLink,
    arena_size: usize,
    bin_count: usize,
    page_count: usize,
    pool_count: usize,
    tail: *mut ArenaHeader,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct BinRecord {
    base: usize,
    pages: usize,
    meta: usize,
    used_bytes: usize,
    alloc_requests: u64,
    free_requests: u64,
}

/// Spare capacity in a mapped run of metadata pages.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct PoolRecord {
    addr: usize,
    pages: usize,
    next_free: usize,
}

/// Record placement inside an arena metadata page, computed once per heap.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ArenaLayout {
    bins_offset: usize,
    pools_offset: usize,
    capacity: usize,
}

impl ArenaLayout {
    pub(crate) fn new(page_size: usize) -> Self {
        let bins_offset = size_of::<ArenaHeader>().next_multiple_of(align_of::<BinRecord>());
        let per_bin = size_of::<BinRecord>() + size_of::<PoolRecord>();
        let capacity = (page_size - bins_offset) / per_bin;
        debug_assert!(capacity > 0);
        let pools_offset = (bins_offset + capacity * size_of::<BinRecord>())
            .next_multiple_of(align_of::<PoolRecord>());
        Self {
            bins_offset,
            pools_offset,
            capacity,
        }
    }

    /// Bin records per metadata page.
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    fn bin(&self, page: NonNull<ArenaHeader>, index: usize) -> *mut BinRecord {
        debug_assert!(index < self.capacity);
        // SAFETY: the record array fits inside the page by construction.
        unsafe {
            page.cast::<u8>()
                .add(self.bins_offset + index * size_of::<BinRecord>())
                .cast::<BinRecord>()
                .as_ptr()
        }
    }

    fn pool(&self, page: NonNull<ArenaHeader>, index: usize) -> *mut PoolRecord {
        debug_assert!(index < self.capacity);
        // SAFETY: as for `bin`.
        unsafe {
            page.cast::<u8>()
                .add(self.pools_offset + index * size_of::<PoolRecord>())
                .cast::<PoolRecord>()
                .as_ptr()
        }
    }
}

/// What an arena needs from its heap.
#[derive(Clone, Copy)]
pub(crate) struct ArenaEnv<'h> {
    pub(crate) pages: &'h PageProvider,
    pub(crate) layout: ArenaLayout,
    pub(crate) leaf: usize,
    pub(crate) min_bin_pages: usize,
}

impl ArenaEnv<'_> {
    fn page_size(&self) -> usize {
        self.pages.page_size()
    }

    fn metadata_len(&self, bin_pages: usize) -> usize {
        BuddyTree::metadata_len(sizing::bin_bytes(bin_pages, self.page_size()), self.leaf)
    }
}

/// Map and initialise the head page of a new, empty arena.
pub(crate) fn create_arena(pages: &PageProvider) -> Result<NonNull<ArenaHeader>, AllocError> {
    let page = pages.map(pages.page_size())?;
    // SAFETY: fresh mapping.
    Ok(unsafe { init_page(page) })
}

/// # Safety
///
/// `page` must be a fresh, unshared mapping of one page.
unsafe fn init_page(page: NonNull<u8>) -> NonNull<ArenaHeader> {
    // SAFETY: forwarded to the caller.
    let link = unsafe { PageLink::init(page) };
    let header = link.cast::<ArenaHeader>();
    // SAFETY: the link was written in place; fill in the rest of the header.
    unsafe {
        let h = header.as_ptr();
        ptr::addr_of_mut!((*h).arena_size).write(0);
        ptr::addr_of_mut!((*h).bin_count).write(0);
        ptr::addr_of_mut!((*h).page_count).write(1);
        ptr::addr_of_mut!((*h).pool_count).write(0);
        ptr::addr_of_mut!((*h).tail).write(h);
    }
    header
}

/// A successful arena allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Placement {
    pub(crate) grant: Grant,
    /// Ordinal of the bin that served the request.
    pub(crate) bin: usize,
    pub(crate) created: Option<BinCreation>,
}

/// Side effects of creating a bin for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BinCreation {
    pub(crate) pages: usize,
    /// Metadata needed fresh pages instead of pool spare capacity.
    pub(crate) metadata_mapped: bool,
    /// A new metadata page was linked to hold the bin record.
    pub(crate) page_linked: bool,
}

/// Outcome of [`ArenaGuard::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArenaRelease {
    Freed { bytes: usize, bin: usize },
    /// A bin contains the address but no granted block starts there.
    NotFound { bin: usize },
    /// No bin of this arena contains the address.
    NotOwned,
}

/// Exclusive access to one arena, holding its registry lock.
pub(crate) struct ArenaGuard<'h> {
    env: ArenaEnv<'h>,
    slot: &'h RegistrySlot,
    head: NonNull<ArenaHeader>,
}

impl<'h> ArenaGuard<'h> {
    /// Block until the slot's lock is free. `None` if the slot has no arena.
    pub(crate) fn lock(env: ArenaEnv<'h>, slot: &'h RegistrySlot) -> Option<Self> {
        let head = slot.arena()?;
        slot.lock();
        Some(Self { env, slot, head })
    }

    fn header(&self) -> &ArenaHeader {
        // SAFETY: head is a live arena page and the lock is held.
        unsafe { self.head.as_ref() }
    }

    fn header_mut(&mut self) -> &mut ArenaHeader {
        // SAFETY: as above; &mut self makes this the only reference.
        unsafe { self.head.as_mut() }
    }

    pub(crate) fn arena_size(&self) -> usize {
        self.header().arena_size
    }

    pub(crate) fn bin_count(&self) -> usize {
        self.header().bin_count
    }

    /// Metadata page holding record `ordinal`.
    fn page_for(&self, ordinal: usize) -> NonNull<ArenaHeader> {
        let mut page = self.head;
        for _ in 0..ordinal / self.env.layout.capacity {
            // SAFETY: ordinal < page_count * capacity, so the chain is long
            // enough; pages are never unmapped.
            match unsafe { page.as_ref() }.link.next() {
                Some(next) => page = next.cast(),
                None => break,
            }
        }
        page
    }

    fn bin_mut(&mut self, ordinal: usize) -> &mut BinRecord {
        let page = self.page_for(ordinal);
        // SAFETY: ordinal < bin_count, so the record is initialised.
        unsafe { &mut *self.env.layout.bin(page, ordinal % self.env.layout.capacity) }
    }

    /// Visit bin records in creation order until `f` returns `Some`.
    fn find_bin<T>(&mut self, mut f: impl FnMut(usize, &mut BinRecord) -> Option<T>) -> Option<T> {
        let count = self.header().bin_count;
        let capacity = self.env.layout.capacity;
        let mut page = self.head;
        for ordinal in 0..count {
            let in_page = ordinal % capacity;
            if in_page == 0 && ordinal > 0 {
                // SAFETY: more records follow, so the next page exists.
                page = unsafe { page.as_ref() }.link.next()?.cast();
            }
            // SAFETY: ordinal < bin_count.
            let record = unsafe { &mut *self.env.layout.bin(page, in_page) };
            if let Some(found) = f(ordinal, record) {
                return Some(found);
            }
        }
        None
    }

    /// Serve `size` bytes with blocks no smaller than `min_block`, creating a
    /// bin if no existing one can.
    pub(crate) fn allocate(&mut self, size: usize, min_block: usize) -> Result<Placement, AllocError> {
        let env = self.env;
        let needed = sizing::bin_pages(size, min_block, env.page_size(), env.min_bin_pages)?;
        let found = self.find_bin(|ordinal, record| {
            if record.pages < needed {
                return None;
            }
            let grant = tree(&env, record).allocate(size, min_block)?;
            record.used_bytes += grant.size;
            record.alloc_requests += 1;
            Some(Placement {
                grant,
                bin: ordinal,
                created: None,
            })
        });
        if let Some(placement) = found {
            return Ok(placement);
        }

        let (ordinal, creation) = self.create_bin(needed)?;
        let record = self.bin_mut(ordinal);
        let grant = tree(&env, record)
            .allocate(size, min_block)
            .ok_or(AllocError::OutOfMemory { bytes: size })?;
        record.used_bytes += grant.size;
        record.alloc_requests += 1;
        Ok(Placement {
            grant,
            bin: ordinal,
            created: Some(creation),
        })
    }

    fn create_bin(&mut self, pages: usize) -> Result<(usize, BinCreation), AllocError> {
        let env = self.env;
        let ordinal = self.header().bin_count;
        let page_linked = ordinal == self.header().page_count * env.layout.capacity;
        if page_linked {
            self.link_page()?;
        }

        let bytes = sizing::bin_bytes(pages, env.page_size());
        let base = env.pages.map_aligned(bytes, bytes)?;
        let (meta, metadata_mapped) = match self.carve_metadata(env.metadata_len(pages)) {
            Ok(carved) => carved,
            Err(err) => {
                // SAFETY: the bin was mapped above and never recorded.
                unsafe { env.pages.unmap(base, bytes) };
                return Err(err);
            }
        };

        let page = self.page_for(ordinal);
        // SAFETY: ordinal < page_count * capacity after link_page; the slot is
        // past bin_count so nothing else refers to it.
        unsafe {
            env.layout
                .bin(page, ordinal % env.layout.capacity)
                .write(BinRecord {
                    base: base.as_ptr() as usize,
                    pages,
                    meta,
                    used_bytes: 0,
                    alloc_requests: 0,
                    free_requests: 0,
                });
        }
        let header = self.header_mut();
        header.bin_count += 1;
        header.arena_size += bytes;
        Ok((
            ordinal,
            BinCreation {
                pages,
                metadata_mapped,
                page_linked,
            },
        ))
    }

    fn link_page(&mut self) -> Result<(), AllocError> {
        let fresh = self.env.pages.map(self.env.page_size())?;
        // SAFETY: fresh mapping.
        let page = unsafe { init_page(fresh) };
        let header = self.header_mut();
        // SAFETY: tail is the last live page of this arena.
        unsafe { (*header.tail).link.set_next(page.cast()) };
        header.tail = page.as_ptr();
        header.page_count += 1;
        Ok(())
    }

    /// First-fit carve of `len` metadata bytes from the pool, mapping a new
    /// pool run when none has room. Returns the address and whether it mapped.
    fn carve_metadata(&mut self, len: usize) -> Result<(usize, bool), AllocError> {
        let env = self.env;
        let capacity = env.layout.capacity;
        let pool_count = self.header().pool_count;
        for index in 0..pool_count {
            let page = self.page_for(index);
            // SAFETY: index < pool_count.
            let pool = unsafe { &mut *env.layout.pool(page, index % capacity) };
            if pool.pages * env.page_size() - pool.next_free >= len {
                let addr = pool.addr + pool.next_free;
                pool.next_free += len;
                return Ok((addr, false));
            }
        }

        let pages = len.div_ceil(env.page_size());
        let addr = env.pages.map(len)?.as_ptr() as usize;
        // Every pool run belongs to an earlier bin or the one being created,
        // so pool_count never outruns the bin slots already linked.
        let page = self.page_for(pool_count);
        // SAFETY: pool_count < page_count * capacity.
        unsafe {
            env.layout.pool(page, pool_count % capacity).write(PoolRecord {
                addr,
                pages,
                next_free: len,
            });
        }
        self.header_mut().pool_count += 1;
        Ok((addr, true))
    }

    /// Release the block starting at `addr` if one of this arena's bins
    /// granted it.
    pub(crate) fn release(&mut self, addr: usize) -> ArenaRelease {
        let env = self.env;
        self.find_bin(|ordinal, record| {
            if !bin_contains(&env, record, addr) {
                return None;
            }
            Some(match tree(&env, record).release(addr) {
                ReleaseResult::Freed(bytes) => {
                    record.used_bytes -= bytes;
                    record.free_requests += 1;
                    ArenaRelease::Freed {
                        bytes,
                        bin: ordinal,
                    }
                }
                ReleaseResult::NotFound => ArenaRelease::NotFound { bin: ordinal },
            })
        })
        .unwrap_or(ArenaRelease::NotOwned)
    }

    /// Granted size of the block starting at `addr`.
    pub(crate) fn block_size(&mut self, addr: usize) -> Option<Option<usize>> {
        let env = self.env;
        self.find_bin(|_, record| {
            bin_contains(&env, record, addr).then(|| tree(&env, record).block_size(addr))
        })
    }

    /// Feed this arena's counters to `visitor`.
    pub(crate) fn visit_stats<V: StatsVisitor + ?Sized>(&mut self, index: usize, visitor: &mut V) {
        let page_size = self.env.page_size();
        visitor.arena(index, self.slot.thread(), self.arena_size(), self.bin_count());
        self.find_bin(|ordinal, record| {
            let total_bytes = sizing::bin_bytes(record.pages, page_size);
            visitor.bin(&BinStats {
                index: ordinal,
                base: record.base,
                total_bytes,
                used_bytes: record.used_bytes,
                free_bytes: total_bytes - record.used_bytes,
                alloc_requests: record.alloc_requests,
                free_requests: record.free_requests,
            });
            None::<()>
        });
    }
}

impl Drop for ArenaGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the lock was taken in `ArenaGuard::lock`.
        unsafe { self.slot.unlock() };
    }
}

fn bin_contains(env: &ArenaEnv<'_>, record: &BinRecord, addr: usize) -> bool {
    addr >= record.base && addr - record.base < sizing::bin_bytes(record.pages, env.page_size())
}

fn tree<'r>(env: &ArenaEnv<'_>, record: &'r mut BinRecord) -> BuddyTree<'r> {
    let bytes = sizing::bin_bytes(record.pages, env.page_size());
    let len = env.metadata_len(record.pages);
    // SAFETY: `meta` names `len` bytes reserved for this bin alone when it was
    // created, and the arena lock is held for the borrow of `record`.
    let meta = unsafe { slice::from_raw_parts_mut(record.meta as *mut u8, len) };
    BuddyTree::new(NodeStates::new(meta), record.base, bytes, env.leaf)
}
