//! Process registry: the append-only table of thread arenas.
//!
//! Slots live in a chain of whole pages. Appends are serialised by one
//! process-wide lock held only for the append itself; readers never take it.
//! A slot becomes visible in three release stores (arena pointer, thread tag,
//! published count), so a reader that acquires the count sees a fully
//! initialised slot, and a reader that meets a slot whose tag or arena is
//! still zero simply stops there.

#![allow(unsafe_code)]

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use buddymalloc_core::AllocError;
use parking_lot::lock_api::RawMutex as _;
use parking_lot::{Mutex, RawMutex};

use crate::arena::ArenaHeader;
use crate::pages::{PageLink, PageProvider};

/// One registered thread: its tag, its arena head page and the lock that
/// serialises the owner against foreign releases.
#[repr(C)]
pub(crate) struct RegistrySlot {
    thread: AtomicU64,
    arena: AtomicPtr<ArenaHeader>,
    lock: RawMutex,
}

impl RegistrySlot {
    /// Thread tag; 0 while the slot is not yet published.
    pub(crate) fn thread(&self) -> u64 {
        self.thread.load(Ordering::Acquire)
    }

    pub(crate) fn arena(&self) -> Option<NonNull<ArenaHeader>> {
        NonNull::new(self.arena.load(Ordering::Acquire))
    }

    pub(crate) fn lock(&self) {
        self.lock.lock();
    }

    /// # Safety
    ///
    /// The calling thread must hold the lock taken by [`RegistrySlot::lock`].
    pub(crate) unsafe fn unlock(&self) {
        // SAFETY: forwarded to the caller.
        unsafe { self.lock.unlock() };
    }
}

#[derive(Debug, Clone, Copy)]
struct SlotLayout {
    offset: usize,
    capacity: usize,
}

impl SlotLayout {
    fn new(page_size: usize) -> Self {
        let offset = size_of::<PageLink>().next_multiple_of(align_of::<RegistrySlot>());
        let capacity = (page_size - offset) / size_of::<RegistrySlot>();
        debug_assert!(capacity > 0);
        Self { offset, capacity }
    }

    fn slot(&self, page: NonNull<PageLink>, index: usize) -> NonNull<RegistrySlot> {
        debug_assert!(index < self.capacity);
        // SAFETY: offset + capacity slots fit inside the page.
        unsafe {
            page.cast::<u8>()
                .add(self.offset + index * size_of::<RegistrySlot>())
                .cast::<RegistrySlot>()
        }
    }
}

struct AppendCursor {
    tail: Option<NonNull<PageLink>>,
}

// SAFETY: the cursor only names registry pages, which live for the whole
// process and are only written under the append lock.
unsafe impl Send for AppendCursor {}

/// Result of a successful [`Registry::register`].
pub(crate) struct Registered<'r> {
    pub(crate) index: usize,
    pub(crate) slot: &'r RegistrySlot,
    /// A new registry page was mapped and linked for this slot.
    pub(crate) linked_page: bool,
}

pub(crate) struct Registry {
    head: AtomicPtr<PageLink>,
    published: AtomicUsize,
    layout: SlotLayout,
    append: Mutex<AppendCursor>,
}

impl Registry {
    pub(crate) fn new(page_size: usize) -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            published: AtomicUsize::new(0),
            layout: SlotLayout::new(page_size),
            append: Mutex::new(AppendCursor { tail: None }),
        }
    }

    /// Slots per registry page.
    pub(crate) fn slots_per_page(&self) -> usize {
        self.layout.capacity
    }

    /// Number of published slots.
    pub(crate) fn len(&self) -> usize {
        self.published.load(Ordering::Acquire)
    }

    /// Append a slot for `thread` owning `arena`.
    pub(crate) fn register(
        &self,
        pages: &PageProvider,
        thread: u64,
        arena: NonNull<ArenaHeader>,
    ) -> Result<Registered<'_>, AllocError> {
        debug_assert_ne!(thread, 0, "thread tag 0 marks an empty slot");
        let mut cursor = self.append.lock();
        let index = self.published.load(Ordering::Relaxed);
        let in_page = index % self.layout.capacity;

        let mut linked_page = false;
        let page = match cursor.tail {
            Some(tail) if in_page != 0 => tail,
            _ => {
                let fresh = pages.map(pages.page_size())?;
                // SAFETY: fresh mapping owned by nobody else.
                let link = unsafe { PageLink::init(fresh) };
                match cursor.tail {
                    // SAFETY: tail is a live registry page.
                    Some(tail) => unsafe { tail.as_ref() }.set_next(link),
                    None => self.head.store(link.as_ptr(), Ordering::Release),
                }
                cursor.tail = Some(link);
                linked_page = true;
                link
            }
        };

        let slot = self.layout.slot(page, in_page);
        // SAFETY: the slot is unpublished, so no reader dereferences it yet.
        unsafe {
            slot.as_ptr().write(RegistrySlot {
                thread: AtomicU64::new(0),
                arena: AtomicPtr::new(ptr::null_mut()),
                lock: RawMutex::INIT,
            });
        }
        // SAFETY: initialised above; registry pages are never unmapped.
        let slot = unsafe { &*slot.as_ptr() };
        slot.arena.store(arena.as_ptr(), Ordering::Release);
        slot.thread.store(thread, Ordering::Release);
        self.published.store(index + 1, Ordering::Release);
        drop(cursor);

        Ok(Registered {
            index,
            slot,
            linked_page,
        })
    }

    /// Lock-free walk over published slots, oldest first.
    pub(crate) fn published(&self) -> PublishedSlots<'_> {
        let count = self.published.load(Ordering::Acquire);
        PublishedSlots {
            registry: self,
            page: NonNull::new(self.head.load(Ordering::Acquire)),
            index: 0,
            count,
        }
    }
}

/// Iterator returned by [`Registry::published`].
pub(crate) struct PublishedSlots<'r> {
    registry: &'r Registry,
    page: Option<NonNull<PageLink>>,
    index: usize,
    count: usize,
}

impl<'r> Iterator for PublishedSlots<'r> {
    type Item = (usize, &'r RegistrySlot);

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.count {
            return None;
        }
        let layout = self.registry.layout;
        let in_page = self.index % layout.capacity;
        if in_page == 0 && self.index > 0 {
            // SAFETY: registry pages are never unmapped.
            self.page = self.page.and_then(|p| unsafe { p.as_ref() }.next());
        }
        let Some(page) = self.page else {
            self.index = self.count;
            return None;
        };
        debug_assert!(unsafe { page.as_ref() }.is_valid());
        // SAFETY: index < count, so this slot was initialised before the count
        // we acquired was stored.
        let slot = unsafe { layout.slot(page, in_page).as_ref() };
        if slot.thread() == 0 || slot.arena().is_none() {
            self.index = self.count;
            return None;
        }
        let item = (self.index, slot);
        self.index += 1;
        Some(item)
    }
}
