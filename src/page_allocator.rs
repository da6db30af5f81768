//! Tier 3: the page allocator (§4.6).
//!
//! Owns the whole page-data area and the parallel page-metadata array
//! carved out of it. New pages are handed out by bumping a cursor;
//! pages a shard has emptied and decided it has too many of come back
//! here onto a shared free list instead of being handed back to the OS —
//! there is no OS in this picture, the buffer is all there is.
//!
//! Address-to-page lookup (`page_for_ptr`) is what lets `free` find a
//! pointer's owning page without the caller supplying one: pages live at
//! a fixed stride from `data_base`, so the index is one shift.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, warn};

use crate::page::{Page, PageSList};
use crate::sync::SpinLock;

pub struct PageAllocator {
    /// Page metadata records, one per page-data slot, in the same order.
    pages: NonNull<Page>,
    /// Start of the page-data area in the caller's buffer.
    data_base: *mut u8,
    page_size: usize,
    page_shift: u32,
    total_pages: usize,
    /// How many page slots have ever been bump-allocated.
    bumped: AtomicUsize,
    /// Pages returned by shards, available for reuse before bumping further.
    free: SpinLock<PageSList>,
}

// `pages`/`data_base` point at memory owned for the allocator's whole
// lifetime; all mutation goes through the atomic cursor or the spin lock.
unsafe impl Send for PageAllocator {}
unsafe impl Sync for PageAllocator {}

impl PageAllocator {
    /// # Safety
    /// `pages` must point to `total_pages` valid, uninitialized `Page`
    /// records; `data_base` must point to `total_pages * page_size`
    /// writable bytes; `page_size` must be a power of two.
    pub unsafe fn new(pages: NonNull<Page>, data_base: *mut u8, page_size: usize, total_pages: usize) -> Self {
        debug_assert!(page_size.is_power_of_two());
        PageAllocator {
            pages,
            data_base,
            page_size,
            page_shift: page_size.trailing_zeros(),
            total_pages,
            bumped: AtomicUsize::new(0),
            free: SpinLock::new(PageSList::new()),
        }
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    /// Hand out a page: a previously returned one if the reuse free list
    /// has one, otherwise a fresh page bumped off the backing region, or
    /// null if both are exhausted.
    pub fn alloc(&self) -> *mut Page {
        let recycled = self.free.lock().pop();
        if !recycled.is_null() {
            debug!("segfit: page recycled from the shared free list");
            return recycled;
        }

        loop {
            let idx = self.bumped.load(Ordering::Relaxed);
            if idx >= self.total_pages {
                warn!("segfit: page allocator exhausted ({} pages)", self.total_pages);
                return std::ptr::null_mut();
            }
            if self
                .bumped
                .compare_exchange_weak(idx, idx + 1, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return unsafe { self.pages.as_ptr().add(idx) };
            }
        }
    }

    /// Return an emptied page to the shared pool for reuse.
    pub fn free(&self, page: *mut Page) {
        debug!("segfit: page returned to the page allocator");
        self.free.lock().push(page);
    }

    /// Return a whole chain (as built by [`crate::page::PageSList::take_all`]
    /// or similar) in O(1).
    pub fn free_chain(&self, head: *mut Page, tail: *mut Page, count: usize) {
        if head.is_null() {
            return;
        }
        debug!("segfit: {count} page(s) returned to the page allocator");
        self.free.lock().push_chain(head, tail, count);
    }

    #[inline]
    pub fn data_base(&self) -> *mut u8 {
        self.data_base
    }

    /// Byte offset of `page`'s data slot from `data_base`.
    #[inline]
    pub fn page_index(&self, page: *const Page) -> usize {
        let idx = unsafe { page.offset_from(self.pages.as_ptr()) };
        debug_assert!(idx >= 0);
        idx as usize
    }

    #[inline]
    pub fn data_ptr_for_index(&self, idx: usize) -> *mut u8 {
        unsafe { self.data_base.add(idx * self.page_size) }
    }

    /// Locate the page metadata record owning `ptr`, or null if `ptr`
    /// falls outside the page-data area.
    pub fn page_for_ptr(&self, ptr: *const u8) -> *mut Page {
        let base = self.data_base as usize;
        let addr = ptr as usize;
        if addr < base {
            return std::ptr::null_mut();
        }
        let idx = (addr - base) >> self.page_shift;
        if idx >= self.total_pages {
            return std::ptr::null_mut();
        }
        unsafe { self.pages.as_ptr().add(idx) }
    }
}
