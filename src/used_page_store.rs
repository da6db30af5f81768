//! Tier 2, per-bin state: the used-page store (§4.5).
//!
//! Owns the full/partial page lists for one `(shard, bin)` pair, plus the
//! lock-free deferred-free intake list that lets any worker free an
//! object without taking the store's lock. `in_heap` is this module's
//! invariant to protect: it only ever flips under `lists`'s lock, which is
//! what makes `drain`'s re-defer decision safe.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::page::{DeferredNode, Page, PageList, PageSList};
use crate::page_allocator::PageAllocator;
use crate::sync::SpinLock;

/// Partial pages are handed to a starved caller until the cumulative
/// free-slot count across transferred pages reaches this, or the partial
/// list runs dry (§4.5, §4.6 cache path).
pub const MIN_FREE_OBJS: u32 = 50;

struct Lists {
    full: PageList,
    partial: PageList,
}

pub struct UsedPageStore {
    lists: SpinLock<Lists>,
    intake: AtomicPtr<DeferredNode>,
}

/// Result of a drain: pages that became empty and should move to the
/// shard's empty-page cache.
pub struct DrainResult {
    pub purgable: PageSList,
}

/// Result of serving an allocation replenishment: a batch of partial
/// pages for the caller plus whatever drain also purged.
pub struct AllocResult {
    pub partial: PageSList,
    pub purgable: PageSList,
}

impl UsedPageStore {
    pub const fn new() -> Self {
        UsedPageStore {
            lists: SpinLock::new(Lists {
                full: PageList::new(),
                partial: PageList::new(),
            }),
            intake: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Queue `obj` for later reclamation. Lock-free; safe from any worker.
    pub fn deferred_free(&self, obj: *mut u8) {
        let node = obj as *mut DeferredNode;
        loop {
            let head = self.intake.load(Ordering::Relaxed);
            unsafe { (*node).next.store(head, Ordering::Relaxed) };
            if self
                .intake
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Adopt pages a thread cache exhausted: mark them `in_heap` and file
    /// them on the full list.
    pub fn push_full(&self, mut chain: PageSList) {
        if chain.is_empty() {
            return;
        }
        let mut lists = self.lists.lock();
        loop {
            let page = chain.pop();
            if page.is_null() {
                break;
            }
            unsafe {
                (*page).set_in_heap(true);
                lists.full.push_back(page);
            }
        }
    }

    /// Detach the intake list and apply every queued free, re-deferring
    /// any whose page is not currently `in_heap`. Returns pages that
    /// became empty.
    pub fn drain(&self, page_alloc: &PageAllocator) -> DrainResult {
        let mut chain = self.intake.swap(ptr::null_mut(), Ordering::Acquire);

        let mut lists = self.lists.lock();
        let mut purgable = PageSList::new();
        let mut redefer_head: *mut DeferredNode = ptr::null_mut();
        let mut redefer_tail: *mut DeferredNode = ptr::null_mut();

        while !chain.is_null() {
            let next = unsafe { (*chain).next.load(Ordering::Relaxed) };
            let obj = chain as *mut u8;
            let page = page_alloc.page_for_ptr(obj);
            debug_assert!(!page.is_null(), "freed pointer outside page-data area");

            if unsafe { !(*page).is_in_heap() } {
                unsafe { (*chain).next.store(redefer_head, Ordering::Relaxed) };
                redefer_head = chain;
                if redefer_tail.is_null() {
                    redefer_tail = chain;
                }
            } else {
                unsafe {
                    let was_full = (*page).is_full();
                    (*page).free(obj);
                    if was_full {
                        lists.full.remove(page);
                        lists.partial.push_back(page);
                    }
                    if (*page).is_empty() {
                        lists.partial.remove(page);
                        (*page).set_in_heap(false);
                        purgable.push(page);
                    }
                }
            }
            chain = next;
        }
        drop(lists);

        if !redefer_head.is_null() {
            loop {
                let head = self.intake.load(Ordering::Relaxed);
                unsafe { (*redefer_tail).next.store(head, Ordering::Relaxed) };
                if self
                    .intake
                    .compare_exchange_weak(head, redefer_head, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    break;
                }
            }
        }

        DrainResult { purgable }
    }

    /// Drain, then transfer partial pages to the caller until
    /// `MIN_FREE_OBJS` free slots have been handed over or the partial
    /// list runs dry.
    pub fn alloc(&self, page_alloc: &PageAllocator) -> AllocResult {
        let drained = self.drain(page_alloc);

        let mut lists = self.lists.lock();
        let mut partial = PageSList::new();
        let mut free_total: u32 = 0;
        while free_total < MIN_FREE_OBJS {
            let page = lists.partial.pop_front();
            if page.is_null() {
                break;
            }
            unsafe {
                free_total += (*page).num_free();
                (*page).set_in_heap(false);
            }
            partial.push(page);
        }

        AllocResult {
            partial,
            purgable: drained.purgable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size_class;
    use std::ptr::NonNull;

    fn make_page_allocator(total_pages: usize, page_size: usize) -> (PageAllocator, Vec<Page>, Vec<u8>) {
        let mut pages: Vec<Page> = (0..total_pages).map(|_| Page::uninit()).collect();
        let mut data = vec![0u8; total_pages * page_size];
        let pages_ptr = NonNull::new(pages.as_mut_ptr()).unwrap();
        let data_ptr = data.as_mut_ptr();
        let alloc = unsafe { PageAllocator::new(pages_ptr, data_ptr, page_size, total_pages) };
        (alloc, pages, data)
    }

    #[test]
    fn push_full_then_drain_applies_free() {
        let bin = 0;
        let b = size_class::bin(bin);
        let page_size = 4096usize;
        let (page_alloc, _pages, _data) = make_page_allocator(1, page_size);
        let page_ptr = page_alloc.alloc();
        let idx = page_alloc.page_index(page_ptr);
        let base = page_alloc.data_ptr_for_index(idx);
        unsafe { (*page_ptr).initialize(bin, 0, base, page_size) };

        let store = UsedPageStore::new();
        let mut incoming = PageSList::new();
        // Exhaust the page before filing it as full, matching how a
        // thread cache actually hands pages back.
        let obj = unsafe { (*page_ptr).alloc() };
        assert!(!obj.is_null());
        while unsafe { !(*page_ptr).is_full() } {
            unsafe { (*page_ptr).alloc() };
        }
        incoming.push(page_ptr);
        store.push_full(incoming);

        store.deferred_free(obj);
        let result = store.drain(&page_alloc);
        assert!(result.purgable.is_empty());
        assert!(!unsafe { (*page_ptr).is_full() });
        let _ = b;
    }

    #[test]
    fn redefers_free_for_page_not_in_heap() {
        let bin = 0;
        let page_size = 4096usize;
        let (page_alloc, _pages, _data) = make_page_allocator(1, page_size);
        let page_ptr = page_alloc.alloc();
        let idx = page_alloc.page_index(page_ptr);
        let base = page_alloc.data_ptr_for_index(idx);
        unsafe { (*page_ptr).initialize(bin, 0, base, page_size) };
        // Page is not in_heap (as if owned by a thread cache).
        let obj = unsafe { (*page_ptr).alloc() };

        let store = UsedPageStore::new();
        store.deferred_free(obj);
        let result = store.drain(&page_alloc);
        assert!(result.purgable.is_empty());
        // Object was re-deferred, not applied: page is still missing one slot.
        assert_eq!(unsafe { (*page_ptr).num_free() }, unsafe { (*page_ptr).capacity() } - 1);
    }

    #[test]
    fn drain_moves_emptied_page_to_purgable() {
        // The largest bin has exactly one slot per page, so a single
        // free empties it.
        let bin = size_class::NUM_BINS - 1;
        let page_size = 4096usize;
        let (page_alloc, _pages, _data) = make_page_allocator(1, page_size);
        let page_ptr = page_alloc.alloc();
        let idx = page_alloc.page_index(page_ptr);
        let base = page_alloc.data_ptr_for_index(idx);
        unsafe { (*page_ptr).initialize(bin, 0, base, page_size) };
        assert_eq!(unsafe { (*page_ptr).capacity() }, 1);

        let store = UsedPageStore::new();
        let obj = unsafe { (*page_ptr).alloc() };
        assert!(unsafe { (*page_ptr).is_full() });
        let mut incoming = PageSList::new();
        incoming.push(page_ptr);
        store.push_full(incoming);

        store.deferred_free(obj);
        let result = store.drain(&page_alloc);
        assert!(!result.purgable.is_empty());
        assert!(unsafe { (*page_ptr).is_empty() });
        assert!(!unsafe { (*page_ptr).is_in_heap() });
    }
}
