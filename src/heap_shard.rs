//! Tier 2: the heap shard (§4.6).
//!
//! One shard per `hash(tid) & (Nshards - 1)`. Holds one used-page store
//! per bin and a shared empty-page cache that lets pages hop between
//! bins across reuse without going back to the page allocator every time.

use log::debug;

use crate::page::{Page, PageSList};
use crate::page_allocator::PageAllocator;
use crate::size_class::{self, NUM_BINS};
use crate::sync::SpinLock;
use crate::used_page_store::{UsedPageStore, MIN_FREE_OBJS};

/// Empty-page cache bound (§4.6): throttles churn while keeping pages
/// warm across bin rotations.
pub const NUM_CACHED_PAGES: usize = 100;

pub struct HeapShard {
    /// This shard's own index, stamped onto every page it initializes so
    /// `free` can later route a pointer back to its owning shard.
    shard_id: usize,
    stores: [UsedPageStore; NUM_BINS],
    cache: SpinLock<PageSList>,
}

impl HeapShard {
    pub fn new(shard_id: usize) -> Self {
        HeapShard {
            shard_id,
            stores: std::array::from_fn(|_| UsedPageStore::new()),
            cache: SpinLock::new(PageSList::new()),
        }
    }

    /// Move a batch of pages into the cache, spilling overflow straight
    /// back to the page allocator (§4.6 empty-page purging policy).
    fn purge_into_cache(&self, mut pages: PageSList, page_alloc: &PageAllocator) {
        if pages.is_empty() {
            return;
        }
        let mut cache = self.cache.lock();
        loop {
            if cache.len() >= NUM_CACHED_PAGES {
                break;
            }
            let page = pages.pop();
            if page.is_null() {
                break;
            }
            cache.push(page);
        }
        drop(cache);
        let (overflow_head, overflow_count) = pages.take_all();
        if !overflow_head.is_null() {
            debug!(
                "segfit: empty-page cache overflow, spilling {overflow_count} page(s) to the page allocator"
            );
            // `take_all` doesn't track the tail; walk once to find it —
            // overflow is rare (cache already near its bound).
            let mut tail = overflow_head;
            unsafe {
                while !(*tail).pool_next().is_null() {
                    tail = (*tail).pool_next();
                }
            }
            page_alloc.free_chain(overflow_head, tail, overflow_count);
        }
    }

    /// Replenish a thread cache for `bin`: partial pages first, then the
    /// empty-page cache, then fresh pages from the page allocator.
    pub fn alloc_pages(&self, bin: usize, page_alloc: &PageAllocator) -> PageSList {
        let result = self.stores[bin].alloc(page_alloc);
        self.purge_into_cache(result.purgable, page_alloc);
        if !result.partial.is_empty() {
            return result.partial;
        }

        let mut batch = PageSList::new();
        let mut free_total: u32 = 0;
        {
            let mut cache = self.cache.lock();
            while free_total < MIN_FREE_OBJS {
                let page = cache.pop();
                if page.is_null() {
                    break;
                }
                unsafe {
                    (*page).initialize(bin, self.shard_id, (*page).base(), page_alloc.page_size());
                }
                free_total += unsafe { (*page).num_free() };
                batch.push(page);
            }
        }
        if !batch.is_empty() {
            debug!("segfit: shard {} bin {bin} recycled {} page(s) from its empty-page cache", self.shard_id, batch.len());
            return batch;
        }

        loop {
            if free_total >= MIN_FREE_OBJS {
                break;
            }
            let page = page_alloc.alloc();
            if page.is_null() {
                break;
            }
            let idx = page_alloc.page_index(page);
            let base = page_alloc.data_ptr_for_index(idx);
            unsafe { (*page).initialize(bin, self.shard_id, base, page_alloc.page_size()) };
            free_total += unsafe { (*page).num_free() };
            batch.push(page);
        }
        if batch.is_empty() {
            log::warn!("segfit: shard {} bin {bin} got nothing from the page allocator", self.shard_id);
        } else {
            debug!("segfit: shard {} bin {bin} carved {} fresh page(s)", self.shard_id, batch.len());
        }
        batch
    }

    pub fn push_full(&self, bin: usize, chain: PageSList) {
        self.stores[bin].push_full(chain);
    }

    pub fn deferred_free(&self, bin: usize, obj: *mut u8) {
        self.stores[bin].deferred_free(obj);
    }

    /// Drain every bin, purging emptied pages into the cache; optionally
    /// flush the whole cache back to the page allocator afterward.
    pub fn collect_garbage(&self, page_alloc: &PageAllocator, flush_cache: bool) {
        for bin in 0..NUM_BINS {
            let result = self.stores[bin].drain(page_alloc);
            self.purge_into_cache(result.purgable, page_alloc);
        }
        if flush_cache {
            let (head, count) = self.cache.lock().take_all();
            if !head.is_null() {
                let mut tail = head;
                unsafe {
                    while !(*tail).pool_next().is_null() {
                        tail = (*tail).pool_next();
                    }
                }
                page_alloc.free_chain(head, tail, count);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }
}
