//! Tier 1: the thread cache (§4.7).
//!
//! One cell per `(worker, bin)`. A cell is touched by exactly one worker,
//! so the fast path needs no synchronization whatsoever — no atomics, no
//! lock, not even a branch beyond the null check the sentinel page makes
//! free. The slow paths only run when a worker's own page runs dry, and
//! they go through the owning shard, never another worker's cell.

use crate::page::{Page, PageSList};

/// One `(worker, bin)` cell. `active` starts pointed at the process-wide
/// null-page sentinel so the fast path never needs a null check on the
/// cell itself.
pub struct ThreadCacheCell {
    active: *mut Page,
    reserve: PageSList,
    used: PageSList,
}

impl ThreadCacheCell {
    pub fn new(null_page: *mut Page) -> Self {
        ThreadCacheCell {
            active: null_page,
            reserve: PageSList::new(),
            used: PageSList::new(),
        }
    }

    /// Serve one slot. `page_alloc_fn` pulls a replenishment batch from
    /// the shard (partial/cache/fresh, per §4.6); `page_return_fn` hands
    /// exhausted pages back to the shard's full list. Returns null only
    /// when the shard itself is out of pages for this bin.
    pub fn alloc(
        &mut self,
        null_page: *mut Page,
        mut page_alloc_fn: impl FnMut() -> PageSList,
        mut page_return_fn: impl FnMut(PageSList),
    ) -> *mut u8 {
        loop {
            // Fast path.
            let slot = unsafe { (*self.active).alloc() };
            if !slot.is_null() {
                return slot;
            }

            // Slow path.
            if self.active != null_page {
                self.used.push(self.active);
                self.active = null_page;
            }
            if !self.reserve.is_empty() {
                self.active = self.reserve.pop();
                continue;
            }

            // Very slow path: return exhausted pages before asking for more,
            // so a stalled worker never starves the rest of the shard.
            if !self.used.is_empty() {
                let (head, count) = self.used.take_all();
                page_return_fn(rebuild(head, count));
            }
            self.reserve = page_alloc_fn();
            if self.reserve.is_empty() {
                return std::ptr::null_mut();
            }
            self.active = self.reserve.pop();
        }
    }
}

/// `PageSList` doesn't expose constructing a list straight from a
/// detached `(head, count)` pair; this rebuilds one for `page_return_fn`.
fn rebuild(head: *mut Page, count: usize) -> PageSList {
    let mut list = PageSList::new();
    if head.is_null() {
        return list;
    }
    list.push_chain(head, tail_of(head), count);
    list
}

fn tail_of(mut head: *mut Page) -> *mut Page {
    unsafe {
        while !(*head).pool_next().is_null() {
            head = (*head).pool_next();
        }
    }
    head
}
