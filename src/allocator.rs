//! Top-level allocator (§4.8): carves the caller's buffer and dispatches
//! `alloc`/`free`/`collect_garbage` to the right shard and cache.

use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};

use log::debug;

use crate::carve::Carver;
use crate::config::Config;
use crate::error::CreateError;
use crate::heap_shard::HeapShard;
use crate::page::Page;
use crate::page_allocator::PageAllocator;
use crate::size_class::{self, NUM_BINS};
use crate::thread_cache::ThreadCacheCell;

/// A segregated-fit allocator carved entirely out of a caller-supplied
/// buffer. Every control structure and data page lives inside that
/// buffer; `SegAlloc` itself is just a handful of pointers into it, so
/// dropping it does not free anything — the caller owns the buffer and
/// its lifetime.
pub struct SegAlloc<'buf> {
    page_alloc: NonNull<PageAllocator>,
    shards: NonNull<HeapShard>,
    n_shards: usize,
    /// One row of `NUM_BINS` cells per worker.
    tcache_rows: NonNull<NonNull<ThreadCacheCell>>,
    n_workers: usize,
    null_page: NonNull<Page>,
    _marker: PhantomData<&'buf mut [u8]>,
}

// Every mutable access is routed through a spin lock (shard state, page
// allocator) or is confined to a single worker's own cell (thread cache);
// the raw pointers here are safe to share across threads under that
// protocol.
unsafe impl Send for SegAlloc<'_> {}
unsafe impl Sync for SegAlloc<'_> {}

impl<'buf> SegAlloc<'buf> {
    /// Partition `buffer` per `config` and build every control structure
    /// in place. Fails if `buffer` cannot hold the control structures and
    /// at least one data page (§4.8, steps 1-7).
    pub fn create(buffer: &'buf mut [u8], config: Config) -> Result<Self, CreateError> {
        let norm = config.normalize()?;

        let start = buffer.as_mut_ptr();
        let end = unsafe { start.add(buffer.len()) };
        let mut carver = unsafe { Carver::new(start, end) };

        // Steps 1-5: control block, null-page sentinel, shards, and the
        // worker-cache matrix (row pointers + the cells themselves).
        let page_alloc_slot = carver.alloc::<PageAllocator>()?;
        let null_page_slot = carver.alloc::<Page>()?;
        let shards_slot = carver.alloc_array::<HeapShard>(norm.n_shards)?;
        let row_ptrs_slot = carver.alloc_array::<NonNull<ThreadCacheCell>>(norm.n_workers)?;
        let cells_slot = carver.alloc_array::<ThreadCacheCell>(norm.n_workers * NUM_BINS)?;

        // Steps 6-7: page metadata array, then the aligned page-data area.
        // The `- 1` mirrors §4.8's formula: it reserves slack for the
        // alignment padding `alloc_bytes` may need to carve the data area.
        let per_page_total = norm.page_size + mem::size_of::<Page>();
        let raw_num_pages = carver.remaining() / per_page_total;
        if raw_num_pages < 2 {
            return Err(CreateError::BufferTooSmall {
                needed_at_least: per_page_total * 2,
            });
        }
        let num_pages = raw_num_pages - 1;

        let pages_slot = carver.alloc_array::<Page>(num_pages)?;
        let data_slot = carver.alloc_bytes(num_pages * norm.page_size, norm.page_size)?;

        unsafe {
            null_page_slot.as_ptr().write(Page::NULL);

            page_alloc_slot
                .as_ptr()
                .write(PageAllocator::new(pages_slot, data_slot.as_ptr(), norm.page_size, num_pages));

            for i in 0..norm.n_shards {
                shards_slot.as_ptr().add(i).write(HeapShard::new(i));
            }

            for w in 0..norm.n_workers {
                let row_ptr = NonNull::new_unchecked(cells_slot.as_ptr().add(w * NUM_BINS));
                row_ptrs_slot.as_ptr().add(w).write(row_ptr);
                for b in 0..NUM_BINS {
                    cells_slot
                        .as_ptr()
                        .add(w * NUM_BINS + b)
                        .write(ThreadCacheCell::new(null_page_slot.as_ptr()));
                }
            }
        }

        debug!(
            "segfit: carved {} shard(s), {} worker row(s), {} page(s) of {} bytes",
            norm.n_shards, norm.n_workers, num_pages, norm.page_size
        );

        Ok(SegAlloc {
            page_alloc: page_alloc_slot,
            shards: shards_slot,
            n_shards: norm.n_shards,
            tcache_rows: row_ptrs_slot,
            n_workers: norm.n_workers,
            null_page: null_page_slot,
            _marker: PhantomData,
        })
    }

    #[inline]
    fn page_alloc(&self) -> &PageAllocator {
        unsafe { self.page_alloc.as_ref() }
    }

    #[inline]
    fn shard(&self, idx: usize) -> &HeapShard {
        unsafe { &*self.shards.as_ptr().add(idx) }
    }

    #[inline]
    fn cell_ptr(&self, worker: usize, bin: usize) -> *mut ThreadCacheCell {
        let row = unsafe { *self.tcache_rows.as_ptr().add(worker) };
        unsafe { row.as_ptr().add(bin) }
    }

    /// The largest size servable through a bin (`size > max_alloc_size()`
    /// is always rejected).
    #[inline]
    pub fn max_alloc_size(&self) -> usize {
        size_class::MAX_ALLOC_SIZE
    }

    /// Allocate `size` bytes for worker `tid`. Returns null if `size`
    /// exceeds [`Self::max_alloc_size`] or the backing region is
    /// exhausted for this bin.
    pub fn alloc(&self, tid: usize, size: usize) -> *mut u8 {
        debug_assert!(
            size <= size_class::MAX_ALLOC_SIZE,
            "request {size} exceeds max_alloc_size; caller must filter (§7)"
        );
        let Some(bin) = size_class::bin_of(size) else {
            return ptr::null_mut();
        };
        self.alloc_in_bin(tid, bin)
    }

    /// Convenience overload that derives `tid` from the calling thread's
    /// identity. Prefer [`Self::alloc`] with an explicit `tid`: hashing
    /// `std::thread::current().id()` can oversubscribe a cache cell when
    /// the number of live OS threads exceeds `Nworkers`.
    pub fn alloc_auto(&self, size: usize) -> *mut u8 {
        self.alloc(hash_current_thread(), size)
    }

    fn alloc_in_bin(&self, tid: usize, bin: usize) -> *mut u8 {
        let h = hash_tid(tid);
        let shard_idx = (h as usize) & (self.n_shards - 1);
        let worker_idx = (h as usize) & (self.n_workers - 1);

        let shard = self.shard(shard_idx);
        let page_alloc = self.page_alloc();
        let cell = unsafe { &mut *self.cell_ptr(worker_idx, bin) };

        cell.alloc(
            self.null_page.as_ptr(),
            || shard.alloc_pages(bin, page_alloc),
            |chain| shard.push_full(bin, chain),
        )
    }

    /// Return a pointer aligned to `align` (a power of two). If a bin's
    /// natural alignment already satisfies `align`, this is exactly
    /// `alloc`; otherwise a bin large enough for `size + align - 1` is
    /// chosen and the returned pointer is aligned upward within that
    /// slot; `free`'s slot-index division (not alignment) recovers the
    /// slot base regardless of where in the slot this lands (see
    /// SPEC_FULL's resolution of the aligned-alloc open question).
    pub fn aligned_alloc(&self, tid: usize, size: usize, align: usize) -> *mut u8 {
        if !align.is_power_of_two() {
            debug_assert!(false, "align must be a power of two");
            return ptr::null_mut();
        }
        if let Some(bin) = size_class::bin_for_aligned(size, align) {
            return self.alloc_in_bin(tid, bin);
        }
        let Some(total) = size.checked_add(align - 1) else {
            return ptr::null_mut();
        };
        let Some(bin) = size_class::bin_of(total) else {
            return ptr::null_mut();
        };
        let raw = self.alloc_in_bin(tid, bin);
        if raw.is_null() {
            return raw;
        }
        let addr = raw as usize;
        let aligned = (addr + align - 1) & !(align - 1);
        aligned as *mut u8
    }

    /// Free a pointer previously returned by `alloc`/`aligned_alloc`.
    /// Locates the owning page by address arithmetic, recovers the slot
    /// base, and queues the free on that shard's intake list.
    ///
    /// Slot-base recovery cannot be done by rounding `ptr` down to the
    /// bin's alignment: an `aligned_alloc` pointer can sit anywhere inside
    /// its slot, and that in-slot offset is itself always a multiple of
    /// `bin.align` whenever `align > bin.align`, which makes the aligned
    /// pointer look already-aligned and turns the round-down into a no-op.
    /// Instead, every pointer this allocator ever hands out falls within
    /// exactly one slot of a fixed stride from the page base, so plain
    /// integer division recovers the slot index regardless of where in
    /// the slot `ptr` points (see SPEC_FULL's resolution of the aligned-
    /// alloc open question).
    pub fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let page = self.page_alloc().page_for_ptr(ptr);
        debug_assert!(!page.is_null(), "free of a pointer this allocator did not hand out");
        if page.is_null() {
            return;
        }
        let bin = unsafe { (*page).bin() };
        let shard_idx = unsafe { (*page).shard() };
        let base = unsafe { (*page).base() };
        let size = size_class::bin(bin).size;
        let offset = (ptr as usize) - (base as usize);
        let slot_base = unsafe { base.add((offset / size) * size) };
        self.shard(shard_idx).deferred_free(bin, slot_base);
    }

    /// Apply deferred frees and reclaim empty pages. `tid_or_all < 0`
    /// sweeps every shard; otherwise only the shard `tid` hashes to.
    pub fn collect_garbage(&self, tid_or_all: isize, flush_cache: bool) {
        let page_alloc = self.page_alloc();
        if tid_or_all < 0 {
            for i in 0..self.n_shards {
                self.shard(i).collect_garbage(page_alloc, flush_cache);
            }
        } else {
            let shard_idx = (hash_tid(tid_or_all as usize) as usize) & (self.n_shards - 1);
            self.shard(shard_idx).collect_garbage(page_alloc, flush_cache);
        }
    }
}

/// splitmix64's finalizer, used to scramble `tid` before masking it down
/// to a shard/worker index so sequential or sparse worker ids still
/// spread evenly regardless of `Nshards`/`Nworkers`.
#[inline]
fn hash_tid(tid: usize) -> u64 {
    let mut z = (tid as u64).wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn hash_current_thread() -> usize {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish() as usize
}
