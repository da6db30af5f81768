//! segfit: a concurrent segregated-fit region allocator over a
//! caller-supplied, fixed-size buffer.
//!
//! Three tiers do the work: a synchronization-free thread cache per
//! `(worker, bin)`, a sharded heap owning partial/full pages and a
//! lock-free deferred-free intake list, and a page allocator that bump-
//! allocates fixed-size pages from the backing region and recycles them
//! through a shared free list. See [`SegAlloc`] for the entry point.
//!
//! # Usage
//!
//! ```
//! use segfit::{Config, SegAlloc};
//!
//! let mut buffer = vec![0u8; 4 * 1024 * 1024];
//! let alloc = SegAlloc::create(&mut buffer, Config::default()).unwrap();
//!
//! let p = alloc.alloc(0, 64);
//! assert!(!p.is_null());
//! alloc.free(p);
//! alloc.collect_garbage(-1, true);
//! ```

pub mod allocator;
pub mod carve;
pub mod config;
pub mod error;
pub mod heap_shard;
pub mod page;
pub mod page_allocator;
pub mod size_class;
pub mod sync;
pub mod thread_cache;
pub mod used_page_store;

pub use allocator::SegAlloc;
pub use config::Config;
pub use error::CreateError;
pub use size_class::MAX_ALLOC_SIZE;
