//! Construction-time configuration and the rounding rules in §4.10.

use crate::error::CreateError;
use crate::size_class::MAX_ALLOC_SIZE;

/// Default page size: 64 KiB, matching the spec's typical page size.
pub const DEFAULT_PAGE_SIZE: usize = 64 * 1024;

/// Caller-supplied tuning knobs, fixed for the lifetime of the allocator.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Upper bound on concurrent workers. Rounded up to a power of two.
    pub max_threads: usize,
    /// Page size in bytes. Must be a power of two and large enough to hold
    /// the largest bin. `0` selects [`DEFAULT_PAGE_SIZE`].
    pub page_size: usize,
    /// Number of heap shards, before power-of-two rounding. `0` selects
    /// `4 * available_parallelism()`.
    pub num_heaps: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_threads: 1,
            page_size: 0,
            num_heaps: 0,
        }
    }
}

/// Normalized configuration: every field already a valid power of two.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NormalizedConfig {
    pub n_workers: usize,
    pub page_size: usize,
    pub n_shards: usize,
}

pub(crate) fn next_pow2(n: usize) -> usize {
    if n <= 1 {
        return 1;
    }
    n.next_power_of_two()
}

fn default_num_heaps() -> usize {
    let parallelism = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    4 * parallelism
}

impl Config {
    pub(crate) fn normalize(&self) -> Result<NormalizedConfig, CreateError> {
        if self.max_threads == 0 {
            return Err(CreateError::InvalidConfig("max_threads must be > 0"));
        }
        let n_workers = next_pow2(self.max_threads);

        let page_size = if self.page_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            self.page_size
        };
        if !page_size.is_power_of_two() {
            return Err(CreateError::InvalidConfig("page_size must be a power of two"));
        }
        if page_size < MAX_ALLOC_SIZE {
            return Err(CreateError::InvalidConfig(
                "page_size must be at least max_alloc_size",
            ));
        }

        let num_heaps = if self.num_heaps == 0 {
            default_num_heaps()
        } else {
            self.num_heaps
        };
        let n_shards = next_pow2(num_heaps);

        Ok(NormalizedConfig {
            n_workers,
            page_size,
            n_shards,
        })
    }
}
