//! Construction-time error type.
//!
//! `alloc`/`free`/`collect_garbage` never produce a `Result`: per the
//! allocator's error model, the hot path stays on `Option`/null-return and
//! precondition violations are the caller's responsibility. Only `create`
//! can fail, and it fails with enough detail to fix the call site.

/// Reasons `SegAlloc::create` can refuse a buffer or configuration.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CreateError {
    /// The buffer was too small to carve the control structures and at
    /// least one data page.
    #[error("buffer too small: need at least {needed_at_least} bytes")]
    BufferTooSmall {
        /// A lower bound on the bytes required, computed after the control
        /// structures were sized but before the page-data area was carved.
        needed_at_least: usize,
    },
    /// A configuration value could not be normalized into something usable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}
