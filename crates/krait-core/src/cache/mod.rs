//! Guest-RIP → host-code lookup cache
//!
//! Shared by every guest thread of a process: a direct-mapped L1 hint
//! table in front of an exact two-level page-directory lookup, plus the
//! bookkeeping needed to undo cross-block direct links on invalidation.

pub mod lookup;
pub mod region;

pub use lookup::{BlockEntry, BlockLinkSite, LookupCache};
pub use region::MmapRegion;

/// Errors from cache construction and insertion.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Reserving one of the backing mappings failed at construction.
    /// Fatal: the translator cannot run without its cache.
    #[error("failed to map cache region: {0}")]
    MappingFailed(std::io::Error),
    /// The block store is exhausted even after a full clear. Cannot
    /// happen at one page-region granularity; surfaced for completeness.
    #[error("code cache exhausted")]
    CacheFull,
}
