//! Intelligent caching layer for dashboard reads.
//!
//! This module provides:
//! - A two-tier TTL cache (bounded memory tier mirrored into a durable store)
//! - Per-call TTLs so each kind of data can have its own staleness tolerance
//! - Pattern invalidation, periodic cleanup and insertion-order eviction
//! - A read-through layer that only hits the network when the cache misses

mod layer;
mod traits;
mod ttl;

pub use layer::CacheLayer;
pub use traits::{CacheEntry, CacheResult, CacheSource, CacheStats};
pub use ttl::TtlCache;
