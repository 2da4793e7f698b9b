//! Core types for the caching system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// One cached payload with its age bookkeeping.
///
/// This is also the on-disk format: the durable tier stores one serialized
/// `CacheEntry` per namespaced key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  /// Key without the namespace prefix
  pub key: String,
  /// Opaque payload
  pub data: Value,
  pub created_at: DateTime<Utc>,
  /// Time to live in milliseconds
  pub ttl_ms: u64,
}

impl CacheEntry {
  pub fn new(key: &str, data: Value, created_at: DateTime<Utc>, ttl: Duration) -> Self {
    Self {
      key: key.to_string(),
      data,
      created_at,
      ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
    }
  }

  /// An entry is valid iff `now - created_at < ttl`.
  pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
    let elapsed = (now - self.created_at).num_milliseconds();
    elapsed < i64::try_from(self.ttl_ms).unwrap_or(i64::MAX)
  }

  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    !self.is_valid(now)
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still within its TTL
  CacheFresh,
  /// Network unavailable, serving the last offline snapshot
  Offline,
}

/// Entry counts for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
  pub memory_entries: usize,
  pub durable_entries: usize,
  pub max_size: usize,
}
