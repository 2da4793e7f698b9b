//! Cache layer that orchestrates caching logic with network fetching.

use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::traits::CacheResult;
use super::ttl::TtlCache;

/// Read-through wrapper around [`TtlCache`].
///
/// This layer sits between the application and the network client: fresh
/// entries are served without a round trip, everything else is fetched and
/// stored under the caller's TTL.
pub struct CacheLayer {
  cache: Arc<TtlCache>,
}

impl CacheLayer {
  pub fn new(cache: Arc<TtlCache>) -> Self {
    Self { cache }
  }

  pub fn cache(&self) -> &Arc<TtlCache> {
    &self.cache
  }

  /// Fetch with cache-first strategy.
  ///
  /// 1. Check cache - if fresh, return immediately
  /// 2. If expired/missing, fetch from network
  /// 3. Store the fetched data for `ttl`
  ///
  /// Fetch errors are returned untouched; callers decide on offline fallbacks.
  pub async fn fetch<T, E, F, Fut>(
    &self,
    key: &str,
    ttl: Duration,
    fetcher: F,
  ) -> Result<CacheResult<T>, E>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
  {
    if let Some(entry) = self.cache.get_entry(key) {
      match serde_json::from_value::<T>(entry.data) {
        Ok(data) => return Ok(CacheResult::from_cache(data, entry.created_at)),
        Err(e) => debug!(key, error = %e, "Cached value has unexpected shape, refetching"),
      }
    }

    let data = fetcher().await?;
    self.cache.set_value(key, &data, Some(ttl));
    Ok(CacheResult::from_network(data))
  }
}

impl Clone for CacheLayer {
  fn clone(&self) -> Self {
    Self {
      cache: Arc::clone(&self.cache),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::clock::ManualClock;
  use crate::config::CacheConfig;
  use crate::store::MemoryStore;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn layer() -> (CacheLayer, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let cache = TtlCache::new(Arc::new(MemoryStore::new()), &CacheConfig::default())
      .with_clock(clock.clone());
    (CacheLayer::new(Arc::new(cache)), clock)
  }

  #[tokio::test]
  async fn test_fresh_entry_skips_fetch() {
    let (layer, clock) = layer();
    let counter = AtomicU32::new(0);
    let calls = &counter;
    let fetch = move || async move {
      calls.fetch_add(1, Ordering::SeqCst);
      Ok::<_, String>(vec!["Culto".to_string()])
    };

    let first = layer.fetch("events_c1", Duration::from_secs(600), fetch).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);

    let second = layer.fetch("events_c1", Duration::from_secs(600), fetch).await.unwrap();
    assert_eq!(second.source, CacheSource::CacheFresh);
    assert_eq!(second.data, vec!["Culto".to_string()]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    clock.advance(chrono::Duration::seconds(601));
    let third = layer.fetch("events_c1", Duration::from_secs(600), fetch).await.unwrap();
    assert_eq!(third.source, CacheSource::Network);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_fetch_error_is_not_cached() {
    let (layer, _clock) = layer();

    let result = layer
      .fetch("members_c1", Duration::from_secs(60), || async {
        Err::<Vec<String>, _>("offline".to_string())
      })
      .await;

    assert_eq!(result.unwrap_err(), "offline");
    assert!(!layer.cache().has("members_c1"));
  }
}
