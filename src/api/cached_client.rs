//! Cached API client that wraps ApiClient with transparent caching.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::info;

use super::client::ApiClient;
use super::error::{ApiError, Result};
use super::keys::DashboardKey;
use crate::cache::{CacheLayer, CacheResult};
use crate::config::CacheTtls;
use crate::sync::SnapshotStore;

/// Dashboard reads with caching and offline fallback.
///
/// Fresh cache entries are served without a request. When a request fails and
/// the offline snapshot captured the same endpoint, the snapshot is served
/// instead.
#[derive(Clone)]
pub struct CachedApiClient {
  inner: ApiClient,
  cache: CacheLayer,
  ttls: CacheTtls,
  snapshots: SnapshotStore,
}

impl CachedApiClient {
  pub fn new(inner: ApiClient, cache: CacheLayer, ttls: CacheTtls, snapshots: SnapshotStore) -> Self {
    Self {
      inner,
      cache,
      ttls,
      snapshots,
    }
  }

  /// Aggregated dashboard data for a user.
  pub async fn dashboard(&self, user_id: &str) -> Result<CacheResult<Value>> {
    let key = DashboardKey::DashboardData {
      user_id: user_id.to_string(),
    };
    self.read(&key).await
  }

  /// Notifications for a user (short TTL).
  pub async fn notifications(&self, user_id: &str) -> Result<CacheResult<Value>> {
    let key = DashboardKey::Notifications {
      user_id: user_id.to_string(),
    };
    self.read(&key).await
  }

  /// Church directory.
  pub async fn churches(&self) -> Result<CacheResult<Value>> {
    self.read(&DashboardKey::Churches).await
  }

  pub async fn members(&self, church_id: &str) -> Result<CacheResult<Value>> {
    let key = DashboardKey::Members {
      church_id: church_id.to_string(),
    };
    self.read(&key).await
  }

  pub async fn events(&self, church_id: &str) -> Result<CacheResult<Value>> {
    let key = DashboardKey::Events {
      church_id: church_id.to_string(),
    };
    self.read(&key).await
  }

  /// Tithes (not part of the offline snapshot).
  pub async fn tithes(&self, church_id: &str) -> Result<CacheResult<Value>> {
    let key = DashboardKey::Tithes {
      church_id: church_id.to_string(),
    };
    self.read(&key).await
  }

  async fn read(&self, key: &DashboardKey) -> Result<CacheResult<Value>> {
    let endpoint = key.endpoint();
    let result = self
      .cache
      .fetch(&key.cache_key(), key.ttl(&self.ttls), || {
        let inner = self.inner.clone();
        async move { inner.get_json::<Value>(&endpoint).await }
      })
      .await;

    match result {
      Ok(data) => Ok(data),
      // A dead session is not an offline condition
      Err(ApiError::Unauthorized) => Err(ApiError::Unauthorized),
      Err(e) => match self.offline_copy(key) {
        Some((data, last_sync)) => {
          info!(query = %key.description(), error = %e, "Serving offline snapshot");
          Ok(CacheResult::offline(data, last_sync))
        }
        None => Err(e),
      },
    }
  }

  fn offline_copy(&self, key: &DashboardKey) -> Option<(Value, DateTime<Utc>)> {
    let field = key.snapshot_field()?;
    let snapshot = self.snapshots.load()?;
    let data = snapshot.data_for(field, &key.endpoint())?.clone();
    Some((data, snapshot.last_sync))
  }
}
