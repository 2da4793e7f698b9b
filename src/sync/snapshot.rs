//! Last-known-good data for offline display.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use crate::store::DurableStore;

/// Everything the dashboard needs to render without the network.
///
/// Replaced as a whole on each successful preload, never merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineSnapshot {
  pub last_sync: DateTime<Utc>,
  pub dashboard_data: Option<Value>,
  pub notifications: Option<Value>,
  pub events: Option<Value>,
  pub members: Option<Value>,
  pub user_preferences: Option<Value>,
  /// Where each captured field came from. Records written before this
  /// existed have no sources and never serve a fallback.
  #[serde(default)]
  pub sources: SnapshotSources,
}

/// Endpoint each snapshot field was fetched from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSources {
  pub dashboard_data: Option<String>,
  pub notifications: Option<String>,
  pub events: Option<String>,
  pub members: Option<String>,
  pub user_preferences: Option<String>,
}

/// Snapshot fields a cached read can fall back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotField {
  DashboardData,
  Notifications,
  Events,
  Members,
  UserPreferences,
}

impl OfflineSnapshot {
  /// Data captured for `field`, but only if it was fetched from `endpoint`.
  ///
  /// Endpoints carry the user or church id, so this keeps one tenant's data
  /// from standing in for another's.
  pub fn data_for(&self, field: SnapshotField, endpoint: &str) -> Option<&Value> {
    let (data, source) = match field {
      SnapshotField::DashboardData => (&self.dashboard_data, &self.sources.dashboard_data),
      SnapshotField::Notifications => (&self.notifications, &self.sources.notifications),
      SnapshotField::Events => (&self.events, &self.sources.events),
      SnapshotField::Members => (&self.members, &self.sources.members),
      SnapshotField::UserPreferences => (&self.user_preferences, &self.sources.user_preferences),
    };

    let source = source.as_deref()?;
    if source.trim_start_matches('/') == endpoint.trim_start_matches('/') {
      data.as_ref()
    } else {
      None
    }
  }
}

/// Reads and writes the single snapshot record.
#[derive(Clone)]
pub struct SnapshotStore {
  store: Arc<dyn DurableStore>,
  key: String,
}

impl SnapshotStore {
  pub fn new(store: Arc<dyn DurableStore>, key: &str) -> Self {
    Self {
      store,
      key: key.to_string(),
    }
  }

  /// The stored snapshot. Unreadable records read as none.
  pub fn load(&self) -> Option<OfflineSnapshot> {
    let raw = match self.store.get(&self.key) {
      Ok(raw) => raw?,
      Err(e) => {
        warn!(error = %e, "Failed to read offline snapshot");
        return None;
      }
    };

    serde_json::from_str(&raw)
      .map_err(|e| warn!(error = %e, "Ignoring unreadable offline snapshot"))
      .ok()
  }

  pub fn save(&self, snapshot: &OfflineSnapshot) -> Result<()> {
    let raw = serde_json::to_string(snapshot)
      .map_err(|e| eyre!("Failed to serialize offline snapshot: {}", e))?;
    self.store.set(&self.key, &raw)
  }

  pub fn clear(&self) -> Result<()> {
    self.store.remove(&self.key)
  }
}
