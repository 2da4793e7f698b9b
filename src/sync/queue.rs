//! Durable queue of pending writes.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

use crate::store::DurableStore;

/// Kind of write a queued item replays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncAction {
  Create,
  Update,
  Delete,
}

impl SyncAction {
  pub fn method(&self) -> Method {
    match self {
      SyncAction::Create => Method::POST,
      SyncAction::Update => Method::PUT,
      SyncAction::Delete => Method::DELETE,
    }
  }
}

impl fmt::Display for SyncAction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      SyncAction::Create => "CREATE",
      SyncAction::Update => "UPDATE",
      SyncAction::Delete => "DELETE",
    };
    f.write_str(name)
  }
}

impl FromStr for SyncAction {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_uppercase().as_str() {
      "CREATE" | "POST" => Ok(SyncAction::Create),
      "UPDATE" | "PUT" => Ok(SyncAction::Update),
      "DELETE" => Ok(SyncAction::Delete),
      other => Err(eyre!("Unknown sync action '{}'", other)),
    }
  }
}

/// One pending write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
  pub id: String,
  pub action: SyncAction,
  pub endpoint: String,
  pub payload: Value,
  pub enqueued_at: DateTime<Utc>,
  /// Failed attempts so far
  pub retry_count: u32,
  /// Earliest time the next attempt may run (backoff)
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub next_attempt_at: Option<DateTime<Utc>>,
}

impl SyncQueueItem {
  pub fn new(action: SyncAction, endpoint: &str, payload: Value, now: DateTime<Utc>) -> Self {
    Self {
      id: uuid::Uuid::new_v4().to_string(),
      action,
      endpoint: endpoint.to_string(),
      payload,
      enqueued_at: now,
      retry_count: 0,
      next_attempt_at: None,
    }
  }

  pub fn is_due(&self, now: DateTime<Utc>) -> bool {
    self.next_attempt_at.map_or(true, |at| at <= now)
  }
}

/// What happened to an item after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
  /// Still queued
  Retrying { retry_count: u32 },
  /// Retries exhausted; the item has been removed
  Dropped(SyncQueueItem),
  /// The item was no longer in the queue
  Missing,
}

/// Ordered, durable list of pending writes.
///
/// The whole queue is stored as one JSON array under a dedicated key. Items
/// keep their enqueue order; removal and retry bookkeeping work by id so a
/// drain can walk a snapshot while the live queue changes underneath it.
pub struct SyncQueue {
  store: Arc<dyn DurableStore>,
  key: String,
  items: Mutex<Vec<SyncQueueItem>>,
}

impl SyncQueue {
  /// Restore the queue persisted under `key`. An unreadable queue starts empty.
  pub fn load(store: Arc<dyn DurableStore>, key: &str) -> Self {
    let items = match store.get(key) {
      Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
        warn!(key, error = %e, "Discarding unreadable sync queue");
        Vec::new()
      }),
      Ok(None) => Vec::new(),
      Err(e) => {
        warn!(key, error = %e, "Failed to load sync queue");
        Vec::new()
      }
    };

    Self {
      store,
      key: key.to_string(),
      items: Mutex::new(items),
    }
  }

  fn items(&self) -> MutexGuard<'_, Vec<SyncQueueItem>> {
    self.items.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Append an item and persist the queue straight away.
  pub fn push(&self, item: SyncQueueItem) {
    self.items().push(item);
    self.persist();
  }

  /// Copy of the queue in enqueue order.
  pub fn snapshot(&self) -> Vec<SyncQueueItem> {
    self.items().clone()
  }

  pub fn remove(&self, id: &str) -> bool {
    let mut items = self.items();
    let before = items.len();
    items.retain(|item| item.id != id);
    items.len() != before
  }

  /// Count a failed attempt. Drops the item once `max_retries` is reached.
  pub fn record_failure(
    &self,
    id: &str,
    max_retries: u32,
    next_attempt_at: Option<DateTime<Utc>>,
  ) -> FailureOutcome {
    let mut items = self.items();
    let Some(pos) = items.iter().position(|item| item.id == id) else {
      return FailureOutcome::Missing;
    };

    let item = &mut items[pos];
    item.retry_count = item.retry_count.saturating_add(1);
    item.next_attempt_at = next_attempt_at;

    if item.retry_count >= max_retries {
      FailureOutcome::Dropped(items.remove(pos))
    } else {
      FailureOutcome::Retrying {
        retry_count: item.retry_count,
      }
    }
  }

  /// Write the queue to the durable store. Failures are logged; the in-memory
  /// queue stays authoritative.
  pub fn persist(&self) -> bool {
    let result = serde_json::to_string(&*self.items())
      .map_err(|e| eyre!("Failed to serialize sync queue: {}", e))
      .and_then(|raw| self.store.set(&self.key, &raw));

    match result {
      Ok(()) => true,
      Err(e) => {
        warn!(error = %e, "Failed to persist sync queue, pending writes are memory-only");
        false
      }
    }
  }

  pub fn len(&self) -> usize {
    self.items().len()
  }

  pub fn is_empty(&self) -> bool {
    self.items().is_empty()
  }

  /// Items that have failed at least once and are still pending.
  pub fn failed_count(&self) -> usize {
    self.items().iter().filter(|item| item.retry_count > 0).count()
  }

  pub fn has_due(&self, now: DateTime<Utc>) -> bool {
    self.items().iter().any(|item| item.is_due(now))
  }

  pub fn clear(&self) {
    self.items().clear();
    self.persist();
  }
}
