//! Offline manager: decides between calling the API and queueing, drains the
//! queue when connectivity allows, and keeps the offline snapshot current.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connectivity::{self, ConnectivityProvider, HttpConnectivity, LinkEvent};
use super::queue::{FailureOutcome, SyncAction, SyncQueue, SyncQueueItem};
use super::snapshot::{OfflineSnapshot, SnapshotSources, SnapshotStore};
use crate::api::{ApiClient, ApiError, CachedApiClient};
use crate::cache::{CacheLayer, TtlCache};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::store::DurableStore;

/// Read-only view of the sync engine for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
  pub is_online: bool,
  pub sync_in_progress: bool,
  pub queue_length: usize,
  pub last_sync: Option<DateTime<Utc>>,
  /// Pending items that have failed at least once
  pub failed_items: usize,
}

/// Notifications about sync progress.
#[derive(Debug, Clone)]
pub enum SyncEvent {
  ItemSynced { id: String },
  ItemFailed { id: String, retry_count: u32, error: String },
  /// Retries exhausted. The write is lost unless the host acts on this.
  ItemDropped { item: SyncQueueItem, error: String },
  ConnectivityChanged { online: bool },
}

/// Why a drain did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
  Offline,
  InProgress,
  Empty,
  /// Items are pending but all of them are backing off
  NothingDue,
}

/// Counts from one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
  pub attempted: usize,
  pub succeeded: usize,
  pub failed: usize,
  pub dropped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncOutcome {
  Skipped(SkipReason),
  Completed(SyncReport),
}

/// Result of [`OfflineManager::submit`].
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
  /// The API accepted the write; carries its response
  Sent(Value),
  /// The write was queued under this id
  Queued(String),
}

/// Clears the in-progress flag when a drain ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

struct Inner {
  config: Config,
  api: ApiClient,
  cache: Arc<TtlCache>,
  queue: SyncQueue,
  snapshots: SnapshotStore,
  store: Arc<dyn DurableStore>,
  connectivity: Arc<dyn ConnectivityProvider>,
  clock: Arc<dyn Clock>,
  invalidate_on_write: Vec<Regex>,
  online: AtomicBool,
  syncing: AtomicBool,
  /// Startup preload still owed, waiting for connectivity
  preload_pending: AtomicBool,
  events: broadcast::Sender<SyncEvent>,
  tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Builder for [`OfflineManager`].
pub struct OfflineManagerBuilder {
  config: Config,
  store: Arc<dyn DurableStore>,
  clock: Arc<dyn Clock>,
  connectivity: Option<Arc<dyn ConnectivityProvider>>,
  online: bool,
}

impl OfflineManagerBuilder {
  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Defaults to probing the API over HTTP.
  pub fn connectivity(mut self, connectivity: Arc<dyn ConnectivityProvider>) -> Self {
    self.connectivity = Some(connectivity);
    self
  }

  /// Connectivity assumed until the first probe or link event.
  pub fn online(mut self, online: bool) -> Self {
    self.online = online;
    self
  }

  pub fn build(self) -> Result<OfflineManager> {
    let api = ApiClient::new(&self.config.api, Arc::clone(&self.store))?;
    let cache = Arc::new(
      TtlCache::new(Arc::clone(&self.store), &self.config.cache).with_clock(Arc::clone(&self.clock)),
    );
    let queue = SyncQueue::load(Arc::clone(&self.store), &self.config.sync.queue_key);
    let snapshots = SnapshotStore::new(Arc::clone(&self.store), &self.config.sync.snapshot_key);

    let connectivity = self.connectivity.unwrap_or_else(|| {
      Arc::new(HttpConnectivity::new(
        api.clone(),
        &self.config.api.probe_path,
        self.config.sync.probe_timeout(),
      ))
    });

    let invalidate_on_write = self
      .config
      .sync
      .invalidate_on_write
      .iter()
      .map(|pattern| {
        Regex::new(pattern)
          .map_err(|e| color_eyre::eyre::eyre!("Invalid invalidate_on_write pattern '{}': {}", pattern, e))
      })
      .collect::<Result<Vec<_>>>()?;

    let (events, _) = broadcast::channel(64);

    if !queue.is_empty() {
      info!(pending = queue.len(), "Restored sync queue");
    }

    Ok(OfflineManager {
      inner: Arc::new(Inner {
        config: self.config,
        api,
        cache,
        queue,
        snapshots,
        store: self.store,
        connectivity,
        clock: self.clock,
        invalidate_on_write,
        online: AtomicBool::new(self.online),
        syncing: AtomicBool::new(false),
        preload_pending: AtomicBool::new(false),
        events,
        tasks: Mutex::new(Vec::new()),
      }),
    })
  }
}

/// Orchestrates the cache, the sync queue and connectivity.
///
/// Cheap to clone; clones share state. The host owns the lifecycle through
/// [`OfflineManager::init`] and [`OfflineManager::dispose`].
#[derive(Clone)]
pub struct OfflineManager {
  inner: Arc<Inner>,
}

impl OfflineManager {
  pub fn builder(config: Config, store: Arc<dyn DurableStore>) -> OfflineManagerBuilder {
    OfflineManagerBuilder {
      config,
      store,
      clock: Arc::new(SystemClock),
      connectivity: None,
      online: true,
    }
  }

  /// Start background work: connectivity monitoring, cache cleanup and the
  /// startup preload. Calling it again while running does nothing.
  ///
  /// When starting offline, the preload waits for the first transition to
  /// online.
  pub fn init(&self) {
    let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
    if !tasks.is_empty() {
      return;
    }

    // Owed before the monitor starts, so its first probe can claim it
    self.inner.preload_pending.store(true, Ordering::SeqCst);

    tasks.push(connectivity::spawn_monitor(
      self.clone(),
      self.inner.config.sync.probe_interval(),
    ));
    tasks.push(
      self
        .inner
        .cache
        .spawn_cleanup(self.inner.config.cache.cleanup_interval()),
    );

    if self.is_online() {
      tasks.extend(self.take_pending_preload());
    }

    info!("Offline manager started");
  }

  /// Stop background work. A drain already in flight finishes on its own.
  pub fn dispose(&self) {
    self.inner.preload_pending.store(false, Ordering::SeqCst);
    let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
    for task in tasks.drain(..) {
      task.abort();
    }
    info!("Offline manager stopped");
  }

  pub fn api(&self) -> &ApiClient {
    &self.inner.api
  }

  pub fn cache(&self) -> &Arc<TtlCache> {
    &self.inner.cache
  }

  pub fn connectivity(&self) -> Arc<dyn ConnectivityProvider> {
    Arc::clone(&self.inner.connectivity)
  }

  /// Read-through client for dashboard data sharing this manager's cache.
  pub fn cached_client(&self) -> CachedApiClient {
    CachedApiClient::new(
      self.inner.api.clone(),
      CacheLayer::new(Arc::clone(&self.inner.cache)),
      self.inner.config.cache.ttl.clone(),
      self.inner.snapshots.clone(),
    )
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.inner.events.subscribe()
  }

  fn emit(&self, event: SyncEvent) {
    // Nobody listening is fine
    let _ = self.inner.events.send(event);
  }

  pub fn is_online(&self) -> bool {
    self.inner.online.load(Ordering::SeqCst)
  }

  /// Update the connectivity flag. Returns whether it changed.
  pub fn set_online(&self, online: bool) -> bool {
    let previous = self.inner.online.swap(online, Ordering::SeqCst);
    if previous != online {
      info!(online, "Connectivity changed");
      self.emit(SyncEvent::ConnectivityChanged { online });
    }
    previous != online
  }

  /// Spawn the startup preload if `init` deferred it.
  fn take_pending_preload(&self) -> Option<JoinHandle<()>> {
    if !self.inner.preload_pending.swap(false, Ordering::SeqCst) {
      return None;
    }
    let handle = tokio::runtime::Handle::try_current().ok()?;
    let manager = self.clone();
    Some(handle.spawn(async move {
      manager.preload_essential_data().await;
    }))
  }

  /// React to a platform link event.
  pub fn handle_link_event(&self, event: LinkEvent) {
    match event {
      LinkEvent::Online => {
        if self.set_online(true) {
          self.take_pending_preload();
        }
        self.spawn_sync();
      }
      LinkEvent::Offline => {
        self.set_online(false);
      }
    }
  }

  /// React to an active probe. Recovery, or due retries while online,
  /// start a drain.
  pub fn apply_probe_result(&self, reachable: bool) {
    let changed = self.set_online(reachable);
    if reachable && changed {
      self.take_pending_preload();
    }
    if reachable && (changed || self.inner.queue.has_due(self.inner.clock.now())) {
      self.spawn_sync();
    }
  }

  /// Queue a write for later delivery. Starts a drain right away when online.
  pub fn add_to_sync_queue(&self, action: SyncAction, endpoint: &str, payload: Value) -> String {
    let item = SyncQueueItem::new(action, endpoint, payload, self.inner.clock.now());
    let id = self.enqueue(item);

    if self.is_online() {
      self.spawn_sync();
    }
    id
  }

  fn enqueue(&self, item: SyncQueueItem) -> String {
    let id = item.id.clone();
    debug!(%id, action = %item.action, endpoint = %item.endpoint, "Queued write");
    self.inner.queue.push(item);
    id
  }

  /// Write through the API when possible, otherwise queue it.
  ///
  /// Transient failures queue the write; a 401 or a rejected payload is
  /// returned to the caller since retrying would not help.
  pub async fn submit(
    &self,
    action: SyncAction,
    endpoint: &str,
    payload: Value,
  ) -> std::result::Result<SubmitOutcome, ApiError> {
    if !self.is_online() {
      return Ok(SubmitOutcome::Queued(
        self.add_to_sync_queue(action, endpoint, payload),
      ));
    }

    match self
      .inner
      .api
      .request(action.method(), endpoint, request_body(&payload))
      .await
    {
      Ok(response) => {
        self.after_successful_write();
        Ok(SubmitOutcome::Sent(response))
      }
      Err(e) if e.is_transient() => {
        warn!(error = %e, endpoint, "Write failed, queueing for later");
        if matches!(e, ApiError::Network(_)) {
          self.set_online(false);
        }
        // Back off as after a first failure and start no drain, so the write
        // is not re-sent straight away
        let now = self.inner.clock.now();
        let mut item = SyncQueueItem::new(action, endpoint, payload, now);
        item.next_attempt_at = self
          .inner
          .config
          .sync
          .backoff_for(1)
          .and_then(|delay| chrono::Duration::from_std(delay).ok())
          .map(|delay| now + delay);
        Ok(SubmitOutcome::Queued(self.enqueue(item)))
      }
      Err(e) => Err(e),
    }
  }

  fn spawn_sync(&self) {
    // Outside a runtime there is nothing to drain on; the next trigger will
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
      let manager = self.clone();
      handle.spawn(async move {
        manager.perform_sync().await;
      });
    }
  }

  /// Drain the queue once.
  ///
  /// Overlapping calls coalesce: only one drain runs at a time and the others
  /// return `Skipped(InProgress)`. The drain works on a snapshot taken at the
  /// start, so items queued meanwhile wait for the next one.
  pub async fn perform_sync(&self) -> SyncOutcome {
    if !self.is_online() {
      return SyncOutcome::Skipped(SkipReason::Offline);
    }
    if self
      .inner
      .syncing
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      debug!("Sync already in progress");
      return SyncOutcome::Skipped(SkipReason::InProgress);
    }
    let _guard = DrainGuard(&self.inner.syncing);

    if self.inner.queue.is_empty() {
      return SyncOutcome::Skipped(SkipReason::Empty);
    }

    let now = self.inner.clock.now();
    let batch: Vec<SyncQueueItem> = self
      .inner
      .queue
      .snapshot()
      .into_iter()
      .filter(|item| item.is_due(now))
      .collect();
    if batch.is_empty() {
      return SyncOutcome::Skipped(SkipReason::NothingDue);
    }

    info!(count = batch.len(), "Draining sync queue");
    let sync = &self.inner.config.sync;
    let mut report = SyncReport::default();

    for item in batch {
      report.attempted += 1;
      let result = self
        .inner
        .api
        .request(item.action.method(), &item.endpoint, request_body(&item.payload))
        .await;

      match result {
        Ok(_) => {
          self.inner.queue.remove(&item.id);
          report.succeeded += 1;
          debug!(id = %item.id, endpoint = %item.endpoint, "Synced queued write");
          self.emit(SyncEvent::ItemSynced { id: item.id });
        }
        Err(e) => {
          report.failed += 1;
          let next_attempt_at = sync
            .backoff_for(item.retry_count.saturating_add(1))
            .and_then(|delay| chrono::Duration::from_std(delay).ok())
            .map(|delay| self.inner.clock.now() + delay);

          match self
            .inner
            .queue
            .record_failure(&item.id, sync.max_retries, next_attempt_at)
          {
            FailureOutcome::Retrying { retry_count } => {
              warn!(
                id = %item.id,
                endpoint = %item.endpoint,
                retry_count,
                error = %e,
                "Queued write failed, will retry"
              );
              self.emit(SyncEvent::ItemFailed {
                id: item.id,
                retry_count,
                error: e.to_string(),
              });
            }
            FailureOutcome::Dropped(dropped) => {
              report.dropped += 1;
              warn!(
                id = %dropped.id,
                endpoint = %dropped.endpoint,
                retry_count = dropped.retry_count,
                error = %e,
                "Dropping queued write after exhausting retries"
              );
              self.emit(SyncEvent::ItemDropped {
                item: dropped,
                error: e.to_string(),
              });
            }
            // Cleared while the request was in flight
            FailureOutcome::Missing => {}
          }
        }
      }
    }

    self.inner.queue.persist();
    if report.succeeded > 0 {
      self.after_successful_write();
    }

    info!(
      attempted = report.attempted,
      succeeded = report.succeeded,
      failed = report.failed,
      dropped = report.dropped,
      "Sync pass finished"
    );
    SyncOutcome::Completed(report)
  }

  fn after_successful_write(&self) {
    for pattern in &self.inner.invalidate_on_write {
      self.inner.cache.invalidate_pattern(pattern);
    }
    self.record_last_sync(self.inner.clock.now());
  }

  fn record_last_sync(&self, at: DateTime<Utc>) {
    let key = &self.inner.config.sync.last_sync_key;
    if let Err(e) = self.inner.store.set(key, &at.to_rfc3339()) {
      warn!(error = %e, "Failed to record last sync time");
    }
  }

  fn last_sync(&self) -> Option<DateTime<Utc>> {
    let raw = self
      .inner
      .store
      .get(&self.inner.config.sync.last_sync_key)
      .ok()
      .flatten()?;
    DateTime::parse_from_rfc3339(&raw)
      .map(|dt| dt.with_timezone(&Utc))
      .ok()
  }

  /// Best-effort refresh of the offline snapshot. Never fails: endpoints
  /// that error are left empty, and if every fetch fails the previous
  /// snapshot is kept.
  pub async fn preload_essential_data(&self) -> Option<OfflineSnapshot> {
    if !self.is_online() {
      debug!("Offline, skipping preload");
      return None;
    }

    let preload = &self.inner.config.preload;
    let (dashboard_data, notifications, events, members, user_preferences) = futures::join!(
      self.fetch_optional(preload.dashboard.as_deref()),
      self.fetch_optional(preload.notifications.as_deref()),
      self.fetch_optional(preload.events.as_deref()),
      self.fetch_optional(preload.members.as_deref()),
      self.fetch_optional(preload.preferences.as_deref()),
    );

    let fetched = [
      &dashboard_data,
      &notifications,
      &events,
      &members,
      &user_preferences,
    ];
    if !fetched.iter().any(|r| matches!(r, Some(Ok(_)))) {
      warn!("Preload fetched nothing, keeping previous offline snapshot");
      return None;
    }

    let (dashboard_data, dashboard_source) = captured(preload.dashboard.as_deref(), dashboard_data);
    let (notifications, notifications_source) =
      captured(preload.notifications.as_deref(), notifications);
    let (events, events_source) = captured(preload.events.as_deref(), events);
    let (members, members_source) = captured(preload.members.as_deref(), members);
    let (user_preferences, preferences_source) =
      captured(preload.preferences.as_deref(), user_preferences);

    let now = self.inner.clock.now();
    let snapshot = OfflineSnapshot {
      last_sync: now,
      dashboard_data,
      notifications,
      events,
      members,
      user_preferences,
      sources: SnapshotSources {
        dashboard_data: dashboard_source,
        notifications: notifications_source,
        events: events_source,
        members: members_source,
        user_preferences: preferences_source,
      },
    };

    if let Err(e) = self.inner.snapshots.save(&snapshot) {
      warn!(error = %e, "Failed to store offline snapshot");
    }
    self.record_last_sync(now);
    info!("Offline snapshot refreshed");
    Some(snapshot)
  }

  /// `None` when the endpoint is not configured.
  async fn fetch_optional(
    &self,
    endpoint: Option<&str>,
  ) -> Option<std::result::Result<Value, ApiError>> {
    let endpoint = endpoint?;
    let result = self.inner.api.request(reqwest::Method::GET, endpoint, None).await;
    if let Err(e) = &result {
      debug!(endpoint, error = %e, "Preload fetch failed");
    }
    Some(result)
  }

  pub fn get_offline_data(&self) -> Option<OfflineSnapshot> {
    self.inner.snapshots.load()
  }

  /// Forget the snapshot, pending writes and last sync time, e.g. on logout.
  pub fn clear_offline_data(&self) {
    if let Err(e) = self.inner.snapshots.clear() {
      warn!(error = %e, "Failed to clear offline snapshot");
    }
    self.inner.queue.clear();
    if let Err(e) = self.inner.store.remove(&self.inner.config.sync.last_sync_key) {
      warn!(error = %e, "Failed to clear last sync time");
    }
    info!("Offline data cleared");
  }

  pub fn get_sync_status(&self) -> SyncStatus {
    SyncStatus {
      is_online: self.is_online(),
      sync_in_progress: self.inner.syncing.load(Ordering::SeqCst),
      queue_length: self.inner.queue.len(),
      last_sync: self.last_sync(),
      failed_items: self.inner.queue.failed_count(),
    }
  }

  /// Pending writes in enqueue order.
  pub fn pending_items(&self) -> Vec<SyncQueueItem> {
    self.inner.queue.snapshot()
  }
}

/// Split a preload fetch into the captured data and the endpoint it came from.
fn captured(
  endpoint: Option<&str>,
  result: Option<std::result::Result<Value, ApiError>>,
) -> (Option<Value>, Option<String>) {
  match (endpoint, result) {
    (Some(endpoint), Some(Ok(data))) => (Some(data), Some(endpoint.to_string())),
    _ => (None, None),
  }
}

fn request_body(payload: &Value) -> Option<&Value> {
  if payload.is_null() {
    None
  } else {
    Some(payload)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::store::MemoryStore;
  use crate::sync::ManualConnectivity;
  use serde_json::json;
  use std::time::Duration;
  use wiremock::matchers::{body_json, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn test_config(base_url: &str) -> Config {
    let mut config = Config::with_base_url(base_url);
    config.cache.prefix = "test_cache_".to_string();
    config.sync.backoff_base_ms = 0;
    config
  }

  fn manager(config: Config, store: Arc<MemoryStore>, online: bool) -> OfflineManager {
    OfflineManager::builder(config, store)
      .connectivity(Arc::new(ManualConnectivity::new(online)))
      .online(online)
      .build()
      .unwrap()
  }

  async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
      if condition() {
        return;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
  }

  #[tokio::test]
  async fn test_offline_enqueue_then_sync() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/evento"))
      .and(body_json(json!({"titulo": "Culto"})))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 1})))
      .expect(1)
      .mount(&server)
      .await;

    let manager = manager(test_config(&server.uri()), Arc::new(MemoryStore::new()), false);
    manager.add_to_sync_queue(SyncAction::Create, "/evento", json!({"titulo": "Culto"}));
    assert_eq!(manager.get_sync_status().queue_length, 1);

    manager.set_online(true);
    let outcome = manager.perform_sync().await;

    assert_eq!(
      outcome,
      SyncOutcome::Completed(SyncReport {
        attempted: 1,
        succeeded: 1,
        failed: 0,
        dropped: 0
      })
    );
    let status = manager.get_sync_status();
    assert_eq!(status.queue_length, 0);
    assert!(status.last_sync.is_some());
    assert_eq!(manager.perform_sync().await, SyncOutcome::Skipped(SkipReason::Empty));
  }

  #[tokio::test]
  async fn test_queue_survives_reconstruction() {
    let store = Arc::new(MemoryStore::new());
    let config = test_config("http://localhost:3000");

    let first = manager(config.clone(), store.clone(), false);
    let id = first.add_to_sync_queue(SyncAction::Update, "/membro/4", json!({"nome": "Ana"}));
    drop(first);

    let second = manager(config, store, false);
    let pending = second.pending_items();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, id);
    assert_eq!(pending[0].action, SyncAction::Update);
    assert_eq!(pending[0].retry_count, 0);
  }

  #[tokio::test]
  async fn test_item_dropped_after_max_retries() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
      .and(path("/evento/9"))
      .respond_with(ResponseTemplate::new(503))
      .expect(3)
      .mount(&server)
      .await;

    let manager = manager(test_config(&server.uri()), Arc::new(MemoryStore::new()), false);
    let mut events = manager.subscribe();
    manager.add_to_sync_queue(SyncAction::Delete, "/evento/9", Value::Null);
    manager.set_online(true);

    manager.perform_sync().await;
    let status = manager.get_sync_status();
    assert_eq!(status.queue_length, 1);
    assert_eq!(status.failed_items, 1);

    manager.perform_sync().await;
    let last = manager.perform_sync().await;
    assert_eq!(
      last,
      SyncOutcome::Completed(SyncReport {
        attempted: 1,
        succeeded: 0,
        failed: 1,
        dropped: 1
      })
    );
    assert_eq!(manager.get_sync_status().queue_length, 0);

    // No fourth attempt
    assert_eq!(manager.perform_sync().await, SyncOutcome::Skipped(SkipReason::Empty));

    let mut dropped = None;
    while let Ok(event) = events.try_recv() {
      if let SyncEvent::ItemDropped { item, .. } = event {
        dropped = Some(item);
      }
    }
    assert_eq!(dropped.map(|item| item.retry_count), Some(3));
  }

  #[tokio::test]
  async fn test_concurrent_drains_coalesce() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/dizimo"))
      .respond_with(ResponseTemplate::new(201).set_delay(Duration::from_millis(200)))
      .expect(2)
      .mount(&server)
      .await;

    let manager = manager(test_config(&server.uri()), Arc::new(MemoryStore::new()), false);
    manager.add_to_sync_queue(SyncAction::Create, "/dizimo", json!({"valor": 100}));
    manager.add_to_sync_queue(SyncAction::Create, "/dizimo", json!({"valor": 250}));
    manager.set_online(true);

    let (first, second) = tokio::join!(manager.perform_sync(), manager.perform_sync());

    assert!(matches!(first, SyncOutcome::Completed(report) if report.succeeded == 2));
    assert_eq!(second, SyncOutcome::Skipped(SkipReason::InProgress));
    assert!(!manager.get_sync_status().sync_in_progress);
  }

  #[tokio::test]
  async fn test_failures_do_not_block_later_items() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
      .and(path("/evento/1"))
      .respond_with(ResponseTemplate::new(500))
      .mount(&server)
      .await;
    Mock::given(method("PUT"))
      .and(path("/evento/2"))
      .respond_with(ResponseTemplate::new(200))
      .mount(&server)
      .await;

    let manager = manager(test_config(&server.uri()), Arc::new(MemoryStore::new()), false);
    manager.add_to_sync_queue(SyncAction::Update, "/evento/1", json!({}));
    manager.add_to_sync_queue(SyncAction::Update, "/evento/2", json!({}));
    manager.set_online(true);

    manager.perform_sync().await;

    let pending = manager.pending_items();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].endpoint, "/evento/1");
    assert_eq!(pending[0].retry_count, 1);
  }

  #[tokio::test]
  async fn test_backoff_defers_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/evento"))
      .respond_with(ResponseTemplate::new(500))
      .expect(2)
      .mount(&server)
      .await;

    let clock = Arc::new(ManualClock::default());
    let mut config = test_config(&server.uri());
    config.sync.backoff_base_ms = 1000;
    let manager = OfflineManager::builder(config, Arc::new(MemoryStore::new()))
      .connectivity(Arc::new(ManualConnectivity::new(false)))
      .clock(clock.clone())
      .online(false)
      .build()
      .unwrap();

    manager.add_to_sync_queue(SyncAction::Create, "/evento", json!({}));
    manager.set_online(true);

    assert!(matches!(manager.perform_sync().await, SyncOutcome::Completed(_)));
    assert_eq!(
      manager.perform_sync().await,
      SyncOutcome::Skipped(SkipReason::NothingDue)
    );

    clock.advance(chrono::Duration::milliseconds(1000));
    assert!(matches!(manager.perform_sync().await, SyncOutcome::Completed(_)));
    assert_eq!(manager.pending_items()[0].retry_count, 2);
  }

  #[tokio::test]
  async fn test_offline_drain_is_noop() {
    let manager = manager(
      test_config("http://localhost:3000"),
      Arc::new(MemoryStore::new()),
      false,
    );
    manager.add_to_sync_queue(SyncAction::Create, "/evento", json!({}));

    assert_eq!(manager.perform_sync().await, SyncOutcome::Skipped(SkipReason::Offline));
    assert_eq!(manager.get_sync_status().queue_length, 1);
  }

  #[tokio::test]
  async fn test_submit_online_invalidates_dashboard() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/membro"))
      .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 7})))
      .mount(&server)
      .await;

    let manager = manager(test_config(&server.uri()), Arc::new(MemoryStore::new()), true);
    manager.cache().set("dashboard_data_u1", json!({"total": 5}), None);
    manager.cache().set("churches", json!([]), None);

    let outcome = manager
      .submit(SyncAction::Create, "/membro", json!({"nome": "Ana"}))
      .await
      .unwrap();

    assert_eq!(outcome, SubmitOutcome::Sent(json!({"id": 7})));
    assert!(!manager.cache().has("dashboard_data_u1"));
    assert!(manager.cache().has("churches"));
    assert_eq!(manager.get_sync_status().queue_length, 0);
  }

  #[tokio::test]
  async fn test_submit_queues_on_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/evento"))
      .respond_with(ResponseTemplate::new(502))
      .expect(1)
      .mount(&server)
      .await;

    let mut config = test_config(&server.uri());
    config.sync.max_retries = 10;
    let manager = manager(config, Arc::new(MemoryStore::new()), true);

    let outcome = manager
      .submit(SyncAction::Create, "/evento", json!({"titulo": "Vigília"}))
      .await
      .unwrap();

    assert!(matches!(outcome, SubmitOutcome::Queued(_)));
    // The failed write is not re-sent behind the caller's back
    tokio::time::sleep(Duration::from_millis(100)).await;
    let pending = manager.pending_items();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].retry_count, 0);
  }

  #[tokio::test]
  async fn test_submit_failure_backs_off_before_retry() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
      .and(path("/evento/5"))
      .respond_with(ResponseTemplate::new(503))
      .expect(1)
      .mount(&server)
      .await;

    let clock = Arc::new(ManualClock::default());
    let mut config = test_config(&server.uri());
    config.sync.backoff_base_ms = 2000;
    let manager = OfflineManager::builder(config, Arc::new(MemoryStore::new()))
      .connectivity(Arc::new(ManualConnectivity::new(true)))
      .clock(clock.clone())
      .build()
      .unwrap();

    manager
      .submit(SyncAction::Update, "/evento/5", json!({"titulo": "Ceia"}))
      .await
      .unwrap();

    let pending = manager.pending_items();
    assert_eq!(
      pending[0].next_attempt_at,
      Some(clock.now() + chrono::Duration::milliseconds(2000))
    );
    assert_eq!(
      manager.perform_sync().await,
      SyncOutcome::Skipped(SkipReason::NothingDue)
    );
  }

  #[tokio::test]
  async fn test_items_added_mid_drain_wait_for_next_pass() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/evento"))
      .respond_with(ResponseTemplate::new(201).set_delay(Duration::from_millis(200)))
      .expect(1)
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .and(path("/membro"))
      .respond_with(ResponseTemplate::new(201))
      .expect(0)
      .mount(&server)
      .await;

    let manager = manager(test_config(&server.uri()), Arc::new(MemoryStore::new()), false);
    manager.add_to_sync_queue(SyncAction::Create, "/evento", json!({"titulo": "Culto"}));
    manager.set_online(true);

    let drain = tokio::spawn({
      let manager = manager.clone();
      async move { manager.perform_sync().await }
    });
    wait_until(|| manager.get_sync_status().sync_in_progress).await;

    // Its own drain trigger coalesces into the one in flight
    let late = manager.add_to_sync_queue(SyncAction::Create, "/membro", json!({"nome": "Rute"}));

    let outcome = drain.await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Completed(report) if report.attempted == 1 && report.succeeded == 1));
    let pending = manager.pending_items();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, late);
    assert_eq!(pending[0].retry_count, 0);
  }

  #[tokio::test]
  async fn test_submit_returns_rejections() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/evento"))
      .respond_with(ResponseTemplate::new(422).set_body_string("titulo obrigatório"))
      .mount(&server)
      .await;

    let manager = manager(test_config(&server.uri()), Arc::new(MemoryStore::new()), true);

    let err = manager
      .submit(SyncAction::Create, "/evento", json!({}))
      .await
      .unwrap_err();

    assert!(matches!(err, ApiError::Status { status: 422, .. }));
    assert_eq!(manager.get_sync_status().queue_length, 0);
  }

  #[tokio::test]
  async fn test_submit_network_error_goes_offline() {
    let manager = manager(
      test_config("http://127.0.0.1:9"),
      Arc::new(MemoryStore::new()),
      true,
    );

    let outcome = manager
      .submit(SyncAction::Delete, "/membro/3", Value::Null)
      .await
      .unwrap();

    assert!(matches!(outcome, SubmitOutcome::Queued(_)));
    assert!(!manager.is_online());
    assert_eq!(manager.get_sync_status().queue_length, 1);
  }

  #[tokio::test]
  async fn test_probe_recovery_drains_queue() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/evento"))
      .respond_with(ResponseTemplate::new(200))
      .expect(1)
      .mount(&server)
      .await;

    let manager = manager(test_config(&server.uri()), Arc::new(MemoryStore::new()), false);
    manager.add_to_sync_queue(SyncAction::Create, "/evento", json!({}));

    manager.apply_probe_result(false);
    assert_eq!(manager.get_sync_status().queue_length, 1);

    manager.apply_probe_result(true);
    wait_until(|| manager.get_sync_status().queue_length == 0).await;
  }

  #[tokio::test]
  async fn test_link_events_through_monitor() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/evento"))
      .respond_with(ResponseTemplate::new(200))
      .expect(1)
      .mount(&server)
      .await;

    let connectivity = Arc::new(ManualConnectivity::new(false));
    let manager = OfflineManager::builder(test_config(&server.uri()), Arc::new(MemoryStore::new()))
      .connectivity(connectivity.clone())
      .online(false)
      .build()
      .unwrap();
    manager.add_to_sync_queue(SyncAction::Create, "/evento", json!({}));

    manager.init();
    // Give the monitor a moment to subscribe and run its first probe
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!manager.is_online());

    connectivity.emit(LinkEvent::Online);
    wait_until(|| manager.get_sync_status().queue_length == 0).await;
    assert!(manager.is_online());

    connectivity.emit(LinkEvent::Offline);
    wait_until(|| !manager.is_online()).await;

    manager.dispose();
  }

  #[tokio::test]
  async fn test_preload_overwrites_snapshot() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/config"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"theme": "dark"})))
      .up_to_n_times(1)
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(path("/notificacao"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}])))
      .up_to_n_times(1)
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(path("/notificacao"))
      .respond_with(ResponseTemplate::new(500))
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(path("/config"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"theme": "light"})))
      .up_to_n_times(1)
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(path("/config"))
      .respond_with(ResponseTemplate::new(500))
      .mount(&server)
      .await;

    let manager = manager(test_config(&server.uri()), Arc::new(MemoryStore::new()), true);

    let first = manager.preload_essential_data().await.unwrap();
    assert_eq!(first.notifications, Some(json!([{"id": 1}])));
    assert_eq!(first.user_preferences, Some(json!({"theme": "dark"})));
    assert_eq!(first.sources.notifications.as_deref(), Some("/notificacao"));
    assert_eq!(first.sources.user_preferences.as_deref(), Some("/config"));

    // Notifications now fail: the new snapshot replaces the old one wholesale
    let second = manager.preload_essential_data().await.unwrap();
    assert_eq!(second.notifications, None);
    assert_eq!(second.sources.notifications, None);
    assert_eq!(second.user_preferences, Some(json!({"theme": "light"})));
    assert_eq!(manager.get_offline_data(), Some(second.clone()));

    // Everything fails: previous snapshot stays
    assert_eq!(manager.preload_essential_data().await, None);
    assert_eq!(manager.get_offline_data(), Some(second));
  }

  #[tokio::test]
  async fn test_startup_preload_waits_for_connectivity() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
      .and(path("/health"))
      .respond_with(ResponseTemplate::new(200))
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(path("/notificacao"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 2}])))
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(path("/config"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"theme": "dark"})))
      .expect(1)
      .mount(&server)
      .await;

    // Probes over HTTP, starting offline like the CLI host
    let manager = OfflineManager::builder(test_config(&server.uri()), Arc::new(MemoryStore::new()))
      .online(false)
      .build()
      .unwrap();

    manager.init();
    wait_until(|| manager.get_offline_data().is_some()).await;
    manager.dispose();

    assert!(manager.is_online());
    let snapshot = manager.get_offline_data().unwrap();
    assert_eq!(snapshot.notifications, Some(json!([{"id": 2}])));
    assert_eq!(snapshot.user_preferences, Some(json!({"theme": "dark"})));
  }

  #[tokio::test]
  async fn test_preload_skipped_offline_and_clear() {
    let manager = manager(
      test_config("http://localhost:3000"),
      Arc::new(MemoryStore::new()),
      false,
    );
    assert_eq!(manager.preload_essential_data().await, None);

    manager.add_to_sync_queue(SyncAction::Create, "/evento", json!({}));
    manager.clear_offline_data();

    let status = manager.get_sync_status();
    assert_eq!(status.queue_length, 0);
    assert_eq!(status.last_sync, None);
    assert_eq!(manager.get_offline_data(), None);
  }
}
