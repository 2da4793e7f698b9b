//! Two-tier TTL cache: a bounded memory tier mirrored into the durable store.

use regex::Regex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::traits::{CacheEntry, CacheStats};
use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::store::DurableStore;

/// Memory tier. Remembers insertion order so the oldest-inserted key can be
/// evicted when full.
#[derive(Debug, Default)]
struct MemoryTier {
  entries: HashMap<String, CacheEntry>,
  order: VecDeque<String>,
}

impl MemoryTier {
  /// Insert or replace. Replacing keeps the key's original position.
  /// Returns the evicted key, if any.
  fn insert(&mut self, entry: CacheEntry, max_size: usize) -> Option<String> {
    if let Some(existing) = self.entries.get_mut(&entry.key) {
      *existing = entry;
      return None;
    }

    let evicted = if self.entries.len() >= max_size {
      self.order.pop_front().inspect(|oldest| {
        self.entries.remove(oldest);
      })
    } else {
      None
    };

    self.order.push_back(entry.key.clone());
    self.entries.insert(entry.key.clone(), entry);
    evicted
  }

  fn remove(&mut self, key: &str) -> bool {
    if self.entries.remove(key).is_some() {
      self.order.retain(|k| k != key);
      true
    } else {
      false
    }
  }

  fn clear(&mut self) {
    self.entries.clear();
    self.order.clear();
  }
}

/// Intelligent TTL cache.
///
/// Memory is authoritative; the durable store only warms the memory tier after
/// a miss (for instance after a restart). Durable failures never fail a cache
/// call: they are logged and the cache keeps working from memory.
pub struct TtlCache {
  store: Arc<dyn DurableStore>,
  clock: Arc<dyn Clock>,
  prefix: String,
  default_ttl: Duration,
  max_size: usize,
  memory: Mutex<MemoryTier>,
}

impl TtlCache {
  pub fn new(store: Arc<dyn DurableStore>, config: &CacheConfig) -> Self {
    Self {
      store,
      clock: Arc::new(SystemClock),
      prefix: config.prefix.clone(),
      default_ttl: config.default_ttl(),
      max_size: config.max_size.max(1),
      memory: Mutex::new(MemoryTier::default()),
    }
  }

  /// Use a different time source.
  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn prefix(&self) -> &str {
    &self.prefix
  }

  fn storage_key(&self, key: &str) -> String {
    format!("{}{}", self.prefix, key)
  }

  fn memory(&self) -> MutexGuard<'_, MemoryTier> {
    // A panic elsewhere can't leave the tier half-written, so keep serving it
    self.memory.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Store `data` under `key` for `ttl` (or the default TTL).
  pub fn set(&self, key: &str, data: Value, ttl: Option<Duration>) {
    let entry = CacheEntry::new(
      key,
      data,
      self.clock.now(),
      ttl.unwrap_or(self.default_ttl),
    );

    self.write_durable(&entry);

    if let Some(evicted) = self.memory().insert(entry, self.max_size) {
      debug!(key = %evicted, "Evicted oldest memory cache entry");
    }
  }

  /// Serialize and store a typed value.
  pub fn set_value<T: Serialize>(&self, key: &str, data: &T, ttl: Option<Duration>) {
    match serde_json::to_value(data) {
      Ok(value) => self.set(key, value, ttl),
      Err(e) => warn!(key, error = %e, "Failed to serialize cache value"),
    }
  }

  /// Cached data if present and unexpired.
  pub fn get(&self, key: &str) -> Option<Value> {
    self.get_entry(key).map(|entry| entry.data)
  }

  /// Typed read. A payload of the wrong shape counts as a miss.
  pub fn get_value<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    let value = self.get(key)?;
    match serde_json::from_value(value) {
      Ok(data) => Some(data),
      Err(e) => {
        debug!(key, error = %e, "Cached value has unexpected shape");
        None
      }
    }
  }

  /// Whether `key` currently holds valid data.
  pub fn has(&self, key: &str) -> bool {
    self.get_entry(key).is_some()
  }

  /// Full entry lookup, checking memory first and then the durable store.
  pub fn get_entry(&self, key: &str) -> Option<CacheEntry> {
    let now = self.clock.now();

    let in_memory = self.memory().entries.get(key).cloned();
    if let Some(entry) = in_memory {
      if entry.is_valid(now) {
        return Some(entry);
      }
      debug!(key, "Cache entry expired");
      self.delete(key);
      return None;
    }

    let entry = self.read_durable(key)?;
    if entry.is_expired(now) {
      debug!(key, "Durable cache entry expired");
      self.delete(key);
      return None;
    }

    // Warm path: re-populate memory from the durable tier
    if let Some(evicted) = self.memory().insert(entry.clone(), self.max_size) {
      debug!(key = %evicted, "Evicted oldest memory cache entry");
    }
    Some(entry)
  }

  /// Remove `key` from both tiers.
  pub fn delete(&self, key: &str) {
    self.memory().remove(key);
    self.remove_durable(&self.storage_key(key));
  }

  /// Remove every entry whose key (without the namespace prefix) matches.
  /// Returns the number of distinct keys removed.
  pub fn invalidate_pattern(&self, pattern: &Regex) -> usize {
    let mut removed: HashSet<String> = HashSet::new();

    {
      let mut memory = self.memory();
      let matching: Vec<String> = memory
        .entries
        .keys()
        .filter(|k| pattern.is_match(k))
        .cloned()
        .collect();
      for key in matching {
        memory.remove(&key);
        removed.insert(key);
      }
    }

    for storage_key in self.durable_keys() {
      let key = &storage_key[self.prefix.len()..];
      if pattern.is_match(key) {
        self.remove_durable(&storage_key);
        removed.insert(key.to_string());
      }
    }

    debug!(pattern = %pattern, count = removed.len(), "Invalidated cache entries");
    removed.len()
  }

  /// Compile `pattern` and invalidate with it.
  pub fn invalidate_matching(&self, pattern: &str) -> color_eyre::Result<usize> {
    let regex = Regex::new(pattern)
      .map_err(|e| color_eyre::eyre::eyre!("Invalid cache pattern '{}': {}", pattern, e))?;
    Ok(self.invalidate_pattern(&regex))
  }

  /// Delete expired entries from both tiers, plus durable entries that no
  /// longer parse. Returns the number of distinct keys removed.
  pub fn cleanup(&self) -> usize {
    let now = self.clock.now();
    let mut removed: HashSet<String> = HashSet::new();

    {
      let mut memory = self.memory();
      let expired: Vec<String> = memory
        .entries
        .values()
        .filter(|e| e.is_expired(now))
        .map(|e| e.key.clone())
        .collect();
      for key in expired {
        memory.remove(&key);
        removed.insert(key);
      }
    }

    for storage_key in self.durable_keys() {
      let stale = match self.store.get(&storage_key) {
        Ok(Some(raw)) => serde_json::from_str::<CacheEntry>(&raw)
          .map(|entry| entry.is_expired(now))
          .unwrap_or(true),
        Ok(None) => false,
        Err(e) => {
          warn!(key = %storage_key, error = %e, "Failed to read cache entry during cleanup");
          false
        }
      };
      if stale {
        self.remove_durable(&storage_key);
        removed.insert(storage_key[self.prefix.len()..].to_string());
      }
    }

    if !removed.is_empty() {
      debug!(count = removed.len(), "Cache cleanup removed entries");
    }
    removed.len()
  }

  /// Remove every entry in this cache's namespace.
  pub fn clear(&self) {
    self.memory().clear();
    for storage_key in self.durable_keys() {
      self.remove_durable(&storage_key);
    }
  }

  pub fn stats(&self) -> CacheStats {
    CacheStats {
      memory_entries: self.memory().entries.len(),
      durable_entries: self.durable_keys().len(),
      max_size: self.max_size,
    }
  }

  /// Keys currently in the memory tier, oldest first.
  pub fn memory_keys(&self) -> Vec<String> {
    self.memory().order.iter().cloned().collect()
  }

  /// Drop the memory tier only, as a restart would.
  pub fn clear_memory(&self) {
    self.memory().clear();
  }

  /// Run [`TtlCache::cleanup`] every `interval` until the task is aborted.
  pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
    let cache = Arc::clone(self);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      // The first tick completes immediately
      ticker.tick().await;
      loop {
        ticker.tick().await;
        cache.cleanup();
      }
    })
  }

  fn durable_keys(&self) -> Vec<String> {
    self
      .store
      .keys_with_prefix(&self.prefix)
      .unwrap_or_else(|e| {
        warn!(error = %e, "Failed to list durable cache keys");
        Vec::new()
      })
  }

  fn read_durable(&self, key: &str) -> Option<CacheEntry> {
    let storage_key = self.storage_key(key);
    let raw = match self.store.get(&storage_key) {
      Ok(raw) => raw?,
      Err(e) => {
        warn!(key, error = %e, "Failed to read durable cache entry");
        return None;
      }
    };

    match serde_json::from_str(&raw) {
      Ok(entry) => Some(entry),
      Err(e) => {
        warn!(key, error = %e, "Removing corrupted durable cache entry");
        self.remove_durable(&storage_key);
        None
      }
    }
  }

  fn write_durable(&self, entry: &CacheEntry) {
    let storage_key = self.storage_key(&entry.key);
    let result = serde_json::to_string(entry)
      .map_err(|e| color_eyre::eyre::eyre!("Failed to serialize cache entry: {}", e))
      .and_then(|raw| self.store.set(&storage_key, &raw));

    if let Err(e) = result {
      warn!(key = %entry.key, error = %e, "Durable cache write failed, keeping memory copy only");
      // An older durable copy would resurface once memory drops the key
      self.remove_durable(&storage_key);
    }
  }

  fn remove_durable(&self, storage_key: &str) {
    if let Err(e) = self.store.remove(storage_key) {
      warn!(key = %storage_key, error = %e, "Failed to remove durable cache entry");
    }
  }
}
