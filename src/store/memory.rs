use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::sync::Mutex;

use super::DurableStore;

/// In-process store. Nothing survives the process.
///
/// An optional byte quota makes writes fail the way a full browser storage
/// does, so callers can exercise their degraded paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
  entries: Mutex<BTreeMap<String, String>>,
  quota: Option<usize>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Limit total stored bytes (keys plus values).
  pub fn with_quota(quota: usize) -> Self {
    Self {
      entries: Mutex::new(BTreeMap::new()),
      quota: Some(quota),
    }
  }

  fn used_bytes(entries: &BTreeMap<String, String>) -> usize {
    entries.iter().map(|(k, v)| k.len() + v.len()).sum()
  }
}

impl DurableStore for MemoryStore {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(entries.get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    if let Some(quota) = self.quota {
      let replaced = entries.get(key).map(|v| key.len() + v.len()).unwrap_or(0);
      let needed = Self::used_bytes(&entries) - replaced + key.len() + value.len();
      if needed > quota {
        return Err(eyre!(
          "Storage quota exceeded writing '{}' ({} > {} bytes)",
          key,
          needed,
          quota
        ));
      }
    }

    entries.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.remove(key);
    Ok(())
  }

  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      entries
        .keys()
        .filter(|k| k.starts_with(prefix))
        .cloned()
        .collect(),
    )
  }
}
