//! Durable key-value storage.
//!
//! The rest of the crate persists everything through the [`DurableStore`]
//! trait: cache entries, the sync queue, the offline snapshot and the bearer
//! token. Each user of the store owns its own key namespace and assumes it is
//! the only writer there.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use color_eyre::Result;

/// Key under which the bearer token is kept.
pub const TOKEN_KEY: &str = "token";

/// Synchronous, string-keyed persistent storage.
pub trait DurableStore: Send + Sync {
  /// Read a value. Missing keys are `Ok(None)`.
  fn get(&self, key: &str) -> Result<Option<String>>;

  /// Insert or replace a value.
  fn set(&self, key: &str, value: &str) -> Result<()>;

  /// Remove a value. Removing a missing key is not an error.
  fn remove(&self, key: &str) -> Result<()>;

  /// All keys starting with `prefix`, in key order.
  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}
