//! Offline-first write synchronization.
//!
//! Writes made while offline are queued durably and replayed against the API
//! once connectivity returns, with bounded retries per item.

mod connectivity;
mod manager;
mod queue;
mod snapshot;

pub use connectivity::{
  spawn_monitor, ConnectivityProvider, HttpConnectivity, LinkEvent, ManualConnectivity,
};
pub use manager::{
  OfflineManager, OfflineManagerBuilder, SkipReason, SubmitOutcome, SyncEvent, SyncOutcome,
  SyncReport, SyncStatus,
};
pub use queue::{FailureOutcome, SyncAction, SyncQueue, SyncQueueItem};
pub use snapshot::{OfflineSnapshot, SnapshotField, SnapshotSources, SnapshotStore};
