//! Cache keys for dashboard reads.

use std::time::Duration;

use crate::config::CacheTtls;
use crate::sync::SnapshotField;

/// Cacheable dashboard queries.
///
/// Each variant knows its cache key, the endpoint that produces it and which
/// TTL category it falls in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DashboardKey {
  /// Aggregated dashboard numbers for a user
  DashboardData { user_id: String },
  /// Notification list for a user
  Notifications { user_id: String },
  /// Head church and congregation directory
  Churches,
  /// Members of a church
  Members { church_id: String },
  /// Events of a church
  Events { church_id: String },
  /// Tithe records of a church
  Tithes { church_id: String },
}

impl DashboardKey {
  pub fn cache_key(&self) -> String {
    match self {
      Self::DashboardData { user_id } => format!("dashboard_data_{}", user_id),
      Self::Notifications { user_id } => format!("notifications_{}", user_id),
      Self::Churches => "churches".to_string(),
      Self::Members { church_id } => format!("members_{}", church_id),
      Self::Events { church_id } => format!("events_{}", church_id),
      Self::Tithes { church_id } => format!("tithes_{}", church_id),
    }
  }

  pub fn endpoint(&self) -> String {
    match self {
      Self::DashboardData { user_id } => format!("/dashboard/{}", user_id),
      Self::Notifications { user_id } => format!("/notificacao?usuario={}", user_id),
      Self::Churches => "/igreja".to_string(),
      Self::Members { church_id } => format!("/membro?igreja={}", church_id),
      Self::Events { church_id } => format!("/evento?igreja={}", church_id),
      Self::Tithes { church_id } => format!("/dizimo?igreja={}", church_id),
    }
  }

  /// Offline snapshot field holding this query's data, if any.
  pub fn snapshot_field(&self) -> Option<SnapshotField> {
    match self {
      Self::DashboardData { .. } => Some(SnapshotField::DashboardData),
      Self::Notifications { .. } => Some(SnapshotField::Notifications),
      Self::Members { .. } => Some(SnapshotField::Members),
      Self::Events { .. } => Some(SnapshotField::Events),
      Self::Churches | Self::Tithes { .. } => None,
    }
  }

  pub fn ttl(&self, ttls: &CacheTtls) -> Duration {
    let secs = match self {
      Self::DashboardData { .. } => ttls.dashboard_secs,
      Self::Notifications { .. } => ttls.notifications_secs,
      Self::Churches | Self::Members { .. } => ttls.directory_secs,
      Self::Events { .. } => ttls.events_secs,
      Self::Tithes { .. } => ttls.tithes_secs,
    };
    Duration::from_secs(secs)
  }

  pub fn description(&self) -> String {
    match self {
      Self::DashboardData { user_id } => format!("dashboard for user {}", user_id),
      Self::Notifications { user_id } => format!("notifications for user {}", user_id),
      Self::Churches => "all churches".to_string(),
      Self::Members { church_id } => format!("members of church {}", church_id),
      Self::Events { church_id } => format!("events of church {}", church_id),
      Self::Tithes { church_id } => format!("tithes of church {}", church_id),
    }
  }
}
