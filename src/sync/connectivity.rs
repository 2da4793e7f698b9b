//! Connectivity detection.
//!
//! Two signals feed the offline manager:
//! - link events (the platform saying the network went up or down), which are
//!   cheap but can be wrong, e.g. joined to a Wi-Fi network with no internet
//! - an active probe against the API, which is authoritative
//!
//! While the link is reported down the probe is skipped.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::manager::OfflineManager;
use crate::api::ApiClient;

/// Link-layer transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
  Online,
  Offline,
}

/// Platform hooks for connectivity.
#[async_trait]
pub trait ConnectivityProvider: Send + Sync {
  /// Can the API be reached right now?
  async fn probe(&self) -> bool;

  /// Stream of link events, if the platform has one.
  fn link_events(&self) -> Option<broadcast::Receiver<LinkEvent>> {
    None
  }
}

/// Probes the API with a HEAD request. Has no link events.
pub struct HttpConnectivity {
  api: ApiClient,
  path: String,
  timeout: Duration,
}

impl HttpConnectivity {
  pub fn new(api: ApiClient, path: &str, timeout: Duration) -> Self {
    Self {
      api,
      path: path.to_string(),
      timeout,
    }
  }
}

#[async_trait]
impl ConnectivityProvider for HttpConnectivity {
  async fn probe(&self) -> bool {
    self.api.probe(&self.path, self.timeout).await
  }
}

/// Connectivity driven by the host: it reports link changes and decides what
/// the probe answers.
pub struct ManualConnectivity {
  reachable: AtomicBool,
  events: broadcast::Sender<LinkEvent>,
}

impl ManualConnectivity {
  pub fn new(reachable: bool) -> Self {
    let (events, _) = broadcast::channel(16);
    Self {
      reachable: AtomicBool::new(reachable),
      events,
    }
  }

  pub fn set_reachable(&self, reachable: bool) {
    self.reachable.store(reachable, Ordering::SeqCst);
  }

  /// Report a link change. Also updates what the probe answers.
  pub fn emit(&self, event: LinkEvent) {
    self.set_reachable(event == LinkEvent::Online);
    // No subscribers just means no monitor is running yet
    let _ = self.events.send(event);
  }
}

#[async_trait]
impl ConnectivityProvider for ManualConnectivity {
  async fn probe(&self) -> bool {
    self.reachable.load(Ordering::SeqCst)
  }

  fn link_events(&self) -> Option<broadcast::Receiver<LinkEvent>> {
    Some(self.events.subscribe())
  }
}

/// Watch connectivity for `manager` until the task is aborted.
///
/// The first probe runs immediately, then every `interval`.
pub fn spawn_monitor(manager: OfflineManager, interval: Duration) -> JoinHandle<()> {
  tokio::spawn(async move {
    let provider = manager.connectivity();
    let mut events = provider.link_events();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut link_down = false;

    loop {
      tokio::select! {
        _ = ticker.tick() => {
          if link_down {
            debug!("Link is down, skipping connectivity probe");
            continue;
          }
          let reachable = provider.probe().await;
          manager.apply_probe_result(reachable);
        }
        event = next_link_event(&mut events) => match event {
          Some(event) => {
            link_down = event == LinkEvent::Offline;
            manager.handle_link_event(event);
          }
          None => events = None,
        },
      }
    }
  })
}

async fn next_link_event(events: &mut Option<broadcast::Receiver<LinkEvent>>) -> Option<LinkEvent> {
  let Some(rx) = events else {
    return std::future::pending().await;
  };

  loop {
    match rx.recv().await {
      Ok(event) => return Some(event),
      Err(broadcast::error::RecvError::Lagged(skipped)) => {
        debug!(skipped, "Missed link events");
      }
      Err(broadcast::error::RecvError::Closed) => return None,
    }
  }
}
