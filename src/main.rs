use churchsync::config::{ApiConfig, Config};
use churchsync::store::{DurableStore, SqliteStore};
use churchsync::sync::{OfflineManager, SubmitOutcome, SyncAction, SyncEvent};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "churchsync")]
#[command(about = "Offline cache and write sync for the church dashboard API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/churchsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// API base URL, overrides the config file
  #[arg(short, long)]
  base_url: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show connectivity and queue state
  Status,
  /// Send a write now, or queue it if the API is unreachable
  Submit {
    /// create, update or delete
    action: String,
    /// Endpoint relative to the base URL, e.g. /evento
    endpoint: String,
    /// JSON payload
    #[arg(default_value = "null")]
    payload: String,
  },
  /// List pending writes
  Queue,
  /// Drain the sync queue once
  Sync,
  /// Refresh the offline snapshot
  Preload,
  /// Print the offline snapshot
  Snapshot,
  /// Forget the offline snapshot and all pending writes
  Reset,
  /// Inspect or modify the cache
  #[command(subcommand)]
  Cache(CacheCommand),
  /// Manage the bearer token
  #[command(subcommand)]
  Token(TokenCommand),
  /// Stay in the foreground, syncing whenever the API is reachable
  Run,
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  /// Print a cached value
  Get { key: String },
  /// Delete a cached value
  Delete { key: String },
  /// Delete every key matching a regular expression
  Invalidate { pattern: String },
  /// Remove expired entries
  Cleanup,
  /// Remove every cached entry
  Clear,
  /// Show entry counts
  Stats,
}

#[derive(Subcommand, Debug)]
enum TokenCommand {
  Set { token: String },
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration, letting --base-url stand in for a config file
  let config = match (Config::load(args.config.as_deref()), args.base_url.as_deref()) {
    (Ok(config), Some(base_url)) => Config {
      api: ApiConfig {
        base_url: base_url.to_string(),
        ..config.api
      },
      ..config
    },
    (Ok(config), None) => config,
    (Err(_), Some(base_url)) if args.config.is_none() => Config::with_base_url(base_url),
    (Err(e), _) => return Err(e),
  };

  let _log_guard = init_tracing(&log_dir()?)?;

  let store: Arc<dyn DurableStore> = match &config.store_path {
    Some(path) => Arc::new(SqliteStore::open_at(path)?),
    None => Arc::new(SqliteStore::open()?),
  };

  let manager = OfflineManager::builder(config, store).online(false).build()?;

  if let Some(token) = Config::env_token() {
    manager.api().set_token(&token)?;
  }

  run_command(&manager, args.command).await
}

async fn run_command(manager: &OfflineManager, command: Command) -> Result<()> {
  match command {
    Command::Status => {
      check_connectivity(manager).await;
      print_json(&manager.get_sync_status())
    }
    Command::Submit {
      action,
      endpoint,
      payload,
    } => {
      let action: SyncAction = action.parse()?;
      let payload: Value =
        serde_json::from_str(&payload).map_err(|e| eyre!("Invalid JSON payload: {}", e))?;

      check_connectivity(manager).await;
      match manager
        .submit(action, &endpoint, payload)
        .await
        .map_err(|e| eyre!("Write rejected: {}", e))?
      {
        SubmitOutcome::Sent(response) => print_json(&response),
        SubmitOutcome::Queued(id) => {
          println!("queued {}", id);
          Ok(())
        }
      }
    }
    Command::Queue => print_json(&manager.pending_items()),
    Command::Sync => {
      check_connectivity(manager).await;
      print_json(&manager.perform_sync().await)
    }
    Command::Preload => {
      check_connectivity(manager).await;
      match manager.preload_essential_data().await {
        Some(snapshot) => print_json(&snapshot),
        None => Err(eyre!("Preload fetched nothing; offline snapshot unchanged")),
      }
    }
    Command::Snapshot => match manager.get_offline_data() {
      Some(snapshot) => print_json(&snapshot),
      None => Err(eyre!("No offline snapshot stored")),
    },
    Command::Reset => {
      manager.clear_offline_data();
      Ok(())
    }
    Command::Cache(command) => run_cache_command(manager, command),
    Command::Token(TokenCommand::Set { token }) => manager.api().set_token(&token),
    Command::Token(TokenCommand::Clear) => manager.api().clear_token(),
    Command::Run => run_foreground(manager).await,
  }
}

fn run_cache_command(manager: &OfflineManager, command: CacheCommand) -> Result<()> {
  let cache = manager.cache();
  match command {
    CacheCommand::Get { key } => match cache.get(&key) {
      Some(value) => print_json(&value),
      None => Err(eyre!("'{}' is not cached or has expired", key)),
    },
    CacheCommand::Delete { key } => {
      cache.delete(&key);
      Ok(())
    }
    CacheCommand::Invalidate { pattern } => {
      let removed = cache.invalidate_matching(&pattern)?;
      println!("removed {}", removed);
      Ok(())
    }
    CacheCommand::Cleanup => {
      println!("removed {}", cache.cleanup());
      Ok(())
    }
    CacheCommand::Clear => {
      cache.clear();
      Ok(())
    }
    CacheCommand::Stats => print_json(&cache.stats()),
  }
}

async fn run_foreground(manager: &OfflineManager) -> Result<()> {
  let mut events = manager.subscribe();
  manager.init();

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      event = events.recv() => match event {
        Ok(SyncEvent::ItemDropped { item, error }) => {
          eprintln!("dropped {} {} after {} attempts: {}", item.action, item.endpoint, item.retry_count, error);
        }
        Ok(SyncEvent::ConnectivityChanged { online }) => {
          eprintln!("{}", if online { "online" } else { "offline" });
        }
        Ok(_) => {}
        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
      },
    }
  }

  manager.dispose();
  Ok(())
}

/// One-off commands have no monitor running, so ask the API directly.
async fn check_connectivity(manager: &OfflineManager) {
  let reachable = manager.connectivity().probe().await;
  manager.set_online(reachable);
  info!(reachable, "Connectivity checked");
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  let out = serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to format output: {}", e))?;
  println!("{}", out);
  Ok(())
}

fn log_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("churchsync").join("logs"))
}

/// Log to a daily file; RUST_LOG overrides the default level.
fn init_tracing(dir: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(dir).map_err(|e| eyre!("Failed to create log directory: {}", e))?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "churchsync.log"));
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("churchsync=info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}
