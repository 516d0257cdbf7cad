//! Configuration live reload using file watcher

use crate::AppState;
use anyhow::Result;
use hearth_common::HearthConfig;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Watch the configuration file for changes and reload automatically
pub async fn watch_config(state: Arc<AppState>) -> Result<()> {
    let config_path = state.config_path.clone();

    if !config_path.exists() {
        warn!("Config file does not exist, skipping file watcher");
        return Ok(());
    }

    let (tx, mut rx) = mpsc::channel(100);
    let file_name = config_path.file_name().map(|n| n.to_os_string());

    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                // The stats file and access log usually share the directory
                let ours = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                if ours && (event.kind.is_modify() || event.kind.is_create()) {
                    let _ = tx.blocking_send(());
                }
            }
        },
        Config::default(),
    )?;

    let watch_path = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    watcher.watch(watch_path, RecursiveMode::NonRecursive)?;

    info!("Watching {} for changes", config_path.display());

    let mut last_reload = Instant::now();
    let debounce = Duration::from_millis(500);

    while rx.recv().await.is_some() {
        let now = Instant::now();
        if now.duration_since(last_reload) < debounce {
            continue;
        }
        last_reload = now;

        // Let the editor finish writing
        tokio::time::sleep(Duration::from_millis(100)).await;

        match reload_config(&state).await {
            Ok(()) => info!("Configuration reloaded successfully"),
            Err(e) => error!("Failed to reload configuration: {}", e),
        }
    }

    Ok(())
}

/// Re-read the configuration file and swap it in.
///
/// Only the site settings take effect immediately; listener, secret, store
/// and stats settings are read once at startup.
pub async fn reload_config(state: &Arc<AppState>) -> Result<()> {
    let new_config = HearthConfig::load(&state.config_path)?;
    new_config.validate()?;

    let mut config = state.config.write().await;
    if new_config.server.bind_address != config.server.bind_address
        || new_config.server.port != config.server.port
    {
        warn!("Listen address changed; restart to apply");
    }
    if new_config.stats.file != config.stats.file {
        warn!("Stats file changed; restart to apply");
    }
    *config = new_config;

    Ok(())
}
