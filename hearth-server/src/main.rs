//! Hearth Server - site server with buffered responses and persistent traffic stats

mod access_log;
mod context;
mod error;
mod handlers;
mod management;
mod pipeline;
mod recorder;
mod reload;
mod render;
mod router;
mod server;
mod session;
mod stats;
mod store;
mod traffic;

use access_log::AccessLogger;
use anyhow::{Context, Result};
use hearth_common::HearthConfig;
use hyper::Method;
use pipeline::Pipeline;
use render::TeraRenderer;
use router::Router;
use session::SessionCodec;
use stats::{ExclusionPolicy, StatsStore};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{error, info};
use traffic::{SavePolicy, TrafficHandle, TrafficWorker};

/// Shared application state
pub struct AppState {
    pub config: Arc<RwLock<HearthConfig>>,
    pub stats: Arc<StatsStore>,
    pub pipeline: Arc<Pipeline>,
    pub start_time: std::time::Instant,
    pub config_path: PathBuf,
}

/// Wire the routes, session codec, store and templates into a pipeline.
fn build_pipeline(
    config: &HearthConfig,
    shared: Arc<RwLock<HearthConfig>>,
    stats: Arc<StatsStore>,
    traffic: TrafficHandle,
) -> Result<Pipeline> {
    let store = store::connect(&config.server.database_url)
        .with_context(|| format!("opening store {}", config.server.database_url))?;
    let renderer: Arc<dyn render::Renderer> =
        Arc::new(TeraRenderer::new(config.templates.dir.as_deref())?);
    let codec = SessionCodec::new(&config.server.secret, config.server.secure_cookies);

    let router = Router::new(handlers::NotFound)
        .route(
            Method::GET,
            "/",
            handlers::IndexPage {
                renderer: renderer.clone(),
            },
        )
        .route(
            Method::GET,
            "/stats",
            handlers::StatsPage {
                renderer: renderer.clone(),
                stats,
            },
        )
        .route(Method::GET, "/logout", handlers::Logout);

    Ok(Pipeline::new(router, codec, store, renderer, shared, traffic)
        .with_body_limit(config.server.max_body_bytes))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("hearth=info".parse()?),
        )
        .init();

    info!("Starting Hearth Server v{}", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("hearth.json"));

    info!("Loading configuration from {}", config_path.display());
    let config = HearthConfig::load_or_create(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    config.validate()?;

    // A stats file that cannot be read back is fatal; starting from zero
    // would overwrite the history on the next save.
    let stats = Arc::new(
        StatsStore::open(
            &config.stats.file,
            ExclusionPolicy::substrings(config.stats.exclude.clone()),
        )
        .context("opening stats store")?,
    );

    let access_log = config.access_log.enabled.then(|| {
        AccessLogger::new(
            &config.access_log.path,
            config.access_log.max_size_bytes(),
            config.access_log.max_backups,
        )
    });
    let worker = TrafficWorker::spawn(
        stats.clone(),
        access_log,
        SavePolicy::from_secs(config.stats.save_interval_secs),
    );

    let shared = Arc::new(RwLock::new(config.clone()));
    let pipeline = build_pipeline(&config, shared.clone(), stats.clone(), worker.handle())?;

    let state = Arc::new(AppState {
        config: shared,
        stats,
        pipeline: Arc::new(pipeline),
        start_time: std::time::Instant::now(),
        config_path: config_path.clone(),
    });

    // Start file watcher for live reloading
    let reload_state = state.clone();
    let reload_handle = tokio::spawn(async move {
        if let Err(e) = reload::watch_config(reload_state).await {
            error!("Config watcher error: {}", e);
        }
    });

    let mgmt_handle = if config.management.enabled {
        let mgmt_state = state.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = management::run_management_server(mgmt_state).await {
                error!("Management server error: {}", e);
            }
        }))
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_state = state.clone();
    let mut server_handle = tokio::spawn(async move {
        if let Err(e) = server::run_server(server_state, shutdown_rx).await {
            error!("HTTP server error: {}", e);
        }
    });

    let server_finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            false
        }
        result = &mut server_handle => {
            if let Err(e) = result {
                error!("Server task failed: {}", e);
            }
            true
        }
    };

    // Stop accepting and let in-flight requests finish
    let _ = shutdown_tx.send(true);
    if !server_finished {
        if let Err(e) = server_handle.await {
            error!("Server task failed: {}", e);
        }
    }
    reload_handle.abort();
    if let Some(handle) = mgmt_handle {
        handle.abort();
    }

    // Queued notifications are counted before the final save
    worker.shutdown().await;

    info!("Hearth Server shutdown complete");
    Ok(())
}

#[cfg(test)]
mod test_support {
    use super::*;

    /// An [`AppState`] backed by a scratch directory
    pub struct TestApp {
        pub state: Arc<AppState>,
        worker: TrafficWorker,
        dir: PathBuf,
    }

    impl TestApp {
        pub fn new(name: &str) -> Self {
            let dir = std::env::temp_dir().join(format!(
                "hearth-app-{}-{}",
                std::process::id(),
                name
            ));
            let _ = std::fs::remove_dir_all(&dir);
            std::fs::create_dir_all(&dir).unwrap();

            let config_path = dir.join("hearth.json");
            let mut config = HearthConfig::load_or_create(&config_path).unwrap();
            config.stats.file = dir.join("stats.dat");

            let stats =
                Arc::new(StatsStore::open(&config.stats.file, ExclusionPolicy::none()).unwrap());
            let worker = TrafficWorker::spawn(stats.clone(), None, SavePolicy::EveryRequest);
            let shared = Arc::new(RwLock::new(config.clone()));
            let pipeline =
                build_pipeline(&config, shared.clone(), stats.clone(), worker.handle()).unwrap();

            Self {
                state: Arc::new(AppState {
                    config: shared,
                    stats,
                    pipeline: Arc::new(pipeline),
                    start_time: std::time::Instant::now(),
                    config_path,
                }),
                worker,
                dir,
            }
        }

        pub async fn finish(self) {
            self.worker.shutdown().await;
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    #[tokio::test]
    async fn test_built_pipeline_routes_pages() {
        let app = TestApp::new("routes");
        let req = hyper::Request::builder()
            .uri("/stats")
            .body(bytes::Bytes::new())
            .unwrap();
        let addr = "127.0.0.1:4000".parse().unwrap();

        let response = app.state.pipeline.dispatch(req, addr).await;
        assert_eq!(response.status(), hyper::StatusCode::OK);

        let req = hyper::Request::builder()
            .uri("/nowhere")
            .body(bytes::Bytes::new())
            .unwrap();
        let response = app.state.pipeline.dispatch(req, addr).await;
        assert_eq!(response.status(), hyper::StatusCode::NOT_FOUND);
        app.finish().await;
    }
}
