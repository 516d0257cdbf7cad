//! HTTP listener

use crate::pipeline::Pipeline;
use crate::AppState;
use anyhow::Result;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// How long in-flight requests get to finish once shutdown starts
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Bind the configured address and serve until `shutdown` flips to true
pub async fn run_server(state: Arc<AppState>, shutdown: watch::Receiver<bool>) -> Result<()> {
    let config = state.config.read().await;
    let addr: SocketAddr =
        format!("{}:{}", config.server.bind_address, config.server.port).parse()?;
    drop(config);

    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on http://{}", addr);

    serve(listener, state.pipeline.clone(), shutdown, SHUTDOWN_GRACE).await
}

/// Accept connections and hand every request to the pipeline.
///
/// On shutdown the listener closes, every connection finishes the request it
/// is serving and then closes, and this returns once they are all gone or
/// `grace` has passed. Connections still open after `grace` are cancelled.
pub async fn serve(
    listener: TcpListener,
    pipeline: Arc<Pipeline>,
    mut shutdown: watch::Receiver<bool>,
    grace: Duration,
) -> Result<()> {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote_addr) = accepted?;
                let io = TokioIo::new(stream);
                let pipeline = pipeline.clone();
                let mut closing = shutdown.clone();

                connections.spawn(async move {
                    let service = service_fn(move |req| {
                        let pipeline = pipeline.clone();
                        async move { Ok::<_, Infallible>(pipeline.serve(req, remote_addr).await) }
                    });

                    let conn = http1::Builder::new().serve_connection(io, service);
                    tokio::pin!(conn);
                    let result = tokio::select! {
                        result = conn.as_mut() => result,
                        _ = closing.changed() => {
                            conn.as_mut().graceful_shutdown();
                            conn.as_mut().await
                        }
                    };
                    if let Err(err) = result {
                        debug!("Connection error: {:?}", err);
                    }
                });
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown.changed() => break,
        }
    }

    drop(listener);
    if !connections.is_empty() {
        info!("Waiting for {} open connections", connections.len());
    }
    let drained = tokio::time::timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            "Cancelling {} connections still open after {:?}",
            connections.len(),
            grace
        );
        connections.shutdown().await;
    }
    Ok(())
}
