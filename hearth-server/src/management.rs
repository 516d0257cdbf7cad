//! Management WebSocket server

use crate::AppState;
use anyhow::Result;
use futures::{SinkExt, StreamExt};
use hearth_common::{ClientMessage, ServerMessage, ServerStatus};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Run the management WebSocket server
pub async fn run_management_server(state: Arc<AppState>) -> Result<()> {
    let config = state.config.read().await;
    let addr = format!("{}:{}", config.management.address, config.management.port);
    drop(config);

    let listener = TcpListener::bind(&addr).await?;
    info!("Management server listening on ws://{}", addr);

    while let Ok((stream, peer_addr)) = listener.accept().await {
        let state = state.clone();

        tokio::spawn(async move {
            match accept_async(stream).await {
                Ok(ws_stream) => {
                    info!("New management connection from {}", peer_addr);
                    if let Err(e) = handle_connection(ws_stream, state).await {
                        error!("Connection error: {}", e);
                    }
                    info!("Management connection from {} closed", peer_addr);
                }
                Err(e) => {
                    error!("WebSocket handshake failed: {}", e);
                }
            }
        });
    }

    Ok(())
}

async fn handle_connection(
    ws_stream: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    state: Arc<AppState>,
) -> Result<()> {
    let (mut write, mut read) = ws_stream.split();

    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let response = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => handle_message(client_msg, &state).await,
                    Err(e) => {
                        warn!("Invalid message format: {}", e);
                        ServerMessage::Error(format!("Invalid message: {}", e))
                    }
                };
                write
                    .send(Message::Text(serde_json::to_string(&response)?))
                    .await?;
            }
            Ok(Message::Close(_)) => {
                debug!("Client initiated close");
                break;
            }
            Ok(Message::Ping(data)) => {
                write.send(Message::Pong(data)).await?;
            }
            Ok(_) => {}
            Err(e) => {
                error!("WebSocket error: {}", e);
                break;
            }
        }
    }

    Ok(())
}

/// Answer one management request
pub async fn handle_message(msg: ClientMessage, state: &Arc<AppState>) -> ServerMessage {
    match msg {
        ClientMessage::GetStatus => {
            let config = state.config.read().await;
            ServerMessage::Status(ServerStatus {
                running: true,
                uptime_secs: state.start_time.elapsed().as_secs(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                listen_address: format!("{}:{}", config.server.bind_address, config.server.port),
                stats_file: state.stats.path().display().to_string(),
            })
        }

        ClientMessage::GetStats { limit } => {
            ServerMessage::Stats(state.stats.report(limit.unwrap_or(usize::MAX)))
        },

        ClientMessage::GetSite => ServerMessage::Site(state.config.read().await.site.clone()),

        ClientMessage::SaveStats => {
            let stats = state.stats.clone();
            match tokio::task::spawn_blocking(move || stats.save()).await {
                Ok(Ok(())) => ServerMessage::Success(format!(
                    "Stats saved to {}",
                    state.stats.path().display()
                )),
                Ok(Err(e)) => ServerMessage::Error(format!("Failed to save stats: {}", e)),
                Err(e) => ServerMessage::Error(format!("Failed to save stats: {}", e)),
            }
        }

        ClientMessage::ReloadConfig => match crate::reload::reload_config(state).await {
            Ok(()) => ServerMessage::Success("Configuration reloaded from file".to_string()),
            Err(e) => ServerMessage::Error(format!("Failed to reload config: {}", e)),
        },
    }
}
