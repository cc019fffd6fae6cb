/// HTTP server: relay WebSocket + discovery API on one axum listener,
/// served from a background tokio task.
use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use tasksync_core::config::RelayConfig;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};

use crate::discovery::spawn_pruner;
use crate::relay::relay_router;
use crate::rooms_api::rooms_router;
use crate::state::AppState;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A running server. Dropping the handle leaves the server running;
/// call [`ServerHandle::shutdown`] to stop it.
pub struct ServerHandle {
    port: u16,
    state: AppState,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    pruner: JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Close every relay socket, stop accepting connections and wait for the
    /// serve task to finish. The port can be bound again afterwards.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        self.state.hub.close_all();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.task).await.is_err() {
            log::warn!(target: "tasksync.relay", "[server] Serve task did not stop in time");
        }
        self.pruner.abort();
        log::info!(target: "tasksync.relay", "[server] Stopped listener on port {}", self.port);
    }
}

pub async fn spawn_server(config: RelayConfig) -> Result<ServerHandle, ServerError> {
    let addr = format!("{}:{}", config.bind_address, config.port);
    let prune_interval = config.prune_interval();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = AppState::new(config, shutdown_rx.clone());

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app: Router = rooms_router()
        .merge(relay_router())
        .layer(cors)
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
    let port = listener.local_addr()?.port();

    log::info!(
        target: "tasksync.relay",
        "[server] Listening on http://{}:{}",
        state.config.bind_address,
        port
    );

    let pruner = spawn_pruner(state.registry.clone(), prune_interval, shutdown_rx.clone());

    let mut serve_shutdown = shutdown_rx;
    let task = tokio::spawn(async move {
        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = serve_shutdown.changed().await;
        })
        .await;
        if let Err(e) = result {
            log::error!(target: "tasksync.relay", "[server] Exited with error: {}", e);
        }
    });

    Ok(ServerHandle {
        port,
        state,
        shutdown_tx,
        task,
        pruner,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tasksync_core::types::{CreateRoomResponse, HealthResponse, PeersResponse, RegisterResponse};

    fn local_config(port: u16) -> RelayConfig {
        RelayConfig {
            bind_address: "127.0.0.1".to_string(),
            port,
            ..RelayConfig::default()
        }
    }

    #[tokio::test]
    async fn http_api_round_trip() {
        let server = spawn_server(local_config(0)).await.unwrap();
        let base = format!("http://127.0.0.1:{}", server.port());
        let http = reqwest::Client::new();

        let room: CreateRoomResponse = http
            .post(format!("{}/rooms", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(!room.room_id.is_empty());

        for peer in ["alice", "bob"] {
            let resp: RegisterResponse = http
                .post(format!("{}/discovery/register", base))
                .header("x-forwarded-for", "198.51.100.4")
                .json(&serde_json::json!({ "roomId": room.room_id, "peerId": peer }))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            assert!(resp.success);
            assert_eq!(resp.registered_ip, "198.51.100.4");
        }

        let peers: PeersResponse = http
            .get(format!("{}/discovery/peers", base))
            .query(&[("roomId", room.room_id.as_str()), ("peerId", "alice")])
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(peers.peers.len(), 1);
        assert_eq!(peers.peers[0].peer_id, "bob");

        let health: HealthResponse = http
            .get(format!("{}/health", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.registered_peers, 2);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn missing_room_id_is_bad_request() {
        let server = spawn_server(local_config(0)).await.unwrap();
        let status = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{}/discovery/register", server.port()))
            .json(&serde_json::json!({ "roomId": "", "peerId": "p" }))
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn port_can_be_rebound_after_shutdown() {
        let first = spawn_server(local_config(0)).await.unwrap();
        let port = first.port();
        first.shutdown().await;
        let second = spawn_server(local_config(port)).await.unwrap();
        assert_eq!(second.port(), port);
        second.shutdown().await;
    }
}
