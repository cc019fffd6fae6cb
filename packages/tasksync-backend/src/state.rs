/// Shared application state passed to axum handlers.
use std::sync::Arc;
use std::time::Instant;

use tasksync_core::config::RelayConfig;
use tokio::sync::watch;

use crate::discovery::PeerRegistry;
use crate::relay::RelayHub;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<RelayHub>,
    pub registry: Arc<PeerRegistry>,
    pub config: Arc<RelayConfig>,
    pub shutdown_rx: watch::Receiver<bool>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: RelayConfig, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            hub: Arc::new(RelayHub::new(config.shard_count)),
            registry: Arc::new(PeerRegistry::new(config.peer_ttl(), config.shard_count)),
            config: Arc::new(config),
            shutdown_rx,
            started_at: Instant::now(),
        }
    }
}
