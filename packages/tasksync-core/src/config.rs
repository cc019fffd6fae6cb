/// Shared configuration types for the relay server and replica sessions.
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Relay + discovery server settings (`relay.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Registry entries not refreshed within this window are evicted.
    #[serde(default = "default_peer_ttl_secs")]
    pub peer_ttl_secs: u64,
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8787
}

fn default_peer_ttl_secs() -> u64 {
    300
}

fn default_prune_interval_secs() -> u64 {
    60
}

fn default_shard_count() -> usize {
    16
}

fn default_max_message_bytes() -> usize {
    1024 * 1024
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            peer_ttl_secs: default_peer_ttl_secs(),
            prune_interval_secs: default_prune_interval_secs(),
            shard_count: default_shard_count(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

impl RelayConfig {
    pub fn peer_ttl(&self) -> Duration {
        Duration::from_secs(self.peer_ttl_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs.max(1))
    }
}

/// Replica session settings (`replica.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Base URL of the discovery/relay server, e.g. `http://10.0.0.2:8787`.
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Anti-entropy and discovery refresh period.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    #[serde(default = "default_reconnect_min_ms")]
    pub reconnect_min_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Directory for per-room document snapshots. Nothing is persisted when unset.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default)]
    pub direct: DirectConfig,
}

fn default_server_url() -> String {
    "http://127.0.0.1:8787".to_string()
}

fn default_heartbeat_ms() -> u64 {
    5_000
}

fn default_reconnect_min_ms() -> u64 {
    250
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            heartbeat_ms: default_heartbeat_ms(),
            reconnect_min_ms: default_reconnect_min_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            state_dir: None,
            direct: DirectConfig::default(),
        }
    }
}

impl ReplicaConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms.max(10))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Location of the snapshot file for `room_id`, if persistence is enabled.
    /// The room id is hex-encoded so distinct rooms map to distinct files.
    pub fn state_file(&self, room_id: &str) -> Option<PathBuf> {
        self.state_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.loro", hex::encode(room_id.as_bytes()))))
    }
}

/// Direct peer channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectConfig {
    #[serde(default = "default_direct_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Cooldown before a failed peer is offered a direct channel again.
    #[serde(default = "default_retry_after_ms")]
    pub retry_after_ms: u64,
}

fn default_direct_enabled() -> bool {
    true
}

fn default_handshake_timeout_ms() -> u64 {
    5_000
}

fn default_retry_after_ms() -> u64 {
    60_000
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self {
            enabled: default_direct_enabled(),
            bind_address: default_bind_address(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            retry_after_ms: default_retry_after_ms(),
        }
    }
}

impl DirectConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn retry_after(&self) -> Duration {
        Duration::from_millis(self.retry_after_ms)
    }
}
