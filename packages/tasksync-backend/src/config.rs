/// Configuration loading for the relay server and replica sessions.
/// Reads `<config_dir>/tasksync/<name>.json`, then applies `TASKSYNC_*`
/// environment overrides.
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};
use tasksync_core::config::{RelayConfig, ReplicaConfig};

/// Default config path: ~/.config/tasksync/<name>.json
pub fn default_config_path(name: &str) -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tasksync")
        .join(format!("{}.json", name))
}

/// Load config from path. Returns default if the file is missing or invalid.
pub fn load_config<T: DeserializeOwned + Default>(path: &Path) -> T {
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            log::warn!(target: "tasksync.config", "Failed to parse config {}: {}", path.display(), e);
            T::default()
        }),
        Err(_) => {
            log::info!(target: "tasksync.config", "No config at {}, using defaults", path.display());
            T::default()
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_override<T: std::str::FromStr>(name: &str, raw: Option<String>) -> Option<T> {
    let raw = raw?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!(target: "tasksync.config", "Ignoring invalid {}={}", name, raw);
            None
        }
    }
}

fn apply_relay_overrides(config: &mut RelayConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(bind) = lookup("TASKSYNC_BIND") {
        config.bind_address = bind;
    }
    if let Some(port) = parse_override("TASKSYNC_PORT", lookup("TASKSYNC_PORT")) {
        config.port = port;
    }
    if let Some(ttl) = parse_override("TASKSYNC_PEER_TTL_SECS", lookup("TASKSYNC_PEER_TTL_SECS")) {
        config.peer_ttl_secs = ttl;
    }
}

fn apply_replica_overrides(config: &mut ReplicaConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(url) = lookup("TASKSYNC_SERVER_URL") {
        config.server_url = url.trim_end_matches('/').to_string();
    }
    if let Some(dir) = lookup("TASKSYNC_STATE_DIR") {
        config.state_dir = Some(PathBuf::from(dir));
    }
}

pub fn load_relay_config(path: &Path) -> RelayConfig {
    let mut config: RelayConfig = load_config(path);
    apply_relay_overrides(&mut config, env_var);
    config
}

pub fn load_replica_config(path: &Path) -> ReplicaConfig {
    let mut config: ReplicaConfig = load_config(path);
    apply_replica_overrides(&mut config, env_var);
    config
}
