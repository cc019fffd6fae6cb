/// Peer registry: which replicas are reachable at which address, per room.
///
/// Entries expire after the configured TTL. Replicas keep themselves listed
/// by re-registering on every heartbeat; a background pruner evicts the rest.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tasksync_core::types::PeerEntry;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::shard::Shards;

#[derive(Debug, Clone)]
pub struct RegisteredPeer {
    pub peer_id: String,
    pub address: String,
    pub last_seen: Instant,
}

pub struct PeerRegistry {
    rooms: Shards<HashMap<String, RegisteredPeer>>,
    ttl: Duration,
}

impl PeerRegistry {
    pub fn new(ttl: Duration, shard_count: usize) -> Self {
        Self {
            rooms: Shards::new(shard_count),
            ttl,
        }
    }

    /// Mint a new room id.
    pub fn create_session(&self) -> String {
        let room_id = uuid::Uuid::new_v4().to_string();
        log::info!(target: "tasksync.discovery", "[discovery] Minted room {}", room_id);
        room_id
    }

    /// Record `peer_id` as reachable at `address`. Returns the stored address.
    pub fn register(&self, room_id: &str, peer_id: &str, address: &str) -> String {
        self.register_at(room_id, peer_id, address, Instant::now())
    }

    fn register_at(&self, room_id: &str, peer_id: &str, address: &str, now: Instant) -> String {
        let is_new = self.rooms.with(room_id, |rooms| {
            let peers = rooms.entry(room_id.to_string()).or_default();
            peers
                .insert(
                    peer_id.to_string(),
                    RegisteredPeer {
                        peer_id: peer_id.to_string(),
                        address: address.to_string(),
                        last_seen: now,
                    },
                )
                .is_none()
        });
        if is_new {
            log::info!(
                target: "tasksync.discovery",
                "[discovery] Peer {} registered in room {} at {}",
                peer_id,
                room_id,
                address
            );
        }
        address.to_string()
    }

    pub fn unregister(&self, room_id: &str, peer_id: &str) -> bool {
        self.rooms.with(room_id, |rooms| {
            let Some(peers) = rooms.get_mut(room_id) else {
                return false;
            };
            let removed = peers.remove(peer_id).is_some();
            if peers.is_empty() {
                rooms.remove(room_id);
            }
            removed
        })
    }

    /// Fresh peers of a room other than `excluding`, sorted by peer id.
    pub fn list_peers(&self, room_id: &str, excluding: Option<&str>) -> Vec<PeerEntry> {
        self.list_peers_at(room_id, excluding, Instant::now())
    }

    fn list_peers_at(&self, room_id: &str, excluding: Option<&str>, now: Instant) -> Vec<PeerEntry> {
        let ttl = self.ttl;
        let mut peers: Vec<PeerEntry> = self.rooms.with(room_id, |rooms| {
            rooms
                .get(room_id)
                .map(|peers| {
                    peers
                        .values()
                        .filter(|p| now.saturating_duration_since(p.last_seen) <= ttl)
                        .filter(|p| Some(p.peer_id.as_str()) != excluding)
                        .map(|p| PeerEntry {
                            peer_id: p.peer_id.clone(),
                            ip: p.address.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default()
        });
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    /// Evict stale entries and empty rooms. Returns the number of evicted peers.
    pub fn prune(&self) -> usize {
        self.prune_at(Instant::now())
    }

    fn prune_at(&self, now: Instant) -> usize {
        let ttl = self.ttl;
        let mut evicted = 0;
        self.rooms.for_each_shard(|rooms| {
            rooms.retain(|_, peers| {
                let before = peers.len();
                peers.retain(|_, p| now.saturating_duration_since(p.last_seen) <= ttl);
                evicted += before - peers.len();
                !peers.is_empty()
            });
        });
        evicted
    }

    pub fn room_count(&self) -> usize {
        self.rooms.sum(|rooms| rooms.len())
    }

    pub fn peer_count(&self) -> usize {
        self.rooms
            .sum(|rooms| rooms.values().map(|peers| peers.len()).sum())
    }
}

/// Run `prune` every `interval` until the shutdown signal fires.
pub fn spawn_pruner(
    registry: Arc<PeerRegistry>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let count = registry.prune();
                    if count > 0 {
                        log::info!(
                            target: "tasksync.discovery",
                            "[discovery] Evicted {} stale peers",
                            count
                        );
                    }
                }
                _ = shutdown_rx.changed() => {
                    log::info!(target: "tasksync.discovery", "[discovery] Pruner shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(ttl_secs: u64) -> PeerRegistry {
        PeerRegistry::new(Duration::from_secs(ttl_secs), 4)
    }

    #[test]
    fn list_excludes_requester_and_other_rooms() {
        let reg = registry(60);
        reg.register("room", "b", "10.0.0.2");
        reg.register("room", "a", "10.0.0.1");
        reg.register("elsewhere", "c", "10.0.0.3");

        let peers = reg.list_peers("room", Some("a"));
        assert_eq!(
            peers,
            vec![PeerEntry {
                peer_id: "b".to_string(),
                ip: "10.0.0.2".to_string()
            }]
        );
        assert_eq!(reg.list_peers("room", None).len(), 2);
        assert!(reg.list_peers("missing", None).is_empty());
    }

    #[test]
    fn reregistering_updates_address() {
        let reg = registry(60);
        reg.register("room", "a", "10.0.0.1");
        reg.register("room", "a", "192.168.0.9");
        let peers = reg.list_peers("room", None);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].ip, "192.168.0.9");
    }

    #[test]
    fn stale_entries_are_hidden_then_pruned() {
        let reg = registry(30);
        let start = Instant::now();
        reg.register_at("room", "old", "10.0.0.1", start);
        reg.register_at("room", "fresh", "10.0.0.2", start + Duration::from_secs(40));

        let later = start + Duration::from_secs(45);
        let listed = reg.list_peers_at("room", None, later);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].peer_id, "fresh");

        assert_eq!(reg.prune_at(later), 1);
        assert_eq!(reg.peer_count(), 1);

        assert_eq!(reg.prune_at(start + Duration::from_secs(100)), 1);
        assert_eq!(reg.room_count(), 0);
    }

    #[test]
    fn unregister_drops_empty_room() {
        let reg = registry(60);
        reg.register("room", "a", "10.0.0.1");
        assert!(reg.unregister("room", "a"));
        assert!(!reg.unregister("room", "a"));
        assert_eq!(reg.room_count(), 0);
    }

    #[test]
    fn minted_rooms_are_unique() {
        let reg = registry(60);
        assert_ne!(reg.create_session(), reg.create_session());
    }

    #[tokio::test]
    async fn pruner_stops_on_shutdown() {
        let reg = Arc::new(registry(60));
        let (tx, rx) = watch::channel(false);
        let handle = spawn_pruner(reg, Duration::from_millis(10), rx);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("pruner should stop")
            .unwrap();
    }
}
