/// Replica session: binds one replica to a shared task document in a room.
///
/// The handle mutates the local document synchronously and hands each
/// incremental update to the room's actor, which owns the transports.
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tasksync_core::config::ReplicaConfig;
use tasksync_core::crdt::{DocumentError, TaskDocument};
use tasksync_core::sync::{ProtocolError, SyncMessage};
use tasksync_core::types::{ConnectionState, Task};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::actor::{lock_doc, publish_locked, Actor, Command};
use super::direct::{self, OfferBook};
use super::discovery_client::{DiscoveryClient, DiscoveryError};
use super::event::{Event, EventSender};
use super::link::{relay_url, run_relay, Backoff};

const STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Not joined to a room")]
    NotJoined,

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub state: ConnectionState,
    /// Last transport or discovery problem, cleared once a link is up.
    pub message: Option<String>,
    pub peer_count: usize,
    pub direct_peers: usize,
    pub room_id: Option<String>,
}

struct ActiveRoom {
    room_id: String,
    doc: Arc<Mutex<TaskDocument>>,
    commands: mpsc::UnboundedSender<Command>,
    shutdown_tx: watch::Sender<bool>,
    actor: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

pub struct ReplicaSession {
    config: ReplicaConfig,
    peer_id: String,
    discovery: DiscoveryClient,
    status_tx: Arc<watch::Sender<SessionStatus>>,
    tasks_tx: Arc<watch::Sender<Vec<Task>>>,
    active: Option<ActiveRoom>,
}

impl ReplicaSession {
    pub fn new(config: ReplicaConfig) -> Self {
        let discovery = DiscoveryClient::new(&config.server_url, config.request_timeout());
        let (status_tx, _) = watch::channel(SessionStatus::default());
        let (tasks_tx, _) = watch::channel(Vec::new());
        Self {
            config,
            peer_id: uuid::Uuid::new_v4().to_string(),
            discovery,
            status_tx: Arc::new(status_tx),
            tasks_tx: Arc::new(tasks_tx),
            active: None,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn room_id(&self) -> Option<&str> {
        self.active.as_ref().map(|room| room.room_id.as_str())
    }

    pub fn status(&self) -> SessionStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.tasks_tx.borrow().clone()
    }

    pub fn subscribe_tasks(&self) -> watch::Receiver<Vec<Task>> {
        self.tasks_tx.subscribe()
    }

    /// Ask discovery for a fresh room id.
    pub async fn create_room(&self) -> Result<String, SessionError> {
        Ok(self.discovery.create_session().await?)
    }

    /// Join `room_id`, leaving any room joined before. Network trouble never
    /// fails this call; the session keeps retrying in the background.
    pub async fn connect(&mut self, room_id: &str) -> Result<(), SessionError> {
        self.disconnect().await;

        let doc = match self.config.state_file(room_id) {
            Some(path) if path.exists() => load_state(&path)?,
            _ => TaskDocument::new()?,
        };
        self.tasks_tx.send_replace(doc.snapshot());
        self.status_tx.send_replace(SessionStatus {
            state: ConnectionState::Connecting,
            room_id: Some(room_id.to_string()),
            ..SessionStatus::default()
        });
        let doc = Arc::new(Mutex::new(doc));

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let offers = OfferBook::default();
        let mut workers = Vec::new();

        let mut direct_addr = None;
        if self.config.direct.enabled {
            match direct::start_listener(
                &self.config.direct,
                offers.clone(),
                events_tx.clone(),
                shutdown_rx.clone(),
            )
            .await
            {
                Ok((addr, task)) => {
                    direct_addr = Some(addr);
                    workers.push(task);
                }
                Err(e) => log::warn!(
                    target: "tasksync.direct",
                    "[direct] Listener unavailable, relay only: {}",
                    e
                ),
            }
        }

        workers.push(tokio::spawn(run_relay(
            relay_url(&self.config.server_url, room_id),
            Backoff::new(
                Duration::from_millis(self.config.reconnect_min_ms),
                Duration::from_millis(self.config.reconnect_max_ms),
            ),
            events_tx.clone(),
            shutdown_rx.clone(),
        )));

        workers.push(tokio::spawn(run_refresher(
            self.discovery.clone(),
            room_id.to_string(),
            self.peer_id.clone(),
            self.config.heartbeat(),
            events_tx.clone(),
            shutdown_rx.clone(),
        )));

        let actor = Actor::new(
            self.peer_id.clone(),
            room_id.to_string(),
            self.config.clone(),
            doc.clone(),
            self.status_tx.clone(),
            self.tasks_tx.clone(),
            offers,
            direct_addr,
            events_tx,
            shutdown_rx,
        );
        let actor = tokio::spawn(actor.run(commands_rx, events_rx));

        log::info!(
            target: "tasksync.replica",
            "[replica] Peer {} joining room {}",
            self.peer_id,
            room_id
        );
        self.active = Some(ActiveRoom {
            room_id: room_id.to_string(),
            doc,
            commands: commands_tx,
            shutdown_tx,
            actor,
            workers,
        });
        Ok(())
    }

    /// Leave the current room. A no-op when not joined.
    pub async fn disconnect(&mut self) {
        let Some(room) = self.active.take() else {
            return;
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if room.commands.send(Command::Shutdown(ack_tx)).is_ok() {
            let _ = tokio::time::timeout(STOP_TIMEOUT, ack_rx).await;
        }
        let _ = room.shutdown_tx.send(true);

        if let Err(e) = self.discovery.unregister(&room.room_id, &self.peer_id).await {
            log::debug!(target: "tasksync.replica", "[replica] Unregister failed: {}", e);
        }

        for mut task in std::iter::once(room.actor).chain(room.workers) {
            if tokio::time::timeout(STOP_TIMEOUT, &mut task).await.is_err() {
                task.abort();
            }
        }

        self.tasks_tx.send_replace(Vec::new());
        self.status_tx.send_replace(SessionStatus::default());
    }

    /// Create a task locally and broadcast it.
    pub fn add_task(&self, text: &str) -> Result<Task, SessionError> {
        self.mutate(|doc| doc.create_task(text))
    }

    /// Flip `done` on a task. Returns `false` without sending anything when
    /// the id is unknown locally.
    pub fn toggle_task(&self, id: &str) -> Result<bool, SessionError> {
        Ok(self.mutate(|doc| doc.toggle_task(id))?.is_some())
    }

    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut TaskDocument) -> Result<R, DocumentError>,
    ) -> Result<R, SessionError> {
        let room = self.active.as_ref().ok_or(SessionError::NotJoined)?;
        let mut doc = lock_doc(&room.doc);
        let before = doc.version();
        let result = f(&mut doc)?;
        let updates = doc.export_updates_since(&before)?;
        if !updates.is_empty() {
            let text = SyncMessage::task_sync(&self.peer_id, doc.snapshot(), &updates).encode()?;
            let _ = room.commands.send(Command::Publish { text, since: before });
        }
        publish_locked(&doc, &self.tasks_tx);
        Ok(result)
    }
}

/// Load a saved document. An unreadable file is moved aside to
/// `<name>.corrupt` and the room starts empty; peers fill it back in.
fn load_state(path: &Path) -> Result<TaskDocument, DocumentError> {
    log::info!(target: "tasksync.replica", "[replica] Loading saved state from {}", path.display());
    match TaskDocument::load_from_file(path) {
        Ok(doc) => Ok(doc),
        Err(e) => {
            let aside = path.with_extension("loro.corrupt");
            log::warn!(
                target: "tasksync.replica",
                "[replica] Saved state {} unreadable ({}), moving it to {}",
                path.display(),
                e,
                aside.display()
            );
            if let Err(e) = std::fs::rename(path, &aside) {
                log::warn!(target: "tasksync.replica", "[replica] Could not move bad state aside: {}", e);
            }
            TaskDocument::new()
        }
    }
}

/// Re-register with discovery and report the room's peers every `period`.
async fn run_refresher(
    client: DiscoveryClient,
    room_id: String,
    peer_id: String,
    period: Duration,
    events: EventSender,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        let round = async {
            let registered_ip = client.register(&room_id, &peer_id).await?;
            let peers = client.list_peers(&room_id, &peer_id).await?;
            Ok::<_, DiscoveryError>(Event::Discovered {
                registered_ip,
                peers,
            })
        };
        let event = match round.await {
            Ok(event) => event,
            Err(e) => Event::DiscoveryFailed {
                error: e.to_string(),
            },
        };
        if events.send(event).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{spawn_server, ServerHandle};
    use tasksync_core::config::{DirectConfig, RelayConfig};

    const WAIT: Duration = Duration::from_secs(10);

    async fn start_server(port: u16) -> ServerHandle {
        spawn_server(RelayConfig {
            bind_address: "127.0.0.1".to_string(),
            port,
            ..RelayConfig::default()
        })
        .await
        .unwrap()
    }

    fn replica_config(port: u16, direct: bool) -> ReplicaConfig {
        ReplicaConfig {
            server_url: format!("http://127.0.0.1:{}", port),
            heartbeat_ms: 100,
            reconnect_min_ms: 20,
            reconnect_max_ms: 200,
            request_timeout_ms: 2_000,
            state_dir: None,
            direct: DirectConfig {
                enabled: direct,
                bind_address: "127.0.0.1".to_string(),
                handshake_timeout_ms: 2_000,
                retry_after_ms: 500,
            },
        }
    }

    async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !check() {
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {}", what);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn joined(config: ReplicaConfig, room: &str) -> ReplicaSession {
        let mut session = ReplicaSession::new(config);
        session.connect(room).await.unwrap();
        session
    }

    async fn wait_connected(session: &ReplicaSession, peers: usize) {
        wait_for("connected with peers", || {
            let status = session.status();
            status.state == ConnectionState::Connected && status.peer_count >= peers
        })
        .await;
    }

    fn texts(session: &ReplicaSession) -> Vec<String> {
        let mut texts: Vec<String> = session.tasks().into_iter().map(|t| t.text).collect();
        texts.sort();
        texts
    }

    async fn add_many(session: &ReplicaSession, name: &str, count: usize) {
        for i in 0..count {
            session.add_task(&format!("{} {}", name, i)).unwrap();
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn mutations_require_a_room() {
        let session = ReplicaSession::new(ReplicaConfig::default());
        assert!(matches!(session.add_task("x"), Err(SessionError::NotJoined)));
        assert!(matches!(session.toggle_task("x"), Err(SessionError::NotJoined)));
        assert_eq!(session.status().state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn task_created_on_one_replica_reaches_the_other() {
        let server = start_server(0).await;
        let port = server.port();
        let a = joined(replica_config(port, false), "room-1").await;
        let b = joined(replica_config(port, false), "room-1").await;
        wait_connected(&a, 1).await;
        wait_connected(&b, 1).await;

        let task = a.add_task("Buy milk").unwrap();
        wait_for("task on b", || b.tasks().iter().any(|t| t.id == task.id)).await;
        assert!(!b.tasks()[0].done);

        assert!(b.toggle_task(&task.id).unwrap());
        wait_for("toggle on a", || a.tasks().iter().any(|t| t.id == task.id && t.done)).await;

        server.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_creates_converge_in_same_order() {
        let server = start_server(0).await;
        let port = server.port();
        let a = joined(replica_config(port, false), "room-2").await;
        let b = joined(replica_config(port, false), "room-2").await;
        wait_connected(&a, 1).await;
        wait_connected(&b, 1).await;

        a.add_task("from a").unwrap();
        b.add_task("from b").unwrap();
        wait_for("both tasks everywhere", || a.tasks().len() == 2 && b.tasks().len() == 2).await;
        assert_eq!(a.tasks(), b.tasks());

        server.shutdown().await;
    }

    #[tokio::test]
    async fn double_toggle_restores_state_everywhere() {
        let server = start_server(0).await;
        let port = server.port();
        let a = joined(replica_config(port, false), "room-3").await;
        let b = joined(replica_config(port, false), "room-3").await;
        wait_connected(&a, 1).await;
        wait_connected(&b, 1).await;

        let task = a.add_task("Water plants").unwrap();
        wait_for("task on b", || b.tasks().len() == 1).await;
        a.toggle_task(&task.id).unwrap();
        a.toggle_task(&task.id).unwrap();
        assert!(!a.toggle_task("no-such-task").unwrap());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!a.tasks()[0].done);
        assert!(!b.tasks()[0].done);
        assert_eq!(a.tasks(), b.tasks());

        server.shutdown().await;
    }

    #[tokio::test]
    async fn rejoining_replica_catches_up_and_keeps_offline_edits() {
        let server = start_server(0).await;
        let port = server.port();
        let state_dir = tempfile::tempdir().unwrap();
        let mut b_config = replica_config(port, false);
        b_config.state_dir = Some(state_dir.path().to_path_buf());

        let a = joined(replica_config(port, false), "room-4").await;
        let mut b = joined(b_config.clone(), "room-4").await;
        wait_connected(&a, 1).await;
        wait_connected(&b, 1).await;

        a.add_task("before").unwrap();
        wait_for("first task on b", || b.tasks().len() == 1).await;

        b.disconnect().await;
        assert!(b.tasks().is_empty());
        assert_eq!(b.status().state, ConnectionState::Disconnected);
        assert!(b_config.state_file("room-4").unwrap().exists());

        a.add_task("while away").unwrap();
        a.add_task("also while away").unwrap();
        b.connect("room-4").await.unwrap();
        assert_eq!(texts(&b), vec!["before"]);

        wait_for("catch-up on b", || b.tasks().len() == 3).await;
        assert_eq!(texts(&b), vec!["also while away", "before", "while away"]);
        assert_eq!(a.tasks(), b.tasks());
        wait_for("a sees b's presence", || a.status().peer_count == 1).await;

        server.shutdown().await;
    }

    #[tokio::test]
    async fn relay_restart_loses_nothing() {
        let server = start_server(0).await;
        let port = server.port();
        let a = joined(replica_config(port, false), "room-5").await;
        let b = joined(replica_config(port, false), "room-5").await;
        wait_connected(&a, 1).await;
        wait_connected(&b, 1).await;

        a.add_task("first").unwrap();
        wait_for("first on b", || b.tasks().len() == 1).await;

        server.shutdown().await;
        wait_for("a reconnecting", || a.status().state == ConnectionState::Reconnecting).await;
        wait_for("b reconnecting", || b.status().state == ConnectionState::Reconnecting).await;

        a.add_task("offline on a").unwrap();
        b.add_task("offline on b").unwrap();

        let server = start_server(port).await;
        wait_for("both converge", || a.tasks().len() == 3 && b.tasks().len() == 3).await;
        assert_eq!(a.tasks(), b.tasks());
        assert_eq!(a.status().state, ConnectionState::Connected);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn direct_channel_is_established_and_carries_updates() {
        let server = start_server(0).await;
        let port = server.port();
        let a = joined(replica_config(port, true), "room-6").await;
        let b = joined(replica_config(port, true), "room-6").await;

        wait_for("direct link on both", || {
            a.status().direct_peers == 1 && b.status().direct_peers == 1
        })
        .await;
        assert_eq!(a.status().peer_count, 1);

        let task = b.add_task("over direct").unwrap();
        wait_for("task on a", || a.tasks().iter().any(|t| t.id == task.id)).await;

        server.shutdown().await;
    }

    #[tokio::test]
    async fn session_works_without_direct_listener_on_peer() {
        let server = start_server(0).await;
        let port = server.port();
        let a = joined(replica_config(port, true), "room-7").await;
        let b = joined(replica_config(port, false), "room-7").await;
        wait_connected(&a, 1).await;
        wait_connected(&b, 1).await;

        a.add_task("relay only").unwrap();
        wait_for("task on b", || b.tasks().len() == 1).await;
        assert_eq!(a.status().direct_peers, 0);
        assert_eq!(b.status().direct_peers, 0);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn unreachable_relay_keeps_local_edits() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut session = joined(replica_config(port, false), "room-8").await;
        session.add_task("offline").unwrap();
        wait_for("reconnecting", || session.status().state == ConnectionState::Reconnecting).await;
        assert!(session.status().message.is_some());
        assert_eq!(session.tasks().len(), 1);

        session.disconnect().await;
        assert_eq!(session.status(), SessionStatus::default());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn interleaved_writers_leave_identical_task_views() {
        let server = start_server(0).await;
        let port = server.port();
        let a = joined(replica_config(port, false), "room-9").await;
        let b = joined(replica_config(port, false), "room-9").await;
        wait_connected(&a, 1).await;
        wait_connected(&b, 1).await;

        tokio::join!(add_many(&a, "a", 20), add_many(&b, "b", 20));

        wait_for("all tasks in both views", || a.tasks().len() == 40 && b.tasks().len() == 40).await;
        assert_eq!(a.tasks(), b.tasks());
        let watched = a.subscribe_tasks().borrow().clone();
        assert_eq!(watched, a.tasks());

        server.shutdown().await;
    }

    #[tokio::test]
    async fn corrupt_state_file_starts_empty_and_refills_from_peers() {
        let server = start_server(0).await;
        let port = server.port();
        let state_dir = tempfile::tempdir().unwrap();
        let mut b_config = replica_config(port, false);
        b_config.state_dir = Some(state_dir.path().to_path_buf());
        let path = b_config.state_file("room-10").unwrap();
        std::fs::write(&path, b"definitely not a snapshot").unwrap();

        let a = joined(replica_config(port, false), "room-10").await;
        a.add_task("kept by a").unwrap();

        let mut b = ReplicaSession::new(b_config);
        b.connect("room-10").await.unwrap();
        assert!(path.with_extension("loro.corrupt").exists());

        wait_for("b refilled", || b.tasks().len() == 1).await;
        assert_eq!(texts(&b), vec!["kept by a"]);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_relay_frames_do_not_break_the_session() {
        use futures_util::SinkExt;
        use tokio_tungstenite::tungstenite::Message;

        let server = start_server(0).await;
        let port = server.port();
        let a = joined(replica_config(port, false), "room-11").await;
        let b = joined(replica_config(port, false), "room-11").await;
        wait_connected(&a, 1).await;
        wait_connected(&b, 1).await;

        let (mut rogue, _) =
            tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{}/rooms/room-11", port))
                .await
                .unwrap();
        let bad_frames = [
            "not json at all".to_string(),
            r#"{"type":"NO_SUCH_TYPE","senderId":"x"}"#.to_string(),
            r#"{"type":"TASK_SYNC","tasks":[],"timestamp":0,"senderId":"x","updates":"***"}"#.to_string(),
            format!(
                r#"{{"type":"TASK_SYNC","tasks":[],"timestamp":0,"senderId":"x","updates":"{}"}}"#,
                tasksync_core::sync::encode_bytes(b"random garbage bytes")
            ),
            r#"{"type":"HELLO","senderId":"x","version":"%%%","respond":true}"#.to_string(),
        ];
        for frame in bad_frames {
            rogue.send(Message::Text(frame)).await.unwrap();
        }
        rogue.send(Message::Binary(vec![0xff, 0x00, 0x13])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let task = b.add_task("after the noise").unwrap();
        wait_for("task on a", || a.tasks().iter().any(|t| t.id == task.id)).await;
        let task = a.add_task("and back").unwrap();
        wait_for("task on b", || b.tasks().iter().any(|t| t.id == task.id)).await;
        assert_eq!(a.status().state, ConnectionState::Connected);
        assert_eq!(b.status().state, ConnectionState::Connected);
        assert_eq!(a.tasks(), b.tasks());

        let _ = rogue.close(None).await;
        server.shutdown().await;
    }
}
