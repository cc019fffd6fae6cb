/// The per-room session actor. Owns the transport links, the presence view,
/// offline changes not yet sent and the published connection state.
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tasksync_core::config::ReplicaConfig;
use tasksync_core::crdt::{TaskDocument, VersionVector};
use tasksync_core::sync::{decode_bytes, SyncMessage};
use tasksync_core::types::{ConnectionState, Task};
use tokio::sync::{mpsc, oneshot, watch};

use super::direct::{self, OfferBook};
use super::event::{Event, EventSender, LinkId, LinkKind};
use super::session::SessionStatus;

pub(crate) enum Command {
    /// An encoded TASK_SYNC for a local mutation, and the document version
    /// the mutation started from.
    Publish { text: String, since: VersionVector },
    Shutdown(oneshot::Sender<()>),
}

struct Link {
    kind: LinkKind,
    peer: Option<String>,
    outbound: mpsc::UnboundedSender<String>,
}

pub(crate) fn lock_doc(doc: &Mutex<TaskDocument>) -> MutexGuard<'_, TaskDocument> {
    doc.lock().unwrap_or_else(|e| e.into_inner())
}

/// Publish the task list of a locked document. Callers hold the guard so
/// publications are ordered the same way as document changes.
pub(crate) fn publish_locked(doc: &TaskDocument, tasks_tx: &watch::Sender<Vec<Task>>) {
    tasks_tx.send_replace(doc.snapshot());
}

pub(crate) struct Actor {
    pub peer_id: String,
    pub room_id: String,
    pub config: ReplicaConfig,
    pub doc: Arc<Mutex<TaskDocument>>,
    pub status_tx: Arc<watch::Sender<SessionStatus>>,
    pub tasks_tx: Arc<watch::Sender<Vec<Task>>>,
    pub offers: OfferBook,
    pub direct_addr: Option<SocketAddr>,
    pub events_tx: EventSender,
    pub shutdown_rx: watch::Receiver<bool>,
    pub state_file: Option<PathBuf>,
    links: HashMap<LinkId, Link>,
    /// Version before the first local change made while no link was up.
    unsent_since: Option<VersionVector>,
    relay_others: usize,
    registered_ip: Option<String>,
    cooldown: HashMap<String, Instant>,
    dialing: HashSet<String>,
}

impl Actor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        peer_id: String,
        room_id: String,
        config: ReplicaConfig,
        doc: Arc<Mutex<TaskDocument>>,
        status_tx: Arc<watch::Sender<SessionStatus>>,
        tasks_tx: Arc<watch::Sender<Vec<Task>>>,
        offers: OfferBook,
        direct_addr: Option<SocketAddr>,
        events_tx: EventSender,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let state_file = config.state_file(&room_id);
        Self {
            peer_id,
            room_id,
            config,
            doc,
            status_tx,
            tasks_tx,
            offers,
            direct_addr,
            events_tx,
            shutdown_rx,
            state_file,
            links: HashMap::new(),
            unsent_since: None,
            relay_others: 0,
            registered_ip: None,
            cooldown: HashMap::new(),
            dialing: HashSet::new(),
        }
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat());
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Publish { text, since }) => self.publish(text, since),
                    Some(Command::Shutdown(ack)) => {
                        self.shutdown();
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = events.recv() => self.on_event(event),
                _ = heartbeat.tick() => self.on_heartbeat(),
            }
        }
    }

    // ── Status ───────────────────────────────────────────────────────────────

    fn direct_peers(&self) -> HashSet<&str> {
        self.links
            .values()
            .filter(|l| l.kind == LinkKind::Direct)
            .filter_map(|l| l.peer.as_deref())
            .collect()
    }

    fn has_direct_link(&self, peer: &str) -> bool {
        self.direct_peers().contains(peer)
    }

    fn refresh_status(&self) {
        let direct_peers = self.direct_peers().len();
        let peer_count = self.relay_others.max(direct_peers);
        self.status_tx.send_modify(|status| {
            status.peer_count = peer_count;
            status.direct_peers = direct_peers;
        });
    }

    fn set_state(&self, state: ConnectionState, message: Option<String>) {
        self.status_tx.send_modify(|status| {
            status.state = state;
            status.message = message;
        });
    }

    // ── Sending ──────────────────────────────────────────────────────────────

    fn send_on(&self, id: LinkId, message: &SyncMessage) {
        let Some(link) = self.links.get(&id) else {
            return;
        };
        match message.encode() {
            Ok(text) => {
                let _ = link.outbound.send(text);
            }
            Err(e) => log::error!(target: "tasksync.replica", "[replica] Encode failed: {}", e),
        }
    }

    fn send_relay(&self, message: &SyncMessage) {
        let ids: Vec<LinkId> = self
            .links
            .iter()
            .filter(|(_, l)| l.kind == LinkKind::Relay)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.send_on(id, message);
        }
    }

    /// Every direct link, plus the relay unless direct links already cover
    /// every other relay participant.
    fn broadcast(&self, text: &str) {
        let direct_count = self.direct_peers().len();
        let skip_relay = direct_count > 0 && direct_count >= self.relay_others;
        for link in self.links.values() {
            if link.kind == LinkKind::Relay && skip_relay {
                continue;
            }
            let _ = link.outbound.send(text.to_string());
        }
    }

    fn publish(&mut self, text: String, since: VersionVector) {
        if !self.links.is_empty() {
            self.broadcast(&text);
            return;
        }
        if self.unsent_since.is_none() {
            log::debug!(target: "tasksync.replica", "[replica] Offline, holding local changes");
            self.unsent_since = Some(since);
        }
    }

    /// Everything changed locally while offline, as one TASK_SYNC.
    fn flush_unsent(&mut self) {
        let Some(since) = self.unsent_since.take() else {
            return;
        };
        let message = {
            let doc = lock_doc(&self.doc);
            match doc.export_updates_since(&since) {
                Ok(updates) if !updates.is_empty() => {
                    Some(SyncMessage::task_sync(&self.peer_id, doc.snapshot(), &updates))
                }
                Ok(_) => None,
                Err(e) => {
                    log::warn!(target: "tasksync.replica", "[replica] Export failed: {}", e);
                    None
                }
            }
        };
        let Some(message) = message else {
            return;
        };
        match message.encode() {
            Ok(text) => {
                log::info!(target: "tasksync.replica", "[replica] Sending changes made offline");
                self.broadcast(&text);
            }
            Err(e) => log::error!(target: "tasksync.replica", "[replica] Encode failed: {}", e),
        }
    }

    fn hello(&self, respond: bool) -> SyncMessage {
        let version = lock_doc(&self.doc).encoded_version();
        SyncMessage::hello(&self.peer_id, &version, respond)
    }

    // ── Events ───────────────────────────────────────────────────────────────

    fn on_event(&mut self, event: Event) {
        match event {
            Event::LinkUp {
                id,
                kind,
                peer,
                outbound,
            } => self.on_link_up(id, kind, peer, outbound),
            Event::LinkMessage { id, text } => self.on_link_message(id, &text),
            Event::LinkDown { id } => self.on_link_down(id),
            Event::RelayFailed { error } => {
                log::warn!(target: "tasksync.replica", "[replica] {}", error);
                if self.links.is_empty() {
                    self.set_state(ConnectionState::Reconnecting, Some(error));
                }
            }
            Event::DialFinished { peer, accepted } => {
                self.dialing.remove(&peer);
                let answer = SyncMessage::Answer {
                    sender_id: self.peer_id.clone(),
                    recipient_id: peer,
                    accepted,
                };
                self.send_relay(&answer);
            }
            Event::Discovered {
                registered_ip,
                peers,
            } => {
                self.registered_ip = Some(registered_ip);
                for peer in peers {
                    self.consider_offer(&peer.peer_id);
                }
            }
            Event::DiscoveryFailed { error } => {
                log::warn!(target: "tasksync.replica", "[replica] {}", error);
                if self.links.is_empty() {
                    self.status_tx.send_modify(|status| status.message = Some(error));
                }
            }
        }
    }

    fn on_link_up(
        &mut self,
        id: LinkId,
        kind: LinkKind,
        peer: Option<String>,
        outbound: mpsc::UnboundedSender<String>,
    ) {
        log::info!(
            target: "tasksync.replica",
            "[replica] {} link up in room {}{}",
            kind,
            self.room_id,
            peer.as_deref().map(|p| format!(" with {}", p)).unwrap_or_default()
        );
        self.links.insert(
            id,
            Link {
                kind,
                peer,
                outbound,
            },
        );
        self.send_on(id, &self.hello(true));
        self.flush_unsent();

        self.set_state(ConnectionState::Connected, None);
        self.refresh_status();
    }

    fn on_link_down(&mut self, id: LinkId) {
        let Some(link) = self.links.remove(&id) else {
            return;
        };
        if link.kind == LinkKind::Relay {
            self.relay_others = 0;
        }
        if self.links.is_empty() {
            self.set_state(
                ConnectionState::Reconnecting,
                Some(format!("{} link lost", link.kind)),
            );
        }
        self.refresh_status();
    }

    fn on_link_message(&mut self, id: LinkId, text: &str) {
        let message = match SyncMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                log::warn!(target: "tasksync.replica", "[replica] Dropping frame on link {}: {}", id, e);
                return;
            }
        };
        if message.sender_id() == Some(self.peer_id.as_str()) || !message.is_for(&self.peer_id) {
            return;
        }
        let via_relay = self
            .links
            .get(&id)
            .is_some_and(|l| l.kind == LinkKind::Relay);

        match message {
            SyncMessage::Hello {
                sender_id,
                version,
                respond,
            } => {
                self.answer_hello(id, &version, respond);
                if via_relay {
                    self.consider_offer(&sender_id);
                }
            }
            SyncMessage::TaskSync {
                updates, sender_id, ..
            } => self.merge_updates(&sender_id, &updates),
            SyncMessage::Bye { sender_id } => {
                log::info!(target: "tasksync.replica", "[replica] Peer {} left", sender_id);
                let departed: Vec<LinkId> = self
                    .links
                    .iter()
                    .filter(|(_, l)| l.kind == LinkKind::Direct && l.peer.as_deref() == Some(sender_id.as_str()))
                    .map(|(id, _)| *id)
                    .collect();
                for id in departed {
                    self.on_link_down(id);
                }
            }
            SyncMessage::Presence { connections } => {
                if via_relay {
                    self.relay_others = connections.saturating_sub(1);
                    self.refresh_status();
                }
            }
            SyncMessage::Offer {
                sender_id,
                endpoints,
                ..
            } => self.accept_offer(sender_id, endpoints),
            SyncMessage::Answer {
                sender_id,
                accepted,
                ..
            } => {
                if !accepted {
                    self.offers.remove(&sender_id);
                    self.cooldown
                        .insert(sender_id.clone(), Instant::now() + self.config.direct.retry_after());
                    log::info!(
                        target: "tasksync.direct",
                        "[direct] Peer {} could not reach us, staying on relay",
                        sender_id
                    );
                }
            }
        }
    }

    fn answer_hello(&self, id: LinkId, version: &str, respond: bool) {
        let version = decode_bytes(version).unwrap_or_else(|e| {
            log::warn!(target: "tasksync.replica", "[replica] Bad HELLO version: {}", e);
            Vec::new()
        });
        let reply = {
            let doc = lock_doc(&self.doc);
            match doc.export_missing_for(&version) {
                Ok(Some(updates)) => Some(SyncMessage::task_sync(&self.peer_id, doc.snapshot(), &updates)),
                Ok(None) => None,
                Err(e) => {
                    log::warn!(target: "tasksync.replica", "[replica] Export failed: {}", e);
                    None
                }
            }
        };
        if let Some(reply) = reply {
            self.send_on(id, &reply);
        }
        if respond {
            self.send_on(id, &self.hello(false));
        }
    }

    fn merge_updates(&self, sender_id: &str, updates: &str) {
        if updates.is_empty() {
            return;
        }
        let bytes = match decode_bytes(updates) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!(target: "tasksync.replica", "[replica] Bad updates from {}: {}", sender_id, e);
                return;
            }
        };
        let mut doc = lock_doc(&self.doc);
        match doc.merge(&bytes) {
            Ok(outcome) => {
                if outcome.pending {
                    log::debug!(
                        target: "tasksync.replica",
                        "[replica] Update from {} waits for missing history",
                        sender_id
                    );
                }
                if outcome.changed {
                    publish_locked(&doc, &self.tasks_tx);
                }
            }
            Err(e) => log::warn!(target: "tasksync.replica", "[replica] Merge from {} failed: {}", sender_id, e),
        }
    }

    // ── Direct channel ───────────────────────────────────────────────────────

    /// Offer a direct channel to `peer` if this replica is the initiator.
    fn consider_offer(&mut self, peer: &str) {
        let Some(local) = self.direct_addr else {
            return;
        };
        if peer == self.peer_id || self.peer_id.as_str() > peer {
            return;
        }
        if self.has_direct_link(peer) || self.offers.contains(peer) {
            return;
        }
        let now = Instant::now();
        if self.cooldown.get(peer).is_some_and(|until| *until > now) {
            return;
        }
        if !self.links.values().any(|l| l.kind == LinkKind::Relay) {
            return;
        }

        let endpoints = direct::local_candidates(local, self.registered_ip.as_deref());
        if endpoints.is_empty() {
            return;
        }
        self.offers
            .insert(peer, now + self.config.direct.handshake_timeout());
        log::info!(
            target: "tasksync.direct",
            "[direct] Offering {} endpoints to {}",
            endpoints.len(),
            peer
        );
        self.send_relay(&SyncMessage::Offer {
            sender_id: self.peer_id.clone(),
            recipient_id: peer.to_string(),
            endpoints,
        });
    }

    fn accept_offer(&mut self, initiator: String, endpoints: Vec<String>) {
        if self.direct_addr.is_none() {
            self.send_relay(&SyncMessage::Answer {
                sender_id: self.peer_id.clone(),
                recipient_id: initiator,
                accepted: false,
            });
            return;
        }
        if self.has_direct_link(&initiator) || !self.dialing.insert(initiator.clone()) {
            return;
        }
        direct::spawn_dial(
            initiator,
            endpoints,
            self.config.direct.handshake_timeout(),
            self.events_tx.clone(),
            self.shutdown_rx.clone(),
        );
    }

    // ── Heartbeat / shutdown ─────────────────────────────────────────────────

    fn on_heartbeat(&mut self) {
        let ids: Vec<LinkId> = self.links.keys().copied().collect();
        if !ids.is_empty() {
            let hello = self.hello(false);
            for id in ids {
                self.send_on(id, &hello);
            }
        }

        let now = Instant::now();
        let retry_after = self.config.direct.retry_after();
        for peer in self.offers.prune(now) {
            log::info!(target: "tasksync.direct", "[direct] Offer to {} expired", peer);
            self.cooldown.insert(peer, now + retry_after);
        }
        self.cooldown.retain(|_, until| *until > now);

        self.persist();
    }

    fn persist(&self) {
        let Some(path) = &self.state_file else {
            return;
        };
        if let Err(e) = lock_doc(&self.doc).save_to_file(path) {
            log::warn!(
                target: "tasksync.replica",
                "[replica] Failed to save {}: {}",
                path.display(),
                e
            );
        }
    }

    fn shutdown(&mut self) {
        let bye = SyncMessage::bye(&self.peer_id);
        for id in self.links.keys().copied().collect::<Vec<_>>() {
            self.send_on(id, &bye);
        }
        self.links.clear();
        self.persist();
        log::info!(target: "tasksync.replica", "[replica] Left room {}", self.room_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Harness {
        doc: Arc<Mutex<TaskDocument>>,
        status: watch::Receiver<SessionStatus>,
        commands: mpsc::UnboundedSender<Command>,
        events: EventSender,
        _shutdown: watch::Sender<bool>,
    }

    fn start_actor() -> Harness {
        let doc = Arc::new(Mutex::new(TaskDocument::new().unwrap()));
        let (status_tx, status) = watch::channel(SessionStatus::default());
        let (tasks_tx, _) = watch::channel(Vec::new());
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let config = ReplicaConfig {
            heartbeat_ms: 60_000,
            ..ReplicaConfig::default()
        };
        let actor = Actor::new(
            "peer-a".to_string(),
            "room-t".to_string(),
            config,
            doc.clone(),
            Arc::new(status_tx),
            Arc::new(tasks_tx),
            OfferBook::default(),
            None,
            events.clone(),
            shutdown_rx,
        );
        tokio::spawn(actor.run(commands_rx, events_rx));
        Harness {
            doc,
            status,
            commands,
            events,
            _shutdown: shutdown,
        }
    }

    async fn wait_state(status: &mut watch::Receiver<SessionStatus>, state: ConnectionState) {
        tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.state == state))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {:?}", state))
            .unwrap();
    }

    fn local_add(harness: &Harness, text: &str) {
        let mut doc = lock_doc(&harness.doc);
        let before = doc.version();
        doc.create_task(text).unwrap();
        let updates = doc.export_updates_since(&before).unwrap();
        let text = SyncMessage::task_sync("peer-a", doc.snapshot(), &updates)
            .encode()
            .unwrap();
        harness
            .commands
            .send(Command::Publish { text, since: before })
            .unwrap();
    }

    #[tokio::test]
    async fn bye_from_only_direct_peer_leaves_reconnecting() {
        let mut harness = start_actor();
        let (outbound, mut frames) = mpsc::unbounded_channel();
        harness
            .events
            .send(Event::LinkUp {
                id: 1,
                kind: LinkKind::Direct,
                peer: Some("peer-z".to_string()),
                outbound,
            })
            .unwrap();
        wait_state(&mut harness.status, ConnectionState::Connected).await;
        assert_eq!(harness.status.borrow().direct_peers, 1);

        let bye = SyncMessage::bye("peer-z").encode().unwrap();
        harness.events.send(Event::LinkMessage { id: 1, text: bye }).unwrap();
        wait_state(&mut harness.status, ConnectionState::Reconnecting).await;
        assert_eq!(harness.status.borrow().direct_peers, 0);
        assert_eq!(harness.status.borrow().peer_count, 0);

        // The link's writer is dropped, so the stream ends after the HELLO.
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while frames.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok(), "direct link still open after BYE");
    }

    #[tokio::test]
    async fn bye_over_relay_keeps_relay_link_connected() {
        let mut harness = start_actor();
        let (relay_out, _relay_frames) = mpsc::unbounded_channel();
        let (direct_out, _direct_frames) = mpsc::unbounded_channel();
        harness
            .events
            .send(Event::LinkUp {
                id: 1,
                kind: LinkKind::Relay,
                peer: None,
                outbound: relay_out,
            })
            .unwrap();
        harness
            .events
            .send(Event::LinkUp {
                id: 2,
                kind: LinkKind::Direct,
                peer: Some("peer-z".to_string()),
                outbound: direct_out,
            })
            .unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            harness.status.wait_for(|s| s.direct_peers == 1),
        )
        .await
        .unwrap()
        .unwrap();

        let bye = SyncMessage::bye("peer-z").encode().unwrap();
        harness.events.send(Event::LinkMessage { id: 1, text: bye }).unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            harness.status.wait_for(|s| s.direct_peers == 0),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(harness.status.borrow().state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn offline_changes_go_out_as_one_update_on_link_up() {
        let mut harness = start_actor();
        local_add(&harness, "first offline");
        local_add(&harness, "second offline");
        // Let the actor take both commands while no link is up.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (outbound, mut frames) = mpsc::unbounded_channel();
        harness
            .events
            .send(Event::LinkUp {
                id: 7,
                kind: LinkKind::Relay,
                peer: None,
                outbound,
            })
            .unwrap();
        wait_state(&mut harness.status, ConnectionState::Connected).await;

        let mut syncs = Vec::new();
        while let Ok(Some(text)) =
            tokio::time::timeout(Duration::from_millis(200), frames.recv()).await
        {
            if let SyncMessage::TaskSync { updates, .. } = SyncMessage::decode(&text).unwrap() {
                syncs.push(updates);
            }
        }
        assert_eq!(syncs.len(), 1, "offline changes were not coalesced");

        let mut remote = TaskDocument::new().unwrap();
        remote.merge(&decode_bytes(&syncs[0]).unwrap()).unwrap();
        let texts: Vec<String> = remote.snapshot().into_iter().map(|t| t.text).collect();
        assert_eq!(texts, vec!["first offline", "second offline"]);
    }

    #[tokio::test]
    async fn online_change_is_sent_immediately() {
        let mut harness = start_actor();
        let (outbound, mut frames) = mpsc::unbounded_channel();
        harness
            .events
            .send(Event::LinkUp {
                id: 3,
                kind: LinkKind::Relay,
                peer: None,
                outbound,
            })
            .unwrap();
        wait_state(&mut harness.status, ConnectionState::Connected).await;
        let hello = frames.recv().await.unwrap();
        assert!(matches!(SyncMessage::decode(&hello).unwrap(), SyncMessage::Hello { .. }));

        local_add(&harness, "live");
        let text = tokio::time::timeout(Duration::from_secs(5), frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(SyncMessage::decode(&text).unwrap(), SyncMessage::TaskSync { .. }));
    }
}
