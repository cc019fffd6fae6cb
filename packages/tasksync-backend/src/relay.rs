/// WebSocket relay: forwards every frame a replica sends to all other
/// connections of the same room.
///
/// The relay never parses replica frames. The only frame it authors itself is
/// `PRESENCE { connections }`, sent to the whole room on every join and leave.
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tasksync_core::sync::SyncMessage;
use tokio::sync::mpsc;

use crate::shard::Shards;
use crate::state::AppState;

/// A frame as received from, or delivered to, a relay connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    Text(String),
    Binary(Vec<u8>),
}

impl RelayFrame {
    fn into_message(self) -> Message {
        match self {
            RelayFrame::Text(text) => Message::Text(text.into()),
            RelayFrame::Binary(bytes) => Message::Binary(bytes.into()),
        }
    }
}

// ── RelayHub ────────────────────────────────────────────────────────────────

struct RelayRoom {
    clients: HashMap<u64, mpsc::UnboundedSender<RelayFrame>>,
}

impl RelayRoom {
    fn new() -> Self {
        Self {
            clients: HashMap::new(),
        }
    }

    fn announce_presence(&self) {
        let presence = SyncMessage::Presence {
            connections: self.clients.len(),
        };
        match presence.encode() {
            Ok(text) => {
                for tx in self.clients.values() {
                    let _ = tx.send(RelayFrame::Text(text.clone()));
                }
            }
            Err(e) => log::error!(target: "tasksync.relay", "Failed to encode presence: {}", e),
        }
    }
}

/// Identifies one open relay connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    room_id: String,
    conn_id: u64,
}

impl ConnectionHandle {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }
}

pub struct RelayHub {
    rooms: Shards<RelayRoom>,
    next_conn_id: AtomicU64,
}

impl RelayHub {
    pub fn new(shard_count: usize) -> Self {
        Self {
            rooms: Shards::new(shard_count),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Register a new connection for a room. Returns (handle, receiver).
    pub fn open_session(
        &self,
        room_id: &str,
    ) -> (ConnectionHandle, mpsc::UnboundedReceiver<RelayFrame>) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.rooms.with(room_id, |rooms| {
            let room = rooms
                .entry(room_id.to_string())
                .or_insert_with(RelayRoom::new);
            room.clients.insert(conn_id, tx);
            room.announce_presence();
        });
        (
            ConnectionHandle {
                room_id: room_id.to_string(),
                conn_id,
            },
            rx,
        )
    }

    /// Forward a frame to every other connection in the sender's room.
    /// Returns the number of connections it was handed to.
    pub fn on_message(&self, from: &ConnectionHandle, frame: RelayFrame) -> usize {
        self.rooms.with(&from.room_id, |rooms| {
            let Some(room) = rooms.get(&from.room_id) else {
                return 0;
            };
            room.clients
                .iter()
                .filter(|(id, _)| **id != from.conn_id)
                .filter(|(_, tx)| tx.send(frame.clone()).is_ok())
                .count()
        })
    }

    /// Remove a connection. The room entry goes away with its last connection.
    pub fn on_close(&self, handle: &ConnectionHandle) {
        self.rooms.with(&handle.room_id, |rooms| {
            let Some(room) = rooms.get_mut(&handle.room_id) else {
                return;
            };
            if room.clients.remove(&handle.conn_id).is_none() {
                return;
            }
            if room.clients.is_empty() {
                rooms.remove(&handle.room_id);
            } else {
                room.announce_presence();
            }
        });
    }

    /// Drop every connection of every room.
    pub fn close_all(&self) {
        self.rooms.for_each_shard(|rooms| rooms.clear());
    }

    pub fn room_count(&self) -> usize {
        self.rooms.sum(|rooms| rooms.len())
    }

    pub fn connection_count(&self, room_id: &str) -> usize {
        self.rooms.with(room_id, |rooms| {
            rooms.get(room_id).map_or(0, |r| r.clients.len())
        })
    }

    pub fn total_connections(&self) -> usize {
        self.rooms
            .sum(|rooms| rooms.values().map(|r| r.clients.len()).sum())
    }
}

// ── Router + Handler ────────────────────────────────────────────────────────

pub fn relay_router() -> Router<AppState> {
    Router::new().route("/rooms/{room_id}", get(ws_handler))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.max_message_size(state.config.max_message_bytes)
        .on_upgrade(move |socket| handle_relay_session(socket, room_id, state))
}

async fn handle_relay_session(socket: WebSocket, room_id: String, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (handle, mut hub_rx) = state.hub.open_session(&room_id);

    log::info!(
        target: "tasksync.relay",
        "[relay] Connection {} joined room {} ({} open)",
        handle.conn_id(),
        room_id,
        state.hub.connection_count(&room_id)
    );

    // Write task: forward hub frames to the socket until the hub drops us or
    // the server shuts down.
    let mut shutdown_rx = state.shutdown_rx.clone();
    let write_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = hub_rx.recv() => match frame {
                    Some(frame) => {
                        if ws_tx.send(frame.into_message()).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                },
                _ = shutdown_rx.changed() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    // Read task: relay every data frame verbatim
    let hub = state.hub.clone();
    let read_handle = handle.clone();
    let read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            let frame = match msg {
                Message::Text(t) => RelayFrame::Text(t.as_str().to_owned()),
                Message::Binary(b) => RelayFrame::Binary(b.to_vec()),
                Message::Close(_) => break,
                _ => continue,
            };
            let delivered = hub.on_message(&read_handle, frame);
            log::trace!(
                target: "tasksync.relay",
                "[relay] Connection {} frame delivered to {} peers",
                read_handle.conn_id(),
                delivered
            );
        }
    });

    // Wait for either task to finish, abort the other
    let mut write_task = write_task;
    let mut read_task = read_task;
    tokio::select! {
        _ = &mut write_task => { read_task.abort(); }
        _ = &mut read_task => { write_task.abort(); }
    }

    state.hub.on_close(&handle);
    log::info!(
        target: "tasksync.relay",
        "[relay] Connection {} left room {}",
        handle.conn_id(),
        room_id
    );
}
