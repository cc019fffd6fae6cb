/// Transport links: drive one WebSocket on behalf of the session actor, and
/// keep the relay link alive with exponential backoff.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::event::{Event, EventSender, LinkId, LinkKind};

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

fn next_link_id() -> LinkId {
    NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed)
}

/// Relay endpoint for a room, derived from the discovery base URL.
pub fn relay_url(server_url: &str, room_id: &str) -> String {
    let base = server_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    format!("{}/rooms/{}", ws_base, room_id)
}

/// Run a WebSocket until either side closes it.
///
/// Announces the link with `LinkUp`, forwards every text frame as
/// `LinkMessage` and finishes with `LinkDown`. `initial` is a frame already
/// read off the socket during a handshake; it is delivered right after
/// `LinkUp`.
pub async fn run_link<S>(
    kind: LinkKind,
    peer: Option<String>,
    ws: WebSocketStream<S>,
    events: EventSender,
    initial: Option<String>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let id = next_link_id();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let up = Event::LinkUp {
        id,
        kind,
        peer: peer.clone(),
        outbound: out_tx,
    };
    if events.send(up).is_err() {
        return;
    }
    if let Some(text) = initial {
        let _ = events.send(Event::LinkMessage { id, text });
    }

    log::debug!(
        target: "tasksync.replica",
        "[link] {} link {} up (peer {})",
        kind,
        id,
        peer.as_deref().unwrap_or("-")
    );

    let (mut ws_tx, mut ws_rx) = ws.split();
    loop {
        tokio::select! {
            outgoing = out_rx.recv() => match outgoing {
                Some(text) => {
                    if ws_tx.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if events.send(Event::LinkMessage { id, text }).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        if events.send(Event::LinkMessage { id, text }).is_err() {
                            break;
                        }
                    }
                    Err(_) => log::warn!(
                        target: "tasksync.replica",
                        "[link] Dropping non-UTF-8 binary frame on link {}",
                        id
                    ),
                },
                Some(Ok(Message::Ping(data))) => {
                    let _ = ws_tx.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!(target: "tasksync.replica", "[link] Link {} read error: {}", id, e);
                    break;
                }
            }
        }
    }

    let _ = events.send(Event::LinkDown { id });
    log::debug!(target: "tasksync.replica", "[link] {} link {} down", kind, id);
}

/// Exponential backoff between `min` and `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let min = min.max(Duration::from_millis(1));
        Self {
            min,
            max: max.max(min),
            current: min,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

/// Keep a relay link open until shutdown, reconnecting with backoff.
pub async fn run_relay(
    url: String,
    mut backoff: Backoff,
    events: EventSender,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() || events.is_closed() {
            break;
        }
        let attempt = tokio::select! {
            result = tokio_tungstenite::connect_async(url.as_str()) => result,
            _ = shutdown.changed() => break,
        };
        match attempt {
            Ok((ws, _)) => {
                log::info!(target: "tasksync.replica", "[relay] Connected to {}", url);
                backoff.reset();
                run_link(LinkKind::Relay, None, ws, events.clone(), None).await;
                log::info!(target: "tasksync.replica", "[relay] Disconnected from {}", url);
            }
            Err(e) => {
                let error = format!("Relay connect failed: {}", e);
                if events.send(Event::RelayFailed { error }).is_err() {
                    break;
                }
            }
        }

        let delay = backoff.next_delay();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }
}
