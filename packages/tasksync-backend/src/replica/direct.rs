/// Direct peer channel: a WebSocket between two replicas that bypasses the
/// relay once both sides know how to reach each other.
///
/// The replica with the smaller peer id listens and offers its endpoints over
/// the relay; the other side dials them in order. The listener only accepts a
/// socket whose first frame is a HELLO from a peer it has an open offer for.
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tasksync_core::config::DirectConfig;
use tasksync_core::sync::SyncMessage;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::event::{Event, EventSender, LinkKind};
use super::link::run_link;

pub type DialedStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outstanding offers, keyed by the peer they were made to.
#[derive(Clone, Default)]
pub struct OfferBook {
    inner: Arc<Mutex<HashMap<String, Instant>>>,
}

impl OfferBook {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, peer_id: &str, expires_at: Instant) {
        self.lock().insert(peer_id.to_string(), expires_at);
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.lock().contains_key(peer_id)
    }

    pub fn remove(&self, peer_id: &str) -> bool {
        self.lock().remove(peer_id).is_some()
    }

    /// Consume the offer for `peer_id` if it has not expired.
    pub fn take(&self, peer_id: &str, now: Instant) -> bool {
        matches!(self.lock().remove(peer_id), Some(expires_at) if expires_at >= now)
    }

    /// Drop expired offers and return the peers they were made to.
    pub fn prune(&self, now: Instant) -> Vec<String> {
        let mut expired = Vec::new();
        self.lock().retain(|peer, expires_at| {
            let keep = *expires_at >= now;
            if !keep {
                expired.push(peer.clone());
            }
            keep
        });
        expired
    }
}

// ── Listener ────────────────────────────────────────────────────────────────

/// Bind the direct listener on an ephemeral port and accept peers until
/// shutdown. Returns the bound address and the accept task.
pub async fn start_listener(
    config: &DirectConfig,
    offers: OfferBook,
    events: EventSender,
    shutdown: watch::Receiver<bool>,
) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(format!("{}:0", config.bind_address)).await?;
    let local = listener.local_addr()?;
    let handshake = config.handshake_timeout();
    log::info!(target: "tasksync.direct", "[direct] Listening on {}", local);

    let task = tokio::spawn(accept_loop(listener, handshake, offers, events, shutdown));
    Ok((local, task))
}

async fn accept_loop(
    listener: TcpListener,
    handshake: Duration,
    offers: OfferBook,
    events: EventSender,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tokio::spawn(accept_peer(stream, addr, handshake, offers.clone(), events.clone()));
                }
                Err(e) => log::warn!(target: "tasksync.direct", "[direct] Accept failed: {}", e),
            },
            _ = shutdown.changed() => break,
        }
    }
    log::debug!(target: "tasksync.direct", "[direct] Listener stopped");
}

async fn accept_peer(
    stream: TcpStream,
    addr: SocketAddr,
    handshake: Duration,
    offers: OfferBook,
    events: EventSender,
) {
    let mut ws = match tokio::time::timeout(handshake, tokio_tungstenite::accept_async(stream)).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            log::debug!(target: "tasksync.direct", "[direct] Upgrade from {} failed: {}", addr, e);
            return;
        }
        Err(_) => {
            log::debug!(target: "tasksync.direct", "[direct] Upgrade from {} timed out", addr);
            return;
        }
    };

    let first = match tokio::time::timeout(handshake, ws.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        _ => {
            log::debug!(target: "tasksync.direct", "[direct] No HELLO from {}", addr);
            return;
        }
    };

    let peer = match SyncMessage::decode(&first) {
        Ok(SyncMessage::Hello { sender_id, .. }) => sender_id,
        _ => {
            log::warn!(target: "tasksync.direct", "[direct] Rejecting {}: first frame is not HELLO", addr);
            return;
        }
    };

    if !offers.take(&peer, Instant::now()) {
        log::warn!(
            target: "tasksync.direct",
            "[direct] Rejecting {} from {}: no open offer",
            peer,
            addr
        );
        return;
    }

    log::info!(target: "tasksync.direct", "[direct] Accepted peer {} from {}", peer, addr);
    run_link(LinkKind::Direct, Some(peer), ws, events, Some(first)).await;
}

// ── Dialer ──────────────────────────────────────────────────────────────────

/// Try each endpoint in order; the first that completes the upgrade within
/// `timeout` wins.
pub async fn dial(endpoints: &[String], timeout: Duration) -> Option<(String, DialedStream)> {
    for endpoint in endpoints {
        let url = format!("ws://{}/", endpoint);
        match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str())).await {
            Ok(Ok((ws, _))) => return Some((endpoint.clone(), ws)),
            Ok(Err(e)) => {
                log::debug!(target: "tasksync.direct", "[direct] Dial {} failed: {}", endpoint, e)
            }
            Err(_) => log::debug!(target: "tasksync.direct", "[direct] Dial {} timed out", endpoint),
        }
    }
    None
}

/// Answer an offer: dial the initiator and, on success, run the link.
pub fn spawn_dial(
    peer: String,
    endpoints: Vec<String>,
    timeout: Duration,
    events: EventSender,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let dialed = tokio::select! {
            dialed = dial(&endpoints, timeout) => dialed,
            _ = shutdown.changed() => return,
        };
        match dialed {
            Some((endpoint, ws)) => {
                log::info!(
                    target: "tasksync.direct",
                    "[direct] Connected to peer {} at {}",
                    peer,
                    endpoint
                );
                let _ = events.send(Event::DialFinished {
                    peer: peer.clone(),
                    accepted: true,
                });
                run_link(LinkKind::Direct, Some(peer), ws, events, None).await;
            }
            None => {
                log::info!(
                    target: "tasksync.direct",
                    "[direct] Could not reach peer {}, staying on relay",
                    peer
                );
                let _ = events.send(Event::DialFinished {
                    peer,
                    accepted: false,
                });
            }
        }
    })
}

// ── Candidate endpoints ─────────────────────────────────────────────────────

fn is_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

fn rank(ip: &IpAddr) -> u8 {
    if ip.is_loopback() {
        2
    } else if is_link_local(ip) {
        1
    } else {
        0
    }
}

/// Order candidates routable first, link-local next, loopback last.
/// Duplicates and unspecified addresses are dropped.
pub fn rank_candidates(ips: Vec<IpAddr>, port: u16) -> Vec<String> {
    let mut unique: Vec<IpAddr> = Vec::new();
    for ip in ips {
        if !ip.is_unspecified() && !unique.contains(&ip) {
            unique.push(ip);
        }
    }
    unique.sort_by_key(rank);
    unique
        .into_iter()
        .map(|ip| SocketAddr::new(ip, port).to_string())
        .collect()
}

/// Endpoints to advertise for a listener bound at `local`. A listener bound
/// to one address advertises only that address; a wildcard listener
/// advertises every interface plus the address discovery observed.
pub fn local_candidates(local: SocketAddr, observed_ip: Option<&str>) -> Vec<String> {
    if !local.ip().is_unspecified() {
        return rank_candidates(vec![local.ip()], local.port());
    }
    let mut ips: Vec<IpAddr> = match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces.iter().map(|iface| iface.ip()).collect(),
        Err(e) => {
            log::warn!(target: "tasksync.direct", "[direct] Could not list interfaces: {}", e);
            Vec::new()
        }
    };
    if let Some(ip) = observed_ip.and_then(|s| s.parse::<IpAddr>().ok()) {
        ips.push(ip);
    }
    rank_candidates(ips, local.port())
}
