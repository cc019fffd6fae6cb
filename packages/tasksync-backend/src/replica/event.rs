/// Messages from background tasks to the session actor.
use tasksync_core::types::PeerEntry;
use tokio::sync::mpsc;

pub type LinkId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Relay,
    Direct,
}

impl std::fmt::Display for LinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkKind::Relay => f.write_str("relay"),
            LinkKind::Direct => f.write_str("direct"),
        }
    }
}

#[derive(Debug)]
pub enum Event {
    /// A transport link is open. Frames pushed into `outbound` are written
    /// to it; dropping `outbound` closes it.
    LinkUp {
        id: LinkId,
        kind: LinkKind,
        peer: Option<String>,
        outbound: mpsc::UnboundedSender<String>,
    },
    LinkMessage {
        id: LinkId,
        text: String,
    },
    LinkDown {
        id: LinkId,
    },
    RelayFailed {
        error: String,
    },
    /// A dial attempt answering a peer's offer has finished.
    DialFinished {
        peer: String,
        accepted: bool,
    },
    Discovered {
        registered_ip: String,
        peers: Vec<PeerEntry>,
    },
    DiscoveryFailed {
        error: String,
    },
}

pub type EventSender = mpsc::UnboundedSender<Event>;
