/// Replica side: session lifecycle, transports and discovery client.
mod actor;
pub mod direct;
pub mod discovery_client;
mod event;
mod link;
mod session;

pub use discovery_client::{DiscoveryClient, DiscoveryError};
pub use event::LinkKind;
pub use session::{ReplicaSession, SessionError, SessionStatus};
