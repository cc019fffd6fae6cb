//! Replicated task document.

mod tasks;

pub use loro::VersionVector;
pub use tasks::{random_peer_id, MergeOutcome, TaskDocument};

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("CRDT error: {0}")]
    Loro(String),

    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convert any Display-able Loro error into a `DocumentError`.
pub(crate) fn loro_err(e: impl std::fmt::Display) -> DocumentError {
    DocumentError::Loro(e.to_string())
}
