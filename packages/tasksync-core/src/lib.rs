//! Replicated task-list core: CRDT document, wire protocol, shared types and
//! configuration.

pub mod config;
pub mod crdt;
pub mod sync;
pub mod types;
