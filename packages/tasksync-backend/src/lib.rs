/// tasksync backend: WebSocket relay, discovery registry and HTTP API on the
/// server side; replica session, direct peer channel and discovery client on
/// the replica side.
pub mod config;
pub mod discovery;
pub mod log_bridge;
pub mod relay;
pub mod replica;
pub mod rooms_api;
pub mod server;
mod shard;
pub mod state;
