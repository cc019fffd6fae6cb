/// Room + discovery HTTP API: room minting, peer registration, peer listing,
/// health and recent logs.
use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tasksync_core::types::{
    CreateRoomResponse, HealthResponse, PeersResponse, RegisterRequest, RegisterResponse,
    SuccessResponse,
};

use crate::log_bridge::{self, LogEntry};
use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PeersQuery {
    room_id: Option<String>,
    peer_id: Option<String>,
}

#[derive(Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct LogsResponse {
    entries: Vec<LogEntry>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

impl ErrorResponse {
    fn bad_request(msg: &str) -> (StatusCode, Json<ErrorResponse>) {
        (
            StatusCode::BAD_REQUEST,
            Json(Self {
                error: format!("Bad request: {}", msg),
            }),
        )
    }
}

type Result<T> = std::result::Result<T, (StatusCode, Json<ErrorResponse>)>;

fn require(value: Option<&str>, name: &str) -> Result<String> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(ErrorResponse::bad_request(&format!("{} is required", name))),
    }
}

/// The first `X-Forwarded-For` hop if a proxy supplied one, else the TCP peer.
fn observed_address(headers: &HeaderMap, remote: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| remote.ip().to_string())
}

// ============================================================================
// Endpoints
// ============================================================================

/// POST /rooms - Mint a room id
async fn create_room(State(state): State<AppState>) -> Json<CreateRoomResponse> {
    Json(CreateRoomResponse {
        room_id: state.registry.create_session(),
    })
}

/// POST /discovery/register - Record the caller as reachable for a room
async fn register_peer(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>> {
    let room_id = require(Some(body.room_id.as_str()), "roomId")?;
    let peer_id = require(Some(body.peer_id.as_str()), "peerId")?;
    let address = observed_address(&headers, remote);
    let registered_ip = state.registry.register(&room_id, &peer_id, &address);
    Ok(Json(RegisterResponse {
        success: true,
        registered_ip,
    }))
}

/// POST /discovery/unregister - Drop the caller's registration
async fn unregister_peer(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<SuccessResponse>> {
    let room_id = require(Some(body.room_id.as_str()), "roomId")?;
    let peer_id = require(Some(body.peer_id.as_str()), "peerId")?;
    let success = state.registry.unregister(&room_id, &peer_id);
    Ok(Json(SuccessResponse { success }))
}

/// GET /discovery/peers?roomId=..&peerId=.. - Fresh peers of a room, minus the caller
async fn list_peers(
    State(state): State<AppState>,
    Query(params): Query<PeersQuery>,
) -> Result<Json<PeersResponse>> {
    let room_id = require(params.room_id.as_deref(), "roomId")?;
    let peers = state
        .registry
        .list_peers(&room_id, params.peer_id.as_deref());
    Ok(Json(PeersResponse { peers }))
}

/// GET /health
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        rooms: state.hub.room_count(),
        connections: state.hub.total_connections(),
        registered_peers: state.registry.peer_count(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

/// GET /logs?limit=N
async fn recent_logs(Query(params): Query<LogsQuery>) -> Json<LogsResponse> {
    Json(LogsResponse {
        entries: log_bridge::recent_entries(params.limit.unwrap_or(200)),
    })
}

pub fn rooms_router() -> Router<AppState> {
    Router::new()
        .route("/rooms", post(create_room))
        .route("/discovery/register", post(register_peer))
        .route("/discovery/unregister", post(unregister_peer))
        .route("/discovery/peers", get(list_peers))
        .route("/health", get(health))
        .route("/logs", get(recent_logs))
}
