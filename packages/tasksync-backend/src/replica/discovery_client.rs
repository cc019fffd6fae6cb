/// HTTP client for the room + discovery API.
use std::time::Duration;

use tasksync_core::types::{
    CreateRoomResponse, PeerEntry, PeersResponse, RegisterRequest, RegisterResponse,
    SuccessResponse,
};

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Discovery request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Discovery returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Clone)]
pub struct DiscoveryClient {
    http: reqwest::Client,
    base_url: String,
}

impl DiscoveryClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                log::warn!(
                    target: "tasksync.replica",
                    "[discovery] Falling back to default HTTP client: {}",
                    e
                );
                reqwest::Client::new()
            });
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, DiscoveryError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(DiscoveryError::Status {
            status: status.as_u16(),
            body,
        })
    }

    /// POST /rooms
    pub async fn create_session(&self) -> Result<String, DiscoveryError> {
        let resp = self
            .http
            .post(format!("{}/rooms", self.base_url))
            .send()
            .await?;
        let room: CreateRoomResponse = Self::check(resp).await?.json().await?;
        Ok(room.room_id)
    }

    /// POST /discovery/register. Returns the address the server observed.
    pub async fn register(&self, room_id: &str, peer_id: &str) -> Result<String, DiscoveryError> {
        let resp = self
            .http
            .post(format!("{}/discovery/register", self.base_url))
            .json(&RegisterRequest {
                room_id: room_id.to_string(),
                peer_id: peer_id.to_string(),
            })
            .send()
            .await?;
        let registered: RegisterResponse = Self::check(resp).await?.json().await?;
        Ok(registered.registered_ip)
    }

    /// POST /discovery/unregister
    pub async fn unregister(&self, room_id: &str, peer_id: &str) -> Result<bool, DiscoveryError> {
        let resp = self
            .http
            .post(format!("{}/discovery/unregister", self.base_url))
            .json(&RegisterRequest {
                room_id: room_id.to_string(),
                peer_id: peer_id.to_string(),
            })
            .send()
            .await?;
        let result: SuccessResponse = Self::check(resp).await?.json().await?;
        Ok(result.success)
    }

    /// GET /discovery/peers, excluding `peer_id`.
    pub async fn list_peers(
        &self,
        room_id: &str,
        peer_id: &str,
    ) -> Result<Vec<PeerEntry>, DiscoveryError> {
        let resp = self
            .http
            .get(format!("{}/discovery/peers", self.base_url))
            .query(&[("roomId", room_id), ("peerId", peer_id)])
            .send()
            .await?;
        let peers: PeersResponse = Self::check(resp).await?.json().await?;
        Ok(peers.peers)
    }
}
