//! Wire and API types shared by the streambridge server, the provider
//! client, and the end-to-end tests.
//!
//! The provider-side stream protocol is a single newline-terminated JSON
//! object ([`StreamHello`]) answered by exactly one reply line
//! ([`STREAM_READY`] or [`INVALID_CONNECTION`]); after a ready reply the
//! socket carries raw file bytes until the provider closes its write side.

use serde::{Deserialize, Serialize};

/// Reply line sent when a provider handshake is accepted.
pub const STREAM_READY: &str = "STREAM_READY";

/// Reply line sent when a provider handshake is rejected; the connection is
/// closed immediately afterwards.
pub const INVALID_CONNECTION: &str = "INVALID_CONNECTION";

/// First (and only) line a provider sends on a new stream connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamHello {
    pub auth_token: String,
    /// Informational only; the bridge ignores it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// Body of `POST /register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub filename: String,
    pub size: u64,
}

/// TCP endpoint the provider should connect its stream to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpEndpoint {
    pub host: String,
    pub port: u16,
}

/// Successful response of `POST /register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub auth_token: String,
    pub tcp_endpoint: TcpEndpoint,
    pub download_url: String,
    /// RFC 3339.
    pub expires_at: String,
    pub original_filename: String,
}

/// Lifecycle of a registered file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Registered,
    Streaming,
    Completed,
    Evicted,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Registered => "registered",
            SessionState::Streaming => "streaming",
            SessionState::Completed => "completed",
            SessionState::Evicted => "evicted",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response of `GET /status/{token}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub filename: String,
    pub size: u64,
    pub status: SessionState,
    /// Address the registration call came from.
    pub client_ip: String,
    /// RFC 3339.
    pub registered_at: String,
    /// RFC 3339.
    pub expires_at: String,
    pub download_completed: bool,
    /// RFC 3339; present once the provider stream is attached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_started: Option<String>,
    /// Remote address of the provider stream connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_peer: Option<String>,
}

/// Response of `GET /stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub status: String,
    /// Seconds since process start.
    pub uptime: f64,
    pub files_registered: u64,
    pub files_transferred: u64,
    pub bytes_transferred: u64,
    pub active_connections: u64,
    pub peak_connections: u64,
    pub registered_files: u64,
    pub active_streams: u64,
    pub completed_downloads: u64,
}

/// Response of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    /// RFC 3339.
    pub timestamp: String,
    pub version: String,
}
