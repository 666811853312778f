use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::Notify;

use streambridge_protocol::{SessionState, StatusSnapshot};

use crate::stream::{ProviderStream, StreamWatch};

/// Per-file record owned by the registry.
///
/// The provider stream is present iff the session is `streaming` and no
/// consumer has claimed it yet; the watch handle stays behind after a claim
/// so eviction can still close the socket out from under the splice.
pub struct Session {
    pub token: String,
    pub filename: String,
    pub size: u64,
    pub state: SessionState,
    /// Address the registration call came from.
    pub client_ip: String,
    pub registered_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub stream_started: Option<DateTime<Utc>>,
    pub provider_peer: Option<String>,
    pub consumer_peer: Option<String>,
    pub download_done: bool,
    pub stream: Option<ProviderStream>,
    pub watch: Option<StreamWatch>,
    /// Fired by the acceptor when the stream attaches; awaited by a
    /// consumer that arrived first.
    pub ready: Arc<Notify>,
}

impl Session {
    pub fn new(
        token: String,
        filename: String,
        size: u64,
        client_ip: String,
        ttl: std::time::Duration,
    ) -> Self {
        let registered_at = Utc::now();
        let expires_at = registered_at
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            token,
            filename,
            size,
            state: SessionState::Registered,
            client_ip,
            registered_at,
            expires_at,
            stream_started: None,
            provider_peer: None,
            consumer_peer: None,
            download_done: false,
            stream: None,
            watch: None,
            ready: Arc::new(Notify::new()),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// A consumer has taken the stream and the splice is running.
    pub fn download_in_flight(&self) -> bool {
        self.state == SessionState::Streaming && self.stream.is_none()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            filename: self.filename.clone(),
            size: self.size,
            status: self.state,
            client_ip: self.client_ip.clone(),
            registered_at: rfc3339(self.registered_at),
            expires_at: rfc3339(self.expires_at),
            download_completed: self.download_done,
            stream_started: self.stream_started.map(rfc3339),
            provider_peer: self.provider_peer.clone(),
        }
    }
}

pub fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}
