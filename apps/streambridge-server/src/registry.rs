use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand_core::TryRngCore;
use tracing::{debug, info, warn};

use streambridge_protocol::{SessionState, StatusSnapshot};

use crate::session::Session;
use crate::stats::ServerStats;
use crate::stream::{ProviderStream, StreamWatch};

const TOKEN_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const TOKEN_LEN_MIN: usize = 6;
const TOKEN_LEN_MAX: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("filename is required")]
    EmptyFilename,
    #[error("declared size {size} exceeds the {limit}-byte limit")]
    Oversize { size: u64, limit: u64 },
    #[error("token minting failed: {0}")]
    TokenMint(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AttachError {
    #[error("unknown token")]
    UnknownToken,
    #[error("session is {0}, not registered")]
    WrongState(SessionState),
    #[error("session expired")]
    Expired,
    #[error("download already completed")]
    AlreadyCompleted,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DownloadError {
    #[error("unknown token")]
    UnknownToken,
    #[error("download already completed")]
    AlreadyCompleted,
    #[error("another consumer holds this stream")]
    InFlight,
    #[error("session is {0}, not downloadable")]
    WrongState(SessionState),
    #[error("provider stream not established")]
    NotReady,
}

/// Token -> [`Session`] map; the source of truth for session lifecycle.
///
/// One reader/writer lock guards all mutation. Critical sections are short
/// and perform no I/O; the provider stream and the HTTP response body are
/// only ever touched outside the lock.
pub struct Registry {
    sessions: RwLock<HashMap<String, Session>>,
    stats: Arc<ServerStats>,
    token_len: usize,
    max_file_size: u64,
    ttl: Duration,
}

impl Registry {
    pub fn new(stats: Arc<ServerStats>, token_len: usize, max_file_size: u64, ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            stats,
            token_len,
            max_file_size,
            ttl,
        }
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Mint a token and insert a fresh `registered` session.
    pub fn register(
        &self,
        filename: &str,
        size: u64,
        client_ip: String,
    ) -> Result<(String, DateTime<Utc>), RegisterError> {
        if filename.is_empty() {
            return Err(RegisterError::EmptyFilename);
        }
        if size > self.max_file_size {
            return Err(RegisterError::Oversize {
                size,
                limit: self.max_file_size,
            });
        }

        // Mint outside the lock (the RNG is a syscall); on the vanishingly
        // unlikely collision, drop the lock and remint.
        let (token, expires_at) = loop {
            let candidate = mint_token(self.token_len)
                .map_err(|err| RegisterError::TokenMint(err.to_string()))?;
            let mut sessions = self.sessions.write();
            if sessions.contains_key(&candidate) {
                continue;
            }
            let session = Session::new(
                candidate.clone(),
                filename.to_string(),
                size,
                client_ip.clone(),
                self.ttl,
            );
            let expires_at = session.expires_at;
            sessions.insert(candidate.clone(), session);
            break (candidate, expires_at);
        };

        self.stats.record_registration();
        info!(target: "sb::registry", token = %token, filename = %filename, size, "file registered");
        Ok((token, expires_at))
    }

    /// Install a handshaked provider stream into its session.
    ///
    /// Check and transition happen under one write lock, so two provider
    /// connections for the same token can never both pass validation.
    pub fn attach_stream(
        &self,
        token: &str,
        stream: ProviderStream,
        watch: StreamWatch,
    ) -> Result<StatusSnapshot, AttachError> {
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(token).ok_or(AttachError::UnknownToken)?;
        if session.download_done || session.state == SessionState::Completed {
            return Err(AttachError::AlreadyCompleted);
        }
        if session.state != SessionState::Registered {
            return Err(AttachError::WrongState(session.state));
        }
        if session.is_expired(Utc::now()) {
            return Err(AttachError::Expired);
        }

        session.state = SessionState::Streaming;
        session.stream_started = Some(Utc::now());
        session.provider_peer = Some(stream.peer().to_string());
        session.stream = Some(stream);
        session.watch = Some(watch);
        session.ready.notify_waiters();
        Ok(session.snapshot())
    }

    /// Take exclusive ownership of the provider stream for a download,
    /// waiting up to `max_wait` for the acceptor to attach it.
    ///
    /// The first consumer wins; an overlapping request observes `InFlight`.
    pub async fn wait_and_claim(
        &self,
        token: &str,
        consumer_peer: &str,
        max_wait: Duration,
    ) -> Result<(StatusSnapshot, ProviderStream), DownloadError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let ready = {
                let mut sessions = self.sessions.write();
                let session = sessions.get_mut(token).ok_or(DownloadError::UnknownToken)?;
                if session.download_done || session.state == SessionState::Completed {
                    return Err(DownloadError::AlreadyCompleted);
                }
                if session.download_in_flight() {
                    return Err(DownloadError::InFlight);
                }
                if !matches!(
                    session.state,
                    SessionState::Registered | SessionState::Streaming
                ) {
                    return Err(DownloadError::WrongState(session.state));
                }
                if let Some(stream) = session.stream.take() {
                    session.consumer_peer = Some(consumer_peer.to_string());
                    return Ok((session.snapshot(), stream));
                }
                session.ready.clone()
            };

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(DownloadError::NotReady);
            }
            // A notification landing between the lock release and this await
            // is lost, so never sleep more than 500 ms before re-checking.
            let slice = deadline.min(now + Duration::from_millis(500));
            let _ = tokio::time::timeout_at(slice, ready.notified()).await;
        }
    }

    /// Flip a session to `completed` and record the transfer. No-op when
    /// the session is already completed or gone.
    pub fn mark_completed(&self, token: &str) {
        let mut sessions = self.sessions.write();
        if let Some(session) = sessions.get_mut(token) {
            if session.state != SessionState::Completed {
                session.state = SessionState::Completed;
                session.download_done = true;
                self.stats.record_transfer();
                self.stats.record_completed();
            }
        }
    }

    /// Remove a session and close its stream socket. Idempotent.
    pub fn evict(&self, token: &str) -> bool {
        let removed = self.sessions.write().remove(token);
        match removed {
            Some(session) => {
                if let Some(watch) = &session.watch {
                    watch.close();
                    // The provider connection gauge was handed over to the
                    // session when the stream attached.
                    self.stats.connection_closed();
                }
                // Wake any consumer still parked on the rendezvous signal so
                // it observes the missing entry promptly.
                session.ready.notify_waiters();
                debug!(target: "sb::registry", token = %token, state = %session.state, "session evicted");
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self, token: &str) -> Option<StatusSnapshot> {
        self.sessions.read().get(token).map(Session::snapshot)
    }

    /// Tokens whose deadline has passed. Enumerated under the read lock;
    /// the caller evicts each one under per-token write locks.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<String> {
        self.sessions
            .read()
            .values()
            .filter(|session| session.is_expired(now))
            .map(|session| session.token.clone())
            .collect()
    }

    /// (registered sessions, sessions in `streaming`).
    pub fn counts(&self) -> (u64, u64) {
        let sessions = self.sessions.read();
        let streaming = sessions
            .values()
            .filter(|session| session.state == SessionState::Streaming)
            .count() as u64;
        (sessions.len() as u64, streaming)
    }

    /// Evict every session. Used by shutdown.
    pub fn evict_all(&self) {
        let tokens: Vec<String> = self.sessions.read().keys().cloned().collect();
        if !tokens.is_empty() {
            warn!(target: "sb::registry", count = tokens.len(), "evicting all sessions");
        }
        for token in tokens {
            self.evict(&token);
        }
    }
}

/// Unguessable token: `len` chars drawn uniformly from `[A-Za-z0-9]` when
/// `len` is within 6..=32, otherwise a canonical hyphenated UUID.
fn mint_token(len: usize) -> Result<String, rand_core::OsError> {
    if !(TOKEN_LEN_MIN..=TOKEN_LEN_MAX).contains(&len) {
        return Ok(uuid::Uuid::new_v4().to_string());
    }

    // Rejection sampling keeps the 62-way choice unbiased: accept only
    // bytes below the largest multiple of 62 that fits in a byte.
    const LIMIT: u8 = (u8::MAX / 62) * 62;
    let mut rng = OsRng;
    let mut out = String::with_capacity(len);
    let mut buf = [0u8; 64];
    while out.len() < len {
        rng.try_fill_bytes(&mut buf)?;
        for byte in buf {
            if byte < LIMIT {
                out.push(TOKEN_CHARSET[(byte % 62) as usize] as char);
                if out.len() == len {
                    break;
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;
    use tokio::net::{TcpListener, TcpStream};

    fn registry() -> Registry {
        registry_with_ttl(Duration::from_secs(7200))
    }

    fn registry_with_ttl(ttl: Duration) -> Registry {
        Registry::new(Arc::new(ServerStats::default()), 8, 100 * 1024 * 1024, ttl)
    }

    async fn provider_pair() -> (ProviderStream, StreamWatch, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        let std_stream = server.into_std().unwrap();
        let watch = StreamWatch::new(std_stream.try_clone().unwrap());
        let server = TcpStream::from_std(std_stream).unwrap();
        let (read_half, write_half) = server.into_split();
        write_half.forget();
        (
            ProviderStream::new(BufReader::new(read_half), peer),
            watch,
            client,
        )
    }

    #[test]
    fn tokens_have_requested_length_and_charset() {
        for len in [6usize, 8, 32] {
            let token = mint_token(len).unwrap();
            assert_eq!(token.len(), len);
            assert!(token.bytes().all(|b| TOKEN_CHARSET.contains(&b)));
        }
    }

    #[test]
    fn out_of_range_length_falls_back_to_uuid() {
        for len in [0usize, 5, 33, 128] {
            let token = mint_token(len).unwrap();
            assert_eq!(token.len(), 36);
            assert_eq!(token.matches('-').count(), 4);
        }
    }

    #[test]
    fn register_validates_input() {
        let reg = registry();
        assert!(matches!(
            reg.register("", 10, "c".into()),
            Err(RegisterError::EmptyFilename)
        ));
        assert!(matches!(
            reg.register("big.bin", u64::MAX, "c".into()),
            Err(RegisterError::Oversize { .. })
        ));
        let (token, expires_at) = reg.register("a.txt", 11, "c".into()).unwrap();
        assert!(!token.is_empty());
        assert!(expires_at > Utc::now());
    }

    #[test]
    fn registered_tokens_are_distinct() {
        let reg = registry();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..50 {
            let (token, _) = reg.register("a.txt", 1, "c".into()).unwrap();
            assert!(seen.insert(token));
        }
        assert_eq!(reg.counts().0, 50);
    }

    #[tokio::test]
    async fn attach_requires_a_registered_session() {
        let reg = registry();
        let (stream, watch, _client) = provider_pair().await;
        assert_eq!(
            reg.attach_stream("missing", stream, watch).unwrap_err(),
            AttachError::UnknownToken
        );
    }

    #[tokio::test]
    async fn attach_transitions_to_streaming_exactly_once() {
        let reg = registry();
        let (token, _) = reg.register("a.txt", 11, "c".into()).unwrap();

        let (stream, watch, _c1) = provider_pair().await;
        let snap = reg.attach_stream(&token, stream, watch).unwrap();
        assert_eq!(snap.status, SessionState::Streaming);
        assert!(snap.stream_started.is_some());
        assert!(snap.provider_peer.is_some());

        // A second provider connection for the same token must fail.
        let (stream2, watch2, _c2) = provider_pair().await;
        assert_eq!(
            reg.attach_stream(&token, stream2, watch2).unwrap_err(),
            AttachError::WrongState(SessionState::Streaming)
        );
    }

    #[tokio::test]
    async fn attach_rejects_expired_sessions() {
        let reg = registry_with_ttl(Duration::ZERO);
        let (token, _) = reg.register("a.txt", 11, "c".into()).unwrap();
        let (stream, watch, _client) = provider_pair().await;
        assert_eq!(
            reg.attach_stream(&token, stream, watch).unwrap_err(),
            AttachError::Expired
        );
    }

    #[tokio::test]
    async fn claim_hands_the_stream_to_the_first_consumer_only() {
        let reg = registry();
        let (token, _) = reg.register("a.txt", 11, "c".into()).unwrap();
        let (stream, watch, _client) = provider_pair().await;
        reg.attach_stream(&token, stream, watch).unwrap();

        let (snap, _stream) = reg
            .wait_and_claim(&token, "consumer", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(snap.status, SessionState::Streaming);

        let second = reg
            .wait_and_claim(&token, "other", Duration::from_millis(50))
            .await;
        assert_eq!(second.unwrap_err(), DownloadError::InFlight);
    }

    #[tokio::test]
    async fn claim_waits_for_a_late_provider() {
        let reg = Arc::new(registry());
        let (token, _) = reg.register("a.txt", 11, "c".into()).unwrap();

        let waiter = {
            let reg = reg.clone();
            let token = token.clone();
            tokio::spawn(async move {
                reg.wait_and_claim(&token, "consumer", Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        let (stream, watch, _client) = provider_pair().await;
        reg.attach_stream(&token, stream, watch).unwrap();

        let claimed = waiter.await.unwrap();
        assert!(claimed.is_ok());
    }

    #[tokio::test]
    async fn claim_times_out_when_no_provider_shows_up() {
        let reg = registry();
        let (token, _) = reg.register("a.txt", 11, "c".into()).unwrap();
        let result = reg
            .wait_and_claim(&token, "consumer", Duration::from_millis(120))
            .await;
        assert_eq!(result.unwrap_err(), DownloadError::NotReady);
    }

    #[tokio::test]
    async fn completed_sessions_reject_further_work() {
        let reg = registry();
        let (token, _) = reg.register("a.txt", 11, "c".into()).unwrap();
        let (stream, watch, _client) = provider_pair().await;
        reg.attach_stream(&token, stream, watch).unwrap();
        let _ = reg
            .wait_and_claim(&token, "consumer", Duration::from_secs(1))
            .await
            .unwrap();

        reg.mark_completed(&token);
        let result = reg
            .wait_and_claim(&token, "late", Duration::from_millis(50))
            .await;
        assert_eq!(result.unwrap_err(), DownloadError::AlreadyCompleted);

        // Completed never goes back to any other state.
        assert_eq!(
            reg.snapshot(&token).unwrap().status,
            SessionState::Completed
        );
    }

    #[test]
    fn evict_is_idempotent() {
        let reg = registry();
        let (token, _) = reg.register("a.txt", 11, "c".into()).unwrap();
        assert!(reg.evict(&token));
        assert!(!reg.evict(&token));
        assert!(reg.snapshot(&token).is_none());
    }

    #[test]
    fn sweep_reports_only_expired_sessions() {
        let reg = registry_with_ttl(Duration::ZERO);
        let (expired, _) = reg.register("old.txt", 1, "c".into()).unwrap();
        let fresh_reg = registry();
        let (_fresh, _) = fresh_reg.register("new.txt", 1, "c".into()).unwrap();

        let swept = reg.sweep_expired(Utc::now());
        assert_eq!(swept, vec![expired]);
        assert!(fresh_reg.sweep_expired(Utc::now()).is_empty());
    }

    #[tokio::test]
    async fn mark_completed_counts_each_transfer_once() {
        let reg = registry();
        let (token, _) = reg.register("a.txt", 11, "c".into()).unwrap();
        let (stream, watch, _client) = provider_pair().await;
        reg.attach_stream(&token, stream, watch).unwrap();
        reg.mark_completed(&token);
        reg.mark_completed(&token);
        let snap = reg.stats().snapshot(1, 0);
        assert_eq!(snap.files_transferred, 1);
        assert_eq!(snap.completed_downloads, 1);
    }
}
