use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::registry::DownloadError;
use crate::responses;

/// How long a consumer waits for the provider stream to attach.
pub const STREAM_WAIT: Duration = Duration::from_secs(10);

/// Per-read deadline during the splice. A timeout is not fatal; the
/// deadline is re-armed and the read retried.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const CHUNK_SIZE: usize = 256 * 1024;

/// Local byte counts are folded into the global counter at this granularity
/// to keep the hot loop off the shared counter.
const STATS_FOLD_BYTES: u64 = 10 * 1024 * 1024;

/// `GET /download/{token}`.
pub async fn download(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(token): Path<String>,
) -> Response {
    serve(state, token, peer).await
}

/// `GET /download/{token}/{filename}`; the trailing name is cosmetic, for
/// user-agent save-as.
pub async fn download_named(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path((token, _filename)): Path<(String, String)>,
) -> Response {
    serve(state, token, peer).await
}

async fn serve(state: AppState, token: String, peer: SocketAddr) -> Response {
    let claimed = state
        .registry()
        .wait_and_claim(&token, &peer.to_string(), STREAM_WAIT)
        .await;
    let (snapshot, stream) = match claimed {
        Ok(claimed) => claimed,
        Err(
            DownloadError::UnknownToken
            | DownloadError::AlreadyCompleted
            | DownloadError::InFlight,
        ) => {
            return responses::not_found("file not found or already downloaded");
        }
        Err(DownloadError::WrongState(state_seen)) => {
            // Single-chance rendezvous: a session that cannot serve this
            // request is released rather than left for a retry.
            state.registry().evict(&token);
            return responses::service_unavailable(&format!(
                "file not ready for download (state: {state_seen})"
            ));
        }
        Err(DownloadError::NotReady) => {
            warn!(target: "sb::http", token = %token, "source unavailable, stream never attached");
            state.registry().evict(&token);
            return responses::service_unavailable("source unavailable");
        }
    };

    info!(
        target: "sb::http",
        token = %token,
        filename = %snapshot.filename,
        consumer = %peer,
        "download started"
    );

    let safe_name = sanitize_filename(&snapshot.filename);
    let body = Body::from_stream(splice(state, token.clone(), snapshot.filename.clone(), stream));
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{safe_name}\""),
        )
        .header("X-Streambridge-Token", token)
        .header("X-Streambridge-Filename", safe_name);
    if snapshot.size > 0 {
        builder = builder.header(header::CONTENT_LENGTH, snapshot.size.to_string());
    }
    builder.body(body).unwrap()
}

/// Forward provider bytes into the response body until EOF, a non-timeout
/// read error, shutdown, or a consumer disconnect (which drops the stream).
/// Terminal bookkeeping lives in [`SpliceGuard::drop`] so every exit path,
/// including the drop, marks the session completed and evicts it.
fn splice(
    state: AppState,
    token: String,
    filename: String,
    mut stream: crate::stream::ProviderStream,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
    async_stream::stream! {
        let cancel = state.shutdown().clone();
        let mut guard = SpliceGuard::new(state, token, filename);
        let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
        loop {
            if cancel.is_cancelled() {
                info!(target: "sb::http", token = %guard.token, "shutdown, splice ending");
                break;
            }
            buf.reserve(CHUNK_SIZE);
            match tokio::time::timeout(READ_TIMEOUT, stream.read_buf(&mut buf)).await {
                Err(_) => {
                    warn!(target: "sb::http", token = %guard.token, "read deadline passed, re-arming");
                    continue;
                }
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    guard.add(n as u64);
                    yield Ok(buf.split().freeze());
                }
                Ok(Err(err)) => {
                    warn!(target: "sb::http", token = %guard.token, error = %err, "stream read failed");
                    break;
                }
            }
        }
    }
}

struct SpliceGuard {
    state: AppState,
    token: String,
    filename: String,
    total: u64,
    pending: u64,
    started: Instant,
}

impl SpliceGuard {
    fn new(state: AppState, token: String, filename: String) -> Self {
        Self {
            state,
            token,
            filename,
            total: 0,
            pending: 0,
            started: Instant::now(),
        }
    }

    fn add(&mut self, n: u64) {
        self.total += n;
        self.pending += n;
        if self.pending >= STATS_FOLD_BYTES {
            self.state.stats().add_bytes(self.pending);
            self.pending = 0;
        }
    }
}

impl Drop for SpliceGuard {
    fn drop(&mut self) {
        self.state.stats().add_bytes(self.pending);
        self.state.registry().mark_completed(&self.token);
        self.state.registry().evict(&self.token);

        let secs = self.started.elapsed().as_secs_f64();
        let mib = self.total as f64 / (1024.0 * 1024.0);
        let rate = if secs > 0.0 { mib / secs } else { 0.0 };
        info!(
            target: "sb::http",
            token = %self.token,
            filename = %self.filename,
            bytes = self.total,
            secs,
            mib_per_s = rate,
            "transfer finished, session released"
        );
    }
}

/// Keep `Content-Disposition` parseable whatever the provider declared:
/// quotes, backslashes and control bytes are stripped.
fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !c.is_control() && *c != '"' && *c != '\\')
        .collect();
    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_passes_ordinary_names() {
        assert_eq!(sanitize_filename("report-2026.pdf"), "report-2026.pdf");
        assert_eq!(sanitize_filename("my file.txt"), "my file.txt");
    }

    #[test]
    fn sanitize_strips_header_breaking_characters() {
        assert_eq!(sanitize_filename("a\"b.txt"), "ab.txt");
        assert_eq!(sanitize_filename("a\\b.txt"), "ab.txt");
        assert_eq!(sanitize_filename("a\r\nX-Injected: 1"), "aX-Injected: 1");
    }

    #[test]
    fn sanitize_never_returns_empty() {
        assert_eq!(sanitize_filename("\"\""), "download");
        assert_eq!(sanitize_filename(""), "download");
    }
}
