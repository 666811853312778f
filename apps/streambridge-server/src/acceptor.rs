use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use streambridge_protocol::{StreamHello, INVALID_CONNECTION, STREAM_READY};

use crate::app_state::AppState;
use crate::health;
use crate::stream::{self, ProviderStream, StreamWatch};
use crate::tasks::TaskHandle;

/// Deadline for the single handshake line. Once the stream is attached the
/// deadline is lifted; liveness is the health monitor's job.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Run the provider-side accept loop until shutdown.
pub fn start(state: AppState, listener: TcpListener) -> TaskHandle {
    let handle = tokio::spawn(accept_loop(state, listener));
    TaskHandle::new("stream.acceptor", handle)
}

async fn accept_loop(state: AppState, listener: TcpListener) {
    let cancel = state.shutdown().clone();
    if let Ok(addr) = listener.local_addr() {
        info!(target: "sb::stream", %addr, "stream acceptor listening");
    }
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(target: "sb::stream", "stream acceptor stopping");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((conn, peer)) => {
                    let state = state.clone();
                    tokio::spawn(async move { handle_connection(state, conn, peer).await });
                }
                Err(err) => {
                    warn!(target: "sb::stream", error = %err, "accept failed");
                }
            }
        }
    }
}

async fn handle_connection(state: AppState, conn: TcpStream, peer: SocketAddr) {
    let active = state.stats().connection_opened();
    debug!(target: "sb::stream", %peer, active, "provider connection accepted");

    match establish(&state, conn, peer).await {
        Ok(token) => {
            // The connection now belongs to the session; eviction closes the
            // socket and releases the connection gauge.
            debug!(target: "sb::stream", %peer, token = %token, "handshake complete");
        }
        Err(reason) => {
            state.stats().connection_closed();
            debug!(target: "sb::stream", %peer, %reason, "provider connection released");
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum HandshakeFailure {
    #[error("socket setup failed: {0}")]
    Socket(#[from] std::io::Error),
    #[error("handshake deadline exceeded")]
    Deadline,
    #[error("connection closed before handshake")]
    Eof,
    #[error("malformed handshake line")]
    Malformed,
    #[error("rejected: {0}")]
    Rejected(crate::registry::AttachError),
}

/// Read the hello line, attach the stream, reply.
///
/// On success the read half (with any bytes buffered behind the hello
/// line) is owned by the session and the write half is forgotten without a
/// shutdown; the bridge never sends another byte on this socket after the
/// ready line.
async fn establish(
    state: &AppState,
    conn: TcpStream,
    peer: SocketAddr,
) -> Result<String, HandshakeFailure> {
    if let Err(err) = stream::enable_keepalive(&conn) {
        debug!(target: "sb::stream", %peer, error = %err, "keepalive setup failed");
    }

    let std_conn = conn.into_std()?;
    let watch = StreamWatch::new(std_conn.try_clone()?);
    let conn = TcpStream::from_std(std_conn)?;
    let (read_half, mut write_half) = conn.into_split();
    let mut reader = BufReader::new(read_half);

    let mut line = String::new();
    let hello = match tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.read_line(&mut line)).await {
        Err(_) => Err(HandshakeFailure::Deadline),
        Ok(Err(err)) => {
            warn!(target: "sb::stream", %peer, error = %err, "handshake read failed");
            Err(HandshakeFailure::Eof)
        }
        Ok(Ok(0)) => Err(HandshakeFailure::Eof),
        Ok(Ok(_)) => serde_json::from_str::<StreamHello>(line.trim())
            .map_err(|_| HandshakeFailure::Malformed),
    };
    let hello = match hello {
        Ok(hello) => hello,
        Err(failure) => {
            let _ = write_half
                .write_all(format!("{INVALID_CONNECTION}\n").as_bytes())
                .await;
            return Err(failure);
        }
    };

    let provider = ProviderStream::new(reader, peer);
    let token = hello.auth_token;
    match state.registry().attach_stream(&token, provider, watch.clone()) {
        Ok(snapshot) => {
            if let Err(err) = write_half
                .write_all(format!("{STREAM_READY}\n").as_bytes())
                .await
            {
                // The peer vanished between attach and reply; the monitor or
                // the splice will observe the dead socket.
                warn!(target: "sb::stream", %peer, error = %err, "ready reply failed");
            }
            write_half.forget();
            info!(
                target: "sb::stream",
                token = %token,
                filename = %snapshot.filename,
                %peer,
                "stream tunnel established"
            );
            health::spawn_monitor(state.clone(), token.clone(), watch);
            Ok(token)
        }
        Err(err) => {
            warn!(target: "sb::stream", token = %token, %peer, error = %err, "invalid connection attempt");
            let _ = write_half
                .write_all(format!("{INVALID_CONNECTION}\n").as_bytes())
                .await;
            Err(HandshakeFailure::Rejected(err))
        }
    }
}
