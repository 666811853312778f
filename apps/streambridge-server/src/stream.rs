use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpStream as StdTcpStream};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, BufReader, ReadBuf};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;

/// Keepalive period on accepted provider sockets, so the OS notices dead
/// peers even before the health monitor does.
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

/// The provider side of an established stream session.
///
/// Wraps the handshake's `BufReader` so any file bytes the provider sent
/// right behind its hello line are not lost, and carries a duplicated
/// socket handle ([`StreamWatch`]) that stays with the registry: the watch
/// can probe and close the connection while the reader half is owned by an
/// in-flight download.
#[derive(Debug)]
pub struct ProviderStream {
    io: BufReader<OwnedReadHalf>,
    peer: SocketAddr,
}

impl ProviderStream {
    pub fn new(io: BufReader<OwnedReadHalf>, peer: SocketAddr) -> Self {
        Self { io, peer }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl AsyncRead for ProviderStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

/// Duplicated handle onto a provider socket. The underlying fd is shared
/// with the [`ProviderStream`], so `close` tears the connection down for
/// both and `probe` observes the same kernel state.
#[derive(Clone)]
pub struct StreamWatch {
    inner: Arc<StdTcpStream>,
}

impl StreamWatch {
    pub fn new(stream: StdTcpStream) -> Self {
        Self {
            inner: Arc::new(stream),
        }
    }

    /// Non-destructive liveness probe. Never consumes stream bytes.
    pub fn probe_alive(&self) -> bool {
        probe_alive(&self.inner)
    }

    /// Close both directions. Unblocks any pending read on the shared fd.
    pub fn close(&self) {
        let _ = self.inner.shutdown(Shutdown::Both);
    }
}

/// Enable TCP keepalive on an accepted connection.
pub fn enable_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// One-byte non-blocking peek, backed up by a kernel TCP-state check where
/// the platform offers one. The socket is in non-blocking mode (it is the
/// fd tokio accepted), so an idle healthy peer reads as `WouldBlock`.
fn probe_alive(stream: &StdTcpStream) -> bool {
    let mut buf = [0u8; 1];
    match stream.peek(&mut buf) {
        // Orderly FIN from the peer with nothing buffered.
        Ok(0) => false,
        Ok(_) => tcp_state_established(stream).unwrap_or(true),
        Err(err) if err.kind() == ErrorKind::WouldBlock => {
            tcp_state_established(stream).unwrap_or(true)
        }
        Err(_) => false,
    }
}

/// `Some(true)` iff the kernel reports the socket as ESTABLISHED. `None`
/// where the platform offers no per-socket state introspection.
#[cfg(target_os = "linux")]
fn tcp_state_established(stream: &StdTcpStream) -> Option<bool> {
    use std::os::fd::AsRawFd;

    const TCP_STATE_ESTABLISHED: u8 = 1;

    let fd = stream.as_raw_fd();
    let mut info: libc::tcp_info = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::tcp_info>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_INFO,
            &mut info as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return None;
    }
    Some(info.tcpi_state == TCP_STATE_ESTABLISHED)
}

#[cfg(not(target_os = "linux"))]
fn tcp_state_established(_stream: &StdTcpStream) -> Option<bool> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;

    fn connected_pair() -> (StdTcpStream, StdTcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = StdTcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn probe_reports_idle_peer_alive() {
        let (client, server) = connected_pair();
        server.set_nonblocking(true).unwrap();
        let watch = StreamWatch::new(server);
        assert!(watch.probe_alive());
        drop(client);
    }

    #[test]
    fn probe_reports_closed_peer_dead() {
        let (client, server) = connected_pair();
        server.set_nonblocking(true).unwrap();
        drop(client);
        // Give the FIN a moment to land.
        std::thread::sleep(Duration::from_millis(50));
        let watch = StreamWatch::new(server);
        assert!(!watch.probe_alive());
    }

    #[test]
    fn probe_does_not_consume_pending_bytes() {
        let (mut client, server) = connected_pair();
        server.set_nonblocking(true).unwrap();
        client.write_all(b"payload").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let watch = StreamWatch::new(server.try_clone().unwrap());
        assert!(watch.probe_alive());
        assert!(watch.probe_alive());

        let mut buf = [0u8; 7];
        server.set_nonblocking(false).unwrap();
        use std::io::Read;
        let mut reader = server;
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn close_unblocks_the_shared_fd() {
        let (client, server) = connected_pair();
        server.set_nonblocking(true).unwrap();
        let watch = StreamWatch::new(server.try_clone().unwrap());
        watch.close();
        let mut buf = [0u8; 1];
        use std::io::Read;
        let mut reader = server;
        // A shut-down socket reads as EOF rather than blocking forever.
        assert_eq!(reader.read(&mut buf).unwrap_or(0), 0);
        drop(client);
    }
}
