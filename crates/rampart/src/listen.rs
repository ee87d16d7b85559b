//! Listener resolution and connection acceptance.
//!
//! Turns an address descriptor — `host:port`, `systemd:<name>`, or
//! `unix:<path>` — into a ready-to-accept [`Listener`], optionally capped
//! by a [`ConnectionLimit`]. Accepted [`Stream`]s carry their admission
//! permit and have TCP keep-alive enabled.

use std::fmt;
use std::io;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::activation::ActivatedSockets;
use crate::limit::{ConnectionLimit, ConnectionPermit};

/// Parsed shape of an address descriptor.
///
/// Exactly one shape applies to any descriptor: recognised prefixes are
/// matched literally, everything else is a TCP `host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// `host:port` — bind a new TCP listener.
    Tcp(String),
    /// `systemd:<name>` — look up an externally-provisioned socket by name.
    Systemd(String),
    /// `unix:<path>` — bind a unix-domain listener at the path.
    #[cfg(unix)]
    Unix(PathBuf),
}

impl Address {
    /// Parse a descriptor into its shape.
    pub fn parse(descriptor: &str) -> Self {
        if let Some(name) = descriptor.strip_prefix("systemd:") {
            return Address::Systemd(name.to_owned());
        }
        #[cfg(unix)]
        if let Some(path) = descriptor.strip_prefix("unix:") {
            return Address::Unix(PathBuf::from(path));
        }
        Address::Tcp(descriptor.to_owned())
    }
}

/// Errors from listener resolution.
#[derive(Debug, Error)]
pub enum ListenError {
    /// The named externally-provisioned socket does not exist. The message
    /// format is relied upon by collaborators; do not change it.
    #[error("listen systemd {0}: socket not found")]
    SocketNotFound(String),

    /// TCP or unix bind failure, surfaced unchanged from the OS layer.
    #[error(transparent)]
    Bind(#[from] io::Error),
}

/// Errors from [`Listener::accept`].
#[derive(Debug, Error)]
pub enum AcceptError {
    /// The listener has been closed; no further connections will be
    /// accepted. Stable across repeated calls.
    #[error("listener closed")]
    Closed,

    /// An I/O error while accepting a single connection.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Keep-alive probe idle time for accepted TCP connections.
const TCP_KEEP_ALIVE_IDLE: Duration = Duration::from_secs(15);

/// Enable keep-alive and disable Nagle on an accepted TCP stream.
fn harden_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let keepalive = TcpKeepalive::new().with_time(TCP_KEEP_ALIVE_IDLE);
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        debug!(error = %e, "failed to enable TCP keep-alive");
    }
}

/// An open, acceptable socket, optionally admission-limited.
///
/// Owned by the serve loop; the socket is released when the listener is
/// dropped. [`close`](Self::close) stops acceptance promptly without
/// waiting for in-flight connections.
#[derive(Debug)]
pub struct Listener {
    kind: ListenerKind,
    limit: Option<ConnectionLimit>,
    closed: CancellationToken,
}

#[derive(Debug)]
enum ListenerKind {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Listener {
    /// Resolve `address` into a ready-to-accept listener.
    ///
    /// `systemd:` names are looked up in `sockets` (first-registered wins);
    /// TCP descriptors are bound fresh; `unix:` paths get a unix-domain
    /// listener. A `max_connections` above zero attaches an admission
    /// limiter; zero means unlimited, with no limiter overhead.
    ///
    /// # Errors
    ///
    /// [`ListenError::SocketNotFound`] when a named socket is absent;
    /// [`ListenError::Bind`] for OS-level failures, passed through
    /// unchanged.
    pub async fn resolve(
        address: &Address,
        sockets: &mut ActivatedSockets,
        max_connections: usize,
    ) -> Result<Self, ListenError> {
        let kind = match address {
            Address::Systemd(name) => {
                let std_listener = sockets
                    .take(name)
                    .ok_or_else(|| ListenError::SocketNotFound(name.clone()))?;
                std_listener.set_nonblocking(true)?;
                ListenerKind::Tcp(TcpListener::from_std(std_listener)?)
            }
            Address::Tcp(descriptor) => {
                let (host, port) = tcp_bind_target(descriptor)?;
                ListenerKind::Tcp(TcpListener::bind((host.as_str(), port)).await?)
            }
            #[cfg(unix)]
            Address::Unix(path) => ListenerKind::Unix(UnixListener::bind(path)?),
        };
        Ok(Self {
            kind,
            limit: (max_connections > 0).then(|| ConnectionLimit::new(max_connections)),
            closed: CancellationToken::new(),
        })
    }

    /// Accept the next connection.
    ///
    /// With an admission limiter attached, waits for a free slot before
    /// accepting, so at most `max_connections` accepted streams exist at
    /// any instant. Blocked and future calls return
    /// [`AcceptError::Closed`] promptly once the listener is closed.
    pub async fn accept(&self) -> Result<Stream, AcceptError> {
        let permit = match &self.limit {
            Some(limit) => tokio::select! {
                biased;
                _ = self.closed.cancelled() => return Err(AcceptError::Closed),
                permit = limit.acquire() => match permit {
                    Some(permit) => Some(permit),
                    None => return Err(AcceptError::Closed),
                },
            },
            None => None,
        };
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(AcceptError::Closed),
            accepted = self.kind.accept() => {
                let mut stream = accepted?;
                stream.permit = permit;
                Ok(stream)
            }
        }
    }

    /// Stop accepting: blocked and future [`accept`](Self::accept) calls
    /// return [`AcceptError::Closed`]. Idempotent; the socket itself is
    /// released when the listener is dropped.
    pub fn close(&self) {
        self.closed.cancel();
        if let Some(limit) = &self.limit {
            limit.close();
        }
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// The bound local address, for TCP listeners.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.kind {
            ListenerKind::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            ListenerKind::Unix(_) => None,
        }
    }

    /// The admission limiter, when one is attached.
    pub fn limit(&self) -> Option<&ConnectionLimit> {
        self.limit.as_ref()
    }
}

impl ListenerKind {
    async fn accept(&self) -> io::Result<Stream> {
        match self {
            ListenerKind::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                harden_tcp_stream(&stream);
                Ok(Stream {
                    kind: StreamKind::Tcp(stream),
                    peer: PeerAddr::Tcp(peer),
                    permit: None,
                })
            }
            #[cfg(unix)]
            ListenerKind::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Stream {
                    kind: StreamKind::Unix(stream),
                    peer: PeerAddr::Unix,
                    permit: None,
                })
            }
        }
    }
}

/// Split a TCP `host:port` descriptor for binding.
///
/// An empty host means all interfaces; the service markers `http` and
/// `https` map to ports 80 and 443. IPv6 hosts may be bracketed.
fn tcp_bind_target(descriptor: &str) -> io::Result<(String, u16)> {
    let (host, port) = descriptor.rsplit_once(':').ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid TCP address {descriptor:?}: missing port"),
        )
    })?;
    let port = match port {
        "http" => 80,
        "https" => 443,
        other => other.parse::<u16>().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid TCP address {descriptor:?}: bad port {other:?}"),
            )
        })?,
    };
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    Ok((host.to_owned(), port))
}

/// Remote endpoint of an accepted stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddr {
    /// TCP peer socket address.
    Tcp(SocketAddr),
    /// Unix-domain peer (unnamed).
    #[cfg(unix)]
    Unix,
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Tcp(addr) => addr.fmt(f),
            #[cfg(unix)]
            PeerAddr::Unix => f.write_str("unix"),
        }
    }
}

/// An accepted connection: a byte stream plus its admission permit.
///
/// Dropping the stream closes the connection and releases the admission
/// slot exactly once, regardless of which task drops it.
#[derive(Debug)]
pub struct Stream {
    kind: StreamKind,
    peer: PeerAddr,
    permit: Option<ConnectionPermit>,
}

#[derive(Debug)]
enum StreamKind {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Stream {
    /// Remote endpoint of this connection.
    pub fn peer(&self) -> &PeerAddr {
        &self.peer
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.kind {
            StreamKind::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            StreamKind::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.kind {
            StreamKind::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            StreamKind::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.kind {
            StreamKind::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            StreamKind::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.kind {
            StreamKind::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            StreamKind::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match &mut self.kind {
            StreamKind::Tcp(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            #[cfg(unix)]
            StreamKind::Unix(s) => Pin::new(s).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match &self.kind {
            StreamKind::Tcp(s) => s.is_write_vectored(),
            #[cfg(unix)]
            StreamKind::Unix(s) => s.is_write_vectored(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener as StdTcpListener;
    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;

    #[test]
    fn parses_tcp_descriptor() {
        assert_eq!(
            Address::parse("127.0.0.1:8080"),
            Address::Tcp("127.0.0.1:8080".into())
        );
        assert_eq!(Address::parse(":http"), Address::Tcp(":http".into()));
    }

    #[test]
    fn parses_systemd_descriptor() {
        assert_eq!(
            Address::parse("systemd:myapp-http"),
            Address::Systemd("myapp-http".into())
        );
    }

    #[cfg(unix)]
    #[test]
    fn parses_unix_descriptor() {
        assert_eq!(
            Address::parse("unix:/run/app.sock"),
            Address::Unix(PathBuf::from("/run/app.sock"))
        );
    }

    #[test]
    fn bind_target_maps_service_markers() {
        assert_eq!(tcp_bind_target(":http").unwrap(), ("0.0.0.0".into(), 80));
        assert_eq!(tcp_bind_target(":https").unwrap(), ("0.0.0.0".into(), 443));
        assert_eq!(
            tcp_bind_target("127.0.0.1:8080").unwrap(),
            ("127.0.0.1".into(), 8080)
        );
        assert_eq!(tcp_bind_target("[::1]:9000").unwrap(), ("::1".into(), 9000));
    }

    #[test]
    fn bind_target_rejects_malformed_descriptors() {
        let err = tcp_bind_target("INVALID").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        let err = tcp_bind_target("host:notaport").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn missing_systemd_socket_has_exact_message() {
        let mut sockets = ActivatedSockets::new();
        let err = Listener::resolve(&Address::parse("systemd:myapp-http"), &mut sockets, 0)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "listen systemd myapp-http: socket not found"
        );
    }

    #[tokio::test]
    async fn resolves_activated_socket() {
        let std_listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let bound = std_listener.local_addr().unwrap();
        let mut sockets = ActivatedSockets::new();
        sockets.register("web", std_listener);

        let listener = Listener::resolve(&Address::parse("systemd:web"), &mut sockets, 0)
            .await
            .unwrap();
        assert_eq!(listener.local_addr().unwrap(), bound);

        let client = TcpStream::connect(bound).await.unwrap();
        let stream = listener.accept().await.unwrap();
        assert_eq!(
            stream.peer(),
            &PeerAddr::Tcp(client.local_addr().unwrap())
        );
    }

    #[tokio::test]
    async fn accepted_tcp_streams_have_keep_alive() {
        let mut sockets = ActivatedSockets::new();
        let listener = Listener::resolve(&Address::parse("127.0.0.1:0"), &mut sockets, 0)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let stream = listener.accept().await.unwrap();
        match &stream.kind {
            StreamKind::Tcp(s) => assert!(SockRef::from(s).keepalive().unwrap()),
            #[cfg(unix)]
            StreamKind::Unix(_) => unreachable!(),
        }
    }

    #[tokio::test]
    async fn bind_failure_surfaces_os_error() {
        let mut sockets = ActivatedSockets::new();
        let err = Listener::resolve(&Address::parse("INVALID"), &mut sockets, 0)
            .await
            .unwrap_err();
        match err {
            ListenError::Bind(e) => assert_eq!(e.kind(), io::ErrorKind::InvalidInput),
            other => panic!("expected Bind, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_listener_keeps_rejecting_accepts() {
        let mut sockets = ActivatedSockets::new();
        let listener = Listener::resolve(&Address::parse("127.0.0.1:0"), &mut sockets, 2)
            .await
            .unwrap();

        listener.close();
        listener.close();
        assert!(listener.is_closed());

        for _ in 0..2 {
            let err = listener.accept().await.unwrap_err();
            assert!(matches!(err, AcceptError::Closed));
        }
    }

    #[tokio::test]
    async fn limiter_defers_accept_until_slot_frees() {
        let mut sockets = ActivatedSockets::new();
        let listener = Listener::resolve(&Address::parse("127.0.0.1:0"), &mut sockets, 1)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let mut first_client = TcpStream::connect(addr).await.unwrap();
        let _second_client = TcpStream::connect(addr).await.unwrap();

        let first = listener.accept().await.unwrap();
        assert_eq!(listener.limit().unwrap().available(), 0);

        // The second connection sits in the backlog until the first stream
        // is dropped.
        let deferred = timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(deferred.is_err());

        drop(first);
        let second = timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("slot never freed")
            .unwrap();
        drop(second);

        let _ = first_client.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolves_unix_descriptor() {
        let path = std::env::temp_dir().join(format!("rampart-listen-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let mut sockets = ActivatedSockets::new();
        let address = Address::parse(&format!("unix:{}", path.display()));
        let listener = Listener::resolve(&address, &mut sockets, 0).await.unwrap();
        assert!(listener.local_addr().is_none());

        let _client = UnixStream::connect(&path).await.unwrap();
        let stream = listener.accept().await.unwrap();
        assert_eq!(stream.peer(), &PeerAddr::Unix);

        drop(listener);
        let _ = std::fs::remove_file(&path);
    }
}
