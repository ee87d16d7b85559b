//! Boundary to the HTTP dispatch layer.
//!
//! The server facade accepts, admission-limits, and TLS-wraps connections;
//! everything HTTP sits behind the [`ConnectionDriver`] capability so tests
//! can substitute fakes. The production driver speaks HTTP/1.1 and HTTP/2
//! via hyper and dispatches requests to an [`axum::Router`].

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::listen::PeerAddr;

/// Per-connection timeout values.
///
/// Owned by the server configuration; enforced by the dispatch layer
/// ([`HttpDriver`] maps them onto hyper's per-connection knobs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Limit on reading a request head.
    pub read: Duration,
    /// Limit on keep-alive acknowledgements when writing responses.
    pub write: Duration,
    /// How long a keep-alive connection may sit idle.
    pub idle: Duration,
}

impl Default for Timeouts {
    /// Production defaults: 5 s read, 10 s write, 120 s idle.
    fn default() -> Self {
        Self {
            read: Duration::from_secs(5),
            write: Duration::from_secs(10),
            idle: Duration::from_secs(120),
        }
    }
}

/// Byte streams handed to a [`ConnectionDriver`]: plaintext or TLS.
pub trait ServerIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> ServerIo for T {}

/// Boxed connection stream.
pub type BoxedIo = Box<dyn ServerIo>;

/// Error escaping a single connection. Contained to that connection's
/// task; never terminates the accept loop.
pub type DriveError = Box<dyn std::error::Error + Send + Sync>;

/// Future returned by [`ConnectionDriver::drive`].
pub type DriveFuture = Pin<Box<dyn Future<Output = Result<(), DriveError>> + Send>>;

/// Capability to serve one accepted connection.
#[cfg_attr(test, mockall::automock)]
pub trait ConnectionDriver: Send + Sync + 'static {
    /// Serve `io` until the connection completes or fails.
    fn drive(&self, io: BoxedIo, peer: PeerAddr) -> DriveFuture;
}

/// The production driver: hyper's automatic HTTP/1.1-or-HTTP/2 connection
/// handling in front of an [`axum::Router`].
///
/// Timeout mapping: `read` bounds HTTP/1.1 request-head reads, `idle` sets
/// the HTTP/2 keep-alive probe interval, and `write` bounds the probe
/// acknowledgement.
#[derive(Clone)]
pub struct HttpDriver {
    handler: Router,
    timeouts: Timeouts,
}

impl HttpDriver {
    /// Create a driver dispatching to `handler` under `timeouts`.
    pub fn new(handler: Router, timeouts: Timeouts) -> Self {
        Self { handler, timeouts }
    }
}

impl ConnectionDriver for HttpDriver {
    fn drive(&self, io: BoxedIo, _peer: PeerAddr) -> DriveFuture {
        let service = TowerToHyperService::new(self.handler.clone());
        let timeouts = self.timeouts;
        Box::pin(async move {
            let mut builder = auto::Builder::new(TokioExecutor::new());
            builder
                .http1()
                .timer(TokioTimer::new())
                .header_read_timeout(timeouts.read);
            builder
                .http2()
                .timer(TokioTimer::new())
                .keep_alive_interval(timeouts.idle)
                .keep_alive_timeout(timeouts.write);
            builder
                .serve_connection_with_upgrades(TokioIo::new(io), service)
                .await
        })
    }
}
