//! Server facade: hardened defaults, listener lifecycle, serve loop.
//!
//! [`Server`] ties the pieces together: it resolves the address descriptor
//! into a listener, decides plain-vs-TLS from the certificate source,
//! accepts connections (admission-limited when configured), and hands each
//! accepted stream to the dispatch layer on its own task. All serve entry
//! points block until the listener closes and then return a terminal
//! condition; graceful shutdown yields the distinguished
//! [`ServeError::Closed`].

use std::path::Path;
use std::sync::Arc;

use axum::Router;
use thiserror::Error;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::activation::ActivatedSockets;
use crate::listen::{AcceptError, Address, ListenError, Listener};
use crate::serve::{ConnectionDriver, HttpDriver, Timeouts};
use crate::tls::{TlsCertificate, TlsMaterialError, TlsPolicy};

/// Default address marker for plain-HTTP servers (port 80).
pub const DEFAULT_HTTP_ADDR: &str = ":http";
/// Default address marker for TLS servers (port 443).
pub const DEFAULT_HTTPS_ADDR: &str = ":https";

/// Terminal conditions from the serve entry points.
#[derive(Debug, Error)]
pub enum ServeError {
    /// The listener was closed by a graceful shutdown — the expected way
    /// for a serve call to end. Check with [`ServeError::is_closed`]; no
    /// string matching needed.
    #[error("server closed")]
    Closed,

    /// Listener resolution failed; the server never started.
    #[error(transparent)]
    Listen(#[from] ListenError),

    /// Certificate material was missing or invalid.
    #[error(transparent)]
    Tls(#[from] TlsMaterialError),

    /// The listener failed in a way that is neither per-connection nor a
    /// shutdown.
    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),
}

impl ServeError {
    /// `true` for the distinguished graceful-shutdown condition.
    pub fn is_closed(&self) -> bool {
        matches!(self, ServeError::Closed)
    }
}

/// Cloneable handle for requesting graceful shutdown.
#[derive(Clone, Debug)]
pub struct ServerHandle {
    shutdown: CancellationToken,
}

impl ServerHandle {
    /// Stop accepting new connections. In-flight connections are left to
    /// finish on their own tasks. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Returns `true` once shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// A hardened HTTP server.
///
/// Carries production-grade defaults (timeouts, TLS policy), resolves its
/// listener from a TCP address, a `systemd:` socket name, or a `unix:`
/// path, and optionally caps simultaneous connections. Whether TLS is
/// terminated is derived from the policy's certificate source; there is no
/// separate mode flag to drift out of sync.
pub struct Server {
    addr: String,
    handler: Router,
    timeouts: Timeouts,
    max_connections: usize,
    tls: TlsPolicy,
    sockets: ActivatedSockets,
    driver: Option<Arc<dyn ConnectionDriver>>,
    shutdown: CancellationToken,
}

impl Server {
    /// Create a plain-HTTP server with hardened defaults.
    ///
    /// An empty `addr` defaults to [`DEFAULT_HTTP_ADDR`]. Pass
    /// `Router::new()` for a handler that answers 404 to everything.
    pub fn new(addr: impl Into<String>, handler: Router) -> Self {
        let mut addr = addr.into();
        if addr.is_empty() {
            addr = DEFAULT_HTTP_ADDR.to_owned();
        }
        Self {
            addr,
            handler,
            timeouts: Timeouts::default(),
            max_connections: 0,
            tls: TlsPolicy::hardened(),
            sockets: ActivatedSockets::new(),
            driver: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Create a TLS server with `cert` attached.
    ///
    /// An empty `addr` defaults to [`DEFAULT_HTTPS_ADDR`].
    pub fn new_tls(addr: impl Into<String>, cert: TlsCertificate, handler: Router) -> Self {
        let mut addr = addr.into();
        if addr.is_empty() {
            addr = DEFAULT_HTTPS_ADDR.to_owned();
        }
        let mut server = Self::new(addr, handler);
        server.tls.set_certificate(cert);
        server
    }

    /// Cap simultaneous accepted connections; `0` (the default) means
    /// unlimited.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Replace the default per-connection timeouts.
    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Supply the sockets provisioned to this process at startup, enabling
    /// `systemd:<name>` descriptors.
    pub fn activated_sockets(mut self, sockets: ActivatedSockets) -> Self {
        self.sockets = sockets;
        self
    }

    /// Attach a parsed certificate chain and key. Enables TLS.
    pub fn certificate(mut self, cert: TlsCertificate) -> Self {
        self.tls.set_certificate(cert);
        self
    }

    /// Attach a dynamic certificate resolver instead of a fixed
    /// certificate. Enables TLS.
    pub fn cert_resolver(
        mut self,
        resolver: Arc<dyn rustls::server::ResolvesServerCert>,
    ) -> Self {
        self.tls.set_cert_resolver(resolver);
        self
    }

    /// Replace the HTTP dispatch layer — a seam for tests and for
    /// embedding non-hyper dispatchers.
    pub fn connection_driver(mut self, driver: Arc<dyn ConnectionDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// The configured address descriptor.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// The TLS policy in force.
    pub fn tls_policy(&self) -> &TlsPolicy {
        &self.tls
    }

    /// Whether this server will terminate TLS, derived from the presence
    /// of a certificate source in the policy.
    pub fn is_tls(&self) -> bool {
        self.tls.has_certificate()
    }

    /// A handle for requesting graceful shutdown of the serve loop.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: self.shutdown.clone(),
        }
    }

    /// Resolve the configured address descriptor into a listener.
    ///
    /// # Errors
    ///
    /// See [`Listener::resolve`].
    pub async fn listen(&mut self) -> Result<Listener, ListenError> {
        let address = Address::parse(&self.addr);
        Listener::resolve(&address, &mut self.sockets, self.max_connections).await
    }

    /// Resolve the listener and serve, with TLS iff a certificate source
    /// is configured.
    ///
    /// Blocks until the listener closes, then always returns an error;
    /// after a graceful shutdown it is [`ServeError::Closed`].
    pub async fn start(mut self) -> Result<(), ServeError> {
        let listener = self.listen().await?;
        if self.is_tls() {
            let config = self.tls.server_config()?;
            self.run(listener, Some(TlsAcceptor::from(config))).await
        } else {
            self.run(listener, None).await
        }
    }

    /// Serve plain HTTP from an existing listener.
    pub async fn serve(self, listener: Listener) -> Result<(), ServeError> {
        self.run(listener, None).await
    }

    /// Serve TLS from an existing listener.
    ///
    /// `cert_file` and `key_file` are only read when the policy has no
    /// certificate source yet.
    pub async fn serve_tls(
        mut self,
        listener: Listener,
        cert_file: impl AsRef<Path>,
        key_file: impl AsRef<Path>,
    ) -> Result<(), ServeError> {
        if !self.is_tls() {
            let cert = TlsCertificate::from_pem_files(cert_file, key_file)?;
            self.tls.set_certificate(cert);
        }
        let config = self.tls.server_config()?;
        self.run(listener, Some(TlsAcceptor::from(config))).await
    }

    async fn run(self, listener: Listener, tls: Option<TlsAcceptor>) -> Result<(), ServeError> {
        let driver: Arc<dyn ConnectionDriver> = match self.driver {
            Some(driver) => driver,
            None => Arc::new(HttpDriver::new(self.handler.clone(), self.timeouts)),
        };
        info!(
            addr = %self.addr,
            tls = tls.is_some(),
            max_connections = self.max_connections,
            "server listening"
        );
        loop {
            let stream = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    listener.close();
                    info!(addr = %self.addr, "server shut down");
                    return Err(ServeError::Closed);
                }
                accepted = listener.accept() => match accepted {
                    Ok(stream) => stream,
                    Err(AcceptError::Closed) => {
                        info!(addr = %self.addr, "listener closed");
                        return Err(ServeError::Closed);
                    }
                    Err(AcceptError::Io(e)) if is_transient(&e) => {
                        warn!(error = %e, "transient accept error");
                        continue;
                    }
                    Err(AcceptError::Io(e)) => {
                        listener.close();
                        return Err(ServeError::Accept(e));
                    }
                },
            };
            let peer = stream.peer().clone();
            debug!(peer = %peer, "accepted connection");
            let tls = tls.clone();
            let driver = driver.clone();
            tokio::spawn(async move {
                let served = match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(stream) => driver.drive(Box::new(stream), peer.clone()).await,
                        Err(e) => Err(e.into()),
                    },
                    None => driver.drive(Box::new(stream), peer.clone()).await,
                };
                if let Err(e) = served {
                    debug!(peer = %peer, error = %e, "connection ended with error");
                }
            });
        }
    }
}

/// Accept errors that concern one incoming connection rather than the
/// listener itself; the loop logs them and keeps accepting.
fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::Interrupted
    )
}

/// Build a default server for `addr` and serve plain HTTP.
///
/// Blocks until the listener closes; see [`Server::start`].
pub async fn listen_and_serve(addr: &str, handler: Router) -> Result<(), ServeError> {
    Server::new(addr, handler).start().await
}

/// Build a default server for `addr`, load the PEM files, and serve TLS.
///
/// Blocks until the listener closes; see [`Server::start`].
pub async fn listen_and_serve_tls(
    addr: &str,
    cert_file: impl AsRef<Path>,
    key_file: impl AsRef<Path>,
    handler: Router,
) -> Result<(), ServeError> {
    let cert = TlsCertificate::from_pem_files(cert_file, key_file)?;
    Server::new_tls(addr, cert, handler).start().await
}
