//! Hardened lifecycle layer over a generic HTTP server.
//!
//! `rampart` supplies production-grade defaults (timeouts, TLS protocol and
//! cipher policy), resolves a listening socket from a TCP address, a
//! `systemd:` socket name, or a `unix:` path, and optionally caps the
//! number of simultaneously accepted connections. Request handling itself
//! is delegated to an [`axum::Router`] driven by hyper.
//!
//! ```no_run
//! use axum::{routing::get, Router};
//! use rampart::Server;
//!
//! #[tokio::main]
//! async fn main() {
//!     let router = Router::new().route("/", get(|| async { "ok" }));
//!     let server = Server::new("0.0.0.0:8080", router).max_connections(1024);
//!     if let Err(e) = server.start().await {
//!         if !e.is_closed() {
//!             eprintln!("server failed: {e}");
//!         }
//!     }
//! }
//! ```

pub mod activation;
pub mod limit;
pub mod listen;
pub mod serve;
pub mod server;
pub mod tls;

pub use activation::ActivatedSockets;
pub use limit::{ConnectionLimit, ConnectionPermit};
pub use listen::{AcceptError, Address, ListenError, Listener, PeerAddr, Stream};
pub use serve::{BoxedIo, ConnectionDriver, DriveError, DriveFuture, HttpDriver, Timeouts};
pub use server::{
    listen_and_serve, listen_and_serve_tls, ServeError, Server, ServerHandle, DEFAULT_HTTPS_ADDR,
    DEFAULT_HTTP_ADDR,
};
pub use tls::{TlsCertificate, TlsMaterialError, TlsPolicy};
