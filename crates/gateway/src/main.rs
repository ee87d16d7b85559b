//! `gateway` — hardened HTTP gateway binary entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise structured JSON logging.
//! 3. Build the Axum router.
//! 4. Start the rampart server; TLS is enabled iff certificate paths are
//!    configured.

mod config;
mod router;

use anyhow::Result;
use rampart::{Server, TlsCertificate};
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: gateway configuration invalid: {e}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    init_telemetry(&cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen_addr = %cfg.listen_addr,
        tls = cfg.tls_enabled(),
        max_connections = cfg.max_connections,
        "gateway starting"
    );

    // -----------------------------------------------------------------------
    // 3. Router
    // -----------------------------------------------------------------------
    let router = router::build();

    // -----------------------------------------------------------------------
    // 4. Server
    // -----------------------------------------------------------------------
    let mut server = Server::new(cfg.listen_addr.clone(), router)
        .max_connections(cfg.max_connections)
        .timeouts(cfg.timeouts());
    if let (Some(cert_path), Some(key_path)) = (&cfg.tls_cert_path, &cfg.tls_key_path) {
        let cert = TlsCertificate::from_pem_files(cert_path, key_path)?;
        server = server.certificate(cert);
    }

    match server.start().await {
        Err(e) if e.is_closed() => {
            info!("gateway stopped");
            Ok(())
        }
        Err(e) => Err(e.into()),
        Ok(()) => Ok(()),
    }
}

/// Initialise the tracing subscriber: structured JSON logs to stdout at the
/// configured level, overridable via `RUST_LOG`.
fn init_telemetry(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialise gateway tracing subscriber: {e}"))
}
