//! Configuration loading and validation for the gateway.
//!
//! All values are read from environment variables at startup. The process
//! exits with a clear error message if any value is missing or invalid.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Validated gateway configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Address descriptor to listen on: `host:port`, `systemd:<name>`, or
    /// `unix:<path>`.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Cap on simultaneous connections (0 = unlimited).
    #[serde(default)]
    pub max_connections: usize,

    /// Filesystem path to a PEM-encoded certificate chain. Set together
    /// with `TLS_KEY_PATH` to enable TLS.
    #[serde(default)]
    pub tls_cert_path: Option<String>,

    /// Filesystem path to the matching PEM-encoded private key.
    #[serde(default)]
    pub tls_key_path: Option<String>,

    /// Per-connection read timeout in seconds.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Per-connection write timeout in seconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,

    /// Keep-alive idle timeout in seconds.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".into()
}
fn default_read_timeout() -> u64 {
    5
}
fn default_write_timeout() -> u64 {
    10
}
fn default_idle_timeout() -> u64 {
    120
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any variable cannot be parsed or validation
    /// fails.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build gateway configuration")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise gateway configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Whether TLS material is configured.
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert_path.is_some()
    }

    /// The per-connection timeouts for the server.
    pub fn timeouts(&self) -> rampart::Timeouts {
        rampart::Timeouts {
            read: Duration::from_secs(self.read_timeout_secs),
            write: Duration::from_secs(self.write_timeout_secs),
            idle: Duration::from_secs(self.idle_timeout_secs),
        }
    }

    /// Validate all fields, returning a descriptive error on the first
    /// failure.
    fn validate(&self) -> Result<()> {
        if self.listen_addr.trim().is_empty() {
            anyhow::bail!("LISTEN_ADDR must not be empty");
        }
        if self.tls_cert_path.is_some() != self.tls_key_path.is_some() {
            anyhow::bail!("TLS_CERT_PATH and TLS_KEY_PATH must be set together");
        }
        if self.read_timeout_secs == 0 || self.write_timeout_secs == 0 || self.idle_timeout_secs == 0
        {
            anyhow::bail!("timeouts must be greater than zero seconds");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            listen_addr: default_listen_addr(),
            max_connections: 0,
            tls_cert_path: None,
            tls_key_path: None,
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            log_level: default_log_level(),
        }
    }

    #[test]
    fn defaults_are_correct() {
        assert_eq!(default_listen_addr(), "0.0.0.0:8080");
        assert_eq!(default_read_timeout(), 5);
        assert_eq!(default_write_timeout(), 10);
        assert_eq!(default_idle_timeout(), 120);
        assert_eq!(default_log_level(), "info");
    }

    #[test]
    fn validate_accepts_valid_config() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_listen_addr() {
        let mut cfg = valid();
        cfg.listen_addr = "  ".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_partial_tls_config() {
        let mut cfg = valid();
        cfg.tls_cert_path = Some("/etc/tls/tls.crt".into());
        assert!(cfg.validate().is_err());

        cfg.tls_key_path = Some("/etc/tls/tls.key".into());
        assert!(cfg.validate().is_ok());
        assert!(cfg.tls_enabled());
    }

    #[test]
    fn validate_rejects_zero_timeouts() {
        let mut cfg = valid();
        cfg.idle_timeout_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn timeouts_convert_to_durations() {
        let timeouts = valid().timeouts();
        assert_eq!(timeouts.read, Duration::from_secs(5));
        assert_eq!(timeouts.write, Duration::from_secs(10));
        assert_eq!(timeouts.idle, Duration::from_secs(120));
    }
}
