//! Hardened TLS policy construction on rustls.
//!
//! [`TlsPolicy::hardened`] fixes the protocol floor at TLS 1.2, restricts
//! the TLS 1.2 handshake to six forward-secret AEAD suites, prefers P-256
//! then X25519 for key exchange, advertises `h2` before `http/1.1`, and
//! enforces the server's cipher-suite order. The policy exposes no way to
//! weaken any of these; only certificate material varies per deployment.

use std::fmt;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::{ring, SupportedKxGroup};
use rustls::server::ResolvesServerCert;
use rustls::{
    CipherSuite, NamedGroup, ProtocolVersion, ServerConfig, SupportedProtocolVersion,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;

/// Errors from certificate/key handling and TLS configuration build.
///
/// These surface when material is attached or when the listener-level
/// rustls configuration is built — never from policy construction, which is
/// pure and infallible.
#[derive(Debug, Error)]
pub enum TlsMaterialError {
    /// A PEM file could not be read from disk.
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The certificate chain could not be parsed as PEM.
    #[error("failed to parse TLS certificate chain: {0}")]
    CertParse(#[source] std::io::Error),

    /// The private key could not be parsed as PEM.
    #[error("failed to parse TLS private key: {0}")]
    KeyParse(#[source] std::io::Error),

    /// The PEM data contained no certificate.
    #[error("no certificate found in PEM data")]
    NoCertificate,

    /// The PEM data contained no private key.
    #[error("no private key found in PEM data")]
    NoPrivateKey,

    /// A TLS serve entry point was reached without a certificate source.
    #[error("TLS requested but no certificate is configured")]
    MissingCertSource,

    /// rustls rejected the assembled configuration or material, e.g. a key
    /// that does not match the certificate.
    #[error("TLS configuration rejected: {0}")]
    Rejected(#[from] rustls::Error),
}

/// TLS 1.2 cipher suites permitted by the hardened policy, in server
/// preference order: 256-bit AES first, then ChaCha20-Poly1305, then
/// 128-bit AES, ECDSA before RSA within each tier. All six are
/// forward-secret AEAD suites.
const TLS12_CIPHER_SUITES: [CipherSuite; 6] = [
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
];

/// TLS 1.3 suites are fixed by the protocol, not policy-configurable; they
/// ride along so a TLS 1.3 handshake has something to negotiate.
const TLS13_CIPHER_SUITES: [CipherSuite; 3] = [
    CipherSuite::TLS13_AES_256_GCM_SHA384,
    CipherSuite::TLS13_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS13_AES_128_GCM_SHA256,
];

/// Key-exchange group preference: P-256, then X25519.
const KX_GROUPS: [NamedGroup; 2] = [NamedGroup::secp256r1, NamedGroup::X25519];

/// Enabled protocol versions. TLS 1.2 is the floor; nothing below is ever
/// negotiated.
static PROTOCOL_VERSIONS: &[&SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

/// A parsed certificate chain and matching private key.
pub struct TlsCertificate {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl TlsCertificate {
    /// Parse PEM-encoded certificate chain and private key bytes.
    ///
    /// # Errors
    ///
    /// Returns a [`TlsMaterialError`] if either input fails to parse or is
    /// empty.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, TlsMaterialError> {
        let chain = rustls_pemfile::certs(&mut BufReader::new(cert_pem))
            .collect::<Result<Vec<_>, _>>()
            .map_err(TlsMaterialError::CertParse)?;
        if chain.is_empty() {
            return Err(TlsMaterialError::NoCertificate);
        }
        let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem))
            .map_err(TlsMaterialError::KeyParse)?
            .ok_or(TlsMaterialError::NoPrivateKey)?;
        Ok(Self { chain, key })
    }

    /// Load and parse PEM files from disk.
    ///
    /// If the certificate is CA-signed, `cert_path` should hold the full
    /// chain: leaf first, then intermediates, then the CA certificate.
    ///
    /// # Errors
    ///
    /// Returns a [`TlsMaterialError`] if a file cannot be read or parsed.
    pub fn from_pem_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, TlsMaterialError> {
        let cert_pem = read(cert_path.as_ref())?;
        let key_pem = read(key_path.as_ref())?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Number of certificates in the chain.
    pub fn chain_len(&self) -> usize {
        self.chain.len()
    }
}

fn read(path: &Path) -> Result<Vec<u8>, TlsMaterialError> {
    std::fs::read(path).map_err(|source| TlsMaterialError::Read {
        path: path.display().to_string(),
        source,
    })
}

impl Clone for TlsCertificate {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl fmt::Debug for TlsCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print key material — not even in debug builds.
        f.debug_struct("TlsCertificate")
            .field("chain_len", &self.chain.len())
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Where the server certificate comes from, if anywhere.
enum CertSource {
    /// No certificate: TLS stays disabled.
    None,
    /// A single in-memory certificate chain and key.
    Single(TlsCertificate),
    /// Dynamic per-handshake lookup (SNI-based selection, hot reload).
    Resolver(Arc<dyn ResolvesServerCert>),
}

impl fmt::Debug for CertSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertSource::None => f.write_str("None"),
            CertSource::Single(cert) => f.debug_tuple("Single").field(cert).finish(),
            CertSource::Resolver(_) => f.write_str("Resolver(..)"),
        }
    }
}

/// Hardened TLS policy: protocol floor, cipher-suite allowlist, key-exchange
/// and ALPN preference, and the certificate source.
///
/// The hardening parameters are compile-time constants; the only mutable
/// state is the certificate source. Whether TLS is enabled is derived from
/// [`has_certificate`](Self::has_certificate), never stored separately.
#[derive(Debug)]
pub struct TlsPolicy {
    alpn: Vec<Vec<u8>>,
    prefer_server_order: bool,
    cert: CertSource,
}

impl TlsPolicy {
    /// Build the hardened policy. Pure; cannot fail.
    pub fn hardened() -> Self {
        Self {
            alpn: vec![b"h2".to_vec(), b"http/1.1".to_vec()],
            prefer_server_order: true,
            cert: CertSource::None,
        }
    }

    /// The minimum negotiable protocol version.
    pub fn min_version(&self) -> ProtocolVersion {
        ProtocolVersion::TLSv1_2
    }

    /// The TLS 1.2 cipher-suite allowlist, in server preference order.
    pub fn cipher_suites(&self) -> &'static [CipherSuite] {
        &TLS12_CIPHER_SUITES
    }

    /// Key-exchange group preference order.
    pub fn kx_groups(&self) -> &'static [NamedGroup] {
        &KX_GROUPS
    }

    /// ALPN protocol preference order.
    pub fn alpn_protocols(&self) -> &[Vec<u8>] {
        &self.alpn
    }

    /// Whether the server's cipher-suite order beats the client's.
    pub fn prefer_server_cipher_order(&self) -> bool {
        self.prefer_server_order
    }

    /// Attach a parsed certificate chain and key.
    pub fn set_certificate(&mut self, cert: TlsCertificate) {
        self.cert = CertSource::Single(cert);
    }

    /// Attach a dynamic certificate resolver (per-SNI selection, hot
    /// reload) instead of a fixed certificate.
    pub fn set_cert_resolver(&mut self, resolver: Arc<dyn ResolvesServerCert>) {
        self.cert = CertSource::Resolver(resolver);
    }

    /// Whether a certificate source is configured.
    pub fn has_certificate(&self) -> bool {
        !matches!(self.cert, CertSource::None)
    }

    /// Build the rustls server configuration enforcing this policy.
    ///
    /// # Errors
    ///
    /// Returns [`TlsMaterialError::MissingCertSource`] when no certificate
    /// source is attached, or [`TlsMaterialError::Rejected`] when rustls
    /// rejects the material (e.g. a key that does not match the
    /// certificate).
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, TlsMaterialError> {
        let provider = hardened_provider();

        let builder = ServerConfig::builder_with_provider(Arc::new(provider))
            .with_protocol_versions(PROTOCOL_VERSIONS)?
            .with_no_client_auth();

        let mut config = match &self.cert {
            CertSource::None => return Err(TlsMaterialError::MissingCertSource),
            CertSource::Single(cert) => {
                builder.with_single_cert(cert.chain.clone(), cert.key.clone_key())?
            }
            CertSource::Resolver(resolver) => builder.with_cert_resolver(resolver.clone()),
        };
        config.alpn_protocols = self.alpn.clone();
        config.ignore_client_order = self.prefer_server_order;
        Ok(Arc::new(config))
    }
}

impl Default for TlsPolicy {
    fn default() -> Self {
        Self::hardened()
    }
}

/// The ring crypto provider narrowed to the policy's cipher suites and
/// key-exchange groups, both in policy preference order.
fn hardened_provider() -> rustls::crypto::CryptoProvider {
    let mut provider = ring::default_provider();

    let cipher_suites = TLS13_CIPHER_SUITES
        .iter()
        .chain(&TLS12_CIPHER_SUITES)
        .filter_map(|id| {
            provider
                .cipher_suites
                .iter()
                .copied()
                .find(|suite| suite.suite() == *id)
        })
        .collect();

    let kx_groups = KX_GROUPS
        .iter()
        .filter_map(|name| {
            provider
                .kx_groups
                .iter()
                .copied()
                .find(|group| group.name() == *name)
        })
        .collect();

    provider.cipher_suites = cipher_suites;
    provider.kx_groups = kx_groups;
    provider
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed_pem() -> (String, String) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        (cert.cert.pem(), cert.key_pair.serialize_pem())
    }

    #[test]
    fn hardened_policy_has_no_certificate() {
        let policy = TlsPolicy::hardened();
        assert!(!policy.has_certificate());
        assert!(policy.prefer_server_cipher_order());
    }

    #[test]
    fn min_version_is_tls12() {
        assert_eq!(
            TlsPolicy::hardened().min_version(),
            ProtocolVersion::TLSv1_2
        );
    }

    #[test]
    fn cipher_suite_allowlist_is_exact() {
        let expected = [
            CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
            CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
            CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        ];
        assert_eq!(TlsPolicy::hardened().cipher_suites(), expected);
    }

    #[test]
    fn kx_groups_prefer_p256() {
        assert_eq!(
            TlsPolicy::hardened().kx_groups(),
            [NamedGroup::secp256r1, NamedGroup::X25519]
        );
    }

    #[test]
    fn alpn_prefers_h2() {
        let policy = TlsPolicy::hardened();
        assert_eq!(
            policy.alpn_protocols(),
            &[b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn provider_keeps_only_allowlisted_tls12_suites() {
        let provider = hardened_provider();
        let tls12: Vec<CipherSuite> = provider
            .cipher_suites
            .iter()
            .filter(|suite| suite.version().version == ProtocolVersion::TLSv1_2)
            .map(|suite| suite.suite())
            .collect();
        assert_eq!(tls12, TLS12_CIPHER_SUITES);

        let groups: Vec<NamedGroup> = provider.kx_groups.iter().map(|g| g.name()).collect();
        assert_eq!(groups, KX_GROUPS);
    }

    #[test]
    fn rejects_garbage_pem() {
        let result = TlsCertificate::from_pem(b"not a pem", b"also not a pem");
        assert!(result.is_err());
    }

    #[test]
    fn rejects_empty_cert_pem() {
        let result = TlsCertificate::from_pem(b"", b"");
        assert!(matches!(result, Err(TlsMaterialError::NoCertificate)));
    }

    #[test]
    fn parses_self_signed_pem() {
        let (cert_pem, key_pem) = self_signed_pem();
        let cert = TlsCertificate::from_pem(cert_pem.as_bytes(), key_pem.as_bytes()).unwrap();
        assert_eq!(cert.chain_len(), 1);
    }

    #[test]
    fn server_config_applies_policy() {
        let (cert_pem, key_pem) = self_signed_pem();
        let cert = TlsCertificate::from_pem(cert_pem.as_bytes(), key_pem.as_bytes()).unwrap();

        let mut policy = TlsPolicy::hardened();
        policy.set_certificate(cert);
        assert!(policy.has_certificate());

        let config = policy.server_config().unwrap();
        assert_eq!(
            config.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
        assert!(config.ignore_client_order);
    }

    #[test]
    fn server_config_without_certificate_fails() {
        let err = TlsPolicy::hardened().server_config().unwrap_err();
        assert!(matches!(err, TlsMaterialError::MissingCertSource));
    }

    #[test]
    fn debug_never_prints_key_material() {
        let (cert_pem, key_pem) = self_signed_pem();
        let cert = TlsCertificate::from_pem(cert_pem.as_bytes(), key_pem.as_bytes()).unwrap();
        let rendered = format!("{cert:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("PRIVATE"));
    }

    #[test]
    fn missing_pem_files_fail_with_read_error() {
        let err = TlsCertificate::from_pem_files("/nonexistent/cert.pem", "/nonexistent/key.pem")
            .unwrap_err();
        assert!(matches!(err, TlsMaterialError::Read { .. }));
    }
}
