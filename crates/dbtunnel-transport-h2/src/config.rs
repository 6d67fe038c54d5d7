//! HTTP/2 transport configuration

use crate::error::{TransportError, TransportResult};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// HTTP/2-specific configuration, shared by both tunnel roles
#[derive(Debug, Clone)]
pub struct H2Config {
    /// Wrap connections in TLS (ALPN `h2`); otherwise speak h2c with prior knowledge
    pub tls: bool,

    /// Verify the server certificate (clients only)
    pub verify_server_cert: bool,

    /// ALPN protocols offered/accepted during the TLS handshake
    pub alpn_protocols: Vec<String>,

    /// Extra trusted roots in DER form; empty means the webpki bundle
    pub root_certs: Vec<Vec<u8>>,

    /// Server certificate path (for servers)
    pub server_cert_path: Option<PathBuf>,

    /// Server private key path (for servers)
    pub server_key_path: Option<PathBuf>,

    /// Initial per-stream window size
    pub initial_window_size: u32,

    /// Initial connection-level window size
    pub initial_connection_window_size: u32,

    /// Maximum frame size
    pub max_frame_size: u32,

    /// Maximum concurrent streams accepted by a server connection
    pub max_concurrent_streams: u32,
}

impl H2Config {
    fn base(tls: bool) -> Self {
        Self {
            tls,
            verify_server_cert: true,
            alpn_protocols: vec!["h2".to_string()],
            root_certs: Vec::new(),
            server_cert_path: None,
            server_key_path: None,
            initial_window_size: 1024 * 1024, // 1MB
            initial_connection_window_size: 4 * 1024 * 1024, // 4MB
            max_frame_size: 16 * 1024, // 16KB (HTTP/2 default)
            max_concurrent_streams: 100,
        }
    }

    /// Client over TLS with certificate verification
    pub fn client_default() -> Self {
        Self::base(true)
    }

    /// Client speaking h2c (prior knowledge, no TLS)
    pub fn client_cleartext() -> Self {
        Self::base(false)
    }

    /// Client for local development (skip cert verification)
    pub fn client_insecure() -> Self {
        Self::client_default().with_insecure_skip_verify()
    }

    /// Server speaking h2c, for deployments behind a TLS-terminating front end
    pub fn server_cleartext() -> Self {
        Self::base(false)
    }

    /// Server over TLS with the given PEM certificate chain and key
    pub fn server_tls(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            server_cert_path: Some(cert_path.into()),
            server_key_path: Some(key_path.into()),
            ..Self::base(true)
        }
    }

    /// Disable server certificate verification (INSECURE)
    pub fn with_insecure_skip_verify(mut self) -> Self {
        self.verify_server_cert = false;
        self
    }

    /// Trust an additional root certificate (DER)
    pub fn with_root_cert(mut self, der: Vec<u8>) -> Self {
        self.root_certs.push(der);
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.initial_window_size == 0 {
            return Err(TransportError::ConfigurationError(
                "Initial window size must be > 0".to_string(),
            ));
        }
        // RFC 9113 §6.5.2 bounds for SETTINGS_MAX_FRAME_SIZE
        if !(16_384..=16_777_215).contains(&self.max_frame_size) {
            return Err(TransportError::ConfigurationError(format!(
                "Max frame size must be between 16384 and 16777215, got {}",
                self.max_frame_size
            )));
        }
        if self.tls && self.alpn_protocols.is_empty() {
            return Err(TransportError::ConfigurationError(
                "TLS requires at least one ALPN protocol".to_string(),
            ));
        }
        if self.server_cert_path.is_some() != self.server_key_path.is_some() {
            return Err(TransportError::ConfigurationError(
                "Server cert and key must be provided together".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn client_builder(&self) -> h2::client::Builder {
        let mut builder = h2::client::Builder::new();
        builder
            .initial_window_size(self.initial_window_size)
            .initial_connection_window_size(self.initial_connection_window_size)
            .max_frame_size(self.max_frame_size)
            .enable_push(false);
        builder
    }

    pub(crate) fn server_builder(&self) -> h2::server::Builder {
        let mut builder = h2::server::Builder::new();
        builder
            .initial_window_size(self.initial_window_size)
            .initial_connection_window_size(self.initial_connection_window_size)
            .max_frame_size(self.max_frame_size)
            .max_concurrent_streams(self.max_concurrent_streams);
        builder
    }

    /// Build rustls TlsConnector for client
    pub(crate) fn build_tls_connector(&self) -> TransportResult<tokio_rustls::TlsConnector> {
        ensure_crypto_provider();

        let mut roots = rustls::RootCertStore::empty();

        if self.root_certs.is_empty() {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        } else {
            for cert_der in &self.root_certs {
                roots
                    .add(rustls::pki_types::CertificateDer::from(cert_der.clone()))
                    .map_err(|e| {
                        TransportError::ConfigurationError(format!("Invalid root cert: {}", e))
                    })?;
            }
        }

        let mut client_crypto = if self.verify_server_cert {
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        } else {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
                .with_no_client_auth()
        };

        // Set ALPN for HTTP/2
        client_crypto.alpn_protocols = self.alpn_bytes();

        Ok(tokio_rustls::TlsConnector::from(Arc::new(client_crypto)))
    }

    /// Build rustls TlsAcceptor for server
    pub(crate) fn build_tls_acceptor(&self) -> TransportResult<tokio_rustls::TlsAcceptor> {
        ensure_crypto_provider();

        let cert_path = self.server_cert_path.as_ref().ok_or_else(|| {
            TransportError::ConfigurationError("Server cert path required".to_string())
        })?;
        let key_path = self.server_key_path.as_ref().ok_or_else(|| {
            TransportError::ConfigurationError("Server key path required".to_string())
        })?;

        let certs = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;

        let mut server_crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::TlsError(format!("Invalid cert/key: {}", e)))?;

        // Set ALPN for HTTP/2
        server_crypto.alpn_protocols = self.alpn_bytes();

        Ok(tokio_rustls::TlsAcceptor::from(Arc::new(server_crypto)))
    }

    fn alpn_bytes(&self) -> Vec<Vec<u8>> {
        self.alpn_protocols
            .iter()
            .map(|s| s.as_bytes().to_vec())
            .collect()
    }
}

impl Default for H2Config {
    fn default() -> Self {
        Self::client_default()
    }
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

fn load_certs(path: &Path) -> TransportResult<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        TransportError::TlsError(format!(
            "Failed to open cert file {}: {}",
            path.display(),
            e
        ))
    })?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Failed to parse certs: {}", e)))?;

    if certs.is_empty() {
        return Err(TransportError::TlsError(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> TransportResult<rustls::pki_types::PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        TransportError::TlsError(format!("Failed to open key file {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::TlsError(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| TransportError::TlsError("No private key found".to_string()))
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}
