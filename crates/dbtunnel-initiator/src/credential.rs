//! Bearer token sources for tunnel requests
//!
//! A source is asked for a token once per tunnel. `Ok(None)` means the request
//! goes out without an `Authorization` header.

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderValue;
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

/// GCE / Cloud Run metadata server
pub const DEFAULT_METADATA_ADDR: &str = "metadata.google.internal:80";

const IDENTITY_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/identity";
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Failed to read token file {path}: {source}")]
    TokenFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Metadata server unreachable at {address}: {reason}")]
    MetadataUnreachable { address: String, reason: String },

    #[error("Metadata server returned {0}")]
    MetadataStatus(http::StatusCode),

    #[error("Metadata request failed: {0}")]
    MetadataRequest(String),

    #[error("Token is not a valid header value")]
    InvalidToken,
}

#[async_trait]
pub trait CredentialSource: Send + Sync + std::fmt::Debug {
    async fn token(&self) -> Result<Option<String>, CredentialError>;
}

/// Ask `source` for a token and build the `Authorization: Bearer` value.
pub(crate) async fn bearer_authorization(
    source: &dyn CredentialSource,
) -> Result<Option<HeaderValue>, CredentialError> {
    let Some(token) = source.token().await? else {
        return Ok(None);
    };
    let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|_| CredentialError::InvalidToken)?;
    value.set_sensitive(true);
    Ok(Some(value))
}

/// Unauthenticated requests
#[derive(Debug, Clone, Default)]
pub struct NoCredentials;

#[async_trait]
impl CredentialSource for NoCredentials {
    async fn token(&self) -> Result<Option<String>, CredentialError> {
        Ok(None)
    }
}

/// A fixed token, e.g. from `--token` or the environment
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticToken(<redacted>)")
    }
}

#[async_trait]
impl CredentialSource for StaticToken {
    async fn token(&self) -> Result<Option<String>, CredentialError> {
        let token = self.0.trim();
        if token.is_empty() {
            return Ok(None);
        }
        Ok(Some(token.to_string()))
    }
}

/// Token re-read from disk on every request, so rotated files are picked up.
#[derive(Debug, Clone)]
pub struct TokenFile {
    path: PathBuf,
}

impl TokenFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CredentialSource for TokenFile {
    async fn token(&self) -> Result<Option<String>, CredentialError> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| CredentialError::TokenFile {
                path: self.path.display().to_string(),
                source,
            })?;

        let token = contents.trim();
        if token.is_empty() {
            debug!("Token file {} is empty", self.path.display());
            return Ok(None);
        }
        Ok(Some(token.to_string()))
    }
}

/// Identity token minted by the metadata server for a given audience
#[derive(Debug, Clone)]
pub struct MetadataIdentityToken {
    address: String,
    audience: String,
}

impl MetadataIdentityToken {
    pub fn new(audience: impl Into<String>) -> Self {
        Self::with_address(DEFAULT_METADATA_ADDR, audience)
    }

    /// Use a metadata server other than the default one (`host:port`).
    pub fn with_address(address: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            audience: audience.into(),
        }
    }

    fn request_path(&self) -> String {
        let audience: String =
            url::form_urlencoded::byte_serialize(self.audience.as_bytes()).collect();
        format!("{}?audience={}", IDENTITY_PATH, audience)
    }

    fn host(&self) -> &str {
        self.address
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.address)
    }

    async fn fetch(&self) -> Result<String, CredentialError> {
        let stream = TcpStream::connect(&self.address).await.map_err(|e| {
            CredentialError::MetadataUnreachable {
                address: self.address.clone(),
                reason: e.to_string(),
            }
        })?;

        let io = TokioIo::new(stream);

        let (mut sender, conn) = http1::handshake(io).await.map_err(|e| {
            CredentialError::MetadataRequest(format!("HTTP handshake failed: {}", e))
        })?;

        // Spawn connection driver
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Metadata connection closed: {}", e);
            }
        });

        let request = http::Request::builder()
            .method(http::Method::GET)
            .uri(self.request_path())
            .header(http::header::HOST, self.host())
            .header("Metadata-Flavor", "Google")
            .body(Empty::<Bytes>::new())
            .map_err(|e| CredentialError::MetadataRequest(format!("Invalid request: {}", e)))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| CredentialError::MetadataRequest(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CredentialError::MetadataStatus(status));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| {
                CredentialError::MetadataRequest(format!("Failed to read response body: {}", e))
            })?
            .to_bytes();

        String::from_utf8(body.to_vec())
            .map(|token| token.trim().to_string())
            .map_err(|_| {
                CredentialError::MetadataRequest("identity token is not UTF-8".to_string())
            })
    }
}

#[async_trait]
impl CredentialSource for MetadataIdentityToken {
    async fn token(&self) -> Result<Option<String>, CredentialError> {
        let token = tokio::time::timeout(METADATA_TIMEOUT, self.fetch())
            .await
            .map_err(|_| CredentialError::MetadataUnreachable {
                address: self.address.clone(),
                reason: format!("no response within {:?}", METADATA_TIMEOUT),
            })??;

        if token.is_empty() {
            return Ok(None);
        }
        Ok(Some(token))
    }
}
