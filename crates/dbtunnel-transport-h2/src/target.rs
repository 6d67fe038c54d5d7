//! Remote tunnel endpoint address

use http::Uri;
use url::{Host, Url};

use crate::error::{TransportError, TransportResult};

/// The URL every tunnel request is POSTed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    url: Url,
    uri: Uri,
    host: String,
    port: u16,
}

impl TunnelTarget {
    /// Parse and validate an `http://` or `https://` URL.
    pub fn parse(input: &str) -> TransportResult<Self> {
        let url = Url::parse(input).map_err(|e| TransportError::InvalidTarget(e.to_string()))?;

        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(TransportError::InvalidTarget(format!(
                    "unsupported scheme '{}' (expected http or https)",
                    other
                )))
            }
        }

        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => {
                return Err(TransportError::InvalidTarget(format!(
                    "missing host in '{}'",
                    input
                )))
            }
        };

        let port = url.port_or_known_default().ok_or_else(|| {
            TransportError::InvalidTarget(format!("cannot determine port for '{}'", input))
        })?;

        let uri: Uri = url
            .as_str()
            .parse()
            .map_err(|e: http::uri::InvalidUri| TransportError::InvalidTarget(e.to_string()))?;

        Ok(Self {
            url,
            uri,
            host,
            port,
        })
    }

    /// Request URI, with scheme and authority as HTTP/2 needs them.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Host to dial and to present as TLS server name.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_https(&self) -> bool {
        self.url.scheme() == "https"
    }
}

impl std::fmt::Display for TunnelTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.url.as_str())
    }
}
