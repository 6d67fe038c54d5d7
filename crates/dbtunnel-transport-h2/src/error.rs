//! Transport errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Invalid target URL: {0}")]
    InvalidTarget(String),

    #[error("Remote endpoint answered with status {0}")]
    UnexpectedStatus(http::StatusCode),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unexpected_status_display() {
        let err = TransportError::UnexpectedStatus(http::StatusCode::FORBIDDEN);
        assert!(err.to_string().contains("403"));
    }

    #[test]
    fn test_bind_error_mentions_port() {
        let err = TransportError::BindError {
            address: "0.0.0.0".to_string(),
            port: 3306,
            reason: "Address already in use".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("0.0.0.0"));
        assert!(msg.contains("lsof -i :3306"));
    }
}
