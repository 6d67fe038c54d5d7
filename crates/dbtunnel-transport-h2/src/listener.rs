//! HTTP/2 listener and connector implementations

use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::config::H2Config;
use crate::connection::{H2ClientConnection, H2ServerConnection};
use crate::error::{TransportError, TransportResult};
use crate::target::TunnelTarget;
use crate::BoxedIo;

/// HTTP/2 listener for accepting incoming connections
pub struct H2Listener {
    tcp_listener: TcpListener,
    tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
    config: Arc<H2Config>,
}

impl std::fmt::Debug for H2Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Listener")
            .field("local_addr", &self.tcp_listener.local_addr())
            .field("tls", &self.tls_acceptor.is_some())
            .finish()
    }
}

impl H2Listener {
    /// Bind synchronously; must be called from within a tokio runtime.
    pub fn new(bind_addr: SocketAddr, config: Arc<H2Config>) -> TransportResult<Self> {
        config.validate()?;

        let tls_acceptor = if config.tls {
            Some(config.build_tls_acceptor()?)
        } else {
            None
        };

        // Create TCP listener synchronously using std
        let std_listener = std::net::TcpListener::bind(bind_addr).map_err(|e| {
            let port = bind_addr.port();
            let address = bind_addr.ip().to_string();
            TransportError::BindError {
                address,
                port,
                reason: e.to_string(),
            }
        })?;

        std_listener.set_nonblocking(true).map_err(|e| {
            TransportError::ConfigurationError(format!("Failed to set nonblocking: {}", e))
        })?;

        let tcp_listener = TcpListener::from_std(std_listener).map_err(TransportError::IoError)?;

        let local_addr = tcp_listener.local_addr().map_err(TransportError::IoError)?;
        info!(
            "HTTP/2 listener bound to {} ({})",
            local_addr,
            if config.tls { "TLS" } else { "h2c" }
        );

        Ok(Self {
            tcp_listener,
            tls_acceptor,
            config,
        })
    }

    /// Accept the next TCP connection. Handshakes are left to the caller so a
    /// slow peer cannot stall the accept loop.
    pub async fn accept(&self) -> TransportResult<IncomingConnection> {
        let (tcp_stream, remote_addr) = self
            .tcp_listener
            .accept()
            .await
            .map_err(TransportError::IoError)?;

        debug!("Incoming TCP connection from {}", remote_addr);
        let _ = tcp_stream.set_nodelay(true);

        Ok(IncomingConnection {
            tcp_stream,
            remote_addr,
            tls_acceptor: self.tls_acceptor.clone(),
            config: self.config.clone(),
        })
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.tcp_listener
            .local_addr()
            .map_err(TransportError::IoError)
    }
}

/// A TCP connection that has not yet completed TLS or the HTTP/2 preface
pub struct IncomingConnection {
    tcp_stream: TcpStream,
    remote_addr: SocketAddr,
    tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
    config: Arc<H2Config>,
}

impl std::fmt::Debug for IncomingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingConnection")
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

impl IncomingConnection {
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub async fn handshake(self) -> TransportResult<H2ServerConnection> {
        let remote_addr = self.remote_addr;

        let io: BoxedIo = match self.tls_acceptor {
            Some(acceptor) => {
                let tls_stream = acceptor.accept(self.tcp_stream).await.map_err(|e| {
                    TransportError::TlsError(format!(
                        "TLS handshake failed from {}: {}",
                        remote_addr, e
                    ))
                })?;
                debug!("TLS handshake complete from {}", remote_addr);
                Box::new(tls_stream)
            }
            None => Box::new(self.tcp_stream),
        };

        let conn = H2ServerConnection::handshake(io, remote_addr, &self.config).await?;
        debug!("HTTP/2 connection established from {}", remote_addr);
        Ok(conn)
    }
}

/// HTTP/2 connector for establishing outgoing connections
pub struct H2Connector {
    tls_connector: Option<tokio_rustls::TlsConnector>,
    config: Arc<H2Config>,
}

impl std::fmt::Debug for H2Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Connector")
            .field("tls", &self.tls_connector.is_some())
            .field("verify_server_cert", &self.config.verify_server_cert)
            .finish()
    }
}

impl H2Connector {
    pub fn new(config: Arc<H2Config>) -> TransportResult<Self> {
        config.validate()?;

        let tls_connector = if config.tls {
            Some(config.build_tls_connector()?)
        } else {
            None
        };

        debug!("HTTP/2 connector created");

        Ok(Self {
            tls_connector,
            config,
        })
    }

    /// Open a fresh HTTP/2 connection to `target`.
    pub async fn connect(&self, target: &TunnelTarget) -> TransportResult<H2ClientConnection> {
        debug!(
            "Connecting to HTTP/2 server: {}:{}",
            target.host(),
            target.port()
        );

        // Connect TCP
        let tcp_stream = TcpStream::connect((target.host(), target.port()))
            .await
            .map_err(|e| TransportError::ConnectionError(format!("TCP connect failed: {}", e)))?;
        let _ = tcp_stream.set_nodelay(true);
        let remote_addr = tcp_stream.peer_addr().map_err(TransportError::IoError)?;

        let io: BoxedIo = match &self.tls_connector {
            Some(tls_connector) => {
                let dns_name = ServerName::try_from(target.host().to_string())
                    .map_err(|e| TransportError::TlsError(format!("Invalid server name: {}", e)))?;

                let tls_stream = tls_connector
                    .connect(dns_name, tcp_stream)
                    .await
                    .map_err(|e| TransportError::TlsError(format!("TLS handshake failed: {}", e)))?;
                Box::new(tls_stream)
            }
            None => Box::new(tcp_stream),
        };

        let conn = H2ClientConnection::handshake(io, remote_addr, &self.config).await?;

        debug!(
            "HTTP/2 connection established to {} ({})",
            target.host(),
            remote_addr
        );

        Ok(conn)
    }
}
