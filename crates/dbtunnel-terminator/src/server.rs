use bytes::Bytes;
use dbtunnel_transport::{
    DialError, DialPolicy, Endpoint, Output, RetryingDialer, Role, Session, ShutdownController,
};
use dbtunnel_transport_h2::{H2Config, H2Listener, H2Request, IncomingConnection, TransportError};
use http::StatusCode;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Response body sent when the backend cannot be reached within the dial budget.
pub const BACKEND_UNAVAILABLE_BODY: &str = "impossible to connect to the backend internally\n";

/// Response body sent when shutdown interrupts a backend dial.
pub const SHUTTING_DOWN_BODY: &str = "server is shutting down\n";

/// How long an HTTP/2 connection may take to drain after GOAWAY.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum TerminatorError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to accept connection: {0}")]
    Accept(#[source] TransportError),
}

#[derive(Debug, Clone)]
pub struct TerminatorConfig {
    pub bind_addr: SocketAddr,
    pub backend_addr: String,
    pub dial_policy: DialPolicy,
    pub drain_timeout: Duration,
    pub h2: H2Config,
}

impl TerminatorConfig {
    /// Serve h2c on all interfaces at `port`, forwarding to `backend_addr`.
    pub fn new(port: u16, backend_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            backend_addr: backend_addr.into(),
            dial_policy: DialPolicy::default(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            h2: H2Config::server_cleartext(),
        }
    }

    pub fn with_h2_config(mut self, h2: H2Config) -> Self {
        self.h2 = h2;
        self
    }

    pub fn with_dial_policy(mut self, policy: DialPolicy) -> Self {
        self.dial_policy = policy;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), TerminatorError> {
        if self.backend_addr.trim().is_empty() {
            return Err(TerminatorError::InvalidConfig(
                "backend address must not be empty".to_string(),
            ));
        }
        if self.dial_policy.interval.is_zero() {
            return Err(TerminatorError::InvalidConfig(
                "dial retry interval must be > 0".to_string(),
            ));
        }
        self.h2.validate()?;
        Ok(())
    }
}

pub struct Terminator {
    listener: H2Listener,
    dialer: Arc<RetryingDialer>,
    drain_timeout: Duration,
    shutdown: ShutdownController,
    tracker: TaskTracker,
}

impl Terminator {
    /// Bind the HTTP/2 listener; must be called from within a tokio runtime.
    pub fn bind(
        config: TerminatorConfig,
        shutdown: ShutdownController,
    ) -> Result<Self, TerminatorError> {
        config.validate()?;

        let listener = H2Listener::new(config.bind_addr, Arc::new(config.h2))?;
        let dialer = RetryingDialer::new(config.backend_addr, config.dial_policy);

        Ok(Self {
            listener,
            dialer: Arc::new(dialer),
            drain_timeout: config.drain_timeout,
            shutdown,
            tracker: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TerminatorError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until shutdown (`Ok`) or an accept error (`Err`).
    pub async fn run(self) -> Result<(), TerminatorError> {
        let Terminator {
            listener,
            dialer,
            drain_timeout,
            shutdown,
            tracker,
        } = self;

        let addr = listener.local_addr()?;
        info!(
            "Terminator listening on {}, backend {}",
            addr,
            dialer.address()
        );

        let result = loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, no longer accepting connections on {}", addr);
                    break Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(incoming) => {
                        tracker.spawn(serve_connection(
                            incoming,
                            dialer.clone(),
                            drain_timeout,
                            shutdown.clone(),
                            tracker.clone(),
                        ));
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        break Err(TerminatorError::Accept(e));
                    }
                },
            }
        };

        drop(listener);
        tracker.close();

        if result.is_ok() {
            debug!("Waiting for {} active task(s)", tracker.len());
            tracker.wait().await;
            info!("Terminator stopped");
        }
        result
    }
}

/// Drive one HTTP/2 connection, spawning a tunnel per request.
async fn serve_connection(
    incoming: IncomingConnection,
    dialer: Arc<RetryingDialer>,
    drain_timeout: Duration,
    shutdown: ShutdownController,
    tracker: TaskTracker,
) {
    let peer_addr = incoming.remote_addr();

    let handshake = tokio::select! {
        biased;
        _ = shutdown.cancelled() => return,
        result = incoming.handshake() => result,
    };
    let mut conn = match handshake {
        Ok(conn) => conn,
        Err(e) => {
            warn!(peer = %peer_addr, "Handshake failed: {}", e);
            return;
        }
    };

    debug!(peer = %peer_addr, connection_id = %conn.connection_id(), "HTTP/2 connection ready");

    // Armed once shutdown starts; a peer that never acks the GOAWAY is dropped.
    let drain_deadline = tokio::time::sleep(drain_timeout);
    tokio::pin!(drain_deadline);

    let mut draining = false;
    loop {
        tokio::select! {
            _ = shutdown.cancelled(), if !draining => {
                conn.graceful_shutdown();
                drain_deadline
                    .as_mut()
                    .reset(tokio::time::Instant::now() + drain_timeout);
                draining = true;
            }
            _ = &mut drain_deadline, if draining => {
                warn!(
                    peer = %peer_addr,
                    "HTTP/2 connection did not drain within {:?}, closing",
                    drain_timeout
                );
                break;
            }
            next = conn.accept() => match next {
                Some(Ok(request)) => {
                    tracker.spawn(handle_request(
                        request,
                        peer_addr,
                        dialer.clone(),
                        shutdown.clone(),
                    ));
                }
                Some(Err(_)) | None => break,
            },
        }
    }

    debug!(peer = %peer_addr, "HTTP/2 connection finished");
}

async fn handle_request(
    request: H2Request,
    peer_addr: SocketAddr,
    dialer: Arc<RetryingDialer>,
    shutdown: ShutdownController,
) {
    debug!(
        peer = %peer_addr,
        stream_id = request.stream_id(),
        method = %request.method(),
        uri = %request.uri(),
        "Tunnel request"
    );

    let backend = match dialer.dial(shutdown.token()).await {
        Ok(stream) => stream,
        Err(DialError::Cancelled { .. }) => {
            debug!(peer = %peer_addr, "Shutdown while dialing backend");
            reject(request, StatusCode::SERVICE_UNAVAILABLE, SHUTTING_DOWN_BODY);
            return;
        }
        Err(e) => {
            error!(peer = %peer_addr, "{}", e);
            reject(
                request,
                StatusCode::INTERNAL_SERVER_ERROR,
                BACKEND_UNAVAILABLE_BODY,
            );
            return;
        }
    };
    let _ = backend.set_nodelay(true);

    let stream = match request.accept() {
        Ok(stream) => stream,
        Err(e) => {
            warn!(peer = %peer_addr, "Failed to accept tunnel: {}", e);
            return;
        }
    };

    let (tunnel_read, tunnel_write) = stream.into_split();
    let (backend_read, backend_write) = backend.into_split();

    let session = Session::new(Role::Terminator, peer_addr.to_string(), &shutdown);
    let front = Endpoint::new("tunnel", tunnel_read, Output::Flushing(tunnel_write));
    let back = Endpoint::new("backend", backend_read, Output::Plain(backend_write));
    session.run(front, back).await;
}

fn reject(request: H2Request, status: StatusCode, body: &'static str) {
    if let Err(e) = request.reject(status, Bytes::from_static(body.as_bytes())) {
        debug!("Failed to send {} response: {}", status, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = TerminatorConfig::new(8080, "127.0.0.1:3306");
        assert_eq!(config.bind_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.backend_addr, "127.0.0.1:3306");
        assert_eq!(config.dial_policy.budget, Duration::from_secs(30));
        assert_eq!(config.drain_timeout, DEFAULT_DRAIN_TIMEOUT);
        assert!(!config.h2.tls);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        assert!(TerminatorConfig::new(8080, " ").validate().is_err());

        let config = TerminatorConfig::new(8080, "127.0.0.1:3306").with_dial_policy(DialPolicy {
            budget: Duration::from_secs(1),
            interval: Duration::ZERO,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backend_unavailable_body() {
        assert_eq!(
            BACKEND_UNAVAILABLE_BODY,
            "impossible to connect to the backend internally\n"
        );
    }
}
