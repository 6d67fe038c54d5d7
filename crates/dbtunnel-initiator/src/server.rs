//! Initiator accept loop
//!
//! Every accepted client gets a fresh HTTP/2 connection and one POST request.
//! Only after the remote endpoint answers 2xx does the session start pumping;
//! any failure before that closes the client connection without forwarding a
//! byte.

use dbtunnel_transport::{Endpoint, Output, Role, Session, ShutdownController};
use dbtunnel_transport_h2::{H2Config, H2Connector, H2Stream, TransportError, TunnelTarget};
use http::HeaderValue;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::credential::{bearer_authorization, CredentialSource};

#[derive(Debug, Error)]
pub enum InitiatorError {
    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Failed to accept TCP connection: {0}")]
    Accept(#[source] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid tunnel request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct InitiatorConfig {
    pub bind_addr: SocketAddr,
    pub target: TunnelTarget,
    pub h2: H2Config,
}

impl InitiatorConfig {
    /// Listen on all interfaces at `port` and tunnel to `target` over TLS.
    pub fn new(port: u16, target: TunnelTarget) -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            target,
            h2: H2Config::client_default(),
        }
    }

    pub fn with_h2_config(mut self, h2: H2Config) -> Self {
        self.h2 = h2;
        self
    }

    pub fn validate(&self) -> Result<(), InitiatorError> {
        self.h2.validate()?;
        Ok(())
    }
}

/// Shared per-connection state
#[derive(Debug)]
struct Shared {
    target: TunnelTarget,
    connector: H2Connector,
    credentials: Arc<dyn CredentialSource>,
    shutdown: ShutdownController,
}

pub struct Initiator {
    listener: TcpListener,
    shared: Arc<Shared>,
    tracker: TaskTracker,
}

impl Initiator {
    pub async fn bind(
        config: InitiatorConfig,
        credentials: Arc<dyn CredentialSource>,
        shutdown: ShutdownController,
    ) -> Result<Self, InitiatorError> {
        config.validate()?;

        let connector = H2Connector::new(Arc::new(config.h2))?;
        let listener = bind_with_retry(config.bind_addr).await?;

        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                target: config.target,
                connector,
                credentials,
                shutdown,
            }),
            tracker: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, InitiatorError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients until shutdown (`Ok`) or an accept error (`Err`).
    ///
    /// On shutdown the listener is closed first, then running sessions are
    /// awaited; they observe the same shutdown signal and close promptly.
    pub async fn run(self) -> Result<(), InitiatorError> {
        let Initiator {
            listener,
            shared,
            tracker,
        } = self;

        let addr = listener.local_addr()?;
        info!(
            "Initiator listening on {}, tunneling to {}",
            addr, shared.target
        );

        let result = loop {
            tokio::select! {
                biased;
                _ = shared.shutdown.cancelled() => {
                    info!("Shutdown requested, no longer accepting connections on {}", addr);
                    break Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!("New TCP connection from {}", peer_addr);
                        tracker.spawn(handle_connection(stream, peer_addr, shared.clone()));
                    }
                    Err(e) => {
                        error!("Failed to accept TCP connection: {}", e);
                        break Err(InitiatorError::Accept(e));
                    }
                },
            }
        };

        drop(listener);
        tracker.close();

        if result.is_ok() {
            debug!("Waiting for {} active session(s)", tracker.len());
            tracker.wait().await;
            info!("Initiator stopped");
        }
        result
    }
}

async fn bind_with_retry(bind_addr: SocketAddr) -> Result<TcpListener, InitiatorError> {
    // Retry bind to ride out TIME_WAIT after a quick restart (up to 3 attempts with 1 second delays)
    for attempt in 1..=3 {
        match TcpListener::bind(bind_addr).await {
            Ok(listener) => {
                if attempt > 1 {
                    info!(
                        "Successfully bound to {} on attempt {}/3",
                        bind_addr, attempt
                    );
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < 3 => {
                warn!(
                    "Port {} is in use (attempt {}/3, may be in TIME_WAIT state), retrying in 1 second...",
                    bind_addr.port(), attempt
                );
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(e) => {
                return Err(InitiatorError::BindError {
                    address: bind_addr.ip().to_string(),
                    port: bind_addr.port(),
                    reason: e.to_string(),
                });
            }
        }
    }

    Err(InitiatorError::BindError {
        address: bind_addr.ip().to_string(),
        port: bind_addr.port(),
        reason: "Address in use after 3 retry attempts".to_string(),
    })
}

async fn handle_connection(mut client: TcpStream, peer_addr: SocketAddr, shared: Arc<Shared>) {
    let _ = client.set_nodelay(true);

    let opened = tokio::select! {
        biased;
        _ = shared.shutdown.cancelled() => {
            debug!("Shutdown while opening tunnel for {}", peer_addr);
            None
        }
        result = open_tunnel(&shared) => match result {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!("Failed to open tunnel for {}: {}", peer_addr, e);
                None
            }
        },
    };

    let Some(stream) = opened else {
        let _ = client.shutdown().await;
        return;
    };

    let (remote_read, remote_write) = stream.into_split();
    let (client_read, client_write) = client.into_split();

    let session = Session::new(Role::Initiator, peer_addr.to_string(), &shared.shutdown);
    let front = Endpoint::new("client", client_read, Output::Plain(client_write));
    let back = Endpoint::new("remote", remote_read, Output::Plain(remote_write));
    session.run(front, back).await;
}

async fn open_tunnel(shared: &Shared) -> Result<H2Stream, InitiatorError> {
    let authorization = match bearer_authorization(shared.credentials.as_ref()).await {
        Ok(value) => value,
        Err(e) => {
            warn!(
                "Failed to fetch credentials, sending request without them: {}",
                e
            );
            None
        }
    };

    let request = tunnel_request(&shared.target, authorization)?;
    let conn = shared.connector.connect(&shared.target).await?;
    Ok(conn.open_tunnel(request).await?)
}

fn tunnel_request(
    target: &TunnelTarget,
    authorization: Option<HeaderValue>,
) -> Result<http::Request<()>, InitiatorError> {
    let mut builder = http::Request::builder()
        .method(http::Method::POST)
        .uri(target.uri().clone());

    if let Some(value) = authorization {
        builder = builder.header(http::header::AUTHORIZATION, value);
    }

    builder
        .body(())
        .map_err(|e| InitiatorError::InvalidRequest(e.to_string()))
}
