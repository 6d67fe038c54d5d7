//! HTTP/2 client and server connections
//!
//! A tunnel uses exactly one stream per connection, so these types stay thin:
//! the client side opens one request and hands back its bodies, the server side
//! yields requests for the caller to accept or reject.

use bytes::Bytes;
use h2::client::SendRequest;
use h2::server::SendResponse;
use h2::RecvStream;
use http::{HeaderMap, Method, StatusCode, Uri};
use std::net::SocketAddr;
use tracing::{debug, error, warn};

use crate::config::H2Config;
use crate::error::{TransportError, TransportResult};
use crate::stream::H2Stream;
use crate::BoxedIo;

/// Client-side HTTP/2 connection
pub struct H2ClientConnection {
    connection_id: String,
    remote_addr: SocketAddr,
    send_request: SendRequest<Bytes>,
}

impl std::fmt::Debug for H2ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2ClientConnection")
            .field("connection_id", &self.connection_id)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

impl H2ClientConnection {
    pub(crate) async fn handshake(
        io: BoxedIo,
        remote_addr: SocketAddr,
        config: &H2Config,
    ) -> TransportResult<Self> {
        let connection_id = format!("h2-client-{}", uuid::Uuid::new_v4());

        let (send_request, h2_conn) = config
            .client_builder()
            .handshake::<_, Bytes>(io)
            .await
            .map_err(|e| TransportError::ConnectionError(format!("H2 handshake failed: {}", e)))?;

        // Spawn connection driver
        let conn_id = connection_id.clone();
        tokio::spawn(async move {
            if let Err(e) = h2_conn.await {
                if !e.is_go_away() && !e.is_io() {
                    error!("[{}] H2 connection error: {}", conn_id, e);
                }
            }
            debug!("[{}] H2 connection closed", conn_id);
        });

        Ok(Self {
            connection_id,
            remote_addr,
            send_request,
        })
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Send the tunnel request and wait for the response headers.
    ///
    /// The request body stays open for upstream bytes. Any non-2xx status is
    /// returned as [`TransportError::UnexpectedStatus`] and the stream dropped.
    /// The connection closes once the returned stream is finished.
    pub async fn open_tunnel(self, request: http::Request<()>) -> TransportResult<H2Stream> {
        // Wait for the connection to be ready
        let mut ready_request = self.send_request.ready().await.map_err(|e| {
            TransportError::ConnectionError(format!("H2 connection not ready: {}", e))
        })?;

        let (response, send_stream) = ready_request.send_request(request, false).map_err(|e| {
            TransportError::ConnectionError(format!("Failed to open stream: {}", e))
        })?;

        // Wait for response
        let response = response.await.map_err(|e| {
            TransportError::ConnectionError(format!("Failed to get response: {}", e))
        })?;

        let status = response.status();
        if !status.is_success() {
            debug!(
                "[{}] Tunnel request refused with {}",
                self.connection_id, status
            );
            return Err(TransportError::UnexpectedStatus(status));
        }

        let stream = H2Stream::new(send_stream, response.into_body());
        debug!(
            "[{}] Opened tunnel stream {}",
            self.connection_id,
            stream.stream_id()
        );
        Ok(stream)
    }
}

/// Server-side HTTP/2 connection
///
/// The h2 connection only makes progress while [`accept`](Self::accept) is
/// being polled, so the owner must keep calling it for as long as any stream
/// from this connection is in use.
pub struct H2ServerConnection {
    connection_id: String,
    remote_addr: SocketAddr,
    conn: h2::server::Connection<BoxedIo, Bytes>,
    shutting_down: bool,
}

impl std::fmt::Debug for H2ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2ServerConnection")
            .field("connection_id", &self.connection_id)
            .field("remote_addr", &self.remote_addr)
            .field("shutting_down", &self.shutting_down)
            .finish()
    }
}

impl H2ServerConnection {
    pub(crate) async fn handshake(
        io: BoxedIo,
        remote_addr: SocketAddr,
        config: &H2Config,
    ) -> TransportResult<Self> {
        let connection_id = format!("h2-server-{}", uuid::Uuid::new_v4());

        let conn = config
            .server_builder()
            .handshake::<_, Bytes>(io)
            .await
            .map_err(|e| TransportError::ConnectionError(format!("H2 handshake failed: {}", e)))?;

        Ok(Self {
            connection_id,
            remote_addr,
            conn,
            shutting_down: false,
        })
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Next request on this connection; `None` once the connection is done.
    pub async fn accept(&mut self) -> Option<TransportResult<H2Request>> {
        match self.conn.accept().await {
            Some(Ok((request, respond))) => {
                debug!("[{}] Accepted H2 stream", self.connection_id);
                Some(Ok(H2Request::new(request, respond)))
            }
            Some(Err(e)) => {
                if e.is_go_away() || e.is_io() {
                    debug!("[{}] H2 connection ended: {}", self.connection_id, e);
                } else {
                    warn!("[{}] H2 accept error: {}", self.connection_id, e);
                }
                Some(Err(TransportError::ConnectionError(format!(
                    "H2 accept failed: {}",
                    e
                ))))
            }
            None => {
                debug!("[{}] H2 connection closed", self.connection_id);
                None
            }
        }
    }

    /// Send GOAWAY and stop taking new streams. Existing streams finish
    /// normally; keep polling [`accept`](Self::accept) until it yields `None`.
    pub fn graceful_shutdown(&mut self) {
        if !self.shutting_down {
            self.shutting_down = true;
            debug!("[{}] Starting graceful shutdown", self.connection_id);
            self.conn.graceful_shutdown();
        }
    }
}

/// An incoming request, to be turned into a tunnel or refused
pub struct H2Request {
    parts: http::request::Parts,
    body: RecvStream,
    respond: SendResponse<Bytes>,
}

impl std::fmt::Debug for H2Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Request")
            .field("method", &self.parts.method)
            .field("uri", &self.parts.uri)
            .finish()
    }
}

impl H2Request {
    fn new(request: http::Request<RecvStream>, respond: SendResponse<Bytes>) -> Self {
        let (parts, body) = request.into_parts();
        Self {
            parts,
            body,
            respond,
        }
    }

    pub fn method(&self) -> &Method {
        &self.parts.method
    }

    pub fn uri(&self) -> &Uri {
        &self.parts.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    pub fn stream_id(&self) -> u32 {
        self.respond.stream_id().as_u32()
    }

    /// Answer 200 without ending the response, and hand back both bodies.
    pub fn accept(mut self) -> TransportResult<H2Stream> {
        let response = http::Response::builder()
            .status(StatusCode::OK)
            .body(())
            .map_err(|e| TransportError::ProtocolError(format!("Invalid response: {}", e)))?;

        let send_stream = self.respond.send_response(response, false).map_err(|e| {
            TransportError::ConnectionError(format!("Failed to send response: {}", e))
        })?;

        Ok(H2Stream::new(send_stream, self.body))
    }

    /// Answer with `status` and a short text body, ending the stream.
    pub fn reject(mut self, status: StatusCode, body: impl Into<Bytes>) -> TransportResult<()> {
        let body = body.into();
        let response = http::Response::builder()
            .status(status)
            .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(())
            .map_err(|e| TransportError::ProtocolError(format!("Invalid response: {}", e)))?;

        let mut send_stream = self
            .respond
            .send_response(response, body.is_empty())
            .map_err(|e| {
                TransportError::ConnectionError(format!("Failed to send response: {}", e))
            })?;

        if !body.is_empty() {
            send_stream.send_data(body, true).map_err(|e| {
                TransportError::ConnectionError(format!("Failed to send response body: {}", e))
            })?;
        }
        Ok(())
    }
}
