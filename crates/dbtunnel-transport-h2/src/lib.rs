//! HTTP/2 transport for the database tunnel, built on h2
//!
//! One tunnel is one HTTP/2 request: the request body carries client→backend
//! bytes and the response body carries backend→client bytes. This crate
//! provides both ends of that exchange:
//!
//! - **Client**: [`H2Connector`] dials the remote endpoint (TLS with ALPN `h2`,
//!   or cleartext h2c) and [`H2ClientConnection::open_tunnel`] sends the POST
//! - **Server**: [`H2Listener`] accepts connections and yields [`H2Request`]s
//!   that are either accepted as a tunnel or rejected with a status
//! - **Streams**: [`H2Reader`]/[`H2Writer`] adapt h2 bodies to tokio's
//!   `AsyncRead`/`AsyncWrite`, so they plug straight into a tunnel session
//!
//! Each tunnel gets its own HTTP/2 connection; nothing is multiplexed.

pub mod config;
pub mod connection;
pub mod error;
pub mod listener;
pub mod stream;
pub mod target;

pub use config::H2Config;
pub use connection::{H2ClientConnection, H2Request, H2ServerConnection};
pub use error::{TransportError, TransportResult};
pub use listener::{H2Connector, H2Listener, IncomingConnection};
pub use stream::{H2Reader, H2Stream, H2Writer};
pub use target::TunnelTarget;

use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream an HTTP/2 connection can run over (plain TCP or TLS).
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// Type-erased connection I/O so plain and TLS sockets share one connection type.
pub type BoxedIo = Box<dyn Io>;
