//! Protocol-agnostic building blocks for the database tunnel
//!
//! This crate holds everything both tunnel roles share:
//!
//! - **Shutdown**: [`ShutdownController`], the process-wide cancellation handle
//! - **Pump**: [`pump`], the one-direction byte copy loop
//! - **Session**: [`Session`], which runs two pumps and closes both endpoints once
//! - **Dialer**: [`RetryingDialer`], bounded-retry TCP dialing for cold starts
//!
//! Nothing in here looks at the tunneled bytes. Endpoints are any
//! `AsyncRead`/`AsyncWrite` pair, so the same session runs over a TCP socket,
//! an HTTP/2 body, or an in-memory duplex in tests.

pub mod dial;
pub mod pump;
pub mod session;
pub mod shutdown;

pub use dial::{DialError, DialPolicy, RetryingDialer};
pub use pump::{pump, Direction, Output, PumpExit, PumpReport, DEFAULT_CHUNK_SIZE};
pub use session::{Endpoint, Role, Session, SessionSummary, TeardownCause};
pub use shutdown::ShutdownController;
