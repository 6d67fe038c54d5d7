//! Session lifecycle
//!
//! A session pairs a front-end and a back-end endpoint and runs one pump per
//! direction. Its token is a child of the process-wide shutdown token, so it
//! fires when either pump stops or the process shuts down. Once it fires, the
//! session collects the endpoint halves back from both pumps and closes each
//! endpoint exactly once.

use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};
use uuid::Uuid;

use crate::pump::{pump, Direction, Output, PumpExit, PumpReport};
use crate::shutdown::ShutdownController;

/// Which edge of the tunnel a session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client-facing edge: TCP in front, HTTP/2 request behind.
    Initiator,
    /// Backend-facing edge: HTTP/2 request in front, backend TCP behind.
    Terminator,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Terminator => f.write_str("terminator"),
        }
    }
}

/// Why a session was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownCause {
    /// One of the pumps stopped on its own.
    Finished,
    /// The process-wide shutdown signal fired.
    Shutdown,
}

/// A readable half plus its output, named for logging.
#[derive(Debug)]
pub struct Endpoint<R, W> {
    name: &'static str,
    reader: R,
    output: Output<W>,
}

impl<R, W> Endpoint<R, W> {
    pub fn new(name: &'static str, reader: R, output: Output<W>) -> Self {
        Self {
            name,
            reader,
            output,
        }
    }
}

impl<R, W: AsyncWrite + Unpin> Endpoint<R, W> {
    /// Shut the output down and drop the reader.
    ///
    /// Errors are swallowed: the peer may already have closed its side.
    pub async fn close(self) {
        let Endpoint {
            name,
            reader,
            mut output,
        } = self;
        close_output(name, &mut output).await;
        drop(reader);
    }
}

async fn close_output<W: AsyncWrite + Unpin>(name: &str, output: &mut Output<W>) {
    if let Err(e) = output.close().await {
        trace!("Close of {} endpoint reported: {}", name, e);
    }
}

/// What a finished session did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: Uuid,
    pub role: Role,
    pub cause: TeardownCause,
    pub upstream: PumpReport,
    pub downstream: PumpReport,
}

impl SessionSummary {
    pub fn is_clean(&self) -> bool {
        self.upstream.exit.is_clean() && self.downstream.exit.is_clean()
    }
}

/// One tunnel session.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    role: Role,
    peer: String,
    shutdown: ShutdownController,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(role: Role, peer: impl Into<String>, shutdown: &ShutdownController) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            peer: peer.into(),
            shutdown: shutdown.clone(),
            cancel: shutdown.child_token(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Token that tears this session down when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run both pumps until the session is torn down, then close both endpoints.
    pub async fn run<FR, FW, BR, BW>(
        self,
        front: Endpoint<FR, FW>,
        back: Endpoint<BR, BW>,
    ) -> SessionSummary
    where
        FR: AsyncRead + Unpin + Send + 'static,
        FW: AsyncWrite + Unpin + Send + 'static,
        BR: AsyncRead + Unpin + Send + 'static,
        BW: AsyncWrite + Unpin + Send + 'static,
    {
        let Endpoint {
            name: front_name,
            reader: mut front_reader,
            output: mut front_output,
        } = front;
        let Endpoint {
            name: back_name,
            reader: mut back_reader,
            output: mut back_output,
        } = back;

        debug!(
            session_id = %self.id,
            role = %self.role,
            peer = %self.peer,
            "Session started ({} <-> {})",
            front_name,
            back_name
        );

        let cancel = self.cancel.clone();
        let upstream = tokio::spawn(async move {
            let report = pump(
                Direction::Upstream,
                &mut front_reader,
                &mut back_output,
                &cancel,
            )
            .await;
            (front_reader, back_output, report)
        });

        let cancel = self.cancel.clone();
        let downstream = tokio::spawn(async move {
            let report = pump(
                Direction::Downstream,
                &mut back_reader,
                &mut front_output,
                &cancel,
            )
            .await;
            (back_reader, front_output, report)
        });

        let cause = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => TeardownCause::Shutdown,
            _ = self.cancel.cancelled() => TeardownCause::Finished,
        };
        debug!(session_id = %self.id, ?cause, "Session teardown started");

        // Pumps hand their halves back so the endpoints can be reassembled and closed.
        let (upstream, downstream) = tokio::join!(upstream, downstream);

        let (front_reader, back_output, upstream) = match upstream {
            Ok((reader, output, report)) => (Some(reader), Some(output), report),
            Err(e) => {
                error!(session_id = %self.id, "Upstream pump task failed: {}", e);
                (None, None, failed_report(Direction::Upstream))
            }
        };
        let (back_reader, front_output, downstream) = match downstream {
            Ok((reader, output, report)) => (Some(reader), Some(output), report),
            Err(e) => {
                error!(session_id = %self.id, "Downstream pump task failed: {}", e);
                (None, None, failed_report(Direction::Downstream))
            }
        };

        close_halves(front_name, front_reader, front_output).await;
        close_halves(back_name, back_reader, back_output).await;

        let summary = SessionSummary {
            id: self.id,
            role: self.role,
            cause,
            upstream,
            downstream,
        };

        info!(
            session_id = %self.id,
            role = %self.role,
            peer = %self.peer,
            bytes_upstream = upstream.bytes,
            bytes_downstream = downstream.bytes,
            ?cause,
            "Session closed"
        );

        summary
    }
}

async fn close_halves<R, W: AsyncWrite + Unpin>(
    name: &'static str,
    reader: Option<R>,
    output: Option<Output<W>>,
) {
    match (reader, output) {
        (Some(reader), Some(output)) => Endpoint::new(name, reader, output).close().await,
        (reader, output) => {
            drop(reader);
            if let Some(mut output) = output {
                close_output(name, &mut output).await;
            }
        }
    }
}

fn failed_report(direction: Direction) -> PumpReport {
    PumpReport {
        direction,
        bytes: 0,
        exit: PumpExit::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_display() {
        assert_eq!(Role::Initiator.to_string(), "initiator");
        assert_eq!(Role::Terminator.to_string(), "terminator");
    }

    #[test]
    fn test_session_token_is_child_of_shutdown() {
        let shutdown = ShutdownController::new();
        let session = Session::new(Role::Initiator, "127.0.0.1:5000", &shutdown);
        let token = session.cancel_token();

        assert!(!token.is_cancelled());
        shutdown.trigger();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_sessions_have_distinct_ids() {
        let shutdown = ShutdownController::new();
        let a = Session::new(Role::Terminator, "a", &shutdown);
        let b = Session::new(Role::Terminator, "b", &shutdown);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.role(), Role::Terminator);
    }
}
