//! One-direction byte pump
//!
//! A pump copies chunks from a readable half to an [`Output`] until the input
//! ends, an I/O error occurs, or the session token is cancelled. Two pumps run
//! per session, one per direction. Whichever stops first cancels the session
//! token, which unblocks the other.

use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Size of the chunk read per iteration.
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Which way a pump moves bytes, relative to the session's front-end endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Front-end to back-end
    Upstream,
    /// Back-end to front-end
    Downstream,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upstream => f.write_str("upstream"),
            Direction::Downstream => f.write_str("downstream"),
        }
    }
}

/// Output side of an endpoint.
///
/// The variant is picked by whoever builds the endpoint. Streamed transports
/// that may hold written bytes back (an HTTP/2 response body, for instance) use
/// `Flushing` so every chunk is pushed to the peer as soon as it is written.
#[derive(Debug)]
pub enum Output<W> {
    Plain(W),
    Flushing(W),
}

impl<W> Output<W> {
    pub fn get_ref(&self) -> &W {
        match self {
            Output::Plain(w) | Output::Flushing(w) => w,
        }
    }

    pub fn get_mut(&mut self) -> &mut W {
        match self {
            Output::Plain(w) | Output::Flushing(w) => w,
        }
    }
}

impl<W: AsyncWrite + Unpin> Output<W> {
    /// Write the whole chunk, then flush if this is a flushing output.
    pub async fn send(&mut self, chunk: &[u8]) -> io::Result<()> {
        match self {
            Output::Plain(w) => w.write_all(chunk).await,
            Output::Flushing(w) => {
                w.write_all(chunk).await?;
                w.flush().await
            }
        }
    }

    /// Signal end of stream to the peer.
    pub async fn close(&mut self) -> io::Result<()> {
        self.get_mut().shutdown().await
    }
}

/// How a pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// Input reached end of stream.
    Eof,
    /// The session was already being torn down.
    Cancelled,
    /// The peer reset or aborted the stream.
    PeerClosed,
    /// Any other read or write error.
    Failed,
}

impl PumpExit {
    /// True for the exits that are part of a normal session end.
    pub fn is_clean(&self) -> bool {
        !matches!(self, PumpExit::Failed)
    }
}

/// Outcome of one pump run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpReport {
    pub direction: Direction,
    pub bytes: u64,
    pub exit: PumpExit,
}

/// Copy `reader` into `output` until EOF, error, or cancellation.
///
/// On EOF or error the pump cancels `cancel` itself. When it returns because
/// `cancel` already fired it leaves the token alone.
pub async fn pump<R, W>(
    direction: Direction,
    reader: &mut R,
    output: &mut Output<W>,
    cancel: &CancellationToken,
) -> PumpReport
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; DEFAULT_CHUNK_SIZE];
    let mut bytes = 0u64;

    let exit = loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => break PumpExit::Cancelled,
            read = reader.read(&mut buf) => read,
        };

        let n = match read {
            Ok(0) => {
                debug!(%direction, bytes, "Stream closed by remote");
                cancel.cancel();
                break PumpExit::Eof;
            }
            Ok(n) => n,
            Err(e) => break stop_on_error(direction, "read", e, cancel),
        };

        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => break PumpExit::Cancelled,
            written = output.send(&buf[..n]) => written,
        };

        if let Err(e) = written {
            break stop_on_error(direction, "write", e, cancel);
        }
        bytes += n as u64;
    };

    PumpReport {
        direction,
        bytes,
        exit,
    }
}

fn stop_on_error(
    direction: Direction,
    op: &str,
    error: io::Error,
    cancel: &CancellationToken,
) -> PumpExit {
    // The other direction already closed things under us.
    if cancel.is_cancelled() {
        debug!(%direction, "{} interrupted by session teardown: {}", op, error);
        return PumpExit::Cancelled;
    }

    let exit = if is_peer_close(&error) {
        debug!(%direction, "Peer closed stream during {}: {}", op, error);
        PumpExit::PeerClosed
    } else {
        warn!(%direction, "Error during {}: {}", op, error);
        PumpExit::Failed
    };
    cancel.cancel();
    exit
}

fn is_peer_close(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{duplex, ReadBuf};

    /// Writer that records every write and flush call.
    #[derive(Debug, Default)]
    struct RecordingWriter {
        data: Vec<u8>,
        writes: usize,
        flushes: usize,
    }

    impl AsyncWrite for RecordingWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.data.extend_from_slice(buf);
            self.writes += 1;
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.flushes += 1;
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Reader that fails with the given error kind on first read.
    struct FailingReader(io::ErrorKind);

    impl AsyncRead for FailingReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(self.0, "boom")))
        }
    }

    #[tokio::test]
    async fn test_pump_copies_until_eof_and_cancels() {
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let mut reader = &payload[..];
        let mut output = Output::Plain(RecordingWriter::default());
        let cancel = CancellationToken::new();

        let report = pump(Direction::Upstream, &mut reader, &mut output, &cancel).await;

        assert_eq!(report.exit, PumpExit::Eof);
        assert_eq!(report.bytes, payload.len() as u64);
        assert_eq!(output.get_ref().data, payload);
        assert!(cancel.is_cancelled(), "EOF must tear the session down");
    }

    #[tokio::test]
    async fn test_flushing_output_flushes_after_every_write() {
        let payload = vec![7u8; DEFAULT_CHUNK_SIZE * 3];
        let mut reader = &payload[..];
        let mut output = Output::Flushing(RecordingWriter::default());
        let cancel = CancellationToken::new();

        pump(Direction::Downstream, &mut reader, &mut output, &cancel).await;

        let writer = output.get_ref();
        assert!(writer.writes >= 3);
        assert_eq!(writer.flushes, writer.writes);
    }

    #[tokio::test]
    async fn test_plain_output_never_flushes() {
        let payload = vec![1u8; 100];
        let mut reader = &payload[..];
        let mut output = Output::Plain(RecordingWriter::default());
        let cancel = CancellationToken::new();

        pump(Direction::Upstream, &mut reader, &mut output, &cancel).await;

        assert_eq!(output.get_ref().flushes, 0);
    }

    #[tokio::test]
    async fn test_cancelled_pump_returns_without_data() {
        // The write side of the duplex stays open so the read would block forever.
        let (_keep_open, mut reader) = duplex(64);
        let mut output = Output::Plain(RecordingWriter::default());
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let report = tokio::time::timeout(
            Duration::from_secs(1),
            pump(Direction::Downstream, &mut reader, &mut output, &cancel),
        )
        .await
        .expect("pump should stop once cancelled");

        assert_eq!(report.exit, PumpExit::Cancelled);
        assert_eq!(report.bytes, 0);
    }

    #[tokio::test]
    async fn test_read_error_cancels_session() {
        let mut reader = FailingReader(io::ErrorKind::Other);
        let mut output = Output::Plain(RecordingWriter::default());
        let cancel = CancellationToken::new();

        let report = pump(Direction::Upstream, &mut reader, &mut output, &cancel).await;

        assert_eq!(report.exit, PumpExit::Failed);
        assert!(!report.exit.is_clean());
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_connection_reset_is_peer_close() {
        let mut reader = FailingReader(io::ErrorKind::ConnectionReset);
        let mut output = Output::Plain(RecordingWriter::default());
        let cancel = CancellationToken::new();

        let report = pump(Direction::Upstream, &mut reader, &mut output, &cancel).await;

        assert_eq!(report.exit, PumpExit::PeerClosed);
        assert!(report.exit.is_clean());
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_error_after_teardown_counts_as_cancelled() {
        let mut reader = FailingReader(io::ErrorKind::Other);
        let mut output = Output::Plain(RecordingWriter::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = pump(Direction::Upstream, &mut reader, &mut output, &cancel).await;

        assert_eq!(report.exit, PumpExit::Cancelled);
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(Direction::Upstream.to_string(), "upstream");
        assert_eq!(Direction::Downstream.to_string(), "downstream");
    }
}
