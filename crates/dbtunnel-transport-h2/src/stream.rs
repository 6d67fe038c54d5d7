//! HTTP/2 body adapters
//!
//! [`H2Reader`] reads DATA frames off a `RecvStream`, [`H2Writer`] writes them to
//! a `SendStream`. Both speak tokio's I/O traits so a tunnel session can treat
//! an HTTP/2 body like any other socket half.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use h2::{Reason, RecvStream, SendStream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

/// Both bodies of one tunnel exchange.
pub struct H2Stream {
    send: SendStream<Bytes>,
    recv: RecvStream,
    stream_id: u32,
}

impl std::fmt::Debug for H2Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Stream")
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

impl H2Stream {
    pub fn new(send: SendStream<Bytes>, recv: RecvStream) -> Self {
        let stream_id = send.stream_id().as_u32();
        Self {
            send,
            recv,
            stream_id,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn into_split(self) -> (H2Reader, H2Writer) {
        (
            H2Reader::new(self.recv, self.stream_id),
            H2Writer::new(self.send, self.stream_id),
        )
    }
}

/// Readable half: the body we receive.
pub struct H2Reader {
    recv: RecvStream,
    pending: Bytes,
    stream_id: u32,
}

impl std::fmt::Debug for H2Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Reader")
            .field("stream_id", &self.stream_id)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl H2Reader {
    pub fn new(recv: RecvStream, stream_id: u32) -> Self {
        Self {
            recv,
            pending: Bytes::new(),
            stream_id,
        }
    }
}

impl AsyncRead for H2Reader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        while this.pending.is_empty() {
            match ready!(this.recv.poll_data(cx)) {
                Some(Ok(data)) => {
                    // Release flow control capacity
                    let _ = this.recv.flow_control().release_capacity(data.len());
                    trace!("H2 stream {} received {} bytes", this.stream_id, data.len());
                    this.pending = data;
                }
                Some(Err(e)) => return Poll::Ready(Err(h2_to_io_error(e))),
                // END_STREAM
                None => return Poll::Ready(Ok(())),
            }
        }

        let n = buf.remaining().min(this.pending.len());
        buf.put_slice(&this.pending.split_to(n));
        Poll::Ready(Ok(()))
    }
}

/// Writable half: the body we send.
///
/// Written bytes go straight into h2's send queue and are written out by the
/// connection task, so there is nothing to flush. Shutdown sends END_STREAM.
pub struct H2Writer {
    send: SendStream<Bytes>,
    stream_id: u32,
    ended: bool,
}

impl std::fmt::Debug for H2Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Writer")
            .field("stream_id", &self.stream_id)
            .field("ended", &self.ended)
            .finish()
    }
}

impl H2Writer {
    pub fn new(send: SendStream<Bytes>, stream_id: u32) -> Self {
        Self {
            send,
            stream_id,
            ended: false,
        }
    }
}

impl AsyncWrite for H2Writer {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if self.ended {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "HTTP/2 stream already ended",
            )));
        }

        self.send.reserve_capacity(buf.len());

        loop {
            match ready!(self.send.poll_capacity(cx)) {
                // Capacity was granted and used up in the meantime; wait for more.
                Some(Ok(0)) => continue,
                Some(Ok(capacity)) => {
                    let n = capacity.min(buf.len());
                    self.send
                        .send_data(Bytes::copy_from_slice(&buf[..n]), false)
                        .map_err(h2_to_io_error)?;
                    return Poll::Ready(Ok(n));
                }
                Some(Err(e)) => return Poll::Ready(Err(h2_to_io_error(e))),
                None => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "HTTP/2 stream closed by peer",
                    )))
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.ended {
            return Poll::Ready(Ok(()));
        }
        self.ended = true;

        // Send empty data with END_STREAM flag
        self.send
            .send_data(Bytes::new(), true)
            .map_err(h2_to_io_error)?;
        Poll::Ready(Ok(()))
    }
}

/// Map h2 errors onto io error kinds the tunnel pump understands.
///
/// A peer that resets its stream with `CANCEL` or `NO_ERROR`, or sends GOAWAY,
/// is closing on purpose; those come out as reset/aborted.
pub(crate) fn h2_to_io_error(e: h2::Error) -> io::Error {
    if e.is_io() {
        return e
            .into_io()
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "h2 I/O error"));
    }

    match e.reason() {
        Some(Reason::CANCEL) | Some(Reason::NO_ERROR) if e.is_reset() => {
            io::Error::new(io::ErrorKind::ConnectionReset, e)
        }
        _ if e.is_go_away() => io::Error::new(io::ErrorKind::ConnectionAborted, e),
        _ => io::Error::new(io::ErrorKind::Other, e),
    }
}
