use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::error::{Result, RingRpcError};
use crate::protocol::frame::Frame;
use crate::transport::codec::FrameCodec;

/// Initial read buffer capacity; grows on demand up to one frame
const READ_BUFFER_CAPACITY: usize = 8 * 1024;

/// Connects to `addr` with a bounded wait and disables Nagle's algorithm.
///
/// # Errors
///
/// Returns `Timeout` if the connect does not finish within `timeout`, or a
/// mapped I/O error otherwise.
pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| RingRpcError::Timeout(timeout.as_millis() as u64))?
        .map_err(|e| map_io_error(e, &format!("connecting to {}", addr)))?;

    stream
        .set_nodelay(true)
        .map_err(|e| RingRpcError::Connection(format!("Failed to set TCP_NODELAY: {}", e)))?;

    Ok(stream)
}

/// Map IO errors to appropriate RingRpcError variants
///
/// - Timeouts/would block -> `Timeout`
/// - Connection errors -> `Connection`
/// - Other IO errors -> `Io`
pub fn map_io_error(err: std::io::Error, context: &str) -> RingRpcError {
    match err.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => RingRpcError::Timeout(0),
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::ConnectionRefused
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::UnexpectedEof => {
            RingRpcError::Connection(format!("{}: {}", context, err))
        }
        _ => RingRpcError::Io(err),
    }
}

/// Reads frames from a byte stream.
///
/// Decode errors for a single frame are returned without losing framing, so
/// callers may log them and keep reading.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    codec: FrameCodec,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame_size: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            codec: FrameCodec::with_max_frame_size(max_frame_size),
        }
    }

    /// Reads the next frame.
    ///
    /// # Returns
    ///
    /// `Ok(None)` when the peer closed the stream on a frame boundary.
    ///
    /// # Errors
    ///
    /// Frame-level errors (see [`FrameCodec::decode`]) leave the reader usable.
    /// A `Connection` error means the stream is gone.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buf)? {
                return Ok(Some(frame));
            }

            let n = self
                .inner
                .read_buf(&mut self.buf)
                .await
                .map_err(|e| map_io_error(e, "reading frame"))?;

            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(RingRpcError::Connection(format!(
                    "peer closed with {} bytes of a partial frame buffered",
                    self.buf.len()
                )));
            }
        }
    }
}

/// Writes pre-encoded frames, flushing once per batch.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Queues one encoded frame without flushing.
    pub async fn write(&mut self, frame: &Bytes) -> Result<()> {
        self.inner
            .write_all(frame)
            .await
            .map_err(|e| map_io_error(e, "writing frame"))
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.inner
            .flush()
            .await
            .map_err(|e| map_io_error(e, "flushing stream"))
    }

    /// Flushes and shuts down the write half.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.flush().await?;
        self.inner
            .shutdown()
            .await
            .map_err(|e| map_io_error(e, "shutting down stream"))
    }
}
