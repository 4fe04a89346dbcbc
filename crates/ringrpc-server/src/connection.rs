//! Server-side connections.
//!
//! Each accepted socket gets a reader task and a writer task. Business
//! threads answer through [`ServerConnection`], which only queues encoded
//! frames on an unbounded channel, so they never block on the socket.
//! Backpressure works on the read side instead: closing a connection's
//! [`ReadGate`] stops its reader, and the peer's socket buffer fills up.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use ringrpc_common::transport::{FrameCodec, FrameReader, FrameWriter};
use ringrpc_common::{Fault, Frame, Header, Result, RingRpcError, Serializer, TypeId, Value};
use tokio::io::{AsyncRead, AsyncWrite, BufWriter};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Frames drained from the outbound queue before a flush
const MAX_WRITE_BATCH: usize = 64;

pub type ConnectionId = u64;

/// Messages for a connection's writer task.
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(Bytes),
    /// Flush what is queued, then shut the socket down
    Close,
}

/// Read interest of one connection.
///
/// While the gate is closed the reader does not pull frames off the socket.
#[derive(Debug)]
pub struct ReadGate {
    open: watch::Sender<bool>,
}

impl ReadGate {
    fn new() -> Self {
        let (open, _) = watch::channel(true);
        Self { open }
    }

    pub fn open(&self) {
        self.open.send_if_modified(|open| !std::mem::replace(open, true));
    }

    pub fn close(&self) {
        self.open.send_if_modified(|open| std::mem::replace(open, false));
    }

    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.open.subscribe()
    }
}

/// Handle business threads use to answer requests on a connection.
pub struct ServerConnection {
    id: ConnectionId,
    peer: SocketAddr,
    outbound: mpsc::UnboundedSender<Outbound>,
    gate: ReadGate,
    codec: FrameCodec,
    closed: AtomicBool,
}

impl ServerConnection {
    /// Creates a connection handle and the receiving end of its writer queue.
    pub(crate) fn new(
        id: ConnectionId,
        peer: SocketAddr,
        max_frame_size: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            id,
            peer,
            outbound,
            gate: ReadGate::new(),
            codec: FrameCodec::with_max_frame_size(max_frame_size),
            closed: AtomicBool::new(false),
        });
        (conn, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn gate(&self) -> &ReadGate {
        &self.gate
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queues a frame for writing.
    ///
    /// Returns false if the connection is gone; the frame is dropped.
    pub fn send_frame(&self, frame: &Frame) -> bool {
        let mut buf = BytesMut::new();
        if let Err(e) = self.codec.encode(frame, &mut buf) {
            warn!("Dropping unencodable frame for {}: {}", self.peer, e);
            return false;
        }
        self.push(buf.freeze())
    }

    /// Encodes `value` with `serializer` as a `NORMAL` (or `EMPTY`) answer to `request`.
    ///
    /// # Errors
    ///
    /// The serializer's error, or `FrameTooLarge`. Nothing is queued then.
    pub fn send_value(&self, request: Header, serializer: &dyn Serializer, value: &Value) -> Result<()> {
        let mut buf = BytesMut::new();
        self.codec.encode_value(
            request.with_type(TypeId::Normal),
            serializer,
            value,
            &mut buf,
        )?;
        if !self.push(buf.freeze()) {
            return Err(RingRpcError::Connection(format!(
                "connection to {} is closed",
                self.peer
            )));
        }
        Ok(())
    }

    /// Answers `request` with an `ABNORMAL` frame.
    pub fn send_fault(&self, request: Header, fault: &Fault) -> bool {
        match Frame::fault(request, fault) {
            Ok(frame) => self.send_frame(&frame),
            Err(e) => {
                warn!("Failed to encode fault for {}: {}", self.peer, e);
                false
            }
        }
    }

    fn push(&self, frame: Bytes) -> bool {
        if self.is_closed() {
            return false;
        }
        self.outbound.send(Outbound::Frame(frame)).is_ok()
    }

    /// Flushes queued answers and closes the socket.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.outbound.send(Outbound::Close);
            // a paused reader must wake up to notice
            self.gate.open();
        }
    }
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("read_open", &self.gate.is_open())
            .finish()
    }
}

/// Writes queued frames, flushing once per batch, until `Close` arrives or
/// every handle is gone.
pub(crate) async fn write_loop<W>(peer: SocketAddr, mut rx: mpsc::UnboundedReceiver<Outbound>, writer: W)
where
    W: AsyncWrite + Unpin,
{
    let mut writer = FrameWriter::new(BufWriter::new(writer));
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while batch.len() < MAX_WRITE_BATCH {
            match rx.try_recv() {
                Ok(next) => batch.push(next),
                Err(_) => break,
            }
        }

        let mut closing = false;
        for message in batch {
            match message {
                Outbound::Frame(frame) => {
                    if let Err(e) = writer.write(&frame).await {
                        warn!("Write to {} failed: {}", peer, e);
                        return;
                    }
                }
                Outbound::Close => {
                    closing = true;
                    break;
                }
            }
        }

        if closing {
            if let Err(e) = writer.shutdown().await {
                debug!("Shutdown of {} failed: {}", peer, e);
            }
            return;
        }
        if let Err(e) = writer.flush().await {
            warn!("Flush to {} failed: {}", peer, e);
            return;
        }
    }
}

/// Pulls frames while the read gate is open and hands each one to `on_frame`.
///
/// Stops on end of stream, a broken socket, `close()`, or after `idle_timeout`
/// without an inbound frame. Time spent with the gate closed does not count as
/// idle.
pub(crate) async fn read_loop<R, F, E>(
    conn: Arc<ServerConnection>,
    reader: R,
    idle_timeout: Duration,
    mut on_frame: F,
    mut on_error: E,
) where
    R: AsyncRead + Unpin,
    F: FnMut(&Arc<ServerConnection>, Frame),
    E: FnMut(&Arc<ServerConnection>, RingRpcError) -> bool,
{
    let mut reader = FrameReader::new(reader, conn.codec.max_frame_size());
    let mut gate = conn.gate.subscribe();

    loop {
        if !*gate.borrow_and_update() {
            debug!("Reads from {} paused", conn.peer);
            if gate.wait_for(|open| *open).await.is_err() {
                break;
            }
            debug!("Reads from {} resumed", conn.peer);
        }
        if conn.is_closed() {
            break;
        }

        match tokio::time::timeout(idle_timeout, reader.next_frame()).await {
            Err(_) => {
                info!("Closing {} after {:?} idle", conn.peer, idle_timeout);
                break;
            }
            Ok(Ok(Some(frame))) => on_frame(&conn, frame),
            Ok(Ok(None)) => {
                debug!("{} closed the connection", conn.peer);
                break;
            }
            Ok(Err(e)) => {
                if !on_error(&conn, e) {
                    break;
                }
            }
        }
    }
    conn.close();
}
