//! Client connections.
//!
//! A [`ConnectionSlot`] is the logical identity of one physical connection to
//! an address: it owns the ring positions and survives reconnects. Each
//! physical socket is a [`ClientConnection`] with a reader task and a writer
//! task that also sends heartbeats.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use ringrpc_common::transport::{FrameCodec, FrameWriter};
use ringrpc_common::{Frame, Header, RequestId, ServiceId};
use tokio::io::{AsyncWrite, BufWriter};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Frames drained from the write queue before a flush
const MAX_WRITE_BATCH: usize = 64;

/// Lifecycle of a physical connection.
///
/// `Connecting -> Active -> Inactive -> ReconnectScheduled`, after which a
/// new connection takes over the slot; or `Active -> Closed` on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Active = 1,
    Inactive = 2,
    ReconnectScheduled = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Active,
            2 => ConnectionState::Inactive,
            3 => ConnectionState::ReconnectScheduled,
            _ => ConnectionState::Closed,
        }
    }
}

/// Logical identity of a connection: address plus ring positions.
#[derive(Debug)]
pub struct ConnectionSlot {
    key: String,
    addr: SocketAddr,
    positions: Mutex<Vec<u64>>,
    /// Membership is owned by discovery: a failed reconnect removes the slot
    discovered: bool,
}

impl ConnectionSlot {
    pub fn new(addr: SocketAddr, index: u64, discovered: bool) -> Self {
        Self {
            key: format!("{}#{}", addr, index),
            addr,
            positions: Mutex::new(Vec::new()),
            discovered,
        }
    }

    /// Key hashed into ring positions.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn positions(&self) -> Vec<u64> {
        self.positions.lock().clone()
    }

    pub fn set_positions(&self, positions: Vec<u64>) {
        *self.positions.lock() = positions;
    }

    pub fn is_discovered(&self) -> bool {
        self.discovered
    }
}

/// One physical connection, or a placeholder for a slot whose connect failed.
pub struct ClientConnection {
    slot: Arc<ConnectionSlot>,
    state: AtomicU8,
    outbound: Option<mpsc::Sender<Bytes>>,
    opened: Instant,
    last_read_ms: AtomicU64,
    closed: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Requests written here and still awaiting a response
    inflight: Mutex<HashSet<RequestId>>,
}

impl ClientConnection {
    /// A connection that can carry requests through `outbound`.
    pub(crate) fn active(slot: Arc<ConnectionSlot>, outbound: mpsc::Sender<Bytes>) -> Self {
        Self {
            slot,
            state: AtomicU8::new(ConnectionState::Active as u8),
            outbound: Some(outbound),
            opened: Instant::now(),
            last_read_ms: AtomicU64::new(0),
            closed: Notify::new(),
            tasks: Mutex::new(Vec::new()),
            inflight: Mutex::new(HashSet::new()),
        }
    }

    /// A never-writable stand-in kept on the ring while the slot reconnects.
    pub(crate) fn placeholder(slot: Arc<ConnectionSlot>) -> Self {
        Self {
            slot,
            state: AtomicU8::new(ConnectionState::Inactive as u8),
            outbound: None,
            opened: Instant::now(),
            last_read_ms: AtomicU64::new(0),
            closed: Notify::new(),
            tasks: Mutex::new(Vec::new()),
            inflight: Mutex::new(HashSet::new()),
        }
    }

    pub fn slot(&self) -> &Arc<ConnectionSlot> {
        &self.slot
    }

    pub fn addr(&self) -> SocketAddr {
        self.slot.addr
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    /// Active and with room in the write queue.
    pub fn is_writable(&self) -> bool {
        self.is_active()
            && self
                .outbound
                .as_ref()
                .is_some_and(|tx| tx.capacity() > 0)
    }

    /// Queues an encoded frame without waiting.
    ///
    /// Gives the frame back if the queue is full or the writer is gone.
    pub fn send(&self, frame: Bytes) -> std::result::Result<(), Bytes> {
        let Some(tx) = &self.outbound else {
            return Err(frame);
        };
        tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(frame) | mpsc::error::TrySendError::Closed(frame) => {
                frame
            }
        })
    }

    /// Moves `from` to `to` atomically. Returns false if the state was not `from`.
    pub(crate) fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Marks the connection closed and stops its tasks.
    pub fn close(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        self.stop_io();
    }

    /// Stops the reader and writer without touching the state.
    pub(crate) fn stop_io(&self) {
        self.closed.notify_one();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    pub(crate) fn track_request(&self, request_id: RequestId) {
        self.inflight.lock().insert(request_id);
    }

    pub(crate) fn untrack_request(&self, request_id: RequestId) {
        self.inflight.lock().remove(&request_id);
    }

    /// Takes every request still waiting on this connection.
    pub(crate) fn take_inflight(&self) -> Vec<RequestId> {
        self.inflight.lock().drain().collect()
    }

    pub(crate) fn track(&self, task: JoinHandle<()>) {
        self.tasks.lock().push(task);
    }

    pub(crate) fn touch(&self) {
        self.last_read_ms
            .store(self.opened.elapsed().as_millis() as u64, Ordering::Release);
    }

    /// Time since the last inbound frame (or since opening).
    pub fn read_idle(&self) -> Duration {
        let now = self.opened.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_read_ms.load(Ordering::Acquire)))
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("slot", &self.slot.key)
            .field("state", &self.state())
            .finish()
    }
}

/// Why a writer loop ended.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WriterExit {
    /// `close()` was called
    Closed,
    /// The socket failed or the peer stopped answering heartbeats
    Lost,
}

/// Heartbeat settings for a writer loop.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Heartbeat {
    pub service_id: ServiceId,
    pub interval: Duration,
    pub max_missed: u32,
}

/// Drains the write queue onto the socket, flushing once per batch, and
/// sends a heartbeat whenever the queue stays idle for a whole interval.
///
/// The peer counts as gone once nothing was read for `max_missed`
/// intervals, however busy the write side is.
pub(crate) async fn write_loop<W>(
    conn: Arc<ClientConnection>,
    mut rx: mpsc::Receiver<Bytes>,
    writer: W,
    heartbeat: Heartbeat,
) -> WriterExit
where
    W: AsyncWrite + Unpin,
{
    let mut writer = FrameWriter::new(BufWriter::new(writer));
    let heartbeat_frame = encode_heartbeat(heartbeat.service_id);
    let silence_limit = heartbeat.interval * heartbeat.max_missed;

    loop {
        let silent_for = conn.read_idle();
        if silent_for >= silence_limit {
            warn!(
                "No frames from {} for {:?}, dropping connection",
                conn.addr(),
                silent_for
            );
            return WriterExit::Lost;
        }

        let next = tokio::select! {
            biased;
            _ = conn.closed.notified() => {
                let _ = writer.shutdown().await;
                return WriterExit::Closed;
            }
            next = tokio::time::timeout(heartbeat.interval, rx.recv()) => next,
        };

        match next {
            Ok(Some(frame)) => {
                let mut batch = vec![frame];
                while batch.len() < MAX_WRITE_BATCH {
                    match rx.try_recv() {
                        Ok(frame) => batch.push(frame),
                        Err(_) => break,
                    }
                }
                for frame in &batch {
                    if let Err(e) = writer.write(frame).await {
                        warn!("Write to {} failed: {}", conn.addr(), e);
                        return WriterExit::Lost;
                    }
                }
                if let Err(e) = writer.flush().await {
                    warn!("Flush to {} failed: {}", conn.addr(), e);
                    return WriterExit::Lost;
                }
            }
            Ok(None) => return WriterExit::Closed,
            Err(_) => {
                debug!("Sending heartbeat to {}", conn.addr());
                let sent = writer.write(&heartbeat_frame).await;
                if let Err(e) = sent.and(writer.flush().await) {
                    warn!("Heartbeat to {} failed: {}", conn.addr(), e);
                    return WriterExit::Lost;
                }
            }
        }
    }
}

fn encode_heartbeat(service_id: ServiceId) -> Bytes {
    let mut buf = BytesMut::new();
    // an empty frame is always within limits
    let _ = FrameCodec::new().encode(&Frame::empty(Header::heartbeat(service_id)), &mut buf);
    buf.freeze()
}
