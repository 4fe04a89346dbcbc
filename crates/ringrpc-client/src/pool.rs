//! Connection pool for one service.
//!
//! The pool owns a [`HashRing`] of [`ClientConnection`]s. On the local path it
//! opens one connection, learns the service from a METADATA probe, then fans
//! out to `weight` connections. On the discovery path the address list and
//! weights come from the [`ServiceDiscovery`](ringrpc_common::location::ServiceDiscovery)
//! collaborator.
//!
//! Reconnects take over the ring positions of the connection they replace,
//! so a slot keeps its share of the request space across disconnects.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::future::join_all;
use parking_lot::Mutex;
use ringrpc_common::location::Location;
use ringrpc_common::protocol::ServiceMetadata;
use ringrpc_common::registry::ServiceDescriptor;
use ringrpc_common::transport::{self, FrameReader};
use ringrpc_common::{
    ErrorKind, Fault, Frame, Header, RequestId, Result, RingRpcError, ServiceId, TypeId,
    METADATA_PROBE_ID,
};
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{
    write_loop, ClientConnection, ConnectionSlot, ConnectionState, Heartbeat, WriterExit,
};
use crate::context::ContextShared;
use crate::ring::HashRing;

/// Whether the pool has learned its service yet.
#[derive(Debug, Clone)]
pub(crate) enum Readiness {
    Pending,
    Ready,
    Failed(Fault),
}

/// Handle to a service's connection pool.
///
/// Cloning is cheap; every clone refers to the same ring.
#[derive(Clone)]
pub struct ConnectionPool {
    pub(crate) shared: Arc<PoolShared>,
}

impl ConnectionPool {
    pub fn service_id(&self) -> ServiceId {
        self.shared.service_id
    }

    pub fn location(&self) -> &Location {
        &self.shared.location
    }

    /// Returns the connection `request_id` maps to.
    pub fn pick(&self, request_id: RequestId) -> Option<Arc<ClientConnection>> {
        self.shared.ring.pick(request_id)
    }

    /// Distinct connections (including placeholders) currently on the ring.
    pub fn connections(&self) -> Vec<Arc<ClientConnection>> {
        self.shared.ring.values()
    }

    /// Occupied ring positions, ascending.
    pub fn positions(&self) -> Vec<u64> {
        self.shared.ring.snapshot().keys().copied().collect()
    }

    /// Number of virtual positions on the ring.
    pub fn ring_len(&self) -> usize {
        self.shared.ring.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.is_shutdown()
    }

    /// Closes every connection and stops reconnecting.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }
}

pub(crate) struct PoolShared {
    service_id: ServiceId,
    location: Location,
    pub(crate) ring: HashRing<ClientConnection>,
    ctx: Arc<ContextShared>,
    ready: watch::Sender<Readiness>,
    fanned_out: AtomicBool,
    shutdown: AtomicBool,
    reconnects: Mutex<Vec<JoinHandle<()>>>,
}

impl PoolShared {
    pub(crate) fn new(ctx: Arc<ContextShared>, service_id: ServiceId, location: Location) -> Arc<Self> {
        let (ready, _) = watch::channel(Readiness::Pending);
        Arc::new(Self {
            service_id,
            location,
            ring: HashRing::new(),
            ctx,
            ready,
            fanned_out: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            reconnects: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn handle(self: &Arc<Self>) -> ConnectionPool {
        ConnectionPool {
            shared: self.clone(),
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Opens the initial connections for the pool's location.
    pub(crate) async fn start(self: &Arc<Self>) -> Result<()> {
        match self.location.clone() {
            Location::Local(addr) => {
                self.attach(addr, 0, false).await;
                if let Some(service) = self.ctx.registry.get(self.service_id) {
                    // metadata is already known, so no probe was sent
                    self.fan_out(addr, service.weight().get(), false).await;
                    self.mark_ready(Readiness::Ready);
                }
                Ok(())
            }
            Location::Discovery { endpoint, service } => {
                self.start_discovery(&endpoint, &service).await
            }
        }
    }

    async fn start_discovery(self: &Arc<Self>, endpoint: &str, service: &str) -> Result<()> {
        let discovery = self.ctx.discovery.clone().ok_or_else(|| {
            RingRpcError::rpc(
                ErrorKind::ClientError,
                format!("no discovery collaborator configured for {}", self.location),
            )
        })?;

        let addresses = discovery.resolve(endpoint, service)?;
        if addresses.is_empty() {
            return Err(RingRpcError::rpc(
                ErrorKind::ClientError,
                format!("discovery returned no addresses for {}", self.location),
            ));
        }

        // weights come from the resolved list, never from a metadata fan-out
        self.fanned_out.store(true, Ordering::Release);
        if let Some(metadata) = discovery.metadata(endpoint, service)? {
            self.install(&metadata, addresses[0].addr)?;
        }

        info!(
            "Resolved {} addresses for {} through {}",
            addresses.len(),
            service,
            endpoint
        );
        join_all(addresses.iter().flat_map(|address| {
            (0..address.weight.get()).map(move |index| self.attach(address.addr, index as u64, true))
        }))
        .await;

        if self.ctx.registry.get(self.service_id).is_some() {
            self.mark_ready(Readiness::Ready);
        }
        Ok(())
    }

    /// Waits until the service metadata is known.
    pub(crate) async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.ready.subscribe();
        let outcome = tokio::time::timeout(
            timeout,
            rx.wait_for(|state| !matches!(state, Readiness::Pending)),
        )
        .await
        .map_err(|_| RingRpcError::Timeout(timeout.as_millis() as u64))?;

        let state = outcome
            .map_err(|_| RingRpcError::Connection("connection pool dropped".to_string()))?
            .clone();
        match state {
            Readiness::Failed(fault) => Err(fault.into()),
            _ => Ok(()),
        }
    }

    fn mark_ready(&self, state: Readiness) {
        self.ready.send_if_modified(|current| {
            if matches!(current, Readiness::Pending) {
                *current = state;
                true
            } else {
                false
            }
        });
    }

    /// Opens connections `1..weight` to `addr`; slot 0 already exists.
    async fn fan_out(self: &Arc<Self>, addr: SocketAddr, weight: u8, discovered: bool) {
        join_all((1..weight).map(|index| self.attach(addr, index as u64, discovered))).await;
        debug!(
            "Pool for service {} fanned out to {} connections at {}",
            self.service_id, weight, addr
        );
    }

    /// Creates a slot and puts a connection for it on the ring.
    ///
    /// On the local path a failed connect leaves an unwritable placeholder at
    /// the slot's positions and schedules a reconnect. A discovered slot that
    /// cannot connect is left off the ring.
    async fn attach(self: &Arc<Self>, addr: SocketAddr, index: u64, discovered: bool) {
        let slot = Arc::new(ConnectionSlot::new(addr, index, discovered));
        match self.open(slot.clone()).await {
            Ok(conn) => {
                let positions = self.ring.insert(slot.key(), conn.clone());
                slot.set_positions(positions);
                info!("Connected {} to {}", slot.key(), addr);
                if self.is_shutdown() {
                    conn.close();
                }
            }
            Err(e) if discovered => {
                warn!("Failed to connect {} to {}: {}", slot.key(), addr, e);
            }
            Err(e) => {
                warn!(
                    "Failed to connect {} to {}: {}; keeping a placeholder",
                    slot.key(),
                    addr,
                    e
                );
                let placeholder = Arc::new(ClientConnection::placeholder(slot.clone()));
                let positions = self.ring.insert(slot.key(), placeholder.clone());
                slot.set_positions(positions);
                self.schedule_reconnect(placeholder);
            }
        }
    }

    /// Connects a slot and starts its reader and writer.
    async fn open(self: &Arc<Self>, slot: Arc<ConnectionSlot>) -> Result<Arc<ClientConnection>> {
        let config = &self.ctx.config;
        let stream = transport::connect(slot.addr(), config.connect_timeout).await?;
        let (read_half, write_half) = stream.into_split();

        let (tx, rx) = mpsc::channel(config.write_queue_capacity);
        let conn = Arc::new(ClientConnection::active(slot, tx));

        let heartbeat = Heartbeat {
            service_id: self.service_id,
            interval: config.heartbeat_interval,
            max_missed: config.max_missed_heartbeats,
        };
        let writer = tokio::spawn({
            let pool = self.clone();
            let conn = conn.clone();
            async move {
                if write_loop(conn.clone(), rx, write_half, heartbeat).await == WriterExit::Lost {
                    pool.connection_lost(&conn);
                }
            }
        });
        let reader = tokio::spawn(read_loop(self.clone(), conn.clone(), read_half));
        conn.track(writer);
        conn.track(reader);

        if self.ctx.registry.get(self.service_id).is_none() {
            debug!("Sending METADATA probe for service {}", self.service_id);
            if conn.send(self.metadata_probe()?).is_err() {
                warn!("Could not queue METADATA probe on {}", conn.slot().key());
            }
        }

        Ok(conn)
    }

    fn metadata_probe(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.ctx
            .codec
            .encode(&Frame::empty(Header::metadata_probe(self.service_id)), &mut buf)?;
        Ok(buf.freeze())
    }

    fn on_frame(self: &Arc<Self>, conn: &Arc<ClientConnection>, frame: Frame) {
        match frame.header.type_id {
            TypeId::Abnormal if is_probe_answer(&frame.header) => {
                let fault = Fault::decode(&frame.body).unwrap_or_else(|e| {
                    Fault::new(ErrorKind::ClientSerializerError, e.to_string())
                });
                warn!("Server {} refused METADATA probe: {}", conn.addr(), fault);
                self.mark_ready(Readiness::Failed(fault));
            }
            TypeId::Normal | TypeId::Empty | TypeId::Abnormal => {
                self.ctx.pending.resolve(frame);
            }
            TypeId::Metadata => self.on_metadata(conn, frame),
            TypeId::Heartbeat => debug!("Heartbeat answered by {}", conn.addr()),
            TypeId::Object => warn!(
                "Ignoring request frame {} sent by server {}",
                frame.header.request_id,
                conn.addr()
            ),
        }
    }

    fn on_metadata(self: &Arc<Self>, conn: &Arc<ClientConnection>, frame: Frame) {
        let metadata = match ServiceMetadata::decode(&frame.body) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("Undecodable METADATA from {}: {}", conn.addr(), e);
                self.mark_ready(Readiness::Failed(Fault::new(
                    ErrorKind::ClientSerializerError,
                    e.to_string(),
                )));
                return;
            }
        };

        if let Err(e) = self.install(&metadata, conn.addr()) {
            warn!("Rejected METADATA from {}: {}", conn.addr(), e);
            self.mark_ready(Readiness::Failed(e.into_fault()));
            return;
        }
        info!(
            "Learned service {} ({} methods, weight {}) from {}",
            metadata.name,
            metadata.methods.len(),
            metadata.weight,
            conn.addr()
        );

        if self.fanned_out.swap(true, Ordering::AcqRel) {
            self.mark_ready(Readiness::Ready);
            return;
        }
        let pool = self.clone();
        let addr = conn.addr();
        tokio::spawn(async move {
            pool.fan_out(addr, metadata.weight, false).await;
            pool.mark_ready(Readiness::Ready);
        });
    }

    /// Registers the descriptor described by `metadata` with the client registry.
    fn install(&self, metadata: &ServiceMetadata, addr: SocketAddr) -> Result<()> {
        if metadata.service_id != self.service_id {
            return Err(RingRpcError::rpc(
                ErrorKind::NotExistServiceId,
                format!(
                    "expected service {}, server described {} ({})",
                    self.service_id, metadata.service_id, metadata.name
                ),
            ));
        }
        let descriptor =
            ServiceDescriptor::from_metadata(metadata, addr, self.ctx.serializers.clone())?;
        self.ctx.registry.insert(descriptor);
        Ok(())
    }

    /// Handles an unexpected disconnect. Pending calls on the connection are
    /// dropped so their callers retry, and a reconnect is scheduled.
    fn connection_lost(self: &Arc<Self>, conn: &Arc<ClientConnection>) {
        if !conn.transition(ConnectionState::Active, ConnectionState::Inactive) {
            return;
        }
        warn!("Lost connection {} to {}", conn.slot().key(), conn.addr());
        conn.stop_io();

        let abandoned = conn.take_inflight();
        for request_id in &abandoned {
            self.ctx.pending.remove(*request_id);
        }
        if !abandoned.is_empty() {
            debug!(
                "Dropped {} in-flight calls on {}",
                abandoned.len(),
                conn.slot().key()
            );
        }

        self.schedule_reconnect(conn.clone());
    }

    /// Reconnects `old`'s slot: first after `reconnect_delay`, then every
    /// `reconnect_retry_delay`. The new connection takes over the slot's ring
    /// positions. A discovered slot whose reconnect fails leaves the ring.
    fn schedule_reconnect(self: &Arc<Self>, old: Arc<ClientConnection>) {
        if self.is_shutdown() {
            return;
        }
        old.transition(ConnectionState::Inactive, ConnectionState::ReconnectScheduled);

        let pool = self.clone();
        let task = tokio::spawn(async move {
            let slot = old.slot().clone();
            let mut delay = pool.ctx.config.reconnect_delay;
            loop {
                info!("Reconnecting {} in {:?}", slot.key(), delay);
                tokio::time::sleep(delay).await;
                if pool.is_shutdown() {
                    return;
                }

                match pool.open(slot.clone()).await {
                    Ok(conn) => {
                        pool.ring.replace(&slot.positions(), conn.clone());
                        info!("Reconnected {} to {}", slot.key(), slot.addr());
                        if pool.is_shutdown() {
                            conn.close();
                        }
                        return;
                    }
                    Err(e) if slot.is_discovered() => {
                        warn!(
                            "Reconnect of {} failed: {}; removing it from the ring",
                            slot.key(),
                            e
                        );
                        pool.ring.remove(&slot.positions(), &old);
                        return;
                    }
                    Err(e) => {
                        warn!("Reconnect of {} failed: {}", slot.key(), e);
                        delay = pool.ctx.config.reconnect_retry_delay;
                    }
                }
            }
        });

        let mut reconnects = self.reconnects.lock();
        reconnects.retain(|t| !t.is_finished());
        reconnects.push(task);
    }

    pub(crate) fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        for task in self.reconnects.lock().drain(..) {
            task.abort();
        }
        for conn in self.ring.values() {
            conn.close();
        }
        self.mark_ready(Readiness::Failed(Fault::new(
            ErrorKind::RpcClientStopping,
            "client shutting down",
        )));
        info!("Closed connection pool for service {}", self.service_id);
    }
}

fn is_probe_answer(header: &Header) -> bool {
    header.request_id == METADATA_PROBE_ID as RequestId && header.method_id == METADATA_PROBE_ID
}

async fn read_loop(pool: Arc<PoolShared>, conn: Arc<ClientConnection>, read_half: OwnedReadHalf) {
    let mut reader = FrameReader::new(read_half, pool.ctx.config.max_frame_size);
    loop {
        match reader.next_frame().await {
            Ok(Some(frame)) => {
                conn.touch();
                pool.on_frame(&conn, frame);
            }
            Ok(None) => {
                info!("{} closed connection {}", conn.addr(), conn.slot().key());
                break;
            }
            Err(e) => {
                if let Some(request) = e.request() {
                    // the frame was consumed; only this call fails
                    pool.ctx.pending.fail(request.request_id, e);
                    continue;
                }
                if matches!(e, RingRpcError::FrameTooLarge { .. }) {
                    warn!("Skipped frame from {}: {}", conn.addr(), e);
                    continue;
                }
                warn!("Read from {} failed: {}", conn.addr(), e);
                break;
            }
        }
    }
    pool.connection_lost(&conn);
}
