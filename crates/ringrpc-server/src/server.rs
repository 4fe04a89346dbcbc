use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use ringrpc_common::transport::map_io_error;
use ringrpc_common::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::connection::{read_loop, write_loop, ConnectionId, ServerConnection};
use crate::dispatch::Dispatcher;

/// How long shutdown waits for writers to flush after closing connections
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub(crate) struct ServerShared {
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    connections: DashMap<ConnectionId, Arc<ServerConnection>>,
    next_connection: AtomicU64,
}

/// One bound address with its own I/O runtime.
struct Endpoint {
    requested: SocketAddr,
    local: SocketAddr,
    runtime: Option<Runtime>,
    accept: JoinHandle<()>,
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.accept.abort();
        // never block: the owner may be on an async thread
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// A running server: one I/O runtime and accept loop per published address,
/// plus the dispatch executors shared by all of them.
///
/// Created by [`ServerContext::start`](crate::ServerContext::start).
pub struct RpcServer {
    shared: Arc<ServerShared>,
    endpoints: Vec<Endpoint>,
}

impl RpcServer {
    pub(crate) fn new(config: ServerConfig, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                config,
                dispatcher,
                connections: DashMap::new(),
                next_connection: AtomicU64::new(1),
            }),
            endpoints: Vec::new(),
        }
    }

    /// Binds `addr` and starts accepting on a dedicated runtime with
    /// `io_workers` threads.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the address cannot be bound or the runtime
    /// cannot be built.
    pub(crate) fn bind(&mut self, addr: SocketAddr, io_workers: usize) -> Result<SocketAddr> {
        let std_listener = std::net::TcpListener::bind(addr)
            .map_err(|e| map_io_error(e, &format!("binding {}", addr)))?;
        std_listener
            .set_nonblocking(true)
            .map_err(|e| map_io_error(e, "configuring listener"))?;
        let local = std_listener
            .local_addr()
            .map_err(|e| map_io_error(e, "reading bound address"))?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(io_workers.max(1))
            .thread_name(format!("ringrpc-io-{}", local.port()))
            .enable_all()
            .build()
            .map_err(|e| map_io_error(e, "building I/O runtime"))?;

        let listener = {
            let _guard = runtime.enter();
            TcpListener::from_std(std_listener)
        };
        let listener = match listener {
            Ok(listener) => listener,
            Err(e) => {
                runtime.shutdown_background();
                return Err(map_io_error(e, "registering listener"));
            }
        };

        let accept = runtime.spawn(accept_loop(listener, local, self.shared.clone()));
        info!("Listening on {} with {} I/O threads", local, io_workers);

        self.endpoints.push(Endpoint {
            requested: addr,
            local,
            runtime: Some(runtime),
            accept,
        });
        Ok(local)
    }

    /// Bound addresses, in bind order.
    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.endpoints.iter().map(|e| e.local).collect()
    }

    /// Maps each configured address to the address actually bound.
    ///
    /// They differ when a service is published on port 0.
    pub fn bound_addrs(&self) -> HashMap<SocketAddr, SocketAddr> {
        self.endpoints.iter().map(|e| (e.requested, e.local)).collect()
    }

    /// The bound address serving `service`.
    pub fn local_addr(&self, service: &str) -> Option<SocketAddr> {
        let publish = self
            .shared
            .dispatcher
            .registry()
            .services()
            .find(|s| s.name() == service)?
            .publish_addr();
        self.endpoints
            .iter()
            .find(|e| e.requested == publish)
            .map(|e| e.local)
    }

    /// Open connections across every address.
    pub fn connections(&self) -> usize {
        self.shared.connections.len()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.shared.dispatcher
    }

    /// Stops the server in order:
    ///
    /// 1. stop accepting connections and requests
    /// 2. close the delay list and drain executors for up to `drain_timeout`
    /// 3. answer whatever is left with `RpcServerStopping`
    /// 4. close connections once their writers flushed
    /// 5. shut the I/O runtimes down
    pub async fn shutdown(mut self) {
        info!("Stopping server on {:?}", self.addrs());
        for endpoint in &self.endpoints {
            endpoint.accept.abort();
        }

        let dispatcher = self.shared.dispatcher.clone();
        let drain = self.shared.config.drain_timeout;
        let drained = match self.endpoints.first().and_then(|e| e.runtime.as_ref()) {
            Some(runtime) => runtime.spawn_blocking(move || dispatcher.shutdown(drain)).await,
            None => Ok(dispatcher.shutdown(drain)),
        };
        if let Err(e) = drained {
            warn!("Dispatcher shutdown did not complete: {}", e);
        }

        for entry in self.shared.connections.iter() {
            entry.value().close();
        }
        let deadline = Instant::now() + CLOSE_GRACE;
        while !self.shared.connections.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if !self.shared.connections.is_empty() {
            warn!(
                "{} connections still flushing at shutdown",
                self.shared.connections.len()
            );
        }

        self.endpoints.clear();
        info!("Server stopped");
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        for entry in self.shared.connections.iter() {
            entry.value().close();
        }
    }
}

async fn accept_loop(listener: TcpListener, local: SocketAddr, shared: Arc<ServerShared>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if shared.dispatcher.is_stopping() {
                    debug!("Refusing {} during shutdown", peer);
                    continue;
                }
                serve(stream, peer, &shared);
            }
            Err(e) => {
                warn!("Accept on {} failed: {}", local, e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Spawns the reader and writer of an accepted connection.
fn serve(stream: TcpStream, peer: SocketAddr, shared: &Arc<ServerShared>) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not disable Nagle for {}: {}", peer, e);
    }

    let id = shared.next_connection.fetch_add(1, Ordering::Relaxed);
    let (conn, outbound) = ServerConnection::new(id, peer, shared.config.max_frame_size);
    shared.connections.insert(id, conn.clone());
    info!("Accepted connection {} from {}", id, peer);

    let (reader, writer) = stream.into_split();

    tokio::spawn({
        let shared = shared.clone();
        let conn = conn.clone();
        async move {
            write_loop(peer, outbound, writer).await;
            conn.close();
            shared.connections.remove(&id);
            info!("Connection {} from {} closed", id, peer);
        }
    });

    let on_frame = {
        let dispatcher = shared.dispatcher.clone();
        move |conn: &Arc<ServerConnection>, frame| dispatcher.dispatch(conn, frame)
    };
    let on_error = {
        let dispatcher = shared.dispatcher.clone();
        move |conn: &Arc<ServerConnection>, err| dispatcher.on_error(conn, err)
    };
    tokio::spawn(read_loop(
        conn,
        reader,
        shared.config.idle_timeout,
        on_frame,
        on_error,
    ));
}
