//! Process-scoped client context.
//!
//! A [`ClientContext`] owns everything the call path shares across services:
//! the request id generator, the pending-call table, the client-side service
//! registry and one connection pool per service.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use ringrpc_common::hash;
use ringrpc_common::ids::RequestIdGenerator;
use ringrpc_common::location::{Location, ServiceDiscovery};
use ringrpc_common::registry::ServiceDescriptor;
use ringrpc_common::transport::FrameCodec;
use ringrpc_common::{ErrorKind, Fault, Result, RingRpcError, SerializerRegistry, ServiceId};
use tracing::{info, warn};

use crate::client::RpcClient;
use crate::config::ClientConfig;
use crate::correlator::PendingCalls;
use crate::pool::PoolShared;

/// Service descriptors learned from servers or discovery, keyed by service id.
#[derive(Default)]
pub struct ClientRegistry {
    services: RwLock<HashMap<ServiceId, Arc<ServiceDescriptor>>>,
}

impl ClientRegistry {
    pub fn get(&self, service_id: ServiceId) -> Option<Arc<ServiceDescriptor>> {
        self.services.read().get(&service_id).cloned()
    }

    pub fn insert(&self, descriptor: ServiceDescriptor) {
        self.services
            .write()
            .insert(descriptor.service_id(), Arc::new(descriptor));
    }

    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }
}

pub(crate) struct ContextShared {
    pub(crate) config: ClientConfig,
    pub(crate) ids: RequestIdGenerator,
    pub(crate) pending: PendingCalls,
    pub(crate) registry: ClientRegistry,
    pub(crate) serializers: Arc<SerializerRegistry>,
    pub(crate) discovery: Option<Arc<dyn ServiceDiscovery>>,
    pub(crate) codec: FrameCodec,
    pools: Mutex<Vec<Weak<PoolShared>>>,
    stopping: AtomicBool,
}

impl ContextShared {
    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub(crate) fn stopping_error() -> RingRpcError {
        RingRpcError::rpc(ErrorKind::RpcClientStopping, "client shutting down")
    }
}

/// Entry point of the client side.
///
/// # Example
///
/// ```no_run
/// use ringrpc_client::{ClientConfig, ClientContext};
/// use ringrpc_common::Value;
///
/// # async fn example() -> ringrpc_common::Result<()> {
/// let context = ClientContext::new(ClientConfig::default());
/// let client = context.connect("echo", "local://127.0.0.1:9000").await?;
/// let reply = client.call("ping", Value::from("ping")).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ClientContext {
    shared: Arc<ContextShared>,
}

impl ClientContext {
    pub fn new(config: ClientConfig) -> Self {
        Self::build(config, None, Arc::new(SerializerRegistry::default()))
    }

    /// Uses `discovery` to resolve `discovery://` locations.
    pub fn with_discovery(config: ClientConfig, discovery: Arc<dyn ServiceDiscovery>) -> Self {
        Self::build(config, Some(discovery), Arc::new(SerializerRegistry::default()))
    }

    /// Full constructor: optional discovery plus a custom serializer registry.
    pub fn build(
        config: ClientConfig,
        discovery: Option<Arc<dyn ServiceDiscovery>>,
        serializers: Arc<SerializerRegistry>,
    ) -> Self {
        let codec = FrameCodec::with_max_frame_size(config.max_frame_size);
        Self {
            shared: Arc::new(ContextShared {
                config,
                ids: RequestIdGenerator::with_next_worker(),
                pending: PendingCalls::new(),
                registry: ClientRegistry::default(),
                serializers,
                discovery,
                codec,
                pools: Mutex::new(Vec::new()),
                stopping: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.shared.registry
    }

    /// Number of calls currently waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }

    /// Connects to `service` at `location` and returns a client bound to it.
    ///
    /// `location` is `local://host:port` or `discovery://endpoint/service`.
    ///
    /// # Errors
    ///
    /// - `Rpc` with kind `ClientError` for an unsupported location scheme
    /// - `Timeout` if the service metadata is not known within `metadata_timeout`
    /// - `Rpc` with kind `RpcClientStopping` after [`shutdown`](Self::shutdown)
    pub async fn connect(&self, service: &str, location: &str) -> Result<RpcClient> {
        if self.shared.is_stopping() {
            return Err(ContextShared::stopping_error());
        }
        let location = Location::parse(location)?;
        let service_id = hash::service_id(service);

        let pool = PoolShared::new(self.shared.clone(), service_id, location.clone());
        {
            let mut pools = self.shared.pools.lock();
            pools.retain(|p| p.strong_count() > 0);
            pools.push(Arc::downgrade(&pool));
        }

        let started = async {
            pool.start().await?;
            pool.wait_ready(self.shared.config.metadata_timeout).await
        };
        if let Err(e) = started.await {
            warn!("Connecting to {} at {} failed: {}", service, location, e);
            pool.shutdown();
            return Err(e);
        }

        let descriptor = self.shared.registry.get(service_id).ok_or_else(|| {
            RingRpcError::rpc(
                ErrorKind::NotExistServiceId,
                format!("no metadata for service {}", service),
            )
        })?;
        info!("Connected to {} at {}", service, location);
        Ok(RpcClient::new(self.shared.clone(), pool.handle(), descriptor))
    }

    /// Stops the client: closes every connection, cancels reconnects and fails
    /// every pending call with `RpcClientStopping`.
    pub fn shutdown(&self) {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        let pools: Vec<_> = self.shared.pools.lock().drain(..).collect();
        for pool in pools.iter().filter_map(Weak::upgrade) {
            pool.shutdown();
        }
        let failed = self.shared.pending.fail_all(&Fault::new(
            ErrorKind::RpcClientStopping,
            "client shutting down",
        ));
        info!("Client context stopped; failed {} pending calls", failed);
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.is_stopping()
    }
}
