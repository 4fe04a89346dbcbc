use std::collections::HashMap;
use std::sync::Arc;

use ringrpc_common::location::ServiceDiscovery;
use ringrpc_common::registry::{ServiceDescriptor, ServiceRegistry};
use ringrpc_common::{MethodId, Result, RingRpcError};
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::executor::{DelayWorker, ExecutorGroups};
use crate::server::RpcServer;

/// Registration phase of a server.
///
/// Services are published here, then [`start`](Self::start) freezes the
/// registry, builds the executors and binds every address.
///
/// # Example
///
/// ```no_run
/// use ringrpc_common::registry::{handler, MethodSpec, ServiceDescriptor};
/// use ringrpc_server::{ServerConfig, ServerContext};
///
/// # async fn example() -> ringrpc_common::Result<()> {
/// let mut echo = ServiceDescriptor::new("echo", "127.0.0.1:9000".parse()?);
/// echo.register(
///     MethodSpec::new("ping").parameter("string").returns("string"),
///     handler(Ok),
/// )?;
///
/// let mut context = ServerContext::new(ServerConfig::default());
/// context.publish(echo)?;
/// let server = context.start()?;
///
/// server.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct ServerContext {
    config: ServerConfig,
    registry: ServiceRegistry,
    discovery: Option<Arc<dyn ServiceDiscovery>>,
}

impl ServerContext {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            registry: ServiceRegistry::new(),
            discovery: None,
        }
    }

    /// A context that announces services carrying a discovery endpoint.
    pub fn with_discovery(config: ServerConfig, discovery: Arc<dyn ServiceDiscovery>) -> Self {
        Self {
            discovery: Some(discovery),
            ..Self::new(config)
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Publishes a service.
    ///
    /// # Returns
    ///
    /// The final method ids, keyed by the ids the descriptor handed out.
    /// They only differ when the service was merged into one already
    /// published at the same address.
    ///
    /// # Errors
    ///
    /// Returns `Registry` when the service conflicts with a published one.
    pub fn publish(&mut self, service: ServiceDescriptor) -> Result<HashMap<MethodId, MethodId>> {
        self.registry.publish(service)
    }

    /// Freezes the registry and starts serving.
    ///
    /// Every address gets a runtime with the larger of the configured
    /// `io_workers` and any override of the services published there.
    /// Services with a discovery endpoint are announced at their bound
    /// address.
    ///
    /// # Errors
    ///
    /// Returns `Registry` when nothing was published, or the error of an
    /// executor thread, a bind, or a discovery announcement.
    pub fn start(self) -> Result<RpcServer> {
        let ServerContext {
            config,
            mut registry,
            discovery,
        } = self;

        if registry.services().next().is_none() {
            return Err(RingRpcError::Registry("no services published".to_string()));
        }
        registry.freeze();
        let registry = Arc::new(registry);

        let executors = ExecutorGroups::build(registry.services().flat_map(|s| s.methods()))?;
        let delay = DelayWorker::start(config.delay)?;
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), executors, delay));

        let mut server = RpcServer::new(config.clone(), dispatcher);
        for (addr, services) in registry.by_address() {
            let io_workers = services
                .iter()
                .filter_map(|s| s.io_workers())
                .fold(config.io_workers, usize::max);
            let local = server.bind(addr, io_workers)?;

            for service in services {
                info!(
                    "Serving {} ({} methods) on {}",
                    service.name(),
                    service.len(),
                    local
                );
                let Some(endpoint) = service.discovery_endpoint() else {
                    continue;
                };
                match &discovery {
                    Some(discovery) => {
                        discovery.publish(endpoint, local, service.weight(), &service.metadata())?
                    }
                    None => warn!(
                        "{} names discovery endpoint {} but no discovery is configured",
                        service.name(),
                        endpoint
                    ),
                }
            }
        }

        Ok(server)
    }
}
