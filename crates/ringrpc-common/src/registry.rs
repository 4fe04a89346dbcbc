//! Service and method registry.
//!
//! A [`ServiceDescriptor`] owns the methods published under one service id at
//! one address. The server keeps every descriptor in a [`ServiceRegistry`],
//! built during a registration phase and frozen before traffic starts. The
//! client rebuilds descriptors from published [`ServiceMetadata`].
//!
//! Method ids are assigned at registration and re-issued when descriptors are
//! merged, so callers must always use the ids returned by the registry.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::hash;
use crate::location::Location;
use crate::protocol::error::{ErrorKind, Fault, Result, RingRpcError};
use crate::protocol::frame::{MethodId, ServiceId};
use crate::protocol::metadata::{MethodMetadata, ServiceMetadata};
use crate::protocol::serializer::{type_names, Serializer, SerializerRegistry};
use crate::protocol::value::Value;

/// Highest method id a service may hand out
pub const MAX_METHOD_ID: MethodId = 127;

/// Default executor queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Default executor group
pub const DEFAULT_GROUP: &str = "default";

/// Default number of I/O threads for a bound address
pub const DEFAULT_IO_WORKERS: usize = 8;

/// A method implementation: one decoded parameter in, one value or fault out.
pub type Handler = Arc<dyn Fn(Value) -> std::result::Result<Value, Fault> + Send + Sync>;

/// Wraps a closure as a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(Value) -> std::result::Result<Value, Fault> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Relative share of connections an address receives (1..=10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Weight(u8);

impl Weight {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 10;

    pub fn new(weight: u8) -> Result<Self> {
        if !(Self::MIN..=Self::MAX).contains(&weight) {
            return Err(RingRpcError::Registry(format!(
                "weight {} outside {}..={}",
                weight,
                Self::MIN,
                Self::MAX
            )));
        }
        Ok(Self(weight))
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

impl Default for Weight {
    fn default() -> Self {
        Self(Self::MIN)
    }
}

/// What happens when an executor queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowMode {
    /// Reject, park the task on the delay list and pause the connection
    Delay,
    /// Pause producers above the high mark, resume them below the low mark
    WaterMark,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    /// One dedicated worker thread
    Single,
    /// Between `min` and `max` worker threads
    Pool { min: usize, max: usize },
}

/// How a method's calls are executed on the server.
///
/// # Default Configuration
///
/// - `kind`: `Single`
/// - `group`: `"default"`
/// - `shared`: false
/// - `capacity`: 10000
/// - `overflow`: `Delay`
/// - `keep_alive`: 60 seconds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    pub kind: ExecutorKind,
    /// Group name; methods with `shared` set and the same group share one executor
    pub group: String,
    pub shared: bool,
    pub capacity: usize,
    pub overflow: OverflowMode,
    /// How long threads above `min` stay alive without work
    pub keep_alive: Duration,
}

impl ExecutorConfig {
    pub fn single() -> Self {
        Self::default()
    }

    pub fn pool(min: usize, max: usize) -> Self {
        let min = min.max(1);
        Self {
            kind: ExecutorKind::Pool {
                min,
                max: max.max(min),
            },
            ..Self::default()
        }
    }

    /// Shares one executor with every other method in `group`.
    pub fn shared(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self.shared = true;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn with_overflow(mut self, overflow: OverflowMode) -> Self {
        self.overflow = overflow;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            kind: ExecutorKind::Single,
            group: DEFAULT_GROUP.to_string(),
            shared: false,
            capacity: DEFAULT_QUEUE_CAPACITY,
            overflow: OverflowMode::Delay,
            keep_alive: Duration::from_secs(60),
        }
    }
}

/// Monotonic method id counter starting at 1 and capped at 127.
#[derive(Debug, Clone)]
pub struct MethodIdGenerator {
    next: u16,
}

impl MethodIdGenerator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn next_id(&mut self) -> Result<MethodId> {
        if self.next > u16::from(MAX_METHOD_ID) {
            return Err(RingRpcError::Registry(format!(
                "a service can hold at most {} methods",
                MAX_METHOD_ID
            )));
        }
        let id = self.next as MethodId;
        self.next += 1;
        Ok(id)
    }
}

impl Default for MethodIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Registration input for one method.
///
/// # Example
///
/// ```
/// use ringrpc_common::registry::{ExecutorConfig, MethodSpec, OverflowMode};
///
/// let spec = MethodSpec::new("ping")
///     .parameter("string")
///     .returns("string")
///     .executor(ExecutorConfig::pool(2, 8).with_overflow(OverflowMode::WaterMark));
/// ```
#[derive(Clone)]
pub struct MethodSpec {
    name: String,
    parameter_type: String,
    return_type: String,
    executor: ExecutorConfig,
    parameter_serializer: Option<Arc<dyn Serializer>>,
    return_serializer: Option<Arc<dyn Serializer>>,
}

impl MethodSpec {
    /// A method with no parameter and no return value on a single-thread executor.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameter_type: type_names::EMPTY.to_string(),
            return_type: type_names::EMPTY.to_string(),
            executor: ExecutorConfig::default(),
            parameter_serializer: None,
            return_serializer: None,
        }
    }

    pub fn parameter(mut self, type_name: impl Into<String>) -> Self {
        self.parameter_type = type_name.into();
        self
    }

    pub fn returns(mut self, type_name: impl Into<String>) -> Self {
        self.return_type = type_name.into();
        self
    }

    pub fn executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    /// Overrides the serializer chosen from the parameter type name.
    pub fn parameter_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.parameter_serializer = Some(serializer);
        self
    }

    /// Overrides the serializer chosen from the return type name.
    pub fn return_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.return_serializer = Some(serializer);
        self
    }
}

/// Dispatch metadata of one registered method.
///
/// Created once at registration and never mutated; a merge produces a copy
/// under the new id.
#[derive(Clone)]
pub struct MethodDescriptor {
    service_id: ServiceId,
    method_id: MethodId,
    name: String,
    parameter_type: String,
    return_type: String,
    parameter_serializer: Arc<dyn Serializer>,
    return_serializer: Arc<dyn Serializer>,
    executor: ExecutorConfig,
    handler: Option<Handler>,
}

impl MethodDescriptor {
    fn from_spec(
        service_id: ServiceId,
        method_id: MethodId,
        spec: MethodSpec,
        handler: Option<Handler>,
        serializers: &SerializerRegistry,
    ) -> Self {
        let parameter_serializer = spec
            .parameter_serializer
            .unwrap_or_else(|| serializers.resolve(&spec.parameter_type));
        let return_serializer = spec
            .return_serializer
            .unwrap_or_else(|| serializers.resolve(&spec.return_type));

        Self {
            service_id,
            method_id,
            name: spec.name,
            parameter_type: spec.parameter_type,
            return_type: spec.return_type,
            parameter_serializer,
            return_serializer,
            executor: spec.executor,
            handler,
        }
    }

    pub fn service_id(&self) -> ServiceId {
        self.service_id
    }

    pub fn method_id(&self) -> MethodId {
        self.method_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameter_type(&self) -> &str {
        &self.parameter_type
    }

    pub fn return_type(&self) -> &str {
        &self.return_type
    }

    pub fn parameter_serializer(&self) -> &dyn Serializer {
        self.parameter_serializer.as_ref()
    }

    pub fn return_serializer(&self) -> &dyn Serializer {
        self.return_serializer.as_ref()
    }

    pub fn executor(&self) -> &ExecutorConfig {
        &self.executor
    }

    pub fn group(&self) -> &str {
        &self.executor.group
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    /// Runs the bound handler.
    ///
    /// Descriptors rebuilt from metadata on the client have no handler and
    /// answer `NotExistServiceId`.
    pub fn invoke(&self, parameter: Value) -> std::result::Result<Value, Fault> {
        match &self.handler {
            Some(handler) => handler(parameter),
            None => Err(Fault::new(
                ErrorKind::NotExistServiceId,
                format!("method {} has no handler bound", self.name),
            )),
        }
    }

    pub fn metadata(&self) -> MethodMetadata {
        MethodMetadata {
            name: self.name.clone(),
            parameter_type: self.parameter_type.clone(),
            return_type: self.return_type.clone(),
            method_id: self.method_id,
        }
    }

    fn with_method_id(&self, method_id: MethodId) -> Self {
        Self {
            method_id,
            ..self.clone()
        }
    }
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("service_id", &self.service_id)
            .field("method_id", &self.method_id)
            .field("name", &self.name)
            .field("parameter_type", &self.parameter_type)
            .field("return_type", &self.return_type)
            .field("executor", &self.executor)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

/// Everything published under one service id at one address.
pub struct ServiceDescriptor {
    service_id: ServiceId,
    name: String,
    publish: SocketAddr,
    discovery: Option<String>,
    weight: Weight,
    /// Overrides the server's I/O thread count for this address
    io_workers: Option<usize>,
    methods: BTreeMap<MethodId, Arc<MethodDescriptor>>,
    ids: MethodIdGenerator,
    serializers: Arc<SerializerRegistry>,
}

impl ServiceDescriptor {
    /// Creates an empty service bound to `publish`.
    ///
    /// The service id is derived from `name`.
    pub fn new(name: impl Into<String>, publish: SocketAddr) -> Self {
        let name = name.into();
        Self {
            service_id: hash::service_id(&name),
            name,
            publish,
            discovery: None,
            weight: Weight::default(),
            io_workers: None,
            methods: BTreeMap::new(),
            ids: MethodIdGenerator::new(),
            serializers: Arc::new(SerializerRegistry::default()),
        }
    }

    /// Rebuilds a handler-less descriptor from published metadata.
    ///
    /// Method ids are taken from the metadata as-is.
    pub fn from_metadata(
        metadata: &ServiceMetadata,
        publish: SocketAddr,
        serializers: Arc<SerializerRegistry>,
    ) -> Result<Self> {
        let mut descriptor = Self {
            service_id: metadata.service_id,
            name: metadata.name.clone(),
            publish,
            discovery: None,
            weight: Weight::new(metadata.weight)?,
            io_workers: None,
            methods: BTreeMap::new(),
            ids: MethodIdGenerator::new(),
            serializers,
        };

        for method in &metadata.methods {
            if method.method_id == 0 || method.method_id > MAX_METHOD_ID {
                return Err(RingRpcError::Registry(format!(
                    "method {} has invalid id {}",
                    method.name, method.method_id
                )));
            }
            let spec = MethodSpec::new(method.name.clone())
                .parameter(method.parameter_type.clone())
                .returns(method.return_type.clone());
            let desc = MethodDescriptor::from_spec(
                descriptor.service_id,
                method.method_id,
                spec,
                None,
                &descriptor.serializers,
            );
            descriptor.methods.insert(method.method_id, Arc::new(desc));
        }

        Ok(descriptor)
    }

    /// Publishes this service through a discovery endpoint as well.
    pub fn with_discovery(mut self, endpoint: impl Into<String>) -> Self {
        self.discovery = Some(endpoint.into());
        self
    }

    pub fn with_weight(mut self, weight: Weight) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_io_workers(mut self, io_workers: usize) -> Self {
        self.io_workers = Some(io_workers.max(1));
        self
    }

    pub fn with_serializers(mut self, serializers: Arc<SerializerRegistry>) -> Self {
        self.serializers = serializers;
        self
    }

    /// Registers a method and returns the id it was assigned.
    ///
    /// # Errors
    ///
    /// Returns `Registry` when the name is taken or the service already holds
    /// 127 methods.
    pub fn register(&mut self, spec: MethodSpec, handler: Handler) -> Result<MethodId> {
        if self.method_by_name(&spec.name).is_some() {
            return Err(RingRpcError::Registry(format!(
                "method {} already registered on {}",
                spec.name, self.name
            )));
        }
        let method_id = self.ids.next_id()?;
        let desc = MethodDescriptor::from_spec(
            self.service_id,
            method_id,
            spec,
            Some(handler),
            &self.serializers,
        );
        self.methods.insert(method_id, Arc::new(desc));
        Ok(method_id)
    }

    pub fn lookup(&self, method_id: MethodId) -> Option<Arc<MethodDescriptor>> {
        self.methods.get(&method_id).cloned()
    }

    pub fn method_by_name(&self, name: &str) -> Option<Arc<MethodDescriptor>> {
        self.methods.values().find(|m| m.name == name).cloned()
    }

    /// Folds `other` into this descriptor.
    ///
    /// Every method of `other` gets a new id from this descriptor's generator
    /// and is appended in `other`'s id order.
    ///
    /// # Returns
    ///
    /// A map from each of `other`'s old method ids to its new id.
    ///
    /// # Errors
    ///
    /// Returns `Registry` if the two descriptors differ in service id or
    /// publish address, if a method name collides, or if the id space runs
    /// out. On error this descriptor is unchanged.
    pub fn merge(&mut self, other: ServiceDescriptor) -> Result<HashMap<MethodId, MethodId>> {
        if other.service_id != self.service_id {
            return Err(RingRpcError::Registry(format!(
                "cannot merge service {} into service {}",
                other.service_id, self.service_id
            )));
        }
        if other.publish != self.publish {
            return Err(RingRpcError::Registry(format!(
                "service {} is already published at {}, not {}",
                self.name, self.publish, other.publish
            )));
        }
        if let Some(dup) = other
            .methods
            .values()
            .find(|m| self.method_by_name(&m.name).is_some())
        {
            return Err(RingRpcError::Registry(format!(
                "method {} already registered on {}",
                dup.name, self.name
            )));
        }

        let mut ids = self.ids.clone();
        let mut remapped = Vec::with_capacity(other.methods.len());
        for (old_id, method) in &other.methods {
            let new_id = ids.next_id()?;
            remapped.push((*old_id, new_id, Arc::new(method.with_method_id(new_id))));
        }

        self.ids = ids;
        let mut mapping = HashMap::with_capacity(remapped.len());
        for (old_id, new_id, method) in remapped {
            self.methods.insert(new_id, method);
            mapping.insert(old_id, new_id);
        }
        Ok(mapping)
    }

    pub fn service_id(&self) -> ServiceId {
        self.service_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn publish_addr(&self) -> SocketAddr {
        self.publish
    }

    pub fn discovery_endpoint(&self) -> Option<&str> {
        self.discovery.as_deref()
    }

    /// Where clients find this service.
    pub fn location(&self) -> Location {
        match &self.discovery {
            Some(endpoint) => Location::Discovery {
                endpoint: endpoint.clone(),
                service: self.name.clone(),
            },
            None => Location::Local(self.publish),
        }
    }

    pub fn weight(&self) -> Weight {
        self.weight
    }

    pub fn io_workers(&self) -> Option<usize> {
        self.io_workers
    }

    pub fn methods(&self) -> impl Iterator<Item = &Arc<MethodDescriptor>> {
        self.methods.values()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn metadata(&self) -> ServiceMetadata {
        ServiceMetadata {
            service_id: self.service_id,
            name: self.name.clone(),
            weight: self.weight.get(),
            methods: self.methods.values().map(|m| m.metadata()).collect(),
        }
    }
}

impl fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("service_id", &self.service_id)
            .field("name", &self.name)
            .field("publish", &self.publish)
            .field("weight", &self.weight)
            .field("methods", &self.methods.len())
            .finish()
    }
}

/// Server-side table of published services.
///
/// Filled during startup, then frozen; lookups never take a lock.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: HashMap<ServiceId, ServiceDescriptor>,
    frozen: bool,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a service, merging it into an existing descriptor with the same id
    /// and address.
    ///
    /// # Returns
    ///
    /// The final id of every method of `descriptor`, keyed by the id it had
    /// before publishing. Ids only change when a merge happened.
    ///
    /// # Errors
    ///
    /// Returns `Registry` after [`freeze`](Self::freeze), when the same service
    /// id is already published at another address, or when the merge fails.
    pub fn publish(&mut self, descriptor: ServiceDescriptor) -> Result<HashMap<MethodId, MethodId>> {
        if self.frozen {
            return Err(RingRpcError::Registry(format!(
                "cannot publish {} after the server started",
                descriptor.name
            )));
        }

        match self.services.get_mut(&descriptor.service_id) {
            Some(existing) => existing.merge(descriptor),
            None => {
                let identity = descriptor.methods.keys().map(|id| (*id, *id)).collect();
                self.services.insert(descriptor.service_id, descriptor);
                Ok(identity)
            }
        }
    }

    /// Stops accepting new registrations.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn lookup(&self, service_id: ServiceId, method_id: MethodId) -> Option<Arc<MethodDescriptor>> {
        self.services.get(&service_id)?.lookup(method_id)
    }

    pub fn service(&self, service_id: ServiceId) -> Option<&ServiceDescriptor> {
        self.services.get(&service_id)
    }

    pub fn services(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.services.values()
    }

    /// Groups services by the address they are published at.
    pub fn by_address(&self) -> BTreeMap<SocketAddr, Vec<&ServiceDescriptor>> {
        let mut grouped: BTreeMap<SocketAddr, Vec<&ServiceDescriptor>> = BTreeMap::new();
        for service in self.services.values() {
            grouped.entry(service.publish).or_default().push(service);
        }
        grouped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn echo() -> Handler {
        handler(|v| Ok(v))
    }

    fn hello(port: u16) -> ServiceDescriptor {
        ServiceDescriptor::new("hello", addr(port))
    }

    #[test]
    fn test_register_then_lookup() {
        let mut service = hello(9000);
        let id = service
            .register(MethodSpec::new("ping").parameter("string").returns("string"), echo())
            .unwrap();
        assert_eq!(id, 1);

        let method = service.lookup(id).unwrap();
        assert_eq!(method.name(), "ping");
        assert_eq!(method.service_id(), service.service_id());
        assert_eq!(method.parameter_serializer().type_name(), "string");
        assert_eq!(method.group(), DEFAULT_GROUP);
        assert!(method.has_handler());
        assert_eq!(method.invoke(Value::from("x")).unwrap(), Value::from("x"));
    }

    #[test]
    fn test_method_ids_are_sequential() {
        let mut service = hello(9000);
        for i in 1..=5u8 {
            let id = service
                .register(MethodSpec::new(format!("m{}", i)), echo())
                .unwrap();
            assert_eq!(id, i);
        }
    }

    #[test]
    fn test_method_id_cap() {
        let mut service = hello(9000);
        for i in 0..MAX_METHOD_ID {
            service.register(MethodSpec::new(format!("m{}", i)), echo()).unwrap();
        }
        let err = service.register(MethodSpec::new("one-too-many"), echo()).unwrap_err();
        assert!(matches!(err, RingRpcError::Registry(_)));
        assert_eq!(service.len(), MAX_METHOD_ID as usize);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut service = hello(9000);
        service.register(MethodSpec::new("ping"), echo()).unwrap();
        assert!(service.register(MethodSpec::new("ping"), echo()).is_err());
    }

    #[test]
    fn test_merge_reissues_ids() {
        let mut first = hello(9000);
        first.register(MethodSpec::new("a"), echo()).unwrap();
        first.register(MethodSpec::new("b"), echo()).unwrap();

        let mut second = hello(9000);
        let c = second.register(MethodSpec::new("c"), echo()).unwrap();
        let d = second.register(MethodSpec::new("d"), echo()).unwrap();
        assert_eq!((c, d), (1, 2));

        let mapping = first.merge(second).unwrap();
        assert_eq!(mapping[&c], 3);
        assert_eq!(mapping[&d], 4);

        // old id 1 now belongs to the destination's own method
        assert_eq!(first.lookup(c).unwrap().name(), "a");
        assert_eq!(first.lookup(mapping[&c]).unwrap().name(), "c");
        assert_eq!(first.lookup(mapping[&d]).unwrap().method_id(), 4);

        // the generator continues after the merged ids
        assert_eq!(first.register(MethodSpec::new("e"), echo()).unwrap(), 5);
    }

    #[test]
    fn test_merge_rejects_other_address() {
        let mut first = hello(9000);
        let second = hello(9001);
        assert!(first.merge(second).is_err());
    }

    #[test]
    fn test_failed_merge_leaves_destination_unchanged() {
        let mut first = hello(9000);
        for i in 0..(MAX_METHOD_ID - 1) {
            first.register(MethodSpec::new(format!("m{}", i)), echo()).unwrap();
        }
        let mut second = hello(9000);
        second.register(MethodSpec::new("x"), echo()).unwrap();
        second.register(MethodSpec::new("y"), echo()).unwrap();

        assert!(first.merge(second).is_err());
        assert_eq!(first.len(), (MAX_METHOD_ID - 1) as usize);
        assert_eq!(first.register(MethodSpec::new("last"), echo()).unwrap(), MAX_METHOD_ID);
    }

    #[test]
    fn test_registry_publish_merges_same_address() {
        let mut registry = ServiceRegistry::new();
        let mut first = hello(9000);
        first.register(MethodSpec::new("a"), echo()).unwrap();
        let service_id = first.service_id();
        let mapping = registry.publish(first).unwrap();
        assert_eq!(mapping[&1], 1);

        let mut second = hello(9000);
        second.register(MethodSpec::new("b"), echo()).unwrap();
        let mapping = registry.publish(second).unwrap();
        assert_eq!(mapping[&1], 2);

        assert_eq!(registry.lookup(service_id, 2).unwrap().name(), "b");
        assert_eq!(registry.service(service_id).unwrap().len(), 2);
    }

    #[test]
    fn test_registry_rejects_other_address() {
        let mut registry = ServiceRegistry::new();
        registry.publish(hello(9000)).unwrap();
        assert!(registry.publish(hello(9001)).is_err());
    }

    #[test]
    fn test_registry_frozen() {
        let mut registry = ServiceRegistry::new();
        registry.publish(hello(9000)).unwrap();
        registry.freeze();
        assert!(registry.is_frozen());
        assert!(registry.publish(ServiceDescriptor::new("other", addr(9000))).is_err());
    }

    #[test]
    fn test_registry_groups_by_address() {
        let mut registry = ServiceRegistry::new();
        registry.publish(ServiceDescriptor::new("a", addr(9000))).unwrap();
        registry.publish(ServiceDescriptor::new("b", addr(9000))).unwrap();
        registry.publish(ServiceDescriptor::new("c", addr(9001))).unwrap();

        let grouped = registry.by_address();
        assert_eq!(grouped[&addr(9000)].len(), 2);
        assert_eq!(grouped[&addr(9001)].len(), 1);
    }

    #[test]
    fn test_metadata_round_trip_through_descriptor() {
        let mut service = hello(9000).with_weight(Weight::new(3).unwrap());
        service
            .register(MethodSpec::new("ping").parameter("string").returns("string"), echo())
            .unwrap();
        service
            .register(MethodSpec::new("count").returns("long"), echo())
            .unwrap();

        let metadata = service.metadata();
        assert_eq!(metadata.weight, 3);
        assert_eq!(metadata.methods.len(), 2);

        let client_side = ServiceDescriptor::from_metadata(
            &metadata,
            addr(9000),
            Arc::new(SerializerRegistry::default()),
        )
        .unwrap();
        assert_eq!(client_side.service_id(), service.service_id());
        let count = client_side.method_by_name("count").unwrap();
        assert_eq!(count.method_id(), 2);
        assert_eq!(count.return_serializer().type_name(), "long");
        assert!(!count.has_handler());
        assert_eq!(
            count.invoke(Value::Empty).unwrap_err().kind,
            ErrorKind::NotExistServiceId
        );
    }

    #[test]
    fn test_from_metadata_rejects_bad_weight() {
        let metadata = ServiceMetadata {
            service_id: 1,
            name: "x".to_string(),
            weight: 11,
            methods: vec![],
        };
        assert!(ServiceDescriptor::from_metadata(
            &metadata,
            addr(1),
            Arc::new(SerializerRegistry::default())
        )
        .is_err());
    }

    #[test]
    fn test_weight_bounds() {
        assert!(Weight::new(0).is_err());
        assert!(Weight::new(11).is_err());
        assert_eq!(Weight::new(10).unwrap().get(), 10);
        assert_eq!(Weight::default().get(), 1);
    }

    #[test]
    fn test_executor_config_builders() {
        let config = ExecutorConfig::pool(0, 0).shared("io").with_capacity(0);
        assert_eq!(config.kind, ExecutorKind::Pool { min: 1, max: 1 });
        assert!(config.shared);
        assert_eq!(config.group, "io");
        assert_eq!(config.capacity, 1);
        assert_eq!(ExecutorConfig::default().capacity, DEFAULT_QUEUE_CAPACITY);
    }

    #[test]
    fn test_location() {
        let service = hello(9000);
        assert_eq!(service.location(), Location::Local(addr(9000)));
        let service = hello(9000).with_discovery("zk:2181");
        assert_eq!(
            service.location(),
            Location::Discovery {
                endpoint: "zk:2181".to_string(),
                service: "hello".to_string()
            }
        );
    }
}
