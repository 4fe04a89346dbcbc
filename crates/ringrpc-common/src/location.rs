//! Service locations and the discovery collaborator.
//!
//! A location is either `local://host:port`, a single literal address with no
//! discovery round-trip, or `discovery://endpoint/serviceName`, resolved by a
//! [`ServiceDiscovery`] implementation.

use std::collections::HashMap;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use parking_lot::RwLock;
use tracing::info;

use crate::protocol::error::{ErrorKind, Result, RingRpcError};
use crate::protocol::metadata::ServiceMetadata;
use crate::registry::Weight;

pub const LOCAL_SCHEME: &str = "local";
pub const DISCOVERY_SCHEME: &str = "discovery";

/// Where a service lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Local(SocketAddr),
    Discovery { endpoint: String, service: String },
}

impl Location {
    /// Parses a location string.
    ///
    /// # Errors
    ///
    /// Returns an `Rpc` error with kind `ClientError` for an unknown scheme,
    /// and `InvalidLocation` for a malformed address.
    ///
    /// # Example
    ///
    /// ```
    /// use ringrpc_common::location::Location;
    ///
    /// let local = Location::parse("local://127.0.0.1:9000").unwrap();
    /// assert!(local.is_local());
    ///
    /// let remote = Location::parse("discovery://registry:2181/hello").unwrap();
    /// assert!(!remote.is_local());
    ///
    /// assert!(Location::parse("ftp://somewhere").is_err());
    /// ```
    pub fn parse(s: &str) -> Result<Self> {
        let (scheme, rest) = s.split_once("://").ok_or_else(|| {
            RingRpcError::rpc(
                ErrorKind::ClientError,
                format!("location '{}' has no scheme", s),
            )
        })?;

        match scheme {
            LOCAL_SCHEME => {
                let addr = rest
                    .to_socket_addrs()
                    .map_err(|e| RingRpcError::InvalidLocation(format!("'{}': {}", s, e)))?
                    .next()
                    .ok_or_else(|| {
                        RingRpcError::InvalidLocation(format!("'{}' resolves to no address", s))
                    })?;
                Ok(Location::Local(addr))
            }
            DISCOVERY_SCHEME => {
                let (endpoint, service) = rest.rsplit_once('/').ok_or_else(|| {
                    RingRpcError::InvalidLocation(format!(
                        "'{}' must look like discovery://endpoint/serviceName",
                        s
                    ))
                })?;
                if endpoint.is_empty() || service.is_empty() {
                    return Err(RingRpcError::InvalidLocation(format!(
                        "'{}' has an empty endpoint or service name",
                        s
                    )));
                }
                Ok(Location::Discovery {
                    endpoint: endpoint.to_string(),
                    service: service.to_string(),
                })
            }
            other => Err(RingRpcError::rpc(
                ErrorKind::ClientError,
                format!("unsupported location scheme '{}'", other),
            )),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Location::Local(_))
    }
}

impl FromStr for Location {
    type Err = RingRpcError;

    fn from_str(s: &str) -> Result<Self> {
        Location::parse(s)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Local(addr) => write!(f, "{}://{}", LOCAL_SCHEME, addr),
            Location::Discovery { endpoint, service } => {
                write!(f, "{}://{}/{}", DISCOVERY_SCHEME, endpoint, service)
            }
        }
    }
}

/// One address returned by discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredAddress {
    pub addr: SocketAddr,
    pub weight: Weight,
}

/// A coordination service that publishes and resolves address lists.
///
/// Backends are external; [`StaticDiscovery`] is an in-memory implementation.
pub trait ServiceDiscovery: Send + Sync {
    /// Returns the current addresses of `service`.
    fn resolve(&self, endpoint: &str, service: &str) -> Result<Vec<DiscoveredAddress>>;

    /// Returns published metadata, when the backend stores it.
    fn metadata(&self, _endpoint: &str, _service: &str) -> Result<Option<ServiceMetadata>> {
        Ok(None)
    }

    /// Announces that `addr` serves `metadata`.
    fn publish(
        &self,
        endpoint: &str,
        addr: SocketAddr,
        weight: Weight,
        metadata: &ServiceMetadata,
    ) -> Result<()>;
}

#[derive(Default)]
struct StaticEntry {
    addresses: Vec<DiscoveredAddress>,
    metadata: Option<ServiceMetadata>,
}

/// In-memory discovery keyed by `(endpoint, service)`.
#[derive(Default)]
pub struct StaticDiscovery {
    entries: RwLock<HashMap<(String, String), StaticEntry>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an address without metadata.
    pub fn insert(&self, endpoint: &str, service: &str, addr: SocketAddr, weight: Weight) {
        let mut entries = self.entries.write();
        let entry = entries
            .entry((endpoint.to_string(), service.to_string()))
            .or_default();
        entry.addresses.retain(|a| a.addr != addr);
        entry.addresses.push(DiscoveredAddress { addr, weight });
    }

    /// Removes an address.
    pub fn remove(&self, endpoint: &str, service: &str, addr: SocketAddr) {
        if let Some(entry) = self
            .entries
            .write()
            .get_mut(&(endpoint.to_string(), service.to_string()))
        {
            entry.addresses.retain(|a| a.addr != addr);
        }
    }
}

impl ServiceDiscovery for StaticDiscovery {
    fn resolve(&self, endpoint: &str, service: &str) -> Result<Vec<DiscoveredAddress>> {
        Ok(self
            .entries
            .read()
            .get(&(endpoint.to_string(), service.to_string()))
            .map(|entry| entry.addresses.clone())
            .unwrap_or_default())
    }

    fn metadata(&self, endpoint: &str, service: &str) -> Result<Option<ServiceMetadata>> {
        Ok(self
            .entries
            .read()
            .get(&(endpoint.to_string(), service.to_string()))
            .and_then(|entry| entry.metadata.clone()))
    }

    fn publish(
        &self,
        endpoint: &str,
        addr: SocketAddr,
        weight: Weight,
        metadata: &ServiceMetadata,
    ) -> Result<()> {
        self.insert(endpoint, &metadata.name, addr, weight);
        if let Some(entry) = self
            .entries
            .write()
            .get_mut(&(endpoint.to_string(), metadata.name.clone()))
        {
            entry.metadata = Some(metadata.clone());
        }
        info!("Published {} at {} to {}", metadata.name, addr, endpoint);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_local() {
        let location = Location::parse("local://127.0.0.1:9000").unwrap();
        assert_eq!(location, Location::Local("127.0.0.1:9000".parse().unwrap()));
        assert_eq!(location.to_string(), "local://127.0.0.1:9000");
    }

    #[test]
    fn test_parse_discovery() {
        let location: Location = "discovery://10.0.0.1:2181/hello".parse().unwrap();
        assert_eq!(
            location,
            Location::Discovery {
                endpoint: "10.0.0.1:2181".to_string(),
                service: "hello".to_string(),
            }
        );
    }

    #[test]
    fn test_wrong_scheme_is_client_error() {
        let err = Location::parse("zk://10.0.0.1/hello").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClientError);
        assert!(matches!(err, RingRpcError::Rpc { .. }));

        let err = Location::parse("127.0.0.1:9000").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClientError);
    }

    #[test]
    fn test_malformed_addresses() {
        assert!(matches!(
            Location::parse("local://not-an-address"),
            Err(RingRpcError::InvalidLocation(_))
        ));
        assert!(matches!(
            Location::parse("discovery://endpoint-only"),
            Err(RingRpcError::InvalidLocation(_))
        ));
    }

    #[test]
    fn test_static_discovery() {
        let discovery = StaticDiscovery::new();
        let a: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:9002".parse().unwrap();
        discovery.insert("zk", "hello", a, Weight::new(2).unwrap());
        discovery.insert("zk", "hello", b, Weight::new(5).unwrap());

        let resolved = discovery.resolve("zk", "hello").unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[1].weight.get(), 5);

        discovery.remove("zk", "hello", a);
        assert_eq!(discovery.resolve("zk", "hello").unwrap().len(), 1);
        assert!(discovery.resolve("zk", "other").unwrap().is_empty());
        assert!(discovery.metadata("zk", "hello").unwrap().is_none());
    }

    #[test]
    fn test_static_discovery_publish_stores_metadata() {
        let discovery = StaticDiscovery::new();
        let metadata = ServiceMetadata {
            service_id: 1,
            name: "hello".to_string(),
            weight: 1,
            methods: vec![],
        };
        let addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        discovery.publish("zk", addr, Weight::default(), &metadata).unwrap();
        assert_eq!(discovery.metadata("zk", "hello").unwrap(), Some(metadata));
        assert_eq!(discovery.resolve("zk", "hello").unwrap()[0].addr, addr);
    }
}
