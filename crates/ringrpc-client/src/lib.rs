//! ringrpc Client
//!
//! Call path, connection pooling and response correlation for ringrpc.
//!
//! # Overview
//!
//! A [`ClientContext`] connects to a service by location and returns an
//! [`RpcClient`]. Each call gets a fresh request id; the id's hash picks a
//! connection on the service's consistent-hash ring, the encoded request is
//! queued on that connection, and the caller waits on a pending-call entry
//! that the connection's reader resolves.
//!
//! # Components
//!
//! - [`context`] - Process-scoped state: ids, pending calls, registry, pools
//! - [`pool`] - Per-service ring, weight fan-out, reconnection
//! - [`connection`] - Physical connections, writer batching and heartbeats
//! - [`ring`] - Copy-on-write consistent-hash ring
//! - [`correlator`] - Pending-call table
//! - [`client`] - Retrying call path
//!
//! # Example
//!
//! ```no_run
//! use ringrpc_client::{ClientConfig, ClientContext};
//! use ringrpc_common::Value;
//!
//! # async fn example() -> ringrpc_common::Result<()> {
//! let context = ClientContext::new(ClientConfig::default());
//! let echo = context.connect("echo", "local://127.0.0.1:9000").await?;
//!
//! let ping = echo.method("ping")?;
//! let reply = echo.invoke(&ping, Value::from("ping")).await?;
//! assert_eq!(reply, Value::from("pong"));
//!
//! context.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod context;
pub mod correlator;
pub mod pool;
pub mod ring;

pub use client::RpcClient;
pub use config::ClientConfig;
pub use connection::{ClientConnection, ConnectionState};
pub use context::{ClientContext, ClientRegistry};
pub use correlator::PendingCalls;
pub use pool::ConnectionPool;
pub use ring::HashRing;
