//! ringrpc
//!
//! Binary RPC over long-lived TCP connections, with consistent-hash
//! connection pooling on the client and backpressured dispatch on the server.
//!
//! # Overview
//!
//! This crate re-exports the three workspace crates:
//!
//! - [`common`] - Wire codec, serializers, service registry, locations
//! - [`client`] - Client context, connection pool, retrying call path
//! - [`server`] - Server context, accept path, dispatch executors
//!
//! # Example
//!
//! ```no_run
//! use ringrpc::common::registry::{handler, MethodSpec, ServiceDescriptor};
//! use ringrpc::{ClientConfig, ClientContext, ServerConfig, ServerContext, Value};
//!
//! # async fn example() -> ringrpc::Result<()> {
//! let mut echo = ServiceDescriptor::new("echo", "127.0.0.1:9000".parse()?);
//! echo.register(
//!     MethodSpec::new("ping").parameter("string").returns("string"),
//!     handler(|_| Ok(Value::from("pong"))),
//! )?;
//! let mut server = ServerContext::new(ServerConfig::default());
//! server.publish(echo)?;
//! let server = server.start()?;
//!
//! let client = ClientContext::new(ClientConfig::default());
//! let echo = client.connect("echo", "local://127.0.0.1:9000").await?;
//! assert_eq!(echo.call("ping", Value::from("ping")).await?, Value::from("pong"));
//!
//! client.shutdown();
//! server.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub use ringrpc_client as client;
pub use ringrpc_common as common;
pub use ringrpc_server as server;

pub use ringrpc_client::{ClientConfig, ClientContext, RpcClient};
pub use ringrpc_common::{ErrorKind, Fault, Result, RingRpcError, Value};
pub use ringrpc_server::{RpcServer, ServerConfig, ServerContext};
