//! ringrpc Server
//!
//! Accept path, dispatch executors and backpressure for ringrpc.
//!
//! # Overview
//!
//! A [`ServerContext`] collects the services to publish, then starts an
//! [`RpcServer`]. Every published address gets its own multi-thread tokio
//! runtime for network I/O. Decoded requests never run there: each method is
//! bound to a [`DispatchExecutor`](executor::DispatchExecutor) made of plain
//! OS threads, and answers travel back through the connection's writer task.
//!
//! # Backpressure
//!
//! Each executor queue is bounded and carries an overflow mode:
//!
//! - **DELAY**: a full queue rejects the request; it is retried from a delay
//!   list a few times while its connection stops being read, then answered
//!   with `ServiceBusy`
//! - **WATER_MARK**: requests are always queued; the producing connection stops
//!   being read above the high mark and resumes below the low mark
//!
//! # Components
//!
//! - [`context`] - Registration phase and startup
//! - [`server`] - Bound addresses, accept loops, shutdown
//! - [`dispatch`] - Per-frame routing
//! - [`connection`] - Server connections, read gates, reader and writer tasks
//! - [`executor`] - Executors, queues, overflow policies, delay list
//! - [`config`] - Server configuration

pub mod config;
pub mod connection;
pub mod context;
pub mod dispatch;
pub mod executor;
pub mod server;

pub use config::{DelayConfig, ServerConfig};
pub use connection::{ConnectionId, ReadGate, ServerConnection};
pub use context::ServerContext;
pub use dispatch::Dispatcher;
pub use executor::{DispatchExecutor, DispatchTask, Submit};
pub use server::RpcServer;
