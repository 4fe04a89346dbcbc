use std::time::Duration;

use ringrpc_common::registry::DEFAULT_IO_WORKERS;
use ringrpc_common::MAX_FRAME_SIZE;

/// Settings of the delay list used by the DELAY overflow mode.
///
/// # Default Configuration
///
/// - `delay`: 5 seconds
/// - `max_attempts`: 4
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayConfig {
    /// How long a rejected task waits before it is resubmitted
    pub delay: Duration,
    /// Resubmits that may fail before the caller gets `ServiceBusy`
    pub max_attempts: u32,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            max_attempts: 4,
        }
    }
}

/// Server configuration.
///
/// # Default Configuration
///
/// - `max_frame_size`: 1 MiB
/// - `idle_timeout`: 200 seconds
/// - `drain_timeout`: 10 seconds
/// - `io_workers`: 8 threads per bound address
/// - `delay`: see [`DelayConfig`]
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use ringrpc_server::ServerConfig;
///
/// let config = ServerConfig {
///     idle_timeout: Duration::from_secs(30),
///     ..ServerConfig::default()
/// };
/// assert_eq!(config.io_workers, 8);
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_frame_size: usize,
    /// Connections with no inbound frame for this long are closed
    pub idle_timeout: Duration,
    /// How long shutdown waits for queued tasks to finish
    pub drain_timeout: Duration,
    /// I/O threads per address; a service descriptor may ask for more
    pub io_workers: usize,
    pub delay: DelayConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            idle_timeout: Duration::from_secs(200),
            drain_timeout: Duration::from_secs(10),
            io_workers: DEFAULT_IO_WORKERS,
            delay: DelayConfig::default(),
        }
    }
}
