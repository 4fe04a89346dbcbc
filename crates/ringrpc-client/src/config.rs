use std::time::Duration;

use ringrpc_common::MAX_FRAME_SIZE;

/// Client configuration.
///
/// Controls call timeouts, retries, reconnection and heartbeats for every
/// pool created by a [`ClientContext`](crate::ClientContext).
///
/// # Default Configuration
///
/// - `call_timeout`: 30 seconds
/// - `max_retries`: 3
/// - `unwritable_pause`: 10 milliseconds
/// - `connect_timeout`: 5 seconds
/// - `reconnect_delay`: 1 second
/// - `reconnect_retry_delay`: 60 seconds
/// - `write_queue_capacity`: 1024 frames
/// - `heartbeat_interval`: 60 seconds
/// - `max_missed_heartbeats`: 3
/// - `metadata_timeout`: 30 seconds
/// - `max_frame_size`: 1 MiB
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use ringrpc_client::ClientConfig;
///
/// let config = ClientConfig {
///     call_timeout: Duration::from_secs(5),
///     max_retries: 1,
///     ..ClientConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long one attempt waits for its response
    pub call_timeout: Duration,
    /// Timed-out attempts resent before the call fails
    pub max_retries: u32,
    /// Pause before trying again when the picked connection cannot take a write
    pub unwritable_pause: Duration,
    pub connect_timeout: Duration,
    /// Delay before the first reconnect after an unexpected disconnect
    pub reconnect_delay: Duration,
    /// Delay between later reconnect attempts
    pub reconnect_retry_delay: Duration,
    /// Frames a connection buffers before it reports itself unwritable
    pub write_queue_capacity: usize,
    /// Write-idle time after which a heartbeat is sent
    pub heartbeat_interval: Duration,
    /// Heartbeat intervals without any inbound frame before the connection is dropped
    pub max_missed_heartbeats: u32,
    /// How long `connect` waits for the service metadata
    pub metadata_timeout: Duration,
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            max_retries: 3,
            unwritable_pause: Duration::from_millis(10),
            connect_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(1),
            reconnect_retry_delay: Duration::from_secs(60),
            write_queue_capacity: 1024,
            heartbeat_interval: Duration::from_secs(60),
            max_missed_heartbeats: 3,
            metadata_timeout: Duration::from_secs(30),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.call_timeout, Duration::from_secs(30));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.unwritable_pause, Duration::from_millis(10));
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));
        assert_eq!(config.reconnect_retry_delay, Duration::from_secs(60));
    }
}
