//! Broadcast loop configuration.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DEFAULT_PORT, MAX_UDP_PAYLOAD};

/// Broadcast loop configuration options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Address to bind the control/broadcast socket to.
    pub bind_addr: SocketAddr,

    /// Relay buffer capacity in bytes (`None` = unbounded).
    pub buffer_capacity: Option<usize>,

    /// Maximum bytes drained from the relay buffer per wake-up.
    pub max_read_size: usize,

    /// Drained bytes are split into datagrams of at most this size.
    pub max_datagram_size: usize,

    /// Subscribers silent for this long are evicted.
    pub subscriber_timeout_ms: u64,

    /// Upper bound on one loop iteration's wait.
    pub poll_interval_ms: u64,

    /// Interval between statistics log lines while streaming.
    pub stats_interval_ms: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            buffer_capacity: Some(8 * 1024 * 1024), // 8MB
            max_read_size: 1024 * 1024,             // 1MB
            max_datagram_size: MAX_UDP_PAYLOAD,
            subscriber_timeout_ms: 30_000,
            poll_interval_ms: 1_000,
            stats_interval_ms: 5_000,
        }
    }
}

impl BroadcastConfig {
    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the relay buffer capacity
    pub fn buffer_capacity(mut self, capacity: Option<usize>) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Set the per-wake-up read limit
    pub fn max_read_size(mut self, size: usize) -> Self {
        self.max_read_size = size.max(1);
        self
    }

    /// Set the datagram size limit
    pub fn max_datagram_size(mut self, size: usize) -> Self {
        self.max_datagram_size = size.clamp(1, MAX_UDP_PAYLOAD);
        self
    }

    /// Set the subscriber timeout
    pub fn subscriber_timeout(mut self, timeout: Duration) -> Self {
        self.subscriber_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the poll interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the stats interval
    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn subscriber_timeout_time(&self) -> Duration {
        Duration::from_millis(self.subscriber_timeout_ms)
    }

    /// Poll interval, never zero.
    pub fn poll_interval_time(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn stats_interval_time(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    /// Read limit, never zero.
    pub(crate) fn read_limit(&self) -> usize {
        self.max_read_size.max(1)
    }

    /// Datagram limit within UDP bounds.
    pub(crate) fn datagram_limit(&self) -> usize {
        self.max_datagram_size.clamp(1, MAX_UDP_PAYLOAD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BroadcastConfig::default();

        assert_eq!(config.bind_addr.port(), 8442);
        assert_eq!(config.buffer_capacity, Some(8 * 1024 * 1024));
        assert_eq!(config.max_read_size, 1024 * 1024);
        assert_eq!(config.subscriber_timeout_time(), Duration::from_secs(30));
        assert_eq!(config.poll_interval_time(), Duration::from_secs(1));
    }

    #[test]
    fn test_builder() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let config = BroadcastConfig::default()
            .bind(addr)
            .buffer_capacity(None)
            .max_datagram_size(1_000_000)
            .subscriber_timeout(Duration::from_millis(250))
            .poll_interval(Duration::ZERO);

        assert_eq!(config.bind_addr, addr);
        assert_eq!(config.buffer_capacity, None);
        assert_eq!(config.max_datagram_size, MAX_UDP_PAYLOAD);
        assert_eq!(config.subscriber_timeout_ms, 250);
        assert_eq!(config.poll_interval_time(), Duration::from_millis(1));
    }

    #[test]
    fn test_limits_clamped_when_deserialized() {
        let config: BroadcastConfig =
            serde_json::from_str(r#"{ "max_read_size": 0, "max_datagram_size": 100000 }"#)
                .unwrap();

        assert_eq!(config.read_limit(), 1);
        assert_eq!(config.datagram_limit(), MAX_UDP_PAYLOAD);
        assert_eq!(config.stats_interval_ms, 5_000);
    }

    #[test]
    fn test_unbounded_buffer_from_json() {
        let config: BroadcastConfig =
            serde_json::from_str(r#"{ "bind_addr": "0.0.0.0:9100", "buffer_capacity": null }"#)
                .unwrap();

        assert_eq!(config.bind_addr.port(), 9100);
        assert_eq!(config.buffer_capacity, None);
    }
}
