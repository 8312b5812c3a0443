//! Heartbeat timing configuration.

use crate::timeouts::MessageTimeoutStrategy;
use std::time::Duration;

/// Configuration for heartbeat exchange.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// How often to send a heartbeat to each peer (default: 5s)
    pub heartbeat_interval: Duration,
    /// How long without a heartbeat before suspecting a peer (default: 11s)
    pub heartbeat_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(11),
        }
    }
}

impl HeartbeatConfig {
    /// Strategy giving heartbeat timers their configured durations.
    pub fn timeout_strategy(&self) -> MessageTimeoutStrategy {
        MessageTimeoutStrategy::new(self.heartbeat_timeout)
            .timeout("send_heartbeat", self.heartbeat_interval)
            .timeout("timed_out", self.heartbeat_timeout)
    }
}
