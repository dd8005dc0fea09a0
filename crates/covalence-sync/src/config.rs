//! Connection tuning shared by every transport.

use std::time::Duration;

/// Configuration for peer connections.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Bytes queued on a socket above which `send` waits for it to drain.
    pub outgoing_watermark: usize,
    /// How often a blocked `send` re-checks the queued byte count.
    pub poll_delay: Duration,
    /// Interval between keepalive pings.
    pub ping_interval: Duration,
    /// Silence after which the peer is considered gone.
    pub pong_timeout: Duration,
    /// Capacity of the decoded-message channel per connection.
    pub channel_capacity: usize,
    /// Longest accepted NDJSON line.
    pub max_line_bytes: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            outgoing_watermark: 1024 * 1024,
            poll_delay: Duration::from_millis(10),
            ping_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(30),
            channel_capacity: 1024,
            max_line_bytes: 16 * 1024 * 1024,
        }
    }
}

impl SyncConfig {
    pub fn with_outgoing_watermark(mut self, bytes: usize) -> Self {
        self.outgoing_watermark = bytes;
        self
    }

    pub fn with_poll_delay(mut self, delay: Duration) -> Self {
        self.poll_delay = delay;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout = timeout;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn with_max_line_bytes(mut self, bytes: usize) -> Self {
        self.max_line_bytes = bytes;
        self
    }
}
