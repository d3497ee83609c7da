use mailrelay_protocol::RELAY_PATH;
use std::time::Duration;

use crate::queue::DEFAULT_QUEUE_CAPACITY;

/// Tuning for a [`Relay`](crate::router::Relay) instance.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// WebSocket path; the status API hangs off it.
    pub path: String,
    /// Offline envelopes kept per identity before the oldest is evicted.
    pub queue_capacity: usize,
    /// Frames buffered per connection before sends to it start failing.
    pub outbound_buffer: usize,
    /// Largest inbound WebSocket message accepted.
    pub max_frame_bytes: usize,
    /// Upper bound on a single socket write.
    pub send_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            path: RELAY_PATH.to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            outbound_buffer: 256,
            max_frame_bytes: 16 * 1024 * 1024,
            send_timeout: Duration::from_secs(10),
        }
    }
}

impl RelayConfig {
    /// Outbound buffer actually given to a connection: never smaller than a
    /// full offline queue plus the `peers-list` reply, so a fresh
    /// registration can always take its whole backlog.
    pub fn session_buffer(&self) -> usize {
        self.outbound_buffer.max(self.queue_capacity + 1)
    }
}
