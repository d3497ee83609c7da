use mailrelay_protocol::Identity;
use std::collections::{HashMap, VecDeque};

/// Default per-identity bound.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Per-identity bounded FIFO of envelopes waiting for their recipient.
///
/// Contents are opaque. Once an identity's queue is full, each new envelope
/// evicts the oldest one; enqueue never fails or blocks.
pub struct OfflineQueue<T> {
    queues: HashMap<Identity, VecDeque<T>>,
    capacity: usize,
}

impl<T> OfflineQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append `envelope` for `identity`. Returns the evicted envelope when
    /// the bound was exceeded.
    pub fn enqueue(&mut self, identity: &str, envelope: T) -> Option<T> {
        let queue = self.queues.entry(identity.to_string()).or_default();
        queue.push_back(envelope);
        if queue.len() > self.capacity {
            queue.pop_front()
        } else {
            None
        }
    }

    /// Take everything queued for `identity` in insertion order.
    pub fn drain(&mut self, identity: &str) -> Vec<T> {
        self.queues
            .remove(identity)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub fn len(&self, identity: &str) -> usize {
        self.queues.get(identity).map_or(0, VecDeque::len)
    }

    /// Total envelopes held across all identities.
    pub fn total(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> Default for OfflineQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
