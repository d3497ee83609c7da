use mailrelay_protocol::{Identity, PeerSummary};
use std::collections::HashMap;

/// Monotonic id assigned to every accepted connection.
pub type ConnId = u64;

/// A live registration.
#[derive(Clone, Debug)]
pub struct RegistryEntry<H> {
    pub identity: Identity,
    pub owner_id: String,
    pub conn_id: ConnId,
    pub connected_since: u64,
    pub handle: H,
}

impl<H> RegistryEntry<H> {
    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            email: self.identity.clone(),
            user_id: self.owner_id.clone(),
        }
    }
}

/// Identity -> live connection map.
///
/// Pure bookkeeping, no I/O: the router owns the handles it stores here and
/// decides what to do with a superseded one. Entries are removed on
/// disconnect rather than flagged dead, so every entry is live.
pub struct ConnectionRegistry<H> {
    entries: HashMap<Identity, RegistryEntry<H>>,
}

impl<H> Default for ConnectionRegistry<H> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<H> ConnectionRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the entry for `identity`. Returns the superseded
    /// entry, if any, so the caller can close its handle.
    pub fn register(
        &mut self,
        identity: Identity,
        owner_id: String,
        conn_id: ConnId,
        connected_since: u64,
        handle: H,
    ) -> Option<RegistryEntry<H>> {
        let entry = RegistryEntry {
            identity: identity.clone(),
            owner_id,
            conn_id,
            connected_since,
            handle,
        };
        self.entries.insert(identity, entry)
    }

    pub fn lookup(&self, identity: &str) -> Option<&RegistryEntry<H>> {
        self.entries.get(identity)
    }

    /// Remove unconditionally. Removing an absent identity is a no-op.
    pub fn remove(&mut self, identity: &str) -> Option<RegistryEntry<H>> {
        self.entries.remove(identity)
    }

    /// Remove only if the entry still belongs to `conn_id`.
    ///
    /// A connection that was superseded must not evict its replacement when
    /// it finally closes.
    pub fn remove_connection(
        &mut self,
        identity: &str,
        conn_id: ConnId,
    ) -> Option<RegistryEntry<H>> {
        match self.entries.get(identity) {
            Some(entry) if entry.conn_id == conn_id => self.entries.remove(identity),
            _ => None,
        }
    }

    /// Snapshot of everyone online. Order is unspecified.
    pub fn list_online(&self) -> Vec<PeerSummary> {
        self.entries.values().map(RegistryEntry::summary).collect()
    }

    /// Iterate live entries other than `identity`.
    pub fn others<'a>(
        &'a self,
        identity: &'a str,
    ) -> impl Iterator<Item = &'a RegistryEntry<H>> + 'a {
        self.entries.values().filter(move |e| e.identity != identity)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegistryEntry<H>> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
