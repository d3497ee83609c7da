use mailrelay_protocol::{ClientFrame, Identity, ServerFrame, data_field, now_ms};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::queue::OfflineQueue;
use crate::registry::{ConnId, ConnectionRegistry};

/// Write side of one connection.
///
/// Sends never wait: a full outbound buffer or a finished writer task counts
/// as a failed delivery, so one slow peer cannot stall the relay.
#[derive(Clone, Debug)]
pub struct PeerHandle {
    conn_id: ConnId,
    tx: mpsc::Sender<ServerFrame>,
    closer: CancellationToken,
}

impl PeerHandle {
    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn send(&self, frame: ServerFrame) -> Result<(), TrySendError<ServerFrame>> {
        self.tx.try_send(frame)
    }

    /// Ask the connection's tasks to shut down.
    pub fn close(&self) {
        self.closer.cancel();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Registered(Identity),
    Closed,
}

/// Per-connection router state, owned by the connection's task.
pub struct Session {
    handle: PeerHandle,
    state: ConnectionState,
}

impl Session {
    pub fn conn_id(&self) -> ConnId {
        self.handle.conn_id
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn identity(&self) -> Option<&str> {
        match &self.state {
            ConnectionState::Registered(identity) => Some(identity),
            _ => None,
        }
    }

    /// Fires when the relay wants this connection closed (superseded) or the
    /// writer has given up on the socket.
    pub fn closer(&self) -> CancellationToken {
        self.handle.closer.clone()
    }

    fn reply(&self, frame: ServerFrame) {
        if let Err(e) = self.handle.send(frame) {
            tracing::debug!(conn_id = self.conn_id(), "reply dropped: {e}");
        }
    }
}

/// An online user as reported by the status API.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OnlinePeer {
    pub email: Identity,
    pub user_id: String,
    pub connected_since: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeerStatus {
    pub email: Identity,
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_since: Option<u64>,
    pub queued: usize,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct RelayStats {
    pub online: usize,
    pub queued: usize,
}

struct Tables {
    registry: ConnectionRegistry<PeerHandle>,
    queue: OfflineQueue<ServerFrame>,
}

/// The relay: connection registry, offline queue and the routing rules
/// between them.
///
/// Registry and queue sit behind one lock so register+drain and
/// lookup+enqueue are each a single critical section; an email racing its
/// recipient's registration is either drained or delivered live, never lost.
pub struct Relay {
    config: RelayConfig,
    tables: Mutex<Tables>,
    next_conn_id: AtomicU64,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        let queue = OfflineQueue::new(config.queue_capacity);
        Self {
            config,
            tables: Mutex::new(Tables {
                registry: ConnectionRegistry::new(),
                queue,
            }),
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Accept a new, unregistered connection. The receiver yields every
    /// frame destined for it.
    pub fn open_session(&self) -> (Session, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(self.config.session_buffer());
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let handle = PeerHandle {
            conn_id,
            tx,
            closer: CancellationToken::new(),
        };
        tracing::debug!(conn_id, "connection opened");
        (
            Session {
                handle,
                state: ConnectionState::Connecting,
            },
            rx,
        )
    }

    /// Decode and dispatch one inbound text frame. Failures are reported
    /// back to the sender; the connection always stays usable.
    pub async fn handle_text(&self, session: &mut Session, text: &str) {
        let frame = match ClientFrame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(conn_id = session.conn_id(), "dropping malformed frame: {e}");
                session.reply(RelayError::from(e).to_frame(now_ms()));
                return;
            }
        };
        if let Err(e) = self.handle_frame(session, frame).await {
            tracing::debug!(conn_id = session.conn_id(), "{e}");
            session.reply(e.to_frame(now_ms()));
        }
    }

    pub async fn handle_frame(
        &self,
        session: &mut Session,
        frame: ClientFrame,
    ) -> Result<(), RelayError> {
        if session.state == ConnectionState::Closed {
            return Ok(());
        }
        match frame {
            ClientFrame::Register {
                user_id,
                user_email,
            } => {
                self.register(session, user_id, user_email).await;
                Ok(())
            }
            ClientFrame::Email { from, to, data } => {
                require_sender(session, "email", &from)?;
                self.route_email(session, from, to, data).await;
                Ok(())
            }
            ClientFrame::FileChunk { from, to, data } => {
                require_sender(session, "file-chunk", &from)?;
                self.route_file_chunk(session, from, to, data).await
            }
            ClientFrame::FileComplete { from, to, data } => {
                require_sender(session, "file-complete", &from)?;
                self.route_file_complete(from, to, data).await
            }
        }
    }

    async fn register(&self, session: &mut Session, user_id: String, email: Identity) {
        let now = now_ms();
        let conn_id = session.conn_id();
        let mut tables = self.tables.lock().await;

        // Re-registering under a different identity releases the old one.
        if let ConnectionState::Registered(previous) = &session.state {
            if *previous != email && tables.registry.remove_connection(previous, conn_id).is_some()
            {
                tracing::info!(identity = %previous, conn_id, "identity released by re-register");
                broadcast(
                    &tables.registry,
                    previous,
                    ServerFrame::PeerOffline {
                        email: previous.clone(),
                        timestamp: now,
                    },
                );
            }
        }

        let superseded = tables.registry.register(
            email.clone(),
            user_id.clone(),
            conn_id,
            now,
            session.handle.clone(),
        );
        if let Some(old) = superseded.filter(|old| old.conn_id != conn_id) {
            tracing::info!(identity = %email, old_conn = old.conn_id, conn_id, "closing superseded connection");
            let _ = old
                .handle
                .send(RelayError::Superseded(email.clone()).to_frame(now));
            old.handle.close();
        }
        let was_online = session.identity() == Some(email.as_str());
        session.state = ConnectionState::Registered(email.clone());

        let pending = tables.queue.drain(&email);
        if !pending.is_empty() {
            tracing::info!(identity = %email, count = pending.len(), "flushing offline queue");
        }
        let mut pending = pending.into_iter();
        while let Some(envelope) = pending.next() {
            if let Err(e) = session.handle.send(envelope) {
                // Anything sent live from here on would overtake the requeued
                // envelopes, so the connection is dropped instead.
                tracing::warn!(identity = %email, conn_id, "queue flush interrupted, closing: {e}");
                tables.queue.enqueue(&email, e.into_inner());
                for rest in pending.by_ref() {
                    tables.queue.enqueue(&email, rest);
                }
                tables.registry.remove_connection(&email, conn_id);
                if was_online {
                    broadcast(
                        &tables.registry,
                        &email,
                        ServerFrame::PeerOffline {
                            email: email.clone(),
                            timestamp: now,
                        },
                    );
                }
                session.state = ConnectionState::Closed;
                session.handle.close();
                return;
            }
        }

        broadcast(
            &tables.registry,
            &email,
            ServerFrame::PeerOnline {
                user_id,
                email: email.clone(),
                timestamp: now,
            },
        );

        // Sent under the lock so no peer-online can slip in ahead of the list.
        let peers = tables
            .registry
            .others(&email)
            .map(|entry| entry.summary())
            .collect();
        session.reply(ServerFrame::PeersList {
            peers,
            timestamp: now,
        });
        drop(tables);

        tracing::info!(identity = %email, conn_id, "peer registered");
    }

    async fn route_email(&self, session: &Session, from: Identity, to: Identity, data: Value) {
        let now = now_ms();
        let email_id = data_field(&data, "id");
        let envelope = ServerFrame::Email {
            from,
            data,
            timestamp: now,
        };

        let mut tables = self.tables.lock().await;
        let undelivered = match tables.registry.lookup(&to) {
            Some(entry) => match entry.handle.send(envelope) {
                Ok(()) => None,
                Err(e) => {
                    tracing::warn!(to = %to, "live delivery failed, queueing: {e}");
                    Some(e.into_inner())
                }
            },
            None => Some(envelope),
        };

        match undelivered {
            None => {
                drop(tables);
                tracing::debug!(to = %to, "email delivered");
                session.reply(ServerFrame::EmailDelivered {
                    email_id,
                    timestamp: now,
                });
            }
            Some(envelope) => {
                if tables.queue.enqueue(&to, envelope).is_some() {
                    tracing::warn!(to = %to, "offline queue full, evicted oldest email");
                }
                let queued = tables.queue.len(&to);
                drop(tables);
                tracing::debug!(to = %to, queued, "recipient offline, email queued");
                session.reply(ServerFrame::PeerOffline {
                    email: to,
                    timestamp: now,
                });
            }
        }
    }

    /// Chunks are never queued: an offline or failing recipient is reported
    /// to the sender and the chunk is dropped.
    async fn route_file_chunk(
        &self,
        session: &Session,
        from: Identity,
        to: Identity,
        data: Value,
    ) -> Result<(), RelayError> {
        let now = now_ms();
        let email_id = data_field(&data, "emailId");
        let chunk_index = data_field(&data, "chunkIndex");
        self.forward(
            &to,
            ServerFrame::FileChunk {
                from,
                data,
                timestamp: now,
            },
        )
        .await?;
        session.reply(ServerFrame::ChunkReceived {
            email_id,
            chunk_index,
            timestamp: now,
        });
        Ok(())
    }

    async fn route_file_complete(
        &self,
        from: Identity,
        to: Identity,
        data: Value,
    ) -> Result<(), RelayError> {
        self.forward(
            &to,
            ServerFrame::FileComplete {
                from,
                data,
                timestamp: now_ms(),
            },
        )
        .await
    }

    /// One live delivery attempt, no fallback.
    async fn forward(&self, to: &str, frame: ServerFrame) -> Result<(), RelayError> {
        let tables = self.tables.lock().await;
        let entry = tables
            .registry
            .lookup(to)
            .ok_or_else(|| RelayError::PeerUnreachable(to.to_string()))?;
        entry.handle.send(frame).map_err(|e| {
            tracing::warn!(to = %to, "forward failed: {e}");
            RelayError::PeerUnreachable(to.to_string())
        })
    }

    /// Tear down a connection: drop its registration (if it still owns one)
    /// and tell everyone else it went offline. Safe to call more than once.
    pub async fn close_session(&self, session: &mut Session) {
        let state = std::mem::replace(&mut session.state, ConnectionState::Closed);
        let conn_id = session.conn_id();
        let ConnectionState::Registered(identity) = state else {
            tracing::debug!(conn_id, "unregistered connection closed");
            return;
        };

        let mut tables = self.tables.lock().await;
        if tables
            .registry
            .remove_connection(&identity, conn_id)
            .is_some()
        {
            broadcast(
                &tables.registry,
                &identity,
                ServerFrame::PeerOffline {
                    email: identity.clone(),
                    timestamp: now_ms(),
                },
            );
            tracing::info!(identity = %identity, conn_id, "peer disconnected");
        } else {
            tracing::debug!(identity = %identity, conn_id, "superseded connection closed");
        }
    }

    pub async fn online_peers(&self) -> Vec<OnlinePeer> {
        let tables = self.tables.lock().await;
        tables
            .registry
            .iter()
            .map(|entry| OnlinePeer {
                email: entry.identity.clone(),
                user_id: entry.owner_id.clone(),
                connected_since: entry.connected_since,
            })
            .collect()
    }

    /// `None` when the identity is neither online nor has mail waiting.
    pub async fn peer_status(&self, email: &str) -> Option<PeerStatus> {
        let tables = self.tables.lock().await;
        let queued = tables.queue.len(email);
        match tables.registry.lookup(email) {
            Some(entry) => Some(PeerStatus {
                email: entry.identity.clone(),
                online: true,
                user_id: Some(entry.owner_id.clone()),
                connected_since: Some(entry.connected_since),
                queued,
            }),
            None if queued > 0 => Some(PeerStatus {
                email: email.to_string(),
                online: false,
                user_id: None,
                connected_since: None,
                queued,
            }),
            None => None,
        }
    }

    pub async fn stats(&self) -> RelayStats {
        let tables = self.tables.lock().await;
        RelayStats {
            online: tables.registry.len(),
            queued: tables.queue.total(),
        }
    }
}

/// Routed frames must come from a registered connection and name its own
/// identity as the sender.
fn require_sender(session: &Session, kind: &'static str, from: &str) -> Result<(), RelayError> {
    match &session.state {
        ConnectionState::Registered(identity) if identity == from => Ok(()),
        ConnectionState::Registered(identity) => Err(RelayError::SenderMismatch {
            claimed: from.to_string(),
            identity: identity.clone(),
        }),
        _ => Err(RelayError::NotRegistered { kind }),
    }
}

/// Best-effort fan-out to every live entry except `exclude`.
fn broadcast(registry: &ConnectionRegistry<PeerHandle>, exclude: &str, frame: ServerFrame) {
    for entry in registry.others(exclude) {
        if let Err(e) = entry.handle.send(frame.clone()) {
            tracing::debug!(identity = %entry.identity, "broadcast dropped: {e}");
        }
    }
}
