//! Peer registry: who is online and how to reach them.
//!
//! Maps each registered peer id to its connection handle, call status and
//! join time. The registry holds no lock of its own; it lives inside the
//! [`crate::switchboard::Switchboard`], which serializes all access.

use std::collections::HashMap;

use axum::extract::ws::Message;
use callrelay_proto::{ErrorCode, PeerStatus, ServerMessage};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Why an outbound frame could not be queued for a peer.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The peer's socket writer has shut down.
    #[error("connection closed")]
    Closed,
    /// The peer is not draining its outbound queue fast enough.
    #[error("outbound queue full")]
    Full,
    /// The message could not be serialized.
    #[error("encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Sending half of one connection's outbound queue.
///
/// Cloning is cheap; every clone feeds the same socket writer task. Sends
/// never wait: a full or closed queue is reported as a [`DeliveryError`].
#[derive(Debug, Clone)]
pub struct PeerHandle {
    conn_id: u64,
    tx: mpsc::Sender<Message>,
}

impl PeerHandle {
    /// Wraps the sender for connection number `conn_id`.
    #[must_use]
    pub const fn new(conn_id: u64, tx: mpsc::Sender<Message>) -> Self {
        Self { conn_id, tx }
    }

    /// Serial number of the connection this handle writes to.
    #[must_use]
    pub const fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Whether the socket writer is still accepting frames.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Encodes `msg` and queues it as a text frame without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError`] if the queue is full or closed, or the
    /// message cannot be encoded.
    pub fn try_deliver(&self, msg: &ServerMessage) -> Result<(), DeliveryError> {
        let json = msg.to_json()?;
        self.try_send(Message::Text(json.into()))
    }

    /// Queues a close frame; the writer task shuts down after sending it.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError`] if the queue is full or closed.
    pub fn close(&self) -> Result<(), DeliveryError> {
        self.try_send(Message::Close(None))
    }

    fn try_send(&self, frame: Message) -> Result<(), DeliveryError> {
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// A registered peer.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    /// Peer id chosen at registration.
    pub id: String,
    /// Outbound queue of the peer's connection.
    pub handle: PeerHandle,
    /// Current call status.
    pub status: PeerStatus,
    /// When the peer registered.
    pub joined_at: DateTime<Utc>,
}

/// Errors from registry operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Another connection already holds this id.
    #[error("peer id {0} is already taken")]
    AlreadyTaken(String),
    /// No peer with this id is registered.
    #[error("peer {0} not found")]
    NotFound(String),
}

impl RegistryError {
    /// The wire error code reported back to the requester.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::AlreadyTaken(_) => ErrorCode::AlreadyTaken,
            Self::NotFound(_) => ErrorCode::PeerUnavailable,
        }
    }
}

/// Registered peers keyed by id.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<String, PeerEntry>,
}

impl PeerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `id` with status `available`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AlreadyTaken`] if `id` is already present;
    /// the existing entry is left untouched.
    pub fn register(
        &mut self,
        id: &str,
        handle: PeerHandle,
        joined_at: DateTime<Utc>,
    ) -> Result<&PeerEntry, RegistryError> {
        match self.peers.entry(id.to_string()) {
            std::collections::hash_map::Entry::Occupied(_) => {
                Err(RegistryError::AlreadyTaken(id.to_string()))
            }
            std::collections::hash_map::Entry::Vacant(slot) => Ok(&*slot.insert(PeerEntry {
                id: id.to_string(),
                handle,
                status: PeerStatus::Available,
                joined_at,
            })),
        }
    }

    /// Looks up a registered peer.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if `id` is not registered.
    pub fn lookup(&self, id: &str) -> Result<&PeerEntry, RegistryError> {
        self.peers
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Current status of `id`, if registered.
    #[must_use]
    pub fn status(&self, id: &str) -> Option<PeerStatus> {
        self.peers.get(id).map(|p| p.status)
    }

    /// Sets the status of `id`; no-op if the peer is absent.
    pub fn set_status(&mut self, id: &str, status: PeerStatus) {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.status = status;
        }
    }

    /// Removes `id`, returning its entry. Call cleanup is the caller's job.
    pub fn remove(&mut self, id: &str) -> Option<PeerEntry> {
        self.peers.remove(id)
    }

    /// Registered ids, sorted.
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Ids of peers whose connection can no longer be written to.
    #[must_use]
    pub fn dead_peers(&self) -> Vec<String> {
        self.peers
            .values()
            .filter(|p| !p.handle.is_open())
            .map(|p| p.id.clone())
            .collect()
    }

    /// Iterates over every registered peer.
    pub fn entries(&self) -> impl Iterator<Item = &PeerEntry> {
        self.peers.values()
    }

    /// Number of registered peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peer is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
