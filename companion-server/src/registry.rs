//! Registry of connected companion clients.
//!
//! Each connected client owns an outbound channel drained by its socket
//! writer task. Every registration gets a fresh [`ConnectionToken`] so that
//! a socket replaced by a reconnect of the same [`ClientId`] cannot remove
//! its successor when it shuts down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use companion_proto::message::{ClientId, Envelope, Timestamp};
use companion_proto::permission::PermissionSet;
use tokio::sync::{RwLock, mpsc};

/// Instruction for a client's socket writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Encode and send this envelope.
    Message(Envelope),
    /// Send a close frame and stop.
    Close,
}

/// Identifies one registration of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionToken(u64);

/// Errors when pushing a message to a client.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// No client with this id is connected.
    #[error("client {0} is not connected")]
    NotConnected(ClientId),
    /// The client's writer task has already stopped.
    #[error("connection to client {0} is closed")]
    ChannelClosed(ClientId),
}

/// Public view of a connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSummary {
    /// Client identity.
    pub client_id: ClientId,
    /// Display name sent in the handshake.
    pub client_name: String,
    /// Current grants.
    pub permissions: PermissionSet,
    /// When the handshake completed.
    pub connected_at: Timestamp,
}

struct Entry {
    summary: ClientSummary,
    token: ConnectionToken,
    sender: mpsc::UnboundedSender<Outbound>,
}

/// Maps `ClientId` to the live connection of that client.
pub struct ClientRegistry {
    clients: RwLock<HashMap<ClientId, Entry>>,
    next_token: AtomicU64,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Registers a client, replacing any connection it already had.
    ///
    /// The replaced connection is told to close. Returns the token of the
    /// new registration and whether an old connection was replaced.
    pub async fn register(
        &self,
        client_id: &ClientId,
        client_name: &str,
        permissions: PermissionSet,
        sender: mpsc::UnboundedSender<Outbound>,
    ) -> (ConnectionToken, bool) {
        let token = ConnectionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let entry = Entry {
            summary: ClientSummary {
                client_id: client_id.clone(),
                client_name: client_name.to_string(),
                permissions,
                connected_at: Timestamp::now(),
            },
            token,
            sender,
        };
        let old = self.clients.write().await.insert(client_id.clone(), entry);
        let replaced = old.is_some_and(|old| {
            let _ = old.sender.send(Outbound::Close);
            true
        });
        (token, replaced)
    }

    /// Removes a client if `token` still names its current connection.
    ///
    /// Returns `true` if the entry was removed.
    pub async fn unregister(&self, client_id: &ClientId, token: ConnectionToken) -> bool {
        let mut clients = self.clients.write().await;
        if clients.get(client_id).is_some_and(|e| e.token == token) {
            clients.remove(client_id);
            true
        } else {
            false
        }
    }

    /// Whether a client with this id is connected.
    pub async fn contains(&self, client_id: &ClientId) -> bool {
        self.clients.read().await.contains_key(client_id)
    }

    /// Returns a snapshot of one connected client.
    pub async fn get(&self, client_id: &ClientId) -> Option<ClientSummary> {
        self.clients
            .read()
            .await
            .get(client_id)
            .map(|e| e.summary.clone())
    }

    /// Returns snapshots of all connected clients, ordered by id.
    pub async fn list(&self) -> Vec<ClientSummary> {
        let mut list: Vec<_> = self
            .clients
            .read()
            .await
            .values()
            .map(|e| e.summary.clone())
            .collect();
        list.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        list
    }

    /// Number of connected clients.
    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Whether no client is connected.
    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// Replaces the grants of a connected client. Returns `false` if it is
    /// not connected.
    pub async fn set_permissions(&self, client_id: &ClientId, permissions: PermissionSet) -> bool {
        match self.clients.write().await.get_mut(client_id) {
            Some(entry) => {
                entry.summary.permissions = permissions;
                true
            }
            None => false,
        }
    }

    /// Queues an envelope for a connected client.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::NotConnected`] if the client is unknown, or
    /// [`SendError::ChannelClosed`] if its writer has already stopped.
    pub async fn send(&self, client_id: &ClientId, envelope: Envelope) -> Result<(), SendError> {
        let clients = self.clients.read().await;
        let entry = clients
            .get(client_id)
            .ok_or_else(|| SendError::NotConnected(client_id.clone()))?;
        entry
            .sender
            .send(Outbound::Message(envelope))
            .map_err(|_| SendError::ChannelClosed(client_id.clone()))
    }

    /// Queues an envelope for every connected client. Returns how many
    /// writers accepted it.
    pub async fn broadcast(&self, envelope: &Envelope) -> usize {
        let clients = self.clients.read().await;
        clients
            .values()
            .filter(|e| e.sender.send(Outbound::Message(envelope.clone())).is_ok())
            .count()
    }

    /// Tells a client's writer to close the connection. Returns `false` if
    /// the client is not connected.
    pub async fn close(&self, client_id: &ClientId) -> bool {
        self.clients
            .read()
            .await
            .get(client_id)
            .is_some_and(|e| e.sender.send(Outbound::Close).is_ok())
    }
}
