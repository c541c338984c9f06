//! In-game notifications about companion activity.
//!
//! The server fans these out over a `tokio::sync::broadcast` channel; any
//! part of the game can subscribe via
//! [`CompanionState::subscribe`](crate::server::CompanionState::subscribe).

use companion_proto::message::{ClientId, CompanionMessage};
use companion_proto::permission::PermissionSet;

/// Capacity of the event channel. Slow subscribers lag and skip events.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something happened on the companion link.
#[derive(Debug, Clone, PartialEq)]
pub enum CompanionEvent {
    /// A client completed the handshake.
    ClientConnected {
        /// Client identity.
        client_id: ClientId,
        /// Display name.
        client_name: String,
    },
    /// A connected client went away.
    ClientDisconnected {
        /// Client identity.
        client_id: ClientId,
        /// Why the connection ended.
        reason: String,
    },
    /// A handshake was refused.
    ConnectRejected {
        /// Identity the client claimed.
        client_id: ClientId,
        /// Name the client claimed.
        client_name: String,
        /// The error message sent back.
        reason: String,
    },
    /// A connected client pushed a message.
    MessageReceived {
        /// Sender.
        client_id: ClientId,
        /// The decoded message.
        message: CompanionMessage,
    },
    /// A client's grants changed.
    PermissionsChanged {
        /// Affected client.
        client_id: ClientId,
        /// Grants after the change.
        permissions: PermissionSet,
    },
    /// A client asked the game to press a key.
    InputSimulated {
        /// Requesting client.
        client_id: ClientId,
        /// Key name.
        key: String,
    },
}
