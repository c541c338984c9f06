//! Connection lifecycle state machine.
//!
//! ```text
//! Disconnected --ConnectStarted--> Connecting --Accepted--> Connected
//!      ^                               |                        |
//!      +------------Rejected-----------+                        |
//!      +-----------------------Closed (from any state)----------+
//! ```

use std::fmt;

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No session. Initial and terminal state.
    #[default]
    Disconnected,
    /// `ConnectRequest` sent, waiting for the verdict.
    Connecting,
    /// Handshake accepted; either side may push messages.
    Connected,
}

/// Inputs that drive [`ConnectionState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    /// The client started a handshake.
    ConnectStarted,
    /// The server accepted the handshake.
    Accepted,
    /// The server rejected the handshake.
    Rejected,
    /// The transport closed, from either side.
    Closed,
}

/// A state/event pair with no defined transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition: {event:?} while {state}")]
pub struct InvalidTransition {
    /// State the machine was in.
    pub state: ConnectionState,
    /// Event that could not be applied.
    pub event: ConnectionEvent,
}

impl ConnectionState {
    /// Applies an event, returning the next state.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] for any pair not in the diagram above.
    pub const fn transition(self, event: ConnectionEvent) -> Result<Self, InvalidTransition> {
        match (self, event) {
            (Self::Disconnected, ConnectionEvent::ConnectStarted) => Ok(Self::Connecting),
            (Self::Connecting, ConnectionEvent::Accepted) => Ok(Self::Connected),
            (Self::Connecting, ConnectionEvent::Rejected) | (_, ConnectionEvent::Closed) => {
                Ok(Self::Disconnected)
            }
            (state, event) => Err(InvalidTransition { state, event }),
        }
    }

    /// Whether messages may flow.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}
