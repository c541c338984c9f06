//! Connection handshake rules shared by server and client.
//!
//! The client opens with a `ConnectRequest`; the server checks it with
//! [`validate_connect_request`] and answers with a `ConnectResponse`. The
//! client checks that answer with [`check_connect_response`]. Protocol
//! versions must match exactly.

use crate::message::{ClientId, CompanionMessage, MessageType};
use crate::permission::PermissionSet;

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u32 = 1;

/// Reasons a handshake fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    /// Client and server speak different protocol versions.
    #[error(
        "protocol version mismatch: companion app uses version {client}, game uses version {server}. Please update the {}.",
        outdated_side(.client, .server)
    )]
    VersionMismatch {
        /// Version sent by the client.
        client: u32,
        /// Version expected by the server.
        server: u32,
    },
    /// The request carried no client id.
    #[error("client id must not be empty")]
    EmptyClientId,
    /// The request carried no client name.
    #[error("client name must not be empty")]
    EmptyClientName,
    /// The server rejected the connection with the given reason.
    #[error("connection rejected: {0}")]
    Rejected(String),
    /// The server answered with something other than a `ConnectResponse`.
    #[error("expected ConnectResponse, got {0}")]
    UnexpectedMessage(MessageType),
    /// The response was addressed to a different client.
    #[error("response addressed to client {actual}, expected {expected}")]
    ClientIdMismatch {
        /// The id the client sent.
        expected: ClientId,
        /// The id the server echoed.
        actual: ClientId,
    },
}

const fn outdated_side(client: &u32, server: &u32) -> &'static str {
    if *client < *server {
        "companion app"
    } else {
        "game"
    }
}

/// Validates the fields of a `ConnectRequest` against the server's version.
///
/// # Errors
///
/// Returns [`HandshakeError::VersionMismatch`] on any version difference,
/// or [`HandshakeError::EmptyClientId`] / [`HandshakeError::EmptyClientName`]
/// for blank identity fields.
pub fn validate_connect_request(
    protocol_version: u32,
    client_name: &str,
    client_id: &ClientId,
    server_version: u32,
) -> Result<(), HandshakeError> {
    if protocol_version != server_version {
        return Err(HandshakeError::VersionMismatch {
            client: protocol_version,
            server: server_version,
        });
    }
    if client_id.as_str().trim().is_empty() {
        return Err(HandshakeError::EmptyClientId);
    }
    if client_name.trim().is_empty() {
        return Err(HandshakeError::EmptyClientName);
    }
    Ok(())
}

/// The parts of an accepting `ConnectResponse` a client keeps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectAccepted {
    /// Echoed client id.
    pub client_id: ClientId,
    /// Echoed client name.
    pub client_name: String,
    /// Port of the REST API.
    pub http_server_port: u16,
    /// Granted capabilities.
    pub permissions: PermissionSet,
    /// Game round modifiers on offer.
    pub available_modifiers: Vec<String>,
}

/// Interprets the server's answer to a `ConnectRequest`.
///
/// # Errors
///
/// Returns [`HandshakeError::Rejected`] when `error_message` is non-empty,
/// [`HandshakeError::ClientIdMismatch`] when the echoed id differs, or
/// [`HandshakeError::UnexpectedMessage`] for any other message type.
pub fn check_connect_response(
    message: &CompanionMessage,
    expected_client_id: &ClientId,
) -> Result<ConnectAccepted, HandshakeError> {
    let CompanionMessage::ConnectResponse {
        client_id,
        client_name,
        error_message,
        http_server_port,
        permissions,
        available_modifiers,
    } = message
    else {
        return Err(HandshakeError::UnexpectedMessage(message.message_type()));
    };

    if let Some(reason) = error_message.as_deref().filter(|r| !r.is_empty()) {
        return Err(HandshakeError::Rejected(reason.to_string()));
    }
    if client_id != expected_client_id {
        return Err(HandshakeError::ClientIdMismatch {
            expected: expected_client_id.clone(),
            actual: client_id.clone(),
        });
    }

    Ok(ConnectAccepted {
        client_id: client_id.clone(),
        client_name: client_name.clone(),
        http_server_port: *http_server_port,
        permissions: permissions.iter().copied().collect(),
        available_modifiers: available_modifiers.clone(),
    })
}
