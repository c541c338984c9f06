//! JSON encoding and classified decoding of companion envelopes.
//!
//! Decoding first reads the `messageType` tag so that a receiver can tell
//! an unknown message type apart from a known type with a broken payload.
//! Every decode failure is soft: the receiver drops the message, logs it
//! and keeps the connection.

use crate::message::{Envelope, MESSAGE_TYPE_FIELD, MessageType};

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization of an outbound envelope failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The text is not a JSON object.
    #[error("malformed JSON: {0}")]
    MalformedJson(String),
    /// The object has no string `messageType` field.
    #[error("message has no messageType tag")]
    MissingMessageType,
    /// The `messageType` tag names no known type.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    /// The tag is known but the payload fields do not match it.
    #[error("invalid {message_type} payload: {reason}")]
    InvalidPayload {
        /// The type named by the tag.
        message_type: MessageType,
        /// What serde rejected.
        reason: String,
    },
}

impl CodecError {
    /// Whether the receiver should drop the message and keep the connection.
    #[must_use]
    pub const fn is_soft(&self) -> bool {
        !matches!(self, Self::Serialization(_))
    }
}

/// Encodes an [`Envelope`] into JSON text.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the envelope cannot be serialized.
pub fn encode(envelope: &Envelope) -> Result<String, CodecError> {
    serde_json::to_string(envelope).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes an [`Envelope`] from JSON text.
///
/// # Errors
///
/// Returns the [`CodecError`] variant that classifies the failure.
pub fn decode(text: &str) -> Result<Envelope, CodecError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| CodecError::MalformedJson(e.to_string()))?;
    let Some(object) = value.as_object() else {
        return Err(CodecError::MalformedJson(
            "expected a JSON object".to_string(),
        ));
    };
    let tag = object
        .get(MESSAGE_TYPE_FIELD)
        .and_then(serde_json::Value::as_str)
        .ok_or(CodecError::MissingMessageType)?;
    let message_type: MessageType = tag
        .parse()
        .map_err(|_| CodecError::UnknownMessageType(tag.to_string()))?;

    serde_json::from_value(value).map_err(|e| CodecError::InvalidPayload {
        message_type,
        reason: e.to_string(),
    })
}
