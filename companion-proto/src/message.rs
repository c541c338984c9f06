//! Wire format message types for the companion link.
//!
//! Every message travels as one flat JSON object: a `timestamp`, a
//! `messageType` discriminator and the type-specific payload fields, all
//! camelCase. [`Envelope`] is the unit of transmission; [`CompanionMessage`]
//! is the tagged union of payloads keyed by [`MessageType`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::permission::Permission;

/// Maximum allowed size of one encoded message in bytes (64 KB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Name of the JSON field that carries the [`MessageType`] tag.
pub const MESSAGE_TYPE_FIELD: &str = "messageType";

/// Identifies a companion client across reconnects.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Creates a client identifier from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh, time-ordered identifier (UUID v7).
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Returns the string representation of this client ID.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Discriminator naming the concrete payload of a [`CompanionMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Keep-alive probe from the client.
    StillAliveRequest,
    /// Keep-alive answer from the server.
    StillAliveResponse,
    /// First message of the handshake.
    ConnectRequest,
    /// Server verdict on a [`MessageType::ConnectRequest`].
    ConnectResponse,
    /// Server push of the client's current grants.
    Permissions,
    /// Server push of the playback position.
    PositionInSong,
    /// Pitch samples recorded by the companion microphone.
    BeatPitchEvents,
    /// Server asks the companion to start recording.
    StartRecording,
    /// Server asks the companion to stop recording.
    StopRecording,
    /// Microphone settings pushed to the companion.
    MicProfile,
}

impl MessageType {
    /// Every message type, in declaration order.
    pub const ALL: [Self; 10] = [
        Self::StillAliveRequest,
        Self::StillAliveResponse,
        Self::ConnectRequest,
        Self::ConnectResponse,
        Self::Permissions,
        Self::PositionInSong,
        Self::BeatPitchEvents,
        Self::StartRecording,
        Self::StopRecording,
        Self::MicProfile,
    ];

    /// Returns the wire name of this message type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StillAliveRequest => "StillAliveRequest",
            Self::StillAliveResponse => "StillAliveResponse",
            Self::ConnectRequest => "ConnectRequest",
            Self::ConnectResponse => "ConnectResponse",
            Self::Permissions => "Permissions",
            Self::PositionInSong => "PositionInSong",
            Self::BeatPitchEvents => "BeatPitchEvents",
            Self::StartRecording => "StartRecording",
            Self::StopRecording => "StopRecording",
            Self::MicProfile => "MicProfile",
        }
    }

    /// Whether only a companion client may send this message type.
    ///
    /// Everything else originates from the game server.
    #[must_use]
    pub const fn sent_by_client(self) -> bool {
        matches!(
            self,
            Self::StillAliveRequest | Self::ConnectRequest | Self::BeatPitchEvents
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string names no known [`MessageType`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown message type: {0}")]
pub struct UnknownMessageType(pub String);

impl FromStr for MessageType {
    type Err = UnknownMessageType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownMessageType(s.to_string()))
    }
}

/// One detected pitch on a song beat.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeatPitchEvent {
    /// Beat index within the song.
    pub beat: i32,
    /// Detected MIDI note, or a negative value for silence.
    pub midi_note: i32,
    /// Detected fundamental frequency in Hz.
    pub frequency: f32,
}

/// Payload of a companion message, tagged by `messageType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageType", rename_all_fields = "camelCase")]
pub enum CompanionMessage {
    /// Keep-alive probe.
    StillAliveRequest,
    /// Keep-alive answer.
    StillAliveResponse,
    /// Opens the handshake.
    ConnectRequest {
        /// Protocol version the client speaks.
        protocol_version: u32,
        /// Human-readable client name shown in game.
        client_name: String,
        /// Stable client identity.
        client_id: ClientId,
    },
    /// Closes the handshake. A non-empty `error_message` means rejection.
    ConnectResponse {
        /// Echo of the requesting client's id.
        client_id: ClientId,
        /// Echo of the requesting client's name.
        client_name: String,
        /// Human-readable rejection reason.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
        /// Port of the REST API.
        http_server_port: u16,
        /// Capabilities granted to the client.
        #[serde(default)]
        permissions: Vec<Permission>,
        /// Game round modifiers the companion may offer.
        #[serde(default)]
        available_modifiers: Vec<String>,
    },
    /// The client's grants changed.
    Permissions {
        /// Complete current grant list.
        permissions: Vec<Permission>,
    },
    /// Current playback position of the running song.
    PositionInSong {
        /// Song being played.
        song_id: String,
        /// Position in milliseconds from the song start.
        position_in_song_millis: u64,
    },
    /// Pitches recorded by the companion microphone.
    BeatPitchEvents {
        /// Samples in beat order.
        events: Vec<BeatPitchEvent>,
    },
    /// Begin streaming microphone data.
    StartRecording,
    /// Stop streaming microphone data.
    StopRecording,
    /// Microphone settings for the companion.
    MicProfile {
        /// Profile name.
        name: String,
        /// Display color as a hex string.
        color: String,
        /// Input amplification in dB.
        amplification: i32,
        /// Noise suppression threshold in percent.
        noise_suppression: i32,
        /// Latency compensation in milliseconds.
        delay_in_millis: i32,
        /// Recording sample rate in Hz.
        sample_rate_hz: u32,
    },
}

impl CompanionMessage {
    /// Returns the discriminator of this message.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        match self {
            Self::StillAliveRequest => MessageType::StillAliveRequest,
            Self::StillAliveResponse => MessageType::StillAliveResponse,
            Self::ConnectRequest { .. } => MessageType::ConnectRequest,
            Self::ConnectResponse { .. } => MessageType::ConnectResponse,
            Self::Permissions { .. } => MessageType::Permissions,
            Self::PositionInSong { .. } => MessageType::PositionInSong,
            Self::BeatPitchEvents { .. } => MessageType::BeatPitchEvents,
            Self::StartRecording => MessageType::StartRecording,
            Self::StopRecording => MessageType::StopRecording,
            Self::MicProfile { .. } => MessageType::MicProfile,
        }
    }
}

/// A timestamped message as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// When the sender created the message.
    pub timestamp: Timestamp,
    /// The tagged payload, flattened into the same JSON object.
    #[serde(flatten)]
    pub message: CompanionMessage,
}

impl Envelope {
    /// Wraps a message, stamping it with the current time.
    #[must_use]
    pub fn new(message: CompanionMessage) -> Self {
        Self {
            timestamp: Timestamp::now(),
            message,
        }
    }

    /// Wraps a message with an explicit timestamp.
    #[must_use]
    pub const fn at(timestamp: Timestamp, message: CompanionMessage) -> Self {
        Self { timestamp, message }
    }

    /// Shorthand for `self.message.message_type()`.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        self.message.message_type()
    }
}
