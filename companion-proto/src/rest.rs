//! REST contract between companion clients and the game's HTTP API.
//!
//! Request and response bodies are camelCase JSON. Every failure carries an
//! [`ErrorResponse`] body.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::message::{BeatPitchEvent, ClientId, Timestamp};
use crate::permission::Permission;

/// Header identifying the calling client on every REST request.
pub const CLIENT_ID_HEADER: &str = "client-id";

/// Path prefix of all REST routes.
pub const REST_PREFIX: &str = "/api/rest";

/// Game settings exposed to companions, keyed by setting name.
pub type GameConfig = BTreeMap<String, serde_json::Value>;

/// JSON body of every failed REST call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    /// Human-readable reason.
    pub error_message: String,
}

impl ErrorResponse {
    /// Creates an error body.
    pub fn new(error_message: impl Into<String>) -> Self {
        Self {
            error_message: error_message.into(),
        }
    }
}

/// Answer of the unauthenticated `hello` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloResponse {
    /// Protocol version the game speaks.
    pub protocol_version: u32,
    /// Port the REST API is served on.
    pub http_server_port: u16,
}

/// Caller's current grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionsResponse {
    /// Granted capabilities.
    pub permissions: Vec<Permission>,
}

/// One song of the library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SongDto {
    /// Stable song identifier.
    pub song_id: String,
    /// Performing artist.
    pub artist: String,
    /// Song title.
    pub title: String,
    /// Length in milliseconds.
    pub duration_millis: u64,
}

/// One entry of the song queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SongQueueEntryDto {
    /// Song to sing.
    pub song_id: String,
    /// Player names, in microphone order.
    #[serde(default)]
    pub singers: Vec<String>,
}

/// Latest pitch data received from one companion microphone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicrophoneDataDto {
    /// Companion that recorded the data.
    pub client_id: ClientId,
    /// Its display name.
    pub client_name: String,
    /// The most recent batch of events.
    pub events: Vec<BeatPitchEvent>,
    /// When the batch was received.
    pub timestamp: Timestamp,
}

/// Body of an input-simulation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputSimulationRequest {
    /// Name of the key to press, e.g. `"Enter"`.
    pub key: String,
}
