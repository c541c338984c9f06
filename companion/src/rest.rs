//! Typed client for the game's REST API.
//!
//! Every request carries the `client-id` header. Non-2xx answers become
//! [`RestError::Api`] with the server's `errorMessage`.

use companion_proto::message::ClientId;
use companion_proto::permission::PermissionSet;
use companion_proto::rest::{
    CLIENT_ID_HEADER, ErrorResponse, GameConfig, HelloResponse, InputSimulationRequest,
    MicrophoneDataDto, PermissionsResponse, REST_PREFIX, SongDto, SongQueueEntryDto,
};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Errors from REST calls.
#[derive(Debug, thiserror::Error)]
pub enum RestError {
    /// The request did not complete or the body did not parse.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The server answered with an error status.
    #[error("server returned {status}: {error_message}")]
    Api {
        /// HTTP status code.
        status: StatusCode,
        /// The server's `errorMessage`, or the raw body.
        error_message: String,
    },
}

impl RestError {
    /// Whether the server refused for lack of identity or permission.
    #[must_use]
    pub fn is_forbidden(&self) -> bool {
        self.status() == Some(StatusCode::FORBIDDEN)
    }

    /// HTTP status of an [`RestError::Api`] error.
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::Http(e) => e.status(),
        }
    }
}

/// REST client bound to one game and one client identity.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: Client,
    base_url: String,
    client_id: ClientId,
}

impl RestClient {
    /// Creates a client for `base_url` (e.g. `http://192.168.0.2:34567`).
    pub fn new(base_url: impl Into<String>, client_id: ClientId) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client_id,
        }
    }

    /// Base URL without the REST prefix.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Protocol version and port of the game. Needs no permission.
    ///
    /// # Errors
    ///
    /// Returns [`RestError`] on transport failure or an error status.
    pub async fn hello(&self) -> Result<HelloResponse, RestError> {
        self.get("/hello").await
    }

    /// The caller's current grants.
    ///
    /// # Errors
    ///
    /// Returns [`RestError`]; 403 if the client is not connected.
    pub async fn permissions(&self) -> Result<PermissionSet, RestError> {
        let response: PermissionsResponse = self.get("/permissions").await?;
        Ok(response.permissions.into_iter().collect())
    }

    /// The song library. Needs `ReadSongs`.
    ///
    /// # Errors
    ///
    /// Returns [`RestError`] on failure.
    pub async fn songs(&self) -> Result<Vec<SongDto>, RestError> {
        self.get("/songs").await
    }

    /// The song queue. Needs `ReadSongQueue`.
    ///
    /// # Errors
    ///
    /// Returns [`RestError`] on failure.
    pub async fn song_queue(&self) -> Result<Vec<SongQueueEntryDto>, RestError> {
        self.get("/song-queue").await
    }

    /// Appends to the song queue and returns the new queue. Needs
    /// `WriteSongQueue`.
    ///
    /// # Errors
    ///
    /// Returns [`RestError`]; 404 for an unknown song.
    pub async fn enqueue_song(
        &self,
        entry: &SongQueueEntryDto,
    ) -> Result<Vec<SongQueueEntryDto>, RestError> {
        self.send_json(Method::POST, "/song-queue", entry).await
    }

    /// Removes a queue entry and returns the new queue. Needs
    /// `WriteSongQueue`.
    ///
    /// # Errors
    ///
    /// Returns [`RestError`]; 404 for an out-of-range index.
    pub async fn remove_from_queue(
        &self,
        index: usize,
    ) -> Result<Vec<SongQueueEntryDto>, RestError> {
        let response = self
            .execute(self.request(Method::DELETE, &format!("/song-queue/{index}")))
            .await?;
        Ok(response.json().await?)
    }

    /// Game settings. Needs `ReadConfig`.
    ///
    /// # Errors
    ///
    /// Returns [`RestError`] on failure.
    pub async fn config(&self) -> Result<GameConfig, RestError> {
        self.get("/config").await
    }

    /// Merges `patch` into the game settings. Needs `WriteConfig`.
    ///
    /// # Errors
    ///
    /// Returns [`RestError`] on failure.
    pub async fn update_config(&self, patch: &GameConfig) -> Result<GameConfig, RestError> {
        self.send_json(Method::PUT, "/config", patch).await
    }

    /// Latest pitch data of every companion. Needs `ReadMicrophoneData`.
    ///
    /// # Errors
    ///
    /// Returns [`RestError`] on failure.
    pub async fn microphone_data(&self) -> Result<Vec<MicrophoneDataDto>, RestError> {
        self.get("/microphone-data").await
    }

    /// Asks the game to press `key`. Needs `WriteInputSimulation`.
    ///
    /// # Errors
    ///
    /// Returns [`RestError`]; 400 for an empty key.
    pub async fn simulate_input(&self, key: &str) -> Result<(), RestError> {
        let body = InputSimulationRequest {
            key: key.to_string(),
        };
        self.execute(self.request(Method::POST, "/input-simulation").json(&body))
            .await?;
        Ok(())
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{REST_PREFIX}{path}", self.base_url))
            .header(CLIENT_ID_HEADER, self.client_id.as_str())
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, RestError> {
        let response = self.execute(self.request(Method::GET, path)).await?;
        Ok(response.json().await?)
    }

    async fn send_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<T, RestError> {
        let response = self.execute(self.request(method, path).json(body)).await?;
        Ok(response.json().await?)
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response, RestError> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let error_message =
            serde_json::from_str::<ErrorResponse>(&body).map_or(body, |e| e.error_message);
        tracing::debug!(status = %status, error = %error_message, "REST call failed");
        Err(RestError::Api {
            status,
            error_message,
        })
    }
}
