//! The game model behind the REST API.
//!
//! [`GameBackend`] is the seam where the hosting game plugs in its song
//! library, song queue and settings. [`InMemoryGameBackend`] is a complete
//! in-process implementation used by the server binary and tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use companion_proto::message::{BeatPitchEvent, ClientId, Timestamp};
use companion_proto::rest::{GameConfig, MicrophoneDataDto, SongDto, SongQueueEntryDto};
use parking_lot::RwLock;

/// Errors from game model operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// No song with this id exists in the library.
    #[error("unknown song: {0}")]
    UnknownSong(String),
    /// The queue has no entry at this index.
    #[error("no song queue entry at index {index} (queue length {len})")]
    QueueIndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Current queue length.
        len: usize,
    },
}

/// Errors from loading a song library file.
#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    /// The file could not be read.
    #[error("failed to read song library {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The file is not a JSON array of songs.
    #[error("song library {path} is invalid: {source}")]
    Json {
        /// File involved.
        path: PathBuf,
        /// Underlying parse error.
        source: serde_json::Error,
    },
}

/// Game-side operations exposed to companion clients.
pub trait GameBackend: Send + Sync {
    /// All songs of the library.
    fn songs(&self) -> Vec<SongDto>;

    /// Looks up one song.
    fn find_song(&self, song_id: &str) -> Option<SongDto>;

    /// Current song queue, next song first.
    fn song_queue(&self) -> Vec<SongQueueEntryDto>;

    /// Appends an entry and returns the new queue.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::UnknownSong`] if the song is not in the library.
    fn enqueue_song(&self, entry: SongQueueEntryDto)
    -> Result<Vec<SongQueueEntryDto>, BackendError>;

    /// Removes the entry at `index` and returns the new queue.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::QueueIndexOutOfRange`] for a bad index.
    fn remove_from_queue(&self, index: usize) -> Result<Vec<SongQueueEntryDto>, BackendError>;

    /// Current settings.
    fn config(&self) -> GameConfig;

    /// Merges `patch` into the settings and returns the result.
    fn update_config(&self, patch: GameConfig) -> GameConfig;

    /// Stores the latest pitch events recorded by a companion.
    fn record_microphone_data(
        &self,
        client_id: &ClientId,
        client_name: &str,
        events: Vec<BeatPitchEvent>,
    );

    /// Latest pitch events of every companion that sent some.
    fn microphone_data(&self) -> Vec<MicrophoneDataDto>;

    /// Drops per-client state when a companion disconnects.
    fn forget_client(&self, client_id: &ClientId);

    /// Game round modifiers offered to companions at connect time.
    fn available_modifiers(&self) -> Vec<String>;
}

/// Loads a song library from a JSON array of [`SongDto`].
///
/// # Errors
///
/// Returns [`LibraryError`] if the file cannot be read or does not parse.
pub fn load_song_library(path: &Path) -> Result<Vec<SongDto>, LibraryError> {
    let contents = std::fs::read_to_string(path).map_err(|source| LibraryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| LibraryError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Thread-safe in-memory game model.
#[derive(Default)]
pub struct InMemoryGameBackend {
    songs: RwLock<Vec<SongDto>>,
    queue: RwLock<Vec<SongQueueEntryDto>>,
    config: RwLock<GameConfig>,
    microphones: RwLock<BTreeMap<ClientId, MicrophoneDataDto>>,
    modifiers: Vec<String>,
}

impl InMemoryGameBackend {
    /// Creates an empty model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the song library.
    #[must_use]
    pub fn with_songs(self, songs: Vec<SongDto>) -> Self {
        *self.songs.write() = songs;
        self
    }

    /// Sets the modifiers announced at connect time.
    #[must_use]
    pub fn with_modifiers(mut self, modifiers: Vec<String>) -> Self {
        self.modifiers = modifiers;
        self
    }

    /// Replaces the settings.
    #[must_use]
    pub fn with_config(self, config: GameConfig) -> Self {
        *self.config.write() = config;
        self
    }
}

impl GameBackend for InMemoryGameBackend {
    fn songs(&self) -> Vec<SongDto> {
        self.songs.read().clone()
    }

    fn find_song(&self, song_id: &str) -> Option<SongDto> {
        self.songs
            .read()
            .iter()
            .find(|s| s.song_id == song_id)
            .cloned()
    }

    fn song_queue(&self) -> Vec<SongQueueEntryDto> {
        self.queue.read().clone()
    }

    fn enqueue_song(
        &self,
        entry: SongQueueEntryDto,
    ) -> Result<Vec<SongQueueEntryDto>, BackendError> {
        if self.find_song(&entry.song_id).is_none() {
            return Err(BackendError::UnknownSong(entry.song_id));
        }
        let mut queue = self.queue.write();
        queue.push(entry);
        Ok(queue.clone())
    }

    fn remove_from_queue(&self, index: usize) -> Result<Vec<SongQueueEntryDto>, BackendError> {
        let mut queue = self.queue.write();
        if index >= queue.len() {
            return Err(BackendError::QueueIndexOutOfRange {
                index,
                len: queue.len(),
            });
        }
        queue.remove(index);
        Ok(queue.clone())
    }

    fn config(&self) -> GameConfig {
        self.config.read().clone()
    }

    fn update_config(&self, patch: GameConfig) -> GameConfig {
        let mut config = self.config.write();
        config.extend(patch);
        config.clone()
    }

    fn record_microphone_data(
        &self,
        client_id: &ClientId,
        client_name: &str,
        events: Vec<BeatPitchEvent>,
    ) {
        self.microphones.write().insert(
            client_id.clone(),
            MicrophoneDataDto {
                client_id: client_id.clone(),
                client_name: client_name.to_string(),
                events,
                timestamp: Timestamp::now(),
            },
        );
    }

    fn microphone_data(&self) -> Vec<MicrophoneDataDto> {
        self.microphones.read().values().cloned().collect()
    }

    fn forget_client(&self, client_id: &ClientId) {
        self.microphones.write().remove(client_id);
    }

    fn available_modifiers(&self) -> Vec<String> {
        self.modifiers.clone()
    }
}
