//! Configuration system for the companion server.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/companion-server/config.toml`)
//! 4. Compiled defaults

use std::path::{Path, PathBuf};
use std::time::Duration;

use companion_proto::message::MAX_MESSAGE_SIZE;
use companion_proto::permission::{Permission, PermissionSet};

use crate::server::ServerSettings;

/// Directory name under the platform config dir.
const APP_DIR: &str = "companion-server";

/// Errors that can occur when loading server configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerConfigFile {
    server: ServerSection,
    permissions: PermissionsSection,
    game: GameSection,
}

/// `[server]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerSection {
    bind_addr: Option<String>,
    max_message_size: Option<usize>,
    max_clients: Option<usize>,
    idle_timeout_secs: Option<u64>,
    handshake_timeout_secs: Option<u64>,
}

/// `[permissions]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct PermissionsSection {
    store_path: Option<PathBuf>,
    default_grants: Option<Vec<Permission>>,
}

/// `[game]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct GameSection {
    available_modifiers: Option<Vec<String>>,
    songs_path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the companion server.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Companion app server for the karaoke game")]
pub struct ServerCliArgs {
    /// Address to bind the server to.
    #[arg(short, long, env = "COMPANION_SERVER_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/companion-server/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Maximum accepted message size in bytes.
    #[arg(long)]
    pub max_message_size: Option<usize>,

    /// Maximum number of connected companion clients.
    #[arg(long)]
    pub max_clients: Option<usize>,

    /// Seconds without traffic before a client is dropped.
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,

    /// Path of the persisted permission grants.
    #[arg(long, env = "COMPANION_PERMISSIONS_PATH")]
    pub permissions_path: Option<PathBuf>,

    /// JSON song library to serve.
    #[arg(long)]
    pub songs: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "COMPANION_SERVER_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to (e.g., `0.0.0.0:34567`).
    pub bind_addr: String,
    /// Largest accepted text frame in bytes.
    pub max_message_size: usize,
    /// Maximum number of connected clients.
    pub max_clients: usize,
    /// Idle timeout of a connected client.
    pub idle_timeout: Duration,
    /// Time allowed to complete the handshake.
    pub handshake_timeout: Duration,
    /// Where grants are persisted. `None` keeps them in memory.
    pub permissions_path: Option<PathBuf>,
    /// Grants for clients seen for the first time.
    pub default_grants: PermissionSet,
    /// Modifiers offered at connect time.
    pub available_modifiers: Vec<String>,
    /// Song library file.
    pub songs_path: Option<PathBuf>,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:34567".to_string(),
            max_message_size: MAX_MESSAGE_SIZE,
            max_clients: 16,
            idle_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(5),
            permissions_path: dirs::config_dir()
                .map(|d| d.join(APP_DIR).join("permissions.json")),
            default_grants: PermissionSet::new(),
            available_modifiers: Vec::new(),
            songs_path: None,
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and a missing
    /// file is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &ServerCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, file))
    }

    /// Priority: CLI > file > default.
    fn resolve(cli: &ServerCliArgs, file: ServerConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            bind_addr: cli
                .bind
                .clone()
                .or(file.server.bind_addr)
                .unwrap_or(defaults.bind_addr),
            max_message_size: cli
                .max_message_size
                .or(file.server.max_message_size)
                .unwrap_or(defaults.max_message_size),
            max_clients: cli
                .max_clients
                .or(file.server.max_clients)
                .unwrap_or(defaults.max_clients),
            idle_timeout: cli
                .idle_timeout_secs
                .or(file.server.idle_timeout_secs)
                .map_or(defaults.idle_timeout, Duration::from_secs),
            handshake_timeout: file
                .server
                .handshake_timeout_secs
                .map_or(defaults.handshake_timeout, Duration::from_secs),
            permissions_path: cli
                .permissions_path
                .clone()
                .or(file.permissions.store_path)
                .or(defaults.permissions_path),
            default_grants: file
                .permissions
                .default_grants
                .map_or(defaults.default_grants, |grants| {
                    grants.into_iter().collect()
                }),
            available_modifiers: file
                .game
                .available_modifiers
                .unwrap_or(defaults.available_modifiers),
            songs_path: cli.songs.clone().or(file.game.songs_path),
            log_level: cli.log_level.clone(),
        }
    }

    /// Endpoint tunables derived from this configuration.
    #[must_use]
    pub fn settings(&self) -> ServerSettings {
        ServerSettings {
            max_message_size: self.max_message_size,
            max_clients: self.max_clients,
            idle_timeout: self.idle_timeout,
            handshake_timeout: self.handshake_timeout,
            default_grants: self.default_grants.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn load_config_file(explicit_path: Option<&Path>) -> Result<ServerConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ServerConfigFile::default());
        };
        config_dir.join(APP_DIR).join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
