//! Configuration system for the companion client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/companion/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use companion_proto::message::ClientId;

use crate::client::ConnectOptions;

/// Directory name under the platform config dir.
const APP_DIR: &str = "companion";

/// Errors that can occur when loading configuration.
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
struct ConfigFile {
    connection: ConnectionFileConfig,
}

/// `[connection]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConnectionFileConfig {
    server_url: Option<String>,
    client_name: Option<String>,
    client_id: Option<String>,
    connect_timeout_secs: Option<u64>,
    handshake_timeout_secs: Option<u64>,
    still_alive_interval_secs: Option<u64>,
    channel_capacity: Option<usize>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Karaoke companion app client")]
pub struct CliArgs {
    /// WebSocket URL of the game, e.g. `ws://192.168.0.2:34567/ws`.
    #[arg(long, env = "COMPANION_SERVER_URL")]
    pub server_url: Option<String>,

    /// Name shown in the game.
    #[arg(long, env = "COMPANION_CLIENT_NAME")]
    pub client_name: Option<String>,

    /// Stable client identity. Generated and remembered when not given.
    #[arg(long, env = "COMPANION_CLIENT_ID")]
    pub client_id: Option<String>,

    /// Path to config file (default: `~/.config/companion/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "COMPANION_LOG")]
    pub log_level: String,

    /// Write logs to this file instead of stderr.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the game's message endpoint.
    pub server_url: Option<String>,
    /// Name shown in the game.
    pub client_name: String,
    /// Configured identity, if any.
    pub client_id: Option<String>,
    /// Timeout for opening the WebSocket.
    pub connect_timeout: Duration,
    /// Timeout for the `ConnectResponse`.
    pub handshake_timeout: Duration,
    /// Keep-alive period; `None` disables keep-alives.
    pub still_alive_interval: Option<Duration>,
    /// Inbound message channel capacity.
    pub channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            client_name: "Companion".to_string(),
            client_id: None,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            still_alive_interval: Some(Duration::from_secs(5)),
            channel_capacity: 256,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, file))
    }

    /// Priority: CLI > file > default. A keep-alive interval of zero
    /// disables keep-alives.
    fn resolve(cli: &CliArgs, file: ConfigFile) -> Self {
        let defaults = Self::default();
        let conn = file.connection;

        Self {
            server_url: cli.server_url.clone().or(conn.server_url),
            client_name: cli
                .client_name
                .clone()
                .or(conn.client_name)
                .unwrap_or(defaults.client_name),
            client_id: cli.client_id.clone().or(conn.client_id),
            connect_timeout: conn
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            handshake_timeout: conn
                .handshake_timeout_secs
                .map_or(defaults.handshake_timeout, Duration::from_secs),
            still_alive_interval: conn.still_alive_interval_secs.map_or(
                defaults.still_alive_interval,
                |secs| (secs > 0).then(|| Duration::from_secs(secs)),
            ),
            channel_capacity: conn
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
        }
    }

    /// Builds [`ConnectOptions`], or `None` without a server URL.
    #[must_use]
    pub fn to_connect_options(&self, client_id: ClientId) -> Option<ConnectOptions> {
        let server_url = self.server_url.clone()?;
        Some(ConnectOptions {
            server_url,
            client_name: self.client_name.clone(),
            client_id,
            connect_timeout: self.connect_timeout,
            handshake_timeout: self.handshake_timeout,
            still_alive_interval: self.still_alive_interval,
            channel_capacity: self.channel_capacity,
        })
    }
}

/// Default location of the remembered client id.
#[must_use]
pub fn default_client_id_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_DIR).join("client-id"))
}

/// Reads the client id stored at `path`, or generates one and stores it.
///
/// The game keys permission grants by client id, so it must survive
/// restarts.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be read or written.
pub fn load_or_create_client_id(path: &Path) -> std::io::Result<ClientId> {
    match std::fs::read_to_string(path) {
        Ok(contents) if !contents.trim().is_empty() => return Ok(ClientId::new(contents.trim())),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    let id = ClientId::generate();
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, id.as_str())?;
    tracing::info!(client_id = %id, path = %path.display(), "generated new client id");
    Ok(id)
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn load_config_file(explicit_path: Option<&Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join(APP_DIR).join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
