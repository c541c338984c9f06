//! Companion client: connects to the karaoke game, prints what the game
//! pushes and lists the song library when permitted.
//!
//! ```bash
//! cargo run --bin companion -- --server-url ws://192.168.0.2:34567/ws \
//!     --client-name "Kitchen Phone"
//!
//! # Or via environment variables
//! COMPANION_SERVER_URL=ws://192.168.0.2:34567/ws cargo run --bin companion
//! ```

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use companion::client::{ClientError, CompanionClient};
use companion::config::{self, CliArgs, ClientConfig};
use companion_proto::message::{ClientId, CompanionMessage};
use companion_proto::permission::Permission;
use tracing_appender::non_blocking::WorkerGuard;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    let client_id = resolve_client_id(config.client_id.as_deref());
    let Some(options) = config.to_connect_options(client_id) else {
        eprintln!("No server URL configured. Pass --server-url or set COMPANION_SERVER_URL.");
        return ExitCode::FAILURE;
    };

    let client = match CompanionClient::connect(&options).await {
        Ok(client) => client,
        Err(ClientError::Rejected(reason)) => {
            eprintln!("The game rejected the connection: {reason}");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            eprintln!("Could not connect to {}: {e}", options.server_url);
            return ExitCode::FAILURE;
        }
    };

    println!(
        "Connected as {} (REST port {}), permissions: {:?}",
        client.client_id(),
        client.http_server_port(),
        client.permissions().to_vec()
    );

    if client.permissions().contains(Permission::ReadSongs) {
        list_songs(&client).await;
    }

    loop {
        match client.recv().await {
            Ok(CompanionMessage::Permissions { permissions }) => {
                println!("Permissions changed: {permissions:?}");
            }
            Ok(message) => println!("{message:?}"),
            Err(e) => {
                println!("Disconnected: {e}");
                break;
            }
        }
    }
    ExitCode::SUCCESS
}

/// Uses the configured id, else the remembered one, else a fresh one.
fn resolve_client_id(configured: Option<&str>) -> ClientId {
    if let Some(id) = configured {
        return ClientId::new(id);
    }
    match config::default_client_id_path().map(|p| config::load_or_create_client_id(&p)) {
        Some(Ok(id)) => id,
        Some(Err(e)) => {
            tracing::warn!(error = %e, "could not remember client id; using a temporary one");
            ClientId::generate()
        }
        None => ClientId::generate(),
    }
}

async fn list_songs(client: &CompanionClient) {
    let rest = match client.rest() {
        Ok(rest) => rest,
        Err(e) => {
            tracing::warn!(error = %e, "REST client unavailable");
            return;
        }
    };
    match rest.songs().await {
        Ok(songs) => {
            println!("{} songs:", songs.len());
            for song in songs {
                println!("  {} - {} [{}]", song.artist, song.title, song.song_id);
            }
        }
        Err(e) => tracing::warn!(error = %e, "failed to list songs"),
    }
}

/// Initialize logging.
///
/// With a log file, logs go through a non-blocking file writer whose guard
/// must be held until exit. Otherwise they go to stderr.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let Some(log_path) = file_path else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(env_filter)
            .init();
        return None;
    };

    let log_dir = log_path.parent().filter(|d| !d.as_os_str().is_empty());
    let log_dir = log_dir.unwrap_or_else(|| Path::new("."));
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}
