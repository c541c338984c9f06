//! Companion server: hosts the `/ws` message endpoint and the REST API
//! that karaoke companion apps talk to.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:34567
//! cargo run --bin companion-server
//!
//! # Run on custom address with a song library
//! cargo run --bin companion-server -- --bind 127.0.0.1:8080 --songs songs.json
//!
//! # Or via environment variable
//! COMPANION_SERVER_ADDR=127.0.0.1:8080 cargo run --bin companion-server
//! ```

use std::sync::Arc;

use clap::Parser;
use companion_server::backend::{InMemoryGameBackend, load_song_library};
use companion_server::config::{ServerCliArgs, ServerConfig};
use companion_server::events::CompanionEvent;
use companion_server::permissions::PermissionStore;
use companion_server::server::{self, CompanionState};
use tokio::sync::broadcast;

#[tokio::main]
async fn main() {
    let cli = ServerCliArgs::parse();

    let config = match ServerConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, "starting companion server");

    let permissions = match &config.permissions_path {
        Some(path) => match PermissionStore::open(path) {
            Ok(store) => store,
            Err(e) => {
                tracing::error!(error = %e, "failed to open permission store");
                std::process::exit(1);
            }
        },
        None => PermissionStore::in_memory(),
    };

    let mut backend =
        InMemoryGameBackend::new().with_modifiers(config.available_modifiers.clone());
    if let Some(path) = &config.songs_path {
        match load_song_library(path) {
            Ok(songs) => {
                tracing::info!(path = %path.display(), count = songs.len(), "loaded song library");
                backend = backend.with_songs(songs);
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to load song library");
                std::process::exit(1);
            }
        }
    }

    let state = Arc::new(CompanionState::new(
        config.settings(),
        permissions,
        Arc::new(backend),
    ));
    tokio::spawn(log_events(state.subscribe()));

    match server::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "companion server listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "companion server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start companion server");
            std::process::exit(1);
        }
    }
}

/// Logs companion events until the channel closes.
async fn log_events(mut events: broadcast::Receiver<CompanionEvent>) {
    loop {
        match events.recv().await {
            Ok(CompanionEvent::InputSimulated { client_id, key }) => {
                tracing::info!(client_id = %client_id, key = %key, "input simulation requested");
            }
            Ok(CompanionEvent::MessageReceived { client_id, message }) => {
                tracing::debug!(client_id = %client_id, message_type = %message.message_type(), "companion message");
            }
            Ok(event) => tracing::debug!(event = ?event, "companion event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event logger lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
