// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Integration tests for the permission-gated REST API.
//!
//! Clients connect over WebSocket first; REST calls are then authorized
//! against the grants of that live connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use companion::client::{CompanionClient, ConnectOptions};
use companion::rest::RestClient;
use companion_proto::handshake::PROTOCOL_VERSION;
use companion_proto::message::ClientId;
use companion_proto::permission::Permission;
use companion_proto::rest::{GameConfig, SongDto, SongQueueEntryDto};
use companion_proto::session::ConnectionState;
use companion_server::backend::InMemoryGameBackend;
use companion_server::events::CompanionEvent;
use companion_server::permissions::PermissionStore;
use companion_server::server::{self, CompanionState, ServerSettings};
use reqwest::StatusCode;

// =============================================================================
// Helpers
// =============================================================================

fn song(id: &str, title: &str) -> SongDto {
    SongDto {
        song_id: id.to_string(),
        artist: "ABBA".to_string(),
        title: title.to_string(),
        duration_millis: 200_000,
    }
}

async fn start() -> (SocketAddr, Arc<CompanionState>) {
    let mut config = GameConfig::new();
    config.insert("volume".to_string(), serde_json::json!(80));
    let backend = InMemoryGameBackend::new()
        .with_songs(vec![song("waterloo", "Waterloo"), song("sos", "SOS")])
        .with_config(config);
    let state = Arc::new(CompanionState::new(
        ServerSettings::default(),
        PermissionStore::in_memory(),
        Arc::new(backend),
    ));
    let (addr, _handle) = server::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start server");
    (addr, state)
}

async fn connect(addr: SocketAddr, id: &str) -> CompanionClient {
    let options = ConnectOptions::new(format!("ws://{addr}/ws"), "Phone", ClientId::new(id));
    CompanionClient::connect(&options).await.unwrap()
}

async fn grant(state: &CompanionState, id: &str, permissions: &[Permission]) {
    state
        .grant_permissions(&ClientId::new(id), permissions.iter().copied())
        .await
        .unwrap();
}

// =============================================================================
// Authorization
// =============================================================================

#[tokio::test]
async fn hello_is_open_to_anyone() {
    let (addr, _state) = start().await;
    let rest = RestClient::new(format!("http://{addr}"), ClientId::new("stranger"));

    let hello = rest.hello().await.unwrap();
    assert_eq!(hello.protocol_version, PROTOCOL_VERSION);
    assert_eq!(hello.http_server_port, addr.port());
}

#[tokio::test]
async fn unconnected_client_is_forbidden() {
    let (addr, _state) = start().await;
    let rest = RestClient::new(format!("http://{addr}"), ClientId::new("stranger"));

    let err = rest.permissions().await.unwrap_err();
    assert!(err.is_forbidden(), "{err}");
    let err = rest.songs().await.unwrap_err();
    assert!(err.is_forbidden(), "{err}");
}

#[tokio::test]
async fn missing_permission_is_forbidden_until_granted() {
    let (addr, state) = start().await;
    let client = connect(addr, "phone").await;
    let rest = client.rest().unwrap();

    assert!(rest.permissions().await.unwrap().is_empty());
    let err = rest.songs().await.unwrap_err();
    assert!(err.is_forbidden());
    let companion::rest::RestError::Api { error_message, .. } = err else {
        panic!("expected an API error");
    };
    assert!(error_message.contains("ReadSongs"), "{error_message}");

    grant(&state, "phone", &[Permission::ReadSongs]).await;

    let songs = rest.songs().await.unwrap();
    assert_eq!(songs.len(), 2);
    assert_eq!(songs[0].song_id, "waterloo");
    assert!(rest.permissions().await.unwrap().contains(Permission::ReadSongs));
}

#[tokio::test]
async fn revocation_takes_effect_immediately() {
    let (addr, state) = start().await;
    let client = connect(addr, "phone").await;
    let rest = client.rest().unwrap();
    grant(&state, "phone", &[Permission::ReadConfig]).await;
    assert!(rest.config().await.is_ok());

    state
        .revoke_permissions(&ClientId::new("phone"), [Permission::ReadConfig])
        .await
        .unwrap();

    assert!(rest.config().await.unwrap_err().is_forbidden());
}

#[tokio::test]
async fn grants_do_not_leak_between_clients() {
    let (addr, state) = start().await;
    let alice = connect(addr, "alice").await;
    let bob = connect(addr, "bob").await;
    grant(&state, "alice", &[Permission::ReadSongQueue]).await;

    assert!(alice.rest().unwrap().song_queue().await.is_ok());
    assert!(bob.rest().unwrap().song_queue().await.unwrap_err().is_forbidden());
}

#[tokio::test]
async fn disconnected_client_loses_access() {
    let (addr, state) = start().await;
    let client = connect(addr, "phone").await;
    let rest = client.rest().unwrap();
    grant(&state, "phone", &[Permission::ReadSongs]).await;
    assert!(rest.songs().await.is_ok());

    let mut watch = client.watch_state();
    client.close().await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while state.registry().contains(&ClientId::new("phone")).await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("server never noticed the disconnect");
    assert_eq!(*watch.borrow_and_update(), ConnectionState::Disconnected);

    assert!(rest.songs().await.unwrap_err().is_forbidden());
}

// =============================================================================
// Routes
// =============================================================================

#[tokio::test]
async fn song_queue_round_trip() {
    let (addr, state) = start().await;
    let client = connect(addr, "phone").await;
    let rest = client.rest().unwrap();
    grant(
        &state,
        "phone",
        &[Permission::ReadSongQueue, Permission::WriteSongQueue],
    )
    .await;

    let entry = SongQueueEntryDto {
        song_id: "sos".to_string(),
        singers: vec!["Agnetha".to_string(), "Frida".to_string()],
    };
    let queue = rest.enqueue_song(&entry).await.unwrap();
    assert_eq!(queue, vec![entry.clone()]);
    assert_eq!(rest.song_queue().await.unwrap(), vec![entry]);

    let unknown = SongQueueEntryDto {
        song_id: "dancing-queen".to_string(),
        singers: Vec::new(),
    };
    let err = rest.enqueue_song(&unknown).await.unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));

    let err = rest.remove_from_queue(5).await.unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));

    assert!(rest.remove_from_queue(0).await.unwrap().is_empty());
}

#[tokio::test]
async fn config_update_merges_settings() {
    let (addr, state) = start().await;
    let client = connect(addr, "phone").await;
    let rest = client.rest().unwrap();
    grant(&state, "phone", &[Permission::ReadConfig]).await;

    let mut patch = GameConfig::new();
    patch.insert("language".to_string(), serde_json::json!("sv"));
    assert!(rest.update_config(&patch).await.unwrap_err().is_forbidden());

    grant(&state, "phone", &[Permission::WriteConfig]).await;
    let config = rest.update_config(&patch).await.unwrap();
    assert_eq!(config["language"], serde_json::json!("sv"));
    assert_eq!(config["volume"], serde_json::json!(80));
    assert_eq!(rest.config().await.unwrap(), config);
}

#[tokio::test]
async fn input_simulation_is_announced_to_the_game() {
    let (addr, state) = start().await;
    let mut events = state.subscribe();
    let client = connect(addr, "remote").await;
    let rest = client.rest().unwrap();
    grant(&state, "remote", &[Permission::WriteInputSimulation]).await;

    rest.simulate_input("Enter").await.unwrap();
    let err = rest.simulate_input("   ").await.unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::BAD_REQUEST));

    let event = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let CompanionEvent::InputSimulated { client_id, key } = events.recv().await.unwrap()
            {
                return (client_id, key);
            }
        }
    })
    .await
    .expect("no InputSimulated event");
    assert_eq!(event, (ClientId::new("remote"), "Enter".to_string()));
}

#[tokio::test]
async fn microphone_data_requires_permission() {
    let (addr, state) = start().await;
    let client = connect(addr, "coach").await;
    let rest = client.rest().unwrap();

    assert!(rest.microphone_data().await.unwrap_err().is_forbidden());
    grant(&state, "coach", &[Permission::ReadMicrophoneData]).await;
    assert!(rest.microphone_data().await.unwrap().is_empty());
}
