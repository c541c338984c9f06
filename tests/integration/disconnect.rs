// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Integration tests for the end of a connection.
//!
//! Whichever side ends it, the client must land in `Disconnected` and the
//! game must drop the registration. Nothing reconnects on its own.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use companion::client::{ClientError, CompanionClient, ConnectOptions};
use companion_proto::message::{BeatPitchEvent, ClientId, CompanionMessage};
use companion_proto::session::ConnectionState;
use companion_server::backend::InMemoryGameBackend;
use companion_server::events::CompanionEvent;
use companion_server::permissions::PermissionStore;
use companion_server::server::{self, CompanionState, ServerSettings};
use tokio::sync::{broadcast, watch};

// =============================================================================
// Helpers
// =============================================================================

async fn start(settings: ServerSettings) -> (SocketAddr, Arc<CompanionState>) {
    let state = Arc::new(CompanionState::new(
        settings,
        PermissionStore::in_memory(),
        Arc::new(InMemoryGameBackend::new()),
    ));
    let (addr, _handle) = server::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start server");
    (addr, state)
}

fn options(addr: SocketAddr, id: &str) -> ConnectOptions {
    ConnectOptions::new(format!("ws://{addr}/ws"), "Phone", ClientId::new(id))
}

async fn wait_disconnected(watch: &mut watch::Receiver<ConnectionState>) {
    tokio::time::timeout(
        Duration::from_secs(5),
        watch.wait_for(|s| *s == ConnectionState::Disconnected),
    )
    .await
    .expect("client never saw the disconnect")
    .unwrap();
}

async fn wait_for_disconnect_event(
    events: &mut broadcast::Receiver<CompanionEvent>,
) -> (ClientId, String) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let CompanionEvent::ClientDisconnected { client_id, reason } =
                events.recv().await.unwrap()
            {
                return (client_id, reason);
            }
        }
    })
    .await
    .expect("no ClientDisconnected event")
}

// =============================================================================
// Client-initiated
// =============================================================================

#[tokio::test]
async fn client_close_is_reported_to_the_game() {
    let (addr, state) = start(ServerSettings::default()).await;
    let mut events = state.subscribe();
    let client = CompanionClient::connect(&options(addr, "phone")).await.unwrap();

    client.close().await;

    assert_eq!(client.state(), ConnectionState::Disconnected);
    let (client_id, reason) = wait_for_disconnect_event(&mut events).await;
    assert_eq!(client_id.as_str(), "phone");
    assert_eq!(reason, "closed by client");
    assert!(state.registry().is_empty().await);
}

#[tokio::test]
async fn send_after_close_fails_without_reconnecting() {
    let (addr, state) = start(ServerSettings::default()).await;
    let client = CompanionClient::connect(&options(addr, "phone")).await.unwrap();
    client.close().await;

    let result = client.send(CompanionMessage::StillAliveRequest).await;
    assert!(matches!(result, Err(ClientError::ConnectionClosed)));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(!state.registry().contains(&ClientId::new("phone")).await);
}

#[tokio::test]
async fn microphone_data_is_dropped_with_the_client() {
    let (addr, state) = start(ServerSettings::default()).await;
    let mut events = state.subscribe();
    let client = CompanionClient::connect(&options(addr, "mic")).await.unwrap();

    client
        .send(CompanionMessage::BeatPitchEvents {
            events: vec![BeatPitchEvent {
                beat: 1,
                midi_note: 64,
                frequency: 329.6,
            }],
        })
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if matches!(
                events.recv().await.unwrap(),
                CompanionEvent::MessageReceived { .. }
            ) {
                return;
            }
        }
    })
    .await
    .expect("pitch data never arrived");
    assert_eq!(state.backend().microphone_data().len(), 1);

    client.close().await;
    wait_for_disconnect_event(&mut events).await;
    assert!(state.backend().microphone_data().is_empty());
}

// =============================================================================
// Game-initiated
// =============================================================================

#[tokio::test]
async fn game_disconnect_reaches_the_client() {
    let (addr, state) = start(ServerSettings::default()).await;
    let mut events = state.subscribe();
    let client = CompanionClient::connect(&options(addr, "phone")).await.unwrap();
    let mut watch = client.watch_state();

    assert!(state.disconnect(&ClientId::new("phone")).await);

    wait_disconnected(&mut watch).await;
    let err = tokio::time::timeout(Duration::from_secs(5), client.recv())
        .await
        .expect("recv hung after disconnect")
        .unwrap_err();
    assert!(matches!(err, ClientError::ConnectionClosed));

    let (client_id, reason) = wait_for_disconnect_event(&mut events).await;
    assert_eq!(client_id.as_str(), "phone");
    assert!(reason.starts_with("closed by"), "{reason}");
    assert!(!state.disconnect(&ClientId::new("phone")).await);
}

#[tokio::test]
async fn idle_client_is_timed_out_and_stays_disconnected() {
    let settings = ServerSettings {
        idle_timeout: Duration::from_millis(300),
        ..ServerSettings::default()
    };
    let (addr, state) = start(settings).await;
    let mut events = state.subscribe();

    let mut opts = options(addr, "sleepy");
    opts.still_alive_interval = None;
    let client = CompanionClient::connect(&opts).await.unwrap();
    let mut watch = client.watch_state();

    let (_, reason) = wait_for_disconnect_event(&mut events).await;
    assert_eq!(reason, "idle timeout");
    wait_disconnected(&mut watch).await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(state.registry().is_empty().await);
}

#[tokio::test]
async fn reconnect_with_same_id_replaces_the_old_connection() {
    let (addr, state) = start(ServerSettings::default()).await;
    let mut events = state.subscribe();

    let old = CompanionClient::connect(&options(addr, "phone")).await.unwrap();
    let mut old_watch = old.watch_state();
    let new = CompanionClient::connect(&options(addr, "phone")).await.unwrap();

    wait_disconnected(&mut old_watch).await;
    assert_eq!(new.state(), ConnectionState::Connected);
    assert_eq!(state.registry().len().await, 1);

    state
        .send_to_client(&ClientId::new("phone"), CompanionMessage::StartRecording)
        .await
        .unwrap();
    let pushed = tokio::time::timeout(Duration::from_secs(5), new.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pushed, CompanionMessage::StartRecording);

    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, CompanionEvent::ClientDisconnected { .. }),
            "replacement must not report a disconnect: {event:?}"
        );
    }
}
