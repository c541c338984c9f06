// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Integration tests for message flow after the handshake.
//!
//! Covers client pushes reaching the game, game pushes reaching clients,
//! keep-alives, and the soft handling of malformed or unknown messages.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use companion::client::{CompanionClient, ConnectOptions};
use companion_proto::codec;
use companion_proto::handshake::PROTOCOL_VERSION;
use companion_proto::message::{BeatPitchEvent, ClientId, CompanionMessage, Envelope};
use companion_proto::permission::Permission;
use companion_proto::session::ConnectionState;
use companion_server::backend::InMemoryGameBackend;
use companion_server::events::CompanionEvent;
use companion_server::permissions::PermissionStore;
use companion_server::server::{self, CompanionState, ServerSettings};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;

// =============================================================================
// Helpers
// =============================================================================

async fn start(state: CompanionState) -> (SocketAddr, Arc<CompanionState>) {
    let state = Arc::new(state);
    let (addr, _handle) = server::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start server");
    (addr, state)
}

fn options(addr: SocketAddr, id: &str) -> ConnectOptions {
    ConnectOptions::new(format!("ws://{addr}/ws"), "Phone", ClientId::new(id))
}

async fn recv(client: &CompanionClient) -> CompanionMessage {
    tokio::time::timeout(Duration::from_secs(5), client.recv())
        .await
        .expect("timed out waiting for message")
        .expect("connection closed")
}

async fn wait_for_event(
    events: &mut broadcast::Receiver<CompanionEvent>,
    matches: impl Fn(&CompanionEvent) -> bool,
) -> CompanionEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

// =============================================================================
// Client to game
// =============================================================================

#[tokio::test]
async fn beat_pitch_events_reach_the_game() {
    let (addr, state) = start(CompanionState::default()).await;
    let mut events = state.subscribe();
    let client = CompanionClient::connect(&options(addr, "mic-1")).await.unwrap();

    let message = CompanionMessage::BeatPitchEvents {
        events: vec![
            BeatPitchEvent {
                midi_note: 60,
                beat: 12,
                frequency: 261.6,
            },
            BeatPitchEvent {
                midi_note: 62,
                beat: 13,
                frequency: 293.7,
            },
        ],
    };
    client.send(message.clone()).await.unwrap();

    let event = wait_for_event(&mut events, |e| {
        matches!(e, CompanionEvent::MessageReceived { .. })
    })
    .await;
    assert_eq!(
        event,
        CompanionEvent::MessageReceived {
            client_id: ClientId::new("mic-1"),
            message,
        }
    );

    let data = state.backend().microphone_data();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].client_id.as_str(), "mic-1");
    assert_eq!(data[0].client_name, "Phone");
    assert_eq!(data[0].events.len(), 2);
}

#[tokio::test]
async fn keep_alive_holds_an_idle_connection_open() {
    let settings = ServerSettings {
        idle_timeout: Duration::from_millis(400),
        ..ServerSettings::default()
    };
    let state = CompanionState::new(
        settings,
        PermissionStore::in_memory(),
        Arc::new(InMemoryGameBackend::new()),
    );
    let (addr, state) = start(state).await;

    let mut opts = options(addr, "phone");
    opts.still_alive_interval = Some(Duration::from_millis(100));
    let client = CompanionClient::connect(&opts).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1200)).await;

    assert_eq!(client.state(), ConnectionState::Connected);
    assert!(state.registry().contains(&ClientId::new("phone")).await);
}

#[tokio::test]
async fn malformed_and_unknown_messages_do_not_end_the_connection() {
    let (addr, state) = start(CompanionState::default()).await;
    let mut events = state.subscribe();
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();

    let request = CompanionMessage::ConnectRequest {
        protocol_version: PROTOCOL_VERSION,
        client_name: "Raw".to_string(),
        client_id: ClientId::new("raw"),
    };
    ws.send(Message::text(codec::encode(&Envelope::new(request)).unwrap()))
        .await
        .unwrap();

    ws.send(Message::text("this is not json")).await.unwrap();
    ws.send(Message::text(r#"{"messageType":"Teleport","timestamp":1}"#))
        .await
        .unwrap();
    ws.send(Message::text(r#"{"timestamp":1}"#)).await.unwrap();
    ws.send(Message::binary(vec![1_u8, 2, 3])).await.unwrap();
    let keep_alive = codec::encode(&Envelope::new(CompanionMessage::StillAliveRequest)).unwrap();
    ws.send(Message::text(keep_alive)).await.unwrap();

    let mut saw_still_alive = false;
    while !saw_still_alive {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = frame {
            saw_still_alive = matches!(
                codec::decode(text.as_str()).unwrap().message,
                CompanionMessage::StillAliveResponse
            );
        }
    }

    assert!(state.registry().contains(&ClientId::new("raw")).await);
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, CompanionEvent::ClientDisconnected { .. }),
            "unexpected disconnect: {event:?}"
        );
    }
}

#[tokio::test]
async fn oversized_frame_is_dropped_and_connection_stays_open() {
    let settings = ServerSettings {
        max_message_size: 128,
        ..ServerSettings::default()
    };
    let state = CompanionState::new(
        settings,
        PermissionStore::in_memory(),
        Arc::new(InMemoryGameBackend::new()),
    );
    let (addr, state) = start(state).await;
    let mut events = state.subscribe();
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();

    let request = CompanionMessage::ConnectRequest {
        protocol_version: PROTOCOL_VERSION,
        client_name: "Raw".to_string(),
        client_id: ClientId::new("raw"),
    };
    ws.send(Message::text(codec::encode(&Envelope::new(request)).unwrap()))
        .await
        .unwrap();

    let oversized = CompanionMessage::BeatPitchEvents {
        events: (0..20)
            .map(|beat| BeatPitchEvent {
                beat,
                midi_note: 60,
                frequency: 261.6,
            })
            .collect(),
    };
    let text = codec::encode(&Envelope::new(oversized)).unwrap();
    assert!(text.len() > 128);
    ws.send(Message::text(text)).await.unwrap();
    let keep_alive = codec::encode(&Envelope::new(CompanionMessage::StillAliveRequest)).unwrap();
    ws.send(Message::text(keep_alive)).await.unwrap();

    let mut saw_still_alive = false;
    while !saw_still_alive {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = frame {
            saw_still_alive = matches!(
                codec::decode(text.as_str()).unwrap().message,
                CompanionMessage::StillAliveResponse
            );
        }
    }

    assert!(state.registry().contains(&ClientId::new("raw")).await);
    assert!(state.backend().microphone_data().is_empty());
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(
                event,
                CompanionEvent::MessageReceived { .. } | CompanionEvent::ClientDisconnected { .. }
            ),
            "unexpected event: {event:?}"
        );
    }
}

#[tokio::test]
async fn second_connect_request_is_ignored() {
    let (addr, state) = start(CompanionState::default()).await;
    let client = CompanionClient::connect(&options(addr, "phone")).await.unwrap();

    let again = CompanionMessage::ConnectRequest {
        protocol_version: PROTOCOL_VERSION,
        client_name: "Imposter".to_string(),
        client_id: ClientId::new("phone"),
    };
    client.send(again).await.unwrap();
    client.send(CompanionMessage::StillAliveRequest).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let summary = state.registry().get(&ClientId::new("phone")).await.unwrap();
    assert_eq!(summary.client_name, "Phone");
    assert_eq!(client.state(), ConnectionState::Connected);
}

// =============================================================================
// Game to client
// =============================================================================

#[tokio::test]
async fn game_push_reaches_one_client() {
    let (addr, state) = start(CompanionState::default()).await;
    let client = CompanionClient::connect(&options(addr, "phone")).await.unwrap();

    let push = CompanionMessage::PositionInSong {
        song_id: "abc".to_string(),
        position_in_song_millis: 42_000,
    };
    state
        .send_to_client(&ClientId::new("phone"), push.clone())
        .await
        .unwrap();

    assert_eq!(recv(&client).await, push);
}

#[tokio::test]
async fn push_to_unknown_client_fails() {
    let (_addr, state) = start(CompanionState::default()).await;
    let result = state
        .send_to_client(&ClientId::new("ghost"), CompanionMessage::StopRecording)
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn broadcast_reaches_every_client() {
    let (addr, state) = start(CompanionState::default()).await;
    let a = CompanionClient::connect(&options(addr, "a")).await.unwrap();
    let b = CompanionClient::connect(&options(addr, "b")).await.unwrap();

    let delivered = state.broadcast(CompanionMessage::StartRecording).await;

    assert_eq!(delivered, 2);
    assert_eq!(recv(&a).await, CompanionMessage::StartRecording);
    assert_eq!(recv(&b).await, CompanionMessage::StartRecording);
}

#[tokio::test]
async fn granting_permissions_pushes_them_to_the_client() {
    let (addr, state) = start(CompanionState::default()).await;
    let mut events = state.subscribe();
    let client = CompanionClient::connect(&options(addr, "phone")).await.unwrap();
    assert!(client.permissions().is_empty());

    state
        .grant_permissions(
            &ClientId::new("phone"),
            [Permission::ReadSongs, Permission::WriteSongQueue],
        )
        .await
        .unwrap();

    let CompanionMessage::Permissions { permissions } = recv(&client).await else {
        panic!("expected a Permissions push");
    };
    assert_eq!(permissions, vec![Permission::ReadSongs, Permission::WriteSongQueue]);
    assert!(client.permissions().contains(Permission::ReadSongs));
    assert!(client.permissions().contains(Permission::WriteSongQueue));

    wait_for_event(&mut events, |e| {
        matches!(e, CompanionEvent::PermissionsChanged { .. })
    })
    .await;

    state
        .revoke_permissions(&ClientId::new("phone"), [Permission::ReadSongs])
        .await
        .unwrap();
    let CompanionMessage::Permissions { permissions } = recv(&client).await else {
        panic!("expected a Permissions push");
    };
    assert_eq!(permissions, vec![Permission::WriteSongQueue]);
    assert!(!client.permissions().contains(Permission::ReadSongs));
}
