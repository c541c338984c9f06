//! Property-based codec tests.
//!
//! Uses proptest to verify:
//! 1. Arbitrary text never panics `decode`; failures are always soft.
//! 2. Any valid `Envelope` survives encode -> decode.
//! 3. Any object with an unrecognised tag is reported as an unknown type.

use companion_proto::codec::{self, CodecError};
use companion_proto::message::*;
use companion_proto::permission::Permission;
use proptest::prelude::*;

fn arb_client_id() -> impl Strategy<Value = ClientId> {
    "[a-zA-Z0-9-]{1,40}".prop_map(ClientId::new)
}

fn arb_permission() -> impl Strategy<Value = Permission> {
    prop::sample::select(Permission::ALL.to_vec())
}

fn arb_beat_pitch_event() -> impl Strategy<Value = BeatPitchEvent> {
    (any::<i32>(), -1i32..128, 0u16..4000).prop_map(|(beat, midi_note, hz)| BeatPitchEvent {
        beat,
        midi_note,
        frequency: f32::from(hz),
    })
}

fn arb_message() -> impl Strategy<Value = CompanionMessage> {
    prop_oneof![
        Just(CompanionMessage::StillAliveRequest),
        Just(CompanionMessage::StillAliveResponse),
        Just(CompanionMessage::StartRecording),
        Just(CompanionMessage::StopRecording),
        (any::<u32>(), ".{0,64}", arb_client_id()).prop_map(
            |(protocol_version, client_name, client_id)| CompanionMessage::ConnectRequest {
                protocol_version,
                client_name,
                client_id,
            }
        ),
        (
            arb_client_id(),
            ".{0,64}",
            proptest::option::of(".{1,64}"),
            any::<u16>(),
            prop::collection::vec(arb_permission(), 0..7),
            prop::collection::vec("[A-Za-z]{1,16}", 0..4),
        )
            .prop_map(
                |(
                    client_id,
                    client_name,
                    error_message,
                    http_server_port,
                    permissions,
                    available_modifiers,
                )| CompanionMessage::ConnectResponse {
                    client_id,
                    client_name,
                    error_message,
                    http_server_port,
                    permissions,
                    available_modifiers,
                }
            ),
        prop::collection::vec(arb_permission(), 0..7)
            .prop_map(|permissions| CompanionMessage::Permissions { permissions }),
        (".{0,32}", any::<u64>()).prop_map(|(song_id, position_in_song_millis)| {
            CompanionMessage::PositionInSong {
                song_id,
                position_in_song_millis,
            }
        }),
        prop::collection::vec(arb_beat_pitch_event(), 0..32)
            .prop_map(|events| CompanionMessage::BeatPitchEvents { events }),
        (
            ".{0,32}",
            "#[0-9a-f]{6}",
            any::<i32>(),
            0i32..=100,
            any::<i32>(),
            prop::sample::select(vec![16_000_u32, 22_050, 44_100, 48_000]),
        )
            .prop_map(
                |(name, color, amplification, noise_suppression, delay_in_millis, sample_rate_hz)| {
                    CompanionMessage::MicProfile {
                        name,
                        color,
                        amplification,
                        noise_suppression,
                        delay_in_millis,
                        sample_rate_hz,
                    }
                }
            ),
    ]
}

proptest! {
    #[test]
    fn random_text_never_panics(text in ".{0,256}") {
        if let Err(e) = codec::decode(&text) {
            prop_assert!(e.is_soft());
        }
    }

    #[test]
    fn valid_envelopes_survive_encoding(millis in any::<u64>(), message in arb_message()) {
        let original = Envelope::at(Timestamp::from_millis(millis), message);
        let text = codec::encode(&original).unwrap();
        let decoded = codec::decode(&text).unwrap();
        prop_assert_eq!(decoded, original);
    }

    #[test]
    fn unrecognised_tags_are_unknown_types(tag in "[A-Z][a-z]{3,12}Zz") {
        let text = format!(r#"{{"timestamp":1,"messageType":"{tag}"}}"#);
        match codec::decode(&text) {
            Err(CodecError::UnknownMessageType(t)) => prop_assert_eq!(t, tag),
            other => prop_assert!(false, "expected UnknownMessageType, got {:?}", other),
        }
    }
}
