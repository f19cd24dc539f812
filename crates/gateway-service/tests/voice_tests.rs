//! Voice, negotiation, and media routing tests.
//!
//! Uses paused time wherever cooldowns or negotiation deadlines are involved.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use bytes::Bytes;
use gateway_service::protocol::ServerFrame;
use gateway_service::voice::NegotiationPhase;
use gateway_test_utils::{TestClient, TestGateway, TestUser};
use media_protocol::codec::{decode_frame, encode_frame};
use media_protocol::frame::{FrameKind, MediaFrame};
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

async fn join_voice(client: &mut TestClient, user: &TestUser) {
    client.send_op("VOICE_JOIN", None);
    client
        .recv_until(|f| matches!(f, ServerFrame::VoiceStateUpdate(v) if v.user_id == user.id && v.in_voice))
        .await;
}

fn media(kind: FrameKind, sequence: u32, payload: &'static [u8]) -> Bytes {
    // Publisher field is overwritten by the gateway
    let frame = MediaFrame::new(kind, Uuid::nil(), sequence, Bytes::from_static(payload));
    encode_frame(&frame).unwrap()
}

#[tokio::test]
async fn test_set_muted_without_joining_is_rejected() {
    let gw = TestGateway::new();
    let alice = gw.create_user("alice").await;
    let mut client = gw.connect_ready(&alice).await;

    client.send_op("VOICE_SET_MUTE", Some(json!({ "muted": true })));
    let (code, op) = client.recv_error().await;
    assert_eq!(code, "NOT_IN_VOICE");
    assert_eq!(op.as_deref(), Some("VOICE_SET_MUTE"));

    // No voice entry was created as a side effect
    assert!(gw.gateway.voice().state(alice.id).is_none());
    assert_eq!(gw.gateway.voice().member_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_join_leave_cooldown() {
    let gw = TestGateway::with_config(|c| c.join_leave_cooldown = Duration::from_secs(2));
    let alice = gw.create_user("alice").await;
    let mut client = gw.connect_ready(&alice).await;

    join_voice(&mut client, &alice).await;

    client.send_op("VOICE_LEAVE", None);
    assert_eq!(client.recv_error().await.0, "COOLDOWN");
    assert!(gw.gateway.voice().is_member(alice.id));

    tokio::time::advance(Duration::from_secs(2)).await;
    client.send_op("VOICE_LEAVE", None);
    client
        .recv_until(|f| matches!(f, ServerFrame::VoiceStateUpdate(v) if !v.in_voice))
        .await;

    client.send_op("VOICE_JOIN", None);
    assert_eq!(client.recv_error().await.0, "COOLDOWN");
    assert!(!gw.gateway.voice().is_member(alice.id));

    tokio::time::advance(Duration::from_secs(2)).await;
    join_voice(&mut client, &alice).await;
}

#[tokio::test]
async fn test_mute_broadcasts_and_clears_speaking() {
    let gw = TestGateway::with_config(|c| c.mute_deafen_cooldown = Duration::ZERO);
    let alice = gw.create_user("alice").await;
    let bob = gw.create_user("bob").await;
    let mut alice_client = gw.connect_ready(&alice).await;
    let mut bob_client = gw.connect_ready(&bob).await;

    join_voice(&mut alice_client, &alice).await;
    alice_client.send_op("VOICE_SPEAKING", Some(json!({ "speaking": true })));
    bob_client
        .recv_until(|f| matches!(f, ServerFrame::VoiceStateUpdate(v) if v.speaking))
        .await;

    alice_client.send_op("VOICE_SET_MUTE", Some(json!({ "muted": true })));
    match bob_client
        .recv_until(|f| matches!(f, ServerFrame::VoiceStateUpdate(v) if v.muted))
        .await
    {
        ServerFrame::VoiceStateUpdate(view) => {
            assert_eq!(view.user_id, alice.id);
            assert!(!view.speaking);
        }
        _ => unreachable!(),
    }

    // Muted users cannot claim to be speaking
    alice_client.send_op("VOICE_SPEAKING", Some(json!({ "speaking": true })));
    assert_eq!(alice_client.recv_error().await.0, "INVALID_TRANSITION");
}

#[tokio::test]
async fn test_full_negotiation_exchange() {
    let gw = TestGateway::new();
    let alice = gw.create_user("alice").await;
    let bob = gw.create_user("bob").await;
    let mut alice_client = gw.connect_ready(&alice).await;
    let mut bob_client = gw.connect_ready(&bob).await;
    join_voice(&mut alice_client, &alice).await;
    join_voice(&mut bob_client, &bob).await;

    alice_client.send_op(
        "NEGOTIATION_OFFER",
        Some(json!({ "target": bob.id, "sdp": "v=0 offer" })),
    );
    assert_eq!(
        bob_client
            .recv_until(|f| matches!(f, ServerFrame::NegotiationOffer { .. }))
            .await,
        ServerFrame::NegotiationOffer {
            from: alice.id,
            sdp: "v=0 offer".to_string()
        }
    );

    bob_client.send_op(
        "NEGOTIATION_ANSWER",
        Some(json!({ "target": alice.id, "sdp": "v=0 answer" })),
    );
    assert_eq!(
        alice_client
            .recv_until(|f| matches!(f, ServerFrame::NegotiationAnswer { .. }))
            .await,
        ServerFrame::NegotiationAnswer {
            from: bob.id,
            sdp: "v=0 answer".to_string()
        }
    );
    assert_eq!(
        gw.gateway.negotiations().phase(alice.id, bob.id),
        Some(NegotiationPhase::AnswerReceived)
    );

    let candidate = json!({ "candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host" });
    bob_client.send_op(
        "NEGOTIATION_CANDIDATE",
        Some(json!({ "target": alice.id, "candidate": candidate })),
    );
    match alice_client
        .recv_until(|f| matches!(f, ServerFrame::NegotiationCandidate { .. }))
        .await
    {
        ServerFrame::NegotiationCandidate { from, candidate: c } => {
            assert_eq!(from, bob.id);
            assert_eq!(c, candidate);
        }
        _ => unreachable!(),
    }

    alice_client.send_op("NEGOTIATION_ESTABLISHED", Some(json!({ "target": bob.id })));
    assert_eq!(
        bob_client
            .recv_until(|f| matches!(f, ServerFrame::NegotiationEstablished { .. }))
            .await,
        ServerFrame::NegotiationEstablished { peer: alice.id }
    );
    assert_eq!(gw.gateway.negotiations().active_count(), 0);
}

#[tokio::test]
async fn test_second_offer_for_pair_is_rejected() {
    let gw = TestGateway::new();
    let alice = gw.create_user("alice").await;
    let bob = gw.create_user("bob").await;
    let mut alice_client = gw.connect_ready(&alice).await;
    let mut bob_client = gw.connect_ready(&bob).await;
    join_voice(&mut alice_client, &alice).await;
    join_voice(&mut bob_client, &bob).await;

    let offer = json!({ "target": bob.id, "sdp": "v=0" });
    alice_client.send_op("NEGOTIATION_OFFER", Some(offer.clone()));
    bob_client
        .recv_until(|f| matches!(f, ServerFrame::NegotiationOffer { .. }))
        .await;

    alice_client.send_op("NEGOTIATION_OFFER", Some(offer));
    let (code, op) = alice_client.recv_error().await;
    assert_eq!(code, "INVALID_NEGOTIATION_STATE");
    assert_eq!(op.as_deref(), Some("NEGOTIATION_OFFER"));

    // The in-flight negotiation is untouched and bob saw only one offer
    assert_eq!(
        gw.gateway.negotiations().phase(alice.id, bob.id),
        Some(NegotiationPhase::OfferSent)
    );
    bob_client.assert_no_frame().await;
}

#[tokio::test]
async fn test_offer_requires_both_in_voice() {
    let gw = TestGateway::new();
    let alice = gw.create_user("alice").await;
    let bob = gw.create_user("bob").await;
    let mut alice_client = gw.connect_ready(&alice).await;
    let _bob_client = gw.connect_ready(&bob).await;

    let offer = json!({ "target": bob.id, "sdp": "v=0" });
    alice_client.send_op("NEGOTIATION_OFFER", Some(offer.clone()));
    assert_eq!(alice_client.recv_error().await.0, "NOT_IN_VOICE");

    join_voice(&mut alice_client, &alice).await;
    alice_client.send_op("NEGOTIATION_OFFER", Some(offer));
    assert_eq!(
        alice_client.recv_error().await.0,
        "INVALID_NEGOTIATION_STATE"
    );
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_offer_times_out() {
    let gw = TestGateway::with_config(|c| c.negotiation_timeout = Duration::from_secs(3));
    let alice = gw.create_user("alice").await;
    let bob = gw.create_user("bob").await;
    let mut alice_client = gw.connect_ready(&alice).await;
    let mut bob_client = gw.connect_ready(&bob).await;
    join_voice(&mut alice_client, &alice).await;
    join_voice(&mut bob_client, &bob).await;

    alice_client.send_op(
        "NEGOTIATION_OFFER",
        Some(json!({ "target": bob.id, "sdp": "v=0" })),
    );
    bob_client
        .recv_until(|f| matches!(f, ServerFrame::NegotiationOffer { .. }))
        .await;

    assert_eq!(
        alice_client
            .recv_until(|f| matches!(f, ServerFrame::NegotiationFailed { .. }))
            .await,
        ServerFrame::NegotiationFailed {
            peer: bob.id,
            reason: "timeout".to_string()
        }
    );
    assert_eq!(
        bob_client
            .recv_until(|f| matches!(f, ServerFrame::NegotiationFailed { .. }))
            .await,
        ServerFrame::NegotiationFailed {
            peer: alice.id,
            reason: "timeout".to_string()
        }
    );
    assert_eq!(gw.gateway.negotiations().active_count(), 0);

    // A late answer finds nothing to answer
    bob_client.send_op(
        "NEGOTIATION_ANSWER",
        Some(json!({ "target": alice.id, "sdp": "v=0" })),
    );
    assert_eq!(bob_client.recv_error().await.0, "INVALID_NEGOTIATION_STATE");
}

#[tokio::test]
async fn test_leaving_voice_aborts_negotiation() {
    let gw = TestGateway::with_config(|c| c.join_leave_cooldown = Duration::ZERO);
    let alice = gw.create_user("alice").await;
    let bob = gw.create_user("bob").await;
    let mut alice_client = gw.connect_ready(&alice).await;
    let mut bob_client = gw.connect_ready(&bob).await;
    join_voice(&mut alice_client, &alice).await;
    join_voice(&mut bob_client, &bob).await;

    alice_client.send_op(
        "NEGOTIATION_OFFER",
        Some(json!({ "target": bob.id, "sdp": "v=0" })),
    );
    bob_client
        .recv_until(|f| matches!(f, ServerFrame::NegotiationOffer { .. }))
        .await;

    alice_client.send_op("VOICE_LEAVE", None);
    assert_eq!(
        bob_client
            .recv_until(|f| matches!(f, ServerFrame::NegotiationFailed { .. }))
            .await,
        ServerFrame::NegotiationFailed {
            peer: alice.id,
            reason: "peer_left".to_string()
        }
    );
    assert_eq!(gw.gateway.negotiations().active_count(), 0);
}

#[tokio::test]
async fn test_screen_share_publisher_leaving_clears_subscribers() {
    let gw = TestGateway::with_config(|c| c.join_leave_cooldown = Duration::ZERO);
    let alice = gw.create_user("alice").await;
    let bob = gw.create_user("bob").await;
    let carol = gw.create_user("carol").await;
    let mut alice_client = gw.connect_ready(&alice).await;
    let mut bob_client = gw.connect_ready(&bob).await;
    let mut carol_client = gw.connect_ready(&carol).await;
    join_voice(&mut alice_client, &alice).await;
    join_voice(&mut bob_client, &bob).await;
    join_voice(&mut carol_client, &carol).await;

    alice_client.send_op("SCREEN_SHARE_START", None);
    bob_client
        .recv_until(|f| matches!(f, ServerFrame::ScreenShareUpdate(v) if v.publisher_id == Some(alice.id)))
        .await;

    // Only one publisher at a time
    carol_client.send_op("SCREEN_SHARE_START", None);
    assert_eq!(carol_client.recv_error().await.0, "SCREEN_SHARE_ACTIVE");

    bob_client.send_op(
        "SCREEN_SHARE_SUBSCRIBE",
        Some(json!({ "publisher_id": alice.id })),
    );
    bob_client
        .recv_until(|f| matches!(f, ServerFrame::ScreenShareUpdate(v) if v.subscribers == vec![bob.id]))
        .await;

    alice_client.send_binary(media(FrameKind::ScreenKey, 1, b"keyframe"));
    let mut forwarded = bob_client.recv_binary().await;
    let frame = decode_frame(&mut forwarded).unwrap();
    assert_eq!(frame.publisher, alice.id.0);
    assert_eq!(frame.payload, Bytes::from_static(b"keyframe"));

    alice_client.send_op("VOICE_LEAVE", None);
    match bob_client
        .recv_until(|f| matches!(f, ServerFrame::ScreenShareUpdate(_)))
        .await
    {
        ServerFrame::ScreenShareUpdate(view) => {
            assert_eq!(view.publisher_id, None);
            assert!(view.subscribers.is_empty());
        }
        _ => unreachable!(),
    }

    // The slot is free again
    carol_client.send_op("SCREEN_SHARE_START", None);
    carol_client
        .recv_until(|f| matches!(f, ServerFrame::ScreenShareUpdate(v) if v.publisher_id == Some(carol.id)))
        .await;
    assert!(gw.gateway.sfu().screen_share_view().subscribers.is_empty());
}

#[tokio::test]
async fn test_audio_skips_sender_and_deafened_members() {
    let gw = TestGateway::with_config(|c| c.mute_deafen_cooldown = Duration::ZERO);
    let alice = gw.create_user("alice").await;
    let bob = gw.create_user("bob").await;
    let carol = gw.create_user("carol").await;
    let mut alice_client = gw.connect_ready(&alice).await;
    let mut bob_client = gw.connect_ready(&bob).await;
    let mut carol_client = gw.connect_ready(&carol).await;
    join_voice(&mut alice_client, &alice).await;
    join_voice(&mut bob_client, &bob).await;
    join_voice(&mut carol_client, &carol).await;

    carol_client.send_op("VOICE_SET_DEAFEN", Some(json!({ "deafened": true })));
    alice_client
        .recv_until(|f| matches!(f, ServerFrame::VoiceStateUpdate(v) if v.user_id == carol.id && v.deafened))
        .await;
    bob_client
        .recv_until(|f| matches!(f, ServerFrame::VoiceStateUpdate(v) if v.user_id == carol.id && v.deafened))
        .await;
    carol_client
        .recv_until(|f| matches!(f, ServerFrame::VoiceStateUpdate(v) if v.user_id == carol.id && v.deafened))
        .await;

    alice_client.send_binary(media(FrameKind::Audio, 7, b"opus"));
    let mut forwarded = bob_client.recv_binary().await;
    let frame = decode_frame(&mut forwarded).unwrap();
    assert_eq!(frame.publisher, alice.id.0);
    assert_eq!(frame.sequence, 7);

    alice_client.assert_no_frame().await;
    carol_client.assert_no_frame().await;
}

#[tokio::test]
async fn test_malformed_media_is_dropped_without_closing() {
    let gw = TestGateway::new();
    let alice = gw.create_user("alice").await;
    let mut client = gw.connect_ready(&alice).await;
    join_voice(&mut client, &alice).await;

    client.send_binary(Bytes::from_static(b"\xff\xff"));
    client.send_op("HEARTBEAT", None);
    assert_eq!(client.recv_frame().await, ServerFrame::HeartbeatAck);
}
