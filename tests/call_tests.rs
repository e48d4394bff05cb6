//! End-to-end 1:1 call flows: crypto handshake, offer/answer, candidate
//! buffering, acceptance gate outcomes, and teardown.

mod common;

use common::*;

use pqs_rtc::api::call::{Call, IceCandidate};
use pqs_rtc::api::error::RtcError;
use pqs_rtc::api::peer_connection::{IceConnectionState, PeerConnectionEvent};
use pqs_rtc::api::registry::CipherNegotiationState;
use pqs_rtc::api::session::{CallAnswerState, RtcSession};
use pqs_rtc::api::state_machine::{CallDirection, CallMedia, CallState};

use std::sync::Arc;
use tokio::time::{sleep, Duration};

const ROOM: &str = "#room-1";
const NORMALIZED: &str = "room-1";

struct Pair {
    alice_session: RtcSession,
    alice_engine: Arc<FakeEngine>,
    alice_transport: Arc<FakeTransport>,
    bob_session: RtcSession,
    bob_engine: Arc<FakeEngine>,
    bob_transport: Arc<FakeTransport>,
    /// Alice's view of the call, carrying her identity props.
    call_from_alice: Call,
    /// Bob's view of the call, carrying his identity props.
    call_from_bob: Call,
}

/// Run the full crypto handshake between two live sessions, shuttling the
/// transport artifacts by hand the way a host app would.
async fn establish_handshake() -> Pair {
    let (alice_session, alice_engine, alice_transport) = new_session(alice());
    let (bob_session, bob_engine, bob_transport) = new_session(bob());

    let call = Call::one_to_one(ROOM, alice(), vec![bob()], false).unwrap();
    let call_from_alice = alice_session.initiate_call(&call).await.unwrap();
    alice_session.start_call(&call_from_alice).await.unwrap();

    // Bob's SDK answers; his handshake ciphertext goes out to Alice.
    let call_from_bob = bob_session.answer_call(&call_from_alice).await.unwrap();
    let bob_ciphertext = bob_transport.last_ciphertext().expect("bob sent ciphertext");

    // The app relays Bob's acceptance to Alice before completing.
    alice_session
        .set_call_answer_state(CallAnswerState::Answered, call.id)
        .await;
    alice_session
        .finish_crypto_session_creation(bob_ciphertext, &call_from_bob)
        .await
        .unwrap();

    // Alice's ciphertext flows back to Bob.
    let alice_ciphertext = alice_transport
        .last_ciphertext()
        .expect("alice sent ciphertext");
    bob_session
        .create_crypto_session(alice_ciphertext, &call_from_alice)
        .await
        .unwrap();

    Pair {
        alice_session,
        alice_engine,
        alice_transport,
        bob_session,
        bob_engine,
        bob_transport,
        call_from_alice,
        call_from_bob,
    }
}

// ── Setup and validation ───────────────────────────────────────────────────

#[tokio::test]
async fn initiate_creates_connection_with_props() {
    let (session, engine, _transport) = new_session(alice());
    let call = Call::one_to_one(ROOM, alice(), vec![bob()], false).unwrap();

    let call = session.initiate_call(&call).await.unwrap();

    assert_eq!(session.connection_count().await, 1);
    assert!(call.frame_identity_props.is_some());
    assert!(call.signaling_identity_props.is_some());
    assert!(engine.connection(NORMALIZED).is_some());
    assert!(matches!(session.current_state().await, CallState::Ready(_)));
}

#[tokio::test]
async fn initiate_is_idempotent_per_connection() {
    let (session, engine, _transport) = new_session(alice());
    let call = Call::one_to_one(ROOM, alice(), vec![bob()], false).unwrap();

    let first = session.initiate_call(&call).await.unwrap();
    let second = session.create_crypto_peer_connection(&call).await.unwrap();

    assert_eq!(session.connection_count().await, 1);
    assert_eq!(engine.connections.lock().unwrap().len(), 1);
    // The same lazily created identity is returned unchanged.
    assert_eq!(
        first.frame_identity_props.unwrap().session_id,
        second.frame_identity_props.unwrap().session_id
    );
}

#[tokio::test]
async fn empty_communication_id_is_invalid_metadata() {
    let err = Call::one_to_one("   ", alice(), vec![bob()], false).unwrap_err();
    assert!(matches!(err, RtcError::InvalidMetadata(_)));
}

#[tokio::test]
async fn empty_recipients_only_allowed_for_group_calls() {
    let err = Call::one_to_one(ROOM, alice(), vec![], false).unwrap_err();
    assert!(matches!(err, RtcError::InvalidMetadata(_)));
    assert!(Call::group(ROOM, alice(), true).is_ok());
}

#[tokio::test]
async fn empty_participant_fields_rejected() {
    let err = pqs_rtc::api::call::Participant::new(" ", "nick", "dev").unwrap_err();
    assert!(matches!(err, RtcError::InvalidParticipant(_)));
}

// ── Crypto handshake (E1 core) ─────────────────────────────────────────────

#[tokio::test]
async fn handshake_converges_on_complete_for_both_sides() {
    let pair = establish_handshake().await;

    assert_eq!(
        pair.alice_session.cipher_negotiation_state(ROOM).await,
        Some(CipherNegotiationState::Complete)
    );
    assert_eq!(
        pair.bob_session.cipher_negotiation_state(ROOM).await,
        Some(CipherNegotiationState::Complete)
    );
}

#[tokio::test]
async fn handshake_installs_frame_keys_under_both_participant_ids() {
    let pair = establish_handshake().await;

    let alice_keys = pair.alice_session.key_provider();
    let bob_keys = pair.bob_session.key_provider();

    // Alice's send key at index 0 matches what Bob derived for her.
    let alice_local = alice_keys.export_key("alice", 0);
    let alice_at_bob = bob_keys.export_key("alice", 0);
    assert!(!alice_local.is_empty());
    assert_eq!(alice_local, alice_at_bob);

    // And symmetrically for Bob.
    let bob_local = bob_keys.export_key("bob", 0);
    let bob_at_alice = alice_keys.export_key("bob", 0);
    assert!(!bob_local.is_empty());
    assert_eq!(bob_local, bob_at_alice);
}

#[tokio::test]
async fn offer_and_answer_round_trip_through_encrypted_packets() {
    let pair = establish_handshake().await;

    // Alice produced an encrypted offer during finish.
    let offer_packet = pair.alice_transport.offers().pop().expect("offer sent");
    pair.bob_session
        .handle_packet(offer_packet, &pair.call_from_alice)
        .await
        .unwrap();

    let bob_pc = pair.bob_engine.connection(NORMALIZED).unwrap();
    let remote = bob_pc.remote_description.lock().unwrap().clone().unwrap();
    assert!(remote.sdp.contains("a=sendrecv"));

    // Bob's encrypted answer flows back and lands on Alice's connection.
    let answer_packet = pair.bob_transport.answers().pop().expect("answer sent");
    pair.alice_session
        .handle_packet(answer_packet, &pair.call_from_bob)
        .await
        .unwrap();

    let alice_pc = pair.alice_engine.connection(NORMALIZED).unwrap();
    assert!(alice_pc.remote_description.lock().unwrap().is_some());
}

#[tokio::test]
async fn ice_connected_drives_state_machine_to_connected() {
    let pair = establish_handshake().await;

    let alice_pc = pair.alice_engine.connection(NORMALIZED).unwrap();
    alice_pc.emit(PeerConnectionEvent::IceConnectionStateChanged {
        connection_id: NORMALIZED.to_string(),
        state: IceConnectionState::Connected,
    });
    sleep(Duration::from_millis(50)).await;

    match pair.alice_session.current_state().await {
        CallState::Connected(CallDirection::Outbound(CallMedia::Voice), _) => {}
        other => panic!("expected connected(outbound voice), got {other:?}"),
    }
}

#[tokio::test]
async fn events_from_stale_connection_do_not_transition_state() {
    let pair = establish_handshake().await;

    // A connection that is not the active one reports ICE connected.
    let other_call = Call::one_to_one("room-2", alice(), vec![bob()], false).unwrap();
    pair.alice_session
        .create_crypto_peer_connection(&other_call)
        .await
        .unwrap();
    let other_pc = pair.alice_engine.connection("room-2").unwrap();
    other_pc.emit(PeerConnectionEvent::IceConnectionStateChanged {
        connection_id: "room-2".to_string(),
        state: IceConnectionState::Connected,
    });
    sleep(Duration::from_millis(50)).await;

    // The active call (room-1) is still only connecting.
    assert!(matches!(
        pair.alice_session.current_state().await,
        CallState::Connecting(..)
    ));
}

// ── Acceptance gate (E2 / E3) ──────────────────────────────────────────────

#[tokio::test]
async fn rejected_call_throws_and_clears_all_state() {
    let (alice_session, _alice_engine, _alice_transport) = new_session(alice());
    let (bob_session, _bob_engine, bob_transport) = new_session(bob());

    let call = Call::one_to_one(ROOM, alice(), vec![bob()], false).unwrap();
    let call_from_alice = alice_session.initiate_call(&call).await.unwrap();
    alice_session.start_call(&call_from_alice).await.unwrap();

    let call_from_bob = bob_session.answer_call(&call_from_alice).await.unwrap();
    let bob_ciphertext = bob_transport.last_ciphertext().unwrap();

    alice_session
        .set_call_answer_state(CallAnswerState::Rejected, call.id)
        .await;
    let err = alice_session
        .finish_crypto_session_creation(bob_ciphertext, &call_from_bob)
        .await
        .unwrap_err();

    assert_eq!(err, RtcError::Rejected);
    assert_eq!(alice_session.connection_count().await, 0);
    assert!(!alice_session.has_identity(ROOM).await);
    assert!(matches!(
        alice_session.current_state().await,
        CallState::Ended(..)
    ));
}

#[tokio::test(start_paused = true)]
async fn unanswered_call_times_out_and_tears_down() {
    let (alice_session, _alice_engine, _alice_transport) = new_session(alice());
    let (bob_session, _bob_engine, bob_transport) = new_session(bob());

    let call = Call::one_to_one(ROOM, alice(), vec![bob()], false).unwrap();
    let call_from_alice = alice_session.initiate_call(&call).await.unwrap();
    alice_session.start_call(&call_from_alice).await.unwrap();

    let call_from_bob = bob_session.answer_call(&call_from_alice).await.unwrap();
    let bob_ciphertext = bob_transport.last_ciphertext().unwrap();

    // No decision ever arrives; the 30 s gate resolves to unanswered.
    let err = alice_session
        .finish_crypto_session_creation(bob_ciphertext, &call_from_bob)
        .await
        .unwrap_err();

    assert_eq!(err, RtcError::Unanswered);
    assert_eq!(alice_session.connection_count().await, 0);
    assert!(!alice_session.has_identity(ROOM).await);
}

#[tokio::test]
async fn can_answer_default_resolves_pending_gate() {
    let (alice_session, _alice_engine, _alice_transport) = new_session(alice());
    let (bob_session, _bob_engine, bob_transport) = new_session(bob());

    let call = Call::one_to_one(ROOM, alice(), vec![bob()], false).unwrap();
    let call_from_alice = alice_session.initiate_call(&call).await.unwrap();
    let call_from_bob = bob_session.answer_call(&call_from_alice).await.unwrap();
    let bob_ciphertext = bob_transport.last_ciphertext().unwrap();

    alice_session.set_can_answer(true).await;
    alice_session
        .finish_crypto_session_creation(bob_ciphertext, &call_from_bob)
        .await
        .unwrap();
    assert_eq!(
        alice_session.cipher_negotiation_state(ROOM).await,
        Some(CipherNegotiationState::Complete)
    );
}

// ── Candidate buffering (E4) ───────────────────────────────────────────────

fn candidate(id: u64) -> IceCandidate {
    IceCandidate {
        id,
        sdp: format!("candidate:{id} 1 udp 2122260223 192.168.1.{id} 54400 typ host"),
        sdp_m_line_index: 0,
        sdp_mid: Some("0".to_string()),
    }
}

#[tokio::test]
async fn candidates_before_remote_are_buffered_then_drained_in_order() {
    let (session, engine, _transport) = new_session(alice());
    let call = Call::one_to_one(ROOM, alice(), vec![bob()], false).unwrap();
    let call = session.initiate_call(&call).await.unwrap();

    for id in 1..=3 {
        session.handle_candidate(&call, candidate(id)).await.unwrap();
    }
    let pc = engine.connection(NORMALIZED).unwrap();
    assert!(pc.added_candidates.lock().unwrap().is_empty());

    // The remote answer lands; buffered candidates drain 1, 2, 3.
    session.handle_answer(&call, FAKE_SDP).await.unwrap();
    let delivered: Vec<u64> = pc
        .added_candidates
        .lock()
        .unwrap()
        .iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(delivered, vec![1, 2, 3]);

    // After set_remote, new candidates pass straight through, exactly once.
    session.handle_candidate(&call, candidate(4)).await.unwrap();
    let delivered: Vec<u64> = pc
        .added_candidates
        .lock()
        .unwrap()
        .iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(delivered, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn candidate_with_empty_mid_still_accepted() {
    let (session, engine, _transport) = new_session(alice());
    let call = Call::one_to_one(ROOM, alice(), vec![bob()], false).unwrap();
    let call = session.initiate_call(&call).await.unwrap();
    session.handle_answer(&call, FAKE_SDP).await.unwrap();

    let no_mid = IceCandidate {
        id: 9,
        sdp: "candidate:9 1 udp 1 10.0.0.9 1000 typ host".to_string(),
        sdp_m_line_index: 0,
        sdp_mid: None,
    };
    session.handle_candidate(&call, no_mid).await.unwrap();
    let pc = engine.connection(NORMALIZED).unwrap();
    assert_eq!(pc.added_candidates.lock().unwrap().last().unwrap().id, 9);
}

#[tokio::test]
async fn generated_candidates_queue_until_ready_then_send_in_order() {
    let pair = establish_handshake().await;
    let alice_pc = pair.alice_engine.connection(NORMALIZED).unwrap();

    // Alice is not ready yet (no remote answer), so candidates queue.
    for i in 0..3 {
        alice_pc.emit(PeerConnectionEvent::GeneratedIceCandidate {
            connection_id: NORMALIZED.to_string(),
            sdp: format!("candidate:{i}"),
            sdp_m_line_index: 0,
            sdp_mid: None,
        });
    }
    sleep(Duration::from_millis(50)).await;
    assert!(pair.alice_transport.candidates().is_empty());

    // Bob's answer flips ready_for_candidates and flushes the deque.
    let answer_packet = {
        let offer_packet = pair.alice_transport.offers().pop().unwrap();
        pair.bob_session
            .handle_packet(offer_packet, &pair.call_from_alice)
            .await
            .unwrap();
        pair.bob_transport.answers().pop().unwrap()
    };
    pair.alice_session
        .handle_packet(answer_packet, &pair.call_from_bob)
        .await
        .unwrap();

    let sent = pair.alice_transport.candidates();
    assert_eq!(sent.len(), 3);

    // Once ready, further generated candidates go straight out.
    alice_pc.emit(PeerConnectionEvent::GeneratedIceCandidate {
        connection_id: NORMALIZED.to_string(),
        sdp: "candidate:late".to_string(),
        sdp_m_line_index: 0,
        sdp_mid: None,
    });
    sleep(Duration::from_millis(50)).await;
    assert_eq!(pair.alice_transport.candidates().len(), 4);
}

// ── Teardown ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn finish_end_connection_clears_registry_and_identities() {
    let pair = establish_handshake().await;

    pair.alice_session
        .finish_end_connection(&pair.call_from_bob, false)
        .await
        .unwrap();

    assert_eq!(pair.alice_session.connection_count().await, 0);
    assert!(!pair.alice_session.has_identity(ROOM).await);
    let pc = pair.alice_engine.connection(NORMALIZED).unwrap();
    assert!(pc.closed.load(std::sync::atomic::Ordering::SeqCst));
}

#[tokio::test]
async fn finish_end_connection_is_effectively_once() {
    let pair = establish_handshake().await;

    pair.alice_session
        .finish_end_connection(&pair.call_from_bob, false)
        .await
        .unwrap();
    // Second teardown for the same key is a no-op, not an error.
    pair.alice_session
        .finish_end_connection(&pair.call_from_bob, false)
        .await
        .unwrap();
    assert_eq!(pair.alice_session.connection_count().await, 0);
}

#[tokio::test]
async fn end_call_reports_did_end_to_transport() {
    let pair = establish_handshake().await;

    pair.alice_session.end_call(&pair.call_from_bob).await.unwrap();

    let saw_did_end = pair
        .alice_transport
        .all()
        .iter()
        .any(|s| matches!(s, Sent::DidEnd(..)));
    assert!(saw_did_end);
    assert!(matches!(
        pair.alice_session.current_state().await,
        CallState::Ended(..)
    ));
}

#[tokio::test]
async fn shutdown_resets_everything_for_the_next_call() {
    let pair = establish_handshake().await;

    pair.alice_session
        .shutdown(Some(&pair.call_from_bob))
        .await
        .unwrap();

    assert_eq!(pair.alice_session.connection_count().await, 0);
    assert!(!pair.alice_session.has_identity(ROOM).await);
    assert!(matches!(
        pair.alice_session.current_state().await,
        CallState::Waiting
    ));

    // A new call can start cleanly afterwards.
    let call = Call::one_to_one("room-2", alice(), vec![bob()], false).unwrap();
    pair.alice_session.initiate_call(&call).await.unwrap();
    assert_eq!(pair.alice_session.connection_count().await, 1);
}

#[tokio::test]
async fn channel_sigil_is_stripped_for_lookup() {
    let (session, engine, _transport) = new_session(alice());
    let call = Call::one_to_one("#sigil-room", alice(), vec![bob()], false).unwrap();
    session.initiate_call(&call).await.unwrap();

    assert!(engine.connection("sigil-room").is_some());
    assert!(session.cipher_negotiation_state("sigil-room").await.is_some());
    assert!(session.cipher_negotiation_state("#sigil-room").await.is_some());
}
