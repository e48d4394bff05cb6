//! Key manager, pairwise ratchet, and frame key ring behavior.

mod common;

use common::*;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use pqs_rtc::api::config::{FrameCryptorConfig, FrameKeyMode, KEY_RING_SIZE};
use pqs_rtc::api::error::RtcError;
use pqs_rtc::api::frame_crypto::{FrameKeyProvider, FrameKeySource};
use pqs_rtc::api::keys::{KeyManager, RemoteKeys, SessionIdentity};
use pqs_rtc::api::ratchet::RatchetStateManager;

const CONN: &str = "crypto-room";

// ── Key manager ────────────────────────────────────────────────────────────

#[tokio::test]
async fn generate_sender_identity_is_idempotent() {
    let manager = KeyManager::new("frame");
    let first = manager
        .generate_sender_identity(CONN, "alice", "dev-1")
        .await
        .unwrap();
    let second = manager
        .generate_sender_identity(CONN, "alice", "dev-1")
        .await
        .unwrap();

    assert_eq!(first.session_identity, second.session_identity);
    assert_eq!(first.symmetric_key, second.symmetric_key);
    assert_eq!(first.props(), second.props());
}

#[tokio::test]
async fn fetch_connection_identity_fails_when_missing() {
    let manager = KeyManager::new("signaling");
    let err = manager.fetch_connection_identity("nope").await.unwrap_err();
    assert_eq!(err, RtcError::MissingSessionIdentity);
}

#[tokio::test]
async fn recipient_identity_round_trips_props() {
    let alice_manager = KeyManager::new("frame");
    let bob_manager = KeyManager::new("frame");
    let alice_identity = alice_manager
        .generate_sender_identity(CONN, "alice", "dev-1")
        .await
        .unwrap();

    let stored = bob_manager
        .create_recipient_identity(CONN, &alice_identity.props())
        .await
        .unwrap();
    assert_eq!(stored.session_identity.id, alice_identity.session_identity.id);
    assert_eq!(stored.symmetric_key, alice_identity.symmetric_key);
    assert_eq!(
        stored.remote_keys.identity_public.as_bytes(),
        alice_identity.local_keys.identity_public.as_bytes()
    );
}

#[tokio::test]
async fn ciphertext_buffered_before_remote_identity_exists() {
    let alice_manager = KeyManager::new("signaling");
    let bob_manager = KeyManager::new("signaling");

    // Blob arrives before the props do.
    bob_manager.store_ciphertext(CONN, vec![1, 2, 3]).await;
    assert_eq!(bob_manager.fetch_ciphertext(CONN).await, Some(vec![1, 2, 3]));

    let alice_identity = alice_manager
        .generate_sender_identity(CONN, "alice", "dev-1")
        .await
        .unwrap();
    let stored = bob_manager
        .create_recipient_identity(CONN, &alice_identity.props())
        .await
        .unwrap();
    // The buffered blob was attached to the new remote identity.
    assert_eq!(stored.ciphertext, Some(vec![1, 2, 3]));
}

#[tokio::test]
async fn remove_connection_identity_clears_ciphertext() {
    let manager = KeyManager::new("signaling");
    manager
        .generate_sender_identity(CONN, "alice", "dev-1")
        .await
        .unwrap();
    manager.store_ciphertext(CONN, vec![9]).await;

    manager.remove_connection_identity(CONN).await;
    assert!(!manager.has_connection(CONN).await);
    assert_eq!(manager.fetch_ciphertext(CONN).await, None);
}

#[tokio::test]
async fn invalid_props_are_rejected() {
    let manager = KeyManager::new("frame");
    let identity = manager
        .generate_sender_identity(CONN, "alice", "dev-1")
        .await
        .unwrap();
    let mut props = identity.props();
    props.kem_public_b64 = "not base64!!!".to_string();
    let err = manager
        .create_recipient_identity("other", &props)
        .await
        .unwrap_err();
    assert_eq!(err, RtcError::MissingProps);
}

// ── Pairwise ratchet ───────────────────────────────────────────────────────

struct RatchetPair {
    sender: RatchetStateManager,
    receiver: RatchetStateManager,
    session: SessionIdentity,
}

/// Initialize a unidirectional alice→bob ratchet the way the session does:
/// alice salts with bob's advertised symmetric key, bob with his own.
async fn handshaken_pair() -> RatchetPair {
    let alice_keys = KeyManager::new("signaling");
    let bob_keys = KeyManager::new("signaling");
    let alice_identity = alice_keys
        .generate_sender_identity(CONN, "alice", "dev-1")
        .await
        .unwrap();
    let bob_identity = bob_keys
        .generate_sender_identity(CONN, "bob", "dev-2")
        .await
        .unwrap();

    let sender = RatchetStateManager::new("signaling");
    let receiver = RatchetStateManager::new("signaling");

    let bob_remote = RemoteKeys::from_props(&bob_identity.props()).unwrap();
    let fresh = sender
        .sender_initialization(
            &alice_identity.session_identity,
            &bob_identity.symmetric_key,
            &bob_remote,
            &alice_identity.local_keys,
        )
        .await
        .unwrap();
    assert!(fresh);

    let ciphertext = sender
        .get_cipher_text(alice_identity.session_identity.id)
        .await
        .unwrap();
    let alice_remote = RemoteKeys::from_props(&alice_identity.props()).unwrap();
    let fresh = receiver
        .recipient_initialization(
            &alice_identity.session_identity,
            &bob_identity.symmetric_key,
            &bob_identity.local_keys,
            &alice_remote,
            &ciphertext,
        )
        .await
        .unwrap();
    assert!(fresh);

    RatchetPair {
        sender,
        receiver,
        session: alice_identity.session_identity.clone(),
    }
}

#[tokio::test]
async fn ratchet_encrypt_decrypt_round_trip() {
    let pair = handshaken_pair().await;

    let message = pair
        .sender
        .ratchet_encrypt(b"offer sdp body", pair.session.id)
        .await
        .unwrap();
    assert_eq!(message.header.message_number, 0);

    let plaintext = pair
        .receiver
        .ratchet_decrypt(&message, pair.session.id)
        .await
        .unwrap();
    assert_eq!(plaintext, b"offer sdp body");
}

#[tokio::test]
async fn out_of_order_messages_use_skipped_keys() {
    let pair = handshaken_pair().await;

    let m0 = pair.sender.ratchet_encrypt(b"zero", pair.session.id).await.unwrap();
    let m1 = pair.sender.ratchet_encrypt(b"one", pair.session.id).await.unwrap();
    let m2 = pair.sender.ratchet_encrypt(b"two", pair.session.id).await.unwrap();

    // Deliver 2 first, then 0 and 1 from the skipped-key store.
    assert_eq!(
        pair.receiver.ratchet_decrypt(&m2, pair.session.id).await.unwrap(),
        b"two"
    );
    assert_eq!(
        pair.receiver.ratchet_decrypt(&m0, pair.session.id).await.unwrap(),
        b"zero"
    );
    assert_eq!(
        pair.receiver.ratchet_decrypt(&m1, pair.session.id).await.unwrap(),
        b"one"
    );
}

#[tokio::test]
async fn replayed_message_is_rejected() {
    let pair = handshaken_pair().await;
    let message = pair.sender.ratchet_encrypt(b"once", pair.session.id).await.unwrap();

    pair.receiver.ratchet_decrypt(&message, pair.session.id).await.unwrap();
    let err = pair
        .receiver
        .ratchet_decrypt(&message, pair.session.id)
        .await
        .unwrap_err();
    assert!(matches!(err, RtcError::EncryptionFailure(_)));
}

#[tokio::test]
async fn sender_initialization_is_idempotent() {
    let pair = handshaken_pair().await;
    // The pair helper already initialized; a second init must not reset the
    // chain position.
    pair.sender.ratchet_encrypt(b"a", pair.session.id).await.unwrap();
    let alice_keys = KeyManager::new("signaling");
    let alice_identity = alice_keys
        .generate_sender_identity(CONN, "alice", "dev-1")
        .await
        .unwrap();
    let remote = RemoteKeys::from_props(&alice_identity.props()).unwrap();
    let fresh = pair
        .sender
        .sender_initialization(
            &pair.session,
            &alice_identity.symmetric_key,
            &remote,
            &alice_identity.local_keys,
        )
        .await
        .unwrap();
    assert!(!fresh);
    let (_, number) = pair.sender.derive_message_key(pair.session.id).await.unwrap();
    assert_eq!(number, 1);
}

#[tokio::test]
async fn missing_ciphertext_is_reported() {
    let manager = RatchetStateManager::new("signaling");
    let err = manager
        .get_cipher_text(uuid::Uuid::new_v4())
        .await
        .unwrap_err();
    assert_eq!(err, RtcError::MissingCipherText);
}

#[tokio::test]
async fn garbage_handshake_blob_is_rejected() {
    let keys = KeyManager::new("signaling");
    let identity = keys
        .generate_sender_identity(CONN, "bob", "dev-2")
        .await
        .unwrap();
    let remote = RemoteKeys::from_props(&identity.props()).unwrap();
    let manager = RatchetStateManager::new("signaling");
    let err = manager
        .recipient_initialization(
            &identity.session_identity,
            &identity.symmetric_key,
            &identity.local_keys,
            &remote,
            b"definitely not a handshake blob",
        )
        .await
        .unwrap_err();
    assert_eq!(err, RtcError::MissingCipherText);
}

#[tokio::test]
async fn shutdown_drops_all_chains() {
    let pair = handshaken_pair().await;
    pair.sender.shutdown().await;
    let err = pair
        .sender
        .derive_message_key(pair.session.id)
        .await
        .unwrap_err();
    assert_eq!(err, RtcError::MissingSessionIdentity);
}

// ── Frame key provider ─────────────────────────────────────────────────────

fn make_provider(mode: FrameKeyMode) -> FrameKeyProvider {
    FrameKeyProvider::new(mode, FrameCryptorConfig::default())
}

fn key_of(byte: u8) -> Vec<u8> {
    vec![byte; 32]
}

#[tokio::test]
async fn set_then_export_is_bit_identical() {
    let provider = make_provider(FrameKeyMode::PerParticipant);
    provider.set_key(key_of(7), 0, "alice").unwrap();
    assert_eq!(provider.export_key("alice", 0), key_of(7));
    // Another participant's ring is independent.
    assert!(provider.export_key("bob", 0).is_empty());
}

#[tokio::test]
async fn older_indices_survive_until_ring_capacity() {
    let provider = make_provider(FrameKeyMode::PerParticipant);
    for index in 0..KEY_RING_SIZE as u32 {
        provider.set_key(key_of(index as u8), index, "alice").unwrap();
    }
    // All sixteen indices are still exportable.
    for index in 0..KEY_RING_SIZE as u32 {
        assert_eq!(provider.export_key("alice", index), key_of(index as u8));
    }

    // One more install evicts the oldest index.
    provider
        .set_key(key_of(0xEE), KEY_RING_SIZE as u32, "alice")
        .unwrap();
    assert!(provider.export_key("alice", 0).is_empty());
    assert_eq!(
        provider.export_key("alice", KEY_RING_SIZE as u32),
        key_of(0xEE)
    );
}

#[tokio::test]
async fn ratchet_key_derives_and_installs_next_key() {
    let provider = make_provider(FrameKeyMode::PerParticipant);
    provider.set_key(key_of(1), 3, "alice").unwrap();

    let next = provider.ratchet_key("alice", 3).unwrap();
    assert_ne!(next, key_of(1));
    assert_eq!(provider.export_key("alice", 3), next);

    // Ratcheting is deterministic given the same starting key and salt.
    let other = make_provider(FrameKeyMode::PerParticipant);
    other.set_key(key_of(1), 3, "alice").unwrap();
    assert_eq!(other.ratchet_key("alice", 3).unwrap(), next);
}

#[tokio::test]
async fn shared_mode_ignores_participant_on_lookup() {
    let provider = make_provider(FrameKeyMode::Shared);
    provider.set_shared_key(key_of(5), 0).unwrap();

    assert_eq!(provider.get_key("anyone", 0), Some(key_of(5)));
    assert_eq!(provider.get_key("someone-else", 0), Some(key_of(5)));
    assert_eq!(provider.export_key("whoever", 0), key_of(5));
}

#[tokio::test]
async fn missing_key_drops_frame_lookup() {
    let provider = make_provider(FrameKeyMode::PerParticipant);
    assert_eq!(provider.get_key("alice", 4), None);
}

#[tokio::test]
async fn non_256_bit_keys_are_rejected() {
    let provider = make_provider(FrameKeyMode::PerParticipant);
    let err = provider.set_key(vec![1, 2, 3], 0, "alice").unwrap_err();
    assert!(matches!(err, RtcError::InvalidConfiguration(_)));
}

#[tokio::test]
async fn ratchet_salt_changes_derivation() {
    let default_provider = make_provider(FrameKeyMode::PerParticipant);
    default_provider.set_key(key_of(9), 0, "alice").unwrap();
    let default_next = default_provider.ratchet_key("alice", 0).unwrap();

    let custom = FrameKeyProvider::new(
        FrameKeyMode::PerParticipant,
        FrameCryptorConfig {
            ratchet_salt: b"another-salt".to_vec(),
            ..FrameCryptorConfig::default()
        },
    );
    custom.set_key(key_of(9), 0, "alice").unwrap();
    assert_ne!(custom.ratchet_key("alice", 0).unwrap(), default_next);
}

// ── Wire encoding ──────────────────────────────────────────────────────────

#[tokio::test]
async fn props_symmetric_key_is_base64_of_32_bytes() {
    let manager = KeyManager::new("frame");
    let identity = manager
        .generate_sender_identity(CONN, "alice", "dev-1")
        .await
        .unwrap();
    let props = identity.props();
    let raw = BASE64.decode(&props.symmetric_key_b64).unwrap();
    assert_eq!(raw.len(), 32);
    assert_eq!(hex::decode(&props.identity_public_hex).unwrap().len(), 32);
}
