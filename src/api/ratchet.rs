//! Pairwise ratchet sessions for signaling and frame-key derivation.
//!
//! Hybrid post-quantum key agreement: the sender runs a PQXDH handshake
//! (X25519 against the remote long-term and one-time keys, plus an ML-KEM
//! encapsulation) and emits an opaque ciphertext blob; the recipient
//! reproduces the same root from the blob. Each session is unidirectional:
//! one send chain on the initiator, one receive chain on the peer. A 1:1
//! call holds one pair per direction.

use std::collections::HashMap;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hkdf::Hkdf;
use pqc_kyber::{decapsulate, encapsulate};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::Mutex;
use uuid::Uuid;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::api::error::RtcError;
use crate::api::keys::{LocalKeys, RemoteKeys, SessionIdentity};

/// Max skipped message keys retained per receive chain; out-of-order gaps
/// beyond this are rejected.
const MAX_SKIP: u32 = 100;

const HANDSHAKE_INFO: &[u8] = b"pqs-rtc-handshake-v1";
const CHAIN_INFO: &[u8] = b"pqs-rtc-chain-advance";
const MESSAGE_KEY_INFO: &[u8] = b"pqs-rtc-message-key";

// ── Wire types ─────────────────────────────────────────────────────────────

/// Header carried with every ratchet message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetHeader {
    pub session_id: Uuid,
    pub message_number: u32,
}

/// One AEAD-sealed message under a derived ratchet message key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetMessage {
    pub header: RatchetHeader,
    pub nonce_b64: String,
    pub ciphertext_b64: String,
}

/// The opaque PQXDH handshake blob the sender emits and the transport
/// carries to the recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct HandshakeBlob {
    session_id: Uuid,
    ephemeral_public_hex: String,
    kem_ciphertext_b64: String,
    uses_one_time: bool,
}

// ── Chain state ────────────────────────────────────────────────────────────

struct ChainState {
    chain_key: [u8; 32],
    next_number: u32,
}

impl Drop for ChainState {
    fn drop(&mut self) {
        self.chain_key.zeroize();
    }
}

struct SendSession {
    chain: ChainState,
    /// Handshake blob for the peer, retained until teardown.
    handshake: Vec<u8>,
}

struct RecvSession {
    chain: ChainState,
    /// Message keys skipped over for out-of-order delivery.
    skipped: HashMap<u32, [u8; 32]>,
}

impl Drop for RecvSession {
    fn drop(&mut self) {
        for key in self.skipped.values_mut() {
            key.zeroize();
        }
    }
}

#[derive(Default)]
struct RatchetStore {
    send: HashMap<Uuid, SendSession>,
    recv: HashMap<Uuid, RecvSession>,
}

// ── KDF helpers ────────────────────────────────────────────────────────────

fn hkdf_expand(salt: Option<&[u8]>, ikm: &[u8], info: &[u8]) -> Result<[u8; 32], RtcError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm)
        .map_err(|_| RtcError::EncryptionFailure("HKDF expand failed".to_string()))?;
    Ok(okm)
}

/// Advance a chain key one step, yielding the message key for the current
/// position and the next chain key.
fn advance_chain(chain_key: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), RtcError> {
    let message_key = hkdf_expand(None, chain_key, MESSAGE_KEY_INFO)?;
    let next_chain = hkdf_expand(None, chain_key, CHAIN_INFO)?;
    Ok((message_key, next_chain))
}

pub(crate) fn aead_encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), RtcError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| RtcError::EncryptionFailure("bad AEAD key length".to_string()))?;
    let mut nonce = vec![0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| RtcError::EncryptionFailure("AEAD seal failed".to_string()))?;
    Ok((nonce, ciphertext))
}

pub(crate) fn aead_decrypt(
    key: &[u8; 32],
    nonce: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, RtcError> {
    if nonce.len() != 12 {
        return Err(RtcError::MissingCryptoPayload);
    }
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| RtcError::EncryptionFailure("bad AEAD key length".to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| RtcError::EncryptionFailure("AEAD open failed".to_string()))
}

// ── State manager ──────────────────────────────────────────────────────────

/// Drives all ratchet sessions on one axis ("frame" or "signaling"). Every
/// operation is serialized behind a single mutex, which also gives the
/// per-session ordering guarantee.
pub struct RatchetStateManager {
    axis: &'static str,
    store: Mutex<RatchetStore>,
}

impl RatchetStateManager {
    pub fn new(axis: &'static str) -> Self {
        Self {
            axis,
            store: Mutex::new(RatchetStore::default()),
        }
    }

    /// Prepare the send chain toward a peer and produce the PQXDH handshake
    /// blob. Idempotent: an already-initialized session is left untouched
    /// and `false` is returned.
    pub async fn sender_initialization(
        &self,
        session: &SessionIdentity,
        session_symmetric_key: &[u8],
        remote: &RemoteKeys,
        local: &LocalKeys,
    ) -> Result<bool, RtcError> {
        let mut store = self.store.lock().await;
        if store.send.contains_key(&session.id) {
            return Ok(false);
        }

        let mut rng = rand::thread_rng();
        let ephemeral = StaticSecret::random_from_rng(&mut rng);
        let ephemeral_public = PublicKey::from(&ephemeral);

        let dh1 = ephemeral.diffie_hellman(&remote.identity_public);
        let dh2 = local.identity_secret.diffie_hellman(&remote.identity_public);
        let dh3 = remote
            .one_time_public
            .as_ref()
            .map(|otk| ephemeral.diffie_hellman(otk));
        let (kem_ciphertext, kem_shared) = encapsulate(&remote.kem_public, &mut rng)
            .map_err(|e| RtcError::EncryptionFailure(format!("ML-KEM encapsulate: {e}")))?;

        let mut ikm = Vec::with_capacity(128);
        ikm.extend_from_slice(dh1.as_bytes());
        ikm.extend_from_slice(dh2.as_bytes());
        if let Some(ref dh3) = dh3 {
            ikm.extend_from_slice(dh3.as_bytes());
        }
        ikm.extend_from_slice(&kem_shared);
        let chain_key = hkdf_expand(Some(session_symmetric_key), &ikm, HANDSHAKE_INFO)?;
        ikm.zeroize();

        let blob = HandshakeBlob {
            session_id: session.id,
            ephemeral_public_hex: hex::encode(ephemeral_public.as_bytes()),
            kem_ciphertext_b64: BASE64.encode(kem_ciphertext),
            uses_one_time: dh3.is_some(),
        };
        let handshake = serde_json::to_vec(&blob)
            .map_err(|e| RtcError::EncryptionFailure(e.to_string()))?;

        store.send.insert(
            session.id,
            SendSession {
                chain: ChainState {
                    chain_key,
                    next_number: 0,
                },
                handshake,
            },
        );
        tracing::debug!(axis = self.axis, session_id = %session.id, "send chain initialized");
        Ok(true)
    }

    /// Retrieve the handshake blob produced by `sender_initialization`.
    pub async fn get_cipher_text(&self, session_id: Uuid) -> Result<Vec<u8>, RtcError> {
        let store = self.store.lock().await;
        store
            .send
            .get(&session_id)
            .map(|s| s.handshake.clone())
            .ok_or(RtcError::MissingCipherText)
    }

    /// Initialize the receive chain for a peer's session from its handshake
    /// blob. Idempotent: an already-initialized session returns `false`.
    pub async fn recipient_initialization(
        &self,
        session: &SessionIdentity,
        session_symmetric_key: &[u8],
        local: &LocalKeys,
        remote: &RemoteKeys,
        ciphertext: &[u8],
    ) -> Result<bool, RtcError> {
        let mut store = self.store.lock().await;
        if store.recv.contains_key(&session.id) {
            return Ok(false);
        }

        let blob: HandshakeBlob =
            serde_json::from_slice(ciphertext).map_err(|_| RtcError::MissingCipherText)?;
        let ephemeral_bytes =
            hex::decode(&blob.ephemeral_public_hex).map_err(|_| RtcError::MissingCipherText)?;
        let ephemeral_arr: [u8; 32] = ephemeral_bytes
            .try_into()
            .map_err(|_| RtcError::MissingCipherText)?;
        let ephemeral_public = PublicKey::from(ephemeral_arr);
        let kem_ciphertext = BASE64
            .decode(&blob.kem_ciphertext_b64)
            .map_err(|_| RtcError::MissingCipherText)?;

        let dh1 = local.identity_secret.diffie_hellman(&ephemeral_public);
        let dh2 = local.identity_secret.diffie_hellman(&remote.identity_public);
        let dh3 = if blob.uses_one_time {
            let one_time = local
                .one_time_secret
                .as_ref()
                .ok_or(RtcError::MissingCipherText)?;
            Some(one_time.diffie_hellman(&ephemeral_public))
        } else {
            None
        };
        let kem_shared = decapsulate(&kem_ciphertext, &local.kem.secret)
            .map_err(|e| RtcError::EncryptionFailure(format!("ML-KEM decapsulate: {e}")))?;

        let mut ikm = Vec::with_capacity(128);
        ikm.extend_from_slice(dh1.as_bytes());
        ikm.extend_from_slice(dh2.as_bytes());
        if let Some(ref dh3) = dh3 {
            ikm.extend_from_slice(dh3.as_bytes());
        }
        ikm.extend_from_slice(&kem_shared);
        let chain_key = hkdf_expand(Some(session_symmetric_key), &ikm, HANDSHAKE_INFO)?;
        ikm.zeroize();

        store.recv.insert(
            session.id,
            RecvSession {
                chain: ChainState {
                    chain_key,
                    next_number: 0,
                },
                skipped: HashMap::new(),
            },
        );
        tracing::debug!(axis = self.axis, session_id = %session.id, "recv chain initialized");
        Ok(true)
    }

    /// Advance the send chain, returning the next message key and its number.
    pub async fn derive_message_key(
        &self,
        session_id: Uuid,
    ) -> Result<([u8; 32], u32), RtcError> {
        let mut store = self.store.lock().await;
        let session = store
            .send
            .get_mut(&session_id)
            .ok_or(RtcError::MissingSessionIdentity)?;
        let number = session.chain.next_number;
        let (message_key, next_chain) = advance_chain(&session.chain.chain_key)?;
        session.chain.chain_key = next_chain;
        session.chain.next_number = number + 1;
        Ok((message_key, number))
    }

    /// Derive the receive-side message key for `message_number`, advancing
    /// the chain and retaining skipped keys for out-of-order delivery.
    pub async fn derive_received_message_key(
        &self,
        session_id: Uuid,
        message_number: u32,
    ) -> Result<[u8; 32], RtcError> {
        let mut store = self.store.lock().await;
        let session = store
            .recv
            .get_mut(&session_id)
            .ok_or(RtcError::MissingSessionIdentity)?;
        if let Some(key) = session.skipped.remove(&message_number) {
            return Ok(key);
        }
        if message_number < session.chain.next_number {
            return Err(RtcError::EncryptionFailure(format!(
                "message key {message_number} already consumed"
            )));
        }
        if message_number - session.chain.next_number > MAX_SKIP {
            return Err(RtcError::EncryptionFailure(format!(
                "gap to message {message_number} exceeds skip limit"
            )));
        }
        while session.chain.next_number < message_number {
            let (skipped_key, next_chain) = advance_chain(&session.chain.chain_key)?;
            session
                .skipped
                .insert(session.chain.next_number, skipped_key);
            session.chain.chain_key = next_chain;
            session.chain.next_number += 1;
        }
        let (message_key, next_chain) = advance_chain(&session.chain.chain_key)?;
        session.chain.chain_key = next_chain;
        session.chain.next_number = message_number + 1;
        Ok(message_key)
    }

    /// Encrypt a full message under the session's next send key.
    pub async fn ratchet_encrypt(
        &self,
        plaintext: &[u8],
        session_id: Uuid,
    ) -> Result<RatchetMessage, RtcError> {
        let (mut key, number) = self.derive_message_key(session_id).await?;
        let result = aead_encrypt(&key, plaintext);
        key.zeroize();
        let (nonce, ciphertext) = result?;
        Ok(RatchetMessage {
            header: RatchetHeader {
                session_id,
                message_number: number,
            },
            nonce_b64: BASE64.encode(nonce),
            ciphertext_b64: BASE64.encode(ciphertext),
        })
    }

    /// Decrypt a full message on the session's receive chain.
    pub async fn ratchet_decrypt(
        &self,
        message: &RatchetMessage,
        session_id: Uuid,
    ) -> Result<Vec<u8>, RtcError> {
        let mut key = self
            .derive_received_message_key(session_id, message.header.message_number)
            .await?;
        let nonce = BASE64
            .decode(&message.nonce_b64)
            .map_err(|_| RtcError::MissingCryptoPayload)?;
        let ciphertext = BASE64
            .decode(&message.ciphertext_b64)
            .map_err(|_| RtcError::MissingCryptoPayload)?;
        let result = aead_decrypt(&key, &nonce, &ciphertext);
        key.zeroize();
        result
    }

    pub async fn has_send_session(&self, session_id: Uuid) -> bool {
        self.store.lock().await.send.contains_key(&session_id)
    }

    pub async fn has_recv_session(&self, session_id: Uuid) -> bool {
        self.store.lock().await.recv.contains_key(&session_id)
    }

    /// Drop all in-memory chains.
    pub async fn shutdown(&self) {
        let mut store = self.store.lock().await;
        store.send.clear();
        store.recv.clear();
        tracing::debug!(axis = self.axis, "ratchet state dropped");
    }
}
