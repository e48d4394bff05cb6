//! Identity key material and the per-axis key manager.
//!
//! Two `KeyManager` instances exist per session: one holds identities whose
//! ratchets derive media frame keys, the other holds identities whose
//! ratchets encrypt signaling. Same contract, distinct storage, so rekeying
//! one axis never perturbs the other.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use pqc_kyber::{keypair, Keypair, KYBER_PUBLICKEYBYTES};
use rand::RngCore;
use tokio::sync::RwLock;
use uuid::Uuid;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::api::call::IdentityProps;
use crate::api::error::RtcError;

// ── Key material ───────────────────────────────────────────────────────────

/// Local ratchet identity material: long-term and one-time Curve25519
/// keypairs plus an ML-KEM keypair for the post-quantum leg.
#[derive(Clone)]
pub struct LocalKeys {
    pub identity_secret: StaticSecret,
    pub identity_public: PublicKey,
    pub one_time_secret: Option<StaticSecret>,
    pub one_time_public: Option<PublicKey>,
    pub kem: Keypair,
}

impl LocalKeys {
    /// Generate fresh local key material.
    pub fn generate() -> Result<Self, RtcError> {
        let mut rng = rand::thread_rng();
        let identity_secret = StaticSecret::random_from_rng(&mut rng);
        let identity_public = PublicKey::from(&identity_secret);
        let one_time_secret = StaticSecret::random_from_rng(&mut rng);
        let one_time_public = PublicKey::from(&one_time_secret);
        let kem = keypair(&mut rng)
            .map_err(|e| RtcError::EncryptionFailure(format!("ML-KEM keygen: {e}")))?;
        Ok(Self {
            identity_secret,
            identity_public,
            one_time_secret: Some(one_time_secret),
            one_time_public: Some(one_time_public),
            kem,
        })
    }
}

impl Drop for LocalKeys {
    fn drop(&mut self) {
        // StaticSecret zeroizes itself; scrub the KEM secret explicitly.
        self.kem.secret.zeroize();
    }
}

/// Remote identity material parsed from advertised props.
#[derive(Clone)]
pub struct RemoteKeys {
    pub identity_public: PublicKey,
    pub one_time_public: Option<PublicKey>,
    pub kem_public: Vec<u8>,
}

impl RemoteKeys {
    /// Parse remote key material out of advertised identity props.
    pub fn from_props(props: &IdentityProps) -> Result<Self, RtcError> {
        let identity_public = parse_curve_public(&props.identity_public_hex)?;
        let one_time_public = props
            .one_time_public_hex
            .as_deref()
            .map(parse_curve_public)
            .transpose()?;
        let kem_public = BASE64
            .decode(&props.kem_public_b64)
            .map_err(|_| RtcError::MissingProps)?;
        if kem_public.len() != KYBER_PUBLICKEYBYTES {
            return Err(RtcError::MissingProps);
        }
        Ok(Self {
            identity_public,
            one_time_public,
            kem_public,
        })
    }
}

fn parse_curve_public(hex_str: &str) -> Result<PublicKey, RtcError> {
    let bytes = hex::decode(hex_str).map_err(|_| RtcError::MissingProps)?;
    let arr: [u8; 32] = bytes.try_into().map_err(|_| RtcError::MissingProps)?;
    Ok(PublicKey::from(arr))
}

/// Identifies one unidirectional ratchet session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub id: Uuid,
    pub secret_name: String,
    pub device_id: String,
}

/// Local identity bound to one connection; created lazily on first use and
/// destroyed on teardown.
#[derive(Clone)]
pub struct ConnectionLocalIdentity {
    pub connection_id: String,
    pub local_keys: LocalKeys,
    pub symmetric_key: Vec<u8>,
    pub session_identity: SessionIdentity,
}

impl ConnectionLocalIdentity {
    /// Export the advertisable props for this identity.
    pub fn props(&self) -> IdentityProps {
        IdentityProps {
            session_id: self.session_identity.id,
            secret_name: self.session_identity.secret_name.clone(),
            device_id: self.session_identity.device_id.clone(),
            identity_public_hex: hex::encode(self.local_keys.identity_public.as_bytes()),
            one_time_public_hex: self
                .local_keys
                .one_time_public
                .as_ref()
                .map(|k| hex::encode(k.as_bytes())),
            kem_public_b64: BASE64.encode(self.local_keys.kem.public),
            symmetric_key_b64: BASE64.encode(&self.symmetric_key),
        }
    }
}

impl Drop for ConnectionLocalIdentity {
    fn drop(&mut self) {
        self.symmetric_key.zeroize();
    }
}

impl std::fmt::Debug for ConnectionLocalIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLocalIdentity")
            .field("connection_id", &self.connection_id)
            .field("session_identity", &self.session_identity)
            .finish_non_exhaustive()
    }
}

/// Remote session identity built from advertised props.
#[derive(Clone)]
pub struct ConnectionSessionIdentity {
    pub connection_id: String,
    pub symmetric_key: Vec<u8>,
    pub session_identity: SessionIdentity,
    pub remote_keys: RemoteKeys,
    /// PQXDH handshake blob received before the recv ratchet was
    /// initialized, buffered until initialization can run.
    pub ciphertext: Option<Vec<u8>>,
}

impl Drop for ConnectionSessionIdentity {
    fn drop(&mut self) {
        self.symmetric_key.zeroize();
    }
}

impl std::fmt::Debug for ConnectionSessionIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSessionIdentity")
            .field("connection_id", &self.connection_id)
            .field("session_identity", &self.session_identity)
            .finish_non_exhaustive()
    }
}

// ── Key manager ────────────────────────────────────────────────────────────

/// Single source of truth for local and remote identity material on one
/// ratchet axis.
pub struct KeyManager {
    /// "frame" or "signaling"; used for log context only.
    axis: &'static str,
    local: RwLock<HashMap<String, ConnectionLocalIdentity>>,
    remote: RwLock<HashMap<String, ConnectionSessionIdentity>>,
    /// Handshake blobs received before the matching remote identity exists.
    pending_ciphertexts: RwLock<HashMap<String, Vec<u8>>>,
    last_local: RwLock<Option<String>>,
}

impl KeyManager {
    pub fn new(axis: &'static str) -> Self {
        Self {
            axis,
            local: RwLock::new(HashMap::new()),
            remote: RwLock::new(HashMap::new()),
            pending_ciphertexts: RwLock::new(HashMap::new()),
            last_local: RwLock::new(None),
        }
    }

    /// Get or create the local identity for a connection. Idempotent: an
    /// existing identity is returned unchanged.
    pub async fn generate_sender_identity(
        &self,
        connection_id: &str,
        secret_name: &str,
        device_id: &str,
    ) -> Result<ConnectionLocalIdentity, RtcError> {
        {
            let local = self.local.read().await;
            if let Some(existing) = local.get(connection_id) {
                return Ok(existing.clone());
            }
        }
        let local_keys = LocalKeys::generate()?;
        let mut symmetric_key = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut symmetric_key);
        let identity = ConnectionLocalIdentity {
            connection_id: connection_id.to_string(),
            local_keys,
            symmetric_key,
            session_identity: SessionIdentity {
                id: Uuid::new_v4(),
                secret_name: secret_name.to_string(),
                device_id: device_id.to_string(),
            },
        };
        {
            let mut local = self.local.write().await;
            // Lost race: another writer created one while we were generating.
            if let Some(existing) = local.get(connection_id) {
                return Ok(existing.clone());
            }
            local.insert(connection_id.to_string(), identity.clone());
        }
        *self.last_local.write().await = Some(connection_id.to_string());
        tracing::debug!(axis = self.axis, connection_id, "generated local identity");
        Ok(identity)
    }

    /// Build and store a remote session identity from advertised props. Any
    /// ciphertext buffered for the connection is attached to the record.
    pub async fn create_recipient_identity(
        &self,
        connection_id: &str,
        props: &IdentityProps,
    ) -> Result<ConnectionSessionIdentity, RtcError> {
        let remote_keys = RemoteKeys::from_props(props)?;
        let symmetric_key = BASE64
            .decode(&props.symmetric_key_b64)
            .map_err(|_| RtcError::MissingProps)?;
        if symmetric_key.len() != 32 {
            return Err(RtcError::MissingProps);
        }
        let buffered = self.pending_ciphertexts.write().await.remove(connection_id);
        let identity = ConnectionSessionIdentity {
            connection_id: connection_id.to_string(),
            symmetric_key,
            session_identity: SessionIdentity {
                id: props.session_id,
                secret_name: props.secret_name.clone(),
                device_id: props.device_id.clone(),
            },
            remote_keys,
            ciphertext: buffered,
        };
        self.remote
            .write()
            .await
            .insert(connection_id.to_string(), identity.clone());
        tracing::debug!(axis = self.axis, connection_id, "stored remote identity");
        Ok(identity)
    }

    /// The most recently created local identity, if any.
    pub async fn fetch_call_key_bundle(&self) -> Option<ConnectionLocalIdentity> {
        let last = self.last_local.read().await.clone()?;
        self.local.read().await.get(&last).cloned()
    }

    /// Local identity for a connection.
    pub async fn fetch_connection_identity(
        &self,
        connection_id: &str,
    ) -> Result<ConnectionLocalIdentity, RtcError> {
        self.local
            .read()
            .await
            .get(connection_id)
            .cloned()
            .ok_or(RtcError::MissingSessionIdentity)
    }

    /// Remote session identity for a connection.
    pub async fn fetch_remote_identity(
        &self,
        connection_id: &str,
    ) -> Result<ConnectionSessionIdentity, RtcError> {
        self.remote
            .read()
            .await
            .get(connection_id)
            .cloned()
            .ok_or(RtcError::MissingSessionIdentity)
    }

    /// Buffer a PQXDH handshake blob until the remote ratchet initializes.
    pub async fn store_ciphertext(&self, connection_id: &str, bytes: Vec<u8>) {
        let mut remote = self.remote.write().await;
        if let Some(identity) = remote.get_mut(connection_id) {
            identity.ciphertext = Some(bytes);
        } else {
            self.pending_ciphertexts
                .write()
                .await
                .insert(connection_id.to_string(), bytes);
        }
    }

    /// Fetch a buffered handshake blob, if one arrived.
    pub async fn fetch_ciphertext(&self, connection_id: &str) -> Option<Vec<u8>> {
        if let Some(identity) = self.remote.read().await.get(connection_id) {
            if identity.ciphertext.is_some() {
                return identity.ciphertext.clone();
            }
        }
        self.pending_ciphertexts.read().await.get(connection_id).cloned()
    }

    /// Drop all material for a connection, including buffered ciphertext.
    pub async fn remove_connection_identity(&self, connection_id: &str) {
        self.local.write().await.remove(connection_id);
        self.remote.write().await.remove(connection_id);
        self.pending_ciphertexts.write().await.remove(connection_id);
        let mut last = self.last_local.write().await;
        if last.as_deref() == Some(connection_id) {
            *last = None;
        }
    }

    /// Whether any identity exists for the connection.
    pub async fn has_connection(&self, connection_id: &str) -> bool {
        self.local.read().await.contains_key(connection_id)
            || self.remote.read().await.contains_key(connection_id)
    }

    pub async fn clear_all(&self) {
        self.local.write().await.clear();
        self.remote.write().await.clear();
        self.pending_ciphertexts.write().await.clear();
        *self.last_local.write().await = None;
        tracing::debug!(axis = self.axis, "cleared all identities");
    }
}
