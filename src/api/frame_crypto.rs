//! Media frame key rings feeding the engine's frame-cryptor hook.
//!
//! Writers are the call session and the group facade; readers are the
//! engine's sender/receiver cryptors on its internal threads, so the rings
//! sit behind a synchronous `std::sync::RwLock` rather than an async lock.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::api::config::{FrameCryptorConfig, FrameKeyMode};
use crate::api::error::RtcError;

const FRAME_KEY_INFO: &[u8] = b"pqs-rtc-frame-key-ratchet";

/// Engine-facing lookup hook: the frame cryptor resolves the key for each
/// frame by `(participant_id, key_index)`. A `None` return drops the frame
/// when `discard_frame_when_cryptor_not_ready` is set.
pub trait FrameKeySource: Send + Sync {
    fn get_key(&self, participant_id: &str, index: u32) -> Option<Vec<u8>>;
}

/// Bounded ring of key indices; oldest installs are evicted first.
#[derive(Default)]
struct KeyRing {
    keys: HashMap<u32, Vec<u8>>,
    order: VecDeque<u32>,
}

impl KeyRing {
    fn install(&mut self, index: u32, key: Vec<u8>, capacity: usize) {
        if let Some(mut old) = self.keys.insert(index, key) {
            old.zeroize();
            self.order.retain(|i| *i != index);
        }
        self.order.push_back(index);
        while self.order.len() > capacity {
            if let Some(evicted) = self.order.pop_front() {
                if let Some(mut key) = self.keys.remove(&evicted) {
                    key.zeroize();
                }
            }
        }
    }

    fn get(&self, index: u32) -> Option<Vec<u8>> {
        self.keys.get(&index).cloned()
    }
}

impl Drop for KeyRing {
    fn drop(&mut self) {
        for key in self.keys.values_mut() {
            key.zeroize();
        }
    }
}

/// Per-participant or shared key ring provider for the frame cryptors.
pub struct FrameKeyProvider {
    mode: FrameKeyMode,
    config: FrameCryptorConfig,
    shared: RwLock<KeyRing>,
    rings: RwLock<HashMap<String, KeyRing>>,
}

impl FrameKeyProvider {
    pub fn new(mode: FrameKeyMode, config: FrameCryptorConfig) -> Self {
        Self {
            mode,
            config,
            shared: RwLock::new(KeyRing::default()),
            rings: RwLock::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> FrameKeyMode {
        self.mode
    }

    pub fn config(&self) -> &FrameCryptorConfig {
        &self.config
    }

    fn check_key(key: &[u8]) -> Result<(), RtcError> {
        if key.len() != 32 {
            return Err(RtcError::InvalidConfiguration(
                "frame keys must be 256-bit".to_string(),
            ));
        }
        Ok(())
    }

    /// Install a key in the shared ring.
    pub fn set_shared_key(&self, key: Vec<u8>, index: u32) -> Result<(), RtcError> {
        Self::check_key(&key)?;
        let mut ring = self.shared.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        ring.install(index, key, self.config.key_ring_size);
        Ok(())
    }

    /// Install a key for one participant.
    pub fn set_key(&self, key: Vec<u8>, index: u32, participant_id: &str) -> Result<(), RtcError> {
        Self::check_key(&key)?;
        match self.mode {
            FrameKeyMode::Shared => self.set_shared_key(key, index),
            FrameKeyMode::PerParticipant => {
                let mut rings = self.rings.write().unwrap_or_else(std::sync::PoisonError::into_inner);
                rings
                    .entry(participant_id.to_string())
                    .or_default()
                    .install(index, key, self.config.key_ring_size);
                Ok(())
            }
        }
    }

    /// Derive the next key at `index` in the shared ring and install it.
    pub fn ratchet_shared_key(&self, index: u32) -> Result<Vec<u8>, RtcError> {
        let current = {
            let ring = self.shared.read().unwrap_or_else(std::sync::PoisonError::into_inner);
            ring.get(index).ok_or(RtcError::MissingCryptoPayload)?
        };
        let next = self.derive_next(&current)?;
        self.set_shared_key(next.clone(), index)?;
        Ok(next)
    }

    /// Derive the next key at `index` for a participant and install it.
    pub fn ratchet_key(&self, participant_id: &str, index: u32) -> Result<Vec<u8>, RtcError> {
        if self.mode == FrameKeyMode::Shared {
            return self.ratchet_shared_key(index);
        }
        let current = {
            let rings = self.rings.read().unwrap_or_else(std::sync::PoisonError::into_inner);
            rings
                .get(participant_id)
                .and_then(|r| r.get(index))
                .ok_or(RtcError::MissingCryptoPayload)?
        };
        let next = self.derive_next(&current)?;
        self.set_key(next.clone(), index, participant_id)?;
        Ok(next)
    }

    /// Export the shared key at `index`; empty when the index was never
    /// installed or has been evicted.
    pub fn export_shared_key(&self, index: u32) -> Vec<u8> {
        self.shared
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(index)
            .unwrap_or_default()
    }

    /// Export a participant's key at `index`; empty when absent.
    pub fn export_key(&self, participant_id: &str, index: u32) -> Vec<u8> {
        match self.mode {
            FrameKeyMode::Shared => self.export_shared_key(index),
            FrameKeyMode::PerParticipant => self
                .rings
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .get(participant_id)
                .and_then(|r| r.get(index))
                .unwrap_or_default(),
        }
    }

    /// Drop one participant's ring.
    pub fn remove_participant(&self, participant_id: &str) {
        self.rings
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(participant_id);
    }

    /// Drop every ring.
    pub fn clear(&self) {
        self.rings.write().unwrap_or_else(std::sync::PoisonError::into_inner).clear();
        *self.shared.write().unwrap_or_else(std::sync::PoisonError::into_inner) = KeyRing::default();
    }

    fn derive_next(&self, current: &[u8]) -> Result<Vec<u8>, RtcError> {
        let hk = Hkdf::<Sha256>::new(Some(&self.config.ratchet_salt), current);
        let mut next = vec![0u8; 32];
        hk.expand(FRAME_KEY_INFO, &mut next)
            .map_err(|_| RtcError::EncryptionFailure("frame key ratchet failed".to_string()))?;
        Ok(next)
    }
}

impl FrameKeySource for FrameKeyProvider {
    fn get_key(&self, participant_id: &str, index: u32) -> Option<Vec<u8>> {
        let key = match self.mode {
            FrameKeyMode::Shared => self
                .shared
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .get(index),
            FrameKeyMode::PerParticipant => self
                .rings
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .get(participant_id)
                .and_then(|r| r.get(index)),
        };
        key
    }
}
