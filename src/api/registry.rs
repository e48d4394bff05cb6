//! Live connection records, exclusively owned by the registry.
//!
//! One record per normalized connection id, from `create_peer_connection`
//! until teardown removes it. Cryptors and tracks reference connections by
//! id through this registry; nothing holds a strong back-pointer to the
//! session.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::api::call::{Call, Participant};
use crate::api::peer_connection::{FrameCryptor, MediaTrack, PeerConnection};
use crate::api::state_machine::CallDirection;

/// Per-connection crypto handshake progress. Transitions are monotonic
/// forward; `Complete` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherNegotiationState {
    Waiting,
    SetSenderKey,
    SetRecipientKey,
    Complete,
}

impl CipherNegotiationState {
    fn rank(self) -> u8 {
        match self {
            CipherNegotiationState::Waiting => 0,
            CipherNegotiationState::SetSenderKey => 1,
            CipherNegotiationState::SetRecipientKey => 1,
            CipherNegotiationState::Complete => 2,
        }
    }

    /// Whether moving to `next` goes forward.
    pub fn can_advance_to(self, next: CipherNegotiationState) -> bool {
        self != CipherNegotiationState::Complete && next.rank() >= self.rank()
    }
}

/// SDP negotiation progress for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    New,
    LocalSet,
    RemoteSet,
}

/// Everything the SDK tracks for one live connection.
#[derive(Clone)]
pub struct ConnectionRecord {
    pub id: String,
    pub peer_connection: Arc<dyn PeerConnection>,
    pub sender: Participant,
    pub recipient: Option<Participant>,
    pub call: Call,
    pub direction: CallDirection,
    pub cipher_negotiation_state: CipherNegotiationState,
    pub negotiation_phase: NegotiationPhase,
    pub local_audio_track: Option<Arc<MediaTrack>>,
    pub local_video_track: Option<Arc<MediaTrack>>,
    pub remote_video_tracks_by_participant: HashMap<String, String>,
    pub remote_audio_tracks_by_participant: HashMap<String, String>,
    pub video_sender_cryptor: Option<Arc<dyn FrameCryptor>>,
    pub audio_sender_cryptor: Option<Arc<dyn FrameCryptor>>,
    pub video_receiver_cryptors_by_participant: HashMap<String, Arc<dyn FrameCryptor>>,
    pub audio_receiver_cryptors_by_participant: HashMap<String, Arc<dyn FrameCryptor>>,
    pub data_channels: Vec<String>,
}

impl ConnectionRecord {
    pub fn new(
        id: &str,
        peer_connection: Arc<dyn PeerConnection>,
        call: Call,
        direction: CallDirection,
    ) -> Self {
        Self {
            id: id.to_string(),
            peer_connection,
            sender: call.sender.clone(),
            recipient: call.recipients.first().cloned(),
            call,
            direction,
            cipher_negotiation_state: CipherNegotiationState::Waiting,
            negotiation_phase: NegotiationPhase::New,
            local_audio_track: None,
            local_video_track: None,
            remote_video_tracks_by_participant: HashMap::new(),
            remote_audio_tracks_by_participant: HashMap::new(),
            video_sender_cryptor: None,
            audio_sender_cryptor: None,
            video_receiver_cryptors_by_participant: HashMap::new(),
            audio_receiver_cryptors_by_participant: HashMap::new(),
            data_channels: Vec::new(),
        }
    }
}

/// Normalize a connection id: trim whitespace and strip a leading channel
/// sigil. Case is preserved; the transport re-applies sigils on the way out.
pub fn normalize_connection_id(raw: &str) -> String {
    let trimmed = raw.trim();
    trimmed.strip_prefix('#').unwrap_or(trimmed).to_string()
}

/// Serialized map of connection id to live record.
#[derive(Default)]
pub struct ConnectionRegistry {
    records: RwLock<HashMap<String, ConnectionRecord>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new record. At most one record may exist per connection id;
    /// inserting over a live record replaces it and returns the old one.
    pub async fn insert(&self, record: ConnectionRecord) -> Option<ConnectionRecord> {
        let id = normalize_connection_id(&record.id);
        self.records.write().await.insert(id, record)
    }

    pub async fn find(&self, connection_id: &str) -> Option<ConnectionRecord> {
        let id = normalize_connection_id(connection_id);
        self.records.read().await.get(&id).cloned()
    }

    /// Mutate a record in place under the registry lock.
    pub async fn update<F>(&self, connection_id: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut ConnectionRecord),
    {
        let id = normalize_connection_id(connection_id);
        let mut records = self.records.write().await;
        match records.get_mut(&id) {
            Some(record) => {
                mutate(record);
                true
            }
            None => false,
        }
    }

    /// Advance a connection's cipher negotiation state; backward moves and
    /// moves out of `Complete` are ignored.
    pub async fn advance_cipher_state(
        &self,
        connection_id: &str,
        next: CipherNegotiationState,
    ) -> Option<CipherNegotiationState> {
        let id = normalize_connection_id(connection_id);
        let mut records = self.records.write().await;
        let record = records.get_mut(&id)?;
        if record.cipher_negotiation_state.can_advance_to(next) {
            record.cipher_negotiation_state = next;
        }
        Some(record.cipher_negotiation_state)
    }

    pub async fn remove(&self, connection_id: &str) -> Option<ConnectionRecord> {
        let id = normalize_connection_id(connection_id);
        self.records.write().await.remove(&id)
    }

    pub async fn remove_all(&self) -> Vec<ConnectionRecord> {
        let mut records = self.records.write().await;
        records.drain().map(|(_, r)| r).collect()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn ids(&self) -> Vec<String> {
        self.records.read().await.keys().cloned().collect()
    }
}
