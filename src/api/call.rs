//! Call data model and wire-level signaling artifacts.
//!
//! Everything in this module crosses the transport in the shapes defined
//! here; field names and enum tags are part of the wire contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::error::RtcError;
use crate::api::ratchet::RatchetMessage;

// ── Participants ───────────────────────────────────────────────────────────

/// One logical device of one user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Participant {
    pub secret_name: String,
    pub nickname: String,
    pub device_id: String,
}

impl Participant {
    /// Build a participant, trimming whitespace and rejecting empty fields.
    pub fn new(secret_name: &str, nickname: &str, device_id: &str) -> Result<Self, RtcError> {
        let secret_name = secret_name.trim();
        let nickname = nickname.trim();
        let device_id = device_id.trim();
        if secret_name.is_empty() || nickname.is_empty() || device_id.is_empty() {
            return Err(RtcError::InvalidParticipant(
                "secret_name, nickname, and device_id must be non-empty".to_string(),
            ));
        }
        Ok(Self {
            secret_name: secret_name.to_string(),
            nickname: nickname.to_string(),
            device_id: device_id.to_string(),
        })
    }
}

// ── Identity props ─────────────────────────────────────────────────────────

/// Publicly advertised identity material for one ratchet axis. The remote
/// side uses these to initialize its half of the pairwise session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityProps {
    /// Ratchet session identifier the owner will send under.
    pub session_id: Uuid,
    pub secret_name: String,
    pub device_id: String,
    /// Hex-encoded long-term Curve25519 public key.
    pub identity_public_hex: String,
    /// Hex-encoded one-time Curve25519 public key, when one was generated.
    pub one_time_public_hex: Option<String>,
    /// Base64-encoded ML-KEM public key.
    pub kem_public_b64: String,
    /// Base64-encoded 256-bit session symmetric key (channel binding salt).
    pub symmetric_key_b64: String,
}

// ── Call record ────────────────────────────────────────────────────────────

/// A single logical call, 1:1 or group. `shared_communication_id` is the
/// normalized connection key (no channel sigil).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub id: Uuid,
    pub shared_communication_id: String,
    pub shared_message_id: Option<String>,
    pub sender: Participant,
    /// Empty only for SFU group calls.
    pub recipients: Vec<Participant>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub supports_video: bool,
    pub is_active: bool,
    pub unanswered: bool,
    pub rejected: bool,
    pub failed: bool,
    /// Props for the media-frame ratchet axis.
    pub frame_identity_props: Option<IdentityProps>,
    /// Props for the signaling ratchet axis.
    pub signaling_identity_props: Option<IdentityProps>,
    #[serde(default)]
    pub metadata: Option<Vec<u8>>,
}

impl Call {
    /// Create a 1:1 call record.
    pub fn one_to_one(
        shared_communication_id: &str,
        sender: Participant,
        recipients: Vec<Participant>,
        supports_video: bool,
    ) -> Result<Self, RtcError> {
        let call = Self {
            id: Uuid::new_v4(),
            shared_communication_id: shared_communication_id.trim().to_string(),
            shared_message_id: None,
            sender,
            recipients,
            created_at: Utc::now(),
            updated_at: None,
            ended_at: None,
            supports_video,
            is_active: true,
            unanswered: false,
            rejected: false,
            failed: false,
            frame_identity_props: None,
            signaling_identity_props: None,
            metadata: None,
        };
        call.validate(false)?;
        Ok(call)
    }

    /// Create a group (SFU) call record; recipients may be empty.
    pub fn group(
        shared_communication_id: &str,
        sender: Participant,
        supports_video: bool,
    ) -> Result<Self, RtcError> {
        let call = Self {
            id: Uuid::new_v4(),
            shared_communication_id: shared_communication_id.trim().to_string(),
            shared_message_id: None,
            sender,
            recipients: Vec::new(),
            created_at: Utc::now(),
            updated_at: None,
            ended_at: None,
            supports_video,
            is_active: true,
            unanswered: false,
            rejected: false,
            failed: false,
            frame_identity_props: None,
            signaling_identity_props: None,
            metadata: None,
        };
        call.validate(true)?;
        Ok(call)
    }

    /// Validate invariants. `allow_empty_recipients` is true only for
    /// SFU/group calls.
    pub fn validate(&self, allow_empty_recipients: bool) -> Result<(), RtcError> {
        if self.shared_communication_id.trim().is_empty() {
            return Err(RtcError::InvalidMetadata(
                "shared_communication_id must be non-empty".to_string(),
            ));
        }
        if self.recipients.is_empty() && !allow_empty_recipients {
            return Err(RtcError::InvalidMetadata(
                "recipients may be empty only for group calls".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether this is an SFU group call.
    pub fn is_group(&self) -> bool {
        self.recipients.is_empty()
    }

    /// Outcome flags are monotonic: once set they are never cleared.
    pub fn mark_unanswered(&mut self) {
        self.unanswered = true;
        self.touch();
    }

    pub fn mark_rejected(&mut self) {
        self.rejected = true;
        self.touch();
    }

    pub fn mark_failed(&mut self) {
        self.failed = true;
        self.touch();
    }

    pub fn mark_ended(&mut self) {
        self.is_active = false;
        self.ended_at = Some(Utc::now());
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }

    /// Key under which a teardown for this call is deduplicated.
    pub fn teardown_key(&self, connection_id: &str) -> String {
        let call_key = self
            .shared_message_id
            .clone()
            .unwrap_or_else(|| self.id.to_string());
        format!("{call_key}:{connection_id}")
    }
}

// ── SDP and ICE wire types ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SdpType {
    #[serde(rename = "offer")]
    Offer,
    #[serde(rename = "answer")]
    Answer,
    #[serde(rename = "prAnswer")]
    PrAnswer,
    #[serde(rename = "rollback")]
    Rollback,
}

/// A session description as exchanged over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    /// Build a description; the SDP body must be non-empty after trimming.
    pub fn new(sdp_type: SdpType, sdp: &str) -> Result<Self, RtcError> {
        let sdp = sdp.trim();
        if sdp.is_empty() {
            return Err(RtcError::InvalidSdpFormat);
        }
        Ok(Self {
            sdp_type,
            sdp: sdp.to_string(),
        })
    }
}

/// A trickled ICE candidate. `id` is assigned locally in generation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub id: u64,
    pub sdp: String,
    pub sdp_m_line_index: i32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sdp_mid: Option<String>,
}

// ── Signaling packets ──────────────────────────────────────────────────────

/// Discriminator for the payload carried by a [`RatchetMessagePacket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SignalingFlag {
    Offer,
    Answer,
    Candidate,
    Participants,
    ParticipantDemuxId,
    HandshakeComplete,
}

/// Cleartext header accompanying every encrypted signaling packet, enough
/// for the receiver to locate (or lazily initialize) the right ratchet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingHeader {
    pub sender_secret_name: String,
    pub sender_device_id: String,
    pub connection_id: String,
    /// PQXDH handshake blob, present until the sender knows the receiver
    /// has initialized.
    #[serde(default)]
    pub handshake_ciphertext_b64: Option<String>,
}

/// One encrypted control-plane message (SDP, ICE, roster updates).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatchetMessagePacket {
    pub sfu_identity: String,
    pub header: SignalingHeader,
    pub ratchet_message: RatchetMessage,
    pub flag: SignalingFlag,
}

// ── Group call wire types ──────────────────────────────────────────────────

/// Roster entry as the SFU reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupParticipant {
    pub id: String,
    pub demux_id: Option<u32>,
}

/// Cleartext payload of a sender-key distribution, AES-GCM-encrypted under a
/// pairwise ratchet message key before leaving the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderKeyPayload {
    pub call_id: Uuid,
    pub sender_participant_id: String,
    pub key_index: u32,
    pub key_b64: String,
}

/// Pairwise-encrypted sender key message, transported as opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedSenderKeyMessage {
    pub call_id: Uuid,
    pub from_participant_id: String,
    pub to_participant_id: String,
    pub session_id: Uuid,
    /// Present at least until the recipient acknowledges; default strategy
    /// is send-once-per-pair.
    #[serde(default)]
    pub handshake_ciphertext_b64: Option<String>,
    pub ratchet_message_number: u32,
    pub nonce_b64: String,
    pub payload_ciphertext_b64: String,
}

/// Frame- and signaling-axis handshake blobs bundled into the single opaque
/// ciphertext the transport carries per connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiphertextBundle {
    pub frame_b64: String,
    pub signaling_b64: String,
}

impl CiphertextBundle {
    pub fn encode(&self) -> Result<Vec<u8>, RtcError> {
        serde_json::to_vec(self).map_err(|e| RtcError::InvalidMetadata(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RtcError> {
        serde_json::from_slice(bytes).map_err(|e| RtcError::InvalidMetadata(e.to_string()))
    }
}
