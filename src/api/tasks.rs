//! Serialized encrypt-and-send / decrypt-and-dispatch work items.
//!
//! All tasks on a processor run strictly in submission order behind one
//! queue lock. A failed task surfaces to its caller without blocking later
//! tasks, except a sender-initialization failure: that latches the
//! connection and rejects dependent write tasks until a successful
//! re-initialization.

use std::collections::HashSet;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::api::call::{
    Call, GroupParticipant, IceCandidate, RatchetMessagePacket, SessionDescription, SignalingFlag,
    SignalingHeader,
};
use crate::api::error::RtcError;
use crate::api::group::GroupControlMessage;
use crate::api::registry::{normalize_connection_id, CipherNegotiationState};
use crate::api::session::{self, SessionInner};

/// Encrypt `data` under the signaling ratchet for `room_id` and hand the
/// packet to the transport.
pub struct WriteTask {
    pub data: Vec<u8>,
    pub room_id: String,
    pub flag: SignalingFlag,
    pub call: Call,
    pub metadata: Option<Vec<u8>>,
}

/// Decrypt an inbound packet (lazily initializing the recipient ratchet)
/// and dispatch it by flag.
pub struct StreamTask {
    pub sender_secret_name: Option<String>,
    pub sender_device_id: Option<String>,
    pub packet: RatchetMessagePacket,
    pub call: Call,
}

/// Wire payload for the `participantDemuxId` flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemuxIdPayload {
    pub participant_id: String,
    pub demux_id: u32,
}

#[derive(Default)]
pub struct TaskProcessor {
    write_queue: Mutex<()>,
    stream_queue: Mutex<()>,
    failed_sender_init: RwLock<HashSet<String>>,
}

impl TaskProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a write task to completion. Returns the packet that was sent.
    pub async fn submit_write(
        &self,
        inner: &SessionInner,
        task: WriteTask,
    ) -> Result<RatchetMessagePacket, RtcError> {
        let _guard = self.write_queue.lock().await;
        let room = normalize_connection_id(&task.room_id);

        if self.failed_sender_init.read().await.contains(&room) {
            return Err(RtcError::MissingSessionIdentity);
        }

        let local = inner.signaling_keys.fetch_connection_identity(&room).await?;
        let session_id = local.session_identity.id;

        if !inner.signaling_ratchets.has_send_session(session_id).await {
            let remote = inner.signaling_keys.fetch_remote_identity(&room).await?;
            let init = inner
                .signaling_ratchets
                .sender_initialization(
                    &local.session_identity,
                    &remote.symmetric_key,
                    &remote.remote_keys,
                    &local.local_keys,
                )
                .await;
            if let Err(e) = init {
                self.failed_sender_init.write().await.insert(room.clone());
                return Err(e);
            }
        }
        self.failed_sender_init.write().await.remove(&room);

        let ratchet_message = inner
            .signaling_ratchets
            .ratchet_encrypt(&task.data, session_id)
            .await?;

        // Carry the handshake blob until the peer's negotiation completes.
        let negotiation_complete = inner
            .registry
            .find(&room)
            .await
            .map(|r| r.cipher_negotiation_state == CipherNegotiationState::Complete)
            .unwrap_or(false);
        let handshake_ciphertext_b64 = if negotiation_complete {
            None
        } else {
            inner
                .signaling_ratchets
                .get_cipher_text(session_id)
                .await
                .ok()
                .map(|ct| BASE64.encode(ct))
        };

        let packet = RatchetMessagePacket {
            sfu_identity: if task.call.is_group() {
                room.clone()
            } else {
                String::new()
            },
            header: SignalingHeader {
                sender_secret_name: local.session_identity.secret_name.clone(),
                sender_device_id: local.session_identity.device_id.clone(),
                connection_id: room.clone(),
                handshake_ciphertext_b64,
            },
            ratchet_message,
            flag: task.flag,
        };

        if task.call.is_group() {
            inner.transport.send_sfu_message(&packet, &task.call).await?;
        } else {
            match task.flag {
                SignalingFlag::Offer => inner.transport.send_offer(&task.call, &packet).await?,
                SignalingFlag::Answer => {
                    inner
                        .transport
                        .send_answer(&task.call, &packet, task.metadata.clone())
                        .await?
                }
                SignalingFlag::Candidate => {
                    inner.transport.send_candidate(&task.call, &packet).await?
                }
                _ => {
                    let recipient = session::remote_parties(inner, &task.call)
                        .into_iter()
                        .next()
                        .ok_or_else(|| {
                            RtcError::InvalidMetadata("call has no recipient".to_string())
                        })?;
                    inner
                        .transport
                        .send_one_to_one_message(&packet, &recipient)
                        .await?
                }
            }
        }

        Ok(packet)
    }

    /// Run a stream task to completion: lazily initialize the recipient
    /// ratchet, decrypt, and dispatch by flag.
    pub async fn submit_stream(
        &self,
        inner: &SessionInner,
        task: StreamTask,
    ) -> Result<(), RtcError> {
        let _guard = self.stream_queue.lock().await;
        let room = normalize_connection_id(&task.packet.header.connection_id);
        let session_id = task.packet.ratchet_message.header.session_id;

        if !inner.signaling_ratchets.has_recv_session(session_id).await {
            let remote = inner.signaling_keys.fetch_remote_identity(&room).await?;
            let local = inner.signaling_keys.fetch_connection_identity(&room).await?;
            let ciphertext = match &task.packet.header.handshake_ciphertext_b64 {
                Some(b64) => BASE64
                    .decode(b64)
                    .map_err(|_| RtcError::MissingCipherText)?,
                None => inner
                    .signaling_keys
                    .fetch_ciphertext(&room)
                    .await
                    .ok_or(RtcError::MissingCipherText)?,
            };
            inner
                .signaling_ratchets
                .recipient_initialization(
                    &remote.session_identity,
                    &local.symmetric_key,
                    &local.local_keys,
                    &remote.remote_keys,
                    &ciphertext,
                )
                .await?;
        }

        let plaintext = inner
            .signaling_ratchets
            .ratchet_decrypt(&task.packet.ratchet_message, session_id)
            .await?;

        match task.packet.flag {
            SignalingFlag::Offer => {
                let desc: SessionDescription = serde_json::from_slice(&plaintext)
                    .map_err(|e| RtcError::SdpParsingFailed(e.to_string()))?;
                session::apply_remote_offer(inner, &task.call, &desc.sdp, None).await?;
            }
            SignalingFlag::Answer => {
                let desc: SessionDescription = serde_json::from_slice(&plaintext)
                    .map_err(|e| RtcError::SdpParsingFailed(e.to_string()))?;
                session::apply_remote_answer(inner, &task.call, &desc.sdp).await?;
            }
            SignalingFlag::Candidate => {
                let candidate: IceCandidate = serde_json::from_slice(&plaintext)
                    .map_err(|e| RtcError::InvalidMetadata(e.to_string()))?;
                session::apply_remote_candidate(inner, &task.call, candidate).await?;
            }
            SignalingFlag::Participants => {
                let participants: Vec<GroupParticipant> = serde_json::from_slice(&plaintext)
                    .map_err(|e| RtcError::InvalidMetadata(e.to_string()))?;
                forward_group(inner, GroupControlMessage::Participants(participants)).await?;
            }
            SignalingFlag::ParticipantDemuxId => {
                let payload: DemuxIdPayload = serde_json::from_slice(&plaintext)
                    .map_err(|e| RtcError::InvalidMetadata(e.to_string()))?;
                forward_group(
                    inner,
                    GroupControlMessage::ParticipantDemuxId {
                        participant_id: payload.participant_id,
                        demux_id: payload.demux_id,
                    },
                )
                .await?;
            }
            SignalingFlag::HandshakeComplete => {
                inner
                    .registry
                    .advance_cipher_state(&room, CipherNegotiationState::Complete)
                    .await;
            }
        }

        Ok(())
    }

    /// Clear the sender-initialization failure latch for a connection.
    pub async fn clear_failure(&self, connection_id: &str) {
        self.failed_sender_init
            .write()
            .await
            .remove(&normalize_connection_id(connection_id));
    }
}

async fn forward_group(inner: &SessionInner, message: GroupControlMessage) -> Result<(), RtcError> {
    let tx = inner.group_control_tx.read().await.clone();
    match tx {
        Some(tx) => {
            let _ = tx.send(message);
            Ok(())
        }
        None => Err(RtcError::MissingGroupCall),
    }
}
