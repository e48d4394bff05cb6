//! SFU group calls: roster management, per-sender key distribution, and
//! fan-out of inbound receiver events to logical participants.
//!
//! A group call runs on a single peer connection toward the SFU. The 1:1
//! ciphertext handshake is skipped; media keys arrive either as control-plane
//! `FrameKey` injections or as pairwise-encrypted sender keys distributed
//! over per-pair signaling ratchets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;
use zeroize::Zeroize;

use crate::api::call::{
    Call, EncryptedSenderKeyMessage, GroupParticipant, IceCandidate, IdentityProps,
    SdpType, SenderKeyPayload, SessionDescription, SignalingFlag,
};
use crate::api::error::RtcError;
use crate::api::keys::{RemoteKeys, SessionIdentity};
use crate::api::peer_connection::MediaKind;
use crate::api::ratchet::{aead_decrypt, aead_encrypt};
use crate::api::registry::{normalize_connection_id, NegotiationPhase};
use crate::api::sdp;
use crate::api::session::{self, RtcSession, SessionInner};
use crate::api::tasks::WriteTask;

/// Group call lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupCallState {
    Idle,
    Joining,
    Joined,
    Ended,
}

/// Events surfaced to the host application.
#[derive(Debug, Clone)]
pub enum GroupCallEvent {
    StateChanged(GroupCallState),
    ParticipantsUpdated(Vec<GroupParticipant>),
    RemoteTrackAdded {
        participant_id: String,
        kind: MediaKind,
        track_id: String,
    },
}

/// Single ingress for everything the SFU control plane delivers.
#[derive(Debug, Clone)]
pub enum GroupControlMessage {
    SfuAnswer {
        sdp: String,
    },
    SfuCandidate {
        candidate: IceCandidate,
    },
    SfuOffer {
        sdp: String,
    },
    Participants(Vec<GroupParticipant>),
    ParticipantDemuxId {
        participant_id: String,
        demux_id: u32,
    },
    FrameKey {
        participant_id: String,
        index: u32,
        key_b64: String,
    },
    ParticipantIdentity {
        participant_id: String,
        props: IdentityProps,
    },
    EncryptedSenderKey(EncryptedSenderKeyMessage),
}

struct GroupMember {
    participant: GroupParticipant,
    identity_props: Option<IdentityProps>,
    /// Pairwise signaling ratchet session toward this member.
    pair_session_id: Option<Uuid>,
    handshake_sent: bool,
}

/// SFU call facade on top of one peer connection.
pub struct GroupCall {
    inner: Arc<SessionInner>,
    call: RwLock<Call>,
    sfu_identity: String,
    local_participant_id: String,
    state: RwLock<GroupCallState>,
    roster: RwLock<HashMap<String, GroupMember>>,
    local_sender_key_index: AtomicU32,
    events_tx: mpsc::UnboundedSender<GroupCallEvent>,
}

impl GroupCall {
    /// Build the facade and register it as the session's group ingress.
    /// Returns the facade and the stream of group events.
    pub async fn new(
        session: &RtcSession,
        call: Call,
        local_participant_id: &str,
        sfu_identity: &str,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<GroupCallEvent>), RtcError> {
        call.validate(true)?;
        if !call.is_group() {
            return Err(RtcError::InvalidMetadata(
                "group calls must have an empty recipient list".to_string(),
            ));
        }
        let inner = session.inner();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        *inner.group_control_tx.write().await = Some(control_tx);
        *inner.group_event_tx.write().await = Some(events_tx.clone());

        let group = Arc::new(Self {
            inner,
            call: RwLock::new(call),
            sfu_identity: sfu_identity.to_string(),
            local_participant_id: local_participant_id.to_string(),
            state: RwLock::new(GroupCallState::Idle),
            roster: RwLock::new(HashMap::new()),
            local_sender_key_index: AtomicU32::new(0),
            events_tx,
        });
        tokio::spawn(control_loop(group.clone(), control_rx));
        Ok((group, events_rx))
    }

    pub async fn state(&self) -> GroupCallState {
        *self.state.read().await
    }

    pub async fn participants(&self) -> Vec<GroupParticipant> {
        self.roster
            .read()
            .await
            .values()
            .map(|m| m.participant.clone())
            .collect()
    }

    /// Local signaling identity props for the group connection, for the host
    /// to distribute to the other participants.
    pub async fn local_identity_props(&self) -> Result<IdentityProps, RtcError> {
        let call = self.call.read().await;
        let room = normalize_connection_id(&call.shared_communication_id);
        let identity = self
            .inner
            .signaling_keys
            .fetch_connection_identity(&room)
            .await?;
        Ok(identity.props())
    }

    /// Join the SFU: create the peer connection (no 1:1 handshake), send the
    /// SDP offer, and enable ICE trickle.
    pub async fn join(&self) -> Result<(), RtcError> {
        self.set_state(GroupCallState::Joining).await;

        let call = self.call.read().await.clone();
        let room = normalize_connection_id(&call.shared_communication_id);
        self.inner
            .transport
            .negotiate_group_identity(&call, &self.sfu_identity)
            .await?;

        let call = session::create_crypto_peer_connection(&self.inner, &call).await?;
        *self.call.write().await = call.clone();
        session::add_local_tracks(&self.inner, &room).await?;
        if self.inner.active_connection_id.read().await.is_none() {
            *self.inner.active_connection_id.write().await = Some(room.clone());
        }

        let record = self
            .inner
            .registry
            .find(&room)
            .await
            .ok_or(RtcError::MissingRtcConnection)?;
        let offer_sdp = record
            .peer_connection
            .create_offer(&session::constraints_for(&call))
            .await
            .map_err(|e| RtcError::SdpGenerationFailed(e.to_string()))?;
        let transformed = sdp::transform(&offer_sdp, call.supports_video)?;
        let desc = SessionDescription::new(SdpType::Offer, &transformed)?;
        record.peer_connection.set_local_description(&desc).await?;
        self.inner
            .registry
            .update(&room, |r| r.negotiation_phase = NegotiationPhase::LocalSet)
            .await;
        self.inner
            .ready_for_candidates
            .store(true, Ordering::SeqCst);

        let data = serde_json::to_vec(&desc)
            .map_err(|e| RtcError::SdpGenerationFailed(e.to_string()))?;
        self.inner
            .tasks
            .submit_write(
                &self.inner,
                WriteTask {
                    data,
                    room_id: room,
                    flag: SignalingFlag::Offer,
                    call,
                    metadata: None,
                },
            )
            .await?;
        Ok(())
    }

    /// Leave the call and tear the connection down.
    pub async fn leave(&self) -> Result<(), RtcError> {
        self.set_state(GroupCallState::Ended).await;
        *self.inner.group_control_tx.write().await = None;
        *self.inner.group_event_tx.write().await = None;
        let mut call = self.call.write().await;
        call.mark_ended();
        session::finish_end_connection_core(&self.inner, &call, false).await
    }

    /// Single control-plane ingress.
    pub async fn handle_control_message(&self, message: GroupControlMessage) -> Result<(), RtcError> {
        match message {
            GroupControlMessage::SfuAnswer { sdp } => {
                let call = self.call.read().await.clone();
                session::apply_remote_answer(&self.inner, &call, &sdp).await?;
                self.set_state(GroupCallState::Joined).await;
                Ok(())
            }
            GroupControlMessage::SfuOffer { sdp } => {
                let call = self.call.read().await.clone();
                session::apply_remote_offer(&self.inner, &call, &sdp, None).await
            }
            GroupControlMessage::SfuCandidate { candidate } => {
                let call = self.call.read().await.clone();
                session::apply_remote_candidate(&self.inner, &call, candidate).await
            }
            GroupControlMessage::Participants(participants) => {
                self.update_participants(participants).await;
                Ok(())
            }
            GroupControlMessage::ParticipantDemuxId {
                participant_id,
                demux_id,
            } => {
                self.set_demux_id(demux_id, &participant_id).await;
                Ok(())
            }
            GroupControlMessage::FrameKey {
                participant_id,
                index,
                key_b64,
            } => {
                let key = BASE64
                    .decode(&key_b64)
                    .map_err(|_| RtcError::MissingCryptoPayload)?;
                self.set_frame_encryption_key(key, index, &participant_id)
            }
            GroupControlMessage::ParticipantIdentity {
                participant_id,
                props,
            } => self.store_participant_identity(&participant_id, props).await,
            GroupControlMessage::EncryptedSenderKey(message) => {
                self.apply_sender_key(message).await
            }
        }
    }

    /// Replace the roster, preserving pairwise ratchet state for retained
    /// participants.
    pub async fn update_participants(&self, participants: Vec<GroupParticipant>) {
        let mut roster = self.roster.write().await;
        let mut next: HashMap<String, GroupMember> = HashMap::new();
        for participant in &participants {
            let member = match roster.remove(&participant.id) {
                Some(mut existing) => {
                    existing.participant = participant.clone();
                    existing
                }
                None => GroupMember {
                    participant: participant.clone(),
                    identity_props: None,
                    pair_session_id: None,
                    handshake_sent: false,
                },
            };
            next.insert(participant.id.clone(), member);
        }
        *roster = next;
        drop(roster);
        let _ = self
            .events_tx
            .send(GroupCallEvent::ParticipantsUpdated(participants));
    }

    /// Update one participant's demux id.
    pub async fn set_demux_id(&self, demux_id: u32, participant_id: &str) {
        let mut roster = self.roster.write().await;
        if let Some(member) = roster.get_mut(participant_id) {
            member.participant.demux_id = Some(demux_id);
        }
        let participants: Vec<GroupParticipant> =
            roster.values().map(|m| m.participant.clone()).collect();
        drop(roster);
        let _ = self
            .events_tx
            .send(GroupCallEvent::ParticipantsUpdated(participants));
    }

    /// Control-plane frame key injection.
    pub fn set_frame_encryption_key(
        &self,
        key: Vec<u8>,
        index: u32,
        participant_id: &str,
    ) -> Result<(), RtcError> {
        self.inner.key_provider.set_key(key, index, participant_id)
    }

    async fn store_participant_identity(
        &self,
        participant_id: &str,
        props: IdentityProps,
    ) -> Result<(), RtcError> {
        if participant_id == self.sfu_identity {
            // The SFU's signaling identity lets encrypted control packets
            // flow over the group connection.
            let call = self.call.read().await;
            let room = normalize_connection_id(&call.shared_communication_id);
            self.inner
                .signaling_keys
                .create_recipient_identity(&room, &props)
                .await?;
            return Ok(());
        }
        let mut roster = self.roster.write().await;
        let member = roster
            .entry(participant_id.to_string())
            .or_insert_with(|| GroupMember {
                participant: GroupParticipant {
                    id: participant_id.to_string(),
                    demux_id: None,
                },
                identity_props: None,
                pair_session_id: None,
                handshake_sent: false,
            });
        member.identity_props = Some(props);
        Ok(())
    }

    /// Rotate the local sender key and distribute it pairwise to every
    /// participant whose identity props are known. The handshake ciphertext
    /// rides along once per pair.
    pub async fn rotate_sender_key(&self) -> Result<u32, RtcError> {
        let call = self.call.read().await.clone();
        let room = normalize_connection_id(&call.shared_communication_id);
        let index = self.local_sender_key_index.fetch_add(1, Ordering::SeqCst);

        let mut key = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        self.inner
            .key_provider
            .set_key(key.clone(), index, &self.local_participant_id)?;

        let local = self
            .inner
            .signaling_keys
            .generate_sender_identity(&room, &self.inner.local.secret_name, &self.inner.local.device_id)
            .await?;

        // Assign pair session ids under the lock, then distribute without it.
        let targets: Vec<(String, IdentityProps, Uuid, bool)> = {
            let mut roster = self.roster.write().await;
            roster
                .values_mut()
                .filter(|m| m.participant.id != self.local_participant_id)
                .filter_map(|m| {
                    let props = m.identity_props.clone()?;
                    let pair_id = *m.pair_session_id.get_or_insert_with(Uuid::new_v4);
                    Some((m.participant.id.clone(), props, pair_id, m.handshake_sent))
                })
                .collect()
        };

        for (member_id, props, pair_id, handshake_sent) in targets {
            let remote_keys = RemoteKeys::from_props(&props)?;
            let salt = BASE64
                .decode(&props.symmetric_key_b64)
                .map_err(|_| RtcError::MissingProps)?;
            let pair_session = SessionIdentity {
                id: pair_id,
                secret_name: self.inner.local.secret_name.clone(),
                device_id: self.inner.local.device_id.clone(),
            };
            self.inner
                .signaling_ratchets
                .sender_initialization(&pair_session, &salt, &remote_keys, &local.local_keys)
                .await?;

            let (mut message_key, number) = self
                .inner
                .signaling_ratchets
                .derive_message_key(pair_id)
                .await?;
            let payload = SenderKeyPayload {
                call_id: call.id,
                sender_participant_id: self.local_participant_id.clone(),
                key_index: index,
                key_b64: BASE64.encode(&key),
            };
            let payload_bytes = serde_json::to_vec(&payload)
                .map_err(|e| RtcError::InvalidMetadata(e.to_string()))?;
            let sealed = aead_encrypt(&message_key, &payload_bytes);
            message_key.zeroize();
            let (nonce, ciphertext) = sealed?;

            let handshake_ciphertext_b64 = if handshake_sent {
                None
            } else {
                Some(BASE64.encode(
                    self.inner
                        .signaling_ratchets
                        .get_cipher_text(pair_id)
                        .await?,
                ))
            };
            let message = EncryptedSenderKeyMessage {
                call_id: call.id,
                from_participant_id: self.local_participant_id.clone(),
                to_participant_id: member_id.clone(),
                session_id: pair_id,
                handshake_ciphertext_b64,
                ratchet_message_number: number,
                nonce_b64: BASE64.encode(&nonce),
                payload_ciphertext_b64: BASE64.encode(&ciphertext),
            };
            let bytes = serde_json::to_vec(&message)
                .map_err(|e| RtcError::InvalidMetadata(e.to_string()))?;
            self.inner
                .transport
                .send_sender_key(bytes, &member_id, &call)
                .await?;

            let mut roster = self.roster.write().await;
            if let Some(member) = roster.get_mut(&member_id) {
                member.handshake_sent = true;
            }
        }
        Ok(index)
    }

    /// Apply an inbound sender-key distribution: initialize the pairwise
    /// recipient ratchet if needed, decrypt, and install the key.
    pub async fn apply_sender_key(
        &self,
        message: EncryptedSenderKeyMessage,
    ) -> Result<(), RtcError> {
        let call = self.call.read().await.clone();
        let room = normalize_connection_id(&call.shared_communication_id);

        let props = {
            let roster = self.roster.read().await;
            roster
                .get(&message.from_participant_id)
                .and_then(|m| m.identity_props.clone())
                .ok_or(RtcError::MissingProps)?
        };

        if !self
            .inner
            .signaling_ratchets
            .has_recv_session(message.session_id)
            .await
        {
            let ciphertext = message
                .handshake_ciphertext_b64
                .as_ref()
                .map(|b64| BASE64.decode(b64).map_err(|_| RtcError::MissingCipherText))
                .transpose()?
                .ok_or(RtcError::MissingCipherText)?;
            let local = self
                .inner
                .signaling_keys
                .fetch_connection_identity(&room)
                .await?;
            let remote_keys = RemoteKeys::from_props(&props)?;
            let session = SessionIdentity {
                id: message.session_id,
                secret_name: message.from_participant_id.clone(),
                device_id: props.device_id.clone(),
            };
            self.inner
                .signaling_ratchets
                .recipient_initialization(
                    &session,
                    &local.symmetric_key,
                    &local.local_keys,
                    &remote_keys,
                    &ciphertext,
                )
                .await?;
        }

        let mut message_key = self
            .inner
            .signaling_ratchets
            .derive_received_message_key(message.session_id, message.ratchet_message_number)
            .await?;
        let nonce = BASE64
            .decode(&message.nonce_b64)
            .map_err(|_| RtcError::MissingCryptoPayload)?;
        let ciphertext = BASE64
            .decode(&message.payload_ciphertext_b64)
            .map_err(|_| RtcError::MissingCryptoPayload)?;
        let opened = aead_decrypt(&message_key, &nonce, &ciphertext);
        message_key.zeroize();
        let payload: SenderKeyPayload = serde_json::from_slice(&opened?)
            .map_err(|_| RtcError::MissingCryptoPayload)?;

        let key = BASE64
            .decode(&payload.key_b64)
            .map_err(|_| RtcError::MissingCryptoPayload)?;
        self.inner
            .key_provider
            .set_key(key, payload.key_index, &payload.sender_participant_id)?;
        tracing::debug!(
            from = %payload.sender_participant_id,
            key_index = payload.key_index,
            "sender key installed"
        );
        Ok(())
    }

    async fn set_state(&self, state: GroupCallState) {
        *self.state.write().await = state;
        let _ = self.events_tx.send(GroupCallEvent::StateChanged(state));
    }
}

async fn control_loop(
    group: Arc<GroupCall>,
    mut rx: mpsc::UnboundedReceiver<GroupControlMessage>,
) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = group.handle_control_message(message).await {
            tracing::warn!(error = %e, "group control message failed");
        }
    }
}
