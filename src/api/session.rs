//! Top-level 1:1 call coordination.
//!
//! `RtcSession` owns both key managers, both ratchet managers, the connection
//! registry, the candidate buffers, and the call state machine. Every public
//! operation serializes through the components' own locks; the session holds
//! no lock across a suspension point.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use crate::api::call::{
    Call, CiphertextBundle, IceCandidate, Participant, SdpType, SessionDescription, SignalingFlag,
};
use crate::api::candidates::CandidateBuffer;
use crate::api::config::{FrameCryptorConfig, RtcConfiguration, RtcSessionConfig};
use crate::api::error::RtcError;
use crate::api::frame_crypto::FrameKeyProvider;
use crate::api::group::{GroupCallEvent, GroupControlMessage};
use crate::api::keys::KeyManager;
use crate::api::notifications;
use crate::api::peer_connection::{
    CryptorAttach, MediaConstraints, MediaKind, PeerConnectionEvent, PeerConnectionFactory,
};
use crate::api::ratchet::RatchetStateManager;
use crate::api::registry::{
    normalize_connection_id, CipherNegotiationState, ConnectionRecord, ConnectionRegistry,
    NegotiationPhase,
};
use crate::api::sdp;
use crate::api::state_machine::{CallDirection, CallMedia, CallState, CallStateMachine, EndState};
use crate::api::tasks::{TaskProcessor, WriteTask};
use crate::api::transport::RtcTransport;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// How long `finish_crypto_session_creation` waits for the remote decision.
const ACCEPTANCE_TIMEOUT: Duration = Duration::from_secs(30);
const ACCEPTANCE_POLL: Duration = Duration::from_millis(100);

/// Remote-decision gate for a pending call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallAnswerState {
    Pending,
    Answered,
    Rejected,
}

pub(crate) type ParticipantResolver =
    Box<dyn Fn(&[String], &str, MediaKind) -> Option<String> + Send + Sync>;
pub(crate) type DataChannelHandler = Box<dyn Fn(&str, &str, &[u8], bool) + Send + Sync>;

/// Shared internals: everything the coordinator, the notification consumer,
/// the task processor, and the group facade operate on.
pub struct SessionInner {
    pub(crate) config: RtcSessionConfig,
    pub(crate) local: Participant,
    pub(crate) engine: Arc<dyn PeerConnectionFactory>,
    pub(crate) transport: Arc<dyn RtcTransport>,
    pub(crate) frame_keys: KeyManager,
    pub(crate) signaling_keys: KeyManager,
    pub(crate) frame_ratchets: RatchetStateManager,
    pub(crate) signaling_ratchets: RatchetStateManager,
    pub(crate) key_provider: Arc<FrameKeyProvider>,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) state_machine: CallStateMachine,
    pub(crate) candidates: CandidateBuffer,
    pub(crate) tasks: TaskProcessor,
    pub(crate) active_connection_id: RwLock<Option<String>>,
    pub(crate) ready_for_candidates: AtomicBool,
    pub(crate) ice_id: AtomicU64,
    pub(crate) last_id: AtomicU64,
    pub(crate) notification_generation: AtomicU64,
    pub(crate) notification_tx: RwLock<mpsc::UnboundedSender<PeerConnectionEvent>>,
    pub(crate) answer_gate: RwLock<HashMap<Uuid, CallAnswerState>>,
    pub(crate) can_answer: RwLock<Option<bool>>,
    pub(crate) teardown_done: RwLock<HashSet<String>>,
    pub(crate) teardown_in_progress: RwLock<HashSet<String>>,
    pub(crate) participant_resolver: RwLock<ParticipantResolver>,
    pub(crate) data_channel_handler: RwLock<Option<DataChannelHandler>>,
    pub(crate) group_control_tx: RwLock<Option<mpsc::UnboundedSender<GroupControlMessage>>>,
    pub(crate) group_event_tx: RwLock<Option<mpsc::UnboundedSender<GroupCallEvent>>>,
}

/// Per-device call session coordinator.
pub struct RtcSession {
    inner: Arc<SessionInner>,
}

impl RtcSession {
    /// Build a session for `local`, wiring in the host's engine and
    /// transport, and start the notification consumer.
    pub fn new(
        config: RtcSessionConfig,
        local: Participant,
        engine: Arc<dyn PeerConnectionFactory>,
        transport: Arc<dyn RtcTransport>,
    ) -> Result<Self, RtcError> {
        config.validate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let key_provider = Arc::new(FrameKeyProvider::new(
            config.frame_encryption_key_mode,
            FrameCryptorConfig {
                ratchet_salt: config.ratchet_salt.clone(),
                ..FrameCryptorConfig::default()
            },
        ));
        let inner = Arc::new(SessionInner {
            config,
            local,
            engine,
            transport,
            frame_keys: KeyManager::new("frame"),
            signaling_keys: KeyManager::new("signaling"),
            frame_ratchets: RatchetStateManager::new("frame"),
            signaling_ratchets: RatchetStateManager::new("signaling"),
            key_provider,
            registry: ConnectionRegistry::new(),
            state_machine: CallStateMachine::new(),
            candidates: CandidateBuffer::new(),
            tasks: TaskProcessor::new(),
            active_connection_id: RwLock::new(None),
            ready_for_candidates: AtomicBool::new(false),
            ice_id: AtomicU64::new(0),
            last_id: AtomicU64::new(0),
            notification_generation: AtomicU64::new(0),
            notification_tx: RwLock::new(tx),
            answer_gate: RwLock::new(HashMap::new()),
            can_answer: RwLock::new(None),
            teardown_done: RwLock::new(HashSet::new()),
            teardown_in_progress: RwLock::new(HashSet::new()),
            participant_resolver: RwLock::new(Box::new(|stream_ids, _track_id, _kind| {
                stream_ids.first().cloned()
            })),
            data_channel_handler: RwLock::new(None),
            group_control_tx: RwLock::new(None),
            group_event_tx: RwLock::new(None),
        });
        tokio::spawn(notifications::consume(inner.clone(), rx, 0));
        Ok(Self { inner })
    }

    pub(crate) fn inner(&self) -> Arc<SessionInner> {
        self.inner.clone()
    }

    /// Observe call lifecycle state (buffered-latest; at most 2 subscribers).
    pub async fn subscribe_state(&self) -> Result<watch::Receiver<CallState>, RtcError> {
        self.inner.state_machine.subscribe().await
    }

    pub async fn current_state(&self) -> CallState {
        self.inner.state_machine.current().await
    }

    /// Announce an outbound call over the transport.
    pub async fn start_call(&self, call: &Call) -> Result<(), RtcError> {
        call.validate(call.is_group())?;
        self.inner.transport.send_start_call(call).await?;
        if matches!(self.inner.state_machine.current().await, CallState::Ready(_)) {
            self.inner
                .state_machine
                .transition(CallState::Connecting(
                    direction_for(&self.inner, call),
                    call.clone(),
                ))
                .await?;
        }
        Ok(())
    }

    /// Create the crypto peer connection for an outbound call and attach
    /// local media. Returns the call with local identity props attached.
    pub async fn initiate_call(&self, call: &Call) -> Result<Call, RtcError> {
        call.validate(call.is_group())?;
        let call = create_crypto_peer_connection(&self.inner, call).await?;
        let room = normalize_connection_id(&call.shared_communication_id);
        add_local_tracks(&self.inner, &room).await?;
        *self.inner.active_connection_id.write().await = Some(room);
        self.inner
            .state_machine
            .transition(CallState::Ready(call.clone()))
            .await?;
        Ok(call)
    }

    /// Ensure identities and the peer connection exist for a call; attaches
    /// local props so the remote side can initialize its ratchets.
    pub async fn create_crypto_peer_connection(&self, call: &Call) -> Result<Call, RtcError> {
        create_crypto_peer_connection(&self.inner, call).await
    }

    /// Answer an inbound call: generate local identities on both axes,
    /// attach props, provision the peer connection, send our handshake
    /// ciphertext, and notify the transport.
    pub async fn answer_call(&self, call: &Call) -> Result<Call, RtcError> {
        call.validate(call.is_group())?;
        ensure_remote_identities(&self.inner, call).await?;
        let call = create_crypto_peer_connection(&self.inner, call).await?;
        let room = normalize_connection_id(&call.shared_communication_id);
        add_local_tracks(&self.inner, &room).await?;
        *self.inner.active_connection_id.write().await = Some(room);
        self.inner
            .answer_gate
            .write()
            .await
            .insert(call.id, CallAnswerState::Answered);
        self.inner
            .state_machine
            .transition(CallState::Ready(call.clone()))
            .await?;
        set_message_key(&self.inner, &call).await?;
        self.inner.transport.send_call_answered(&call).await?;
        self.inner
            .transport
            .send_call_answered_aux_device(&call)
            .await?;
        Ok(call)
    }

    /// Inbound ingress: a handshake ciphertext arrived for a call we did not
    /// initiate the crypto session for yet. Idempotent on the connection.
    pub async fn create_crypto_session(
        &self,
        ciphertext: Vec<u8>,
        call: &Call,
    ) -> Result<Call, RtcError> {
        ensure_remote_identities(&self.inner, call).await?;
        let call = create_crypto_peer_connection(&self.inner, call).await?;
        let room = normalize_connection_id(&call.shared_communication_id);
        if self.inner.active_connection_id.read().await.is_none() {
            *self.inner.active_connection_id.write().await = Some(room);
        }
        receive_ciphertext(&self.inner, &call, ciphertext).await?;
        Ok(call)
    }

    /// Outbound-side completion: the remote's handshake ciphertext arrived.
    /// Initializes the recipient ratchets, runs our own sender path, then
    /// waits up to 30 s for the remote decision before building the offer.
    pub async fn finish_crypto_session_creation(
        &self,
        ciphertext: Vec<u8>,
        call: &Call,
    ) -> Result<Call, RtcError> {
        let inner = &self.inner;
        ensure_remote_identities(inner, call).await?;
        let room = normalize_connection_id(&call.shared_communication_id);
        receive_ciphertext(inner, call, ciphertext).await?;

        let decision = wait_for_answer_decision(inner, call.id).await;
        match decision {
            CallAnswerState::Answered => {}
            CallAnswerState::Rejected => {
                let mut ended = call.clone();
                ended.mark_rejected();
                let _ = inner
                    .state_machine
                    .transition(CallState::Ended(
                        EndState::PartnerInitiatedRejected,
                        ended.clone(),
                    ))
                    .await;
                finish_end_connection_core(inner, &ended, false).await?;
                return Err(RtcError::Rejected);
            }
            CallAnswerState::Pending => {
                let mut ended = call.clone();
                ended.mark_unanswered();
                let _ = inner
                    .state_machine
                    .transition(CallState::Ended(
                        EndState::PartnerInitiatedUnanswered,
                        ended.clone(),
                    ))
                    .await;
                finish_end_connection_core(inner, &ended, false).await?;
                return Err(RtcError::Unanswered);
            }
        }

        let record = inner
            .registry
            .find(&room)
            .await
            .ok_or(RtcError::MissingRtcConnection)?;
        let constraints = constraints_for(call);
        let offer_sdp = match record.peer_connection.create_offer(&constraints).await {
            Ok(sdp) => sdp,
            Err(e) => return Err(fail_call(inner, call, record.direction, e).await),
        };
        let transformed = sdp::transform(&offer_sdp, call.supports_video)?;
        let desc = SessionDescription::new(SdpType::Offer, &transformed)?;
        if let Err(e) = record.peer_connection.set_local_description(&desc).await {
            return Err(fail_call(inner, call, record.direction, e).await);
        }
        inner
            .registry
            .update(&room, |r| r.negotiation_phase = NegotiationPhase::LocalSet)
            .await;
        let data =
            serde_json::to_vec(&desc).map_err(|e| RtcError::SdpGenerationFailed(e.to_string()))?;
        inner
            .tasks
            .submit_write(
                inner,
                WriteTask {
                    data,
                    room_id: room,
                    flag: SignalingFlag::Offer,
                    call: call.clone(),
                    metadata: None,
                },
            )
            .await?;
        Ok(call.clone())
    }

    /// Inbound SDP offer (already decrypted by the host or the stream task).
    pub async fn handle_offer(
        &self,
        call: &Call,
        sdp: &str,
        metadata: Option<Vec<u8>>,
    ) -> Result<(), RtcError> {
        apply_remote_offer(&self.inner, call, sdp, metadata).await
    }

    /// Inbound SDP answer.
    pub async fn handle_answer(&self, call: &Call, sdp: &str) -> Result<(), RtcError> {
        apply_remote_answer(&self.inner, call, sdp).await
    }

    /// Inbound ICE candidate.
    pub async fn handle_candidate(
        &self,
        call: &Call,
        candidate: IceCandidate,
    ) -> Result<(), RtcError> {
        apply_remote_candidate(&self.inner, call, candidate).await
    }

    /// Inbound encrypted signaling packet.
    pub async fn handle_packet(
        &self,
        packet: crate::api::call::RatchetMessagePacket,
        call: &Call,
    ) -> Result<(), RtcError> {
        self.inner
            .tasks
            .submit_stream(
                &self.inner,
                crate::api::tasks::StreamTask {
                    sender_secret_name: Some(packet.header.sender_secret_name.clone()),
                    sender_device_id: Some(packet.header.sender_device_id.clone()),
                    packet,
                    call: call.clone(),
                },
            )
            .await
    }

    /// Default decision applied when a call has no explicit answer state.
    pub async fn set_can_answer(&self, can_answer: bool) {
        *self.inner.can_answer.write().await = Some(can_answer);
    }

    /// Record the remote decision for a pending call.
    pub async fn set_call_answer_state(&self, state: CallAnswerState, call_id: Uuid) {
        self.inner.answer_gate.write().await.insert(call_id, state);
    }

    /// Mute or unmute the local audio track on the active connection.
    pub async fn set_muted(&self, muted: bool) -> Result<(), RtcError> {
        let record = active_record(&self.inner).await?;
        match record.local_audio_track {
            Some(track) => {
                track.set_enabled(!muted);
                Ok(())
            }
            None => Err(RtcError::MediaError("no local audio track".to_string())),
        }
    }

    /// Enable or disable the local video track on the active connection.
    pub async fn set_video_enabled(&self, enabled: bool) -> Result<(), RtcError> {
        let record = active_record(&self.inner).await?;
        match record.local_video_track {
            Some(track) => {
                track.set_enabled(enabled);
                Ok(())
            }
            None => Err(RtcError::MediaError("no local video track".to_string())),
        }
    }

    /// Override how receiver tracks resolve to participant ids.
    pub async fn set_participant_resolver(&self, resolver: ParticipantResolver) {
        *self.inner.participant_resolver.write().await = resolver;
    }

    /// Install the handler invoked for inbound data channel messages.
    pub async fn set_data_channel_handler(&self, handler: DataChannelHandler) {
        *self.inner.data_channel_handler.write().await = Some(handler);
    }

    /// End a call locally: terminal state, teardown, transport notice.
    pub async fn end_call(&self, call: &Call) -> Result<(), RtcError> {
        let mut ended = call.clone();
        ended.mark_ended();
        let _ = self
            .inner
            .state_machine
            .transition(CallState::Ended(EndState::UserInitiated, ended.clone()))
            .await;
        finish_end_connection_core(&self.inner, &ended, false).await?;
        self.inner
            .transport
            .did_end(&ended, EndState::UserInitiated)
            .await;
        Ok(())
    }

    /// Tear down one connection. Effectively-once per teardown key unless
    /// `force` is set.
    pub async fn finish_end_connection(&self, call: &Call, force: bool) -> Result<(), RtcError> {
        finish_end_connection_core(&self.inner, call, force).await
    }

    /// Full shutdown: cancel the notification consumer, drop all ratchets,
    /// identities, and connections, and reset the state machine.
    pub async fn shutdown(&self, with: Option<&Call>) -> Result<(), RtcError> {
        shutdown_core(&self.inner, with).await
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.registry.len().await
    }

    /// Crypto handshake progress for a connection, if it is live.
    pub async fn cipher_negotiation_state(
        &self,
        connection_id: &str,
    ) -> Option<CipherNegotiationState> {
        self.inner
            .registry
            .find(connection_id)
            .await
            .map(|r| r.cipher_negotiation_state)
    }

    /// Whether either key manager still holds material for a connection.
    pub async fn has_identity(&self, connection_id: &str) -> bool {
        let room = normalize_connection_id(connection_id);
        self.inner.frame_keys.has_connection(&room).await
            || self.inner.signaling_keys.has_connection(&room).await
    }

    /// The media frame key provider backing this session's cryptors.
    pub fn key_provider(&self) -> Arc<FrameKeyProvider> {
        self.inner.key_provider.clone()
    }
}

// ── Core operations shared with the consumer and task processor ───────────

/// The devices on the far side of a call: the recipients when we placed it,
/// the sender when we received it.
pub(crate) fn remote_parties(inner: &SessionInner, call: &Call) -> Vec<Participant> {
    let outbound = call.sender.secret_name == inner.local.secret_name
        && call.sender.device_id == inner.local.device_id;
    if outbound {
        call.recipients.clone()
    } else {
        vec![call.sender.clone()]
    }
}

/// Offer/answer options for a call: audio always, video when supported.
pub(crate) fn constraints_for(call: &Call) -> MediaConstraints {
    MediaConstraints {
        receive_audio: true,
        receive_video: call.supports_video,
    }
}

pub(crate) fn direction_for(inner: &SessionInner, call: &Call) -> CallDirection {
    let media = if call.supports_video {
        CallMedia::Video
    } else {
        CallMedia::Voice
    };
    let outbound = call.sender.secret_name == inner.local.secret_name
        && call.sender.device_id == inner.local.device_id;
    if outbound {
        CallDirection::Outbound(media)
    } else {
        CallDirection::Inbound(media)
    }
}

async fn active_record(inner: &SessionInner) -> Result<ConnectionRecord, RtcError> {
    let active = inner
        .active_connection_id
        .read()
        .await
        .clone()
        .ok_or(RtcError::ConnectionNotFound)?;
    inner
        .registry
        .find(&active)
        .await
        .ok_or(RtcError::ConnectionNotFound)
}

/// Mark a call failed, tear it down, and return the original error.
pub(crate) async fn fail_call(
    inner: &SessionInner,
    call: &Call,
    direction: CallDirection,
    error: RtcError,
) -> RtcError {
    let mut failed = call.clone();
    failed.mark_failed();
    let _ = inner
        .state_machine
        .transition(CallState::Failed(
            Some(direction),
            failed.clone(),
            error.to_string(),
        ))
        .await;
    if let Err(teardown_err) = finish_end_connection_core(inner, &failed, false).await {
        tracing::warn!(error = %teardown_err, "teardown after failure also failed");
    }
    error
}

async fn ensure_local_identities(inner: &SessionInner, call: &Call) -> Result<Call, RtcError> {
    let room = normalize_connection_id(&call.shared_communication_id);
    let frame_identity = inner
        .frame_keys
        .generate_sender_identity(&room, &inner.local.secret_name, &inner.local.device_id)
        .await?;
    let signaling_identity = inner
        .signaling_keys
        .generate_sender_identity(&room, &inner.local.secret_name, &inner.local.device_id)
        .await?;
    let mut call = call.clone();
    call.frame_identity_props = Some(frame_identity.props());
    call.signaling_identity_props = Some(signaling_identity.props());
    Ok(call)
}

/// Store the remote identities advertised on an inbound call. Props that
/// describe the local device (already-rewritten calls) are ignored.
pub(crate) async fn ensure_remote_identities(
    inner: &SessionInner,
    call: &Call,
) -> Result<(), RtcError> {
    let room = normalize_connection_id(&call.shared_communication_id);
    let is_local = |props: &crate::api::call::IdentityProps| {
        props.secret_name == inner.local.secret_name && props.device_id == inner.local.device_id
    };
    if inner.frame_keys.fetch_remote_identity(&room).await.is_err() {
        let props = call
            .frame_identity_props
            .as_ref()
            .ok_or(RtcError::MissingProps)?;
        if !is_local(props) {
            inner.frame_keys.create_recipient_identity(&room, props).await?;
        }
    }
    if inner
        .signaling_keys
        .fetch_remote_identity(&room)
        .await
        .is_err()
    {
        let props = call
            .signaling_identity_props
            .as_ref()
            .ok_or(RtcError::MissingProps)?;
        if !is_local(props) {
            inner
                .signaling_keys
                .create_recipient_identity(&room, props)
                .await?;
        }
    }
    Ok(())
}

pub(crate) async fn create_crypto_peer_connection(
    inner: &SessionInner,
    call: &Call,
) -> Result<Call, RtcError> {
    call.validate(call.is_group())?;
    let room = normalize_connection_id(&call.shared_communication_id);
    let call = ensure_local_identities(inner, call).await?;

    if inner.registry.find(&room).await.is_some() {
        return Ok(call);
    }

    let config = RtcConfiguration::from_session_config(&inner.config);
    let events = inner.notification_tx.read().await.clone();
    let pc = inner
        .engine
        .create_peer_connection(&room, &config, events)
        .await?;
    let direction = direction_for(inner, &call);
    inner
        .registry
        .insert(ConnectionRecord::new(&room, pc, call.clone(), direction))
        .await;
    tracing::info!(connection_id = %room, "peer connection created");
    Ok(call)
}

pub(crate) async fn add_local_tracks(inner: &SessionInner, room: &str) -> Result<(), RtcError> {
    let record = inner
        .registry
        .find(room)
        .await
        .ok_or(RtcError::MissingRtcConnection)?;
    let stream_id = inner.local.secret_name.clone();

    if record.local_audio_track.is_none() {
        let track = inner
            .engine
            .create_track(MediaKind::Audio, &format!("{room}-audio"));
        record
            .peer_connection
            .add_track(track.clone(), vec![stream_id.clone()])
            .await?;
        inner
            .registry
            .update(room, |r| r.local_audio_track = Some(track))
            .await;
    }
    if record.call.supports_video && record.local_video_track.is_none() {
        let track = inner
            .engine
            .create_track(MediaKind::Video, &format!("{room}-video"));
        record
            .peer_connection
            .add_track(track.clone(), vec![stream_id])
            .await?;
        inner
            .registry
            .update(room, |r| r.local_video_track = Some(track))
            .await;
    }
    ensure_sender_cryptors(inner, room).await
}

/// Create sender frame cryptors for any local track that lacks one.
/// Idempotent; also called by the notification consumer on `AddedStream`.
pub(crate) async fn ensure_sender_cryptors(
    inner: &SessionInner,
    room: &str,
) -> Result<(), RtcError> {
    let record = match inner.registry.find(room).await {
        Some(r) => r,
        None => return Err(RtcError::MissingRtcConnection),
    };
    let participant_id = inner.local.secret_name.clone();
    let provider: Arc<dyn crate::api::frame_crypto::FrameKeySource> = inner.key_provider.clone();

    if record.audio_sender_cryptor.is_none() {
        if let Some(track) = &record.local_audio_track {
            let cryptor = record
                .peer_connection
                .create_frame_cryptor(
                    CryptorAttach::Sender {
                        track_id: track.id.clone(),
                    },
                    &participant_id,
                    provider.clone(),
                )
                .await?;
            cryptor.set_enabled(inner.config.enable_encryption);
            inner
                .registry
                .update(room, |r| r.audio_sender_cryptor = Some(cryptor))
                .await;
        }
    }
    if record.video_sender_cryptor.is_none() {
        if let Some(track) = &record.local_video_track {
            let cryptor = record
                .peer_connection
                .create_frame_cryptor(
                    CryptorAttach::Sender {
                        track_id: track.id.clone(),
                    },
                    &participant_id,
                    provider,
                )
                .await?;
            cryptor.set_enabled(inner.config.enable_encryption);
            inner
                .registry
                .update(room, |r| r.video_sender_cryptor = Some(cryptor))
                .await;
        }
    }
    Ok(())
}

/// Sender half of the crypto handshake: initialize both sender ratchets,
/// install the local media frame key, and ship the handshake ciphertext to
/// every recipient.
pub(crate) async fn set_message_key(inner: &SessionInner, call: &Call) -> Result<(), RtcError> {
    let room = normalize_connection_id(&call.shared_communication_id);
    let local_frame = inner.frame_keys.fetch_connection_identity(&room).await?;
    let local_signaling = inner.signaling_keys.fetch_connection_identity(&room).await?;
    let remote_frame = inner.frame_keys.fetch_remote_identity(&room).await?;
    let remote_signaling = inner.signaling_keys.fetch_remote_identity(&room).await?;

    let fresh_frame = inner
        .frame_ratchets
        .sender_initialization(
            &local_frame.session_identity,
            &remote_frame.symmetric_key,
            &remote_frame.remote_keys,
            &local_frame.local_keys,
        )
        .await?;
    inner
        .signaling_ratchets
        .sender_initialization(
            &local_signaling.session_identity,
            &remote_signaling.symmetric_key,
            &remote_signaling.remote_keys,
            &local_signaling.local_keys,
        )
        .await?;
    inner.tasks.clear_failure(&room).await;

    if fresh_frame {
        let (key, index) = inner
            .frame_ratchets
            .derive_message_key(local_frame.session_identity.id)
            .await?;
        inner
            .key_provider
            .set_key(key.to_vec(), index, &inner.local.secret_name)?;
    }

    let state = inner
        .registry
        .find(&room)
        .await
        .map(|r| r.cipher_negotiation_state)
        .unwrap_or(CipherNegotiationState::Waiting);
    if state == CipherNegotiationState::Complete {
        return Ok(());
    }

    let frame_ct = inner
        .frame_ratchets
        .get_cipher_text(local_frame.session_identity.id)
        .await?;
    let signaling_ct = inner
        .signaling_ratchets
        .get_cipher_text(local_signaling.session_identity.id)
        .await?;
    let bundle = CiphertextBundle {
        frame_b64: BASE64.encode(frame_ct),
        signaling_b64: BASE64.encode(signaling_ct),
    }
    .encode()?;

    for recipient in remote_parties(inner, call) {
        inner
            .transport
            .send_ciphertext(&recipient, &room, bundle.clone(), call)
            .await?;
    }

    let next = if state == CipherNegotiationState::SetRecipientKey {
        CipherNegotiationState::Complete
    } else {
        CipherNegotiationState::SetSenderKey
    };
    inner.registry.advance_cipher_state(&room, next).await;
    Ok(())
}

/// Receiver half of the crypto handshake: buffer the ciphertext, attempt
/// recipient ratchet setup, and advance the negotiation state. A transition
/// that lands in `SetRecipientKey` triggers the local sender path so both
/// sides converge on `Complete`.
pub(crate) async fn receive_ciphertext(
    inner: &SessionInner,
    call: &Call,
    ciphertext: Vec<u8>,
) -> Result<(), RtcError> {
    let room = normalize_connection_id(&call.shared_communication_id);
    let bundle = CiphertextBundle::decode(&ciphertext)?;
    let frame_ct = BASE64
        .decode(&bundle.frame_b64)
        .map_err(|_| RtcError::MissingCipherText)?;
    let signaling_ct = BASE64
        .decode(&bundle.signaling_b64)
        .map_err(|_| RtcError::MissingCipherText)?;
    inner.frame_keys.store_ciphertext(&room, frame_ct).await;
    inner
        .signaling_keys
        .store_ciphertext(&room, signaling_ct)
        .await;

    let initialized = try_complete_recipient_setup(inner, &room).await?;
    if !initialized {
        // Identities not present yet; the ciphertext stays buffered and the
        // setup re-runs when the receiver or props arrive.
        return Ok(());
    }

    let state = inner
        .registry
        .find(&room)
        .await
        .map(|r| r.cipher_negotiation_state)
        .unwrap_or(CipherNegotiationState::Waiting);
    match state {
        CipherNegotiationState::Waiting => {
            inner
                .registry
                .advance_cipher_state(&room, CipherNegotiationState::SetRecipientKey)
                .await;
            set_message_key(inner, call).await?;
        }
        CipherNegotiationState::SetSenderKey => {
            inner
                .registry
                .advance_cipher_state(&room, CipherNegotiationState::Complete)
                .await;
        }
        CipherNegotiationState::SetRecipientKey | CipherNegotiationState::Complete => {}
    }
    Ok(())
}

/// Initialize the recipient ratchets from buffered ciphertext once local and
/// remote identities are both present. Returns false when material is still
/// missing; errors leave the negotiation state unchanged so the handshake
/// can be retried when more material arrives.
pub(crate) async fn try_complete_recipient_setup(
    inner: &SessionInner,
    room: &str,
) -> Result<bool, RtcError> {
    let (local_frame, remote_frame) = match (
        inner.frame_keys.fetch_connection_identity(room).await,
        inner.frame_keys.fetch_remote_identity(room).await,
    ) {
        (Ok(l), Ok(r)) => (l, r),
        _ => return Ok(false),
    };
    let (local_signaling, remote_signaling) = match (
        inner.signaling_keys.fetch_connection_identity(room).await,
        inner.signaling_keys.fetch_remote_identity(room).await,
    ) {
        (Ok(l), Ok(r)) => (l, r),
        _ => return Ok(false),
    };
    let frame_ct = match inner.frame_keys.fetch_ciphertext(room).await {
        Some(ct) => ct,
        None => return Ok(false),
    };
    let signaling_ct = match inner.signaling_keys.fetch_ciphertext(room).await {
        Some(ct) => ct,
        None => return Ok(false),
    };

    let fresh = inner
        .frame_ratchets
        .recipient_initialization(
            &remote_frame.session_identity,
            &local_frame.symmetric_key,
            &local_frame.local_keys,
            &remote_frame.remote_keys,
            &frame_ct,
        )
        .await?;
    inner
        .signaling_ratchets
        .recipient_initialization(
            &remote_signaling.session_identity,
            &local_signaling.symmetric_key,
            &local_signaling.local_keys,
            &remote_signaling.remote_keys,
            &signaling_ct,
        )
        .await?;

    if fresh {
        let key = inner
            .frame_ratchets
            .derive_received_message_key(remote_frame.session_identity.id, 0)
            .await?;
        inner.key_provider.set_key(
            key.to_vec(),
            0,
            &remote_frame.session_identity.secret_name,
        )?;
    }
    Ok(true)
}

pub(crate) async fn apply_remote_offer(
    inner: &SessionInner,
    call: &Call,
    sdp: &str,
    metadata: Option<Vec<u8>>,
) -> Result<(), RtcError> {
    let room = normalize_connection_id(&call.shared_communication_id);
    let record = inner
        .registry
        .find(&room)
        .await
        .ok_or(RtcError::MissingRtcConnection)?;

    let transformed = sdp::transform(sdp, call.supports_video)?;
    let desc = SessionDescription::new(SdpType::Offer, &transformed)?;
    if let Err(e) = record.peer_connection.set_remote_description(&desc).await {
        return Err(fail_call(inner, call, record.direction, e).await);
    }
    inner
        .registry
        .update(&room, |r| r.negotiation_phase = NegotiationPhase::RemoteSet)
        .await;

    for candidate in inner.candidates.drain(&room).await {
        record.peer_connection.add_ice_candidate(&candidate).await?;
    }

    let answer_sdp = match record.peer_connection.create_answer(&constraints_for(call)).await {
        Ok(sdp) => sdp,
        Err(e) => return Err(fail_call(inner, call, record.direction, e).await),
    };
    let answer_transformed = sdp::transform(&answer_sdp, call.supports_video)?;
    let answer = SessionDescription::new(SdpType::Answer, &answer_transformed)?;
    if let Err(e) = record.peer_connection.set_local_description(&answer).await {
        return Err(fail_call(inner, call, record.direction, e).await);
    }

    if matches!(inner.state_machine.current().await, CallState::Ready(_)) {
        inner
            .state_machine
            .transition(CallState::Connecting(record.direction, call.clone()))
            .await?;
    }

    inner.ready_for_candidates.store(true, Ordering::SeqCst);
    flush_outbound_candidates(inner, &room, call).await;

    let data =
        serde_json::to_vec(&answer).map_err(|e| RtcError::SdpGenerationFailed(e.to_string()))?;
    inner
        .tasks
        .submit_write(
            inner,
            WriteTask {
                data,
                room_id: room,
                flag: SignalingFlag::Answer,
                call: call.clone(),
                metadata,
            },
        )
        .await?;
    Ok(())
}

pub(crate) async fn apply_remote_answer(
    inner: &SessionInner,
    call: &Call,
    sdp: &str,
) -> Result<(), RtcError> {
    let room = normalize_connection_id(&call.shared_communication_id);
    let record = inner
        .registry
        .find(&room)
        .await
        .ok_or(RtcError::MissingRtcConnection)?;
    sdp::validate(sdp)?;
    let desc = SessionDescription::new(SdpType::Answer, sdp)?;
    if let Err(e) = record.peer_connection.set_remote_description(&desc).await {
        return Err(fail_call(inner, call, record.direction, e).await);
    }
    inner
        .registry
        .update(&room, |r| r.negotiation_phase = NegotiationPhase::RemoteSet)
        .await;

    for candidate in inner.candidates.drain(&room).await {
        record.peer_connection.add_ice_candidate(&candidate).await?;
    }
    inner.ready_for_candidates.store(true, Ordering::SeqCst);
    flush_outbound_candidates(inner, &room, call).await;
    Ok(())
}

pub(crate) async fn apply_remote_candidate(
    inner: &SessionInner,
    call: &Call,
    candidate: IceCandidate,
) -> Result<(), RtcError> {
    let room = normalize_connection_id(&call.shared_communication_id);
    inner.candidates.feed(&room, candidate).await;
    // Before the remote description is set the candidate just stays queued;
    // the drain happens when set_remote completes.
    if let Some(record) = inner.registry.find(&room).await {
        if record.negotiation_phase == NegotiationPhase::RemoteSet {
            for pending in inner.candidates.drain(&room).await {
                record.peer_connection.add_ice_candidate(&pending).await?;
            }
        }
    }
    Ok(())
}

/// Send every queued outbound candidate in generation order. Send failures
/// are logged and the candidate is dropped.
pub(crate) async fn flush_outbound_candidates(inner: &SessionInner, room: &str, call: &Call) {
    for candidate in inner.candidates.drain_outbound(room).await {
        let data = match serde_json::to_vec(&candidate) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode outbound candidate");
                continue;
            }
        };
        let task = WriteTask {
            data,
            room_id: room.to_string(),
            flag: SignalingFlag::Candidate,
            call: call.clone(),
            metadata: None,
        };
        if let Err(e) = inner.tasks.submit_write(inner, task).await {
            tracing::warn!(error = %e, candidate_id = candidate.id, "dropping outbound candidate");
        }
    }
}

async fn wait_for_answer_decision(inner: &SessionInner, call_id: Uuid) -> CallAnswerState {
    let deadline = tokio::time::Instant::now() + ACCEPTANCE_TIMEOUT;
    loop {
        let explicit = inner.answer_gate.read().await.get(&call_id).copied();
        let state = match explicit {
            Some(state) => state,
            None => match *inner.can_answer.read().await {
                Some(true) => CallAnswerState::Answered,
                Some(false) => CallAnswerState::Rejected,
                None => CallAnswerState::Pending,
            },
        };
        if state != CallAnswerState::Pending {
            return state;
        }
        if tokio::time::Instant::now() >= deadline {
            return CallAnswerState::Pending;
        }
        sleep(ACCEPTANCE_POLL).await;
    }
}

/// Idempotent teardown of one connection, deduplicated on the call's
/// teardown key.
pub(crate) async fn finish_end_connection_core(
    inner: &SessionInner,
    call: &Call,
    force: bool,
) -> Result<(), RtcError> {
    let room = normalize_connection_id(&call.shared_communication_id);
    let key = call.teardown_key(&room);

    if !force {
        if inner.teardown_done.read().await.contains(&key)
            || inner.teardown_in_progress.read().await.contains(&key)
        {
            return Ok(());
        }
    }
    inner.teardown_in_progress.write().await.insert(key.clone());

    {
        let mut active = inner.active_connection_id.write().await;
        if active.as_deref() == Some(room.as_str()) {
            *active = None;
        }
    }

    if let Some(record) = inner.registry.find(&room).await {
        if let Some(track) = &record.local_video_track {
            track.set_enabled(false);
        }
        if let Some(track) = &record.local_audio_track {
            track.set_enabled(false);
        }
        if let Some(cryptor) = &record.video_sender_cryptor {
            cryptor.set_enabled(false);
        }
        if let Some(cryptor) = &record.audio_sender_cryptor {
            cryptor.set_enabled(false);
        }
        for cryptor in record.video_receiver_cryptors_by_participant.values() {
            cryptor.set_enabled(false);
        }
        for cryptor in record.audio_receiver_cryptors_by_participant.values() {
            cryptor.set_enabled(false);
        }
        // Close only this call's peer connection; never a fallback "any
        // remaining" connection, which could kill the next call's.
        record.peer_connection.close().await;
    }

    inner.frame_keys.remove_connection_identity(&room).await;
    inner.signaling_keys.remove_connection_identity(&room).await;
    inner.registry.remove(&room).await;
    inner.candidates.clear(&room).await;
    inner.answer_gate.write().await.remove(&call.id);
    inner.tasks.clear_failure(&room).await;

    inner.ice_id.store(0, Ordering::SeqCst);
    inner.last_id.store(0, Ordering::SeqCst);
    inner.ready_for_candidates.store(false, Ordering::SeqCst);

    inner.teardown_in_progress.write().await.remove(&key);
    inner.teardown_done.write().await.insert(key);
    tracing::info!(connection_id = %room, "connection torn down");
    Ok(())
}

pub(crate) async fn shutdown_core(
    inner: &Arc<SessionInner>,
    with: Option<&Call>,
) -> Result<(), RtcError> {
    if let Some(call) = with {
        finish_end_connection_core(inner, call, true).await?;
    }

    // Replace the notification stream: the old consumer drains and exits on
    // generation mismatch, the fresh consumer serves the next call.
    let generation = inner.notification_generation.fetch_add(1, Ordering::SeqCst) + 1;
    let (tx, rx) = mpsc::unbounded_channel();
    *inner.notification_tx.write().await = tx;
    tokio::spawn(notifications::consume(inner.clone(), rx, generation));

    inner.frame_ratchets.shutdown().await;
    inner.signaling_ratchets.shutdown().await;
    inner.frame_keys.clear_all().await;
    inner.signaling_keys.clear_all().await;
    for record in inner.registry.remove_all().await {
        record.peer_connection.close().await;
    }
    inner.candidates.clear_all().await;
    inner.key_provider.clear();
    inner.answer_gate.write().await.clear();
    inner.teardown_done.write().await.clear();
    inner.teardown_in_progress.write().await.clear();
    *inner.active_connection_id.write().await = None;
    inner.ready_for_candidates.store(false, Ordering::SeqCst);
    inner.ice_id.store(0, Ordering::SeqCst);
    inner.last_id.store(0, Ordering::SeqCst);
    inner.state_machine.reset().await;
    tracing::info!("session shut down");
    Ok(())
}
