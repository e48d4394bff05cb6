//! Shared test harness: a scripted fake WebRTC engine that records every
//! operation and lets tests push engine events, plus a recording transport.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use pqs_rtc::api::call::{Call, IceCandidate, Participant, RatchetMessagePacket, SessionDescription};
use pqs_rtc::api::config::{RtcConfiguration, RtcSessionConfig};
use pqs_rtc::api::error::RtcError;
use pqs_rtc::api::frame_crypto::FrameKeySource;
use pqs_rtc::api::peer_connection::{
    CryptorAttach, FrameCryptor, MediaConstraints, MediaKind, MediaTrack, PeerConnection,
    PeerConnectionEvent, PeerConnectionFactory, RtpReceiver, RtpSender, RtpTransceiver,
    StatsReport, TransceiverDirection,
};
use pqs_rtc::api::session::RtcSession;
use pqs_rtc::api::state_machine::EndState;
use pqs_rtc::api::transport::RtcTransport;

/// Canned SDP returned by the fake engine: audio + video sections with
/// directions and an uncapped H.264 level for the transformer to rewrite.
pub const FAKE_SDP: &str = "v=0\r\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=recvonly\r\n\
a=rtpmap:111 opus/48000/2\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 102\r\n\
a=recvonly\r\n\
a=fmtp:102 level-asymmetry-allowed=1;profile-level-id=42e034\r\n";

pub fn alice() -> Participant {
    Participant::new("alice", "Alice", "alice-device-1").unwrap()
}

pub fn bob() -> Participant {
    Participant::new("bob", "Bob", "bob-device-1").unwrap()
}

pub fn charlie() -> Participant {
    Participant::new("charlie", "Charlie", "charlie-device-1").unwrap()
}

// ── Fake engine ────────────────────────────────────────────────────────────

pub struct FakeSender {
    pub kind: MediaKind,
    pub ceilings: Mutex<Option<(Option<u32>, Option<u32>)>>,
}

impl RtpSender for FakeSender {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn set_encoding_ceilings(&self, max_bitrate_bps: Option<u32>, max_framerate: Option<u32>) {
        *self.ceilings.lock().unwrap() = Some((max_bitrate_bps, max_framerate));
    }
}

pub struct FakeReceiver {
    pub kind: MediaKind,
    pub track_id: String,
}

impl RtpReceiver for FakeReceiver {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn track_id(&self) -> String {
        self.track_id.clone()
    }
}

pub struct FakeTransceiver {
    pub kind: MediaKind,
    pub direction: TransceiverDirection,
}

impl RtpTransceiver for FakeTransceiver {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn direction(&self) -> TransceiverDirection {
        self.direction
    }
}

pub struct FakeCryptor {
    pub participant_id: String,
    pub attach: CryptorAttach,
    pub enabled: AtomicBool,
}

impl FrameCryptor for FakeCryptor {
    fn participant_id(&self) -> String {
        self.participant_id.clone()
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

pub struct FakePeerConnection {
    pub connection_id: String,
    pub events: mpsc::UnboundedSender<PeerConnectionEvent>,
    pub local_description: Mutex<Option<SessionDescription>>,
    pub remote_description: Mutex<Option<SessionDescription>>,
    pub added_candidates: Mutex<Vec<IceCandidate>>,
    pub senders: Mutex<Vec<Arc<FakeSender>>>,
    pub transceivers: Mutex<Vec<Arc<FakeTransceiver>>>,
    pub cryptors: Mutex<Vec<Arc<FakeCryptor>>>,
    pub closed: AtomicBool,
    pub fail_offers: AtomicBool,
}

impl FakePeerConnection {
    pub fn emit(&self, event: PeerConnectionEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
    async fn create_offer(&self, _constraints: &MediaConstraints) -> Result<String, RtcError> {
        if self.fail_offers.load(Ordering::SeqCst) {
            return Err(RtcError::SdpGenerationFailed("scripted failure".to_string()));
        }
        Ok(FAKE_SDP.to_string())
    }

    async fn create_answer(&self, _constraints: &MediaConstraints) -> Result<String, RtcError> {
        Ok(FAKE_SDP.to_string())
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), RtcError> {
        *self.local_description.lock().unwrap() = Some(desc.clone());
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), RtcError> {
        *self.remote_description.lock().unwrap() = Some(desc.clone());
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), RtcError> {
        self.added_candidates.lock().unwrap().push(candidate.clone());
        Ok(())
    }

    async fn add_track(
        &self,
        track: Arc<MediaTrack>,
        _stream_ids: Vec<String>,
    ) -> Result<Arc<dyn RtpSender>, RtcError> {
        let sender = Arc::new(FakeSender {
            kind: track.kind,
            ceilings: Mutex::new(None),
        });
        self.senders.lock().unwrap().push(sender.clone());
        Ok(sender)
    }

    async fn senders(&self) -> Vec<Arc<dyn RtpSender>> {
        self.senders
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.clone() as Arc<dyn RtpSender>)
            .collect()
    }

    async fn receivers(&self) -> Vec<Arc<dyn RtpReceiver>> {
        Vec::new()
    }

    async fn add_transceiver(
        &self,
        kind: MediaKind,
        direction: TransceiverDirection,
    ) -> Result<Arc<dyn RtpTransceiver>, RtcError> {
        let transceiver = Arc::new(FakeTransceiver { kind, direction });
        self.transceivers.lock().unwrap().push(transceiver.clone());
        Ok(transceiver)
    }

    async fn transceivers(&self) -> Vec<Arc<dyn RtpTransceiver>> {
        self.transceivers
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.clone() as Arc<dyn RtpTransceiver>)
            .collect()
    }

    async fn create_frame_cryptor(
        &self,
        attach: CryptorAttach,
        participant_id: &str,
        _key_provider: Arc<dyn FrameKeySource>,
    ) -> Result<Arc<dyn FrameCryptor>, RtcError> {
        let cryptor = Arc::new(FakeCryptor {
            participant_id: participant_id.to_string(),
            attach,
            enabled: AtomicBool::new(false),
        });
        self.cryptors.lock().unwrap().push(cryptor.clone());
        Ok(cryptor)
    }

    async fn statistics(&self) -> Result<StatsReport, RtcError> {
        Ok(StatsReport::default())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeEngine {
    pub connections: Mutex<Vec<Arc<FakePeerConnection>>>,
    track_counter: AtomicU32,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connection(&self, connection_id: &str) -> Option<Arc<FakePeerConnection>> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .find(|pc| pc.connection_id == connection_id)
            .cloned()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakeEngine {
    async fn create_peer_connection(
        &self,
        connection_id: &str,
        _config: &RtcConfiguration,
        events: mpsc::UnboundedSender<PeerConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnection>, RtcError> {
        let pc = Arc::new(FakePeerConnection {
            connection_id: connection_id.to_string(),
            events,
            local_description: Mutex::new(None),
            remote_description: Mutex::new(None),
            added_candidates: Mutex::new(Vec::new()),
            senders: Mutex::new(Vec::new()),
            transceivers: Mutex::new(Vec::new()),
            cryptors: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            fail_offers: AtomicBool::new(false),
        });
        self.connections.lock().unwrap().push(pc.clone());
        Ok(pc)
    }

    fn create_track(&self, kind: MediaKind, id: &str) -> Arc<MediaTrack> {
        let n = self.track_counter.fetch_add(1, Ordering::SeqCst);
        Arc::new(MediaTrack::new(&format!("{id}-{n}"), kind))
    }
}

// ── Fake transport ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Sent {
    StartCall(Call),
    CallAnswered(Call),
    CallAnsweredAux(Call),
    Offer(Call, RatchetMessagePacket),
    Answer(Call, RatchetMessagePacket, Option<Vec<u8>>),
    Candidate(Call, RatchetMessagePacket),
    OneToOne(RatchetMessagePacket, Participant),
    Sfu(RatchetMessagePacket, Call),
    Ciphertext {
        recipient: Participant,
        connection_id: String,
        ciphertext: Vec<u8>,
        call: Call,
    },
    SenderKey {
        message: Vec<u8>,
        to_participant_id: String,
        call: Call,
    },
    DidEnd(Call, EndState),
    NegotiateGroupIdentity(Call, String),
}

#[derive(Default)]
pub struct FakeTransport {
    pub sent: Mutex<Vec<Sent>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn all(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    /// Last ciphertext handed to the transport, as opaque bytes.
    pub fn last_ciphertext(&self) -> Option<Vec<u8>> {
        self.all().into_iter().rev().find_map(|s| match s {
            Sent::Ciphertext { ciphertext, .. } => Some(ciphertext),
            _ => None,
        })
    }

    pub fn offers(&self) -> Vec<RatchetMessagePacket> {
        self.all()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Offer(_, packet) => Some(packet),
                _ => None,
            })
            .collect()
    }

    pub fn answers(&self) -> Vec<RatchetMessagePacket> {
        self.all()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Answer(_, packet, _) => Some(packet),
                _ => None,
            })
            .collect()
    }

    pub fn candidates(&self) -> Vec<RatchetMessagePacket> {
        self.all()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Candidate(_, packet) => Some(packet),
                _ => None,
            })
            .collect()
    }

    pub fn sender_keys(&self) -> Vec<(Vec<u8>, String)> {
        self.all()
            .into_iter()
            .filter_map(|s| match s {
                Sent::SenderKey {
                    message,
                    to_participant_id,
                    ..
                } => Some((message, to_participant_id)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl RtcTransport for FakeTransport {
    async fn send_start_call(&self, call: &Call) -> Result<(), RtcError> {
        self.sent.lock().unwrap().push(Sent::StartCall(call.clone()));
        Ok(())
    }

    async fn send_call_answered(&self, call: &Call) -> Result<(), RtcError> {
        self.sent.lock().unwrap().push(Sent::CallAnswered(call.clone()));
        Ok(())
    }

    async fn send_call_answered_aux_device(&self, call: &Call) -> Result<(), RtcError> {
        self.sent
            .lock()
            .unwrap()
            .push(Sent::CallAnsweredAux(call.clone()));
        Ok(())
    }

    async fn send_offer(&self, call: &Call, packet: &RatchetMessagePacket) -> Result<(), RtcError> {
        self.sent
            .lock()
            .unwrap()
            .push(Sent::Offer(call.clone(), packet.clone()));
        Ok(())
    }

    async fn send_answer(
        &self,
        call: &Call,
        packet: &RatchetMessagePacket,
        metadata: Option<Vec<u8>>,
    ) -> Result<(), RtcError> {
        self.sent
            .lock()
            .unwrap()
            .push(Sent::Answer(call.clone(), packet.clone(), metadata));
        Ok(())
    }

    async fn send_candidate(
        &self,
        call: &Call,
        packet: &RatchetMessagePacket,
    ) -> Result<(), RtcError> {
        self.sent
            .lock()
            .unwrap()
            .push(Sent::Candidate(call.clone(), packet.clone()));
        Ok(())
    }

    async fn send_one_to_one_message(
        &self,
        packet: &RatchetMessagePacket,
        recipient: &Participant,
    ) -> Result<(), RtcError> {
        self.sent
            .lock()
            .unwrap()
            .push(Sent::OneToOne(packet.clone(), recipient.clone()));
        Ok(())
    }

    async fn send_sfu_message(
        &self,
        packet: &RatchetMessagePacket,
        call: &Call,
    ) -> Result<(), RtcError> {
        self.sent
            .lock()
            .unwrap()
            .push(Sent::Sfu(packet.clone(), call.clone()));
        Ok(())
    }

    async fn send_ciphertext(
        &self,
        recipient: &Participant,
        connection_id: &str,
        ciphertext: Vec<u8>,
        call: &Call,
    ) -> Result<(), RtcError> {
        self.sent.lock().unwrap().push(Sent::Ciphertext {
            recipient: recipient.clone(),
            connection_id: connection_id.to_string(),
            ciphertext,
            call: call.clone(),
        });
        Ok(())
    }

    async fn send_sender_key(
        &self,
        message: Vec<u8>,
        to_participant_id: &str,
        call: &Call,
    ) -> Result<(), RtcError> {
        self.sent.lock().unwrap().push(Sent::SenderKey {
            message,
            to_participant_id: to_participant_id.to_string(),
            call: call.clone(),
        });
        Ok(())
    }

    async fn did_end(&self, call: &Call, end_state: EndState) {
        self.sent
            .lock()
            .unwrap()
            .push(Sent::DidEnd(call.clone(), end_state));
    }

    async fn negotiate_group_identity(
        &self,
        call: &Call,
        sfu_recipient_id: &str,
    ) -> Result<(), RtcError> {
        self.sent.lock().unwrap().push(Sent::NegotiateGroupIdentity(
            call.clone(),
            sfu_recipient_id.to_string(),
        ));
        Ok(())
    }
}

// ── Session builder ────────────────────────────────────────────────────────

pub fn new_session(local: Participant) -> (RtcSession, Arc<FakeEngine>, Arc<FakeTransport>) {
    let engine = FakeEngine::new();
    let transport = FakeTransport::new();
    let session = RtcSession::new(
        RtcSessionConfig::default(),
        local,
        engine.clone(),
        transport.clone(),
    )
    .unwrap();
    (session, engine, transport)
}
