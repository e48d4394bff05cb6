//! Thin contract over the WebRTC engine.
//!
//! The SDK never links an engine; the host supplies one behind these traits.
//! Every engine callback is flattened into a [`PeerConnectionEvent`] pushed
//! onto the notification channel the SDK hands the factory at creation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::api::call::{IceCandidate, SessionDescription};
use crate::api::config::RtcConfiguration;
use crate::api::error::RtcError;
use crate::api::frame_crypto::FrameKeySource;

// ── Media primitives ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

/// A local or remote media track handle. Capture and rendering live in the
/// engine; the SDK only toggles enablement and tracks identity.
#[derive(Debug)]
pub struct MediaTrack {
    pub id: String,
    pub kind: MediaKind,
    enabled: AtomicBool,
}

impl MediaTrack {
    pub fn new(id: &str, kind: MediaKind) -> Self {
        Self {
            id: id.to_string(),
            kind,
            enabled: AtomicBool::new(true),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

/// Outbound RTP sender handle.
pub trait RtpSender: Send + Sync {
    fn kind(&self) -> MediaKind;
    /// Apply encoder ceilings; `None` leaves a parameter unchanged.
    fn set_encoding_ceilings(&self, max_bitrate_bps: Option<u32>, max_framerate: Option<u32>);
}

/// Inbound RTP receiver handle.
pub trait RtpReceiver: Send + Sync {
    fn kind(&self) -> MediaKind;
    fn track_id(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransceiverDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

/// Unified-plan transceiver handle.
pub trait RtpTransceiver: Send + Sync {
    fn kind(&self) -> MediaKind;
    fn direction(&self) -> TransceiverDirection;
}

// ── Frame cryptor hook ─────────────────────────────────────────────────────

/// Where a frame cryptor attaches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptorAttach {
    Sender { track_id: String },
    Receiver { track_id: String },
}

/// Observer states reported by the engine's cryptor. Advisory: `MissingKey`
/// and `InternalError` do not tear the call down; the key provider's discard
/// policy drops affected frames instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCryptorState {
    New,
    Ok,
    EncryptionFailed,
    DecryptionFailed,
    MissingKey,
    KeyRatcheted,
    InternalError,
}

/// Handle on an engine frame cryptor (AES-GCM per frame).
pub trait FrameCryptor: Send + Sync {
    fn participant_id(&self) -> String;
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
}

// ── Engine events ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPrAnswer,
    HaveRemotePrAnswer,
    Closed,
}

/// Everything the engine reports, flattened onto one channel and correlated
/// back to a connection by id.
#[derive(Debug, Clone)]
pub enum PeerConnectionEvent {
    GatheringStateChanged {
        connection_id: String,
        state: IceGatheringState,
    },
    SignalingStateChanged {
        connection_id: String,
        state: SignalingState,
    },
    AddedStream {
        connection_id: String,
        stream_id: String,
    },
    RemovedStream {
        connection_id: String,
        stream_id: String,
    },
    DidAddReceiver {
        connection_id: String,
        kind: MediaKind,
        stream_ids: Vec<String>,
        track_id: String,
    },
    IceConnectionStateChanged {
        connection_id: String,
        state: IceConnectionState,
    },
    StandardizedIceConnectionStateChanged {
        connection_id: String,
        state: IceConnectionState,
    },
    GeneratedIceCandidate {
        connection_id: String,
        sdp: String,
        sdp_m_line_index: i32,
        sdp_mid: Option<String>,
    },
    IceCandidatesRemoved {
        connection_id: String,
        count: usize,
    },
    StartedReceiving {
        connection_id: String,
    },
    DataChannelOpened {
        connection_id: String,
        label: String,
    },
    DataChannelMessage {
        connection_id: String,
        label: String,
        data: Vec<u8>,
        is_binary: bool,
    },
    ShouldNegotiate {
        connection_id: String,
    },
    FrameCryptorStateChanged {
        connection_id: String,
        participant_id: String,
        state: FrameCryptorState,
    },
}

// ── Stats ──────────────────────────────────────────────────────────────────

/// Options applied when generating an offer or answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub receive_audio: bool,
    pub receive_video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            receive_audio: true,
            receive_video: true,
        }
    }
}

/// Aggregate connection statistics used for adaptive bitrate decisions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsReport {
    pub round_trip_time_ms: f64,
    pub jitter_ms: f64,
    pub packet_loss_percent: f64,
    pub available_outgoing_bitrate_bps: f64,
}

// ── Engine traits ──────────────────────────────────────────────────────────

/// One live peer connection inside the engine.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self, constraints: &MediaConstraints) -> Result<String, RtcError>;
    async fn create_answer(&self, constraints: &MediaConstraints) -> Result<String, RtcError>;
    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), RtcError>;
    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), RtcError>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), RtcError>;
    async fn add_track(
        &self,
        track: Arc<MediaTrack>,
        stream_ids: Vec<String>,
    ) -> Result<Arc<dyn RtpSender>, RtcError>;
    async fn senders(&self) -> Vec<Arc<dyn RtpSender>>;
    async fn receivers(&self) -> Vec<Arc<dyn RtpReceiver>>;
    /// Add a transceiver; new media lines are negotiated `SendRecv`.
    async fn add_transceiver(
        &self,
        kind: MediaKind,
        direction: TransceiverDirection,
    ) -> Result<Arc<dyn RtpTransceiver>, RtcError>;
    async fn transceivers(&self) -> Vec<Arc<dyn RtpTransceiver>>;
    /// Attach an AES-GCM frame cryptor to a sender or receiver, keyed by the
    /// provider for `participant_id`.
    async fn create_frame_cryptor(
        &self,
        attach: CryptorAttach,
        participant_id: &str,
        key_provider: Arc<dyn FrameKeySource>,
    ) -> Result<Arc<dyn FrameCryptor>, RtcError>;
    async fn statistics(&self) -> Result<StatsReport, RtcError>;
    async fn close(&self);
}

/// Engine entry point the host injects at session construction.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Create a peer connection with unified-plan semantics, DSCP enabled,
    /// and continual ICE gathering. Events for the connection are pushed
    /// onto `events` tagged with `connection_id`.
    async fn create_peer_connection(
        &self,
        connection_id: &str,
        config: &RtcConfiguration,
        events: mpsc::UnboundedSender<PeerConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnection>, RtcError>;

    /// Create a local capture track. Capture hardware is the engine's
    /// concern; the SDK only holds the handle.
    fn create_track(&self, kind: MediaKind, id: &str) -> Arc<MediaTrack>;
}
