//! Crate-wide error type covering configuration, connection, media,
//! encryption, and call-lifecycle failures.

use thiserror::Error;

/// Error type returned at every public API boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RtcError {
    // ── Configuration ──────────────────────────────────────────────────
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),
    #[error("invalid participant: {0}")]
    InvalidParticipant(String),

    // ── Connection ─────────────────────────────────────────────────────
    #[error("connection not found")]
    ConnectionNotFound,
    #[error("missing RTC connection")]
    MissingRtcConnection,
    #[error("missing group call")]
    MissingGroupCall,
    #[error("socket creation failed: {0}")]
    SocketCreationFailed(String),
    #[error("reconnection failed: {0}")]
    ReconnectionFailed(String),
    #[error("operation timed out")]
    Timeout,

    // ── Media / SDP ────────────────────────────────────────────────────
    #[error("invalid SDP format")]
    InvalidSdpFormat,
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),
    #[error("SDP generation failed: {0}")]
    SdpGenerationFailed(String),
    #[error("SDP parsing failed: {0}")]
    SdpParsingFailed(String),
    #[error("media error: {0}")]
    MediaError(String),

    // ── Encryption ─────────────────────────────────────────────────────
    #[error("missing ciphertext for ratchet initialization")]
    MissingCipherText,
    #[error("missing identity props")]
    MissingProps,
    #[error("missing crypto payload")]
    MissingCryptoPayload,
    #[error("missing session identity")]
    MissingSessionIdentity,
    #[error("encryption failure: {0}")]
    EncryptionFailure(String),

    // ── Call lifecycle ─────────────────────────────────────────────────
    #[error("call was rejected by the remote party")]
    Rejected,
    #[error("call was not answered")]
    Unanswered,
    #[error("call expired")]
    CallExpired,

    /// Failure surfaced by the underlying WebRTC engine.
    #[error("peer connection error: {0}")]
    PeerConnection(String),

    /// Attempted an illegal call state transition.
    #[error("invalid state transition: {0}")]
    InvalidStateTransition(String),
}
