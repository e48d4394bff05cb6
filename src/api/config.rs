//! Session and frame-cryptor configuration.
//!
//! `RtcSessionConfig` is what the host hands the SDK at construction; the
//! frame-cryptor constants are wire-level and must not change between peers.

use serde::{Deserialize, Serialize};

use crate::api::error::RtcError;

/// Magic bytes prefixed to unencrypted frames so receivers can pass them
/// through the cryptor untouched (keyframe headers, RTX padding).
pub const UNCRYPTED_MAGIC_BYTES: &[u8] = b"PQSRTCMagicBytes";

/// Fixed HKDF salt for media frame key ratcheting.
pub const FRAME_RATCHET_SALT: &[u8] = b"PQSRTCFrameEncryptionSalt";

/// Bounded number of key indices retained per ring.
pub const KEY_RING_SIZE: usize = 16;

/// How media frame keys are scoped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKeyMode {
    /// One ring for the whole call; participant id is ignored on lookup.
    Shared,
    /// An independent ring per participant.
    PerParticipant,
}

/// Encoder ceilings and stepping thresholds for SFU video senders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SfuVideoQualityProfile {
    pub starting_bitrate_bps: u32,
    pub min_bitrate_bps: u32,
    pub max_bitrate_bps: u32,
    pub starting_framerate: u32,
    /// Available bitrate above which the high framerate is used.
    pub high_fps_threshold_bps: u32,
    pub high_fps: u32,
    pub low_fps: u32,
    /// Fraction of estimated bandwidth treated as actually usable.
    pub headroom_factor: f64,
}

impl Default for SfuVideoQualityProfile {
    fn default() -> Self {
        Self {
            starting_bitrate_bps: 300_000,
            min_bitrate_bps: 100_000,
            max_bitrate_bps: 1_500_000,
            starting_framerate: 24,
            high_fps_threshold_bps: 600_000,
            high_fps: 30,
            low_fps: 15,
            headroom_factor: 0.8,
        }
    }
}

/// Top-level SDK configuration supplied by the host application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtcSessionConfig {
    /// ICE server URLs (STUN/TURN).
    pub ice_servers: Vec<String>,
    /// TURN username, if the servers require one.
    pub username: String,
    /// TURN credential.
    pub password: String,
    /// HKDF salt for frame key ratcheting.
    pub ratchet_salt: Vec<u8>,
    pub frame_encryption_key_mode: FrameKeyMode,
    /// When false, frame cryptors are created but left disabled.
    pub enable_encryption: bool,
    pub sfu_video_quality_profile: SfuVideoQualityProfile,
}

impl Default for RtcSessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            username: String::new(),
            password: String::new(),
            ratchet_salt: FRAME_RATCHET_SALT.to_vec(),
            frame_encryption_key_mode: FrameKeyMode::PerParticipant,
            enable_encryption: true,
            sfu_video_quality_profile: SfuVideoQualityProfile::default(),
        }
    }
}

impl RtcSessionConfig {
    /// Validate host-supplied configuration before the session starts.
    pub fn validate(&self) -> Result<(), RtcError> {
        if self.ice_servers.is_empty() {
            return Err(RtcError::InvalidConfiguration(
                "at least one ICE server is required".to_string(),
            ));
        }
        if self.ratchet_salt.is_empty() {
            return Err(RtcError::InvalidConfiguration(
                "ratchet salt must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-cryptor behavior knobs. Values are protocol constants; both peers must
/// agree on the salt and magic bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameCryptorConfig {
    pub ratchet_salt: Vec<u8>,
    /// How many ratchet steps backward a receiver will try when a frame does
    /// not decrypt with the current key. 0 disables the probe.
    pub ratchet_window_size: u32,
    pub uncrypted_magic_bytes: Vec<u8>,
    /// Consecutive decrypt failures tolerated before the cryptor reports
    /// an error state. -1 means unlimited.
    pub failure_tolerance: i32,
    pub key_ring_size: usize,
    pub discard_frame_when_cryptor_not_ready: bool,
}

impl Default for FrameCryptorConfig {
    fn default() -> Self {
        Self {
            ratchet_salt: FRAME_RATCHET_SALT.to_vec(),
            ratchet_window_size: 0,
            uncrypted_magic_bytes: UNCRYPTED_MAGIC_BYTES.to_vec(),
            failure_tolerance: -1,
            key_ring_size: KEY_RING_SIZE,
            discard_frame_when_cryptor_not_ready: true,
        }
    }
}

/// A single ICE server entry handed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Engine-facing peer connection configuration: unified-plan semantics,
/// DSCP tagging, continual ICE gathering.
#[derive(Debug, Clone, PartialEq)]
pub struct RtcConfiguration {
    pub ice_servers: Vec<IceServerConfig>,
    /// "unified-plan" (only supported value).
    pub sdp_semantics: String,
    pub enable_dscp: bool,
    pub continual_gathering: bool,
}

impl RtcConfiguration {
    /// Build the engine configuration from the host session config.
    pub fn from_session_config(config: &RtcSessionConfig) -> Self {
        let credentialed = !config.username.is_empty();
        let ice_servers = vec![IceServerConfig {
            urls: config.ice_servers.clone(),
            username: credentialed.then(|| config.username.clone()),
            credential: credentialed.then(|| config.password.clone()),
        }];
        Self {
            ice_servers,
            sdp_semantics: "unified-plan".to_string(),
            enable_dscp: true,
            continual_gathering: true,
        }
    }
}
