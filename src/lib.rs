//! # pqs-rtc
//!
//! Client-side real-time communication SDK adding end-to-end encryption at
//! the media-frame level on top of a WebRTC engine the host application
//! provides. The crate owns call-session coordination (SDP offer/answer, ICE
//! trickle with buffering, a serialized call state machine, idempotent
//! teardown), a post-quantum pairwise ratchet for signaling and frame keys,
//! and SFU group calls with per-sender key distribution.
//!
//! The WebRTC engine itself, the signaling transport, and all platform media
//! capture are external: the host plugs them in through the traits in
//! [`api::peer_connection`] and [`api::transport`].

pub mod api;

pub use api::call::{Call, IceCandidate, Participant, SdpType, SessionDescription};
pub use api::config::{FrameKeyMode, RtcSessionConfig};
pub use api::error::RtcError;
pub use api::group::{GroupCall, GroupCallEvent, GroupCallState, GroupControlMessage};
pub use api::session::RtcSession;
pub use api::state_machine::{CallDirection, CallMedia, CallState, EndState};
