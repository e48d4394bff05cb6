//! Signaling transport contract the host application implements.
//!
//! The SDK never owns a socket: every control-plane artifact is handed to
//! the host here, already encrypted where the protocol requires it. The
//! transport re-applies any channel sigils its addressing scheme needs;
//! connection ids inside the SDK stay normalized.

use async_trait::async_trait;

use crate::api::call::{Call, Participant, RatchetMessagePacket};
use crate::api::error::RtcError;
use crate::api::state_machine::EndState;

#[async_trait]
pub trait RtcTransport: Send + Sync {
    async fn send_start_call(&self, call: &Call) -> Result<(), RtcError>;
    async fn send_call_answered(&self, call: &Call) -> Result<(), RtcError>;
    async fn send_call_answered_aux_device(&self, call: &Call) -> Result<(), RtcError>;

    /// Deliver an encrypted SDP offer for a 1:1 call.
    async fn send_offer(&self, call: &Call, packet: &RatchetMessagePacket) -> Result<(), RtcError>;
    /// Deliver an encrypted SDP answer, with optional opaque metadata.
    async fn send_answer(
        &self,
        call: &Call,
        packet: &RatchetMessagePacket,
        metadata: Option<Vec<u8>>,
    ) -> Result<(), RtcError>;
    /// Deliver an encrypted ICE candidate for a 1:1 call.
    async fn send_candidate(
        &self,
        call: &Call,
        packet: &RatchetMessagePacket,
    ) -> Result<(), RtcError>;

    /// Deliver an encrypted control packet to one recipient device.
    async fn send_one_to_one_message(
        &self,
        packet: &RatchetMessagePacket,
        recipient: &Participant,
    ) -> Result<(), RtcError>;
    /// Deliver an encrypted control packet to the SFU.
    async fn send_sfu_message(
        &self,
        packet: &RatchetMessagePacket,
        call: &Call,
    ) -> Result<(), RtcError>;

    /// Deliver an opaque PQXDH handshake blob to a recipient.
    async fn send_ciphertext(
        &self,
        recipient: &Participant,
        connection_id: &str,
        ciphertext: Vec<u8>,
        call: &Call,
    ) -> Result<(), RtcError>;

    /// Deliver an encrypted sender-key distribution message (opaque bytes)
    /// to one group participant.
    async fn send_sender_key(
        &self,
        message: Vec<u8>,
        to_participant_id: &str,
        call: &Call,
    ) -> Result<(), RtcError>;

    /// Local termination notice.
    async fn did_end(&self, call: &Call, end_state: EndState);

    /// Ask the host to negotiate a group identity with the SFU.
    async fn negotiate_group_identity(
        &self,
        call: &Call,
        sfu_recipient_id: &str,
    ) -> Result<(), RtcError>;
}
