//! Long-lived consumer of peer-connection events.
//!
//! One consumer runs per notification-stream generation. Shutdown bumps the
//! generation and replaces the channel; the superseded consumer drains its
//! queue without acting and exits. Only events from the active connection
//! may drive call state transitions.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::api::call::{IceCandidate, SignalingFlag};
use crate::api::error::RtcError;
use crate::api::group::GroupCallEvent;
use crate::api::peer_connection::{
    CryptorAttach, IceConnectionState, MediaKind, PeerConnectionEvent,
};
use crate::api::quality;
use crate::api::registry::normalize_connection_id;
use crate::api::session::{self, SessionInner};
use crate::api::state_machine::CallState;
use crate::api::tasks::WriteTask;

/// Run the consumer loop for one stream generation.
pub(crate) async fn consume(
    inner: Arc<SessionInner>,
    mut rx: mpsc::UnboundedReceiver<PeerConnectionEvent>,
    generation: u64,
) {
    while let Some(event) = rx.recv().await {
        if inner.notification_generation.load(Ordering::SeqCst) != generation {
            tracing::debug!(generation, "superseded notification consumer exiting");
            break;
        }
        if let Err(e) = handle_event(&inner, event).await {
            tracing::warn!(error = %e, "peer connection event handling failed");
        }
    }
    tracing::debug!(generation, "notification consumer finished");
}

async fn is_active(inner: &SessionInner, connection_id: &str) -> bool {
    inner.active_connection_id.read().await.as_deref()
        == Some(normalize_connection_id(connection_id).as_str())
}

async fn handle_event(inner: &SessionInner, event: PeerConnectionEvent) -> Result<(), RtcError> {
    match event {
        PeerConnectionEvent::GatheringStateChanged {
            connection_id,
            state,
        } => {
            tracing::debug!(%connection_id, ?state, "ICE gathering state");
            Ok(())
        }
        PeerConnectionEvent::SignalingStateChanged {
            connection_id,
            state,
        } => {
            tracing::debug!(%connection_id, ?state, "signaling state");
            Ok(())
        }
        PeerConnectionEvent::IceConnectionStateChanged {
            connection_id,
            state,
        }
        | PeerConnectionEvent::StandardizedIceConnectionStateChanged {
            connection_id,
            state,
        } => handle_ice_state(inner, &connection_id, state).await,
        PeerConnectionEvent::GeneratedIceCandidate {
            connection_id,
            sdp,
            sdp_m_line_index,
            sdp_mid,
        } => handle_generated_candidate(inner, &connection_id, sdp, sdp_m_line_index, sdp_mid).await,
        PeerConnectionEvent::DidAddReceiver {
            connection_id,
            kind,
            stream_ids,
            track_id,
        } => handle_added_receiver(inner, &connection_id, kind, stream_ids, track_id).await,
        PeerConnectionEvent::AddedStream {
            connection_id,
            stream_id,
        } => handle_added_stream(inner, &connection_id, &stream_id).await,
        PeerConnectionEvent::RemovedStream {
            connection_id,
            stream_id,
        } => {
            tracing::debug!(%connection_id, %stream_id, "stream removed");
            Ok(())
        }
        PeerConnectionEvent::IceCandidatesRemoved {
            connection_id,
            count,
        } => {
            tracing::debug!(%connection_id, count, "ICE candidates removed");
            Ok(())
        }
        PeerConnectionEvent::StartedReceiving { connection_id } => {
            tracing::debug!(%connection_id, "started receiving media");
            Ok(())
        }
        PeerConnectionEvent::DataChannelOpened {
            connection_id,
            label,
        } => {
            inner
                .registry
                .update(&connection_id, |r| {
                    if !r.data_channels.contains(&label) {
                        r.data_channels.push(label.clone());
                    }
                })
                .await;
            Ok(())
        }
        PeerConnectionEvent::DataChannelMessage {
            connection_id,
            label,
            data,
            is_binary,
        } => {
            let handler = inner.data_channel_handler.read().await;
            match handler.as_ref() {
                Some(handler) => handler(&connection_id, &label, &data, is_binary),
                None => {
                    tracing::debug!(%connection_id, %label, is_binary, len = data.len(),
                        "unhandled data channel message")
                }
            }
            Ok(())
        }
        PeerConnectionEvent::ShouldNegotiate { connection_id } => {
            // Renegotiation is driven by higher-level logic.
            tracing::debug!(%connection_id, "renegotiation requested");
            Ok(())
        }
        PeerConnectionEvent::FrameCryptorStateChanged {
            connection_id,
            participant_id,
            state,
        } => {
            // Advisory only; the key provider's discard policy handles
            // frames that cannot be processed yet.
            tracing::debug!(%connection_id, %participant_id, ?state, "frame cryptor state");
            Ok(())
        }
    }
}

async fn handle_ice_state(
    inner: &SessionInner,
    connection_id: &str,
    state: IceConnectionState,
) -> Result<(), RtcError> {
    let record = match inner.registry.find(connection_id).await {
        Some(record) => record,
        None => {
            tracing::debug!(%connection_id, ?state, "ICE state for unknown connection");
            return Ok(());
        }
    };
    match state {
        IceConnectionState::Connected | IceConnectionState::Completed => {
            if is_active(inner, connection_id).await {
                inner
                    .state_machine
                    .transition(CallState::Connected(record.direction, record.call.clone()))
                    .await?;
            }
            Ok(())
        }
        IceConnectionState::Failed
        | IceConnectionState::Disconnected
        | IceConnectionState::Closed => {
            inner.candidates.clear_outbound(connection_id).await;
            if is_active(inner, connection_id).await {
                let mut failed = record.call.clone();
                failed.mark_failed();
                let _ = inner
                    .state_machine
                    .transition(CallState::Failed(
                        Some(record.direction),
                        failed.clone(),
                        format!("ICE connection {state:?}"),
                    ))
                    .await;
                session::finish_end_connection_core(inner, &failed, false).await?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

async fn handle_generated_candidate(
    inner: &SessionInner,
    connection_id: &str,
    sdp: String,
    sdp_m_line_index: i32,
    sdp_mid: Option<String>,
) -> Result<(), RtcError> {
    let record = match inner.registry.find(connection_id).await {
        Some(record) => record,
        None => {
            tracing::debug!(%connection_id, "candidate for unknown connection");
            return Ok(());
        }
    };
    let id = inner.ice_id.fetch_add(1, Ordering::SeqCst) + 1;
    inner.last_id.store(id, Ordering::SeqCst);
    let candidate = IceCandidate {
        id,
        sdp,
        sdp_m_line_index,
        sdp_mid,
    };

    if inner.ready_for_candidates.load(Ordering::SeqCst) {
        let data = serde_json::to_vec(&candidate)
            .map_err(|e| RtcError::InvalidMetadata(e.to_string()))?;
        let task = WriteTask {
            data,
            room_id: record.id.clone(),
            flag: SignalingFlag::Candidate,
            call: record.call.clone(),
            metadata: None,
        };
        if let Err(e) = inner.tasks.submit_write(inner, task).await {
            tracing::warn!(error = %e, candidate_id = id, "dropping generated candidate");
        }
    } else {
        inner.candidates.push_outbound(&record.id, candidate).await;
    }
    Ok(())
}

async fn handle_added_receiver(
    inner: &SessionInner,
    connection_id: &str,
    kind: MediaKind,
    stream_ids: Vec<String>,
    track_id: String,
) -> Result<(), RtcError> {
    let record = match inner.registry.find(connection_id).await {
        Some(record) => record,
        None => {
            tracing::debug!(%connection_id, "receiver for unknown connection");
            return Ok(());
        }
    };
    let participant_id = {
        let resolver = inner.participant_resolver.read().await;
        (*resolver)(&stream_ids, &track_id, kind)
    };
    let participant_id = match participant_id {
        Some(id) => id,
        None => {
            tracing::warn!(%connection_id, %track_id, "could not resolve participant for receiver");
            return Ok(());
        }
    };

    let provider: Arc<dyn crate::api::frame_crypto::FrameKeySource> = inner.key_provider.clone();
    let cryptor = record
        .peer_connection
        .create_frame_cryptor(
            CryptorAttach::Receiver {
                track_id: track_id.clone(),
            },
            &participant_id,
            provider,
        )
        .await?;
    cryptor.set_enabled(inner.config.enable_encryption);

    let pid = participant_id.clone();
    let tid = track_id.clone();
    inner
        .registry
        .update(connection_id, move |r| match kind {
            MediaKind::Audio => {
                r.remote_audio_tracks_by_participant.insert(pid.clone(), tid.clone());
                r.audio_receiver_cryptors_by_participant.insert(pid, cryptor);
            }
            MediaKind::Video => {
                r.remote_video_tracks_by_participant.insert(pid.clone(), tid.clone());
                r.video_receiver_cryptors_by_participant.insert(pid, cryptor);
            }
        })
        .await;

    // A buffered handshake ciphertext may have been waiting for receivers.
    session::try_complete_recipient_setup(inner, &record.id).await?;

    if let Some(tx) = inner.group_event_tx.read().await.as_ref() {
        let _ = tx.send(GroupCallEvent::RemoteTrackAdded {
            participant_id,
            kind,
            track_id,
        });
    }
    Ok(())
}

async fn handle_added_stream(
    inner: &SessionInner,
    connection_id: &str,
    stream_id: &str,
) -> Result<(), RtcError> {
    let record = match inner.registry.find(connection_id).await {
        Some(record) => record,
        None => {
            tracing::debug!(%connection_id, %stream_id, "stream for unknown connection");
            return Ok(());
        }
    };
    session::ensure_sender_cryptors(inner, connection_id).await?;

    // SFU calls start from the configured encoder ceilings; adaptive control
    // takes over once stats flow.
    if record.call.is_group() {
        let profile = &inner.config.sfu_video_quality_profile;
        for sender in record.peer_connection.senders().await {
            if sender.kind() == MediaKind::Video {
                sender.set_encoding_ceilings(
                    Some(quality::clamp_bitrate(profile, profile.starting_bitrate_bps)),
                    Some(profile.starting_framerate),
                );
            }
        }
    }
    Ok(())
}
