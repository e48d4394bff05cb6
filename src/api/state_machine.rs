//! Serialized call lifecycle state machine.
//!
//! Transitions are validated against a fixed table; terminal states never
//! transition again. Subscribers get a newest-wins buffered view: a slow
//! subscriber may skip intermediate states but always observes the latest,
//! including terminals.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{watch, RwLock};

use crate::api::call::Call;
use crate::api::error::RtcError;

/// Maximum concurrent state subscribers.
const MAX_SUBSCRIBERS: usize = 2;

/// Voice or video call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMedia {
    Voice,
    Video,
}

/// Direction relative to the local device, carrying the media kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Inbound(CallMedia),
    Outbound(CallMedia),
}

/// Why a call reached `Ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndState {
    UserInitiated,
    PartnerInitiated,
    UserInitiatedUnanswered,
    PartnerInitiatedUnanswered,
    PartnerInitiatedRejected,
    Failed,
    AuxiliaryDeviceAnswered,
}

/// Call lifecycle states.
#[derive(Debug, Clone, PartialEq)]
pub enum CallState {
    Waiting,
    Ready(Call),
    Connecting(CallDirection, Call),
    Connected(CallDirection, Call),
    Held(Option<CallDirection>, Call),
    Ended(EndState, Call),
    Failed(Option<CallDirection>, Call, String),
    AnsweredAuxDevice(Call),
}

impl CallState {
    fn label(&self) -> &'static str {
        match self {
            CallState::Waiting => "waiting",
            CallState::Ready(_) => "ready",
            CallState::Connecting(..) => "connecting",
            CallState::Connected(..) => "connected",
            CallState::Held(..) => "held",
            CallState::Ended(..) => "ended",
            CallState::Failed(..) => "failed",
            CallState::AnsweredAuxDevice(_) => "answeredAuxDevice",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallState::Ended(..) | CallState::Failed(..) | CallState::AnsweredAuxDevice(_)
        )
    }
}

fn transition_allowed(from: &CallState, to: &CallState) -> bool {
    use CallState::*;
    match (from, to) {
        (Waiting, Ready(_)) => true,
        (Ready(_), Connecting(..)) => true,
        (Connecting(..), Connected(..)) => true,
        (Connecting(..), Failed(..)) => true,
        (Connecting(..), Ended(..)) => true,
        (Connecting(..), AnsweredAuxDevice(_)) => true,
        (Connected(..), Held(..)) => true,
        (Connected(..), Ended(..)) => true,
        (Connected(..), Failed(..)) => true,
        (Held(..), Connected(..)) => true,
        (Held(..), Ended(..)) => true,
        _ => false,
    }
}

/// Single-writer state machine with buffered-latest observation.
pub struct CallStateMachine {
    current: RwLock<CallState>,
    channel: RwLock<watch::Sender<CallState>>,
    subscribers: AtomicUsize,
}

impl Default for CallStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl CallStateMachine {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(CallState::Waiting);
        Self {
            current: RwLock::new(CallState::Waiting),
            channel: RwLock::new(tx),
            subscribers: AtomicUsize::new(0),
        }
    }

    pub async fn current(&self) -> CallState {
        self.current.read().await.clone()
    }

    /// Apply a transition. A transition to the same state is a no-op; an
    /// illegal transition is an error and leaves the state unchanged.
    pub async fn transition(&self, to: CallState) -> Result<CallState, RtcError> {
        let mut current = self.current.write().await;
        if std::mem::discriminant(&*current) == std::mem::discriminant(&to) {
            return Ok(current.clone());
        }
        if !transition_allowed(&current, &to) {
            return Err(RtcError::InvalidStateTransition(format!(
                "{} -> {}",
                current.label(),
                to.label()
            )));
        }
        tracing::info!(from = current.label(), to = to.label(), "call state transition");
        *current = to.clone();
        self.channel.read().await.send_replace(to.clone());
        Ok(to)
    }

    /// Subscribe to state updates. The receiver immediately holds the
    /// current state; at most two subscribers are supported.
    pub async fn subscribe(&self) -> Result<watch::Receiver<CallState>, RtcError> {
        let count = self.subscribers.fetch_add(1, Ordering::SeqCst);
        if count >= MAX_SUBSCRIBERS {
            self.subscribers.fetch_sub(1, Ordering::SeqCst);
            return Err(RtcError::InvalidConfiguration(format!(
                "at most {MAX_SUBSCRIBERS} state subscribers are supported"
            )));
        }
        Ok(self.channel.read().await.subscribe())
    }

    /// Reset to `Waiting`. Existing subscribers observe the reset through
    /// the old channel before it is replaced, so no stale buffered value
    /// survives the reset.
    pub async fn reset(&self) {
        let mut current = self.current.write().await;
        *current = CallState::Waiting;
        let mut channel = self.channel.write().await;
        channel.send_replace(CallState::Waiting);
        let (tx, _rx) = watch::channel(CallState::Waiting);
        *channel = tx;
        self.subscribers.store(0, Ordering::SeqCst);
    }
}
