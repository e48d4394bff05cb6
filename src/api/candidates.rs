//! Per-connection ICE candidate buffering.
//!
//! Inbound candidates arriving before the remote description is set queue in
//! FIFO order and drain exactly once after `set_remote` completes. Locally
//! generated candidates queue in a separate deque until the session flips
//! `ready_for_candidates`, then flush in generation order.

use std::collections::{HashMap, VecDeque};

use tokio::sync::RwLock;

use crate::api::call::IceCandidate;

#[derive(Default)]
pub struct CandidateBuffer {
    inbound: RwLock<HashMap<String, VecDeque<IceCandidate>>>,
    outbound: RwLock<HashMap<String, VecDeque<IceCandidate>>>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an inbound candidate awaiting the remote description.
    pub async fn feed(&self, connection_id: &str, candidate: IceCandidate) {
        self.inbound
            .write()
            .await
            .entry(connection_id.to_string())
            .or_default()
            .push_back(candidate);
    }

    /// Take all pending inbound candidates in FIFO order.
    pub async fn drain(&self, connection_id: &str) -> Vec<IceCandidate> {
        self.inbound
            .write()
            .await
            .remove(connection_id)
            .map(|q| q.into_iter().collect())
            .unwrap_or_default()
    }

    /// Queue a locally generated candidate until trickle is enabled.
    pub async fn push_outbound(&self, connection_id: &str, candidate: IceCandidate) {
        self.outbound
            .write()
            .await
            .entry(connection_id.to_string())
            .or_default()
            .push_back(candidate);
    }

    /// Take all queued outbound candidates in generation order.
    pub async fn drain_outbound(&self, connection_id: &str) -> Vec<IceCandidate> {
        self.outbound
            .write()
            .await
            .remove(connection_id)
            .map(|q| q.into_iter().collect())
            .unwrap_or_default()
    }

    /// Drop the outbound deque for a connection without sending.
    pub async fn clear_outbound(&self, connection_id: &str) {
        self.outbound.write().await.remove(connection_id);
    }

    /// Drop all buffers for a connection.
    pub async fn clear(&self, connection_id: &str) {
        self.inbound.write().await.remove(connection_id);
        self.outbound.write().await.remove(connection_id);
    }

    pub async fn clear_all(&self) {
        self.inbound.write().await.clear();
        self.outbound.write().await.clear();
    }

    pub async fn inbound_len(&self, connection_id: &str) -> usize {
        self.inbound
            .read()
            .await
            .get(connection_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    pub async fn outbound_len(&self, connection_id: &str) -> usize {
        self.outbound
            .read()
            .await
            .get(connection_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }
}
