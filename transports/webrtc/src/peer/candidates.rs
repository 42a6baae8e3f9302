//! ICE candidate buffering
//!
//! Two directions are buffered per peer:
//!
//! - **inbound**: remote candidates that cannot be applied yet because the
//!   peer has no connection or its remote description is not set. They are
//!   replayed in arrival order once the description is confirmed.
//! - **outgoing**: locally gathered candidates withheld from signaling until
//!   the answer (or the remote answer to our offer) has gone through.
//!
//! The buffer only holds data. The session decides when a peer is ready and
//! performs the engine calls.

use crate::model::{Candidate, PeerId};
use std::collections::{HashMap, VecDeque};

/// Result of asking to flush a peer's inbound queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushStart {
    /// Nothing queued
    Empty,
    /// A batch is already being applied; another pass follows it
    Busy,
    /// Apply these candidates in order
    Batch(Vec<Candidate>),
}

#[derive(Debug, Default)]
struct InboundQueue {
    pending: VecDeque<Candidate>,
    applying: bool,
    reflush: bool,
}

/// Per-peer candidate buffers of a session
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    inbound: HashMap<PeerId, InboundQueue>,
    outgoing: HashMap<PeerId, Vec<Candidate>>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    // ===== Inbound =====

    /// Append a remote candidate to the peer's queue
    pub fn enqueue(&mut self, peer_id: &PeerId, candidate: Candidate) {
        let queue = self.inbound.entry(peer_id.clone()).or_default();
        queue.pending.push_back(candidate);
        if queue.applying {
            queue.reflush = true;
        }
    }

    /// Take a snapshot of the peer's queue for application
    ///
    /// While a batch is out, later requests only mark that another pass is
    /// needed, so candidates are applied strictly in order.
    pub fn begin_flush(&mut self, peer_id: &PeerId) -> FlushStart {
        let Some(queue) = self.inbound.get_mut(peer_id) else {
            return FlushStart::Empty;
        };
        if queue.applying {
            queue.reflush = true;
            return FlushStart::Busy;
        }
        if queue.pending.is_empty() {
            return FlushStart::Empty;
        }
        queue.applying = true;
        FlushStart::Batch(queue.pending.drain(..).collect())
    }

    /// Close out a batch started by [`begin_flush`](Self::begin_flush)
    ///
    /// Failed candidates go back at the tail of the queue for the next
    /// flush. Returns `true` when another pass was requested meanwhile.
    pub fn finish_flush(&mut self, peer_id: &PeerId, failed: Vec<Candidate>) -> bool {
        let queue = self.inbound.entry(peer_id.clone()).or_default();
        queue.pending.extend(failed);
        queue.applying = false;
        std::mem::take(&mut queue.reflush)
    }

    /// Forget an outstanding batch whose connection was replaced
    ///
    /// Queued candidates stay.
    pub fn abandon_flush(&mut self, peer_id: &PeerId) {
        if let Some(queue) = self.inbound.get_mut(peer_id) {
            queue.applying = false;
            queue.reflush = false;
        }
    }

    pub fn pending_len(&self, peer_id: &PeerId) -> usize {
        self.inbound
            .get(peer_id)
            .map(|queue| queue.pending.len())
            .unwrap_or(0)
    }

    pub fn is_applying(&self, peer_id: &PeerId) -> bool {
        self.inbound
            .get(peer_id)
            .map(|queue| queue.applying)
            .unwrap_or(false)
    }

    /// Peers with queued remote candidates, with their counts
    pub fn backlog(&self) -> Vec<(PeerId, usize)> {
        let mut backlog: Vec<(PeerId, usize)> = self
            .inbound
            .iter()
            .filter(|(_, queue)| !queue.pending.is_empty())
            .map(|(peer_id, queue)| (peer_id.clone(), queue.pending.len()))
            .collect();
        backlog.sort();
        backlog
    }

    // ===== Outgoing =====

    /// Withhold a locally gathered candidate
    pub fn hold_outgoing(&mut self, peer_id: &PeerId, candidate: Candidate) {
        self.outgoing
            .entry(peer_id.clone())
            .or_default()
            .push(candidate);
    }

    /// Take every withheld candidate of the peer
    ///
    /// A second call returns nothing until new candidates are held.
    pub fn take_outgoing(&mut self, peer_id: &PeerId) -> Vec<Candidate> {
        self.outgoing.remove(peer_id).unwrap_or_default()
    }

    pub fn withheld_len(&self, peer_id: &PeerId) -> usize {
        self.outgoing.get(peer_id).map(Vec::len).unwrap_or(0)
    }

    pub fn clear_outgoing(&mut self, peer_id: &PeerId) {
        self.outgoing.remove(peer_id);
    }

    // ===== Teardown =====

    /// Drop both directions for one peer
    pub fn clear_peer(&mut self, peer_id: &PeerId) {
        self.inbound.remove(peer_id);
        self.outgoing.remove(peer_id);
    }

    pub fn clear(&mut self) {
        self.inbound.clear();
        self.outgoing.clear();
    }
}
