//! Peer connection registry

use super::connection::{NegotiationKind, PeerEntry, PeerPhase};
use crate::engine::ConnectionId;
use crate::model::{MediaKind, PeerId};
use crate::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info};

/// Diagnostic view of one peer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerInfo {
    /// Peer identifier
    pub peer_id: PeerId,

    /// Lifecycle phase
    pub phase: PeerPhase,

    pub media_kind: MediaKind,

    pub remote_description_set: bool,

    /// Negotiation operation awaiting the engine, if any
    pub negotiating: Option<NegotiationKind>,

    /// Negotiation requests queued behind the in-flight one
    pub deferred_ops: usize,

    /// Remote candidates waiting to be applied
    pub pending_candidates: usize,

    /// Remote candidates currently being applied
    pub applying_candidates: bool,

    /// Local candidates withheld from signaling
    pub withheld_candidates: usize,

    pub disconnect_timer_active: bool,

    /// Flushes triggered by a confirmed remote description
    pub flush_count: u32,

    pub remote_audio_muted: bool,
    pub remote_video_muted: bool,

    /// Connection duration (if connected)
    pub duration_secs: Option<u64>,
}

/// Owns every live connection handle of a session, keyed by peer
///
/// The local user's sentinel id never gets an entry.
pub(crate) struct PeerRegistry {
    peers: HashMap<PeerId, PeerEntry>,
    max_peers: u32,
    self_peer_id: PeerId,
}

impl PeerRegistry {
    pub fn new(max_peers: u32, self_peer_id: PeerId) -> Self {
        Self {
            peers: HashMap::new(),
            max_peers,
            self_peer_id,
        }
    }

    pub fn is_self(&self, peer_id: &PeerId) -> bool {
        *peer_id == self.self_peer_id
    }

    /// Check that `peer_id` may get a connection
    ///
    /// # Errors
    ///
    /// Returns [`Error::PreconditionViolation`] for the local sentinel and
    /// [`Error::PeerLimitReached`] when a new peer would exceed `max_peers`.
    pub fn ensure_capacity(&self, peer_id: &PeerId) -> Result<()> {
        if self.is_self(peer_id) {
            return Err(Error::PreconditionViolation(
                "the local user has no peer connection".to_string(),
            ));
        }
        if !self.peers.contains_key(peer_id) && self.peers.len() >= self.max_peers as usize {
            return Err(Error::PeerLimitReached(self.max_peers));
        }
        Ok(())
    }

    /// Insert a connection entry, returning the one it replaced
    ///
    /// Callers release the returned entry's handle.
    pub fn insert(&mut self, entry: PeerEntry) -> Option<PeerEntry> {
        info!(
            "Registered connection: peer_id={}, connection_id={}",
            entry.peer_id, entry.connection_id
        );
        self.peers.insert(entry.peer_id.clone(), entry)
    }

    pub fn remove(&mut self, peer_id: &PeerId) -> Option<PeerEntry> {
        let removed = self.peers.remove(peer_id);
        if removed.is_some() {
            debug!("Removed peer {} from registry", peer_id);
        }
        removed
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerEntry> {
        self.peers.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &PeerId) -> Option<&mut PeerEntry> {
        self.peers.get_mut(peer_id)
    }

    /// Entry for `peer_id` only if it is still the connection `connection_id`
    pub fn current_mut(
        &mut self,
        peer_id: &PeerId,
        connection_id: ConnectionId,
    ) -> Option<&mut PeerEntry> {
        self.peers
            .get_mut(peer_id)
            .filter(|entry| entry.connection_id == connection_id)
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Snapshot of remote peer ids in stable order
    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self
            .peers
            .keys()
            .filter(|id| !self.is_self(id))
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Remove every entry
    pub fn drain(&mut self) -> Vec<PeerEntry> {
        let count = self.peers.len();
        let entries: Vec<PeerEntry> = self.peers.drain().map(|(_, entry)| entry).collect();
        if count > 0 {
            info!("Cleared {} peers from registry", count);
        }
        entries
    }

    /// Registry part of a [`PeerInfo`]
    pub fn describe(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.peers.get(peer_id).map(|entry| PeerInfo {
            peer_id: entry.peer_id.clone(),
            phase: entry.phase,
            media_kind: entry.media_kind,
            remote_description_set: entry.remote_description_set,
            negotiating: entry.in_flight,
            deferred_ops: entry.deferred.len(),
            pending_candidates: 0,
            applying_candidates: false,
            withheld_candidates: 0,
            disconnect_timer_active: false,
            flush_count: entry.flush_count,
            remote_audio_muted: entry.remote_audio_muted,
            remote_video_muted: entry.remote_video_muted,
            duration_secs: entry.connected_at.map(|at| at.elapsed().as_secs()),
        })
    }
}
