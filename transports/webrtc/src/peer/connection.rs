//! Per-peer connection record and lifecycle phases

use crate::engine::{ConnectionId, PeerHandle, RemoteTrack};
use crate::model::{MediaKind, PeerId};
use crate::session::negotiation::DeferredOp;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Which side produced the offer being negotiated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationSide {
    /// We sent the offer
    Local,
    /// The remote peer sent the offer
    Remote,
}

/// Lifecycle phase of one peer
///
/// ```text
/// Absent -> Connecting -> Negotiating(local|remote) -> Connected
///                                    ^                   |
///                                    +--- Disconnected <-+
/// any live phase -> Departed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerPhase {
    Absent,
    Connecting,
    Negotiating(NegotiationSide),
    Connected,
    /// Transport lost, grace timer pending
    Disconnected,
    Departed,
}

impl PeerPhase {
    /// Check whether moving to `next` is a legal lifecycle step
    pub fn can_transition_to(self, next: PeerPhase) -> bool {
        use PeerPhase::*;
        match (self, next) {
            (Departed, _) => false,
            (_, Departed) => true,
            (Absent, Connecting) => true,
            (Connecting, Negotiating(_)) => true,
            (Negotiating(_), Negotiating(_)) => true,
            (Negotiating(_), Connected) => true,
            (Connected, Negotiating(_)) => true,
            (Negotiating(_) | Connected, Disconnected) => true,
            (Disconnected, Connected | Negotiating(_)) => true,
            _ => false,
        }
    }

    /// Whether the peer counts as a current member of the call
    pub fn is_live(self) -> bool {
        !matches!(self, PeerPhase::Absent | PeerPhase::Departed)
    }
}

/// Negotiation operation currently awaiting the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationKind {
    RemoteOffer,
    LocalOffer,
    GroupOffer,
    RemoteAnswer,
}

/// Registry entry for one peer's live connection
pub(crate) struct PeerEntry {
    pub peer_id: PeerId,
    pub handle: Arc<dyn PeerHandle>,
    pub connection_id: ConnectionId,
    pub media_kind: MediaKind,
    pub phase: PeerPhase,

    /// Gate for applying remote candidates
    pub remote_description_set: bool,

    /// At most one negotiation operation per peer is in flight
    pub in_flight: Option<NegotiationKind>,

    /// Negotiation requests that arrived while one was in flight
    pub deferred: VecDeque<DeferredOp>,

    /// Locally gathered candidates may go out directly
    pub outgoing_released: bool,

    /// Built by a restart of every connection; never triggers another
    pub rebuilt_by_restart: bool,

    pub remote_video: Option<RemoteTrack>,
    pub remote_audio_muted: bool,
    pub remote_video_muted: bool,

    pub connected_at: Option<Instant>,

    /// Flushes triggered by a confirmed remote description
    pub flush_count: u32,
}

impl PeerEntry {
    pub fn new(
        peer_id: PeerId,
        handle: Arc<dyn PeerHandle>,
        connection_id: ConnectionId,
        media_kind: MediaKind,
    ) -> Self {
        Self {
            peer_id,
            handle,
            connection_id,
            media_kind,
            phase: PeerPhase::Connecting,
            remote_description_set: false,
            in_flight: None,
            deferred: VecDeque::new(),
            outgoing_released: false,
            rebuilt_by_restart: false,
            remote_video: None,
            remote_audio_muted: false,
            remote_video_muted: false,
            connected_at: None,
            flush_count: 0,
        }
    }

    /// Move to `next`, refusing illegal steps
    ///
    /// Returns `false` and leaves the phase untouched when the step is not
    /// allowed.
    pub fn set_phase(&mut self, next: PeerPhase) -> bool {
        let old = self.phase;
        if old == next {
            return true;
        }
        if !old.can_transition_to(next) {
            warn!(
                "Peer {} refused state transition: {:?} -> {:?}",
                self.peer_id, old, next
            );
            return false;
        }

        debug!(
            "Peer {} state transition: {:?} -> {:?}",
            self.peer_id, old, next
        );
        self.phase = next;

        if next == PeerPhase::Connected && self.connected_at.is_none() {
            self.connected_at = Some(Instant::now());
        }
        true
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        use PeerPhase::*;
        assert!(Absent.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Negotiating(NegotiationSide::Local)));
        assert!(Negotiating(NegotiationSide::Remote).can_transition_to(Connected));
        assert!(Connected.can_transition_to(Disconnected));
        assert!(Disconnected.can_transition_to(Connected));
        assert!(Disconnected.can_transition_to(Departed));
    }

    #[test]
    fn test_illegal_transitions() {
        use PeerPhase::*;
        assert!(!Absent.can_transition_to(Connected));
        assert!(!Connecting.can_transition_to(Connected));
        assert!(!Connecting.can_transition_to(Disconnected));
        assert!(!Departed.can_transition_to(Connecting));
        assert!(!Departed.can_transition_to(Departed));
    }

    #[test]
    fn test_liveness() {
        assert!(!PeerPhase::Absent.is_live());
        assert!(PeerPhase::Disconnected.is_live());
        assert!(!PeerPhase::Departed.is_live());
    }
}
