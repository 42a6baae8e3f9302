//! Outbound events
//!
//! Everything the session wants the outside world to do or know is one
//! [`OutboundEvent`], delivered in order on a single channel. The signaling
//! layer forwards the `*_ready`, `call_cut` and `mute_status_broadcast`
//! events to remote peers; the UI consumes the rest.

use crate::model::{Candidate, MediaKind, PeerId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// One offer of a group call batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferRecord {
    /// Always "offer"
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
    pub user_id: PeerId,
}

impl OfferRecord {
    pub fn new(user_id: PeerId, sdp: String) -> Self {
        Self {
            kind: "offer".to_string(),
            sdp,
            user_id,
        }
    }
}

/// A per-peer failure carried alongside a result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerFailure {
    pub user_id: PeerId,
    pub reason: String,
}

/// Negotiation step that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationStage {
    CreateConnection,
    SetRemoteOffer,
    CreateAnswer,
    CreateOffer,
    SetRemoteAnswer,
}

/// Events emitted by a call session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OutboundEvent {
    /// Offers for a group call, one per participant that succeeded
    OfferBatchReady {
        channel: String,
        group_id: String,
        media_kind: MediaKind,
        is_inviting: bool,
        offers: Vec<OfferRecord>,
        /// Participants whose offer failed
        errors: Vec<PeerFailure>,
    },

    /// No participant of a group call produced an offer
    GroupOfferFailed {
        channel: String,
        group_id: String,
        errors: Vec<PeerFailure>,
    },

    /// Answer to a remote offer
    AnswerReady {
        channel: String,
        recipient: PeerId,
        sdp: String,
    },

    /// Local ICE candidate for a peer
    CandidateReady {
        channel: String,
        recipient: PeerId,
        candidate: Candidate,
    },

    /// Single-peer offer (renegotiation, rejoin, restart, upgrade)
    OfferReady {
        channel: String,
        recipient: PeerId,
        sdp: String,
        media_kind: MediaKind,
        /// Connection was rebuilt (restart or audio to video upgrade)
        is_upgrade: bool,
        video_request_accepted: bool,
    },

    /// A remote offer was accepted and is being answered
    OfferHandled {
        channel: String,
        user_id: PeerId,
        group_id: String,
        is_inviting: bool,
        is_rejoin: bool,
    },

    /// The local user ended the call
    CallCut {
        channel: String,
        recipients: Vec<PeerId>,
    },

    /// A peer did not come back within the grace period
    PeerDisconnected {
        channel: String,
        user_id: PeerId,
        duration_secs: u64,
    },

    /// Local mute state changed
    MuteStatusBroadcast {
        channel: String,
        recipients: Vec<PeerId>,
        kind: MediaKind,
        muted: bool,
    },

    /// A remote peer changed its mute state
    PeerMuteChanged {
        channel: String,
        user_id: PeerId,
        kind: MediaKind,
        muted: bool,
    },

    /// Call membership of a peer changed
    MembershipChanged {
        channel: String,
        user_id: PeerId,
        joined: bool,
        active: bool,
    },

    /// The session is over
    CallEnded { ended: bool },

    /// A peer left the call
    ParticipantLeft { channel: String, user_id: PeerId },

    /// A recoverable negotiation step failed
    NegotiationFailed {
        channel: String,
        user_id: PeerId,
        stage: NegotiationStage,
        reason: String,
    },
}

impl OutboundEvent {
    /// Event name as used on the wire
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::OfferBatchReady { .. } => "offer_batch_ready",
            OutboundEvent::GroupOfferFailed { .. } => "group_offer_failed",
            OutboundEvent::AnswerReady { .. } => "answer_ready",
            OutboundEvent::CandidateReady { .. } => "candidate_ready",
            OutboundEvent::OfferReady { .. } => "offer_ready",
            OutboundEvent::OfferHandled { .. } => "offer_handled",
            OutboundEvent::CallCut { .. } => "call_cut",
            OutboundEvent::PeerDisconnected { .. } => "peer_disconnected",
            OutboundEvent::MuteStatusBroadcast { .. } => "mute_status_broadcast",
            OutboundEvent::PeerMuteChanged { .. } => "peer_mute_changed",
            OutboundEvent::MembershipChanged { .. } => "membership_changed",
            OutboundEvent::CallEnded { .. } => "call_ended",
            OutboundEvent::ParticipantLeft { .. } => "participant_left",
            OutboundEvent::NegotiationFailed { .. } => "negotiation_failed",
        }
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Receiving end of a session's event channel
pub type EventReceiver = mpsc::UnboundedReceiver<OutboundEvent>;

/// Sending end held by the session loop
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: mpsc::UnboundedSender<OutboundEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<OutboundEvent>) -> Self {
        Self { tx }
    }

    /// Emit an event; a dropped receiver is not an error for the session
    pub fn emit(&self, event: OutboundEvent) {
        trace!(event = ?event, "emit");
        let name = event.name();
        if self.tx.send(event).is_err() {
            debug!("Event receiver dropped, discarding {}", name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_record_wire_shape() {
        let record = OfferRecord::new(PeerId::from("alice"), "v=0".to_string());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["userId"], "alice");
        assert_eq!(json["sdp"], "v=0");
    }

    #[test]
    fn test_event_tagging() {
        let event = OutboundEvent::CallEnded { ended: true };
        let json = event.to_json().unwrap();
        assert!(json.contains("\"event\":\"call_ended\""));

        let event = OutboundEvent::ParticipantLeft {
            channel: "room".to_string(),
            user_id: PeerId::from("bob"),
        };
        let parsed: OutboundEvent = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(parsed, event);
        assert_eq!(parsed.name(), "participant_left");
    }

    #[tokio::test]
    async fn test_sink_preserves_order_and_tolerates_drop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(tx);
        sink.emit(OutboundEvent::CallEnded { ended: false });
        sink.emit(OutboundEvent::CallEnded { ended: true });

        assert_eq!(rx.recv().await, Some(OutboundEvent::CallEnded { ended: false }));
        assert_eq!(rx.recv().await, Some(OutboundEvent::CallEnded { ended: true }));

        drop(rx);
        sink.emit(OutboundEvent::CallEnded { ended: true });
    }
}
