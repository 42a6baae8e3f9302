//! Group call offer fan-out
//!
//! Every participant gets a connection and an offer concurrently. The
//! outcomes meet at a join barrier and are reported as one batch, never
//! piecemeal.

use super::negotiation::create_local_offer;
use super::{CallSession, Internal};
use crate::engine::ConnectionId;
use crate::events::{OfferRecord, OutboundEvent, PeerFailure};
use crate::model::{CallParticipant, InitiateType, MediaConstraints, MediaKind, PeerId};
use crate::peer::{NegotiationKind, NegotiationSide, PeerPhase};
use crate::{Error, Result};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use tokio::sync::oneshot;
use tracing::{info, instrument, warn};

/// Parameters of a group call started by the local user
#[derive(Debug, Clone)]
pub struct GroupCallRequest {
    pub participants: Vec<CallParticipant>,
    pub channel: String,
    pub group_id: String,
    pub media_kind: MediaKind,
    pub initiate_type: InitiateType,
    /// Invitation into a call that is already running
    pub is_inviting: bool,
}

impl GroupCallRequest {
    pub fn new(channel: impl Into<String>, group_id: impl Into<String>, media_kind: MediaKind) -> Self {
        Self {
            participants: Vec::new(),
            channel: channel.into(),
            group_id: group_id.into(),
            media_kind,
            initiate_type: InitiateType::Outgoing,
            is_inviting: false,
        }
    }

    pub fn with_participant(mut self, participant: CallParticipant) -> Self {
        self.participants.push(participant);
        self
    }

    pub fn with_participants<I>(mut self, participants: I) -> Self
    where
        I: IntoIterator<Item = CallParticipant>,
    {
        self.participants.extend(participants);
        self
    }

    pub fn with_initiate_type(mut self, initiate_type: InitiateType) -> Self {
        self.initiate_type = initiate_type;
        self
    }

    pub fn inviting(mut self, is_inviting: bool) -> Self {
        self.is_inviting = is_inviting;
        self
    }
}

/// Aggregated outcome of a group offer round
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupOfferReport {
    pub offers: Vec<OfferRecord>,
    pub errors: Vec<PeerFailure>,
}

impl GroupOfferReport {
    /// No participant produced an offer
    pub fn all_failed(&self) -> bool {
        self.offers.is_empty()
    }

    /// Turn an all-failed round into [`Error::AggregateOfferFailure`]
    pub fn ensure_any_succeeded(self) -> Result<Self> {
        if self.all_failed() {
            return Err(Error::AggregateOfferFailure {
                failed: self.errors.len(),
            });
        }
        Ok(self)
    }
}

/// Group call parameters carried across the join barrier
#[derive(Debug)]
pub(crate) struct GroupContext {
    channel: String,
    group_id: String,
    media_kind: MediaKind,
    is_inviting: bool,
    reply: oneshot::Sender<Result<GroupOfferReport>>,
}

impl GroupContext {
    /// Answer the caller; a caller that stopped waiting is fine
    pub fn reply(self, result: Result<GroupOfferReport>) {
        let _ = self.reply.send(result);
    }
}

/// One participant's offer attempt
#[derive(Debug)]
pub(crate) struct OfferOutcome {
    peer_id: PeerId,
    /// `None` when the attempt was rejected before reaching the engine
    connection_id: Option<ConnectionId>,
    result: Result<String>,
}

impl OfferOutcome {
    fn rejected(peer_id: PeerId, error: Error) -> Self {
        Self {
            peer_id,
            connection_id: None,
            result: Err(error),
        }
    }
}

impl CallSession {
    #[instrument(skip(self, request, reply), fields(channel = %request.channel, participants = request.participants.len()))]
    pub(super) async fn start_group_call(
        &mut self,
        request: GroupCallRequest,
        reply: oneshot::Sender<Result<GroupOfferReport>>,
    ) {
        let call = &mut self.store.call;
        call.channel = request.channel.clone();
        call.group_id = request.group_id.clone();
        call.call_type = request.media_kind;
        call.initiate_type = request.initiate_type;
        call.video_enabled = request.media_kind == MediaKind::Video;
        call.mark_started();

        let mut seen = HashSet::new();
        let mut outcomes = Vec::new();
        let mut attempts = Vec::new();

        for participant in request.participants {
            let peer_id = participant.id;
            if self.store.peers.is_self(&peer_id) || !seen.insert(peer_id.clone()) {
                continue;
            }

            let busy = self
                .store
                .peers
                .get(&peer_id)
                .map(|entry| entry.is_busy())
                .unwrap_or(false);
            if busy {
                outcomes.push(OfferOutcome::rejected(
                    peer_id,
                    Error::PreconditionViolation("negotiation already in flight".to_string()),
                ));
                continue;
            }

            match self.create_or_reuse(&peer_id, request.media_kind, false).await {
                Ok(connection_id) => {
                    if let Some(entry) = self.store.peers.get_mut(&peer_id) {
                        entry.in_flight = Some(NegotiationKind::GroupOffer);
                        attempts.push((peer_id, connection_id, entry.handle.clone()));
                    }
                }
                Err(e) => {
                    warn!("Failed to prepare connection for {}: {}", peer_id, e);
                    outcomes.push(OfferOutcome::rejected(peer_id, e));
                }
            }
        }

        info!(
            "Starting group call: {} offer attempts, {} rejected up front",
            attempts.len(),
            outcomes.len()
        );

        let context = GroupContext {
            channel: request.channel,
            group_id: request.group_id,
            media_kind: request.media_kind,
            is_inviting: request.is_inviting,
            reply,
        };
        let constraints = MediaConstraints::for_call(request.media_kind);
        let tx = self.internal_tx.clone();

        tokio::spawn(async move {
            let offers = attempts
                .into_iter()
                .map(|(peer_id, connection_id, handle)| async move {
                    OfferOutcome {
                        peer_id,
                        connection_id: Some(connection_id),
                        result: create_local_offer(handle, constraints).await,
                    }
                });
            outcomes.extend(join_all(offers).await);
            let _ = tx.send(Internal::GroupOffersJoined { context, outcomes });
        });
    }

    pub(super) async fn on_group_offers_joined(
        &mut self,
        context: GroupContext,
        outcomes: Vec<OfferOutcome>,
    ) {
        let mut report = GroupOfferReport::default();
        let mut settled = Vec::new();

        for outcome in outcomes {
            let peer_id = outcome.peer_id;
            let current = outcome
                .connection_id
                .and_then(|id| self.store.peers.current_mut(&peer_id, id));

            match (current, outcome.result) {
                (Some(entry), Ok(sdp)) => {
                    entry.in_flight = None;
                    entry.set_phase(PeerPhase::Negotiating(NegotiationSide::Local));
                    report.offers.push(OfferRecord::new(peer_id.clone(), sdp));
                    settled.push(peer_id);
                }
                (Some(entry), Err(e)) => {
                    entry.in_flight = None;
                    report.errors.push(PeerFailure {
                        user_id: peer_id.clone(),
                        reason: e.to_string(),
                    });
                    settled.push(peer_id);
                }
                (None, Ok(_)) => report.errors.push(PeerFailure {
                    user_id: peer_id,
                    reason: "connection replaced before the offer completed".to_string(),
                }),
                (None, Err(e)) => report.errors.push(PeerFailure {
                    user_id: peer_id,
                    reason: e.to_string(),
                }),
            }
        }

        if report.all_failed() {
            warn!(
                "Group offer failed for all {} participants",
                report.errors.len()
            );
            self.events.emit(OutboundEvent::GroupOfferFailed {
                channel: context.channel.clone(),
                group_id: context.group_id.clone(),
                errors: report.errors.clone(),
            });
        } else {
            if !report.errors.is_empty() {
                warn!(
                    "Group offer: {} succeeded, {} failed",
                    report.offers.len(),
                    report.errors.len()
                );
            }
            info!("Offer batch ready with {} offers", report.offers.len());
            self.events.emit(OutboundEvent::OfferBatchReady {
                channel: context.channel.clone(),
                group_id: context.group_id.clone(),
                media_kind: context.media_kind,
                is_inviting: context.is_inviting,
                offers: report.offers.clone(),
                errors: report.errors.clone(),
            });
        }

        context.reply(Ok(report));

        for peer_id in settled {
            self.drain_deferred(&peer_id).await;
        }
    }
}
