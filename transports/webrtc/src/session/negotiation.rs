//! Offer/answer negotiation and candidate flow
//!
//! Engine calls run in spawned tasks; their results come back as
//! [`NegotiationStep`]s tagged with the connection id they were issued
//! for. A peer has at most one negotiation operation in flight, anything
//! arriving meanwhile is deferred and replayed in order.

use super::CallSession;
use crate::engine::{ConnectionId, PeerHandle, PeerObserver};
use crate::events::{NegotiationStage, OutboundEvent};
use crate::model::{
    Candidate, InitiateType, MediaConstraints, MediaKind, PeerId, SessionDescription,
};
use crate::peer::{FlushStart, NegotiationKind, NegotiationSide, PeerEntry, PeerPhase};
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// A remote offer as received
#[derive(Debug, Clone)]
pub(crate) struct OfferContext {
    pub sdp: String,
    pub media_kind: MediaKind,
    pub initiate_type: InitiateType,
    pub is_inviting: bool,
    pub is_rejoin: bool,
    pub channel: Option<String>,
    pub group_id: Option<String>,
}

/// How a single-peer local offer is produced and announced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct OfferIntent {
    /// Replace an existing connection
    pub force_new: bool,
    pub is_upgrade: bool,
    pub video_request_accepted: bool,
}

impl OfferIntent {
    /// Offer only if the peer has no connection yet
    pub fn fresh() -> Self {
        Self::default()
    }

    /// Rebuild the connection and offer again
    pub fn restart() -> Self {
        Self {
            force_new: true,
            is_upgrade: true,
            video_request_accepted: false,
        }
    }

    pub fn upgrade(video_request_accepted: bool) -> Self {
        Self {
            force_new: true,
            is_upgrade: true,
            video_request_accepted,
        }
    }
}

/// Negotiation request parked behind an in-flight operation
#[derive(Debug, Clone)]
pub(crate) enum DeferredOp {
    RemoteOffer(OfferContext),
    RemoteAnswer(String),
    LocalOffer(OfferIntent),
}

/// Completion of an engine call, posted back into the session loop
#[derive(Debug)]
pub(crate) enum NegotiationStep {
    RemoteOfferApplied {
        context: OfferContext,
        result: Result<()>,
    },
    AnswerReady(Result<String>),
    LocalOfferReady {
        intent: OfferIntent,
        result: Result<String>,
    },
    RemoteAnswerApplied(Result<()>),
    CandidatesApplied {
        failed: Vec<Candidate>,
    },
}

impl NegotiationStep {
    fn name(&self) -> &'static str {
        match self {
            NegotiationStep::RemoteOfferApplied { .. } => "remote offer",
            NegotiationStep::AnswerReady(_) => "answer",
            NegotiationStep::LocalOfferReady { .. } => "local offer",
            NegotiationStep::RemoteAnswerApplied(_) => "remote answer",
            NegotiationStep::CandidatesApplied { .. } => "candidate batch",
        }
    }
}

/// Create an offer and install it as the local description
pub(super) async fn create_local_offer(
    handle: Arc<dyn PeerHandle>,
    constraints: MediaConstraints,
) -> Result<String> {
    let offer = handle.create_offer(constraints).await?;
    let sdp = offer.sdp.clone();
    handle.set_local_description(offer).await?;
    Ok(sdp)
}

async fn answer_remote_offer(
    handle: Arc<dyn PeerHandle>,
    constraints: MediaConstraints,
) -> Result<String> {
    let answer = handle.create_answer(constraints).await?;
    let sdp = answer.sdp.clone();
    handle.set_local_description(answer).await?;
    Ok(sdp)
}

impl CallSession {
    // ===== Connections =====

    /// Return the peer's connection, building a new one when absent or forced
    ///
    /// A new connection gets the session's shared audio track and, for
    /// video, the shared video track. A replaced connection is closed first.
    #[instrument(skip(self, peer_id), fields(peer_id = %peer_id))]
    pub(super) async fn create_or_reuse(
        &mut self,
        peer_id: &PeerId,
        media_kind: MediaKind,
        force_new: bool,
    ) -> Result<ConnectionId> {
        if !force_new {
            if let Some(entry) = self.store.peers.get(peer_id) {
                debug!(
                    "Reusing connection {} for peer {}",
                    entry.connection_id, peer_id
                );
                return Ok(entry.connection_id);
            }
        }

        self.store.peers.ensure_capacity(peer_id)?;
        if self.release_connection(peer_id).await {
            info!("Replacing connection for peer {}", peer_id);
        }

        let audio_enabled = !self.store.call.audio_muted;
        let video_enabled = !self.store.call.video_muted;
        let mut tracks = vec![self.store.local_media.ensure(
            MediaKind::Audio,
            self.engine.as_ref(),
            &self.config,
            audio_enabled,
        )?];
        if media_kind == MediaKind::Video {
            tracks.push(self.store.local_media.ensure(
                MediaKind::Video,
                self.engine.as_ref(),
                &self.config,
                video_enabled,
            )?);
        }

        let connection_id = uuid::Uuid::new_v4();
        let observer = PeerObserver::new(peer_id.clone(), connection_id, self.internal_tx.clone());
        let handle = self
            .engine
            .create_connection(peer_id, &self.config.ice_config(), observer)
            .await?;

        for track in tracks {
            if let Err(e) = handle.add_track(track).await {
                if let Err(close_err) = handle.close().await {
                    warn!("Failed to close half-built connection to {}: {}", peer_id, close_err);
                }
                return Err(e);
            }
        }

        self.store
            .peers
            .insert(PeerEntry::new(peer_id.clone(), handle, connection_id, media_kind));
        Ok(connection_id)
    }

    /// Remove and close the peer's connection
    ///
    /// Queued inbound candidates survive for the next connection; withheld
    /// outgoing ones belong to the old connection and are dropped.
    pub(super) async fn release_connection(&mut self, peer_id: &PeerId) -> bool {
        let Some(entry) = self.store.peers.remove(peer_id) else {
            return false;
        };

        self.store.candidates.abandon_flush(peer_id);
        self.store.candidates.clear_outgoing(peer_id);
        self.surfaces.release_surface(peer_id);
        if !entry.deferred.is_empty() {
            debug!(
                "Dropping {} deferred negotiation ops for peer {}",
                entry.deferred.len(),
                peer_id
            );
        }
        if let Err(e) = entry.handle.close().await {
            warn!("Failed to close connection to {}: {}", peer_id, e);
        }
        true
    }

    fn spawn_step<F>(&self, peer_id: PeerId, connection_id: ConnectionId, work: F)
    where
        F: std::future::Future<Output = NegotiationStep> + Send + 'static,
    {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let step = work.await;
            let _ = tx.send(super::Internal::Step {
                peer_id,
                connection_id,
                step,
            });
        });
    }

    pub(super) fn report_failure(&self, peer_id: &PeerId, stage: NegotiationStage, error: &Error) {
        warn!(
            "Negotiation with peer {} failed at {:?}: {}",
            peer_id, stage, error
        );
        self.events.emit(OutboundEvent::NegotiationFailed {
            channel: self.store.call.channel.clone(),
            user_id: peer_id.clone(),
            stage,
            reason: error.to_string(),
        });
    }

    // ===== Remote offer =====

    #[instrument(skip(self, peer_id, context), fields(peer_id = %peer_id, media = ?context.media_kind))]
    pub(super) async fn on_remote_offer(&mut self, peer_id: PeerId, context: OfferContext) {
        if self.store.peers.is_self(&peer_id) {
            debug!("Ignoring offer addressed from the local user");
            return;
        }

        let call = &mut self.store.call;
        call.adopt_identity(context.channel.as_deref(), context.group_id.as_deref());
        call.call_type = context.media_kind;
        call.initiate_type = context.initiate_type;
        if !context.is_inviting {
            call.video_muted = false;
            call.video_enabled = context.media_kind == MediaKind::Video;
        }
        call.mark_started();

        if !self.store.local_media.is_ready(context.media_kind) {
            info!(
                "Local {:?} media not ready, queueing offer from {}",
                context.media_kind, peer_id
            );
            self.store.pending_offers.push(peer_id, context);
            return;
        }

        if let Some(entry) = self.store.peers.get_mut(&peer_id) {
            if entry.is_busy() {
                debug!(
                    "Deferring offer from {} behind {:?}",
                    peer_id, entry.in_flight
                );
                entry.deferred.push_back(DeferredOp::RemoteOffer(context));
                return;
            }
        }

        self.begin_remote_offer(peer_id, context).await;
    }

    async fn begin_remote_offer(&mut self, peer_id: PeerId, context: OfferContext) {
        if context.is_rejoin {
            self.store.timers.cancel(&peer_id);
        }

        let connection_id = match self
            .create_or_reuse(&peer_id, context.media_kind, context.is_rejoin)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.report_failure(&peer_id, NegotiationStage::CreateConnection, &e);
                return;
            }
        };

        let Some(entry) = self.store.peers.get_mut(&peer_id) else {
            return;
        };
        entry.in_flight = Some(NegotiationKind::RemoteOffer);
        let handle = entry.handle.clone();
        let description = SessionDescription::offer(context.sdp.clone());

        self.spawn_step(peer_id, connection_id, async move {
            let result = handle.set_remote_description(description).await;
            NegotiationStep::RemoteOfferApplied { context, result }
        });
    }

    fn on_remote_offer_applied(
        &mut self,
        peer_id: &PeerId,
        connection_id: ConnectionId,
        context: OfferContext,
        result: Result<()>,
    ) {
        let Some(entry) = self.store.peers.get_mut(peer_id) else {
            return;
        };

        if let Err(e) = result {
            entry.in_flight = None;
            self.report_failure(peer_id, NegotiationStage::SetRemoteOffer, &e);
            return;
        }

        entry.remote_description_set = true;
        entry.set_phase(PeerPhase::Negotiating(NegotiationSide::Remote));
        let handle = entry.handle.clone();

        self.events.emit(OutboundEvent::OfferHandled {
            channel: self.store.call.channel.clone(),
            user_id: peer_id.clone(),
            group_id: self.store.call.group_id.clone(),
            is_inviting: context.is_inviting,
            is_rejoin: context.is_rejoin,
        });

        self.flush_candidates(peer_id);

        let constraints = MediaConstraints::for_call(self.store.call.call_type);
        self.spawn_step(peer_id.clone(), connection_id, async move {
            NegotiationStep::AnswerReady(answer_remote_offer(handle, constraints).await)
        });
    }

    fn on_answer_ready(&mut self, peer_id: &PeerId, result: Result<String>) {
        let Some(entry) = self.store.peers.get_mut(peer_id) else {
            return;
        };
        entry.in_flight = None;

        match result {
            Ok(sdp) => {
                info!("Answer ready for peer {}", peer_id);
                self.events.emit(OutboundEvent::AnswerReady {
                    channel: self.store.call.channel.clone(),
                    recipient: peer_id.clone(),
                    sdp,
                });
                self.release_outgoing(peer_id);
            }
            Err(e) => self.report_failure(peer_id, NegotiationStage::CreateAnswer, &e),
        }
    }

    // ===== Remote answer =====

    pub(super) fn on_remote_answer(&mut self, peer_id: PeerId, sdp: String) {
        let Some(entry) = self.store.peers.get_mut(&peer_id) else {
            debug!("Dropping answer from unknown peer {}", peer_id);
            return;
        };
        if entry.is_busy() {
            debug!(
                "Deferring answer from {} behind {:?}",
                peer_id, entry.in_flight
            );
            entry.deferred.push_back(DeferredOp::RemoteAnswer(sdp));
            return;
        }
        self.begin_remote_answer(peer_id, sdp);
    }

    fn begin_remote_answer(&mut self, peer_id: PeerId, sdp: String) {
        let Some(entry) = self.store.peers.get_mut(&peer_id) else {
            return;
        };
        entry.in_flight = Some(NegotiationKind::RemoteAnswer);
        let handle = entry.handle.clone();
        let connection_id = entry.connection_id;

        self.spawn_step(peer_id, connection_id, async move {
            let result = handle
                .set_remote_description(SessionDescription::answer(sdp))
                .await;
            NegotiationStep::RemoteAnswerApplied(result)
        });
    }

    fn on_remote_answer_applied(&mut self, peer_id: &PeerId, result: Result<()>) {
        let Some(entry) = self.store.peers.get_mut(peer_id) else {
            return;
        };
        entry.in_flight = None;

        match result {
            Ok(()) => {
                debug!("Remote answer applied for peer {}", peer_id);
                entry.remote_description_set = true;
                self.flush_candidates(peer_id);
                self.release_outgoing(peer_id);
            }
            Err(e) => self.report_failure(peer_id, NegotiationStage::SetRemoteAnswer, &e),
        }
    }

    // ===== Local offer =====

    /// Offer to one peer, creating its connection when needed
    ///
    /// Without `force_new`, a peer that already has a connection is left
    /// alone.
    pub(super) async fn renegotiate(&mut self, peer_id: PeerId, intent: OfferIntent) {
        if self.store.peers.is_self(&peer_id) {
            return;
        }
        if let Some(entry) = self.store.peers.get_mut(&peer_id) {
            if !intent.force_new {
                debug!("Connection to {} already exists, not offering", peer_id);
                return;
            }
            if entry.is_busy() {
                debug!(
                    "Deferring offer to {} behind {:?}",
                    peer_id, entry.in_flight
                );
                entry.deferred.push_back(DeferredOp::LocalOffer(intent));
                return;
            }
        }
        self.begin_local_offer(peer_id, intent).await;
    }

    pub(super) async fn begin_local_offer(&mut self, peer_id: PeerId, intent: OfferIntent) {
        let call_type = self.store.call.call_type;
        let connection_id = match self
            .create_or_reuse(&peer_id, call_type, intent.force_new)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.report_failure(&peer_id, NegotiationStage::CreateConnection, &e);
                return;
            }
        };

        let Some(entry) = self.store.peers.get_mut(&peer_id) else {
            return;
        };
        entry.in_flight = Some(NegotiationKind::LocalOffer);
        let handle = entry.handle.clone();
        let constraints = MediaConstraints::for_call(call_type);

        self.spawn_step(peer_id, connection_id, async move {
            let result = create_local_offer(handle, constraints).await;
            NegotiationStep::LocalOfferReady { intent, result }
        });
    }

    fn on_local_offer_ready(&mut self, peer_id: &PeerId, intent: OfferIntent, result: Result<String>) {
        let Some(entry) = self.store.peers.get_mut(peer_id) else {
            return;
        };
        entry.in_flight = None;

        match result {
            Ok(sdp) => {
                entry.set_phase(PeerPhase::Negotiating(NegotiationSide::Local));
                let media_kind = entry.media_kind;
                info!(
                    "Offer ready for peer {} (upgrade={})",
                    peer_id, intent.is_upgrade
                );
                self.events.emit(OutboundEvent::OfferReady {
                    channel: self.store.call.channel.clone(),
                    recipient: peer_id.clone(),
                    sdp,
                    media_kind,
                    is_upgrade: intent.is_upgrade,
                    video_request_accepted: intent.video_request_accepted,
                });
            }
            Err(e) => self.report_failure(peer_id, NegotiationStage::CreateOffer, &e),
        }
    }

    // ===== Step dispatch =====

    pub(super) async fn on_step(
        &mut self,
        peer_id: PeerId,
        connection_id: ConnectionId,
        step: NegotiationStep,
    ) {
        if self.store.peers.current_mut(&peer_id, connection_id).is_none() {
            debug!(
                "Dropping stale {} completion for peer {}",
                step.name(),
                peer_id
            );
            return;
        }

        match step {
            NegotiationStep::RemoteOfferApplied { context, result } => {
                self.on_remote_offer_applied(&peer_id, connection_id, context, result)
            }
            NegotiationStep::AnswerReady(result) => self.on_answer_ready(&peer_id, result),
            NegotiationStep::LocalOfferReady { intent, result } => {
                self.on_local_offer_ready(&peer_id, intent, result)
            }
            NegotiationStep::RemoteAnswerApplied(result) => {
                self.on_remote_answer_applied(&peer_id, result)
            }
            NegotiationStep::CandidatesApplied { failed } => {
                self.on_candidates_applied(&peer_id, failed)
            }
        }

        self.drain_deferred(&peer_id).await;
    }

    /// Replay deferred requests until one goes in flight
    pub(super) async fn drain_deferred(&mut self, peer_id: &PeerId) {
        loop {
            let op = match self.store.peers.get_mut(peer_id) {
                Some(entry) if !entry.is_busy() => match entry.deferred.pop_front() {
                    Some(op) => op,
                    None => return,
                },
                _ => return,
            };

            debug!("Replaying deferred {:?} for peer {}", op, peer_id);
            match op {
                DeferredOp::RemoteOffer(context) => {
                    self.begin_remote_offer(peer_id.clone(), context).await
                }
                DeferredOp::RemoteAnswer(sdp) => self.begin_remote_answer(peer_id.clone(), sdp),
                DeferredOp::LocalOffer(intent) => {
                    self.begin_local_offer(peer_id.clone(), intent).await
                }
            }
        }
    }

    // ===== Candidates =====

    /// Queue a remote candidate and apply it at once if the peer is ready
    pub(super) fn on_remote_candidate(&mut self, peer_id: PeerId, candidate: Candidate) {
        if self.store.peers.is_self(&peer_id) {
            return;
        }

        self.store.candidates.enqueue(&peer_id, candidate);
        let ready = self
            .store
            .peers
            .get(&peer_id)
            .map(|entry| entry.remote_description_set)
            .unwrap_or(false);

        if ready {
            self.apply_pending(&peer_id);
        } else {
            debug!(
                "Buffered candidate for {} ({} pending)",
                peer_id,
                self.store.candidates.pending_len(&peer_id)
            );
        }
    }

    /// Flush after the remote description was confirmed
    fn flush_candidates(&mut self, peer_id: &PeerId) {
        let Some(entry) = self.store.peers.get_mut(peer_id) else {
            debug!("No connection for {}, candidates stay queued", peer_id);
            return;
        };
        if !entry.remote_description_set {
            return;
        }
        entry.flush_count += 1;
        self.apply_pending(peer_id);
    }

    fn apply_pending(&mut self, peer_id: &PeerId) {
        let Some(entry) = self.store.peers.get(peer_id) else {
            return;
        };
        let handle = entry.handle.clone();
        let connection_id = entry.connection_id;

        let FlushStart::Batch(batch) = self.store.candidates.begin_flush(peer_id) else {
            return;
        };

        debug!("Applying {} candidates for peer {}", batch.len(), peer_id);
        let target = peer_id.clone();
        self.spawn_step(peer_id.clone(), connection_id, async move {
            let mut failed = Vec::new();
            for candidate in batch {
                if let Err(e) = handle.add_ice_candidate(candidate.clone()).await {
                    warn!("Failed to apply candidate for {}: {}", target, e);
                    failed.push(candidate);
                }
            }
            NegotiationStep::CandidatesApplied { failed }
        });
    }

    fn on_candidates_applied(&mut self, peer_id: &PeerId, failed: Vec<Candidate>) {
        if !failed.is_empty() {
            warn!(
                "{} candidates for peer {} re-queued for the next flush",
                failed.len(),
                peer_id
            );
        }
        if self.store.candidates.finish_flush(peer_id, failed) {
            self.apply_pending(peer_id);
        }
    }

    /// Share a locally gathered candidate, or hold it until it is safe
    pub(super) fn on_local_candidate(&mut self, peer_id: PeerId, candidate: Candidate) {
        let Some(entry) = self.store.peers.get(&peer_id) else {
            return;
        };
        if entry.outgoing_released {
            self.events.emit(OutboundEvent::CandidateReady {
                channel: self.store.call.channel.clone(),
                recipient: peer_id,
                candidate,
            });
        } else {
            self.store.candidates.hold_outgoing(&peer_id, candidate);
        }
    }

    /// Send every withheld local candidate and share new ones directly
    pub(super) fn release_outgoing(&mut self, peer_id: &PeerId) {
        let Some(entry) = self.store.peers.get_mut(peer_id) else {
            return;
        };
        entry.outgoing_released = true;

        let withheld = self.store.candidates.take_outgoing(peer_id);
        if !withheld.is_empty() {
            debug!(
                "Releasing {} withheld candidates to {}",
                withheld.len(),
                peer_id
            );
        }
        for candidate in withheld {
            self.events.emit(OutboundEvent::CandidateReady {
                channel: self.store.call.channel.clone(),
                recipient: peer_id.clone(),
                candidate,
            });
        }
    }
}
