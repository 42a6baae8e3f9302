//! Call-wide controls: local media, mute, remote streams and hang-up

use super::CallSession;
use crate::engine::{ConnectionId, EngineEvent, IceConnectionState, RemoteStream};
use crate::events::OutboundEvent;
use crate::model::{MediaKind, PeerId};
use crate::peer::PeerPhase;
use tracing::{debug, info, instrument, warn};

impl CallSession {
    /// Prepare local tracks for `kind` and replay offers waiting on them
    pub(super) async fn on_local_media_ready(&mut self, kind: MediaKind) {
        let kinds: &[MediaKind] = match kind {
            MediaKind::Audio => &[MediaKind::Audio],
            MediaKind::Video => &[MediaKind::Audio, MediaKind::Video],
        };
        for &track_kind in kinds {
            let enabled = match track_kind {
                MediaKind::Audio => !self.store.call.audio_muted,
                MediaKind::Video => !self.store.call.video_muted,
            };
            if let Err(e) = self.store.local_media.ensure(
                track_kind,
                self.engine.as_ref(),
                &self.config,
                enabled,
            ) {
                warn!("Failed to prepare local {:?} track: {}", track_kind, e);
                return;
            }
        }
        self.replay_pending_offers().await;
    }

    /// Process every queued offer whose local media is now live
    ///
    /// Tracks may also go live while offering, so this runs after every
    /// message that activated one.
    pub(super) async fn replay_pending_offers(&mut self) {
        self.store.local_media.take_activated();
        loop {
            let local_media = &self.store.local_media;
            let ready = self
                .store
                .pending_offers
                .take_ready(|kind| local_media.is_ready(kind));
            for (peer_id, context) in ready {
                info!("Replaying queued offer from {}", peer_id);
                self.on_remote_offer(peer_id, context).await;
            }
            // answering may have started the other track
            if !self.store.local_media.take_activated() {
                break;
            }
        }
    }

    pub(super) fn join_channel(&mut self, channel: String, group_id: String) {
        info!("Joined channel {} (group {})", channel, group_id);
        let call = &mut self.store.call;
        call.channel = channel;
        call.group_id = group_id;
    }

    pub(super) fn set_muted(&mut self, kind: MediaKind, muted: bool) {
        match kind {
            MediaKind::Audio => self.store.call.audio_muted = muted,
            MediaKind::Video => self.store.call.video_muted = muted,
        }
        if let Some(track) = self.store.local_media.track(kind) {
            track.set_enabled(!muted);
        }

        let recipients = self.store.peers.peer_ids();
        debug!(
            "Local {:?} muted={}, notifying {} peers",
            kind,
            muted,
            recipients.len()
        );
        self.events.emit(OutboundEvent::MuteStatusBroadcast {
            channel: self.store.call.channel.clone(),
            recipients,
            kind,
            muted,
        });
    }

    pub(super) fn on_remote_mute(&mut self, peer_id: PeerId, kind: MediaKind, muted: bool) {
        let Some(entry) = self.store.peers.get_mut(&peer_id) else {
            debug!("Dropping mute status from unknown peer {}", peer_id);
            return;
        };
        match kind {
            MediaKind::Audio => entry.remote_audio_muted = muted,
            MediaKind::Video => entry.remote_video_muted = muted,
        }
        self.events.emit(OutboundEvent::PeerMuteChanged {
            channel: self.store.call.channel.clone(),
            user_id: peer_id,
            kind,
            muted,
        });
    }

    // ===== Engine events =====

    pub(super) async fn on_engine_event(
        &mut self,
        peer_id: PeerId,
        connection_id: ConnectionId,
        event: EngineEvent,
    ) {
        if self.store.peers.current_mut(&peer_id, connection_id).is_none() {
            debug!("Dropping engine event of a replaced connection to {}", peer_id);
            return;
        }

        match event {
            EngineEvent::LocalCandidate(candidate) => self.on_local_candidate(peer_id, candidate),
            EngineEvent::IceConnectionState(state) => self.on_ice_state(peer_id, state),
            EngineEvent::StreamAdded(stream) => self.on_stream_added(peer_id, stream).await,
        }
    }

    fn on_ice_state(&mut self, peer_id: PeerId, state: IceConnectionState) {
        debug!("ICE state for {}: {:?}", peer_id, state);
        match state {
            IceConnectionState::Disconnected => self.on_transport_disconnected(peer_id, false),
            IceConnectionState::Connected | IceConnectionState::Completed => {
                self.on_transport_reconnected(peer_id)
            }
            IceConnectionState::Failed => warn!("ICE failed for peer {}", peer_id),
            _ => {}
        }
    }

    /// Remote media arrived on a peer's connection
    ///
    /// A stream missing the track the call needs rebuilds every connection,
    /// once: connections built by that restart are left as they are.
    async fn on_stream_added(&mut self, peer_id: PeerId, stream: RemoteStream) {
        let call_type = self.store.call.call_type;
        let Some(entry) = self.store.peers.get_mut(&peer_id) else {
            return;
        };

        if let Some(video) = &stream.video {
            entry.remote_video = Some(video.clone());
            self.surfaces.bind_track_to_surface(&peer_id, video);
        }

        if !stream.has_track_for(call_type) {
            if entry.rebuilt_by_restart {
                warn!(
                    "Stream {} from {} still has no {:?} track after a restart",
                    stream.stream_id, peer_id, call_type
                );
                return;
            }
            // TODO: rebuild only this peer once clients tolerate a single-peer restart
            warn!(
                "Stream {} from {} has no {:?} track, restarting all connections",
                stream.stream_id, peer_id, call_type
            );
            self.restart_all_connections().await;
            return;
        }

        let Some(entry) = self.store.peers.get_mut(&peer_id) else {
            return;
        };
        entry.set_phase(PeerPhase::Connected);
        info!("Peer {} connected with stream {}", peer_id, stream.stream_id);

        self.release_outgoing(&peer_id);
        self.events.emit(OutboundEvent::MembershipChanged {
            channel: self.store.call.channel.clone(),
            user_id: peer_id,
            joined: true,
            active: true,
        });
    }

    // ===== Teardown =====

    /// End the call
    ///
    /// Only the first call does anything; it returns `true`.
    #[instrument(skip(self))]
    pub(super) async fn hang_up(&mut self) -> bool {
        if self.store.call.hung_up {
            debug!("Call already hung up");
            return false;
        }
        self.store.call.hung_up = true;

        let channel = self.store.call.channel.clone();
        let recipients = self.store.peers.peer_ids();
        info!(
            "Hanging up call on channel {} with {} peers",
            channel,
            recipients.len()
        );
        self.events.emit(OutboundEvent::CallCut {
            channel,
            recipients,
        });

        for entry in self.store.peers.drain() {
            self.surfaces.release_surface(&entry.peer_id);
            if let Err(e) = entry.handle.close().await {
                warn!("Failed to close connection to {}: {}", entry.peer_id, e);
            }
        }

        self.store.candidates.clear();
        let cancelled = self.store.timers.cancel_all();
        if cancelled > 0 {
            debug!("Cancelled {} disconnect timers", cancelled);
        }
        self.store.pending_offers.clear();
        self.store.local_media.release();

        self.events.emit(OutboundEvent::CallEnded { ended: true });
        true
    }
}
