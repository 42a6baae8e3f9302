//! Transport loss, grace timers, departures and connection rebuilds

use super::negotiation::OfferIntent;
use super::{CallSession, Internal};
use crate::events::OutboundEvent;
use crate::model::{MediaKind, PeerId};
use crate::peer::PeerPhase;
use tracing::{debug, info, instrument, warn};

impl CallSession {
    /// Start the grace timer for a peer whose transport dropped
    ///
    /// A peer that already has a running timer is left alone.
    pub(super) fn on_transport_disconnected(&mut self, peer_id: PeerId, is_self: bool) {
        let is_self = is_self || self.store.peers.is_self(&peer_id);
        if !is_self && !self.store.peers.contains(&peer_id) {
            debug!("Ignoring disconnect of unknown peer {}", peer_id);
            return;
        }

        let tx = self.internal_tx.clone();
        let timer_peer = peer_id.clone();
        let armed = self.store.timers.arm(
            &peer_id,
            is_self,
            self.config.disconnect_grace(),
            move |token| {
                let _ = tx.send(Internal::DisconnectTimerFired {
                    peer_id: timer_peer,
                    token,
                });
            },
        );

        match armed {
            Ok(_) => {
                if let Some(entry) = self.store.peers.get_mut(&peer_id) {
                    entry.set_phase(PeerPhase::Disconnected);
                }
            }
            Err(e) => debug!("{}", e),
        }
    }

    pub(super) fn on_transport_reconnected(&mut self, peer_id: PeerId) {
        if self.store.timers.cancel(&peer_id) {
            info!("Peer {} reconnected within the grace period", peer_id);
        }
        if let Some(entry) = self.store.peers.get_mut(&peer_id) {
            if entry.phase == PeerPhase::Disconnected {
                entry.set_phase(PeerPhase::Connected);
            }
        }
    }

    pub(super) async fn on_disconnect_timer_fired(&mut self, peer_id: PeerId, token: u64) {
        let Some(is_self) = self.store.timers.fire(&peer_id, token) else {
            debug!("Ignoring stale disconnect timer for {}", peer_id);
            return;
        };

        if is_self {
            warn!("Local transport did not recover within the grace period, ending call");
            self.hang_up().await;
            return;
        }

        let duration_secs = self.store.call.elapsed_secs();
        warn!(
            "Peer {} did not reconnect within the grace period",
            peer_id
        );
        self.events.emit(OutboundEvent::PeerDisconnected {
            channel: self.store.call.channel.clone(),
            user_id: peer_id.clone(),
            duration_secs,
        });
        self.depart_peer(&peer_id, true).await;
    }

    /// Remove a peer from the call
    ///
    /// `announce` controls the `participant_left` and `membership_changed`
    /// events; rejoin tears down silently.
    pub(super) async fn depart_peer(&mut self, peer_id: &PeerId, announce: bool) {
        if self.store.peers.is_self(peer_id) {
            return;
        }

        let was_member = self.store.peers.contains(peer_id);
        self.store.timers.forget(peer_id);
        self.store.pending_offers.remove(peer_id);

        if !was_member {
            self.store.candidates.clear_peer(peer_id);
            debug!("Peer {} left without a connection", peer_id);
            return;
        }

        if let Some(entry) = self.store.peers.get_mut(peer_id) {
            entry.set_phase(PeerPhase::Departed);
        }
        self.release_connection(peer_id).await;
        self.store.candidates.clear_peer(peer_id);
        info!("Peer {} departed", peer_id);

        if announce {
            let channel = self.store.call.channel.clone();
            self.events.emit(OutboundEvent::ParticipantLeft {
                channel: channel.clone(),
                user_id: peer_id.clone(),
            });
            self.events.emit(OutboundEvent::MembershipChanged {
                channel,
                user_id: peer_id.clone(),
                joined: false,
                active: false,
            });
        }
    }

    /// Rebuild a peer that asked to rejoin
    #[instrument(skip(self, peer_id), fields(peer_id = %peer_id))]
    pub(super) async fn on_rejoin(&mut self, peer_id: PeerId) {
        if self.store.peers.is_self(&peer_id) {
            return;
        }
        info!("Peer {} rejoining", peer_id);
        self.depart_peer(&peer_id, false).await;
        self.store.candidates.clear_outgoing(&peer_id);
        self.renegotiate(peer_id, OfferIntent::fresh()).await;
    }

    /// Tear down and re-offer every remote peer
    ///
    /// Queued remote candidates are kept for the new connections.
    #[instrument(skip(self))]
    pub(super) async fn restart_all_connections(&mut self) {
        let peers = self.store.peers.peer_ids();
        warn!("Restarting {} peer connections", peers.len());

        for peer_id in peers {
            self.store.timers.cancel(&peer_id);
            self.release_connection(&peer_id).await;
            self.begin_local_offer(peer_id.clone(), OfferIntent::restart())
                .await;
            if let Some(entry) = self.store.peers.get_mut(&peer_id) {
                entry.rebuilt_by_restart = true;
            }
        }
    }

    /// Switch the call to video and rebuild the peer's connection with it
    #[instrument(skip(self, peer_id), fields(peer_id = %peer_id))]
    pub(super) async fn upgrade_to_video(&mut self, peer_id: PeerId, video_request_accepted: bool) {
        info!(
            "Upgrading call with {} to video (accepted={})",
            peer_id, video_request_accepted
        );
        self.store.call.call_type = MediaKind::Video;
        self.store.call.video_enabled = true;
        self.renegotiate(peer_id, OfferIntent::upgrade(video_request_accepted))
            .await;
    }
}
