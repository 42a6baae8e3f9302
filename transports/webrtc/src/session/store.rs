//! Session-scoped state
//!
//! Everything a call knows lives in one [`SessionStore`] owned by the
//! session loop. Nothing here is shared or global.

use super::negotiation::OfferContext;
use crate::config::CallConfig;
use crate::engine::{LocalTrack, MediaEngine};
use crate::model::{InitiateType, MediaKind, PeerId};
use crate::peer::{CandidateBuffer, DisconnectTimers, PeerInfo, PeerRegistry};
use crate::{Error, Result};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::info;

/// Call-wide identity and flags
#[derive(Debug, Default)]
pub(crate) struct CallInfo {
    pub call_type: MediaKind,
    pub initiate_type: InitiateType,
    pub channel: String,
    pub group_id: String,
    pub audio_muted: bool,
    pub video_muted: bool,
    pub video_enabled: bool,
    /// Terminal: once set, no further signaling is processed
    pub hung_up: bool,
    pub started_at: Option<Instant>,
}

impl CallInfo {
    pub fn mark_started(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
    }

    /// Take the channel and group of an incoming call unless already set
    pub fn adopt_identity(&mut self, channel: Option<&str>, group_id: Option<&str>) {
        if let Some(channel) = channel {
            if self.channel.is_empty() {
                self.channel = channel.to_string();
            }
        }
        if let Some(group_id) = group_id {
            if self.group_id.is_empty() {
                self.group_id = group_id.to_string();
            }
        }
    }

    pub fn elapsed_secs(&self) -> u64 {
        self.started_at
            .map(|at| at.elapsed().as_secs())
            .unwrap_or(0)
    }
}

/// Observable state of a local track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    NotStarted,
    Active,
    Ended,
}

enum TrackSlot {
    NotStarted,
    Active(Arc<dyn LocalTrack>),
    Ended,
}

/// The session's shared local tracks, created lazily
pub(crate) struct LocalMedia {
    audio: TrackSlot,
    video: TrackSlot,
    /// A track went live since the last [`LocalMedia::take_activated`]
    activated: bool,
}

impl LocalMedia {
    pub fn new() -> Self {
        Self {
            audio: TrackSlot::NotStarted,
            video: TrackSlot::NotStarted,
            activated: false,
        }
    }

    fn slot(&self, kind: MediaKind) -> &TrackSlot {
        match kind {
            MediaKind::Audio => &self.audio,
            MediaKind::Video => &self.video,
        }
    }

    pub fn state(&self, kind: MediaKind) -> TrackState {
        match self.slot(kind) {
            TrackSlot::NotStarted => TrackState::NotStarted,
            TrackSlot::Active(_) => TrackState::Active,
            TrackSlot::Ended => TrackState::Ended,
        }
    }

    /// Whether offers of `kind` can be answered right away
    pub fn is_ready(&self, kind: MediaKind) -> bool {
        self.state(kind) == TrackState::Active
    }

    pub fn track(&self, kind: MediaKind) -> Option<Arc<dyn LocalTrack>> {
        match self.slot(kind) {
            TrackSlot::Active(track) => Some(track.clone()),
            _ => None,
        }
    }

    /// Return the shared track of `kind`, creating it on first use
    ///
    /// # Errors
    ///
    /// Fails when the engine cannot create the track or the session already
    /// released its media.
    pub fn ensure(
        &mut self,
        kind: MediaKind,
        engine: &dyn MediaEngine,
        config: &CallConfig,
        enabled: bool,
    ) -> Result<Arc<dyn LocalTrack>> {
        let slot = match kind {
            MediaKind::Audio => &mut self.audio,
            MediaKind::Video => &mut self.video,
        };
        match slot {
            TrackSlot::Active(track) => Ok(track.clone()),
            TrackSlot::Ended => Err(Error::MediaTrackError(format!(
                "local {:?} track already released",
                kind
            ))),
            TrackSlot::NotStarted => {
                let track_id = match kind {
                    MediaKind::Audio => &config.audio_track_id,
                    MediaKind::Video => &config.video_track_id,
                };
                let track =
                    engine.create_local_track(kind, track_id, config.self_peer_id.as_str())?;
                track.set_enabled(enabled);
                info!("Created local {:?} track {}", kind, track_id);
                *slot = TrackSlot::Active(track.clone());
                self.activated = true;
                Ok(track)
            }
        }
    }

    /// Whether a track went live since the last call
    pub fn take_activated(&mut self) -> bool {
        std::mem::take(&mut self.activated)
    }

    /// Disable and drop both tracks for good
    pub fn release(&mut self) {
        for slot in [&mut self.audio, &mut self.video] {
            if let TrackSlot::Active(track) = slot {
                track.set_enabled(false);
            }
            *slot = TrackSlot::Ended;
        }
    }
}

/// Remote offers parked until local media for their kind is ready
#[derive(Debug, Default)]
pub(crate) struct PendingOffers {
    offers: Vec<(PeerId, OfferContext)>,
}

impl PendingOffers {
    /// Park an offer; a newer offer from the same peer replaces the older one
    pub fn push(&mut self, peer_id: PeerId, context: OfferContext) {
        match self.offers.iter_mut().find(|(id, _)| *id == peer_id) {
            Some(existing) => existing.1 = context,
            None => self.offers.push((peer_id, context)),
        }
    }

    /// Remove and return, in arrival order, every offer `ready` accepts
    pub fn take_ready<F>(&mut self, ready: F) -> Vec<(PeerId, OfferContext)>
    where
        F: Fn(MediaKind) -> bool,
    {
        let (taken, kept) = std::mem::take(&mut self.offers)
            .into_iter()
            .partition(|(_, context)| ready(context.media_kind));
        self.offers = kept;
        taken
    }

    pub fn remove(&mut self, peer_id: &PeerId) {
        self.offers.retain(|(id, _)| id != peer_id);
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.offers.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn clear(&mut self) {
        self.offers.clear();
    }
}

pub(crate) struct SessionStore {
    pub call: CallInfo,
    pub peers: PeerRegistry,
    pub candidates: CandidateBuffer,
    pub timers: DisconnectTimers,
    pub local_media: LocalMedia,
    pub pending_offers: PendingOffers,
}

impl SessionStore {
    pub fn new(config: &CallConfig) -> Self {
        Self {
            call: CallInfo::default(),
            peers: PeerRegistry::new(config.max_peers, config.self_peer_id.clone()),
            candidates: CandidateBuffer::new(),
            timers: DisconnectTimers::new(),
            local_media: LocalMedia::new(),
            pending_offers: PendingOffers::default(),
        }
    }

    pub fn snapshot(&self, self_peer_id: &PeerId) -> SessionSnapshot {
        let peers = self
            .peers
            .peer_ids()
            .into_iter()
            .filter_map(|peer_id| {
                self.peers.describe(&peer_id).map(|mut info| {
                    info.pending_candidates = self.candidates.pending_len(&peer_id);
                    info.applying_candidates = self.candidates.is_applying(&peer_id);
                    info.withheld_candidates = self.candidates.withheld_len(&peer_id);
                    info.disconnect_timer_active = self.timers.is_active(&peer_id);
                    info
                })
            })
            .collect();

        SessionSnapshot {
            channel: self.call.channel.clone(),
            group_id: self.call.group_id.clone(),
            call_type: self.call.call_type,
            initiate_type: self.call.initiate_type,
            audio_muted: self.call.audio_muted,
            video_muted: self.call.video_muted,
            video_enabled: self.call.video_enabled,
            hung_up: self.call.hung_up,
            local_audio: self.local_media.state(MediaKind::Audio),
            local_video: self.local_media.state(MediaKind::Video),
            peers,
            pending_offers: self.pending_offers.peers(),
            candidate_backlog: self.candidates.backlog(),
            self_disconnect_pending: self.timers.is_active(self_peer_id),
            active_timers: self.timers.active_count(),
        }
    }
}

/// Read-only view of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub channel: String,
    pub group_id: String,
    pub call_type: MediaKind,
    pub initiate_type: InitiateType,
    pub audio_muted: bool,
    pub video_muted: bool,
    pub video_enabled: bool,
    pub hung_up: bool,
    pub local_audio: TrackState,
    pub local_video: TrackState,
    /// Remote peers with a live connection, sorted by id
    pub peers: Vec<PeerInfo>,
    /// Peers whose offer waits for local media
    pub pending_offers: Vec<PeerId>,
    /// Queued remote candidates per peer, including peers without a connection
    pub candidate_backlog: Vec<(PeerId, usize)>,
    pub self_disconnect_pending: bool,
    pub active_timers: usize,
}

impl SessionSnapshot {
    pub fn peer(&self, peer_id: &str) -> Option<&PeerInfo> {
        self.peers.iter().find(|info| info.peer_id.as_str() == peer_id)
    }

    /// Current members of the call
    pub fn members(&self) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|info| info.phase.is_live())
            .map(|info| info.peer_id.clone())
            .collect()
    }

    pub fn backlog_for(&self, peer_id: &str) -> usize {
        self.candidate_backlog
            .iter()
            .find(|(id, _)| id.as_str() == peer_id)
            .map(|(_, count)| *count)
            .unwrap_or(0)
    }
}
