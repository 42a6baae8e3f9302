//! Media engine seam
//!
//! The session never talks to a WebRTC stack directly. Everything it needs
//! from one (peer connections, SDP, ICE, local tracks) goes through the
//! traits in this module, and everything the stack reports back (local
//! candidates, ICE state, remote streams) arrives as an [`EngineEvent`]
//! posted through the connection's [`PeerObserver`].
//!
//! Two engines ship with the crate:
//!
//! - [`loopback::LoopbackEngine`]: deterministic in-memory engine with fault
//!   injection, used by tests and the `call_sim` binary
//! - `webrtc_rs::WebRtcEngine` (feature `webrtc-engine`): webrtc-rs peer
//!   connections

pub mod loopback;
#[cfg(feature = "webrtc-engine")]
pub mod webrtc_rs;

use crate::config::IceConfig;
use crate::model::{Candidate, MediaConstraints, MediaKind, PeerId, SessionDescription};
use crate::session::Internal;
use crate::Result;
use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Identifies one connection instance of a peer
///
/// A peer that is rebuilt (restart, rejoin, upgrade) gets a fresh id, so
/// completions and engine events of the old instance can be told apart.
pub type ConnectionId = uuid::Uuid;

/// ICE connection state reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Remote media track reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
}

/// Remote media stream attached to a connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteStream {
    pub stream_id: String,
    pub audio: Option<RemoteTrack>,
    pub video: Option<RemoteTrack>,
}

impl RemoteStream {
    /// Whether the stream carries the track a call of `kind` needs
    pub fn has_track_for(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio.is_some(),
            MediaKind::Video => self.video.is_some(),
        }
    }
}

/// Events the engine reports for one connection
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A local ICE candidate was gathered
    LocalCandidate(Candidate),
    /// The ICE connection state changed
    IceConnectionState(IceConnectionState),
    /// The remote side attached a media stream
    StreamAdded(RemoteStream),
}

/// Sink the engine uses to report [`EngineEvent`]s for one connection
///
/// Events are posted into the session loop, never handled on the engine's
/// callback thread.
#[derive(Clone)]
pub struct PeerObserver {
    peer_id: PeerId,
    connection_id: ConnectionId,
    tx: mpsc::UnboundedSender<Internal>,
}

impl PeerObserver {
    pub(crate) fn new(
        peer_id: PeerId,
        connection_id: ConnectionId,
        tx: mpsc::UnboundedSender<Internal>,
    ) -> Self {
        Self {
            peer_id,
            connection_id,
            tx,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Post an event to the session
    ///
    /// Returns `false` once the session is gone.
    pub fn notify(&self, event: EngineEvent) -> bool {
        self.tx
            .send(Internal::Engine {
                peer_id: self.peer_id.clone(),
                connection_id: self.connection_id,
                event,
            })
            .is_ok()
    }
}

impl fmt::Debug for PeerObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerObserver")
            .field("peer_id", &self.peer_id)
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

/// Local capture track shared by every connection of a session
pub trait LocalTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    /// Enable or disable sending (mute)
    fn set_enabled(&self, enabled: bool);

    fn is_enabled(&self) -> bool;

    /// Downcast hook for engines that need their concrete track type back
    fn as_any(&self) -> &dyn Any;
}

/// One peer connection owned by the session's registry
#[async_trait]
pub trait PeerHandle: Send + Sync {
    /// Attach a local track for sending
    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<()>;

    async fn create_offer(&self, constraints: MediaConstraints) -> Result<SessionDescription>;

    async fn create_answer(&self, constraints: MediaConstraints) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Apply a remote ICE candidate
    ///
    /// # Errors
    ///
    /// Returns [`Error::CandidateApplyFailure`](crate::Error::CandidateApplyFailure)
    /// when the engine rejects the candidate.
    async fn add_ice_candidate(&self, candidate: Candidate) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Factory for connections and local tracks
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Create a new connection for `peer_id`
    ///
    /// The engine keeps `observer` and reports this connection's events
    /// through it.
    async fn create_connection(
        &self,
        peer_id: &PeerId,
        ice: &IceConfig,
        observer: PeerObserver,
    ) -> Result<Arc<dyn PeerHandle>>;

    /// Create a local capture track
    fn create_local_track(
        &self,
        kind: MediaKind,
        track_id: &str,
        stream_id: &str,
    ) -> Result<Arc<dyn LocalTrack>>;
}

/// Binds remote video tracks to rendering surfaces
pub trait VideoSurfaceBinder: Send + Sync {
    fn bind_track_to_surface(&self, peer_id: &PeerId, track: &RemoteTrack);

    /// Drop whatever surface is bound for `peer_id`
    fn release_surface(&self, peer_id: &PeerId);
}

/// Surface binder for headless sessions
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSurfaceBinder;

impl VideoSurfaceBinder for NoopSurfaceBinder {
    fn bind_track_to_surface(&self, _peer_id: &PeerId, _track: &RemoteTrack) {}

    fn release_surface(&self, _peer_id: &PeerId) {}
}
