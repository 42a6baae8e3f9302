//! In-memory media engine
//!
//! Behaves like a real engine where the session can observe it (candidates
//! are rejected before a remote description is set, closed connections
//! refuse work) and records every call so tests can assert on it. Faults
//! are injected per peer.

use super::{
    ConnectionId, EngineEvent, IceConnectionState, LocalTrack, MediaEngine, PeerHandle,
    PeerObserver, RemoteStream, RemoteTrack, VideoSurfaceBinder,
};
use crate::config::IceConfig;
use crate::model::{Candidate, MediaConstraints, MediaKind, PeerId, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Everything the loopback engine recorded for one peer, across connections
#[derive(Debug, Clone, Default)]
pub struct PeerRecord {
    pub connections_created: usize,
    pub connections_closed: usize,
    pub offers_created: usize,
    pub answers_created: usize,
    pub local_descriptions: Vec<SessionDescription>,
    pub remote_descriptions: Vec<SessionDescription>,
    pub applied_candidates: Vec<Candidate>,
    pub rejected_candidates: usize,
    /// Track ids attached to the latest connection
    pub attached_tracks: Vec<String>,
    pub last_constraints: Option<MediaConstraints>,
}

#[derive(Default)]
struct Faults {
    connections: HashSet<PeerId>,
    offers: HashSet<PeerId>,
    answers: HashSet<PeerId>,
    remote_descriptions: HashSet<PeerId>,
    /// Candidate sdp -> remaining rejections
    candidates: HashMap<String, u32>,
}

#[derive(Default)]
struct EngineState {
    records: HashMap<PeerId, PeerRecord>,
    observers: HashMap<PeerId, PeerObserver>,
    faults: Faults,
    tracks_created: HashMap<MediaKind, usize>,
    sdp_counter: u64,
}

/// Deterministic in-memory [`MediaEngine`]
#[derive(Clone, Default)]
pub struct LoopbackEngine {
    state: Arc<Mutex<EngineState>>,
    latency: Duration,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every async engine call by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    // ===== Fault injection =====

    pub fn fail_connections_for(&self, peer_id: impl Into<PeerId>) {
        self.state.lock().faults.connections.insert(peer_id.into());
    }

    pub fn fail_offers_for(&self, peer_id: impl Into<PeerId>) {
        self.state.lock().faults.offers.insert(peer_id.into());
    }

    pub fn fail_answers_for(&self, peer_id: impl Into<PeerId>) {
        self.state.lock().faults.answers.insert(peer_id.into());
    }

    pub fn fail_remote_descriptions_for(&self, peer_id: impl Into<PeerId>) {
        self.state
            .lock()
            .faults
            .remote_descriptions
            .insert(peer_id.into());
    }

    /// Reject the candidate with this sdp the next `times` applications
    pub fn reject_candidate(&self, sdp: impl Into<String>, times: u32) {
        self.state.lock().faults.candidates.insert(sdp.into(), times);
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults = Faults::default();
    }

    // ===== Inspection =====

    pub fn record(&self, peer_id: &PeerId) -> PeerRecord {
        self.state
            .lock()
            .records
            .get(peer_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn tracks_created(&self, kind: MediaKind) -> usize {
        self.state
            .lock()
            .tracks_created
            .get(&kind)
            .copied()
            .unwrap_or(0)
    }

    // ===== Engine callbacks =====

    /// Report an event on the latest connection of `peer_id`
    ///
    /// Returns `false` when the peer never had a connection or the session
    /// is gone.
    pub fn emit(&self, peer_id: &PeerId, event: EngineEvent) -> bool {
        let observer = self.state.lock().observers.get(peer_id).cloned();
        match observer {
            Some(observer) => observer.notify(event),
            None => false,
        }
    }

    pub fn gather_candidate(&self, peer_id: &PeerId, candidate: Candidate) -> bool {
        self.emit(peer_id, EngineEvent::LocalCandidate(candidate))
    }

    pub fn set_ice_state(&self, peer_id: &PeerId, state: IceConnectionState) -> bool {
        self.emit(peer_id, EngineEvent::IceConnectionState(state))
    }

    /// Attach a remote stream carrying the requested tracks
    pub fn attach_stream(&self, peer_id: &PeerId, audio: bool, video: bool) -> bool {
        let stream = RemoteStream {
            stream_id: format!("{}-stream", peer_id),
            audio: audio.then(|| RemoteTrack {
                id: format!("{}-audio", peer_id),
                kind: MediaKind::Audio,
            }),
            video: video.then(|| RemoteTrack {
                id: format!("{}-video", peer_id),
                kind: MediaKind::Video,
            }),
        };
        self.emit(peer_id, EngineEvent::StreamAdded(stream))
    }

    fn next_sdp(&self, kind: &str, peer_id: &PeerId, constraints: MediaConstraints) -> String {
        let mut state = self.state.lock();
        state.sdp_counter += 1;
        format!(
            "v=0\r\no=loopback {} 1 IN IP4 127.0.0.1\r\ns={}:{}\r\na=audio:{}\r\na=video:{}\r\n",
            state.sdp_counter, kind, peer_id, constraints.receive_audio, constraints.receive_video
        )
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_connection(
        &self,
        peer_id: &PeerId,
        _ice: &IceConfig,
        observer: PeerObserver,
    ) -> Result<Arc<dyn PeerHandle>> {
        let connection_id = observer.connection_id();
        {
            let mut state = self.state.lock();
            if state.faults.connections.contains(peer_id) {
                return Err(Error::TransportFailure(format!(
                    "loopback refused connection to {}",
                    peer_id
                )));
            }
            let record = state.records.entry(peer_id.clone()).or_default();
            record.connections_created += 1;
            record.attached_tracks.clear();
            state.observers.insert(peer_id.clone(), observer);
        }

        debug!(
            "Loopback connection created: peer_id={}, connection_id={}",
            peer_id, connection_id
        );

        Ok(Arc::new(LoopbackPeer {
            peer_id: peer_id.clone(),
            connection_id,
            engine: self.clone(),
            remote_set: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    fn create_local_track(
        &self,
        kind: MediaKind,
        track_id: &str,
        _stream_id: &str,
    ) -> Result<Arc<dyn LocalTrack>> {
        *self.state.lock().tracks_created.entry(kind).or_insert(0) += 1;
        Ok(Arc::new(LoopbackTrack {
            id: track_id.to_string(),
            kind,
            enabled: AtomicBool::new(true),
        }))
    }
}

struct LoopbackPeer {
    peer_id: PeerId,
    connection_id: ConnectionId,
    engine: LoopbackEngine,
    remote_set: AtomicBool,
    closed: AtomicBool,
}

impl LoopbackPeer {
    async fn settle(&self) -> Result<()> {
        if !self.engine.latency.is_zero() {
            tokio::time::sleep(self.engine.latency).await;
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::TransportFailure(format!(
                "connection {} to {} is closed",
                self.connection_id, self.peer_id
            )));
        }
        Ok(())
    }

    fn with_record<R>(&self, f: impl FnOnce(&mut PeerRecord) -> R) -> R {
        let mut state = self.engine.state.lock();
        f(state.records.entry(self.peer_id.clone()).or_default())
    }
}

#[async_trait]
impl PeerHandle for LoopbackPeer {
    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::MediaTrackError("connection closed".to_string()));
        }
        self.with_record(|r| r.attached_tracks.push(track.id().to_string()));
        Ok(())
    }

    async fn create_offer(&self, constraints: MediaConstraints) -> Result<SessionDescription> {
        self.settle().await?;
        if self.engine.state.lock().faults.offers.contains(&self.peer_id) {
            return Err(Error::TransportFailure(format!(
                "loopback refused offer for {}",
                self.peer_id
            )));
        }
        let sdp = self.engine.next_sdp("offer", &self.peer_id, constraints);
        self.with_record(|r| {
            r.offers_created += 1;
            r.last_constraints = Some(constraints);
        });
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self, constraints: MediaConstraints) -> Result<SessionDescription> {
        self.settle().await?;
        if !self.remote_set.load(Ordering::SeqCst) {
            return Err(Error::TransportFailure(
                "cannot answer without a remote offer".to_string(),
            ));
        }
        if self.engine.state.lock().faults.answers.contains(&self.peer_id) {
            return Err(Error::TransportFailure(format!(
                "loopback refused answer for {}",
                self.peer_id
            )));
        }
        let sdp = self.engine.next_sdp("answer", &self.peer_id, constraints);
        self.with_record(|r| {
            r.answers_created += 1;
            r.last_constraints = Some(constraints);
        });
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.settle().await?;
        self.with_record(|r| r.local_descriptions.push(description));
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.settle().await?;
        if self
            .engine
            .state
            .lock()
            .faults
            .remote_descriptions
            .contains(&self.peer_id)
        {
            return Err(Error::TransportFailure(format!(
                "loopback rejected remote description from {}",
                self.peer_id
            )));
        }
        self.with_record(|r| r.remote_descriptions.push(description));
        self.remote_set.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: Candidate) -> Result<()> {
        self.settle().await?;
        if !self.remote_set.load(Ordering::SeqCst) {
            self.with_record(|r| r.rejected_candidates += 1);
            return Err(Error::CandidateApplyFailure(
                "remote description not set".to_string(),
            ));
        }
        let injected = {
            let mut state = self.engine.state.lock();
            match state.faults.candidates.get_mut(&candidate.sdp) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };
        if injected {
            self.with_record(|r| r.rejected_candidates += 1);
            return Err(Error::CandidateApplyFailure(format!(
                "loopback rejected candidate {}",
                candidate.sdp
            )));
        }
        self.with_record(|r| r.applied_candidates.push(candidate));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.with_record(|r| r.connections_closed += 1);
        }
        Ok(())
    }
}

/// Local track of the loopback engine
#[derive(Debug)]
pub struct LoopbackTrack {
    id: String,
    kind: MediaKind,
    enabled: AtomicBool,
}

impl LocalTrack for LoopbackTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Surface binder that remembers what is bound
#[derive(Debug, Clone, Default)]
pub struct RecordingSurfaces {
    bound: Arc<Mutex<HashMap<PeerId, RemoteTrack>>>,
    released: Arc<Mutex<Vec<PeerId>>>,
}

impl RecordingSurfaces {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bound(&self, peer_id: &PeerId) -> Option<RemoteTrack> {
        self.bound.lock().get(peer_id).cloned()
    }

    pub fn released(&self) -> Vec<PeerId> {
        self.released.lock().clone()
    }
}

impl VideoSurfaceBinder for RecordingSurfaces {
    fn bind_track_to_surface(&self, peer_id: &PeerId, track: &RemoteTrack) {
        self.bound.lock().insert(peer_id.clone(), track.clone());
    }

    fn release_surface(&self, peer_id: &PeerId) {
        if self.bound.lock().remove(peer_id).is_some() {
            self.released.lock().push(peer_id.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Internal;
    use tokio::sync::mpsc;

    fn observer(peer: &str) -> (PeerObserver, mpsc::UnboundedReceiver<Internal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            PeerObserver::new(PeerId::from(peer), uuid::Uuid::new_v4(), tx),
            rx,
        )
    }

    #[tokio::test]
    async fn test_candidate_rejected_before_remote_description() {
        let engine = LoopbackEngine::new();
        let peer = PeerId::from("alice");
        let (obs, _rx) = observer("alice");
        let handle = engine
            .create_connection(&peer, &IceConfig::default(), obs)
            .await
            .unwrap();

        let candidate = Candidate::new("c1", Some("0".into()), Some(0));
        assert!(handle.add_ice_candidate(candidate.clone()).await.is_err());

        handle
            .set_remote_description(SessionDescription::offer("v=0"))
            .await
            .unwrap();
        handle.add_ice_candidate(candidate.clone()).await.unwrap();

        let record = engine.record(&peer);
        assert_eq!(record.rejected_candidates, 1);
        assert_eq!(record.applied_candidates, vec![candidate]);
    }

    #[tokio::test]
    async fn test_injected_candidate_failure_is_consumed() {
        let engine = LoopbackEngine::new();
        let peer = PeerId::from("bob");
        let (obs, _rx) = observer("bob");
        let handle = engine
            .create_connection(&peer, &IceConfig::default(), obs)
            .await
            .unwrap();
        handle
            .set_remote_description(SessionDescription::answer("v=0"))
            .await
            .unwrap();

        engine.reject_candidate("flaky", 1);
        let candidate = Candidate::new("flaky", None, None);
        assert!(matches!(
            handle.add_ice_candidate(candidate.clone()).await,
            Err(Error::CandidateApplyFailure(_))
        ));
        assert!(handle.add_ice_candidate(candidate).await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_connection_refuses_work() {
        let engine = LoopbackEngine::new();
        let peer = PeerId::from("carol");
        let (obs, _rx) = observer("carol");
        let handle = engine
            .create_connection(&peer, &IceConfig::default(), obs)
            .await
            .unwrap();
        handle.close().await.unwrap();
        handle.close().await.unwrap();

        assert!(handle
            .create_offer(MediaConstraints::for_call(MediaKind::Audio))
            .await
            .is_err());
        assert_eq!(engine.record(&peer).connections_closed, 1);
    }

    #[tokio::test]
    async fn test_emit_reaches_latest_observer() {
        let engine = LoopbackEngine::new();
        let peer = PeerId::from("dave");
        let (obs, mut rx) = observer("dave");
        let expected = obs.connection_id();
        engine
            .create_connection(&peer, &IceConfig::default(), obs)
            .await
            .unwrap();

        assert!(engine.set_ice_state(&peer, IceConnectionState::Connected));
        match rx.recv().await {
            Some(Internal::Engine { connection_id, .. }) => assert_eq!(connection_id, expected),
            _ => panic!("expected engine event"),
        }
        assert!(!engine.set_ice_state(&PeerId::from("nobody"), IceConnectionState::Connected));
    }

    #[test]
    fn test_tracks_are_counted() {
        let engine = LoopbackEngine::new();
        let track = engine
            .create_local_track(MediaKind::Audio, "audio0", "stream0")
            .unwrap();
        track.set_enabled(false);
        assert!(!track.is_enabled());
        assert_eq!(engine.tracks_created(MediaKind::Audio), 1);
        assert_eq!(engine.tracks_created(MediaKind::Video), 0);
    }
}
