//! Media engine backed by webrtc-rs peer connections
//!
//! Local tracks are `TrackLocalStaticSample`s shared by every connection of
//! a session; capture code writes samples into them through
//! [`WebRtcTrack::sample_track`] and should skip writing while the track is
//! disabled. Remote tracks are grouped per connection and reported as one
//! [`RemoteStream`] once every media section of the remote description has
//! produced a track.

use super::{
    ConnectionId, EngineEvent, IceConnectionState, LocalTrack, MediaEngine, PeerHandle,
    PeerObserver, RemoteStream, RemoteTrack,
};
use crate::config::IceConfig;
use crate::model::{Candidate, MediaConstraints, MediaKind, PeerId, SdpType, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine as RtcMediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// [`MediaEngine`] creating webrtc-rs peer connections
#[derive(Clone)]
pub struct WebRtcEngine {
    api: Arc<API>,
}

impl WebRtcEngine {
    /// Build the webrtc-rs API with default codecs and interceptors
    pub fn new() -> Result<Self> {
        let mut media_engine = RtcMediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Registry::new(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        Ok(Self { api: Arc::new(api) })
    }
}

fn ice_servers(ice: &IceConfig) -> Vec<RTCIceServer> {
    ice.stun_servers
        .iter()
        .map(|url| RTCIceServer {
            urls: vec![url.clone()],
            ..Default::default()
        })
        .chain(ice.turn_servers.iter().map(|turn| {
            #[allow(clippy::needless_update)]
            RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            }
        }))
        .collect()
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    match state {
        RTCIceConnectionState::New => Some(IceConnectionState::New),
        RTCIceConnectionState::Checking => Some(IceConnectionState::Checking),
        RTCIceConnectionState::Connected => Some(IceConnectionState::Connected),
        RTCIceConnectionState::Completed => Some(IceConnectionState::Completed),
        RTCIceConnectionState::Disconnected => Some(IceConnectionState::Disconnected),
        RTCIceConnectionState::Failed => Some(IceConnectionState::Failed),
        RTCIceConnectionState::Closed => Some(IceConnectionState::Closed),
        _ => None,
    }
}

fn codec_type(kind: MediaKind) -> RTPCodecType {
    match kind {
        MediaKind::Audio => RTPCodecType::Audio,
        MediaKind::Video => RTPCodecType::Video,
    }
}

/// Media kinds announced by `m=` lines of an SDP
fn media_sections(sdp: &str) -> HashSet<MediaKind> {
    sdp.lines()
        .filter_map(|line| {
            if line.starts_with("m=audio") {
                Some(MediaKind::Audio)
            } else if line.starts_with("m=video") {
                Some(MediaKind::Video)
            } else {
                None
            }
        })
        .collect()
}

/// Kinds `constraints` asks to receive that the remote offer has no section for
fn unoffered_kinds(constraints: MediaConstraints, offered: &HashSet<MediaKind>) -> Vec<MediaKind> {
    [
        (MediaKind::Audio, constraints.receive_audio),
        (MediaKind::Video, constraints.receive_video),
    ]
    .into_iter()
    .filter(|(kind, wanted)| *wanted && !offered.contains(kind))
    .map(|(kind, _)| kind)
    .collect()
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
    };
    parsed.map_err(|e| Error::TransportFailure(format!("Invalid session description: {}", e)))
}

/// Collects remote tracks of one connection into a single stream
#[derive(Default)]
struct RemoteAssembly {
    expected: Mutex<HashSet<MediaKind>>,
    stream: Mutex<RemoteStream>,
    reported: AtomicBool,
}

impl RemoteAssembly {
    fn expect(&self, kinds: HashSet<MediaKind>) {
        *self.expected.lock() = kinds;
    }

    fn expected(&self) -> HashSet<MediaKind> {
        self.expected.lock().clone()
    }

    /// Add a track; returns the stream once it is complete, at most once
    fn add(&self, stream_id: String, track: RemoteTrack) -> Option<RemoteStream> {
        let mut stream = self.stream.lock();
        if stream.stream_id.is_empty() {
            stream.stream_id = stream_id;
        }
        match track.kind {
            MediaKind::Audio => stream.audio = Some(track),
            MediaKind::Video => stream.video = Some(track),
        }

        let complete = self
            .expected
            .lock()
            .iter()
            .all(|kind| stream.has_track_for(*kind));
        if complete && !self.reported.swap(true, Ordering::SeqCst) {
            Some(stream.clone())
        } else {
            None
        }
    }
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    async fn create_connection(
        &self,
        peer_id: &PeerId,
        ice: &IceConfig,
        observer: PeerObserver,
    ) -> Result<Arc<dyn PeerHandle>> {
        let connection_id = observer.connection_id();
        info!(
            "Creating peer connection: peer_id={}, connection_id={}",
            peer_id, connection_id
        );

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers(ice),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?);

        let assembly = Arc::new(RemoteAssembly::default());
        install_callbacks(&pc, observer, Arc::clone(&assembly));

        Ok(Arc::new(WebRtcPeer {
            peer_id: peer_id.clone(),
            connection_id,
            pc,
            receiving: Mutex::new(HashSet::new()),
            senders: Mutex::new(Vec::new()),
            assembly,
        }))
    }

    fn create_local_track(
        &self,
        kind: MediaKind,
        track_id: &str,
        stream_id: &str,
    ) -> Result<Arc<dyn LocalTrack>> {
        let capability = match kind {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        };

        let track = Arc::new(TrackLocalStaticSample::new(
            capability,
            track_id.to_owned(),
            stream_id.to_owned(),
        ));
        debug!("Created local {:?} track {}", kind, track_id);

        Ok(Arc::new(WebRtcTrack {
            id: track_id.to_owned(),
            kind,
            track,
            enabled: AtomicBool::new(true),
        }))
    }
}

fn install_callbacks(pc: &RTCPeerConnection, observer: PeerObserver, assembly: Arc<RemoteAssembly>) {
    let candidate_observer = observer.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let observer = candidate_observer.clone();
        Box::pin(async move {
            // None marks the end of gathering
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    observer.notify(EngineEvent::LocalCandidate(Candidate::new(
                        init.candidate,
                        init.sdp_mid,
                        init.sdp_mline_index,
                    )));
                }
                Err(e) => warn!(
                    "Failed to serialize local candidate for {}: {}",
                    observer.peer_id(),
                    e
                ),
            }
        })
    }));

    let state_observer = observer.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let observer = state_observer.clone();
        Box::pin(async move {
            if let Some(state) = map_ice_state(state) {
                observer.notify(EngineEvent::IceConnectionState(state));
            }
        })
    }));

    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let observer = observer.clone();
            let assembly = Arc::clone(&assembly);
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => MediaKind::Audio,
                    RTPCodecType::Video => MediaKind::Video,
                    _ => return,
                };
                info!(
                    "Remote {:?} track {} from {}",
                    kind,
                    track.id(),
                    observer.peer_id()
                );
                let remote = RemoteTrack { id: track.id(), kind };
                if let Some(stream) = assembly.add(track.stream_id(), remote) {
                    observer.notify(EngineEvent::StreamAdded(stream));
                }
            })
        },
    ));
}

struct WebRtcPeer {
    peer_id: PeerId,
    connection_id: ConnectionId,
    pc: Arc<RTCPeerConnection>,
    /// Kinds with a transceiver able to receive
    receiving: Mutex<HashSet<MediaKind>>,
    /// Held so the senders outlive the add_track call
    senders: Mutex<Vec<Arc<RTCRtpSender>>>,
    assembly: Arc<RemoteAssembly>,
}

impl WebRtcPeer {
    /// Add receive-only transceivers for wanted kinds we do not send
    async fn ensure_receivers(&self, constraints: MediaConstraints) -> Result<()> {
        let wanted = [
            (MediaKind::Audio, constraints.receive_audio),
            (MediaKind::Video, constraints.receive_video),
        ];
        for (kind, wanted) in wanted {
            if !wanted || !self.receiving.lock().insert(kind) {
                continue;
            }
            self.pc
                .add_transceiver_from_kind(
                    codec_type(kind),
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(|e| {
                    Error::TransportFailure(format!("Failed to add {:?} receiver: {}", kind, e))
                })?;
        }
        Ok(())
    }
}

#[async_trait]
impl PeerHandle for WebRtcPeer {
    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<()> {
        let local = track
            .as_any()
            .downcast_ref::<WebRtcTrack>()
            .ok_or_else(|| {
                Error::MediaTrackError(format!(
                    "track {} was not created by the webrtc engine",
                    track.id()
                ))
            })?;

        let sender = self
            .pc
            .add_track(local.track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to add track: {}", e)))?;

        self.senders.lock().push(sender);
        self.receiving.lock().insert(local.kind);
        debug!("Track {} added to peer {}", local.id, self.peer_id);
        Ok(())
    }

    async fn create_offer(&self, constraints: MediaConstraints) -> Result<SessionDescription> {
        self.ensure_receivers(constraints).await?;
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::TransportFailure(format!("Failed to create offer: {}", e)))?;
        debug!("Created SDP offer for peer {}", self.peer_id);
        Ok(SessionDescription::offer(offer.sdp))
    }

    /// An answer cannot add media sections, so receivers the offer lacks
    /// are only reported
    async fn create_answer(&self, constraints: MediaConstraints) -> Result<SessionDescription> {
        for kind in unoffered_kinds(constraints, &self.assembly.expected()) {
            warn!(
                "Offer from {} has no {:?} section, answering without it",
                self.peer_id, kind
            );
        }
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::TransportFailure(format!("Failed to create answer: {}", e)))?;
        debug!("Created SDP answer for peer {}", self.peer_id);
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(|e| {
                Error::TransportFailure(format!("Failed to set local description: {}", e))
            })
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.assembly.expect(media_sections(&description.sdp));
        self.pc
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(|e| {
                Error::TransportFailure(format!("Failed to set remote description: {}", e))
            })
    }

    async fn add_ice_candidate(&self, candidate: Candidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.sdp,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::CandidateApplyFailure(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        info!(
            "Closing peer connection: peer_id={}, connection_id={}",
            self.peer_id, self.connection_id
        );
        self.pc
            .close()
            .await
            .map_err(|e| Error::TransportFailure(format!("Failed to close connection: {}", e)))
    }
}

/// Local track of the webrtc-rs engine
pub struct WebRtcTrack {
    id: String,
    kind: MediaKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
}

impl WebRtcTrack {
    /// Underlying sample track for capture code to write into
    pub fn sample_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }
}

impl std::fmt::Debug for WebRtcTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl LocalTrack for WebRtcTrack {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Internal;
    use tokio::sync::mpsc;

    #[test]
    fn test_media_sections() {
        let sdp = "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n";
        let kinds = media_sections(sdp);
        assert!(kinds.contains(&MediaKind::Audio));
        assert!(kinds.contains(&MediaKind::Video));
        assert!(media_sections("v=0\r\n").is_empty());
    }

    #[test]
    fn test_unoffered_kinds() {
        let audio_only = media_sections("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n");
        assert_eq!(
            unoffered_kinds(MediaConstraints::for_call(MediaKind::Video), &audio_only),
            vec![MediaKind::Video]
        );
        assert!(unoffered_kinds(MediaConstraints::for_call(MediaKind::Audio), &audio_only).is_empty());
    }

    #[test]
    fn test_assembly_reports_once_complete() {
        let assembly = RemoteAssembly::default();
        assembly.expect([MediaKind::Audio, MediaKind::Video].into_iter().collect());

        let audio = RemoteTrack {
            id: "a".to_string(),
            kind: MediaKind::Audio,
        };
        let video = RemoteTrack {
            id: "v".to_string(),
            kind: MediaKind::Video,
        };
        assert!(assembly.add("s".to_string(), audio.clone()).is_none());
        let stream = assembly.add("s".to_string(), video).unwrap();
        assert_eq!(stream.audio, Some(audio.clone()));
        assert!(assembly.add("s".to_string(), audio).is_none());
    }

    #[tokio::test]
    async fn test_create_offer_with_audio_track() {
        let engine = WebRtcEngine::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel::<Internal>();
        let peer_id = PeerId::from("alice");
        let observer = PeerObserver::new(peer_id.clone(), uuid::Uuid::new_v4(), tx);

        let handle = engine
            .create_connection(&peer_id, &IceConfig::default(), observer)
            .await
            .unwrap();
        let track = engine
            .create_local_track(MediaKind::Audio, "audio0", "stream0")
            .unwrap();
        handle.add_track(track).await.unwrap();

        let offer = handle
            .create_offer(MediaConstraints::for_call(MediaKind::Audio))
            .await
            .unwrap();
        assert!(offer.sdp.contains("m=audio"));
        handle.close().await.unwrap();
    }
}
