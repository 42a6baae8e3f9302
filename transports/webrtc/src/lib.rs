//! Multi-party call orchestration for RemoteMedia WebRTC clients
//!
//! This crate drives the signaling side of a mesh call: one peer
//! connection per remote participant, SDP offer/answer exchange, ICE
//! candidate buffering, reconnection grace periods and call teardown.
//! Media itself is handled by a pluggable [`MediaEngine`].
//!
//! # Features
//!
//! - **Group calls**: concurrent offers to every participant, reported as
//!   one batch with per-peer failures
//! - **Ordered candidates**: remote candidates are queued until a remote
//!   description is set and applied strictly in arrival order
//! - **Serialized negotiation**: at most one offer/answer step per peer is
//!   in flight; later requests wait their turn
//! - **Reconnection**: a lost transport starts a grace timer; the peer (or
//!   the whole call, for the local user) is dropped when it expires
//! - **Single teardown**: hang-up is idempotent no matter how many triggers
//!   race
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Signaling relay / UI                                    │
//! │  ↓ SignalingMessage, commands        ↑ OutboundEvent     │
//! │  CallHandle ──────────► CallSession (single task)        │
//! │                         ├─ PeerRegistry (connections)    │
//! │                         ├─ CandidateBuffer               │
//! │                         ├─ DisconnectTimers              │
//! │                         └─ LocalMedia / pending offers   │
//! │                            ↓                             │
//! │  MediaEngine (loopback | webrtc-rs) + VideoSurfaceBinder │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use remotemedia_webrtc_call::CallConfig;
//!
//! let config = CallConfig {
//!     max_peers: 8,
//!     disconnect_grace_secs: 30,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use remotemedia_webrtc_call::engine::loopback::LoopbackEngine;
//! use remotemedia_webrtc_call::engine::NoopSurfaceBinder;
//! use remotemedia_webrtc_call::{CallConfig, CallParticipant, CallSession, GroupCallRequest, MediaKind};
//! use std::sync::Arc;
//!
//! # async fn example() -> remotemedia_webrtc_call::Result<()> {
//! let (call, mut events) = CallSession::spawn(
//!     CallConfig::default(),
//!     Arc::new(LoopbackEngine::new()),
//!     Arc::new(NoopSurfaceBinder),
//! )?;
//!
//! let request = GroupCallRequest::new("room-1", "group-1", MediaKind::Audio)
//!     .with_participant(CallParticipant::new("alice"))
//!     .with_participant(CallParticipant::new("bob"));
//! let report = call.start_group_call(request).await?;
//! assert_eq!(report.offers.len(), 2);
//!
//! while let Some(event) = events.recv().await {
//!     println!("{}", event.to_json()?);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod model;
pub mod peer;
pub mod session;
pub mod signaling;

pub use config::{CallConfig, IceConfig, TurnServerConfig};
pub use engine::{MediaEngine, NoopSurfaceBinder, VideoSurfaceBinder};
pub use error::{Error, Result};
pub use events::{EventReceiver, NegotiationStage, OfferRecord, OutboundEvent, PeerFailure};
pub use model::{
    CallParticipant, Candidate, InitiateType, MediaKind, PeerId, SdpType, SessionDescription,
};
pub use peer::{PeerInfo, PeerPhase};
pub use session::{
    CallHandle, CallSession, GroupCallRequest, GroupOfferReport, SessionSnapshot, TrackState,
};
pub use signaling::SignalingMessage;

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let ver = version();
        assert!(!ver.is_empty());
    }
}
