//! Call session test harness
//!
//! Spawns a [`CallSession`] on the loopback engine and provides helpers to
//! drive it with signaling messages and wait for outbound events.
//!
//! Basic usage pattern:
//!
//! 1. Create a `CallHarness` (optionally with a custom config or engine)
//! 2. Feed signals with `offer_from` / `answer_from` / `candidate_from`
//! 3. Wait for events with `wait_for`, or call `settle` and inspect the
//!    returned snapshot
//! 4. Inspect engine side effects through `harness.engine.record(..)`

#![allow(dead_code)]

use remotemedia_webrtc_call::engine::loopback::{LoopbackEngine, RecordingSurfaces};
use remotemedia_webrtc_call::{
    CallConfig, CallHandle, CallSession, Candidate, EventReceiver, InitiateType, MediaKind,
    OutboundEvent, PeerId, SessionSnapshot, SignalingMessage,
};
use std::sync::Arc;
use tokio::time::{timeout, Duration};

/// How long to wait for an expected event
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Rounds of scheduler yields `settle` allows before giving up
const SETTLE_ROUNDS: usize = 200;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn peer(id: &str) -> PeerId {
    PeerId::from(id)
}

/// Host candidate with a recognizable sdp
pub fn candidate(n: u32) -> Candidate {
    Candidate::new(
        format!("candidate:{} 1 udp 2122260223 10.0.0.{} 5{:03} typ host", n, n, n),
        Some("0".to_string()),
        Some(0),
    )
}

pub struct CallHarness {
    pub call: CallHandle,
    pub events: EventReceiver,
    pub engine: LoopbackEngine,
    pub surfaces: RecordingSurfaces,
    pub config: CallConfig,
}

impl CallHarness {
    pub fn new() -> Self {
        Self::with_config(CallConfig::default())
    }

    pub fn with_config(config: CallConfig) -> Self {
        Self::with_engine(LoopbackEngine::new(), config)
    }

    pub fn with_engine(engine: LoopbackEngine, config: CallConfig) -> Self {
        init_tracing();
        let surfaces = RecordingSurfaces::new();
        let (call, events) = CallSession::spawn(
            config.clone(),
            Arc::new(engine.clone()),
            Arc::new(surfaces.clone()),
        )
        .expect("Failed to spawn call session");

        Self {
            call,
            events,
            engine,
            surfaces,
            config,
        }
    }

    // ===== Signals =====

    pub async fn offer_from(&self, user: &str, media_kind: MediaKind) {
        self.offer_with(user, media_kind, false, false).await;
    }

    pub async fn offer_with(&self, user: &str, media_kind: MediaKind, is_inviting: bool, is_rejoin: bool) {
        self.call
            .handle_signal(SignalingMessage::Offer {
                user_id: peer(user),
                sdp: format!("v=0\r\ns=remote-offer-{}\r\n", user),
                media_kind,
                initiate_type: InitiateType::Incoming,
                is_inviting,
                is_rejoin,
                channel: None,
                group_id: None,
            })
            .await
            .expect("Failed to send offer");
    }

    pub async fn answer_from(&self, user: &str, sdp: &str) {
        self.call
            .remote_answer(user, sdp)
            .await
            .expect("Failed to send answer");
    }

    pub async fn candidate_from(&self, user: &str, candidate: Candidate) {
        self.call
            .remote_candidate(user, candidate)
            .await
            .expect("Failed to send candidate");
    }

    // ===== Events =====

    /// Next event, failing the test after [`EVENT_TIMEOUT`]
    pub async fn next_event(&mut self) -> OutboundEvent {
        timeout(EVENT_TIMEOUT, self.events.recv())
            .await
            .expect("Timeout waiting for event")
            .expect("Event channel closed")
    }

    /// Skip events until one matches `predicate`
    pub async fn wait_for<F>(&mut self, predicate: F) -> OutboundEvent
    where
        F: Fn(&OutboundEvent) -> bool,
    {
        loop {
            let event = self.next_event().await;
            if predicate(&event) {
                return event;
            }
        }
    }

    /// Wait for an event by wire name
    pub async fn wait_for_named(&mut self, name: &str) -> OutboundEvent {
        self.wait_for(|event| event.name() == name).await
    }

    /// Everything already emitted, without waiting
    pub fn drain_events(&mut self) -> Vec<OutboundEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }

    /// Let the session and its engine tasks run until nothing is in flight
    pub async fn settle(&self) -> SessionSnapshot {
        let mut snapshot = self.call.snapshot().await.expect("Session closed");
        for _ in 0..SETTLE_ROUNDS {
            tokio::task::yield_now().await;
            snapshot = self.call.snapshot().await.expect("Session closed");
            let busy = snapshot
                .peers
                .iter()
                .any(|info| info.negotiating.is_some() || info.applying_candidates);
            if !busy {
                // one more round so completions posted just now are handled
                tokio::task::yield_now().await;
                return self.call.snapshot().await.expect("Session closed");
            }
        }
        snapshot
    }

    /// Drive a peer through offer, answer and stream attach
    pub async fn connect_incoming(&mut self, user: &str, media_kind: MediaKind) {
        self.call
            .local_media_ready(media_kind)
            .await
            .expect("Failed to mark media ready");
        self.offer_from(user, media_kind).await;
        self.wait_for(|event| {
            matches!(event, OutboundEvent::AnswerReady { recipient, .. } if recipient.as_str() == user)
        })
        .await;
        self.engine
            .attach_stream(&peer(user), true, media_kind == MediaKind::Video);
        self.wait_for(|event| {
            matches!(event, OutboundEvent::MembershipChanged { user_id, joined: true, .. } if user_id.as_str() == user)
        })
        .await;
    }
}

/// Names of the given events, in order
pub fn names(events: &[OutboundEvent]) -> Vec<&'static str> {
    events.iter().map(|event| event.name()).collect()
}
