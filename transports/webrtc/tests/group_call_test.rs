//! Group call fan-out
//!
//! Offers to all participants run concurrently and are reported together,
//! with per-peer failures alongside the successes.

mod harness;

use harness::{peer, CallHarness};
use remotemedia_webrtc_call::engine::loopback::LoopbackEngine;
use remotemedia_webrtc_call::{
    CallConfig, CallParticipant, Error, GroupCallRequest, MediaKind, OutboundEvent, PeerPhase,
};
use std::time::Duration;

fn request(ids: &[&str], media_kind: MediaKind) -> GroupCallRequest {
    GroupCallRequest::new("room-1", "group-1", media_kind)
        .with_participants(ids.iter().map(|id| CallParticipant::new(*id)))
}

#[tokio::test]
async fn test_group_call_offers_every_participant() {
    let mut harness = CallHarness::new();

    let report = harness
        .call
        .start_group_call(request(&["alice", "bob", "carol"], MediaKind::Audio))
        .await
        .unwrap();

    let offered: Vec<_> = report.offers.iter().map(|o| o.user_id.as_str()).collect();
    assert_eq!(offered, vec!["alice", "bob", "carol"]);
    assert!(report.errors.is_empty());
    assert!(report.offers.iter().all(|o| o.kind == "offer"));

    let event = harness.wait_for_named("offer_batch_ready").await;
    let OutboundEvent::OfferBatchReady {
        channel,
        group_id,
        media_kind,
        offers,
        errors,
        ..
    } = event
    else {
        unreachable!()
    };
    assert_eq!(channel, "room-1");
    assert_eq!(group_id, "group-1");
    assert_eq!(media_kind, MediaKind::Audio);
    assert_eq!(offers, report.offers);
    assert!(errors.is_empty());

    let snapshot = harness.settle().await;
    assert_eq!(snapshot.peers.len(), 3);
    for info in &snapshot.peers {
        assert!(matches!(info.phase, PeerPhase::Negotiating(_)));
        assert!(info.negotiating.is_none());
    }
    // one shared audio track for every connection
    assert_eq!(harness.engine.tracks_created(MediaKind::Audio), 1);
}

#[tokio::test]
async fn test_group_call_partial_failure() {
    let mut harness = CallHarness::new();
    harness.engine.fail_offers_for("bob");

    let report = harness
        .call
        .start_group_call(request(&["alice", "bob", "carol"], MediaKind::Audio))
        .await
        .unwrap();

    let offered: Vec<_> = report.offers.iter().map(|o| o.user_id.as_str()).collect();
    assert_eq!(offered, vec!["alice", "carol"]);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].user_id, peer("bob"));
    assert!(!report.all_failed());

    let event = harness.wait_for_named("offer_batch_ready").await;
    let OutboundEvent::OfferBatchReady { offers, errors, .. } = event else {
        unreachable!()
    };
    assert_eq!(offers.len(), 2);
    assert_eq!(errors.len(), 1);

    // bob keeps his connection and can be offered again
    let snapshot = harness.settle().await;
    let bob = snapshot.peer("bob").unwrap();
    assert!(bob.negotiating.is_none());
}

#[tokio::test]
async fn test_group_call_total_failure() {
    let mut harness = CallHarness::new();
    harness.engine.fail_offers_for("alice");
    harness.engine.fail_connections_for("bob");

    let report = harness
        .call
        .start_group_call(request(&["alice", "bob"], MediaKind::Audio))
        .await
        .unwrap();
    assert!(report.all_failed());
    assert_eq!(report.errors.len(), 2);

    let event = harness.next_event().await;
    assert_eq!(event.name(), "group_offer_failed");
    let snapshot = harness.settle().await;
    assert!(harness
        .drain_events()
        .iter()
        .all(|event| event.name() != "offer_batch_ready"));
    assert!(snapshot.peer("bob").is_none());

    match report.ensure_any_succeeded() {
        Err(Error::AggregateOfferFailure { failed }) => assert_eq!(failed, 2),
        other => panic!("expected aggregate failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_group_call_skips_self_and_duplicates() {
    let harness = CallHarness::new();
    let self_id = harness.config.self_peer_id.clone();

    let report = harness
        .call
        .start_group_call(request(
            &["alice", self_id.as_str(), "alice", "bob"],
            MediaKind::Audio,
        ))
        .await
        .unwrap();

    assert_eq!(report.offers.len(), 2);
    assert_eq!(harness.engine.record(&peer("alice")).connections_created, 1);
    assert_eq!(harness.engine.record(&self_id).connections_created, 0);
}

#[tokio::test]
async fn test_group_call_respects_peer_limit() {
    let harness = CallHarness::with_config(CallConfig::default().with_max_peers(2));

    let report = harness
        .call
        .start_group_call(request(&["alice", "bob", "carol"], MediaKind::Audio))
        .await
        .unwrap();

    assert_eq!(report.offers.len(), 2);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].user_id, peer("carol"));
}

#[tokio::test]
async fn test_video_group_call_attaches_both_tracks() {
    let harness = CallHarness::new();

    harness
        .call
        .start_group_call(request(&["alice"], MediaKind::Video))
        .await
        .unwrap();

    let record = harness.engine.record(&peer("alice"));
    assert_eq!(record.attached_tracks, vec!["audio0", "video0"]);
    let constraints = record.last_constraints.unwrap();
    assert!(constraints.receive_audio);
    assert!(constraints.receive_video);

    let snapshot = harness.settle().await;
    assert!(snapshot.video_enabled);
    assert_eq!(snapshot.call_type, MediaKind::Video);
}

#[tokio::test]
async fn test_answers_complete_group_negotiation() {
    let mut harness = CallHarness::new();
    harness
        .call
        .start_group_call(request(&["alice", "bob"], MediaKind::Audio))
        .await
        .unwrap();

    harness.answer_from("alice", "v=0\r\ns=alice-answer\r\n").await;
    harness.answer_from("bob", "v=0\r\ns=bob-answer\r\n").await;
    let snapshot = harness.settle().await;

    for id in ["alice", "bob"] {
        let info = snapshot.peer(id).unwrap();
        assert!(info.remote_description_set);
        assert_eq!(info.flush_count, 1);
    }

    harness.engine.attach_stream(&peer("alice"), true, false);
    let event = harness.wait_for_named("membership_changed").await;
    assert_eq!(
        event,
        OutboundEvent::MembershipChanged {
            channel: "room-1".to_string(),
            user_id: peer("alice"),
            joined: true,
            active: true,
        }
    );
}

#[tokio::test]
async fn test_answer_during_group_offer_is_deferred() {
    let engine = LoopbackEngine::new().with_latency(Duration::from_millis(20));
    let harness = CallHarness::with_engine(engine, CallConfig::default());

    let call = harness.call.clone();
    let pending = tokio::spawn(async move {
        call.start_group_call(request(&["alice"], MediaKind::Audio))
            .await
    });

    // queued behind the group offer for alice
    tokio::time::sleep(Duration::from_millis(5)).await;
    harness.answer_from("alice", "v=0\r\ns=alice-answer\r\n").await;
    let snapshot = harness.call.snapshot().await.unwrap();
    let alice = snapshot.peer("alice").unwrap();
    assert!(alice.negotiating.is_some());
    assert_eq!(alice.deferred_ops, 1);

    let report = pending.await.unwrap().unwrap();
    assert_eq!(report.offers.len(), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let snapshot = harness.settle().await;
    let alice = snapshot.peer("alice").unwrap();
    assert!(alice.remote_description_set);
    assert_eq!(alice.deferred_ops, 0);
}

#[tokio::test]
async fn test_group_call_after_hang_up_is_rejected() {
    let harness = CallHarness::new();
    assert!(harness.call.hang_up().await.unwrap());

    let result = harness
        .call
        .start_group_call(request(&["alice"], MediaKind::Audio))
        .await;
    assert!(matches!(result, Err(Error::PreconditionViolation(_))));
}
