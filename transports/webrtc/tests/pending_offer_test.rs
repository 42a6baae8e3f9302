//! Offers that arrive before local media is ready

mod harness;

use harness::{peer, CallHarness};
use remotemedia_webrtc_call::{
    CallParticipant, GroupCallRequest, InitiateType, MediaKind, OutboundEvent, SignalingMessage, TrackState,
};

#[tokio::test]
async fn test_video_offer_waits_for_local_video() {
    let mut harness = CallHarness::new();

    harness.offer_from("alice", MediaKind::Video).await;
    let snapshot = harness.settle().await;
    assert_eq!(snapshot.pending_offers, vec![peer("alice")]);
    assert!(snapshot.peer("alice").is_none());
    assert_eq!(snapshot.call_type, MediaKind::Video);

    // audio alone does not satisfy a video offer
    harness.call.local_media_ready(MediaKind::Audio).await.unwrap();
    let snapshot = harness.settle().await;
    assert_eq!(snapshot.local_audio, TrackState::Active);
    assert_eq!(snapshot.local_video, TrackState::NotStarted);
    assert_eq!(snapshot.pending_offers, vec![peer("alice")]);
    assert!(harness.drain_events().is_empty());

    harness.call.local_media_ready(MediaKind::Video).await.unwrap();
    let event = harness.wait_for_named("answer_ready").await;
    let OutboundEvent::AnswerReady { recipient, .. } = event else {
        unreachable!()
    };
    assert_eq!(recipient, peer("alice"));

    let snapshot = harness.settle().await;
    assert!(snapshot.pending_offers.is_empty());
    assert_eq!(snapshot.local_video, TrackState::Active);
    assert_eq!(
        harness.engine.record(&peer("alice")).attached_tracks,
        vec!["audio0", "video0"]
    );
}

#[tokio::test]
async fn test_queued_offers_replay_in_arrival_order() {
    let mut harness = CallHarness::new();

    harness.offer_from("bob", MediaKind::Audio).await;
    harness.offer_from("alice", MediaKind::Audio).await;
    let snapshot = harness.settle().await;
    assert_eq!(snapshot.pending_offers, vec![peer("bob"), peer("alice")]);

    harness.call.local_media_ready(MediaKind::Audio).await.unwrap();
    let first = harness.wait_for_named("offer_handled").await;
    let second = harness.wait_for_named("offer_handled").await;

    let order: Vec<_> = [first, second]
        .into_iter()
        .map(|event| match event {
            OutboundEvent::OfferHandled { user_id, .. } => user_id,
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert_eq!(order, vec![peer("bob"), peer("alice")]);
}

#[tokio::test]
async fn test_newer_offer_replaces_queued_one() {
    let mut harness = CallHarness::new();

    harness.offer_with("carol", MediaKind::Audio, false, false).await;
    harness.offer_with("carol", MediaKind::Audio, true, false).await;
    let snapshot = harness.settle().await;
    assert_eq!(snapshot.pending_offers, vec![peer("carol")]);

    harness.call.local_media_ready(MediaKind::Audio).await.unwrap();
    let event = harness.wait_for_named("offer_handled").await;
    assert!(matches!(
        event,
        OutboundEvent::OfferHandled { is_inviting: true, .. }
    ));

    harness.wait_for_named("answer_ready").await;
    harness.settle().await;
    assert_eq!(harness.engine.record(&peer("carol")).answers_created, 1);
}

#[tokio::test]
async fn test_leave_discards_queued_offer() {
    let harness = CallHarness::new();

    harness.offer_from("dave", MediaKind::Audio).await;
    harness.call.participant_left("dave").await.unwrap();
    harness.call.local_media_ready(MediaKind::Audio).await.unwrap();
    let snapshot = harness.settle().await;

    assert!(snapshot.pending_offers.is_empty());
    assert!(snapshot.peer("dave").is_none());
    assert_eq!(harness.engine.record(&peer("dave")).connections_created, 0);
}

#[tokio::test]
async fn test_answer_failure_is_reported() {
    let mut harness = CallHarness::new();
    harness.engine.fail_answers_for("erin");
    harness.call.local_media_ready(MediaKind::Audio).await.unwrap();

    harness.offer_from("erin", MediaKind::Audio).await;
    let event = harness.wait_for_named("negotiation_failed").await;
    let OutboundEvent::NegotiationFailed { user_id, stage, .. } = event else {
        unreachable!()
    };
    assert_eq!(user_id, peer("erin"));
    assert_eq!(
        stage,
        remotemedia_webrtc_call::NegotiationStage::CreateAnswer
    );

    let snapshot = harness.settle().await;
    assert!(snapshot.peer("erin").unwrap().negotiating.is_none());
}

#[tokio::test]
async fn test_queued_offer_resumes_when_a_group_call_starts_video() {
    let mut harness = CallHarness::new();
    harness.call.local_media_ready(MediaKind::Audio).await.unwrap();

    harness.offer_from("alice", MediaKind::Video).await;
    let snapshot = harness.settle().await;
    assert_eq!(snapshot.pending_offers, vec![peer("alice")]);

    // offering video to bob starts the local video track
    let request = GroupCallRequest::new("room-1", "group-1", MediaKind::Video)
        .with_participants([CallParticipant::new("bob")]);
    harness.call.start_group_call(request).await.unwrap();

    let event = harness
        .wait_for(|event| matches!(event, OutboundEvent::AnswerReady { .. }))
        .await;
    let OutboundEvent::AnswerReady {
        channel, recipient, ..
    } = event
    else {
        unreachable!()
    };
    assert_eq!(recipient, peer("alice"));
    assert_eq!(channel, "room-1");

    let snapshot = harness.settle().await;
    assert!(snapshot.pending_offers.is_empty());
    assert_eq!(snapshot.local_video, TrackState::Active);
    assert_eq!(
        harness.engine.record(&peer("alice")).attached_tracks,
        vec!["audio0", "video0"]
    );
}

#[tokio::test]
async fn test_incoming_call_adopts_channel_from_offer() {
    let mut harness = CallHarness::new();
    harness.call.local_media_ready(MediaKind::Audio).await.unwrap();

    harness
        .call
        .handle_signal_json(
            r#"{"type":"offer","userId":"frank","sdp":"v=0","channel":"room-9","groupId":"group-9"}"#,
        )
        .await
        .unwrap();

    let event = harness.wait_for_named("offer_handled").await;
    let OutboundEvent::OfferHandled {
        channel, group_id, ..
    } = event
    else {
        unreachable!()
    };
    assert_eq!(channel, "room-9");
    assert_eq!(group_id, "group-9");

    let event = harness.wait_for_named("answer_ready").await;
    assert!(matches!(
        event,
        OutboundEvent::AnswerReady { ref channel, .. } if channel == "room-9"
    ));

    // a later offer does not move the call to another channel
    harness
        .call
        .handle_signal(SignalingMessage::Offer {
            user_id: peer("gina"),
            sdp: "v=0".to_string(),
            media_kind: MediaKind::Audio,
            initiate_type: InitiateType::Incoming,
            is_inviting: true,
            is_rejoin: false,
            channel: Some("elsewhere".to_string()),
            group_id: None,
        })
        .await
        .unwrap();
    harness.wait_for_named("answer_ready").await;
    let snapshot = harness.settle().await;
    assert_eq!(snapshot.channel, "room-9");
    assert_eq!(snapshot.group_id, "group-9");
}
