//! Call orchestration benchmarks
//!
//! Benchmarks for:
//! - Candidate buffering: enqueue and flush cost as the backlog grows
//! - Group call fan-out: offers to N peers on the loopback engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use remotemedia_webrtc_call::engine::loopback::LoopbackEngine;
use remotemedia_webrtc_call::engine::NoopSurfaceBinder;
use remotemedia_webrtc_call::peer::{CandidateBuffer, FlushStart};
use remotemedia_webrtc_call::{
    CallConfig, CallParticipant, CallSession, Candidate, GroupCallRequest, MediaKind, PeerId,
};
use std::sync::Arc;

fn candidates(count: usize) -> Vec<Candidate> {
    (0..count)
        .map(|n| {
            Candidate::new(
                format!("candidate:{} 1 udp 2122260223 10.0.{}.{} 50000 typ host", n, n / 250, n % 250),
                Some("0".to_string()),
                Some(0),
            )
        })
        .collect()
}

// ============================================================================
// Candidate buffer
// ============================================================================

fn bench_enqueue_and_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("candidate_buffer_flush");
    let peer = PeerId::from("alice");

    for count in [4, 32, 256] {
        let batch = candidates(count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &batch, |b, batch| {
            b.iter(|| {
                let mut buffer = CandidateBuffer::new();
                for candidate in batch.iter().cloned() {
                    buffer.enqueue(&peer, candidate);
                }
                let FlushStart::Batch(taken) = buffer.begin_flush(&peer) else {
                    unreachable!()
                };
                black_box(buffer.finish_flush(&peer, Vec::new()));
                black_box(taken.len())
            });
        });
    }

    group.finish();
}

fn bench_many_peers(c: &mut Criterion) {
    let mut group = c.benchmark_group("candidate_buffer_peers");
    let peers: Vec<PeerId> = (0..32).map(|n| PeerId::from(format!("peer-{}", n))).collect();
    let batch = candidates(8);

    group.throughput(Throughput::Elements((peers.len() * batch.len()) as u64));
    group.bench_function("32_peers_x_8", |b| {
        b.iter(|| {
            let mut buffer = CandidateBuffer::new();
            for peer in &peers {
                for candidate in batch.iter().cloned() {
                    buffer.enqueue(peer, candidate);
                }
            }
            black_box(buffer.backlog().len())
        });
    });

    group.finish();
}

// ============================================================================
// Group call fan-out
// ============================================================================

fn bench_group_offers(c: &mut Criterion) {
    let mut group = c.benchmark_group("group_call_offers");
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => panic!("Failed to build runtime: {}", e),
    };

    for peers in [2u32, 8, 16] {
        group.throughput(Throughput::Elements(peers as u64));
        group.bench_with_input(BenchmarkId::from_parameter(peers), &peers, |b, &peers| {
            b.to_async(&runtime).iter(|| async move {
                let config = CallConfig::default().with_max_peers(peers);
                let (call, _events) = CallSession::spawn(
                    config,
                    Arc::new(LoopbackEngine::new()),
                    Arc::new(NoopSurfaceBinder),
                )
                .unwrap();

                let request = GroupCallRequest::new("bench", "bench-group", MediaKind::Audio)
                    .with_participants(
                        (0..peers).map(|n| CallParticipant::new(format!("peer-{}", n))),
                    );
                let report = call.start_group_call(request).await.unwrap();
                black_box(report.offers.len())
            });
        });
    }

    group.finish();
}

criterion_group!(buffer_benches, bench_enqueue_and_flush, bench_many_peers);

criterion_group!(fanout_benches, bench_group_offers);

criterion_main!(buffer_benches, fanout_benches);
