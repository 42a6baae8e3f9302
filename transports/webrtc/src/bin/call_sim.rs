//! Call simulator
//!
//! Runs a complete group call against the in-memory loopback engine and
//! prints every outbound event as one JSON line on stdout. Logs go to
//! stderr, filtered by `RUST_LOG`.
//!
//! # Usage
//!
//! ```bash
//! # Three-way audio call, everyone answers, then hang up
//! cargo run --bin call_sim -- --peers alice,bob,carol
//!
//! # Video call where bob's offer fails and carol never comes back
//! cargo run --bin call_sim -- \
//!   --peers alice,bob,carol \
//!   --media video \
//!   --fail-offer bob \
//!   --drop-peer carol \
//!   --grace-secs 2
//!
//! # Configure STUN/TURN servers
//! cargo run --bin call_sim -- \
//!   --stun-servers stun:stun.l.google.com:19302 \
//!   --turn-servers turn:turn.example.com:3478:user:secret
//! ```

use anyhow::{bail, Context};
use clap::Parser;
use remotemedia_webrtc_call::engine::loopback::{LoopbackEngine, RecordingSurfaces};
use remotemedia_webrtc_call::engine::IceConnectionState;
use remotemedia_webrtc_call::{
    CallConfig, CallHandle, CallParticipant, CallSession, Candidate, GroupCallRequest, MediaKind,
    OutboundEvent, PeerId, TurnServerConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Simulate a multi-party call on the loopback engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Remote participants (comma-separated)
    #[arg(long, value_delimiter = ',', default_value = "alice,bob", env = "CALL_SIM_PEERS")]
    peers: Vec<String>,

    /// Call type
    #[arg(long, default_value = "audio", env = "CALL_SIM_MEDIA")]
    media: MediaArg,

    /// Signaling channel name
    #[arg(long, default_value = "sim-channel", env = "CALL_SIM_CHANNEL")]
    channel: String,

    /// Group id reported with the offers
    #[arg(long, default_value = "sim-group", env = "CALL_SIM_GROUP")]
    group_id: String,

    /// Seconds a disconnected peer may take to come back
    #[arg(long, default_value_t = 3, env = "CALL_SIM_GRACE_SECS")]
    grace_secs: u64,

    /// Delay of every engine operation in milliseconds
    #[arg(long, default_value_t = 10, env = "CALL_SIM_LATENCY_MS")]
    latency_ms: u64,

    /// Peers whose offer creation fails
    #[arg(long, value_delimiter = ',', env = "CALL_SIM_FAIL_OFFER")]
    fail_offer: Vec<String>,

    /// Peers that lose their transport and never recover
    #[arg(long, value_delimiter = ',', env = "CALL_SIM_DROP_PEER")]
    drop_peer: Vec<String>,

    /// Maximum remote peers
    #[arg(long, default_value_t = 10, env = "CALL_SIM_MAX_PEERS")]
    max_peers: u32,

    /// STUN servers (comma-separated)
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "stun:stun.l.google.com:19302"
    )]
    stun_servers: Vec<String>,

    /// TURN servers (format: turn:host:port:username:password, comma-separated)
    #[arg(long, value_delimiter = ',', env = "CALL_SIM_TURN_SERVERS")]
    turn_servers: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum MediaArg {
    Audio,
    Video,
}

impl From<MediaArg> for MediaKind {
    fn from(arg: MediaArg) -> Self {
        match arg {
            MediaArg::Audio => MediaKind::Audio,
            MediaArg::Video => MediaKind::Video,
        }
    }
}

/// Parse TURN server string (format: turn:host:port:username:password or turns:host:port:username:password)
fn parse_turn_server(s: &str) -> anyhow::Result<TurnServerConfig> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() < 5 {
        bail!(
            "Invalid TURN server format: '{}'. Expected: turn:host:port:username:password",
            s
        );
    }

    let protocol = parts[0];
    if protocol != "turn" && protocol != "turns" {
        bail!(
            "Invalid TURN protocol: '{}'. Expected 'turn' or 'turns'",
            protocol
        );
    }

    // Password may contain colons
    Ok(TurnServerConfig {
        url: format!("{}:{}:{}", protocol, parts[1], parts[2]),
        username: parts[3].to_string(),
        credential: parts[4..].join(":"),
    })
}

fn build_config_from_args(args: &Args) -> anyhow::Result<CallConfig> {
    let mut turn_servers = Vec::new();
    for turn_str in &args.turn_servers {
        let turn_config = parse_turn_server(turn_str)
            .with_context(|| format!("Failed to parse TURN server {}", turn_str))?;
        info!(
            "Adding TURN server: {} (user: {})",
            turn_config.url, turn_config.username
        );
        turn_servers.push(turn_config);
    }

    let config = CallConfig {
        stun_servers: args.stun_servers.clone(),
        ..Default::default()
    }
    .with_turn_servers(turn_servers)
    .with_max_peers(args.max_peers)
    .with_disconnect_grace_secs(args.grace_secs);

    config.validate().context("Invalid call configuration")?;
    Ok(config)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Print events until the session closes the channel
fn spawn_printer(mut events: remotemedia_webrtc_call::EventReceiver) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut printed = 0;
        while let Some(event) = events.recv().await {
            match event.to_json() {
                Ok(json) => println!("{}", json),
                Err(e) => warn!("Failed to encode {} event: {}", event.name(), e),
            }
            printed += 1;
            if matches!(event, OutboundEvent::CallEnded { .. }) {
                break;
            }
        }
        printed
    })
}

/// Play the remote side of every peer that received an offer
async fn answer_offers(
    call: &CallHandle,
    engine: &LoopbackEngine,
    peers: &[PeerId],
    media: MediaKind,
) -> anyhow::Result<()> {
    for (index, peer_id) in peers.iter().enumerate() {
        let host = index + 2;
        // one candidate before the answer, one after
        call.remote_candidate(
            peer_id.clone(),
            Candidate::new(
                format!("candidate:1 1 udp 2122260223 10.0.0.{} 50000 typ host", host),
                Some("0".to_string()),
                Some(0),
            ),
        )
        .await?;
        call.remote_answer(peer_id.clone(), format!("v=0\r\ns=answer-from-{}\r\n", peer_id))
            .await?;
        call.remote_candidate(
            peer_id.clone(),
            Candidate::new(
                format!("candidate:2 1 udp 1686052607 203.0.113.{} 50001 typ srflx", host),
                Some("0".to_string()),
                Some(0),
            ),
        )
        .await?;

        engine.gather_candidate(
            peer_id,
            Candidate::new(
                "candidate:1 1 udp 2122260223 10.0.0.1 40000 typ host",
                Some("0".to_string()),
                Some(0),
            ),
        );
    }

    // give the session time to apply answers before media shows up
    tokio::time::sleep(Duration::from_millis(100)).await;
    for peer_id in peers {
        engine.attach_stream(peer_id, true, media == MediaKind::Video);
        engine.set_ice_state(peer_id, IceConnectionState::Connected);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        peers = args.peers.len(),
        media = ?args.media,
        "Call simulator starting"
    );

    let config = build_config_from_args(&args)?;
    let engine = LoopbackEngine::new().with_latency(Duration::from_millis(args.latency_ms));
    for peer in &args.fail_offer {
        engine.fail_offers_for(peer.as_str());
    }

    let (call, events) = CallSession::spawn(
        config,
        Arc::new(engine.clone()),
        Arc::new(RecordingSurfaces::new()),
    )?;
    let printer = spawn_printer(events);

    let media: MediaKind = args.media.into();
    call.local_media_ready(media).await?;

    let request = GroupCallRequest::new(&args.channel, &args.group_id, media)
        .with_participants(args.peers.iter().map(|id| CallParticipant::new(id.as_str())));
    let report = call.start_group_call(request).await?;
    info!(
        "Group call started: {} offers, {} failures",
        report.offers.len(),
        report.errors.len()
    );

    if report.all_failed() {
        warn!("No participant could be offered, ending the call");
    } else {
        let offered: Vec<PeerId> = report.offers.iter().map(|o| o.user_id.clone()).collect();
        answer_offers(&call, &engine, &offered, media).await?;

        for peer in &args.drop_peer {
            let peer_id = PeerId::from(peer.as_str());
            if engine.set_ice_state(&peer_id, IceConnectionState::Disconnected) {
                info!("Peer {} lost its transport", peer_id);
            }
        }
        if !args.drop_peer.is_empty() {
            tokio::time::sleep(Duration::from_secs(args.grace_secs) + Duration::from_millis(500))
                .await;
        }

        let snapshot = call.snapshot().await?;
        info!(
            "Call state before hang-up: {} members, {} active timers",
            snapshot.members().len(),
            snapshot.active_timers
        );
    }

    call.hang_up().await?;
    let printed = printer.await.context("Event printer panicked")?;
    info!("Simulation finished, {} events emitted", printed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_turn_server() {
        let turn = parse_turn_server("turn:turn.example.com:3478:user:pa:ss").unwrap();
        assert_eq!(turn.url, "turn:turn.example.com:3478");
        assert_eq!(turn.username, "user");
        assert_eq!(turn.credential, "pa:ss");

        assert!(parse_turn_server("stun:host:3478:user:pass").is_err());
        assert!(parse_turn_server("turn:host").is_err());
    }

    #[test]
    fn test_args_build_valid_config() {
        let args = Args::parse_from(["call_sim", "--peers", "a,b,c", "--grace-secs", "5"]);
        assert_eq!(args.peers, vec!["a", "b", "c"]);

        let config = build_config_from_args(&args).unwrap();
        assert_eq!(config.disconnect_grace_secs, 5);
        assert!(config.turn_servers.is_empty());
    }

    #[test]
    fn test_zero_grace_is_rejected() {
        let args = Args::parse_from(["call_sim", "--grace-secs", "0"]);
        assert!(build_config_from_args(&args).is_err());
    }
}
