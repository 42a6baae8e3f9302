//! Call session
//!
//! A [`CallSession`] owns all state of one call and runs as a single task.
//! Callers talk to it through a cloneable [`CallHandle`]; engine callbacks,
//! finished engine calls and grace timer expiries come back to it as
//! internal messages. Only the session task mutates state, so no locks are
//! held anywhere in the call logic.
//!
//! ```text
//!  CallHandle ──Command──┐
//!                        ▼
//!  engine tasks ──► CallSession loop ──OutboundEvent──► EventReceiver
//!  timers       ──►      │
//!                        └─► MediaEngine / VideoSurfaceBinder
//! ```

mod call;
pub mod handle;
pub(crate) mod negotiation;
mod orchestrator;
mod reconnect;
mod store;

pub use handle::CallHandle;
pub use orchestrator::{GroupCallRequest, GroupOfferReport};
pub use store::{SessionSnapshot, TrackState};

use self::negotiation::{NegotiationStep, OfferContext, OfferIntent};
use self::orchestrator::{GroupContext, OfferOutcome};
use self::store::SessionStore;
use crate::config::CallConfig;
use crate::engine::{ConnectionId, EngineEvent, MediaEngine, VideoSurfaceBinder};
use crate::events::{EventReceiver, EventSink};
use crate::model::{Candidate, MediaKind, PeerId};
use crate::signaling::SignalingMessage;
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Requests from [`CallHandle`]s
#[derive(Debug)]
pub(crate) enum Command {
    StartGroupCall {
        request: GroupCallRequest,
        reply: oneshot::Sender<Result<GroupOfferReport>>,
    },
    Signal(SignalingMessage),
    LocalMediaReady(MediaKind),
    JoinChannel {
        channel: String,
        group_id: String,
    },
    SetMuted {
        kind: MediaKind,
        muted: bool,
    },
    Renegotiate {
        peer_id: PeerId,
        force_new: bool,
    },
    UpgradeToVideo {
        peer_id: PeerId,
        video_request_accepted: bool,
    },
    RestartAll,
    TransportDisconnected {
        peer_id: PeerId,
        is_self: bool,
    },
    TransportReconnected {
        peer_id: PeerId,
    },
    HangUp {
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
}

/// Messages the session posts to itself
#[derive(Debug)]
pub(crate) enum Internal {
    /// Callback from a connection's engine
    Engine {
        peer_id: PeerId,
        connection_id: ConnectionId,
        event: EngineEvent,
    },
    /// An engine call finished
    Step {
        peer_id: PeerId,
        connection_id: ConnectionId,
        step: NegotiationStep,
    },
    /// Every offer of a group call round finished
    GroupOffersJoined {
        context: GroupContext,
        outcomes: Vec<OfferOutcome>,
    },
    DisconnectTimerFired {
        peer_id: PeerId,
        token: u64,
    },
}

/// State and logic of one call
pub struct CallSession {
    config: CallConfig,
    engine: Arc<dyn MediaEngine>,
    surfaces: Arc<dyn VideoSurfaceBinder>,
    store: SessionStore,
    events: EventSink,
    internal_tx: mpsc::UnboundedSender<Internal>,
}

impl CallSession {
    /// Validate `config` and start a session task on the current runtime
    ///
    /// The session runs until every [`CallHandle`] is dropped; a call that
    /// was not hung up by then is hung up on the way out.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when the configuration is rejected.
    pub fn spawn(
        config: CallConfig,
        engine: Arc<dyn MediaEngine>,
        surfaces: Arc<dyn VideoSurfaceBinder>,
    ) -> Result<(CallHandle, EventReceiver)> {
        config.validate()?;

        let (command_tx, command_rx) = mpsc::channel(config.command_queue_capacity);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let session = CallSession {
            store: SessionStore::new(&config),
            config,
            engine,
            surfaces,
            events: EventSink::new(event_tx),
            internal_tx,
        };

        info!(
            "Starting call session (self={}, max_peers={}, grace={}s)",
            session.config.self_peer_id,
            session.config.max_peers,
            session.config.disconnect_grace_secs
        );
        tokio::spawn(session.run(command_rx, internal_rx));

        Ok((CallHandle::new(command_tx), event_rx))
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                biased;

                Some(message) = internal.recv() => self.handle_internal(message).await,

                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
            }

            if self.store.local_media.take_activated() && !self.store.call.hung_up {
                self.replay_pending_offers().await;
            }
        }

        if self.hang_up().await {
            info!("Call session closed without hang-up, tore the call down");
        }
        debug!("Call session loop exited");
    }

    async fn handle_command(&mut self, command: Command) {
        if self.store.call.hung_up {
            match command {
                Command::StartGroupCall { reply, .. } => {
                    let _ = reply.send(Err(Error::PreconditionViolation(
                        "call already ended".to_string(),
                    )));
                }
                Command::HangUp { reply } => {
                    let _ = reply.send(false);
                }
                Command::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                other => debug!("Call ended, ignoring {:?}", other),
            }
            return;
        }

        match command {
            Command::StartGroupCall { request, reply } => {
                self.start_group_call(request, reply).await
            }
            Command::Signal(message) => self.handle_signal(message).await,
            Command::LocalMediaReady(kind) => self.on_local_media_ready(kind).await,
            Command::JoinChannel { channel, group_id } => self.join_channel(channel, group_id),
            Command::SetMuted { kind, muted } => self.set_muted(kind, muted),
            Command::Renegotiate { peer_id, force_new } => {
                let intent = OfferIntent {
                    force_new,
                    is_upgrade: force_new,
                    video_request_accepted: false,
                };
                self.renegotiate(peer_id, intent).await
            }
            Command::UpgradeToVideo {
                peer_id,
                video_request_accepted,
            } => self.upgrade_to_video(peer_id, video_request_accepted).await,
            Command::RestartAll => self.restart_all_connections().await,
            Command::TransportDisconnected { peer_id, is_self } => {
                self.on_transport_disconnected(peer_id, is_self)
            }
            Command::TransportReconnected { peer_id } => self.on_transport_reconnected(peer_id),
            Command::HangUp { reply } => {
                let performed = self.hang_up().await;
                let _ = reply.send(performed);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    async fn handle_signal(&mut self, message: SignalingMessage) {
        debug!(
            "Signal {} from {}",
            message.type_name(),
            message.user_id()
        );
        match message {
            SignalingMessage::Offer {
                user_id,
                sdp,
                media_kind,
                initiate_type,
                is_inviting,
                is_rejoin,
                channel,
                group_id,
            } => {
                let context = OfferContext {
                    sdp,
                    media_kind,
                    initiate_type,
                    is_inviting,
                    is_rejoin,
                    channel,
                    group_id,
                };
                self.on_remote_offer(user_id, context).await
            }
            SignalingMessage::Answer { user_id, sdp } => self.on_remote_answer(user_id, sdp),
            SignalingMessage::Candidate {
                user_id,
                sdp,
                sdp_mid,
                sdp_m_line_index,
            } => self.on_remote_candidate(user_id, Candidate::new(sdp, sdp_mid, sdp_m_line_index)),
            SignalingMessage::Leave { user_id } => self.depart_peer(&user_id, true).await,
            SignalingMessage::Rejoin { user_id } => self.on_rejoin(user_id).await,
            SignalingMessage::MuteStatus {
                user_id,
                kind,
                muted,
            } => self.on_remote_mute(user_id, kind, muted),
            SignalingMessage::CallCut { user_id } => {
                info!("Peer {} ended the call", user_id);
                self.hang_up().await;
            }
        }
    }

    async fn handle_internal(&mut self, message: Internal) {
        if self.store.call.hung_up {
            if let Internal::GroupOffersJoined { context, .. } = message {
                context.reply(Err(Error::PreconditionViolation(
                    "call ended before the offers completed".to_string(),
                )));
            }
            return;
        }

        match message {
            Internal::Engine {
                peer_id,
                connection_id,
                event,
            } => self.on_engine_event(peer_id, connection_id, event).await,
            Internal::Step {
                peer_id,
                connection_id,
                step,
            } => self.on_step(peer_id, connection_id, step).await,
            Internal::GroupOffersJoined { context, outcomes } => {
                self.on_group_offers_joined(context, outcomes).await
            }
            Internal::DisconnectTimerFired { peer_id, token } => {
                self.on_disconnect_timer_fired(peer_id, token).await
            }
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        self.store.snapshot(&self.config.self_peer_id)
    }
}
