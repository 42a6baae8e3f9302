//! Cloneable front door of a call session

use super::{Command, GroupCallRequest, GroupOfferReport, SessionSnapshot};
use crate::model::{Candidate, MediaKind, PeerId};
use crate::signaling::SignalingMessage;
use crate::{Error, Result};
use tokio::sync::{mpsc, oneshot};

/// Handle to a running [`CallSession`](super::CallSession)
///
/// Every method only enqueues a request, so handles can be used from any
/// task. Once the session is gone, methods return [`Error::SessionClosed`].
#[derive(Debug, Clone)]
pub struct CallHandle {
    tx: mpsc::Sender<Command>,
}

impl CallHandle {
    pub(crate) fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).await.map_err(|_| Error::SessionClosed)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(make(reply_tx)).await?;
        reply_rx.await.map_err(|_| Error::SessionClosed)
    }

    /// Offer to every participant and wait for the aggregated outcome
    ///
    /// Partial failures are part of the report. A round where nobody got an
    /// offer is still `Ok`; use [`GroupOfferReport::ensure_any_succeeded`]
    /// to turn it into an error.
    pub async fn start_group_call(&self, request: GroupCallRequest) -> Result<GroupOfferReport> {
        self.request(|reply| Command::StartGroupCall { request, reply })
            .await?
    }

    /// Feed a decoded signaling message into the session
    pub async fn handle_signal(&self, message: SignalingMessage) -> Result<()> {
        self.send(Command::Signal(message)).await
    }

    /// Decode a JSON signaling message and feed it into the session
    pub async fn handle_signal_json(&self, json: &str) -> Result<()> {
        self.handle_signal(SignalingMessage::from_json(json)?).await
    }

    pub async fn remote_answer(&self, user_id: impl Into<PeerId>, sdp: impl Into<String>) -> Result<()> {
        self.handle_signal(SignalingMessage::Answer {
            user_id: user_id.into(),
            sdp: sdp.into(),
        })
        .await
    }

    pub async fn remote_candidate(&self, user_id: impl Into<PeerId>, candidate: Candidate) -> Result<()> {
        self.handle_signal(SignalingMessage::candidate(user_id, candidate))
            .await
    }

    pub async fn participant_left(&self, user_id: impl Into<PeerId>) -> Result<()> {
        self.handle_signal(SignalingMessage::Leave {
            user_id: user_id.into(),
        })
        .await
    }

    /// Set the channel and group every outbound event is stamped with
    pub async fn join_channel(
        &self,
        channel: impl Into<String>,
        group_id: impl Into<String>,
    ) -> Result<()> {
        self.send(Command::JoinChannel {
            channel: channel.into(),
            group_id: group_id.into(),
        })
        .await
    }

    /// Local capture for `kind` is available; queued offers are answered
    pub async fn local_media_ready(&self, kind: MediaKind) -> Result<()> {
        self.send(Command::LocalMediaReady(kind)).await
    }

    pub async fn set_audio_muted(&self, muted: bool) -> Result<()> {
        self.send(Command::SetMuted {
            kind: MediaKind::Audio,
            muted,
        })
        .await
    }

    pub async fn set_video_muted(&self, muted: bool) -> Result<()> {
        self.send(Command::SetMuted {
            kind: MediaKind::Video,
            muted,
        })
        .await
    }

    /// Send a single offer to `peer_id`
    ///
    /// Creates the connection when the peer has none. An existing
    /// connection is only replaced with `force_new`.
    pub async fn renegotiate(&self, peer_id: impl Into<PeerId>, force_new: bool) -> Result<()> {
        self.send(Command::Renegotiate {
            peer_id: peer_id.into(),
            force_new,
        })
        .await
    }

    /// Switch the call to video and rebuild the connection to `peer_id`
    pub async fn upgrade_to_video(
        &self,
        peer_id: impl Into<PeerId>,
        video_request_accepted: bool,
    ) -> Result<()> {
        self.send(Command::UpgradeToVideo {
            peer_id: peer_id.into(),
            video_request_accepted,
        })
        .await
    }

    pub async fn restart_all_connections(&self) -> Result<()> {
        self.send(Command::RestartAll).await
    }

    /// Report a lost transport; `is_self` means the local user's own link
    pub async fn transport_disconnected(&self, peer_id: impl Into<PeerId>, is_self: bool) -> Result<()> {
        self.send(Command::TransportDisconnected {
            peer_id: peer_id.into(),
            is_self,
        })
        .await
    }

    pub async fn transport_reconnected(&self, peer_id: impl Into<PeerId>) -> Result<()> {
        self.send(Command::TransportReconnected {
            peer_id: peer_id.into(),
        })
        .await
    }

    /// End the call
    ///
    /// Returns `true` for the call that performed the teardown and `false`
    /// when the call had already ended.
    pub async fn hang_up(&self) -> Result<bool> {
        self.request(|reply| Command::HangUp { reply }).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Whether the session task is gone
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
