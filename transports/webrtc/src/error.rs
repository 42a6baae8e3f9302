//! Error types for call orchestration

/// Result type alias using the call Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while orchestrating a call
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The media engine rejected a connection, description or offer/answer step
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// The media engine rejected an ICE candidate
    #[error("Candidate apply failure: {0}")]
    CandidateApplyFailure(String),

    /// Every offer attempt of a group call failed
    #[error("All {failed} offer attempts failed")]
    AggregateOfferFailure {
        /// Number of failed attempts
        failed: usize,
    },

    /// A signal arrived that does not fit the current peer state
    #[error("Precondition violation: {0}")]
    PreconditionViolation(String),

    /// A disconnect grace timer is already running for this peer
    #[error("Disconnect timer already active for peer {0}")]
    DuplicateDisconnectTimer(String),

    /// Peer limit reached
    #[error("Peer limit reached: max {0} peers")]
    PeerLimitReached(u32),

    /// Local media track error
    #[error("Media track error: {0}")]
    MediaTrackError(String),

    /// The session task is gone
    #[error("Call session closed")]
    SessionClosed,

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if the session keeps running after this error
    ///
    /// Everything except configuration problems and a closed session is
    /// reported on the event channel and the call carries on.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::InvalidConfig(_) | Error::SessionClosed)
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// Check if this error is a peer-related error
    pub fn is_peer_error(&self) -> bool {
        matches!(
            self,
            Error::TransportFailure(_)
                | Error::CandidateApplyFailure(_)
                | Error::PreconditionViolation(_)
                | Error::DuplicateDisconnectTimer(_)
                | Error::PeerLimitReached(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}
