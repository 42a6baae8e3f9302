//! Configuration types for call sessions

use crate::model::PeerId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for a [`CallSession`](crate::session::CallSession)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// STUN server URLs (at least one required)
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Reserved id of the local user (default: "stream0")
    ///
    /// Also used as the media stream id of the local tracks.
    pub self_peer_id: PeerId,

    /// Track id of the shared local audio track (default: "audio0")
    pub audio_track_id: String,

    /// Track id of the shared local video track (default: "video0")
    pub video_track_id: String,

    /// Maximum remote peers in a call (default: 10, max: 32)
    pub max_peers: u32,

    /// Grace period before a disconnected peer is declared departed (default: 30s)
    pub disconnect_grace_secs: u64,

    /// Capacity of the command queue between handles and the session loop
    pub command_queue_capacity: usize,
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn:// or turns://)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// ICE server set handed to the media engine for every new connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IceConfig {
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServerConfig>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            self_peer_id: PeerId::from("stream0"),
            audio_track_id: "audio0".to_string(),
            video_track_id: "video0".to_string(),
            max_peers: 10,
            disconnect_grace_secs: 30,
            command_queue_capacity: 256,
        }
    }
}

impl CallConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `stun_servers` is empty
    /// - `max_peers` is not in range 1-32
    /// - `disconnect_grace_secs` is zero
    /// - `self_peer_id` or a track id is empty, or the two track ids collide
    /// - `command_queue_capacity` is zero
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.stun_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN server is required".to_string(),
            ));
        }

        if self.max_peers == 0 || self.max_peers > 32 {
            return Err(Error::InvalidConfig(format!(
                "max_peers must be in range 1-32, got {}",
                self.max_peers
            )));
        }

        if self.disconnect_grace_secs == 0 {
            return Err(Error::InvalidConfig(
                "disconnect_grace_secs must be greater than zero".to_string(),
            ));
        }

        if self.self_peer_id.as_str().is_empty() {
            return Err(Error::InvalidConfig(
                "self_peer_id must not be empty".to_string(),
            ));
        }

        if self.audio_track_id.is_empty() || self.video_track_id.is_empty() {
            return Err(Error::InvalidConfig(
                "local track ids must not be empty".to_string(),
            ));
        }

        if self.audio_track_id == self.video_track_id {
            return Err(Error::InvalidConfig(format!(
                "audio and video tracks need distinct ids, both are {}",
                self.audio_track_id
            )));
        }

        if self.command_queue_capacity == 0 {
            return Err(Error::InvalidConfig(
                "command_queue_capacity must be greater than zero".to_string(),
            ));
        }

        for turn in &self.turn_servers {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(Error::InvalidConfig(format!(
                    "TURN url must start with turn: or turns:, got {}",
                    turn.url
                )));
            }
        }

        Ok(())
    }

    /// Create a configuration preset for cellular or unstable networks
    ///
    /// Peers get a longer grace period before being declared departed, and a
    /// backup STUN server is configured. Add TURN servers with
    /// [`with_turn_servers`](Self::with_turn_servers).
    ///
    /// # Example
    ///
    /// ```
    /// use remotemedia_webrtc_call::config::CallConfig;
    ///
    /// let config = CallConfig::mobile_network_preset();
    /// assert_eq!(config.disconnect_grace_secs, 45);
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn mobile_network_preset() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            max_peers: 5,
            disconnect_grace_secs: 45,
            ..Default::default()
        }
    }

    /// Add TURN servers to this configuration
    pub fn with_turn_servers(mut self, turn_servers: Vec<TurnServerConfig>) -> Self {
        self.turn_servers = turn_servers;
        self
    }

    /// Set the reserved id of the local user
    pub fn with_self_peer_id(mut self, self_peer_id: impl Into<PeerId>) -> Self {
        self.self_peer_id = self_peer_id.into();
        self
    }

    /// Set maximum peers
    pub fn with_max_peers(mut self, max_peers: u32) -> Self {
        self.max_peers = max_peers;
        self
    }

    /// Set the disconnect grace period in seconds
    pub fn with_disconnect_grace_secs(mut self, secs: u64) -> Self {
        self.disconnect_grace_secs = secs;
        self
    }

    /// Disconnect grace period as a [`Duration`]
    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }

    /// ICE servers for new connections
    pub fn ice_config(&self) -> IceConfig {
        IceConfig {
            stun_servers: self.stun_servers.clone(),
            turn_servers: self.turn_servers.clone(),
        }
    }
}
