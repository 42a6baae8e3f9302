//! Core value types shared by the session, the engine seam and signaling

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque participant identifier
///
/// The local user is represented by a reserved sentinel (see
/// [`CallConfig::self_peer_id`](crate::config::CallConfig::self_peer_id)) and
/// is never counted as a remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Media kind of a call or a track
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Audio only
    #[default]
    Audio,
    /// Audio and video
    Video,
}

/// Who initiated the call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitiateType {
    Incoming,
    #[default]
    Outgoing,
    Missed,
}

/// SDP description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description handed to and from the media engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate as exchanged over signaling
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    pub sdp: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
}

impl Candidate {
    pub fn new(sdp: impl Into<String>, sdp_mid: Option<String>, sdp_m_line_index: Option<u16>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_mid,
            sdp_m_line_index,
        }
    }
}

/// What the local side wants to receive when creating an offer or answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub receive_audio: bool,
    pub receive_video: bool,
}

impl MediaConstraints {
    /// Audio is always received; video only on video calls
    pub fn for_call(kind: MediaKind) -> Self {
        Self {
            receive_audio: true,
            receive_video: kind == MediaKind::Video,
        }
    }
}

/// Roster entry for a group call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallParticipant {
    pub id: PeerId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_connected: bool,
}

impl CallParticipant {
    pub fn new(id: impl Into<PeerId>) -> Self {
        Self {
            id: id.into(),
            name: None,
            is_connected: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_wire_names() {
        let candidate = Candidate::new("candidate:1 1 UDP 1 10.0.0.1 5000 typ host", Some("0".into()), Some(0));
        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
    }

    #[test]
    fn test_initiate_type_wire_names() {
        let json = serde_json::to_string(&InitiateType::Incoming).unwrap();
        assert_eq!(json, "\"Incoming\"");
        let kind: MediaKind = serde_json::from_str("\"video\"").unwrap();
        assert_eq!(kind, MediaKind::Video);
    }

    #[test]
    fn test_constraints_follow_call_type() {
        assert!(!MediaConstraints::for_call(MediaKind::Audio).receive_video);
        assert!(MediaConstraints::for_call(MediaKind::Video).receive_video);
        assert!(MediaConstraints::for_call(MediaKind::Audio).receive_audio);
    }

    #[test]
    fn test_enum_defaults() {
        assert_eq!(MediaKind::default(), MediaKind::Audio);
        assert_eq!(InitiateType::default(), InitiateType::Outgoing);
    }

    #[test]
    fn test_participant_defaults() {
        let p: CallParticipant = serde_json::from_str(r#"{"id":"alice"}"#).unwrap();
        assert_eq!(p.id, PeerId::from("alice"));
        assert!(!p.is_connected);
    }
}
