//! Inbound signaling messages
//!
//! The shape matches what the call's signaling relay forwards between
//! participants: a `type` tag plus camelCase fields (`userId`, `sdpMid`,
//! `sdpMLineIndex`).

use crate::model::{Candidate, InitiateType, MediaKind, PeerId};
use serde::{Deserialize, Serialize};

/// Messages the session accepts from remote peers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    /// SDP offer from a remote peer
    #[serde(rename_all = "camelCase")]
    Offer {
        user_id: PeerId,
        sdp: String,
        #[serde(default)]
        media_kind: MediaKind,
        #[serde(default = "default_initiate_type")]
        initiate_type: InitiateType,
        /// Offer belongs to an invitation into a running call
        #[serde(default)]
        is_inviting: bool,
        /// Remote peer rebuilt its side of the connection
        #[serde(default)]
        is_rejoin: bool,
        /// Channel of the call, adopted when the session has none yet
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_id: Option<String>,
    },

    /// SDP answer to one of our offers
    #[serde(rename_all = "camelCase")]
    Answer { user_id: PeerId, sdp: String },

    /// Remote ICE candidate
    #[serde(rename_all = "camelCase")]
    Candidate {
        user_id: PeerId,
        sdp: String,
        #[serde(default)]
        sdp_mid: Option<String>,
        #[serde(default, rename = "sdpMLineIndex")]
        sdp_m_line_index: Option<u16>,
    },

    /// Peer left the call
    #[serde(rename_all = "camelCase")]
    Leave { user_id: PeerId },

    /// Peer wants its connection rebuilt
    #[serde(rename_all = "camelCase")]
    Rejoin { user_id: PeerId },

    /// Peer toggled its audio or video
    #[serde(rename_all = "camelCase")]
    MuteStatus {
        user_id: PeerId,
        kind: MediaKind,
        muted: bool,
    },

    /// Peer ended the call
    #[serde(rename_all = "camelCase")]
    CallCut { user_id: PeerId },
}

fn default_initiate_type() -> InitiateType {
    InitiateType::Incoming
}

impl SignalingMessage {
    /// Peer the message came from
    pub fn user_id(&self) -> &PeerId {
        match self {
            SignalingMessage::Offer { user_id, .. }
            | SignalingMessage::Answer { user_id, .. }
            | SignalingMessage::Candidate { user_id, .. }
            | SignalingMessage::Leave { user_id }
            | SignalingMessage::Rejoin { user_id }
            | SignalingMessage::MuteStatus { user_id, .. }
            | SignalingMessage::CallCut { user_id } => user_id,
        }
    }

    /// Get the message type name
    pub fn type_name(&self) -> &'static str {
        match self {
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::Candidate { .. } => "candidate",
            SignalingMessage::Leave { .. } => "leave",
            SignalingMessage::Rejoin { .. } => "rejoin",
            SignalingMessage::MuteStatus { .. } => "mute_status",
            SignalingMessage::CallCut { .. } => "call_cut",
        }
    }

    /// Build a candidate message from a [`Candidate`]
    pub fn candidate(user_id: impl Into<PeerId>, candidate: Candidate) -> Self {
        SignalingMessage::Candidate {
            user_id: user_id.into(),
            sdp: candidate.sdp,
            sdp_mid: candidate.sdp_mid,
            sdp_m_line_index: candidate.sdp_m_line_index,
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to serialize signaling message: {}",
                e
            ))
        })
    }

    /// Parse from JSON string
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to deserialize signaling message: {}",
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_offer_with_defaults() {
        let json = r#"{"type":"offer","userId":"alice","sdp":"v=0","mediaKind":"video"}"#;
        let msg = SignalingMessage::from_json(json).unwrap();

        match msg {
            SignalingMessage::Offer {
                ref user_id,
                media_kind,
                initiate_type,
                is_inviting,
                is_rejoin,
                ref channel,
                ..
            } => {
                assert_eq!(user_id.as_str(), "alice");
                assert!(channel.is_none());
                assert_eq!(media_kind, MediaKind::Video);
                assert_eq!(initiate_type, InitiateType::Incoming);
                assert!(!is_inviting);
                assert!(!is_rejoin);
            }
            _ => panic!("Wrong message type"),
        }
        assert_eq!(msg.type_name(), "offer");
    }

    #[test]
    fn test_parse_offer_with_call_identity() {
        let json = r#"{"type":"offer","userId":"alice","sdp":"v=0","channel":"room-7","groupId":"g-7"}"#;
        let msg = SignalingMessage::from_json(json).unwrap();
        let SignalingMessage::Offer {
            channel, group_id, ..
        } = msg
        else {
            panic!("Wrong message type");
        };
        assert_eq!(channel.as_deref(), Some("room-7"));
        assert_eq!(group_id.as_deref(), Some("g-7"));
    }

    #[test]
    fn test_candidate_wire_fields() {
        let msg = SignalingMessage::candidate(
            "bob",
            Candidate::new("candidate:1 1 udp 1 10.0.0.2 4000 typ host", Some("audio".into()), Some(1)),
        );
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"type\":\"candidate\""));
        assert!(json.contains("\"userId\":\"bob\""));
        assert!(json.contains("\"sdpMid\":\"audio\""));
        assert!(json.contains("\"sdpMLineIndex\":1"));

        let parsed = SignalingMessage::from_json(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_parse_control_messages() {
        let msg = SignalingMessage::from_json(r#"{"type":"mute_status","userId":"carol","kind":"audio","muted":true}"#)
            .unwrap();
        assert_eq!(msg.user_id().as_str(), "carol");
        assert_eq!(msg.type_name(), "mute_status");

        let msg = SignalingMessage::from_json(r#"{"type":"call_cut","userId":"carol"}"#).unwrap();
        assert!(matches!(msg, SignalingMessage::CallCut { .. }));
    }

    #[test]
    fn test_invalid_json() {
        assert!(SignalingMessage::from_json("{not json").is_err());
        assert!(SignalingMessage::from_json(r#"{"type":"unknown","userId":"x"}"#).is_err());
    }
}
