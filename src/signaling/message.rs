//! Signaling message types
//!
//! Every message travels as one JSON object on the room's broadcast channel:
//!
//! ```text
//! {"type":"offer","from":"aaa","to":"bbb","sdp":{"type":"offer","sdp":"v=0..."}}
//! {"type":"ice-candidate","from":"aaa","to":"bbb","candidate":{"candidate":"...","sdpMid":"0"}}
//! {"type":"camera-state","from":"aaa","cameraOn":false}
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;

/// Participant identifier
///
/// Random per call session. Ordering is lexical and doubles as the
/// politeness tie-break during negotiation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
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
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Room (signaling channel) identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpKind::Offer => write!(f, "offer"),
            SdpKind::Answer => write!(f, "answer"),
            SdpKind::Pranswer => write!(f, "pranswer"),
            SdpKind::Rollback => write!(f, "rollback"),
        }
    }
}

/// Session description, in the transport's native JSON shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    /// Pseudo-description that discards a pending local offer
    pub fn rollback() -> Self {
        Self {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        }
    }
}

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP mid (media ID)
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    /// SDP mline index
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    /// Username fragment
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(index);
        self
    }
}

/// Message-specific payload, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalPayload {
    /// Sender entered the room
    Join,
    /// SDP offer
    Offer { sdp: SessionDescription },
    /// SDP answer
    Answer { sdp: SessionDescription },
    /// Trickled ICE candidate
    IceCandidate { candidate: IceCandidate },
    /// Sender left the room
    Leave,
    /// Sender's camera was turned on or off
    CameraState {
        #[serde(rename = "cameraOn")]
        camera_on: bool,
    },
}

/// Signaling message
///
/// Messages with `to` set are unicast by convention only: the medium is a
/// broadcast, so receivers must drop messages addressed to someone else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub from: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerId>,
    #[serde(flatten)]
    pub payload: SignalPayload,
}

impl SignalMessage {
    /// Broadcast message
    pub fn broadcast(from: &PeerId, payload: SignalPayload) -> Self {
        Self {
            from: from.clone(),
            to: None,
            payload,
        }
    }

    /// Message addressed to a single peer
    pub fn unicast(from: &PeerId, to: &PeerId, payload: SignalPayload) -> Self {
        Self {
            from: from.clone(),
            to: Some(to.clone()),
            payload,
        }
    }

    pub fn join(from: &PeerId) -> Self {
        Self::broadcast(from, SignalPayload::Join)
    }

    pub fn leave(from: &PeerId) -> Self {
        Self::broadcast(from, SignalPayload::Leave)
    }

    pub fn camera_state(from: &PeerId, camera_on: bool) -> Self {
        Self::broadcast(from, SignalPayload::CameraState { camera_on })
    }

    /// Wire name of the message type
    pub fn kind(&self) -> &'static str {
        match self.payload {
            SignalPayload::Join => "join",
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::IceCandidate { .. } => "ice-candidate",
            SignalPayload::Leave => "leave",
            SignalPayload::CameraState { .. } => "camera-state",
        }
    }

    /// Whether a participant with id `local` should process this message
    pub fn is_addressed_to(&self, local: &PeerId) -> bool {
        match &self.to {
            Some(to) => to == local,
            None => true,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_ordering_is_lexical() {
        assert!(PeerId::from("bbb") > PeerId::from("aaa"));
        assert!(PeerId::from("a") < PeerId::from("aa"));
        assert_ne!(PeerId::random(), PeerId::random());
    }

    #[test]
    fn test_join_wire_shape() {
        let msg = SignalMessage::join(&PeerId::from("aaa"));
        let json: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(json, serde_json::json!({"type": "join", "from": "aaa"}));
    }

    #[test]
    fn test_camera_state_wire_shape() {
        let msg = SignalMessage::camera_state(&PeerId::from("aaa"), false);
        let json: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "camera-state", "from": "aaa", "cameraOn": false})
        );
    }

    #[test]
    fn test_decode_browser_ice_candidate() {
        let raw = r#"{
            "type": "ice-candidate",
            "from": "bbb",
            "to": "aaa",
            "candidate": {
                "candidate": "candidate:1 1 udp 2122260223 192.168.1.2 54321 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0,
                "usernameFragment": "abcd"
            }
        }"#;

        let msg = SignalMessage::decode(raw).unwrap();
        assert_eq!(msg.kind(), "ice-candidate");
        assert_eq!(msg.to, Some(PeerId::from("aaa")));
        match msg.payload {
            SignalPayload::IceCandidate { candidate } => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_decode_offer() {
        let raw = r#"{"type":"offer","from":"bbb","to":"aaa","sdp":{"type":"offer","sdp":"v=0"}}"#;
        let msg = SignalMessage::decode(raw).unwrap();
        assert_eq!(
            msg.payload,
            SignalPayload::Offer {
                sdp: SessionDescription::offer("v=0")
            }
        );
    }

    #[test]
    fn test_malformed_payloads_rejected() {
        assert!(SignalMessage::decode("not json").is_err());
        assert!(SignalMessage::decode(r#"{"type":"join"}"#).is_err());
        assert!(SignalMessage::decode(r#"{"type":"dance","from":"aaa"}"#).is_err());
        assert!(SignalMessage::decode(r#"{"type":"offer","from":"aaa"}"#).is_err());
    }

    #[test]
    fn test_addressing() {
        let local = PeerId::from("aaa");
        let other = PeerId::from("ccc");
        assert!(SignalMessage::join(&other).is_addressed_to(&local));

        let to_local = SignalMessage::unicast(&other, &local, SignalPayload::Leave);
        assert!(to_local.is_addressed_to(&local));

        let to_someone_else =
            SignalMessage::unicast(&other, &PeerId::from("bbb"), SignalPayload::Leave);
        assert!(!to_someone_else.is_addressed_to(&local));
    }
}
