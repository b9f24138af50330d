//! Signaling wire protocol.
//!
//! Text WebSocket frames carrying JSON objects with a `type` discriminator.
//! The broker treats payloads as opaque and only stamps routing ids; the
//! publisher works with the typed envelope. A message's target is its
//! `clientId`; `fromClientId` is the sender stamped by the broker and used
//! as the routing fallback.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    ViewerConnected {
        #[serde(rename = "clientId")]
        client_id: String,
    },
    Offer {
        #[serde(rename = "clientId")]
        client_id: String,
        offer: RTCSessionDescription,
    },
    Answer {
        #[serde(rename = "clientId", default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        #[serde(
            rename = "fromClientId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        from_client_id: Option<String>,
        answer: RTCSessionDescription,
    },
    Candidate {
        #[serde(rename = "clientId", default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        #[serde(
            rename = "fromClientId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        from_client_id: Option<String>,
        candidate: RTCIceCandidateInit,
    },
    #[serde(other)]
    Unknown,
}

impl SignalMessage {
    /// The id used to dispatch the message to a viewer entry: the target
    /// `clientId` when present, otherwise the originating `fromClientId`.
    pub fn route_id(&self) -> Option<&str> {
        match self {
            SignalMessage::Answer {
                client_id,
                from_client_id,
                ..
            }
            | SignalMessage::Candidate {
                client_id,
                from_client_id,
                ..
            } => client_id.as_deref().or(from_client_id.as_deref()),
            SignalMessage::ViewerConnected { client_id } => Some(client_id),
            SignalMessage::Offer { client_id, .. } => Some(client_id),
            SignalMessage::Unknown => None,
        }
    }
}

/// Builds the notification the broker sends to existing clients when a new
/// client joins.
pub fn viewer_connected_notification(client_id: &str) -> String {
    serde_json::json!({
        "type": "viewer_connected",
        "clientId": client_id,
    })
    .to_string()
}

/// Stamps routing ids onto a relayed message: `fromClientId` is always the
/// sender; `clientId` is only set when the sender did not address a target.
pub fn stamp_routed_message(mut message: Value, sender_id: &str) -> Value {
    if let Some(object) = message.as_object_mut() {
        object
            .entry("clientId")
            .or_insert_with(|| Value::String(sender_id.to_owned()));
        object.insert(
            "fromClientId".to_owned(),
            Value::String(sender_id.to_owned()),
        );
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MINIMAL_SDP: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

    #[test]
    fn test_offer_serialization_shape() {
        let offer = RTCSessionDescription::offer(MINIMAL_SDP.to_owned()).unwrap();
        let message = SignalMessage::Offer {
            client_id: "client-2".to_owned(),
            offer,
        };
        let value: Value = serde_json::from_str(&serde_json::to_string(&message).unwrap()).unwrap();
        assert_eq!(value["type"], "offer");
        assert_eq!(value["clientId"], "client-2");
        assert_eq!(value["offer"]["type"], "offer");
        assert_eq!(value["offer"]["sdp"], MINIMAL_SDP);
    }

    #[test]
    fn test_answer_deserialization() {
        let raw = json!({
            "type": "answer",
            "fromClientId": "client-3",
            "answer": {"type": "answer", "sdp": "v=0\r\n"}
        })
        .to_string();
        let message: SignalMessage = serde_json::from_str(&raw).unwrap();
        match &message {
            SignalMessage::Answer {
                client_id,
                from_client_id,
                answer,
            } => {
                assert!(client_id.is_none());
                assert_eq!(from_client_id.as_deref(), Some("client-3"));
                assert_eq!(answer.sdp, "v=0\r\n");
            }
            other => panic!("unexpected message: {:?}", other),
        }
        assert_eq!(message.route_id(), Some("client-3"));
    }

    #[test]
    fn test_candidate_deserialization_from_browser_shape() {
        let raw = json!({
            "type": "candidate",
            "clientId": "client-1",
            "fromClientId": "client-2",
            "candidate": {
                "candidate": "candidate:1 1 udp 2122260223 192.0.2.1 61764 typ host",
                "sdpMLineIndex": 0,
                "sdpMid": "0"
            }
        })
        .to_string();
        let message: SignalMessage = serde_json::from_str(&raw).unwrap();
        match &message {
            SignalMessage::Candidate { candidate, .. } => {
                assert!(candidate.candidate.contains("typ host"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
        // Target id takes precedence over the origin.
        assert_eq!(message.route_id(), Some("client-1"));
    }

    #[test]
    fn test_unknown_type_is_tolerated() {
        let raw = json!({"type": "chat", "text": "hello"}).to_string();
        let message: SignalMessage = serde_json::from_str(&raw).unwrap();
        assert!(matches!(message, SignalMessage::Unknown));
        assert_eq!(message.route_id(), None);
    }

    #[test]
    fn test_stamp_adds_sender_ids() {
        let incoming = json!({"type": "candidate", "candidate": {"candidate": "..."}});
        let stamped = stamp_routed_message(incoming, "client-1");
        assert_eq!(stamped["clientId"], "client-1");
        assert_eq!(stamped["fromClientId"], "client-1");
    }

    #[test]
    fn test_stamp_preserves_existing_target() {
        let incoming = json!({"type": "answer", "clientId": "client-7"});
        let stamped = stamp_routed_message(incoming, "client-2");
        assert_eq!(stamped["clientId"], "client-7");
        assert_eq!(stamped["fromClientId"], "client-2");
    }

    #[test]
    fn test_viewer_connected_notification_shape() {
        let raw = viewer_connected_notification("client-2");
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["type"], "viewer_connected");
        assert_eq!(value["clientId"], "client-2");
        let parsed: SignalMessage = serde_json::from_str(&raw).unwrap();
        assert!(matches!(parsed, SignalMessage::ViewerConnected { .. }));
    }
}
