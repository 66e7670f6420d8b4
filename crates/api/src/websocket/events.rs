//! WebSocket event types and serialization
//!
//! Every frame is a JSON object tagged by `eventName`. Client events are
//! decoded and validated before dispatch; server events are what gets
//! published on room channels and delivered to sockets.

use drn_shared::{MemberProfile, Room};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// =============================================================================
// Client-to-Server Events
// =============================================================================

/// Events sent from client to server
///
/// Required fields are optional here so that a missing one can be answered
/// with a specific error payload instead of a generic decode failure.
#[derive(Debug, Deserialize)]
#[serde(tag = "eventName", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// Join a room with a member profile
    Join {
        #[serde(default)]
        room_id: Option<String>,
        /// Any JSON value; anything but an object is refused on join
        #[serde(default)]
        profile: Option<Value>,
    },

    /// Broadcast an arbitrary payload to a joined room
    Message {
        #[serde(default)]
        room_id: Option<String>,
        #[serde(flatten)]
        payload: Map<String, Value>,
    },

    /// Leave a joined room
    Leave {
        #[serde(default)]
        room_id: Option<String>,
    },
}

// =============================================================================
// Server-to-Client Events
// =============================================================================

/// Events sent from server to client, directly or through a room channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventName", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Connection acknowledged
    Connected,

    /// A member joined. The direct reply to the joining socket also carries
    /// the members that were present before it.
    Joined {
        uid: String,
        room_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        profile: Option<Map<String, Value>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        member_profiles: Option<Vec<MemberProfile>>,
    },

    /// Member payload relayed to the room
    Message {
        uid: String,
        room_id: String,
        #[serde(flatten)]
        payload: Map<String, Value>,
    },

    /// A member left, either explicitly or because its socket closed
    Left {
        uid: String,
        room_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        closed: Option<bool>,
    },

    /// Room metadata changed
    RoomUpdated { room: Room },

    /// Room removed; members are disconnected
    RoomRemoved { room_id: String },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected => "connected",
            ServerEvent::Joined { .. } => "joined",
            ServerEvent::Message { .. } => "message",
            ServerEvent::Left { .. } => "left",
            ServerEvent::RoomUpdated { .. } => "roomUpdated",
            ServerEvent::RoomRemoved { .. } => "roomRemoved",
        }
    }
}

/// Error payload answered on the offending socket
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub message: String,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_deserialization() {
        let json = r#"{"eventName":"join","roomId":"course-1","profile":{"name":"Ace"}}"#;
        match serde_json::from_str::<ClientEvent>(json).unwrap() {
            ClientEvent::Join { room_id, profile } => {
                assert_eq!(room_id.as_deref(), Some("course-1"));
                assert_eq!(profile.unwrap()["name"], "Ace");
            }
            other => panic!("Expected Join event, got {:?}", other),
        }
    }

    #[test]
    fn test_join_missing_fields_still_decodes() {
        let json = r#"{"eventName":"join"}"#;
        match serde_json::from_str::<ClientEvent>(json).unwrap() {
            ClientEvent::Join { room_id, profile } => {
                assert!(room_id.is_none());
                assert!(profile.is_none());
            }
            other => panic!("Expected Join event, got {:?}", other),
        }
    }

    #[test]
    fn test_join_with_non_object_profile_still_decodes() {
        let json = r#"{"eventName":"join","roomId":"r1","profile":"x"}"#;
        match serde_json::from_str::<ClientEvent>(json).unwrap() {
            ClientEvent::Join { profile, .. } => assert_eq!(profile, Some(json!("x"))),
            other => panic!("Expected Join event, got {:?}", other),
        }
    }

    #[test]
    fn test_message_keeps_extra_payload() {
        let json = r#"{"eventName":"message","roomId":"r1","text":"found a disc","hole":7}"#;
        match serde_json::from_str::<ClientEvent>(json).unwrap() {
            ClientEvent::Message { room_id, payload } => {
                assert_eq!(room_id.as_deref(), Some("r1"));
                assert_eq!(payload["text"], "found a disc");
                assert_eq!(payload["hole"], 7);
                assert!(!payload.contains_key("eventName"));
                assert!(!payload.contains_key("roomId"));
            }
            other => panic!("Expected Message event, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_rejected() {
        assert!(serde_json::from_str::<ClientEvent>(r#"{"eventName":"roomRemoved"}"#).is_err());
        assert!(serde_json::from_str::<ClientEvent>(r#"{"roomId":"r1"}"#).is_err());
        assert!(serde_json::from_str::<ClientEvent>("not json").is_err());
    }

    #[test]
    fn test_connected_serialization() {
        let json = serde_json::to_string(&ServerEvent::Connected).unwrap();
        assert_eq!(json, r#"{"eventName":"connected"}"#);
    }

    #[test]
    fn test_message_serialization_flattens_payload() {
        let mut payload = Map::new();
        payload.insert("text".to_string(), json!("hi"));
        let event = ServerEvent::Message {
            uid: "u2".to_string(),
            room_id: "course-1".to_string(),
            payload,
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({ "eventName": "message", "uid": "u2", "roomId": "course-1", "text": "hi" })
        );

        let decoded: ServerEvent = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_left_closed_flag() {
        let event = ServerEvent::Left {
            uid: "u1".to_string(),
            room_id: "r1".to_string(),
            closed: Some(true),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({ "eventName": "left", "uid": "u1", "roomId": "r1", "closed": true })
        );

        let explicit = ServerEvent::Left {
            uid: "u1".to_string(),
            room_id: "r1".to_string(),
            closed: None,
        };
        assert!(serde_json::to_value(&explicit).unwrap().get("closed").is_none());
    }

    #[test]
    fn test_room_removed_serialization() {
        let event = ServerEvent::RoomRemoved {
            room_id: "r1".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({ "eventName": "roomRemoved", "roomId": "r1" })
        );
    }
}
