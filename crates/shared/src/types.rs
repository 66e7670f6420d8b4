//! Common types used across DRN realtime

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// =============================================================================
// Rooms
// =============================================================================

/// A named broadcast domain, persisted in the shared store so every instance
/// can discover it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: String,
    pub name: String,
    /// Room record and member presence never expire
    #[serde(default, skip_serializing_if = "is_false")]
    pub no_expiration: bool,
    /// Any other fields supplied by the administrative caller
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

/// Room payload as received from an administrative caller
#[derive(Debug, Clone, Deserialize)]
pub struct RoomInput {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, rename = "noExpiration")]
    pub no_expiration: bool,
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl RoomInput {
    /// Build the persisted room record, generating an id when none was given
    pub fn into_room(self) -> Room {
        let id = self
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Room {
            id,
            name: self.name,
            no_expiration: self.no_expiration,
            metadata: self.metadata,
        }
    }
}

// =============================================================================
// Presence
// =============================================================================

/// Member profile stored as the value of a presence entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberProfile {
    pub uid: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl MemberProfile {
    /// Stamp the connection identity onto a client supplied profile
    pub fn new(uid: impl Into<String>, mut fields: Map<String, Value>) -> Self {
        // The verified identity always wins over anything the client sent
        fields.remove("uid");
        Self {
            uid: uid.into(),
            fields,
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_room_input_generates_id() {
        let input: RoomInput = serde_json::from_value(json!({ "name": "Pier Park" })).unwrap();
        let room = input.into_room();
        assert!(Uuid::parse_str(&room.id).is_ok());
        assert_eq!(room.name, "Pier Park");
    }

    #[test]
    fn test_room_keeps_metadata_and_explicit_id() {
        let input: RoomInput = serde_json::from_value(json!({
            "id": "course-1",
            "name": "Maple Hill",
            "noExpiration": true,
            "holes": 18
        }))
        .unwrap();
        let room = input.into_room();

        let json = serde_json::to_value(&room).unwrap();
        assert_eq!(json["id"], "course-1");
        assert_eq!(json["holes"], 18);
        assert_eq!(json["noExpiration"], true);
    }

    #[test]
    fn test_expiring_room_omits_flag() {
        let room = Room {
            id: "r1".to_string(),
            name: "Room".to_string(),
            no_expiration: false,
            metadata: Map::new(),
        };
        let json = serde_json::to_string(&room).unwrap();
        assert_eq!(json, r#"{"id":"r1","name":"Room"}"#);
    }

    #[test]
    fn test_member_profile_uid_cannot_be_spoofed() {
        let fields = json!({ "uid": "someone-else", "name": "Ace" })
            .as_object()
            .cloned()
            .unwrap();
        let profile = MemberProfile::new("u1", fields);

        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json, json!({ "uid": "u1", "name": "Ace" }));
    }
}
