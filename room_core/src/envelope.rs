//! Wire schema of every message exchanged between peers.
//!
//! Each message is one JSON object `{ "type": ..., "data": {...} }`.

use crate::{AvatarState, CanvasId, CanvasState, PeerId, Vec3};
use serde::{Deserialize, Serialize};

/// One connection-level message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Envelope {
    PlayerInfo(PlayerInfo),
    PlayerMove(PlayerMove),
    #[serde(alias = "CanvasData")]
    CanvasUpdate(CanvasUpdate),
    RequestPeerList(RequestPeerList),
    PeerList(PeerList),
    RequestAllCanvasData(RequestAllCanvasData),
    PlayerLeft(PlayerLeft),
}

impl Envelope {
    /// Name of the message type as it appears on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::PlayerInfo(_) => "PlayerInfo",
            Envelope::PlayerMove(_) => "PlayerMove",
            Envelope::CanvasUpdate(_) => "CanvasUpdate",
            Envelope::RequestPeerList(_) => "RequestPeerList",
            Envelope::PeerList(_) => "PeerList",
            Envelope::RequestAllCanvasData(_) => "RequestAllCanvasData",
            Envelope::PlayerLeft(_) => "PlayerLeft",
        }
    }
}

/// Full description of a participant, sent when a connection opens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub id: PeerId,
    pub username: String,
    pub position: Vec3,
    pub rotation: f32,
    pub color: u32,
}

impl From<&AvatarState> for PlayerInfo {
    fn from(avatar: &AvatarState) -> Self {
        Self {
            id: avatar.peer_id.clone(),
            username: avatar.display_name.clone(),
            position: avatar.position,
            rotation: avatar.heading,
            color: avatar.color,
        }
    }
}

impl From<PlayerInfo> for AvatarState {
    fn from(info: PlayerInfo) -> Self {
        Self {
            peer_id: info.id,
            display_name: info.username,
            position: info.position,
            heading: info.rotation,
            color: info.color,
        }
    }
}

/// Pose update of the sending peer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlayerMove {
    pub position: Vec3,
    pub rotation: f32,
}

/// New content for one canvas
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasUpdate {
    pub canvas_id: CanvasId,
    #[serde(with = "base64_bytes")]
    pub image_data: Vec<u8>,
    pub updated_at_millis: u64,
}

impl From<&CanvasState> for CanvasUpdate {
    fn from(state: &CanvasState) -> Self {
        Self {
            canvas_id: state.canvas_id.clone(),
            image_data: state.image.clone(),
            updated_at_millis: state.updated_at_millis,
        }
    }
}

impl From<CanvasUpdate> for CanvasState {
    fn from(update: CanvasUpdate) -> Self {
        Self {
            canvas_id: update.canvas_id,
            image: update.image_data,
            updated_at_millis: update.updated_at_millis,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPeerList {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerList {
    pub peers: Vec<PeerId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestAllCanvasData {
    pub requester_id: PeerId,
}

/// Sent by a peer right before it leaves the mesh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerLeft {
    pub id: PeerId,
}

/// Image payloads are opaque bytes carried as a base64 string.
pub mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn player_move_wire_shape() {
        let envelope = Envelope::PlayerMove(PlayerMove {
            position: Vec3::new(1.0, 0.0, 1.0),
            rotation: 0.5,
        });

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "PlayerMove",
                "data": { "position": { "x": 1.0, "y": 0.0, "z": 1.0 }, "rotation": 0.5 }
            })
        );
    }

    #[test]
    fn canvas_update_carries_base64_image() {
        let envelope = Envelope::CanvasUpdate(CanvasUpdate {
            canvas_id: CanvasId::new("north-0"),
            image_data: b"png".to_vec(),
            updated_at_millis: 1000,
        });

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "CanvasUpdate");
        assert_eq!(value["data"]["canvasId"], "north-0");
        assert_eq!(value["data"]["imageData"], "cG5n");
        assert_eq!(value["data"]["updatedAtMillis"], 1000);
    }

    #[test]
    fn canvas_data_is_accepted_as_an_alias() {
        let raw = json!({
            "type": "CanvasData",
            "data": { "canvasId": "east-2", "imageData": "cG5n", "updatedAtMillis": 7 }
        });

        let envelope: Envelope = serde_json::from_value(raw).unwrap();
        match envelope {
            Envelope::CanvasUpdate(update) => {
                assert_eq!(update.canvas_id, CanvasId::new("east-2"));
                assert_eq!(update.image_data, b"png".to_vec());
                assert_eq!(update.updated_at_millis, 7);
            }
            other => panic!("Expected CanvasUpdate, got {:?}", other),
        }
    }

    #[test]
    fn request_peer_list_has_empty_data() {
        let value = serde_json::to_value(Envelope::RequestPeerList(RequestPeerList {})).unwrap();
        assert_eq!(value, json!({ "type": "RequestPeerList", "data": {} }));
    }

    #[test]
    fn request_all_canvas_data_names_the_requester() {
        let raw = json!({ "type": "RequestAllCanvasData", "data": { "requesterId": "p1-abc" } });
        let envelope: Envelope = serde_json::from_value(raw).unwrap();
        assert_eq!(
            envelope,
            Envelope::RequestAllCanvasData(RequestAllCanvasData {
                requester_id: PeerId::new("p1-abc")
            })
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        let raw = json!({ "type": "Teleport", "data": {} });
        assert!(serde_json::from_value::<Envelope>(raw).is_err());
    }

    #[test]
    fn player_info_converts_to_avatar() {
        let info = PlayerInfo {
            id: PeerId::new("p1"),
            username: "Ada".to_string(),
            position: Vec3::new(2.0, 0.0, -1.0),
            rotation: 1.25,
            color: 0x4363d8,
        };

        let avatar = AvatarState::from(info.clone());
        assert_eq!(avatar.display_name, "Ada");
        assert_eq!(avatar.heading, 1.25);
        assert_eq!(PlayerInfo::from(&avatar), info);
    }
}
