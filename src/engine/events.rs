//! Wire types for the realtime protocol: room events published on room
//! channels, notification events published on personal channels, the
//! inbound client envelope, and the control frames a session writes
//! directly to its socket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

/// Unique identifier for a connected session (one per connection, not per
/// user — the same user may hold several).
pub type SessionId = Uuid;

/// Current unix timestamp in seconds, the envelope timestamp unit.
pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

// ── Room events ─────────────────────────────────────────────────

/// Kinds of events that flow over `room:{id}:events` and the personal
/// invitation channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomEventKind {
    UserJoined,
    UserLeft,
    ChatMessage,
    PlaybackUpdate,
    MemberListUpdate,
    OwnershipTransfer,
    RoomInvitation,
    PartyMovieSelected,
    PartySourceStatus,
    PartyStart,
    PartyMovieCleared,
    PartySyncData,
    ManualSyncRequest,
    SyncStatusUpdate,
}

/// An event on a room channel. The sender identity is always stamped by
/// the server; client-supplied identity fields are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomEvent {
    #[serde(rename = "type")]
    pub kind: RoomEventKind,
    pub user_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RoomEvent {
    pub fn new(kind: RoomEventKind, user_id: i64, username: &str) -> Self {
        Self {
            kind,
            user_id,
            username: Some(username.to_string()),
            timestamp: now_ts(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

// ── Notification events ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    FriendRequestReceived,
    FriendRequestAccepted,
    FriendRequestRejected,
    RoomInvitation,
    InvitationAccepted,
    InvitationRejected,
    StatusUpdate,
}

/// An event on a personal `user:{id}:notifications` channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub notification_type: NotificationKind,
    pub user_id: i64,
    pub timestamp: i64,
    pub data: Value,
}

impl NotificationEvent {
    pub fn new(notification_type: NotificationKind, user_id: i64, data: Value) -> Self {
        Self {
            event_type: "notification".to_string(),
            notification_type,
            user_id,
            timestamp: now_ts(),
            data,
        }
    }
}

// ── Inbound envelope ────────────────────────────────────────────

/// Envelope for every inbound frame after the handshake.
#[derive(Debug, Deserialize)]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// The first frame on a new connection.
#[derive(Debug, Deserialize)]
pub struct AuthMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub token: String,
}

// ── Broker state records ────────────────────────────────────────

/// Snapshot of a room's playback state, stored under `room:{id}:playback`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackSnapshot {
    pub room_id: i64,
    pub media_url: String,
    pub position: f64,
    pub is_playing: bool,
    pub playback_rate: f64,
    pub updated_by: i64,
    pub updated_at: DateTime<Utc>,
}

/// Advisory viewer record stored in the `room:{id}:viewers` hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Viewer {
    pub user_id: i64,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

// ── Control frames ──────────────────────────────────────────────

pub fn auth_error_frame(message: &str) -> String {
    json!({ "type": "auth_error", "message": message }).to_string()
}

pub fn auth_success_frame() -> String {
    json!({ "type": "auth_success", "message": "Auth success" }).to_string()
}

pub fn connection_established_frame(user_id: i64) -> String {
    json!({
        "type": "connection_established",
        "user_id": user_id,
        "timestamp": now_ts(),
        "data": { "message": "WebSocket connection established" },
    })
    .to_string()
}

pub fn success_frame(message: &str, data: Option<Value>) -> String {
    let mut frame = json!({
        "type": "success",
        "message": message,
        "timestamp": now_ts(),
    });
    if let Some(data) = data {
        frame["data"] = data;
    }
    frame.to_string()
}

pub fn error_frame(message: &str) -> String {
    json!({
        "type": "error",
        "message": message,
        "timestamp": now_ts(),
    })
    .to_string()
}

pub fn pong_frame() -> String {
    json!({ "type": "pong", "timestamp": now_ts() }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_event_wire_shape() {
        let event = RoomEvent::new(RoomEventKind::ChatMessage, 7, "alice")
            .with_data(json!({ "message": "hi" }));
        let value: Value = serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();

        assert_eq!(value["type"], "chat_message");
        assert_eq!(value["user_id"], 7);
        assert_eq!(value["username"], "alice");
        assert_eq!(value["data"]["message"], "hi");
        assert!(value["timestamp"].is_i64());
    }

    #[test]
    fn test_room_event_kinds_are_snake_case() {
        let kinds = [
            (RoomEventKind::UserJoined, "user_joined"),
            (RoomEventKind::MemberListUpdate, "member_list_update"),
            (RoomEventKind::OwnershipTransfer, "ownership_transfer"),
            (RoomEventKind::PartyMovieSelected, "party_movie_selected"),
            (RoomEventKind::PartySyncData, "party_sync_data"),
            (RoomEventKind::ManualSyncRequest, "manual_sync_request"),
        ];
        for (kind, expected) in kinds {
            let s = serde_json::to_string(&kind).unwrap();
            assert_eq!(s, format!("\"{expected}\""));
        }
    }

    #[test]
    fn test_notification_envelope() {
        let event = NotificationEvent::new(
            NotificationKind::RoomInvitation,
            5,
            json!({ "room_id": 10 }),
        );
        let value: Value = serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();

        assert_eq!(value["type"], "notification");
        assert_eq!(value["notification_type"], "room_invitation");
        assert_eq!(value["user_id"], 5);
        assert_eq!(value["data"]["room_id"], 10);
    }

    #[test]
    fn test_client_message_parsing() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"join_room","data":{"room_id":3}}"#).unwrap();
        assert_eq!(msg.msg_type, "join_room");
        assert_eq!(msg.data.unwrap()["room_id"], 3);

        let bare: ClientMessage = serde_json::from_str(r#"{"type":"leave_room"}"#).unwrap();
        assert!(bare.data.is_none());
    }

    #[test]
    fn test_error_frame_shape() {
        let value: Value = serde_json::from_str(&error_frame("nope")).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["message"], "nope");
    }

    #[test]
    fn test_success_frame_with_data() {
        let value: Value =
            serde_json::from_str(&success_frame("ok", Some(json!({ "room_id": 1 })))).unwrap();
        assert_eq!(value["type"], "success");
        assert_eq!(value["data"]["room_id"], 1);

        let bare: Value = serde_json::from_str(&success_frame("ok", None)).unwrap();
        assert!(bare.get("data").is_none());
    }

    #[test]
    fn test_playback_snapshot_roundtrip() {
        let snapshot = PlaybackSnapshot {
            room_id: 3,
            media_url: "magnet:?xt=demo".into(),
            position: 120.5,
            is_playing: true,
            playback_rate: 1.0,
            updated_by: 7,
            updated_at: Utc::now(),
        };
        let parsed: PlaybackSnapshot =
            serde_json::from_str(&serde_json::to_string(&snapshot).unwrap()).unwrap();
        assert_eq!(parsed.room_id, 3);
        assert_eq!(parsed.position, 120.5);
        assert!(parsed.is_playing);
    }
}
