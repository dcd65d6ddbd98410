//! Canonical broker channel and key names. Every channel the core touches
//! is built here so the families stay greppable in one place.

use uuid::Uuid;

/// Pub/sub topic all live members of a room subscribe to.
pub fn room_events(room_id: i64) -> String {
    format!("room:{room_id}:events")
}

/// Personal channel carrying room invitations for a user.
pub fn user_room_invitations(user_id: i64) -> String {
    format!("user:{user_id}:room_invitations")
}

/// Personal channel carrying notifications and status updates for a user.
pub fn user_notifications(user_id: i64) -> String {
    format!("user:{user_id}:notifications")
}

/// Key holding the room's playback snapshot (TTL 24h).
pub fn playback_key(room_id: i64) -> String {
    format!("room:{room_id}:playback")
}

/// Hash of advisory viewer records for a room (TTL 1h).
pub fn viewers_key(room_id: i64) -> String {
    format!("room:{room_id}:viewers")
}

/// Field inside the viewers hash for one user.
pub fn viewer_field(user_id: i64) -> String {
    format!("user:{user_id}")
}

/// Hash tracking which server instances hold live connections for a user
/// (TTL 1h). One field per instance.
pub fn presence_key(user_id: i64) -> String {
    format!("user:{user_id}:presence")
}

/// Field inside the presence hash for one server instance.
pub fn instance_field(instance_id: Uuid) -> String {
    format!("instance:{instance_id}")
}
