//! The directory seam: membership, role, invitation, friendship, and
//! status queries against durable storage. The realtime core depends on
//! this trait only; `db::PgDirectory` is the production implementation and
//! tests use [`testing::MemDirectory`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Denied(String),
    #[error("{0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Room-level roles ordered by privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Member,
    Admin,
    Owner,
}

impl Role {
    pub fn parse(s: &str) -> Self {
        match s {
            "owner" => Self::Owner,
            "admin" => Self::Admin,
            _ => Self::Member,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Admin => "admin",
            Self::Member => "member",
        }
    }

    pub fn can_invite(&self) -> bool {
        matches!(self, Self::Owner | Self::Admin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Active,
    Inactive,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: i64,
    pub name: String,
    pub owner_id: i64,
    pub is_private: bool,
    pub status: RoomStatus,
}

/// One row of the authoritative member list, as rendered by clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomMember {
    pub user_id: i64,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    pub username: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Declined,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invitation {
    pub id: i64,
    pub room_id: i64,
    pub inviter_id: i64,
    pub invitee_id: i64,
    pub status: InvitationStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
}

/// A friend's last known status, used to seed the initial presence
/// snapshot for a newly connected client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendStatusInfo {
    pub user_id: i64,
    pub username: String,
    pub status: String,
    pub activity: String,
    pub last_seen: DateTime<Utc>,
}

/// Result of the room-vacate transaction run when a user's session ends
/// or they leave explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VacateOutcome {
    /// The user was not a member; nothing changed.
    NotAMember,
    /// A non-owner left an active room.
    Left,
    /// The owner left and ownership moved to the earliest-joined
    /// remaining member (ties broken by lowest user id).
    OwnershipTransferred {
        previous_owner: i64,
        new_owner: i64,
        new_owner_name: String,
    },
    /// The owner left an empty room; the room was marked deleted.
    RoomDeleted,
}

#[async_trait]
pub trait Directory: Send + Sync {
    /// Membership check. Returns the member's role, or `None` if the user
    /// is not a member of an active room.
    async fn is_member(&self, room_id: i64, user_id: i64)
    -> Result<Option<Role>, DirectoryError>;

    /// The authoritative member list for a room.
    async fn members_of(&self, room_id: i64) -> Result<Vec<RoomMember>, DirectoryError>;

    async fn add_member(
        &self,
        room_id: i64,
        user_id: i64,
        role: Role,
    ) -> Result<(), DirectoryError>;

    async fn remove_member(&self, room_id: i64, user_id: i64) -> Result<(), DirectoryError>;

    async fn update_member_role(
        &self,
        room_id: i64,
        user_id: i64,
        role: Role,
    ) -> Result<(), DirectoryError>;

    async fn update_room_owner(&self, room_id: i64, user_id: i64) -> Result<(), DirectoryError>;

    async fn get_room(&self, room_id: i64) -> Result<Option<Room>, DirectoryError>;

    /// Create a pending invitation. Rejects when the invitee already has a
    /// pending invitation for the room or is already a member.
    async fn create_invitation(
        &self,
        room_id: i64,
        inviter_id: i64,
        invitee_id: i64,
    ) -> Result<i64, DirectoryError>;

    /// Respond to an invitation inside one transaction: assert the caller
    /// is the invitee and the invitation is pending, stamp the response,
    /// and on acceptance upsert membership with role `member`.
    async fn respond_to_invitation(
        &self,
        invitation_id: i64,
        user_id: i64,
        accept: bool,
    ) -> Result<Invitation, DirectoryError>;

    async fn get_invitation(
        &self,
        invitation_id: i64,
    ) -> Result<Option<Invitation>, DirectoryError>;

    /// Cancel the pending invitations `user_id` has sent for `room_id`.
    async fn cleanup_user_invitations(
        &self,
        room_id: i64,
        user_id: i64,
    ) -> Result<(), DirectoryError>;

    async fn resolve_username(&self, username: &str) -> Result<Option<i64>, DirectoryError>;

    async fn get_friends(&self, user_id: i64) -> Result<Vec<i64>, DirectoryError>;

    async fn get_friends_with_status(
        &self,
        user_id: i64,
    ) -> Result<Vec<FriendStatusInfo>, DirectoryError>;

    /// Best-effort persistence of a user's derived status.
    async fn update_user_status(
        &self,
        user_id: i64,
        status: &str,
        activity: &str,
    ) -> Result<(), DirectoryError>;

    /// Remove a user from a room atomically, transferring ownership or
    /// deleting the room as required. Invitation cleanup happens inside
    /// the same transaction: the leaver's pending invitations are
    /// cancelled on leave/transfer, and every pending invitation for the
    /// room is cancelled on deletion.
    async fn vacate_room(&self, room_id: i64, user_id: i64)
    -> Result<VacateOutcome, DirectoryError>;
}
