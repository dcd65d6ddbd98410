//! Postgres implementation of the [`Directory`] seam. All queries are
//! parametric; the vacate and invitation-response flows run inside
//! transactions with rollback on any error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

use crate::directory::{
    Directory, DirectoryError, FriendStatusInfo, Invitation, InvitationStatus, Role, Room,
    RoomMember, RoomStatus, VacateOutcome,
};

pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct MemberRow {
    user_id: i64,
    role: String,
    joined_at: DateTime<Utc>,
    username: String,
    display_name: String,
    avatar_url: Option<String>,
}

#[derive(FromRow)]
struct InvitationRow {
    id: i64,
    room_id: i64,
    inviter_id: i64,
    invitee_id: i64,
    status: String,
    created_at: DateTime<Utc>,
    responded_at: Option<DateTime<Utc>>,
}

impl InvitationRow {
    fn into_invitation(self) -> Invitation {
        let status = match self.status.as_str() {
            "accepted" => InvitationStatus::Accepted,
            "declined" => InvitationStatus::Declined,
            _ => InvitationStatus::Pending,
        };
        Invitation {
            id: self.id,
            room_id: self.room_id,
            inviter_id: self.inviter_id,
            invitee_id: self.invitee_id,
            status,
            created_at: self.created_at,
            responded_at: self.responded_at,
        }
    }
}

#[derive(FromRow)]
struct RoomRow {
    id: i64,
    name: String,
    owner_id: i64,
    is_private: bool,
    status: String,
}

impl RoomRow {
    fn into_room(self) -> Room {
        let status = match self.status.as_str() {
            "active" => RoomStatus::Active,
            "deleted" => RoomStatus::Deleted,
            _ => RoomStatus::Inactive,
        };
        Room {
            id: self.id,
            name: self.name,
            owner_id: self.owner_id,
            is_private: self.is_private,
            status,
        }
    }
}

#[async_trait]
impl Directory for PgDirectory {
    async fn is_member(
        &self,
        room_id: i64,
        user_id: i64,
    ) -> Result<Option<Role>, DirectoryError> {
        let role: Option<String> = sqlx::query_scalar(
            "SELECT m.role FROM room_members m \
             JOIN watch_rooms r ON r.id = m.room_id \
             WHERE m.room_id = $1 AND m.user_id = $2 AND r.status = 'active'",
        )
        .bind(room_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(role.map(|r| Role::parse(&r)))
    }

    async fn members_of(&self, room_id: i64) -> Result<Vec<RoomMember>, DirectoryError> {
        let rows: Vec<MemberRow> = sqlx::query_as(
            "SELECT m.user_id, m.role, m.joined_at, u.username, \
                    COALESCE(u.display_name, u.username) AS display_name, \
                    u.profile_picture_url AS avatar_url \
             FROM room_members m \
             JOIN users u ON u.id = m.user_id \
             WHERE m.room_id = $1 \
             ORDER BY CASE m.role WHEN 'owner' THEN 0 WHEN 'admin' THEN 1 ELSE 2 END, \
                      u.username",
        )
        .bind(room_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| RoomMember {
                user_id: r.user_id,
                role: Role::parse(&r.role),
                joined_at: r.joined_at,
                username: r.username,
                display_name: r.display_name,
                avatar_url: r.avatar_url,
            })
            .collect())
    }

    async fn add_member(
        &self,
        room_id: i64,
        user_id: i64,
        role: Role,
    ) -> Result<(), DirectoryError> {
        sqlx::query(
            "INSERT INTO room_members (room_id, user_id, role) VALUES ($1, $2, $3) \
             ON CONFLICT (room_id, user_id) DO NOTHING",
        )
        .bind(room_id)
        .bind(user_id)
        .bind(role.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_member(&self, room_id: i64, user_id: i64) -> Result<(), DirectoryError> {
        sqlx::query("DELETE FROM room_members WHERE room_id = $1 AND user_id = $2")
            .bind(room_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_member_role(
        &self,
        room_id: i64,
        user_id: i64,
        role: Role,
    ) -> Result<(), DirectoryError> {
        sqlx::query("UPDATE room_members SET role = $3 WHERE room_id = $1 AND user_id = $2")
            .bind(room_id)
            .bind(user_id)
            .bind(role.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_room_owner(&self, room_id: i64, user_id: i64) -> Result<(), DirectoryError> {
        sqlx::query("UPDATE watch_rooms SET owner_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(room_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_room(&self, room_id: i64) -> Result<Option<Room>, DirectoryError> {
        let row: Option<RoomRow> = sqlx::query_as(
            "SELECT id, name, owner_id, is_private, status FROM watch_rooms WHERE id = $1",
        )
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(RoomRow::into_room))
    }

    async fn create_invitation(
        &self,
        room_id: i64,
        inviter_id: i64,
        invitee_id: i64,
    ) -> Result<i64, DirectoryError> {
        let mut tx = self.pool.begin().await?;

        let pending_exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM room_invitations \
             WHERE room_id = $1 AND invitee_id = $2 AND status = 'pending')",
        )
        .bind(room_id)
        .bind(invitee_id)
        .fetch_one(&mut *tx)
        .await?;
        if pending_exists {
            return Err(DirectoryError::Conflict(
                "user already has a pending invitation to this room".into(),
            ));
        }

        let already_member: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM room_members WHERE room_id = $1 AND user_id = $2)",
        )
        .bind(room_id)
        .bind(invitee_id)
        .fetch_one(&mut *tx)
        .await?;
        if already_member {
            return Err(DirectoryError::Conflict(
                "user is already a member of this room".into(),
            ));
        }

        let invitation_id: i64 = sqlx::query_scalar(
            "INSERT INTO room_invitations (room_id, inviter_id, invitee_id, status) \
             VALUES ($1, $2, $3, 'pending') RETURNING id",
        )
        .bind(room_id)
        .bind(inviter_id)
        .bind(invitee_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(invitation_id)
    }

    async fn respond_to_invitation(
        &self,
        invitation_id: i64,
        user_id: i64,
        accept: bool,
    ) -> Result<Invitation, DirectoryError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<InvitationRow> = sqlx::query_as(
            "SELECT id, room_id, inviter_id, invitee_id, status, created_at, responded_at \
             FROM room_invitations \
             WHERE id = $1 AND invitee_id = $2 AND status = 'pending' \
             FOR UPDATE",
        )
        .bind(invitation_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Err(DirectoryError::NotFound(
                "invitation not found or already processed".into(),
            ));
        };

        let new_status = if accept { "accepted" } else { "declined" };
        let updated: InvitationRow = sqlx::query_as(
            "UPDATE room_invitations SET status = $2, responded_at = NOW() WHERE id = $1 \
             RETURNING id, room_id, inviter_id, invitee_id, status, created_at, responded_at",
        )
        .bind(invitation_id)
        .bind(new_status)
        .fetch_one(&mut *tx)
        .await?;

        if accept {
            sqlx::query(
                "INSERT INTO room_members (room_id, user_id, role) VALUES ($1, $2, 'member') \
                 ON CONFLICT (room_id, user_id) DO NOTHING",
            )
            .bind(row.room_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(updated.into_invitation())
    }

    async fn get_invitation(
        &self,
        invitation_id: i64,
    ) -> Result<Option<Invitation>, DirectoryError> {
        let row: Option<InvitationRow> = sqlx::query_as(
            "SELECT id, room_id, inviter_id, invitee_id, status, created_at, responded_at \
             FROM room_invitations WHERE id = $1",
        )
        .bind(invitation_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(InvitationRow::into_invitation))
    }

    async fn cleanup_user_invitations(
        &self,
        room_id: i64,
        user_id: i64,
    ) -> Result<(), DirectoryError> {
        sqlx::query(
            "DELETE FROM room_invitations \
             WHERE room_id = $1 AND inviter_id = $2 AND status = 'pending'",
        )
        .bind(room_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn resolve_username(&self, username: &str) -> Result<Option<i64>, DirectoryError> {
        let id: Option<i64> = sqlx::query_scalar("SELECT id FROM users WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    async fn get_friends(&self, user_id: i64) -> Result<Vec<i64>, DirectoryError> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT CASE WHEN user_id = $1 THEN friend_id ELSE user_id END \
             FROM friendships \
             WHERE (user_id = $1 OR friend_id = $1) AND status = 'accepted'",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn get_friends_with_status(
        &self,
        user_id: i64,
    ) -> Result<Vec<FriendStatusInfo>, DirectoryError> {
        let rows: Vec<(i64, String, String, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT u.id, u.username, u.status, u.activity, u.last_seen \
             FROM users u \
             JOIN friendships f \
               ON (f.user_id = $1 AND f.friend_id = u.id) \
               OR (f.friend_id = $1 AND f.user_id = u.id) \
             WHERE f.status = 'accepted'",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(user_id, username, status, activity, last_seen)| FriendStatusInfo {
                user_id,
                username,
                status,
                activity,
                last_seen,
            })
            .collect())
    }

    async fn update_user_status(
        &self,
        user_id: i64,
        status: &str,
        activity: &str,
    ) -> Result<(), DirectoryError> {
        sqlx::query(
            "UPDATE users SET status = $2, activity = $3, last_seen = NOW() WHERE id = $1",
        )
        .bind(user_id)
        .bind(status)
        .bind(activity)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn vacate_room(
        &self,
        room_id: i64,
        user_id: i64,
    ) -> Result<VacateOutcome, DirectoryError> {
        let mut tx = self.pool.begin().await?;

        let role: Option<String> = sqlx::query_scalar(
            "SELECT role FROM room_members WHERE room_id = $1 AND user_id = $2 FOR UPDATE",
        )
        .bind(room_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(role) = role else {
            return Ok(VacateOutcome::NotAMember);
        };

        if Role::parse(&role) != Role::Owner {
            sqlx::query("DELETE FROM room_members WHERE room_id = $1 AND user_id = $2")
                .bind(room_id)
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "DELETE FROM room_invitations \
                 WHERE room_id = $1 AND inviter_id = $2 AND status = 'pending'",
            )
            .bind(room_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(VacateOutcome::Left);
        }

        // Owner leaving. Lock the remaining members and pick the successor:
        // earliest joined_at, ties broken by lowest user id.
        let successor: Option<(i64, String)> = sqlx::query_as(
            "SELECT m.user_id, u.username \
             FROM room_members m JOIN users u ON u.id = m.user_id \
             WHERE m.room_id = $1 AND m.user_id <> $2 \
             ORDER BY m.joined_at ASC, m.user_id ASC \
             LIMIT 1 \
             FOR UPDATE OF m",
        )
        .bind(room_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        match successor {
            Some((new_owner, new_owner_name)) => {
                sqlx::query("DELETE FROM room_members WHERE room_id = $1 AND user_id = $2")
                    .bind(room_id)
                    .bind(user_id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query(
                    "UPDATE room_members SET role = 'owner' WHERE room_id = $1 AND user_id = $2",
                )
                .bind(room_id)
                .bind(new_owner)
                .execute(&mut *tx)
                .await?;
                sqlx::query(
                    "UPDATE watch_rooms SET owner_id = $2, updated_at = NOW() WHERE id = $1",
                )
                .bind(room_id)
                .bind(new_owner)
                .execute(&mut *tx)
                .await?;
                sqlx::query(
                    "DELETE FROM room_invitations \
                     WHERE room_id = $1 AND inviter_id = $2 AND status = 'pending'",
                )
                .bind(room_id)
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;

                Ok(VacateOutcome::OwnershipTransferred {
                    previous_owner: user_id,
                    new_owner,
                    new_owner_name,
                })
            }
            None => {
                sqlx::query(
                    "UPDATE watch_rooms SET status = 'deleted', updated_at = NOW() WHERE id = $1",
                )
                .bind(room_id)
                .execute(&mut *tx)
                .await?;
                sqlx::query("DELETE FROM room_members WHERE room_id = $1 AND user_id = $2")
                    .bind(room_id)
                    .bind(user_id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query(
                    "DELETE FROM room_invitations WHERE room_id = $1 AND status = 'pending'",
                )
                .bind(room_id)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;

                Ok(VacateOutcome::RoomDeleted)
            }
        }
    }
}
