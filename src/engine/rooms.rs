//! Per-session room logic: join/leave, invitations, chat, and the party
//! sync protocol. Every operation re-checks membership against the
//! directory — the session trusts no client-provided state — and all
//! room traffic flows through the broker so it reaches members on every
//! server instance.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{Broker, channels};
use crate::directory::{Directory, DirectoryError, Role, VacateOutcome};

use super::events::{PlaybackSnapshot, RoomEvent, RoomEventKind, Viewer};
use super::notifications::Notifier;
use super::party::{RoomStateStore, next_sync_timestamp};
use super::presence::PresenceManager;
use super::session::{Session, spawn_channel_forward};

const DIRECTORY_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound a directory call and flatten its error into a client-facing
/// message.
async fn dir<T>(fut: impl Future<Output = Result<T, DirectoryError>>) -> Result<T, String> {
    match tokio::time::timeout(DIRECTORY_TIMEOUT, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("directory request timed out".to_string()),
    }
}

fn required(data: Option<Value>) -> Result<Value, String> {
    data.ok_or_else(|| "Invalid message data".to_string())
}

fn field_i64(data: &Value, key: &str, err: &str) -> Result<i64, String> {
    data.get(key).and_then(Value::as_i64).ok_or_else(|| err.to_string())
}

fn field_str<'a>(data: &'a Value, key: &str, err: &str) -> Result<&'a str, String> {
    data.get(key).and_then(Value::as_str).ok_or_else(|| err.to_string())
}

fn field_bool(data: &Value, key: &str, err: &str) -> Result<bool, String> {
    data.get(key).and_then(Value::as_bool).ok_or_else(|| err.to_string())
}

/// Room logic for one session. Holds at most one current room; tears its
/// subscription down on leave or session end.
pub struct RoomCoordinator {
    session: Arc<Session>,
    directory: Arc<dyn Directory>,
    broker: Broker,
    presence: Arc<PresenceManager>,
    notifier: Notifier,
    store: RoomStateStore,
    current_room: Option<i64>,
    room_sub: Option<CancellationToken>,
}

impl RoomCoordinator {
    pub fn new(
        session: Arc<Session>,
        directory: Arc<dyn Directory>,
        broker: Broker,
        presence: Arc<PresenceManager>,
        notifier: Notifier,
    ) -> Self {
        let store = RoomStateStore::new(broker.clone());
        Self {
            session,
            directory,
            broker,
            presence,
            notifier,
            store,
            current_room: None,
            room_sub: None,
        }
    }

    pub fn current_room(&self) -> Option<i64> {
        self.current_room
    }

    /// Subscribe this session to its personal invitation channel. Lives
    /// for the session's lifetime.
    pub fn subscribe_invitations(&self) {
        spawn_channel_forward(
            self.broker.clone(),
            channels::user_room_invitations(self.session.user_id),
            self.session.clone(),
            self.session.cancel_token().child_token(),
        );
    }

    // ── Join / leave ────────────────────────────────────────────

    pub async fn handle_join(&mut self, data: Option<Value>) -> Result<Value, String> {
        let data = required(data)?;
        let room_id = field_i64(&data, "room_id", "invalid room ID")?;
        let user_id = self.session.user_id;
        let username = self.session.username.clone();

        let role = dir(self.directory.is_member(room_id, user_id))
            .await?
            .ok_or_else(|| "you are not a member of this room".to_string())?;

        if self.current_room != Some(room_id) {
            if self.current_room.is_some()
                && let Err(e) = self.do_leave().await
            {
                warn!(user_id, error = %e, "failed to leave previous room");
            }

            // Subscribe before announcing so this session sees its own
            // join event.
            let cancel = self.session.cancel_token().child_token();
            spawn_channel_forward(
                self.broker.clone(),
                channels::room_events(room_id),
                self.session.clone(),
                cancel.clone(),
            );
            self.room_sub = Some(cancel);
            self.current_room = Some(room_id);
        }

        let event = RoomEvent::new(RoomEventKind::UserJoined, user_id, &username).with_data(json!({
            "user_id": user_id,
            "username": &username,
            "message": format!("{username} has joined the room"),
        }));
        self.publish_room(room_id, &event).await?;

        self.presence
            .set_watching(user_id, &format!("Room {room_id}"), json!({ "room_id": room_id }))
            .await;

        let members = dir(self.directory.members_of(room_id)).await?;
        let event = RoomEvent::new(RoomEventKind::MemberListUpdate, user_id, &username)
            .with_data(json!({ "members": members }));
        self.publish_room(room_id, &event).await?;

        self.store
            .add_viewer(
                room_id,
                &Viewer {
                    user_id,
                    username: username.clone(),
                    avatar_url: None,
                },
            )
            .await;

        info!(user_id, room_id, role = role.as_str(), "joined room");

        let mut reply = json!({ "room_id": room_id, "role": role.as_str() });
        if let Some(snapshot) = self.store.get_playback(room_id).await
            && let Ok(value) = serde_json::to_value(&snapshot)
        {
            reply["playback"] = value;
        }
        Ok(reply)
    }

    pub async fn handle_leave(&mut self) -> Result<(), String> {
        self.do_leave().await
    }

    /// Session teardown. Runs the same vacate path as an explicit leave
    /// but never surfaces errors — there is no client left to tell.
    pub async fn cleanup(&mut self) {
        if let Err(e) = self.do_leave().await {
            warn!(user_id = self.session.user_id, error = %e, "room cleanup failed");
        }
    }

    async fn do_leave(&mut self) -> Result<(), String> {
        let Some(room_id) = self.current_room.take() else {
            return Ok(());
        };
        if let Some(cancel) = self.room_sub.take() {
            cancel.cancel();
        }

        let user_id = self.session.user_id;
        let username = self.session.username.clone();

        let outcome = dir(self.directory.vacate_room(room_id, user_id)).await;

        let mut publish_result = Ok(());
        match &outcome {
            Ok(VacateOutcome::NotAMember) => {
                debug!(user_id, room_id, "leaver was no longer a member");
            }
            Ok(VacateOutcome::Left) => {
                let event = RoomEvent::new(RoomEventKind::UserLeft, user_id, &username)
                    .with_data(json!({
                        "user_id": user_id,
                        "username": &username,
                        "message": format!("{username} has left the room"),
                    }));
                publish_result = self.publish_room(room_id, &event).await;
            }
            Ok(VacateOutcome::OwnershipTransferred {
                previous_owner,
                new_owner,
                new_owner_name,
            }) => {
                let left = RoomEvent::new(RoomEventKind::UserLeft, user_id, &username)
                    .with_data(json!({
                        "user_id": user_id,
                        "username": &username,
                        "message": format!("{username} has left the room"),
                    }));
                publish_result = self.publish_room(room_id, &left).await;

                let transfer = RoomEvent::new(RoomEventKind::OwnershipTransfer, user_id, &username)
                    .with_data(json!({
                        "previous_owner_id": previous_owner,
                        "new_owner_id": new_owner,
                        "new_owner_name": new_owner_name,
                        "message": format!("{new_owner_name} is now the room owner"),
                    }));
                let transfer_result = self.publish_room(room_id, &transfer).await;
                if publish_result.is_ok() {
                    publish_result = transfer_result;
                }

                info!(room_id, previous_owner, new_owner, "room ownership transferred");
            }
            Ok(VacateOutcome::RoomDeleted) => {
                self.store.clear_playback(room_id).await;
                info!(room_id, user_id, "owner left empty room, room deleted");
            }
            Err(e) => {
                warn!(user_id, room_id, error = %e, "vacate failed");
            }
        }

        self.store.remove_viewer(room_id, user_id).await;
        self.presence.stop_watching(user_id).await;

        outcome.map(|_| ()).and(publish_result)
    }

    /// Forget the current room without publishing — used when a
    /// membership re-check reveals this session was revoked out-of-band.
    fn abandon_room(&mut self) {
        self.current_room = None;
        if let Some(cancel) = self.room_sub.take() {
            cancel.cancel();
        }
    }

    // ── Invitations ─────────────────────────────────────────────

    pub async fn handle_invite(&mut self, data: Option<Value>) -> Result<Value, String> {
        let data = required(data)?;
        let room_id = field_i64(&data, "room_id", "invalid room ID")?;
        let invitee_name = field_str(&data, "username", "invalid username")?.to_string();
        let user_id = self.session.user_id;

        let role = dir(self.directory.is_member(room_id, user_id))
            .await?
            .ok_or_else(|| "you are not a member of this room".to_string())?;
        if !role.can_invite() {
            return Err("you don't have permission to invite users to this room".to_string());
        }

        let invitee_id = dir(self.directory.resolve_username(&invitee_name))
            .await?
            .ok_or_else(|| "user not found".to_string())?;

        let invitation_id = dir(self.directory.create_invitation(room_id, user_id, invitee_id)).await?;

        let room_name = dir(self.directory.get_room(room_id))
            .await?
            .map(|r| r.name)
            .unwrap_or_else(|| "Unknown Room".to_string());

        let event = RoomEvent::new(RoomEventKind::RoomInvitation, user_id, &self.session.username)
            .with_data(json!({
                "invitation_id": invitation_id,
                "inviter_id": user_id,
                "inviter_name": &self.session.username,
                "room_id": room_id,
                "room_name": room_name,
                "target_user": invitee_id,
            }));
        self.broker
            .publish_json(&channels::user_room_invitations(invitee_id), &event)
            .await
            .map_err(|e| e.to_string())?;

        info!(user_id, room_id, invitee_id, "invitation sent");

        Ok(json!({
            "invitation_id": invitation_id,
            "invitee": invitee_name,
            "room_id": room_id,
        }))
    }

    pub async fn handle_respond(
        &mut self,
        data: Option<Value>,
    ) -> Result<(String, Option<Value>), String> {
        let data = required(data)?;
        let invitation_id = field_i64(&data, "invitation_id", "invalid invitation ID")?;
        let accept = field_bool(&data, "accept", "invalid accept value")?;
        let user_id = self.session.user_id;
        let username = self.session.username.clone();

        let invitation =
            dir(self.directory.respond_to_invitation(invitation_id, user_id, accept)).await?;

        let room_name = dir(self.directory.get_room(invitation.room_id))
            .await?
            .map(|r| r.name)
            .unwrap_or_else(|| "Unknown Room".to_string());

        if accept {
            let members = dir(self.directory.members_of(invitation.room_id)).await?;
            let event = RoomEvent::new(RoomEventKind::MemberListUpdate, user_id, &username)
                .with_data(json!({
                    "members": members,
                    "new_member": user_id,
                    "member_name": &username,
                    "action": "member_added",
                }));
            self.publish_room(invitation.room_id, &event).await?;

            let event = RoomEvent::new(RoomEventKind::UserJoined, user_id, &username)
                .with_data(json!({
                    "user_id": user_id,
                    "username": &username,
                    "message": format!("{username} joined the room"),
                    "via": "invitation",
                }));
            self.publish_room(invitation.room_id, &event).await?;
        }

        self.notifier
            .invitation_response(
                invitation.inviter_id,
                user_id,
                &username,
                invitation.room_id,
                &room_name,
                accept,
            )
            .await;

        info!(
            user_id,
            invitation_id,
            accepted = accept,
            "invitation response processed"
        );

        let message = if accept {
            "Invitation accepted successfully"
        } else {
            "Invitation declined"
        };
        Ok((
            message.to_string(),
            Some(json!({ "invitation_id": invitation_id })),
        ))
    }

    // ── Chat ────────────────────────────────────────────────────

    pub async fn handle_chat(&mut self, data: Option<Value>) -> Result<(), String> {
        let data = required(data)?;
        let room_id = self.current_room.ok_or_else(|| "not in any room".to_string())?;
        let user_id = self.session.user_id;

        // Stale sessions discover membership revocation here.
        if dir(self.directory.is_member(room_id, user_id)).await?.is_none() {
            self.abandon_room();
            return Err("you are no longer a member of this room".to_string());
        }

        let event = RoomEvent::new(RoomEventKind::ChatMessage, user_id, &self.session.username)
            .with_data(data);
        self.publish_room(room_id, &event).await
    }

    // ── Party protocol ──────────────────────────────────────────

    pub async fn handle_party_movie_selected(&mut self, data: Option<Value>) -> Result<(), String> {
        let data = required(data)?;
        let (room_id, role) = self.room_role().await?;
        if role != Role::Owner {
            return Err("only room owner can select the movie".to_string());
        }

        let event = RoomEvent::new(
            RoomEventKind::PartyMovieSelected,
            self.session.user_id,
            &self.session.username,
        )
        .with_data(data.clone());
        self.publish_room(room_id, &event).await?;

        if let Some(url) = data.get("media_url").and_then(Value::as_str) {
            self.store
                .update_playback(&PlaybackSnapshot {
                    room_id,
                    media_url: url.to_string(),
                    position: 0.0,
                    is_playing: false,
                    playback_rate: 1.0,
                    updated_by: self.session.user_id,
                    updated_at: Utc::now(),
                })
                .await;
        }
        Ok(())
    }

    pub async fn handle_party_start(&mut self, data: Option<Value>) -> Result<(), String> {
        let data = required(data)?;
        let (room_id, role) = self.room_role().await?;
        if role != Role::Owner {
            return Err("only room owner can start the party".to_string());
        }

        let event = RoomEvent::new(
            RoomEventKind::PartyStart,
            self.session.user_id,
            &self.session.username,
        )
        .with_data(data.clone());
        self.publish_room(room_id, &event).await?;

        let mut snapshot = self
            .store
            .get_playback(room_id)
            .await
            .unwrap_or(PlaybackSnapshot {
                room_id,
                media_url: String::new(),
                position: 0.0,
                is_playing: false,
                playback_rate: 1.0,
                updated_by: self.session.user_id,
                updated_at: Utc::now(),
            });
        if let Some(position) = data.get("position").and_then(Value::as_f64) {
            snapshot.position = position;
        }
        snapshot.is_playing = true;
        snapshot.updated_by = self.session.user_id;
        snapshot.updated_at = Utc::now();
        self.store.update_playback(&snapshot).await;
        Ok(())
    }

    pub async fn handle_party_movie_cleared(&mut self, data: Option<Value>) -> Result<(), String> {
        let data = required(data)?;
        let (room_id, role) = self.room_role().await?;
        if role != Role::Owner {
            return Err("only room owner can clear the movie".to_string());
        }

        let event = RoomEvent::new(
            RoomEventKind::PartyMovieCleared,
            self.session.user_id,
            &self.session.username,
        )
        .with_data(data);
        self.publish_room(room_id, &event).await?;

        self.store.clear_playback(room_id).await;
        Ok(())
    }

    pub async fn handle_party_source_status(&mut self, data: Option<Value>) -> Result<(), String> {
        let data = required(data)?;
        let (room_id, _) = self.room_role().await?;
        let event = RoomEvent::new(
            RoomEventKind::PartySourceStatus,
            self.session.user_id,
            &self.session.username,
        )
        .with_data(data);
        self.publish_room(room_id, &event).await
    }

    pub async fn handle_party_sync_data(&mut self, data: Option<Value>) -> Result<(), String> {
        let mut data = required(data)?;
        if !data.is_object() {
            return Err("invalid sync data".to_string());
        }
        let (room_id, _) = self.room_role().await?;

        // Clients apply sync events in stamp order and discard stale ones.
        data["server_timestamp"] = json!(next_sync_timestamp());

        let event = RoomEvent::new(
            RoomEventKind::PartySyncData,
            self.session.user_id,
            &self.session.username,
        )
        .with_data(data.clone());
        self.publish_room(room_id, &event).await?;

        let kind = data
            .get("event_type")
            .or_else(|| data.get("eventType"))
            .and_then(Value::as_str);
        if matches!(kind, Some("play" | "pause" | "seek"))
            && let Some(mut snapshot) = self.store.get_playback(room_id).await
        {
            if let Some(position) = data.get("position").and_then(Value::as_f64) {
                snapshot.position = position;
            }
            match kind {
                Some("play") => snapshot.is_playing = true,
                Some("pause") => snapshot.is_playing = false,
                _ => {}
            }
            snapshot.updated_by = self.session.user_id;
            snapshot.updated_at = Utc::now();
            self.store.update_playback(&snapshot).await;
        }
        Ok(())
    }

    pub async fn handle_manual_sync_request(&mut self, data: Option<Value>) -> Result<(), String> {
        let data = required(data)?;
        let (room_id, _) = self.room_role().await?;
        let event = RoomEvent::new(
            RoomEventKind::ManualSyncRequest,
            self.session.user_id,
            &self.session.username,
        )
        .with_data(data);
        self.publish_room(room_id, &event).await
    }

    pub async fn handle_sync_status_update(&mut self, data: Option<Value>) -> Result<(), String> {
        let data = required(data)?;
        let (room_id, _) = self.room_role().await?;
        let event = RoomEvent::new(
            RoomEventKind::SyncStatusUpdate,
            self.session.user_id,
            &self.session.username,
        )
        .with_data(data);
        self.publish_room(room_id, &event).await
    }

    // ── Internals ───────────────────────────────────────────────

    /// Resolve the current room and the caller's live role in it,
    /// abandoning the room when membership has been revoked.
    async fn room_role(&mut self) -> Result<(i64, Role), String> {
        let room_id = self.current_room.ok_or_else(|| "not in any room".to_string())?;
        match dir(self.directory.is_member(room_id, self.session.user_id)).await? {
            Some(role) => Ok((room_id, role)),
            None => {
                self.abandon_room();
                Err("you are no longer a member of this room".to_string())
            }
        }
    }

    async fn publish_room(&self, room_id: i64, event: &RoomEvent) -> Result<(), String> {
        self.broker
            .publish_json(&channels::room_events(room_id), event)
            .await
            .map_err(|e| e.to_string())
    }
}
