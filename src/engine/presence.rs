//! Process-wide presence registry: live sessions per user, the derived
//! effective status, and status-delta broadcasts to friends. The maps sit
//! behind one read-write lock; broadcasts and directory writes happen
//! after the lock is released, on a copied snapshot.
//!
//! Cross-instance correctness rides on a shared broker hash per user
//! (`user:{id}:presence`, one field per server instance): the last
//! instance to lose a user's sessions only reports `offline` when no
//! other instance still holds a field.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::{Broker, channels};
use crate::directory::Directory;

use super::events::{NotificationEvent, NotificationKind, SessionId, now_ts};
use super::notifications::Notifier;
use super::session::Session;

const PRESENCE_REGISTRY_TTL: Duration = Duration::from_secs(60 * 60);

/// Derived status, recomputed on every presence mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectiveStatus {
    Online,
    Watching,
    Dnd,
    Offline,
}

impl EffectiveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Watching => "watching",
            Self::Dnd => "dnd",
            Self::Offline => "offline",
        }
    }
}

/// In-memory presence for one user on this process.
#[derive(Debug, Clone)]
pub struct UserPresence {
    pub user_id: i64,
    pub username: String,
    pub status: EffectiveStatus,
    pub activity: String,
    pub watching: bool,
    pub manual_dnd: bool,
    pub last_activity: DateTime<Utc>,
    pub connected_at: DateTime<Utc>,
    pub custom_data: Value,
}

/// Snapshot of a status change, captured under the lock and published
/// after it is released.
#[derive(Debug, Clone)]
struct StatusChange {
    user_id: i64,
    username: String,
    status: EffectiveStatus,
    activity: String,
    custom_data: Value,
}

#[derive(Default)]
struct PresenceState {
    users: HashMap<i64, UserPresence>,
    connections: HashMap<i64, HashMap<SessionId, Arc<Session>>>,
}

pub struct PresenceManager {
    instance_id: Uuid,
    state: RwLock<PresenceState>,
    directory: Arc<dyn Directory>,
    broker: Broker,
    notifier: Notifier,
}

impl PresenceManager {
    pub fn new(directory: Arc<dyn Directory>, broker: Broker) -> Self {
        let notifier = Notifier::new(broker.clone());
        Self {
            instance_id: Uuid::new_v4(),
            state: RwLock::new(PresenceState::default()),
            directory,
            broker,
            notifier,
        }
    }

    // ── Connection lifecycle ────────────────────────────────────

    /// Register a newly authenticated session. Broadcasts the status
    /// delta to friends and queues an initial friend-status snapshot onto
    /// the session.
    pub async fn attach(self: &Arc<Self>, session: Arc<Session>) {
        let user_id = session.user_id;
        let username = session.username.clone();

        let (change, local_sessions) = {
            let mut state = self.state.write().unwrap();
            state
                .connections
                .entry(user_id)
                .or_default()
                .insert(session.id, session.clone());
            let count = state.connections[&user_id].len();

            let now = Utc::now();
            let presence = state.users.entry(user_id).or_insert_with(|| UserPresence {
                user_id,
                username: username.clone(),
                status: EffectiveStatus::Offline,
                activity: String::new(),
                watching: false,
                manual_dnd: false,
                last_activity: now,
                connected_at: now,
                custom_data: json!({}),
            });
            presence.connected_at = now;
            presence.last_activity = now;

            (recompute_status(presence, false), count)
        };

        self.register_instance(user_id, local_sessions).await;

        if let Some(change) = change {
            self.publish_change(change).await;
        }

        self.spawn_initial_snapshot(user_id, session);
    }

    /// Remove a session. When the last session for the user on this
    /// process goes away, the user is reported offline — unless another
    /// instance still holds a connection for them.
    pub async fn detach(&self, user_id: i64, session_id: SessionId) {
        enum Outcome {
            NoPresence,
            Remaining(Option<StatusChange>, usize),
            LastSession(StatusChange),
        }

        let outcome = {
            let mut state = self.state.write().unwrap();

            let remaining = {
                let sessions = state.connections.entry(user_id).or_default();
                sessions.remove(&session_id);
                sessions.len()
            };
            if remaining == 0 {
                state.connections.remove(&user_id);
            }

            if remaining == 0 {
                match state.users.remove(&user_id) {
                    Some(presence) => Outcome::LastSession(StatusChange {
                        user_id,
                        username: presence.username,
                        status: EffectiveStatus::Offline,
                        activity: presence.activity,
                        custom_data: presence.custom_data,
                    }),
                    None => Outcome::NoPresence,
                }
            } else {
                match state.users.get_mut(&user_id) {
                    Some(presence) => {
                        Outcome::Remaining(recompute_status(presence, false), remaining)
                    }
                    None => Outcome::NoPresence,
                }
            }
        };

        match outcome {
            Outcome::NoPresence => {
                debug!(user_id, "no presence entry on detach");
            }
            Outcome::Remaining(change, remaining) => {
                self.register_instance(user_id, remaining).await;
                if let Some(change) = change {
                    self.publish_change(change).await;
                }
            }
            Outcome::LastSession(change) => {
                let elsewhere = self.deregister_instance(user_id).await;
                if elsewhere {
                    debug!(user_id, "still connected on another instance, skipping offline");
                } else {
                    self.publish_change(change).await;
                }
            }
        }
    }

    // ── Status mutation ─────────────────────────────────────────

    /// Apply a client-requested status. `online` clears a manual
    /// override; `dnd` sets it.
    pub async fn set_manual_status(&self, user_id: i64, status: &str) -> Result<(), String> {
        let manual_dnd = match status {
            "dnd" => true,
            "online" => false,
            _ => return Err(format!("invalid status: {status}")),
        };

        let change = self.mutate(user_id, |presence| {
            presence.manual_dnd = manual_dnd;
        });
        if let Some(change) = change {
            self.publish_change(change).await;
        }
        Ok(())
    }

    /// Mark the user as watching some content.
    pub async fn set_watching(&self, user_id: i64, content: &str, custom_data: Value) {
        let change = self.mutate(user_id, |presence| {
            presence.watching = true;
            presence.activity = format!("Watching {content}");
            presence.custom_data = custom_data;
        });
        if let Some(change) = change {
            self.publish_change(change).await;
        }
    }

    /// Clear the watching state, if set.
    pub async fn stop_watching(&self, user_id: i64) {
        let change = self.mutate(user_id, |presence| {
            if presence.watching {
                presence.watching = false;
                presence.activity.clear();
                presence.custom_data = json!({});
            }
        });
        if let Some(change) = change {
            self.publish_change(change).await;
        }
    }

    /// Stamp last-activity. Never broadcasts.
    pub fn update_activity(&self, user_id: i64) {
        let mut state = self.state.write().unwrap();
        if let Some(presence) = state.users.get_mut(&user_id) {
            presence.last_activity = Utc::now();
        }
    }

    // ── Queries ─────────────────────────────────────────────────

    pub fn get_user_status(&self, user_id: i64) -> Option<UserPresence> {
        let state = self.state.read().unwrap();
        state.users.get(&user_id).cloned()
    }

    pub fn is_user_online(&self, user_id: i64) -> bool {
        self.get_user_status(user_id)
            .is_some_and(|p| p.status != EffectiveStatus::Offline)
    }

    // ── Internals ───────────────────────────────────────────────

    /// Mutate a user's presence under the write lock and return the
    /// status change to broadcast, if any.
    fn mutate(&self, user_id: i64, f: impl FnOnce(&mut UserPresence)) -> Option<StatusChange> {
        let mut state = self.state.write().unwrap();
        let presence = state.users.get_mut(&user_id)?;
        f(presence);
        presence.last_activity = Utc::now();
        recompute_status(presence, false)
    }

    /// Persist the new status (best-effort) and broadcast the delta to
    /// the user's friends.
    async fn publish_change(&self, change: StatusChange) {
        debug!(
            user_id = change.user_id,
            status = change.status.as_str(),
            "status changed, broadcasting to friends"
        );

        if let Err(e) = self
            .directory
            .update_user_status(change.user_id, change.status.as_str(), &change.activity)
            .await
        {
            warn!(user_id = change.user_id, error = %e, "failed to persist status");
        }

        let friends = match self.directory.get_friends(change.user_id).await {
            Ok(friends) => friends,
            Err(e) => {
                warn!(user_id = change.user_id, error = %e, "failed to load friends");
                return;
            }
        };

        self.notifier
            .broadcast_status(
                &friends,
                change.user_id,
                &change.username,
                change.status.as_str(),
                &change.activity,
                change.custom_data,
            )
            .await;
    }

    /// Record this instance's live-session count for the user in the
    /// shared registry. Best-effort.
    async fn register_instance(&self, user_id: i64, count: usize) {
        let key = channels::presence_key(user_id);
        let field = channels::instance_field(self.instance_id);
        let result = if count == 0 {
            self.broker.hdel(&key, &field).await
        } else {
            match self.broker.hset(&key, &field, &count.to_string()).await {
                Ok(()) => self.broker.expire(&key, PRESENCE_REGISTRY_TTL).await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = result {
            debug!(user_id, error = %e, "presence registry update failed");
        }
    }

    /// Remove this instance's field and report whether any other
    /// instance still holds a live connection for the user. A broker
    /// failure reads as "no" — a single node without a broker behaves
    /// like the original single-process server.
    async fn deregister_instance(&self, user_id: i64) -> bool {
        let key = channels::presence_key(user_id);
        let field = channels::instance_field(self.instance_id);
        if let Err(e) = self.broker.hdel(&key, &field).await {
            debug!(user_id, error = %e, "presence registry removal failed");
            return false;
        }
        match self.broker.hgetall(&key).await {
            Ok(fields) => fields
                .iter()
                .any(|(_, v)| v.parse::<usize>().map(|n| n > 0).unwrap_or(false)),
            Err(e) => {
                debug!(user_id, error = %e, "presence registry read failed");
                false
            }
        }
    }

    /// Queue one status_update per friend onto a freshly attached
    /// session: in-memory presence when the friend is live on this
    /// process, the directory's last known status otherwise.
    fn spawn_initial_snapshot(self: &Arc<Self>, user_id: i64, session: Arc<Session>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let friends = match manager.directory.get_friends_with_status(user_id).await {
                Ok(friends) => friends,
                Err(e) => {
                    warn!(user_id, error = %e, "failed to load friend snapshot");
                    return;
                }
            };

            for friend in friends {
                let update = {
                    let state = manager.state.read().unwrap();
                    match state.users.get(&friend.user_id) {
                        Some(p) => NotificationEvent::new(
                            NotificationKind::StatusUpdate,
                            p.user_id,
                            json!({
                                "user_id": p.user_id,
                                "username": &p.username,
                                "status": p.status.as_str(),
                                "activity": &p.activity,
                                "timestamp": now_ts(),
                                "data": &p.custom_data,
                            }),
                        ),
                        None => NotificationEvent::new(
                            NotificationKind::StatusUpdate,
                            friend.user_id,
                            json!({
                                "user_id": friend.user_id,
                                "username": friend.username,
                                "status": friend.status,
                                "activity": friend.activity,
                                "timestamp": friend.last_seen.timestamp(),
                            }),
                        ),
                    }
                };

                match serde_json::to_string(&update) {
                    Ok(frame) => {
                        // Queue full: drop, live updates will catch the UI up.
                        session.send(frame);
                    }
                    Err(e) => warn!(user_id, error = %e, "failed to serialize snapshot"),
                }
            }
        });
    }
}

/// The effective-status derivation. Pure; evaluated on every mutation.
fn effective_status(presence: &UserPresence, disconnecting: bool) -> EffectiveStatus {
    if disconnecting {
        EffectiveStatus::Offline
    } else if presence.watching {
        EffectiveStatus::Watching
    } else if presence.manual_dnd {
        EffectiveStatus::Dnd
    } else {
        EffectiveStatus::Online
    }
}

/// Recompute and store the effective status, returning the change to
/// broadcast when it differs from the previous value.
fn recompute_status(presence: &mut UserPresence, disconnecting: bool) -> Option<StatusChange> {
    let new_status = effective_status(presence, disconnecting);
    if new_status == presence.status {
        return None;
    }
    presence.status = new_status;
    Some(StatusChange {
        user_id: presence.user_id,
        username: presence.username.clone(),
        status: new_status,
        activity: presence.activity.clone(),
        custom_data: presence.custom_data.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::testing::MemDirectory;
    use serde_json::Value;

    fn manager_with(broker: Broker) -> (Arc<PresenceManager>, Arc<MemDirectory>) {
        let directory = Arc::new(MemDirectory::new());
        directory.add_user(1, "alice");
        directory.add_user(2, "bob");
        directory.add_friendship(1, 2);
        let manager = Arc::new(PresenceManager::new(directory.clone(), broker));
        (manager, directory)
    }

    async fn recv_status(sub: &mut crate::broker::Subscription) -> Value {
        let value: Value = serde_json::from_str(&sub.recv().await.unwrap()).unwrap();
        assert_eq!(value["notification_type"], "status_update");
        value
    }

    fn new_session(user_id: i64, username: &str) -> Arc<Session> {
        let (session, _rx) = Session::new(user_id, username.to_string());
        session
    }

    #[test]
    fn test_effective_status_derivation() {
        let mut presence = UserPresence {
            user_id: 1,
            username: "alice".into(),
            status: EffectiveStatus::Offline,
            activity: String::new(),
            watching: false,
            manual_dnd: false,
            last_activity: Utc::now(),
            connected_at: Utc::now(),
            custom_data: json!({}),
        };

        assert_eq!(effective_status(&presence, true), EffectiveStatus::Offline);
        assert_eq!(effective_status(&presence, false), EffectiveStatus::Online);

        presence.manual_dnd = true;
        assert_eq!(effective_status(&presence, false), EffectiveStatus::Dnd);

        // Watching takes precedence over dnd.
        presence.watching = true;
        assert_eq!(effective_status(&presence, false), EffectiveStatus::Watching);
        assert_eq!(effective_status(&presence, true), EffectiveStatus::Offline);
    }

    #[tokio::test]
    async fn test_attach_broadcasts_online_to_friends() {
        let broker = Broker::memory();
        let (manager, _) = manager_with(broker.clone());
        let mut sub = broker.subscribe("user:2:notifications").await.unwrap();

        manager.attach(new_session(1, "alice")).await;

        let value = recv_status(&mut sub).await;
        assert_eq!(value["data"]["user_id"], 1);
        assert_eq!(value["data"]["status"], "online");
        assert!(manager.is_user_online(1));
    }

    #[tokio::test]
    async fn test_detach_last_session_broadcasts_offline() {
        let broker = Broker::memory();
        let (manager, directory) = manager_with(broker.clone());
        let session = new_session(1, "alice");
        manager.attach(session.clone()).await;

        let mut sub = broker.subscribe("user:2:notifications").await.unwrap();
        manager.detach(1, session.id).await;

        let value = recv_status(&mut sub).await;
        assert_eq!(value["data"]["status"], "offline");
        assert!(manager.get_user_status(1).is_none());
        assert_eq!(directory.stored_status(1).unwrap(), "offline");
    }

    #[tokio::test]
    async fn test_multi_tab_stays_online_until_last_detach() {
        let broker = Broker::memory();
        let (manager, _) = manager_with(broker.clone());
        let tab_a = new_session(1, "alice");
        let tab_b = new_session(1, "alice");
        manager.attach(tab_a.clone()).await;
        manager.attach(tab_b.clone()).await;

        let mut sub = broker.subscribe("user:2:notifications").await.unwrap();
        manager.detach(1, tab_a.id).await;

        // Still one live session: no status change, no broadcast.
        assert!(manager.is_user_online(1));
        assert!(sub.try_recv().is_none());

        manager.detach(1, tab_b.id).await;
        let value = recv_status(&mut sub).await;
        assert_eq!(value["data"]["status"], "offline");
    }

    #[tokio::test]
    async fn test_same_status_produces_no_broadcast() {
        let broker = Broker::memory();
        let (manager, _) = manager_with(broker.clone());
        manager.attach(new_session(1, "alice")).await;

        let mut sub = broker.subscribe("user:2:notifications").await.unwrap();
        manager.set_manual_status(1, "online").await.unwrap();
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_dnd_roundtrip() {
        let broker = Broker::memory();
        let (manager, _) = manager_with(broker.clone());
        manager.attach(new_session(1, "alice")).await;

        let mut sub = broker.subscribe("user:2:notifications").await.unwrap();
        manager.set_manual_status(1, "dnd").await.unwrap();
        assert_eq!(recv_status(&mut sub).await["data"]["status"], "dnd");

        manager.set_manual_status(1, "online").await.unwrap();
        assert_eq!(recv_status(&mut sub).await["data"]["status"], "online");
    }

    #[tokio::test]
    async fn test_invalid_manual_status_rejected() {
        let broker = Broker::memory();
        let (manager, _) = manager_with(broker);
        manager.attach(new_session(1, "alice")).await;
        assert!(manager.set_manual_status(1, "invisible").await.is_err());
    }

    #[tokio::test]
    async fn test_watching_overrides_and_restores() {
        let broker = Broker::memory();
        let (manager, _) = manager_with(broker.clone());
        manager.attach(new_session(1, "alice")).await;

        let mut sub = broker.subscribe("user:2:notifications").await.unwrap();
        manager
            .set_watching(1, "Room 10", json!({ "room_id": 10 }))
            .await;

        let value = recv_status(&mut sub).await;
        assert_eq!(value["data"]["status"], "watching");
        assert_eq!(value["data"]["activity"], "Watching Room 10");
        assert_eq!(value["data"]["data"]["room_id"], 10);

        manager.stop_watching(1).await;
        let value = recv_status(&mut sub).await;
        assert_eq!(value["data"]["status"], "online");
        assert_eq!(value["data"]["activity"], "");
    }

    #[tokio::test]
    async fn test_stop_watching_when_not_watching_is_silent() {
        let broker = Broker::memory();
        let (manager, _) = manager_with(broker.clone());
        manager.attach(new_session(1, "alice")).await;

        let mut sub = broker.subscribe("user:2:notifications").await.unwrap();
        manager.stop_watching(1).await;
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_update_activity_never_broadcasts() {
        let broker = Broker::memory();
        let (manager, _) = manager_with(broker.clone());
        manager.attach(new_session(1, "alice")).await;

        let mut sub = broker.subscribe("user:2:notifications").await.unwrap();
        manager.update_activity(1);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_initial_snapshot_reaches_new_session() {
        let broker = Broker::memory();
        let directory = Arc::new(MemDirectory::new());
        directory.add_user(1, "alice");
        directory.add_user(2, "bob");
        directory.add_friendship(1, 2);
        directory.update_user_status(2, "dnd", "").await.unwrap();
        let manager = Arc::new(PresenceManager::new(directory, broker));

        let (session, mut rx) = Session::new(1, "alice".to_string());
        manager.attach(session).await;

        // First frame for this session is bob's stored status.
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["notification_type"], "status_update");
        assert_eq!(value["data"]["user_id"], 2);
        assert_eq!(value["data"]["status"], "dnd");
    }

    #[tokio::test]
    async fn test_snapshot_prefers_live_presence_over_db() {
        let broker = Broker::memory();
        let directory = Arc::new(MemDirectory::new());
        directory.add_user(1, "alice");
        directory.add_user(2, "bob");
        directory.add_friendship(1, 2);
        // Stale DB row says offline, but bob is live on this process.
        directory.update_user_status(2, "offline", "").await.unwrap();
        let manager = Arc::new(PresenceManager::new(directory, broker));

        manager.attach(new_session(2, "bob")).await;

        let (session, mut rx) = Session::new(1, "alice".to_string());
        manager.attach(session).await;

        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["data"]["user_id"], 2);
        assert_eq!(value["data"]["status"], "online");
    }

    #[tokio::test]
    async fn test_cross_instance_offline_suppressed() {
        // Two server instances share one broker. The same user holds a
        // connection on each; closing one must not report offline.
        let broker = Broker::memory();
        let directory = Arc::new(MemDirectory::new());
        directory.add_user(7, "grace");
        directory.add_user(8, "heidi");
        directory.add_friendship(7, 8);

        let instance_a = Arc::new(PresenceManager::new(directory.clone(), broker.clone()));
        let instance_b = Arc::new(PresenceManager::new(directory.clone(), broker.clone()));

        let on_a = new_session(7, "grace");
        let on_b = new_session(7, "grace");
        instance_a.attach(on_a.clone()).await;
        instance_b.attach(on_b.clone()).await;

        let mut sub = broker.subscribe("user:8:notifications").await.unwrap();

        instance_a.detach(7, on_a.id).await;
        assert!(sub.try_recv().is_none(), "no offline while B holds a session");

        instance_b.detach(7, on_b.id).await;
        let value = recv_status(&mut sub).await;
        assert_eq!(value["data"]["user_id"], 7);
        assert_eq!(value["data"]["status"], "offline");
        // Exactly one offline update.
        assert!(sub.try_recv().is_none());
    }
}
