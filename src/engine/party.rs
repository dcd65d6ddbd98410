//! Shared room state kept in the broker alongside the event stream: the
//! playback snapshot late joiners seed from, the advisory viewer hash,
//! and the monotonic stamp party-sync consumers order by.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::broker::{Broker, BrokerError, channels};

use super::events::{PlaybackSnapshot, Viewer};

const PLAYBACK_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const VIEWERS_TTL: Duration = Duration::from_secs(60 * 60);

static SYNC_STAMP: AtomicI64 = AtomicI64::new(0);

/// A strictly monotonic millisecond stamp for party-sync events. Wall
/// clock when it is ahead, last + 1 otherwise, so two events published in
/// the same millisecond still order deterministically.
pub fn next_sync_timestamp() -> i64 {
    let now = Utc::now().timestamp_millis();
    SYNC_STAMP
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last + 1))
        })
        .map(|last| now.max(last + 1))
        .unwrap_or(now)
}

/// Broker-backed room state. All writes here are advisory: failures are
/// logged and never fail the client action that triggered them.
#[derive(Clone)]
pub struct RoomStateStore {
    broker: Broker,
}

impl RoomStateStore {
    pub fn new(broker: Broker) -> Self {
        Self { broker }
    }

    /// Store the room's playback snapshot (TTL 24h).
    pub async fn update_playback(&self, snapshot: &PlaybackSnapshot) {
        let key = channels::playback_key(snapshot.room_id);
        if let Err(e) = self.broker.set_json(&key, snapshot, PLAYBACK_TTL).await {
            debug!(room_id = snapshot.room_id, error = %e, "playback snapshot write failed");
        }
    }

    /// Fetch the room's playback snapshot, if any.
    pub async fn get_playback(&self, room_id: i64) -> Option<PlaybackSnapshot> {
        match self.broker.get_json(&channels::playback_key(room_id)).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                debug!(room_id, error = %e, "playback snapshot read failed");
                None
            }
        }
    }

    /// Drop the room's playback snapshot.
    pub async fn clear_playback(&self, room_id: i64) {
        if let Err(e) = self.broker.delete(&channels::playback_key(room_id)).await {
            debug!(room_id, error = %e, "playback snapshot clear failed");
        }
    }

    /// Record a viewer in the room's advisory viewer hash (TTL 1h).
    pub async fn add_viewer(&self, room_id: i64, viewer: &Viewer) {
        let key = channels::viewers_key(room_id);
        let field = channels::viewer_field(viewer.user_id);
        let result: Result<(), BrokerError> = async {
            let payload = serde_json::to_string(viewer)?;
            self.broker.hset(&key, &field, &payload).await?;
            self.broker.expire(&key, VIEWERS_TTL).await
        }
        .await;
        if let Err(e) = result {
            debug!(room_id, user_id = viewer.user_id, error = %e, "viewer add failed");
        }
    }

    /// Remove a viewer from the room's viewer hash.
    pub async fn remove_viewer(&self, room_id: i64, user_id: i64) {
        let key = channels::viewers_key(room_id);
        if let Err(e) = self.broker.hdel(&key, &channels::viewer_field(user_id)).await {
            debug!(room_id, user_id, error = %e, "viewer remove failed");
        }
    }

    /// All viewers currently recorded for a room. Unparseable records are
    /// skipped.
    pub async fn viewers(&self, room_id: i64) -> Vec<Viewer> {
        match self.broker.hgetall(&channels::viewers_key(room_id)).await {
            Ok(fields) => fields
                .values()
                .filter_map(|raw| serde_json::from_str(raw).ok())
                .collect(),
            Err(e) => {
                debug!(room_id, error = %e, "viewer read failed");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(room_id: i64, position: f64) -> PlaybackSnapshot {
        PlaybackSnapshot {
            room_id,
            media_url: "magnet:?xt=demo".into(),
            position,
            is_playing: true,
            playback_rate: 1.0,
            updated_by: 1,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_sync_timestamps_strictly_increase() {
        let mut last = next_sync_timestamp();
        for _ in 0..1000 {
            let next = next_sync_timestamp();
            assert!(next > last);
            last = next;
        }
    }

    #[tokio::test]
    async fn test_playback_snapshot_roundtrip() {
        let store = RoomStateStore::new(Broker::memory());
        store.update_playback(&snapshot(3, 42.0)).await;

        let loaded = store.get_playback(3).await.unwrap();
        assert_eq!(loaded.position, 42.0);
        assert!(store.get_playback(4).await.is_none());

        store.clear_playback(3).await;
        assert!(store.get_playback(3).await.is_none());
    }

    #[tokio::test]
    async fn test_viewer_set_add_remove() {
        let store = RoomStateStore::new(Broker::memory());
        store
            .add_viewer(
                3,
                &Viewer {
                    user_id: 1,
                    username: "alice".into(),
                    avatar_url: None,
                },
            )
            .await;
        store
            .add_viewer(
                3,
                &Viewer {
                    user_id: 2,
                    username: "bob".into(),
                    avatar_url: None,
                },
            )
            .await;

        assert_eq!(store.viewers(3).await.len(), 2);

        store.remove_viewer(3, 1).await;
        let viewers = store.viewers(3).await;
        assert_eq!(viewers.len(), 1);
        assert_eq!(viewers[0].username, "bob");
    }

    #[tokio::test]
    async fn test_store_is_silent_without_broker() {
        let store = RoomStateStore::new(Broker::disabled());
        store.update_playback(&snapshot(3, 1.0)).await;
        assert!(store.get_playback(3).await.is_none());
        assert!(store.viewers(3).await.is_empty());
    }
}
