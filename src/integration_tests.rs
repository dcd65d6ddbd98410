//! Integration tests — cross-layer flows driven end-to-end over the
//! in-memory broker and directory: ownership transfer, the invitation
//! round trip, party role gating, cross-instance presence, stale
//! membership, and sync ordering.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::{Value, json};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use crate::broker::{Broker, Subscription, channels};
    use crate::directory::testing::MemDirectory;
    use crate::directory::{Directory, Role};
    use crate::engine::notifications::Notifier;
    use crate::engine::presence::PresenceManager;
    use crate::engine::rooms::RoomCoordinator;
    use crate::engine::session::{Session, spawn_channel_forward};

    // ── Helpers ──────────────────────────────────────────────────

    struct Harness {
        broker: Broker,
        directory: Arc<MemDirectory>,
        presence: Arc<PresenceManager>,
    }

    impl Harness {
        /// Users 1..=3 (alice, bob, carol) and room 10 owned by alice.
        fn new() -> Self {
            let broker = Broker::memory();
            let directory = Arc::new(MemDirectory::new());
            directory.add_user(1, "alice");
            directory.add_user(2, "bob");
            directory.add_user(3, "carol");
            directory.add_room(10, "movie night", 1, true);
            let presence = Arc::new(PresenceManager::new(directory.clone(), broker.clone()));
            Self {
                broker,
                directory,
                presence,
            }
        }

        fn connect(&self, user_id: i64, username: &str) -> (RoomCoordinator, mpsc::Receiver<String>) {
            let (session, rx) = Session::new(user_id, username.to_string());
            let rooms = RoomCoordinator::new(
                session,
                self.directory.clone(),
                self.broker.clone(),
                self.presence.clone(),
                Notifier::new(self.broker.clone()),
            );
            (rooms, rx)
        }

        async fn room_channel(&self, room_id: i64) -> Subscription {
            self.broker
                .subscribe(&channels::room_events(room_id))
                .await
                .unwrap()
        }
    }

    async fn recv_json(sub: &mut Subscription) -> Value {
        let payload = timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed");
        serde_json::from_str(&payload).unwrap()
    }

    async fn recv_frame(rx: &mut mpsc::Receiver<String>) -> Value {
        let frame = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("queue closed");
        serde_json::from_str(&frame).unwrap()
    }

    fn drain(rx: &mut mpsc::Receiver<String>) {
        while rx.try_recv().is_ok() {}
    }

    /// Skip frames until one of the given type arrives. Per-channel
    /// publish order makes this deterministic.
    async fn recv_frame_of_type(rx: &mut mpsc::Receiver<String>, frame_type: &str) -> Value {
        loop {
            let frame = recv_frame(rx).await;
            if frame["type"] == frame_type {
                return frame;
            }
        }
    }

    // ── Scenario: owner transfer ─────────────────────────────────

    #[tokio::test]
    async fn test_owner_disconnect_transfers_to_earliest_joined() {
        let h = Harness::new();
        h.directory.add_member(10, 2, Role::Member).await.unwrap();
        h.directory.add_member(10, 3, Role::Member).await.unwrap();

        let (mut owner, _rx1) = h.connect(1, "alice");
        let (mut member2, mut rx2) = h.connect(2, "bob");
        owner.handle_join(Some(json!({ "room_id": 10 }))).await.unwrap();
        member2.handle_join(Some(json!({ "room_id": 10 }))).await.unwrap();
        tokio::task::yield_now().await;

        // The owner's socket dies; session teardown runs the vacate path.
        owner.cleanup().await;

        // Bob observes the departure and the transfer on his live session.
        let left = recv_frame_of_type(&mut rx2, "user_left").await;
        assert_eq!(left["user_id"], 1);

        let transfer = recv_frame(&mut rx2).await;
        assert_eq!(transfer["type"], "ownership_transfer");
        assert_eq!(transfer["data"]["previous_owner_id"], 1);
        assert_eq!(transfer["data"]["new_owner_id"], 2);

        // Directory state is authoritative.
        let room = h.directory.get_room(10).await.unwrap().unwrap();
        assert_eq!(room.owner_id, 2);
        assert_eq!(h.directory.is_member(10, 1).await.unwrap(), None);
        assert_eq!(h.directory.is_member(10, 2).await.unwrap(), Some(Role::Owner));
        assert_eq!(h.directory.is_member(10, 3).await.unwrap(), Some(Role::Member));
    }

    // ── Scenario: private-room invitation round trip ─────────────

    #[tokio::test]
    async fn test_invitation_round_trip() {
        let h = Harness::new();
        let (mut owner, _rx1) = h.connect(1, "alice");
        owner.handle_join(Some(json!({ "room_id": 10 }))).await.unwrap();

        // Bob is connected but not in the room; his session forwards his
        // personal invitation channel.
        let (bob_session, mut bob_rx) = Session::new(2, "bob".to_string());
        spawn_channel_forward(
            h.broker.clone(),
            channels::user_room_invitations(2),
            bob_session.clone(),
            bob_session.cancel_token().child_token(),
        );
        tokio::task::yield_now().await;

        owner
            .handle_invite(Some(json!({ "room_id": 10, "username": "bob" })))
            .await
            .unwrap();

        let invite = recv_frame(&mut bob_rx).await;
        assert_eq!(invite["type"], "room_invitation");
        assert_eq!(invite["data"]["inviter_id"], 1);
        assert_eq!(invite["data"]["room_name"], "movie night");
        let invitation_id = invite["data"]["invitation_id"].as_i64().unwrap();

        // Members of the room see the list update, then the join.
        let mut room_sub = h.room_channel(10).await;
        let (mut bob, _bob_rooms_rx) = h.connect(2, "bob");
        let (message, _) = bob
            .handle_respond(Some(json!({ "invitation_id": invitation_id, "accept": true })))
            .await
            .unwrap();
        assert_eq!(message, "Invitation accepted successfully");

        let list = recv_json(&mut room_sub).await;
        assert_eq!(list["type"], "member_list_update");
        let members = list["data"]["members"].as_array().unwrap();
        assert!(members.iter().any(|m| m["user_id"] == 2));

        let joined = recv_json(&mut room_sub).await;
        assert_eq!(joined["type"], "user_joined");
        assert_eq!(joined["data"]["via"], "invitation");

        // Accepting again is rejected and membership is unchanged.
        let err = bob
            .handle_respond(Some(json!({ "invitation_id": invitation_id, "accept": true })))
            .await
            .unwrap_err();
        assert_eq!(err, "invitation not found or already processed");
        assert_eq!(h.directory.members_of(10).await.unwrap().len(), 2);
    }

    // ── Scenario: party start requires owner ─────────────────────

    #[tokio::test]
    async fn test_party_start_rejected_for_member() {
        let h = Harness::new();
        h.directory.add_member(10, 2, Role::Member).await.unwrap();
        let (mut bob, _rx) = h.connect(2, "bob");
        bob.handle_join(Some(json!({ "room_id": 10 }))).await.unwrap();

        let mut room_sub = h.room_channel(10).await;
        let err = bob
            .handle_party_start(Some(json!({ "position": 0.0, "start_at": 0 })))
            .await
            .unwrap_err();
        assert_eq!(err, "only room owner can start the party");
        assert!(room_sub.try_recv().is_none(), "nothing published on the room channel");
    }

    // ── Scenario: cross-instance presence ────────────────────────

    #[tokio::test]
    async fn test_cross_instance_presence_exactly_one_offline() {
        // User 7 holds connections on instances A and B; their friend 8
        // is connected to instance C and receives status updates through
        // the shared broker.
        let broker = Broker::memory();
        let directory = Arc::new(MemDirectory::new());
        directory.add_user(7, "grace");
        directory.add_user(8, "heidi");
        directory.add_friendship(7, 8);

        let instance_a = Arc::new(PresenceManager::new(directory.clone(), broker.clone()));
        let instance_b = Arc::new(PresenceManager::new(directory.clone(), broker.clone()));
        let instance_c = Arc::new(PresenceManager::new(directory.clone(), broker.clone()));

        // Heidi's session on C forwards her notification channel.
        let (heidi_session, mut heidi_rx) = Session::new(8, "heidi".to_string());
        spawn_channel_forward(
            broker.clone(),
            channels::user_notifications(8),
            heidi_session.clone(),
            heidi_session.cancel_token().child_token(),
        );
        instance_c.attach(heidi_session.clone()).await;
        tokio::task::yield_now().await;

        let grace_a = Session::new(7, "grace".to_string()).0;
        let grace_b = Session::new(7, "grace".to_string()).0;
        instance_a.attach(grace_a.clone()).await;
        instance_b.attach(grace_b.clone()).await;
        tokio::task::yield_now().await;
        drain(&mut heidi_rx);

        // First connection closes: grace is still online on B.
        instance_a.detach(7, grace_a.id).await;
        tokio::task::yield_now().await;
        assert!(heidi_rx.try_recv().is_err(), "no status update while B is live");

        // Second connection closes: exactly one offline update arrives.
        instance_b.detach(7, grace_b.id).await;
        let update = recv_frame(&mut heidi_rx).await;
        assert_eq!(update["notification_type"], "status_update");
        assert_eq!(update["data"]["user_id"], 7);
        assert_eq!(update["data"]["status"], "offline");
        tokio::task::yield_now().await;
        assert!(heidi_rx.try_recv().is_err(), "offline is delivered once");
    }

    // ── Scenario: stale membership ───────────────────────────────

    #[tokio::test]
    async fn test_revoked_member_cannot_chat() {
        let h = Harness::new();
        h.directory.add_member(10, 2, Role::Member).await.unwrap();

        let (mut owner, mut owner_rx) = h.connect(1, "alice");
        let (mut bob, _bob_rx) = h.connect(2, "bob");
        owner.handle_join(Some(json!({ "room_id": 10 }))).await.unwrap();
        bob.handle_join(Some(json!({ "room_id": 10 }))).await.unwrap();
        tokio::task::yield_now().await;
        drain(&mut owner_rx);

        // An administrator removes bob through the CRUD surface.
        h.directory.remove_member(10, 2).await.unwrap();

        let err = bob
            .handle_chat(Some(json!({ "message": "hello?" })))
            .await
            .unwrap_err();
        assert_eq!(err, "you are no longer a member of this room");
        assert!(bob.current_room().is_none());

        // Nothing reached the remaining member.
        tokio::task::yield_now().await;
        assert!(owner_rx.try_recv().is_err());
    }

    // ── Scenario: sync tie-break ─────────────────────────────────

    #[tokio::test]
    async fn test_concurrent_sync_events_order_by_server_stamp() {
        let h = Harness::new();
        h.directory.add_member(10, 2, Role::Member).await.unwrap();
        h.directory.add_member(10, 3, Role::Member).await.unwrap();

        let (mut a, _rx_a) = h.connect(2, "bob");
        let (mut b, _rx_b) = h.connect(3, "carol");
        a.handle_join(Some(json!({ "room_id": 10 }))).await.unwrap();
        b.handle_join(Some(json!({ "room_id": 10 }))).await.unwrap();

        let mut room_sub = h.room_channel(10).await;
        a.handle_party_sync_data(Some(json!({ "event_type": "seek", "position": 120.0 })))
            .await
            .unwrap();
        b.handle_party_sync_data(Some(json!({ "event_type": "seek", "position": 120.0 })))
            .await
            .unwrap();

        let first = recv_json(&mut room_sub).await;
        let second = recv_json(&mut room_sub).await;
        let t_a = first["data"]["server_timestamp"].as_i64().unwrap();
        let t_b = second["data"]["server_timestamp"].as_i64().unwrap();

        // Stamps are strictly ordered even when published in the same
        // millisecond, so every client converges on the later event.
        assert!(t_a < t_b);
        assert_eq!(second["user_id"], 3);
    }

    // ── Degraded mode ────────────────────────────────────────────

    #[tokio::test]
    async fn test_join_without_broker_reports_unavailable() {
        let broker = Broker::disabled();
        let directory = Arc::new(MemDirectory::new());
        directory.add_user(1, "alice");
        directory.add_room(10, "movie night", 1, false);
        let presence = Arc::new(PresenceManager::new(directory.clone(), broker.clone()));

        let (session, _rx) = Session::new(1, "alice".to_string());
        let mut rooms = RoomCoordinator::new(
            session,
            directory,
            broker.clone(),
            presence,
            Notifier::new(broker),
        );

        let err = rooms
            .handle_join(Some(json!({ "room_id": 10 })))
            .await
            .unwrap_err();
        assert_eq!(err, "broker unavailable");
    }

    // ── Queue boundary through a live room flow ──────────────────

    #[tokio::test]
    async fn test_slow_session_drops_but_stays_subscribed() {
        let h = Harness::new();
        let (mut owner, mut rx) = h.connect(1, "alice");
        owner.handle_join(Some(json!({ "room_id": 10 }))).await.unwrap();
        tokio::task::yield_now().await;

        // Flood well past the queue capacity without draining.
        for i in 0..600 {
            owner
                .handle_chat(Some(json!({ "message": format!("m{i}") })))
                .await
                .unwrap();
        }
        tokio::task::yield_now().await;

        // The queue delivers at most its capacity; the overflow was
        // dropped and the connection is still alive.
        let mut delivered = 0;
        while rx.try_recv().is_ok() {
            delivered += 1;
        }
        assert!(delivered <= 256 + 2, "queue bounded, got {delivered}");
        assert!(delivered > 0);

        // Still subscribed: a later event arrives.
        owner
            .handle_chat(Some(json!({ "message": "after" })))
            .await
            .unwrap();
        let event = recv_frame(&mut rx).await;
        assert_eq!(event["type"], "chat_message");
    }
}
