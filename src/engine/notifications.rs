//! Notification publishing. Everything that lands on a personal
//! `user:{id}:notifications` channel goes through the [`Notifier`], so
//! room and presence code depend on this seam instead of on each other.

use serde_json::json;
use tracing::{debug, warn};

use crate::broker::{Broker, BrokerError, channels};

use super::events::{NotificationEvent, NotificationKind};

#[derive(Clone)]
pub struct Notifier {
    broker: Broker,
}

impl Notifier {
    pub fn new(broker: Broker) -> Self {
        Self { broker }
    }

    /// Publish a notification to a user's personal channel. Callers on
    /// required paths surface the error; advisory callers log and move on.
    pub async fn send(
        &self,
        to_user: i64,
        kind: NotificationKind,
        data: serde_json::Value,
    ) -> Result<(), BrokerError> {
        let event = NotificationEvent::new(kind, to_user, data);
        self.broker
            .publish_json(&channels::user_notifications(to_user), &event)
            .await
    }

    pub async fn friend_request_received(
        &self,
        to_user: i64,
        from_user: i64,
        username: &str,
        display_name: &str,
    ) -> Result<(), BrokerError> {
        self.send(
            to_user,
            NotificationKind::FriendRequestReceived,
            json!({
                "sender_id": from_user,
                "username": username,
                "display_name": display_name,
            }),
        )
        .await
    }

    pub async fn friend_request_accepted(
        &self,
        to_user: i64,
        from_user: i64,
        username: &str,
        display_name: &str,
    ) -> Result<(), BrokerError> {
        self.send(
            to_user,
            NotificationKind::FriendRequestAccepted,
            json!({
                "accepter_id": from_user,
                "username": username,
                "display_name": display_name,
            }),
        )
        .await
    }

    pub async fn friend_request_rejected(
        &self,
        to_user: i64,
        from_user: i64,
        username: &str,
        display_name: &str,
    ) -> Result<(), BrokerError> {
        self.send(
            to_user,
            NotificationKind::FriendRequestRejected,
            json!({
                "rejecter_id": from_user,
                "username": username,
                "display_name": display_name,
            }),
        )
        .await
    }

    /// Tell an inviter how their invitation was answered. Advisory: a
    /// failure is logged and swallowed.
    pub async fn invitation_response(
        &self,
        inviter_id: i64,
        responder_id: i64,
        responder_name: &str,
        room_id: i64,
        room_name: &str,
        accepted: bool,
    ) {
        let (kind, id_key, name_key) = if accepted {
            (NotificationKind::InvitationAccepted, "accepter_id", "accepter_name")
        } else {
            (NotificationKind::InvitationRejected, "rejecter_id", "rejecter_name")
        };

        let result = self
            .send(
                inviter_id,
                kind,
                json!({
                    id_key: responder_id,
                    name_key: responder_name,
                    "room_id": room_id,
                    "room_name": room_name,
                }),
            )
            .await;

        if let Err(e) = result {
            warn!(inviter_id, room_id, error = %e, "failed to notify inviter of response");
        }
    }

    /// Fan a status update out to each friend's personal channel.
    /// Advisory: per-friend failures are logged and do not stop the loop.
    pub async fn broadcast_status(
        &self,
        friend_ids: &[i64],
        user_id: i64,
        username: &str,
        status: &str,
        activity: &str,
        custom_data: serde_json::Value,
    ) {
        let event = NotificationEvent::new(
            NotificationKind::StatusUpdate,
            user_id,
            json!({
                "user_id": user_id,
                "username": username,
                "status": status,
                "activity": activity,
                "timestamp": super::events::now_ts(),
                "data": custom_data,
            }),
        );

        let mut sent = 0usize;
        for &friend_id in friend_ids {
            match self
                .broker
                .publish_json(&channels::user_notifications(friend_id), &event)
                .await
            {
                Ok(()) => sent += 1,
                Err(e) => debug!(user_id, friend_id, error = %e, "status broadcast failed"),
            }
        }
        debug!(user_id, status, sent, total = friend_ids.len(), "status update broadcast");
    }
}
