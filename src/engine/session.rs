//! One session per connected client: the handshake, the bounded outbound
//! queue, the read/write pumps, and the dispatch table that routes typed
//! messages to the room coordinator and presence manager.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, channels};
use crate::web::app_state::AppState;

use super::events::{
    AuthMessage, ClientMessage, SessionId, auth_error_frame, auth_success_frame,
    connection_established_frame, error_frame, pong_frame, success_frame,
};
use super::presence::PresenceManager;
use super::rooms::RoomCoordinator;

/// Maximum queued outbound frames per session. Producers drop on overflow
/// rather than block; the connection is never closed for this alone.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Maximum inbound frame size, enforced at the WebSocket upgrade.
pub const MAX_FRAME_BYTES: usize = 4096;

const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(10);
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(54);

/// Handle to one authenticated connection. Exclusively owns the outbound
/// queue; the cancellation token is the session's `done` signal.
pub struct Session {
    pub id: SessionId,
    pub user_id: i64,
    pub username: String,
    outbound: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl Session {
    /// Create a session and the receiving half of its outbound queue,
    /// which the write pump consumes.
    pub fn new(user_id: i64, username: String) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            user_id,
            username,
            outbound: tx,
            cancel: CancellationToken::new(),
        });
        (session, rx)
    }

    /// Queue a frame for delivery. Returns false when the frame was
    /// dropped (queue full or session closed).
    pub fn send(&self, frame: String) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(user_id = self.user_id, "outbound queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Signal every task attached to this session to stop.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Forward every payload published on a broker channel into the session's
/// outbound queue until the token is cancelled. Overflow drops the
/// payload; the subscription itself stays up.
pub fn spawn_channel_forward(
    broker: Broker,
    channel: String,
    session: Arc<Session>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut sub = match broker.subscribe(&channel).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!(user_id = session.user_id, %channel, error = %e, "subscription unavailable");
                return;
            }
        };
        debug!(user_id = session.user_id, %channel, "subscribed");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                payload = sub.recv() => match payload {
                    Some(payload) => {
                        session.send(payload);
                    }
                    None => break,
                },
            }
        }
        debug!(user_id = session.user_id, %channel, "subscription ended");
    });
}

/// Drive one WebSocket connection from handshake to teardown.
pub async fn run(mut socket: WebSocket, state: Arc<AppState>) {
    let claims = match handshake(&mut socket, &state).await {
        Ok(claims) => claims,
        Err(message) => {
            let _ = socket
                .send(Message::Text(auth_error_frame(&message).into()))
                .await;
            return;
        }
    };

    if socket
        .send(Message::Text(auth_success_frame().into()))
        .await
        .is_err()
    {
        return;
    }

    let (session, outbound_rx) = Session::new(claims.user_id, claims.username.clone());
    info!(user_id = session.user_id, username = %session.username, "session authenticated");

    let (sink, stream) = socket.split();
    tokio::spawn(write_pump(sink, outbound_rx, session.clone()));

    state.presence.attach(session.clone()).await;

    let mut connection = Connection {
        session: session.clone(),
        presence: state.presence.clone(),
        rooms: RoomCoordinator::new(
            session.clone(),
            state.directory.clone(),
            state.broker.clone(),
            state.presence.clone(),
            state.notifier.clone(),
        ),
    };
    connection.rooms.subscribe_invitations();
    spawn_channel_forward(
        state.broker.clone(),
        channels::user_notifications(session.user_id),
        session.clone(),
        session.cancel_token().child_token(),
    );

    session.send(connection_established_frame(session.user_id));

    connection.read_pump(stream).await;

    session.close();
    state.presence.detach(session.user_id, session.id).await;
    connection.rooms.cleanup().await;
    info!(user_id = session.user_id, "session disconnected");
}

/// The first frame must arrive within 10 seconds and be
/// `{"type":"auth","token":...}`. Returns claims or the `auth_error`
/// message to send before closing.
async fn handshake(
    socket: &mut WebSocket,
    state: &AppState,
) -> Result<crate::auth::token::Claims, String> {
    let first = match timeout(HANDSHAKE_DEADLINE, socket.recv()).await {
        Ok(Some(Ok(Message::Text(text)))) => text.to_string(),
        Ok(_) => return Err("Authentication failed.".to_string()),
        Err(_) => return Err("Authentication failed.".to_string()),
    };

    let auth: AuthMessage = serde_json::from_str(&first)
        .map_err(|_| "failed to parse auth message".to_string())?;
    if auth.msg_type != "auth" {
        return Err("expected auth message".to_string());
    }

    state
        .verifier
        .verify(&auth.token)
        .map_err(|_| "Invalid token".to_string())
}

/// Per-connection state threaded through the read pump.
struct Connection {
    session: Arc<Session>,
    presence: Arc<PresenceManager>,
    rooms: RoomCoordinator,
}

impl Connection {
    async fn read_pump(&mut self, mut stream: SplitStream<WebSocket>) {
        loop {
            let next = tokio::select! {
                _ = self.session.cancel_token().cancelled() => break,
                next = timeout(READ_IDLE_TIMEOUT, stream.next()) => next,
            };

            let message = match next {
                Err(_) => {
                    debug!(user_id = self.session.user_id, "read idle timeout");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    debug!(user_id = self.session.user_id, error = %e, "read error");
                    break;
                }
                Ok(Some(Ok(message))) => message,
            };

            match message {
                Message::Text(text) => {
                    let parsed: ClientMessage = match serde_json::from_str(text.as_str()) {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            warn!(user_id = self.session.user_id, error = %e, "unparseable frame");
                            continue;
                        }
                    };
                    self.dispatch(parsed).await;
                    self.presence.update_activity(self.session.user_id);
                }
                Message::Close(_) => break,
                // Pongs land here and refresh the idle deadline simply by
                // completing the read.
                _ => {}
            }
        }
    }

    /// Route one inbound message. A panicking handler is caught, logged,
    /// and answered with an error frame — it never takes the process down.
    async fn dispatch(&mut self, msg: ClientMessage) {
        let msg_type = msg.msg_type.clone();
        let outcome = AssertUnwindSafe(self.handle(&msg_type, msg.data))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(Some((message, data)))) => {
                self.session.send(success_frame(&message, data));
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => {
                debug!(user_id = self.session.user_id, %msg_type, error = %e, "handler error");
                self.session.send(error_frame(&e));
            }
            Err(_) => {
                error!(user_id = self.session.user_id, %msg_type, "message handler panicked");
                self.session.send(error_frame("internal server error"));
            }
        }
    }

    async fn handle(
        &mut self,
        msg_type: &str,
        data: Option<Value>,
    ) -> Result<Option<(String, Option<Value>)>, String> {
        match msg_type {
            "join_room" => {
                let reply = self.rooms.handle_join(data).await?;
                Ok(Some(("Joined room successfully".to_string(), Some(reply))))
            }
            "leave_room" => {
                self.rooms.handle_leave().await?;
                Ok(Some(("Left room successfully".to_string(), None)))
            }
            "invite_to_room" => {
                let reply = self.rooms.handle_invite(data).await?;
                Ok(Some(("Invitation sent successfully".to_string(), Some(reply))))
            }
            "respond_to_invitation" => {
                let (message, reply) = self.rooms.handle_respond(data).await?;
                Ok(Some((message, reply)))
            }
            "room_message" => {
                self.rooms.handle_chat(data).await?;
                Ok(None)
            }
            "party_movie_selected" => {
                self.rooms.handle_party_movie_selected(data).await?;
                Ok(Some(("Party movie selected successfully".to_string(), None)))
            }
            "party_source_status" => {
                self.rooms.handle_party_source_status(data).await?;
                Ok(Some(("Party source status updated".to_string(), None)))
            }
            "party_start" => {
                self.rooms.handle_party_start(data).await?;
                Ok(Some(("Party started successfully".to_string(), None)))
            }
            "party_movie_cleared" => {
                self.rooms.handle_party_movie_cleared(data).await?;
                Ok(Some(("Party movie cleared successfully".to_string(), None)))
            }
            "party_sync_data" => {
                self.rooms.handle_party_sync_data(data).await?;
                Ok(None)
            }
            "manual_sync_request" => {
                self.rooms.handle_manual_sync_request(data).await?;
                Ok(None)
            }
            "sync_status_update" => {
                self.rooms.handle_sync_status_update(data).await?;
                Ok(None)
            }
            "set_status" => {
                let data = data.ok_or_else(|| "Invalid message data".to_string())?;
                let status = data
                    .get("status")
                    .and_then(Value::as_str)
                    .ok_or_else(|| "invalid status".to_string())?;
                self.presence
                    .set_manual_status(self.session.user_id, status)
                    .await?;
                Ok(None)
            }
            "ping" => {
                self.session.send(pong_frame());
                Ok(None)
            }
            other => {
                warn!(user_id = self.session.user_id, msg_type = other, "unknown message type");
                Ok(None)
            }
        }
    }
}

/// Consume the outbound queue. Queued frames are drained and written as a
/// single text frame separated by newlines; a ping goes out every 54s; a
/// failed or overdue write tears the session down.
async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<String>,
    session: Arc<Session>,
) {
    let mut ping = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    let cancel = session.cancel_token().clone();

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => {
                    let mut batch = frame;
                    while let Ok(next) = rx.try_recv() {
                        batch.push('\n');
                        batch.push_str(&next);
                    }
                    match timeout(WRITE_DEADLINE, sink.send(Message::Text(batch.into()))).await {
                        Ok(Ok(())) => {}
                        _ => break,
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = ping.tick() => {
                match timeout(WRITE_DEADLINE, sink.send(Message::Ping(Vec::new().into()))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
            _ = cancel.cancelled() => break,
        }
    }

    cancel.cancel();
    debug!(user_id = session.user_id, "write pump stopped");
}
