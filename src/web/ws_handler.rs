use std::sync::Arc;

use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;

use crate::engine::session;

use super::app_state::AppState;

/// Upgrade `/ws` to a WebSocket and hand the connection to the session
/// multiplexer. The frame-size limit is enforced here; everything past
/// the upgrade (handshake, pumps, dispatch) lives in the engine.
pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.max_message_size(session::MAX_FRAME_BYTES)
        .on_upgrade(move |socket| session::run(socket, state))
}
