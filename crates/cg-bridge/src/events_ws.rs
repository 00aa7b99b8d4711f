use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::event_bus::SessionEvent;
use crate::http_api::ApiState;
use crate::protocol::CLOSE_SHELL_GONE;

/// How often an open stream checks that its session still exists.
const SESSION_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Task event frame: the event's own fields plus a `timestamp`.
fn event_frame(event: &SessionEvent) -> Value {
    let mut value = serde_json::to_value(&event.event).unwrap_or_else(|_| json!({}));
    if let Some(obj) = value.as_object_mut() {
        obj.insert("timestamp".into(), json!(chrono::Utc::now()));
    }
    value
}

/// GET /ws/sessions/{id}: live task events for one session.
pub async fn session_events_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_ws(socket, state, session_id))
}

async fn handle_events_ws(socket: WebSocket, state: Arc<ApiState>, session_id: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    if !state.manager.store().contains(&session_id) {
        let frame = CloseFrame {
            code: CLOSE_SHELL_GONE,
            reason: "session not found".into(),
        };
        let _ = ws_tx.send(Message::Close(Some(frame))).await;
        return;
    }

    // Subscribe before greeting so nothing published in between is lost.
    let rx = state.event_bus.subscribe();
    let hello = json!({
        "type": "connection_established",
        "session_id": session_id,
        "timestamp": chrono::Utc::now(),
        "message": "Connected to session event stream",
    });
    if ws_tx.send(Message::Text(hello.to_string().into())).await.is_err() {
        return;
    }
    info!(%session_id, "event stream connected");

    let heartbeat_every = state.manager.config().terminal.heartbeat();
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + heartbeat_every,
        heartbeat_every.max(Duration::from_millis(100)),
    );
    let mut session_check = tokio::time::interval_at(
        tokio::time::Instant::now() + SESSION_CHECK_INTERVAL,
        SESSION_CHECK_INTERVAL,
    );

    loop {
        tokio::select! {
            result = rx.recv_async() => {
                let Ok(event) = result else { break };
                if event.session_id != session_id {
                    continue;
                }
                let frame = event_frame(&event);
                if ws_tx.send(Message::Text(frame.to_string().into())).await.is_err() {
                    break;
                }
            }

            _ = session_check.tick() => {
                if !state.manager.store().contains(&session_id) {
                    info!(%session_id, "session ended, closing event stream");
                    let frame = CloseFrame {
                        code: CLOSE_SHELL_GONE,
                        reason: "session closed".into(),
                    };
                    let _ = ws_tx.send(Message::Close(Some(frame))).await;
                    break;
                }
            }

            _ = heartbeat.tick() => {
                if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }

            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let echo = json!({
                            "type": "echo",
                            "data": text.as_str(),
                            "timestamp": chrono::Utc::now(),
                        });
                        if ws_tx.send(Message::Text(echo.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    debug!(%session_id, "event stream closed");
}
