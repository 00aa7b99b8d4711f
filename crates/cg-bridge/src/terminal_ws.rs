use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use cg_core::config::TerminalConfig;
use cg_session::pty::{DetachReason, ReadOutcome, ShellSession};
use cg_session::SessionManager;

use crate::http_api::ApiState;
use crate::protocol::{
    ClientFrame, ShellFrame, Utf8Decoder, CLOSE_IDLE, CLOSE_NORMAL, CLOSE_SHELL_GONE,
};

type WsSender = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Why a bridge stopped pumping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BridgeEnd {
    /// Client sent a close frame or the socket failed.
    ClientGone,
    IdleTimeout,
    /// The shell process exited.
    ShellExited,
    /// The shell was closed through the API or by its session ending.
    ShellClosed,
    Superseded,
}

// ---------------------------------------------------------------------------
// Activity tracking
// ---------------------------------------------------------------------------

/// Last-traffic clock shared by the pumps and the idle watchdog, plus a
/// throttle for touching the owning session.
struct Activity {
    origin: Instant,
    last_ms: AtomicU64,
    last_touch_ms: AtomicU64,
    touch_every: Duration,
    manager: Arc<SessionManager>,
    session_id: String,
}

impl Activity {
    fn new(manager: Arc<SessionManager>, session_id: String, touch_every: Duration) -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
            last_touch_ms: AtomicU64::new(0),
            touch_every,
            manager,
            session_id,
        }
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn idle_for(&self) -> Duration {
        Duration::from_millis(self.now_ms().saturating_sub(self.last_ms.load(Ordering::Relaxed)))
    }

    /// Record traffic and, at most once per `touch_every`, keep the owning
    /// session from being swept as idle.
    fn mark(&self) {
        let now = self.now_ms();
        self.last_ms.store(now, Ordering::Relaxed);
        let last_touch = self.last_touch_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last_touch) >= self.touch_every.as_millis() as u64
            && self
                .last_touch_ms
                .compare_exchange(last_touch, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            if let Err(e) = self.manager.touch(&self.session_id) {
                debug!(session_id = %self.session_id, error = %e, "session touch failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// WebSocket Handler
// ---------------------------------------------------------------------------

/// GET /ws/shells/{shell_id}: WebSocket for shell I/O.
///
/// Unknown shells still get the upgrade so the client can read the 4404
/// close code instead of a failed handshake.
pub async fn shell_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
    Path(shell_id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_shell_ws(socket, state, shell_id))
}

async fn send_close(sender: &WsSender, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let mut sink = sender.lock().await;
    if sink.send(Message::Close(Some(frame))).await.is_err() {
        debug!(code, "client already gone, close frame not sent");
    }
    let _ = sink.close().await;
}

async fn send_frame(sender: &WsSender, frame: &ShellFrame) -> bool {
    let json = match serde_json::to_string(frame) {
        Ok(json) => json,
        Err(e) => {
            warn!("could not encode shell frame: {e}");
            return true;
        }
    };
    sender
        .lock()
        .await
        .send(Message::Text(json.into()))
        .await
        .is_ok()
}

async fn handle_shell_ws(socket: WebSocket, state: Arc<ApiState>, shell_id: String) {
    let (ws_sender, ws_receiver) = socket.split();
    let ws_sender: WsSender = Arc::new(Mutex::new(ws_sender));

    let shell = match state.manager.shells().get(&shell_id) {
        Some(shell) if !shell.is_dead() => shell,
        _ => {
            info!(%shell_id, "connection for unknown shell, closing");
            send_close(&ws_sender, CLOSE_SHELL_GONE, "shell not found").await;
            return;
        }
    };
    let terminal = state.manager.config().terminal.clone();

    let mut binding = shell.bind(terminal.supersede_wait()).await;
    let conn_id = binding.conn_id();
    info!(%shell_id, conn_id, "terminal connected");

    let connected = ShellFrame::ShellConnected {
        shell_id: shell_id.clone(),
        session_id: shell.session_id().to_string(),
        timestamp: chrono::Utc::now(),
        message: "Shell session connected".into(),
    };
    if !send_frame(&ws_sender, &connected).await {
        shell.unbind(conn_id);
        return;
    }

    let activity = Arc::new(Activity::new(
        Arc::clone(&state.manager),
        shell.session_id().to_string(),
        terminal.touch_interval(),
    ));
    activity.mark();

    let mut output_task = tokio::spawn(pump_output(
        Arc::clone(&shell),
        ws_sender.clone(),
        Arc::clone(&activity),
        terminal.poll_interval(),
    ));
    let mut input_task = tokio::spawn(pump_input(
        Arc::clone(&shell),
        ws_receiver,
        Arc::clone(&activity),
    ));
    let mut watchdog_task = tokio::spawn(watch_idle(Arc::clone(&activity), terminal.idle_timeout()));
    let mut heartbeat_task = tokio::spawn(heartbeat(ws_sender.clone(), terminal.heartbeat()));

    // Whichever finishes first decides how the connection ends.
    let end = tokio::select! {
        r = &mut output_task => r.unwrap_or(BridgeEnd::ClientGone),
        r = &mut input_task => r.unwrap_or(BridgeEnd::ClientGone),
        r = &mut watchdog_task => r.unwrap_or(BridgeEnd::ClientGone),
        r = &mut heartbeat_task => r.unwrap_or(BridgeEnd::ClientGone),
        reason = binding.stopped() => match reason {
            DetachReason::Superseded => BridgeEnd::Superseded,
            DetachReason::ShellClosed => BridgeEnd::ShellClosed,
        },
    };

    output_task.abort();
    input_task.abort();
    watchdog_task.abort();
    heartbeat_task.abort();
    // Let the aborted tasks drop their handles before we touch the shell.
    tokio::task::yield_now().await;

    finish(&state, &shell, &ws_sender, conn_id, end, &terminal).await;
    // Dropping the binding releases a superseding connection or a closer
    // waiting in detach.
    drop(binding);
}

async fn finish(
    state: &ApiState,
    shell: &Arc<ShellSession>,
    ws_sender: &WsSender,
    conn_id: u64,
    end: BridgeEnd,
    terminal: &TerminalConfig,
) {
    let shell_id = shell.shell_id();
    info!(%shell_id, conn_id, ?end, "terminal disconnected");
    match end {
        BridgeEnd::Superseded => {
            send_close(ws_sender, CLOSE_NORMAL, "superseded").await;
        }
        BridgeEnd::ClientGone => {
            shell.unbind(conn_id);
        }
        BridgeEnd::IdleTimeout => {
            send_close(ws_sender, CLOSE_IDLE, "idle timeout").await;
            shell.unbind(conn_id);
        }
        BridgeEnd::ShellExited => {
            shell.unbind(conn_id);
            state.manager.shells().remove(shell_id);
            send_close(ws_sender, CLOSE_SHELL_GONE, "shell exited").await;
            shell.close(terminal.close_grace()).await;
        }
        BridgeEnd::ShellClosed => {
            send_close(ws_sender, CLOSE_SHELL_GONE, "shell closed").await;
        }
    }
}

// ---------------------------------------------------------------------------
// Pumps
// ---------------------------------------------------------------------------

/// PTY -> WebSocket, in order, until the shell ends or the client goes away.
async fn pump_output(
    shell: Arc<ShellSession>,
    sender: WsSender,
    activity: Arc<Activity>,
    poll: Duration,
) -> BridgeEnd {
    let mut decoder = Utf8Decoder::default();
    let shell_id = shell.shell_id().to_string();
    loop {
        match shell.try_read() {
            ReadOutcome::Data(chunk) => {
                activity.mark();
                let data = decoder.decode(&chunk);
                if data.is_empty() {
                    continue;
                }
                let frame = ShellFrame::ShellOutput {
                    data,
                    shell_id: shell_id.clone(),
                };
                if !send_frame(&sender, &frame).await {
                    return BridgeEnd::ClientGone;
                }
            }
            ReadOutcome::WouldBlock => tokio::time::sleep(poll).await,
            ReadOutcome::Eof => return BridgeEnd::ShellExited,
        }
    }
}

/// WebSocket -> PTY. JSON frames are dispatched; any other text or binary
/// payload is written to the shell as-is.
async fn pump_input(
    shell: Arc<ShellSession>,
    mut receiver: SplitStream<WebSocket>,
    activity: Arc<Activity>,
) -> BridgeEnd {
    while let Some(msg) = receiver.next().await {
        let bytes = match msg {
            Ok(Message::Text(text)) => match ClientFrame::parse(text.as_str()) {
                Some(ClientFrame::ShellInput { data }) => data.into_bytes(),
                Some(ClientFrame::ShellResize { rows, cols }) => {
                    activity.mark();
                    if let Err(e) = shell.resize(rows, cols) {
                        warn!(shell_id = %shell.shell_id(), "PTY resize failed: {e}");
                    }
                    continue;
                }
                None => text.as_str().as_bytes().to_vec(),
            },
            Ok(Message::Binary(data)) => data.to_vec(),
            Ok(Message::Close(_)) | Err(_) => return BridgeEnd::ClientGone,
            Ok(_) => continue,
        };
        activity.mark();
        if shell.write(bytes).await.is_err() {
            return BridgeEnd::ShellExited;
        }
    }
    BridgeEnd::ClientGone
}

async fn watch_idle(activity: Arc<Activity>, limit: Duration) -> BridgeEnd {
    loop {
        let idle = activity.idle_for();
        if idle >= limit {
            return BridgeEnd::IdleTimeout;
        }
        tokio::time::sleep(limit - idle).await;
    }
}

/// Ping every `period` to detect half-open connections. Pongs are handled by
/// axum/tungstenite.
async fn heartbeat(sender: WsSender, period: Duration) -> BridgeEnd {
    let period = period.max(Duration::from_millis(100));
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        interval.tick().await;
        if sender
            .lock()
            .await
            .send(Message::Ping(Vec::new().into()))
            .await
            .is_err()
        {
            debug!("heartbeat ping failed, connection lost");
            return BridgeEnd::ClientGone;
        }
    }
}
