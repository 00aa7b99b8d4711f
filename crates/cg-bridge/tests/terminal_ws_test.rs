use std::sync::Arc;
use std::time::Duration;

use cg_bridge::http_api::{api_router, ApiState};
use cg_core::config::Config;
use cg_runtime::LocalRuntime;
use cg_session::executor::NoopExecutor;
use cg_session::SessionManager;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::tungstenite::protocol::Message;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct TestServer {
    base: String,
    state: Arc<ApiState>,
    _dir: tempfile::TempDir,
}

/// Spin up the API on an ephemeral port with a local runtime.
async fn start_test_server_with(tweak: impl FnOnce(&mut Config)) -> TestServer {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = Config::default();
    config.runtime.kind = "local".into();
    config.runtime.shell = "/bin/sh".into();
    config.sessions.base_dir = dir.path().to_string_lossy().into_owned();
    config.terminal.close_grace_ms = 200;
    config.terminal.supersede_wait_ms = 500;
    tweak(&mut config);

    let runtime = Arc::new(LocalRuntime::new("/bin/sh"));
    let manager = Arc::new(SessionManager::new(config, runtime).expect("manager"));
    let state = Arc::new(ApiState::new(manager, Arc::new(NoopExecutor)));
    let router = api_router(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind to ephemeral port");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    TestServer {
        base: format!("http://{addr}"),
        state,
        _dir: dir,
    }
}

async fn start_test_server() -> TestServer {
    start_test_server_with(|_| {}).await
}

/// Create a session and a shell in it; returns (session_id, shell_id).
async fn create_shell(client: &reqwest::Client, base: &str) -> (String, String) {
    let session: Value = client
        .post(format!("{base}/api/sessions"))
        .json(&serde_json::json!({"task": "noop"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let session_id = session["id"].as_str().unwrap().to_string();

    let resp = client
        .post(format!("{base}/api/sessions/{session_id}/shells"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let shell: Value = resp.json().await.unwrap();
    (session_id, shell["shell_id"].as_str().unwrap().to_string())
}

async fn connect(base: &str, shell_id: &str) -> WsStream {
    let url = base.replace("http://", "ws://") + &format!("/ws/shells/{shell_id}");
    let (ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("failed to connect to shell websocket");
    ws
}

/// Next data-bearing message, skipping pings.
async fn next_msg(ws: &mut WsStream) -> Option<Message> {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            Ok(Some(Ok(msg))) => return Some(msg),
            _ => return None,
        }
    }
}

async fn expect_connected(ws: &mut WsStream) -> Value {
    match next_msg(ws).await {
        Some(Message::Text(text)) => {
            let v: Value = serde_json::from_str(text.as_str()).unwrap();
            assert_eq!(v["type"], "shell_connected");
            v
        }
        other => panic!("expected shell_connected, got {other:?}"),
    }
}

/// Read until a close frame arrives and return its code.
async fn expect_close(ws: &mut WsStream) -> u16 {
    loop {
        match next_msg(ws).await {
            Some(Message::Close(Some(frame))) => return frame.code.into(),
            Some(Message::Close(None)) => panic!("close without a code"),
            Some(_) => continue,
            None => panic!("connection ended without a close frame"),
        }
    }
}

/// Collect `shell_output` data until it contains `needle`.
async fn read_output_until(ws: &mut WsStream, needle: &str) -> String {
    let mut out = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        match next_msg(ws).await {
            Some(Message::Text(text)) => {
                let v: Value = serde_json::from_str(text.as_str()).unwrap();
                if v["type"] == "shell_output" {
                    out.push_str(v["data"].as_str().unwrap());
                    if out.contains(needle) {
                        return out;
                    }
                }
            }
            Some(_) => continue,
            None => break,
        }
    }
    panic!("never saw {needle:?} in output: {out:?}");
}

async fn send_input(ws: &mut WsStream, data: &str) {
    let frame = serde_json::json!({"type": "shell_input", "data": data});
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .expect("send input");
}

// ===========================================================================
// Round trip
// ===========================================================================

#[tokio::test]
async fn echo_hi_round_trip() {
    let server = start_test_server().await;
    let client = reqwest::Client::new();
    let (session_id, shell_id) = create_shell(&client, &server.base).await;

    let mut ws = connect(&server.base, &shell_id).await;
    let hello = expect_connected(&mut ws).await;
    assert_eq!(hello["shell_id"], shell_id.as_str());
    assert_eq!(hello["session_id"], session_id.as_str());

    send_input(&mut ws, "echo hi\n").await;
    // The command echo is "echo hi"; the output line is "hi" on its own.
    read_output_until(&mut ws, "\r\nhi\r\n").await;
}

#[tokio::test]
async fn raw_text_is_forwarded_as_input() {
    let server = start_test_server().await;
    let client = reqwest::Client::new();
    let (_, shell_id) = create_shell(&client, &server.base).await;

    let mut ws = connect(&server.base, &shell_id).await;
    expect_connected(&mut ws).await;

    ws.send(Message::Text("echo $((40+2))\n".to_string().into())).await.unwrap();
    read_output_until(&mut ws, "42").await;
}

#[tokio::test]
async fn resize_reaches_the_pty() {
    let server = start_test_server().await;
    let client = reqwest::Client::new();
    let (_, shell_id) = create_shell(&client, &server.base).await;

    let mut ws = connect(&server.base, &shell_id).await;
    expect_connected(&mut ws).await;

    let resize = serde_json::json!({"type": "shell_resize", "rows": 33, "cols": 101});
    ws.send(Message::Text(resize.to_string().into())).await.unwrap();
    send_input(&mut ws, "stty size\n").await;
    read_output_until(&mut ws, "33 101").await;
}

// ===========================================================================
// Exclusive ownership
// ===========================================================================

#[tokio::test]
async fn second_connection_supersedes_first() {
    let server = start_test_server().await;
    let client = reqwest::Client::new();
    let (_, shell_id) = create_shell(&client, &server.base).await;

    let mut first = connect(&server.base, &shell_id).await;
    expect_connected(&mut first).await;

    let mut second = connect(&server.base, &shell_id).await;
    assert_eq!(expect_close(&mut first).await, 1000);
    expect_connected(&mut second).await;

    send_input(&mut second, "echo $((6*7))\n").await;
    read_output_until(&mut second, "42").await;
}

// ===========================================================================
// Close codes
// ===========================================================================

#[tokio::test]
async fn unknown_shell_closes_with_4404() {
    let server = start_test_server().await;
    let mut ws = connect(&server.base, "no-such-shell").await;
    assert_eq!(expect_close(&mut ws).await, 4404);
}

#[tokio::test]
async fn exiting_shell_closes_with_4404_and_is_removed() {
    let server = start_test_server().await;
    let client = reqwest::Client::new();
    let (session_id, shell_id) = create_shell(&client, &server.base).await;

    let mut ws = connect(&server.base, &shell_id).await;
    expect_connected(&mut ws).await;
    send_input(&mut ws, "exit\n").await;

    assert_eq!(expect_close(&mut ws).await, 4404);
    assert!(server.state.manager.shells().get(&shell_id).is_none());
    let shells: Vec<Value> = client
        .get(format!("{}/api/sessions/{session_id}/shells", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(shells.is_empty());
}

#[tokio::test]
async fn killed_shell_process_closes_with_4404() {
    let server = start_test_server().await;
    let client = reqwest::Client::new();
    let (_, shell_id) = create_shell(&client, &server.base).await;

    let mut ws = connect(&server.base, &shell_id).await;
    expect_connected(&mut ws).await;

    let pid = server
        .state
        .manager
        .shells()
        .get(&shell_id)
        .and_then(|s| s.pid())
        .expect("shell pid");
    // SAFETY: killing the shell this test spawned.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }

    assert_eq!(expect_close(&mut ws).await, 4404);
    assert!(server.state.manager.shells().get(&shell_id).is_none());
}

#[tokio::test]
async fn closing_shell_via_api_closes_bridge() {
    let server = start_test_server().await;
    let client = reqwest::Client::new();
    let (_, shell_id) = create_shell(&client, &server.base).await;

    let mut ws = connect(&server.base, &shell_id).await;
    expect_connected(&mut ws).await;

    let resp = client
        .delete(format!("{}/api/shells/{shell_id}", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(expect_close(&mut ws).await, 4404);

    // Closing again is fine.
    let resp = client
        .delete(format!("{}/api/shells/{shell_id}", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn deleting_session_closes_bridge() {
    let server = start_test_server().await;
    let client = reqwest::Client::new();
    let (session_id, shell_id) = create_shell(&client, &server.base).await;

    let mut ws = connect(&server.base, &shell_id).await;
    expect_connected(&mut ws).await;

    let resp = client
        .delete(format!("{}/api/sessions/{session_id}", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(expect_close(&mut ws).await, 4404);
}

#[tokio::test]
async fn idle_connection_closes_with_4000() {
    let server = start_test_server_with(|c| c.terminal.idle_timeout_secs = 1).await;
    let client = reqwest::Client::new();
    let (_, shell_id) = create_shell(&client, &server.base).await;

    let mut ws = connect(&server.base, &shell_id).await;
    expect_connected(&mut ws).await;

    assert_eq!(expect_close(&mut ws).await, 4000);

    // The shell survives an idle disconnect and can be reattached.
    let mut again = connect(&server.base, &shell_id).await;
    expect_connected(&mut again).await;
}
