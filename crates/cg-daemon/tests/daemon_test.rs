use std::sync::Arc;
use std::time::Duration;

use cg_core::config::Config;
use cg_daemon::daemon::Daemon;
use serde_json::Value;

fn local_config(base: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.runtime.kind = "local".into();
    config.runtime.shell = "/bin/sh".into();
    config.sessions.base_dir = base.to_string_lossy().into_owned();
    config.terminal.close_grace_ms = 200;
    config
}

/// Start a daemon on an ephemeral port; returns its base URL and the
/// handle of the serving task.
async fn start_daemon(
    daemon: Arc<Daemon>,
) -> (String, tokio::task::JoinHandle<anyhow::Result<()>>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind to ephemeral port");
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move { daemon.run_with_listener(listener).await });
    (format!("http://{addr}"), handle)
}

#[tokio::test]
async fn serves_api_and_stops_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Arc::new(Daemon::new(local_config(dir.path())).expect("daemon"));
    let (base, handle) = start_daemon(Arc::clone(&daemon)).await;
    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("{base}/api/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["runtime"], "local");

    daemon.shutdown();
    let result = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("daemon did not stop")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn shutdown_closes_shells_but_keeps_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Arc::new(Daemon::new(local_config(dir.path())).expect("daemon"));
    let (base, handle) = start_daemon(Arc::clone(&daemon)).await;
    let client = reqwest::Client::new();

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
    assert_eq!(daemon.manager().shells().count(), 1);

    daemon.shutdown();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("daemon did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(daemon.manager().shells().count(), 0);

    // A fresh daemon on the same base dir picks the session back up.
    let restarted = Daemon::new(local_config(dir.path())).expect("daemon");
    assert!(restarted.manager().store().contains(&session_id));
}

#[test]
fn unknown_executor_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = local_config(dir.path());
    config.general.executor = "llm".into();
    let err = Daemon::new(config).unwrap_err();
    assert!(err.to_string().contains("llm"));
}
