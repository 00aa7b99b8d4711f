use cg_runtime::{
    ContainerHandle, ContainerRuntime, ContainerState, ExecOptions, LocalRuntime, RuntimeError,
};

#[tokio::test]
async fn start_creates_workspace_and_runs() {
    let dir = tempfile::tempdir().unwrap();
    let ws = dir.path().join("session_abc");
    let rt = LocalRuntime::default();

    let handle = rt.start("crogia-abc", "any:latest", &ws).await.unwrap();
    assert!(ws.is_dir());
    assert_eq!(rt.inspect(&handle).await.unwrap(), ContainerState::Running);
    assert_eq!(rt.running_count(), 1);
}

#[tokio::test]
async fn empty_image_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let rt = LocalRuntime::default();
    let err = rt.start("x", "", dir.path()).await.unwrap_err();
    assert!(matches!(err, RuntimeError::ImageNotFound(_)));
}

#[tokio::test]
async fn stop_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let rt = LocalRuntime::default();
    let handle = rt.start("x", "img", dir.path()).await.unwrap();

    rt.stop(&handle).await.unwrap();
    rt.stop(&handle).await.unwrap();
    assert_eq!(rt.inspect(&handle).await.unwrap(), ContainerState::Exited);

    let ghost = ContainerHandle::new("local-missing");
    rt.stop(&ghost).await.unwrap();
    assert_eq!(rt.inspect(&ghost).await.unwrap(), ContainerState::Missing);
}

#[tokio::test]
async fn exec_captures_interleaved_output_and_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let rt = LocalRuntime::default();
    let handle = rt.start("x", "img", dir.path()).await.unwrap();

    let out = rt
        .exec(&handle, "echo out; echo err >&2; exit 3", &ExecOptions::default())
        .await
        .unwrap();
    assert_eq!(out.exit_code, 3);
    assert_eq!(out.output, "out\nerr\n");
}

#[tokio::test]
async fn exec_runs_in_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let rt = LocalRuntime::default();
    let handle = rt.start("x", "img", dir.path()).await.unwrap();

    rt.exec(&handle, "echo hi > marker.txt", &ExecOptions::tty())
        .await
        .unwrap();
    let marker = std::fs::read_to_string(dir.path().join("marker.txt")).unwrap();
    assert_eq!(marker.trim(), "hi");
}

#[tokio::test]
async fn exec_on_stopped_container_is_missing() {
    let dir = tempfile::tempdir().unwrap();
    let rt = LocalRuntime::default();
    let handle = rt.start("x", "img", dir.path()).await.unwrap();
    rt.stop(&handle).await.unwrap();

    let err = rt
        .exec(&handle, "true", &ExecOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::ContainerMissing(_)));
}

#[tokio::test]
async fn forget_simulates_vanished_container() {
    let dir = tempfile::tempdir().unwrap();
    let rt = LocalRuntime::default();
    let handle = rt.start("x", "img", dir.path()).await.unwrap();
    assert!(rt.forget(&handle));
    assert_eq!(rt.inspect(&handle).await.unwrap(), ContainerState::Missing);
}

#[tokio::test]
async fn shell_command_targets_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let rt = LocalRuntime::new("/bin/bash");
    let handle = rt.start("x", "img", dir.path()).await.unwrap();
    let spec = rt.shell_command(&handle, dir.path());
    assert_eq!(spec.program, "/bin/bash");
    assert_eq!(spec.cwd.as_deref(), Some(dir.path()));
}
