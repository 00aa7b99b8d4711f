use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};

use cg_core::config::Config;
use cg_core::types::{ContainerState, SessionStatus};
use cg_runtime::{
    CommandSpec, ContainerHandle, ContainerRuntime, ExecOptions, ExecOutput, LocalRuntime,
};
use cg_session::executor::{NoopExecutor, TaskEvent};
use cg_session::pty::ShellStatus;
use cg_session::{SessionError, SessionManager};

fn config(base: &std::path::Path) -> Config {
    let mut cfg = Config::default();
    cfg.runtime.kind = "local".into();
    cfg.runtime.shell = "/bin/sh".into();
    cfg.sessions.base_dir = base.to_string_lossy().into_owned();
    cfg.sessions.idle_timeout_secs = 60;
    cfg.terminal.close_grace_ms = 200;
    cfg.terminal.supersede_wait_ms = 200;
    cfg
}

fn manager(base: &std::path::Path) -> (Arc<SessionManager>, Arc<LocalRuntime>) {
    let runtime = Arc::new(LocalRuntime::new("/bin/sh"));
    let mgr = SessionManager::new(config(base), runtime.clone() as Arc<dyn ContainerRuntime>)
        .expect("manager");
    (Arc::new(mgr), runtime)
}

#[tokio::test]
async fn create_then_get() {
    let dir = tempfile::tempdir().unwrap();
    let (mgr, _rt) = manager(dir.path());

    let session = mgr.create("noop").await.unwrap();
    assert_eq!(session.id.len(), 8);
    assert_eq!(session.status, SessionStatus::Active);
    assert!(session.workspace.ends_with(format!("session_{}", session.id)));
    assert!(session.workspace.is_dir());

    let fetched = mgr.get(&session.id).await.unwrap();
    assert_eq!(fetched.container_id, session.container_id);
    assert!(dir.path().join("active_sessions.json").exists());
}

#[tokio::test]
async fn delete_then_get_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let (mgr, rt) = manager(dir.path());
    let session = mgr.create("noop").await.unwrap();
    let handle = ContainerHandle::new(session.container_id.clone());

    mgr.delete(&session.id).await.unwrap();

    let err = mgr.get(&session.id).await.unwrap_err();
    assert!(matches!(err, SessionError::NotFound(_)));
    let state = rt.inspect(&handle).await.unwrap();
    assert_ne!(state, ContainerState::Running);

    // A second delete reports the session as gone.
    assert!(mgr.delete(&session.id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn delete_succeeds_when_container_already_gone() {
    let dir = tempfile::tempdir().unwrap();
    let (mgr, rt) = manager(dir.path());
    let session = mgr.create("noop").await.unwrap();
    rt.forget(&ContainerHandle::new(session.container_id.clone()));

    mgr.delete(&session.id).await.unwrap();
    assert!(mgr.store().get(&session.id).is_none());
}

#[tokio::test]
async fn get_purges_session_with_vanished_container() {
    let dir = tempfile::tempdir().unwrap();
    let (mgr, rt) = manager(dir.path());
    let session = mgr.create("noop").await.unwrap();
    rt.forget(&ContainerHandle::new(session.container_id.clone()));

    assert!(mgr.get(&session.id).await.unwrap_err().is_not_found());
    assert!(mgr.store().get(&session.id).is_none());
}

#[tokio::test]
async fn failed_provisioning_persists_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.runtime.image = String::new();
    let mgr = SessionManager::new(cfg, Arc::new(LocalRuntime::default())).unwrap();

    let err = mgr.create("noop").await.unwrap_err();
    assert!(matches!(err, SessionError::Provisioning(_)));
    assert!(mgr.store().is_empty());
}

#[tokio::test]
async fn list_reports_container_status() {
    let dir = tempfile::tempdir().unwrap();
    let (mgr, rt) = manager(dir.path());
    let a = mgr.create("a").await.unwrap();
    let b = mgr.create("b").await.unwrap();
    rt.stop(&ContainerHandle::new(b.container_id.clone()))
        .await
        .unwrap();

    let list = mgr.list().await;
    assert_eq!(list.len(), 2);
    let status = |id: &str| list.iter().find(|s| s.id == id).unwrap().container_status;
    assert_eq!(status(&a.id), ContainerState::Running);
    assert_eq!(status(&b.id), ContainerState::Exited);
}

#[tokio::test]
async fn idle_sweep_deletes_only_stale_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let (mgr, _rt) = manager(dir.path());
    let stale = mgr.create("old").await.unwrap();
    let fresh = mgr.create("new").await.unwrap();

    mgr.store()
        .update(&stale.id, |s| {
            s.last_activity_at = chrono::Utc::now() - chrono::Duration::seconds(3600)
        })
        .unwrap();
    mgr.touch(&fresh.id).unwrap();

    let report = mgr.sweep_idle().await;
    assert_eq!(report.deleted, 1);
    assert!(!report.skipped);
    assert!(mgr.get(&stale.id).await.unwrap_err().is_not_found());
    assert!(mgr.get(&fresh.id).await.is_ok());
}

#[tokio::test]
async fn closing_session_closes_its_shells() {
    let dir = tempfile::tempdir().unwrap();
    let (mgr, rt) = manager(dir.path());
    let session = mgr.create("noop").await.unwrap();

    let s1 = mgr.create_shell(&session.id).await.unwrap();
    let s2 = mgr.create_shell(&session.id).await.unwrap();
    assert_eq!(mgr.list_shells(&session.id).unwrap().len(), 2);
    let shell1 = mgr.shells().get(&s1.shell_id).unwrap();
    let shell2 = mgr.shells().get(&s2.shell_id).unwrap();

    mgr.delete(&session.id).await.unwrap();

    assert_eq!(shell1.status(), ShellStatus::Dead);
    assert_eq!(shell2.status(), ShellStatus::Dead);
    assert!(mgr.shells().get(&s1.shell_id).is_none());
    assert_eq!(mgr.shells().count(), 0);
    let state = rt
        .inspect(&ContainerHandle::new(session.container_id.clone()))
        .await
        .unwrap();
    assert_eq!(state, ContainerState::Exited);
}

#[tokio::test]
async fn create_shell_requires_live_session() {
    let dir = tempfile::tempdir().unwrap();
    let (mgr, _rt) = manager(dir.path());
    assert!(mgr.create_shell("missing1").await.unwrap_err().is_not_found());
    assert!(mgr.list_shells("missing1").unwrap_err().is_not_found());
}

#[tokio::test]
async fn reconcile_drops_sessions_without_containers() {
    let dir = tempfile::tempdir().unwrap();
    let (mgr, rt) = manager(dir.path());
    let keep = mgr.create("keep").await.unwrap();
    let lost = mgr.create("lost").await.unwrap();
    rt.forget(&ContainerHandle::new(lost.container_id.clone()));
    drop(mgr);

    // Same runtime, fresh manager reading the index from disk.
    let mgr = SessionManager::new(config(dir.path()), rt.clone()).unwrap();
    assert_eq!(mgr.store().len(), 2);
    assert_eq!(mgr.reconcile().await.unwrap(), 1);
    assert!(mgr.store().contains(&keep.id));
    assert!(!mgr.store().contains(&lost.id));
}

#[tokio::test]
async fn run_task_streams_events_and_records_history() {
    let dir = tempfile::tempdir().unwrap();
    let (mgr, _rt) = manager(dir.path());
    let session = mgr.create("noop").await.unwrap();
    let (tx, rx) = flume::unbounded();

    mgr.run_task(&session.id, "noop", &NoopExecutor, tx)
        .await
        .unwrap();

    let events: Vec<TaskEvent> = rx.drain().collect();
    assert!(matches!(events.first(), Some(TaskEvent::TaskStarted { .. })));
    assert!(matches!(events.last(), Some(TaskEvent::TaskCompleted { .. })));

    let updated = mgr.get(&session.id).await.unwrap();
    assert_eq!(updated.conversation_history.len(), 2);
    assert_eq!(updated.last_task, "noop");
}

#[tokio::test]
async fn run_task_on_missing_session_reports_error_event() {
    let dir = tempfile::tempdir().unwrap();
    let (mgr, _rt) = manager(dir.path());
    let (tx, rx) = flume::unbounded();

    assert!(mgr.run_task("nope", "x", &NoopExecutor, tx).await.is_err());
    assert!(matches!(rx.try_recv().unwrap(), TaskEvent::Error { .. }));
}

#[tokio::test]
async fn exec_runs_in_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let (mgr, _rt) = manager(dir.path());
    let session = mgr.create("noop").await.unwrap();

    let out = mgr.exec(&session.id, "pwd", false).await.unwrap();
    assert!(out.success());
    assert!(out.output.trim().ends_with(&format!("session_{}", session.id)));
}

#[tokio::test]
async fn janitor_stops_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let (mgr, _rt) = manager(dir.path());
    let shutdown = cg_core::shutdown::ShutdownSignal::new();
    let handle = mgr.spawn_janitor(shutdown.clone());

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("janitor should exit")
        .unwrap();
}

#[tokio::test]
async fn failed_index_write_leaves_no_session() {
    let dir = tempfile::tempdir().unwrap();
    let (mgr, _rt) = manager(dir.path());

    // A non-empty directory where the index belongs makes every write fail.
    let index = dir.path().join("active_sessions.json");
    let _ = std::fs::remove_file(&index);
    std::fs::create_dir(&index).unwrap();
    std::fs::write(index.join("occupied"), b"x").unwrap();

    assert!(mgr.create("noop").await.is_err());
    assert!(mgr.store().is_empty());
    assert!(mgr.list().await.is_empty());
}

async fn wait_for_no_shells(mgr: &SessionManager, session_id: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let listed = mgr.list_shells(session_id).unwrap();
        if listed.is_empty() && mgr.shells().count() == 0 {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "shell still registered: {listed:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn killed_unbound_shell_leaves_list() {
    let dir = tempfile::tempdir().unwrap();
    let (mgr, _rt) = manager(dir.path());
    let session = mgr.create("noop").await.unwrap();
    let info = mgr.create_shell(&session.id).await.unwrap();
    let shell = mgr.shells().get(&info.shell_id).unwrap();
    let pid = shell.pid().expect("pid");
    drop(shell);

    // SAFETY: signalling the shell this test just spawned.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }

    wait_for_no_shells(&mgr, &session.id).await;
    assert!(mgr.shells().get(&info.shell_id).is_none());
}

/// Wraps [`LocalRuntime`] and, once armed, holds the next `inspect` open
/// until the test releases it.
struct GatedRuntime {
    inner: LocalRuntime,
    armed: AtomicBool,
    entered: Notify,
    release: Semaphore,
}

impl GatedRuntime {
    fn new() -> Self {
        Self {
            inner: LocalRuntime::new("/bin/sh"),
            armed: AtomicBool::new(false),
            entered: Notify::new(),
            release: Semaphore::new(0),
        }
    }
}

#[async_trait]
impl ContainerRuntime for GatedRuntime {
    fn name(&self) -> &'static str {
        "gated"
    }

    async fn ping(&self) -> cg_runtime::Result<()> {
        self.inner.ping().await
    }

    async fn start(
        &self,
        name: &str,
        image: &str,
        workspace: &Path,
    ) -> cg_runtime::Result<ContainerHandle> {
        self.inner.start(name, image, workspace).await
    }

    async fn stop(&self, handle: &ContainerHandle) -> cg_runtime::Result<()> {
        self.inner.stop(handle).await
    }

    async fn inspect(&self, handle: &ContainerHandle) -> cg_runtime::Result<ContainerState> {
        let state = self.inner.inspect(handle).await?;
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            let _permit = self.release.acquire().await;
        }
        Ok(state)
    }

    async fn exec(
        &self,
        handle: &ContainerHandle,
        command: &str,
        opts: &ExecOptions,
    ) -> cg_runtime::Result<ExecOutput> {
        self.inner.exec(handle, command, opts).await
    }

    fn shell_command(&self, handle: &ContainerHandle, workspace: &Path) -> CommandSpec {
        self.inner.shell_command(handle, workspace)
    }
}

#[tokio::test]
async fn delete_during_create_shell_leaves_no_shell() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(GatedRuntime::new());
    let mgr = Arc::new(
        SessionManager::new(
            config(dir.path()),
            runtime.clone() as Arc<dyn ContainerRuntime>,
        )
        .expect("manager"),
    );
    let session = mgr.create("noop").await.unwrap();

    runtime.armed.store(true, Ordering::SeqCst);
    let creating = {
        let mgr = Arc::clone(&mgr);
        let id = session.id.clone();
        tokio::spawn(async move { mgr.create_shell(&id).await })
    };
    // create_shell has seen a running container; now delete the session.
    runtime.entered.notified().await;
    mgr.delete(&session.id).await.unwrap();
    runtime.release.add_permits(1);

    let err = creating.await.unwrap().unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(mgr.shells().count(), 0);
    assert!(mgr.shells().list_shells(&session.id).is_empty());
}
