use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use cg_core::config::Config;
use cg_core::session_store::SessionStore;
use cg_core::shutdown::{ShutdownGuard, ShutdownSignal};
use cg_core::types::{ContainerState, ConversationTurn, Session, SessionStatus, SessionSummary};
use cg_runtime::{ContainerHandle, ContainerRuntime, ExecOptions, ExecOutput};

use crate::error::{Result, SessionError};
use crate::executor::{TaskContext, TaskEvent, TaskExecutor};
use crate::files::WorkspaceFiles;
use crate::process::ProcessManager;
use crate::pty::ShellInfo;
use crate::shells::ShellRegistry;

/// Outcome of one janitor pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub deleted: usize,
    pub reaped_shells: usize,
    /// True when another sweep held the lock and this one did nothing.
    pub skipped: bool,
}

/// Owns every session: its record, its container and its shells.
///
/// Lifecycle per session is `active -> stopping -> deleted`. Lookups
/// re-validate the container and purge sessions whose container is gone.
pub struct SessionManager {
    config: Config,
    store: SessionStore,
    runtime: Arc<dyn ContainerRuntime>,
    shells: ShellRegistry,
    processes: ProcessManager,
    sweep_lock: tokio::sync::Mutex<()>,
}

impl SessionManager {
    /// Open the session index under `sessions.base_dir`.
    pub fn new(config: Config, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        let store = SessionStore::open(config.sessions.base_dir_path())?;
        Ok(Self {
            shells: ShellRegistry::new(config.terminal.clone()),
            processes: ProcessManager::new(Arc::clone(&runtime)),
            config,
            store,
            runtime,
            sweep_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn shells(&self) -> &ShellRegistry {
        &self.shells
    }

    pub fn processes(&self) -> &ProcessManager {
        &self.processes
    }

    fn workspace_for(&self, id: &str) -> PathBuf {
        self.config
            .sessions
            .base_dir_path()
            .join(format!("session_{id}"))
    }

    fn handle(session: &Session) -> ContainerHandle {
        ContainerHandle::new(session.container_id.clone())
    }

    // -- boot ---------------------------------------------------------------

    /// Drop index entries whose container is no longer running. Entries whose
    /// state cannot be determined are kept. Returns the number dropped.
    pub async fn reconcile(&self) -> Result<usize> {
        let mut stale = HashSet::new();
        for session in self.store.list() {
            match self.runtime.inspect(&Self::handle(&session)).await {
                Ok(ContainerState::Running) => {}
                Ok(state) => {
                    info!(session_id = %session.id, %state, "dropping session with dead container");
                    stale.insert(session.id.clone());
                }
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "could not inspect container, keeping session");
                }
            }
        }
        let dropped = self.store.retain(|s| !stale.contains(&s.id))?;
        info!(kept = self.store.len(), dropped = dropped.len(), "session index reconciled");
        Ok(dropped.len())
    }

    // -- lifecycle ----------------------------------------------------------

    /// Provision a workspace and container for a new session. Nothing is
    /// recorded unless the container started.
    pub async fn create(&self, task: &str) -> Result<Session> {
        let id = Session::new_id();
        let workspace = self.workspace_for(&id);
        tokio::fs::create_dir_all(&workspace)
            .await
            .map_err(|e| SessionError::Provisioning(format!("{}: {e}", workspace.display())))?;

        let handle = self
            .runtime
            .start(&format!("crogia-{id}"), &self.config.runtime.image, &workspace)
            .await
            .map_err(|e| {
                error!(session_id = %id, error = %e, "container start failed");
                SessionError::from(e)
            })?;

        let session = Session::new(id.clone(), handle.id.clone(), workspace, task);
        if let Err(e) = self.store.insert(session.clone()) {
            warn!(session_id = %id, "could not persist session, stopping container");
            let _ = self.runtime.stop(&handle).await;
            return Err(e.into());
        }
        info!(session_id = %id, container_id = %handle.id, "session created");
        Ok(session)
    }

    /// Fetch a session, purging it if its container is not running.
    pub async fn get(&self, id: &str) -> Result<Session> {
        let session = self
            .store
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        match self.runtime.inspect(&Self::handle(&session)).await? {
            ContainerState::Running => Ok(session),
            state => {
                warn!(session_id = %id, %state, "container not running, purging session");
                self.purge(&session).await;
                Err(SessionError::NotFound(id.to_string()))
            }
        }
    }

    async fn purge(&self, session: &Session) {
        self.shells.close_all(&session.id).await;
        if let Err(e) = self.runtime.stop(&Self::handle(session)).await {
            warn!(session_id = %session.id, error = %e, "stop during purge failed");
        }
        if let Err(e) = self.store.remove(&session.id) {
            warn!(session_id = %session.id, error = %e, "could not remove purged session");
        }
    }

    /// Close the session's shells, stop its container, forget it. A container
    /// that is already gone is not an error. If the stop itself fails the
    /// record stays in `stopping` so a later delete or sweep can finish it.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let session = self
            .store
            .update(id, |s| s.status = SessionStatus::Stopping)?
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        self.shells.close_all(id).await;
        self.runtime.stop(&Self::handle(&session)).await?;
        self.store.remove(id)?;
        info!(session_id = %id, "session deleted");
        Ok(())
    }

    /// All sessions with live container status attached.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let mut out = Vec::new();
        for session in self.store.list() {
            let state = match self.runtime.inspect(&Self::handle(&session)).await {
                Ok(state) => state,
                Err(e) => {
                    debug!(session_id = %session.id, error = %e, "inspect failed");
                    ContainerState::Missing
                }
            };
            out.push(SessionSummary::from_session(&session, state));
        }
        out
    }

    pub fn touch(&self, id: &str) -> Result<()> {
        self.store
            .update(id, |s| s.touch())?
            .map(|_| ())
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Append the turns of a finished task and mark the session active now.
    pub fn record_task(&self, id: &str, task: &str, turns: Vec<ConversationTurn>) -> Result<Session> {
        self.store
            .update(id, |s| {
                s.conversation_history.extend(turns);
                s.last_task = task.to_string();
                s.touch();
            })?
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Run `task` through `executor`, streaming progress to `events` and
    /// persisting the resulting turns.
    pub async fn run_task(
        &self,
        id: &str,
        task: &str,
        executor: &dyn TaskExecutor,
        events: flume::Sender<TaskEvent>,
    ) -> Result<()> {
        let session = match self.get(id).await {
            Ok(s) => s,
            Err(e) => {
                let _ = events.send(TaskEvent::Error {
                    message: e.to_string(),
                });
                return Err(e);
            }
        };
        let _ = events.send(TaskEvent::TaskStarted {
            session_id: id.to_string(),
            task: task.to_string(),
        });
        self.touch(id)?;

        let ctx = TaskContext {
            session,
            runtime: Arc::clone(&self.runtime),
        };
        match executor.execute(&ctx, task, &events).await {
            Ok(turns) => {
                self.record_task(id, task, turns)?;
                let _ = events.send(TaskEvent::TaskCompleted {
                    session_id: id.to_string(),
                    task: task.to_string(),
                });
                info!(session_id = %id, executor = executor.name(), "task completed");
                Ok(())
            }
            Err(e) => {
                error!(session_id = %id, error = %e, "task failed");
                let _ = events.send(TaskEvent::Error {
                    message: format!("Task execution failed: {e}"),
                });
                Err(e)
            }
        }
    }

    /// Run a command to completion in the session container.
    pub async fn exec(&self, id: &str, cmd: &str, tty: bool) -> Result<ExecOutput> {
        let session = self.get(id).await?;
        let opts = ExecOptions {
            tty,
            workdir: None,
        };
        let out = self.runtime.exec(&Self::handle(&session), cmd, &opts).await?;
        self.touch(id)?;
        Ok(out)
    }

    // -- shells -------------------------------------------------------------

    /// Open a new interactive shell in an active session's container.
    pub async fn create_shell(&self, session_id: &str) -> Result<ShellInfo> {
        let session = self.get(session_id).await?;
        if session.status != SessionStatus::Active {
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        let spec = self
            .runtime
            .shell_command(&Self::handle(&session), &session.workspace);
        let shell = self.shells.spawn(session_id, &spec)?;

        // A delete may have started while we were inspecting the container.
        // Its close_all only sees shells registered before it ran, so re-check
        // now that this one is registered.
        let still_active = self
            .store
            .get(session_id)
            .is_some_and(|s| s.status == SessionStatus::Active);
        if !still_active {
            warn!(%session_id, shell_id = %shell.shell_id(), "session went away during shell creation");
            self.shells.close_shell(shell.shell_id()).await;
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        info!(%session_id, shell_id = %shell.shell_id(), "shell created");
        Ok(shell.info())
    }

    /// File access confined to a live session's workspace.
    pub async fn files(&self, id: &str) -> Result<WorkspaceFiles> {
        let session = self.get(id).await?;
        WorkspaceFiles::open(&session.workspace)
    }

    pub fn list_shells(&self, session_id: &str) -> Result<Vec<ShellInfo>> {
        if !self.store.contains(session_id) {
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        Ok(self.shells.list_shells(session_id))
    }

    /// Close a shell. Closing an unknown or already-closed shell succeeds.
    pub async fn close_shell(&self, shell_id: &str) {
        self.shells.close_shell(shell_id).await;
    }

    // -- janitor ------------------------------------------------------------

    /// Delete every session idle for longer than `sessions.idle_timeout_secs`
    /// and reap dead shells. Concurrent calls do not overlap: a sweep that
    /// finds another in progress returns immediately.
    pub async fn sweep_idle(&self) -> SweepReport {
        let Ok(_guard) = self.sweep_lock.try_lock() else {
            debug!("sweep already in progress, skipping");
            return SweepReport {
                skipped: true,
                ..Default::default()
            };
        };

        let threshold =
            chrono::Duration::seconds(self.config.sessions.idle_timeout_secs.min(u32::MAX as u64) as i64);
        let now = Utc::now();
        let mut report = SweepReport::default();

        for session in self.store.list() {
            if session.idle_for(now) <= threshold {
                continue;
            }
            info!(session_id = %session.id, idle_secs = session.idle_for(now).num_seconds(), "idle session, deleting");
            match self.delete(&session.id).await {
                Ok(()) => report.deleted += 1,
                // Deleted by someone else since we listed.
                Err(e) if e.is_not_found() => report.deleted += 1,
                Err(e) => warn!(session_id = %session.id, error = %e, "idle delete failed"),
            }
        }

        report.reaped_shells = self.shells.reap_dead().await;
        if report.deleted > 0 || report.reaped_shells > 0 {
            info!(deleted = report.deleted, reaped_shells = report.reaped_shells, "sweep complete");
        }
        report
    }

    /// Run [`Self::sweep_idle`] every `sessions.sweep_interval_secs` until
    /// shutdown is triggered.
    pub fn spawn_janitor(self: &Arc<Self>, shutdown: ShutdownSignal) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = manager.config.sessions.sweep_interval();
        tokio::spawn(async move {
            let _guard = ShutdownGuard::new(shutdown.clone());
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_secs = period.as_secs(), "session janitor started");
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = interval.tick() => {
                        manager.sweep_idle().await;
                    }
                }
            }
            info!("session janitor stopped");
        })
    }

    /// Close every open shell, giving each session at most `grace`.
    /// Containers keep running so sessions survive a daemon restart.
    pub async fn close_all_shells(&self, grace: Duration) {
        for session in self.store.list() {
            let _ = tokio::time::timeout(grace, self.shells.close_all(&session.id)).await;
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("runtime", &self.runtime.name())
            .field("sessions", &self.store.len())
            .field("shells", &self.shells.count())
            .finish()
    }
}
