use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use tracing::{debug, info, warn};
use uuid::Uuid;

use cg_core::config::TerminalConfig;
use cg_runtime::CommandSpec;

use crate::error::Result;
use crate::lock_or_recover;
use crate::pty::{ShellInfo, ShellSession};

/// How often a shell's process is checked for an exit nobody has noticed.
const EXIT_WATCH_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Default)]
struct Inner {
    shells: HashMap<String, Arc<ShellSession>>,
    by_session: HashMap<String, HashSet<String>>,
}

impl Inner {
    fn remove(&mut self, shell_id: &str) -> Option<Arc<ShellSession>> {
        let shell = self.shells.remove(shell_id)?;
        if let Some(ids) = self.by_session.get_mut(shell.session_id()) {
            ids.remove(shell_id);
            if ids.is_empty() {
                self.by_session.remove(shell.session_id());
            }
        }
        Some(shell)
    }
}

/// `shell_id -> ShellSession`, cross-indexed by session id.
///
/// Both maps sit behind one mutex that is never held across an await; shells
/// are taken out of the registry first and closed afterwards.
///
/// Every spawned shell gets a watcher task. When the process exits while no
/// connection is bound, the watcher removes and releases it; a bound bridge
/// sees the EOF itself and does the same.
pub struct ShellRegistry {
    inner: Arc<Mutex<Inner>>,
    terminal: TerminalConfig,
}

impl ShellRegistry {
    pub fn new(terminal: TerminalConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            terminal,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock_or_recover(self.inner.as_ref(), "shell registry")
    }

    /// Spawn `spec` on a new PTY and register it under `session_id`.
    pub fn spawn(&self, session_id: &str, spec: &CommandSpec) -> Result<Arc<ShellSession>> {
        let shell_id = Uuid::new_v4().to_string();
        let shell = ShellSession::open(
            shell_id.clone(),
            session_id,
            spec,
            self.terminal.rows,
            self.terminal.cols,
        )?;

        {
            let mut inner = self.lock();
            inner.shells.insert(shell_id.clone(), Arc::clone(&shell));
            inner
                .by_session
                .entry(session_id.to_string())
                .or_default()
                .insert(shell_id);
        }
        self.watch_exit(&shell);
        Ok(shell)
    }

    fn watch_exit(&self, shell: &Arc<ShellSession>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(shell_id = %shell.shell_id(), "no runtime, shell exit will be found by the sweep");
            return;
        };
        let registry = Arc::downgrade(&self.inner);
        let watched = Arc::downgrade(shell);
        let terminal = self.terminal.clone();
        runtime.spawn(async move {
            let mut tick = tokio::time::interval(EXIT_WATCH_INTERVAL);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let Some(shell) = watched.upgrade() else { return };
                if shell.is_closed() {
                    return;
                }
                if shell.is_alive() || shell.bound_conn().is_some() {
                    continue;
                }
                release_exited(&registry, &shell, &terminal).await;
                return;
            }
        });
    }

    pub fn get(&self, shell_id: &str) -> Option<Arc<ShellSession>> {
        self.lock().shells.get(shell_id).cloned()
    }

    pub fn list_shells(&self, session_id: &str) -> Vec<ShellInfo> {
        let inner = self.lock();
        let mut shells: Vec<ShellInfo> = inner
            .by_session
            .get(session_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.shells.get(id))
            .filter(|s| !s.is_dead() && s.is_alive())
            .map(|s| s.info())
            .collect();
        shells.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        shells
    }

    pub fn count(&self) -> usize {
        self.lock().shells.len()
    }

    /// Drop a shell from the registry without touching its process. Used by
    /// a bridge that has already seen the shell die.
    pub fn remove(&self, shell_id: &str) -> Option<Arc<ShellSession>> {
        self.lock().remove(shell_id)
    }

    fn close_grace(&self) -> Duration {
        self.terminal.close_grace()
    }

    /// Detach any bound bridge, then close and forget the shell. Returns
    /// whether it was registered; closing an unknown shell is not an error.
    pub async fn close_shell(&self, shell_id: &str) -> bool {
        let Some(shell) = self.remove(shell_id) else {
            debug!(%shell_id, "close_shell: not registered");
            return false;
        };
        shell.detach(self.terminal.supersede_wait()).await;
        shell.close(self.close_grace()).await;
        info!(%shell_id, session_id = %shell.session_id(), "shell closed");
        true
    }

    /// Close every shell belonging to `session_id`. Bridges are joined before
    /// this returns so nothing touches the container afterwards.
    pub async fn close_all(&self, session_id: &str) -> usize {
        let shells: Vec<Arc<ShellSession>> = {
            let mut inner = self.lock();
            let ids = inner.by_session.remove(session_id).unwrap_or_default();
            ids.iter().filter_map(|id| inner.shells.remove(id)).collect()
        };
        let count = shells.len();
        for shell in shells {
            shell.detach(self.terminal.supersede_wait()).await;
            shell.close(self.close_grace()).await;
        }
        if count > 0 {
            info!(%session_id, count, "closed session shells");
        }
        count
    }

    /// Remove and release shells whose process has exited.
    pub async fn reap_dead(&self) -> usize {
        let dead: Vec<Arc<ShellSession>> = {
            let mut inner = self.lock();
            let ids: Vec<String> = inner
                .shells
                .values()
                .filter(|s| s.is_dead() || !s.is_alive())
                .map(|s| s.shell_id().to_string())
                .collect();
            ids.iter().filter_map(|id| inner.remove(id)).collect()
        };
        let count = dead.len();
        for shell in dead {
            warn!(shell_id = %shell.shell_id(), session_id = %shell.session_id(), "reaping dead shell");
            shell.detach(self.terminal.supersede_wait()).await;
            shell.close(self.close_grace()).await;
        }
        count
    }
}

async fn release_exited(
    registry: &Weak<Mutex<Inner>>,
    shell: &Arc<ShellSession>,
    terminal: &TerminalConfig,
) {
    if let Some(inner) = registry.upgrade() {
        let removed = lock_or_recover(inner.as_ref(), "shell registry").remove(shell.shell_id());
        if removed.is_some() {
            warn!(shell_id = %shell.shell_id(), session_id = %shell.session_id(), "shell process exited, removing");
        }
    }
    shell.detach(terminal.supersede_wait()).await;
    shell.close(terminal.close_grace()).await;
}

impl std::fmt::Debug for ShellRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellRegistry")
            .field("shells", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::ShellStatus;

    fn registry() -> ShellRegistry {
        ShellRegistry::new(TerminalConfig {
            close_grace_ms: 100,
            supersede_wait_ms: 100,
            ..Default::default()
        })
    }

    fn cat() -> CommandSpec {
        CommandSpec::new("/bin/cat")
    }

    #[tokio::test]
    async fn spawn_and_list_by_session() {
        let reg = registry();
        let a = reg.spawn("s1", &cat()).unwrap();
        let _b = reg.spawn("s1", &cat()).unwrap();
        let _c = reg.spawn("s2", &cat()).unwrap();

        assert_eq!(reg.count(), 3);
        assert_eq!(reg.list_shells("s1").len(), 2);
        assert_eq!(reg.list_shells("s2").len(), 1);
        assert!(reg.list_shells("nope").is_empty());
        assert!(reg.get(a.shell_id()).is_some());

        reg.close_all("s1").await;
        reg.close_all("s2").await;
    }

    #[tokio::test]
    async fn close_shell_is_idempotent() {
        let reg = registry();
        let shell = reg.spawn("s1", &cat()).unwrap();
        let id = shell.shell_id().to_string();

        assert!(reg.close_shell(&id).await);
        assert!(!reg.close_shell(&id).await);
        assert!(reg.get(&id).is_none());
        assert_eq!(shell.status(), ShellStatus::Dead);
        assert!(reg.list_shells("s1").is_empty());
    }

    #[tokio::test]
    async fn close_all_only_touches_one_session() {
        let reg = registry();
        let a = reg.spawn("s1", &cat()).unwrap();
        let b = reg.spawn("s1", &cat()).unwrap();
        let other = reg.spawn("s2", &cat()).unwrap();

        assert_eq!(reg.close_all("s1").await, 2);
        assert!(a.is_dead());
        assert!(b.is_dead());
        assert!(!other.is_dead());
        assert_eq!(reg.count(), 1);

        reg.close_all("s2").await;
    }

    async fn wait_until_gone(reg: &ShellRegistry, shell_id: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while reg.get(shell_id).is_some() {
            assert!(tokio::time::Instant::now() < deadline, "shell {shell_id} never left the registry");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn exited_unbound_shell_leaves_registry() {
        let reg = registry();
        let quick = reg.spawn("s1", &CommandSpec::new("/bin/true")).unwrap();
        let live = reg.spawn("s1", &cat()).unwrap();

        wait_until_gone(&reg, quick.shell_id()).await;
        assert!(quick.is_closed());
        assert!(reg.get(live.shell_id()).is_some());
        let listed = reg.list_shells("s1");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].shell_id, live.shell_id());
        // Nothing left for the sweep.
        assert_eq!(reg.reap_dead().await, 0);

        reg.close_all("s1").await;
    }

    #[tokio::test]
    async fn exited_shell_is_not_listed_before_removal() {
        let reg = registry();
        let quick = reg.spawn("s1", &CommandSpec::new("/bin/true")).unwrap();
        // Bound shells are left to their bridge, so this one stays registered.
        let _binding = quick.bind(Duration::from_millis(50)).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while quick.is_alive() {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(reg.get(quick.shell_id()).is_some());
        assert!(reg.list_shells("s1").is_empty());

        reg.close_all("s1").await;
    }

    #[tokio::test]
    async fn reap_dead_sweeps_exited_shells() {
        let reg = registry();
        let quick = reg.spawn("s1", &CommandSpec::new("/bin/true")).unwrap();
        let _binding = quick.bind(Duration::from_millis(50)).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while quick.is_alive() {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(reg.reap_dead().await, 1);
        assert!(reg.get(quick.shell_id()).is_none());
    }
}
