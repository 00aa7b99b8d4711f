use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use cg_core::process_registry::ProcessRegistry;
use cg_core::types::{ProcessRecord, Session};
use cg_runtime::{shell_quote, ContainerHandle, ContainerRuntime, ExecOptions};

use crate::error::{Result, SessionError};

/// Directory (relative to the workspace) holding background process logs.
pub const LOG_DIR: &str = ".agent_logs";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartedProcess {
    pub pid: u32,
    pub log_path: String,
}

/// Starts, stops and inspects detached background processes inside a
/// session's container, recording them in the workspace process registry.
pub struct ProcessManager {
    registry: ProcessRegistry,
    runtime: Arc<dyn ContainerRuntime>,
}

impl ProcessManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            registry: ProcessRegistry::new(),
            runtime,
        }
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    fn handle(session: &Session) -> ContainerHandle {
        ContainerHandle::new(session.container_id.clone())
    }

    /// Launch `cmd` detached with its output in a fresh log file, and record
    /// it as running.
    pub async fn start_process(&self, session: &Session, cmd: &str) -> Result<StartedProcess> {
        // Callers often pass shell-style `cmd &`; we background it ourselves.
        let cmd = cmd.trim().trim_end_matches('&').trim_end();
        if cmd.is_empty() {
            return Err(SessionError::Exec("empty command".into()));
        }
        let log_path = format!("{LOG_DIR}/{}.log", Uuid::new_v4().simple());
        let script = format!(
            "mkdir -p {LOG_DIR}\nnohup sh -c {} > {} 2>&1 &\necho $!",
            shell_quote(cmd),
            shell_quote(&log_path)
        );

        let out = self
            .runtime
            .exec(&Self::handle(session), &script, &ExecOptions::default())
            .await?;
        let pid = out
            .output
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .and_then(|l| l.trim().parse::<u32>().ok())
            .ok_or_else(|| {
                SessionError::Exec(format!("could not read pid from output: {:?}", out.output))
            })?;

        self.registry
            .add(&session.workspace, ProcessRecord::running(pid, cmd, log_path.clone()))?;
        info!(session_id = %session.id, pid, cmd, "background process started");
        Ok(StartedProcess { pid, log_path })
    }

    /// Send SIGTERM and mark the record stopped, whether or not delivery
    /// could be confirmed.
    pub async fn stop_process(&self, session: &Session, pid: u32) -> Result<ProcessRecord> {
        if self.registry.find(&session.workspace, pid)?.is_none() {
            return Err(SessionError::ProcessNotFound(pid));
        }
        let script = format!("kill -15 {pid} || true");
        if let Err(e) = self
            .runtime
            .exec(&Self::handle(session), &script, &ExecOptions::default())
            .await
        {
            warn!(session_id = %session.id, pid, error = %e, "could not deliver SIGTERM");
        }
        let record = self
            .registry
            .mark_stopped(&session.workspace, pid)?
            .ok_or(SessionError::ProcessNotFound(pid))?;
        info!(session_id = %session.id, pid, "background process stopped");
        Ok(record)
    }

    /// Last `lines` lines of the process log, read from the host side of the
    /// workspace mount. A log that does not exist yet reads as empty.
    pub async fn tail_log(&self, session: &Session, pid: u32, lines: usize) -> Result<String> {
        let record = self
            .registry
            .find(&session.workspace, pid)?
            .ok_or(SessionError::ProcessNotFound(pid))?;
        let path = session.workspace.join(&record.log_path);
        let content = match tokio::fs::read(&path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(last_lines(&content, lines))
    }

    /// The registry, with running records whose pid has disappeared flipped
    /// to stopped.
    pub async fn list_processes(&self, session: &Session) -> Result<Vec<ProcessRecord>> {
        let records = self.registry.list(&session.workspace)?;
        let running: Vec<u32> = records
            .iter()
            .filter(|r| r.is_running())
            .map(|r| r.pid)
            .collect();
        if running.is_empty() {
            return Ok(records);
        }

        let pids = running
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        let script = format!("for p in {pids}; do kill -0 $p 2>/dev/null && echo $p; done; true");
        let alive: HashSet<u32> = match self
            .runtime
            .exec(&Self::handle(session), &script, &ExecOptions::default())
            .await
        {
            Ok(out) => out
                .output
                .lines()
                .filter_map(|l| l.trim().parse().ok())
                .collect(),
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "liveness check failed, listing as recorded");
                return Ok(records);
            }
        };

        Ok(self
            .registry
            .reconcile(&session.workspace, |r| alive.contains(&r.pid))?)
    }
}

fn last_lines(content: &str, n: usize) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
