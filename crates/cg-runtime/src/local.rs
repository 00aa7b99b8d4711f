use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    CommandSpec, ContainerHandle, ContainerRuntime, ContainerState, ExecOptions, ExecOutput,
    Result, RuntimeError,
};

#[derive(Debug, Clone)]
struct LocalContainer {
    workspace: PathBuf,
    running: bool,
}

/// Host-process runtime: a "container" is just its workspace directory.
///
/// Commands run through `sh -c` with the workspace as working directory and
/// interactive shells are spawned directly. There is no isolation; this is
/// for development machines without Docker and for tests.
pub struct LocalRuntime {
    shell: String,
    containers: DashMap<String, LocalContainer>,
}

impl LocalRuntime {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            containers: DashMap::new(),
        }
    }

    /// Drop a container without stopping it, as if it vanished underneath
    /// the control plane.
    pub fn forget(&self, handle: &ContainerHandle) -> bool {
        self.containers.remove(&handle.id).is_some()
    }

    pub fn running_count(&self) -> usize {
        self.containers.iter().filter(|c| c.running).count()
    }

    fn running_workspace(&self, handle: &ContainerHandle) -> Result<PathBuf> {
        match self.containers.get(&handle.id) {
            Some(c) if c.running => Ok(c.workspace.clone()),
            _ => Err(RuntimeError::ContainerMissing(handle.id.clone())),
        }
    }
}

impl Default for LocalRuntime {
    fn default() -> Self {
        Self::new("/bin/sh")
    }
}

#[async_trait]
impl ContainerRuntime for LocalRuntime {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn start(&self, name: &str, image: &str, workspace: &Path) -> Result<ContainerHandle> {
        if image.trim().is_empty() {
            return Err(RuntimeError::ImageNotFound(image.to_string()));
        }
        tokio::fs::create_dir_all(workspace)
            .await
            .map_err(|e| RuntimeError::Provisioning(format!("{}: {e}", workspace.display())))?;

        let id = format!("local-{}", Uuid::new_v4().simple());
        self.containers.insert(
            id.clone(),
            LocalContainer {
                workspace: workspace.to_path_buf(),
                running: true,
            },
        );
        info!(container_id = %id, name, workspace = %workspace.display(), "local container started");
        Ok(ContainerHandle::new(id))
    }

    async fn stop(&self, handle: &ContainerHandle) -> Result<()> {
        if let Some(mut c) = self.containers.get_mut(&handle.id) {
            c.running = false;
            debug!(container_id = %handle.id, "local container stopped");
        }
        Ok(())
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerState> {
        Ok(match self.containers.get(&handle.id) {
            Some(c) if c.running => ContainerState::Running,
            Some(_) => ContainerState::Exited,
            None => ContainerState::Missing,
        })
    }

    async fn exec(
        &self,
        handle: &ContainerHandle,
        command: &str,
        _opts: &ExecOptions,
    ) -> Result<ExecOutput> {
        let workspace = self.running_workspace(handle)?;
        // Fold stderr into stdout so the output keeps arrival order.
        let output = Command::new("sh")
            .arg("-c")
            .arg(format!("exec 2>&1\n{command}"))
            .current_dir(&workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|e| RuntimeError::Exec(e.to_string()))?;

        Ok(ExecOutput {
            exit_code: output.status.code().map(i64::from).unwrap_or(-1),
            output: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }

    fn shell_command(&self, handle: &ContainerHandle, workspace: &Path) -> CommandSpec {
        let cwd = self
            .containers
            .get(&handle.id)
            .map(|c| c.workspace.clone())
            .unwrap_or_else(|| workspace.to_path_buf());
        CommandSpec::new(self.shell.clone())
            .env("TERM", "xterm-256color")
            .cwd(cwd)
    }
}
