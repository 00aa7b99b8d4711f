//! Container runtime adapter.
//!
//! [`ContainerRuntime`] is the seam between the session layer and whatever
//! actually hosts a workspace. Two implementations ship here:
//! - [`DockerRuntime`]: the local Docker engine via `bollard`
//! - [`LocalRuntime`]: plain host directories, for development and tests

pub mod docker;
pub mod local;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use cg_core::config::RuntimeConfig;
pub use cg_core::types::ContainerState;

pub use docker::DockerRuntime;
pub use local::LocalRuntime;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("container provisioning failed: {0}")]
    Provisioning(String),

    #[error("container not found: {0}")]
    ContainerMissing(String),

    #[error("exec failed: {0}")]
    Exec(String),

    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Opaque reference to a started container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub id: String,
}

impl ContainerHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl std::fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Run through a login shell with a TTY attached.
    pub tty: bool,
    /// Working directory inside the container; the runtime default when `None`.
    pub workdir: Option<String>,
}

impl ExecOptions {
    pub fn tty() -> Self {
        Self {
            tty: true,
            workdir: None,
        }
    }
}

/// Result of a run-to-completion exec. `output` holds stdout and stderr
/// interleaved in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A host command that, once spawned on a PTY slave, yields an interactive
/// shell inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

// ---------------------------------------------------------------------------
// ContainerRuntime
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &'static str;

    /// Check that the engine is reachable.
    async fn ping(&self) -> Result<()>;

    /// Create and start a container named `name` from `image` with
    /// `workspace` mounted read-write. A missing image is pulled once and
    /// creation retried exactly once.
    async fn start(&self, name: &str, image: &str, workspace: &Path) -> Result<ContainerHandle>;

    /// Stop the container. Stopping a stopped or missing container succeeds.
    async fn stop(&self, handle: &ContainerHandle) -> Result<()>;

    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerState>;

    /// Run `command` to completion inside the container and capture its output.
    async fn exec(
        &self,
        handle: &ContainerHandle,
        command: &str,
        opts: &ExecOptions,
    ) -> Result<ExecOutput>;

    /// Command a PTY should spawn to attach an interactive shell.
    fn shell_command(&self, handle: &ContainerHandle, workspace: &Path) -> CommandSpec;
}

/// Build the runtime selected by `runtime.kind`.
pub fn from_config(config: &RuntimeConfig) -> Result<Arc<dyn ContainerRuntime>> {
    match config.kind.as_str() {
        "local" => Ok(Arc::new(LocalRuntime::new(config.shell.clone()))),
        "docker" => Ok(Arc::new(DockerRuntime::connect(config.clone())?)),
        other => Err(RuntimeError::Unavailable(format!(
            "unknown runtime kind {other:?}"
        ))),
    }
}

/// Quote `s` for inclusion in a POSIX shell command line.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_leaves_safe_words_alone() {
        assert_eq!(shell_quote(".agent_logs/a.log"), ".agent_logs/a.log");
    }

    #[test]
    fn quote_wraps_spaces_and_quotes() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn command_spec_builder() {
        let spec = CommandSpec::new("docker")
            .arg("exec")
            .env("TERM", "xterm-256color")
            .cwd("/tmp");
        assert_eq!(spec.args, vec!["exec"]);
        assert_eq!(spec.env[0].0, "TERM");
        assert_eq!(spec.cwd.as_deref(), Some(Path::new("/tmp")));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let cfg = RuntimeConfig {
            kind: "podman".into(),
            ..Default::default()
        };
        assert!(matches!(
            from_config(&cfg),
            Err(RuntimeError::Unavailable(_))
        ));
    }
}
