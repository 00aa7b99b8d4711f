use thiserror::Error;

use cg_core::process_registry::ProcessRegistryError;
use cg_core::session_store::SessionStoreError;
use cg_runtime::RuntimeError;

use crate::pty::PtyError;

/// Errors surfaced by the session layer. Runtime, PTY and OS failures are
/// classified into these before they reach the HTTP/WebSocket boundary.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("shell not found: {0}")]
    ShellNotFound(String),

    #[error("process not found: {0}")]
    ProcessNotFound(u32),

    #[error("provisioning failed: {0}")]
    Provisioning(String),

    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("shell is dead: {0}")]
    ShellDead(String),

    #[error("command failed: {0}")]
    Exec(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    /// A caller-supplied path or pattern was rejected.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("session store error: {0}")]
    Store(#[from] SessionStoreError),

    #[error("process registry error: {0}")]
    Registry(#[from] ProcessRegistryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SessionError::NotFound(_)
                | SessionError::ShellNotFound(_)
                | SessionError::ProcessNotFound(_)
                | SessionError::FileNotFound(_)
        )
    }
}

impl From<RuntimeError> for SessionError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unavailable(msg) => SessionError::RuntimeUnavailable(msg),
            RuntimeError::ImageNotFound(image) => {
                SessionError::Provisioning(format!("image not found: {image}"))
            }
            RuntimeError::Provisioning(msg) => SessionError::Provisioning(msg),
            RuntimeError::ContainerMissing(id) => SessionError::NotFound(format!("container {id}")),
            RuntimeError::Exec(msg) => SessionError::Exec(msg),
            RuntimeError::Io(e) => SessionError::Io(e),
        }
    }
}

impl From<PtyError> for SessionError {
    fn from(err: PtyError) -> Self {
        match err {
            PtyError::Dead(id) => SessionError::ShellDead(id),
            PtyError::SpawnFailed(msg) => SessionError::Provisioning(format!("shell spawn: {msg}")),
            PtyError::Io(e) => SessionError::Io(e),
            PtyError::Internal(msg) => SessionError::Exec(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_errors_are_classified() {
        let e: SessionError = RuntimeError::Unavailable("socket".into()).into();
        assert!(matches!(e, SessionError::RuntimeUnavailable(_)));

        let e: SessionError = RuntimeError::ImageNotFound("img".into()).into();
        assert!(matches!(e, SessionError::Provisioning(m) if m.contains("img")));

        let e: SessionError = RuntimeError::ContainerMissing("abc".into()).into();
        assert!(e.is_not_found());
    }

    #[test]
    fn dead_pty_is_shell_dead() {
        let e: SessionError = PtyError::Dead("s1".into()).into();
        assert!(matches!(e, SessionError::ShellDead(id) if id == "s1"));
    }
}
