//! Session lifecycle, PTY shells and background processes.
//!
//! Key components:
//! - [`pty::ShellSession`]: one PTY-backed shell with poll-based I/O
//! - [`shells::ShellRegistry`]: shell ids cross-indexed by session
//! - [`manager::SessionManager`]: create/get/delete/sweep of sessions
//! - [`process::ProcessManager`]: detached background processes per workspace
//! - [`files::WorkspaceFiles`]: browsing, editing and searching a workspace
//! - [`executor::TaskExecutor`]: the seam to the external agent loop

pub mod error;
pub mod executor;
pub mod files;
pub mod manager;
pub mod process;
pub mod pty;
pub mod shells;

pub use error::{Result, SessionError};
pub use manager::SessionManager;

use std::sync::{Mutex, MutexGuard};

pub(crate) fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|e| {
        tracing::warn!(lock = what, "lock was poisoned, recovering");
        e.into_inner()
    })
}
