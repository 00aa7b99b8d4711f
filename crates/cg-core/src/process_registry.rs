use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use tracing::{debug, warn};

use crate::types::{ProcessRecord, ProcessStatus};

/// Registry document name inside each workspace.
pub const REGISTRY_FILE: &str = ".processes.json";

#[derive(Debug, thiserror::Error)]
pub enum ProcessRegistryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ProcessRegistryError>;

/// Per-workspace record of background processes.
///
/// Each workspace keeps a JSON array at `<workspace>/.processes.json`. Every
/// operation is a full read-modify-write under one lock; records are never
/// removed, only flipped to `stopped`.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    lock: Mutex<()>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(workspace: &Path) -> PathBuf {
        workspace.join(REGISTRY_FILE)
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|e| {
            warn!("process registry lock was poisoned, recovering");
            e.into_inner()
        })
    }

    fn read(workspace: &Path) -> Result<Vec<ProcessRecord>> {
        let path = Self::path(workspace);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&path)?;
        if data.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&data)?)
    }

    fn write(workspace: &Path, records: &[ProcessRecord]) -> Result<()> {
        let path = Self::path(workspace);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(records)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn list(&self, workspace: &Path) -> Result<Vec<ProcessRecord>> {
        let _guard = self.guard();
        Self::read(workspace)
    }

    /// Latest record for `pid`.
    pub fn find(&self, workspace: &Path, pid: u32) -> Result<Option<ProcessRecord>> {
        let _guard = self.guard();
        Ok(Self::read(workspace)?.into_iter().rev().find(|r| r.pid == pid))
    }

    pub fn add(&self, workspace: &Path, record: ProcessRecord) -> Result<()> {
        let _guard = self.guard();
        let mut records = Self::read(workspace)?;
        debug!(pid = record.pid, cmd = %record.cmd, "recording process");
        records.push(record);
        Self::write(workspace, &records)
    }

    /// Flip a record to `stopped`. Returns `None` when the pid is unknown.
    /// Stopping an already-stopped record keeps its original `ended_at`.
    pub fn mark_stopped(&self, workspace: &Path, pid: u32) -> Result<Option<ProcessRecord>> {
        let _guard = self.guard();
        let mut records = Self::read(workspace)?;
        // Pids can be reused inside a long-lived container; the latest record wins.
        let Some(record) = records.iter_mut().rev().find(|r| r.pid == pid) else {
            return Ok(None);
        };
        if record.status == ProcessStatus::Running {
            record.status = ProcessStatus::Stopped;
            record.ended_at = Some(Utc::now());
        }
        let updated = record.clone();
        Self::write(workspace, &records)?;
        Ok(Some(updated))
    }

    /// Mark every running record whose process is gone as stopped, then
    /// return the full list.
    pub fn reconcile<F>(&self, workspace: &Path, mut is_alive: F) -> Result<Vec<ProcessRecord>>
    where
        F: FnMut(&ProcessRecord) -> bool,
    {
        let _guard = self.guard();
        let mut records = Self::read(workspace)?;
        let mut changed = false;
        for record in records.iter_mut().filter(|r| r.is_running()) {
            if !is_alive(record) {
                debug!(pid = record.pid, "process exited, marking stopped");
                record.status = ProcessStatus::Stopped;
                record.ended_at = Some(Utc::now());
                changed = true;
            }
        }
        if changed {
            Self::write(workspace, &records)?;
        }
        Ok(records)
    }
}
