use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::types::Session;

/// File name of the session index inside the base directory.
pub const INDEX_FILE: &str = "active_sessions.json";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SessionStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SessionStoreError>;

// ---------------------------------------------------------------------------
// SessionStore
// ---------------------------------------------------------------------------

/// Durable session index.
///
/// All sessions live in a single JSON object (`id -> Session`) at
/// `<base_dir>/active_sessions.json`. The in-memory map is the source of
/// truth; every mutation rewrites the whole document while holding the lock,
/// via a temp file and rename so a crash never leaves a torn index. A
/// mutation is applied to a copy and only becomes visible once that copy is
/// on disk, so a failed write leaves memory and disk in agreement.
pub struct SessionStore {
    index_path: PathBuf,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    /// Open the index under `base_dir`, creating the directory if needed.
    /// A missing index starts empty; an unreadable one is logged and ignored.
    pub fn open(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref();
        std::fs::create_dir_all(base_dir)?;
        let index_path = base_dir.join(INDEX_FILE);

        let sessions = if index_path.exists() {
            let data = std::fs::read_to_string(&index_path)?;
            match serde_json::from_str::<HashMap<String, Session>>(&data) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %index_path.display(), error = %e, "session index unreadable, starting empty");
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };
        debug!(count = sessions.len(), path = %index_path.display(), "session index loaded");

        Ok(Self {
            index_path,
            sessions: Mutex::new(sessions),
        })
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(|e| {
            warn!("session store lock was poisoned, recovering");
            e.into_inner()
        })
    }

    fn persist(&self, sessions: &HashMap<String, Session>) -> Result<()> {
        let json = serde_json::to_string_pretty(sessions)?;
        let tmp = self.index_path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.index_path)?;
        Ok(())
    }

    /// Persist `next` and, only if that succeeds, make it the live map.
    fn commit(
        &self,
        live: &mut MutexGuard<'_, HashMap<String, Session>>,
        next: HashMap<String, Session>,
    ) -> Result<()> {
        self.persist(&next)?;
        **live = next;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// All sessions, oldest first.
    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.lock().values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace a session and persist.
    pub fn insert(&self, session: Session) -> Result<()> {
        let mut sessions = self.lock();
        let mut next = sessions.clone();
        next.insert(session.id.clone(), session);
        self.commit(&mut sessions, next)
    }

    /// Mutate a session in place and persist. Returns the updated copy, or
    /// `None` if the id is unknown (nothing is written in that case).
    pub fn update<F>(&self, id: &str, f: F) -> Result<Option<Session>>
    where
        F: FnOnce(&mut Session),
    {
        let mut sessions = self.lock();
        if !sessions.contains_key(id) {
            return Ok(None);
        }
        let mut next = sessions.clone();
        let updated = match next.get_mut(id) {
            Some(session) => {
                f(session);
                session.clone()
            }
            None => return Ok(None),
        };
        self.commit(&mut sessions, next)?;
        Ok(Some(updated))
    }

    /// Remove a session and persist. Removing an unknown id is a no-op.
    pub fn remove(&self, id: &str) -> Result<Option<Session>> {
        let mut sessions = self.lock();
        let mut next = sessions.clone();
        let removed = next.remove(id);
        if removed.is_some() {
            self.commit(&mut sessions, next)?;
        }
        Ok(removed)
    }

    /// Keep only sessions for which `keep` returns true; returns the dropped
    /// sessions. The index is rewritten even when nothing was dropped so a
    /// freshly reconciled index always exists on disk.
    pub fn retain<F>(&self, mut keep: F) -> Result<Vec<Session>>
    where
        F: FnMut(&Session) -> bool,
    {
        let mut sessions = self.lock();
        let mut next = sessions.clone();
        let dropped_ids: Vec<String> = next
            .values()
            .filter(|s| !keep(s))
            .map(|s| s.id.clone())
            .collect();
        let dropped = dropped_ids
            .iter()
            .filter_map(|id| next.remove(id))
            .collect();
        self.commit(&mut sessions, next)?;
        Ok(dropped)
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("index_path", &self.index_path)
            .field("count", &self.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
