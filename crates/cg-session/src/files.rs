//! Workspace file browsing and search.
//!
//! Every path handed in is relative to the workspace root and must stay
//! inside it: absolute paths and `..` are rejected outright, and anything
//! that resolves through a symlink to somewhere outside the root is refused.

use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use ignore::WalkBuilder;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SessionError};

pub const MAX_FILE_MATCHES: usize = 50;
pub const MAX_GREP_MATCHES: usize = 20;
/// Include globs used by content search when the caller names none.
pub const DEFAULT_GREP_TYPES: &str = "*.py,*.js,*.json,*.md,*.txt,*.yml,*.yaml";
/// Bytes inspected for a NUL when deciding whether a file is binary.
const BINARY_SNIFF: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Directory,
    File,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirListing {
    pub path: String,
    /// Directories first, then files, each by name.
    pub items: Vec<DirEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrepMatch {
    pub file: String,
    pub line: usize,
    pub content: String,
}

/// File access rooted at one session's workspace.
#[derive(Debug, Clone)]
pub struct WorkspaceFiles {
    root: PathBuf,
}

impl WorkspaceFiles {
    pub fn open(workspace: &Path) -> Result<Self> {
        let root = workspace.canonicalize()?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run a blocking file operation off the async executor.
    pub async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&WorkspaceFiles) -> Result<T> + Send + 'static,
    {
        let files = self.clone();
        tokio::task::spawn_blocking(move || op(&files))
            .await
            .map_err(|e| SessionError::Io(std::io::Error::other(e)))?
    }

    fn resolve(&self, rel: &str) -> Result<PathBuf> {
        let rel = Path::new(rel.trim());
        let mut joined = self.root.clone();
        for component in rel.components() {
            match component {
                Component::Normal(part) => joined.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(SessionError::InvalidInput(format!(
                        "path {} leaves the workspace",
                        rel.display()
                    )))
                }
            }
        }

        // Symlinks may still point outside; check the deepest existing ancestor.
        let mut existing = joined.as_path();
        while !existing.exists() {
            existing = existing.parent().unwrap_or(self.root.as_path());
        }
        if !existing.canonicalize()?.starts_with(&self.root) {
            return Err(SessionError::InvalidInput(format!(
                "path {} leaves the workspace",
                rel.display()
            )));
        }
        Ok(joined)
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn list(&self, rel: &str) -> Result<DirListing> {
        let dir = self.resolve(rel)?;
        if !dir.is_dir() {
            return Err(SessionError::FileNotFound(format!("directory {rel}")));
        }
        let mut items = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let item = match entry.metadata() {
                Ok(meta) => DirEntry {
                    name,
                    kind: if meta.is_dir() {
                        EntryKind::Directory
                    } else {
                        EntryKind::File
                    },
                    size: meta.is_file().then(|| meta.len()),
                    modified: meta.modified().ok().map(DateTime::<Utc>::from),
                    error: None,
                },
                Err(e) => {
                    debug!(name = %name, error = %e, "could not stat entry");
                    DirEntry {
                        name,
                        kind: EntryKind::Unknown,
                        size: None,
                        modified: None,
                        error: Some("access denied".into()),
                    }
                }
            };
            items.push(item);
        }
        items.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.name.cmp(&b.name)));
        Ok(DirListing {
            path: rel.to_string(),
            items,
        })
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        let path = self.resolve(rel)?;
        if !path.exists() {
            return Err(SessionError::FileNotFound(rel.to_string()));
        }
        if !path.is_file() {
            return Err(SessionError::InvalidInput(format!("{rel} is not a file")));
        }
        let bytes = fs::read(&path)?;
        String::from_utf8(bytes)
            .map_err(|_| SessionError::InvalidInput(format!("{rel} is not UTF-8 text")))
    }

    /// Write `content` to `rel`, creating parent directories.
    pub fn write(&self, rel: &str, content: &str) -> Result<()> {
        let path = self.resolve(rel)?;
        if path == self.root || path.is_dir() {
            return Err(SessionError::InvalidInput(format!("{rel} is a directory")));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content)?;
        debug!(path = %self.relative(&path), bytes = content.len(), "workspace file written");
        Ok(())
    }

    /// Files under `rel` whose name matches the glob `pattern`, optionally
    /// narrowed to the extensions in `file_types` (`"*"` or `"*.rs,*.toml"`).
    pub fn find(&self, rel: &str, pattern: &str, file_types: &str) -> Result<Vec<String>> {
        let start = self.resolve(rel)?;
        let name_glob = glob_pattern(pattern)?;
        let extensions: Vec<String> = if file_types.trim() == "*" {
            Vec::new()
        } else {
            file_types
                .split(',')
                .map(|t| t.trim().trim_start_matches("*.").to_ascii_lowercase())
                .filter(|t| !t.is_empty())
                .collect()
        };

        let mut matches = Vec::new();
        for entry in walk(&start) {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name_glob.matches(name) {
                continue;
            }
            if !extensions.is_empty() {
                let ext = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(str::to_ascii_lowercase);
                if !ext.is_some_and(|e| extensions.contains(&e)) {
                    continue;
                }
            }
            matches.push(self.relative(path));
            if matches.len() >= MAX_FILE_MATCHES {
                break;
            }
        }
        Ok(matches)
    }

    /// Lines matching the regex `pattern` in text files under `rel` whose
    /// name matches one of the comma-separated globs in `file_types`.
    pub fn grep(&self, rel: &str, pattern: &str, file_types: &str) -> Result<Vec<GrepMatch>> {
        let start = self.resolve(rel)?;
        let regex = Regex::new(pattern)
            .map_err(|e| SessionError::InvalidInput(format!("invalid pattern: {e}")))?;
        let includes = file_types
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(glob_pattern)
            .collect::<Result<Vec<_>>>()?;

        let mut matches = Vec::new();
        'files: for entry in walk(&start) {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !includes.is_empty() && !includes.iter().any(|g| g.matches(name)) {
                continue;
            }
            let Some(text) = read_text(path) else {
                continue;
            };
            for (idx, line) in text.lines().enumerate() {
                if regex.is_match(line) {
                    matches.push(GrepMatch {
                        file: self.relative(path),
                        line: idx + 1,
                        content: line.trim().to_string(),
                    });
                    if matches.len() >= MAX_GREP_MATCHES {
                        break 'files;
                    }
                }
            }
        }
        Ok(matches)
    }
}

fn glob_pattern(pattern: &str) -> Result<glob::Pattern> {
    glob::Pattern::new(pattern.trim())
        .map_err(|e| SessionError::InvalidInput(format!("invalid glob {pattern:?}: {e}")))
}

/// Regular files under `start` in name order, hidden files included.
fn walk(start: &Path) -> impl Iterator<Item = ignore::DirEntry> {
    WalkBuilder::new(start)
        .standard_filters(false)
        .follow_links(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_some_and(|t| t.is_file()))
}

/// File contents as text, or `None` for unreadable and binary files.
fn read_text(path: &Path) -> Option<String> {
    let mut file = fs::File::open(path).ok()?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).ok()?;
    if bytes[..bytes.len().min(BINARY_SNIFF)].contains(&0) {
        return None;
    }
    Some(String::from_utf8_lossy(&bytes).into_owned())
}
