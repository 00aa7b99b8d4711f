use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Stopping,
    Deleted,
}

/// One agent workspace: a host directory mounted into exactly one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub container_id: String,
    pub workspace: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_task: String,
    pub last_activity_at: DateTime<Utc>,
    #[serde(default)]
    pub conversation_history: Vec<ConversationTurn>,
    pub status: SessionStatus,
}

impl Session {
    /// Short opaque session id (8 hex chars).
    pub fn new_id() -> String {
        Uuid::new_v4().simple().to_string()[..8].to_string()
    }

    pub fn new(
        id: impl Into<String>,
        container_id: impl Into<String>,
        workspace: PathBuf,
        task: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            container_id: container_id.into(),
            workspace,
            created_at: now,
            last_task: task.into(),
            last_activity_at: now,
            conversation_history: Vec::new(),
            status: SessionStatus::Active,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    /// Seconds since the last recorded activity.
    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_activity_at
    }
}

/// Live state of a session's container as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Running,
    Exited,
    Missing,
}

impl ContainerState {
    pub fn is_running(self) -> bool {
        matches!(self, ContainerState::Running)
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerState::Running => "running",
            ContainerState::Exited => "exited",
            ContainerState::Missing => "missing",
        };
        f.write_str(s)
    }
}

/// A session as listed by the API, with the container status attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub container_id: String,
    pub workspace: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_task: String,
    pub last_activity_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub container_status: ContainerState,
    pub turns: usize,
}

impl SessionSummary {
    pub fn from_session(session: &Session, container_status: ContainerState) -> Self {
        Self {
            id: session.id.clone(),
            container_id: session.container_id.clone(),
            workspace: session.workspace.clone(),
            created_at: session.created_at,
            last_task: session.last_task.clone(),
            last_activity_at: session.last_activity_at,
            status: session.status,
            container_status,
            turns: session.conversation_history.len(),
        }
    }
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// A single entry in a session's conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConversationTurn {
    User {
        content: String,
    },
    Assistant {
        content: String,
    },
    Reasoning {
        content: String,
    },
    ToolCall {
        call_id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        call_id: String,
        output: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    Human,
    Ai,
}

/// Chat-view projection of a conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(rename = "type")]
    pub role: ChatRole,
    pub content: String,
    pub id: String,
}

/// Keep only the user/assistant turns, in order, as chat messages.
pub fn chat_view(history: &[ConversationTurn]) -> Vec<ChatMessage> {
    history
        .iter()
        .filter_map(|turn| match turn {
            ConversationTurn::User { content } => Some((ChatRole::Human, content)),
            ConversationTurn::Assistant { content } => Some((ChatRole::Ai, content)),
            _ => None,
        })
        .enumerate()
        .map(|(i, (role, content))| ChatMessage {
            role,
            content: content.clone(),
            id: format!("msg_{i}"),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Processes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    Stopped,
}

/// A background process started inside a session's container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub cmd: String,
    /// Log file path relative to the workspace root.
    pub log_path: String,
    pub started_at: DateTime<Utc>,
    pub status: ProcessStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl ProcessRecord {
    pub fn running(pid: u32, cmd: impl Into<String>, log_path: impl Into<String>) -> Self {
        Self {
            pid,
            cmd: cmd.into(),
            log_path: log_path.into(),
            started_at: Utc::now(),
            status: ProcessStatus::Running,
            ended_at: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ProcessStatus::Running
    }
}
