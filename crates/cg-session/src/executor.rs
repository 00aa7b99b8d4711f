use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use cg_core::types::{ConversationTurn, Session};
use cg_runtime::{ContainerHandle, ContainerRuntime, ExecOptions};

use crate::error::{Result, SessionError};

/// Progress events emitted while a task runs, forwarded to session
/// subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    TaskStarted {
        session_id: String,
        task: String,
    },
    TextDelta {
        content: String,
    },
    ToolCall {
        call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },
    ToolComplete {
        call_id: String,
    },
    TaskCompleted {
        session_id: String,
        task: String,
    },
    Error {
        message: String,
    },
}

/// What an executor gets to work with.
pub struct TaskContext {
    pub session: Session,
    pub runtime: Arc<dyn ContainerRuntime>,
}

impl TaskContext {
    pub fn container(&self) -> ContainerHandle {
        ContainerHandle::new(self.session.container_id.clone())
    }
}

/// The agent loop that turns a task into conversation turns. Implementations
/// stream progress through `events` and return the turns to append to the
/// session history.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(
        &self,
        ctx: &TaskContext,
        task: &str,
        events: &flume::Sender<TaskEvent>,
    ) -> Result<Vec<ConversationTurn>>;
}

/// Records the task and acknowledges it. Stands in when no agent is wired up.
#[derive(Debug, Default)]
pub struct NoopExecutor;

#[async_trait]
impl TaskExecutor for NoopExecutor {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn execute(
        &self,
        ctx: &TaskContext,
        task: &str,
        events: &flume::Sender<TaskEvent>,
    ) -> Result<Vec<ConversationTurn>> {
        let reply = format!("Task received: {task}");
        let _ = events.send(TaskEvent::TextDelta {
            content: reply.clone(),
        });
        debug!(session_id = %ctx.session.id, "noop task recorded");
        Ok(vec![
            ConversationTurn::User {
                content: task.to_string(),
            },
            ConversationTurn::Assistant { content: reply },
        ])
    }
}

/// Runs the task text as a shell command inside the session container.
#[derive(Debug, Default)]
pub struct ShellExecutor;

#[async_trait]
impl TaskExecutor for ShellExecutor {
    fn name(&self) -> &'static str {
        "shell"
    }

    async fn execute(
        &self,
        ctx: &TaskContext,
        task: &str,
        events: &flume::Sender<TaskEvent>,
    ) -> Result<Vec<ConversationTurn>> {
        let call_id = format!("call_{}", uuid::Uuid::new_v4().simple());
        let arguments = serde_json::json!({ "cmd": task });
        let _ = events.send(TaskEvent::ToolCall {
            call_id: call_id.clone(),
            tool_name: "run_shell".into(),
            arguments: arguments.clone(),
        });

        let out = ctx
            .runtime
            .exec(&ctx.container(), task, &ExecOptions::tty())
            .await
            .map_err(SessionError::from)?;

        let _ = events.send(TaskEvent::ToolComplete {
            call_id: call_id.clone(),
        });
        let summary = format!("exit code {}", out.exit_code);
        let _ = events.send(TaskEvent::TextDelta {
            content: out.output.clone(),
        });

        Ok(vec![
            ConversationTurn::User {
                content: task.to_string(),
            },
            ConversationTurn::ToolCall {
                call_id: call_id.clone(),
                name: "run_shell".into(),
                arguments,
            },
            ConversationTurn::ToolResult {
                call_id,
                output: out.output,
            },
            ConversationTurn::Assistant { content: summary },
        ])
    }
}

/// Resolve an executor by its configured name.
pub fn by_name(name: &str) -> Option<Arc<dyn TaskExecutor>> {
    match name {
        "noop" => Some(Arc::new(NoopExecutor)),
        "shell" => Some(Arc::new(ShellExecutor)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cg_runtime::LocalRuntime;

    async fn context(dir: &std::path::Path) -> TaskContext {
        let runtime = Arc::new(LocalRuntime::default());
        let handle = runtime.start("t", "img", dir).await.unwrap();
        TaskContext {
            session: Session::new("abcd1234", handle.id, dir.to_path_buf(), "t"),
            runtime,
        }
    }

    #[test]
    fn event_wire_shape() {
        let ev = TaskEvent::TaskStarted {
            session_id: "s".into(),
            task: "noop".into(),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "task_started");
        assert_eq!(v["task"], "noop");
    }

    #[tokio::test]
    async fn noop_records_user_and_assistant() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path()).await;
        let (tx, rx) = flume::unbounded();

        let turns = NoopExecutor.execute(&ctx, "noop", &tx).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert!(matches!(&turns[0], ConversationTurn::User { content } if content == "noop"));
        assert!(matches!(rx.try_recv().unwrap(), TaskEvent::TextDelta { .. }));
    }

    #[tokio::test]
    async fn shell_executor_runs_in_container() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path()).await;
        let (tx, rx) = flume::unbounded();

        let turns = ShellExecutor.execute(&ctx, "echo hi", &tx).await.unwrap();
        assert!(turns
            .iter()
            .any(|t| matches!(t, ConversationTurn::ToolResult { output, .. } if output.contains("hi"))));

        let events: Vec<TaskEvent> = rx.drain().collect();
        assert!(matches!(events[0], TaskEvent::ToolCall { .. }));
        assert!(matches!(events[1], TaskEvent::ToolComplete { .. }));
    }

    #[test]
    fn unknown_executor_name() {
        assert!(by_name("noop").is_some());
        assert!(by_name("llm").is_none());
    }
}
