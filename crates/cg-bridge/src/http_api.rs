use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode},
    middleware as axum_middleware,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use cg_core::types::{
    chat_view, ChatMessage, ContainerState, ConversationTurn, ProcessRecord, SessionSummary,
};
use cg_session::executor::TaskExecutor;
use cg_session::files::{DirListing, GrepMatch, DEFAULT_GREP_TYPES};
use cg_session::process::StartedProcess;
use cg_session::pty::ShellInfo;
use cg_session::SessionManager;
use cg_telemetry::request_id::request_id_middleware;

use crate::api_error::ApiError;
use crate::event_bus::EventBus;
use crate::{events_ws, terminal_ws};

type ApiResult<T> = Result<T, ApiError>;

/// Shared application state for all HTTP/WS handlers.
pub struct ApiState {
    pub manager: Arc<SessionManager>,
    pub event_bus: EventBus,
    /// Runs tasks submitted through `/api/sessions/{id}/tasks`.
    pub executor: Arc<dyn TaskExecutor>,
    pub start_time: std::time::Instant,
}

impl ApiState {
    pub fn new(manager: Arc<SessionManager>, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            manager,
            event_bus: EventBus::new(),
            executor,
            start_time: std::time::Instant::now(),
        }
    }
}

/// Build the full API router with all REST and WebSocket routes.
pub fn api_router(state: Arc<ApiState>) -> Router {
    let cors = cors_layer(&state.manager.config().daemon.allowed_origins);
    Router::new()
        .route("/api/health", get(health))
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/{id}", get(get_session).delete(delete_session))
        .route("/api/sessions/{id}/conversation", get(get_conversation))
        .route("/api/sessions/{id}/conversation/full", get(get_full_conversation))
        .route("/api/sessions/{id}/tasks", post(submit_task))
        .route("/api/sessions/{id}/shell", post(run_shell_command))
        .route("/api/sessions/{id}/processes", get(list_processes).post(start_process))
        .route("/api/sessions/{id}/processes/{pid}/stop", post(stop_process))
        .route("/api/sessions/{id}/processes/{pid}/logs", get(process_logs))
        .route("/api/sessions/{id}/files", get(list_files))
        .route(
            "/api/sessions/{id}/files/content",
            get(read_file).post(write_file),
        )
        .route("/api/sessions/{id}/search/files", post(search_files))
        .route("/api/sessions/{id}/search/grep", post(grep_files))
        .route("/api/sessions/{id}/shells", get(list_shells).post(create_shell))
        .route("/api/shells/{shell_id}", delete(close_shell))
        // WebSocket endpoints
        .route("/ws/shells/{shell_id}", get(terminal_ws::shell_ws))
        .route("/ws/sessions/{id}", get(events_ws::session_events_ws))
        .layer(axum_middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(allowed: &[String]) -> CorsLayer {
    if allowed.is_empty() {
        return CorsLayer::very_permissive();
    }
    let origins: Vec<HeaderValue> = allowed
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    runtime: &'static str,
    runtime_available: bool,
    sessions: usize,
    shells: usize,
    uptime_seconds: u64,
}

#[derive(Debug, Deserialize)]
pub struct TaskRequest {
    pub task: String,
}

#[derive(Debug, Deserialize)]
pub struct ShellCommandRequest {
    pub cmd: String,
    #[serde(default = "default_tty")]
    pub tty: bool,
}

fn default_tty() -> bool {
    true
}

#[derive(Debug, Serialize)]
struct ShellCommandResponse {
    exit_code: i64,
    output: String,
}

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_path() -> String {
    ".".into()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FileContent {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct FileSearchRequest {
    pub pattern: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_file_types")]
    pub file_types: String,
}

fn default_file_types() -> String {
    "*".into()
}

#[derive(Debug, Deserialize)]
pub struct GrepRequest {
    pub pattern: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_grep_types")]
    pub file_types: String,
}

fn default_grep_types() -> String {
    DEFAULT_GREP_TYPES.into()
}

#[derive(Debug, Serialize)]
struct SearchResponse<T> {
    pattern: String,
    path: String,
    matches: Vec<T>,
}

#[derive(Debug, Deserialize)]
pub struct StartProcessRequest {
    pub cmd: String,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub lines: Option<usize>,
}

#[derive(Debug, Serialize)]
struct LogsResponse {
    pid: u32,
    lines: usize,
    log: String,
}

#[derive(Debug, Serialize)]
struct ShellCreated {
    #[serde(flatten)]
    info: ShellInfo,
    ws_path: String,
}

const DEFAULT_LOG_LINES: usize = 50;

fn require_text<'a>(value: &'a str, field: &str) -> ApiResult<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ApiError::BadRequest(format!("{field} must not be empty")));
    }
    Ok(trimmed)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let runtime = state.manager.runtime();
    let runtime_available = match runtime.ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "runtime health check failed");
            false
        }
    };
    let body = HealthResponse {
        status: if runtime_available { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        runtime: runtime.name(),
        runtime_available,
        sessions: state.manager.store().len(),
        shells: state.manager.shells().count(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    };
    let status = if runtime_available {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn list_sessions(State(state): State<Arc<ApiState>>) -> Json<Vec<SessionSummary>> {
    Json(state.manager.list().await)
}

async fn create_session(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<TaskRequest>,
) -> ApiResult<impl IntoResponse> {
    let session = state.manager.create(req.task.trim()).await?;
    let summary = SessionSummary::from_session(&session, ContainerState::Running);
    Ok((StatusCode::CREATED, Json(summary)))
}

async fn get_session(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionSummary>> {
    let session = state.manager.get(&id).await?;
    Ok(Json(SessionSummary::from_session(
        &session,
        ContainerState::Running,
    )))
}

async fn delete_session(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.manager.delete(&id).await?;
    Ok(Json(serde_json::json!({"status": "deleted", "session_id": id})))
}

async fn get_conversation(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<ChatMessage>>> {
    let session = state.manager.get(&id).await?;
    Ok(Json(chat_view(&session.conversation_history)))
}

async fn get_full_conversation(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<ConversationTurn>>> {
    let session = state.manager.get(&id).await?;
    Ok(Json(session.conversation_history))
}

/// Accept a task and run it in the background; progress goes out on the
/// session's event stream.
async fn submit_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(req): Json<TaskRequest>,
) -> ApiResult<impl IntoResponse> {
    let task = require_text(&req.task, "task")?.to_string();
    state.manager.get(&id).await?;

    let events = state.event_bus.session_sink(&id);
    let bg = Arc::clone(&state);
    let session_id = id.clone();
    let bg_task = task.clone();
    tokio::spawn(async move {
        if let Err(e) = bg
            .manager
            .run_task(&session_id, &bg_task, bg.executor.as_ref(), events)
            .await
        {
            warn!(%session_id, error = %e, "background task failed");
        }
    });

    info!(session_id = %id, executor = state.executor.name(), "task accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"status": "accepted", "session_id": id, "task": task})),
    ))
}

async fn run_shell_command(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(req): Json<ShellCommandRequest>,
) -> ApiResult<Json<ShellCommandResponse>> {
    let cmd = require_text(&req.cmd, "cmd")?;
    let out = state.manager.exec(&id, cmd, req.tty).await?;
    Ok(Json(ShellCommandResponse {
        exit_code: out.exit_code,
        output: out.output,
    }))
}

async fn list_processes(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<ProcessRecord>>> {
    let session = state.manager.get(&id).await?;
    Ok(Json(state.manager.processes().list_processes(&session).await?))
}

async fn start_process(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(req): Json<StartProcessRequest>,
) -> ApiResult<(StatusCode, Json<StartedProcess>)> {
    let cmd = require_text(&req.cmd, "cmd")?;
    let session = state.manager.get(&id).await?;
    let started = state.manager.processes().start_process(&session, cmd).await?;
    state.manager.touch(&id)?;
    Ok((StatusCode::CREATED, Json(started)))
}

async fn stop_process(
    State(state): State<Arc<ApiState>>,
    Path((id, pid)): Path<(String, u32)>,
) -> ApiResult<Json<ProcessRecord>> {
    let session = state.manager.get(&id).await?;
    Ok(Json(state.manager.processes().stop_process(&session, pid).await?))
}

async fn process_logs(
    State(state): State<Arc<ApiState>>,
    Path((id, pid)): Path<(String, u32)>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<LogsResponse>> {
    let lines = query.lines.unwrap_or(DEFAULT_LOG_LINES);
    let session = state.manager.get(&id).await?;
    let log = state
        .manager
        .processes()
        .tail_log(&session, pid, lines)
        .await?;
    Ok(Json(LogsResponse { pid, lines, log }))
}

async fn list_files(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(query): Query<PathQuery>,
) -> ApiResult<Json<DirListing>> {
    let files = state.manager.files(&id).await?;
    Ok(Json(files.run(move |f| f.list(&query.path)).await?))
}

async fn read_file(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(query): Query<PathQuery>,
) -> ApiResult<Json<FileContent>> {
    let files = state.manager.files(&id).await?;
    let path = query.path.clone();
    let content = files.run(move |f| f.read(&path)).await?;
    Ok(Json(FileContent {
        path: query.path,
        content,
    }))
}

async fn write_file(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(req): Json<FileContent>,
) -> ApiResult<Json<serde_json::Value>> {
    require_text(&req.path, "path")?;
    let files = state.manager.files(&id).await?;
    let path = req.path.clone();
    files.run(move |f| f.write(&req.path, &req.content)).await?;
    state.manager.touch(&id)?;
    info!(session_id = %id, %path, "workspace file written");
    Ok(Json(serde_json::json!({
        "message": format!("File {path} written successfully"),
        "path": path,
    })))
}

async fn search_files(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(req): Json<FileSearchRequest>,
) -> ApiResult<Json<SearchResponse<String>>> {
    require_text(&req.pattern, "pattern")?;
    let files = state.manager.files(&id).await?;
    let (path, pattern, types) = (req.path.clone(), req.pattern.clone(), req.file_types);
    let matches = files.run(move |f| f.find(&path, &pattern, &types)).await?;
    Ok(Json(SearchResponse {
        pattern: req.pattern,
        path: req.path,
        matches,
    }))
}

async fn grep_files(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(req): Json<GrepRequest>,
) -> ApiResult<Json<SearchResponse<GrepMatch>>> {
    require_text(&req.pattern, "pattern")?;
    let files = state.manager.files(&id).await?;
    let (path, pattern, types) = (req.path.clone(), req.pattern.clone(), req.file_types);
    let matches = files.run(move |f| f.grep(&path, &pattern, &types)).await?;
    Ok(Json(SearchResponse {
        pattern: req.pattern,
        path: req.path,
        matches,
    }))
}

async fn list_shells(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<ShellInfo>>> {
    Ok(Json(state.manager.list_shells(&id)?))
}

async fn create_shell(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let info = state.manager.create_shell(&id).await?;
    let ws_path = format!("/ws/shells/{}", info.shell_id);
    Ok((StatusCode::CREATED, Json(ShellCreated { info, ws_path })))
}

async fn close_shell(
    State(state): State<Arc<ApiState>>,
    Path(shell_id): Path<String>,
) -> Json<serde_json::Value> {
    state.manager.close_shell(&shell_id).await;
    Json(serde_json::json!({"status": "closed", "shell_id": shell_id}))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_is_rejected() {
        assert!(require_text("  ", "task").is_err());
        assert_eq!(require_text(" ls ", "cmd").unwrap(), "ls");
    }

    #[test]
    fn shell_command_defaults_to_tty() {
        let req: ShellCommandRequest = serde_json::from_str(r#"{"cmd": "ls"}"#).unwrap();
        assert!(req.tty);
        let req: ShellCommandRequest =
            serde_json::from_str(r#"{"cmd": "ls", "tty": false}"#).unwrap();
        assert!(!req.tty);
    }

    #[test]
    fn cors_accepts_configured_and_empty_lists() {
        let _ = cors_layer(&[]);
        let _ = cors_layer(&["http://localhost:3000".to_string()]);
    }
}
