use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration loaded from `~/.crogia/config.toml`.
///
/// Every section falls back to its defaults, so an empty or partial file is
/// valid. `CROGIA_*` environment variables are applied on top of the file by
/// [`Config::apply_env_overrides`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl Config {
    /// Load config from `$CROGIA_CONFIG` or `~/.crogia/config.toml`, falling
    /// back to defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("CROGIA_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::default_path());
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply `CROGIA_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(std::env::vars())
    }

    /// Apply overrides from an arbitrary `(key, value)` source. Unknown keys
    /// are ignored; malformed numbers are a validation error.
    pub fn apply_overrides<I, K, V>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (key, value) in vars {
            let value: String = value.into();
            match key.as_ref() {
                "CROGIA_HOST" => self.daemon.host = value,
                "CROGIA_PORT" => self.daemon.port = parse_num("CROGIA_PORT", &value)?,
                "CROGIA_LOG_LEVEL" => self.general.log_level = value.to_lowercase(),
                "CROGIA_LOG_FORMAT" => self.general.log_format = value.to_lowercase(),
                "CROGIA_RUNTIME" => self.runtime.kind = value.to_lowercase(),
                "CROGIA_EXECUTOR" => self.general.executor = value.to_lowercase(),
                "CROGIA_IMAGE" => self.runtime.image = value,
                "CROGIA_BASE_DIR" => self.sessions.base_dir = value,
                "CROGIA_SESSION_IDLE_SECS" => {
                    self.sessions.idle_timeout_secs = parse_num("CROGIA_SESSION_IDLE_SECS", &value)?
                }
                "CROGIA_TERMINAL_IDLE_SECS" => {
                    self.terminal.idle_timeout_secs =
                        parse_num("CROGIA_TERMINAL_IDLE_SECS", &value)?
                }
                _ => {}
            }
        }
        self.validate()
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.runtime.kind.as_str() {
            "docker" | "local" => {}
            other => {
                return Err(ConfigError::Validation(format!(
                    "runtime.kind must be \"docker\" or \"local\", got {other:?}"
                )))
            }
        }
        match self.general.log_format.as_str() {
            "human" | "json" => {}
            other => {
                return Err(ConfigError::Validation(format!(
                    "general.log_format must be \"human\" or \"json\", got {other:?}"
                )))
            }
        }
        match self.general.executor.as_str() {
            "noop" | "shell" => {}
            other => {
                return Err(ConfigError::Validation(format!(
                    "general.executor must be \"noop\" or \"shell\", got {other:?}"
                )))
            }
        }
        if self.sessions.sweep_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "sessions.sweep_interval_secs must be greater than zero".into(),
            ));
        }
        if self.terminal.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "terminal.poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.terminal.rows == 0 || self.terminal.cols == 0 {
            return Err(ConfigError::Validation(
                "terminal.rows and terminal.cols must be non-zero".into(),
            ));
        }
        if self.reconnect.base_delay_ms > self.reconnect.max_delay_ms {
            return Err(ConfigError::Validation(
                "reconnect.base_delay_ms must not exceed reconnect.max_delay_ms".into(),
            ));
        }
        Ok(())
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".crogia")
            .join("config.toml")
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Validation(format!("{key} is not a valid number: {value:?}")))
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `human` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Task executor wired to `/tasks`: `noop` or `shell`.
    #[serde(default = "default_executor")]
    pub executor: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            executor: default_executor(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "human".into()
}
fn default_executor() -> String {
    "noop".into()
}

/// Container engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// `docker` talks to the local engine; `local` runs shells on the host.
    #[serde(default = "default_runtime_kind")]
    pub kind: String,
    #[serde(default = "default_image")]
    pub image: String,
    /// Mount point of the workspace inside the container.
    #[serde(default = "default_container_workdir")]
    pub container_workdir: String,
    #[serde(default = "default_network_mode")]
    pub network_mode: String,
    /// CLI used to attach interactive shells (`docker exec -it`).
    #[serde(default = "default_docker_cli")]
    pub docker_cli: String,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            kind: default_runtime_kind(),
            image: default_image(),
            container_workdir: default_container_workdir(),
            network_mode: default_network_mode(),
            docker_cli: default_docker_cli(),
            shell: default_shell(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

fn default_runtime_kind() -> String {
    "docker".into()
}
fn default_image() -> String {
    "frdel/agent-zero-run:latest".into()
}
fn default_container_workdir() -> String {
    "/code".into()
}
fn default_network_mode() -> String {
    "host".into()
}
fn default_docker_cli() -> String {
    "docker".into()
}
fn default_shell() -> String {
    "/bin/bash".into()
}
fn default_stop_timeout() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Root under which `session_<id>` workspaces and the index live.
    /// A leading `~` expands to the home directory.
    #[serde(default = "default_base_dir")]
    pub base_dir: String,
    #[serde(default = "default_session_idle")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl SessionsConfig {
    pub fn base_dir_path(&self) -> PathBuf {
        expand_home(&self.base_dir)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            idle_timeout_secs: default_session_idle(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_base_dir() -> String {
    "~/agent_workspaces".into()
}
fn default_session_idle() -> u64 {
    3600
}
fn default_sweep_interval() -> u64 {
    60
}

/// Interactive terminal bridge settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    /// Overall per-connection idle timeout.
    #[serde(default = "default_term_idle")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
    /// Sleep between PTY read attempts when no output is pending.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Time a shell gets to exit after SIGTERM before it is killed.
    #[serde(default = "default_close_grace")]
    pub close_grace_ms: u64,
    /// Upper bound on waiting for a superseded bridge to let go.
    #[serde(default = "default_supersede_wait")]
    pub supersede_wait_ms: u64,
    /// Minimum gap between session touches caused by terminal traffic.
    #[serde(default = "default_touch_interval")]
    pub touch_interval_secs: u64,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_cols")]
    pub cols: u16,
}

impl TerminalConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
    pub fn supersede_wait(&self) -> Duration {
        Duration::from_millis(self.supersede_wait_ms)
    }
    pub fn touch_interval(&self) -> Duration {
        Duration::from_secs(self.touch_interval_secs)
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_term_idle(),
            heartbeat_secs: default_heartbeat(),
            poll_interval_ms: default_poll_interval(),
            close_grace_ms: default_close_grace(),
            supersede_wait_ms: default_supersede_wait(),
            touch_interval_secs: default_touch_interval(),
            rows: default_rows(),
            cols: default_cols(),
        }
    }
}

fn default_term_idle() -> u64 {
    300
}
fn default_heartbeat() -> u64 {
    30
}
fn default_poll_interval() -> u64 {
    20
}
fn default_close_grace() -> u64 {
    500
}
fn default_supersede_wait() -> u64 {
    2000
}
fn default_touch_interval() -> u64 {
    30
}
fn default_rows() -> u16 {
    24
}
fn default_cols() -> u16 {
    80
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_daemon_port")]
    pub port: u16,
    #[serde(default = "default_daemon_host")]
    pub host: String,
    /// Browser origins allowed by CORS. Empty means permissive.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: default_daemon_port(),
            host: default_daemon_host(),
            allowed_origins: default_allowed_origins(),
        }
    }
}

fn default_daemon_port() -> u16 {
    8000
}
fn default_daemon_host() -> String {
    "0.0.0.0".into()
}
fn default_allowed_origins() -> Vec<String> {
    vec![
        "http://localhost:3000".into(),
        "http://localhost:5173".into(),
    ]
}

/// Client reconnection policy for the reconnect state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay() -> u64 {
    500
}
fn default_max_delay() -> u64 {
    8000
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    }
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}
