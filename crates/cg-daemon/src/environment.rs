use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cg_core::config::Config;

/// Name of the deployment environment, from `CROGIA_ENV`.
pub fn environment_name() -> String {
    std::env::var("CROGIA_ENV")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "development".to_string())
}

/// Load `.env` and then `environment/<env>.env` from `root`. Variables that
/// are already set are left alone. Returns the files that were read, so the
/// caller can log them once tracing is up.
pub fn load_env_files(root: &Path, env: &str) -> Vec<PathBuf> {
    let candidates = [
        root.join(".env"),
        root.join("environment").join(format!("{env}.env")),
    ];
    candidates
        .into_iter()
        .filter(|path| path.is_file() && dotenv::from_path(path).is_ok())
        .collect()
}

/// Config file (or defaults) with `CROGIA_*` overrides applied.
pub fn resolve_config() -> Result<Config> {
    let mut config = Config::load().context("failed to load config")?;
    config
        .apply_env_overrides()
        .context("invalid CROGIA_* override")?;
    Ok(config)
}
