//! Centralized path utilities for the supervisor.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

/// Get the root data directory for the supervisor (~/.tts_supervisor).
pub fn get_data_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| AppError::config("Cannot find home directory"))?;
    Ok(home.join(".tts_supervisor"))
}

/// Get the path to the default config file.
pub fn default_config_path() -> Result<PathBuf> {
    Ok(get_data_dir()?.join("config.toml"))
}

/// Default PID file path.
pub fn default_pid_file() -> PathBuf {
    get_data_dir()
        .unwrap_or_else(|_| std::env::temp_dir())
        .join("api_server.pid")
}

/// Default worker log path.
pub fn default_log_file() -> PathBuf {
    get_data_dir()
        .unwrap_or_else(|_| std::env::temp_dir())
        .join("logs")
        .join("api_server.log")
}

/// Create the parent directory of `path` if it does not exist yet.
pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| {
                AppError::io(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
    }
    Ok(())
}

/// Expand a leading `~/` against the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}
