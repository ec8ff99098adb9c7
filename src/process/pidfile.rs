use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};
use crate::paths::ensure_parent_dir;

/// PID file whose sole content is the decimal pid of the last launched worker.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Recorded pid, if the file exists and holds one. Garbage is logged and
    /// treated as absent.
    pub fn read(&self) -> Option<u32> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == IoErrorKind::NotFound => return None,
            Err(e) => {
                log::warn!("Cannot read PID file {}: {}", self.path.display(), e);
                return None;
            }
        };
        match content.trim().parse::<u32>() {
            Ok(pid) if pid > 0 => Some(pid),
            _ => {
                log::warn!(
                    "Ignoring malformed PID file {} ({:?})",
                    self.path.display(),
                    content.trim()
                );
                None
            }
        }
    }

    pub fn write(&self, pid: u32) -> Result<()> {
        ensure_parent_dir(&self.path)?;
        fs::write(&self.path, format!("{}\n", pid)).map_err(|e| {
            AppError::io(format!(
                "Failed to write PID file {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    /// Remove the file; a missing file is fine.
    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::io(format!(
                "Failed to remove PID file {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}
