//! GPU memory accounting, as an optional capability.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use serde::Serialize;

use crate::config::GpuConfig;

/// GPU memory attributed to one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum GpuMemory {
    /// `mib` is `None` when the tool lists the pid without a size (`[N/A]`).
    Used { mib: Option<u64> },
    /// The query tool lists no usage for this pid.
    NotHeld,
    /// No query tool on this host.
    Unavailable,
}

impl GpuMemory {
    /// Absence and unavailability both count as released.
    pub fn is_released(&self) -> bool {
        !matches!(self, Self::Used { .. })
    }
}

impl fmt::Display for GpuMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Used { mib: Some(mib) } => write!(f, "{} MiB", mib),
            Self::Used { mib: None } => write!(f, "held, size not reported"),
            Self::NotHeld => write!(f, "no memory attributed"),
            Self::Unavailable => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpuDevice {
    pub index: u32,
    pub name: String,
    pub used_mib: u64,
    pub total_mib: u64,
}

pub trait GpuQuery: Send + Sync {
    fn process_memory(&self, pid: u32) -> GpuMemory;
    /// Per-device totals, `None` when unavailable.
    fn devices(&self) -> Option<Vec<GpuDevice>>;
}

/// Host without a usable query tool.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGpu;

impl GpuQuery for NoGpu {
    fn process_memory(&self, _pid: u32) -> GpuMemory {
        GpuMemory::Unavailable
    }

    fn devices(&self) -> Option<Vec<GpuDevice>> {
        None
    }
}

/// Queries through `nvidia-smi`'s CSV interface.
#[derive(Debug, Clone)]
pub struct NvidiaSmi {
    command: PathBuf,
}

impl NvidiaSmi {
    pub fn new(command: PathBuf) -> Self {
        Self { command }
    }

    fn query(&self, args: &[&str]) -> Option<String> {
        match Command::new(&self.command).args(args).output() {
            Ok(out) if out.status.success() => Some(String::from_utf8_lossy(&out.stdout).into_owned()),
            Ok(out) => {
                log::debug!(
                    "{} exited with {}: {}",
                    self.command.display(),
                    out.status,
                    String::from_utf8_lossy(&out.stderr).trim()
                );
                None
            }
            Err(e) => {
                log::debug!("Failed to run {}: {}", self.command.display(), e);
                None
            }
        }
    }
}

impl GpuQuery for NvidiaSmi {
    fn process_memory(&self, pid: u32) -> GpuMemory {
        match self.query(&[
            "--query-compute-apps=pid,used_memory",
            "--format=csv,noheader,nounits",
        ]) {
            Some(csv) => parse_compute_apps(&csv, pid),
            None => GpuMemory::Unavailable,
        }
    }

    fn devices(&self) -> Option<Vec<GpuDevice>> {
        self.query(&[
            "--query-gpu=index,name,memory.used,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .map(|csv| parse_devices(&csv))
    }
}

/// Sum usage rows for `pid`; a process may hold contexts on several devices.
/// One unreadable size makes the total unknown.
fn parse_compute_apps(csv: &str, pid: u32) -> GpuMemory {
    let mut total: Option<Option<u64>> = None;
    for line in csv.lines() {
        let mut cols = line.split(',').map(str::trim);
        let (Some(row_pid), Some(used)) = (cols.next(), cols.next()) else {
            continue;
        };
        if row_pid.parse::<u32>().ok() != Some(pid) {
            continue;
        }
        let used = used.parse::<u64>().ok();
        total = Some(match total {
            None => used,
            Some(sum) => sum.zip(used).map(|(a, b)| a + b),
        });
    }
    match total {
        Some(mib) => GpuMemory::Used { mib },
        None => GpuMemory::NotHeld,
    }
}

fn parse_devices(csv: &str) -> Vec<GpuDevice> {
    csv.lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split(',').map(str::trim).collect();
            match cols.as_slice() {
                [index, name, used, total] => Some(GpuDevice {
                    index: index.parse().ok()?,
                    name: (*name).to_string(),
                    used_mib: used.parse().ok()?,
                    total_mib: total.parse().ok()?,
                }),
                _ => None,
            }
        })
        .collect()
}

/// Resolve a command name against `PATH`.
fn find_executable(command: &str) -> Option<PathBuf> {
    let candidate = Path::new(command);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(command))
        .find(|full| full.is_file())
}

/// Pick the GPU backend for this host.
pub fn detect(config: &GpuConfig) -> Arc<dyn GpuQuery> {
    if !config.enabled {
        return Arc::new(NoGpu);
    }
    match find_executable(&config.query_command) {
        Some(path) => {
            log::debug!("GPU queries via {}", path.display());
            Arc::new(NvidiaSmi::new(path))
        }
        None => {
            log::debug!(
                "{} not found; GPU memory reporting disabled",
                config.query_command
            );
            Arc::new(NoGpu)
        }
    }
}
