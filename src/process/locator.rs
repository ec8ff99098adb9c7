//! Resolves the running worker instance, if any.

use std::sync::Arc;

use serde::Serialize;

use super::pidfile::PidFile;
use super::signature::WorkerSignature;
use super::table::ProcessTable;

/// Where a located pid came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LocateSource {
    PidFile,
    ProcessScan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Located {
    pub pid: u32,
    pub source: LocateSource,
}

/// Finds the worker through the PID file, falling back to a process-table
/// scan. Never mutates anything; callers decide whether to repair the PID file.
pub struct InstanceLocator {
    pid_file: PidFile,
    signature: WorkerSignature,
    table: Arc<dyn ProcessTable>,
}

impl InstanceLocator {
    pub fn new(pid_file: PidFile, signature: WorkerSignature, table: Arc<dyn ProcessTable>) -> Self {
        Self {
            pid_file,
            signature,
            table,
        }
    }

    pub fn pid_file(&self) -> &PidFile {
        &self.pid_file
    }

    pub fn locate(&self) -> Option<Located> {
        if let Some(pid) = self.from_pid_file() {
            return Some(Located {
                pid,
                source: LocateSource::PidFile,
            });
        }
        self.orphans().into_iter().next().map(|pid| Located {
            pid,
            source: LocateSource::ProcessScan,
        })
    }

    /// The recorded pid, when it no longer identifies a live worker.
    pub fn stale_pid(&self) -> Option<u32> {
        let pid = self.pid_file.read()?;
        (!self.is_worker(pid)).then_some(pid)
    }

    /// Every live process carrying the worker signature, in pid order.
    pub fn orphans(&self) -> Vec<u32> {
        self.table
            .scan()
            .into_iter()
            .filter(|entry| self.signature.matches(&entry.argv))
            .map(|entry| entry.pid)
            .collect()
    }

    fn from_pid_file(&self) -> Option<u32> {
        let pid = self.pid_file.read()?;
        if self.is_worker(pid) {
            Some(pid)
        } else {
            log::debug!(
                "PID file {} points at {} which is not a live worker",
                self.pid_file.path().display(),
                pid
            );
            None
        }
    }

    /// Live and carrying the worker signature; guards against pid reuse.
    fn is_worker(&self, pid: u32) -> bool {
        self.table.is_alive(pid)
            && self
                .table
                .command_line(pid)
                .is_some_and(|argv| self.signature.matches(&argv))
    }
}
