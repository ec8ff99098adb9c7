//! Process table access: liveness, command lines, and resource metrics.

use chrono::{DateTime, Local, TimeZone as _};
use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};

use super::control::{force_kill, graceful_signal, is_process_alive};
use crate::error::Result;

/// A process as seen during a table scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub argv: Vec<String>,
}

/// OS-level metrics for a single process.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessStats {
    pub cpu_percent: f32,
    pub mem_percent: f32,
    pub resident_bytes: u64,
    pub uptime_secs: u64,
    pub started_at: Option<DateTime<Local>>,
}

/// Read access to the OS process table.
pub trait ProcessTable: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
    fn command_line(&self, pid: u32) -> Option<Vec<String>>;
    /// Every process except the caller.
    fn scan(&self) -> Vec<ProcessEntry>;
    fn stats(&self, pid: u32) -> Option<ProcessStats>;
}

/// Signal delivery. Both calls succeed when the target is already gone.
pub trait ProcessSignals: Send + Sync {
    fn terminate(&self, pid: u32) -> Result<()>;
    fn kill(&self, pid: u32) -> Result<()>;
}

/// [`ProcessTable`] and [`ProcessSignals`] backed by the running OS.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcesses;

fn argv_of(process: &sysinfo::Process) -> Vec<String> {
    process
        .cmd()
        .iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect()
}

fn refresh_one(pid: u32, kind: ProcessRefreshKind) -> System {
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true, kind);
    system
}

impl ProcessTable for SystemProcesses {
    fn is_alive(&self, pid: u32) -> bool {
        if !is_process_alive(pid) {
            return false;
        }
        // kill(0) succeeds for zombies; they hold no resources worth waiting on.
        refresh_one(pid, ProcessRefreshKind::nothing())
            .process(Pid::from_u32(pid))
            .map(|process| process.status() != ProcessStatus::Zombie)
            .unwrap_or(true)
    }

    fn command_line(&self, pid: u32) -> Option<Vec<String>> {
        let system = refresh_one(pid, ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always));
        system.process(Pid::from_u32(pid)).map(argv_of)
    }

    fn scan(&self) -> Vec<ProcessEntry> {
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
        );
        let own = std::process::id();
        let mut entries: Vec<ProcessEntry> = system
            .processes()
            .iter()
            .filter(|(pid, process)| {
                pid.as_u32() != own
                    && process.thread_kind().is_none()
                    && process.status() != ProcessStatus::Zombie
            })
            .map(|(pid, process)| ProcessEntry {
                pid: pid.as_u32(),
                argv: argv_of(process),
            })
            .collect();
        entries.sort_by_key(|entry| entry.pid);
        entries
    }

    fn stats(&self, pid: u32) -> Option<ProcessStats> {
        let target = Pid::from_u32(pid);
        let kind = ProcessRefreshKind::nothing().with_cpu().with_memory();
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_processes_specifics(ProcessesToUpdate::Some(&[target]), true, kind);
        // CPU usage is a delta between two samples.
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        system.refresh_processes_specifics(ProcessesToUpdate::Some(&[target]), true, kind);

        let process = system.process(target)?;
        let total = system.total_memory();
        let mem_percent = if total == 0 {
            0.0
        } else {
            (process.memory() as f64 / total as f64 * 100.0) as f32
        };
        let started_at = i64::try_from(process.start_time())
            .ok()
            .and_then(|secs| Local.timestamp_opt(secs, 0).single());

        Some(ProcessStats {
            cpu_percent: process.cpu_usage(),
            mem_percent,
            resident_bytes: process.memory(),
            uptime_secs: process.run_time(),
            started_at,
        })
    }
}

impl ProcessSignals for SystemProcesses {
    fn terminate(&self, pid: u32) -> Result<()> {
        graceful_signal(pid)
    }

    fn kill(&self, pid: u32) -> Result<()> {
        force_kill(pid)
    }
}

/// Render seconds as `1d 02:03:04` / `02:03:04`.
pub fn format_uptime(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if days > 0 {
        format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    }
}

/// Render a byte count with a binary unit.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
