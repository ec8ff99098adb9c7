//! In-memory host used by unit tests.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs::File;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{AppError, Result};
use crate::process::{
    GpuDevice, GpuMemory, GpuQuery, HealthProbe, HealthReport, HealthSnapshot, LaunchCommand,
    PortProbe, ProcessEntry, ProcessSignals, ProcessStats, ProcessTable, Spawner,
};

pub fn worker_argv(port: u16) -> Vec<String> {
    ["python3", "api_server.py", "--api_port", &port.to_string()]
        .iter()
        .map(ToString::to_string)
        .collect()
}

pub fn healthy() -> HealthReport {
    HealthReport::Reachable(HealthSnapshot {
        status: "healthy".to_string(),
        model_loaded: true,
        model_version: Some("2.0".to_string()),
        device: Some("cuda:0".to_string()),
        fp16_enabled: Some(true),
        available_prompts: Some(4),
        available_emotions: Some(8),
        cache_size: None,
    })
}

pub fn unreachable() -> HealthReport {
    HealthReport::Unreachable("connection refused".to_string())
}

#[derive(Debug, Clone, Copy)]
enum OnTerm {
    ExitAfterChecks(u32),
    Ignore,
}

#[derive(Debug)]
struct FakeProcess {
    argv: Vec<String>,
    on_term: OnTerm,
    term_fails: bool,
    kill_ignored: bool,
    /// Liveness checks left before a terminated process disappears.
    dying: Option<u32>,
}

#[derive(Debug, Default)]
struct PortState {
    listening: bool,
    /// Checks left before the port starts listening.
    listen_after: Option<u32>,
    checks: u32,
}

#[derive(Debug)]
struct GpuHold {
    mib: u64,
    release_after: u32,
}

#[derive(Debug, Default)]
struct State {
    processes: BTreeMap<u32, FakeProcess>,
    signals: Vec<(&'static str, u32)>,
    ports: HashMap<u16, PortState>,
    gpu: HashMap<u32, GpuHold>,
    gpu_queries: HashMap<u32, u32>,
    health: VecDeque<HealthReport>,
    health_calls: u32,
    concurrency: Option<serde_json::Map<String, serde_json::Value>>,
    spawned: Vec<u32>,
    spawn_fails: bool,
    next_pid: u32,
    scans: u32,
    /// Port a freshly spawned worker binds after this many checks.
    spawn_listens: Option<(u16, u32)>,
    crash_on_spawn: HashSet<usize>,
}

/// Fake process table, signal sink, socket table, GPU, spawner and health endpoint.
#[derive(Debug, Default)]
pub struct FakeHost {
    state: Mutex<State>,
}

impl FakeHost {
    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_process<S: AsRef<str>>(&self, pid: u32, argv: &[S]) {
        self.state().processes.insert(
            pid,
            FakeProcess {
                argv: argv.iter().map(|a| a.as_ref().to_string()).collect(),
                on_term: OnTerm::ExitAfterChecks(0),
                term_fails: false,
                kill_ignored: false,
                dying: None,
            },
        );
    }

    /// Simulate the process vanishing without cleanup.
    pub fn crash(&self, pid: u32) {
        self.state().processes.remove(&pid);
    }

    fn with_process(&self, pid: u32, f: impl FnOnce(&mut FakeProcess)) {
        if let Some(process) = self.state().processes.get_mut(&pid) {
            f(process);
        }
    }

    pub fn exit_after_checks_on_term(&self, pid: u32, checks: u32) {
        self.with_process(pid, |p| p.on_term = OnTerm::ExitAfterChecks(checks));
    }

    pub fn ignore_term(&self, pid: u32) {
        self.with_process(pid, |p| p.on_term = OnTerm::Ignore);
    }

    pub fn ignore_kill(&self, pid: u32) {
        self.with_process(pid, |p| p.kill_ignored = true);
    }

    pub fn fail_term(&self, pid: u32) {
        self.with_process(pid, |p| p.term_fails = true);
    }

    pub fn signals_sent(&self) -> Vec<(&'static str, u32)> {
        self.state().signals.clone()
    }

    pub fn set_listening(&self, port: u16, listening: bool) {
        let mut state = self.state();
        let entry = state.ports.entry(port).or_default();
        entry.listening = listening;
        entry.listen_after = None;
    }

    pub fn port_checks(&self, port: u16) -> u32 {
        self.state().ports.get(&port).map(|p| p.checks).unwrap_or(0)
    }

    /// Spawned workers bind `port` once it has been checked `checks` times.
    pub fn spawned_workers_listen(&self, port: u16, checks: u32) {
        self.state().spawn_listens = Some((port, checks));
    }

    /// The `nth` spawn (0-based) dies right after starting.
    pub fn crash_on_spawn(&self, nth: usize) {
        self.state().crash_on_spawn.insert(nth);
    }

    pub fn hold_gpu(&self, pid: u32, mib: u64, release_after: u32) {
        self.state().gpu.insert(pid, GpuHold { mib, release_after });
    }

    pub fn gpu_queries(&self, pid: u32) -> u32 {
        self.state().gpu_queries.get(&pid).copied().unwrap_or(0)
    }

    pub fn push_health(&self, report: HealthReport) {
        self.state().health.push_back(report);
    }

    pub fn health_calls(&self) -> u32 {
        self.state().health_calls
    }

    pub fn set_concurrency(&self, stats: serde_json::Value) {
        if let serde_json::Value::Object(map) = stats {
            self.state().concurrency = Some(map);
        }
    }

    pub fn fail_spawn(&self) {
        self.state().spawn_fails = true;
    }

    pub fn spawned(&self) -> Vec<u32> {
        self.state().spawned.clone()
    }

    pub fn scans(&self) -> u32 {
        self.state().scans
    }

    pub fn live_pids(&self) -> Vec<u32> {
        self.state().processes.keys().copied().collect()
    }
}

impl ProcessTable for FakeHost {
    fn is_alive(&self, pid: u32) -> bool {
        let mut state = self.state();
        let Some(process) = state.processes.get_mut(&pid) else {
            return false;
        };
        let dying = process.dying;
        match dying {
            Some(0) => {
                state.processes.remove(&pid);
                false
            }
            Some(left) => {
                process.dying = Some(left - 1);
                true
            }
            None => true,
        }
    }

    fn command_line(&self, pid: u32) -> Option<Vec<String>> {
        self.state().processes.get(&pid).map(|p| p.argv.clone())
    }

    fn scan(&self) -> Vec<ProcessEntry> {
        let mut state = self.state();
        state.scans += 1;
        state
            .processes
            .iter()
            .map(|(pid, p)| ProcessEntry {
                pid: *pid,
                argv: p.argv.clone(),
            })
            .collect()
    }

    fn stats(&self, pid: u32) -> Option<ProcessStats> {
        self.state()
            .processes
            .contains_key(&pid)
            .then_some(ProcessStats {
                cpu_percent: 12.5,
                mem_percent: 3.0,
                resident_bytes: 512 * 1024 * 1024,
                uptime_secs: 3723,
                started_at: None,
            })
    }
}

impl ProcessSignals for FakeHost {
    fn terminate(&self, pid: u32) -> Result<()> {
        let mut state = self.state();
        if let Some(process) = state.processes.get_mut(&pid) {
            if process.term_fails {
                return Err(AppError::process(format!(
                    "Failed to send SIGTERM to PID {}: EPERM",
                    pid
                )));
            }
            if let OnTerm::ExitAfterChecks(checks) = process.on_term {
                process.dying = Some(checks);
            }
        }
        state.signals.push(("TERM", pid));
        Ok(())
    }

    fn kill(&self, pid: u32) -> Result<()> {
        let mut state = self.state();
        state.signals.push(("KILL", pid));
        let ignored = state
            .processes
            .get(&pid)
            .is_some_and(|process| process.kill_ignored);
        if !ignored {
            state.processes.remove(&pid);
        }
        Ok(())
    }
}

impl PortProbe for FakeHost {
    fn is_listening(&self, port: u16) -> bool {
        let mut state = self.state();
        let entry = state.ports.entry(port).or_default();
        entry.checks += 1;
        if let Some(left) = entry.listen_after {
            if left == 0 {
                entry.listening = true;
                entry.listen_after = None;
            } else {
                entry.listen_after = Some(left - 1);
            }
        }
        entry.listening
    }
}

impl GpuQuery for FakeHost {
    fn process_memory(&self, pid: u32) -> GpuMemory {
        let mut state = self.state();
        let queries = {
            let count = state.gpu_queries.entry(pid).or_insert(0);
            *count += 1;
            *count
        };
        match state.gpu.get(&pid) {
            Some(hold) if queries <= hold.release_after => GpuMemory::Used {
                mib: Some(hold.mib),
            },
            _ => GpuMemory::NotHeld,
        }
    }

    fn devices(&self) -> Option<Vec<GpuDevice>> {
        Some(vec![GpuDevice {
            index: 0,
            name: "Fake GPU".to_string(),
            used_mib: 1024,
            total_mib: 24576,
        }])
    }
}

impl Spawner for FakeHost {
    fn spawn(&self, command: &LaunchCommand, _log: File) -> std::io::Result<u32> {
        let (pid, crashes) = {
            let mut state = self.state();
            if state.spawn_fails {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "No such file or directory",
                ));
            }
            state.next_pid = state.next_pid.max(1000) + 1;
            let pid = state.next_pid;
            let nth = state.spawned.len();
            state.spawned.push(pid);
            if let Some((port, checks)) = state.spawn_listens {
                let entry = state.ports.entry(port).or_default();
                entry.listening = false;
                entry.listen_after = Some(checks);
            }
            (pid, state.crash_on_spawn.contains(&nth))
        };
        if !crashes {
            let mut argv = vec![command.program.clone()];
            argv.extend(command.args.iter().cloned());
            self.add_process(pid, &argv);
        }
        Ok(pid)
    }
}

#[async_trait]
impl HealthProbe for FakeHost {
    async fn fetch_health(&self) -> HealthReport {
        let mut state = self.state();
        state.health_calls += 1;
        if state.health.len() > 1 {
            state.health.pop_front().unwrap_or_else(unreachable)
        } else {
            state.health.front().cloned().unwrap_or_else(unreachable)
        }
    }

    async fn fetch_concurrency(&self) -> Option<serde_json::Map<String, serde_json::Value>> {
        self.state().concurrency.clone()
    }
}
