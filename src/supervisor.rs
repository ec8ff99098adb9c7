//! Worker lifecycle management (start/stop/status/restart).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::{ShutdownConfig, StartupConfig, SupervisorConfig, WorkerConfig};
use crate::error::{AppError, Result};
use crate::process::{
    gpu, DetachedSpawner, GpuQuery, HealthProbe, HttpHealthProbe, InstanceLocator, LaunchCommand,
    LocateSource, PidFile, PortProbe, ProcessLauncher, ProcessSignals, ProcessTable,
    ShutdownOutcome, ShutdownSequencer, SocketTable, Spawner, SystemProcesses, WorkerSignature,
};
use crate::status::{StatusReporter, StatusView};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A worker was already running; nothing was launched.
    AlreadyRunning { pid: u32 },
    Running { pid: u32 },
    /// Launched, but readiness was not confirmed within the wait budget.
    Unconfirmed { pid: u32, port_listening: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Stopped { pid: u32, outcome: ShutdownOutcome },
}

/// The OS-facing collaborators. Tests substitute fakes.
pub struct Backends {
    pub table: Arc<dyn ProcessTable>,
    pub signals: Arc<dyn ProcessSignals>,
    pub ports: Arc<dyn PortProbe>,
    pub health: Arc<dyn HealthProbe>,
    pub gpu: Arc<dyn GpuQuery>,
    pub spawner: Arc<dyn Spawner>,
}

impl Backends {
    pub fn system(config: &SupervisorConfig) -> Result<Self> {
        let processes = Arc::new(SystemProcesses);
        let health = HttpHealthProbe::new(
            config.health_url(),
            config.concurrency_url(),
            Duration::from_millis(config.startup.health_timeout_ms),
        )?;
        Ok(Self {
            table: Arc::clone(&processes) as Arc<dyn ProcessTable>,
            signals: processes,
            ports: Arc::new(SocketTable),
            health: Arc::new(health),
            gpu: gpu::detect(&config.gpu),
            spawner: Arc::new(DetachedSpawner),
        })
    }
}

enum Readiness {
    Healthy,
    Exited,
    TimedOut { port_listening: bool },
}

/// Drives one worker through its lifecycle.
pub struct Supervisor {
    worker: WorkerConfig,
    startup: StartupConfig,
    shutdown: ShutdownConfig,
    backends: Backends,
    locator: Arc<InstanceLocator>,
    launcher: ProcessLauncher,
    sequencer: ShutdownSequencer,
    reporter: StatusReporter,
    phase: Phase,
}

impl Supervisor {
    pub fn new(config: &SupervisorConfig, backends: Backends) -> Self {
        let pid_file = PidFile::new(config.paths.pid_file.clone());
        let locator = Arc::new(InstanceLocator::new(
            pid_file.clone(),
            WorkerSignature::from_config(&config.worker),
            Arc::clone(&backends.table),
        ));
        let launcher = ProcessLauncher::new(
            Arc::clone(&backends.spawner),
            Arc::clone(&backends.ports),
            config.worker.port,
            config.paths.log_file.clone(),
        );
        let sequencer = ShutdownSequencer::new(
            Arc::clone(&backends.table),
            Arc::clone(&backends.signals),
            Arc::clone(&backends.gpu),
            pid_file,
            config.shutdown.graceful,
            config.shutdown.forced,
            config.shutdown.gpu_release,
        );
        let reporter = StatusReporter::new(
            Arc::clone(&locator),
            Arc::clone(&backends.table),
            Arc::clone(&backends.ports),
            Arc::clone(&backends.health),
            Arc::clone(&backends.gpu),
            config.worker.port,
            config.paths.log_file.clone(),
        );
        Self {
            worker: config.worker.clone(),
            startup: config.startup.clone(),
            shutdown: config.shutdown.clone(),
            backends,
            locator,
            launcher,
            sequencer,
            reporter,
            phase: Phase::Stopped,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Launch the worker and wait for it to become healthy.
    pub async fn start(&mut self) -> Result<StartOutcome> {
        if let Some(found) = self.locator.locate() {
            if found.source == LocateSource::ProcessScan {
                log::info!("Recording pid {} found by process scan", found.pid);
                if let Err(e) = self.locator.pid_file().write(found.pid) {
                    log::warn!("Failed to repair PID file: {}", e);
                }
            }
            log::warn!("{}", AppError::already_running(found.pid));
            self.phase = Phase::Running;
            return Ok(StartOutcome::AlreadyRunning { pid: found.pid });
        }
        if let Some(stale) = self.locator.stale_pid() {
            log::info!("Ignoring stale PID file entry {}", stale);
        }

        self.phase = Phase::Starting;
        let command = LaunchCommand::from_config(&self.worker);
        let pid = match self.launcher.launch(&self.locator, &command) {
            Ok(pid) => pid,
            Err(e) => {
                self.phase = Phase::Failed;
                return Err(e);
            }
        };

        match self.wait_ready(pid).await {
            Readiness::Healthy => {
                log::info!("Worker started (pid: {}, port: {})", pid, self.worker.port);
                self.phase = Phase::Running;
                Ok(StartOutcome::Running { pid })
            }
            Readiness::Exited => {
                self.phase = Phase::Failed;
                if let Err(e) = self.locator.pid_file().remove() {
                    log::warn!("{}", e);
                }
                Err(AppError::launch_failed(
                    format!("worker process {} exited during startup", pid),
                    self.launcher.log_file(),
                ))
            }
            Readiness::TimedOut { port_listening } => {
                log::warn!(
                    "Worker {} not confirmed healthy yet ({}); it may still be loading",
                    pid,
                    if port_listening {
                        "port listening, health pending"
                    } else {
                        "port not listening"
                    }
                );
                Ok(StartOutcome::Unconfirmed {
                    pid,
                    port_listening,
                })
            }
        }
    }

    /// Poll the port, then health. A dead worker ends either wait early.
    async fn wait_ready(&self, pid: u32) -> Readiness {
        let exited = AtomicBool::new(false);
        let port = self.worker.port;

        let listening = self
            .startup
            .port_poll
            .wait_until(|| {
                if !self.backends.table.is_alive(pid) {
                    exited.store(true, Ordering::Relaxed);
                    return true;
                }
                self.backends.ports.is_listening(port)
            })
            .await;
        if exited.load(Ordering::Relaxed) {
            return Readiness::Exited;
        }
        let Some(attempt) = listening else {
            return Readiness::TimedOut {
                port_listening: false,
            };
        };
        log::info!("Port {} listening after {} checks", port, attempt);

        let healthy = self
            .startup
            .health_poll
            .wait_until_async(|| {
                let exited = &exited;
                async move {
                    if !self.backends.table.is_alive(pid) {
                        exited.store(true, Ordering::Relaxed);
                        return true;
                    }
                    let report = self.backends.health.fetch_health().await;
                    log::debug!("Health: {:?}", report.status());
                    report.is_healthy()
                }
            })
            .await;
        if exited.load(Ordering::Relaxed) {
            Readiness::Exited
        } else if healthy.is_some() {
            Readiness::Healthy
        } else {
            Readiness::TimedOut {
                port_listening: true,
            }
        }
    }

    /// Stop the worker, escalating to SIGKILL when needed.
    pub async fn stop(&mut self) -> Result<StopOutcome> {
        let Some(found) = self.locator.locate() else {
            if let Some(stale) = self.locator.stale_pid() {
                log::info!("Removing stale PID file entry {}", stale);
                if let Err(e) = self.locator.pid_file().remove() {
                    log::warn!("{}", e);
                }
            }
            log::info!("{}", AppError::not_running());
            self.phase = Phase::Stopped;
            return Ok(StopOutcome::NotRunning);
        };

        self.phase = Phase::Stopping;
        log::info!("Stopping worker (pid: {})", found.pid);
        let outcome = self.sequencer.shutdown(found.pid).await;
        if outcome.is_stopped() {
            log::info!("Worker {} stopped ({:?})", found.pid, outcome);
            self.phase = Phase::Stopped;
            Ok(StopOutcome::Stopped {
                pid: found.pid,
                outcome,
            })
        } else {
            self.phase = Phase::Failed;
            Err(AppError::forced_termination_failed(found.pid))
        }
    }

    pub async fn status(&self) -> StatusView {
        self.reporter.snapshot().await
    }

    /// Full stop, settle delay, orphan sweep, then start.
    pub async fn restart(&mut self) -> Result<StartOutcome> {
        self.stop().await?;

        let delay = Duration::from_millis(self.shutdown.restart_delay_ms);
        if !delay.is_zero() {
            log::info!("Waiting {}s for resources to settle", delay.as_secs_f32());
            tokio::time::sleep(delay).await;
        }
        self.sweep_orphans().await;
        self.start().await
    }

    /// Force-kill stray worker processes. Failures are logged, never fatal.
    async fn sweep_orphans(&self) -> usize {
        let orphans = self.locator.orphans();
        for &pid in &orphans {
            log::warn!("Killing orphan worker process {}", pid);
            if let Err(e) = self.backends.signals.kill(pid) {
                log::warn!("{}", AppError::orphan_cleanup_failed(pid, e.to_string()));
                continue;
            }
            let gone = self
                .shutdown
                .forced
                .wait_until(|| !self.backends.table.is_alive(pid))
                .await;
            if gone.is_none() {
                log::warn!(
                    "{}",
                    AppError::orphan_cleanup_failed(pid, "still alive after SIGKILL")
                );
                continue;
            }
            self.sequencer.wait_gpu_release(pid).await;
        }
        orphans.len()
    }
}

/// Build a supervisor wired to the running host.
pub fn system_supervisor(config: &SupervisorConfig) -> Result<Supervisor> {
    Ok(Supervisor::new(config, Backends::system(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::process::PollPolicy;
    use crate::status::InstanceState;
    use crate::testing::{healthy, unreachable, worker_argv, FakeHost};

    struct Fixture {
        _dir: tempfile::TempDir,
        host: Arc<FakeHost>,
        supervisor: Supervisor,
        pid_file: PidFile,
    }

    fn test_config(dir: &std::path::Path) -> SupervisorConfig {
        let mut config = SupervisorConfig::default();
        config.paths.pid_file = dir.join("api_server.pid");
        config.paths.log_file = dir.join("logs").join("api_server.log");
        config.startup.port_poll = PollPolicy::immediate(10);
        config.startup.health_poll = PollPolicy::immediate(10);
        config.shutdown.graceful = PollPolicy::immediate(10);
        config.shutdown.forced = PollPolicy::immediate(3);
        config.shutdown.gpu_release = PollPolicy::immediate(3);
        config.shutdown.restart_delay_ms = 0;
        config
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let host = Arc::new(FakeHost::default());
        let backends = Backends {
            table: Arc::clone(&host) as Arc<dyn ProcessTable>,
            signals: Arc::clone(&host) as Arc<dyn ProcessSignals>,
            ports: Arc::clone(&host) as Arc<dyn PortProbe>,
            health: Arc::clone(&host) as Arc<dyn HealthProbe>,
            gpu: Arc::clone(&host) as Arc<dyn GpuQuery>,
            spawner: Arc::clone(&host) as Arc<dyn Spawner>,
        };
        Fixture {
            pid_file: PidFile::new(config.paths.pid_file.clone()),
            supervisor: Supervisor::new(&config, backends),
            host,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn start_waits_for_port_before_health() {
        let mut f = fixture();
        f.host.spawned_workers_listen(8049, 3);
        f.host.push_health(healthy());

        let outcome = f.supervisor.start().await.unwrap();
        let pid = f.host.spawned()[0];
        assert_eq!(outcome, StartOutcome::Running { pid });
        assert_eq!(f.supervisor.phase(), Phase::Running);
        // One guard check before spawn, three misses, then the hit.
        assert_eq!(f.host.port_checks(8049), 5);
        assert_eq!(f.host.health_calls(), 1);
        assert_eq!(f.pid_file.read(), Some(pid));
    }

    #[tokio::test]
    async fn start_keeps_polling_health_until_healthy() {
        let mut f = fixture();
        f.host.spawned_workers_listen(8049, 0);
        f.host.push_health(unreachable());
        f.host.push_health(unreachable());
        f.host.push_health(unreachable());
        f.host.push_health(healthy());

        let outcome = f.supervisor.start().await.unwrap();
        assert!(matches!(outcome, StartOutcome::Running { .. }));
        assert_eq!(f.host.health_calls(), 4);
    }

    #[tokio::test]
    async fn exhausted_health_budget_is_unconfirmed_not_failed() {
        let mut f = fixture();
        f.host.spawned_workers_listen(8049, 0);
        f.host.push_health(unreachable());

        let outcome = f.supervisor.start().await.unwrap();
        assert!(matches!(
            outcome,
            StartOutcome::Unconfirmed {
                port_listening: true,
                ..
            }
        ));
        assert_eq!(f.host.health_calls(), 10);
        assert_eq!(f.supervisor.phase(), Phase::Starting);
    }

    #[tokio::test]
    async fn port_never_listening_is_unconfirmed() {
        let mut f = fixture();
        let outcome = f.supervisor.start().await.unwrap();
        assert!(matches!(
            outcome,
            StartOutcome::Unconfirmed {
                port_listening: false,
                ..
            }
        ));
        assert_eq!(f.host.health_calls(), 0);
    }

    #[tokio::test]
    async fn worker_dying_during_startup_is_launch_failure() {
        let mut f = fixture();
        f.host.crash_on_spawn(0);

        let err = f.supervisor.start().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LaunchFailed);
        assert!(err.get("log").unwrap().ends_with("api_server.log"));
        assert_eq!(f.supervisor.phase(), Phase::Failed);
        assert_eq!(f.pid_file.read(), None);
    }

    #[tokio::test]
    async fn second_start_never_launches_a_duplicate() {
        let mut f = fixture();
        f.host.spawned_workers_listen(8049, 0);
        f.host.push_health(healthy());

        let first = f.supervisor.start().await.unwrap();
        let second = f.supervisor.start().await.unwrap();
        let pid = f.host.spawned()[0];
        assert_eq!(first, StartOutcome::Running { pid });
        assert_eq!(second, StartOutcome::AlreadyRunning { pid });
        assert_eq!(f.host.spawned().len(), 1);
    }

    #[tokio::test]
    async fn start_adopts_worker_found_by_scan() {
        let mut f = fixture();
        f.host.add_process(4242, &worker_argv(8049));

        let outcome = f.supervisor.start().await.unwrap();
        assert_eq!(outcome, StartOutcome::AlreadyRunning { pid: 4242 });
        assert_eq!(f.pid_file.read(), Some(4242));
        assert!(f.host.spawned().is_empty());
    }

    #[tokio::test]
    async fn port_conflict_fails_start() {
        let mut f = fixture();
        f.host.set_listening(8049, true);

        let err = f.supervisor.start().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PortInUse);
        assert!(f.host.spawned().is_empty());
    }

    #[tokio::test]
    async fn stale_pid_file_does_not_block_start() {
        let mut f = fixture();
        f.pid_file.write(12345).unwrap();
        f.host.spawned_workers_listen(8049, 0);
        f.host.push_health(healthy());

        let outcome = f.supervisor.start().await.unwrap();
        let pid = f.host.spawned()[0];
        assert_eq!(outcome, StartOutcome::Running { pid });
        assert_eq!(f.pid_file.read(), Some(pid));
    }

    #[tokio::test]
    async fn stop_without_a_worker_is_a_no_op() {
        let mut f = fixture();
        assert_eq!(f.supervisor.stop().await.unwrap(), StopOutcome::NotRunning);
        assert_eq!(f.supervisor.stop().await.unwrap(), StopOutcome::NotRunning);
        assert!(f.host.signals_sent().is_empty());
    }

    #[tokio::test]
    async fn stop_cleans_up_stale_pid_file() {
        let mut f = fixture();
        f.pid_file.write(12345).unwrap();
        assert_eq!(f.supervisor.stop().await.unwrap(), StopOutcome::NotRunning);
        assert!(!f.pid_file.path().exists());
    }

    #[tokio::test]
    async fn start_stop_status_ends_stopped() {
        let mut f = fixture();
        f.host.spawned_workers_listen(8049, 0);
        f.host.push_health(healthy());

        f.supervisor.start().await.unwrap();
        let pid = f.host.spawned()[0];
        let stopped = f.supervisor.stop().await.unwrap();
        assert_eq!(
            stopped,
            StopOutcome::Stopped {
                pid,
                outcome: ShutdownOutcome::Graceful
            }
        );
        assert_eq!(f.supervisor.phase(), Phase::Stopped);
        let view = f.supervisor.status().await;
        assert_eq!(view.state, InstanceState::Stopped);
        assert_eq!(f.pid_file.read(), None);
    }

    #[tokio::test]
    async fn ignored_term_is_forced_and_pid_file_removed() {
        let mut f = fixture();
        f.pid_file.write(300).unwrap();
        f.host.add_process(300, &worker_argv(8049));
        f.host.ignore_term(300);

        let stopped = f.supervisor.stop().await.unwrap();
        assert_eq!(
            stopped,
            StopOutcome::Stopped {
                pid: 300,
                outcome: ShutdownOutcome::Forced
            }
        );
        assert_eq!(f.host.signals_sent(), vec![("TERM", 300), ("KILL", 300)]);
        assert_eq!(f.pid_file.read(), None);
    }

    #[tokio::test]
    async fn unkillable_worker_fails_stop() {
        let mut f = fixture();
        f.host.add_process(301, &worker_argv(8049));
        f.host.ignore_term(301);
        f.host.ignore_kill(301);

        let err = f.supervisor.stop().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ForcedTerminationFailed);
        assert_eq!(f.supervisor.phase(), Phase::Failed);
    }

    #[tokio::test]
    async fn crashed_worker_is_detected_as_stopped() {
        let mut f = fixture();
        f.host.spawned_workers_listen(8049, 0);
        f.host.push_health(healthy());
        f.supervisor.start().await.unwrap();
        let pid = f.host.spawned()[0];

        f.host.crash(pid);
        let view = f.supervisor.status().await;
        assert_eq!(view.state, InstanceState::Stopped);
        assert_eq!(view.stale_pid, Some(pid));

        f.host.set_listening(8049, false);
        f.host.spawned_workers_listen(8049, 0);
        let outcome = f.supervisor.start().await.unwrap();
        assert!(matches!(outcome, StartOutcome::Running { .. }));
        assert_eq!(f.host.spawned().len(), 2);
    }

    #[tokio::test]
    async fn restart_runs_full_cycle_when_already_stopped() {
        let mut f = fixture();
        f.host.spawned_workers_listen(8049, 0);
        f.host.push_health(healthy());

        let scans_before = f.host.scans();
        let outcome = f.supervisor.restart().await.unwrap();
        assert!(matches!(outcome, StartOutcome::Running { .. }));
        assert_eq!(f.host.spawned().len(), 1);
        // stop, orphan sweep and start each consult the process table.
        assert!(f.host.scans() >= scans_before + 3);
    }

    #[tokio::test]
    async fn restart_sweeps_orphans_before_starting() {
        let mut f = fixture();
        f.pid_file.write(500).unwrap();
        f.host.add_process(500, &worker_argv(8049));
        f.host.add_process(600, &worker_argv(8049));
        f.host.ignore_term(600);
        f.host.spawned_workers_listen(8049, 0);
        f.host.push_health(healthy());

        let outcome = f.supervisor.restart().await.unwrap();
        assert!(matches!(outcome, StartOutcome::Running { .. }));
        let signals = f.host.signals_sent();
        assert_eq!(signals[0], ("TERM", 500));
        assert!(signals.contains(&("KILL", 600)));
        assert!(!f.host.live_pids().contains(&500));
        assert!(!f.host.live_pids().contains(&600));
        assert_eq!(f.host.spawned().len(), 1);
    }

    #[tokio::test]
    async fn restart_leaves_workers_on_other_ports_alone() {
        let mut f = fixture();
        f.host.add_process(700, &worker_argv(9000));
        f.host.spawned_workers_listen(8049, 0);
        f.host.push_health(healthy());

        let outcome = f.supervisor.restart().await.unwrap();
        assert!(matches!(outcome, StartOutcome::Running { .. }));
        assert!(f.host.live_pids().contains(&700));
        assert!(f.host.signals_sent().is_empty());
    }

    #[tokio::test]
    async fn restart_aborts_when_stop_fails() {
        let mut f = fixture();
        f.host.add_process(800, &worker_argv(8049));
        f.host.ignore_term(800);
        f.host.ignore_kill(800);

        let err = f.supervisor.restart().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ForcedTerminationFailed);
        assert!(f.host.spawned().is_empty());
    }
}
