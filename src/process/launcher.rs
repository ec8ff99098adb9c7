//! Detached worker spawning.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;

use super::locator::InstanceLocator;
use super::port::PortProbe;
use crate::config::WorkerConfig;
use crate::error::{AppError, Result};
use crate::paths::ensure_parent_dir;

/// Everything needed to exec the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl LaunchCommand {
    pub fn from_config(worker: &WorkerConfig) -> Self {
        let mut args = vec![
            worker.script.clone(),
            worker.port_flag.clone(),
            worker.port.to_string(),
        ];
        if !worker.host_flag.is_empty() {
            args.push(worker.host_flag.clone());
            args.push(worker.bind_host.clone());
        }
        args.extend(worker.args.iter().cloned());
        Self {
            program: worker.program.clone(),
            args,
            env: worker.env.clone(),
            working_dir: worker.working_dir.clone(),
        }
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Starts a process whose stdout and stderr go to `log`, returning its pid.
pub trait Spawner: Send + Sync {
    fn spawn(&self, command: &LaunchCommand, log: File) -> std::io::Result<u32>;
}

/// Spawns the worker in its own session so it outlives the supervisor.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedSpawner;

impl Spawner for DetachedSpawner {
    fn spawn(&self, command: &LaunchCommand, log: File) -> std::io::Result<u32> {
        let stderr = log.try_clone()?;
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr));
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }

        #[cfg(unix)]
        {
            // SAFETY: setsid is async-signal-safe and touches no parent state.
            unsafe {
                cmd.pre_exec(|| {
                    nix::unistd::setsid()
                        .map(|_| ())
                        .map_err(std::io::Error::from)
                });
            }
        }

        let mut child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| std::io::Error::other("spawned worker has no pid"))?;

        // Reap the child if it exits while this invocation is still running.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => log::info!("Worker process {} exited: {}", pid, status),
                Err(e) => log::warn!("Failed to wait for worker process {}: {}", pid, e),
            }
        });

        Ok(pid)
    }
}

/// Launches the worker once the single-instance and port guards pass.
pub struct ProcessLauncher {
    spawner: Arc<dyn Spawner>,
    ports: Arc<dyn PortProbe>,
    port: u16,
    log_file: PathBuf,
}

impl ProcessLauncher {
    pub fn new(
        spawner: Arc<dyn Spawner>,
        ports: Arc<dyn PortProbe>,
        port: u16,
        log_file: PathBuf,
    ) -> Self {
        Self {
            spawner,
            ports,
            port,
            log_file,
        }
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    /// Spawn the worker and record its pid. Does not wait for readiness.
    pub fn launch(&self, locator: &InstanceLocator, command: &LaunchCommand) -> Result<u32> {
        if let Some(found) = locator.locate() {
            return Err(AppError::already_running(found.pid));
        }
        if self.ports.is_listening(self.port) {
            return Err(AppError::port_in_use(self.port));
        }

        let log = self.open_log(command)?;
        let pid = self.spawner.spawn(command, log).map_err(|e| {
            AppError::launch_failed(
                format!("failed to spawn `{}`: {}", command.program, e),
                &self.log_file,
            )
        })?;

        if let Err(e) = locator.pid_file().write(pid) {
            log::warn!(
                "Worker {} is running but its PID file could not be written",
                pid
            );
            return Err(e);
        }
        log::info!("Launched worker (pid: {}, port: {})", pid, self.port);
        Ok(pid)
    }

    fn open_log(&self, command: &LaunchCommand) -> Result<File> {
        ensure_parent_dir(&self.log_file)?;
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
            .map_err(|e| {
                AppError::launch_failed(
                    format!("cannot open log file: {}", e),
                    &self.log_file,
                )
            })?;
        writeln!(
            log,
            "=== launch at {}: {} ===",
            chrono::Local::now().to_rfc3339(),
            command.display()
        )?;
        Ok(log)
    }
}
