use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::paths::{
    default_config_path, default_log_file, default_pid_file, ensure_parent_dir, expand_home,
};
use crate::process::PollPolicy;

fn load_config_from_disk(path: &Path) -> Result<SupervisorConfig> {
    let content = fs::read_to_string(path)
        .map_err(|e| AppError::config(format!("{}: {}", path.display(), e)))?;
    toml::from_str(&content).map_err(|e| AppError::config(format!("{}: {}", path.display(), e)))
}

fn save_config_to_disk(path: &Path, config: &SupervisorConfig) -> Result<()> {
    ensure_parent_dir(path)?;
    let content = toml::to_string_pretty(config)?;
    fs::write(path, content).map_err(|e| AppError::config(e.to_string()))
}

/// Load the supervisor configuration.
///
/// An explicitly named file must exist. The default location is bootstrapped
/// with defaults on first use.
pub fn load_config(explicit: Option<&Path>) -> Result<SupervisorConfig> {
    let mut config = match explicit {
        Some(path) => load_config_from_disk(&expand_home(path))?,
        None => {
            let path = default_config_path()?;
            if path.exists() {
                load_config_from_disk(&path)?
            } else {
                let config = SupervisorConfig::default();
                save_config_to_disk(&path, &config)?;
                log::info!("Wrote default configuration to {}", path.display());
                config
            }
        }
    };
    config.normalize();
    config.validate()?;
    Ok(config)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub worker: WorkerConfig,
    pub paths: PathsConfig,
    pub startup: StartupConfig,
    pub shutdown: ShutdownConfig,
    pub gpu: GpuConfig,
}

impl SupervisorConfig {
    fn normalize(&mut self) {
        self.paths.pid_file = expand_home(&self.paths.pid_file);
        self.paths.log_file = expand_home(&self.paths.log_file);
        if let Some(dir) = self.worker.working_dir.take() {
            self.worker.working_dir = Some(expand_home(&dir));
        }
    }

    fn validate(&self) -> Result<()> {
        if self.worker.port == 0 {
            return Err(AppError::config("worker.port must be non-zero"));
        }
        if self.worker.script.trim().is_empty() {
            return Err(AppError::config("worker.script must not be empty"));
        }
        if self.worker.port_flag.trim().is_empty() {
            return Err(AppError::config("worker.port_flag must not be empty"));
        }
        let policies = [
            ("startup.port_poll", self.startup.port_poll),
            ("startup.health_poll", self.startup.health_poll),
            ("shutdown.graceful", self.shutdown.graceful),
            ("shutdown.forced", self.shutdown.forced),
            ("shutdown.gpu_release", self.shutdown.gpu_release),
        ];
        for (name, policy) in policies {
            if policy.max_attempts == 0 {
                return Err(AppError::config(format!(
                    "{}.max_attempts must be at least 1",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn health_url(&self) -> String {
        self.worker.url_for(&self.worker.health_path)
    }

    pub fn concurrency_url(&self) -> String {
        self.worker.url_for(&self.worker.concurrency_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Interpreter or executable that runs the worker.
    pub program: String,
    /// Worker entry point; its file name identifies the worker in the process table.
    pub script: String,
    pub port_flag: String,
    pub port: u16,
    pub host_flag: String,
    pub bind_host: String,
    /// Host used by the supervisor's own probes.
    pub probe_host: String,
    pub health_path: String,
    pub concurrency_path: String,
    pub working_dir: Option<PathBuf>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl WorkerConfig {
    fn url_for(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.probe_host, self.port, path)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            script: "api_server.py".to_string(),
            port_flag: "--api_port".to_string(),
            port: 8049,
            host_flag: "--api_host".to_string(),
            bind_host: "0.0.0.0".to_string(),
            probe_host: "127.0.0.1".to_string(),
            health_path: "/api/v1/health".to_string(),
            concurrency_path: "/api/v1/stats/concurrency".to_string(),
            working_dir: None,
            args: Vec::new(),
            env: BTreeMap::from([("PYTHONUNBUFFERED".to_string(), "1".to_string())]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            log_file: default_log_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    pub port_poll: PollPolicy,
    pub health_poll: PollPolicy,
    pub health_timeout_ms: u64,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            port_poll: PollPolicy::new(2000, 90),
            health_poll: PollPolicy::new(2000, 60),
            health_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub graceful: PollPolicy,
    pub forced: PollPolicy,
    pub gpu_release: PollPolicy,
    pub restart_delay_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            graceful: PollPolicy::new(1000, 10),
            forced: PollPolicy::new(1000, 5),
            gpu_release: PollPolicy::new(1000, 10),
            restart_delay_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    pub enabled: bool,
    pub query_command: String,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            query_command: "nvidia-smi".to_string(),
        }
    }
}
