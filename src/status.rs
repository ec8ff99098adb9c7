//! Best-effort status snapshot of the worker.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::process::{
    format_bytes, format_uptime, GpuDevice, GpuMemory, GpuQuery, HealthProbe, HealthReport,
    HealthSnapshot, HealthStatus, InstanceLocator, LocateSource, PortProbe, ProcessStats,
    ProcessTable,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Stopped,
    /// Process alive, port not bound yet.
    Loading,
    /// Port bound, health endpoint unreachable.
    Listening,
    Unhealthy,
    Healthy,
}

impl InstanceState {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Loading => "starting (port not listening yet, likely still loading)",
            Self::Listening => "listening, health unknown",
            Self::Unhealthy => "running, unhealthy",
            Self::Healthy => "running, healthy",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub state: InstanceState,
    pub port: u16,
    pub pid: Option<u32>,
    pub source: Option<LocateSource>,
    /// PID file content that no longer identifies a live worker.
    pub stale_pid: Option<u32>,
    pub port_listening: bool,
    pub process: Option<ProcessStats>,
    pub health: Option<HealthSnapshot>,
    pub health_error: Option<String>,
    pub concurrency: Option<serde_json::Map<String, serde_json::Value>>,
    pub gpu_memory: Option<GpuMemory>,
    pub gpu_devices: Option<Vec<GpuDevice>>,
    pub log_file: PathBuf,
}

impl StatusView {
    pub fn is_running(&self) -> bool {
        self.state != InstanceState::Stopped
    }

    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for StatusView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Worker:   {}", self.state.describe())?;
        if let Some(stale) = self.stale_pid {
            writeln!(f, "          (stale PID file entry {} ignored)", stale)?;
        }
        let Some(pid) = self.pid else {
            writeln!(f, "Port:     {}", self.port)?;
            return write!(f, "Log:      {}", self.log_file.display());
        };

        let source = match self.source {
            Some(LocateSource::ProcessScan) => " (found by process scan)",
            _ => "",
        };
        writeln!(f, "PID:      {}{}", pid, source)?;
        writeln!(
            f,
            "Port:     {} ({})",
            self.port,
            if self.port_listening {
                "listening"
            } else {
                "not listening"
            }
        )?;

        match &self.process {
            Some(stats) => {
                writeln!(f, "CPU:      {:.1}%", stats.cpu_percent)?;
                writeln!(
                    f,
                    "Memory:   {:.1}% ({})",
                    stats.mem_percent,
                    format_bytes(stats.resident_bytes)
                )?;
                match stats.started_at {
                    Some(started) => writeln!(
                        f,
                        "Uptime:   {} (since {})",
                        format_uptime(stats.uptime_secs),
                        started.format("%Y-%m-%d %H:%M:%S")
                    )?,
                    None => writeln!(f, "Uptime:   {}", format_uptime(stats.uptime_secs))?,
                }
            }
            None => writeln!(f, "Process:  metrics unavailable")?,
        }

        if let Some(health) = &self.health {
            writeln!(f, "Health:   {}", health.status)?;
            writeln!(
                f,
                "Model:    {}{}",
                if health.model_loaded {
                    "loaded"
                } else {
                    "not loaded"
                },
                health
                    .model_version
                    .as_deref()
                    .map(|v| format!(" (version {})", v))
                    .unwrap_or_default()
            )?;
            if let Some(device) = &health.device {
                let fp16 = match health.fp16_enabled {
                    Some(true) => ", fp16",
                    _ => "",
                };
                writeln!(f, "Device:   {}{}", device, fp16)?;
            }
            if let Some(prompts) = health.available_prompts {
                writeln!(f, "Prompts:  {}", prompts)?;
            }
            if let Some(emotions) = health.available_emotions {
                writeln!(f, "Emotions: {}", emotions)?;
            }
        } else if let Some(error) = &self.health_error {
            writeln!(f, "Health:   unknown ({})", error)?;
        }

        if let Some(concurrency) = &self.concurrency {
            let pairs: Vec<String> = concurrency
                .iter()
                .filter(|(_, v)| v.is_number())
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            if !pairs.is_empty() {
                writeln!(f, "Load:     {}", pairs.join(", "))?;
            }
        }

        match self.gpu_memory {
            Some(memory) => writeln!(f, "GPU:      {}", memory)?,
            None => writeln!(f, "GPU:      unknown")?,
        }
        for device in self.gpu_devices.iter().flatten() {
            writeln!(
                f,
                "  [{}] {}: {} / {} MiB",
                device.index, device.name, device.used_mib, device.total_mib
            )?;
        }
        write!(f, "Log:      {}", self.log_file.display())
    }
}

/// Composes locator, port, health, process and GPU queries into a [`StatusView`].
///
/// A failing sub-query only blanks its own field.
pub struct StatusReporter {
    locator: Arc<InstanceLocator>,
    table: Arc<dyn ProcessTable>,
    ports: Arc<dyn PortProbe>,
    health: Arc<dyn HealthProbe>,
    gpu: Arc<dyn GpuQuery>,
    port: u16,
    log_file: PathBuf,
}

impl StatusReporter {
    pub fn new(
        locator: Arc<InstanceLocator>,
        table: Arc<dyn ProcessTable>,
        ports: Arc<dyn PortProbe>,
        health: Arc<dyn HealthProbe>,
        gpu: Arc<dyn GpuQuery>,
        port: u16,
        log_file: PathBuf,
    ) -> Self {
        Self {
            locator,
            table,
            ports,
            health,
            gpu,
            port,
            log_file,
        }
    }

    pub async fn snapshot(&self) -> StatusView {
        let mut view = StatusView {
            state: InstanceState::Stopped,
            port: self.port,
            pid: None,
            source: None,
            stale_pid: self.locator.stale_pid(),
            port_listening: false,
            process: None,
            health: None,
            health_error: None,
            concurrency: None,
            gpu_memory: None,
            gpu_devices: None,
            log_file: self.log_file.clone(),
        };

        let Some(found) = self.locator.locate() else {
            return view;
        };
        view.pid = Some(found.pid);
        view.source = Some(found.source);
        view.port_listening = self.ports.is_listening(self.port);

        let host_metrics = {
            let table = Arc::clone(&self.table);
            let gpu = Arc::clone(&self.gpu);
            let pid = found.pid;
            tokio::task::spawn_blocking(move || (table.stats(pid), gpu.process_memory(pid), gpu.devices()))
        };

        let (metrics, health) = if view.port_listening {
            let (metrics, health, concurrency) = tokio::join!(
                host_metrics,
                self.health.fetch_health(),
                self.health.fetch_concurrency()
            );
            view.concurrency = concurrency;
            (metrics, Some(health))
        } else {
            (host_metrics.await, None)
        };

        match metrics {
            Ok((stats, memory, devices)) => {
                view.process = stats;
                view.gpu_memory = Some(memory);
                view.gpu_devices = devices;
            }
            Err(e) => log::warn!("Failed to collect process metrics: {}", e),
        }

        view.state = match health {
            None => InstanceState::Loading,
            Some(HealthReport::Unreachable(error)) => {
                view.health_error = Some(error);
                InstanceState::Listening
            }
            Some(HealthReport::Reachable(snapshot)) => {
                let state = match snapshot.health_status() {
                    HealthStatus::Healthy => InstanceState::Healthy,
                    _ => InstanceState::Unhealthy,
                };
                view.health = Some(snapshot);
                state
            }
        };
        view
    }
}
