//! Process management utilities.

mod control;
pub mod gpu;
mod health;
mod launcher;
mod locator;
mod pidfile;
mod poll;
mod port;
mod shutdown;
mod signature;
mod table;

pub use gpu::{GpuDevice, GpuMemory, GpuQuery, NoGpu, NvidiaSmi};
pub use health::{HealthProbe, HealthReport, HealthSnapshot, HealthStatus, HttpHealthProbe};
pub use launcher::{DetachedSpawner, LaunchCommand, ProcessLauncher, Spawner};
pub use locator::{InstanceLocator, LocateSource, Located};
pub use pidfile::PidFile;
pub use poll::PollPolicy;
pub use port::{PortProbe, SocketTable};
pub use shutdown::{ShutdownOutcome, ShutdownSequencer, ShutdownState};
pub use signature::WorkerSignature;
pub use table::{
    format_bytes, format_uptime, ProcessEntry, ProcessSignals, ProcessStats, ProcessTable,
    SystemProcesses,
};
