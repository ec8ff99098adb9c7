//! Graceful-then-forced worker termination.

use std::sync::Arc;

use serde::Serialize;

use super::gpu::{GpuMemory, GpuQuery};
use super::pidfile::PidFile;
use super::poll::PollPolicy;
use super::table::{ProcessSignals, ProcessTable};
use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Signaled,
    WaitingGraceful,
    Escalated,
    WaitingForced,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownOutcome {
    Graceful,
    Forced,
    Failed,
}

impl ShutdownOutcome {
    pub fn is_stopped(&self) -> bool {
        !matches!(self, Self::Failed)
    }
}

pub struct ShutdownSequencer {
    table: Arc<dyn ProcessTable>,
    signals: Arc<dyn ProcessSignals>,
    gpu: Arc<dyn GpuQuery>,
    pid_file: PidFile,
    graceful: PollPolicy,
    forced: PollPolicy,
    gpu_release: PollPolicy,
}

impl ShutdownSequencer {
    pub fn new(
        table: Arc<dyn ProcessTable>,
        signals: Arc<dyn ProcessSignals>,
        gpu: Arc<dyn GpuQuery>,
        pid_file: PidFile,
        graceful: PollPolicy,
        forced: PollPolicy,
        gpu_release: PollPolicy,
    ) -> Self {
        Self {
            table,
            signals,
            gpu,
            pid_file,
            graceful,
            forced,
            gpu_release,
        }
    }

    fn enter(&self, pid: u32, state: ShutdownState) {
        log::debug!("Shutdown of pid {}: {:?}", pid, state);
    }

    /// Stop `pid`, escalating to SIGKILL after the grace period.
    ///
    /// On success waits (bounded) for GPU memory release and removes the PID file.
    pub async fn shutdown(&self, pid: u32) -> ShutdownOutcome {
        self.enter(pid, ShutdownState::Signaled);
        let signalled = match self.signals.terminate(pid) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("{}, will force kill immediately", e);
                false
            }
        };

        let mut outcome = None;
        if signalled {
            self.enter(pid, ShutdownState::WaitingGraceful);
            if self.wait_exit(pid, self.graceful).await {
                outcome = Some(ShutdownOutcome::Graceful);
            } else {
                log::warn!(
                    "{}: no exit within {}s, force killing",
                    AppError::graceful_timeout(pid),
                    self.graceful.budget().as_secs()
                );
            }
        }

        let outcome = match outcome {
            Some(outcome) => outcome,
            None => self.escalate(pid).await,
        };

        if outcome.is_stopped() {
            self.enter(pid, ShutdownState::Stopped);
            self.wait_gpu_release(pid).await;
            if let Err(e) = self.pid_file.remove() {
                log::warn!("{}", e);
            }
        } else {
            self.enter(pid, ShutdownState::Failed);
        }
        outcome
    }

    async fn escalate(&self, pid: u32) -> ShutdownOutcome {
        self.enter(pid, ShutdownState::Escalated);
        if let Err(e) = self.signals.kill(pid) {
            log::error!("Failed to force kill PID {}: {}", pid, e);
        }
        self.enter(pid, ShutdownState::WaitingForced);
        if self.wait_exit(pid, self.forced).await {
            ShutdownOutcome::Forced
        } else {
            ShutdownOutcome::Failed
        }
    }

    async fn wait_exit(&self, pid: u32, policy: PollPolicy) -> bool {
        policy
            .wait_until(|| !self.table.is_alive(pid))
            .await
            .is_some()
    }

    /// Wait until the GPU query no longer attributes memory to `pid`.
    ///
    /// Advisory only: returns false when memory is still held after the
    /// attempts run out.
    pub async fn wait_gpu_release(&self, pid: u32) -> bool {
        let mut last = GpuMemory::Unavailable;
        let released = self
            .gpu_release
            .wait_until(|| {
                last = self.gpu.process_memory(pid);
                last.is_released()
            })
            .await
            .is_some();
        match last {
            GpuMemory::Used { .. } if !released => {
                log::warn!(
                    "GPU still reports memory ({}) for pid {} after {} checks",
                    last,
                    pid,
                    self.gpu_release.max_attempts
                );
            }
            GpuMemory::Unavailable => log::debug!("GPU release check skipped: no query tool"),
            _ => log::debug!("GPU memory for pid {} released", pid),
        }
        released
    }
}
