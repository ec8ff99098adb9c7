//! Signal delivery and liveness checks.

use crate::error::{AppError, Result};

#[cfg(unix)]
fn to_pid(pid: u32) -> Result<nix::unistd::Pid> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Ok(nix::unistd::Pid::from_raw(raw)),
        _ => Err(AppError::process(format!("Invalid PID {}", pid))),
    }
}

/// Check if a process is alive by PID.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;

    let Ok(target) = to_pid(pid) else {
        return false;
    };
    match kill(target, None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Check if a process is alive by PID.
#[cfg(not(unix))]
pub fn is_process_alive(pid: u32) -> bool {
    use sysinfo::{Pid, ProcessesToUpdate, System};

    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);
    system.process(Pid::from_u32(pid)).is_some()
}

/// Send a graceful shutdown signal to a process. A process that is already
/// gone counts as delivered.
#[cfg(unix)]
pub fn graceful_signal(pid: u32) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};

    match kill(to_pid(pid)?, Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(AppError::process(format!(
            "Failed to send SIGTERM to PID {}: {}",
            pid, e
        ))),
    }
}

#[cfg(not(unix))]
pub fn graceful_signal(pid: u32) -> Result<()> {
    send_sysinfo_signal(pid, sysinfo::Signal::Term)
}

/// Kill a process, taking its whole process group down when the process
/// leads one (workers are spawned as session leaders).
#[cfg(unix)]
pub fn force_kill(pid: u32) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::getpgid;

    let target = to_pid(pid)?;
    match getpgid(Some(target)) {
        Ok(pgid) if pgid == target => match killpg(pgid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(AppError::process(format!(
                "Failed to kill process group {} (from pid {}): {}",
                pgid.as_raw(),
                pid,
                e
            ))),
        },
        Ok(_) => match kill(target, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(AppError::process(format!(
                "Failed to kill process {}: {}",
                pid, e
            ))),
        },
        Err(Errno::ESRCH) => Ok(()),
        Err(e) => kill(target, Signal::SIGKILL).map_err(|kill_err| {
            AppError::process(format!(
                "Failed to kill process {} (getpgid failed: {}): {}",
                pid, e, kill_err
            ))
        }),
    }
}

#[cfg(not(unix))]
pub fn force_kill(pid: u32) -> Result<()> {
    send_sysinfo_signal(pid, sysinfo::Signal::Kill)
}

#[cfg(not(unix))]
fn send_sysinfo_signal(pid: u32, signal: sysinfo::Signal) -> Result<()> {
    use sysinfo::{Pid, ProcessesToUpdate, System};

    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);
    match system.process(Pid::from_u32(pid)) {
        None => Ok(()),
        Some(process) => match process.kill_with(signal) {
            Some(true) => Ok(()),
            Some(false) => Err(AppError::process(format!(
                "Failed to send {:?} to PID {}",
                signal, pid
            ))),
            None if process.kill() => Ok(()),
            None => Err(AppError::process(format!("Failed to kill PID {}", pid))),
        },
    }
}
