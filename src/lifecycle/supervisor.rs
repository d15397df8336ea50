//! Top-level coordinator process.
//!
//! # Responsibilities
//! - Spawn the first worker in a process group of its own
//! - Forward restart, reload and shutdown signals to that group
//! - Stay alive until the last worker of the group exited
//!
//! # Design Decisions
//! - The coordinator never binds a listener; workers hand sockets to each
//!   other and the group id stays stable across those restarts
//! - On Linux the coordinator becomes a child subreaper so successors that
//!   outlive their parent are reaped here

use std::time::Duration;

use crate::cli::Cli;
use crate::error::ServerError;

const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Run as coordinator until the worker group is gone. Returns the exit
/// code of the first worker.
#[cfg(unix)]
pub async fn supervise(cli: &Cli) -> Result<i32, ServerError> {
    use crate::lifecycle::fdmap::FDMAP_ENV;
    use crate::lifecycle::signals::Signals;

    become_subreaper();

    let exe = std::env::current_exe()?;
    let mut spawn = Cli::for_spawn(cli.config.clone());
    spawn.topid = Some(std::process::id());

    // The worker binds fresh; a handoff addressed to the supervisor is not its.
    let mut child = tokio::process::Command::new(exe)
        .args(spawn.to_args())
        .env_remove(FDMAP_ENV)
        .process_group(0)
        .spawn()
        .map_err(|e| ServerError::Successor(format!("spawn failed: {e}")))?;
    let group = child
        .id()
        .ok_or_else(|| ServerError::Successor("worker exited immediately".into()))?
        as libc::pid_t;
    tracing::info!(pgid = group, "Worker group started");

    let mut signals = Signals::new()?;
    let mut exit_code = None;
    loop {
        tokio::select! {
            signal = signals.recv() => forward(group, signal.raw()),
            status = child.wait(), if exit_code.is_none() => {
                let status = status?;
                tracing::info!(status = %status, "First worker exited");
                exit_code = Some(status.code().unwrap_or(1));
            }
            _ = tokio::time::sleep(GROUP_POLL_INTERVAL), if exit_code.is_some() => {
                reap_orphans();
                if !group_alive(group) {
                    break;
                }
            }
        }
    }

    tracing::info!(pgid = group, "Worker group exited");
    Ok(exit_code.unwrap_or(0))
}

#[cfg(not(unix))]
pub async fn supervise(_cli: &Cli) -> Result<i32, ServerError> {
    Err(ServerError::DescriptorInheritanceUnsupported)
}

#[cfg(target_os = "linux")]
fn become_subreaper() {
    // SAFETY: PR_SET_CHILD_SUBREAPER only changes process attributes.
    if unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) } < 0 {
        tracing::warn!(error = %std::io::Error::last_os_error(), "Could not become child subreaper");
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn become_subreaper() {}

#[cfg(unix)]
fn forward(group: libc::pid_t, signal: libc::c_int) {
    // SAFETY: kill has no memory effects.
    if unsafe { libc::kill(-group, signal) } < 0 {
        tracing::warn!(pgid = group, signal, error = %std::io::Error::last_os_error(), "Signal forward failed");
    } else {
        tracing::debug!(pgid = group, signal, "Signal forwarded");
    }
}

/// A group exists while `kill(-pgid, 0)` does not report ESRCH.
#[cfg(unix)]
fn group_alive(group: libc::pid_t) -> bool {
    // SAFETY: signal 0 only checks for existence.
    if unsafe { libc::kill(-group, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

/// Collect exited successors reparented to this process.
#[cfg(unix)]
fn reap_orphans() {
    let mut status = 0;
    // SAFETY: WNOHANG never blocks; status is a valid out pointer.
    while unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) } > 0 {}
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_group_alive() {
        // SAFETY: getpgrp has no preconditions.
        let own = unsafe { libc::getpgrp() };
        assert!(group_alive(own));
        assert!(!group_alive(i32::MAX - 1));
    }
}
