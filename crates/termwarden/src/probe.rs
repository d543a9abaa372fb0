//! Process liveness probing.
//!
//! Everything here works on raw pids learned from the spawn rendezvous file,
//! not on child handles we own, so probing uses `kill(pid, 0)` and child
//! enumeration shells out to `pgrep`.

use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

/// Check whether a process exists without sending it a real signal.
///
/// EPERM means the process exists but belongs to someone else, which still
/// counts as alive.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs permission and existence checks only.
    let rc = unsafe { libc::kill(pid as i32, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    false
}

/// Send SIGKILL to a process.
///
/// "No such process" is success: the goal is absence, and the process is
/// already absent.
#[cfg(unix)]
pub fn kill_hard(pid: u32) -> std::io::Result<()> {
    // SAFETY: sending a signal to a pid we do not own fails with EPERM,
    // it cannot corrupt our own state.
    if unsafe { libc::kill(pid as i32, libc::SIGKILL) } != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn kill_hard(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::other("process signalling requires unix"))
}

/// List the direct children of a process (one level, not recursive).
///
/// Returns an empty list when `pgrep` is unavailable or finds nothing —
/// callers treat "no children" and "cannot enumerate" the same way.
pub async fn child_pids(pid: u32) -> Vec<u32> {
    let output = match Command::new("pgrep")
        .args(["-P", &pid.to_string()])
        .output()
        .await
    {
        Ok(o) => o,
        Err(e) => {
            debug!(error = %e, "pgrep not available, assuming no children");
            return Vec::new();
        }
    };

    // pgrep exits 1 when there are no matches; that is not an error here.
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .collect()
}

/// Re-probe a pid until it dies or `timeout` elapses.
///
/// Returns `true` if the process is gone.
pub async fn wait_for_death(pid: u32, timeout: Duration, poll: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !is_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll).await;
    }
}
