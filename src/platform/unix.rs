//! Unix process signalling
//!
//! Launched tools run in their own session, so their PID doubles as the
//! process group ID. Signals go to the group first so helper processes
//! started by the script die with it.

use anyhow::Result;
use tracing::debug;

fn send(pid: u32, signal: libc::c_int, what: &str) -> Result<()> {
    let pid = pid as libc::pid_t;
    unsafe {
        if libc::kill(-pid, signal) == 0 {
            return Ok(());
        }
        debug!(
            "Group signal to {} failed ({}), signalling the process",
            pid,
            std::io::Error::last_os_error()
        );
        if libc::kill(pid, signal) == 0 {
            Ok(())
        } else {
            anyhow::bail!(
                "Failed to {} process: {}",
                what,
                std::io::Error::last_os_error()
            )
        }
    }
}

/// Terminate a process gracefully (SIGTERM)
pub fn terminate_process(pid: u32) -> Result<()> {
    send(pid, libc::SIGTERM, "terminate")
}

/// Force kill a process (SIGKILL)
pub fn kill_process(pid: u32) -> Result<()> {
    send(pid, libc::SIGKILL, "kill")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signalling_a_missing_process_fails() {
        // PIDs are capped well below this on every supported kernel
        assert!(terminate_process(i32::MAX as u32 - 1).is_err());
    }
}
