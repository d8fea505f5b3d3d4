//! Windows process signalling

use std::process::Command;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use windows::Win32::Foundation::{CloseHandle, FALSE};
use windows::Win32::System::Threading::*;

/// Run taskkill against a process tree
fn taskkill(pid: u32, force: bool) -> Result<()> {
    let mut cmd = Command::new("taskkill");
    cmd.arg("/PID").arg(pid.to_string()).arg("/T");
    if force {
        cmd.arg("/F");
    }
    let status = cmd.status().context("Failed to run taskkill")?;
    if status.success() {
        Ok(())
    } else {
        anyhow::bail!("taskkill exited with {}", status)
    }
}

/// Terminate a process gracefully (close request to the process tree)
pub fn terminate_process(pid: u32) -> Result<()> {
    debug!("Requesting close of process tree {}", pid);
    taskkill(pid, false)
}

/// Force kill a process
pub fn kill_process(pid: u32) -> Result<()> {
    match taskkill(pid, true) {
        Ok(()) => return Ok(()),
        Err(e) => warn!("Forced taskkill of {} failed: {}, terminating directly", pid, e),
    }

    unsafe {
        let handle =
            OpenProcess(PROCESS_TERMINATE, FALSE, pid).context("Failed to open process")?;

        let result = TerminateProcess(handle, 1);
        CloseHandle(handle)?;

        if result.is_ok() {
            Ok(())
        } else {
            anyhow::bail!("Failed to kill process")
        }
    }
}

