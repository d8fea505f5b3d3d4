//! Process management - Launching tools and signalling their processes

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::platform;

/// How a tool is launched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaunchSpec {
    /// Batch/shell script or executable to run
    pub script: PathBuf,
    /// Command line arguments
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Working directory (defaults to the script's directory)
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    /// Environment variables to set
    #[serde(default)]
    pub environment: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            ..Default::default()
        }
    }

    pub fn with_arguments(mut self, args: Vec<String>) -> Self {
        self.arguments = args;
        self
    }

    pub fn with_working_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(path.into());
        self
    }
}

/// Termination request strength
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// Cooperative exit request (SIGTERM, WM_CLOSE)
    Graceful,
    /// Unconditional kill (SIGKILL, TerminateProcess)
    Forced,
}

/// Result of polling a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessPoll {
    Running,
    Exited { code: Option<i32>, success: bool },
}

/// A started OS process the supervisor can signal and poll
pub trait ProcessHandle: Send {
    fn pid(&self) -> Option<u32>;
    fn signal(&mut self, kind: SignalKind) -> Result<()>;
    fn poll(&mut self) -> Result<ProcessPoll>;
}

/// Starts processes from launch specs
pub trait Launcher: Send + Sync {
    fn start(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>>;
}

/// Launches scripts and executables as detached child processes
#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptLauncher;

impl ScriptLauncher {
    /// Build the command, routing scripts through their interpreter
    fn build_command(spec: &LaunchSpec) -> Command {
        let ext = spec
            .script
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        let mut cmd = match ext.as_deref() {
            Some("bat") | Some("cmd") if cfg!(windows) => {
                let mut c = Command::new("cmd");
                c.arg("/C").arg(&spec.script);
                c
            }
            Some("sh") if cfg!(unix) => {
                let mut c = Command::new("sh");
                c.arg(&spec.script);
                c
            }
            _ => Command::new(&spec.script),
        };

        cmd.args(&spec.arguments);

        if let Some(ref work_dir) = spec.working_directory {
            cmd.current_dir(work_dir);
        } else if let Some(parent) = spec.script.parent().filter(|p| !p.as_os_str().is_empty()) {
            cmd.current_dir(parent);
        }

        for (key, value) in &spec.environment {
            cmd.env(key, value);
        }

        cmd
    }
}

impl Launcher for ScriptLauncher {
    fn start(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>> {
        info!("Launching {:?}", spec.script);

        if !spec.script.exists() && !is_bare_command(&spec.script) {
            anyhow::bail!("Script not found: {}", spec.script.display());
        }

        let mut cmd = Self::build_command(spec);

        // Detach so the tool gets its own process group
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            // DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP
            cmd.creation_flags(0x00000008 | 0x00000200);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    // Group signals rely on the child leading its own process group
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to spawn process")?;

        info!("Spawned process with PID {}", child.id());
        Ok(Box::new(ChildProcess::new(child)))
    }
}

/// A plain program name resolved through PATH
fn is_bare_command(path: &Path) -> bool {
    path.components().count() == 1 && path.extension().is_none()
}

/// A process spawned by [`ScriptLauncher`]
pub struct ChildProcess {
    child: Child,
    pid: u32,
}

impl ChildProcess {
    pub fn new(child: Child) -> Self {
        let pid = child.id();
        Self { child, pid }
    }
}

impl ProcessHandle for ChildProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn signal(&mut self, kind: SignalKind) -> Result<()> {
        match kind {
            SignalKind::Graceful => platform::terminate_process(self.pid),
            SignalKind::Forced => {
                if let Err(e) = platform::kill_process(self.pid) {
                    warn!("Group kill of PID {} failed: {}, killing child directly", self.pid, e);
                    self.child.kill().context("Failed to kill process")?;
                }
                Ok(())
            }
        }
    }

    fn poll(&mut self) -> Result<ProcessPoll> {
        match self.child.try_wait().context("Failed to poll process")? {
            Some(status) => {
                debug!("PID {} exited with {}", self.pid, status);
                Ok(ProcessPoll::Exited {
                    code: status.code(),
                    success: status.success(),
                })
            }
            None => Ok(ProcessPoll::Running),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted process handles for exercising the supervisor without real processes

    use std::sync::{Arc, Mutex};

    use super::*;

    /// How a fake process reacts to signals
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Behavior {
        ExitOnGraceful,
        ExitOnForced,
        Unkillable,
    }

    #[derive(Debug)]
    pub struct FakeState {
        pub behavior: Behavior,
        pub signals: Vec<SignalKind>,
        pub exited: Option<ProcessPoll>,
    }

    /// Shared view of a fake process, kept by the test
    #[derive(Debug, Clone)]
    pub struct FakeProbe(pub Arc<Mutex<FakeState>>);

    impl FakeProbe {
        pub fn signals(&self) -> Vec<SignalKind> {
            self.0.lock().unwrap().signals.clone()
        }

        /// Make the process exit on its own
        pub fn exit(&self, code: i32) {
            self.0.lock().unwrap().exited = Some(ProcessPoll::Exited {
                code: Some(code),
                success: code == 0,
            });
        }
    }

    pub struct FakeProcess {
        pid: u32,
        state: Arc<Mutex<FakeState>>,
    }

    impl FakeProcess {
        pub fn new(pid: u32, behavior: Behavior) -> (Self, FakeProbe) {
            let state = Arc::new(Mutex::new(FakeState {
                behavior,
                signals: Vec::new(),
                exited: None,
            }));
            (
                Self {
                    pid,
                    state: Arc::clone(&state),
                },
                FakeProbe(state),
            )
        }
    }

    impl ProcessHandle for FakeProcess {
        fn pid(&self) -> Option<u32> {
            Some(self.pid)
        }

        fn signal(&mut self, kind: SignalKind) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.signals.push(kind);
            let dies = matches!(
                (state.behavior, kind),
                (Behavior::ExitOnGraceful, _) | (Behavior::ExitOnForced, SignalKind::Forced)
            );
            if dies && state.exited.is_none() {
                // Terminated by a signal: no exit code, not a success
                state.exited = Some(ProcessPoll::Exited {
                    code: None,
                    success: false,
                });
            }
            Ok(())
        }

        fn poll(&mut self) -> Result<ProcessPoll> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .exited
                .unwrap_or(ProcessPoll::Running))
        }
    }

    /// Launcher handing out fake processes; `fail` makes every launch error
    #[derive(Default)]
    pub struct FakeLauncher {
        pub behavior: Option<Behavior>,
        pub fail: bool,
        pub probes: Mutex<Vec<FakeProbe>>,
        next_pid: Mutex<u32>,
    }

    impl FakeLauncher {
        pub fn new(behavior: Behavior) -> Self {
            Self {
                behavior: Some(behavior),
                ..Default::default()
            }
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }
    }

    impl Launcher for FakeLauncher {
        fn start(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>> {
            if self.fail {
                anyhow::bail!("Script not found: {}", spec.script.display());
            }
            let mut next = self.next_pid.lock().unwrap();
            *next += 1;
            let (process, probe) = FakeProcess::new(
                1000 + *next,
                self.behavior.unwrap_or(Behavior::ExitOnGraceful),
            );
            self.probes.lock().unwrap().push(probe);
            Ok(Box::new(process))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_script_is_rejected() {
        let spec = LaunchSpec::new("/definitely/not/here/start_linux.sh");
        let err = ScriptLauncher.start(&spec).err().unwrap();
        assert!(err.to_string().contains("Script not found"));
    }

    #[test]
    fn bare_command_detection() {
        assert!(is_bare_command(Path::new("ollama")));
        assert!(!is_bare_command(Path::new("./start.sh")));
        assert!(!is_bare_command(Path::new("start.bat")));
    }

    #[cfg(unix)]
    #[test]
    fn child_leads_its_own_process_group() {
        let spec = LaunchSpec::new("sleep").with_arguments(vec!["5".into()]);
        let mut handle = ScriptLauncher.start(&spec).unwrap();
        let pid = handle.pid().unwrap() as libc::pid_t;

        let pgid = unsafe { libc::getpgid(pid) };
        assert_eq!(pgid, pid);
        assert_ne!(pgid, unsafe { libc::getpgrp() });

        handle.signal(SignalKind::Forced).unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while handle.poll().unwrap() == ProcessPoll::Running {
            assert!(std::time::Instant::now() < deadline, "process never exited");
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
    }

    #[cfg(unix)]
    #[test]
    fn child_process_reports_exit() {
        let spec = LaunchSpec::new("true");
        let mut handle = ScriptLauncher.start(&spec).unwrap();
        assert!(handle.pid().is_some());

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if let ProcessPoll::Exited { success, .. } = handle.poll().unwrap() {
                assert!(success);
                break;
            }
            assert!(std::time::Instant::now() < deadline, "process never exited");
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
    }
}
