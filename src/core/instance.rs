//! Instance records - One tracked run of a supervised tool

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::process_type::ProcessType;

/// Unique identifier for an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for InstanceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle state of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    /// Process handle obtained, not yet observed alive
    Starting,
    /// Observed alive
    Running,
    /// Termination requested
    Stopping,
    /// Observed exited
    Stopped,
    /// Launch failed or exited abnormally
    Failed,
}

impl InstanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Failed => "Failed",
        }
    }
}

/// A tracked run of an external tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub process_type: ProcessType,
    /// Operating system process ID, if a process was ever obtained
    pub pid: Option<u32>,
    pub state: InstanceState,
    pub started_at: DateTime<Utc>,
    pub last_observed_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub last_error: Option<String>,
    /// Control client that launched this instance
    pub owner: Option<String>,
}

impl Instance {
    pub fn new(process_type: ProcessType, pid: Option<u32>, owner: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: InstanceId::new(),
            process_type,
            pid,
            state: InstanceState::Starting,
            started_at: now,
            last_observed_at: now,
            stopped_at: None,
            exit_code: None,
            last_error: None,
            owner,
        }
    }

    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.owner.as_deref() == Some(owner)
    }

    /// Get uptime duration if not yet terminal
    pub fn uptime(&self) -> Option<chrono::Duration> {
        if self.state.is_terminal() {
            None
        } else {
            Some(Utc::now() - self.started_at)
        }
    }

    /// Format uptime as human-readable string
    pub fn uptime_string(&self) -> String {
        match self.uptime() {
            Some(duration) => {
                let secs = duration.num_seconds();
                if secs < 60 {
                    format!("{}s", secs)
                } else if secs < 3600 {
                    format!("{}m {}s", secs / 60, secs % 60)
                } else if secs < 86400 {
                    format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
                } else {
                    format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
                }
            }
            None => "-".to_string(),
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_observed_at = Utc::now();
    }

    pub fn mark_running(&mut self) {
        if self.state == InstanceState::Starting {
            self.state = InstanceState::Running;
        }
        self.touch();
    }

    pub fn mark_stopping(&mut self) {
        self.state = InstanceState::Stopping;
        self.touch();
    }

    pub fn mark_stopped(&mut self, exit_code: Option<i32>) {
        self.state = InstanceState::Stopped;
        self.exit_code = exit_code;
        self.stopped_at = Some(Utc::now());
        self.touch();
    }

    pub fn mark_failed(&mut self, exit_code: Option<i32>, error: Option<String>) {
        self.state = InstanceState::Failed;
        self.exit_code = exit_code;
        self.stopped_at = Some(Utc::now());
        self.last_error = error;
        self.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_instance_starts_in_starting_state() {
        let instance = Instance::new(ProcessType::Ollama, Some(42), None);
        assert_eq!(instance.state, InstanceState::Starting);
        assert_eq!(instance.pid, Some(42));
        assert!(instance.uptime().is_some());
    }

    #[test]
    fn mark_running_does_not_override_stopping() {
        let mut instance = Instance::new(ProcessType::Rvc, Some(1), None);
        instance.mark_stopping();
        instance.mark_running();
        assert_eq!(instance.state, InstanceState::Stopping);
    }

    #[test]
    fn terminal_states() {
        assert!(InstanceState::Stopped.is_terminal());
        assert!(InstanceState::Failed.is_terminal());
        assert!(!InstanceState::Stopping.is_terminal());

        let mut instance = Instance::new(ProcessType::Rvc, Some(1), Some("gui".into()));
        instance.mark_failed(Some(3), Some("boom".into()));
        assert_eq!(instance.uptime_string(), "-");
        assert!(instance.is_owned_by("gui"));
        assert!(!instance.is_owned_by("http"));
    }

    #[test]
    fn instance_id_parses_back() {
        let id = InstanceId::new();
        let parsed: InstanceId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }
}
