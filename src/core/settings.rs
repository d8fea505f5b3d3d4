//! Supervisor settings management

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::credential::DEFAULT_WINDOW_DAYS;
use super::process::LaunchSpec;
use super::process_type::ProcessType;
use super::termination::TerminationPolicy;

/// A tool the supervisor knows how to launch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    pub process_type: ProcessType,
    pub launch: LaunchSpec,
    /// Launch when the supervisor starts
    #[serde(default)]
    pub autostart: bool,
}

/// Supervisor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Custom data directory
    pub data_directory: Option<PathBuf>,

    // Termination
    /// Time a process gets to exit after the graceful signal
    pub grace_period_ms: u64,
    /// Time a process gets to exit after the forced kill
    pub force_period_ms: u64,
    /// How often a stopping process is polled
    pub stop_poll_interval_ms: u64,

    // Control API
    /// Sliding validity window of the admin key
    pub credential_window_days: u32,
    /// Accept unrecognized process types (title-cased) instead of rejecting them
    pub allow_ad_hoc_types: bool,

    // Monitoring
    /// Resource monitor update interval in ms
    pub monitor_interval_ms: u32,
    /// Keep instance history for N days (0 = forever)
    pub history_retention_days: u32,

    /// Launchable tools
    pub tools: Vec<ToolConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_directory: None,

            grace_period_ms: 5_000,
            force_period_ms: 2_000,
            stop_poll_interval_ms: 100,

            credential_window_days: DEFAULT_WINDOW_DAYS as u32,
            allow_ad_hoc_types: true,

            monitor_interval_ms: 1000,
            history_retention_days: 30,

            tools: Vec::new(),
        }
    }
}

impl Settings {
    /// Get the data directory, using default if not set
    pub fn get_data_directory(&self) -> PathBuf {
        self.data_directory.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(crate::APP_NAME)
        })
    }

    /// Get the admin key file path
    pub fn get_key_file_path(&self) -> PathBuf {
        self.get_data_directory().join("admin_key.json")
    }

    /// Validate settings and fix any invalid values
    pub fn validate(&mut self) {
        self.grace_period_ms = self.grace_period_ms.max(100);
        self.force_period_ms = self.force_period_ms.max(100);
        self.stop_poll_interval_ms = self.stop_poll_interval_ms.clamp(10, 1_000);
        self.credential_window_days = self.credential_window_days.clamp(1, 365);
        self.monitor_interval_ms = self.monitor_interval_ms.max(100);
    }

    pub fn termination_policy(&self) -> TerminationPolicy {
        TerminationPolicy {
            grace_period: Duration::from_millis(self.grace_period_ms),
            force_period: Duration::from_millis(self.force_period_ms),
            poll_interval: Duration::from_millis(self.stop_poll_interval_ms),
        }
    }

    pub fn credential_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.credential_window_days as i64)
    }

    /// The configured tool for a type, if any
    pub fn tool_for(&self, process_type: &ProcessType) -> Option<&ToolConfig> {
        self.tools.iter().find(|t| &t.process_type == process_type)
    }
}
