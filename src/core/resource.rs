//! Resource figures - Host metrics and per-process usage

use serde::{Deserialize, Serialize};

/// Current resource usage of one process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU usage percentage (0.0-100.0 per core)
    pub cpu_percent: f32,
    /// Memory usage in bytes
    pub memory_bytes: u64,
}

impl ResourceUsage {
    /// Format memory as human-readable string
    pub fn memory_string(&self) -> String {
        format_bytes(self.memory_bytes)
    }

    /// Format CPU percentage
    pub fn cpu_string(&self) -> String {
        format!("{:.1}%", self.cpu_percent)
    }
}

/// Host-wide resource information
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostMetrics {
    /// Total CPU usage percentage
    pub cpu_percent: f32,
    /// Used physical memory as a percentage of total
    pub memory_percent: f32,
    /// Total physical memory in bytes
    pub total_memory: u64,
    /// Used physical memory in bytes
    pub used_memory: u64,
    /// Number of CPU cores
    pub cpu_cores: usize,
    /// System uptime in seconds
    pub uptime_secs: u64,
}

impl HostMetrics {
    pub fn memory_percent_of(used: u64, total: u64) -> f32 {
        if total > 0 {
            (used as f32 / total as f32) * 100.0
        } else {
            0.0
        }
    }

    /// Format used/total memory
    pub fn memory_string(&self) -> String {
        format!(
            "{} / {}",
            format_bytes(self.used_memory),
            format_bytes(self.total_memory)
        )
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn memory_percent_handles_zero_total() {
        assert_eq!(HostMetrics::memory_percent_of(10, 0), 0.0);
        assert_eq!(HostMetrics::memory_percent_of(50, 200), 25.0);
    }
}
