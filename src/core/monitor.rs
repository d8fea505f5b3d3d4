//! Resource monitoring - Host and per-process resource tracking

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use super::resource::{HostMetrics, ResourceUsage};
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::trace;

/// Resource monitor that tracks host and per-process resource usage
pub struct ResourceMonitor {
    /// System information
    system: System,
    /// Last update time
    last_update: Option<Instant>,
    /// Minimum time between refreshes
    update_interval: Duration,
}

impl ResourceMonitor {
    pub fn new(update_interval_ms: u32) -> Self {
        Self {
            system: System::new(),
            last_update: None,
            update_interval: Duration::from_millis(update_interval_ms as u64),
        }
    }

    /// Refresh CPU, memory and process information, at most once per interval
    pub fn refresh(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_update {
            if now.duration_since(last) < self.update_interval {
                return;
            }
        }

        self.system
            .refresh_cpu_specifics(CpuRefreshKind::new().with_cpu_usage());
        self.system
            .refresh_memory_specifics(MemoryRefreshKind::new().with_ram());
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new().with_cpu().with_memory(),
        );

        self.last_update = Some(now);
        trace!("Resource monitor refreshed");
    }

    /// Get host-wide resource information
    pub fn host_metrics(&self) -> HostMetrics {
        let total_memory = self.system.total_memory();
        let used_memory = self.system.used_memory();

        HostMetrics {
            cpu_percent: self.system.global_cpu_usage(),
            memory_percent: HostMetrics::memory_percent_of(used_memory, total_memory),
            total_memory,
            used_memory,
            cpu_cores: self.system.cpus().len(),
            uptime_secs: System::uptime(),
        }
    }

    /// Get resource usage for a specific process
    pub fn process_usage(&self, pid: u32) -> Option<ResourceUsage> {
        let process = self.system.process(Pid::from_u32(pid))?;

        Some(ResourceUsage {
            cpu_percent: process.cpu_usage(),
            memory_bytes: process.memory(),
        })
    }
}

/// Thread-safe wrapper for ResourceMonitor
pub struct SharedResourceMonitor {
    inner: Arc<RwLock<ResourceMonitor>>,
}

impl SharedResourceMonitor {
    pub fn new(update_interval_ms: u32) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ResourceMonitor::new(update_interval_ms))),
        }
    }

    pub fn refresh(&self) {
        if let Ok(mut monitor) = self.inner.write() {
            monitor.refresh();
        }
    }

    pub fn host_metrics(&self) -> HostMetrics {
        self.inner
            .read()
            .map(|m| m.host_metrics())
            .unwrap_or_default()
    }

    pub fn process_usage(&self, pid: u32) -> Option<ResourceUsage> {
        self.inner.read().ok()?.process_usage(pid)
    }
}

impl Clone for SharedResourceMonitor {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}
