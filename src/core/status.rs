//! Status reporting - Read-only snapshot of instances and host load

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::SupervisorResult;
use super::instance::{Instance, InstanceId, InstanceState};
use super::monitor::SharedResourceMonitor;
use super::resource::HostMetrics;
use super::tracker::InstanceTracker;

/// One instance as seen in a status snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceSummary {
    pub id: InstanceId,
    pub pid: Option<u32>,
    pub state: InstanceState,
    pub uptime: String,
    pub cpu_percent: Option<f32>,
    pub memory_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub timestamp: DateTime<Utc>,
    /// Keyed by canonical type name
    pub per_type: BTreeMap<String, Vec<InstanceSummary>>,
    pub host_metrics: HostMetrics,
}

impl StatusSnapshot {
    pub fn instance_count(&self) -> usize {
        self.per_type.values().map(Vec::len).sum()
    }
}

/// Builds status snapshots; never changes instance or credential state
#[derive(Clone)]
pub struct StatusReporter {
    tracker: Arc<InstanceTracker>,
    monitor: SharedResourceMonitor,
}

impl StatusReporter {
    pub fn new(tracker: Arc<InstanceTracker>, monitor: SharedResourceMonitor) -> Self {
        Self { tracker, monitor }
    }

    pub fn snapshot(&self) -> SupervisorResult<StatusSnapshot> {
        self.monitor.refresh();
        let timestamp = Utc::now();

        let per_type = self
            .tracker
            .list_all()?
            .into_iter()
            .map(|(ty, list)| {
                let summaries = list.iter().map(|i| self.summarize(i)).collect();
                (ty.to_string(), summaries)
            })
            .collect();

        Ok(StatusSnapshot {
            timestamp,
            per_type,
            host_metrics: self.monitor.host_metrics(),
        })
    }

    fn summarize(&self, instance: &Instance) -> InstanceSummary {
        let usage = instance
            .pid
            .filter(|_| !instance.state.is_terminal())
            .and_then(|pid| self.monitor.process_usage(pid));

        InstanceSummary {
            id: instance.id,
            pid: instance.pid,
            state: instance.state,
            uptime: instance.uptime_string(),
            cpu_percent: usage.as_ref().map(|u| u.cpu_percent),
            memory_bytes: usage.as_ref().map(|u| u.memory_bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::process::testing::{Behavior, FakeProcess};
    use crate::core::process_type::ProcessType;

    #[test]
    fn snapshot_groups_instances_without_mutating_them() {
        let tracker = Arc::new(InstanceTracker::new());
        for ty in [ProcessType::Ollama, ProcessType::ZWaifu, ProcessType::ZWaifu] {
            let (process, _) = FakeProcess::new(4_000_000, Behavior::ExitOnGraceful);
            tracker.register(ty, Box::new(process), None).unwrap();
        }
        let reporter = StatusReporter::new(Arc::clone(&tracker), SharedResourceMonitor::new(100));

        let snapshot = reporter.snapshot().unwrap();

        assert_eq!(snapshot.instance_count(), 3);
        assert_eq!(snapshot.per_type["Z-Waifu"].len(), 2);
        assert_eq!(snapshot.per_type["Ollama"][0].state, InstanceState::Starting);
        assert!(snapshot.host_metrics.total_memory > 0);

        // Reporting did not observe or transition anything
        for list in tracker.list_all().unwrap().values() {
            assert!(list.iter().all(|i| i.state == InstanceState::Starting));
        }
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let tracker = Arc::new(InstanceTracker::new());
        let reporter = StatusReporter::new(tracker, SharedResourceMonitor::new(100));
        let json = serde_json::to_value(reporter.snapshot().unwrap()).unwrap();
        assert!(json.get("timestamp").is_some());
        assert!(json["per_type"].as_object().unwrap().is_empty());
        assert!(json["host_metrics"].get("cpu_percent").is_some());
        assert!(json["host_metrics"].get("memory_percent").is_some());
    }
}
