//! Termination engine - Graceful then forced shutdown of tracked instances

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::error::{SupervisorError, SupervisorResult};
use super::instance::{InstanceId, InstanceState};
use super::process::SignalKind;
use super::process_type::ProcessType;
use super::tracker::InstanceTracker;

/// How a stop request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopOutcome {
    /// Exited within the grace period
    Graceful,
    /// Exited after the forced kill
    Forced,
    /// Already terminal, nothing was sent
    AlreadyStopped,
    /// Survived the forced kill
    TimedOut,
}

impl StopOutcome {
    /// Treat a process that outlived the forced kill as an error
    pub fn into_result(self, id: InstanceId) -> SupervisorResult<StopOutcome> {
        match self {
            Self::TimedOut => Err(SupervisorError::TerminationTimedOut(id)),
            other => Ok(other),
        }
    }
}

/// Escalation timings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationPolicy {
    pub grace_period: Duration,
    pub force_period: Duration,
    pub poll_interval: Duration,
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            force_period: Duration::from_secs(2),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Which instances a bulk stop targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopTarget {
    All,
    Type(ProcessType),
}

/// Per-instance results of a bulk stop
pub type StopReport = BTreeMap<InstanceId, SupervisorResult<StopOutcome>>;

/// Escalation phase of one stop in progress
#[derive(Debug, Clone, Copy)]
enum StopPhase {
    Graceful { deadline: Instant },
    Forced { deadline: Instant },
}

/// Receives the outcome of an in-flight stop protocol once it finishes
type OutcomeReceiver = watch::Receiver<Option<SupervisorResult<StopOutcome>>>;

/// Protocols currently running, one per instance
type InFlight = Arc<Mutex<HashMap<InstanceId, OutcomeReceiver>>>;

/// Runs stop protocols against instances in an [`InstanceTracker`].
///
/// Every protocol runs in its own spawned task. Dropping the future returned
/// by [`stop`](Self::stop) detaches from the task but does not cancel it, so a
/// process that has been sent a termination signal is always followed through
/// to an outcome.
///
/// At most one protocol runs per instance. A stop request for an instance
/// that is already being stopped waits for the running protocol and gets its
/// outcome; its own policy is ignored.
#[derive(Clone)]
pub struct TerminationEngine {
    tracker: Arc<InstanceTracker>,
    policy: TerminationPolicy,
    in_flight: InFlight,
}

impl TerminationEngine {
    pub fn new(tracker: Arc<InstanceTracker>, policy: TerminationPolicy) -> Self {
        Self {
            tracker,
            policy,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn policy(&self) -> TerminationPolicy {
        self.policy
    }

    /// Stop one instance
    pub async fn stop(&self, id: InstanceId) -> SupervisorResult<StopOutcome> {
        self.stop_with(id, self.policy).await
    }

    /// Stop one instance with timings other than the configured ones
    pub async fn stop_with(
        &self,
        id: InstanceId,
        policy: TerminationPolicy,
    ) -> SupervisorResult<StopOutcome> {
        let receiver = self.start_or_join(id, policy)?;
        wait_for_outcome(id, receiver).await
    }

    /// Stop every non-terminal instance matching `target`, concurrently
    pub async fn stop_all(&self, target: &StopTarget) -> SupervisorResult<StopReport> {
        let filter = match target {
            StopTarget::All => None,
            StopTarget::Type(ty) => Some(ty),
        };
        let ids = self.tracker.non_terminal_ids(filter)?;
        info!("Stopping {} instance(s) ({:?})", ids.len(), target);

        // Start every protocol before awaiting any of them
        let pending: Vec<(InstanceId, SupervisorResult<OutcomeReceiver>)> = ids
            .into_iter()
            .map(|id| (id, self.start_or_join(id, self.policy)))
            .collect();

        let mut report = StopReport::new();
        for (id, receiver) in pending {
            let result = match receiver {
                Ok(receiver) => wait_for_outcome(id, receiver).await,
                Err(e) => Err(e),
            };
            if let Err(ref e) = result {
                error!("Failed to stop instance {}: {}", id, e);
            }
            report.insert(id, result);
        }
        Ok(report)
    }

    /// Spawn the protocol for `id`, or join the one already running
    fn start_or_join(
        &self,
        id: InstanceId,
        policy: TerminationPolicy,
    ) -> SupervisorResult<OutcomeReceiver> {
        let mut in_flight = self
            .in_flight
            .lock()
            .map_err(|e| SupervisorError::lock_poisoned("Stop registry", e))?;

        if let Some(receiver) = in_flight.get(&id) {
            debug!("Instance {} is already stopping, joining", id);
            return Ok(receiver.clone());
        }

        let (sender, receiver) = watch::channel(None);
        in_flight.insert(id, receiver.clone());

        let tracker = Arc::clone(&self.tracker);
        let registration = Registration {
            in_flight: Arc::clone(&self.in_flight),
            id,
        };
        tokio::spawn(async move {
            let result = run_stop(&tracker, id, policy).await;
            // Deregister first so a waiter that sees the outcome can start a fresh stop
            drop(registration);
            // Nobody may be waiting any more
            let _ = sender.send(Some(result));
        });

        Ok(receiver)
    }
}

/// Removes an instance from the in-flight registry when its task ends
struct Registration {
    in_flight: InFlight,
    id: InstanceId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(&self.id);
        }
    }
}

async fn wait_for_outcome(
    id: InstanceId,
    mut receiver: OutcomeReceiver,
) -> SupervisorResult<StopOutcome> {
    loop {
        let current = receiver.borrow_and_update().clone();
        if let Some(result) = current {
            return result;
        }
        receiver.changed().await.map_err(|_| {
            SupervisorError::Internal(format!("stop task for {} ended without an outcome", id))
        })?;
    }
}

/// The per-instance escalation state machine
async fn run_stop(
    tracker: &InstanceTracker,
    id: InstanceId,
    policy: TerminationPolicy,
) -> SupervisorResult<StopOutcome> {
    // Pick up an exit that happened since the last poll
    tracker.observe(id)?;
    if !tracker.begin_stop(id)? {
        return Ok(StopOutcome::AlreadyStopped);
    }

    if let Err(e) = tracker.signal(id, SignalKind::Graceful) {
        warn!("Graceful termination of {} failed: {}", id, e);
    }
    let mut phase = StopPhase::Graceful {
        deadline: Instant::now() + policy.grace_period,
    };

    loop {
        let state = tracker.observe(id)?;
        if state.is_terminal() {
            let outcome = match phase {
                StopPhase::Graceful { .. } => StopOutcome::Graceful,
                StopPhase::Forced { .. } => StopOutcome::Forced,
            };
            if state == InstanceState::Failed {
                warn!("Instance {} failed while stopping", id);
            }
            info!("Instance {} stopped ({:?})", id, outcome);
            return Ok(outcome);
        }

        let now = Instant::now();
        match phase {
            StopPhase::Graceful { deadline } if now >= deadline => {
                warn!(
                    "Instance {} ignored graceful termination for {:?}, forcing kill",
                    id, policy.grace_period
                );
                if let Err(e) = tracker.signal(id, SignalKind::Forced) {
                    error!("Forced kill of {} failed: {}", id, e);
                }
                phase = StopPhase::Forced {
                    deadline: now + policy.force_period,
                };
            }
            StopPhase::Forced { deadline } if now >= deadline => {
                error!("Instance {} survived forced kill", id);
                tracker.mark_stop_timed_out(id)?;
                return Ok(StopOutcome::TimedOut);
            }
            StopPhase::Graceful { deadline } | StopPhase::Forced { deadline } => {
                tokio::time::sleep(policy.poll_interval.min(deadline - now)).await;
            }
        }
    }
}
