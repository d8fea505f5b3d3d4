//! Instance tracker - Which instances of which tool types exist and what state they are in

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::error::{SupervisorError, SupervisorResult};
use super::instance::{Instance, InstanceId, InstanceState};
use super::process::{ProcessHandle, ProcessPoll, SignalKind};
use super::process_type::ProcessType;

type SharedHandle = Arc<Mutex<Box<dyn ProcessHandle>>>;

struct Tracked {
    instance: Instance,
    /// Absent for launches that never produced a process
    handle: Option<SharedHandle>,
}

/// Point-in-time copy of a set of instances; iterate it as often as needed
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct InstanceList(Vec<Instance>);

impl InstanceList {
    pub fn iter(&self) -> std::slice::Iter<'_, Instance> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn ids(&self) -> Vec<InstanceId> {
        self.0.iter().map(|i| i.id).collect()
    }
}

impl<'a> IntoIterator for &'a InstanceList {
    type Item = &'a Instance;
    type IntoIter = std::slice::Iter<'a, Instance>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl IntoIterator for InstanceList {
    type Item = Instance;
    type IntoIter = std::vec::IntoIter<Instance>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Tracks every instance launched during this session.
///
/// Reads take a shared lock; every mutation is serialized on the write lock.
/// Process handles carry their own mutex so polling a process never holds
/// the tracker lock.
#[derive(Default)]
pub struct InstanceTracker {
    instances: RwLock<HashMap<InstanceId, Tracked>>,
}

impl InstanceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> SupervisorResult<RwLockReadGuard<'_, HashMap<InstanceId, Tracked>>> {
        self.instances
            .read()
            .map_err(|e| SupervisorError::lock_poisoned("Instances", e))
    }

    fn write(&self) -> SupervisorResult<RwLockWriteGuard<'_, HashMap<InstanceId, Tracked>>> {
        self.instances
            .write()
            .map_err(|e| SupervisorError::lock_poisoned("Instances", e))
    }

    /// Start tracking a freshly launched process
    pub fn register(
        &self,
        process_type: ProcessType,
        handle: Box<dyn ProcessHandle>,
        owner: Option<String>,
    ) -> SupervisorResult<Instance> {
        let instance = Instance::new(process_type, handle.pid(), owner);
        self.write()?.insert(
            instance.id,
            Tracked {
                instance: instance.clone(),
                handle: Some(Arc::new(Mutex::new(handle))),
            },
        );
        info!(
            "Registered {} instance {} (pid {:?})",
            instance.process_type, instance.id, instance.pid
        );
        Ok(instance)
    }

    /// Keep a record of a launch that never produced a process
    pub fn record_failed_launch(
        &self,
        process_type: ProcessType,
        error: String,
        owner: Option<String>,
    ) -> SupervisorResult<Instance> {
        let mut instance = Instance::new(process_type, None, owner);
        instance.mark_failed(None, Some(error));
        self.write()?.insert(
            instance.id,
            Tracked {
                instance: instance.clone(),
                handle: None,
            },
        );
        Ok(instance)
    }

    pub fn get(&self, id: InstanceId) -> SupervisorResult<Instance> {
        self.read()?
            .get(&id)
            .map(|t| t.instance.clone())
            .ok_or(SupervisorError::InstanceNotFound(id))
    }

    /// Poll the OS process and update the instance's state.
    ///
    /// Terminal states are sticky; a live process keeps `Stopping` while a
    /// termination is in progress.
    pub fn observe(&self, id: InstanceId) -> SupervisorResult<InstanceState> {
        let handle = {
            let instances = self.read()?;
            let tracked = instances
                .get(&id)
                .ok_or(SupervisorError::InstanceNotFound(id))?;
            if tracked.instance.state.is_terminal() {
                return Ok(tracked.instance.state);
            }
            match tracked.handle {
                Some(ref handle) => Arc::clone(handle),
                None => return Ok(tracked.instance.state),
            }
        };

        let poll = handle
            .lock()
            .map_err(|e| SupervisorError::lock_poisoned("Process handle", e))?
            .poll();

        let mut instances = self.write()?;
        let instance = &mut instances
            .get_mut(&id)
            .ok_or(SupervisorError::InstanceNotFound(id))?
            .instance;

        if instance.state.is_terminal() {
            return Ok(instance.state);
        }

        match poll {
            Ok(ProcessPoll::Running) => instance.mark_running(),
            Ok(ProcessPoll::Exited { code, success }) => {
                if success || instance.state == InstanceState::Stopping {
                    instance.mark_stopped(code);
                } else {
                    let error = match code {
                        Some(code) => format!("Process exited with code {}", code),
                        None => "Process terminated by signal".to_string(),
                    };
                    warn!("{} instance {} failed: {}", instance.process_type, id, error);
                    instance.mark_failed(code, Some(error));
                }
            }
            Err(e) => {
                error!("Error checking process status for {}: {}", id, e);
                instance.mark_failed(None, Some(e.to_string()));
            }
        }

        Ok(instance.state)
    }

    /// Observe every non-terminal instance
    pub fn observe_all(&self) -> SupervisorResult<Vec<(InstanceId, InstanceState)>> {
        let mut states = Vec::new();
        for id in self.non_terminal_ids(None)? {
            match self.observe(id) {
                Ok(state) => states.push((id, state)),
                // Reaped between listing and observing
                Err(SupervisorError::InstanceNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(states)
    }

    pub fn list_by_type(&self, process_type: &ProcessType) -> SupervisorResult<InstanceList> {
        let mut list: Vec<Instance> = self
            .read()?
            .values()
            .filter(|t| &t.instance.process_type == process_type)
            .map(|t| t.instance.clone())
            .collect();
        list.sort_by_key(|i| i.started_at);
        Ok(InstanceList(list))
    }

    pub fn list_all(&self) -> SupervisorResult<BTreeMap<ProcessType, InstanceList>> {
        let mut grouped: BTreeMap<ProcessType, Vec<Instance>> = BTreeMap::new();
        for tracked in self.read()?.values() {
            grouped
                .entry(tracked.instance.process_type.clone())
                .or_default()
                .push(tracked.instance.clone());
        }
        Ok(grouped
            .into_iter()
            .map(|(ty, mut list)| {
                list.sort_by_key(|i| i.started_at);
                (ty, InstanceList(list))
            })
            .collect())
    }

    /// IDs of instances not yet in a terminal state, optionally of one type
    pub fn non_terminal_ids(
        &self,
        process_type: Option<&ProcessType>,
    ) -> SupervisorResult<Vec<InstanceId>> {
        Ok(self
            .read()?
            .values()
            .filter(|t| !t.instance.state.is_terminal())
            .filter(|t| process_type.map_or(true, |ty| &t.instance.process_type == ty))
            .map(|t| t.instance.id)
            .collect())
    }

    /// Remove a terminal instance from the tracker
    pub fn reap(&self, id: InstanceId) -> SupervisorResult<Instance> {
        let mut instances = self.write()?;
        let tracked = instances
            .get(&id)
            .ok_or(SupervisorError::InstanceNotFound(id))?;

        if !tracked.instance.state.is_terminal() {
            return Err(SupervisorError::InvalidState {
                id,
                state: tracked.instance.state,
                expected: "Stopped or Failed",
            });
        }

        let removed = instances
            .remove(&id)
            .map(|t| t.instance)
            .ok_or(SupervisorError::InstanceNotFound(id))?;
        info!("Reaped instance {}", id);
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.instances.read().map(|i| i.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move a live instance to `Stopping`; `false` if it is already terminal
    pub(crate) fn begin_stop(&self, id: InstanceId) -> SupervisorResult<bool> {
        let mut instances = self.write()?;
        let instance = &mut instances
            .get_mut(&id)
            .ok_or(SupervisorError::InstanceNotFound(id))?
            .instance;
        if instance.state.is_terminal() {
            return Ok(false);
        }
        instance.mark_stopping();
        Ok(true)
    }

    /// Deliver a termination signal to the instance's process
    pub(crate) fn signal(&self, id: InstanceId, kind: SignalKind) -> SupervisorResult<()> {
        let handle = self
            .read()?
            .get(&id)
            .ok_or(SupervisorError::InstanceNotFound(id))?
            .handle
            .clone();

        let Some(handle) = handle else {
            return Ok(());
        };

        debug!("Sending {:?} signal to instance {}", kind, id);
        let result = handle
            .lock()
            .map_err(|e| SupervisorError::lock_poisoned("Process handle", e))?
            .signal(kind)
            .map_err(|e| SupervisorError::Internal(e.to_string()));
        result
    }

    /// Record that the process survived the forced kill; the instance stays `Stopping`
    pub(crate) fn mark_stop_timed_out(&self, id: InstanceId) -> SupervisorResult<()> {
        let mut instances = self.write()?;
        let instance = &mut instances
            .get_mut(&id)
            .ok_or(SupervisorError::InstanceNotFound(id))?
            .instance;
        instance.last_error = Some("Process survived forced kill".to_string());
        instance.touch();
        Ok(())
    }
}
