//! Supervisor - The control surface the GUI and HTTP endpoint call into

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use serde::Deserialize;
use tracing::{error, info, warn};

use super::clock::{Clock, SystemClock};
use super::credential::{Credential, CredentialManager};
use super::error::{SupervisorError, SupervisorResult};
use super::instance::{Instance, InstanceId};
use super::monitor::SharedResourceMonitor;
use super::process::{LaunchSpec, Launcher, ScriptLauncher};
use super::process_type::{self, ProcessType};
use super::settings::Settings;
use super::status::{StatusReporter, StatusSnapshot};
use super::termination::{StopOutcome, StopReport, StopTarget, TerminationEngine};
use super::tracker::{InstanceList, InstanceTracker};
use crate::persistence::{Database, HistoryEvent, KeyFile};

/// Who is asking for a control operation
#[derive(Debug, Clone, Default)]
pub struct Authorization {
    /// Presented admin key
    pub admin_key: Option<String>,
    /// Identity of the control client, matched against instance owners
    pub client: Option<String>,
}

impl Authorization {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn admin(key: impl Into<String>) -> Self {
        Self {
            admin_key: Some(key.into()),
            client: None,
        }
    }

    pub fn client(client: impl Into<String>) -> Self {
        Self {
            admin_key: None,
            client: Some(client.into()),
        }
    }
}

/// Request to start a new instance
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LaunchRequest {
    /// Free-form type name, canonicalized before use
    pub process_type: String,
    /// Client that will own the instance
    #[serde(default)]
    pub owner: Option<String>,
    /// Overrides the configured launch command for the type
    #[serde(default)]
    pub launch: Option<LaunchSpec>,
}

impl LaunchRequest {
    pub fn new(process_type: impl Into<String>) -> Self {
        Self {
            process_type: process_type.into(),
            ..Default::default()
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_launch(mut self, launch: LaunchSpec) -> Self {
        self.launch = Some(launch);
        self
    }
}

/// Owns every supervision component; no process-wide state
pub struct Supervisor {
    tracker: Arc<InstanceTracker>,
    engine: TerminationEngine,
    credentials: Arc<CredentialManager>,
    reporter: StatusReporter,
    launcher: Arc<dyn Launcher>,
    database: Arc<Database>,
    settings: Arc<RwLock<Settings>>,
}

impl Supervisor {
    /// Create a supervisor that launches real processes
    pub fn new(database: Database, settings: Settings) -> Result<Self> {
        std::fs::create_dir_all(settings.get_data_directory())?;
        Ok(Self::with_parts(
            database,
            settings,
            Arc::new(ScriptLauncher),
            Arc::new(SystemClock),
        ))
    }

    pub fn with_parts(
        database: Database,
        settings: Settings,
        launcher: Arc<dyn Launcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let tracker = Arc::new(InstanceTracker::new());
        let engine = TerminationEngine::new(Arc::clone(&tracker), settings.termination_policy());
        let credentials = Arc::new(CredentialManager::new(
            KeyFile::new(settings.get_key_file_path()),
            settings.credential_window(),
            clock,
        ));
        let reporter = StatusReporter::new(
            Arc::clone(&tracker),
            SharedResourceMonitor::new(settings.monitor_interval_ms),
        );

        Self {
            tracker,
            engine,
            credentials,
            reporter,
            launcher,
            database: Arc::new(database),
            settings: Arc::new(RwLock::new(settings)),
        }
    }

    fn settings(&self) -> SupervisorResult<Settings> {
        self.settings
            .read()
            .map(|s| s.clone())
            .map_err(|e| SupervisorError::lock_poisoned("Settings", e))
    }

    pub fn tracker(&self) -> &Arc<InstanceTracker> {
        &self.tracker
    }

    pub fn credentials(&self) -> &Arc<CredentialManager> {
        &self.credentials
    }

    /// Record a history event; history is best effort
    fn record(&self, instance: &Instance, event: &str, details: Option<&str>) {
        if let Err(e) = self.database.record_instance_event(
            instance.id,
            instance.process_type.as_str(),
            event,
            details,
        ) {
            warn!("Failed to record {} event for {}: {}", event, instance.id, e);
        }
    }

    /// Status snapshot; requires no credential
    pub fn status(&self) -> SupervisorResult<StatusSnapshot> {
        self.reporter.snapshot()
    }

    /// Activate (mint or renew) the admin key
    pub fn ensure_admin_key(&self) -> SupervisorResult<Credential> {
        self.credentials.ensure_active()
    }

    /// Launch a new instance of a tool.
    ///
    /// Configured tools launch for anyone. A request carrying its own launch
    /// command runs arbitrary programs and needs the admin key.
    pub fn create_instance(
        &self,
        request: LaunchRequest,
        auth: &Authorization,
    ) -> SupervisorResult<InstanceId> {
        if request.launch.is_some() {
            self.require_admin(auth)?;
        }

        let settings = self.settings()?;
        let process_type =
            process_type::resolve(&request.process_type, settings.allow_ad_hoc_types)?;

        let spec = match request.launch {
            Some(spec) => spec,
            None => settings
                .tool_for(&process_type)
                .map(|t| t.launch.clone())
                .ok_or_else(|| SupervisorError::NotConfigured(process_type.clone()))?,
        };

        let owner = request.owner.or_else(|| auth.client.clone());
        self.launch(process_type, &spec, owner)
    }

    fn launch(
        &self,
        process_type: ProcessType,
        spec: &LaunchSpec,
        owner: Option<String>,
    ) -> SupervisorResult<InstanceId> {
        match self.launcher.start(spec) {
            Ok(handle) => {
                let instance = self.tracker.register(process_type, handle, owner)?;
                let details = instance.pid.map(|pid| format!("pid {}", pid));
                self.record(&instance, "launched", details.as_deref());
                Ok(instance.id)
            }
            Err(e) => {
                let message = format!("{:#}", e);
                error!("Failed to launch {}: {}", process_type, message);
                let instance =
                    self.tracker
                        .record_failed_launch(process_type.clone(), message.clone(), owner)?;
                self.record(&instance, "launch_failed", Some(&message));
                Err(SupervisorError::LaunchFailed {
                    process_type,
                    message,
                })
            }
        }
    }

    /// Launch every tool configured to start with the supervisor
    pub fn autostart(&self) -> SupervisorResult<Vec<(ProcessType, SupervisorResult<InstanceId>)>> {
        let settings = self.settings()?;
        Ok(settings
            .tools
            .iter()
            .filter(|t| t.autostart)
            .map(|tool| {
                let result = self.launch(tool.process_type.clone(), &tool.launch, None);
                (tool.process_type.clone(), result)
            })
            .collect())
    }

    pub fn get_instance(&self, id: InstanceId) -> SupervisorResult<Instance> {
        self.tracker.get(id)
    }

    pub fn list_instances(&self) -> SupervisorResult<BTreeMap<ProcessType, InstanceList>> {
        self.tracker.list_all()
    }

    pub fn instance_history(&self, id: InstanceId) -> SupervisorResult<Vec<HistoryEvent>> {
        self.database
            .get_instance_history(id)
            .map_err(|e| SupervisorError::Internal(format!("{:#}", e)))
    }

    fn require_admin(&self, auth: &Authorization) -> SupervisorResult<()> {
        self.credentials.authorize(auth.admin_key.as_deref())
    }

    /// Stop one instance; its owner needs no admin key
    pub async fn stop_instance(
        &self,
        id: InstanceId,
        auth: &Authorization,
    ) -> SupervisorResult<StopOutcome> {
        let instance = self.tracker.get(id)?;
        let owned = auth
            .client
            .as_deref()
            .is_some_and(|client| instance.is_owned_by(client));
        if !owned {
            self.require_admin(auth)?;
        }

        let outcome = self.engine.stop(id).await?;
        self.record_outcome(id, outcome);
        Ok(outcome)
    }

    /// Stop every live instance of a type
    pub async fn stop_type(
        &self,
        raw_type: &str,
        auth: &Authorization,
    ) -> SupervisorResult<StopReport> {
        self.require_admin(auth)?;
        let allow_ad_hoc = self.settings()?.allow_ad_hoc_types;
        let process_type = process_type::resolve(raw_type, allow_ad_hoc)?;
        self.stop_target(&StopTarget::Type(process_type)).await
    }

    /// Stop every live instance
    pub async fn stop_all(&self, auth: &Authorization) -> SupervisorResult<StopReport> {
        self.require_admin(auth)?;
        self.stop_target(&StopTarget::All).await
    }

    /// Stop everything on supervisor exit, without a credential
    pub async fn shutdown(&self) -> SupervisorResult<StopReport> {
        info!("Shutting down, stopping all instances");
        self.stop_target(&StopTarget::All).await
    }

    async fn stop_target(&self, target: &StopTarget) -> SupervisorResult<StopReport> {
        let report = self.engine.stop_all(target).await?;
        for (id, result) in &report {
            if let Ok(outcome) = result {
                self.record_outcome(*id, *outcome);
            }
        }
        Ok(report)
    }

    fn record_outcome(&self, id: InstanceId, outcome: StopOutcome) {
        if outcome == StopOutcome::AlreadyStopped {
            return;
        }
        if let Ok(instance) = self.tracker.get(id) {
            let event = if outcome == StopOutcome::TimedOut {
                "stop_timed_out"
            } else {
                "stopped"
            };
            self.record(&instance, event, Some(&format!("{:?}", outcome)));
        }
    }

    /// Forget a terminal instance
    pub fn reap(&self, id: InstanceId, auth: &Authorization) -> SupervisorResult<Instance> {
        self.require_admin(auth)?;
        let instance = self.tracker.reap(id)?;
        self.record(&instance, "reaped", None);
        Ok(instance)
    }

    /// Poll every live instance, recording exits noticed here
    pub fn refresh(&self) -> SupervisorResult<()> {
        for (id, state) in self.tracker.observe_all()? {
            if !state.is_terminal() {
                continue;
            }
            let instance = self.tracker.get(id)?;
            info!(
                "{} instance {} exited ({})",
                instance.process_type,
                id,
                state.label()
            );
            self.record(&instance, "exited", instance.last_error.as_deref());
        }
        Ok(())
    }

    /// Drop history past the retention window
    pub fn prune_history(&self) -> SupervisorResult<usize> {
        let retention = self.settings()?.history_retention_days;
        self.database
            .cleanup_history(retention)
            .map_err(|e| SupervisorError::Internal(format!("{:#}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::instance::InstanceState;
    use crate::core::process::testing::{Behavior, FakeLauncher};
    use crate::core::settings::ToolConfig;
    use tempfile::TempDir;

    fn settings(temp: &TempDir) -> Settings {
        Settings {
            data_directory: Some(temp.path().to_path_buf()),
            grace_period_ms: 150,
            force_period_ms: 150,
            stop_poll_interval_ms: 10,
            tools: vec![ToolConfig {
                process_type: ProcessType::Ollama,
                launch: LaunchSpec::new("/opt/ollama/start.sh"),
                autostart: true,
            }],
            ..Default::default()
        }
    }

    fn supervisor(temp: &TempDir, launcher: FakeLauncher, settings: Settings) -> Supervisor {
        supervisor_with(temp, Arc::new(launcher), settings)
    }

    fn supervisor_with(
        temp: &TempDir,
        launcher: Arc<FakeLauncher>,
        settings: Settings,
    ) -> Supervisor {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        let sup = Supervisor::with_parts(
            db,
            settings,
            launcher,
            Arc::new(ManualClock::new(chrono::Utc::now())),
        );
        assert!(sup.credentials().key_file().path().starts_with(temp.path()));
        sup
    }

    #[test]
    fn create_instance_canonicalizes_and_uses_configured_tool() {
        let temp = TempDir::new().unwrap();
        let sup = supervisor(&temp, FakeLauncher::new(Behavior::ExitOnGraceful), settings(&temp));

        let id = sup
            .create_instance(LaunchRequest::new("OLLAMA"), &Authorization::anonymous())
            .unwrap();
        let instance = sup.get_instance(id).unwrap();
        assert_eq!(instance.process_type, ProcessType::Ollama);
        assert_eq!(instance.state, InstanceState::Starting);

        let history = sup.instance_history(id).unwrap();
        assert_eq!(history[0].event_type, "launched");
    }

    #[test]
    fn create_instance_without_launch_command_is_not_configured() {
        let temp = TempDir::new().unwrap();
        let sup = supervisor(&temp, FakeLauncher::new(Behavior::ExitOnGraceful), settings(&temp));
        assert!(matches!(
            sup.create_instance(LaunchRequest::new("rvc"), &Authorization::anonymous()),
            Err(SupervisorError::NotConfigured(ProcessType::Rvc))
        ));
    }

    #[test]
    fn strict_policy_rejects_ad_hoc_types() {
        let temp = TempDir::new().unwrap();
        let mut strict = settings(&temp);
        strict.allow_ad_hoc_types = false;
        let sup = supervisor(&temp, FakeLauncher::new(Behavior::ExitOnGraceful), strict);
        let admin = Authorization::admin(sup.ensure_admin_key().unwrap().secret);

        let request = LaunchRequest::new("kobold").with_launch(LaunchSpec::new("/opt/kobold.sh"));
        assert!(matches!(
            sup.create_instance(request, &admin),
            Err(SupervisorError::UnknownType(_))
        ));
        assert!(sup.list_instances().unwrap().is_empty());
    }

    #[test]
    fn ad_hoc_types_launch_with_explicit_command() {
        let temp = TempDir::new().unwrap();
        let sup = supervisor(&temp, FakeLauncher::new(Behavior::ExitOnGraceful), settings(&temp));
        let admin = Authorization::admin(sup.ensure_admin_key().unwrap().secret);

        let request =
            LaunchRequest::new("kobold cpp").with_launch(LaunchSpec::new("/opt/kobold.sh"));
        let id = sup.create_instance(request, &admin).unwrap();
        assert_eq!(
            sup.get_instance(id).unwrap().process_type,
            ProcessType::AdHoc("Kobold Cpp".into())
        );
    }

    #[test]
    fn launch_command_from_a_request_needs_admin_key() {
        let temp = TempDir::new().unwrap();
        let launcher = Arc::new(FakeLauncher::new(Behavior::ExitOnGraceful));
        let sup = supervisor_with(&temp, Arc::clone(&launcher), settings(&temp));
        sup.ensure_admin_key().unwrap();

        let request: LaunchRequest = serde_json::from_str(
            r#"{"process_type":"anything","launch":{"script":"/tmp/payload.sh"}}"#,
        )
        .unwrap();

        for auth in [
            Authorization::anonymous(),
            Authorization::client("http"),
            Authorization::admin("0".repeat(64)),
        ] {
            assert!(matches!(
                sup.create_instance(request.clone(), &auth),
                Err(SupervisorError::CredentialInvalid)
            ));
        }
        assert!(launcher.probes.lock().unwrap().is_empty());
        assert!(sup.list_instances().unwrap().is_empty());
    }

    #[test]
    fn configured_tool_launch_records_client_as_owner() {
        let temp = TempDir::new().unwrap();
        let sup = supervisor(&temp, FakeLauncher::new(Behavior::ExitOnGraceful), settings(&temp));

        let id = sup
            .create_instance(LaunchRequest::new("ollama"), &Authorization::client("gui"))
            .unwrap();
        assert!(sup.get_instance(id).unwrap().is_owned_by("gui"));
    }

    #[test]
    fn failed_launch_is_kept_as_failed_instance() {
        let temp = TempDir::new().unwrap();
        let sup = supervisor(&temp, FakeLauncher::failing(), settings(&temp));

        assert!(matches!(
            sup.create_instance(LaunchRequest::new("ollama"), &Authorization::anonymous()),
            Err(SupervisorError::LaunchFailed { .. })
        ));
        let all = sup.list_instances().unwrap();
        let failed = all[&ProcessType::Ollama].iter().next().unwrap();
        assert_eq!(failed.state, InstanceState::Failed);
        assert!(failed.pid.is_none());
    }

    #[tokio::test]
    async fn owner_can_stop_own_instance_without_admin_key() {
        let temp = TempDir::new().unwrap();
        let sup = supervisor(&temp, FakeLauncher::new(Behavior::ExitOnGraceful), settings(&temp));
        sup.ensure_admin_key().unwrap();

        let id = sup
            .create_instance(LaunchRequest::new("ollama"), &Authorization::client("gui"))
            .unwrap();

        assert!(matches!(
            sup.stop_instance(id, &Authorization::client("http")).await,
            Err(SupervisorError::CredentialInvalid)
        ));
        assert_eq!(
            sup.stop_instance(id, &Authorization::client("gui"))
                .await
                .unwrap(),
            StopOutcome::Graceful
        );
    }

    #[tokio::test]
    async fn bulk_stops_require_admin_key_and_report_each_instance() {
        let temp = TempDir::new().unwrap();
        let sup = supervisor(&temp, FakeLauncher::new(Behavior::ExitOnForced), settings(&temp));
        let key = sup.ensure_admin_key().unwrap();

        let a = sup
            .create_instance(LaunchRequest::new("ollama"), &Authorization::anonymous())
            .unwrap();
        let b = sup
            .create_instance(LaunchRequest::new("Ollama"), &Authorization::anonymous())
            .unwrap();

        let err = sup.stop_all(&Authorization::anonymous()).await.unwrap_err();
        assert!(err.is_authorization());

        let report = sup
            .stop_type("OLLAMA", &Authorization::admin(key.secret.clone()))
            .await
            .unwrap();
        assert_eq!(report.len(), 2);
        assert_eq!(report[&a].as_ref().unwrap(), &StopOutcome::Forced);
        assert_eq!(report[&b].as_ref().unwrap(), &StopOutcome::Forced);

        // Nothing left to stop
        let again = sup
            .stop_all(&Authorization::admin(key.secret))
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn reap_requires_terminal_state_and_admin_key() {
        let temp = TempDir::new().unwrap();
        let sup = supervisor(&temp, FakeLauncher::new(Behavior::ExitOnGraceful), settings(&temp));
        let key = sup.ensure_admin_key().unwrap();
        let admin = Authorization::admin(key.secret);

        let id = sup
            .create_instance(LaunchRequest::new("ollama"), &Authorization::anonymous())
            .unwrap();
        sup.refresh().unwrap();
        assert!(matches!(
            sup.reap(id, &admin),
            Err(SupervisorError::InvalidState { .. })
        ));
        assert!(sup.reap(id, &Authorization::anonymous()).unwrap_err().is_authorization());

        sup.stop_instance(id, &admin).await.unwrap();
        sup.reap(id, &admin).unwrap();
        assert!(sup.list_instances().unwrap().is_empty());

        let events: Vec<String> = sup
            .instance_history(id)
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert!(events.contains(&"reaped".to_string()));
        assert!(events.contains(&"stopped".to_string()));
    }

    #[test]
    fn refresh_records_exits() {
        let temp = TempDir::new().unwrap();
        let launcher = Arc::new(FakeLauncher::new(Behavior::Unkillable));
        let sup = supervisor_with(&temp, Arc::clone(&launcher), settings(&temp));
        let id = sup
            .create_instance(LaunchRequest::new("ollama"), &Authorization::anonymous())
            .unwrap();

        sup.refresh().unwrap();
        assert_eq!(sup.get_instance(id).unwrap().state, InstanceState::Running);

        launcher.probes.lock().unwrap()[0].exit(1);
        sup.refresh().unwrap();
        assert_eq!(sup.get_instance(id).unwrap().state, InstanceState::Failed);
        assert_eq!(sup.instance_history(id).unwrap()[0].event_type, "exited");
    }

    #[tokio::test]
    async fn autostart_and_shutdown() {
        let temp = TempDir::new().unwrap();
        let sup = supervisor(&temp, FakeLauncher::new(Behavior::ExitOnGraceful), settings(&temp));

        let started = sup.autostart().unwrap();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].0, ProcessType::Ollama);
        let id = *started[0].1.as_ref().unwrap();

        let status = sup.status().unwrap();
        assert_eq!(status.per_type["Ollama"].len(), 1);

        let report = sup.shutdown().await.unwrap();
        assert_eq!(report[&id].as_ref().unwrap(), &StopOutcome::Graceful);
    }
}
