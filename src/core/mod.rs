//! Core module - Instance tracking, termination, admin key and status reporting

mod clock;
mod credential;
mod error;
mod instance;
mod monitor;
mod process;
pub mod process_type;
pub mod resource;
pub mod settings;
mod status;
mod supervisor;
mod termination;
mod tracker;

pub use clock::{Clock, SystemClock};
pub use credential::{Credential, CredentialManager};
pub use error::{ErrorClass, PersistenceOp, SupervisorError, SupervisorResult};
pub use instance::{Instance, InstanceId, InstanceState};
pub use process::{LaunchSpec, Launcher, ProcessHandle, ProcessPoll, ScriptLauncher, SignalKind};
pub use process_type::{canonicalize, ProcessType};
pub use settings::{Settings, ToolConfig};
pub use status::{InstanceSummary, StatusReporter, StatusSnapshot};
pub use supervisor::{Authorization, LaunchRequest, Supervisor};
pub use termination::{StopOutcome, StopReport, StopTarget, TerminationEngine, TerminationPolicy};
pub use tracker::{InstanceList, InstanceTracker};
