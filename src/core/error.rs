//! Error taxonomy for supervisor operations

use thiserror::Error;

use super::instance::{InstanceId, InstanceState};
use super::process_type::ProcessType;

/// Which side of a persistence round trip failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceOp {
    /// Reading is recoverable: the credential is regenerated
    Read,
    /// Writing is surfaced to the caller
    Write,
}

impl std::fmt::Display for PersistenceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// Coarse classification used by the control boundary to pick a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Unauthorized,
    NotFound,
    Conflict,
    BadRequest,
    Internal,
}

impl ErrorClass {
    /// HTTP status an endpoint should answer with
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unauthorized => 401,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::BadRequest => 400,
            Self::Internal => 500,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum SupervisorError {
    #[error("unknown process type '{0}'")]
    UnknownType(String),

    #[error("instance {0} not found")]
    InstanceNotFound(InstanceId),

    #[error("instance {id} is {state:?}, expected {expected}")]
    InvalidState {
        id: InstanceId,
        state: InstanceState,
        expected: &'static str,
    },

    #[error("instance {0} survived a forced kill")]
    TerminationTimedOut(InstanceId),

    #[error("admin key has expired")]
    CredentialExpired,

    #[error("admin key is missing or invalid")]
    CredentialInvalid,

    #[error("failed to {op} admin key file: {message}")]
    PersistenceFailure { op: PersistenceOp, message: String },

    #[error("no launch command configured for {0}")]
    NotConfigured(ProcessType),

    #[error("failed to launch {process_type}: {message}")]
    LaunchFailed {
        process_type: ProcessType,
        message: String,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl SupervisorError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::CredentialExpired | Self::CredentialInvalid => ErrorClass::Unauthorized,
            Self::InstanceNotFound(_) => ErrorClass::NotFound,
            Self::InvalidState { .. } | Self::TerminationTimedOut(_) => ErrorClass::Conflict,
            Self::UnknownType(_) | Self::NotConfigured(_) => ErrorClass::BadRequest,
            Self::PersistenceFailure { .. } | Self::LaunchFailed { .. } | Self::Internal(_) => {
                ErrorClass::Internal
            }
        }
    }

    /// Whether the failure is an authorization problem rather than a broken server
    pub fn is_authorization(&self) -> bool {
        self.class() == ErrorClass::Unauthorized
    }

    pub(crate) fn lock_poisoned(what: &str, e: impl std::fmt::Display) -> Self {
        Self::Internal(format!("{} lock poisoned: {}", what, e))
    }
}

pub type SupervisorResult<T> = std::result::Result<T, SupervisorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_errors_are_authorization_errors() {
        assert!(SupervisorError::CredentialExpired.is_authorization());
        assert!(SupervisorError::CredentialInvalid.is_authorization());
        assert_eq!(SupervisorError::CredentialInvalid.class().http_status(), 401);

        let broken = SupervisorError::PersistenceFailure {
            op: PersistenceOp::Write,
            message: "disk full".into(),
        };
        assert!(!broken.is_authorization());
        assert_eq!(broken.class().http_status(), 500);
    }

    #[test]
    fn not_found_and_conflict_classes() {
        let id = InstanceId::new();
        assert_eq!(
            SupervisorError::InstanceNotFound(id).class(),
            ErrorClass::NotFound
        );
        let invalid = SupervisorError::InvalidState {
            id,
            state: InstanceState::Running,
            expected: "a terminal state",
        };
        assert_eq!(invalid.class(), ErrorClass::Conflict);
        assert!(invalid.to_string().contains("Running"));
    }
}
