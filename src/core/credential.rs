//! Admin key lifecycle - Issue, persist, renew and check the control credential

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::error::{PersistenceOp, SupervisorError, SupervisorResult};
use crate::persistence::{KeyFile, StoredKey};

/// Random bytes per secret (256 bits)
const SECRET_BYTES: usize = 32;

/// Default sliding expiry window
pub const DEFAULT_WINDOW_DAYS: i64 = 30;

/// The admin key guarding control operations
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub secret: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    fn from_stored(stored: StoredKey, window: Duration) -> Self {
        Self {
            expires_at: stored.created_at + window,
            secret: stored.secret,
            created_at: stored.created_at,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    fn to_stored(&self) -> StoredKey {
        StoredKey {
            secret: self.secret.clone(),
            created_at: self.created_at,
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("secret", &"<redacted>")
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn is_well_formed(secret: &str) -> bool {
    secret.len() == SECRET_BYTES * 2 && secret.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Owns the single admin key.
///
/// The key file is the only cross-restart state. `ensure_active` holds the
/// mutex across load, mint/renew and persist, so concurrent activations agree
/// on one secret.
pub struct CredentialManager {
    key_file: KeyFile,
    window: Duration,
    clock: Arc<dyn Clock>,
    active: Mutex<Option<Credential>>,
}

impl CredentialManager {
    pub fn new(key_file: KeyFile, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            key_file,
            window,
            clock,
            active: Mutex::new(None),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn key_file(&self) -> &KeyFile {
        &self.key_file
    }

    /// Load the persisted key, treating unreadable or malformed files as absent
    fn load_persisted(&self) -> Option<Credential> {
        match self.key_file.load() {
            Ok(Some(stored)) if is_well_formed(&stored.secret) => {
                Some(Credential::from_stored(stored, self.window))
            }
            Ok(Some(_)) => {
                warn!("Admin key file holds a malformed secret, regenerating");
                None
            }
            Ok(None) => None,
            Err(e) => {
                let err = SupervisorError::PersistenceFailure {
                    op: PersistenceOp::Read,
                    message: format!("{:#}", e),
                };
                warn!("{}, regenerating", err);
                None
            }
        }
    }

    /// Return the authoritative key, minting or renewing it as needed
    pub fn ensure_active(&self) -> SupervisorResult<Credential> {
        let mut active = self
            .active
            .lock()
            .map_err(|e| SupervisorError::lock_poisoned("Credential", e))?;
        let now = self.clock.now();

        let (credential, minted) = match self.load_persisted() {
            Some(current) if !current.is_expired_at(now) => {
                debug!("Renewing admin key");
                (
                    Credential {
                        secret: current.secret,
                        created_at: now,
                        expires_at: now + self.window,
                    },
                    false,
                )
            }
            previous => {
                if previous.is_some() {
                    info!("Admin key expired, issuing a new one");
                }
                (
                    Credential {
                        secret: generate_secret(),
                        created_at: now,
                        expires_at: now + self.window,
                    },
                    true,
                )
            }
        };

        self.key_file
            .save(&credential.to_stored())
            .map_err(|e| SupervisorError::PersistenceFailure {
                op: PersistenceOp::Write,
                message: format!("{:#}", e),
            })?;

        if minted {
            info!(
                "New admin key written to {} (valid until {})",
                self.key_file.path().display(),
                credential.expires_at
            );
        }

        *active = Some(credential.clone());
        Ok(credential)
    }

    /// The credential checks run against: in memory, else read from disk without renewing
    fn current(&self) -> SupervisorResult<Option<Credential>> {
        let mut active = self
            .active
            .lock()
            .map_err(|e| SupervisorError::lock_poisoned("Credential", e))?;
        if active.is_none() {
            *active = self.load_persisted();
        }
        Ok(active.clone())
    }

    /// Check a presented secret against the authoritative key.
    ///
    /// Fails closed: missing or expired credentials never validate.
    pub fn validate(&self, presented: &str) -> bool {
        self.authorize(Some(presented)).is_ok()
    }

    /// Like [`validate`](Self::validate) but says why a secret was refused
    pub fn authorize(&self, presented: Option<&str>) -> SupervisorResult<()> {
        let presented = presented.ok_or(SupervisorError::CredentialInvalid)?;
        let credential = self
            .current()
            .ok()
            .flatten()
            .ok_or(SupervisorError::CredentialInvalid)?;

        let matches: bool = presented
            .as_bytes()
            .ct_eq(credential.secret.as_bytes())
            .into();
        if !matches {
            return Err(SupervisorError::CredentialInvalid);
        }
        if credential.is_expired_at(self.clock.now()) {
            return Err(SupervisorError::CredentialExpired);
        }
        Ok(())
    }
}
