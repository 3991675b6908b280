//! Credential store and its persistence surface.
//!
//! The store keeps the current credential and user record in memory and
//! mirrors every mutation to a [`SessionPersistence`] before the mutation
//! becomes visible, so readers never see a half-updated pair.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, SessionError};
use crate::models::{Credential, User};

/// The two durable keys of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSession {
    #[serde(default)]
    pub access_token: Option<Credential>,
    #[serde(default)]
    pub user_info: Option<User>,
}

impl PersistedSession {
    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.user_info.is_none()
    }
}

/// Durable storage for the session pair.
///
/// Implementations are synchronous; writes must be complete when they return.
pub trait SessionPersistence: Send + Sync {
    fn load(&self) -> Result<PersistedSession>;

    fn save(&self, session: &PersistedSession) -> Result<()>;

    fn clear(&self) -> Result<()>;
}

/// Process-local persistence. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    inner: Mutex<PersistedSession>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an already persisted session (e.g. a previous run).
    pub fn with_session(session: PersistedSession) -> Self {
        Self {
            inner: Mutex::new(session),
        }
    }

    /// Current persisted contents.
    pub fn snapshot(&self) -> PersistedSession {
        self.inner.lock().clone()
    }
}

impl SessionPersistence for MemoryPersistence {
    fn load(&self) -> Result<PersistedSession> {
        Ok(self.inner.lock().clone())
    }

    fn save(&self, session: &PersistedSession) -> Result<()> {
        *self.inner.lock() = session.clone();
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.inner.lock() = PersistedSession::default();
        Ok(())
    }
}

/// JSON document on disk, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct FilePersistence {
    path: PathBuf,
}

impl FilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionPersistence for FilePersistence {
    fn load(&self) -> Result<PersistedSession> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(PersistedSession::default()),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str(&raw) {
            Ok(session) => Ok(session),
            Err(e) => {
                // A corrupt file is treated as "no session" rather than a hard failure.
                warn!(path = %self.path.display(), error = %e, "Ignoring unreadable session file");
                Ok(PersistedSession::default())
            }
        }
    }

    fn save(&self, session: &PersistedSession) -> Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, session)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        debug!(path = %self.path.display(), "Session persisted");
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Holder of the current credential and user record.
pub struct CredentialStore {
    state: RwLock<PersistedSession>,
    persistence: Arc<dyn SessionPersistence>,
}

impl CredentialStore {
    /// Load whatever the persistence surface holds.
    pub fn load(persistence: Arc<dyn SessionPersistence>) -> Result<Self> {
        let mut session = persistence.load()?;

        if session.access_token.as_ref().is_some_and(Credential::is_empty) {
            session.access_token = None;
        }
        if session.access_token.is_none() && session.user_info.is_some() {
            warn!("Discarding persisted user record without a credential");
            session.user_info = None;
        }

        Ok(Self {
            state: RwLock::new(session),
            persistence,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(PersistedSession::default()),
            persistence: Arc::new(MemoryPersistence::new()),
        }
    }

    /// Current credential, if a non-empty one is held.
    pub fn credential(&self) -> Option<Credential> {
        self.state.read().access_token.clone()
    }

    pub fn user(&self) -> Option<User> {
        self.state.read().user_info.clone()
    }

    /// Both credential and user are present.
    pub fn is_logged_in(&self) -> bool {
        let state = self.state.read();
        state.access_token.is_some() && state.user_info.is_some()
    }

    /// Replace the whole session.
    pub fn set(&self, credential: Credential, user: User) -> Result<()> {
        if credential.is_empty() {
            return Err(SessionError::invalid_response("empty access token"));
        }

        let next = PersistedSession {
            access_token: Some(credential),
            user_info: Some(user),
        };
        self.commit(next)
    }

    /// Swap the credential, keeping the user record.
    pub fn set_credential(&self, credential: Credential) -> Result<()> {
        if credential.is_empty() {
            return Err(SessionError::invalid_response("empty access token"));
        }

        let mut state = self.state.write();
        let next = PersistedSession {
            access_token: Some(credential),
            user_info: state.user_info.clone(),
        };
        self.persistence.save(&next)?;
        *state = next;
        Ok(())
    }

    /// Attach a user record to the current credential.
    pub fn set_user(&self, user: User) -> Result<()> {
        let mut state = self.state.write();
        if state.access_token.is_none() {
            return Err(SessionError::SessionTerminated);
        }
        let next = PersistedSession {
            access_token: state.access_token.clone(),
            user_info: Some(user),
        };
        self.persistence.save(&next)?;
        *state = next;
        Ok(())
    }

    /// Forget the session. Memory is cleared even if the durable surface fails.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.write();
        *state = PersistedSession::default();
        self.persistence.clear()
    }

    fn commit(&self, next: PersistedSession) -> Result<()> {
        let mut state = self.state.write();
        self.persistence.save(&next)?;
        *state = next;
        Ok(())
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("CredentialStore")
            .field("has_credential", &state.access_token.is_some())
            .field("user", &state.user_info.as_ref().map(|u| u.id))
            .finish()
    }
}
