//! Session persistence.
//!
//! Two keys, `user` and `token`, live in a small key/value store. Nothing is
//! cached in memory: every read goes back to the store so that a session
//! cleared elsewhere (another terminal, `consulta logout`) takes effect on the
//! very next check.

#[cfg(test)]
use std::collections::HashMap;
use std::path::PathBuf;
#[cfg(test)]
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::{ConsultaError, Result};
use crate::models::{Session, UserProfile};
use crate::normalize::decode;

pub const USER_KEY: &str = "user";
pub const TOKEN_KEY: &str = "token";

pub trait KeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

/// One file per key inside a directory.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match std::fs::read_to_string(self.path(key)) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path(key);
        std::fs::write(&path, value)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process store for tests.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

#[cfg(test)]
impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_| ConsultaError::Other("session store lock poisoned".to_string()))
    }
}

#[cfg(test)]
impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Session store
// ---------------------------------------------------------------------------

/// The only writer of session state: login, logout and password change go
/// through here.
pub struct SessionStore<S: KeyValueStore> {
    store: S,
}

impl SessionStore<FileStore> {
    /// Store rooted at the configured session directory.
    pub fn open_default() -> Self {
        SessionStore::new(FileStore::new(crate::settings::session_dir()))
    }
}

impl<S: KeyValueStore> SessionStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// The current session, or `None` when absent or unreadable. A corrupted
    /// session is treated as logged out rather than an error.
    pub fn get_session(&self) -> Option<Session> {
        let user = self.user()?;
        let token = match self.store.get(TOKEN_KEY) {
            Ok(Some(t)) if !t.trim().is_empty() => t.trim().to_string(),
            Ok(_) => return None,
            Err(e) => {
                warn!(error = %e, "could not read stored token");
                return None;
            }
        };
        Some(Session { user, token })
    }

    /// Just the profile. The guard only needs this; API calls need the token too.
    pub fn user(&self) -> Option<UserProfile> {
        let raw = match self.store.get(USER_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "could not read stored user");
                return None;
            }
        };
        let value: Value = match serde_json::from_str(&raw) {
            Ok(v @ Value::Object(_)) => v,
            Ok(_) => {
                warn!("stored user is not an object; treating as logged out");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "stored user is not valid JSON; treating as logged out");
                return None;
            }
        };
        match decode::<UserProfile>(value) {
            Ok(user) => Some(user),
            Err(e) => {
                warn!(error = %e, "stored user has an unexpected shape; treating as logged out");
                None
            }
        }
    }

    pub fn token(&self) -> Option<String> {
        self.store
            .get(TOKEN_KEY)
            .ok()
            .flatten()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }

    pub fn set_session(&self, session: &Session) -> Result<()> {
        let user = serde_json::to_string(&session.user)?;
        self.store.set(USER_KEY, &user)?;
        self.store.set(TOKEN_KEY, &session.token)?;
        info!(user = %session.user.email, "session stored");
        Ok(())
    }

    /// Remove both keys together.
    pub fn clear_session(&self) -> Result<()> {
        self.store.remove(USER_KEY)?;
        self.store.remove(TOKEN_KEY)?;
        info!("session cleared");
        Ok(())
    }

    /// Merge fields into the stored profile in place. Keys use backend names.
    pub fn patch_user(&self, patch: Map<String, Value>) -> Result<UserProfile> {
        let current = self.user().ok_or(ConsultaError::NotAuthenticated)?;
        let mut value = serde_json::to_value(&current)?;
        if let Value::Object(map) = &mut value {
            for (k, v) in patch {
                map.insert(k.to_lowercase(), v);
            }
        }
        let updated: UserProfile = decode(value)?;
        self.store.set(USER_KEY, &serde_json::to_string(&updated)?)?;
        info!("stored profile updated");
        Ok(updated)
    }

    /// Record a successful password change without re-authenticating.
    pub fn mark_password_changed(&self, now: DateTime<Utc>) -> Result<UserProfile> {
        let mut patch = Map::new();
        patch.insert("flg_cam_psw".to_string(), Value::from(1));
        patch.insert(
            "fch_cam_psw".to_string(),
            Value::from(now.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        self.patch_user(patch)
    }
}
