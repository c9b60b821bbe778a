//! Session registry
//!
//! Maps session names to live handles. Handles are created on init and
//! lazily re-opened from their database files for sessions that exist
//! but are not resident (e.g. after a restart).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::core::{Deps, SessionCore, SessionHandle};
use crate::store::SessionStore;

pub struct SessionRegistry {
    deps: Arc<Deps>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new(deps: Arc<Deps>) -> Self {
        Self {
            deps,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn deps(&self) -> &Arc<Deps> {
        &self.deps
    }

    /// Session names double as database file names; keep them tame.
    pub fn valid_name(name: &str) -> bool {
        !name.is_empty()
            && name.len() <= 128
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }

    fn db_path(&self, name: &str) -> PathBuf {
        self.deps
            .config
            .data_dir
            .join("sessions")
            .join(format!("{name}.db"))
    }

    /// Resolve an existing session, reloading it from disk when the
    /// instance is not resident. Returns None for unknown sessions.
    pub async fn get(&self, name: &str) -> Option<SessionHandle> {
        if !Self::valid_name(name) {
            return None;
        }
        if let Some(handle) = self.sessions.read().await.get(name) {
            return Some(handle.clone());
        }

        let path = self.db_path(name);
        if !path.exists() {
            return None;
        }

        let mut sessions = self.sessions.write().await;
        if let Some(handle) = sessions.get(name) {
            return Some(handle.clone());
        }
        let store = match SessionStore::open(&path) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(
                    component = "registry",
                    event = "registry.open_failed",
                    session = %name,
                    error = %e,
                    "Failed to reopen session store"
                );
                return None;
            }
        };
        info!(
            component = "registry",
            event = "registry.session_loaded",
            session = %name,
            "Reloaded session from disk"
        );
        let handle = SessionHandle::new(SessionCore::new(
            name.to_string(),
            store,
            self.deps.clone(),
        ));
        sessions.insert(name.to_string(), handle.clone());
        Some(handle)
    }

    /// Open (or create) the store for session init. The caller decides
    /// whether an existing session row makes the init a conflict.
    pub async fn open_for_init(&self, name: &str) -> anyhow::Result<SessionHandle> {
        if !Self::valid_name(name) {
            anyhow::bail!("invalid session name");
        }
        if let Some(handle) = self.sessions.read().await.get(name) {
            return Ok(handle.clone());
        }

        let mut sessions = self.sessions.write().await;
        if let Some(handle) = sessions.get(name) {
            return Ok(handle.clone());
        }
        let store = SessionStore::open(&self.db_path(name))?;
        let handle = SessionHandle::new(SessionCore::new(
            name.to_string(),
            store,
            self.deps.clone(),
        ));
        sessions.insert(name.to_string(), handle.clone());
        Ok(handle)
    }
}
