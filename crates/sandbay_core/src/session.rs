//! Session state and the two-index session store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use sandbay_runner::{naming, MountConfig};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;

use crate::shell::WORKSPACE_ROOT;

/// Where a session's project content lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SessionStorage {
    /// Ephemeral host directory owned by the session
    TempDir { path: PathBuf },
    /// Runtime-managed volume owned by the session
    Volume { name: String },
    /// Persistent default project directory, never removed by the engine
    HostPath { path: PathBuf },
}

impl SessionStorage {
    /// Mount of the content at `target`.
    pub fn mount(&self, target: &str) -> MountConfig {
        match self {
            Self::TempDir { path } | Self::HostPath { path } => MountConfig::bind(path, target),
            Self::Volume { name } => MountConfig::volume(name, target),
        }
    }

    /// Host directory holding the content, if any.
    pub fn host_dir(&self) -> Option<&Path> {
        match self {
            Self::TempDir { path } | Self::HostPath { path } => Some(path),
            Self::Volume { .. } => None,
        }
    }

    /// Ephemeral directory owned by the session, if any.
    pub fn temp_dir(&self) -> Option<&Path> {
        match self {
            Self::TempDir { path } => Some(path),
            _ => None,
        }
    }

    /// Whether the content was materialized from the project store.
    pub fn is_materialized(&self) -> bool {
        !matches!(self, Self::HostPath { .. })
    }
}

/// A logical session bound to one live container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub owner_id: String,
    pub project_name: String,
    pub project_id: Option<String>,
    pub storage: SessionStorage,
    pub image: String,
    /// Primary container, verified running when the session was created
    pub container: Option<String>,
    pub port: u16,
    /// Logical working directory
    pub cwd: String,
    pub web_container: Option<String>,
    pub web_port: Option<u16>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub recovering: bool,
}

impl Session {
    pub fn new(
        session_id: impl Into<String>,
        owner_id: impl Into<String>,
        project_name: impl Into<String>,
        storage: SessionStorage,
        image: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            owner_id: owner_id.into(),
            project_name: project_name.into(),
            project_id: None,
            storage,
            image: image.into(),
            container: None,
            port: 0,
            cwd: WORKSPACE_ROOT.to_string(),
            web_container: None,
            web_port: None,
            created_at: Utc::now(),
            recovering: false,
        }
    }

    /// Whether a web server was provisioned for the session.
    pub fn web_active(&self) -> bool {
        self.web_container.is_some()
    }

    /// Container names the session owns.
    pub fn containers(&self) -> impl Iterator<Item = &str> {
        self.container
            .as_deref()
            .into_iter()
            .chain(self.web_container.as_deref())
    }
}

#[derive(Default)]
struct Indices {
    sessions: HashMap<String, Session>,
    /// Container name -> session id, for primary and web containers
    containers: HashMap<String, String>,
}

impl Indices {
    fn unindex(&mut self, session: &Session) {
        for name in session.containers() {
            if self.containers.get(name) == Some(&session.session_id) {
                self.containers.remove(name);
            }
        }
    }

    fn index(&mut self, session: &Session) {
        for name in session.containers() {
            self.containers
                .insert(name.to_string(), session.session_id.clone());
        }
    }
}

/// In-memory session registry.
///
/// Sessions are indexed by identifier and by container name. Mutations to
/// both indices happen under one lock; callers serialize work on a single
/// session through [`SessionStore::lock`].
#[derive(Default)]
pub struct SessionStore {
    inner: RwLock<Indices>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Exclusive access to one session identifier, released on drop.
pub struct SessionGuard<'a> {
    store: &'a SessionStore,
    session_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        // Unlock first so the entry's only remaining owner is the map
        drop(self.guard.take());
        self.store.release(&self.session_id);
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to a session identifier (FIFO).
    ///
    /// The identifier's lock entry lives only while someone holds or awaits it.
    pub async fn lock(&self, session_id: &str) -> SessionGuard<'_> {
        let mutex = self
            .locks
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .clone();
        SessionGuard {
            store: self,
            session_id: session_id.to_string(),
            guard: Some(mutex.lock_owned().await),
        }
    }

    fn release(&self, session_id: &str) {
        let mut locks = self.locks.lock();
        if locks
            .get(session_id)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
        {
            locks.remove(session_id);
        }
    }

    #[cfg(test)]
    pub(crate) fn lock_entries(&self) -> usize {
        self.locks.lock().len()
    }

    /// Insert or replace a session, re-indexing its containers.
    pub fn insert(&self, session: Session) -> Option<Session> {
        let mut inner = self.inner.write();
        let previous = inner.sessions.remove(&session.session_id);
        if let Some(previous) = &previous {
            inner.unindex(previous);
        }
        inner.index(&session);
        inner.sessions.insert(session.session_id.clone(), session);
        previous
    }

    /// Apply `f` to a stored session.
    pub fn update<R>(&self, session_id: &str, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let mut inner = self.inner.write();
        let mut session = inner.sessions.remove(session_id)?;
        inner.unindex(&session);
        let result = f(&mut session);
        inner.index(&session);
        inner.sessions.insert(session_id.to_string(), session);
        Some(result)
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.inner.read().sessions.get(session_id).cloned()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.inner.read().sessions.contains_key(session_id)
    }

    pub fn remove(&self, session_id: &str) -> Option<Session> {
        let mut inner = self.inner.write();
        let session = inner.sessions.remove(session_id)?;
        inner.unindex(&session);
        Some(session)
    }

    /// All sessions, ordered by creation time.
    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<_> = self.inner.read().sessions.values().cloned().collect();
        sessions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        sessions
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Session owning a container.
    pub fn session_for_container(&self, container: &str) -> Option<String> {
        self.inner.read().containers.get(container).cloned()
    }

    /// Whether `container` belongs to a session other than `session_id`.
    pub fn container_taken(&self, container: &str, session_id: &str) -> bool {
        self.inner
            .read()
            .containers
            .get(container)
            .map(|owner| owner != session_id)
            .unwrap_or(false)
    }

    /// Sessions whose containers carry `prefix`, confirmed by `filter`.
    fn by_container_prefix(&self, prefix: &str, filter: impl Fn(&Session) -> bool) -> Vec<String> {
        let inner = self.inner.read();
        let mut ids: Vec<String> = inner
            .containers
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .filter_map(|(_, id)| inner.sessions.get(id))
            .filter(|s| filter(*s))
            .map(|s| s.session_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Sessions of one owner.
    pub fn sessions_for_owner(&self, owner_id: &str) -> Vec<String> {
        let prefix = format!("{}-{}-", naming::NAME_PREFIX, naming::sanitize(owner_id));
        self.by_container_prefix(&prefix, |s| s.owner_id == owner_id)
    }

    /// Sessions of one owner's project.
    pub fn sessions_for_project(&self, owner_id: &str, project: &str) -> Vec<String> {
        let prefix = format!(
            "{}-{}-{}-",
            naming::NAME_PREFIX,
            naming::sanitize(owner_id),
            naming::sanitize(project)
        );
        self.by_container_prefix(&prefix, |s| {
            s.owner_id == owner_id && s.project_name == project
        })
    }

    /// Container index as `(container, session id)` pairs.
    pub fn container_index(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<_> = self
            .inner
            .read()
            .containers
            .iter()
            .map(|(c, s)| (c.clone(), s.clone()))
            .collect();
        pairs.sort();
        pairs
    }
}
