//! Auto-recovery and file sync.
//!
//! Dead containers are replaced under the same session identifier before a
//! command runs. Single-file updates from the project store are written into
//! live sessions and the web server is recreated to pick them up.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::SessionManager;
use crate::error::{EngineError, EngineResult};
use crate::events::SessionEvent;
use crate::materialize;
use crate::session::{Session, SessionStorage};

/// Outcome of a file-changed notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSyncReport {
    pub project: String,
    pub path: String,
    /// Sessions that received the new content
    pub sessions_updated: Vec<String>,
    /// Sessions whose written size did not match the record
    pub mismatches: Vec<String>,
    /// Sessions whose web server was recreated
    pub web_recreated: Vec<String>,
}

impl SessionManager {
    /// The session with a running container, recreating it if needed.
    /// Callers hold the session lock.
    pub(crate) async fn ensure_live(&self, session_id: &str) -> EngineResult<(Session, bool)> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;

        if self.is_live(&session).await? {
            return Ok((session, false));
        }

        let fresh = self.recover(session, "container not running").await?;
        Ok((fresh, true))
    }

    /// Replace a session whose container is gone. Callers hold the session lock.
    pub(crate) async fn recover(&self, stale: Session, reason: &str) -> EngineResult<Session> {
        let session_id = stale.session_id.clone();
        warn!(
            "Recovering session {} ({}): {:?}",
            session_id, reason, stale.container
        );
        self.sessions.update(&session_id, |s| s.recovering = true);

        self.teardown(&stale, false).await;
        self.sessions.remove(&session_id);

        let fresh = match self
            .open_inner(&session_id, &stale.project_name, &stale.owner_id)
            .await
        {
            Ok(fresh) => fresh,
            Err(e) => {
                self.persist().await;
                return Err(e);
            }
        };

        // Keep the logical directory across the restart
        self.sessions.update(&session_id, |s| {
            s.cwd = stale.cwd.clone();
            s.web_port = stale.web_port;
        });

        if stale.web_active() {
            if let Err(e) = self.provision_web(&session_id).await {
                warn!("Web server for recovered session {} failed: {}", session_id, e);
            }
        }
        self.persist().await;

        let container = fresh.container.clone().unwrap_or_default();
        info!("Session {} recovered on {}", session_id, container);
        self.events.emit(SessionEvent::ContainerRestarted {
            session_id: session_id.clone(),
            container,
        });
        self.events.emit(SessionEvent::RecoveryOccurred {
            session_id: session_id.clone(),
            reason: reason.to_string(),
        });

        self.sessions
            .get(&session_id)
            .ok_or(EngineError::SessionNotFound(session_id))
    }

    /// Write a session's current content back to the project store.
    pub(crate) async fn sync_back(&self, session: &Session) -> EngineResult<()> {
        let Some(project) = self
            .store
            .find_project(&session.owner_id, &session.project_name)
            .await?
        else {
            debug!("No stored project for session {}", session.session_id);
            return Ok(());
        };

        let capture = match &session.storage {
            SessionStorage::TempDir { path } => materialize::capture_dir(path)?,
            SessionStorage::Volume { .. } => match &session.container {
                Some(container) => {
                    materialize::capture_container(self.runtime.as_ref(), container).await?
                }
                None => return Ok(()),
            },
            SessionStorage::HostPath { .. } => return Ok(()),
        };

        let existing = self.store.list_files(&project).await?;
        let removals = capture.removals(&existing);
        debug!(
            "Syncing session {} to {}: {} records, {} removals, {} skipped",
            session.session_id,
            project.id,
            capture.records.len(),
            removals.len(),
            capture.skipped.len()
        );
        self.store
            .apply_changes(&project, capture.records, removals)
            .await
    }

    /// Push one changed file from the store into every live session of
    /// `project_name`, then recreate their web servers.
    pub async fn notify_file_changed(
        &self,
        project_name: &str,
        path: &str,
    ) -> EngineResult<FileSyncReport> {
        let mut report = FileSyncReport {
            project: project_name.to_string(),
            path: path.to_string(),
            ..Default::default()
        };

        let targets: Vec<Session> = self
            .sessions
            .list()
            .into_iter()
            .filter(|s| s.project_name == project_name && s.storage.is_materialized())
            .collect();

        for session in targets {
            let Some(project) = self
                .store
                .find_project(&session.owner_id, project_name)
                .await?
            else {
                continue;
            };
            let record = self.store.get_file(&project, path).await?;

            let matched = match (&session.storage, &record) {
                (SessionStorage::TempDir { path: dir }, Some(record)) => {
                    let written = materialize::write_file(dir, record).await?;
                    record.kind != crate::store::FileKind::File || written == record.size
                }
                (SessionStorage::TempDir { path: dir }, None) => {
                    materialize::remove_path(dir, path).await?;
                    true
                }
                (SessionStorage::Volume { .. }, Some(record)) => {
                    match &session.container {
                        Some(container) => {
                            materialize::push_file(self.runtime.as_ref(), container, record)
                                .await?
                        }
                        None => continue,
                    }
                    true
                }
                _ => continue,
            };

            if !matched {
                warn!(
                    "Size mismatch writing {} into session {}; leaving content as written",
                    path, session.session_id
                );
                report.mismatches.push(session.session_id.clone());
            }
            report.sessions_updated.push(session.session_id.clone());

            if session.web_active() {
                match self.refresh_web(&session.session_id).await {
                    Ok(true) => report.web_recreated.push(session.session_id.clone()),
                    Ok(false) => debug!(
                        "Web refresh for {} already running; queued",
                        session.session_id
                    ),
                    Err(e) => warn!(
                        "Web refresh for session {} failed: {}",
                        session.session_id, e
                    ),
                }
            }
        }

        Ok(report)
    }

    /// Recreate a session's web server, coalescing overlapping requests.
    ///
    /// Returns `false` when a recreation was already running; that run loops
    /// once more so the latest content is served.
    pub(crate) async fn refresh_web(&self, session_id: &str) -> EngineResult<bool> {
        {
            let mut in_flight = self.web_refresh.lock();
            if let Some(pending) = in_flight.get_mut(session_id) {
                *pending = true;
                return Ok(false);
            }
            in_flight.insert(session_id.to_string(), false);
        }

        loop {
            let result = {
                let _guard = self.sessions.lock(session_id).await;
                if self
                    .sessions
                    .get(session_id)
                    .map(|s| s.web_active())
                    .unwrap_or(false)
                {
                    self.provision_web(session_id).await.map(|_| ())
                } else {
                    Ok(())
                }
            };

            let again = {
                let mut in_flight = self.web_refresh.lock();
                match in_flight.get_mut(session_id) {
                    Some(pending) if *pending && result.is_ok() => {
                        *pending = false;
                        true
                    }
                    _ => {
                        in_flight.remove(session_id);
                        false
                    }
                }
            };

            result?;
            if !again {
                return Ok(true);
            }
        }
    }
}
