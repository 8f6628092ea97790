//! Session manager.
//!
//! [`SessionManager`] owns the session registry and drives the container
//! runtime for session open/close, validation and snapshot restore. The
//! command channel, web provisioning and recovery live in sibling modules
//! as further `impl` blocks.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use sandbay_runner::{
    allocate_port, naming, CliRuntime, ContainerRuntime, ContainerSpec, DockerApiRuntime,
    LogHandler, LogLine, RunnerError, StackRegistry,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, RuntimeBackend, StorageMode};
use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, SessionEvent};
use crate::materialize;
use crate::persistence::{Snapshot, SnapshotFile};
use crate::session::{Session, SessionStorage, SessionStore};
use crate::shell::WORKSPACE_ROOT;
use crate::store::{FileRecord, ProjectStore};

/// Liveness report for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session_id: String,
    pub found: bool,
    pub container: Option<String>,
    pub running: bool,
    pub web_container: Option<String>,
    pub web_running: bool,
    pub cwd: Option<String>,
}

/// Connect to the runtime selected by `config`.
pub async fn connect_runtime(config: &EngineConfig) -> EngineResult<Arc<dyn ContainerRuntime>> {
    let runtime: Arc<dyn ContainerRuntime> = match config.backend {
        RuntimeBackend::Cli => Arc::new(CliRuntime::detect(config.preferred_runtime).await?),
        RuntimeBackend::Api => Arc::new(DockerApiRuntime::new().await?),
    };
    Ok(runtime)
}

/// Orchestrates per-session containers.
pub struct SessionManager {
    pub(crate) config: EngineConfig,
    pub(crate) runtime: Arc<dyn ContainerRuntime>,
    pub(crate) store: Arc<dyn ProjectStore>,
    pub(crate) sessions: SessionStore,
    pub(crate) events: EventBus,
    snapshot: SnapshotFile,
    stacks: StackRegistry,
    /// Sessions with a web recreation in flight, and whether another is pending
    pub(crate) web_refresh: Mutex<HashMap<String, bool>>,
}

impl SessionManager {
    pub fn new(
        config: EngineConfig,
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn ProjectStore>,
    ) -> Self {
        let config = config.absolutize();
        let snapshot = SnapshotFile::new(config.snapshot_path());
        Self {
            config,
            runtime,
            store,
            sessions: SessionStore::new(),
            events: EventBus::default(),
            snapshot,
            stacks: StackRegistry::new(),
            web_refresh: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the stack image registry.
    pub fn with_stacks(mut self, stacks: StackRegistry) -> Self {
        self.stacks = stacks;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Receive session events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Current state of a session.
    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id)
    }

    /// Sessions, optionally restricted to one owner.
    pub fn list_sessions(&self, owner_id: Option<&str>) -> Vec<Session> {
        match owner_id {
            Some(owner) => self
                .sessions
                .sessions_for_owner(owner)
                .iter()
                .filter_map(|id| self.sessions.get(id))
                .collect(),
            None => self.sessions.list(),
        }
    }

    /// Open a session, or return it unchanged if it is already live.
    pub async fn open(
        &self,
        session_id: &str,
        project_name: &str,
        owner_id: &str,
    ) -> EngineResult<Session> {
        let _guard = self.sessions.lock(session_id).await;

        if let Some(existing) = self.sessions.get(session_id) {
            let same_project =
                existing.project_name == project_name && existing.owner_id == owner_id;
            if same_project && self.is_live(&existing).await? {
                debug!("Session {} already open on {:?}", session_id, existing.container);
                return Ok(existing);
            }
            info!("Replacing session {}", session_id);
            self.teardown(&existing, true).await;
            self.sessions.remove(session_id);
        }

        let result = self.open_inner(session_id, project_name, owner_id).await;
        self.persist().await;
        result
    }

    /// Close a session and release everything it owns. Unknown ids are a no-op.
    pub async fn close(&self, session_id: &str) -> EngineResult<bool> {
        let _guard = self.sessions.lock(session_id).await;

        let Some(session) = self.sessions.get(session_id) else {
            debug!("Close of unknown session {}", session_id);
            return Ok(false);
        };

        self.teardown(&session, true).await;
        self.sessions.remove(session_id);
        self.persist().await;

        info!("Closed session {}", session_id);
        self.events.emit(SessionEvent::SessionClosed {
            session_id: session_id.to_string(),
        });
        Ok(true)
    }

    /// Close every session of an owner.
    pub async fn close_owner(&self, owner_id: &str) -> EngineResult<usize> {
        let mut closed = 0;
        for id in self.sessions.sessions_for_owner(owner_id) {
            if self.close(&id).await? {
                closed += 1;
            }
        }
        Ok(closed)
    }

    /// Close every session of one owner's project.
    pub async fn close_project(&self, owner_id: &str, project_name: &str) -> EngineResult<usize> {
        let mut closed = 0;
        for id in self.sessions.sessions_for_project(owner_id, project_name) {
            if self.close(&id).await? {
                closed += 1;
            }
        }
        Ok(closed)
    }

    /// Report whether a session is known and its containers are running.
    pub async fn validate(&self, session_id: &str) -> EngineResult<SessionStatus> {
        let Some(session) = self.sessions.get(session_id) else {
            return Ok(SessionStatus {
                session_id: session_id.to_string(),
                found: false,
                container: None,
                running: false,
                web_container: None,
                web_running: false,
                cwd: None,
            });
        };

        let running = self.is_live(&session).await?;
        let web_running = match &session.web_container {
            Some(web) => self.runtime.is_running(web).await?,
            None => false,
        };

        Ok(SessionStatus {
            session_id: session.session_id,
            found: true,
            container: session.container,
            running,
            web_container: session.web_container,
            web_running,
            cwd: Some(session.cwd),
        })
    }

    /// Logs of a session's primary or web container.
    pub async fn logs(
        &self,
        session_id: &str,
        web: bool,
        tail: Option<usize>,
    ) -> EngineResult<String> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        let container = if web {
            session.web_container
        } else {
            session.container
        };
        let container = container.ok_or_else(|| {
            EngineError::WebServer(format!("session {} has no such container", session_id))
        })?;
        Ok(self.runtime.logs(&container, tail).await?)
    }

    /// Restore sessions whose containers are still running. Startup only.
    ///
    /// Sessions whose container is gone are dropped; leftover containers are
    /// not removed.
    pub async fn load_snapshot(&self) -> EngineResult<usize> {
        let snapshot = match self.snapshot.load().await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return Ok(0),
            Err(e) => {
                warn!("Ignoring unreadable session snapshot: {}", e);
                return Ok(0);
            }
        };

        let mut restored = 0;
        for (id, mut session) in snapshot.sessions {
            let Some(container) = session.container.clone() else {
                debug!("Dropping session {} without a container", id);
                continue;
            };
            if !self.runtime.is_running(&container).await? {
                info!("Dropping session {}: {} is not running", id, container);
                continue;
            }
            if let Some(web) = session.web_container.clone() {
                if !self.runtime.is_running(&web).await? {
                    session.web_container = None;
                }
            }
            session.session_id = id;
            session.recovering = false;
            self.sessions.insert(session);
            restored += 1;
        }

        info!("Restored {} sessions from snapshot", restored);
        self.persist().await;
        Ok(restored)
    }

    pub(crate) async fn is_live(&self, session: &Session) -> EngineResult<bool> {
        match &session.container {
            Some(container) => Ok(self.runtime.is_running(container).await?),
            None => Ok(false),
        }
    }

    /// Create the session's container and register it. Callers hold the
    /// session lock and persist afterwards.
    pub(crate) async fn open_inner(
        &self,
        session_id: &str,
        project_name: &str,
        owner_id: &str,
    ) -> EngineResult<Session> {
        let base = naming::session_container_name(owner_id, project_name, session_id);
        let container = naming::disambiguate(&base, |name| {
            self.sessions.container_taken(name, session_id)
        });
        // A leftover with our name would make the create fail
        self.remove_container_quietly(&container).await;

        let project = self.store.find_project(owner_id, project_name).await?;
        let (storage, files) = match &project {
            Some(project) => {
                let files = self.store.list_files(project).await?;
                let storage = match self.config.storage {
                    StorageMode::TempDir => {
                        let short = uuid::Uuid::new_v4().simple().to_string();
                        let dir = self
                            .config
                            .temp_root
                            .join(format!("{}-{}", container, &short[..8]));
                        if let Err(e) = materialize::write_records(&dir, &files).await {
                            let _ = tokio::fs::remove_dir_all(&dir).await;
                            return Err(e);
                        }
                        SessionStorage::TempDir { path: dir }
                    }
                    StorageMode::Volume => SessionStorage::Volume {
                        name: naming::volume_name(&container),
                    },
                };
                (storage, files)
            }
            None => {
                let dir = self
                    .config
                    .workspaces_root
                    .join(naming::sanitize(owner_id))
                    .join(naming::sanitize(project_name));
                if materialize::seed_placeholder(&dir).await? {
                    debug!("Seeded placeholder project at {}", dir.display());
                }
                (SessionStorage::HostPath { path: dir }, Vec::new())
            }
        };

        let mut session = Session::new(session_id, owner_id, project_name, storage, "");
        session.project_id = project.map(|p| p.id);

        match self.start_container(session, &container, &files).await {
            Ok(session) => Ok(session),
            Err(e) => {
                warn!("Failed to open session {}: {}", session_id, e);
                Err(e)
            }
        }
    }

    async fn start_container(
        &self,
        mut session: Session,
        container: &str,
        files: &[FileRecord],
    ) -> EngineResult<Session> {
        let result = self.create_container(&mut session, container, files).await;
        if result.is_err() {
            self.release_storage(&session.storage).await;
        }
        result?;

        info!(
            "Session {} ready: {} ({}) on port {}",
            session.session_id, container, session.image, session.port
        );
        self.sessions.insert(session.clone());
        self.events.emit(SessionEvent::ContainerReady {
            session_id: session.session_id.clone(),
            container: container.to_string(),
            port: session.port,
        });
        Ok(session)
    }

    async fn create_container(
        &self,
        session: &mut Session,
        container: &str,
        files: &[FileRecord],
    ) -> EngineResult<()> {
        let paths: Vec<String> = match session.storage.host_dir() {
            Some(dir) => materialize::list_paths(dir),
            None => files
                .iter()
                .filter(|f| f.is_file())
                .map(|f| f.path.clone())
                .collect(),
        };
        let (stack, image) = self.stacks.select(&paths);
        debug!("Detected {} stack for {}", stack, session.session_id);

        self.ensure_image(&image, &session.session_id).await?;
        let port = allocate_port().await?;

        if let SessionStorage::Volume { name } = &session.storage {
            self.runtime.create_volume(name).await?;
        }

        let spec = ContainerSpec::new(container, &image)
            .command(vec!["tail".into(), "-f".into(), "/dev/null".into()])
            .workdir(WORKSPACE_ROOT)
            .env("PORT", self.config.container_port.to_string())
            .env("HOST", "0.0.0.0")
            .label("sandbay.session", &session.session_id)
            .label("sandbay.owner", &session.owner_id)
            .label("sandbay.project", &session.project_name)
            .mount(session.storage.mount(WORKSPACE_ROOT))
            .publish(port, self.config.container_port)
            .limits(self.config.limits.clone())
            .cap_drop(self.config.cap_drop.clone());

        self.runtime.create_container(&spec).await?;

        if !self.runtime.is_running(container).await? {
            let logs = self
                .runtime
                .logs(container, Some(20))
                .await
                .unwrap_or_default();
            self.remove_container_quietly(container).await;
            return Err(RunnerError::ContainerCreateFailed {
                name: container.to_string(),
                detail: format!("container exited right after start: {}", logs.trim()),
            }
            .into());
        }

        if matches!(session.storage, SessionStorage::Volume { .. }) && !files.is_empty() {
            if let Err(e) =
                materialize::push_records(self.runtime.as_ref(), container, files).await
            {
                self.remove_container_quietly(container).await;
                return Err(e);
            }
        }

        session.image = image;
        session.container = Some(container.to_string());
        session.port = port;
        Ok(())
    }

    /// Pull `image` if the runtime does not have it, relaying progress.
    pub(crate) async fn ensure_image(&self, image: &str, session_id: &str) -> EngineResult<()> {
        if self.runtime.image_exists(image).await? {
            return Ok(());
        }

        info!("Pulling image {}", image);
        let events = self.events.clone();
        let session_id = session_id.to_string();
        let progress: LogHandler = Arc::new(move |line: LogLine| {
            events.emit(SessionEvent::ImagePullProgress {
                session_id: session_id.clone(),
                message: line.message,
            });
        });
        self.runtime.pull_image(image, Some(progress)).await?;
        Ok(())
    }

    /// Release everything a session owns. Failures are logged, not returned.
    pub(crate) async fn teardown(&self, session: &Session, remove_primary: bool) {
        if let Some(container) = &session.container {
            self.prune_web_containers(container).await;
            self.remove_web_configs(container).await;
        }
        if let Some(web) = &session.web_container {
            self.remove_container_quietly(web).await;
        }
        if remove_primary {
            if let Some(container) = &session.container {
                self.remove_container_quietly(container).await;
            }
        }
        self.release_storage(&session.storage).await;
    }

    pub(crate) async fn release_storage(&self, storage: &SessionStorage) {
        match storage {
            SessionStorage::TempDir { path } => remove_dir_quietly(path).await,
            SessionStorage::Volume { name } => {
                if let Err(e) = self.runtime.remove_volume(name).await {
                    warn!("Failed to remove volume {}: {}", name, e);
                }
            }
            SessionStorage::HostPath { .. } => {}
        }
    }

    pub(crate) async fn remove_container_quietly(&self, name: &str) {
        match self.runtime.container_exists(name).await {
            Ok(false) => return,
            Ok(true) => {}
            Err(e) => debug!("Could not inspect {}: {}", name, e),
        }
        if let Err(e) = self.runtime.stop_container(name).await {
            debug!("Stop of {} failed: {}", name, e);
        }
        if let Err(e) = self.runtime.remove_container(name).await {
            warn!("Failed to remove container {}: {}", name, e);
        }
    }

    /// Save the registry. Failures are logged.
    pub(crate) async fn persist(&self) {
        let snapshot = Snapshot::capture(&self.sessions);
        if let Err(e) = self.snapshot.save(&snapshot).await {
            warn!("Failed to persist session snapshot: {}", e);
        }
    }
}

async fn remove_dir_quietly(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}
