//! Web server provisioning.
//!
//! Each session can have one static-server container serving its content
//! read-only. Provisioning always removes every earlier web container of the
//! session first, so at most one is ever live.

use std::path::PathBuf;

use sandbay_runner::{allocate_port, ensure_port_free, naming, ContainerSpec, MountConfig};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::WebPortPolicy;
use crate::engine::SessionManager;
use crate::error::{EngineError, EngineResult};
use crate::events::SessionEvent;
use crate::materialize;
use crate::session::SessionStorage;
use crate::web::{classify, render_config, SiteKind, WEB_CONFIG_TARGET, WEB_CONTAINER_PORT, WEB_CONTENT_ROOT};

/// A provisioned web server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebServerInfo {
    pub session_id: String,
    pub container: String,
    pub port: u16,
    pub url: String,
    pub site: SiteKind,
}

impl SessionManager {
    /// Provision (or re-provision) the session's web server.
    pub async fn start_web_server(&self, session_id: &str) -> EngineResult<WebServerInfo> {
        let _guard = self.sessions.lock(session_id).await;
        self.provision_web(session_id).await
    }

    /// Remove the session's web server, if any.
    pub async fn stop_web_server(&self, session_id: &str) -> EngineResult<bool> {
        let _guard = self.sessions.lock(session_id).await;
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;

        let mut removed = 0;
        if let Some(container) = &session.container {
            removed = self.prune_web_containers(container).await;
            self.remove_web_configs(container).await;
        }
        if let Some(web) = &session.web_container {
            self.remove_container_quietly(web).await;
        }

        self.sessions.update(session_id, |s| s.web_container = None);
        self.persist().await;
        Ok(removed > 0 || session.web_active())
    }

    /// Callers hold the session lock.
    pub(crate) async fn provision_web(&self, session_id: &str) -> EngineResult<WebServerInfo> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        let primary = session.container.clone().ok_or_else(|| {
            EngineError::WebServer(format!("session {} has no container", session_id))
        })?;

        // Dev container publishing the port we are about to bind gives it up
        let fixed = match self.config.web_port {
            WebPortPolicy::Fixed { port } => Some(port),
            WebPortPolicy::Dedicated => None,
        };
        if fixed == Some(session.port) && self.runtime.is_running(&primary).await? {
            info!("Stopping {} to release port {}", primary, session.port);
            self.runtime.stop_container(&primary).await?;
        }

        let pruned = self.prune_web_containers(&primary).await;
        if let Some(previous) = &session.web_container {
            self.remove_container_quietly(previous).await;
        }
        self.remove_web_configs(&primary).await;
        debug!("Pruned {} web containers of {}", pruned, primary);

        let port = match (fixed, session.web_port) {
            (Some(port), _) => port,
            (None, Some(port)) => port,
            (None, None) => allocate_port().await?,
        };
        ensure_port_free(port).await?;

        let paths = match &session.storage {
            SessionStorage::Volume { .. } => {
                materialize::list_container_paths(self.runtime.as_ref(), &primary).await?
            }
            SessionStorage::TempDir { path } | SessionStorage::HostPath { path } => {
                materialize::list_paths(path)
            }
        };
        let site = classify(&paths);

        let name = naming::web_container_name(&primary);
        let config_path = self.write_web_config(&name, &site).await?;

        self.ensure_image(&self.config.web_image, session_id).await?;

        let spec = ContainerSpec::new(&name, &self.config.web_image)
            .label("sandbay.session", session_id)
            .label("sandbay.role", "web")
            .mount(session.storage.mount(WEB_CONTENT_ROOT).read_only())
            .mount(MountConfig::bind(&config_path, WEB_CONFIG_TARGET).read_only())
            .publish(port, WEB_CONTAINER_PORT)
            .limits(self.config.limits.clone());

        if let Err(e) = self.runtime.create_container(&spec).await {
            let _ = tokio::fs::remove_file(&config_path).await;
            self.sessions.update(session_id, |s| s.web_container = None);
            self.persist().await;
            return Err(e.into());
        }

        self.sessions.update(session_id, |s| {
            s.web_container = Some(name.clone());
            s.web_port = Some(port);
        });
        self.persist().await;

        let url = self.config.preview_url(port);
        info!("Web server for {} at {} ({})", session_id, url, name);
        self.events.emit(SessionEvent::WebServerReady {
            session_id: session_id.to_string(),
            container: name.clone(),
            url: url.clone(),
        });

        Ok(WebServerInfo {
            session_id: session_id.to_string(),
            container: name,
            port,
            url,
            site,
        })
    }

    /// Remove every web container derived from `primary`.
    pub(crate) async fn prune_web_containers(&self, primary: &str) -> usize {
        let prefix = naming::web_container_prefix(primary);
        let names = match self.runtime.list_containers(&prefix).await {
            Ok(names) => names,
            Err(e) => {
                warn!("Could not list web containers of {}: {}", primary, e);
                return 0;
            }
        };
        for name in &names {
            self.remove_container_quietly(name).await;
        }
        names.len()
    }

    async fn write_web_config(&self, name: &str, site: &SiteKind) -> EngineResult<PathBuf> {
        let dir = self.config.web_config_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.conf", name));
        tokio::fs::write(&path, render_config(site)).await?;
        Ok(path)
    }

    /// Delete generated configs of `primary`'s web containers.
    pub(crate) async fn remove_web_configs(&self, primary: &str) {
        let prefix = naming::web_container_prefix(primary);
        let Ok(mut entries) = tokio::fs::read_dir(self.config.web_config_dir()).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&prefix) && name.ends_with(".conf") {
                if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                    warn!("Failed to remove {}: {}", entry.path().display(), e);
                }
            }
        }
    }
}
