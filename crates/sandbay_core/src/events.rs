//! Session lifecycle events.
//!
//! Events are fanned out over a broadcast channel so a transport layer can
//! relay them to end-user clients.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

const DEFAULT_CAPACITY: usize = 256;

/// Observable session lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Progress line while pulling a session image
    ImagePullProgress { session_id: String, message: String },
    ContainerReady {
        session_id: String,
        container: String,
        port: u16,
    },
    /// A dead container was replaced under the same session identifier
    ContainerRestarted { session_id: String, container: String },
    CommandCompleted {
        session_id: String,
        exit_code: i64,
        cwd: String,
    },
    WebServerReady {
        session_id: String,
        container: String,
        url: String,
    },
    RecoveryOccurred { session_id: String, reason: String },
    /// The project's file tree may have changed
    FileTreeChanged { session_id: String, project: String },
    SessionClosed { session_id: String },
}

impl SessionEvent {
    /// Session the event belongs to.
    pub fn session_id(&self) -> &str {
        match self {
            Self::ImagePullProgress { session_id, .. }
            | Self::ContainerReady { session_id, .. }
            | Self::ContainerRestarted { session_id, .. }
            | Self::CommandCompleted { session_id, .. }
            | Self::WebServerReady { session_id, .. }
            | Self::RecoveryOccurred { session_id, .. }
            | Self::FileTreeChanged { session_id, .. }
            | Self::SessionClosed { session_id } => session_id,
        }
    }

    /// Short event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ImagePullProgress { .. } => "image_pull_progress",
            Self::ContainerReady { .. } => "container_ready",
            Self::ContainerRestarted { .. } => "container_restarted",
            Self::CommandCompleted { .. } => "command_completed",
            Self::WebServerReady { .. } => "web_server_ready",
            Self::RecoveryOccurred { .. } => "recovery_occurred",
            Self::FileTreeChanged { .. } => "file_tree_changed",
            Self::SessionClosed { .. } => "session_closed",
        }
    }
}

/// Broadcast bus for session events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; having no subscribers is not an error.
    pub fn emit(&self, event: SessionEvent) {
        debug!(event = event.name(), session = event.session_id(), "Session event");
        let _ = self.tx.send(event);
    }
}
