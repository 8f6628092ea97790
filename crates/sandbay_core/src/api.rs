//! Transport-facing facade.
//!
//! Every operation returns an [`ApiResponse`] instead of an error so a
//! transport layer can serialize results without its own error mapping.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::{SessionManager, SessionStatus};
use crate::error::{EngineError, EngineResult};
use crate::exec::{CommandOutcome, CommandRequest};
use crate::recovery::FileSyncReport;
use crate::session::Session;
use crate::webserver::WebServerInfo;

/// Error detail of a failed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub kind: String,
    pub message: String,
}

impl From<&EngineError> for ApiError {
    fn from(e: &EngineError) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

/// Structured result of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: &EngineError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

impl<T> From<EngineResult<T>> for ApiResponse<T> {
    fn from(result: EngineResult<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => {
                debug!("Operation failed ({}): {}", e.kind(), e);
                Self::err(&e)
            }
        }
    }
}

/// Session operations for a transport layer.
#[derive(Clone)]
pub struct SessionService {
    manager: Arc<SessionManager>,
}

impl SessionService {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub async fn open_session(
        &self,
        session_id: &str,
        project_name: &str,
        owner_id: &str,
    ) -> ApiResponse<Session> {
        self.manager
            .open(session_id, project_name, owner_id)
            .await
            .into()
    }

    pub async fn execute_command(
        &self,
        session_id: &str,
        command: &str,
        cwd: Option<&str>,
    ) -> ApiResponse<CommandOutcome> {
        let mut request = CommandRequest::new(session_id, command);
        if let Some(dir) = cwd {
            request = request.cwd(dir);
        }
        self.manager.execute(&request).await.into()
    }

    pub async fn start_web_server(&self, session_id: &str) -> ApiResponse<WebServerInfo> {
        self.manager.start_web_server(session_id).await.into()
    }

    pub async fn close_session(&self, session_id: &str) -> ApiResponse<bool> {
        self.manager.close(session_id).await.into()
    }

    pub async fn validate_session(&self, session_id: &str) -> ApiResponse<SessionStatus> {
        self.manager.validate(session_id).await.into()
    }

    pub async fn notify_file_changed(
        &self,
        project_name: &str,
        path: &str,
    ) -> ApiResponse<FileSyncReport> {
        self.manager
            .notify_file_changed(project_name, path)
            .await
            .into()
    }
}
