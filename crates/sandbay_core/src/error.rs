//! Error types for the session engine.

use sandbay_runner::RunnerError;
use thiserror::Error;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur during session orchestration.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Project store error: {0}")]
    Store(String),

    #[error("Web server error: {0}")]
    WebServer(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Stable machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "session_not_found",
            Self::Store(_) => "project_store",
            Self::WebServer(_) => "web_server",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Snapshot(_) => "snapshot",
            Self::Runner(e) => e.kind(),
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }

    /// Whether the container daemon could not be reached.
    pub fn is_runtime_unavailable(&self) -> bool {
        matches!(self, Self::Runner(RunnerError::RuntimeUnavailable(_)))
    }

    /// Whether a published port was already bound.
    pub fn is_port_conflict(&self) -> bool {
        matches!(self, Self::Runner(RunnerError::PortConflict(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runner_kind_passes_through() {
        let err: EngineError = RunnerError::PortConflict(8080).into();
        assert_eq!(err.kind(), "port_conflict");
        assert!(err.is_port_conflict());
        assert_eq!(err.to_string(), "Port 8080 is already in use");
    }

    #[test]
    fn test_engine_kinds() {
        assert_eq!(
            EngineError::SessionNotFound("t1".into()).kind(),
            "session_not_found"
        );
        assert!(EngineError::Runner(RunnerError::RuntimeUnavailable("x".into()))
            .is_runtime_unavailable());
    }
}
