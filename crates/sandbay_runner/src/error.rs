//! Error types for the runner module.

use thiserror::Error;

/// Result type alias for runner operations.
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Errors that can occur during runner operations.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Container runtime not available: {0}")]
    RuntimeUnavailable(String),

    #[error("Image pull failed for {image}: {detail}")]
    ImagePullFailed { image: String, detail: String },

    #[error("Container creation failed for {name}: {detail}")]
    ContainerCreateFailed { name: String, detail: String },

    #[error("Port {0} is already in use")]
    PortConflict(u16),

    #[error("Exec failed: {0}")]
    ExecFailed(String),

    #[error("Volume operation failed for {name}: {detail}")]
    VolumeFailed { name: String, detail: String },

    #[error("Copy into container {container} failed: {detail}")]
    CopyFailed { container: String, detail: String },

    #[error("Runtime command failed: {0}")]
    CommandFailed(String),

    #[error("Docker API error: {0}")]
    DockerApi(#[from] bollard::errors::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RunnerError {
    /// Stable machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RuntimeUnavailable(_) => "runtime_unavailable",
            Self::ImagePullFailed { .. } => "image_pull_failed",
            Self::ContainerCreateFailed { .. } => "container_create_failed",
            Self::PortConflict(_) => "port_conflict",
            Self::ExecFailed(_) => "exec_failed",
            Self::VolumeFailed { .. } => "volume_failed",
            Self::CopyFailed { .. } => "copy_failed",
            Self::CommandFailed(_) => "runtime_command_failed",
            Self::DockerApi(_) => "docker_api",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }
}
