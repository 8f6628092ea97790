//! Container runtime trait and types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{ContainerSpec, ExecRequest};
use crate::error::RunnerResult;
use crate::process::{LogHandler, ProcessOutput, StopSignal};

/// Result of an exec inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Exit code from the command
    pub exit_code: i64,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// Duration in milliseconds
    pub duration_ms: u64,
}

impl ExecutionResult {
    /// Check if execution was successful (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Get combined output (stdout + stderr).
    pub fn combined_output(&self) -> String {
        if self.stdout.is_empty() {
            self.stderr.clone()
        } else if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

impl From<ProcessOutput> for ExecutionResult {
    fn from(output: ProcessOutput) -> Self {
        Self {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            duration_ms: output.duration_ms,
        }
    }
}

/// Narrow interface over a container runtime daemon.
///
/// Session logic only talks to this trait, so the CLI-invocation backend
/// and the native API backend are interchangeable.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check if the runtime daemon is reachable.
    async fn is_available(&self) -> RunnerResult<bool>;

    /// Get runtime version information.
    async fn version(&self) -> RunnerResult<String>;

    /// Check if an image exists locally.
    async fn image_exists(&self, image: &str) -> RunnerResult<bool>;

    /// Pull an image, optionally streaming progress lines.
    async fn pull_image(&self, image: &str, progress: Option<LogHandler>) -> RunnerResult<()>;

    /// Create and start a detached container, returning its id.
    async fn create_container(&self, spec: &ContainerSpec) -> RunnerResult<String>;

    /// Stop a container. Stopping an absent container is not an error.
    async fn stop_container(&self, name: &str) -> RunnerResult<()>;

    /// Force-remove a container. Removing an absent container is not an error.
    async fn remove_container(&self, name: &str) -> RunnerResult<()>;

    /// Whether a container with exactly this name is running.
    async fn is_running(&self, name: &str) -> RunnerResult<bool>;

    /// Whether a container with exactly this name exists in any state.
    async fn container_exists(&self, name: &str) -> RunnerResult<bool>;

    /// Names of all containers (any state) whose name starts with `prefix`.
    async fn list_containers(&self, prefix: &str) -> RunnerResult<Vec<String>>;

    /// Run a command inside a running container, capturing output.
    async fn exec(&self, request: &ExecRequest) -> RunnerResult<ExecutionResult>;

    /// Run a command inside a running container, streaming output lines.
    async fn exec_streaming(
        &self,
        request: &ExecRequest,
        handler: LogHandler,
        stop: Option<StopSignal>,
    ) -> RunnerResult<ExecutionResult>;

    /// Create a named volume.
    async fn create_volume(&self, name: &str) -> RunnerResult<()>;

    /// Remove a named volume. Removing an absent volume is not an error.
    async fn remove_volume(&self, name: &str) -> RunnerResult<()>;

    /// Write `content` to `path` inside a running container.
    async fn copy_into(&self, container: &str, path: &str, content: &[u8]) -> RunnerResult<()>;

    /// Get logs from a container.
    async fn logs(&self, name: &str, tail: Option<usize>) -> RunnerResult<String>;
}

/// Quote a string for safe interpolation into a POSIX shell script.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Shell script used by both backends to write stdin into `path`.
pub fn write_file_script(path: &str) -> String {
    let quoted = shell_quote(path);
    format!("mkdir -p \"$(dirname {quoted})\" && cat > {quoted}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_output() {
        let result = ExecutionResult {
            exit_code: 1,
            stdout: "out".into(),
            stderr: "err".into(),
            duration_ms: 3,
        };
        assert_eq!(result.combined_output(), "out\nerr");
        assert!(!result.success());
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_write_file_script() {
        assert_eq!(
            write_file_script("/workspace/src/app.js"),
            "mkdir -p \"$(dirname '/workspace/src/app.js')\" && cat > '/workspace/src/app.js'"
        );
    }
}
