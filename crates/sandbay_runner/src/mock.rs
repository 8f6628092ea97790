//! Mock container runtime for testing.
//!
//! Provides an in-memory implementation of the [`ContainerRuntime`] trait
//! that simulates container, image and volume state and records every
//! call, for use in tests without requiring actual Docker/Podman.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use crate::config::{ContainerSpec, ExecRequest};
use crate::error::{RunnerError, RunnerResult};
use crate::process::{LogHandler, LogLine, LogStream, StopSignal, TERMINATED};
use crate::runner::{ContainerRuntime, ExecutionResult};

/// Custom exec behaviour.
pub type ExecHandler = Arc<dyn Fn(&ExecRequest) -> ExecutionResult + Send + Sync>;

/// Captured call information for verification.
#[derive(Debug, Clone)]
pub struct CapturedCall {
    pub method: String,
    /// Container, image or volume the call targeted
    pub target: Option<String>,
    pub command: Option<Vec<String>>,
    pub workdir: Option<String>,
}

impl CapturedCall {
    fn new(method: &str, target: impl Into<String>) -> Self {
        Self {
            method: method.to_string(),
            target: Some(target.into()),
            command: None,
            workdir: None,
        }
    }
}

/// Simulated container.
#[derive(Debug, Clone)]
pub struct MockContainer {
    pub spec: ContainerSpec,
    pub running: bool,
}

#[derive(Default)]
struct MockState {
    available: bool,
    images: HashSet<String>,
    containers: BTreeMap<String, MockContainer>,
    volumes: HashSet<String>,
    files: HashMap<(String, String), Vec<u8>>,
    calls: Vec<CapturedCall>,
    create_failure: Option<String>,
    pull_failure: Option<String>,
}

/// Mock container runtime for testing.
#[derive(Clone)]
pub struct MockRuntime {
    state: Arc<RwLock<MockState>>,
    exec_handler: Arc<RwLock<Option<ExecHandler>>>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MockState {
                available: true,
                ..Default::default()
            })),
            exec_handler: Arc::new(RwLock::new(None)),
        }
    }

    /// Set whether the runtime is available.
    pub fn set_available(self, available: bool) -> Self {
        self.state.write().available = available;
        self
    }

    /// Add an image that should "exist".
    pub fn add_existing_image(self, image: impl Into<String>) -> Self {
        self.state.write().images.insert(image.into());
        self
    }

    /// Make every container creation fail with `message`.
    pub fn fail_create(&self, message: impl Into<String>) {
        self.state.write().create_failure = Some(message.into());
    }

    /// Make image pulls fail with `message`.
    pub fn fail_pull(&self, message: impl Into<String>) {
        self.state.write().pull_failure = Some(message.into());
    }

    /// Clear configured failures.
    pub fn clear_failures(&self) {
        let mut state = self.state.write();
        state.create_failure = None;
        state.pull_failure = None;
    }

    /// Install custom exec behaviour.
    pub fn set_exec_handler(&self, handler: ExecHandler) {
        *self.exec_handler.write() = Some(handler);
    }

    /// Simulate a container dying outside of the engine's control.
    pub fn kill(&self, name: &str) {
        self.state.write().containers.remove(name);
    }

    /// Pre-create a container as if left behind by an earlier process.
    pub fn insert_container(&self, spec: ContainerSpec, running: bool) {
        self.state
            .write()
            .containers
            .insert(spec.name.clone(), MockContainer { spec, running });
    }

    /// Names of containers currently running.
    pub fn running_containers(&self) -> Vec<String> {
        self.state
            .read()
            .containers
            .values()
            .filter(|c| c.running)
            .map(|c| c.spec.name.clone())
            .collect()
    }

    /// Look up a simulated container.
    pub fn container(&self, name: &str) -> Option<MockContainer> {
        self.state.read().containers.get(name).cloned()
    }

    /// Whether a simulated volume exists.
    pub fn has_volume(&self, name: &str) -> bool {
        self.state.read().volumes.contains(name)
    }

    /// Content written via `copy_into`.
    pub fn file(&self, container: &str, path: &str) -> Option<Vec<u8>> {
        self.state
            .read()
            .files
            .get(&(container.to_string(), path.to_string()))
            .cloned()
    }

    /// Clear all captured calls.
    pub fn clear_calls(&self) {
        self.state.write().calls.clear();
    }

    /// Get all captured calls.
    pub fn get_calls(&self) -> Vec<CapturedCall> {
        self.state.read().calls.clone()
    }

    /// Check if a specific method was called.
    pub fn was_called(&self, method: &str) -> bool {
        self.state.read().calls.iter().any(|c| c.method == method)
    }

    /// Get calls to a specific method.
    pub fn get_method_calls(&self, method: &str) -> Vec<CapturedCall> {
        self.state
            .read()
            .calls
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    fn record_call(&self, call: CapturedCall) {
        self.state.write().calls.push(call);
    }

    fn check_available(&self) -> RunnerResult<()> {
        if self.state.read().available {
            Ok(())
        } else {
            Err(RunnerError::RuntimeUnavailable("mock runtime offline".to_string()))
        }
    }

    fn run_exec(&self, request: &ExecRequest) -> RunnerResult<ExecutionResult> {
        let running = self
            .state
            .read()
            .containers
            .get(&request.container)
            .map(|c| c.running)
            .unwrap_or(false);
        if !running {
            return Ok(ExecutionResult {
                exit_code: 1,
                stdout: String::new(),
                stderr: format!("Error: No such container: {}", request.container),
                duration_ms: 0,
            });
        }

        let handler = self.exec_handler.read().clone();
        Ok(match handler {
            Some(handler) => handler(request),
            None => ExecutionResult::default(),
        })
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn is_available(&self) -> RunnerResult<bool> {
        Ok(self.state.read().available)
    }

    async fn version(&self) -> RunnerResult<String> {
        self.check_available()?;
        Ok("mock-runtime 1.0.0".to_string())
    }

    async fn image_exists(&self, image: &str) -> RunnerResult<bool> {
        self.check_available()?;
        self.record_call(CapturedCall::new("image_exists", image));
        Ok(self.state.read().images.contains(image))
    }

    async fn pull_image(&self, image: &str, progress: Option<LogHandler>) -> RunnerResult<()> {
        self.check_available()?;
        self.record_call(CapturedCall::new("pull_image", image));

        if let Some(detail) = self.state.read().pull_failure.clone() {
            return Err(RunnerError::ImagePullFailed {
                image: image.to_string(),
                detail,
            });
        }
        if let Some(handler) = progress {
            handler(LogLine {
                timestamp: Utc::now(),
                stream: LogStream::Stdout,
                message: format!("Pulled {}", image),
            });
        }
        self.state.write().images.insert(image.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> RunnerResult<String> {
        self.check_available()?;
        self.record_call(CapturedCall {
            method: "create_container".to_string(),
            target: Some(spec.name.clone()),
            command: Some(spec.command.clone()),
            workdir: spec.workdir.clone(),
        });

        let mut state = self.state.write();
        if let Some(detail) = state.create_failure.clone() {
            return Err(RunnerError::ContainerCreateFailed {
                name: spec.name.clone(),
                detail,
            });
        }
        if state.containers.contains_key(&spec.name) {
            return Err(RunnerError::ContainerCreateFailed {
                name: spec.name.clone(),
                detail: format!("Conflict. The container name \"/{}\" is already in use", spec.name),
            });
        }
        for port in &spec.ports {
            let clash = state
                .containers
                .values()
                .any(|c| c.running && c.spec.ports.iter().any(|p| p.host == port.host));
            if clash {
                return Err(RunnerError::ContainerCreateFailed {
                    name: spec.name.clone(),
                    detail: format!("Bind for 0.0.0.0:{} failed: port is already allocated", port.host),
                });
            }
        }

        state.containers.insert(
            spec.name.clone(),
            MockContainer {
                spec: spec.clone(),
                running: true,
            },
        );
        Ok(format!("mock-{}", uuid::Uuid::new_v4()))
    }

    async fn stop_container(&self, name: &str) -> RunnerResult<()> {
        self.check_available()?;
        self.record_call(CapturedCall::new("stop_container", name));
        if let Some(container) = self.state.write().containers.get_mut(name) {
            container.running = false;
        }
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> RunnerResult<()> {
        self.check_available()?;
        self.record_call(CapturedCall::new("remove_container", name));
        self.state.write().containers.remove(name);
        Ok(())
    }

    async fn is_running(&self, name: &str) -> RunnerResult<bool> {
        self.check_available()?;
        self.record_call(CapturedCall::new("is_running", name));
        Ok(self
            .state
            .read()
            .containers
            .get(name)
            .map(|c| c.running)
            .unwrap_or(false))
    }

    async fn container_exists(&self, name: &str) -> RunnerResult<bool> {
        self.check_available()?;
        Ok(self.state.read().containers.contains_key(name))
    }

    async fn list_containers(&self, prefix: &str) -> RunnerResult<Vec<String>> {
        self.check_available()?;
        self.record_call(CapturedCall::new("list_containers", prefix));
        Ok(self
            .state
            .read()
            .containers
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn exec(&self, request: &ExecRequest) -> RunnerResult<ExecutionResult> {
        self.check_available()?;
        self.record_call(CapturedCall {
            method: "exec".to_string(),
            target: Some(request.container.clone()),
            command: Some(request.command.clone()),
            workdir: request.workdir.clone(),
        });
        self.run_exec(request)
    }

    async fn exec_streaming(
        &self,
        request: &ExecRequest,
        handler: LogHandler,
        stop: Option<StopSignal>,
    ) -> RunnerResult<ExecutionResult> {
        self.check_available()?;
        self.record_call(CapturedCall {
            method: "exec_streaming".to_string(),
            target: Some(request.container.clone()),
            command: Some(request.command.clone()),
            workdir: request.workdir.clone(),
        });

        if stop.map(|s| s.is_stopped()).unwrap_or(false) {
            return Ok(ExecutionResult {
                exit_code: TERMINATED,
                ..Default::default()
            });
        }

        let result = self.run_exec(request)?;
        for (stream, text) in [
            (LogStream::Stdout, &result.stdout),
            (LogStream::Stderr, &result.stderr),
        ] {
            for line in text.lines() {
                handler(LogLine {
                    timestamp: Utc::now(),
                    stream,
                    message: line.to_string(),
                });
            }
        }
        Ok(result)
    }

    async fn create_volume(&self, name: &str) -> RunnerResult<()> {
        self.check_available()?;
        self.record_call(CapturedCall::new("create_volume", name));
        self.state.write().volumes.insert(name.to_string());
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> RunnerResult<()> {
        self.check_available()?;
        self.record_call(CapturedCall::new("remove_volume", name));
        self.state.write().volumes.remove(name);
        Ok(())
    }

    async fn copy_into(&self, container: &str, path: &str, content: &[u8]) -> RunnerResult<()> {
        self.check_available()?;
        self.record_call(CapturedCall::new("copy_into", format!("{}:{}", container, path)));

        let mut state = self.state.write();
        if !state.containers.get(container).map(|c| c.running).unwrap_or(false) {
            return Err(RunnerError::CopyFailed {
                container: container.to_string(),
                detail: "container is not running".to_string(),
            });
        }
        state
            .files
            .insert((container.to_string(), path.to_string()), content.to_vec());
        Ok(())
    }

    async fn logs(&self, name: &str, _tail: Option<usize>) -> RunnerResult<String> {
        self.check_available()?;
        self.record_call(CapturedCall::new("logs", name));
        if self.state.read().containers.contains_key(name) {
            Ok(format!("mock logs for {}\n", name))
        } else {
            Err(RunnerError::CommandFailed(format!("No such container: {}", name)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec::new(name, "node:20-alpine").publish(40000, 3000)
    }

    #[tokio::test]
    async fn test_mock_container_lifecycle() {
        let runtime = MockRuntime::new();
        runtime.create_container(&spec("c1")).await.unwrap();

        assert!(runtime.is_running("c1").await.unwrap());
        runtime.stop_container("c1").await.unwrap();
        assert!(!runtime.is_running("c1").await.unwrap());
        assert!(runtime.container_exists("c1").await.unwrap());

        runtime.remove_container("c1").await.unwrap();
        assert!(!runtime.container_exists("c1").await.unwrap());
        assert_eq!(runtime.get_method_calls("remove_container").len(), 1);
    }

    #[tokio::test]
    async fn test_mock_rejects_duplicate_names_and_ports() {
        let runtime = MockRuntime::new();
        runtime.create_container(&spec("c1")).await.unwrap();

        let dup = runtime.create_container(&spec("c1")).await.unwrap_err();
        assert!(matches!(dup, RunnerError::ContainerCreateFailed { .. }));

        let port = runtime.create_container(&spec("c2")).await.unwrap_err();
        assert!(port.to_string().contains("port is already allocated"));
    }

    #[tokio::test]
    async fn test_mock_exec_handler_and_dead_container() {
        let runtime = MockRuntime::new();
        runtime.set_exec_handler(Arc::new(|req: &ExecRequest| ExecutionResult {
            exit_code: 0,
            stdout: format!("ran in {}", req.workdir.clone().unwrap_or_default()),
            ..Default::default()
        }));
        runtime.create_container(&spec("c1")).await.unwrap();

        let req = ExecRequest::shell("c1", "ls").workdir("/workspace");
        let result = runtime.exec(&req).await.unwrap();
        assert_eq!(result.stdout, "ran in /workspace");

        runtime.kill("c1");
        let result = runtime.exec(&req).await.unwrap();
        assert_eq!(result.exit_code, 1);
    }

    #[tokio::test]
    async fn test_mock_image_tracking() {
        let runtime = MockRuntime::new().add_existing_image("python:3.12-slim");

        assert!(runtime.image_exists("python:3.12-slim").await.unwrap());
        assert!(!runtime.image_exists("node:20-alpine").await.unwrap());

        runtime.pull_image("node:20-alpine", None).await.unwrap();
        assert!(runtime.image_exists("node:20-alpine").await.unwrap());
    }

    #[tokio::test]
    async fn test_mock_unavailable() {
        let runtime = MockRuntime::new().set_available(false);
        assert!(!runtime.is_available().await.unwrap());
        let err = runtime.create_container(&spec("c1")).await.unwrap_err();
        assert!(matches!(err, RunnerError::RuntimeUnavailable(_)));
    }
}
