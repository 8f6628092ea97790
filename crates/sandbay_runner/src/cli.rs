//! CLI-based container runtime supporting Docker and Podman.
//!
//! Every operation is translated into a `docker`/`podman` invocation run
//! through the [`ProcessRunner`]; results are parsed from the CLI output.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{ContainerSpec, ExecRequest};
use crate::error::{RunnerError, RunnerResult};
use crate::process::{LogHandler, ProcessOutput, ProcessRunner, ProcessSpec, StopSignal};
use crate::runner::{write_file_script, ContainerRuntime, ExecutionResult};

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Docker,
    Podman,
}

impl RuntimeKind {
    /// Get the CLI command name.
    pub fn command(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.command())
    }
}

impl std::str::FromStr for RuntimeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "podman" => Ok(Self::Podman),
            other => Err(format!("unknown container runtime: {}", other)),
        }
    }
}

/// CLI-based container runtime.
#[derive(Debug, Clone)]
pub struct CliRuntime {
    kind: RuntimeKind,
    process: ProcessRunner,
}

impl CliRuntime {
    /// Detect an available runtime, trying `preferred` first.
    pub async fn detect(preferred: Option<RuntimeKind>) -> RunnerResult<Self> {
        let process = ProcessRunner::new();

        if let Some(kind) = preferred {
            if Self::probe(&process, kind).await {
                info!("Using container runtime: {}", kind);
                return Ok(Self { kind, process });
            }
            warn!("Preferred runtime {} not available, trying alternatives", kind);
        }

        for kind in [RuntimeKind::Docker, RuntimeKind::Podman] {
            if Self::probe(&process, kind).await {
                info!("Using container runtime: {}", kind);
                return Ok(Self { kind, process });
            }
        }

        Err(RunnerError::RuntimeUnavailable(
            "Neither Docker nor Podman is available".to_string(),
        ))
    }

    /// Create a runtime for a specific CLI without probing it.
    pub fn with_kind(kind: RuntimeKind) -> Self {
        Self {
            kind,
            process: ProcessRunner::new(),
        }
    }

    pub fn kind(&self) -> RuntimeKind {
        self.kind
    }

    async fn probe(process: &ProcessRunner, kind: RuntimeKind) -> bool {
        process
            .run(&ProcessSpec::new(kind.command()).arg("version"))
            .await
            .success()
    }

    fn spec<I, S>(&self, args: I) -> ProcessSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ProcessSpec::new(self.kind.command()).args(args)
    }

    /// Run a runtime command; spawn failure means the CLI itself is missing.
    async fn invoke(&self, spec: ProcessSpec) -> RunnerResult<ProcessOutput> {
        let output = self.process.run(&spec).await;
        if output.spawn_failed() {
            return Err(RunnerError::RuntimeUnavailable(format!(
                "{}: {}",
                self.kind, output.stderr
            )));
        }
        Ok(output)
    }

    /// Build the `run -d` arguments for a container.
    pub(crate) fn build_run_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            spec.name.clone(),
        ];

        if let Some(workdir) = &spec.workdir {
            args.push("-w".to_string());
            args.push(workdir.clone());
        }

        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        for mount in &spec.mounts {
            args.push("-v".to_string());
            args.push(mount.to_spec());
        }

        for port in &spec.ports {
            args.push("-p".to_string());
            args.push(format!("{}:{}", port.host, port.container));
        }

        if let Some(cpus) = spec.limits.cpus {
            args.push("--cpus".to_string());
            args.push(format!("{:.2}", cpus));
        }

        if let Some(memory) = spec.limits.memory_bytes {
            args.push("-m".to_string());
            args.push(format!("{}b", memory));
        }

        if let Some(pids) = spec.limits.pids_limit {
            args.push("--pids-limit".to_string());
            args.push(pids.to_string());
        }

        for cap in &spec.cap_drop {
            args.push("--cap-drop".to_string());
            args.push(cap.clone());
        }

        if spec.no_new_privileges {
            args.push("--security-opt".to_string());
            args.push("no-new-privileges".to_string());
        }

        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }

    /// Build the `exec` arguments for a request.
    pub(crate) fn build_exec_args(request: &ExecRequest, interactive: bool) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if interactive {
            args.push("-i".to_string());
        }
        if let Some(workdir) = &request.workdir {
            args.push("-w".to_string());
            args.push(workdir.clone());
        }
        for (key, value) in &request.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(request.container.clone());
        args.extend(request.command.iter().cloned());
        args
    }
}

/// Exact-name matches from `ps --format {{.Names}}` output.
pub(crate) fn names_matching(output: &str, name: &str) -> bool {
    output.lines().map(str::trim).any(|line| line == name)
}

/// The part of `inspect --format {{json .State}}` we read.
#[derive(Debug, Deserialize)]
struct ContainerState {
    #[serde(rename = "Running", default)]
    running: bool,
}

pub(crate) fn parse_running(output: &str) -> RunnerResult<bool> {
    let state: ContainerState = serde_json::from_str(output.trim())?;
    Ok(state.running)
}

fn is_missing_container(output: &ProcessOutput) -> bool {
    output.stderr.to_lowercase().contains("no such")
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    async fn is_available(&self) -> RunnerResult<bool> {
        Ok(Self::probe(&self.process, self.kind).await)
    }

    async fn version(&self) -> RunnerResult<String> {
        let output = self
            .invoke(self.spec(["version", "--format", "{{.Server.Version}}"]))
            .await?;
        if !output.success() {
            return Err(RunnerError::RuntimeUnavailable(output.diagnostic()));
        }
        Ok(format!("{} {}", self.kind, output.stdout.trim()))
    }

    async fn image_exists(&self, image: &str) -> RunnerResult<bool> {
        let output = self.invoke(self.spec(["image", "inspect", image])).await?;
        Ok(output.success())
    }

    async fn pull_image(&self, image: &str, progress: Option<LogHandler>) -> RunnerResult<()> {
        info!("Pulling image: {}", image);
        let spec = self.spec(["pull", image]);

        let output = match progress {
            Some(handler) => self.process.run_streaming(&spec, handler, None).await,
            None => self.process.run(&spec).await,
        };

        if output.spawn_failed() {
            return Err(RunnerError::RuntimeUnavailable(output.stderr));
        }
        if !output.success() {
            return Err(RunnerError::ImagePullFailed {
                image: image.to_string(),
                detail: output.diagnostic(),
            });
        }
        info!("Successfully pulled: {}", image);
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> RunnerResult<String> {
        let args = Self::build_run_args(spec);
        info!("Creating container {} from {}", spec.name, spec.image);

        let output = self.invoke(self.spec(args)).await?;
        if !output.success() {
            return Err(RunnerError::ContainerCreateFailed {
                name: spec.name.clone(),
                detail: output.diagnostic(),
            });
        }
        Ok(output.stdout.trim().to_string())
    }

    async fn stop_container(&self, name: &str) -> RunnerResult<()> {
        let output = self.invoke(self.spec(["stop", "-t", "2", name])).await?;
        if !output.success() {
            debug!("Stop of {} reported: {}", name, output.diagnostic());
        }
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> RunnerResult<()> {
        let output = self.invoke(self.spec(["rm", "-f", name])).await?;
        if !output.success() {
            debug!("Removal of {} reported: {}", name, output.diagnostic());
        }
        Ok(())
    }

    async fn is_running(&self, name: &str) -> RunnerResult<bool> {
        let output = self
            .invoke(self.spec(["container", "inspect", "--format", "{{json .State}}", name]))
            .await?;
        if is_missing_container(&output) {
            return Ok(false);
        }
        if !output.success() {
            return Err(RunnerError::CommandFailed(output.diagnostic()));
        }
        parse_running(&output.stdout)
    }

    async fn container_exists(&self, name: &str) -> RunnerResult<bool> {
        let filter = format!("name=^/?{}$", name);
        let output = self
            .invoke(self.spec(["ps", "-a", "--filter", filter.as_str(), "--format", "{{.Names}}"]))
            .await?;
        if !output.success() {
            return Err(RunnerError::CommandFailed(output.diagnostic()));
        }
        Ok(names_matching(&output.stdout, name))
    }

    async fn list_containers(&self, prefix: &str) -> RunnerResult<Vec<String>> {
        let filter = format!("name={}", prefix);
        let output = self
            .invoke(self.spec(["ps", "-a", "--filter", filter.as_str(), "--format", "{{.Names}}"]))
            .await?;
        if !output.success() {
            return Err(RunnerError::CommandFailed(output.diagnostic()));
        }
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with(prefix))
            .map(str::to_string)
            .collect())
    }

    async fn exec(&self, request: &ExecRequest) -> RunnerResult<ExecutionResult> {
        let args = Self::build_exec_args(request, false);
        Ok(self.invoke(self.spec(args)).await?.into())
    }

    async fn exec_streaming(
        &self,
        request: &ExecRequest,
        handler: LogHandler,
        stop: Option<StopSignal>,
    ) -> RunnerResult<ExecutionResult> {
        let spec = self.spec(Self::build_exec_args(request, false));
        let output = self.process.run_streaming(&spec, handler, stop).await;
        if output.spawn_failed() {
            return Err(RunnerError::RuntimeUnavailable(output.stderr));
        }
        Ok(output.into())
    }

    async fn create_volume(&self, name: &str) -> RunnerResult<()> {
        let output = self.invoke(self.spec(["volume", "create", name])).await?;
        if !output.success() {
            return Err(RunnerError::VolumeFailed {
                name: name.to_string(),
                detail: output.diagnostic(),
            });
        }
        debug!("Created volume {}", name);
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> RunnerResult<()> {
        let output = self.invoke(self.spec(["volume", "rm", "-f", name])).await?;
        if !output.success() {
            debug!("Volume removal of {} reported: {}", name, output.diagnostic());
        }
        Ok(())
    }

    async fn copy_into(&self, container: &str, path: &str, content: &[u8]) -> RunnerResult<()> {
        let request = ExecRequest::shell(container, write_file_script(path));
        let spec = self
            .spec(Self::build_exec_args(&request, true))
            .stdin(content.to_vec());

        let output = self.invoke(spec).await?;
        if !output.success() {
            return Err(RunnerError::CopyFailed {
                container: container.to_string(),
                detail: output.diagnostic(),
            });
        }
        Ok(())
    }

    async fn logs(&self, name: &str, tail: Option<usize>) -> RunnerResult<String> {
        let mut args = vec!["logs".to_string()];
        if let Some(tail) = tail {
            args.push("--tail".to_string());
            args.push(tail.to_string());
        }
        args.push(name.to_string());

        let output = self.invoke(self.spec(args)).await?;
        if !output.success() {
            return Err(RunnerError::CommandFailed(output.diagnostic()));
        }
        let mut logs = output.stdout;
        logs.push_str(&output.stderr);
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MountConfig, ResourceLimits};

    #[test]
    fn test_build_run_args() {
        let spec = ContainerSpec::new("sandbay-u1-demo-t1", "node:20-alpine")
            .workdir("/workspace")
            .env("PORT", "3000")
            .mount(MountConfig::bind("/tmp/t1", "/workspace"))
            .publish(41000, 3000)
            .limits(ResourceLimits::default())
            .cap_drop(vec!["NET_RAW".to_string()])
            .command(vec!["tail".into(), "-f".into(), "/dev/null".into()]);

        let args = CliRuntime::build_run_args(&spec);

        assert_eq!(&args[..4], &["run", "-d", "--name", "sandbay-u1-demo-t1"]);
        assert!(args.windows(2).any(|w| w == ["-v", "/tmp/t1:/workspace"]));
        assert!(args.windows(2).any(|w| w == ["-p", "41000:3000"]));
        assert!(args.windows(2).any(|w| w == ["--pids-limit", "256"]));
        assert!(args.windows(2).any(|w| w == ["--cap-drop", "NET_RAW"]));
        assert!(args.windows(2).any(|w| w == ["-e", "PORT=3000"]));

        let image_at = args.iter().position(|a| a == "node:20-alpine").unwrap();
        assert_eq!(&args[image_at + 1..], &["tail", "-f", "/dev/null"]);
    }

    #[test]
    fn test_build_exec_args() {
        let request = ExecRequest::shell("c1", "ls").workdir("/workspace/sub");
        let args = CliRuntime::build_exec_args(&request, true);
        assert_eq!(args, vec!["exec", "-i", "-w", "/workspace/sub", "c1", "sh", "-c", "ls"]);
    }

    #[test]
    fn test_exact_name_match() {
        let output = "sandbay-u1-demo-t1-web-17\nsandbay-u1-demo-t1\n";
        assert!(names_matching(output, "sandbay-u1-demo-t1"));
        assert!(!names_matching(output, "sandbay-u1-demo"));
    }

    #[test]
    fn test_parse_inspect_state() {
        let docker = r#"{"Status":"running","Running":true,"Paused":false,"Pid":4242}"#;
        assert!(parse_running(docker).unwrap());
        assert!(!parse_running("{\"Status\":\"exited\",\"Running\":false}\n").unwrap());

        let err = parse_running("Error: template parsing").unwrap_err();
        assert_eq!(err.kind(), "json");
    }

    #[test]
    fn test_runtime_kind_parse() {
        assert_eq!("Podman".parse::<RuntimeKind>().unwrap(), RuntimeKind::Podman);
        assert!("lxc".parse::<RuntimeKind>().is_err());
    }

    #[tokio::test]
    async fn test_missing_cli_reports_runtime_unavailable() {
        let runtime = CliRuntime {
            kind: RuntimeKind::Docker,
            process: ProcessRunner::new(),
        };
        let spec = ProcessSpec::new("sandbay-missing-runtime-binary");
        let err = runtime.invoke(spec).await.unwrap_err();
        assert!(matches!(err, RunnerError::RuntimeUnavailable(_)));
    }
}
