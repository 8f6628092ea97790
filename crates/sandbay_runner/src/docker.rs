//! Docker Engine API implementation of [`ContainerRuntime`].

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::service::{HostConfig, PortBinding};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use chrono::Utc;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::{ContainerSpec, ExecRequest};
use crate::error::{RunnerError, RunnerResult};
use crate::process::{LogHandler, LogLine, LogStream, StopSignal, TERMINATED};
use crate::runner::{write_file_script, ContainerRuntime, ExecutionResult};

/// Docker API based container runtime.
pub struct DockerApiRuntime {
    client: Docker,
}

impl DockerApiRuntime {
    /// Connect to the local Docker daemon.
    pub async fn new() -> RunnerResult<Self> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| RunnerError::RuntimeUnavailable(e.to_string()))?;

        // Verify connection
        client
            .ping()
            .await
            .map_err(|e| RunnerError::RuntimeUnavailable(e.to_string()))?;

        Ok(Self { client })
    }

    /// Create with custom Docker host.
    pub async fn with_host(host: &str) -> RunnerResult<Self> {
        let client = Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| RunnerError::RuntimeUnavailable(e.to_string()))?;
        client
            .ping()
            .await
            .map_err(|e| RunnerError::RuntimeUnavailable(e.to_string()))?;
        Ok(Self { client })
    }

    fn is_not_found(err: &bollard::errors::Error) -> bool {
        matches!(
            err,
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            }
        )
    }

    fn container_config(spec: &ContainerSpec) -> Config<String> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let binds: Vec<String> = spec.mounts.iter().map(|m| m.to_spec()).collect();

        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for port in &spec.ports {
            let key = format!("{}/tcp", port.container);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(port.host.to_string()),
                }]),
            );
        }

        let host_config = HostConfig {
            binds: Some(binds),
            port_bindings: Some(port_bindings),
            memory: spec.limits.memory_bytes,
            nano_cpus: spec.limits.cpus.map(|c| (c * 1_000_000_000.0) as i64),
            pids_limit: spec.limits.pids_limit,
            cap_drop: Some(spec.cap_drop.clone()),
            security_opt: spec
                .no_new_privileges
                .then(|| vec!["no-new-privileges".to_string()]),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            cmd: if spec.command.is_empty() {
                None
            } else {
                Some(spec.command.clone())
            },
            working_dir: spec.workdir.clone(),
            env: Some(env),
            labels: Some(spec.labels.clone().into_iter().collect()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    fn exec_options(request: &ExecRequest, attach_stdin: bool) -> CreateExecOptions<String> {
        CreateExecOptions {
            cmd: Some(request.command.clone()),
            env: Some(
                request
                    .env
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect(),
            ),
            working_dir: request.workdir.clone(),
            attach_stdin: Some(attach_stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        }
    }

    async fn exec_exit_code(&self, exec_id: &str) -> RunnerResult<i64> {
        let inspect = self.client.inspect_exec(exec_id).await?;
        Ok(inspect.exit_code.unwrap_or(TERMINATED))
    }
}

#[async_trait]
impl ContainerRuntime for DockerApiRuntime {
    async fn is_available(&self) -> RunnerResult<bool> {
        Ok(self.client.ping().await.is_ok())
    }

    async fn version(&self) -> RunnerResult<String> {
        let version = self.client.version().await?;
        Ok(format!(
            "Docker {} (API {})",
            version.version.unwrap_or_default(),
            version.api_version.unwrap_or_default()
        ))
    }

    async fn image_exists(&self, image: &str) -> RunnerResult<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if Self::is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn pull_image(&self, image: &str, progress: Option<LogHandler>) -> RunnerResult<()> {
        info!("Pulling image {}", image);

        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(error) = info.error {
                        return Err(RunnerError::ImagePullFailed {
                            image: image.to_string(),
                            detail: error,
                        });
                    }
                    if let Some(status) = info.status {
                        let message = match info.progress {
                            Some(detail) => format!("{} {}", status, detail),
                            None => status,
                        };
                        debug!("Pull status: {}", message);
                        if let Some(handler) = &progress {
                            handler(LogLine {
                                timestamp: Utc::now(),
                                stream: LogStream::Stdout,
                                message,
                            });
                        }
                    }
                }
                Err(e) => {
                    return Err(RunnerError::ImagePullFailed {
                        image: image.to_string(),
                        detail: e.to_string(),
                    });
                }
            }
        }

        info!("Image {} pulled successfully", image);
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> RunnerResult<String> {
        info!("Creating container {} from {}", spec.name, spec.image);

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };
        let created = self
            .client
            .create_container(Some(options), Self::container_config(spec))
            .await
            .map_err(|e| RunnerError::ContainerCreateFailed {
                name: spec.name.clone(),
                detail: e.to_string(),
            })?;

        self.client
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RunnerError::ContainerCreateFailed {
                name: spec.name.clone(),
                detail: e.to_string(),
            })?;

        Ok(created.id)
    }

    async fn stop_container(&self, name: &str) -> RunnerResult<()> {
        match self
            .client
            .stop_container(name, Some(StopContainerOptions { t: 2 }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!("Stop of {} reported: {}", name, e);
                Ok(())
            }
        }
    }

    async fn remove_container(&self, name: &str) -> RunnerResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.client.remove_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if Self::is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn is_running(&self, name: &str) -> RunnerResult<bool> {
        match self
            .client
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => Ok(details
                .state
                .and_then(|state| state.running)
                .unwrap_or(false)
                && details
                    .name
                    .map(|n| n.trim_start_matches('/') == name)
                    .unwrap_or(true)),
            Err(e) if Self::is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn container_exists(&self, name: &str) -> RunnerResult<bool> {
        match self
            .client
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if Self::is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_containers(&self, prefix: &str) -> RunnerResult<Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![prefix.to_string()]);
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self.client.list_containers(Some(options)).await?;
        Ok(containers
            .into_iter()
            .flat_map(|c| c.names.unwrap_or_default())
            .map(|n| n.trim_start_matches('/').to_string())
            .filter(|n| n.starts_with(prefix))
            .collect())
    }

    async fn exec(&self, request: &ExecRequest) -> RunnerResult<ExecutionResult> {
        let handler: LogHandler = std::sync::Arc::new(|_| {});
        self.exec_streaming(request, handler, None).await
    }

    async fn exec_streaming(
        &self,
        request: &ExecRequest,
        handler: LogHandler,
        stop: Option<StopSignal>,
    ) -> RunnerResult<ExecutionResult> {
        let started = Instant::now();
        let exec = self
            .client
            .create_exec(&request.container, Self::exec_options(request, false))
            .await
            .map_err(|e| RunnerError::ExecFailed(e.to_string()))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, .. } =
            self.client.start_exec(&exec.id, None).await?
        {
            let mut stop = stop;
            loop {
                let next = match stop.as_mut() {
                    Some(signal) => tokio::select! {
                        item = output.next() => item,
                        stopped = signal.stopped() => {
                            if stopped {
                                warn!("Stop requested for exec in {}", request.container);
                                return Ok(ExecutionResult {
                                    exit_code: TERMINATED,
                                    stdout,
                                    stderr,
                                    duration_ms: started.elapsed().as_millis() as u64,
                                });
                            }
                            // Stop handle dropped without firing.
                            stop = None;
                            continue;
                        }
                    },
                    None => output.next().await,
                };

                let Some(item) = next else { break };
                let (stream, message) = match item? {
                    LogOutput::StdOut { message } | LogOutput::Console { message } => {
                        (LogStream::Stdout, message)
                    }
                    LogOutput::StdErr { message } => (LogStream::Stderr, message),
                    LogOutput::StdIn { .. } => continue,
                };
                let text = String::from_utf8_lossy(&message).into_owned();
                match stream {
                    LogStream::Stdout => stdout.push_str(&text),
                    LogStream::Stderr => stderr.push_str(&text),
                }
                for line in text.lines() {
                    handler(LogLine {
                        timestamp: Utc::now(),
                        stream,
                        message: line.to_string(),
                    });
                }
            }
        }

        Ok(ExecutionResult {
            exit_code: self.exec_exit_code(&exec.id).await?,
            stdout,
            stderr,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn create_volume(&self, name: &str) -> RunnerResult<()> {
        let options = CreateVolumeOptions {
            name: name.to_string(),
            ..Default::default()
        };
        self.client
            .create_volume(options)
            .await
            .map_err(|e| RunnerError::VolumeFailed {
                name: name.to_string(),
                detail: e.to_string(),
            })?;
        debug!("Created volume {}", name);
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> RunnerResult<()> {
        match self
            .client
            .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if Self::is_not_found(&e) => Ok(()),
            Err(e) => Err(RunnerError::VolumeFailed {
                name: name.to_string(),
                detail: e.to_string(),
            }),
        }
    }

    async fn copy_into(&self, container: &str, path: &str, content: &[u8]) -> RunnerResult<()> {
        let request = ExecRequest::shell(container, write_file_script(path));
        let exec = self
            .client
            .create_exec(container, Self::exec_options(&request, true))
            .await
            .map_err(|e| RunnerError::CopyFailed {
                container: container.to_string(),
                detail: e.to_string(),
            })?;

        let mut stderr = String::new();
        if let StartExecResults::Attached { mut output, mut input } =
            self.client.start_exec(&exec.id, None).await?
        {
            input.write_all(content).await?;
            input.shutdown().await?;
            drop(input);

            while let Some(item) = output.next().await {
                if let LogOutput::StdErr { message } = item? {
                    stderr.push_str(&String::from_utf8_lossy(&message));
                }
            }
        }

        let exit_code = self.exec_exit_code(&exec.id).await?;
        if exit_code != 0 {
            return Err(RunnerError::CopyFailed {
                container: container.to_string(),
                detail: stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn logs(&self, name: &str, tail: Option<usize>) -> RunnerResult<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.map(|t| t.to_string()).unwrap_or_else(|| "all".to_string()),
            ..Default::default()
        };

        let mut output = String::new();
        let mut stream = self.client.logs(name, Some(options));

        while let Some(result) = stream.next().await {
            match result {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::StdErr { message }) => {
                    output.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(output)
    }
}
