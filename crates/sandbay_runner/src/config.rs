//! Container configuration types.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Where a mount's content comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "source", rename_all = "lowercase")]
pub enum MountSource {
    /// Host directory bind mount
    Bind(PathBuf),
    /// Runtime-managed named volume
    Volume(String),
}

impl MountSource {
    /// Source part of a `-v source:target` specification.
    pub fn as_spec(&self) -> String {
        match self {
            Self::Bind(path) => path.to_string_lossy().into_owned(),
            Self::Volume(name) => name.clone(),
        }
    }
}

/// Container mount configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountConfig {
    pub source: MountSource,
    /// Container path to mount to
    pub target: String,
    pub read_only: bool,
}

impl MountConfig {
    pub fn bind(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: MountSource::Bind(source.into()),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn volume(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: MountSource::Volume(name.into()),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// `source:target[:ro]` as accepted by `docker run -v`.
    pub fn to_spec(&self) -> String {
        let mut spec = format!("{}:{}", self.source.as_spec(), self.target);
        if self.read_only {
            spec.push_str(":ro");
        }
        spec
    }
}

/// Resource ceilings applied to a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// CPU share (number of CPUs)
    pub cpus: Option<f64>,
    /// Memory ceiling in bytes
    pub memory_bytes: Option<i64>,
    /// Maximum number of processes
    pub pids_limit: Option<i64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpus: Some(1.0),
            memory_bytes: Some(512 * 1024 * 1024),
            pids_limit: Some(256),
        }
    }
}

impl ResourceLimits {
    pub fn unlimited() -> Self {
        Self {
            cpus: None,
            memory_bytes: None,
            pids_limit: None,
        }
    }

    /// Stable textual form, used for keying.
    pub fn fingerprint(&self) -> String {
        format!(
            "cpus={};mem={};pids={}",
            self.cpus.map(|c| format!("{:.2}", c)).unwrap_or_default(),
            self.memory_bytes.map(|m| m.to_string()).unwrap_or_default(),
            self.pids_limit.map(|p| p.to_string()).unwrap_or_default(),
        )
    }
}

/// Published `host:container` port pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

/// Long-running container to create and start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    /// Full image reference including tag
    pub image: String,
    pub command: Vec<String>,
    pub workdir: Option<String>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub mounts: Vec<MountConfig>,
    pub ports: Vec<PortMapping>,
    pub limits: ResourceLimits,
    pub cap_drop: Vec<String>,
    pub no_new_privileges: bool,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            command: Vec::new(),
            workdir: None,
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
            mounts: Vec::new(),
            ports: Vec::new(),
            limits: ResourceLimits::unlimited(),
            cap_drop: Vec::new(),
            no_new_privileges: true,
        }
    }

    pub fn command(mut self, cmd: Vec<String>) -> Self {
        self.command = cmd;
        self
    }

    pub fn workdir(mut self, dir: impl Into<String>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn mount(mut self, mount: MountConfig) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn publish(mut self, host: u16, container: u16) -> Self {
        self.ports.push(PortMapping { host, container });
        self
    }

    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn cap_drop(mut self, caps: Vec<String>) -> Self {
        self.cap_drop = caps;
        self
    }
}

/// Command to run inside an already running container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    pub container: String,
    pub command: Vec<String>,
    pub workdir: Option<String>,
    pub env: BTreeMap<String, String>,
}

impl ExecRequest {
    pub fn new(container: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            container: container.into(),
            command,
            workdir: None,
            env: BTreeMap::new(),
        }
    }

    /// `sh -c <script>` inside the container.
    pub fn shell(container: impl Into<String>, script: impl Into<String>) -> Self {
        Self::new(container, vec!["sh".to_string(), "-c".to_string(), script.into()])
    }

    pub fn workdir(mut self, dir: impl Into<String>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Common container images.
pub struct CommonImages;

impl CommonImages {
    pub const NODE: &'static str = "node:20-alpine";
    pub const PYTHON: &'static str = "python:3.12-slim";
    pub const GO: &'static str = "golang:1.22-alpine";
    pub const RUST: &'static str = "rust:1.75-slim";
    pub const JAVA: &'static str = "eclipse-temurin:21-jdk";
    pub const NGINX: &'static str = "nginx:alpine";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_spec_builder() {
        let spec = ContainerSpec::new("sandbay-u1-demo-t1", CommonImages::NODE)
            .workdir("/workspace")
            .env("PORT", "3000")
            .publish(41000, 3000)
            .mount(MountConfig::bind("/tmp/demo", "/workspace"));

        assert_eq!(spec.workdir.as_deref(), Some("/workspace"));
        assert_eq!(spec.env.get("PORT").map(String::as_str), Some("3000"));
        assert_eq!(spec.ports[0], PortMapping { host: 41000, container: 3000 });
        assert!(spec.no_new_privileges);
    }

    #[test]
    fn test_mount_specs() {
        let bind = MountConfig::bind("/host/path", "/container/path").read_only();
        assert_eq!(bind.to_spec(), "/host/path:/container/path:ro");

        let volume = MountConfig::volume("sandbay-vol", "/workspace");
        assert_eq!(volume.to_spec(), "sandbay-vol:/workspace");
    }

    #[test]
    fn test_limits_fingerprint_is_stable() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.fingerprint(), limits.clone().fingerprint());
        assert_ne!(limits.fingerprint(), ResourceLimits::unlimited().fingerprint());
    }

    #[test]
    fn test_exec_shell_request() {
        let req = ExecRequest::shell("c1", "ls -la").workdir("/workspace/src");
        assert_eq!(req.command, vec!["sh", "-c", "ls -la"]);
        assert_eq!(req.workdir.as_deref(), Some("/workspace/src"));
    }
}
