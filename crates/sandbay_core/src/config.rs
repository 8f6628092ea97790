//! Engine configuration.
//!
//! Configuration is read from an optional TOML file and then overridden by
//! `SANDBAY_*` environment variables.

use std::path::{Path, PathBuf};

use sandbay_runner::{CommonImages, ResourceLimits, RuntimeKind};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Where a session's project content lives while the session is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMode {
    /// Materialize into an ephemeral host directory bind-mounted into the container
    TempDir,
    /// Push files into a runtime-managed named volume after the container starts
    Volume,
}

/// How the engine talks to the container runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeBackend {
    /// Invoke the docker/podman CLI
    Cli,
    /// Talk to the Docker Engine API directly
    Api,
}

/// Host port selection for web-server containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum WebPortPolicy {
    /// Each session gets its own OS-assigned port, kept across re-provisioning
    Dedicated,
    /// Every session publishes on the same port; only one preview can be live
    Fixed { port: u16 },
}

impl std::str::FromStr for StorageMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "temp-dir" | "tempdir" | "temp" => Ok(Self::TempDir),
            "volume" => Ok(Self::Volume),
            other => Err(format!("unknown storage mode: {}", other)),
        }
    }
}

impl std::str::FromStr for RuntimeBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cli" => Ok(Self::Cli),
            "api" => Ok(Self::Api),
            other => Err(format!("unknown runtime backend: {}", other)),
        }
    }
}

/// Configuration for the session engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Snapshot file and generated web-server configs
    pub state_dir: PathBuf,
    /// Default per-project directories for projects unknown to the store
    pub workspaces_root: PathBuf,
    /// Parent of ephemeral session directories
    pub temp_root: PathBuf,
    /// Root of the directory-backed project store
    pub store_root: PathBuf,
    pub storage: StorageMode,
    pub backend: RuntimeBackend,
    pub preferred_runtime: Option<RuntimeKind>,
    /// In-container port the session's dev server listens on
    pub container_port: u16,
    pub limits: ResourceLimits,
    pub cap_drop: Vec<String>,
    pub web_image: String,
    pub web_port: WebPortPolicy,
    /// Host used when building preview URLs
    pub public_host: String,
    /// Idle time after which warm-pool containers are evicted
    pub pool_idle_ttl_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let base = PathBuf::from(".sandbay");
        Self {
            state_dir: base.join("state"),
            workspaces_root: base.join("workspaces"),
            temp_root: std::env::temp_dir().join("sandbay-sessions"),
            store_root: base.join("projects"),
            storage: StorageMode::TempDir,
            backend: RuntimeBackend::Cli,
            preferred_runtime: None,
            container_port: 3000,
            limits: ResourceLimits::default(),
            cap_drop: vec!["NET_RAW".to_string(), "MKNOD".to_string()],
            web_image: CommonImages::NGINX.to_string(),
            web_port: WebPortPolicy::Dedicated,
            public_host: "localhost".to_string(),
            pool_idle_ttl_secs: 600,
        }
    }
}

impl EngineConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().apply_env()
    }

    /// Read a TOML file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| EngineError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        let config = config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `SANDBAY_*` environment variables.
    pub fn apply_env(mut self) -> Self {
        if let Ok(dir) = std::env::var("SANDBAY_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("SANDBAY_WORKSPACES_DIR") {
            self.workspaces_root = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("SANDBAY_TEMP_DIR") {
            self.temp_root = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("SANDBAY_STORE_DIR") {
            self.store_root = PathBuf::from(dir);
        }
        if let Ok(mode) = std::env::var("SANDBAY_STORAGE") {
            if let Ok(mode) = mode.parse() {
                self.storage = mode;
            }
        }
        if let Ok(backend) = std::env::var("SANDBAY_BACKEND") {
            if let Ok(backend) = backend.parse() {
                self.backend = backend;
            }
        }
        if let Ok(runtime) = std::env::var("SANDBAY_RUNTIME") {
            if let Ok(kind) = runtime.parse() {
                self.preferred_runtime = Some(kind);
            }
        }
        if let Ok(port) = std::env::var("SANDBAY_WEB_PORT") {
            self.web_port = match port.parse::<u16>() {
                Ok(port) if port != 0 => WebPortPolicy::Fixed { port },
                _ => WebPortPolicy::Dedicated,
            };
        }
        if let Ok(host) = std::env::var("SANDBAY_PUBLIC_HOST") {
            self.public_host = host;
        }
        if let Ok(ttl) = std::env::var("SANDBAY_POOL_TTL_SECS") {
            if let Ok(value) = ttl.parse() {
                self.pool_idle_ttl_secs = value;
            }
        }
        self
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> EngineResult<()> {
        if self.container_port == 0 {
            return Err(EngineError::InvalidConfig(
                "container_port must be non-zero".to_string(),
            ));
        }
        if let WebPortPolicy::Fixed { port: 0 } = self.web_port {
            return Err(EngineError::InvalidConfig(
                "fixed web port must be non-zero".to_string(),
            ));
        }
        if self.web_image.trim().is_empty() {
            return Err(EngineError::InvalidConfig("web_image is empty".to_string()));
        }
        Ok(())
    }

    /// Make directory settings absolute; bind mounts need absolute host paths.
    pub fn absolutize(mut self) -> Self {
        let Ok(cwd) = std::env::current_dir() else {
            return self;
        };
        for dir in [
            &mut self.state_dir,
            &mut self.workspaces_root,
            &mut self.temp_root,
            &mut self.store_root,
        ] {
            if dir.is_relative() {
                *dir = cwd.join(&*dir);
            }
        }
        self
    }

    /// Location of the persisted session snapshot.
    pub fn snapshot_path(&self) -> PathBuf {
        self.state_dir.join("sessions.json")
    }

    /// Directory holding generated web-server configs.
    pub fn web_config_dir(&self) -> PathBuf {
        self.state_dir.join("web")
    }

    /// Preview URL for a host port.
    pub fn preview_url(&self, port: u16) -> String {
        format!("http://{}:{}/", self.public_host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.container_port, 3000);
        assert_eq!(config.web_image, "nginx:alpine");
        assert_eq!(config.web_port, WebPortPolicy::Dedicated);
        assert_eq!(config.storage, StorageMode::TempDir);
        assert!(config.snapshot_path().ends_with("state/sessions.json"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sandbay.toml");
        std::fs::write(
            &path,
            r#"
storage = "volume"
backend = "api"
preferred_runtime = "podman"
public_host = "preview.local"

[web_port]
mode = "fixed"
port = 8080

[limits]
cpus = 0.5
"#,
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.storage, StorageMode::Volume);
        assert_eq!(config.backend, RuntimeBackend::Api);
        assert_eq!(config.preferred_runtime, Some(RuntimeKind::Podman));
        assert_eq!(config.web_port, WebPortPolicy::Fixed { port: 8080 });
        assert_eq!(config.limits.cpus, Some(0.5));
        assert_eq!(config.preview_url(8080), "http://preview.local:8080/");
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "container_port = \"x\"").unwrap();

        let err = EngineConfig::load(&path).unwrap_err();
        assert_eq!(err.kind(), "invalid_config");
    }

    #[test]
    fn test_absolutize() {
        let config = EngineConfig::default().absolutize();
        assert!(config.state_dir.is_absolute());
        assert!(config.workspaces_root.is_absolute());
        assert!(config.state_dir.ends_with(".sandbay/state"));
    }

    #[test]
    fn test_validate_fixed_zero() {
        let config = EngineConfig {
            web_port: WebPortPolicy::Fixed { port: 0 },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_modes() {
        assert_eq!("volume".parse::<StorageMode>().unwrap(), StorageMode::Volume);
        assert_eq!("temp-dir".parse::<StorageMode>().unwrap(), StorageMode::TempDir);
        assert_eq!("API".parse::<RuntimeBackend>().unwrap(), RuntimeBackend::Api);
        assert!("x".parse::<RuntimeBackend>().is_err());
    }
}
