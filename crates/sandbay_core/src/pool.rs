//! Warm container pool for one-shot runs.
//!
//! Unlike sessions, pool containers are shared across independent runs of
//! the same image, source directory and limits. One container per key is
//! kept alive until it has been idle longer than the configured TTL.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sandbay_runner::{
    naming, ContainerRuntime, ContainerSpec, ExecRequest, ExecutionResult, MountConfig,
    ResourceLimits,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::EngineResult;
use crate::shell::WORKSPACE_ROOT;

/// Identity of a pooled container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub image: String,
    pub source_dir: PathBuf,
    /// [`ResourceLimits::fingerprint`]
    pub limits: String,
}

impl PoolKey {
    pub fn new(image: &str, source_dir: &Path, limits: &ResourceLimits) -> Self {
        Self {
            image: image.to_string(),
            source_dir: source_dir.to_path_buf(),
            limits: limits.fingerprint(),
        }
    }

    /// Container name derived from the key.
    pub fn container_name(&self) -> String {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        format!("{}-pool-{:016x}", naming::NAME_PREFIX, hasher.finish())
    }
}

#[derive(Debug, Clone)]
struct PoolEntry {
    container: String,
    last_used: Instant,
}

/// Keyed cache of long-lived containers.
pub struct WarmPool {
    runtime: Arc<dyn ContainerRuntime>,
    idle_ttl: Duration,
    entries: Mutex<HashMap<PoolKey, PoolEntry>>,
}

impl WarmPool {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, idle_ttl: Duration) -> Self {
        Self {
            runtime,
            idle_ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Run `command` in the pooled container for the key, creating it if needed.
    pub async fn run(
        &self,
        image: &str,
        source_dir: &Path,
        limits: &ResourceLimits,
        command: &str,
    ) -> EngineResult<ExecutionResult> {
        let key = PoolKey::new(image, source_dir, limits);

        let container = {
            let mut entries = self.entries.lock().await;
            let container = self.acquire(&mut entries, &key, limits).await?;
            entries.insert(
                key.clone(),
                PoolEntry {
                    container: container.clone(),
                    last_used: Instant::now(),
                },
            );
            container
        };

        let request = ExecRequest::shell(&container, command).workdir(WORKSPACE_ROOT);
        let result = self.runtime.exec(&request).await?;

        if let Some(entry) = self.entries.lock().await.get_mut(&key) {
            entry.last_used = Instant::now();
        }
        Ok(result)
    }

    async fn acquire(
        &self,
        entries: &mut HashMap<PoolKey, PoolEntry>,
        key: &PoolKey,
        limits: &ResourceLimits,
    ) -> EngineResult<String> {
        if let Some(entry) = entries.get(key) {
            if self.runtime.is_running(&entry.container).await? {
                debug!("Reusing pooled container {}", entry.container);
                return Ok(entry.container.clone());
            }
            warn!("Pooled container {} died; replacing", entry.container);
            entries.remove(key);
        }

        let name = key.container_name();
        if self.runtime.container_exists(&name).await? {
            self.runtime.remove_container(&name).await?;
        }
        if !self.runtime.image_exists(&key.image).await? {
            self.runtime.pull_image(&key.image, None).await?;
        }

        let spec = ContainerSpec::new(&name, &key.image)
            .command(vec!["tail".into(), "-f".into(), "/dev/null".into()])
            .workdir(WORKSPACE_ROOT)
            .label("sandbay.role", "pool")
            .mount(MountConfig::bind(&key.source_dir, WORKSPACE_ROOT))
            .limits(limits.clone());
        self.runtime.create_container(&spec).await?;

        info!("Created pooled container {} for {}", name, key.image);
        Ok(name)
    }

    /// Remove entries idle longer than the TTL. Returns the removed containers.
    pub async fn evict_idle(&self) -> Vec<String> {
        let mut entries = self.entries.lock().await;
        let expired: Vec<PoolKey> = entries
            .iter()
            .filter(|(_, e)| e.last_used.elapsed() >= self.idle_ttl)
            .map(|(k, _)| k.clone())
            .collect();

        let mut removed = Vec::new();
        for key in expired {
            if let Some(entry) = entries.remove(&key) {
                self.remove(&entry.container).await;
                removed.push(entry.container);
            }
        }
        removed
    }

    /// Remove every pooled container.
    pub async fn drain(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let count = entries.len();
        for (_, entry) in entries.drain() {
            self.remove(&entry.container).await;
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn remove(&self, container: &str) {
        if let Err(e) = self.runtime.remove_container(container).await {
            warn!("Failed to remove pooled container {}: {}", container, e);
        } else {
            debug!("Evicted pooled container {}", container);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbay_runner::MockRuntime;

    fn pool(runtime: &MockRuntime, ttl: Duration) -> WarmPool {
        WarmPool::new(Arc::new(runtime.clone()), ttl)
    }

    #[tokio::test]
    async fn test_reuses_container_per_key() {
        let runtime = MockRuntime::new();
        let pool = pool(&runtime, Duration::from_secs(60));
        let limits = ResourceLimits::default();

        pool.run("node:20-alpine", Path::new("/src/a"), &limits, "node -v")
            .await
            .unwrap();
        pool.run("node:20-alpine", Path::new("/src/a"), &limits, "node x.js")
            .await
            .unwrap();
        pool.run("node:20-alpine", Path::new("/src/b"), &limits, "node -v")
            .await
            .unwrap();

        assert_eq!(runtime.get_method_calls("create_container").len(), 2);
        assert_eq!(pool.len().await, 2);
    }

    #[tokio::test]
    async fn test_replaces_dead_container() {
        let runtime = MockRuntime::new();
        let pool = pool(&runtime, Duration::from_secs(60));
        let limits = ResourceLimits::default();
        let key = PoolKey::new("python:3.12-slim", Path::new("/src"), &limits);

        pool.run("python:3.12-slim", Path::new("/src"), &limits, "true")
            .await
            .unwrap();
        runtime.kill(&key.container_name());
        pool.run("python:3.12-slim", Path::new("/src"), &limits, "true")
            .await
            .unwrap();

        assert_eq!(runtime.get_method_calls("create_container").len(), 2);
        assert!(runtime.container(&key.container_name()).is_some());
    }

    #[tokio::test]
    async fn test_evict_idle_and_drain() {
        let runtime = MockRuntime::new();
        let limits = ResourceLimits::default();

        let idle = pool(&runtime, Duration::ZERO);
        idle.run("node:20-alpine", Path::new("/a"), &limits, "true")
            .await
            .unwrap();
        let evicted = idle.evict_idle().await;
        assert_eq!(evicted.len(), 1);
        assert!(idle.is_empty().await);
        assert!(runtime.running_containers().is_empty());

        let busy = pool(&runtime, Duration::from_secs(3600));
        busy.run("node:20-alpine", Path::new("/a"), &limits, "true")
            .await
            .unwrap();
        assert!(busy.evict_idle().await.is_empty());
        assert_eq!(busy.drain().await, 1);
        assert!(runtime.running_containers().is_empty());
    }

    #[test]
    fn test_key_includes_limits() {
        let a = PoolKey::new("img", Path::new("/s"), &ResourceLimits::default());
        let b = PoolKey::new("img", Path::new("/s"), &ResourceLimits::unlimited());
        assert_ne!(a.container_name(), b.container_name());
        assert!(a.container_name().starts_with("sandbay-pool-"));
    }
}
