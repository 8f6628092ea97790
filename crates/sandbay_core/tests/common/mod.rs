//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use sandbay_core::shell::PWD_SENTINEL;
use sandbay_core::{EngineConfig, MemoryStore, SessionEvent, SessionManager};
use sandbay_runner::{ExecHandler, ExecRequest, ExecutionResult, MockRuntime};
use tempfile::TempDir;
use tokio::sync::broadcast;

/// Engine wired to a mock runtime and an in-memory store.
pub struct Harness {
    pub runtime: MockRuntime,
    pub store: Arc<MemoryStore>,
    pub manager: Arc<SessionManager>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(configure: impl FnOnce(&mut EngineConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig {
            state_dir: dir.path().join("state"),
            workspaces_root: dir.path().join("workspaces"),
            temp_root: dir.path().join("tmp"),
            store_root: dir.path().join("projects"),
            ..Default::default()
        };
        configure(&mut config);

        let runtime = MockRuntime::new();
        runtime.set_exec_handler(fake_shell());
        let store = Arc::new(MemoryStore::new());
        let manager = Arc::new(SessionManager::new(
            config,
            Arc::new(runtime.clone()),
            store.clone(),
        ));

        Self {
            runtime,
            store,
            manager,
            dir,
        }
    }

    /// A second engine over the same state directory and runtime.
    pub fn restart(&self) -> SessionManager {
        SessionManager::new(
            self.manager.config().clone(),
            Arc::new(self.runtime.clone()),
            self.store.clone(),
        )
    }

    /// Running containers whose name starts with `prefix`.
    pub fn running_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.runtime
            .running_containers()
            .into_iter()
            .filter(|n| n.starts_with(prefix))
            .collect()
    }
}

/// Minimal stand-in for `sh -c` inside a container.
///
/// Understands `pwd`, `echo`, `false` and `exit N`, and answers the working
/// directory probe with the exec's working directory.
pub fn fake_shell() -> ExecHandler {
    Arc::new(|request: &ExecRequest| {
        let script = request.command.last().cloned().unwrap_or_default();
        let cwd = request.workdir.clone().unwrap_or_else(|| "/".to_string());
        let Some((user, _)) = script.split_once("\n__sandbay_rc=") else {
            return ExecutionResult::default();
        };

        let mut stdout = String::new();
        let mut exit_code = 0;
        let mut words = user.split_whitespace();
        match words.next() {
            Some("pwd") => stdout.push_str(&format!("{}\n", cwd)),
            Some("echo") => {
                let rest: Vec<&str> = words.collect();
                stdout.push_str(&format!("{}\n", rest.join(" ")));
            }
            Some("false") => exit_code = 1,
            Some("exit") => exit_code = words.next().and_then(|c| c.parse().ok()).unwrap_or(0),
            _ => {}
        }
        stdout.push_str(&format!("\n{}{}\n", PWD_SENTINEL, cwd));

        ExecutionResult {
            exit_code,
            stdout,
            ..Default::default()
        }
    })
}

/// Every event received so far.
pub fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Number of events with the given name.
pub fn count(events: &[SessionEvent], name: &str) -> usize {
    events.iter().filter(|e| e.name() == name).count()
}
