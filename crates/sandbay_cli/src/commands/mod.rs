//! CLI command definitions.
//!
//! Each subcommand maps to one session operation. Sessions outlive a single
//! invocation: every command restores the registry from the snapshot before
//! it runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::debug;

use sandbay_core::{connect_runtime, DirectoryStore, EngineConfig, SessionManager};
use sandbay_runner::ContainerRuntime;

pub mod close;
pub mod exec;
pub mod logs;
pub mod notify;
pub mod open;
pub mod run;
pub mod sessions;
pub mod validate;
pub mod web;

/// sandbay - per-user ephemeral container sessions
#[derive(Parser)]
#[command(name = "sandbay")]
#[command(version, about = "sandbay - per-user ephemeral container sessions")]
#[command(long_about = r#"
sandbay gives every client session its own container: project files are
materialized into it, shell commands run inside it with a persistent
working directory, and its web output is served from a companion
static-server container.

OPERATIONS:
  open      -> Open (or reuse) a session for a project
  exec      -> Run a command line in a session
  web       -> Start or stop a session's web server
  close     -> Close sessions and release their containers
  validate  -> Report whether a session is live
  notify    -> Push a changed project file into live sessions
  logs      -> Show a session container's logs
  sessions  -> List known sessions
  run       -> Run commands in a warm pooled container

EXIT CODES:
  0 - Success
  1 - General error
  2 - Invalid arguments or unknown session
  3 - Container runtime unavailable
  4 - Port conflict
"#)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Engine configuration file (TOML)
    #[arg(short, long, global = true, env = "SANDBAY_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Open a session for a project
    Open(open::OpenArgs),

    /// Run a command line in a session
    Exec(exec::ExecArgs),

    /// Start or stop a session's web server
    Web(web::WebArgs),

    /// Close a session, or all sessions of an owner or project
    Close(close::CloseArgs),

    /// Report a session's liveness
    Validate(validate::ValidateArgs),

    /// Push a changed project file into live sessions
    Notify(notify::NotifyArgs),

    /// Show a session container's logs
    Logs(logs::LogsArgs),

    /// List sessions
    Sessions(sessions::SessionsArgs),

    /// Run commands in a warm pooled container
    Run(run::RunArgs),
}

/// Settings shared by every command.
pub struct Context {
    pub config: EngineConfig,
    pub json: bool,
}

impl Context {
    pub fn load(path: Option<&Path>, json: bool) -> Result<Self> {
        let config = match path {
            Some(path) => EngineConfig::load(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => {
                let config = EngineConfig::from_env();
                config.validate()?;
                config
            }
        };
        Ok(Self { config, json })
    }

    pub async fn runtime(&self) -> Result<Arc<dyn ContainerRuntime>> {
        let runtime = connect_runtime(&self.config)
            .await
            .context("connecting to container runtime")?;
        Ok(runtime)
    }

    /// Engine over the directory store, with the saved sessions restored.
    pub async fn manager(&self) -> Result<SessionManager> {
        let runtime = self.runtime().await?;
        let store = Arc::new(DirectoryStore::new(&self.config.store_root));
        let manager = SessionManager::new(self.config.clone(), runtime, store);
        let restored = manager.load_snapshot().await?;
        debug!("Restored {} sessions", restored);
        Ok(manager)
    }

    /// Print `value` as JSON when requested, otherwise run `human`.
    pub fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce(&T)) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            human(value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_loads_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandbay.toml");
        std::fs::write(&path, "container_port = 8080\ncap_drop = [\"NET_RAW\"]\n").unwrap();

        let context = Context::load(Some(&path), true).unwrap();
        assert_eq!(context.config.container_port, 8080);
        assert_eq!(context.config.cap_drop, vec!["NET_RAW"]);
        assert!(context.json);
    }

    #[test]
    fn test_context_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandbay.toml");
        std::fs::write(&path, "container_port = 0\n").unwrap();

        let err = Context::load(Some(&path), false).err().unwrap();
        assert!(format!("{:#}", err).contains("loading config"));
        assert!(err.downcast_ref::<sandbay_core::EngineError>().is_some());
    }
}
