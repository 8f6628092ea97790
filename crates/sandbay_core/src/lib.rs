//! # sandbay_core
//!
//! Session orchestration engine: per-user ephemeral containers that run
//! untrusted project code and serve its web output.
//!
//! ## Architecture
//!
//! ```text
//!                  SessionService (structured results)
//!                               |
//!                         SessionManager
//!      open/close/validate | execute | web server | recovery
//!          |                 |             |               |
//!   SessionStore       LogicalShell   ProjectStore   ContainerRuntime
//!   + SnapshotFile     (cwd probe)    (file records) (sandbay_runner)
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sandbay_core::{connect_runtime, CommandRequest, DirectoryStore, EngineConfig, SessionManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::from_env();
//!     let runtime = connect_runtime(&config).await?;
//!     let store = Arc::new(DirectoryStore::new(&config.store_root));
//!     let manager = SessionManager::new(config, runtime, store);
//!
//!     manager.open("t1", "demo", "user-1").await?;
//!     let outcome = manager.execute(&CommandRequest::new("t1", "mkdir sub && cd sub && pwd")).await?;
//!     println!("{} -> {}", outcome.exit_code, outcome.cwd);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod exec;
pub mod materialize;
pub mod persistence;
pub mod pool;
pub mod recovery;
pub mod session;
pub mod shell;
pub mod store;
pub mod web;
pub mod webserver;

pub use api::{ApiError, ApiResponse, SessionService};
pub use config::{EngineConfig, RuntimeBackend, StorageMode, WebPortPolicy};
pub use engine::{connect_runtime, SessionManager, SessionStatus};
pub use error::{EngineError, EngineResult};
pub use events::{EventBus, SessionEvent};
pub use exec::{CommandOutcome, CommandRequest};
pub use persistence::{Snapshot, SnapshotFile};
pub use pool::{PoolKey, WarmPool};
pub use recovery::FileSyncReport;
pub use session::{Session, SessionGuard, SessionStorage, SessionStore};
pub use shell::{LogicalShell, Step, WORKSPACE_ROOT};
pub use store::{DirectoryStore, FileKind, FileRecord, MemoryStore, ProjectRecord, ProjectStore};
pub use web::SiteKind;
pub use webserver::WebServerInfo;
