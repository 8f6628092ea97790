//! Snapshot persistence.
//!
//! The whole session registry is written to a single JSON file after every
//! mutation and read back once at startup:
//!
//! ```text
//! <state_dir>/sessions.json
//! {
//!   "version": 1,
//!   "savedAt": "2024-01-01T00:00:00Z",
//!   "sessions": [["t1", { ...session... }]],
//!   "containerIndex": [["sandbay-u1-demo-t1", "t1"]]
//! }
//! ```
//!
//! Writes go to a temporary sibling file which is then renamed over the
//! snapshot, so a crash mid-save leaves the previous snapshot intact.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::session::{Session, SessionStore};

const SNAPSHOT_VERSION: u32 = 1;

/// Serialized registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub sessions: Vec<(String, Session)>,
    #[serde(default)]
    pub container_index: Vec<(String, String)>,
}

impl Snapshot {
    /// Capture the current registry.
    pub fn capture(store: &SessionStore) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            sessions: store
                .list()
                .into_iter()
                .map(|s| (s.session_id.clone(), s))
                .collect(),
            container_index: store.container_index(),
        }
    }
}

/// Snapshot file with serialized, atomic writes.
#[derive(Debug)]
pub struct SnapshotFile {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl SnapshotFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically replace the snapshot on disk.
    pub async fn save(&self, snapshot: &Snapshot) -> EngineResult<()> {
        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(
            "Saved {} sessions to {}",
            snapshot.sessions.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Read the snapshot; a missing file is `None`.
    pub async fn load(&self) -> EngineResult<Option<Snapshot>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let snapshot: Snapshot = serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::Snapshot(format!("{}: {}", self.path.display(), e)))?;
        if snapshot.version > SNAPSHOT_VERSION {
            return Err(EngineError::Snapshot(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        Ok(Some(snapshot))
    }
}
