//! Project store abstraction.
//!
//! The engine never owns project content: it reads file records from a
//! [`ProjectStore`] to materialize a session and writes them back after a
//! filesystem-mutating command.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{EngineError, EngineResult};
use crate::materialize::{relative_path, remove_path, safe_relative, write_records};

/// Kind of a stored file record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Folder,
}

/// A single file or folder of a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Project-relative path using `/` separators
    pub path: String,
    pub kind: FileKind,
    pub content: String,
    /// Size in bytes the content is expected to have
    pub size: u64,
}

impl FileRecord {
    pub fn file(path: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            path: path.into(),
            kind: FileKind::File,
            size: content.len() as u64,
            content,
        }
    }

    pub fn folder(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: FileKind::Folder,
            content: String::new(),
            size: 0,
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }
}

/// Identity of a stored project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: String,
    pub name: String,
    pub owner_id: String,
}

/// External source of project content.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Look up a project by owner and name.
    async fn find_project(&self, owner_id: &str, name: &str)
        -> EngineResult<Option<ProjectRecord>>;

    /// All file and folder records of a project.
    async fn list_files(&self, project: &ProjectRecord) -> EngineResult<Vec<FileRecord>>;

    /// A single record by project-relative path.
    async fn get_file(&self, project: &ProjectRecord, path: &str)
        -> EngineResult<Option<FileRecord>>;

    /// Write `upserts` and delete `removals` (and anything below them).
    /// Paths in neither list are left untouched.
    async fn apply_changes(
        &self,
        project: &ProjectRecord,
        upserts: Vec<FileRecord>,
        removals: Vec<String>,
    ) -> EngineResult<()>;
}

/// Store backed by a host directory tree `<root>/<owner>/<project>/...`.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn project_dir(&self, project: &ProjectRecord) -> PathBuf {
        self.root.join(&project.owner_id).join(&project.name)
    }
}

/// Text record for `bytes`; files that are not UTF-8 are not exposed.
fn text_record(path: String, bytes: Vec<u8>) -> Option<FileRecord> {
    match String::from_utf8(bytes) {
        Ok(content) => Some(FileRecord::file(path, content)),
        Err(_) => {
            debug!("Skipping non-text file {}", path);
            None
        }
    }
}

#[async_trait]
impl ProjectStore for DirectoryStore {
    async fn find_project(
        &self,
        owner_id: &str,
        name: &str,
    ) -> EngineResult<Option<ProjectRecord>> {
        if safe_relative(owner_id).is_none() || safe_relative(name).is_none() {
            return Ok(None);
        }
        let dir = self.root.join(owner_id).join(name);
        if !dir.is_dir() {
            return Ok(None);
        }
        Ok(Some(ProjectRecord {
            id: format!("{}/{}", owner_id, name),
            name: name.to_string(),
            owner_id: owner_id.to_string(),
        }))
    }

    async fn list_files(&self, project: &ProjectRecord) -> EngineResult<Vec<FileRecord>> {
        let dir = self.project_dir(project);
        let mut records = Vec::new();

        for entry in WalkDir::new(&dir).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| EngineError::Store(e.to_string()))?;
            let Some(path) = relative_path(&dir, entry.path()) else {
                continue;
            };
            if entry.file_type().is_dir() {
                records.push(FileRecord::folder(path));
            } else if entry.file_type().is_file() {
                records.extend(text_record(path, std::fs::read(entry.path())?));
            }
        }

        Ok(records)
    }

    async fn get_file(
        &self,
        project: &ProjectRecord,
        path: &str,
    ) -> EngineResult<Option<FileRecord>> {
        let Some(relative) = safe_relative(path) else {
            return Ok(None);
        };
        let full = self.project_dir(project).join(relative);
        if full.is_dir() {
            return Ok(Some(FileRecord::folder(path)));
        }
        match std::fs::read(&full) {
            Ok(bytes) => Ok(text_record(path.to_string(), bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_changes(
        &self,
        project: &ProjectRecord,
        upserts: Vec<FileRecord>,
        removals: Vec<String>,
    ) -> EngineResult<()> {
        let dir = self.project_dir(project);
        tokio::fs::create_dir_all(&dir).await?;

        for path in &removals {
            debug!("Removing {} from project {}", path, project.id);
            remove_path(&dir, path).await?;
        }
        // A path that changed between file and folder is replaced
        for record in &upserts {
            if let Some(relative) = safe_relative(&record.path) {
                let on_disk = dir.join(relative);
                if on_disk.exists() && on_disk.is_dir() != (record.kind == FileKind::Folder) {
                    remove_path(&dir, &record.path).await?;
                }
            }
        }

        write_records(&dir, &upserts).await?;
        Ok(())
    }
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    projects: RwLock<HashMap<String, (ProjectRecord, BTreeMap<String, FileRecord>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(owner_id: &str, name: &str) -> String {
        format!("{}/{}", owner_id, name)
    }

    /// Create or replace a project with `files`.
    pub fn insert_project(
        &self,
        owner_id: &str,
        name: &str,
        files: Vec<FileRecord>,
    ) -> ProjectRecord {
        let record = ProjectRecord {
            id: Self::key(owner_id, name),
            name: name.to_string(),
            owner_id: owner_id.to_string(),
        };
        let files = files.into_iter().map(|f| (f.path.clone(), f)).collect();
        self.projects
            .write()
            .insert(record.id.clone(), (record.clone(), files));
        record
    }

    /// Create or overwrite a single record.
    pub fn set_file(&self, owner_id: &str, name: &str, file: FileRecord) {
        if let Some((_, files)) = self.projects.write().get_mut(&Self::key(owner_id, name)) {
            files.insert(file.path.clone(), file);
        }
    }

    /// Current records of a project.
    pub fn files(&self, owner_id: &str, name: &str) -> Vec<FileRecord> {
        self.projects
            .read()
            .get(&Self::key(owner_id, name))
            .map(|(_, files)| files.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn find_project(
        &self,
        owner_id: &str,
        name: &str,
    ) -> EngineResult<Option<ProjectRecord>> {
        Ok(self
            .projects
            .read()
            .get(&Self::key(owner_id, name))
            .map(|(record, _)| record.clone()))
    }

    async fn list_files(&self, project: &ProjectRecord) -> EngineResult<Vec<FileRecord>> {
        self.projects
            .read()
            .get(&project.id)
            .map(|(_, files)| files.values().cloned().collect())
            .ok_or_else(|| EngineError::Store(format!("unknown project {}", project.id)))
    }

    async fn get_file(
        &self,
        project: &ProjectRecord,
        path: &str,
    ) -> EngineResult<Option<FileRecord>> {
        Ok(self
            .projects
            .read()
            .get(&project.id)
            .and_then(|(_, files)| files.get(path).cloned()))
    }

    async fn apply_changes(
        &self,
        project: &ProjectRecord,
        upserts: Vec<FileRecord>,
        removals: Vec<String>,
    ) -> EngineResult<()> {
        let mut projects = self.projects.write();
        let (_, existing) = projects
            .get_mut(&project.id)
            .ok_or_else(|| EngineError::Store(format!("unknown project {}", project.id)))?;
        for removed in &removals {
            let below = format!("{}/", removed);
            existing.retain(|path, _| path != removed && !path.starts_with(&below));
        }
        existing.extend(upserts.into_iter().map(|f| (f.path.clone(), f)));
        Ok(())
    }
}
