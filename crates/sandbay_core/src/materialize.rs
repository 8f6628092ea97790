//! Materialization of project records into directories and volumes, and
//! capture of session content back into records.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use sandbay_runner::{shell_quote, ContainerRuntime, ExecRequest};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{EngineError, EngineResult};
use crate::shell::WORKSPACE_ROOT;
use crate::store::{FileKind, FileRecord};

/// Files larger than this are not synced back to the store.
pub const MAX_SYNC_BYTES: u64 = 1024 * 1024;

/// Directories never synced back to the store.
pub const SKIPPED_DIRS: &[&str] = &["node_modules", ".git"];

/// Page seeded into an empty default project directory.
pub const PLACEHOLDER_INDEX: &str = "<!DOCTYPE html>
<html>
  <head><meta charset=\"utf-8\"><title>New project</title></head>
  <body><h1>It works</h1><p>Edit index.html to get started.</p></body>
</html>
";

/// Validate a store path and turn it into a relative filesystem path.
///
/// Absolute paths and any `..` component are rejected.
pub fn safe_relative(path: &str) -> Option<PathBuf> {
    let trimmed = path.trim_start_matches("./");
    if trimmed.is_empty() {
        return None;
    }
    let candidate = Path::new(trimmed);
    let mut out = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

/// `path` relative to `base` with `/` separators.
pub fn relative_path(base: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    let parts: Vec<_> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Write one record below `dir`, creating parents. Returns the bytes on disk.
pub async fn write_file(dir: &Path, record: &FileRecord) -> EngineResult<u64> {
    let relative = safe_relative(&record.path)
        .ok_or_else(|| EngineError::Store(format!("unsafe path: {}", record.path)))?;
    let target = dir.join(relative);

    if record.kind == FileKind::Folder {
        tokio::fs::create_dir_all(&target).await?;
        return Ok(0);
    }
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&target, record.content.as_bytes()).await?;
    Ok(tokio::fs::metadata(&target).await?.len())
}

/// Write every record below `dir`. Unsafe paths are skipped.
pub async fn write_records(dir: &Path, files: &[FileRecord]) -> EngineResult<usize> {
    tokio::fs::create_dir_all(dir).await?;
    let mut written = 0;
    for record in files {
        if safe_relative(&record.path).is_none() {
            warn!("Skipping unsafe path {:?}", record.path);
            continue;
        }
        write_file(dir, record).await?;
        written += 1;
    }
    debug!("Materialized {} records into {}", written, dir.display());
    Ok(written)
}

/// Remove a record's path below `dir`; missing paths are ignored.
pub async fn remove_path(dir: &Path, path: &str) -> EngineResult<()> {
    let Some(relative) = safe_relative(path) else {
        return Ok(());
    };
    let target = dir.join(relative);
    let result = if target.is_dir() {
        tokio::fs::remove_dir_all(&target).await
    } else {
        tokio::fs::remove_file(&target).await
    };
    match result {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// Seed a placeholder index page if `dir` is empty.
pub async fn seed_placeholder(dir: &Path) -> EngineResult<bool> {
    tokio::fs::create_dir_all(dir).await?;
    let mut entries = tokio::fs::read_dir(dir).await?;
    if entries.next_entry().await?.is_some() {
        return Ok(false);
    }
    tokio::fs::write(dir.join("index.html"), PLACEHOLDER_INDEX).await?;
    Ok(true)
}

fn is_skipped(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map(|n| SKIPPED_DIRS.contains(&n))
            .unwrap_or(false)
}

/// Project-relative file paths below `dir`.
pub fn list_paths(dir: &Path) -> Vec<String> {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_skipped(e))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| relative_path(dir, e.path()))
        .collect()
}

/// Session content captured for sync-back.
///
/// `skipped` lists paths the capture saw but left out: oversized files and
/// files that are not UTF-8 text. Those paths, and anything below a skipped
/// directory, are never removed from the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capture {
    pub records: Vec<FileRecord>,
    pub skipped: Vec<String>,
}

impl Capture {
    fn skip(&mut self, path: String, reason: &str) {
        debug!("Not syncing {} ({})", path, reason);
        self.skipped.push(path);
    }

    /// Whether `path` is outside what this capture speaks for.
    pub fn is_skipped(&self, path: &str) -> bool {
        path.split('/').any(|part| SKIPPED_DIRS.contains(&part))
            || self
                .skipped
                .iter()
                .any(|s| path == s || path.starts_with(&format!("{}/", s)))
    }

    /// Store paths the session no longer has.
    pub fn removals(&self, existing: &[FileRecord]) -> Vec<String> {
        let captured: HashSet<&str> = self.records.iter().map(|r| r.path.as_str()).collect();
        existing
            .iter()
            .filter(|r| !captured.contains(r.path.as_str()) && !self.is_skipped(&r.path))
            .map(|r| r.path.clone())
            .collect()
    }
}

/// Capture the content of `dir` as store records.
pub fn capture_dir(dir: &Path) -> EngineResult<Capture> {
    let mut capture = Capture::default();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_skipped(e))
    {
        let entry = entry.map_err(|e| EngineError::Store(e.to_string()))?;
        let Some(path) = relative_path(dir, entry.path()) else {
            continue;
        };
        if entry.file_type().is_dir() {
            capture.records.push(FileRecord::folder(path));
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if size > MAX_SYNC_BYTES {
            capture.skip(path, "too large");
            continue;
        }
        match String::from_utf8(std::fs::read(entry.path())?) {
            Ok(content) => capture.records.push(FileRecord::file(path, content)),
            Err(_) => capture.skip(path, "not text"),
        }
    }
    Ok(capture)
}

fn container_path(path: &str) -> Option<String> {
    let relative = safe_relative(path)?;
    let relative = relative.to_string_lossy().replace('\\', "/");
    Some(format!("{}/{}", WORKSPACE_ROOT, relative))
}

/// Push records into a running container's workspace.
pub async fn push_records(
    runtime: &dyn ContainerRuntime,
    container: &str,
    files: &[FileRecord],
) -> EngineResult<usize> {
    let mut pushed = 0;
    for record in files {
        let Some(target) = container_path(&record.path) else {
            warn!("Skipping unsafe path {:?}", record.path);
            continue;
        };
        match record.kind {
            FileKind::Folder => {
                let script = format!("mkdir -p {}", shell_quote(&target));
                let result = runtime.exec(&ExecRequest::shell(container, script)).await?;
                if !result.success() {
                    return Err(EngineError::Store(format!(
                        "mkdir {} failed: {}",
                        target,
                        result.combined_output().trim()
                    )));
                }
            }
            FileKind::File => {
                runtime
                    .copy_into(container, &target, record.content.as_bytes())
                    .await?;
            }
        }
        pushed += 1;
    }
    debug!("Pushed {} records into {}", pushed, container);
    Ok(pushed)
}

/// Write one record into a running container.
pub async fn push_file(
    runtime: &dyn ContainerRuntime,
    container: &str,
    record: &FileRecord,
) -> EngineResult<()> {
    push_records(runtime, container, std::slice::from_ref(record))
        .await
        .map(|_| ())
}

/// Size filters for `find`, in 512-byte blocks around `MAX_SYNC_BYTES`.
const SMALL_FILES: &str = "f -size -2049";
const LARGE_FILES: &str = "f -size +2048";

fn find_script(kind: &str) -> String {
    let prune = SKIPPED_DIRS
        .iter()
        .map(|d| format!("-name {}", shell_quote(d)))
        .collect::<Vec<_>>()
        .join(" -o ");
    format!(
        "cd {} && find . -mindepth 1 \\( {} \\) -prune -o -type {} -print",
        WORKSPACE_ROOT, prune, kind
    )
}

async fn find_in_container(
    runtime: &dyn ContainerRuntime,
    container: &str,
    kind: &str,
) -> EngineResult<Vec<String>> {
    let result = runtime
        .exec(&ExecRequest::shell(container, find_script(kind)))
        .await?;
    if !result.success() {
        return Err(EngineError::Store(format!(
            "listing {} failed: {}",
            container,
            result.combined_output().trim()
        )));
    }
    let mut paths: Vec<String> = result
        .stdout
        .lines()
        .map(|l| l.trim_start_matches("./").to_string())
        .filter(|l| !l.is_empty())
        .collect();
    paths.sort();
    Ok(paths)
}

/// Project-relative file paths inside a container's workspace.
pub async fn list_container_paths(
    runtime: &dyn ContainerRuntime,
    container: &str,
) -> EngineResult<Vec<String>> {
    find_in_container(runtime, container, SMALL_FILES).await
}

/// Capture a container's workspace as store records.
///
/// Output that did not decode cleanly is treated as binary and skipped.
pub async fn capture_container(
    runtime: &dyn ContainerRuntime,
    container: &str,
) -> EngineResult<Capture> {
    let mut capture = Capture {
        records: find_in_container(runtime, container, "d")
            .await?
            .into_iter()
            .map(FileRecord::folder)
            .collect(),
        skipped: Vec::new(),
    };

    for path in find_in_container(runtime, container, LARGE_FILES).await? {
        capture.skip(path, "too large");
    }
    for path in find_in_container(runtime, container, SMALL_FILES).await? {
        let Some(target) = container_path(&path) else {
            continue;
        };
        let result = runtime
            .exec(&ExecRequest::shell(
                container,
                format!("cat -- {}", shell_quote(&target)),
            ))
            .await?;
        if !result.success() || result.stdout.len() as u64 > MAX_SYNC_BYTES {
            capture.skip(path, "unreadable");
            continue;
        }
        if result.stdout.contains(char::REPLACEMENT_CHARACTER) {
            capture.skip(path, "not text");
            continue;
        }
        capture.records.push(FileRecord::file(path, result.stdout));
    }

    capture.records.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(capture)
}
