//! Local filesystem backends.
//!
//! `WorkspaceFetcher` reads packages from a directory tree laid out by
//! normalized path (`<workspace>/github.com/dave/foo/*.go`). The stores keep
//! blobs, descriptors and the error log under a single data directory, and
//! publish every file with a rename so readers never see a partial write.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use axum::body::Bytes;
use compile_common::{ProgressMessage, ProgressSink, SourceReference};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use walkdir::WalkDir;

use super::{
    BlobStore, CacheEntry, ErrorRecord, FetchBudget, FetchLimits, MetadataStore, SourceBundle,
    SourceFetcher, has_valid_extension,
};
use crate::errors::{BackendError, BuildError};

/// Reads sources from a local workspace directory.
#[derive(Debug, Clone)]
pub struct WorkspaceFetcher {
    root: PathBuf,
    extensions: Vec<String>,
}

impl WorkspaceFetcher {
    pub fn new(root: PathBuf, extensions: Vec<String>) -> Self {
        Self { root, extensions }
    }

    fn package_dir(&self, reference: &SourceReference) -> Result<PathBuf, BuildError> {
        let relative = Path::new(reference.path());
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes || reference.path().is_empty() {
            return Err(BuildError::UnsupportedSource(format!(
                "invalid local path '{}'",
                reference.path()
            )));
        }
        Ok(self.root.join(relative))
    }
}

pub(super) fn read_package(
    dir: &Path,
    extensions: &[String],
    limits: FetchLimits,
    progress: &ProgressSink,
) -> Result<SourceBundle, BuildError> {
    if !dir.is_dir() {
        return Err(BuildError::FetchFailed(format!(
            "package not found: {}",
            dir.display()
        )));
    }

    let mut budget = FetchBudget::new(limits);
    let mut bundle = SourceBundle::default();
    let walker = WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));

    for entry in walker {
        let entry = entry.map_err(|e| BuildError::FetchFailed(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| BuildError::FetchFailed(e.to_string()))?
            .to_string_lossy()
            .replace('\\', "/");
        if !has_valid_extension(&name, extensions) {
            continue;
        }
        let content =
            std::fs::read(entry.path()).map_err(|e| BuildError::FetchFailed(e.to_string()))?;
        budget.charge(content.len() as u64, 1)?;
        progress.emit(ProgressMessage::downloading(format!("Reading {}", name)));
        bundle.files.insert(name, content);
    }

    if bundle.files.is_empty() {
        return Err(BuildError::FetchFailed(format!(
            "no source files in {}",
            dir.display()
        )));
    }
    Ok(bundle)
}

#[async_trait]
impl SourceFetcher for WorkspaceFetcher {
    async fn resolve_revision(
        &self,
        _reference: &SourceReference,
    ) -> Result<Option<String>, BuildError> {
        Ok(None)
    }

    async fn fetch(
        &self,
        reference: &SourceReference,
        limits: FetchLimits,
        progress: &ProgressSink,
    ) -> Result<SourceBundle, BuildError> {
        let dir = self.package_dir(reference)?;
        let extensions = self.extensions.clone();
        let progress = progress.clone();
        debug!(dir = %dir.display(), "reading workspace package");
        tokio::task::spawn_blocking(move || read_package(&dir, &extensions, limits, &progress))
            .await
            .map_err(|e| BuildError::FetchFailed(format!("workspace reader failed: {}", e)))?
    }
}

/// Rejects anything that could escape the store directory.
fn checked_name(name: &str) -> Result<&str, BackendError> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(name)
    } else {
        Err(BackendError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid storage name '{}'", name),
        )))
    }
}

/// Write `bytes` to `path` via a sibling temp file and a rename.
async fn publish(path: &Path, bytes: &[u8]) -> Result<(), BackendError> {
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Blobs as files named by their location.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path(&self, location: &str) -> Result<PathBuf, BackendError> {
        Ok(self.root.join(checked_name(location)?))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(
        &self,
        location: &str,
        bytes: Bytes,
        _content_type: &str,
    ) -> Result<(), BackendError> {
        let path = self.path(location)?;
        if tokio::fs::try_exists(&path).await? {
            return Ok(());
        }
        publish(&path, &bytes).await
    }

    async fn get(&self, location: &str) -> Result<Option<Bytes>, BackendError> {
        match tokio::fs::read(self.path(location)?).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, location: &str) -> Result<bool, BackendError> {
        Ok(tokio::fs::try_exists(self.path(location)?).await?)
    }
}

/// Descriptors as JSON files, the error log as JSON lines.
#[derive(Debug)]
pub struct FsMetadataStore {
    meta_dir: PathBuf,
    error_log: PathBuf,
    error_lock: Mutex<()>,
}

impl FsMetadataStore {
    pub fn new(root: PathBuf) -> std::io::Result<Self> {
        let meta_dir = root.join("meta");
        std::fs::create_dir_all(&meta_dir)?;
        Ok(Self {
            meta_dir,
            error_log: root.join("errors.jsonl"),
            error_lock: Mutex::new(()),
        })
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.meta_dir.join(format!("{:x}.json", digest))
    }

    pub fn error_log_path(&self) -> &Path {
        &self.error_log
    }
}

#[async_trait]
impl MetadataStore for FsMetadataStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, BackendError> {
        match tokio::fs::read(self.entry_path(key)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), BackendError> {
        let path = self.entry_path(&entry.key);
        if tokio::fs::try_exists(&path).await? {
            return Ok(());
        }
        let json = serde_json::to_vec_pretty(entry)?;
        publish(&path, &json).await
    }

    async fn append_error(&self, record: &ErrorRecord) -> Result<(), BackendError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let _guard = self.error_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.error_log)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}
