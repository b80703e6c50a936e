//! Pluggable storage, fetch and compile backends.
//!
//! The build cache only talks to the four traits defined here. Which
//! implementations sit behind them is decided once, in
//! [`Backends::from_config`], and never consulted again.
//!
//! | Mode     | Fetcher            | Blobs            | Metadata              |
//! |----------|--------------------|------------------|-----------------------|
//! | `local`  | `WorkspaceFetcher` | `FsBlobStore`    | `FsMetadataStore`     |
//! | `cloud`  | `GitFetcher`       | `HttpBlobStore`  | `HttpMetadataStore`   |
//! | `memory` | `WorkspaceFetcher` | `MemoryBlobStore`| `MemoryMetadataStore` |
//!
//! All modes compile with `CommandCompiler`.

pub mod command;
pub mod git;
pub mod http;
pub mod local;
pub mod memory;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::body::Bytes;
use chrono::{DateTime, Utc};
use compile_common::{ArtifactSummary, ProgressSink, SourceReference};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{ServiceConfig, StorageBackendMode};
use crate::errors::{BackendError, BuildError, FetchLimit};

/// Source files retrieved for one build, keyed by path relative to the
/// package root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceBundle {
    pub revision: Option<String>,
    pub files: BTreeMap<String, Vec<u8>>,
}

impl SourceBundle {
    pub fn total_bytes(&self) -> u64 {
        self.files.values().map(|f| f.len() as u64).sum()
    }

    pub fn object_count(&self) -> u64 {
        self.files.len() as u64
    }

    /// Stable digest over file names and contents.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, content) in &self.files {
            hasher.update((name.len() as u64).to_le_bytes());
            hasher.update(name.as_bytes());
            hasher.update((content.len() as u64).to_le_bytes());
            hasher.update(content);
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Hard caps on what a single fetch may pull in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchLimits {
    pub max_bytes: u64,
    pub max_objects: u64,
}

impl FetchLimits {
    /// Check an already-assembled bundle against the caps.
    pub fn check(&self, bundle: &SourceBundle) -> Result<(), BuildError> {
        let mut budget = FetchBudget::new(*self);
        budget.charge(bundle.total_bytes(), bundle.object_count())
    }
}

/// Running total of what a fetch has consumed so far.
///
/// Fetchers charge every object as it arrives so an oversized source is
/// abandoned early instead of being truncated after the fact.
#[derive(Debug, Clone)]
pub struct FetchBudget {
    limits: FetchLimits,
    bytes: u64,
    objects: u64,
}

impl FetchBudget {
    pub fn new(limits: FetchLimits) -> Self {
        Self {
            limits,
            bytes: 0,
            objects: 0,
        }
    }

    pub fn charge(&mut self, bytes: u64, objects: u64) -> Result<(), BuildError> {
        self.bytes = self.bytes.saturating_add(bytes);
        self.objects = self.objects.saturating_add(objects);
        self.check_totals(self.bytes, self.objects)
    }

    /// Compare externally reported totals (e.g. git transfer stats).
    pub fn check_totals(&self, bytes: u64, objects: u64) -> Result<(), BuildError> {
        if bytes > self.limits.max_bytes {
            return Err(BuildError::FetchSizeExceeded {
                limit: FetchLimit::Bytes,
                max: self.limits.max_bytes,
            });
        }
        if objects > self.limits.max_objects {
            return Err(BuildError::FetchSizeExceeded {
                limit: FetchLimit::Objects,
                max: self.limits.max_objects,
            });
        }
        Ok(())
    }
}

/// Output of the compiler, before it is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledArtifact {
    pub bytes: Bytes,
    pub content_type: String,
}

impl CompiledArtifact {
    /// Content-addressed blob location for these bytes.
    pub fn location(&self) -> String {
        format!("{:x}", Sha256::digest(&self.bytes))
    }
}

/// Descriptor persisted in the metadata store. Never rewritten once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub path: String,
    pub revision: Option<String>,
    pub blob_location: String,
    pub content_type: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn summary(&self, cached: bool) -> ArtifactSummary {
        ArtifactSummary {
            key: self.key.clone(),
            location: self.blob_location.clone(),
            content_type: self.content_type.clone(),
            size: self.size,
            revision: self.revision.clone(),
            cached,
        }
    }
}

/// One line of the append-only error log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub time: DateTime<Utc>,
    pub message: String,
    pub source_ip: Option<String>,
}

/// Retrieves source content for a reference.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Resolve the current revision, if the source has one.
    async fn resolve_revision(
        &self,
        reference: &SourceReference,
    ) -> Result<Option<String>, BuildError>;

    /// Fetch the package files, charging every object against `limits`.
    async fn fetch(
        &self,
        reference: &SourceReference,
        limits: FetchLimits,
        progress: &ProgressSink,
    ) -> Result<SourceBundle, BuildError>;
}

/// Stores artifact bytes under content-addressed locations.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, location: &str, bytes: Bytes, content_type: &str)
    -> Result<(), BackendError>;

    async fn get(&self, location: &str) -> Result<Option<Bytes>, BackendError>;

    async fn exists(&self, location: &str) -> Result<bool, BackendError>;
}

/// Stores cache descriptors and error records.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, BackendError>;

    async fn put(&self, entry: &CacheEntry) -> Result<(), BackendError>;

    async fn append_error(&self, record: &ErrorRecord) -> Result<(), BackendError>;
}

/// Turns a source bundle into an artifact.
#[async_trait]
pub trait Compiler: Send + Sync {
    async fn compile(
        &self,
        reference: &SourceReference,
        source: &SourceBundle,
        progress: &ProgressSink,
    ) -> Result<CompiledArtifact, BuildError>;
}

/// The set of backends injected into the build cache.
#[derive(Clone)]
pub struct Backends {
    pub fetcher: Arc<dyn SourceFetcher>,
    pub blobs: Arc<dyn BlobStore>,
    pub metadata: Arc<dyn MetadataStore>,
    pub compiler: Arc<dyn Compiler>,
}

impl Backends {
    /// Wire up the backends for the configured mode.
    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        let data_dir = config.data_dir();
        let scratch = data_dir.join("scratch");
        let extensions = config.compiler.valid_extensions.clone();
        let compiler = Arc::new(command::CommandCompiler::new(
            &config.compiler.command,
            config.compiler.args.clone(),
            &config.compiler.content_type,
            scratch.clone(),
        ));

        let backends = match config.storage.backend {
            StorageBackendMode::Local => Self {
                fetcher: Arc::new(local::WorkspaceFetcher::new(
                    config.workspace_dir(),
                    extensions,
                )),
                blobs: Arc::new(
                    local::FsBlobStore::new(data_dir.join("blobs"))
                        .context("Failed to open local blob store")?,
                ),
                metadata: Arc::new(
                    local::FsMetadataStore::new(data_dir.clone())
                        .context("Failed to open local metadata store")?,
                ),
                compiler,
            },
            StorageBackendMode::Cloud => {
                let base_url = config
                    .storage
                    .cloud_url
                    .clone()
                    .context("storage.cloud_url is required for the cloud backend")?;
                let client = reqwest::Client::builder()
                    .connect_timeout(config.list_timeout())
                    .build()
                    .context("Failed to build HTTP client")?;
                Self {
                    fetcher: Arc::new(git::GitFetcher::new(
                        scratch,
                        extensions,
                        config.list_timeout(),
                    )),
                    blobs: Arc::new(http::HttpBlobStore::new(client.clone(), &base_url)),
                    metadata: Arc::new(http::HttpMetadataStore::new(client, &base_url)),
                    compiler,
                }
            }
            StorageBackendMode::Memory => Self {
                fetcher: Arc::new(local::WorkspaceFetcher::new(
                    config.workspace_dir(),
                    extensions,
                )),
                blobs: Arc::new(memory::MemoryBlobStore::default()),
                metadata: Arc::new(memory::MemoryMetadataStore::default()),
                compiler,
            },
        };
        Ok(backends)
    }
}

/// Scratch directory removed when dropped.
pub(crate) struct ScratchDir(pub(crate) PathBuf);

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

/// Whether `name` ends with one of the accepted source extensions.
pub fn has_valid_extension(name: &str, extensions: &[String]) -> bool {
    extensions.iter().any(|ext| name.ends_with(ext.as_str()))
}
