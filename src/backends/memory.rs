//! In-process stores for development and tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use axum::body::Bytes;

use super::{BlobStore, CacheEntry, ErrorRecord, MetadataStore};
use crate::errors::BackendError;

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, (Bytes, String)>>,
}

impl MemoryBlobStore {
    pub fn len(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove a blob, leaving any descriptor pointing at it dangling.
    pub fn evict(&self, location: &str) -> Result<(), BackendError> {
        self.blobs
            .lock()
            .map_err(|_| BackendError::LockPoisoned)?
            .remove(location);
        Ok(())
    }

    pub fn content_type(&self, location: &str) -> Option<String> {
        self.blobs
            .lock()
            .ok()?
            .get(location)
            .map(|(_, content_type)| content_type.clone())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(
        &self,
        location: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), BackendError> {
        self.blobs
            .lock()
            .map_err(|_| BackendError::LockPoisoned)?
            .insert(location.to_string(), (bytes, content_type.to_string()));
        Ok(())
    }

    async fn get(&self, location: &str) -> Result<Option<Bytes>, BackendError> {
        Ok(self
            .blobs
            .lock()
            .map_err(|_| BackendError::LockPoisoned)?
            .get(location)
            .map(|(bytes, _)| bytes.clone()))
    }

    async fn exists(&self, location: &str) -> Result<bool, BackendError> {
        Ok(self
            .blobs
            .lock()
            .map_err(|_| BackendError::LockPoisoned)?
            .contains_key(location))
    }
}

#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
    errors: Mutex<Vec<ErrorRecord>>,
}

impl MemoryMetadataStore {
    /// Snapshot of the error log.
    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.errors.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, BackendError> {
        Ok(self
            .entries
            .lock()
            .map_err(|_| BackendError::LockPoisoned)?
            .get(key)
            .cloned())
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), BackendError> {
        self.entries
            .lock()
            .map_err(|_| BackendError::LockPoisoned)?
            .entry(entry.key.clone())
            .or_insert_with(|| entry.clone());
        Ok(())
    }

    async fn append_error(&self, record: &ErrorRecord) -> Result<(), BackendError> {
        self.errors
            .lock()
            .map_err(|_| BackendError::LockPoisoned)?
            .push(record.clone());
        Ok(())
    }
}
