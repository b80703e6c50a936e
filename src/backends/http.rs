//! Object-store backends over plain HTTP.
//!
//! Any store that accepts `PUT`, `GET` and `HEAD` on object URLs works:
//! blobs live at `<base>/<location>`, descriptors at
//! `<base>/meta/<sha256(key)>.json`, error records at
//! `<base>/errors/<uuid>.json`.

use async_trait::async_trait;
use axum::body::Bytes;
use reqwest::{Client, StatusCode, header};
use sha2::{Digest, Sha256};

use super::{BlobStore, CacheEntry, ErrorRecord, MetadataStore};
use crate::errors::BackendError;

fn object_url(base: &str, name: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), name)
}

async fn put_object(
    client: &Client,
    url: &str,
    body: impl Into<reqwest::Body>,
    content_type: &str,
) -> Result<(), BackendError> {
    client
        .put(url)
        .header(header::CONTENT_TYPE, content_type)
        .body(body)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

async fn get_object(client: &Client, url: &str) -> Result<Option<Bytes>, BackendError> {
    let resp = client.get(url).send().await?;
    if resp.status() == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    Ok(Some(resp.error_for_status()?.bytes().await?))
}

#[derive(Debug, Clone)]
pub struct HttpBlobStore {
    client: Client,
    base_url: String,
}

impl HttpBlobStore {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
        }
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn put(
        &self,
        location: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), BackendError> {
        let url = object_url(&self.base_url, location);
        put_object(&self.client, &url, bytes, content_type).await
    }

    async fn get(&self, location: &str) -> Result<Option<Bytes>, BackendError> {
        get_object(&self.client, &object_url(&self.base_url, location)).await
    }

    async fn exists(&self, location: &str) -> Result<bool, BackendError> {
        let resp = self
            .client
            .head(object_url(&self.base_url, location))
            .send()
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(BackendError::Http(format!(
                "HEAD {} returned {}",
                location, status
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpMetadataStore {
    client: Client,
    base_url: String,
}

impl HttpMetadataStore {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
        }
    }

    fn entry_url(&self, key: &str) -> String {
        let digest = Sha256::digest(key.as_bytes());
        object_url(&self.base_url, &format!("meta/{:x}.json", digest))
    }
}

#[async_trait]
impl MetadataStore for HttpMetadataStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, BackendError> {
        match get_object(&self.client, &self.entry_url(key)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), BackendError> {
        let body = serde_json::to_vec(entry)?;
        put_object(&self.client, &self.entry_url(&entry.key), body, "application/json").await
    }

    async fn append_error(&self, record: &ErrorRecord) -> Result<(), BackendError> {
        let name = format!("errors/{}.json", uuid::Uuid::new_v4());
        let body = serde_json::to_vec(record)?;
        put_object(
            &self.client,
            &object_url(&self.base_url, &name),
            body,
            "application/json",
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_url_joins_once() {
        assert_eq!(object_url("http://s/b/", "abc"), "http://s/b/abc");
        assert_eq!(object_url("http://s/b", "meta/x.json"), "http://s/b/meta/x.json");
    }

    #[test]
    fn test_entry_url_hashes_key() {
        let store = HttpMetadataStore::new(Client::new(), "http://store/bucket");
        let url = store.entry_url("github.com/dave/foo");
        assert!(url.starts_with("http://store/bucket/meta/"));
        assert!(url.ends_with(".json"));
        assert_eq!(url, store.entry_url("github.com/dave/foo"));
        assert_ne!(url, store.entry_url("github.com/dave/bar"));
    }

    #[tokio::test]
    async fn test_unreachable_store_is_an_error() {
        let store = HttpBlobStore::new(Client::new(), "http://127.0.0.1:1");
        assert!(matches!(
            store.exists("abc").await,
            Err(BackendError::Http(_))
        ));
    }
}
