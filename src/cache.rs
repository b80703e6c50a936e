//! Single-flight, content-addressed build cache.
//!
//! ```text
//!  get_or_build(ref)
//!       │
//!       ▼
//!  metadata hit + blob present? ──yes──▶ Done (cached)
//!       │ no
//!       ▼
//!  in_flight[path] ──exists──▶ subscribe ──┐
//!       │ absent                           │
//!       ▼                                  │
//!  spawn leader: fetch → compile → store   │
//!       │                                  │
//!       └──▶ progress (broadcast) ─────────┤
//!       └──▶ outcome (watch) ──────────────┴──▶ every requester
//! ```
//!
//! The leader runs as its own task, so a requester that disconnects never
//! cancels a build other requesters are waiting on. The in-flight entry is
//! removed by a drop guard, which also publishes `Aborted` if the leader
//! died without an outcome.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use compile_common::{ArtifactSummary, PROGRESS_BUFFER, ProgressMessage, ProgressSink, SourceReference};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::backends::{Backends, CacheEntry, FetchLimits, SourceBundle};
use crate::errors::{BackendError, BuildError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    pub fetch_timeout: Duration,
    pub compile_timeout: Duration,
    pub storage_timeout: Duration,
    pub fetch_max_bytes: u64,
    pub fetch_max_objects: u64,
}

impl CacheSettings {
    pub fn limits(&self) -> FetchLimits {
        FetchLimits {
            max_bytes: self.fetch_max_bytes,
            max_objects: self.fetch_max_objects,
        }
    }
}

/// Where the leader gets its sources from.
#[derive(Debug, Clone)]
pub enum BuildSource {
    /// Ask the configured fetcher.
    Remote,
    /// Sources supplied by the client (playground).
    Inline(SourceBundle),
}

/// Cache key for a reference at a revision.
pub fn cache_key(reference: &SourceReference, revision: Option<&str>) -> String {
    match revision {
        Some(rev) => format!("{}@{}", reference.path(), rev),
        None => reference.path().to_string(),
    }
}

type Outcome = Option<Result<ArtifactSummary, BuildError>>;

/// A build in progress, as seen by the map.
struct InFlight {
    updates: broadcast::Sender<ProgressMessage>,
    outcome: watch::Receiver<Outcome>,
}

/// A requester's view of a build.
struct Flight {
    updates: broadcast::Receiver<ProgressMessage>,
    outcome: watch::Receiver<Outcome>,
}

struct CacheInner {
    backends: Backends,
    settings: CacheSettings,
    in_flight: Mutex<HashMap<String, Arc<InFlight>>>,
}

#[derive(Clone)]
pub struct BuildCache {
    inner: Arc<CacheInner>,
}

impl BuildCache {
    pub fn new(backends: Backends, settings: CacheSettings) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                backends,
                settings,
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn settings(&self) -> CacheSettings {
        self.inner.settings
    }

    /// Builds currently running.
    pub fn in_flight_count(&self) -> usize {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// The cache key `reference` currently maps to. Revision lookup
    /// failures fall back to the bare path.
    pub async fn resolve_key(&self, reference: &SourceReference) -> String {
        match self.inner.backends.fetcher.resolve_revision(reference).await {
            Ok(revision) => cache_key(reference, revision.as_deref()),
            Err(e) => {
                debug!(reference = %reference, error = %e, "revision not resolvable");
                cache_key(reference, None)
            }
        }
    }

    /// Find a usable entry: descriptor present and blob still there.
    pub async fn lookup(&self, key: &str) -> Result<Option<CacheEntry>, BuildError> {
        self.inner.lookup(key).await
    }

    /// Fetch the artifact bytes behind a blob location.
    pub async fn read_blob(&self, location: &str) -> Result<Option<axum::body::Bytes>, BuildError> {
        let timeout = self.inner.settings.storage_timeout;
        match tokio::time::timeout(timeout, self.inner.backends.blobs.get(location)).await {
            Ok(result) => result.map_err(|e| BuildError::StorageReadFailed(e.to_string())),
            Err(_) => Err(BuildError::StorageReadFailed(format!(
                "timed out after {}s",
                timeout.as_secs()
            ))),
        }
    }

    /// Return the artifact for `reference`, building it at most once no
    /// matter how many callers ask concurrently. Progress of the shared
    /// build is forwarded to every caller's own sink.
    pub async fn get_or_build(
        &self,
        reference: &SourceReference,
        source: BuildSource,
        progress: &ProgressSink,
    ) -> Result<ArtifactSummary, BuildError> {
        let key = match source {
            BuildSource::Remote => self.resolve_key(reference).await,
            BuildSource::Inline(_) => cache_key(reference, None),
        };

        match self.inner.lookup(&key).await {
            Ok(Some(entry)) => {
                info!(key = %key, "cache hit");
                return Ok(entry.summary(true));
            }
            Ok(None) => {}
            Err(e) => warn!(key = %key, error = %e, "cache lookup failed, rebuilding"),
        }

        let flight = self.join_or_lead(reference, key, source);
        await_outcome(flight, progress).await
    }

    fn join_or_lead(&self, reference: &SourceReference, key: String, source: BuildSource) -> Flight {
        let path = reference.path().to_string();
        let mut map = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = map.get(&path) {
            debug!(path = %path, "joining in-flight build");
            return Flight {
                updates: existing.updates.subscribe(),
                outcome: existing.outcome.clone(),
            };
        }

        let (updates, updates_rx) = broadcast::channel(PROGRESS_BUFFER);
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let entry = Arc::new(InFlight {
            updates: updates.clone(),
            outcome: outcome_rx.clone(),
        });
        map.insert(path.clone(), Arc::clone(&entry));
        drop(map);

        info!(path = %path, key = %key, "starting build");
        let guard = FlightGuard {
            inner: Arc::clone(&self.inner),
            path,
            entry,
            outcome: outcome_tx,
        };
        tokio::spawn(lead(guard, reference.clone(), key, source, updates));

        Flight {
            updates: updates_rx,
            outcome: outcome_rx,
        }
    }
}

/// Owned by the leader task. Removes the in-flight entry on every exit path
/// and makes sure waiters always see an outcome.
struct FlightGuard {
    inner: Arc<CacheInner>,
    path: String,
    entry: Arc<InFlight>,
    outcome: watch::Sender<Outcome>,
}

impl FlightGuard {
    fn finish(&self, result: Result<ArtifactSummary, BuildError>) {
        self.outcome.send_replace(Some(result));
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if self.outcome.borrow().is_none() {
            warn!(path = %self.path, "build ended without an outcome");
            self.outcome.send_replace(Some(Err(BuildError::Aborted)));
        }
        let mut map = self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if map
            .get(&self.path)
            .is_some_and(|current| Arc::ptr_eq(current, &self.entry))
        {
            map.remove(&self.path);
        }
    }
}

async fn lead(
    guard: FlightGuard,
    reference: SourceReference,
    key: String,
    source: BuildSource,
    updates: broadcast::Sender<ProgressMessage>,
) {
    // Progress from the backends goes through an mpsc sink and is pumped
    // into the broadcast; the pump is drained before the outcome is sent.
    let (sink, mut rx) = ProgressSink::channel();
    let pump = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let _ = updates.send(message);
        }
    });

    let result = build(&guard.inner, &reference, key, source, &sink).await;
    drop(sink);
    let _ = pump.await;

    match &result {
        Ok(summary) => info!(key = %summary.key, size = summary.size, "build stored"),
        Err(e) => warn!(path = %reference, error = %e, "build failed"),
    }
    guard.finish(result);
}

async fn build(
    inner: &CacheInner,
    reference: &SourceReference,
    key: String,
    source: BuildSource,
    progress: &ProgressSink,
) -> Result<ArtifactSummary, BuildError> {
    // A build for the same key may have finished between our lookup and
    // taking the lead.
    if let Ok(Some(entry)) = inner.lookup(&key).await {
        return Ok(entry.summary(true));
    }

    let settings = inner.settings;
    let limits = settings.limits();
    let bundle = match source {
        BuildSource::Inline(bundle) => {
            limits.check(&bundle)?;
            bundle
        }
        BuildSource::Remote => {
            progress.emit(ProgressMessage::downloading(format!("Fetching {}", reference)));
            tokio::time::timeout(
                settings.fetch_timeout,
                inner.backends.fetcher.fetch(reference, limits, progress),
            )
            .await
            .map_err(|_| BuildError::FetchTimeout {
                after: settings.fetch_timeout,
            })??
        }
    };
    debug!(
        path = %reference,
        files = bundle.files.len(),
        bytes = bundle.total_bytes(),
        "sources ready"
    );

    let artifact = tokio::time::timeout(
        settings.compile_timeout,
        inner.backends.compiler.compile(reference, &bundle, progress),
    )
    .await
    .map_err(|_| BuildError::CompileTimeout {
        after: settings.compile_timeout,
    })??;

    let location = artifact.location();
    let size = artifact.bytes.len() as u64;
    progress.emit(ProgressMessage::storing(format!("Storing {} bytes", size)));

    // Blob first, descriptor last: the entry only becomes visible once
    // both writes have landed.
    bounded_write(
        settings.storage_timeout,
        inner
            .backends
            .blobs
            .put(&location, artifact.bytes.clone(), &artifact.content_type),
    )
    .await?;

    let entry = CacheEntry {
        key,
        path: reference.path().to_string(),
        revision: bundle.revision.clone(),
        blob_location: location,
        content_type: artifact.content_type,
        size,
        created_at: Utc::now(),
    };
    bounded_write(settings.storage_timeout, inner.backends.metadata.put(&entry)).await?;

    Ok(entry.summary(false))
}

async fn bounded_write(
    limit: Duration,
    write: impl std::future::Future<Output = Result<(), BackendError>>,
) -> Result<(), BuildError> {
    match tokio::time::timeout(limit, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(BuildError::StorageWriteFailed(e.to_string())),
        Err(_) => Err(BuildError::StorageWriteFailed(format!(
            "timed out after {}s",
            limit.as_secs()
        ))),
    }
}

impl CacheInner {
    async fn lookup(&self, key: &str) -> Result<Option<CacheEntry>, BuildError> {
        let timeout = self.settings.storage_timeout;
        let read_failed = |detail: String| BuildError::StorageReadFailed(detail);
        let entry = tokio::time::timeout(timeout, self.backends.metadata.get(key))
            .await
            .map_err(|_| read_failed(format!("metadata lookup timed out after {}s", timeout.as_secs())))?
            .map_err(|e| read_failed(e.to_string()))?;
        let Some(entry) = entry else {
            return Ok(None);
        };
        let present = tokio::time::timeout(timeout, self.backends.blobs.exists(&entry.blob_location))
            .await
            .map_err(|_| read_failed(format!("blob check timed out after {}s", timeout.as_secs())))?
            .map_err(|e| read_failed(e.to_string()))?;
        if !present {
            warn!(key, location = %entry.blob_location, "descriptor points at a missing blob");
            return Ok(None);
        }
        Ok(Some(entry))
    }
}

async fn await_outcome(
    flight: Flight,
    progress: &ProgressSink,
) -> Result<ArtifactSummary, BuildError> {
    let Flight {
        mut updates,
        mut outcome,
    } = flight;

    loop {
        tokio::select! {
            biased;
            message = updates.recv() => match message {
                Ok(message) => progress.emit(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "progress subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = outcome.changed() => {
                if changed.is_err() || outcome.borrow().is_some() {
                    break;
                }
            }
        }
    }

    // Flush anything published before the outcome.
    while let Ok(message) = updates.try_recv() {
        progress.emit(message);
    }
    let result = outcome.borrow().clone();
    result.unwrap_or(Err(BuildError::Aborted))
}
