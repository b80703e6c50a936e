//! Git-backed source fetcher.
//!
//! GitHub references clone `https://github.com/<user>/<repo>.git` and read
//! the package from the remaining path segments; gist references clone the
//! whole gist. Clones are shallow, run on a blocking thread, and report git's
//! own progress text as `Downloading` messages.

use std::cell::RefCell;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use compile_common::{ProgressMessage, ProgressSink, SourceKind, SourceReference};
use git2::build::RepoBuilder;
use git2::{FetchOptions, RemoteCallbacks};
use tokio::sync::Semaphore;
use tracing::{debug, info};

use super::local::read_package;
use super::{FetchBudget, FetchLimits, ScratchDir, SourceBundle, SourceFetcher};
use crate::errors::BuildError;

/// Where a reference lives in git terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoLocation {
    pub url: String,
    /// Package directory inside the repository.
    pub subdir: PathBuf,
}

/// A single path component that names an entry in place.
fn is_plain_segment(segment: &str) -> bool {
    let mut components = Path::new(segment).components();
    matches!(components.next(), Some(Component::Normal(_))) && components.next().is_none()
}

impl RepoLocation {
    pub fn for_reference(reference: &SourceReference) -> Result<Self, BuildError> {
        let segments: Vec<&str> = reference.segments().collect();
        if let Some(bad) = segments.iter().skip(1).find(|s| !is_plain_segment(s)) {
            return Err(BuildError::UnsupportedSource(format!(
                "invalid path segment '{}' in '{}'",
                bad, reference
            )));
        }
        match reference.kind() {
            SourceKind::GitHub => match segments.as_slice() {
                [_, user, repo, rest @ ..] => Ok(Self {
                    url: format!("https://github.com/{}/{}.git", user, repo),
                    subdir: rest.iter().collect(),
                }),
                _ => Err(BuildError::UnsupportedSource(format!(
                    "'{}' does not name a repository",
                    reference
                ))),
            },
            SourceKind::Gist => match segments.as_slice() {
                [_, id, ..] => Ok(Self {
                    url: format!("https://gist.github.com/{}.git", id),
                    subdir: PathBuf::new(),
                }),
                _ => Err(BuildError::UnsupportedSource(format!(
                    "'{}' does not name a gist",
                    reference
                ))),
            },
            SourceKind::Local => Err(BuildError::UnsupportedSource(format!(
                "'{}' is not a git hosted package",
                reference
            ))),
        }
    }
}

/// Revision lookups allowed on blocking threads at once. A lookup holds its
/// slot until its thread returns, even after the caller gave up on it.
const MAX_PENDING_LOOKUPS: usize = 16;

/// Clones packages from GitHub and gists.
#[derive(Debug, Clone)]
pub struct GitFetcher {
    scratch: PathBuf,
    extensions: Vec<String>,
    list_timeout: Duration,
    lookups: Arc<Semaphore>,
}

impl GitFetcher {
    pub fn new(scratch: PathBuf, extensions: Vec<String>, list_timeout: Duration) -> Self {
        Self {
            scratch,
            extensions,
            list_timeout,
            lookups: Arc::new(Semaphore::new(MAX_PENDING_LOOKUPS)),
        }
    }
}

/// Raises the cancel flag when the fetch or lookup future is dropped, e.g.
/// because the caller's deadline fired. The blocking git work checks it
/// from its callbacks and between steps.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

fn ls_remote_head(url: &str, cancel: &AtomicBool) -> Result<Option<String>, git2::Error> {
    let cancelled = || git2::Error::from_str("revision lookup cancelled");
    if cancel.load(Ordering::SeqCst) {
        return Err(cancelled());
    }
    let mut remote = git2::Remote::create_detached(url)?;
    let mut callbacks = RemoteCallbacks::new();
    callbacks.sideband_progress(|_| !cancel.load(Ordering::SeqCst));
    let mut connection = remote.connect_auth(git2::Direction::Fetch, Some(callbacks), None)?;
    if cancel.load(Ordering::SeqCst) {
        return Err(cancelled());
    }
    let head = connection
        .remote()
        .list()?
        .iter()
        .find(|h| h.name() == "HEAD")
        .map(|h| h.oid().to_string());
    Ok(head)
}

/// Resolve the package directory inside a clone, refusing anything that
/// ends up outside it, symlinks included.
fn contained_package_dir(root: &Path, subdir: &Path) -> Result<PathBuf, BuildError> {
    let root = root
        .canonicalize()
        .map_err(|e| BuildError::FetchFailed(format!("clone directory: {}", e)))?;
    let dir = root.join(subdir).canonicalize().map_err(|_| {
        BuildError::FetchFailed(format!("package not found: {}", subdir.display()))
    })?;
    if !dir.starts_with(&root) {
        return Err(BuildError::UnsupportedSource(format!(
            "package directory '{}' leaves the repository",
            subdir.display()
        )));
    }
    Ok(dir)
}

struct CloneJob {
    location: RepoLocation,
    dest: PathBuf,
    extensions: Vec<String>,
    limits: FetchLimits,
    progress: ProgressSink,
    cancel: Arc<AtomicBool>,
}

fn emit_sideband(progress: &ProgressSink, data: &[u8]) {
    let text = String::from_utf8_lossy(data);
    for line in text.split(['\r', '\n']).map(str::trim).filter(|l| !l.is_empty()) {
        progress.emit(ProgressMessage::downloading(line));
    }
}

fn clone_package(job: CloneJob) -> Result<SourceBundle, BuildError> {
    let _cleanup = ScratchDir(job.dest.clone());
    let budget = FetchBudget::new(job.limits);
    let failure: RefCell<Option<BuildError>> = RefCell::new(None);

    let cloned = {
        let mut callbacks = RemoteCallbacks::new();
        callbacks.transfer_progress(|stats| {
            if job.cancel.load(Ordering::SeqCst) {
                return false;
            }
            match budget.check_totals(stats.received_bytes() as u64, stats.total_objects() as u64)
            {
                Ok(()) => true,
                Err(e) => {
                    *failure.borrow_mut() = Some(e);
                    false
                }
            }
        });
        callbacks.sideband_progress(|data| {
            emit_sideband(&job.progress, data);
            !job.cancel.load(Ordering::SeqCst)
        });

        let mut options = FetchOptions::new();
        options.remote_callbacks(callbacks);
        options.depth(1);
        RepoBuilder::new()
            .fetch_options(options)
            .clone(&job.location.url, &job.dest)
    };

    let repo = match cloned {
        Ok(repo) => repo,
        Err(e) => {
            if let Some(limit) = failure.into_inner() {
                return Err(limit);
            }
            if job.cancel.load(Ordering::SeqCst) {
                return Err(BuildError::Aborted);
            }
            return Err(BuildError::FetchFailed(e.message().to_string()));
        }
    };

    let revision = repo
        .head()
        .ok()
        .and_then(|head| head.target())
        .map(|oid| oid.to_string());
    let package_dir = contained_package_dir(&job.dest, &job.location.subdir)?;
    let mut bundle = read_package(&package_dir, &job.extensions, job.limits, &job.progress)?;
    bundle.revision = revision;
    Ok(bundle)
}

#[async_trait]
impl SourceFetcher for GitFetcher {
    async fn resolve_revision(
        &self,
        reference: &SourceReference,
    ) -> Result<Option<String>, BuildError> {
        let location = RepoLocation::for_reference(reference)?;
        let Ok(slot) = Arc::clone(&self.lookups).try_acquire_owned() else {
            return Err(BuildError::FetchFailed(
                "too many revision lookups in progress".into(),
            ));
        };
        let url = location.url.clone();
        let cancel = Arc::new(AtomicBool::new(false));
        let _cancel_on_drop = CancelOnDrop(Arc::clone(&cancel));
        let lookup = tokio::task::spawn_blocking(move || {
            let _slot = slot;
            ls_remote_head(&url, &cancel)
        });
        match tokio::time::timeout(self.list_timeout, lookup).await {
            Ok(Ok(Ok(head))) => Ok(head),
            Ok(Ok(Err(e))) => Err(BuildError::FetchFailed(e.message().to_string())),
            Ok(Err(e)) => Err(BuildError::FetchFailed(e.to_string())),
            Err(_) => Err(BuildError::FetchTimeout {
                after: self.list_timeout,
            }),
        }
    }

    async fn fetch(
        &self,
        reference: &SourceReference,
        limits: FetchLimits,
        progress: &ProgressSink,
    ) -> Result<SourceBundle, BuildError> {
        let location = RepoLocation::for_reference(reference)?;
        let dest = self.scratch.join(uuid::Uuid::new_v4().to_string());
        std::fs::create_dir_all(scratch_parent(&dest))
            .map_err(|e| BuildError::FetchFailed(format!("scratch dir: {}", e)))?;

        let cancel = Arc::new(AtomicBool::new(false));
        let _cancel_on_drop = CancelOnDrop(Arc::clone(&cancel));
        info!(url = %location.url, subdir = %location.subdir.display(), "cloning");
        progress.emit(ProgressMessage::downloading(format!(
            "Cloning {}",
            location.url
        )));

        let job = CloneJob {
            location,
            dest,
            extensions: self.extensions.clone(),
            limits,
            progress: progress.clone(),
            cancel,
        };
        let bundle = tokio::task::spawn_blocking(move || clone_package(job))
            .await
            .map_err(|e| BuildError::FetchFailed(format!("clone task failed: {}", e)))??;
        debug!(
            files = bundle.files.len(),
            bytes = bundle.total_bytes(),
            "clone complete"
        );
        Ok(bundle)
    }
}

fn scratch_parent(dest: &Path) -> &Path {
    dest.parent().unwrap_or(dest)
}
