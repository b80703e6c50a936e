//! Best-effort error log.
//!
//! Every failure surfaced to a requester is appended to the metadata
//! store's error log, except admission overflow: when the backlog is full
//! the last thing the service needs is one storage write per rejection.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, warn};

use crate::backends::{ErrorRecord, MetadataStore};
use crate::errors::ServiceError;

#[derive(Clone)]
pub struct ErrorReporter {
    store: Arc<dyn MetadataStore>,
    write_timeout: Duration,
}

impl ErrorReporter {
    pub fn new(store: Arc<dyn MetadataStore>, write_timeout: Duration) -> Self {
        Self {
            store,
            write_timeout,
        }
    }

    /// Record `err`. Returns whether a record was written; write failures
    /// are logged and otherwise ignored.
    pub async fn report(&self, err: &ServiceError, source_ip: Option<&str>) -> bool {
        if err.is_admission_overflow() {
            debug!(ip = source_ip.unwrap_or("-"), "admission overflow not recorded");
            return false;
        }

        error!(ip = source_ip.unwrap_or("-"), error = %err, "request failed");
        let record = ErrorRecord {
            time: Utc::now(),
            message: err.to_string(),
            source_ip: source_ip.map(str::to_string),
        };
        match tokio::time::timeout(self.write_timeout, self.store.append_error(&record)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "failed to write error record");
                false
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.write_timeout.as_secs(),
                    "error record write timed out"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::CacheEntry;
    use crate::backends::memory::MemoryMetadataStore;
    use crate::errors::{AdmissionError, BackendError, BuildError};
    use async_trait::async_trait;

    struct BrokenLog;

    #[async_trait]
    impl MetadataStore for BrokenLog {
        async fn get(&self, _: &str) -> Result<Option<CacheEntry>, BackendError> {
            Ok(None)
        }

        async fn put(&self, _: &CacheEntry) -> Result<(), BackendError> {
            Ok(())
        }

        async fn append_error(&self, _: &ErrorRecord) -> Result<(), BackendError> {
            Err(BackendError::Http("503".into()))
        }
    }

    fn reporter(store: Arc<dyn MetadataStore>) -> ErrorReporter {
        ErrorReporter::new(store, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_overflow_is_never_recorded() {
        let store = Arc::new(MemoryMetadataStore::default());
        let reporter = reporter(store.clone());
        let err = ServiceError::from(AdmissionError::TooManyQueued);
        assert!(!reporter.report(&err, Some("10.1.1.1")).await);
        assert!(store.errors().is_empty());
    }

    #[tokio::test]
    async fn test_build_failure_recorded_with_ip() {
        let store = Arc::new(MemoryMetadataStore::default());
        let reporter = reporter(store.clone());
        let err = ServiceError::from(BuildError::FetchFailed("no such repo".into()));
        assert!(reporter.report(&err, Some("10.1.1.1")).await);

        let errors = store.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "Fetch failed: no such repo");
        assert_eq!(errors[0].source_ip.as_deref(), Some("10.1.1.1"));
    }

    #[tokio::test]
    async fn test_other_admission_errors_are_recorded() {
        let store = Arc::new(MemoryMetadataStore::default());
        let reporter = reporter(store.clone());
        assert!(
            reporter
                .report(&ServiceError::from(AdmissionError::Closed), None)
                .await
        );
        assert_eq!(store.errors()[0].source_ip, None);
    }

    #[tokio::test]
    async fn test_write_failure_is_swallowed() {
        let reporter = reporter(Arc::new(BrokenLog));
        let err = ServiceError::from(BuildError::Aborted);
        assert!(!reporter.report(&err, None).await);
    }
}
