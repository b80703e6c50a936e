//! Typed error hierarchy for the compile server.
//!
//! One enum per concern:
//! - `AdmissionError`: the admission queue refused a request
//! - `BuildError`: a fetch/compile/store cycle failed (cloneable, so a
//!   single outcome can be handed to every waiter of a shared build)
//! - `StreamError`: an outbound byte copy failed or ran out of time
//! - `BackendError`: a storage adapter failed
//! - `ChannelError`: a progress connection ended abnormally
//! - `ServiceError`: the umbrella type handed to the error reporter

use std::time::Duration;

use thiserror::Error;

/// Errors from the admission queue.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Too many compile jobs queued, please try again later")]
    TooManyQueued,

    #[error("No free build slot")]
    NoFreeSlot,

    #[error("Server is shutting down")]
    Closed,
}

/// Which fetch cap was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchLimit {
    Bytes,
    Objects,
}

impl std::fmt::Display for FetchLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchLimit::Bytes => write!(f, "bytes"),
            FetchLimit::Objects => write!(f, "objects"),
        }
    }
}

/// Errors from a build cycle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("Fetch timed out after {}s", .after.as_secs())]
    FetchTimeout { after: Duration },

    #[error("Source too large: more than {max} {limit}")]
    FetchSizeExceeded { limit: FetchLimit, max: u64 },

    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    #[error("Unsupported source: {0}")]
    UnsupportedSource(String),

    #[error("Compile failed: {0}")]
    CompileFailed(String),

    #[error("Compile timed out after {}s", .after.as_secs())]
    CompileTimeout { after: Duration },

    #[error("Storage write failed: {0}")]
    StorageWriteFailed(String),

    #[error("Storage read failed: {0}")]
    StorageReadFailed(String),

    #[error("Build aborted before completion")]
    Aborted,
}

/// Errors from an outbound byte copy.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Write timed out after {}ms", .after.as_millis())]
    Timeout { after: Duration },

    #[error("Stream I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, StreamError::Timeout { .. })
    }
}

/// Errors from storage backends.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP storage error: {0}")]
    Http(String),

    #[error("Failed to (de)serialize stored record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        BackendError::Http(err.to_string())
    }
}

/// Abnormal ends of a progress connection.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Connection closed by client")]
    Closed,

    #[error("No pong received within {}s", .after.as_secs())]
    KeepaliveExpired { after: Duration },

    #[error("No instruction received within {}s", .after.as_secs())]
    InstructionTimeout { after: Duration },

    #[error("Invalid instruction: {0}")]
    BadInstruction(String),

    #[error("Message write failed: {0}")]
    Write(#[source] StreamError),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Every failure the service can surface to a requester.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl ServiceError {
    /// Backlog overflow: surfaced to the client, never recorded.
    pub fn is_admission_overflow(&self) -> bool {
        matches!(self, ServiceError::Admission(AdmissionError::TooManyQueued))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_error_fetch_timeout_reports_seconds() {
        let err = BuildError::FetchTimeout {
            after: Duration::from_secs(60),
        };
        assert!(err.to_string().contains("60s"));
    }

    #[test]
    fn build_error_size_exceeded_names_limit() {
        let err = BuildError::FetchSizeExceeded {
            limit: FetchLimit::Objects,
            max: 10_000,
        };
        assert_eq!(err.to_string(), "Source too large: more than 10000 objects");
    }

    #[test]
    fn build_error_is_cloneable_for_broadcast() {
        let err = BuildError::StorageWriteFailed("bucket unavailable".into());
        let copy = err.clone();
        assert_eq!(err, copy);
    }

    #[test]
    fn service_error_detects_admission_overflow() {
        let err: ServiceError = AdmissionError::TooManyQueued.into();
        assert!(err.is_admission_overflow());
        let err: ServiceError = AdmissionError::NoFreeSlot.into();
        assert!(!err.is_admission_overflow());
        let err: ServiceError = BuildError::Aborted.into();
        assert!(!err.is_admission_overflow());
    }

    #[test]
    fn stream_error_timeout_is_matchable() {
        let err = StreamError::Timeout {
            after: Duration::from_secs(2),
        };
        assert!(err.is_timeout());
        let io = StreamError::from(std::io::Error::other("broken pipe"));
        assert!(!io.is_timeout());
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&AdmissionError::TooManyQueued);
        assert_std_error(&BuildError::Aborted);
        assert_std_error(&BackendError::LockPoisoned);
        assert_std_error(&ChannelError::Closed);
        assert_std_error(&ServiceError::from(ChannelError::Closed));
    }
}
