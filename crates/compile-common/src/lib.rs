//! Shared domain types for the compile server.
//!
//! Kept free of server dependencies so a client can speak the progress
//! protocol and normalize paths the same way the server does.

pub mod progress;
pub mod source;

pub use progress::{
    ArtifactSummary, ClientInstruction, JobState, PROGRESS_BUFFER, ProgressMessage, ProgressSink,
};
pub use source::{MAX_GITHUB_USERNAME_LEN, PathNormalizer, SourceKind, SourceReference};
