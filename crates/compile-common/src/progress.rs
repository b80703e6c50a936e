//! Progress protocol spoken over a compile connection.
//!
//! The server pushes [`ProgressMessage`]s; the client may send
//! [`ClientInstruction`]s. Both are JSON objects of the form
//! `{"type": "...", "data": {...}}` so a client can match exhaustively on
//! the tag.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Summary of a stored artifact, as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSummary {
    /// Cache key (normalized path, plus `@revision` when one was resolved).
    pub key: String,
    /// Content-addressed blob location.
    pub location: String,
    pub content_type: String,
    pub size: u64,
    pub revision: Option<String>,
    /// True when the artifact came out of the cache without a build.
    pub cached: bool,
}

/// Server → client messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ProgressMessage {
    Queued { position: usize },
    Downloading { message: String },
    Compiling { message: String },
    Storing { message: String },
    Done { artifact: ArtifactSummary },
    Error { message: String },
}

impl ProgressMessage {
    pub fn downloading(message: impl Into<String>) -> Self {
        Self::Downloading {
            message: message.into(),
        }
    }

    pub fn compiling(message: impl Into<String>) -> Self {
        Self::Compiling {
            message: message.into(),
        }
    }

    pub fn storing(message: impl Into<String>) -> Self {
        Self::Storing {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// `Done` and `Error` end the conversation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    /// The job state this message implies, if any.
    pub fn stage(&self) -> Option<JobState> {
        match self {
            Self::Queued { .. } => Some(JobState::Queued),
            Self::Downloading { .. } => Some(JobState::Fetching),
            Self::Compiling { .. } => Some(JobState::Compiling),
            Self::Storing { .. } => Some(JobState::Storing),
            Self::Done { .. } => Some(JobState::Done),
            Self::Error { .. } => Some(JobState::Failed),
        }
    }
}

/// Client → server messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientInstruction {
    /// Compile an inline source bundle (playground).
    Compile { files: BTreeMap<String, String> },
}

/// Lifecycle of a single build job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Fetching,
    Compiling,
    Storing,
    Done,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Fetching => "fetching",
            Self::Compiling => "compiling",
            Self::Storing => "storing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Whether `self → to` is a legal step.
    ///
    /// Stages only move forward, a cache hit may go straight from `Queued` to
    /// `Done`, and any live state may fail. Repeating a stage is allowed
    /// since every progress line re-announces it.
    pub fn can_transition(&self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Queued, Queued)
                | (Queued, Fetching)
                | (Queued, Compiling)
                | (Queued, Done)
                | (Fetching, Fetching)
                | (Fetching, Compiling)
                | (Compiling, Compiling)
                | (Compiling, Storing)
                | (Storing, Storing)
                | (Storing, Done)
        ) || (!self.is_terminal() && to == Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Write end of a job's progress stream.
///
/// Emitting never blocks and never fails: once the receiving connection is
/// gone, or while it is too far behind, messages are dropped.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: Option<mpsc::Sender<ProgressMessage>>,
}

/// Buffer between a build and the connection forwarding its progress.
pub const PROGRESS_BUFFER: usize = 256;

impl ProgressSink {
    pub fn channel() -> (Self, mpsc::Receiver<ProgressMessage>) {
        let (tx, rx) = mpsc::channel(PROGRESS_BUFFER);
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that discards everything.
    pub fn discard() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, message: ProgressMessage) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(message);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().is_none_or(|tx| tx.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_message_wire_shape() {
        let msg = ProgressMessage::downloading("Cloning into 'foo'");
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["type"], "Downloading");
        assert_eq!(parsed["data"]["message"], "Cloning into 'foo'");
    }

    #[test]
    fn test_done_message_carries_artifact() {
        let msg = ProgressMessage::Done {
            artifact: ArtifactSummary {
                key: "github.com/dave/foo@abc".to_string(),
                location: "deadbeef".to_string(),
                content_type: "application/javascript".to_string(),
                size: 12,
                revision: Some("abc".to_string()),
                cached: false,
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"Done\""));
        assert!(json.contains("\"location\":\"deadbeef\""));
        assert!(msg.is_terminal());
    }

    #[test]
    fn test_client_instruction_parses() {
        let json = r#"{"type":"Compile","data":{"files":{"main.go":"package main"}}}"#;
        let ClientInstruction::Compile { files } = serde_json::from_str(json).unwrap();
        assert_eq!(files.get("main.go").map(String::as_str), Some("package main"));
    }

    #[test]
    fn test_unknown_message_type_is_rejected() {
        let json = r#"{"type":"Explode","data":{}}"#;
        assert!(serde_json::from_str::<ClientInstruction>(json).is_err());
    }

    #[test]
    fn test_stage_mapping() {
        assert_eq!(ProgressMessage::Queued { position: 1 }.stage(), Some(JobState::Queued));
        assert_eq!(ProgressMessage::error("x").stage(), Some(JobState::Failed));
        assert!(!ProgressMessage::compiling("x").is_terminal());
    }

    #[test]
    fn test_valid_transitions() {
        assert!(JobState::Queued.can_transition(JobState::Fetching));
        assert!(JobState::Fetching.can_transition(JobState::Compiling));
        assert!(JobState::Compiling.can_transition(JobState::Storing));
        assert!(JobState::Storing.can_transition(JobState::Done));
        assert!(JobState::Queued.can_transition(JobState::Done));
        assert!(JobState::Fetching.can_transition(JobState::Failed));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!JobState::Done.can_transition(JobState::Fetching));
        assert!(!JobState::Failed.can_transition(JobState::Failed));
        assert!(!JobState::Done.can_transition(JobState::Failed));
        assert!(!JobState::Storing.can_transition(JobState::Fetching));
        assert!(!JobState::Fetching.can_transition(JobState::Done));
    }

    #[tokio::test]
    async fn test_sink_delivers_until_receiver_drops() {
        let (sink, mut rx) = ProgressSink::channel();
        sink.emit(ProgressMessage::downloading("a"));
        assert_eq!(rx.recv().await, Some(ProgressMessage::downloading("a")));
        drop(rx);
        assert!(sink.is_closed());
        sink.emit(ProgressMessage::downloading("b"));
    }

    #[test]
    fn test_discard_sink_is_closed() {
        let sink = ProgressSink::discard();
        assert!(sink.is_closed());
        sink.emit(ProgressMessage::error("ignored"));
    }
}
