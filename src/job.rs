//! Per-request build job bookkeeping.

use chrono::{DateTime, Utc};
use compile_common::{JobState, ProgressMessage, SourceReference};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("Invalid job transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobState,
    pub to: JobState,
}

/// One requester's build, from admission to its terminal message.
#[derive(Debug, Clone)]
pub struct BuildJob {
    id: Uuid,
    reference: SourceReference,
    state: JobState,
    submitted_at: DateTime<Utc>,
}

impl BuildJob {
    pub fn new(reference: SourceReference) -> Self {
        Self {
            id: Uuid::new_v4(),
            reference,
            state: JobState::Queued,
            submitted_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn reference(&self) -> &SourceReference {
        &self.reference
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn advance(&mut self, to: JobState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition(to) {
            return Err(InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Advance to the stage a progress message announces.
    pub fn observe(&mut self, message: &ProgressMessage) -> Result<(), InvalidTransition> {
        match message.stage() {
            Some(stage) => self.advance(stage),
            None => Ok(()),
        }
    }

    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.submitted_at).num_milliseconds()
    }
}
