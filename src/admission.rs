//! Admission control for builds.
//!
//! At most `max_concurrent` builds hold a slot at once; up to `max_backlog`
//! further requests wait for one, released in arrival order. Anything beyond
//! that is refused on the spot with [`AdmissionError::TooManyQueued`].
//!
//! Slots are held by [`Permit`] guards, so every exit path of the job owner
//! (success, failure, dropped connection, panic) gives the slot back.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, warn};

use crate::errors::AdmissionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionSettings {
    pub max_concurrent: usize,
    pub max_backlog: usize,
}

/// Bounded admission queue keyed by normalized path.
///
/// The key is only carried for logging; two requests for the same key take
/// two slots, and the build cache deduplicates the work behind them.
#[derive(Debug, Clone)]
pub struct AdmissionQueue {
    slots: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
    settings: AdmissionSettings,
}

/// Outcome of [`AdmissionQueue::reserve`].
#[derive(Debug)]
pub enum Admission {
    /// A slot was free.
    Ready(Permit),
    /// Admitted to the backlog; await the ticket for a slot.
    Waiting(Ticket),
}

impl AdmissionQueue {
    pub fn new(settings: AdmissionSettings) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(settings.max_concurrent)),
            waiting: Arc::new(AtomicUsize::new(0)),
            settings,
        }
    }

    pub fn settings(&self) -> AdmissionSettings {
        self.settings
    }

    /// Builds currently holding a slot.
    pub fn running(&self) -> usize {
        self.settings.max_concurrent - self.slots.available_permits()
    }

    /// Requests currently waiting for a slot.
    pub fn queued(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Take a free slot without waiting.
    pub fn try_admit(&self, key: &str) -> Result<Permit, AdmissionError> {
        match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(permit) => {
                debug!(key, running = self.running(), "admitted");
                Ok(Permit::new(key, permit))
            }
            Err(TryAcquireError::NoPermits) => Err(AdmissionError::NoFreeSlot),
            Err(TryAcquireError::Closed) => Err(AdmissionError::Closed),
        }
    }

    /// Take a free slot, or a place in the backlog, or refuse.
    pub fn reserve(&self, key: &str) -> Result<Admission, AdmissionError> {
        match self.try_admit(key) {
            Ok(permit) => return Ok(Admission::Ready(permit)),
            Err(AdmissionError::NoFreeSlot) => {}
            Err(err) => return Err(err),
        }

        let max_backlog = self.settings.max_backlog;
        let position = self
            .waiting
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max_backlog).then_some(n + 1)
            })
            .map_err(|_| {
                warn!(key, max_backlog, "admission backlog full, rejecting");
                AdmissionError::TooManyQueued
            })?
            + 1;

        debug!(key, position, "queued for a build slot");
        Ok(Admission::Waiting(Ticket {
            key: key.to_string(),
            position,
            slots: Arc::clone(&self.slots),
            waiting: Arc::clone(&self.waiting),
        }))
    }

    /// Wait for a slot, or fail at once if the backlog is full.
    pub async fn admit(&self, key: &str) -> Result<Permit, AdmissionError> {
        match self.reserve(key)? {
            Admission::Ready(permit) => Ok(permit),
            Admission::Waiting(ticket) => ticket.wait().await,
        }
    }

    /// Stop admitting. Waiting tickets fail with [`AdmissionError::Closed`];
    /// running builds keep their slots.
    pub fn close(&self) {
        self.slots.close();
    }
}

/// A place in the backlog.
///
/// Dropping the ticket (e.g. because the client went away) gives up the
/// place.
#[derive(Debug)]
pub struct Ticket {
    key: String,
    position: usize,
    slots: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
}

impl Ticket {
    /// 1-based position at the time the ticket was issued.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Wait for a slot. Waiters are served first come, first served.
    pub async fn wait(self) -> Result<Permit, AdmissionError> {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| AdmissionError::Closed)?;
        debug!(key = %self.key, "slot freed, leaving backlog");
        Ok(Permit::new(&self.key, permit))
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.waiting.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A held build slot, released on drop.
#[derive(Debug)]
pub struct Permit {
    key: String,
    _slot: OwnedSemaphorePermit,
}

impl Permit {
    fn new(key: &str, slot: OwnedSemaphorePermit) -> Self {
        Self {
            key: key.to_string(),
            _slot: slot,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        debug!(key = %self.key, "build slot released");
    }
}
