//! Bounds how many sandboxes run at once.

use crate::{Error, Result};
use serde_derive::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;

/// What happens to a submission that arrives while every slot is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "mode")]
pub enum AdmissionPolicy {
    /// Wait in a FIFO queue holding at most `capacity` submissions.
    Queue { capacity: usize },
    /// Fail immediately with [`Error::CapacityExceeded`].
    Reject,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        AdmissionPolicy::Queue { capacity: 64 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateStatus {
    pub slots: usize,
    pub in_use: usize,
    pub queued: usize,
}

/// Fixed pool of execution slots. A slot is a semaphore permit; dropping it
/// frees the slot, so it is released on every exit path.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    slots: usize,
    policy: AdmissionPolicy,
    semaphore: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
}

/// Counts a waiting submission for as long as it is in the queue.
struct QueueTicket<'a>(&'a AtomicUsize);

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AdmissionGate {
    pub fn new(slots: usize, policy: AdmissionPolicy) -> Self {
        AdmissionGate {
            slots,
            policy,
            semaphore: Arc::new(Semaphore::new(slots)),
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Waits for a slot according to the policy. A submission cancelled while
    /// queued simply leaves the queue; one cancelled beforehand takes no slot.
    pub async fn admit(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => return Ok(permit),
            Err(TryAcquireError::Closed) => return Err(self.exceeded()),
            Err(TryAcquireError::NoPermits) => {}
        }

        let capacity = match self.policy {
            AdmissionPolicy::Reject => return Err(self.exceeded()),
            AdmissionPolicy::Queue { capacity } => capacity,
        };

        let reserved = self
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |queued| {
                if queued < capacity {
                    Some(queued + 1)
                } else {
                    None
                }
            });
        if reserved.is_err() {
            return Err(self.exceeded());
        }
        let _ticket = QueueTicket(&self.queued);

        tokio::select! {
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.map_err(|_| self.exceeded())
            }
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    pub fn status(&self) -> GateStatus {
        GateStatus {
            slots: self.slots,
            in_use: self.slots - self.semaphore.available_permits(),
            queued: self.queued.load(Ordering::SeqCst),
        }
    }

    fn exceeded(&self) -> Error {
        Error::CapacityExceeded {
            slots: self.slots,
            queued: self.queued.load(Ordering::SeqCst),
        }
    }
}
