//! Per-photo upload state machine.
//!
//! Every status change goes through [`transition`]; callers never assign
//! [`UploadStatus`] directly. The table is pure so it can be exercised without I/O.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    #[default]
    Idle,
    Preparing,
    Queued,
    Uploading,
    Processing,
    Done,
    Error,
}

impl UploadStatus {
    /// Bound to the executor.
    pub fn is_active(self) -> bool {
        matches!(self, UploadStatus::Uploading | UploadStatus::Processing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadEvent {
    /// File exceeds the compression threshold; local re-encode starts.
    Prepare,
    /// Task placed in the queue (fresh selection or post-compression).
    Enqueue,
    /// Scheduler bound the task to the executor.
    Start,
    /// Raw bytes confirmed in storage.
    Uploaded,
    /// Optimization finished and paths resolved.
    Processed,
    /// Retryable failure with budget left; task goes back to the front.
    Retry,
    /// Terminal failure.
    Fail,
    /// User-initiated abort.
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid upload transition from {from:?} on {event:?}")]
pub struct InvalidTransition {
    pub from: UploadStatus,
    pub event: UploadEvent,
}

pub fn transition(
    current: UploadStatus,
    event: UploadEvent,
) -> Result<UploadStatus, InvalidTransition> {
    use UploadEvent as E;
    use UploadStatus as S;
    let next = match (current, event) {
        (S::Idle | S::Done | S::Error, E::Prepare) => S::Preparing,
        (S::Idle | S::Preparing | S::Done | S::Error, E::Enqueue) => S::Queued,
        (S::Queued, E::Start) => S::Uploading,
        (S::Uploading, E::Uploaded) => S::Processing,
        (S::Processing, E::Processed) => S::Done,
        (S::Uploading | S::Processing, E::Retry) => S::Queued,
        (S::Preparing | S::Uploading | S::Processing, E::Fail) => S::Error,
        (S::Preparing | S::Queued | S::Uploading | S::Processing, E::Cancel) => S::Idle,
        (from, event) => return Err(InvalidTransition { from, event }),
    };
    Ok(next)
}

/// Transient per-photo view rendered by the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct UploadState {
    pub status: UploadStatus,
    pub progress: u8,
    pub attempts: u32,
    pub message: Option<String>,
}

impl UploadState {
    /// Apply an event, adjusting progress the way each edge requires.
    pub fn apply(&mut self, event: UploadEvent) -> Result<UploadStatus, InvalidTransition> {
        let next = transition(self.status, event)?;
        match event {
            UploadEvent::Start | UploadEvent::Cancel | UploadEvent::Retry | UploadEvent::Enqueue => {
                self.progress = 0
            }
            UploadEvent::Uploaded | UploadEvent::Processed => self.progress = 100,
            _ => {}
        }
        self.status = next;
        Ok(next)
    }

    /// Raise progress; lower values are dropped so the bar never moves backwards.
    pub fn advance(&mut self, pct: u8) -> bool {
        let pct = pct.min(100);
        if self.status != UploadStatus::Uploading || pct <= self.progress {
            return false;
        }
        self.progress = pct;
        true
    }
}
