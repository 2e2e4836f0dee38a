use crate::model::PhotoId;
use tokio_util::sync::CancellationToken;

/// Marker for the task currently bound to the executor.
#[derive(Debug, Clone)]
pub struct ActiveTask {
    pub photo_id: PhotoId,
    /// Distinguishes successive tasks for the same photo.
    pub ticket: u64,
    /// Object path the task writes to, for cleanup when the photo is removed mid-transfer.
    pub storage_path: String,
    pub cancel: CancellationToken,
}

/// Single-owner execution slot. Only the scheduler acquires it and only the
/// completion path of the task it started releases it.
#[derive(Debug, Default)]
pub struct ExecutionSlot {
    active: Option<ActiveTask>,
    next_ticket: u64,
}

impl ExecutionSlot {
    pub fn try_acquire(&mut self, photo_id: PhotoId, storage_path: &str) -> Option<ActiveTask> {
        if self.active.is_some() {
            return None;
        }
        self.next_ticket += 1;
        let task = ActiveTask {
            photo_id,
            ticket: self.next_ticket,
            storage_path: storage_path.to_string(),
            cancel: CancellationToken::new(),
        };
        self.active = Some(task.clone());
        Some(task)
    }

    /// Release only if `ticket` still owns the slot.
    pub fn release(&mut self, ticket: u64) -> bool {
        match &self.active {
            Some(a) if a.ticket == ticket => {
                self.active = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    pub fn owns(&self, ticket: u64) -> bool {
        self.active.as_ref().is_some_and(|a| a.ticket == ticket)
    }

    pub fn active(&self) -> Option<&ActiveTask> {
        self.active.as_ref()
    }

    /// Abort the active transfer if it belongs to `photo_id`.
    pub fn cancel_if(&self, photo_id: PhotoId) -> bool {
        match &self.active {
            Some(a) if a.photo_id == photo_id => {
                a.cancel.cancel();
                true
            }
            _ => false,
        }
    }
}
