use crate::model::{PhotoFile, PhotoId};
use chrono::Utc;
use std::collections::VecDeque;

/// A unit of work for the executor. Disposable: the photo record outlives it.
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub photo_id: PhotoId,
    pub container_id: String,
    pub file: PhotoFile,
    /// Size as selected by the user, before any local re-encode.
    pub original_size: u64,
    /// Prior execution attempts.
    pub attempts: u32,
    /// Fixed at creation so retries overwrite the same object.
    pub storage_path: String,
}

impl UploadTask {
    pub fn new(photo_id: PhotoId, container_id: &str, file: PhotoFile, original_size: u64) -> Self {
        let storage_path = storage_path(
            container_id,
            photo_id,
            Utc::now().timestamp_millis(),
            &file.name,
        );
        Self {
            photo_id,
            container_id: container_id.to_string(),
            file,
            original_size,
            attempts: 0,
            storage_path,
        }
    }
}

/// `containerId/photoId/timestamp-sanitizedFilename`
pub fn storage_path(container_id: &str, photo_id: PhotoId, timestamp: i64, filename: &str) -> String {
    format!(
        "{}/{}/{}-{}",
        sanitize_segment(container_id),
        photo_id,
        timestamp,
        sanitize_filename(filename)
    )
}

/// Keep `[A-Za-z0-9._-]`, replace everything else with `_`.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "photo".to_string()
    } else {
        trimmed.to_string()
    }
}

fn sanitize_segment(segment: &str) -> String {
    segment.replace(['/', '\\'], "_")
}

/// Pending tasks. Retries go in at the front so they run before newer uploads.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: VecDeque<UploadTask>,
}

impl TaskQueue {
    pub fn enqueue(&mut self, task: UploadTask) {
        self.tasks.push_back(task);
    }

    pub fn dequeue(&mut self) -> Option<UploadTask> {
        self.tasks.pop_front()
    }

    pub fn requeue_front(&mut self, task: UploadTask) {
        self.tasks.push_front(task);
    }

    /// Purge every pending task for a photo; returns how many were dropped.
    pub fn remove_all_for(&mut self, photo_id: PhotoId) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|t| t.photo_id != photo_id);
        before - self.tasks.len()
    }

    pub fn contains(&self, photo_id: PhotoId) -> bool {
        self.tasks.iter().any(|t| t.photo_id == photo_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn photo_ids(&self) -> Vec<PhotoId> {
        self.tasks.iter().map(|t| t.photo_id).collect()
    }
}
