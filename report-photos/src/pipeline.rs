//! Upload orchestration: owns the queue, the execution slot and the photo
//! board, and turns executor outcomes into state-machine events.
//!
//! Everything mutable sits behind one `parking_lot::Mutex` that is only held
//! for short synchronous sections and never across an `.await`.

use crate::backend::{Backend, PhotoRow};
use crate::board::{PhotoBoard, PhotoView};
use crate::config::{self, ImageLimits};
use crate::error::{PipelineError, PipelineResult};
use crate::executor::{ExecutionObserver, Executor, Job};
use crate::handoff::Handoff;
use crate::model::{PhotoFile, PhotoId, PhotoRecord, ProcessedPhoto};
use crate::preprocess;
use crate::queue::{TaskQueue, UploadTask};
use crate::retry::{DEFAULT_MAX_ATTEMPTS, RetryDecision, RetryPolicy};
use crate::slot::ExecutionSlot;
use crate::state::{UploadEvent, UploadState, UploadStatus};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Notify, broadcast};

const STATUS_FEED_CAPACITY: usize = 256;

/// One published state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusChange {
    pub photo_id: PhotoId,
    pub state: UploadState,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UploadSettings {
    pub compress_threshold: u64,
    pub image_limits: ImageLimits,
    pub max_attempts: u32,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            compress_threshold: config::DEFAULT_COMPRESS_THRESHOLD,
            image_limits: ImageLimits::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl UploadSettings {
    pub fn from_config(cfg: &config::Config) -> Self {
        Self {
            compress_threshold: cfg.upload.compress_threshold(),
            image_limits: cfg.image_limits.unwrap_or_default(),
            max_attempts: cfg.upload.max_attempts(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    queue: TaskQueue,
    slot: ExecutionSlot,
    board: PhotoBoard,
    /// Reports opened in this process; the reconcile job refreshes these.
    reports: BTreeSet<String>,
    /// Tasks that exhausted their attempts, kept for a manual retry.
    parked: HashMap<PhotoId, UploadTask>,
    /// Compressions in flight, keyed by photo. A result is used only while its ticket is current.
    preparing: HashMap<PhotoId, u64>,
    next_preparation: u64,
    /// Photos removed in this process; their rows are never merged back.
    removed: HashSet<PhotoId>,
}

impl Inner {
    fn begin_preparation(&mut self, photo_id: PhotoId) -> u64 {
        self.next_preparation += 1;
        self.preparing.insert(photo_id, self.next_preparation);
        self.next_preparation
    }

    /// Consume the preparation ticket if it is still the photo's current one.
    fn finish_preparation(&mut self, photo_id: PhotoId, ticket: u64) -> bool {
        if self.preparing.get(&photo_id) == Some(&ticket) {
            self.preparing.remove(&photo_id);
            true
        } else {
            false
        }
    }
}

struct Shared {
    inner: Mutex<Inner>,
    events: broadcast::Sender<StatusChange>,
}

impl Shared {
    fn publish(&self, photo_id: PhotoId, state: UploadState) {
        // no subscribers is fine
        let _ = self.events.send(StatusChange { photo_id, state });
    }
}

/// A task bound to the execution slot.
struct Running {
    job: Job,
    ticket: u64,
}

pub struct UploadPipeline {
    backend: Backend,
    executor: Executor,
    shared: Arc<Shared>,
    settings: RwLock<UploadSettings>,
    wake: Notify,
}

impl UploadPipeline {
    pub fn new(backend: Backend, settings: UploadSettings) -> Arc<Self> {
        let handoff = Handoff::new(
            Arc::clone(&backend.storage),
            Arc::clone(&backend.metadata),
            Arc::clone(&backend.optimizer),
        );
        let executor = Executor::new(
            Arc::clone(&backend.storage),
            handoff,
            Arc::clone(&backend.metrics),
        );
        let (events, _) = broadcast::channel(STATUS_FEED_CAPACITY);
        Arc::new(Self {
            backend,
            executor,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                events,
            }),
            settings: RwLock::new(settings),
            wake: Notify::new(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.shared.events.subscribe()
    }

    pub fn settings(&self) -> UploadSettings {
        *self.settings.read()
    }

    pub fn update_settings(&self, settings: UploadSettings) {
        tracing::info!(threshold = settings.compress_threshold, max_attempts = settings.max_attempts, "upload settings updated");
        *self.settings.write() = settings;
    }

    /// Resolves when a task was enqueued or the slot was freed.
    pub async fn wait_for_work(&self) {
        self.wake.notified().await
    }

    async fn require_session(&self) -> PipelineResult<()> {
        match self.backend.session.current().await {
            Some(_) => Ok(()),
            None => Err(PipelineError::SessionMissing),
        }
    }

    /// Add an empty photo slot to a report.
    pub fn add_photo(&self, report_id: &str, description: Option<String>) -> PhotoView {
        let mut record = PhotoRecord::new(report_id);
        record.description = description.unwrap_or_default();
        let view = PhotoView {
            record: record.clone(),
            upload: UploadState::default(),
        };
        let mut inner = self.shared.inner.lock();
        inner.reports.insert(report_id.to_string());
        inner.board.insert(record);
        view
    }

    /// Add a photo and queue its file in one step.
    pub async fn attach_photo(
        &self,
        report_id: &str,
        file: PhotoFile,
        description: Option<String>,
    ) -> PipelineResult<PhotoId> {
        self.require_session().await?;
        let id = self.add_photo(report_id, description).record.id;
        if let Err(e) = self.select_file(id, file).await {
            self.shared.inner.lock().board.remove(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Choose or replace the file of an existing photo. Also the manual retry
    /// path: a fresh task starts with zero attempts.
    pub async fn select_file(&self, photo_id: PhotoId, file: PhotoFile) -> PipelineResult<()> {
        self.require_session().await?;
        let settings = self.settings();
        let original_size = file.len() as u64;
        let compress = preprocess::needs_compression(&file, settings.compress_threshold);

        let (report_id, preparation) = {
            let mut inner = self.shared.inner.lock();
            let Some(record) = inner.board.record(photo_id) else {
                return Err(PipelineError::PhotoNotFound(photo_id));
            };
            let report_id = record.report_id.clone();
            let status = inner.board.state(photo_id).map(|s| s.status).unwrap_or_default();
            if status.is_active() || status == UploadStatus::Preparing {
                return Err(PipelineError::Busy(photo_id));
            }
            inner.parked.remove(&photo_id);
            if inner.queue.contains(photo_id) {
                inner.queue.remove_all_for(photo_id);
                let state = inner.board.apply(photo_id, UploadEvent::Cancel, |s| {
                    s.attempts = 0;
                    s.message = None;
                })?;
                self.shared.publish(photo_id, state);
                tracing::debug!(photo = %photo_id, "replaced queued file");
            }
            let preparation = if compress {
                let state = inner.board.apply(photo_id, UploadEvent::Prepare, |s| {
                    s.message = None;
                })?;
                self.shared.publish(photo_id, state);
                Some(inner.begin_preparation(photo_id))
            } else {
                None
            };
            (report_id, preparation)
        };

        let file = if compress {
            tracing::debug!(photo = %photo_id, bytes = original_size, threshold = settings.compress_threshold, "compressing before upload");
            preprocess::shrink(file, settings.image_limits).await
        } else {
            file
        };

        {
            let mut inner = self.shared.inner.lock();
            if let Some(ticket) = preparation
                && !inner.finish_preparation(photo_id, ticket)
            {
                tracing::debug!(photo = %photo_id, "photo changed while compressing; dropping file");
                return Ok(());
            }
            let task = UploadTask::new(photo_id, &report_id, file, original_size);
            let state = inner.board.apply(photo_id, UploadEvent::Enqueue, |s| {
                s.attempts = 0;
                s.message = None;
            })?;
            tracing::info!(photo = %photo_id, path = %task.storage_path, bytes = task.file.len(), "upload queued");
            inner.queue.enqueue(task);
            self.shared.publish(photo_id, state);
        }
        self.wake.notify_one();
        Ok(())
    }

    /// Requeue a photo whose upload exhausted its attempts, reusing the file.
    pub fn retry(&self, photo_id: PhotoId) -> PipelineResult<()> {
        {
            let mut inner = self.shared.inner.lock();
            if !inner.board.contains(photo_id) {
                return Err(PipelineError::PhotoNotFound(photo_id));
            }
            let Some(mut task) = inner.parked.remove(&photo_id) else {
                return Err(PipelineError::NothingToRetry(photo_id));
            };
            task.attempts = 0;
            let state = match inner.board.apply(photo_id, UploadEvent::Enqueue, |s| {
                s.attempts = 0;
                s.message = None;
            }) {
                Ok(state) => state,
                Err(e) => {
                    inner.parked.insert(photo_id, task);
                    return Err(e);
                }
            };
            inner.queue.enqueue(task);
            self.shared.publish(photo_id, state);
            tracing::info!(photo = %photo_id, "manual retry queued");
        }
        self.wake.notify_one();
        Ok(())
    }

    /// Abort the photo's transfer or pending task. Returns false when nothing was running.
    pub fn cancel(&self, photo_id: PhotoId) -> PipelineResult<bool> {
        let mut inner = self.shared.inner.lock();
        if !inner.board.contains(photo_id) {
            return Err(PipelineError::PhotoNotFound(photo_id));
        }
        if inner.slot.cancel_if(photo_id) {
            tracing::info!(photo = %photo_id, "cancelling active upload");
            return Ok(true);
        }
        let purged = inner.queue.remove_all_for(photo_id);
        let preparing = inner.preparing.remove(&photo_id).is_some();
        if purged == 0 && !preparing {
            return Ok(false);
        }
        let state = inner.board.apply(photo_id, UploadEvent::Cancel, |s| {
            s.attempts = 0;
            s.message = None;
        })?;
        self.shared.publish(photo_id, state);
        tracing::info!(photo = %photo_id, purged, "cancelled pending upload");
        Ok(true)
    }

    /// Drop a photo everywhere. Stored bytes are removed best-effort; a failed
    /// metadata delete is returned to the caller.
    pub async fn remove(&self, photo_id: PhotoId) -> PipelineResult<()> {
        let mut paths = {
            let mut inner = self.shared.inner.lock();
            let Some(record) = inner.board.record(photo_id).cloned() else {
                return Err(PipelineError::PhotoNotFound(photo_id));
            };
            let mut paths = record.stored_paths();
            if let Some(active) = inner.slot.active()
                && active.photo_id == photo_id
            {
                active.cancel.cancel();
                paths.push(active.storage_path.clone());
            }
            let purged = inner.queue.remove_all_for(photo_id);
            if let Some(parked) = inner.parked.remove(&photo_id) {
                paths.push(parked.storage_path);
            }
            inner.preparing.remove(&photo_id);
            inner.removed.insert(photo_id);
            inner.board.remove(photo_id);
            tracing::info!(photo = %photo_id, purged, "photo removed");
            paths
        };
        paths.sort();
        paths.dedup();

        if !paths.is_empty()
            && let Err(e) = self.backend.storage.remove(&paths).await
        {
            tracing::warn!(photo = %photo_id, error = %e, paths = ?paths, "failed to delete stored photo objects");
        }
        self.backend.metadata.delete(photo_id).await
    }

    /// Persist a caption in any upload state. A photo without a row gets a
    /// pending one; the processing upsert later fills in the rest.
    pub async fn update_description(&self, photo_id: PhotoId, text: &str) -> PipelineResult<()> {
        let pending_row = {
            let mut inner = self.shared.inner.lock();
            inner.board.set_description(photo_id, text)?;
            match inner.board.record(photo_id) {
                Some(record) if !inner.board.is_persisted(photo_id) => {
                    Some(PhotoRow::pending(photo_id, &record.report_id, text))
                }
                _ => None,
            }
        };
        if let Some(row) = pending_row {
            self.backend.metadata.insert_if_absent(&row).await?;
            let removed = {
                let mut inner = self.shared.inner.lock();
                inner.board.mark_persisted(photo_id);
                inner.removed.contains(&photo_id)
            };
            if removed {
                self.purge_orphan(photo_id, &[]).await;
                return Err(PipelineError::PhotoNotFound(photo_id));
            }
        }
        self.backend
            .metadata
            .update_description(photo_id, text)
            .await
    }

    /// Load persisted rows for a report and return its merged photo list.
    pub async fn open_report(&self, report_id: &str) -> PipelineResult<Vec<PhotoView>> {
        self.shared
            .inner
            .lock()
            .reports
            .insert(report_id.to_string());
        self.sync_report(report_id).await?;
        Ok(self.views(report_id))
    }

    pub async fn sync_report(&self, report_id: &str) -> PipelineResult<()> {
        let mut rows = self.backend.metadata.list_for_report(report_id).await?;
        let storage = Arc::clone(&self.backend.storage);
        let mut inner = self.shared.inner.lock();
        rows.retain(|r| !inner.removed.contains(&r.id));
        let count = rows.len();
        let gone = inner
            .board
            .merge_remote(report_id, rows, |p| storage.public_url(p));
        for id in &gone {
            inner.parked.remove(id);
        }
        drop(inner);
        if !gone.is_empty() {
            tracing::info!(report = %report_id, dropped = gone.len(), "photos deleted remotely");
        }
        tracing::debug!(report = %report_id, rows = count, "report synchronized");
        Ok(())
    }

    /// Refresh every opened report; failures are logged per report.
    pub async fn reconcile_all(&self) {
        if self.backend.session.current().await.is_none() {
            tracing::debug!("no session; skipping reconcile");
            return;
        }
        let reports: Vec<String> = self.shared.inner.lock().reports.iter().cloned().collect();
        for report in reports {
            if let Err(e) = self.sync_report(&report).await {
                tracing::warn!(report = %report, error = %e, "reconcile failed");
            }
        }
    }

    pub fn views(&self, report_id: &str) -> Vec<PhotoView> {
        self.shared.inner.lock().board.views_for(report_id)
    }

    pub fn view(&self, photo_id: PhotoId) -> Option<PhotoView> {
        let inner = self.shared.inner.lock();
        let record = inner.board.record(photo_id)?.clone();
        let upload = inner.board.state(photo_id).cloned().unwrap_or_default();
        Some(PhotoView { record, upload })
    }

    pub fn state(&self, photo_id: PhotoId) -> Option<UploadState> {
        self.shared.inner.lock().board.state(photo_id).cloned()
    }

    pub fn queue_len(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }

    pub fn queued(&self) -> Vec<PhotoId> {
        self.shared.inner.lock().queue.photo_ids()
    }

    pub fn is_busy(&self) -> bool {
        self.shared.inner.lock().slot.is_busy()
    }

    /// Bind the front task to the slot if the slot is free and a session exists.
    /// Slot check and pop happen in one critical section.
    async fn begin_next(&self) -> Option<Running> {
        if self.backend.session.current().await.is_none() {
            return None;
        }
        let mut inner = self.shared.inner.lock();
        if inner.slot.is_busy() || inner.queue.is_empty() {
            return None;
        }
        let task = inner.queue.dequeue()?;
        let active = inner.slot.try_acquire(task.photo_id, &task.storage_path)?;
        let attempt = task.attempts + 1;
        match inner.board.apply(task.photo_id, UploadEvent::Start, |s| {
            s.attempts = attempt;
        }) {
            Ok(state) => self.shared.publish(task.photo_id, state),
            Err(e) => {
                tracing::warn!(photo = %task.photo_id, error = %e, "dropping stale task");
                inner.slot.release(active.ticket);
                return None;
            }
        }
        Some(Running {
            job: Job {
                task,
                attempt,
                cancel: active.cancel,
            },
            ticket: active.ticket,
        })
    }

    /// Start the next task on its own tokio task. Returns whether one started.
    pub async fn pump(self: &Arc<Self>) -> bool {
        let Some(running) = self.begin_next().await else {
            return false;
        };
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run(running).await });
        true
    }

    /// Run the next task to completion on the current task.
    #[cfg(test)]
    pub async fn drive_one(&self) -> Option<PhotoId> {
        let running = self.begin_next().await?;
        let id = running.job.task.photo_id;
        self.run(running).await;
        Some(id)
    }

    async fn run(&self, running: Running) {
        let photo_id = running.job.task.photo_id;
        let observer: Arc<dyn ExecutionObserver> = Arc::new(TaskObserver {
            shared: Arc::clone(&self.shared),
            photo_id,
            ticket: running.ticket,
        });
        let result = self.executor.execute(&running.job, observer).await;
        self.finish(running, result).await;
    }

    fn settle_success(&self, inner: &mut Inner, photo_id: PhotoId, processed: &ProcessedPhoto) -> PipelineResult<UploadState> {
        inner.board.apply_processed(photo_id, processed)?;
        inner.board.mark_persisted(photo_id);
        inner.board.apply(photo_id, UploadEvent::Processed, |s| {
            s.message = None;
        })
    }

    async fn finish(&self, running: Running, result: PipelineResult<ProcessedPhoto>) {
        let Running { job, ticket } = running;
        let photo_id = job.task.photo_id;
        let mut task = job.task;
        let policy = RetryPolicy::new(self.settings().max_attempts);
        let mut failed: Option<(String, String)> = None;
        let mut orphaned: Option<Vec<String>> = None;
        {
            let mut inner = self.shared.inner.lock();
            match result {
                Ok(processed) => match self.settle_success(&mut inner, photo_id, &processed) {
                    Ok(state) => {
                        tracing::info!(photo = %photo_id, attempts = state.attempts, url = %processed.display_url, "photo uploaded");
                        self.shared.publish(photo_id, state);
                    }
                    Err(e) => {
                        tracing::debug!(photo = %photo_id, error = %e, "photo gone before completion");
                        if inner.removed.contains(&photo_id) {
                            orphaned = Some(
                                [Some(processed.raw_path), processed.optimized_path, processed.thumbnail_path]
                                    .into_iter()
                                    .flatten()
                                    .collect(),
                            );
                        }
                    }
                },
                Err(err) => match policy.decide(&err, job.attempt) {
                    RetryDecision::ResetIdle => {
                        let prior = task.attempts;
                        match inner.board.apply(photo_id, UploadEvent::Cancel, |s| {
                            s.attempts = prior;
                            s.message = None;
                        }) {
                            Ok(state) => {
                                tracing::info!(photo = %photo_id, "upload cancelled");
                                self.shared.publish(photo_id, state);
                            }
                            Err(e) => {
                                tracing::debug!(photo = %photo_id, error = %e, "cancelled task has no photo")
                            }
                        }
                    }
                    RetryDecision::Requeue { attempts, message } => {
                        tracing::warn!(photo = %photo_id, attempt = attempts, error = %err, "upload failed; retrying");
                        task.attempts = attempts;
                        let update = inner.board.apply(photo_id, UploadEvent::Retry, |s| {
                            s.attempts = attempts;
                            s.message = Some(message);
                        });
                        match update {
                            Ok(state) => {
                                inner.queue.requeue_front(task);
                                self.shared.publish(photo_id, state);
                            }
                            Err(e) => {
                                tracing::debug!(photo = %photo_id, error = %e, "not requeueing")
                            }
                        }
                    }
                    RetryDecision::GiveUp { attempts, message } => {
                        tracing::error!(photo = %photo_id, attempts, error = %err, "upload failed permanently");
                        task.attempts = attempts;
                        let update = inner.board.apply(photo_id, UploadEvent::Fail, |s| {
                            s.attempts = attempts;
                            s.message = Some(message.clone());
                        });
                        match update {
                            Ok(state) => {
                                failed = Some((task.container_id.clone(), message));
                                inner.board.mark_persisted(photo_id);
                                inner.parked.insert(photo_id, task);
                                self.shared.publish(photo_id, state);
                            }
                            Err(e) => {
                                tracing::debug!(photo = %photo_id, error = %e, "failed task has no photo")
                            }
                        }
                    }
                },
            }
            inner.slot.release(ticket);
        }

        if let Some((report_id, message)) = failed {
            if let Err(e) = self
                .backend
                .metadata
                .record_error(photo_id, &report_id, &message)
                .await
            {
                tracing::warn!(photo = %photo_id, error = %e, "failed to persist upload error");
            }
            // removed while the error row was in flight
            if self.shared.inner.lock().removed.contains(&photo_id) {
                orphaned = Some(Vec::new());
            }
        }
        if let Some(paths) = orphaned {
            self.purge_orphan(photo_id, &paths).await;
        }
        self.wake.notify_one();
    }

    /// Delete what a finished task wrote for a photo that was removed meanwhile.
    async fn purge_orphan(&self, photo_id: PhotoId, paths: &[String]) {
        tracing::info!(photo = %photo_id, "cleaning up after removed photo");
        if !paths.is_empty()
            && let Err(e) = self.backend.storage.remove(paths).await
        {
            tracing::warn!(photo = %photo_id, error = %e, "failed to delete orphaned objects");
        }
        if let Err(e) = self.backend.metadata.delete(photo_id).await {
            tracing::warn!(photo = %photo_id, error = %e, "failed to delete orphaned row");
        }
    }
}

/// Routes executor callbacks to the board, guarded by the slot ticket.
struct TaskObserver {
    shared: Arc<Shared>,
    photo_id: PhotoId,
    ticket: u64,
}

impl ExecutionObserver for TaskObserver {
    fn progress(&self, pct: u8) {
        let mut inner = self.shared.inner.lock();
        if !inner.slot.owns(self.ticket) {
            return;
        }
        if let Some(state) = inner.board.advance(self.photo_id, pct) {
            self.shared.publish(self.photo_id, state);
        }
    }

    fn uploaded(&self) {
        let mut inner = self.shared.inner.lock();
        if !inner.slot.owns(self.ticket) {
            return;
        }
        match inner.board.apply(self.photo_id, UploadEvent::Uploaded, |_| {}) {
            Ok(state) => {
                // the handoff writes the row next
                inner.board.mark_persisted(self.photo_id);
                self.shared.publish(self.photo_id, state);
            }
            Err(e) => tracing::debug!(photo = %self.photo_id, error = %e, "upload landed for a missing photo"),
        }
    }

    fn description(&self) -> String {
        self.shared
            .inner
            .lock()
            .board
            .record(self.photo_id)
            .map(|r| r.description.clone())
            .unwrap_or_default()
    }
}
