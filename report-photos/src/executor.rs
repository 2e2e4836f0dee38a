use crate::backend::{MetricEvent, MetricKind, MetricsSink, ObjectStorage, ProgressFn};
use crate::error::{PipelineError, PipelineResult};
use crate::handoff::{Handoff, HandoffRequest};
use crate::model::ProcessedPhoto;
use crate::queue::UploadTask;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Receives stage updates for the task being executed.
pub trait ExecutionObserver: Send + Sync {
    fn progress(&self, pct: u8);
    /// Raw bytes are stored; processing begins.
    fn uploaded(&self);
    /// Caption at handoff time; the user may have edited it mid-upload.
    fn description(&self) -> String;
}

/// Turns byte counts into whole percentages that only move forward.
/// 100 is emitted at most once.
#[derive(Debug, Default)]
pub struct ProgressGate {
    last: AtomicU8,
}

impl ProgressGate {
    pub fn observe(&self, sent: u64, total: u64) -> Option<u8> {
        let pct = if total == 0 {
            100
        } else {
            ((sent.min(total) as f64 / total as f64) * 100.0).round() as u8
        };
        let prev = self.last.fetch_max(pct, Ordering::SeqCst);
        (pct > prev).then_some(pct)
    }
}

/// The task currently bound to the executor.
#[derive(Debug, Clone)]
pub struct Job {
    pub task: UploadTask,
    /// 1-based number of this attempt.
    pub attempt: u32,
    pub cancel: CancellationToken,
}

#[derive(Clone)]
pub struct Executor {
    storage: Arc<dyn ObjectStorage>,
    handoff: Handoff,
    metrics: Arc<dyn MetricsSink>,
}

impl Executor {
    pub fn new(storage: Arc<dyn ObjectStorage>, handoff: Handoff, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            storage,
            handoff,
            metrics,
        }
    }

    /// Upload then hand off. Every failure surfaces as an error for the retry policy.
    pub async fn execute(
        &self,
        job: &Job,
        observer: Arc<dyn ExecutionObserver>,
    ) -> PipelineResult<ProcessedPhoto> {
        let task = &job.task;
        let total = task.file.len() as u64;
        let gate = Arc::new(ProgressGate::default());
        let progress: ProgressFn = {
            let gate = Arc::clone(&gate);
            let observer = Arc::clone(&observer);
            Arc::new(move |sent: u64, total: u64| {
                if let Some(pct) = gate.observe(sent, total) {
                    observer.progress(pct);
                }
            })
        };

        tracing::debug!(photo = %task.photo_id, attempt = job.attempt, path = %task.storage_path, bytes = total, "upload started");
        let started = Instant::now();
        self.storage
            .upload(&task.storage_path, &task.file, progress, &job.cancel)
            .await?;
        if job.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        if let Some(pct) = gate.observe(total, total) {
            observer.progress(pct);
        }
        self.record(MetricEvent {
            photo_id: task.photo_id,
            event: MetricKind::Upload,
            duration_ms: started.elapsed().as_millis() as u64,
            size_bytes: total,
            metadata: serde_json::json!({
                "attempts": job.attempt,
                "path": task.storage_path,
                "originalSize": task.original_size,
                "contentType": task.file.content_type,
            }),
        })
        .await;
        observer.uploaded();

        let started = Instant::now();
        let processed = self
            .handoff
            .run(
                &HandoffRequest {
                    photo_id: task.photo_id,
                    report_id: task.container_id.clone(),
                    raw_path: task.storage_path.clone(),
                    description: observer.description(),
                    original_size: task.original_size,
                },
                &job.cancel,
            )
            .await?;
        self.record(MetricEvent {
            photo_id: task.photo_id,
            event: MetricKind::Process,
            duration_ms: started.elapsed().as_millis() as u64,
            size_bytes: total,
            metadata: serde_json::json!({
                "attempts": job.attempt,
                "optimized": processed.optimized_path.is_some(),
            }),
        })
        .await;
        Ok(processed)
    }

    async fn record(&self, event: MetricEvent) {
        if let Err(e) = self.metrics.record(&event).await {
            tracing::debug!(photo = %event.photo_id, error = %e, "metrics event dropped");
        }
    }
}
