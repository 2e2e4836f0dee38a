use crate::backend::{MetadataStore, ObjectStorage, Optimizer, PhotoRow, RowStatus};
use crate::error::{PipelineError, PipelineResult};
use crate::model::{PhotoId, ProcessedPhoto};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Race `fut` against the task's cancellation token.
pub async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = PipelineResult<T>>,
) -> PipelineResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        r = fut => r,
    }
}

#[derive(Debug, Clone)]
pub struct HandoffRequest {
    pub photo_id: PhotoId,
    pub report_id: String,
    pub raw_path: String,
    pub description: String,
    pub original_size: u64,
}

/// Connects a stored raw upload to remote optimization and the derived asset paths.
#[derive(Clone)]
pub struct Handoff {
    storage: Arc<dyn ObjectStorage>,
    metadata: Arc<dyn MetadataStore>,
    optimizer: Arc<dyn Optimizer>,
}

impl Handoff {
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        metadata: Arc<dyn MetadataStore>,
        optimizer: Arc<dyn Optimizer>,
    ) -> Self {
        Self {
            storage,
            metadata,
            optimizer,
        }
    }

    pub async fn run(
        &self,
        req: &HandoffRequest,
        cancel: &CancellationToken,
    ) -> PipelineResult<ProcessedPhoto> {
        let mut row = PhotoRow {
            id: req.photo_id,
            report_id: req.report_id.clone(),
            storage_path: Some(req.raw_path.clone()),
            optimized_path: None,
            thumbnail_path: None,
            description: Some(req.description.clone()),
            original_size: Some(req.original_size),
            status: RowStatus::Processing,
            error: None,
        };
        cancellable(cancel, self.metadata.upsert(&row)).await?;

        let out = cancellable(
            cancel,
            self.optimizer.optimize(req.photo_id, &req.raw_path),
        )
        .await?;
        if out.optimized_path.is_none() {
            tracing::warn!(photo = %req.photo_id, "optimizer reported no optimized path; serving raw upload");
        }

        let display_path = out.optimized_path.as_deref().unwrap_or(&req.raw_path);
        let processed = ProcessedPhoto {
            raw_path: req.raw_path.clone(),
            display_url: self.storage.public_url(display_path),
            thumbnail_url: out.thumbnail_path.as_deref().map(|p| self.storage.public_url(p)),
            optimized_path: out.optimized_path,
            thumbnail_path: out.thumbnail_path,
        };

        row.optimized_path = processed.optimized_path.clone();
        row.thumbnail_path = processed.thumbnail_path.clone();
        row.description = None;
        row.status = RowStatus::Done;
        cancellable(cancel, self.metadata.upsert(&row)).await?;
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::OptimizeOutput;
    use crate::testing::FakeBackend;

    fn request() -> HandoffRequest {
        HandoffRequest {
            photo_id: PhotoId::new(),
            report_id: "r".into(),
            raw_path: "r/p/1-a.jpg".into(),
            description: "east facade".into(),
            original_size: 2048,
        }
    }

    fn handoff(fake: &Arc<FakeBackend>) -> Handoff {
        let backend = fake.backend();
        Handoff::new(backend.storage, backend.metadata, backend.optimizer)
    }

    #[tokio::test]
    async fn stores_done_row_with_derived_paths() {
        let fake = FakeBackend::signed_in();
        let req = request();
        let out = handoff(&fake)
            .run(&req, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.optimized_path.as_deref(), Some("r/p/1-a.jpg.opt.webp"));
        assert_eq!(out.display_url, fake.url_for("r/p/1-a.jpg.opt.webp"));
        assert_eq!(out.thumbnail_url, Some(fake.url_for("r/p/1-a.jpg.thumb.webp")));

        let row = fake.row(req.photo_id).unwrap();
        assert_eq!(row.status, RowStatus::Done);
        assert_eq!(row.storage_path.as_deref(), Some("r/p/1-a.jpg"));
        assert_eq!(row.description.as_deref(), Some("east facade"));
        assert_eq!(row.original_size, Some(2048));
        assert_eq!(row.error, None);
    }

    #[tokio::test]
    async fn missing_optimized_path_serves_raw() {
        let fake = FakeBackend::signed_in();
        fake.set_optimize_output(OptimizeOutput::default());
        let req = request();
        let out = handoff(&fake)
            .run(&req, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.display_url, fake.url_for("r/p/1-a.jpg"));
        assert_eq!(out.thumbnail_url, None);
    }

    #[tokio::test]
    async fn optimizer_failure_leaves_processing_row() {
        let fake = FakeBackend::signed_in();
        fake.fail_optimizations([PipelineError::Transport("timeout".into())]);
        let req = request();
        let err = handoff(&fake)
            .run(&req, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(fake.row(req.photo_id).unwrap().status, RowStatus::Processing);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_any_call() {
        let fake = FakeBackend::signed_in();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = handoff(&fake).run(&request(), &cancel).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(fake.optimize_calls(), 0);
    }
}
