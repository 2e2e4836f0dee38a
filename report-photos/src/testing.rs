//! In-memory collaborators for pipeline tests.

use crate::backend::{
    Backend, MetadataStore, MetricEvent, MetricsSink, ObjectStorage, OptimizeOutput, Optimizer,
    PhotoRow, ProgressFn, RowStatus, Session, SessionProvider, SharedSession,
};
use crate::error::{PipelineError, PipelineResult};
use crate::model::{PhotoFile, PhotoId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct FakeState {
    uploads: Vec<String>,
    removed: Vec<Vec<String>>,
    rows: Vec<PhotoRow>,
    deleted: Vec<PhotoId>,
    metrics: Vec<MetricEvent>,
    upload_failures: VecDeque<PipelineError>,
    optimize_failures: VecDeque<PipelineError>,
    optimize_output: Option<OptimizeOutput>,
    optimize_calls: usize,
    fail_delete: bool,
}

pub struct FakeBackend {
    state: Mutex<FakeState>,
    pub session: Arc<SharedSession>,
    hold: AtomicBool,
    /// Fired when a held upload has reported 50%.
    pub upload_started: Notify,
    /// Lets a held upload finish.
    pub release: Notify,
}

impl FakeBackend {
    pub fn signed_in() -> Arc<Self> {
        let fake = Self::signed_out();
        fake.sign_in();
        fake
    }

    pub fn signed_out() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState::default()),
            session: Arc::new(SharedSession::default()),
            hold: AtomicBool::new(false),
            upload_started: Notify::new(),
            release: Notify::new(),
        })
    }

    pub fn sign_in(&self) {
        self.session.set(Session {
            access_token: "test-token".into(),
        });
    }

    pub fn backend(self: &Arc<Self>) -> Backend {
        Backend {
            session: Arc::clone(&self.session) as Arc<dyn SessionProvider>,
            storage: Arc::clone(self) as Arc<dyn ObjectStorage>,
            metadata: Arc::clone(self) as Arc<dyn MetadataStore>,
            optimizer: Arc::clone(self) as Arc<dyn Optimizer>,
            metrics: Arc::clone(self) as Arc<dyn MetricsSink>,
        }
    }

    pub fn url_for(&self, path: &str) -> String {
        format!("https://cdn.test/{path}")
    }

    pub fn hold_uploads(&self, hold: bool) {
        self.hold.store(hold, Ordering::SeqCst);
    }

    pub fn fail_uploads(&self, errors: impl IntoIterator<Item = PipelineError>) {
        self.state.lock().upload_failures.extend(errors);
    }

    pub fn fail_optimizations(&self, errors: impl IntoIterator<Item = PipelineError>) {
        self.state.lock().optimize_failures.extend(errors);
    }

    pub fn set_optimize_output(&self, output: OptimizeOutput) {
        self.state.lock().optimize_output = Some(output);
    }

    pub fn fail_metadata_delete(&self) {
        self.state.lock().fail_delete = true;
    }

    pub fn seed_row(&self, row: PhotoRow) {
        self.state.lock().rows.push(row);
    }

    /// Delete a row behind the pipeline's back.
    pub fn drop_row(&self, id: PhotoId) {
        self.state.lock().rows.retain(|r| r.id != id);
    }

    pub fn uploads(&self) -> Vec<String> {
        self.state.lock().uploads.clone()
    }

    pub fn removed(&self) -> Vec<Vec<String>> {
        self.state.lock().removed.clone()
    }

    pub fn deleted(&self) -> Vec<PhotoId> {
        self.state.lock().deleted.clone()
    }

    pub fn metrics(&self) -> Vec<MetricEvent> {
        self.state.lock().metrics.clone()
    }

    pub fn optimize_calls(&self) -> usize {
        self.state.lock().optimize_calls
    }

    pub fn row(&self, id: PhotoId) -> Option<PhotoRow> {
        self.state.lock().rows.iter().find(|r| r.id == id).cloned()
    }
}

#[async_trait]
impl ObjectStorage for FakeBackend {
    async fn upload(
        &self,
        path: &str,
        file: &PhotoFile,
        progress: ProgressFn,
        cancel: &CancellationToken,
    ) -> PipelineResult<()> {
        if self.session.current().await.is_none() {
            return Err(PipelineError::SessionMissing);
        }
        let scripted = {
            let mut st = self.state.lock();
            st.uploads.push(path.to_string());
            st.upload_failures.pop_front()
        };
        let total = file.len() as u64;
        if let Some(err) = scripted {
            progress(total / 4, total);
            return Err(err);
        }
        for step in 1..=4u64 {
            if step == 3 && self.hold.load(Ordering::SeqCst) {
                self.upload_started.notify_one();
                tokio::select! {
                    _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                    _ = self.release.notified() => {}
                }
            }
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            progress(total * step / 4, total);
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        self.url_for(path)
    }

    async fn remove(&self, paths: &[String]) -> PipelineResult<()> {
        self.state.lock().removed.push(paths.to_vec());
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for FakeBackend {
    async fn upsert(&self, row: &PhotoRow) -> PipelineResult<()> {
        let mut st = self.state.lock();
        match st.rows.iter_mut().find(|r| r.id == row.id) {
            Some(existing) => {
                existing.storage_path = row.storage_path.clone().or(existing.storage_path.take());
                existing.optimized_path =
                    row.optimized_path.clone().or(existing.optimized_path.take());
                existing.thumbnail_path =
                    row.thumbnail_path.clone().or(existing.thumbnail_path.take());
                existing.description = row.description.clone().or(existing.description.take());
                existing.original_size = row.original_size.or(existing.original_size);
                existing.status = row.status;
                if row.status == RowStatus::Done {
                    existing.error = None;
                } else if row.error.is_some() {
                    existing.error = row.error.clone();
                }
            }
            None => st.rows.push(row.clone()),
        }
        Ok(())
    }

    async fn insert_if_absent(&self, row: &PhotoRow) -> PipelineResult<()> {
        let mut st = self.state.lock();
        if !st.rows.iter().any(|r| r.id == row.id) {
            st.rows.push(row.clone());
        }
        Ok(())
    }

    async fn update_description(&self, id: PhotoId, description: &str) -> PipelineResult<()> {
        if let Some(row) = self.state.lock().rows.iter_mut().find(|r| r.id == id) {
            row.description = Some(description.to_string());
        }
        Ok(())
    }

    async fn delete(&self, id: PhotoId) -> PipelineResult<()> {
        let mut st = self.state.lock();
        if st.fail_delete {
            return Err(PipelineError::Rejected {
                status: 500,
                body: "delete failed".into(),
            });
        }
        st.rows.retain(|r| r.id != id);
        st.deleted.push(id);
        Ok(())
    }

    async fn list_for_report(&self, report_id: &str) -> PipelineResult<Vec<PhotoRow>> {
        Ok(self
            .state
            .lock()
            .rows
            .iter()
            .filter(|r| r.report_id == report_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl Optimizer for FakeBackend {
    async fn optimize(&self, _photo_id: PhotoId, storage_path: &str) -> PipelineResult<OptimizeOutput> {
        let mut st = self.state.lock();
        st.optimize_calls += 1;
        if let Some(err) = st.optimize_failures.pop_front() {
            return Err(err);
        }
        Ok(st.optimize_output.clone().unwrap_or_else(|| OptimizeOutput {
            optimized_path: Some(format!("{storage_path}.opt.webp")),
            thumbnail_path: Some(format!("{storage_path}.thumb.webp")),
        }))
    }
}

#[async_trait]
impl MetricsSink for FakeBackend {
    async fn record(&self, event: &MetricEvent) -> PipelineResult<()> {
        self.state.lock().metrics.push(event.clone());
        Ok(())
    }
}
