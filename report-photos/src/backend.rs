use crate::error::PipelineResult;
use crate::model::{PhotoFile, PhotoId, PhotoRecord};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// `(bytes_sent, bytes_total)` callback fired as the body streams out.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
}

impl Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("access_token", &"<redacted>").finish()
    }
}

/// Supplies the bearer credential; `None` disables uploads.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn current(&self) -> Option<Session>;
}

/// Session slot the HTTP layer signs in and out of.
#[derive(Debug, Default)]
pub struct SharedSession {
    inner: parking_lot::RwLock<Option<Session>>,
}

impl SharedSession {
    pub fn new(initial: Option<Session>) -> Self {
        Self {
            inner: parking_lot::RwLock::new(initial),
        }
    }

    pub fn set(&self, session: Session) {
        *self.inner.write() = Some(session);
    }

    pub fn clear(&self) {
        *self.inner.write() = None;
    }

    pub fn is_signed_in(&self) -> bool {
        self.inner.read().is_some()
    }
}

#[async_trait]
impl SessionProvider for SharedSession {
    async fn current(&self) -> Option<Session> {
        self.inner.read().clone()
    }
}

/// Object store bucket holding raw uploads and their derived variants.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Put `file` at `path`, overwriting any existing object. Must return
    /// `PipelineError::Cancelled` promptly once `cancel` fires.
    async fn upload(
        &self,
        path: &str,
        file: &PhotoFile,
        progress: ProgressFn,
        cancel: &CancellationToken,
    ) -> PipelineResult<()>;

    fn public_url(&self, path: &str) -> String;

    async fn remove(&self, paths: &[String]) -> PipelineResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    Processing,
    Done,
    Error,
    #[default]
    #[serde(other)]
    Pending,
}

/// Persisted photo metadata row. Unset optionals are left untouched on upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoRow {
    pub id: PhotoId,
    pub report_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimized_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_size: Option<u64>,
    #[serde(default)]
    pub status: RowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PhotoRow {
    pub fn error(id: PhotoId, report_id: &str, message: &str) -> Self {
        Self {
            id,
            report_id: report_id.to_string(),
            storage_path: None,
            optimized_path: None,
            thumbnail_path: None,
            description: None,
            original_size: None,
            status: RowStatus::Error,
            error: Some(message.to_string()),
        }
    }

    /// Row for a photo that has a caption but no upload yet.
    pub fn pending(id: PhotoId, report_id: &str, description: &str) -> Self {
        Self {
            description: Some(description.to_string()),
            status: RowStatus::Pending,
            error: None,
            ..Self::error(id, report_id, "")
        }
    }

    pub fn into_record(self, public_url: impl Fn(&str) -> String) -> PhotoRecord {
        let mut record = PhotoRecord {
            id: self.id,
            report_id: self.report_id,
            raw_path: self.storage_path,
            optimized_path: self.optimized_path,
            thumbnail_path: self.thumbnail_path,
            display_url: None,
            thumbnail_url: None,
            description: self.description.unwrap_or_default(),
        };
        record.display_url = record.display_path().map(&public_url);
        record.thumbnail_url = record.thumbnail_path.as_deref().map(&public_url);
        record
    }
}

/// Relational store of photo metadata; the source of truth for whether a photo exists.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Upsert keyed by id. A `Done` row also clears any stored error.
    async fn upsert(&self, row: &PhotoRow) -> PipelineResult<()>;

    /// Create the row unless one with the same id exists; an existing row is left as is.
    async fn insert_if_absent(&self, row: &PhotoRow) -> PipelineResult<()>;

    async fn update_description(&self, id: PhotoId, description: &str) -> PipelineResult<()>;

    async fn delete(&self, id: PhotoId) -> PipelineResult<()>;

    async fn list_for_report(&self, report_id: &str) -> PipelineResult<Vec<PhotoRow>>;

    async fn record_error(&self, id: PhotoId, report_id: &str, message: &str) -> PipelineResult<()> {
        self.upsert(&PhotoRow::error(id, report_id, message)).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeOutput {
    #[serde(default)]
    pub optimized_path: Option<String>,
    #[serde(default)]
    pub thumbnail_path: Option<String>,
}

/// Remote downsizing/thumbnailing step. Its algorithm is opaque here.
#[async_trait]
pub trait Optimizer: Send + Sync {
    async fn optimize(&self, photo_id: PhotoId, storage_path: &str) -> PipelineResult<OptimizeOutput>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Upload,
    Process,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricEvent {
    pub photo_id: PhotoId,
    pub event: MetricKind,
    pub duration_ms: u64,
    pub size_bytes: u64,
    pub metadata: serde_json::Value,
}

/// Fire-and-forget stage timings. Callers swallow failures.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn record(&self, event: &MetricEvent) -> PipelineResult<()>;
}

/// The set of collaborators the pipeline is wired against.
#[derive(Clone)]
pub struct Backend {
    pub session: Arc<dyn SessionProvider>,
    pub storage: Arc<dyn ObjectStorage>,
    pub metadata: Arc<dyn MetadataStore>,
    pub optimizer: Arc<dyn Optimizer>,
    pub metrics: Arc<dyn MetricsSink>,
}
