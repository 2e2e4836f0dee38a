//! HTTP client for the hosted backend: object storage, REST tables and
//! serverless functions behind one base URL.

use crate::backend::{
    MetadataStore, MetricEvent, MetricsSink, ObjectStorage, OptimizeOutput, Optimizer, PhotoRow,
    ProgressFn, RowStatus, SessionProvider,
};
use crate::config;
use crate::error::{PipelineError, PipelineResult};
use crate::model::{PhotoFile, PhotoId};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{RequestBuilder, Response};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Characters left as-is inside one path segment or query value.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

pub fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|seg| utf8_percent_encode(seg, SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

pub struct HttpBackend {
    client: reqwest::Client,
    cfg: config::Backend,
    session: Arc<dyn SessionProvider>,
    chunk_size: usize,
}

impl HttpBackend {
    pub fn new(cfg: config::Backend, session: Arc<dyn SessionProvider>, chunk_size: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            cfg,
            session,
            chunk_size: chunk_size.max(1),
        }
    }

    fn base(&self) -> &str {
        self.cfg.base_url.trim_end_matches('/')
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base(), table)
    }

    fn object_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/{}/{}",
            self.base(),
            self.cfg.storage_bucket,
            encode_path(path)
        )
    }

    async fn authed(&self, req: RequestBuilder) -> PipelineResult<RequestBuilder> {
        let session = self
            .session
            .current()
            .await
            .ok_or(PipelineError::SessionMissing)?;
        let req = req.bearer_auth(&session.access_token);
        Ok(match &self.cfg.api_key {
            Some(key) => req.header("apikey", key),
            None => req,
        })
    }

    /// Send under `cancel`; dropping the in-flight future aborts the request.
    async fn send(&self, req: RequestBuilder, cancel: Option<&CancellationToken>) -> PipelineResult<Response> {
        let resp = match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => return Err(PipelineError::Cancelled),
                r = req.send() => r?,
            },
            None => req.send().await?,
        };
        check_status(resp).await
    }
}

async fn check_status(resp: Response) -> PipelineResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    tracing::warn!(%status, body = %body, "backend rejected request");
    Err(PipelineError::Rejected {
        status: status.as_u16(),
        body,
    })
}

/// Split the payload into chunks, reporting each one as it is handed to the transport.
fn progress_stream(
    bytes: Bytes,
    chunk_size: usize,
    progress: ProgressFn,
) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>> + Send + Sync + 'static {
    let total = bytes.len() as u64;
    let chunks: Vec<Bytes> = (0..bytes.len())
        .step_by(chunk_size)
        .map(|start| bytes.slice(start..(start + chunk_size).min(bytes.len())))
        .collect();
    let mut sent = 0u64;
    futures::stream::iter(chunks).map(move |chunk| {
        sent += chunk.len() as u64;
        progress(sent, total);
        Ok::<Bytes, std::io::Error>(chunk)
    })
}

#[async_trait]
impl ObjectStorage for HttpBackend {
    async fn upload(
        &self,
        path: &str,
        file: &PhotoFile,
        progress: ProgressFn,
        cancel: &CancellationToken,
    ) -> PipelineResult<()> {
        let total = file.bytes.len() as u64;
        let req = self
            .client
            .post(self.object_url(path))
            .header("x-upsert", "true")
            .header(CONTENT_TYPE, &file.content_type)
            .header(CONTENT_LENGTH, total)
            .body(reqwest::Body::wrap_stream(progress_stream(
                file.bytes.clone(),
                self.chunk_size,
                progress,
            )));
        let req = self.authed(req).await?;
        self.send(req, Some(cancel)).await?;
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base(),
            self.cfg.storage_bucket,
            encode_path(path)
        )
    }

    async fn remove(&self, paths: &[String]) -> PipelineResult<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let url = format!(
            "{}/storage/v1/object/{}",
            self.base(),
            self.cfg.storage_bucket
        );
        let req = self
            .client
            .delete(url)
            .json(&serde_json::json!({ "prefixes": paths }));
        let req = self.authed(req).await?;
        self.send(req, None).await?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for HttpBackend {
    async fn upsert(&self, row: &PhotoRow) -> PipelineResult<()> {
        let mut body = serde_json::to_value(row).map_err(|e| PipelineError::Transport(e.to_string()))?;
        if row.status == RowStatus::Done
            && let Some(obj) = body.as_object_mut()
        {
            obj.insert("error".into(), serde_json::Value::Null);
        }
        let req = self
            .client
            .post(self.table_url(&self.cfg.photos_table))
            .query(&[("on_conflict", "id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&body);
        let req = self.authed(req).await?;
        self.send(req, None).await?;
        Ok(())
    }

    async fn insert_if_absent(&self, row: &PhotoRow) -> PipelineResult<()> {
        let req = self
            .client
            .post(self.table_url(&self.cfg.photos_table))
            .query(&[("on_conflict", "id")])
            .header("Prefer", "resolution=ignore-duplicates,return=minimal")
            .json(row);
        let req = self.authed(req).await?;
        self.send(req, None).await?;
        Ok(())
    }

    async fn update_description(&self, id: PhotoId, description: &str) -> PipelineResult<()> {
        let req = self
            .client
            .patch(self.table_url(&self.cfg.photos_table))
            .query(&[("id", format!("eq.{id}"))])
            .header("Prefer", "return=minimal")
            .json(&serde_json::json!({ "description": description }));
        let req = self.authed(req).await?;
        self.send(req, None).await?;
        Ok(())
    }

    async fn delete(&self, id: PhotoId) -> PipelineResult<()> {
        let req = self
            .client
            .delete(self.table_url(&self.cfg.photos_table))
            .query(&[("id", format!("eq.{id}"))]);
        let req = self.authed(req).await?;
        self.send(req, None).await?;
        Ok(())
    }

    async fn list_for_report(&self, report_id: &str) -> PipelineResult<Vec<PhotoRow>> {
        let req = self
            .client
            .get(self.table_url(&self.cfg.photos_table))
            .query(&[
                ("report_id", format!("eq.{report_id}")),
                ("select", "*".to_string()),
                ("order", "created_at.asc".to_string()),
            ]);
        let req = self.authed(req).await?;
        let resp = self.send(req, None).await?;
        Ok(resp.json::<Vec<PhotoRow>>().await?)
    }
}

#[async_trait]
impl Optimizer for HttpBackend {
    async fn optimize(&self, photo_id: PhotoId, storage_path: &str) -> PipelineResult<OptimizeOutput> {
        let url = format!("{}/functions/v1/{}", self.base(), self.cfg.optimize_function);
        let req = self.client.post(url).json(&serde_json::json!({
            "photoId": photo_id,
            "storagePath": storage_path,
        }));
        let req = self.authed(req).await?;
        let resp = self.send(req, None).await?;
        Ok(resp.json::<OptimizeOutput>().await?)
    }
}

#[async_trait]
impl MetricsSink for HttpBackend {
    async fn record(&self, event: &MetricEvent) -> PipelineResult<()> {
        let req = self
            .client
            .post(self.table_url(&self.cfg.metrics_table))
            .header("Prefer", "return=minimal")
            .json(event);
        let req = self.authed(req).await?;
        self.send(req, None).await?;
        Ok(())
    }
}
