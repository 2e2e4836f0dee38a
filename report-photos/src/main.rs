mod backend;
mod board;
mod config;
mod error;
mod executor;
mod handoff;
mod http;
mod model;
mod pipeline;
mod preprocess;
mod queue;
mod rest;
mod retry;
mod scheduler;
mod slot;
mod state;
#[cfg(test)]
mod testing;

use backend::{Backend, MetadataStore, MetricsSink, ObjectStorage, Optimizer, Session, SessionProvider, SharedSession};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load config first so we can honor logging.filter directive.
    let shared = config::ConfigManager::load(None).await?;
    let cfg_snapshot = config::ConfigManager::to_struct(&shared).await?;
    let filter_directive = cfg_snapshot
        .logging
        .as_ref()
        .and_then(|l| l.filter.clone())
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info,report_photos=debug".to_string());
    fmt()
        .with_env_filter(EnvFilter::new(filter_directive))
        .init();
    tracing::info!(
        env = cfg_snapshot.env.as_deref().unwrap_or("dev"),
        version = env!("CARGO_PKG_VERSION"),
        "report-photos starting"
    );

    let initial = std::env::var("REPORT_PHOTOS_TOKEN")
        .ok()
        .filter(|t| !t.trim().is_empty())
        .map(|access_token| Session { access_token });
    if initial.is_none() {
        tracing::info!("no session token; uploads wait until PUT /api/session");
    }
    let session = Arc::new(SharedSession::new(initial));
    let remote = Arc::new(rest::HttpBackend::new(
        cfg_snapshot.backend.clone(),
        Arc::clone(&session) as Arc<dyn SessionProvider>,
        cfg_snapshot.upload.chunk_size(),
    ));
    let backend = Backend {
        session: Arc::clone(&session) as Arc<dyn SessionProvider>,
        storage: Arc::clone(&remote) as Arc<dyn ObjectStorage>,
        metadata: Arc::clone(&remote) as Arc<dyn MetadataStore>,
        optimizer: Arc::clone(&remote) as Arc<dyn Optimizer>,
        metrics: remote as Arc<dyn MetricsSink>,
    };
    let pipeline = pipeline::UploadPipeline::new(
        backend,
        pipeline::UploadSettings::from_config(&cfg_snapshot),
    );

    let mut feed = pipeline.subscribe();
    tokio::spawn(async move {
        loop {
            match feed.recv().await {
                Ok(change) => tracing::debug!(
                    photo = %change.photo_id,
                    status = ?change.state.status,
                    progress = change.state.progress,
                    attempts = change.state.attempts,
                    "upload status"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "status feed lagged")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let scheduler =
        scheduler::UploadScheduler::new(shared.clone(), Arc::clone(&pipeline)).await?;
    scheduler.populate().await?;
    scheduler.start().await?;

    let state = http::AppState {
        cfg: shared,
        pipeline,
        session,
    };
    let app = http::router(state);
    let bind = cfg_snapshot.server.and_then(|s| s.bind_address);
    http::serve(app, bind).await?;
    Ok(())
}
