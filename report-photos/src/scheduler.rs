use crate::{config, pipeline::UploadPipeline};
use anyhow::Result;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;
use uuid::Uuid;

type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn reconcile_job(
    pipeline: Arc<UploadPipeline>,
) -> impl FnMut(Uuid, JobScheduler) -> JobFuture + Send + Sync + 'static {
    move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        let fut: JobFuture = Box::pin(async move {
            tracing::debug!("reconcile job triggered");
            pipeline.reconcile_all().await;
        });
        fut
    }
}

/// Drives the upload queue and the periodic report reconcile.
pub struct UploadScheduler {
    sched: JobScheduler,
    cfg: config::SharedConfig,
    pipeline: Arc<UploadPipeline>,
}

impl UploadScheduler {
    pub async fn new(cfg: config::SharedConfig, pipeline: Arc<UploadPipeline>) -> Result<Self> {
        let sched = JobScheduler::new().await?;
        Ok(Self {
            sched,
            cfg,
            pipeline,
        })
    }

    /// Register the reconcile job: cron expression when configured, fixed interval otherwise.
    pub async fn populate(&self) -> Result<()> {
        let snapshot = config::ConfigManager::to_struct(&self.cfg).await?;
        let job = match &snapshot.upload.reconcile_cron {
            Some(cron) => {
                let cron_expr = cron.to_string();
                info!(cron = %cron_expr, "scheduling report reconcile");
                Job::new_async(cron_expr.as_str(), reconcile_job(Arc::clone(&self.pipeline)))?
            }
            None => {
                let every = snapshot.upload.reconcile_interval();
                info!(every_secs = every.as_secs(), "scheduling report reconcile");
                Job::new_repeated_async(every, reconcile_job(Arc::clone(&self.pipeline)))?
            }
        };
        self.sched.add(job).await?;
        Ok(())
    }

    pub async fn start(&self) -> Result<()> {
        self.sched.start().await?;
        let snapshot = config::ConfigManager::to_struct(&self.cfg).await?;
        let interval = snapshot.upload.scheduler_interval();
        let pipeline = Arc::clone(&self.pipeline);
        tokio::spawn(run_loop(pipeline, interval));
        Ok(())
    }
}

/// Starts the front task whenever the slot is free. Woken by the timer and
/// immediately after an enqueue or a completed task.
pub async fn run_loop(pipeline: Arc<UploadPipeline>, interval: Duration) {
    info!(interval_ms = interval.as_millis() as u64, "upload scheduler running");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = pipeline.wait_for_work() => {}
        }
        pipeline.pump().await;
    }
}
