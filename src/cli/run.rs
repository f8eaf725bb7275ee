use crate::config::{load_settings, ConfigError};
use crate::job::{DefaultFetcherFactory, JobContext, Worker};
use crate::scheduler::Scheduler;
use crate::storage::memory::{MemoryJobStore, MemoryObjectStore, MemoryTaskQueue};
use crate::storage::{ObjectStore, StorageError, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Run the scheduler and worker pool until ctrl-c.
///
/// This wiring uses the in-memory store implementations, which is enough to
/// exercise the whole pipeline on one machine; a deployment embeds the same
/// components against its own `JobStore`/`ObjectStore`/`TaskQueue` backends.
pub async fn run(config_path: Option<PathBuf>) -> Result<(), RunError> {
    let settings = load_settings(config_path.as_deref())?;

    let store = Arc::new(MemoryJobStore::new());
    let objects = Arc::new(MemoryObjectStore::new());
    let queue = Arc::new(MemoryTaskQueue::new());
    let clock = Arc::new(SystemClock);

    objects.ensure_bucket().await?;

    let mut ctx = JobContext::new(store.clone(), objects, queue.clone(), clock.clone())
        .with_anomaly_config(settings.anomaly.clone());
    ctx.top_n = settings.aggregation.top_n;

    let factory = Arc::new(DefaultFetcherFactory::new(clock.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = Scheduler::new(
        store,
        queue,
        clock,
        settings.scheduler.tick_interval,
    );
    let scheduler_handle: JoinHandle<()> = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { scheduler.run(shutdown).await }
    });

    let mut worker_handles = Vec::new();
    for index in 0..settings.worker.concurrency {
        let worker = Arc::new(
            Worker::new(ctx.clone(), factory.clone())
                .with_poll_interval(settings.worker.poll_interval),
        );
        let shutdown = shutdown_rx.clone();
        worker_handles.push(tokio::spawn(async move {
            info!(worker = index, "worker task spawned");
            worker.run(shutdown).await;
        }));
    }

    info!("logward running, press ctrl-c to stop");
    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }

    info!("shutting down");
    let _ = shutdown_tx.send(true);

    scheduler_handle.await?;
    for handle in worker_handles {
        handle.await?;
    }

    Ok(())
}
