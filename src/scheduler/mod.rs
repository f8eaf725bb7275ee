use crate::storage::model::{LogSource, Schedule};
use crate::storage::{Clock, JobStore, StorageError, TaskQueue};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Interval schedules are clamped to [5 minutes, 7 days].
pub const MIN_INTERVAL_MINUTES: u32 = 5;
pub const MAX_INTERVAL_MINUTES: u32 = 7 * 24 * 60;

/// Task name consumed by the worker's fetch handler.
pub const FETCH_TASK: &str = "fetch_logs_from_source";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub total: usize,
    pub scheduled: usize,
    pub skipped: usize,
}

/// Whether a source should be fetched now. A source that has never been
/// fetched is always due. The fetch runner stamps `last_fetch_at` before it
/// starts transferring, so a slow fetch cannot be scheduled twice.
pub fn is_due(source: &LogSource, now: DateTime<Utc>) -> bool {
    let Some(last_fetch_at) = source.last_fetch_at else {
        return true;
    };

    match &source.schedule {
        Schedule::Interval { interval_minutes } => {
            let interval = (*interval_minutes).clamp(MIN_INTERVAL_MINUTES, MAX_INTERVAL_MINUTES);
            let elapsed_minutes = (now - last_fetch_at).num_seconds() as f64 / 60.0;
            elapsed_minutes >= interval as f64
        }
        // TODO: evaluate the cron expression; until then a cron source is
        // due one hour after its last fetch.
        Schedule::Cron { .. } => now - last_fetch_at >= Duration::hours(1),
    }
}

/// Periodic tick that enqueues fetch tasks for due sources.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn TaskQueue>,
    clock: Arc<dyn Clock>,
    tick_interval: std::time::Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn TaskQueue>,
        clock: Arc<dyn Clock>,
        tick_interval: std::time::Duration,
    ) -> Self {
        Self {
            store,
            queue,
            clock,
            tick_interval,
        }
    }

    pub async fn tick(&self) -> Result<TickReport, SchedulerError> {
        let sources = self.store.list_active_log_sources().await?;
        let now = self.clock.now();

        let mut scheduled = 0;
        let mut skipped = 0;
        for source in &sources {
            if is_due(source, now) {
                self.queue
                    .enqueue(FETCH_TASK, json!({"log_source_id": source.id}))
                    .await?;
                scheduled += 1;
            } else {
                skipped += 1;
            }
        }

        let report = TickReport {
            total: sources.len(),
            scheduled,
            skipped,
        };
        info!(
            total = report.total,
            scheduled = report.scheduled,
            skipped = report.skipped,
            "scheduler tick"
        );
        Ok(report)
    }

    /// Tick until shutdown is signalled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.tick_interval);
        info!(interval = ?self.tick_interval, "scheduler started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "scheduler tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("scheduler stopping");
                    break;
                }
            }
        }
    }
}
