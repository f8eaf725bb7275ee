use crate::errorlog::ErrorLogFormat;
use crate::job::error_analysis::run_error_analysis_job;
use crate::job::fetch::{run_fetch_job, run_test_connection_job, FetcherFactory};
use crate::job::runner::run_parse_job;
use crate::job::{JobContext, JobError};
use crate::scheduler::FETCH_TASK;
use crate::storage::Task;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const PARSE_TASK: &str = "parse_log_file";
pub const ANALYZE_ERRORS_TASK: &str = "analyze_errors_in_log_file";
pub const TEST_CONNECTION_TASK: &str = "test_log_source_connection";

/// Delivery attempts before a task is dropped instead of requeued.
const MAX_ATTEMPTS: u32 = 3;

/// Hard wall-clock limit for one task.
const TASK_TIME_LIMIT: Duration = Duration::from_secs(60 * 60);

fn uuid_arg(args: &Value, key: &str) -> Result<Uuid, JobError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| JobError::InvalidArgs(format!("missing or invalid {key}")))
}

/// Pulls tasks off the queue and dispatches them to the matching runner.
/// Tasks are acknowledged only after their handler returns Ok, so a lost
/// worker redelivers.
pub struct Worker {
    ctx: JobContext,
    factory: Arc<dyn FetcherFactory>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(ctx: JobContext, factory: Arc<dyn FetcherFactory>) -> Self {
        Self {
            ctx,
            factory,
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub async fn handle_task(&self, task: &Task) -> Result<Value, JobError> {
        match task.name.as_str() {
            PARSE_TASK => {
                let job_id = uuid_arg(&task.args, "job_id")?;
                run_parse_job(&self.ctx, job_id).await
            }
            FETCH_TASK => {
                let source_id = uuid_arg(&task.args, "log_source_id")?;
                run_fetch_job(&self.ctx, self.factory.as_ref(), source_id).await
            }
            ANALYZE_ERRORS_TASK => {
                let log_file_id = uuid_arg(&task.args, "log_file_id")?;
                let format = match task.args.get("format").and_then(|v| v.as_str()) {
                    Some(raw) => raw.parse::<ErrorLogFormat>()?,
                    None => ErrorLogFormat::Auto,
                };
                run_error_analysis_job(&self.ctx, log_file_id, format).await
            }
            TEST_CONNECTION_TASK => {
                let source_id = uuid_arg(&task.args, "log_source_id")?;
                run_test_connection_job(&self.ctx, self.factory.as_ref(), source_id).await
            }
            other => Err(JobError::InvalidArgs(format!("unknown task: {other}"))),
        }
    }

    /// Process one queued task if there is one. Returns whether a task was
    /// handled.
    pub async fn poll_once(&self) -> bool {
        let task = match self.ctx.queue.dequeue().await {
            Ok(Some(task)) => task,
            Ok(None) => return false,
            Err(e) => {
                error!(error = %e, "failed to dequeue task");
                return false;
            }
        };

        debug!(task = %task.name, id = %task.id, attempt = task.attempt, "task started");
        let outcome = match tokio::time::timeout(TASK_TIME_LIMIT, self.handle_task(&task)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(JobError::TimeLimit(TASK_TIME_LIMIT.as_secs())),
        };
        match outcome {
            Ok(_) => {
                if let Err(e) = self.ctx.queue.ack(task.id).await {
                    error!(id = %task.id, error = %e, "failed to ack task");
                }
            }
            Err(e) if task.attempt >= MAX_ATTEMPTS => {
                error!(
                    task = %task.name,
                    id = %task.id,
                    attempt = task.attempt,
                    error = %e,
                    "task failed permanently, dropping"
                );
                if let Err(ack_err) = self.ctx.queue.ack(task.id).await {
                    error!(id = %task.id, error = %ack_err, "failed to drop task");
                }
            }
            Err(e) => {
                warn!(
                    task = %task.name,
                    id = %task.id,
                    attempt = task.attempt,
                    error = %e,
                    "task failed, requeueing"
                );
                if let Err(nack_err) = self.ctx.queue.nack(task.id).await {
                    error!(id = %task.id, error = %nack_err, "failed to requeue task");
                }
            }
        }
        true
    }

    /// Consume tasks until shutdown is signalled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("worker started");
        loop {
            if self.poll_once().await {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {
                    info!("worker stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{ManualClock, MemoryJobStore, MemoryObjectStore, MemoryTaskQueue};
    use crate::storage::model::{Job, JobStatus, JobType, LogFile, LogFileStatus, LogFormat, Site};
    use crate::storage::{JobStore, TaskQueue};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    struct NoFetchers;
    impl FetcherFactory for NoFetchers {
        fn build(
            &self,
            _source: &crate::storage::model::LogSource,
        ) -> Result<Box<dyn crate::fetcher::Fetcher>, crate::fetcher::FetchError> {
            Err(crate::fetcher::FetchError::Config("no fetchers".to_string()))
        }
    }

    struct Fixture {
        worker: Worker,
        store: Arc<MemoryJobStore>,
        queue: Arc<MemoryTaskQueue>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryJobStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let queue = Arc::new(MemoryTaskQueue::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 1, 21, 12, 0, 0).unwrap(),
        ));
        let ctx = JobContext::new(store.clone(), objects, queue.clone(), clock);
        Fixture {
            worker: Worker::new(ctx, Arc::new(NoFetchers)),
            store,
            queue,
        }
    }

    #[tokio::test]
    async fn test_parse_task_dispatch_and_ack() {
        let fixture = fixture();
        let site = Site {
            id: Uuid::new_v4(),
            name: "s".to_string(),
            domain: None,
            log_format: LogFormat::NginxCombined,
        };
        fixture.store.insert_site(site.clone());

        let log_file = LogFile {
            id: Uuid::new_v4(),
            site_id: site.id,
            filename: "a.log".to_string(),
            size_bytes: 0,
            sha256: None,
            storage_key: "k".to_string(),
            status: LogFileStatus::Uploaded,
            uploaded_at: None,
        };
        fixture
            .worker
            .ctx
            .objects
            .put("k", b"# empty\n")
            .await
            .unwrap();
        fixture.store.insert_log_file(&log_file).await.unwrap();
        let job = Job::new(log_file.id, JobType::Parse);
        fixture.store.insert_job(&job).await.unwrap();

        fixture
            .queue
            .enqueue(PARSE_TASK, json!({"job_id": job.id}))
            .await
            .unwrap();

        assert!(fixture.worker.poll_once().await);
        assert!(!fixture.worker.poll_once().await, "queue should be drained");

        let stored = fixture.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_failing_task_requeued_then_dropped() {
        let fixture = fixture();
        // Parse task for a job that does not exist: fails every attempt.
        fixture
            .queue
            .enqueue(PARSE_TASK, json!({"job_id": Uuid::new_v4()}))
            .await
            .unwrap();

        // Attempts 1 and 2 requeue, attempt 3 drops.
        assert!(fixture.worker.poll_once().await);
        assert_eq!(fixture.queue.pending_len(), 1);
        assert!(fixture.worker.poll_once().await);
        assert_eq!(fixture.queue.pending_len(), 1);
        assert!(fixture.worker.poll_once().await);
        assert_eq!(fixture.queue.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_unknown_task_rejected() {
        let fixture = fixture();
        let task = Task {
            id: Uuid::new_v4(),
            name: "reticulate_splines".to_string(),
            args: json!({}),
            attempt: 1,
        };
        let err = fixture.worker.handle_task(&task).await.unwrap_err();
        assert!(matches!(err, JobError::InvalidArgs(_)));
    }

    #[tokio::test]
    async fn test_invalid_args_rejected() {
        let fixture = fixture();
        let task = Task {
            id: Uuid::new_v4(),
            name: PARSE_TASK.to_string(),
            args: json!({"job_id": "not-a-uuid"}),
            attempt: 1,
        };
        let err = fixture.worker.handle_task(&task).await.unwrap_err();
        assert!(matches!(err, JobError::InvalidArgs(_)));
    }
}
