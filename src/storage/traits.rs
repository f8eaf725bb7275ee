use crate::storage::model::{
    AggregateRow, AggregateSnapshot, ErrorGroup, ErrorOccurrence, Finding, Job, LogFile,
    LogSource, Site,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("conflicting write: {0}")]
    Conflict(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Current UTC time, injectable so due-time and fallback logic is testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Content-addressed blob storage for raw log files.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
    async fn size(&self, key: &str) -> Result<Option<u64>, StorageError>;
    async fn presign_put(
        &self,
        key: &str,
        content_type: &str,
        ttl: Duration,
    ) -> Result<String, StorageError>;
    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, StorageError>;
    async fn ensure_bucket(&self) -> Result<(), StorageError>;
}

/// Transactional persistence for jobs, log files, aggregates, findings and
/// error groups. Aggregate writes for one `(site, log_file)` are atomic:
/// readers see either no rows or the full set.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StorageError>;
    async fn insert_job(&self, job: &Job) -> Result<(), StorageError>;
    async fn update_job(&self, job: &Job) -> Result<(), StorageError>;

    async fn get_log_file(&self, id: Uuid) -> Result<Option<LogFile>, StorageError>;
    async fn insert_log_file(&self, file: &LogFile) -> Result<(), StorageError>;
    async fn update_log_file(&self, file: &LogFile) -> Result<(), StorageError>;

    async fn get_site(&self, id: Uuid) -> Result<Option<Site>, StorageError>;

    async fn get_log_source(&self, id: Uuid) -> Result<Option<LogSource>, StorageError>;
    async fn list_active_log_sources(&self) -> Result<Vec<LogSource>, StorageError>;
    async fn update_log_source(&self, source: &LogSource) -> Result<(), StorageError>;

    /// Replace the hourly aggregates for `(site, log_file)` with `rows` in
    /// one transaction.
    async fn upsert_aggregates(
        &self,
        site_id: Uuid,
        log_file_id: Uuid,
        rows: &[AggregateRow],
    ) -> Result<(), StorageError>;

    /// Hourly snapshots for a site with `hour_bucket >= from_hour`, ordered
    /// by hour ascending.
    async fn load_baseline_snapshots(
        &self,
        site_id: Uuid,
        from_hour: DateTime<Utc>,
    ) -> Result<Vec<AggregateSnapshot>, StorageError>;

    async fn insert_findings(&self, findings: &[Finding]) -> Result<(), StorageError>;

    async fn find_error_group(
        &self,
        site_id: Uuid,
        fingerprint: &str,
    ) -> Result<Option<ErrorGroup>, StorageError>;
    async fn insert_error_group(&self, group: &ErrorGroup) -> Result<(), StorageError>;
    async fn update_error_group(&self, group: &ErrorGroup) -> Result<(), StorageError>;
    async fn insert_error_occurrence(
        &self,
        occurrence: &ErrorOccurrence,
    ) -> Result<(), StorageError>;
}

/// A task pulled off the queue, redelivered until acknowledged.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub args: Value,
    pub attempt: u32,
}

/// Durable at-least-once task queue with late acknowledgment.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, name: &str, args: Value) -> Result<Uuid, StorageError>;
    async fn dequeue(&self) -> Result<Option<Task>, StorageError>;
    /// Acknowledge a completed task. Unacked tasks stay in flight and are
    /// redelivered on worker loss.
    async fn ack(&self, task_id: Uuid) -> Result<(), StorageError>;
    /// Return a failed task to the queue for another attempt.
    async fn nack(&self, task_id: Uuid) -> Result<(), StorageError>;
}

/// Wall-clock implementation of [`Clock`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
