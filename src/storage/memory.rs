//! In-memory implementations of the storage seams.
//!
//! Used by the test suite and the demo CLI. Production deployments plug in
//! their own database- and blob-store-backed implementations.

use crate::storage::model::{
    AggregateRow, AggregateSnapshot, ErrorGroup, ErrorOccurrence, Finding, Job, LogFile,
    LogSource, LogSourceStatus, Site,
};
use crate::storage::traits::{
    Clock, JobStore, ObjectStore, StorageError, Task, TaskQueue,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StorageError> {
    mutex
        .lock()
        .map_err(|_| StorageError::Backend("state lock poisoned".to_string()))
}

/// Blob store backed by a hash map.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        lock(&self.objects)?.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        lock(&self.objects)?
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(lock(&self.objects)?.contains_key(key))
    }

    async fn size(&self, key: &str) -> Result<Option<u64>, StorageError> {
        Ok(lock(&self.objects)?.get(key).map(|b| b.len() as u64))
    }

    async fn presign_put(
        &self,
        key: &str,
        content_type: &str,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        Ok(format!(
            "memory://put/{key}?content_type={content_type}&ttl={}",
            ttl.as_secs()
        ))
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        Ok(format!("memory://get/{key}?ttl={}", ttl.as_secs()))
    }

    async fn ensure_bucket(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[derive(Default)]
struct JobStoreState {
    jobs: HashMap<Uuid, Job>,
    log_files: HashMap<Uuid, LogFile>,
    sites: HashMap<Uuid, Site>,
    log_sources: HashMap<Uuid, LogSource>,
    aggregates: Vec<AggregateRow>,
    findings: Vec<Finding>,
    error_groups: HashMap<(Uuid, String), ErrorGroup>,
    error_occurrences: Vec<ErrorOccurrence>,
}

/// Job store backed by hash maps behind one mutex, which makes every write
/// batch atomic the way a database transaction would be.
#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<JobStoreState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_site(&self, site: Site) {
        if let Ok(mut state) = self.state.lock() {
            state.sites.insert(site.id, site);
        }
    }

    pub fn insert_log_source(&self, source: LogSource) {
        if let Ok(mut state) = self.state.lock() {
            state.log_sources.insert(source.id, source);
        }
    }

    /// Seed an aggregate row directly, bypassing the upsert path. Test helper.
    pub fn seed_aggregate(&self, row: AggregateRow) {
        if let Ok(mut state) = self.state.lock() {
            state.aggregates.push(row);
        }
    }

    pub fn aggregates(&self) -> Vec<AggregateRow> {
        self.state
            .lock()
            .map(|s| s.aggregates.clone())
            .unwrap_or_default()
    }

    pub fn findings(&self) -> Vec<Finding> {
        self.state
            .lock()
            .map(|s| s.findings.clone())
            .unwrap_or_default()
    }

    pub fn error_groups(&self) -> Vec<ErrorGroup> {
        self.state
            .lock()
            .map(|s| s.error_groups.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn error_occurrences(&self) -> Vec<ErrorOccurrence> {
        self.state
            .lock()
            .map(|s| s.error_occurrences.clone())
            .unwrap_or_default()
    }

    pub fn log_files(&self) -> Vec<LogFile> {
        self.state
            .lock()
            .map(|s| s.log_files.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.state
            .lock()
            .map(|s| s.jobs.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StorageError> {
        Ok(lock(&self.state)?.jobs.get(&id).cloned())
    }

    async fn insert_job(&self, job: &Job) -> Result<(), StorageError> {
        lock(&self.state)?.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<(), StorageError> {
        let mut state = lock(&self.state)?;
        if !state.jobs.contains_key(&job.id) {
            return Err(StorageError::NotFound(format!("job {}", job.id)));
        }
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_log_file(&self, id: Uuid) -> Result<Option<LogFile>, StorageError> {
        Ok(lock(&self.state)?.log_files.get(&id).cloned())
    }

    async fn insert_log_file(&self, file: &LogFile) -> Result<(), StorageError> {
        lock(&self.state)?.log_files.insert(file.id, file.clone());
        Ok(())
    }

    async fn update_log_file(&self, file: &LogFile) -> Result<(), StorageError> {
        let mut state = lock(&self.state)?;
        if !state.log_files.contains_key(&file.id) {
            return Err(StorageError::NotFound(format!("log file {}", file.id)));
        }
        state.log_files.insert(file.id, file.clone());
        Ok(())
    }

    async fn get_site(&self, id: Uuid) -> Result<Option<Site>, StorageError> {
        Ok(lock(&self.state)?.sites.get(&id).cloned())
    }

    async fn get_log_source(&self, id: Uuid) -> Result<Option<LogSource>, StorageError> {
        Ok(lock(&self.state)?.log_sources.get(&id).cloned())
    }

    async fn list_active_log_sources(&self) -> Result<Vec<LogSource>, StorageError> {
        let state = lock(&self.state)?;
        let mut sources: Vec<LogSource> = state
            .log_sources
            .values()
            .filter(|s| s.status == LogSourceStatus::Active)
            .cloned()
            .collect();
        sources.sort_by_key(|s| s.id);
        Ok(sources)
    }

    async fn update_log_source(&self, source: &LogSource) -> Result<(), StorageError> {
        let mut state = lock(&self.state)?;
        if !state.log_sources.contains_key(&source.id) {
            return Err(StorageError::NotFound(format!("log source {}", source.id)));
        }
        state.log_sources.insert(source.id, source.clone());
        Ok(())
    }

    async fn upsert_aggregates(
        &self,
        site_id: Uuid,
        log_file_id: Uuid,
        rows: &[AggregateRow],
    ) -> Result<(), StorageError> {
        let mut state = lock(&self.state)?;
        state
            .aggregates
            .retain(|a| !(a.site_id == site_id && a.log_file_id == log_file_id));
        state.aggregates.extend_from_slice(rows);
        Ok(())
    }

    async fn load_baseline_snapshots(
        &self,
        site_id: Uuid,
        from_hour: DateTime<Utc>,
    ) -> Result<Vec<AggregateSnapshot>, StorageError> {
        let state = lock(&self.state)?;
        let mut snapshots: Vec<AggregateSnapshot> = state
            .aggregates
            .iter()
            .filter(|a| a.site_id == site_id && a.hour_bucket >= from_hour)
            .map(AggregateSnapshot::from)
            .collect();
        snapshots.sort_by_key(|s| s.hour_bucket);
        Ok(snapshots)
    }

    async fn insert_findings(&self, findings: &[Finding]) -> Result<(), StorageError> {
        lock(&self.state)?.findings.extend_from_slice(findings);
        Ok(())
    }

    async fn find_error_group(
        &self,
        site_id: Uuid,
        fingerprint: &str,
    ) -> Result<Option<ErrorGroup>, StorageError> {
        Ok(lock(&self.state)?
            .error_groups
            .get(&(site_id, fingerprint.to_string()))
            .cloned())
    }

    async fn insert_error_group(&self, group: &ErrorGroup) -> Result<(), StorageError> {
        let mut state = lock(&self.state)?;
        let key = (group.site_id, group.fingerprint.clone());
        if state.error_groups.contains_key(&key) {
            return Err(StorageError::Conflict(format!(
                "error group already exists for fingerprint {}",
                group.fingerprint
            )));
        }
        state.error_groups.insert(key, group.clone());
        Ok(())
    }

    async fn update_error_group(&self, group: &ErrorGroup) -> Result<(), StorageError> {
        let mut state = lock(&self.state)?;
        let key = (group.site_id, group.fingerprint.clone());
        if !state.error_groups.contains_key(&key) {
            return Err(StorageError::NotFound(format!(
                "error group {}",
                group.fingerprint
            )));
        }
        state.error_groups.insert(key, group.clone());
        Ok(())
    }

    async fn insert_error_occurrence(
        &self,
        occurrence: &ErrorOccurrence,
    ) -> Result<(), StorageError> {
        lock(&self.state)?
            .error_occurrences
            .push(occurrence.clone());
        Ok(())
    }
}

struct QueueState {
    pending: VecDeque<Task>,
    in_flight: HashMap<Uuid, Task>,
}

/// Task queue backed by a VecDeque with an in-flight set for late acks.
pub struct MemoryTaskQueue {
    state: Mutex<QueueState>,
}

impl Default for MemoryTaskQueue {
    fn default() -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                in_flight: HashMap::new(),
            }),
        }
    }
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().map(|s| s.pending.len()).unwrap_or(0)
    }

    pub fn pending_tasks(&self) -> Vec<Task> {
        self.state
            .lock()
            .map(|s| s.pending.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, name: &str, args: Value) -> Result<Uuid, StorageError> {
        let task = Task {
            id: Uuid::new_v4(),
            name: name.to_string(),
            args,
            attempt: 0,
        };
        let id = task.id;
        lock(&self.state)?.pending.push_back(task);
        Ok(id)
    }

    async fn dequeue(&self) -> Result<Option<Task>, StorageError> {
        let mut state = lock(&self.state)?;
        match state.pending.pop_front() {
            Some(mut task) => {
                task.attempt += 1;
                state.in_flight.insert(task.id, task.clone());
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    async fn ack(&self, task_id: Uuid) -> Result<(), StorageError> {
        let mut state = lock(&self.state)?;
        state
            .in_flight
            .remove(&task_id)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(format!("in-flight task {task_id}")))
    }

    async fn nack(&self, task_id: Uuid) -> Result<(), StorageError> {
        let mut state = lock(&self.state)?;
        let task = state
            .in_flight
            .remove(&task_id)
            .ok_or_else(|| StorageError::NotFound(format!("in-flight task {task_id}")))?;
        state.pending.push_back(task);
        Ok(())
    }
}

/// Clock pinned to a settable instant. Test helper.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    pub fn advance(&self, delta: chrono::Duration) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += delta;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|g| *g).unwrap_or_else(|_| Utc::now())
    }
}
