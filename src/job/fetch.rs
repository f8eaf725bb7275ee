use crate::fetcher::sftp::Ssh2Transport;
use crate::fetcher::{
    BucketClient, FetchError, Fetcher, ObjectStoreFetcher, SftpFetcher,
};
use crate::job::{JobContext, JobError};
use crate::storage::model::{Job, JobType, LogFile, LogFileStatus, LogSource, LogSourceType};
use crate::storage::Clock;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Builds a fetcher for a log source. Swappable so tests drive the fetch
/// runner with in-memory transports.
pub trait FetcherFactory: Send + Sync {
    fn build(&self, source: &LogSource) -> Result<Box<dyn Fetcher>, FetchError>;
}

/// Constructor for bucket clients; the concrete store client is an external
/// collaborator handed in by the host application.
pub type BucketClientBuilder =
    dyn Fn(&BTreeMap<String, Value>) -> Result<Box<dyn BucketClient>, FetchError> + Send + Sync;

/// Production factory: ssh/sftp sources speak libssh2, object-store sources
/// need a registered bucket-client builder.
pub struct DefaultFetcherFactory {
    clock: Arc<dyn Clock>,
    bucket_clients: Option<Arc<BucketClientBuilder>>,
}

impl DefaultFetcherFactory {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            bucket_clients: None,
        }
    }

    pub fn with_bucket_clients(mut self, builder: Arc<BucketClientBuilder>) -> Self {
        self.bucket_clients = Some(builder);
        self
    }
}

impl FetcherFactory for DefaultFetcherFactory {
    fn build(&self, source: &LogSource) -> Result<Box<dyn Fetcher>, FetchError> {
        match source.source_type {
            LogSourceType::Ssh | LogSourceType::Sftp => {
                let fetcher = SftpFetcher::from_connection_config(
                    &source.connection_config,
                    Ssh2Transport::new(),
                )?;
                Ok(Box::new(fetcher))
            }
            LogSourceType::S3 | LogSourceType::Gcs => {
                let builder = self.bucket_clients.as_ref().ok_or_else(|| {
                    FetchError::Config(
                        "no bucket client registered for object-store sources".to_string(),
                    )
                })?;
                let client = builder(&source.connection_config)?;
                let fetcher = ObjectStoreFetcher::from_connection_config(
                    &source.connection_config,
                    client,
                    self.clock.clone(),
                )?;
                Ok(Box::new(fetcher))
            }
        }
    }
}

/// Fetch all new files for a source: upload them to the object store,
/// register a `LogFile` plus a pending parse job per file, and record the
/// fetch outcome on the source. Fetch failures mark the source and return a
/// result payload; they never crash the worker. Storage failures propagate.
pub async fn run_fetch_job(
    ctx: &JobContext,
    factory: &dyn FetcherFactory,
    source_id: Uuid,
) -> Result<Value, JobError> {
    let Some(mut source) = ctx.store.get_log_source(source_id).await? else {
        return Err(JobError::SourceNotFound(source_id));
    };

    // Stamped before any transfer starts so the scheduler's next tick sees
    // this fetch and does not double-schedule a slow source.
    source.last_fetch_at = Some(ctx.clock.now());
    ctx.store.update_log_source(&source).await?;

    let mut fetcher = match factory.build(&source) {
        Ok(fetcher) => fetcher,
        Err(e) => {
            record_failure(ctx, &mut source, &e, 0).await?;
            return Ok(json!({"success": false, "error": e.to_string()}));
        }
    };

    let fetched = fetcher.fetch().await;
    fetcher.cleanup().await;

    let files = match fetched {
        Ok(files) => files,
        Err(e) => {
            warn!(source = %source.name, error = %e, "fetch failed");
            record_failure(ctx, &mut source, &e, 0).await?;
            return Ok(json!({
                "success": false,
                "error": e.to_string(),
                "files_fetched": 0,
                "total_bytes": 0,
            }));
        }
    };

    if files.is_empty() {
        source.last_fetch_status = Some("success".to_string());
        source.last_fetch_error = None;
        source.last_fetched_bytes = Some(0);
        ctx.store.update_log_source(&source).await?;
        return Ok(json!({
            "success": true,
            "files_fetched": 0,
            "total_bytes": 0,
            "message": "No new log files found",
        }));
    }

    let mut total_bytes = 0u64;
    let mut fetched_names = Vec::new();

    for file in files {
        let storage_key = format!(
            "sites/{}/logs/{}/{}/{}",
            source.site_id,
            source.id,
            Uuid::new_v4(),
            file.name
        );

        let mut hasher = Sha256::new();
        hasher.update(&file.bytes);
        let sha256 = format!("{:x}", hasher.finalize());

        ctx.objects.put(&storage_key, &file.bytes).await?;

        let log_file = LogFile {
            id: Uuid::new_v4(),
            site_id: source.site_id,
            filename: file.name.clone(),
            size_bytes: file.size,
            sha256: Some(sha256),
            storage_key,
            status: LogFileStatus::Uploaded,
            uploaded_at: Some(ctx.clock.now()),
        };
        ctx.store.insert_log_file(&log_file).await?;

        let job = Job::new(log_file.id, JobType::Parse);
        ctx.store.insert_job(&job).await?;
        ctx.queue
            .enqueue(crate::job::worker::PARSE_TASK, json!({"job_id": job.id}))
            .await?;

        total_bytes += file.size;
        fetched_names.push(file.name);
    }

    source.last_fetch_status = Some("success".to_string());
    source.last_fetch_error = None;
    source.last_fetched_bytes = Some(total_bytes);
    ctx.store.update_log_source(&source).await?;

    info!(
        source = %source.name,
        files = fetched_names.len(),
        total_bytes,
        "fetch completed"
    );

    Ok(json!({
        "success": true,
        "files_fetched": fetched_names.len(),
        "total_bytes": total_bytes,
        "files": fetched_names,
    }))
}

async fn record_failure(
    ctx: &JobContext,
    source: &mut LogSource,
    error: &FetchError,
    fetched_bytes: u64,
) -> Result<(), JobError> {
    source.last_fetch_status = Some("error".to_string());
    source.last_fetch_error = Some(error.to_string());
    source.last_fetched_bytes = Some(fetched_bytes);
    ctx.store.update_log_source(source).await?;
    Ok(())
}

/// Probe a source's connectivity without transferring logs.
pub async fn run_test_connection_job(
    ctx: &JobContext,
    factory: &dyn FetcherFactory,
    source_id: Uuid,
) -> Result<Value, JobError> {
    let Some(source) = ctx.store.get_log_source(source_id).await? else {
        return Err(JobError::SourceNotFound(source_id));
    };

    let mut fetcher = match factory.build(&source) {
        Ok(fetcher) => fetcher,
        Err(e) => {
            return Ok(json!({
                "success": false,
                "message": format!("Connection test failed: {e}"),
            }))
        }
    };

    let (success, message) = fetcher.test_connection().await;
    fetcher.cleanup().await;

    Ok(json!({"success": success, "message": message}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::FetchedFile;
    use crate::storage::memory::{ManualClock, MemoryJobStore, MemoryObjectStore, MemoryTaskQueue};
    use crate::storage::model::{LogSourceStatus, Schedule};
    use crate::storage::JobStore;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    struct StaticFetcher {
        files: Vec<FetchedFile>,
        fail: Option<FetchError>,
    }

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn test_connection(&mut self) -> (bool, String) {
            (self.fail.is_none(), "static".to_string())
        }

        async fn fetch(&mut self) -> Result<Vec<FetchedFile>, FetchError> {
            match self.fail.take() {
                Some(e) => Err(e),
                None => Ok(self.files.clone()),
            }
        }

        async fn cleanup(&mut self) {}
    }

    struct StaticFactory {
        files: Vec<FetchedFile>,
        fail_with: Option<fn() -> FetchError>,
    }

    impl FetcherFactory for StaticFactory {
        fn build(&self, _source: &LogSource) -> Result<Box<dyn Fetcher>, FetchError> {
            Ok(Box::new(StaticFetcher {
                files: self.files.clone(),
                fail: self.fail_with.map(|f| f()),
            }))
        }
    }

    struct Fixture {
        ctx: JobContext,
        store: Arc<MemoryJobStore>,
        queue: Arc<MemoryTaskQueue>,
        source: LogSource,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryJobStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let queue = Arc::new(MemoryTaskQueue::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 1, 21, 12, 0, 0).unwrap(),
        ));

        let source = LogSource {
            id: Uuid::new_v4(),
            site_id: Uuid::new_v4(),
            name: "prod sftp".to_string(),
            source_type: LogSourceType::Sftp,
            status: LogSourceStatus::Active,
            connection_config: BTreeMap::new(),
            schedule: Schedule::Interval {
                interval_minutes: 60,
            },
            last_fetch_at: None,
            last_fetch_status: None,
            last_fetch_error: None,
            last_fetched_bytes: None,
        };
        store.insert_log_source(source.clone());

        Fixture {
            ctx: JobContext::new(store.clone(), objects, queue.clone(), clock),
            store,
            queue,
            source,
        }
    }

    #[tokio::test]
    async fn test_fetch_stores_files_and_enqueues_parse_jobs() {
        let fixture = fixture();
        let factory = StaticFactory {
            files: vec![
                FetchedFile {
                    name: "access.log".to_string(),
                    bytes: b"line\n".to_vec(),
                    size: 5,
                },
                FetchedFile {
                    name: "access.log.1".to_string(),
                    bytes: b"old\n".to_vec(),
                    size: 4,
                },
            ],
            fail_with: None,
        };

        let result = run_fetch_job(&fixture.ctx, &factory, fixture.source.id)
            .await
            .unwrap();

        assert_eq!(result["success"], true);
        assert_eq!(result["files_fetched"], 2);
        assert_eq!(result["total_bytes"], 9);

        let log_files = fixture.store.log_files();
        assert_eq!(log_files.len(), 2);
        for file in &log_files {
            assert_eq!(file.status, LogFileStatus::Uploaded);
            assert_eq!(file.sha256.as_ref().unwrap().len(), 64);
            assert!(file.storage_key.starts_with(&format!(
                "sites/{}/logs/{}/",
                fixture.source.site_id, fixture.source.id
            )));
            assert!(fixture.ctx.objects.exists(&file.storage_key).await.unwrap());
        }

        // One pending parse job per stored file.
        assert_eq!(fixture.store.jobs().len(), 2);
        let tasks = fixture.queue.pending_tasks();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.name == crate::job::worker::PARSE_TASK));

        let source = fixture
            .ctx
            .store
            .get_log_source(fixture.source.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(source.last_fetch_status.as_deref(), Some("success"));
        assert_eq!(source.last_fetched_bytes, Some(9));
        assert!(source.last_fetch_at.is_some());
    }

    #[tokio::test]
    async fn test_fetch_failure_marks_source_without_crashing() {
        let fixture = fixture();
        let factory = StaticFactory {
            files: Vec::new(),
            fail_with: Some(|| FetchError::Auth("permission denied".to_string())),
        };

        let result = run_fetch_job(&fixture.ctx, &factory, fixture.source.id)
            .await
            .unwrap();
        assert_eq!(result["success"], false);

        let source = fixture
            .ctx
            .store
            .get_log_source(fixture.source.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(source.last_fetch_status.as_deref(), Some("error"));
        assert!(source
            .last_fetch_error
            .as_deref()
            .unwrap()
            .contains("permission denied"));
        // Scheduling stays intact: last_fetch_at was stamped.
        assert!(source.last_fetch_at.is_some());
    }

    #[tokio::test]
    async fn test_fetch_with_no_files_reports_success() {
        let fixture = fixture();
        let factory = StaticFactory {
            files: Vec::new(),
            fail_with: None,
        };

        let result = run_fetch_job(&fixture.ctx, &factory, fixture.source.id)
            .await
            .unwrap();
        assert_eq!(result["success"], true);
        assert_eq!(result["files_fetched"], 0);
        assert_eq!(result["message"], "No new log files found");
        assert_eq!(fixture.queue.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_missing_source_is_an_error() {
        let fixture = fixture();
        let factory = StaticFactory {
            files: Vec::new(),
            fail_with: None,
        };
        let err = run_fetch_job(&fixture.ctx, &factory, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::SourceNotFound(_)));
    }

    #[tokio::test]
    async fn test_last_fetch_at_stamped_before_transfer() {
        let fixture = fixture();
        // A factory whose build inspects the already-updated source.
        struct AssertingFactory {
            store: Arc<MemoryJobStore>,
        }
        impl FetcherFactory for AssertingFactory {
            fn build(&self, source: &LogSource) -> Result<Box<dyn Fetcher>, FetchError> {
                let stored = futures::executor::block_on(async {
                    self.store.get_log_source(source.id).await.unwrap().unwrap()
                });
                assert!(stored.last_fetch_at.is_some());
                Ok(Box::new(StaticFetcher {
                    files: Vec::new(),
                    fail: None,
                }))
            }
        }

        let factory = AssertingFactory {
            store: fixture.store.clone(),
        };
        run_fetch_job(&fixture.ctx, &factory, fixture.source.id)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_test_connection_job() {
        let fixture = fixture();
        let factory = StaticFactory {
            files: Vec::new(),
            fail_with: None,
        };
        let result = run_test_connection_job(&fixture.ctx, &factory, fixture.source.id)
            .await
            .unwrap();
        assert_eq!(result["success"], true);

        let missing = run_test_connection_job(&fixture.ctx, &factory, Uuid::new_v4()).await;
        assert!(missing.is_err());
    }

    #[tokio::test]
    async fn test_default_factory_requires_bucket_builder_for_s3() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let factory = DefaultFetcherFactory::new(clock);
        let mut source = fixture().source;
        source.source_type = LogSourceType::S3;
        let err = match factory.build(&source) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(err, FetchError::Config(_)));
    }
}
