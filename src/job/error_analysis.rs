use crate::errorlog::{ErrorLogFormat, ErrorLogParser, ErrorRecord};
use crate::job::{JobContext, JobError};
use crate::storage::model::{ErrorGroup, ErrorGroupStatus, ErrorOccurrence};
use crate::storage::StorageError;
use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::info;
use uuid::Uuid;

fn occurrence_from_record(
    group_id: Uuid,
    log_file_id: Option<Uuid>,
    record: &ErrorRecord,
) -> ErrorOccurrence {
    ErrorOccurrence {
        id: Uuid::new_v4(),
        error_group_id: group_id,
        log_file_id,
        timestamp: record.timestamp,
        error_type: record.error_type.clone(),
        error_message: record.error_message.clone(),
        stack_trace: record.stack_trace.clone(),
        file_path: record.file_path.clone(),
        line_number: record.line_number,
        function_name: record.function_name.clone(),
        request_url: record.request_url.clone(),
        request_method: record.request_method.clone(),
        ip_address: record.ip_address.clone(),
        user_id: record.user_id.clone(),
        user_agent: record.user_agent.clone(),
        context: record.context.clone(),
    }
}

/// Extract errors from a stored log file, upsert their groups by
/// `(site, fingerprint)` and append one occurrence per record.
pub async fn run_error_analysis_job(
    ctx: &JobContext,
    log_file_id: Uuid,
    format: ErrorLogFormat,
) -> Result<Value, JobError> {
    let Some(log_file) = ctx.store.get_log_file(log_file_id).await? else {
        return Err(JobError::LogFileNotFound(log_file_id));
    };

    let bytes = match ctx.objects.get(&log_file.storage_key).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return Ok(json!({
                "success": false,
                "error": format!("Failed to download log file: {e}"),
            }))
        }
    };
    let content = String::from_utf8_lossy(&bytes);

    let parser = ErrorLogParser::new()?;
    // Errors without a parseable timestamp get the upload time rather than
    // wall-clock now, so re-running the analysis is stable.
    let fallback = log_file.uploaded_at.unwrap_or_else(|| ctx.clock.now());
    let records = parser.parse(&content, format, fallback);

    if records.is_empty() {
        return Ok(json!({
            "success": true,
            "errors_found": 0,
            "message": "No errors found in log file",
        }));
    }

    let mut new_groups = 0usize;
    let mut new_occurrences = 0usize;
    let mut unique_types: HashSet<&str> = HashSet::new();

    for record in &records {
        unique_types.insert(record.error_type.as_str());

        let group = match ctx
            .store
            .find_error_group(log_file.site_id, &record.fingerprint)
            .await?
        {
            Some(mut group) => {
                if record.timestamp > group.last_seen {
                    group.last_seen = record.timestamp;
                }
                group.occurrence_count += 1;
                ctx.store.update_error_group(&group).await?;
                group
            }
            None => {
                let group = ErrorGroup {
                    id: Uuid::new_v4(),
                    site_id: log_file.site_id,
                    fingerprint: record.fingerprint.clone(),
                    error_type: record.error_type.clone(),
                    error_message: record.error_message.clone(),
                    first_seen: record.timestamp,
                    last_seen: record.timestamp,
                    occurrence_count: 1,
                    status: ErrorGroupStatus::Unresolved,
                    resolved_at: None,
                    deployment_id: None,
                };
                match ctx.store.insert_error_group(&group).await {
                    Ok(()) => {
                        new_groups += 1;
                        group
                    }
                    // A concurrent worker created the group between our
                    // lookup and insert; retry once as an update.
                    Err(StorageError::Conflict(_)) => {
                        let mut existing = ctx
                            .store
                            .find_error_group(log_file.site_id, &record.fingerprint)
                            .await?
                            .ok_or_else(|| {
                                StorageError::Conflict(format!(
                                    "error group {} vanished after conflict",
                                    record.fingerprint
                                ))
                            })?;
                        if record.timestamp > existing.last_seen {
                            existing.last_seen = record.timestamp;
                        }
                        existing.occurrence_count += 1;
                        ctx.store.update_error_group(&existing).await?;
                        existing
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        let occurrence = occurrence_from_record(group.id, Some(log_file.id), record);
        ctx.store.insert_error_occurrence(&occurrence).await?;
        new_occurrences += 1;
    }

    info!(
        log_file = %log_file.filename,
        errors = records.len(),
        new_groups,
        "error analysis completed"
    );

    Ok(json!({
        "success": true,
        "errors_found": records.len(),
        "new_groups": new_groups,
        "new_occurrences": new_occurrences,
        "unique_error_types": unique_types.len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{ManualClock, MemoryJobStore, MemoryObjectStore, MemoryTaskQueue};
    use crate::storage::model::{LogFile, LogFileStatus};
    use crate::storage::JobStore;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Arc;

    struct Fixture {
        ctx: JobContext,
        store: Arc<MemoryJobStore>,
        site_id: Uuid,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryJobStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let queue = Arc::new(MemoryTaskQueue::new());
        let clock = Arc::new(ManualClock::new(now()));
        Fixture {
            ctx: JobContext::new(store.clone(), objects, queue, clock),
            store,
            site_id: Uuid::new_v4(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 21, 12, 0, 0).unwrap()
    }

    async fn seed_log_file(fixture: &Fixture, content: &str) -> LogFile {
        let log_file = LogFile {
            id: Uuid::new_v4(),
            site_id: fixture.site_id,
            filename: "app.log".to_string(),
            size_bytes: content.len() as u64,
            sha256: None,
            storage_key: format!("sites/{}/errors/app.log", fixture.site_id),
            status: LogFileStatus::Uploaded,
            uploaded_at: Some(now()),
        };
        fixture
            .ctx
            .objects
            .put(&log_file.storage_key, content.as_bytes())
            .await
            .unwrap();
        fixture.store.insert_log_file(&log_file).await.unwrap();
        log_file
    }

    const TWO_TRACES: &str = "\
2026-01-21 10:00:00 ERROR: boom
Traceback (most recent call last):
  File \"/app/handlers.py\", line 42, in handle
    raise ValueError(\"bad id 123\")
ValueError: bad id 123

2026-01-21 10:05:00 ERROR: boom again
Traceback (most recent call last):
  File \"/app/handlers.py\", line 42, in handle
    raise ValueError(\"bad id 456\")
ValueError: bad id 456
";

    #[tokio::test]
    async fn test_same_shape_errors_grouped_once() {
        let fixture = fixture();
        let log_file = seed_log_file(&fixture, TWO_TRACES).await;

        let result = run_error_analysis_job(&fixture.ctx, log_file.id, ErrorLogFormat::Python)
            .await
            .unwrap();

        assert_eq!(result["success"], true);
        assert_eq!(result["errors_found"], 2);
        assert_eq!(result["new_groups"], 1);
        assert_eq!(result["new_occurrences"], 2);
        assert_eq!(result["unique_error_types"], 1);

        let groups = fixture.store.error_groups();
        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.error_type, "ValueError");
        assert_eq!(group.occurrence_count, 2);
        assert_eq!(
            group.first_seen,
            Utc.with_ymd_and_hms(2026, 1, 21, 10, 0, 0).unwrap()
        );
        assert_eq!(
            group.last_seen,
            Utc.with_ymd_and_hms(2026, 1, 21, 10, 5, 0).unwrap()
        );
        assert_eq!(group.status, ErrorGroupStatus::Unresolved);

        let occurrences = fixture.store.error_occurrences();
        assert_eq!(occurrences.len(), 2);
        assert!(occurrences.iter().all(|o| o.error_group_id == group.id));
        assert!(occurrences.iter().all(|o| o.log_file_id == Some(log_file.id)));
    }

    #[tokio::test]
    async fn test_existing_group_updated_on_second_file() {
        let fixture = fixture();
        let first = seed_log_file(&fixture, TWO_TRACES).await;
        run_error_analysis_job(&fixture.ctx, first.id, ErrorLogFormat::Python)
            .await
            .unwrap();

        let later = TWO_TRACES.replace("10:0", "11:0").replace("10:05", "11:05");
        let second = seed_log_file(&fixture, &later).await;
        let result = run_error_analysis_job(&fixture.ctx, second.id, ErrorLogFormat::Python)
            .await
            .unwrap();

        assert_eq!(result["new_groups"], 0);
        let groups = fixture.store.error_groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].occurrence_count, 4);
        // first_seen keeps the original sighting.
        assert_eq!(
            groups[0].first_seen,
            Utc.with_ymd_and_hms(2026, 1, 21, 10, 0, 0).unwrap()
        );
        assert!(groups[0].last_seen > groups[0].first_seen);
    }

    #[tokio::test]
    async fn test_no_errors_found() {
        let fixture = fixture();
        let log_file = seed_log_file(&fixture, "just an ordinary line\n").await;
        let result = run_error_analysis_job(&fixture.ctx, log_file.id, ErrorLogFormat::Python)
            .await
            .unwrap();
        assert_eq!(result["errors_found"], 0);
        assert!(fixture.store.error_groups().is_empty());
    }

    #[tokio::test]
    async fn test_missing_object_reports_failure() {
        let fixture = fixture();
        let mut log_file = seed_log_file(&fixture, TWO_TRACES).await;
        log_file.storage_key = "gone".to_string();
        fixture.store.update_log_file(&log_file).await.unwrap();

        let result = run_error_analysis_job(&fixture.ctx, log_file.id, ErrorLogFormat::Auto)
            .await
            .unwrap();
        assert_eq!(result["success"], false);
    }

    #[tokio::test]
    async fn test_missing_log_file_is_an_error() {
        let fixture = fixture();
        let err = run_error_analysis_job(&fixture.ctx, Uuid::new_v4(), ErrorLogFormat::Auto)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::LogFileNotFound(_)));
    }
}
