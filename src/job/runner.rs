use crate::aggregate::Aggregator;
use crate::anomaly::detect_anomalies;
use crate::job::{JobContext, JobError};
use crate::parser::AccessLogParser;
use crate::security::{FindingCandidate, SecurityDetector};
use crate::storage::model::{
    AggregateSnapshot, Finding, Job, JobStatus, LogFile, LogFileStatus,
};
use chrono::Duration;
use serde_json::{json, Value};
use tracing::{error, info};
use uuid::Uuid;

fn candidate_to_finding(
    site_id: Uuid,
    log_file_id: Uuid,
    candidate: &FindingCandidate,
) -> Finding {
    Finding {
        id: Uuid::new_v4(),
        site_id,
        log_file_id: Some(log_file_id),
        finding_type: candidate.finding_type.clone(),
        severity: candidate.severity,
        title: candidate.title.clone(),
        description: candidate.description.clone(),
        evidence: candidate.evidence.clone(),
        suggested_action: candidate.suggested_action.clone(),
        metadata: candidate.metadata.clone(),
    }
}

async fn set_progress(ctx: &JobContext, job: &mut Job, progress: u8) -> Result<(), JobError> {
    job.progress = progress;
    ctx.store.update_job(job).await?;
    Ok(())
}

/// Best-effort failure bookkeeping. Runs after the pipeline already failed,
/// so storage errors here are logged rather than propagated.
async fn mark_failed(
    ctx: &JobContext,
    job: &mut Job,
    log_file: Option<&mut LogFile>,
    message: &str,
) {
    job.status = JobStatus::Failed;
    job.error_message = Some(message.to_string());
    job.completed_at = Some(ctx.clock.now());
    if let Err(e) = ctx.store.update_job(job).await {
        error!(job_id = %job.id, error = %e, "failed to record job failure");
    }

    if let Some(log_file) = log_file {
        log_file.status = LogFileStatus::Failed;
        if let Err(e) = ctx.store.update_log_file(log_file).await {
            error!(log_file_id = %log_file.id, error = %e, "failed to record log file failure");
        }
    }
}

/// Drive one parse job through the state machine:
/// download, parse, aggregate, detect, persist. Progress milestones are
/// committed before each stage so observers see monotone progress. On any
/// failure the job and log file are marked failed and the error re-raised
/// for the queue's retry policy.
pub async fn run_parse_job(ctx: &JobContext, job_id: Uuid) -> Result<Value, JobError> {
    let Some(mut job) = ctx.store.get_job(job_id).await? else {
        return Err(JobError::JobNotFound(job_id));
    };

    job.status = JobStatus::Processing;
    job.started_at = Some(ctx.clock.now());
    set_progress(ctx, &mut job, 5).await?;

    let Some(mut log_file) = ctx.store.get_log_file(job.log_file_id).await? else {
        let err = JobError::LogFileNotFound(job.log_file_id);
        mark_failed(ctx, &mut job, None, &err.to_string()).await;
        return Err(err);
    };

    match execute_parse(ctx, &mut job, &mut log_file).await {
        Ok(summary) => {
            info!(job_id = %job.id, log_file = %log_file.filename, "parse job completed");
            Ok(summary)
        }
        Err(e) => {
            mark_failed(ctx, &mut job, Some(&mut log_file), &e.to_string()).await;
            Err(e)
        }
    }
}

async fn execute_parse(
    ctx: &JobContext,
    job: &mut Job,
    log_file: &mut LogFile,
) -> Result<Value, JobError> {
    log_file.status = LogFileStatus::Processing;
    ctx.store.update_log_file(log_file).await?;
    set_progress(ctx, job, 10).await?;

    let site = ctx
        .store
        .get_site(log_file.site_id)
        .await?
        .ok_or(JobError::SiteNotFound(log_file.site_id))?;

    let bytes = ctx.objects.get(&log_file.storage_key).await?;
    set_progress(ctx, job, 20).await?;

    let parser = AccessLogParser::new(site.log_format)?;
    let parse_result = parser.parse_bytes(&bytes);
    set_progress(ctx, job, 60).await?;

    let aggregation = Aggregator::new().aggregate(parse_result.events.iter());
    set_progress(ctx, job, 80).await?;

    let rows: Vec<_> = aggregation
        .hourly_buckets
        .iter()
        .map(|bucket| bucket.to_row(site.id, log_file.id, ctx.top_n))
        .collect();
    ctx.store
        .upsert_aggregates(site.id, log_file.id, &rows)
        .await?;

    let detector = SecurityDetector::new()?;
    let security_findings = detector.detect(&parse_result.events);
    let finding_rows: Vec<Finding> = security_findings
        .iter()
        .map(|c| candidate_to_finding(site.id, log_file.id, c))
        .collect();
    ctx.store.insert_findings(&finding_rows).await?;

    let anomaly_findings = if let Some(earliest) = rows.iter().map(|r| r.hour_bucket).min() {
        let baseline_start = earliest - Duration::days(ctx.anomaly.baseline_days);
        let baseline = ctx
            .store
            .load_baseline_snapshots(site.id, baseline_start)
            .await?;
        let targets: Vec<AggregateSnapshot> =
            rows.iter().map(AggregateSnapshot::from).collect();

        let anomalies = detect_anomalies(&baseline, &targets, &ctx.anomaly);
        let anomaly_rows: Vec<Finding> = anomalies
            .iter()
            .map(|c| candidate_to_finding(site.id, log_file.id, c))
            .collect();
        ctx.store.insert_findings(&anomaly_rows).await?;
        anomalies
    } else {
        Vec::new()
    };
    set_progress(ctx, job, 90).await?;

    let summary = json!({
        "status": "completed",
        "log_file_id": log_file.id,
        "filename": log_file.filename,
        "size_bytes": log_file.size_bytes,
        "parse_stats": parse_result.to_json(),
        "aggregation": aggregation.to_json(ctx.top_n),
        "findings": security_findings.iter().map(|f| f.to_json()).collect::<Vec<_>>(),
        "anomalies": anomaly_findings.iter().map(|f| f.to_json()).collect::<Vec<_>>(),
    });

    job.status = JobStatus::Completed;
    job.progress = 100;
    job.result_summary = Some(summary.to_string());
    job.completed_at = Some(ctx.clock.now());
    ctx.store.update_job(job).await?;

    log_file.status = LogFileStatus::Processed;
    ctx.store.update_log_file(log_file).await?;

    Ok(summary)
}
