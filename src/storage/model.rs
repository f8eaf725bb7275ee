use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Supported access-log formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    NginxCombined,
    ApacheCombined,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nginx_combined" => Ok(Self::NginxCombined),
            "apache_combined" => Ok(Self::ApacheCombined),
            other => Err(format!("unsupported log format: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Parse,
    Detect,
    Anomaly,
    Explain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFileStatus {
    PendingUpload,
    Uploaded,
    Processing,
    Processed,
    Failed,
}

/// Finding severity levels, ordered most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Info => "info",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSourceType {
    Ssh,
    Sftp,
    S3,
    Gcs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSourceStatus {
    Active,
    Paused,
    Error,
}

/// Fetch schedule for a log source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Schedule {
    Interval { interval_minutes: u32 },
    Cron { cron: String },
}

/// Connection-config fields that must never leave the process in plaintext.
const SENSITIVE_CONFIG_KEYS: &[&str] = &[
    "password",
    "private_key",
    "access_key_id",
    "secret_access_key",
];

pub const REDACTED_PLACEHOLDER: &str = "***REDACTED***";

/// A remote location logs are periodically pulled from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSource {
    pub id: Uuid,
    pub site_id: Uuid,
    pub name: String,
    pub source_type: LogSourceType,
    pub status: LogSourceStatus,
    /// Opaque connection settings interpreted by the matching fetcher.
    pub connection_config: BTreeMap<String, Value>,
    pub schedule: Schedule,
    pub last_fetch_at: Option<DateTime<Utc>>,
    pub last_fetch_status: Option<String>,
    pub last_fetch_error: Option<String>,
    pub last_fetched_bytes: Option<u64>,
}

impl LogSource {
    /// Copy of the connection config safe for egress: sensitive values
    /// replaced with a fixed placeholder.
    pub fn redacted_config(&self) -> BTreeMap<String, Value> {
        let mut redacted = self.connection_config.clone();
        for key in SENSITIVE_CONFIG_KEYS {
            if redacted.contains_key(*key) {
                redacted.insert((*key).to_string(), Value::from(REDACTED_PLACEHOLDER));
            }
        }
        redacted
    }
}

/// A site that owns log files and picks the parser format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub id: Uuid,
    pub name: String,
    pub domain: Option<String>,
    pub log_format: LogFormat,
}

/// An uploaded log file awaiting or past processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFile {
    pub id: Uuid,
    pub site_id: Uuid,
    pub filename: String,
    pub size_bytes: u64,
    pub sha256: Option<String>,
    pub storage_key: String,
    pub status: LogFileStatus,
    pub uploaded_at: Option<DateTime<Utc>>,
}

/// A background job driving one pipeline run over a log file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub log_file_id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub progress: u8,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_summary: Option<String>,
    pub error_message: Option<String>,
}

impl Job {
    pub fn new(log_file_id: Uuid, job_type: JobType) -> Self {
        Self {
            id: Uuid::new_v4(),
            log_file_id,
            job_type,
            status: JobStatus::Pending,
            progress: 0,
            started_at: None,
            completed_at: None,
            result_summary: None,
            error_message: None,
        }
    }
}

/// One persisted hourly aggregate row, keyed by `(site, log_file, hour)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateRow {
    pub id: Uuid,
    pub site_id: Uuid,
    pub log_file_id: Uuid,
    pub hour_bucket: DateTime<Utc>,
    pub requests_count: u64,
    pub status_2xx: u64,
    pub status_3xx: u64,
    pub status_4xx: u64,
    pub status_5xx: u64,
    pub unique_ips: u64,
    pub unique_paths: u64,
    pub total_bytes: u64,
    pub top_paths: Value,
    pub top_ips: Value,
    pub top_user_agents: Value,
    pub top_status_codes: Value,
}

/// The slice of an aggregate row the anomaly detector needs.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSnapshot {
    pub hour_bucket: DateTime<Utc>,
    pub requests_count: u64,
    pub status_5xx: u64,
    pub unique_ips: u64,
    pub top_paths: Option<Value>,
}

impl From<&AggregateRow> for AggregateSnapshot {
    fn from(row: &AggregateRow) -> Self {
        Self {
            hour_bucket: row.hour_bucket,
            requests_count: row.requests_count,
            status_5xx: row.status_5xx,
            unique_ips: row.unique_ips,
            top_paths: Some(row.top_paths.clone()),
        }
    }
}

/// A persisted security or anomaly finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: Uuid,
    pub site_id: Uuid,
    pub log_file_id: Option<Uuid>,
    pub finding_type: String,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub evidence: Value,
    pub suggested_action: Option<String>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorGroupStatus {
    Unresolved,
    Resolved,
    Ignored,
}

/// Recurring errors grouped by fingerprint, unique per `(site, fingerprint)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorGroup {
    pub id: Uuid,
    pub site_id: Uuid,
    pub fingerprint: String,
    pub error_type: String,
    pub error_message: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub occurrence_count: u64,
    pub status: ErrorGroupStatus,
    pub resolved_at: Option<DateTime<Utc>>,
    pub deployment_id: Option<String>,
}

/// One concrete occurrence of a grouped error, append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorOccurrence {
    pub id: Uuid,
    pub error_group_id: Uuid,
    pub log_file_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub error_type: String,
    pub error_message: String,
    pub stack_trace: Option<String>,
    pub file_path: Option<String>,
    pub line_number: Option<u32>,
    pub function_name: Option<String>,
    pub request_url: Option<String>,
    pub request_method: Option<String>,
    pub ip_address: Option<String>,
    pub user_id: Option<String>,
    pub user_agent: Option<String>,
    pub context: Option<Value>,
}
