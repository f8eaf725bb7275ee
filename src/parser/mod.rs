pub mod access;

pub use access::AccessLogParser;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParserError {
    #[error("regex compilation error: {0}")]
    Regex(#[from] regex::Error),
}

/// Response status grouped into the classes the aggregator counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusClass {
    Success,
    Redirect,
    ClientError,
    ServerError,
    Other,
}

impl StatusClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusClass::Success => "2xx",
            StatusClass::Redirect => "3xx",
            StatusClass::ClientError => "4xx",
            StatusClass::ServerError => "5xx",
            StatusClass::Other => "other",
        }
    }
}

/// One normalized access-log event.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub ip: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub bytes_sent: u64,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
    pub user: Option<String>,
    pub protocol: Option<String>,
    pub raw_line: String,
    pub line_number: u64,
}

impl LogEvent {
    pub fn status_class(&self) -> StatusClass {
        match self.status {
            200..=299 => StatusClass::Success,
            300..=399 => StatusClass::Redirect,
            400..=499 => StatusClass::ClientError,
            500..=599 => StatusClass::ServerError,
            _ => StatusClass::Other,
        }
    }
}

/// Outcome of classifying one line of input.
#[derive(Debug)]
pub enum LineOutcome {
    Event(LogEvent),
    /// Blank line or comment; counted but never an error.
    Skip,
    Error(String),
}

/// Sample of a line that failed to parse. At most ten are retained.
#[derive(Debug, Clone)]
pub struct ParseErrorSample {
    pub line_number: u64,
    pub raw_line: String,
    pub error: String,
}

const MAX_ERROR_SAMPLES: usize = 10;

/// Accumulated result of parsing one file.
#[derive(Debug, Default)]
pub struct ParseResult {
    pub total_lines: u64,
    pub parsed_lines: u64,
    pub failed_lines: u64,
    pub empty_lines: u64,
    pub events: Vec<LogEvent>,
    pub errors: Vec<ParseErrorSample>,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
}

impl ParseResult {
    pub fn add_event(&mut self, event: LogEvent) {
        self.parsed_lines += 1;
        if self
            .first_timestamp
            .map_or(true, |first| event.timestamp < first)
        {
            self.first_timestamp = Some(event.timestamp);
        }
        if self
            .last_timestamp
            .map_or(true, |last| event.timestamp > last)
        {
            self.last_timestamp = Some(event.timestamp);
        }
        self.events.push(event);
    }

    pub fn add_error(&mut self, sample: ParseErrorSample) {
        self.failed_lines += 1;
        if self.errors.len() < MAX_ERROR_SAMPLES {
            self.errors.push(sample);
        }
    }

    /// Fraction of non-empty lines that parsed.
    pub fn success_rate(&self) -> f64 {
        let parseable = self.total_lines.saturating_sub(self.empty_lines);
        if parseable == 0 {
            return 0.0;
        }
        self.parsed_lines as f64 / parseable as f64
    }

    pub fn to_json(&self) -> Value {
        json!({
            "total_lines": self.total_lines,
            "parsed_lines": self.parsed_lines,
            "failed_lines": self.failed_lines,
            "empty_lines": self.empty_lines,
            "success_rate": (self.success_rate() * 10_000.0).round() / 100.0,
            "first_timestamp": self.first_timestamp.map(|t| t.to_rfc3339()),
            "last_timestamp": self.last_timestamp.map(|t| t.to_rfc3339()),
            "sample_errors": self
                .errors
                .iter()
                .map(|e| {
                    let raw: String = e.raw_line.chars().take(200).collect();
                    json!({"line": e.line_number, "error": e.error, "raw": raw})
                })
                .collect::<Vec<_>>(),
        })
    }
}
