pub mod fingerprint;

pub use fingerprint::Fingerprinter;

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ErrorLogError {
    #[error("regex compilation error: {0}")]
    Regex(#[from] regex::Error),

    #[error("unknown error-log format: {0}")]
    UnknownFormat(String),
}

/// Format hint for the error-log parser. `Auto` runs every extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorLogFormat {
    Auto,
    Python,
    Javascript,
    Java,
    Http,
    Apache,
}

impl FromStr for ErrorLogFormat {
    type Err = ErrorLogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "python" => Ok(Self::Python),
            "javascript" => Ok(Self::Javascript),
            "java" => Ok(Self::Java),
            "http" => Ok(Self::Http),
            "apache" | "apache_error" | "modsecurity" => Ok(Self::Apache),
            other => Err(ErrorLogError::UnknownFormat(other.to_string())),
        }
    }
}

/// One extracted application error with whatever context the log carried.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub error_type: String,
    pub error_message: String,
    pub timestamp: DateTime<Utc>,
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
    /// Lowercase SHA-256 hex grouping key, filled in by the parser.
    pub fingerprint: String,
}

impl ErrorRecord {
    fn bare(error_type: String, error_message: String, timestamp: DateTime<Utc>) -> Self {
        Self {
            error_type,
            error_message,
            timestamp,
            stack_trace: None,
            file_path: None,
            line_number: None,
            function_name: None,
            request_url: None,
            request_method: None,
            ip_address: None,
            user_id: None,
            user_agent: None,
            context: None,
            fingerprint: String::new(),
        }
    }
}

// Back-scan window for a Python traceback preceding its error line.
const PYTHON_TRACEBACK_WINDOW: usize = 5_000;
// Forward-scan windows for stack frames following an error line.
const JS_STACK_WINDOW: usize = 2_000;
const JAVA_STACK_WINDOW: usize = 3_000;

const PYTHON_TRACEBACK_HEADER: &str = "Traceback (most recent call last):";

/// Slice up to `max` bytes of `content` ending at `end`, snapped to char
/// boundaries.
fn window_before(content: &str, end: usize, max: usize) -> &str {
    let mut start = end.saturating_sub(max);
    while start < end && !content.is_char_boundary(start) {
        start += 1;
    }
    &content[start..end]
}

/// Slice up to `max` bytes of `content` starting at `start`, snapped to char
/// boundaries.
fn window_after(content: &str, start: usize, max: usize) -> &str {
    let mut end = (start + max).min(content.len());
    while end > start && !content.is_char_boundary(end) {
        end -= 1;
    }
    &content[start..end]
}

/// Regex-driven extractor for application error logs.
pub struct ErrorLogParser {
    timestamp: Regex,
    python_error: Regex,
    python_frame: Regex,
    javascript_error: Regex,
    javascript_frame: Regex,
    java_error: Regex,
    java_frame: Regex,
    http_500: Regex,
    apache_error: Regex,
    modsec_msg: Regex,
    modsec_uri: Regex,
    modsec_rule_id: Regex,
    modsec_severity: Regex,
    apache_denied: Regex,
    fingerprinter: Fingerprinter,
}

impl ErrorLogParser {
    pub fn new() -> Result<Self, ErrorLogError> {
        Ok(Self {
            timestamp: Regex::new(
                r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:\d{2})?",
            )?,
            python_error: Regex::new(r"(?m)^.*?\b(?P<error_type>\w+(?:Error|Exception)): (?P<message>.*)$")?,
            python_frame: Regex::new(r#"File "(?P<file>[^"]+)", line (?P<line>\d+), in (?P<function>\w+)"#)?,
            javascript_error: Regex::new(r"(?m)^.*?\b(?P<error_type>\w+Error): (?P<message>.*)$")?,
            javascript_frame: Regex::new(r"at (?P<function>[\w.]+) \((?P<file>[\w./]+):(?P<line>\d+):\d+\)")?,
            java_error: Regex::new(r"(?m)^.*?\b(?P<error_type>[\w.]+Exception): (?P<message>.*)$")?,
            java_frame: Regex::new(r"at (?P<function>[\w.]+)\((?P<file>[\w.]+):(?P<line>\d+)")?,
            http_500: Regex::new(
                r#"(?P<ip>[\d.]+) - (?P<user>\S+) \[(?P<timestamp>[^\]]+)\] "(?P<method>\w+) (?P<url>\S+) HTTP/\d\.\d" 5\d{2}"#,
            )?,
            apache_error: Regex::new(
                r"(?m)^\[(?P<timestamp>[A-Za-z]{3} [A-Za-z]{3} \d{2} \d{2}:\d{2}:\d{2} \d{4})\]\s+\[(?P<module>[^\]]+)\](?:\s+\[[^\]]+\])*\s+(?:\[client (?P<ip>[^\]]+)\]\s+)?(?P<message>.*)$",
            )?,
            modsec_msg: Regex::new(r#"\[msg "([^"]+)"\]"#)?,
            modsec_uri: Regex::new(r#"\[uri "([^"]+)"\]"#)?,
            modsec_rule_id: Regex::new(r#"\[id "([^"]+)"\]"#)?,
            modsec_severity: Regex::new(r#"\[severity "([^"]+)"\]"#)?,
            apache_denied: Regex::new(r"client denied by server configuration: (.*)$")?,
            fingerprinter: Fingerprinter::new()?,
        })
    }

    /// Extract error records from a text blob. `fallback` stamps records
    /// whose timestamp cannot be recovered from the log itself.
    pub fn parse(
        &self,
        content: &str,
        format: ErrorLogFormat,
        fallback: DateTime<Utc>,
    ) -> Vec<ErrorRecord> {
        let mut records = match format {
            ErrorLogFormat::Auto => {
                let mut all = self.parse_python(content, fallback);
                all.extend(self.parse_javascript(content, fallback));
                all.extend(self.parse_java(content, fallback));
                all.extend(self.parse_http(content, fallback));
                all.extend(self.parse_apache(content, fallback));
                // Overlapping extractors (ValueError matches both the python
                // and javascript grammars) report the same line twice.
                dedupe(all)
            }
            ErrorLogFormat::Python => self.parse_python(content, fallback),
            ErrorLogFormat::Javascript => self.parse_javascript(content, fallback),
            ErrorLogFormat::Java => self.parse_java(content, fallback),
            ErrorLogFormat::Http => self.parse_http(content, fallback),
            ErrorLogFormat::Apache => self.parse_apache(content, fallback),
        };

        for record in &mut records {
            record.fingerprint = self.fingerprinter.fingerprint(record);
        }
        records
    }

    /// Timestamp for an error line: a timestamp on the line itself wins,
    /// else the nearest one in the preceding window, else `fallback`.
    fn resolve_timestamp(
        &self,
        content: &str,
        line_start: usize,
        prefix: &str,
        fallback: DateTime<Utc>,
    ) -> DateTime<Utc> {
        if let Some(m) = self.timestamp.find(prefix) {
            return self.parse_iso_timestamp(m.as_str(), fallback);
        }
        let preceding = window_before(content, line_start, PYTHON_TRACEBACK_WINDOW);
        if let Some(m) = self.timestamp.find_iter(preceding).last() {
            return self.parse_iso_timestamp(m.as_str(), fallback);
        }
        fallback
    }

    fn parse_python(&self, content: &str, fallback: DateTime<Utc>) -> Vec<ErrorRecord> {
        let mut records = Vec::new();

        for caps in self.python_error.captures_iter(content) {
            let (Some(whole), Some(error_type), Some(message)) =
                (caps.get(0), caps.name("error_type"), caps.name("message"))
            else {
                continue;
            };

            let prefix = &content[whole.start()..error_type.start()];
            let timestamp = self.resolve_timestamp(content, whole.start(), prefix, fallback);
            let mut record = ErrorRecord::bare(
                error_type.as_str().to_string(),
                message.as_str().trim().to_string(),
                timestamp,
            );

            let preceding = window_before(content, whole.start(), PYTHON_TRACEBACK_WINDOW);
            if let Some(idx) = preceding.rfind(PYTHON_TRACEBACK_HEADER) {
                let stack = preceding[idx..].trim_end();
                record.stack_trace = Some(stack.to_string());

                // The deepest frame is where the exception was raised.
                if let Some(frame) = self.python_frame.captures_iter(stack).last() {
                    record.file_path = frame.name("file").map(|m| m.as_str().to_string());
                    record.line_number =
                        frame.name("line").and_then(|m| m.as_str().parse().ok());
                    record.function_name =
                        frame.name("function").map(|m| m.as_str().to_string());
                }
            }

            records.push(record);
        }

        records
    }

    fn parse_javascript(&self, content: &str, fallback: DateTime<Utc>) -> Vec<ErrorRecord> {
        let mut records = Vec::new();

        for caps in self.javascript_error.captures_iter(content) {
            let (Some(whole), Some(error_type), Some(message)) =
                (caps.get(0), caps.name("error_type"), caps.name("message"))
            else {
                continue;
            };

            let prefix = &content[whole.start()..error_type.start()];
            let timestamp = self.resolve_timestamp(content, whole.start(), prefix, fallback);
            let mut record = ErrorRecord::bare(
                error_type.as_str().to_string(),
                message.as_str().trim().to_string(),
                timestamp,
            );

            let following = window_after(content, whole.end(), JS_STACK_WINDOW);
            let mut stack_lines: Vec<&str> = Vec::new();
            for line in following.split('\n') {
                let trimmed = line.trim();
                if trimmed.starts_with("at ") {
                    stack_lines.push(trimmed);
                } else if !stack_lines.is_empty() {
                    break;
                }
            }

            if !stack_lines.is_empty() {
                let stack = stack_lines.join("\n");
                if let Some(frame) = self.javascript_frame.captures(&stack) {
                    record.function_name =
                        frame.name("function").map(|m| m.as_str().to_string());
                    record.file_path = frame.name("file").map(|m| m.as_str().to_string());
                    record.line_number =
                        frame.name("line").and_then(|m| m.as_str().parse().ok());
                }
                record.stack_trace = Some(stack);
            }

            records.push(record);
        }

        records
    }

    fn parse_java(&self, content: &str, fallback: DateTime<Utc>) -> Vec<ErrorRecord> {
        let mut records = Vec::new();

        for caps in self.java_error.captures_iter(content) {
            let (Some(whole), Some(error_type), Some(message)) =
                (caps.get(0), caps.name("error_type"), caps.name("message"))
            else {
                continue;
            };

            let prefix = &content[whole.start()..error_type.start()];
            let timestamp = self.resolve_timestamp(content, whole.start(), prefix, fallback);
            let mut record = ErrorRecord::bare(
                error_type.as_str().to_string(),
                message.as_str().trim().to_string(),
                timestamp,
            );

            let following = window_after(content, whole.end(), JAVA_STACK_WINDOW);
            let mut stack_lines: Vec<&str> = Vec::new();
            for line in following.split('\n') {
                let trimmed = line.trim();
                if trimmed.starts_with("at ")
                    || trimmed.starts_with("...")
                    || trimmed.starts_with("Caused by:")
                {
                    stack_lines.push(trimmed);
                } else if !stack_lines.is_empty() && trimmed.is_empty() {
                    break;
                }
            }

            if !stack_lines.is_empty() {
                let stack = stack_lines.join("\n");
                if let Some(frame) = self.java_frame.captures(&stack) {
                    record.function_name =
                        frame.name("function").map(|m| m.as_str().to_string());
                    record.file_path = frame.name("file").map(|m| m.as_str().to_string());
                    record.line_number =
                        frame.name("line").and_then(|m| m.as_str().parse().ok());
                }
                record.stack_trace = Some(stack);
            }

            records.push(record);
        }

        records
    }

    fn parse_http(&self, content: &str, fallback: DateTime<Utc>) -> Vec<ErrorRecord> {
        self.http_500
            .captures_iter(content)
            .filter_map(|caps| {
                let method = caps.name("method")?.as_str().to_string();
                let url = caps.name("url")?.as_str().to_string();
                let timestamp = self.parse_http_timestamp(
                    caps.name("timestamp").map(|m| m.as_str()).unwrap_or(""),
                    fallback,
                );

                let mut record = ErrorRecord::bare(
                    "HTTP500Error".to_string(),
                    format!("Internal Server Error on {method} {url}"),
                    timestamp,
                );
                record.request_url = Some(url);
                record.request_method = Some(method);
                record.ip_address = caps.name("ip").map(|m| m.as_str().to_string());
                Some(record)
            })
            .collect()
    }

    fn parse_apache(&self, content: &str, fallback: DateTime<Utc>) -> Vec<ErrorRecord> {
        let mut records = Vec::new();

        for caps in self.apache_error.captures_iter(content) {
            let Some(message) = caps.name("message") else {
                continue;
            };
            let message = message.as_str();
            let timestamp = self.parse_apache_timestamp(
                caps.name("timestamp").map(|m| m.as_str()).unwrap_or(""),
                fallback,
            );
            let ip = caps.name("ip").map(|m| m.as_str().to_string());

            if message.contains("ModSecurity:") {
                let msg = self
                    .modsec_msg
                    .captures(message)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_else(|| message.to_string());
                let uri = self
                    .modsec_uri
                    .captures(message)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string());
                let rule_id = self
                    .modsec_rule_id
                    .captures(message)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string());
                let severity = self
                    .modsec_severity
                    .captures(message)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string());

                let mut record = ErrorRecord::bare("ModSecurity".to_string(), msg, timestamp);
                record.request_url = uri;
                record.ip_address = ip;
                record.context = Some(json!({
                    "rule_id": rule_id,
                    "severity": severity,
                }));
                records.push(record);
                continue;
            }

            let denied = self
                .apache_denied
                .captures(message)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string());
            let error_message = denied.unwrap_or_else(|| message.to_string());

            let mut record =
                ErrorRecord::bare("ApacheError".to_string(), error_message, timestamp);
            record.ip_address = ip;
            records.push(record);
        }

        records
    }

    /// ISO-8601 variants with optional fraction, `T` or space separator and
    /// an optional trailing zone, which is discarded.
    fn parse_iso_timestamp(&self, raw: &str, fallback: DateTime<Utc>) -> DateTime<Utc> {
        let mut cleaned = raw.trim().to_string();
        if let Some(stripped) = cleaned.strip_suffix('Z') {
            cleaned = stripped.to_string();
        } else if cleaned.len() > 6 {
            let (head, tail) = cleaned.split_at(cleaned.len() - 6);
            if tail.starts_with('+') || tail.starts_with('-') {
                cleaned = head.to_string();
            }
        }

        for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(&cleaned, format) {
                return DateTime::from_naive_utc_and_offset(naive, Utc);
            }
        }
        fallback
    }

    /// Access-log form `21/Jan/2026:10:30:45 +0000`; the zone is discarded.
    fn parse_http_timestamp(&self, raw: &str, fallback: DateTime<Utc>) -> DateTime<Utc> {
        let cleaned = match raw.rsplit_once(' ') {
            Some((head, zone))
                if zone.len() == 5 && (zone.starts_with('+') || zone.starts_with('-')) =>
            {
                head
            }
            _ => raw,
        };
        NaiveDateTime::parse_from_str(cleaned, "%d/%b/%Y:%H:%M:%S")
            .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
            .unwrap_or(fallback)
    }

    /// Apache ctime form `Mon Jan 19 01:07:36 2026`.
    fn parse_apache_timestamp(&self, raw: &str, fallback: DateTime<Utc>) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(raw, "%a %b %d %H:%M:%S %Y")
            .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
            .unwrap_or(fallback)
    }
}

fn dedupe(records: Vec<ErrorRecord>) -> Vec<ErrorRecord> {
    let mut seen = std::collections::HashSet::new();
    records
        .into_iter()
        .filter(|r| {
            seen.insert((
                r.error_type.clone(),
                r.error_message.clone(),
                r.timestamp,
            ))
        })
        .collect()
}
