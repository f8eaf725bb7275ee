use crate::parser::{LineOutcome, LogEvent, ParseErrorSample, ParseResult, ParserError};
use crate::storage::model::LogFormat;
use chrono::{DateTime, Utc};
use regex::Regex;

// Nginx and Apache both emit the combined format:
// $remote_addr - $remote_user [$time_local] "$request" $status $bytes "$referer" "$user_agent"
//
// Example:
// 192.168.1.1 - frank [10/Oct/2024:13:55:36 -0700] "GET /apache_pb.gif HTTP/1.0" 200 2326 "http://www.example.com/start.html" "Mozilla/4.08 [en] (Win98; I ;Nav)"
const COMBINED_PATTERN: &str = concat!(
    r#"^(?P<ip>\S+)\s+"#,
    r#"(?P<ident>\S+)\s+"#,
    r#"(?P<user>\S+)\s+"#,
    r#"\[(?P<time>[^\]]+)\]\s+"#,
    r#""(?P<request>[^"]*)"\s+"#,
    r#"(?P<status>\d+)\s+"#,
    r#"(?P<bytes>\d+|-)\s*"#,
    r#"(?:"(?P<referer>[^"]*)"\s*)?"#,
    r#"(?:"(?P<user_agent>[^"]*)")?"#,
    r#".*$"#,
);

// Time local: 10/Oct/2024:13:55:36 -0700
const TIME_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

// Request line: METHOD /path HTTP/version (protocol optional)
const REQUEST_PATTERN: &str = r"^(?P<method>\S+)\s+(?P<path>\S+)(?:\s+(?P<protocol>\S+))?$";

/// Parser for the Nginx/Apache combined access-log format.
pub struct AccessLogParser {
    format: LogFormat,
    line_pattern: Regex,
    request_pattern: Regex,
}

impl AccessLogParser {
    pub fn new(format: LogFormat) -> Result<Self, ParserError> {
        Ok(Self {
            format,
            line_pattern: Regex::new(COMBINED_PATTERN)?,
            request_pattern: Regex::new(REQUEST_PATTERN)?,
        })
    }

    pub fn format(&self) -> LogFormat {
        self.format
    }

    fn format_name(&self) -> &'static str {
        match self.format {
            LogFormat::NginxCombined => "nginx",
            LogFormat::ApacheCombined => "apache",
        }
    }

    /// Classify a single trimmed line. Line numbers are 1-indexed positions
    /// in the raw stream.
    pub fn parse_line(&self, line: &str, line_number: u64) -> LineOutcome {
        if line.is_empty() || line.starts_with('#') {
            return LineOutcome::Skip;
        }

        let caps = match self.line_pattern.captures(line) {
            Some(caps) => caps,
            None => {
                return LineOutcome::Error(format!(
                    "line does not match {} combined format",
                    self.format_name()
                ))
            }
        };

        let time_str = caps.name("time").map(|m| m.as_str()).unwrap_or_default();
        let timestamp = match DateTime::parse_from_str(time_str, TIME_FORMAT) {
            Ok(t) => t.with_timezone(&Utc),
            Err(e) => return LineOutcome::Error(format!("invalid timestamp format: {e}")),
        };

        let request = caps.name("request").map(|m| m.as_str()).unwrap_or_default();
        let mut method = "-".to_string();
        let mut path = "-".to_string();
        let mut protocol = None;

        if !request.is_empty() && request != "-" {
            match self.request_pattern.captures(request) {
                Some(req) => {
                    method = req
                        .name("method")
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_else(|| "-".to_string());
                    path = req
                        .name("path")
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_else(|| "-".to_string());
                    protocol = req.name("protocol").map(|m| m.as_str().to_string());
                }
                None => {
                    // Malformed request line: keep the whole string as path.
                    path = request.to_string();
                }
            }
        }

        let status_str = caps.name("status").map(|m| m.as_str()).unwrap_or_default();
        let status: u16 = match status_str.parse() {
            Ok(s) => s,
            Err(_) => return LineOutcome::Error(format!("invalid status code: {status_str}")),
        };

        let bytes_sent = match caps.name("bytes").map(|m| m.as_str()) {
            Some("-") | None => 0,
            Some(b) => b.parse().unwrap_or(0),
        };

        let dash_to_none = |m: Option<regex::Match<'_>>| {
            m.map(|v| v.as_str())
                .filter(|v| *v != "-")
                .map(|v| v.to_string())
        };

        LineOutcome::Event(LogEvent {
            timestamp,
            ip: caps
                .name("ip")
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
            method,
            path,
            status,
            bytes_sent,
            referer: dash_to_none(caps.name("referer")),
            user_agent: dash_to_none(caps.name("user_agent")),
            user: dash_to_none(caps.name("user")),
            protocol,
            raw_line: line.to_string(),
            line_number,
        })
    }

    /// Parse a full text blob: a fold of [`LineOutcome`]s into a
    /// [`ParseResult`]. One bad line never aborts the file.
    pub fn parse_str(&self, text: &str) -> ParseResult {
        let mut result = ParseResult::default();

        for (index, raw) in text.lines().enumerate() {
            let line_number = index as u64 + 1;
            result.total_lines += 1;
            let line = raw.trim();

            match self.parse_line(line, line_number) {
                LineOutcome::Event(event) => result.add_event(event),
                LineOutcome::Skip => result.empty_lines += 1,
                LineOutcome::Error(error) => result.add_error(ParseErrorSample {
                    line_number,
                    raw_line: line.to_string(),
                    error,
                }),
            }
        }

        result
    }

    /// Parse raw bytes, decoding UTF-8 with replacement for invalid bytes.
    pub fn parse_bytes(&self, data: &[u8]) -> ParseResult {
        self.parse_str(&String::from_utf8_lossy(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::StatusClass;
    use chrono::TimeZone;

    const SAMPLE_LINE: &str = r#"192.168.1.1 - - [21/Jan/2026:10:30:00 +0000] "GET /api/users HTTP/1.1" 200 1234 "https://example.com" "Mozilla/5.0 (Windows NT 10.0; Win64; x64)""#;

    fn parser() -> AccessLogParser {
        AccessLogParser::new(LogFormat::NginxCombined).unwrap()
    }

    #[test]
    fn test_parse_single_nginx_line() {
        let result = parser().parse_str(SAMPLE_LINE);

        assert_eq!(result.total_lines, 1);
        assert_eq!(result.parsed_lines, 1);
        assert_eq!(result.failed_lines, 0);

        let event = &result.events[0];
        assert_eq!(
            event.timestamp,
            Utc.with_ymd_and_hms(2026, 1, 21, 10, 30, 0).unwrap()
        );
        assert_eq!(event.ip, "192.168.1.1");
        assert_eq!(event.method, "GET");
        assert_eq!(event.path, "/api/users");
        assert_eq!(event.protocol.as_deref(), Some("HTTP/1.1"));
        assert_eq!(event.status, 200);
        assert_eq!(event.bytes_sent, 1234);
        assert_eq!(event.referer.as_deref(), Some("https://example.com"));
        assert_eq!(
            event.user_agent.as_deref(),
            Some("Mozilla/5.0 (Windows NT 10.0; Win64; x64)")
        );
        assert_eq!(event.user, None);
        assert_eq!(event.status_class(), StatusClass::Success);
        assert_eq!(event.raw_line, SAMPLE_LINE);
        assert_eq!(event.line_number, 1);
    }

    #[test]
    fn test_timezone_converted_to_utc() {
        let line = r#"10.0.0.1 - frank [10/Oct/2024:13:55:36 -0700] "GET / HTTP/1.0" 200 5 "-" "-""#;
        let result = parser().parse_str(line);
        let event = &result.events[0];
        assert_eq!(
            event.timestamp,
            Utc.with_ymd_and_hms(2024, 10, 10, 20, 55, 36).unwrap()
        );
        assert_eq!(event.user.as_deref(), Some("frank"));
        assert_eq!(event.referer, None);
        assert_eq!(event.user_agent, None);
    }

    #[test]
    fn test_dash_bytes_become_zero() {
        let line = r#"10.0.0.1 - - [21/Jan/2026:10:30:00 +0000] "HEAD / HTTP/1.1" 301 - "-" "curl/8.0""#;
        let result = parser().parse_str(line);
        assert_eq!(result.events[0].bytes_sent, 0);
        assert_eq!(result.events[0].status_class(), StatusClass::Redirect);
    }

    #[test]
    fn test_malformed_request_line_kept_as_path() {
        let line = r#"10.0.0.1 - - [21/Jan/2026:10:30:00 +0000] "garbage" 400 0 "-" "-""#;
        let result = parser().parse_str(line);
        let event = &result.events[0];
        assert_eq!(event.method, "-");
        assert_eq!(event.path, "garbage");
        assert_eq!(event.protocol, None);
    }

    #[test]
    fn test_request_without_protocol() {
        let line = r#"10.0.0.1 - - [21/Jan/2026:10:30:00 +0000] "GET /legacy" 200 9 "-" "-""#;
        let result = parser().parse_str(line);
        let event = &result.events[0];
        assert_eq!(event.method, "GET");
        assert_eq!(event.path, "/legacy");
        assert_eq!(event.protocol, None);
    }

    #[test]
    fn test_comments_and_blanks_counted_as_empty() {
        let text = format!("# header\n\n{SAMPLE_LINE}\n");
        let result = parser().parse_str(&text);
        assert_eq!(result.total_lines, 3);
        assert_eq!(result.empty_lines, 2);
        assert_eq!(result.parsed_lines, 1);
        // Line numbers come from the raw stream, not the surviving lines.
        assert_eq!(result.events[0].line_number, 3);
    }

    #[test]
    fn test_unparseable_line_sampled() {
        let text = format!("not a log line\n{SAMPLE_LINE}");
        let result = parser().parse_str(&text);
        assert_eq!(result.failed_lines, 1);
        assert_eq!(result.parsed_lines, 1);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].line_number, 1);
        assert_eq!(result.errors[0].raw_line, "not a log line");
    }

    #[test]
    fn test_invalid_timestamp_is_line_error() {
        let line = r#"10.0.0.1 - - [not a date] "GET / HTTP/1.1" 200 1 "-" "-""#;
        let result = parser().parse_str(line);
        assert_eq!(result.failed_lines, 1);
        assert!(result.errors[0].error.contains("invalid timestamp"));
    }

    #[test]
    fn test_overlong_status_is_line_error() {
        let line = r#"10.0.0.1 - - [21/Jan/2026:10:30:00 +0000] "GET / HTTP/1.1" 99999 1 "-" "-""#;
        let result = parser().parse_str(line);
        assert_eq!(result.failed_lines, 1);
        assert!(result.errors[0].error.contains("invalid status code"));
    }

    #[test]
    fn test_invalid_utf8_replaced() {
        let mut data = Vec::new();
        data.extend_from_slice(br#"10.0.0.1 - - [21/Jan/2026:10:30:00 +0000] "GET /caf"#);
        data.push(0xFF);
        data.extend_from_slice(br#" HTTP/1.1" 200 1 "-" "-""#);

        let result = parser().parse_bytes(&data);
        assert_eq!(result.parsed_lines, 1);
        assert!(result.events[0].path.contains('\u{FFFD}'));
    }

    #[test]
    fn test_apache_format_shares_grammar() {
        let parser = AccessLogParser::new(LogFormat::ApacheCombined).unwrap();
        let result = parser.parse_str(SAMPLE_LINE);
        assert_eq!(result.parsed_lines, 1);

        let failure = parser.parse_str("nope");
        assert!(failure.errors[0].error.contains("apache"));
    }
}
