use crate::parser::LogEvent;
use crate::storage::model::Severity;
use chrono::Duration;
use regex::{Regex, RegexBuilder};
use serde_json::{json, Value};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("regex compilation error for rule '{rule}': {source}")]
    RegexCompilation {
        rule: String,
        #[source]
        source: regex::Error,
    },
}

/// Evidence samples attached to one finding.
const MAX_EVIDENCE_SAMPLES: usize = 5;

/// A detected signal, ready to be persisted as a finding.
#[derive(Debug, Clone)]
pub struct FindingCandidate {
    pub finding_type: String,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub evidence: Value,
    pub suggested_action: Option<String>,
    pub metadata: Value,
}

impl FindingCandidate {
    pub fn to_json(&self) -> Value {
        json!({
            "finding_type": self.finding_type,
            "severity": self.severity.as_str(),
            "title": self.title,
            "description": self.description,
            "evidence": self.evidence,
            "suggested_action": self.suggested_action,
            "metadata": self.metadata,
        })
    }
}

/// How an event-level rule decides whether an event matches.
enum RuleCheck {
    /// Case-insensitive regex over the request path.
    PathPattern(Regex),
    Predicate(fn(&LogEvent) -> bool),
}

/// Event-level rule: one finding per `(rule, source ip)` group.
pub struct EventRule {
    name: &'static str,
    check: RuleCheck,
    severity: Severity,
    title: &'static str,
    description_template: &'static str,
    suggested_action: &'static str,
}

impl EventRule {
    fn pattern(
        name: &'static str,
        pattern: &str,
        severity: Severity,
        title: &'static str,
        description_template: &'static str,
        suggested_action: &'static str,
    ) -> Result<Self, SecurityError> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|source| SecurityError::RegexCompilation {
                rule: name.to_string(),
                source,
            })?;
        Ok(Self {
            name,
            check: RuleCheck::PathPattern(regex),
            severity,
            title,
            description_template,
            suggested_action,
        })
    }

    fn predicate(
        name: &'static str,
        predicate: fn(&LogEvent) -> bool,
        severity: Severity,
        title: &'static str,
        description_template: &'static str,
        suggested_action: &'static str,
    ) -> Self {
        Self {
            name,
            check: RuleCheck::Predicate(predicate),
            severity,
            title,
            description_template,
            suggested_action,
        }
    }

    fn is_match(&self, event: &LogEvent) -> bool {
        match &self.check {
            RuleCheck::PathPattern(regex) => regex.is_match(&event.path),
            RuleCheck::Predicate(predicate) => predicate(event),
        }
    }
}

/// Sliding-window rule: fires when at least `threshold` matching events from
/// one ip fall inside a window of `window_minutes`.
pub struct BurstRule {
    name: &'static str,
    status_predicate: fn(&LogEvent) -> bool,
    threshold: usize,
    window_minutes: i64,
    severity: Severity,
    title: &'static str,
    description_template: &'static str,
    suggested_action: &'static str,
}

fn default_event_rules() -> Result<Vec<EventRule>, SecurityError> {
    Ok(vec![
        // Scanning & probing
        EventRule::pattern(
            "path_traversal",
            r"\.\./|%2e%2e",
            Severity::High,
            "Path Traversal Attempt Detected",
            "Multiple requests containing ../ patterns detected from IP {ip}",
            "Block IP {ip} at firewall level. Review WAF rules for path traversal protection.",
        )?,
        EventRule::pattern(
            "env_file_access",
            r"/\.env",
            Severity::Critical,
            "Environment File Access Attempt Detected",
            "Requests to /.env detected from IP {ip}",
            "Block IP {ip} and rotate any exposed secrets if necessary.",
        )?,
        EventRule::pattern(
            "wp_admin_probe",
            r"/wp-admin|/wp-login",
            Severity::Medium,
            "WordPress Admin Probe Detected",
            "Requests to WordPress admin paths detected from IP {ip}",
            "Block IP {ip} if WordPress is not used. Tighten CMS access controls.",
        )?,
        EventRule::pattern(
            "phpmyadmin_probe",
            r"/phpmyadmin|/pma",
            Severity::Medium,
            "phpMyAdmin Probe Detected",
            "Requests to phpMyAdmin paths detected from IP {ip}",
            "Block IP {ip} and restrict database admin interfaces.",
        )?,
        EventRule::pattern(
            "cgi_bin_probe",
            r"/cgi-bin/",
            Severity::Medium,
            "CGI-BIN Probe Detected",
            "Requests to /cgi-bin/ detected from IP {ip}",
            "Block IP {ip} and remove or secure legacy CGI endpoints.",
        )?,
        // Abuse patterns
        EventRule::predicate(
            "empty_user_agent",
            |e| e.user_agent.as_deref().map_or(true, str::is_empty),
            Severity::Low,
            "Empty User Agent Detected",
            "Requests without a user-agent header detected from IP {ip}",
            "Consider blocking automated clients from IP {ip}.",
        ),
        EventRule::predicate(
            "suspicious_method",
            |e| e.method == "TRACE" || e.method == "CONNECT",
            Severity::Medium,
            "Suspicious HTTP Method Detected",
            "Requests using TRACE or CONNECT detected from IP {ip}",
            "Disable TRACE/CONNECT on the server and block IP {ip} if needed.",
        ),
    ])
}

fn default_burst_rules() -> Vec<BurstRule> {
    vec![
        BurstRule {
            name: "burst_404",
            status_predicate: |e| e.status == 404,
            threshold: 10,
            window_minutes: 10,
            severity: Severity::Medium,
            title: "Burst of 404 Responses",
            description_template: "High rate of 404 responses detected from IP {ip}",
            suggested_action: "Review the source IP {ip} for scanning or broken links.",
        },
        BurstRule {
            name: "burst_500",
            status_predicate: |e| (500..600).contains(&e.status),
            threshold: 5,
            window_minutes: 10,
            severity: Severity::High,
            title: "Burst of 5xx Responses",
            description_template: "High rate of 5xx responses detected from IP {ip}",
            suggested_action: "Investigate server errors and rate-limit IP {ip} if abusive.",
        },
    ]
}

fn build_evidence(events: &[&LogEvent]) -> Value {
    let mut ordered: Vec<&LogEvent> = events.to_vec();
    ordered.sort_by_key(|e| e.timestamp);
    Value::Array(
        ordered
            .iter()
            .take(MAX_EVIDENCE_SAMPLES)
            .map(|e| json!({"line": e.line_number, "raw": e.raw_line}))
            .collect(),
    )
}

fn build_metadata(events: &[&LogEvent], ip: &str) -> Value {
    let first_seen = events.iter().map(|e| e.timestamp).min();
    let last_seen = events.iter().map(|e| e.timestamp).max();
    json!({
        "source_ip": ip,
        "count": events.len(),
        "first_seen": first_seen.map(|t| t.to_rfc3339()),
        "last_seen": last_seen.map(|t| t.to_rfc3339()),
    })
}

fn fill_template(template: &str, ip: &str) -> String {
    template.replace("{ip}", ip)
}

fn source_ip(event: &LogEvent) -> &str {
    if event.ip.is_empty() {
        "unknown"
    } else {
        &event.ip
    }
}

/// Two-tier detector: per-event rules grouped by source ip, plus
/// sliding-window burst rules.
pub struct SecurityDetector {
    event_rules: Vec<EventRule>,
    burst_rules: Vec<BurstRule>,
}

impl SecurityDetector {
    pub fn new() -> Result<Self, SecurityError> {
        Ok(Self {
            event_rules: default_event_rules()?,
            burst_rules: default_burst_rules(),
        })
    }

    pub fn detect(&self, events: &[LogEvent]) -> Vec<FindingCandidate> {
        let mut findings = self.detect_event_rules(events);
        for rule in &self.burst_rules {
            findings.extend(self.detect_burst_rule(events, rule));
        }
        findings
    }

    fn detect_event_rules(&self, events: &[LogEvent]) -> Vec<FindingCandidate> {
        // Insertion-ordered grouping keeps finding order stable run to run.
        let mut group_index: HashMap<(usize, &str), usize> = HashMap::new();
        let mut groups: Vec<((usize, &str), Vec<&LogEvent>)> = Vec::new();

        for event in events {
            for (rule_idx, rule) in self.event_rules.iter().enumerate() {
                if !rule.is_match(event) {
                    continue;
                }
                let key = (rule_idx, source_ip(event));
                match group_index.get(&key) {
                    Some(&pos) => groups[pos].1.push(event),
                    None => {
                        group_index.insert(key, groups.len());
                        groups.push((key, vec![event]));
                    }
                }
            }
        }

        groups
            .into_iter()
            .map(|((rule_idx, ip), matched)| {
                let rule = &self.event_rules[rule_idx];
                FindingCandidate {
                    finding_type: rule.name.to_string(),
                    severity: rule.severity,
                    title: rule.title.to_string(),
                    description: fill_template(rule.description_template, ip),
                    evidence: build_evidence(&matched),
                    suggested_action: Some(fill_template(rule.suggested_action, ip)),
                    metadata: build_metadata(&matched, ip),
                }
            })
            .collect()
    }

    fn detect_burst_rule(&self, events: &[LogEvent], rule: &BurstRule) -> Vec<FindingCandidate> {
        let mut ip_index: HashMap<&str, usize> = HashMap::new();
        let mut per_ip: Vec<(&str, Vec<&LogEvent>)> = Vec::new();
        for event in events {
            if !(rule.status_predicate)(event) {
                continue;
            }
            let ip = source_ip(event);
            match ip_index.get(ip) {
                Some(&pos) => per_ip[pos].1.push(event),
                None => {
                    ip_index.insert(ip, per_ip.len());
                    per_ip.push((ip, vec![event]));
                }
            }
        }

        let window = Duration::minutes(rule.window_minutes);
        let mut findings = Vec::new();

        for (ip, mut matched) in per_ip {
            matched.sort_by_key(|e| e.timestamp);

            // Two-pointer sweep for the largest window holding >= threshold
            // events.
            let mut start = 0;
            let mut best: Option<(usize, usize)> = None;
            for end in 0..matched.len() {
                while matched[end].timestamp - matched[start].timestamp > window {
                    start += 1;
                }
                let len = end - start + 1;
                if len >= rule.threshold && best.map_or(true, |(s, e)| len > e - s + 1) {
                    best = Some((start, end));
                }
            }

            if let Some((s, e)) = best {
                let window_events = &matched[s..=e];
                findings.push(FindingCandidate {
                    finding_type: rule.name.to_string(),
                    severity: rule.severity,
                    title: rule.title.to_string(),
                    description: fill_template(rule.description_template, ip),
                    evidence: build_evidence(window_events),
                    suggested_action: Some(fill_template(rule.suggested_action, ip)),
                    metadata: build_metadata(window_events, ip),
                });
            }
        }

        findings
    }
}
