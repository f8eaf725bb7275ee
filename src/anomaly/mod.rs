use crate::security::FindingCandidate;
use crate::storage::model::{AggregateSnapshot, Severity};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;

/// Tunables for baseline comparison. Site-level overrides deserialize from
/// the same shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyConfig {
    #[serde(default = "default_baseline_days")]
    pub baseline_days: i64,
    #[serde(default = "default_min_baseline_hours")]
    pub min_baseline_hours: usize,
    #[serde(default = "default_z_threshold")]
    pub z_threshold: f64,
    #[serde(default = "default_new_path_min_count")]
    pub new_path_min_count: u64,
}

fn default_baseline_days() -> i64 {
    7
}

fn default_min_baseline_hours() -> usize {
    24
}

fn default_z_threshold() -> f64 {
    3.0
}

fn default_new_path_min_count() -> u64 {
    20
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            baseline_days: default_baseline_days(),
            min_baseline_hours: default_min_baseline_hours(),
            z_threshold: default_z_threshold(),
            new_path_min_count: default_new_path_min_count(),
        }
    }
}

fn error_rate(status_5xx: u64, requests: u64) -> f64 {
    if requests == 0 {
        return 0.0;
    }
    status_5xx as f64 / requests as f64
}

/// Z-score of `value` against a population baseline. Undefined (`None`) for
/// fewer than two samples or zero spread.
fn zscore(value: f64, baseline: &[f64]) -> Option<f64> {
    if baseline.len() < 2 {
        return None;
    }
    let n = baseline.len() as f64;
    let mean = baseline.iter().sum::<f64>() / n;
    let variance = baseline.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let stddev = variance.sqrt();
    if stddev == 0.0 {
        return None;
    }
    Some((value - mean) / stddev)
}

fn paths_of(snapshot: &AggregateSnapshot) -> Vec<(String, u64)> {
    let Some(top_paths) = &snapshot.top_paths else {
        return Vec::new();
    };
    let Some(entries) = top_paths.as_array() else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|item| {
            let path = item.get("path")?.as_str()?.to_string();
            let count = item.get("count").and_then(|c| c.as_u64()).unwrap_or(0);
            Some((path, count))
        })
        .collect()
}

/// Compare each target hour against its trailing baseline window and emit
/// findings for traffic spikes, error-rate spikes and new-endpoint bursts.
pub fn detect_anomalies(
    baseline_aggregates: &[AggregateSnapshot],
    target_aggregates: &[AggregateSnapshot],
    config: &AnomalyConfig,
) -> Vec<FindingCandidate> {
    let mut findings = Vec::new();
    let window = Duration::days(config.baseline_days);

    for current in target_aggregates {
        let baseline: Vec<&AggregateSnapshot> = baseline_aggregates
            .iter()
            .filter(|agg| {
                agg.hour_bucket >= current.hour_bucket - window
                    && agg.hour_bucket < current.hour_bucket
            })
            .collect();
        if baseline.len() < config.min_baseline_hours {
            continue;
        }

        let baseline_requests: Vec<f64> =
            baseline.iter().map(|a| a.requests_count as f64).collect();
        let baseline_error_rates: Vec<f64> = baseline
            .iter()
            .map(|a| error_rate(a.status_5xx, a.requests_count))
            .collect();
        let baseline_unique_ips: Vec<f64> =
            baseline.iter().map(|a| a.unique_ips as f64).collect();

        let current_error_rate = error_rate(current.status_5xx, current.requests_count);

        let request_z = zscore(current.requests_count as f64, &baseline_requests);
        let error_z = zscore(current_error_rate, &baseline_error_rates);
        let ips_z = zscore(current.unique_ips as f64, &baseline_unique_ips);

        if let Some(z) = request_z.filter(|z| *z >= config.z_threshold) {
            findings.push(FindingCandidate {
                finding_type: "traffic_spike".to_string(),
                severity: Severity::Medium,
                title: "Traffic Spike Detected".to_string(),
                description: format!(
                    "Hourly request volume exceeded baseline by more than {} standard deviations.",
                    config.z_threshold
                ),
                evidence: json!([{
                    "hour_bucket": current.hour_bucket.to_rfc3339(),
                    "requests_count": current.requests_count,
                }]),
                suggested_action: Some(
                    "Investigate traffic source and rate-limit if abusive.".to_string(),
                ),
                metadata: json!({
                    "hour_bucket": current.hour_bucket.to_rfc3339(),
                    "requests_count": current.requests_count,
                    "z_score": z,
                    "unique_ips": current.unique_ips,
                    "unique_ips_z_score": ips_z,
                }),
            });
        }

        if let Some(z) = error_z.filter(|z| *z >= config.z_threshold) {
            findings.push(FindingCandidate {
                finding_type: "error_spike".to_string(),
                severity: Severity::High,
                title: "Error Rate Spike Detected".to_string(),
                description: format!(
                    "Hourly 5xx error rate exceeded baseline by more than {} standard deviations.",
                    config.z_threshold
                ),
                evidence: json!([{
                    "hour_bucket": current.hour_bucket.to_rfc3339(),
                    "error_rate": (current_error_rate * 10_000.0).round() / 10_000.0,
                    "status_5xx": current.status_5xx,
                }]),
                suggested_action: Some(
                    "Check application logs and recent deployments.".to_string(),
                ),
                metadata: json!({
                    "hour_bucket": current.hour_bucket.to_rfc3339(),
                    "error_rate": current_error_rate,
                    "z_score": z,
                }),
            });
        }

        let baseline_paths: HashSet<String> = baseline
            .iter()
            .flat_map(|agg| paths_of(agg).into_iter().map(|(path, _)| path))
            .collect();

        for (path, count) in paths_of(current) {
            if baseline_paths.contains(&path) || count < config.new_path_min_count {
                continue;
            }
            findings.push(FindingCandidate {
                finding_type: "new_endpoint_burst".to_string(),
                severity: Severity::Medium,
                title: "New Endpoint Burst Detected".to_string(),
                description: "High-traffic requests detected for a previously unseen path."
                    .to_string(),
                evidence: json!([{
                    "hour_bucket": current.hour_bucket.to_rfc3339(),
                    "path": path,
                    "count": count,
                }]),
                suggested_action: Some(
                    "Verify the endpoint and check for unauthorized exposure.".to_string(),
                ),
                metadata: json!({
                    "hour_bucket": current.hour_bucket.to_rfc3339(),
                    "path": path,
                    "count": count,
                }),
            });
        }
    }

    findings
}
