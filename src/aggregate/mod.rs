use crate::parser::{LogEvent, StatusClass};
use crate::storage::model::AggregateRow;
use chrono::{DateTime, Timelike, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::hash::Hash;
use uuid::Uuid;

/// Number of entries kept in every top-K rollup.
pub const DEFAULT_TOP_N: usize = 10;

/// Truncate a timestamp to the top of its UTC hour.
pub fn hour_bucket(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.date_naive()
        .and_hms_opt(ts.hour(), 0, 0)
        .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
        .unwrap_or(ts)
}

/// Multiset counter with lazy top-K reads. Ties are broken by insertion
/// order, which keeps repeated aggregations stable.
#[derive(Debug, Clone, Default)]
pub struct TopCounter<K: Eq + Hash + Clone> {
    counts: HashMap<K, (u64, u64)>,
    next_seq: u64,
}

impl<K: Eq + Hash + Clone> TopCounter<K> {
    pub fn new() -> Self {
        Self {
            counts: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn add(&mut self, key: K) {
        let seq = self.next_seq;
        let entry = self.counts.entry(key).or_insert((0, seq));
        if entry.0 == 0 {
            self.next_seq += 1;
        }
        entry.0 += 1;
    }

    pub fn count(&self, key: &K) -> u64 {
        self.counts.get(key).map(|(c, _)| *c).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// The `n` most frequent keys, count descending, ties by first insertion.
    pub fn most_common(&self, n: usize) -> Vec<(K, u64)> {
        let mut entries: Vec<(&K, &(u64, u64))> = self.counts.iter().collect();
        entries.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1)));
        entries
            .into_iter()
            .take(n)
            .map(|(k, (count, _))| (k.clone(), *count))
            .collect()
    }
}

fn top_json<K: Eq + Hash + Clone>(
    counter: &TopCounter<K>,
    n: usize,
    field: &str,
    render: impl Fn(&K) -> Value,
) -> Value {
    Value::Array(
        counter
            .most_common(n)
            .iter()
            .map(|(k, count)| json!({field: render(k), "count": count}))
            .collect(),
    )
}

/// Aggregated traffic metrics for one UTC hour.
#[derive(Debug, Clone)]
pub struct HourlyBucket {
    pub hour: DateTime<Utc>,
    pub requests_count: u64,
    pub status_2xx: u64,
    pub status_3xx: u64,
    pub status_4xx: u64,
    pub status_5xx: u64,
    pub status_other: u64,
    pub total_bytes: u64,
    pub ips: TopCounter<String>,
    pub paths: TopCounter<String>,
    pub user_agents: TopCounter<String>,
    pub status_codes: TopCounter<u16>,
}

impl HourlyBucket {
    fn new(hour: DateTime<Utc>) -> Self {
        Self {
            hour,
            requests_count: 0,
            status_2xx: 0,
            status_3xx: 0,
            status_4xx: 0,
            status_5xx: 0,
            status_other: 0,
            total_bytes: 0,
            ips: TopCounter::new(),
            paths: TopCounter::new(),
            user_agents: TopCounter::new(),
            status_codes: TopCounter::new(),
        }
    }

    fn record(&mut self, event: &LogEvent) {
        self.requests_count += 1;
        self.total_bytes += event.bytes_sent;
        self.ips.add(event.ip.clone());
        self.paths.add(event.path.clone());
        self.status_codes.add(event.status);
        if let Some(ua) = &event.user_agent {
            self.user_agents.add(ua.clone());
        }

        match event.status_class() {
            StatusClass::Success => self.status_2xx += 1,
            StatusClass::Redirect => self.status_3xx += 1,
            StatusClass::ClientError => self.status_4xx += 1,
            StatusClass::ServerError => self.status_5xx += 1,
            StatusClass::Other => self.status_other += 1,
        }
    }

    pub fn unique_ips(&self) -> u64 {
        self.ips.len() as u64
    }

    pub fn unique_paths(&self) -> u64 {
        self.paths.len() as u64
    }

    pub fn to_json(&self, top_n: usize) -> Value {
        json!({
            "hour_bucket": self.hour.to_rfc3339(),
            "requests_count": self.requests_count,
            "status_2xx": self.status_2xx,
            "status_3xx": self.status_3xx,
            "status_4xx": self.status_4xx,
            "status_5xx": self.status_5xx,
            "total_bytes": self.total_bytes,
            "unique_ips": self.unique_ips(),
            "unique_paths": self.unique_paths(),
            "top_paths": top_json(&self.paths, top_n, "path", |p| json!(p)),
            "top_ips": top_json(&self.ips, top_n, "ip", |ip| json!(ip)),
            "top_user_agents": top_json(&self.user_agents, top_n, "user_agent", |ua| json!(ua)),
            "top_status_codes": top_json(&self.status_codes, top_n, "status", |s| json!(s)),
        })
    }

    /// Materialize the bucket as a persistable aggregate row.
    pub fn to_row(&self, site_id: Uuid, log_file_id: Uuid, top_n: usize) -> AggregateRow {
        AggregateRow {
            id: Uuid::new_v4(),
            site_id,
            log_file_id,
            hour_bucket: self.hour,
            requests_count: self.requests_count,
            status_2xx: self.status_2xx,
            status_3xx: self.status_3xx,
            status_4xx: self.status_4xx,
            status_5xx: self.status_5xx,
            unique_ips: self.unique_ips(),
            unique_paths: self.unique_paths(),
            total_bytes: self.total_bytes,
            top_paths: top_json(&self.paths, top_n, "path", |p| json!(p)),
            top_ips: top_json(&self.ips, top_n, "ip", |ip| json!(ip)),
            top_user_agents: top_json(&self.user_agents, top_n, "user_agent", |ua| json!(ua)),
            top_status_codes: top_json(&self.status_codes, top_n, "status", |s| json!(s)),
        }
    }
}

/// Whole-file aggregation: ordered hourly buckets plus global rollups.
#[derive(Debug, Default)]
pub struct AggregationResult {
    pub hourly_buckets: Vec<HourlyBucket>,
    pub total_requests: u64,
    pub total_bytes: u64,
    pub status_2xx: u64,
    pub status_3xx: u64,
    pub status_4xx: u64,
    pub status_5xx: u64,
    pub status_other: u64,
    pub top_paths: TopCounter<String>,
    pub top_ips: TopCounter<String>,
    pub top_user_agents: TopCounter<String>,
    pub top_referers: TopCounter<String>,
    pub methods: TopCounter<String>,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

impl AggregationResult {
    pub fn unique_ips(&self) -> u64 {
        self.top_ips.len() as u64
    }

    pub fn unique_paths(&self) -> u64 {
        self.top_paths.len() as u64
    }

    pub fn to_json(&self, top_n: usize) -> Value {
        let methods: serde_json::Map<String, Value> = self
            .methods
            .most_common(top_n)
            .into_iter()
            .map(|(m, count)| (m, json!(count)))
            .collect();

        json!({
            "summary": {
                "total_requests": self.total_requests,
                "total_bytes": self.total_bytes,
                "unique_ips": self.unique_ips(),
                "unique_paths": self.unique_paths(),
                "first_timestamp": self.first_timestamp.map(|t| t.to_rfc3339()),
                "last_timestamp": self.last_timestamp.map(|t| t.to_rfc3339()),
            },
            "status_breakdown": {
                "2xx": self.status_2xx,
                "3xx": self.status_3xx,
                "4xx": self.status_4xx,
                "5xx": self.status_5xx,
            },
            "methods": methods,
            "top_paths": top_json(&self.top_paths, top_n, "path", |p| json!(p)),
            "top_ips": top_json(&self.top_ips, top_n, "ip", |ip| json!(ip)),
            "top_user_agents": top_json(&self.top_user_agents, top_n, "user_agent", |ua| {
                json!(truncate_chars(ua, 100))
            }),
            "top_referers": top_json(&self.top_referers, top_n, "referer", |r| {
                json!(truncate_chars(r, 200))
            }),
            "hourly_data": self
                .hourly_buckets
                .iter()
                .map(|b| b.to_json(top_n))
                .collect::<Vec<_>>(),
        })
    }
}

/// Streams events into hourly buckets and global counters.
#[derive(Debug, Default)]
pub struct Aggregator {
    hourly: HashMap<DateTime<Utc>, HourlyBucket>,
    result: AggregationResult,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_event(&mut self, event: &LogEvent) {
        let hour = hour_bucket(event.timestamp);
        self.hourly
            .entry(hour)
            .or_insert_with(|| HourlyBucket::new(hour))
            .record(event);

        let result = &mut self.result;
        result.total_requests += 1;
        result.total_bytes += event.bytes_sent;
        result.top_ips.add(event.ip.clone());
        result.top_paths.add(event.path.clone());
        result.methods.add(event.method.clone());
        if let Some(ua) = &event.user_agent {
            result.top_user_agents.add(ua.clone());
        }
        if let Some(referer) = &event.referer {
            result.top_referers.add(referer.clone());
        }

        match event.status_class() {
            StatusClass::Success => result.status_2xx += 1,
            StatusClass::Redirect => result.status_3xx += 1,
            StatusClass::ClientError => result.status_4xx += 1,
            StatusClass::ServerError => result.status_5xx += 1,
            StatusClass::Other => result.status_other += 1,
        }

        if result
            .first_timestamp
            .map_or(true, |first| event.timestamp < first)
        {
            result.first_timestamp = Some(event.timestamp);
        }
        if result
            .last_timestamp
            .map_or(true, |last| event.timestamp > last)
        {
            result.last_timestamp = Some(event.timestamp);
        }
    }

    pub fn aggregate<'a>(mut self, events: impl IntoIterator<Item = &'a LogEvent>) -> AggregationResult {
        for event in events {
            self.add_event(event);
        }
        self.finish()
    }

    pub fn finish(mut self) -> AggregationResult {
        let mut buckets: Vec<HourlyBucket> = self.hourly.into_values().collect();
        buckets.sort_by_key(|b| b.hour);
        self.result.hourly_buckets = buckets;
        self.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(
        ts: DateTime<Utc>,
        ip: &str,
        path: &str,
        status: u16,
        bytes: u64,
        ua: Option<&str>,
    ) -> LogEvent {
        LogEvent {
            timestamp: ts,
            ip: ip.to_string(),
            method: "GET".to_string(),
            path: path.to_string(),
            status,
            bytes_sent: bytes,
            referer: None,
            user_agent: ua.map(|s| s.to_string()),
            user: None,
            protocol: Some("HTTP/1.1".to_string()),
            raw_line: String::new(),
            line_number: 0,
        }
    }

    #[test]
    fn test_hour_bucket_truncation() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 21, 10, 30, 59).unwrap();
        assert_eq!(
            hour_bucket(ts),
            Utc.with_ymd_and_hms(2026, 1, 21, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_single_event_single_bucket() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 21, 10, 30, 0).unwrap();
        let mut agg = Aggregator::new();
        agg.add_event(&event(ts, "192.168.1.1", "/api/users", 200, 1234, None));
        let result = agg.finish();

        assert_eq!(result.hourly_buckets.len(), 1);
        let bucket = &result.hourly_buckets[0];
        assert_eq!(
            bucket.hour,
            Utc.with_ymd_and_hms(2026, 1, 21, 10, 0, 0).unwrap()
        );
        assert_eq!(bucket.requests_count, 1);
        assert_eq!(bucket.status_2xx, 1);
        assert_eq!(bucket.unique_ips(), 1);
        assert_eq!(
            bucket.to_json(10)["top_paths"],
            serde_json::json!([{"path": "/api/users", "count": 1}])
        );
    }

    #[test]
    fn test_bucket_partition_covers_all_events() {
        let base = Utc.with_ymd_and_hms(2026, 1, 21, 10, 0, 0).unwrap();
        let mut agg = Aggregator::new();
        for i in 0..50u32 {
            let ts = base + chrono::Duration::minutes(i as i64 * 7);
            agg.add_event(&event(ts, "1.1.1.1", "/", 200, 1, None));
        }
        let result = agg.finish();

        let bucket_total: u64 = result.hourly_buckets.iter().map(|b| b.requests_count).sum();
        assert_eq!(bucket_total, result.total_requests);
        assert_eq!(bucket_total, 50);

        // Buckets come back ordered by hour.
        let hours: Vec<_> = result.hourly_buckets.iter().map(|b| b.hour).collect();
        let mut sorted = hours.clone();
        sorted.sort();
        assert_eq!(hours, sorted);
    }

    #[test]
    fn test_status_class_partition() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 21, 10, 0, 0).unwrap();
        let mut agg = Aggregator::new();
        for status in [200, 204, 301, 404, 500, 599, 100] {
            agg.add_event(&event(ts, "1.1.1.1", "/", status, 0, None));
        }
        let result = agg.finish();
        assert_eq!(result.status_2xx, 2);
        assert_eq!(result.status_3xx, 1);
        assert_eq!(result.status_4xx, 1);
        assert_eq!(result.status_5xx, 2);
        assert_eq!(result.status_other, 1);
        assert_eq!(
            result.status_2xx
                + result.status_3xx
                + result.status_4xx
                + result.status_5xx
                + result.status_other,
            result.total_requests
        );
    }

    #[test]
    fn test_double_aggregation_doubles_counters() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 21, 10, 0, 0).unwrap();
        let events: Vec<LogEvent> = (0..4)
            .map(|i| event(ts, "2.2.2.2", if i % 2 == 0 { "/a" } else { "/b" }, 200, 10, None))
            .collect();

        let once = Aggregator::new().aggregate(events.iter());
        let twice = Aggregator::new().aggregate(events.iter().chain(events.iter()));

        assert_eq!(twice.total_requests, once.total_requests * 2);
        assert_eq!(twice.total_bytes, once.total_bytes * 2);
        assert_eq!(twice.top_paths.count(&"/a".to_string()), 4);
        // Sets union-preserve: same distinct values, not doubled.
        assert_eq!(twice.unique_ips(), once.unique_ips());
        assert_eq!(twice.unique_paths(), once.unique_paths());
    }

    #[test]
    fn test_top_k_count_monotonicity() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 21, 10, 0, 0).unwrap();
        let mut agg = Aggregator::new();
        for _ in 0..3 {
            agg.add_event(&event(ts, "1.1.1.1", "/hot", 200, 0, None));
        }
        let before = agg.result.top_paths.count(&"/hot".to_string());
        for _ in 0..5 {
            agg.add_event(&event(ts, "1.1.1.1", "/other", 200, 0, None));
        }
        agg.add_event(&event(ts, "1.1.1.1", "/hot", 200, 0, None));
        let after = agg.result.top_paths.count(&"/hot".to_string());
        assert!(after >= before);
        assert_eq!(after, 4);
    }

    #[test]
    fn test_top_counter_tie_break_is_insertion_order() {
        let mut counter = TopCounter::new();
        counter.add("b".to_string());
        counter.add("a".to_string());
        counter.add("c".to_string());
        counter.add("a".to_string());

        let top = counter.most_common(3);
        assert_eq!(top[0], ("a".to_string(), 2));
        assert_eq!(top[1], ("b".to_string(), 1));
        assert_eq!(top[2], ("c".to_string(), 1));
    }

    #[test]
    fn test_per_ip_counts_are_true_counts() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 21, 10, 0, 0).unwrap();
        let mut agg = Aggregator::new();
        for _ in 0..7 {
            agg.add_event(&event(ts, "9.9.9.9", "/", 200, 0, None));
        }
        agg.add_event(&event(ts, "8.8.8.8", "/", 200, 0, None));
        let result = agg.finish();

        let bucket = &result.hourly_buckets[0];
        let top_ips = bucket.to_json(10)["top_ips"].clone();
        assert_eq!(top_ips[0]["ip"], "9.9.9.9");
        assert_eq!(top_ips[0]["count"], 7);
        assert_eq!(bucket.unique_ips(), 2);
    }

    #[test]
    fn test_summary_json_shape() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 21, 10, 0, 0).unwrap();
        let long_ua = "x".repeat(150);
        let mut e = event(ts, "1.1.1.1", "/", 200, 5, Some(long_ua.as_str()));
        e.referer = Some("https://ref.example.com".to_string());

        let result = Aggregator::new().aggregate([&e.clone(), &e]);
        let rendered = result.to_json(10);

        assert_eq!(rendered["summary"]["total_requests"], 2);
        assert_eq!(rendered["status_breakdown"]["2xx"], 2);
        assert_eq!(rendered["methods"]["GET"], 2);
        assert_eq!(
            rendered["top_user_agents"][0]["user_agent"]
                .as_str()
                .unwrap()
                .len(),
            100
        );
        assert_eq!(rendered["top_referers"][0]["count"], 2);
        assert_eq!(rendered["hourly_data"].as_array().unwrap().len(), 1);
    }
}
