use crate::fetcher::{apply_gzip, basename, FetchError, FetchedFile, Fetcher};
use crate::storage::Clock;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Connection settings for an S3/GCS-style source. Credentials and endpoint
/// live in the same map but are consumed by the [`BucketClient`]
/// implementation, not here.
#[derive(Debug, Clone, Deserialize)]
pub struct BucketConfig {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    /// Only fetch objects modified within the last N hours.
    #[serde(default)]
    pub hours_ago: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct RemoteObject {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ObjectPage {
    pub objects: Vec<RemoteObject>,
    pub next_token: Option<String>,
}

/// Paginated listing + download against a remote bucket. The concrete
/// client (AWS, GCS, MinIO, ...) is an external collaborator.
#[async_trait]
pub trait BucketClient: Send {
    async fn list_page(
        &mut self,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<ObjectPage, FetchError>;
    async fn get_object(&mut self, key: &str) -> Result<Vec<u8>, FetchError>;
}

#[async_trait]
impl BucketClient for Box<dyn BucketClient> {
    async fn list_page(
        &mut self,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<ObjectPage, FetchError> {
        (**self).list_page(prefix, continuation).await
    }

    async fn get_object(&mut self, key: &str) -> Result<Vec<u8>, FetchError> {
        (**self).get_object(key).await
    }
}

/// Pulls recent objects under a prefix, skipping directory markers and
/// unpacking gzip.
pub struct ObjectStoreFetcher<C: BucketClient> {
    config: BucketConfig,
    client: C,
    clock: Arc<dyn Clock>,
}

impl<C: BucketClient> ObjectStoreFetcher<C> {
    pub fn new(config: BucketConfig, client: C, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            client,
            clock,
        }
    }

    pub fn from_connection_config(
        config: &BTreeMap<String, Value>,
        client: C,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, FetchError> {
        let value = Value::Object(config.clone().into_iter().collect());
        let config: BucketConfig = serde_json::from_value(value)
            .map_err(|e| FetchError::Config(format!("invalid bucket config: {e}")))?;
        Ok(Self::new(config, client, clock))
    }
}

#[async_trait]
impl<C: BucketClient> Fetcher for ObjectStoreFetcher<C> {
    async fn test_connection(&mut self) -> (bool, String) {
        match self.client.list_page(&self.config.prefix, None).await {
            Ok(_) => (
                true,
                format!("Successfully connected to bucket '{}'", self.config.bucket),
            ),
            Err(e) => (false, format!("Bucket access failed: {e}")),
        }
    }

    async fn fetch(&mut self) -> Result<Vec<FetchedFile>, FetchError> {
        let cutoff = self
            .config
            .hours_ago
            .map(|hours| self.clock.now() - Duration::hours(hours));

        let mut results = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let page = self
                .client
                .list_page(&self.config.prefix, continuation.as_deref())
                .await?;

            for object in &page.objects {
                // Directory markers carry no data.
                if object.key.ends_with('/') {
                    continue;
                }
                if let Some(cutoff) = cutoff {
                    if object.last_modified < cutoff {
                        continue;
                    }
                }

                let bytes = match self.client.get_object(&object.key).await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(key = %object.key, error = %e, "failed to fetch object, skipping");
                        continue;
                    }
                };

                let (name, bytes) = apply_gzip(basename(&object.key), bytes);
                results.push(FetchedFile {
                    name,
                    size: bytes.len() as u64,
                    bytes,
                });
            }

            match page.next_token {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }

        Ok(results)
    }

    async fn cleanup(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::ManualClock;
    use chrono::TimeZone;
    use std::collections::HashMap;

    struct FakeBucket {
        objects: Vec<RemoteObject>,
        contents: HashMap<String, Vec<u8>>,
        page_size: usize,
        broken_keys: Vec<String>,
        list_calls: u32,
    }

    impl FakeBucket {
        fn new(page_size: usize) -> Self {
            Self {
                objects: Vec::new(),
                contents: HashMap::new(),
                page_size,
                broken_keys: Vec::new(),
                list_calls: 0,
            }
        }

        fn with_object(
            mut self,
            key: &str,
            bytes: &[u8],
            last_modified: DateTime<Utc>,
        ) -> Self {
            self.objects.push(RemoteObject {
                key: key.to_string(),
                size: bytes.len() as u64,
                last_modified,
            });
            self.contents.insert(key.to_string(), bytes.to_vec());
            self
        }
    }

    #[async_trait]
    impl BucketClient for FakeBucket {
        async fn list_page(
            &mut self,
            prefix: &str,
            continuation: Option<&str>,
        ) -> Result<ObjectPage, FetchError> {
            self.list_calls += 1;
            let matching: Vec<RemoteObject> = self
                .objects
                .iter()
                .filter(|o| o.key.starts_with(prefix))
                .cloned()
                .collect();
            let offset: usize = continuation
                .map(|t| t.parse().unwrap_or(0))
                .unwrap_or(0);
            let page: Vec<RemoteObject> = matching
                .iter()
                .skip(offset)
                .take(self.page_size)
                .cloned()
                .collect();
            let next = offset + page.len();
            Ok(ObjectPage {
                objects: page,
                next_token: (next < matching.len()).then(|| next.to_string()),
            })
        }

        async fn get_object(&mut self, key: &str) -> Result<Vec<u8>, FetchError> {
            if self.broken_keys.iter().any(|k| k == key) {
                return Err(FetchError::Transport("access denied".to_string()));
            }
            self.contents
                .get(key)
                .cloned()
                .ok_or_else(|| FetchError::NotFound(key.to_string()))
        }
    }

    fn config(prefix: &str, hours_ago: Option<i64>) -> BucketConfig {
        BucketConfig {
            bucket: "my-logs".to_string(),
            prefix: prefix.to_string(),
            hours_ago,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 21, 12, 0, 0).unwrap()
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(now()))
    }

    #[tokio::test]
    async fn test_prefix_filter_and_pagination() {
        let bucket = FakeBucket::new(2)
            .with_object("nginx/a.log", b"a", now())
            .with_object("nginx/b.log", b"b", now())
            .with_object("nginx/c.log", b"c", now())
            .with_object("apache/d.log", b"d", now());

        let mut fetcher = ObjectStoreFetcher::new(config("nginx/", None), bucket, clock());
        let files = fetcher.fetch().await.unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a.log", "b.log", "c.log"]);
        // Three objects with page size two means two pages.
        assert!(fetcher.client.list_calls >= 2);
    }

    #[tokio::test]
    async fn test_cutoff_excludes_old_objects() {
        let bucket = FakeBucket::new(10)
            .with_object("logs/fresh.log", b"fresh", now() - Duration::hours(2))
            .with_object("logs/stale.log", b"stale", now() - Duration::hours(48));

        let mut fetcher = ObjectStoreFetcher::new(config("logs/", Some(24)), bucket, clock());
        let files = fetcher.fetch().await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "fresh.log");
    }

    #[tokio::test]
    async fn test_directory_markers_skipped() {
        let bucket = FakeBucket::new(10)
            .with_object("logs/", b"", now())
            .with_object("logs/real.log", b"data", now());

        let mut fetcher = ObjectStoreFetcher::new(config("logs/", None), bucket, clock());
        let files = fetcher.fetch().await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "real.log");
    }

    #[tokio::test]
    async fn test_unreadable_object_skipped() {
        let mut bucket = FakeBucket::new(10)
            .with_object("logs/ok.log", b"ok", now())
            .with_object("logs/broken.log", b"x", now());
        bucket.broken_keys.push("logs/broken.log".to_string());

        let mut fetcher = ObjectStoreFetcher::new(config("logs/", None), bucket, clock());
        let files = fetcher.fetch().await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "ok.log");
    }

    #[tokio::test]
    async fn test_gzip_applied_per_object() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"rotated content").unwrap();
        let compressed = encoder.finish().unwrap();

        let bucket = FakeBucket::new(10).with_object("logs/old.log.gz", &compressed, now());
        let mut fetcher = ObjectStoreFetcher::new(config("logs/", None), bucket, clock());
        let files = fetcher.fetch().await.unwrap();
        assert_eq!(files[0].name, "old.log");
        assert_eq!(files[0].bytes, b"rotated content");
    }

    #[tokio::test]
    async fn test_test_connection_reports_bucket() {
        let bucket = FakeBucket::new(10);
        let mut fetcher = ObjectStoreFetcher::new(config("", None), bucket, clock());
        let (ok, message) = fetcher.test_connection().await;
        assert!(ok);
        assert!(message.contains("my-logs"));
    }
}
