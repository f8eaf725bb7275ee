pub mod error_analysis;
pub mod fetch;
pub mod runner;
pub mod worker;

pub use fetch::{DefaultFetcherFactory, FetcherFactory};
pub use runner::run_parse_job;
pub use worker::Worker;

use crate::anomaly::AnomalyConfig;
use crate::errorlog::ErrorLogError;
use crate::fetcher::FetchError;
use crate::parser::ParserError;
use crate::security::SecurityError;
use crate::storage::{Clock, JobStore, ObjectStore, StorageError, TaskQueue};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {0} not found")]
    JobNotFound(Uuid),

    #[error("log file {0} not found")]
    LogFileNotFound(Uuid),

    #[error("site {0} not found")]
    SiteNotFound(Uuid),

    #[error("log source {0} not found")]
    SourceNotFound(Uuid),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("parser error: {0}")]
    Parser(#[from] ParserError),

    #[error("security rules error: {0}")]
    Security(#[from] SecurityError),

    #[error("error-log parser error: {0}")]
    ErrorLog(#[from] ErrorLogError),

    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("invalid task args: {0}")]
    InvalidArgs(String),

    #[error("task exceeded its time limit of {0} seconds")]
    TimeLimit(u64),
}

/// Everything a job handler needs: the four external seams plus pipeline
/// tunables. Immutable; cloning shares the underlying services.
#[derive(Clone)]
pub struct JobContext {
    pub store: Arc<dyn JobStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub clock: Arc<dyn Clock>,
    pub anomaly: AnomalyConfig,
    pub top_n: usize,
}

impl JobContext {
    pub fn new(
        store: Arc<dyn JobStore>,
        objects: Arc<dyn ObjectStore>,
        queue: Arc<dyn TaskQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            objects,
            queue,
            clock,
            anomaly: AnomalyConfig::default(),
            top_n: crate::aggregate::DEFAULT_TOP_N,
        }
    }

    pub fn with_anomaly_config(mut self, anomaly: AnomalyConfig) -> Self {
        self.anomaly = anomaly;
        self
    }
}
