//! Durable job storage (spec §4.1).

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryJobStore;
pub use sqlite::SqliteJobStore;

use crate::error::EngineError;
use crate::model::{Job, JobProgress, JobStatus, LogEntry};
use async_trait::async_trait;

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub total: u64,
    pub has_more: bool,
}

/// Durable CRUD over `Job` records (spec §4.1). Implementations must
/// serialize log/progress writes per job id (spec §5 "writers serialized per
/// jobId") so the ring-cap invariant holds under concurrent updates.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: Job) -> Result<(), EngineError>;
    async fn get(&self, id: &str) -> Result<Option<Job>, EngineError>;
    async fn exists(&self, id: &str) -> Result<bool, EngineError>;
    async fn delete(&self, id: &str) -> Result<(), EngineError>;
    async fn list(&self, filter: JobFilter) -> Result<JobPage, EngineError>;
    async fn count(&self, status: Option<JobStatus>) -> Result<u64, EngineError>;

    /// Hot path: must be cheap, expected at ≤1 Hz per job.
    async fn update_progress(&self, id: &str, progress: &JobProgress) -> Result<(), EngineError>;

    /// Atomic append with ring-cap to `LOG_CAP` (evict oldest). Must not
    /// require a read-modify-write of the whole log on every call.
    async fn append_log(&self, id: &str, entry: LogEntry) -> Result<(), EngineError>;

    async fn set_status(
        &self,
        id: &str,
        status: JobStatus,
        error: Option<crate::model::JobError>,
    ) -> Result<(), EngineError>;

    async fn set_output_file(&self, id: &str, path: std::path::PathBuf) -> Result<(), EngineError>;

    async fn get_recently_updated(&self, limit: usize) -> Result<Vec<Job>, EngineError>;

    async fn delete_old_terminal(
        &self,
        older_than: chrono::DateTime<chrono::Utc>,
    ) -> Result<u64, EngineError>;
}
