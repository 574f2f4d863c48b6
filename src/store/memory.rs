//! In-memory `JobStore`, grounded on the `MockStore` test double used to
//! exercise the write-behind manager in the teacher's job engine. Promoted
//! here to a first-class backend since the spec treats storage as an
//! orthogonal, swappable concern (§9) and embedders/tests want a zero-setup
//! default.

use super::{JobFilter, JobPage, JobStore};
use crate::error::EngineError;
use crate::model::{Job, JobError, JobProgress, JobStatus, LogEntry};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<String, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: Job) -> Result<(), EngineError> {
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.contains_key(&job.id) {
            return Err(EngineError::Duplicate);
        }
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, EngineError> {
        Ok(self.jobs.lock().unwrap().get(id).cloned())
    }

    async fn exists(&self, id: &str) -> Result<bool, EngineError> {
        Ok(self.jobs.lock().unwrap().contains_key(id))
    }

    async fn delete(&self, id: &str) -> Result<(), EngineError> {
        self.jobs.lock().unwrap().remove(id);
        Ok(())
    }

    async fn list(&self, filter: JobFilter) -> Result<JobPage, EngineError> {
        let jobs = self.jobs.lock().unwrap();
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|j| filter.status.map(|s| s == j.status).unwrap_or(true))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matching.len() as u64;
        let limit = if filter.limit == 0 {
            matching.len()
        } else {
            filter.limit
        };
        let page: Vec<Job> = matching
            .into_iter()
            .skip(filter.offset)
            .take(limit)
            .collect();
        let has_more = (filter.offset as u64 + page.len() as u64) < total;

        Ok(JobPage {
            jobs: page,
            total,
            has_more,
        })
    }

    async fn count(&self, status: Option<JobStatus>) -> Result<u64, EngineError> {
        let jobs = self.jobs.lock().unwrap();
        Ok(jobs
            .values()
            .filter(|j| status.map(|s| s == j.status).unwrap_or(true))
            .count() as u64)
    }

    async fn update_progress(&self, id: &str, progress: &JobProgress) -> Result<(), EngineError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(id).ok_or(EngineError::NotFound)?;
        let logs = std::mem::take(&mut job.progress.logs);
        job.progress = progress.clone();
        job.progress.logs = logs;
        job.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn append_log(&self, id: &str, entry: LogEntry) -> Result<(), EngineError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(id).ok_or(EngineError::NotFound)?;
        job.progress.logs.push(entry);
        job.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn set_status(
        &self,
        id: &str,
        status: JobStatus,
        error: Option<JobError>,
    ) -> Result<(), EngineError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(id).ok_or(EngineError::NotFound)?;
        job.status = status;
        job.error = error;
        job.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn set_output_file(&self, id: &str, path: std::path::PathBuf) -> Result<(), EngineError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(id).ok_or(EngineError::NotFound)?;
        job.output_file = Some(path);
        job.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn get_recently_updated(&self, limit: usize) -> Result<Vec<Job>, EngineError> {
        let jobs = self.jobs.lock().unwrap();
        let mut all: Vec<Job> = jobs.values().cloned().collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        all.truncate(limit);
        Ok(all)
    }

    async fn delete_old_terminal(
        &self,
        older_than: chrono::DateTime<chrono::Utc>,
    ) -> Result<u64, EngineError> {
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|_, j| !(j.status.is_terminal() && j.updated_at < older_than));
        Ok((before - jobs.len()) as u64)
    }
}
