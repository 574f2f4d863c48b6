//! Per-job filesystem layout (spec §4.3).

use crate::error::EngineError;
use crate::model::JobPaths;
use std::path::{Path, PathBuf};
use tokio::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct TempWorkspace {
    root: PathBuf,
}

impl TempWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Ensures `source/ chunks/ dubbed/ output/` exist and are empty. On any
    /// failure partway through, removes whatever was created before
    /// returning (spec §4.3 "scoped" guarantee).
    pub async fn create_job_dirs(&self, job_id: &str) -> Result<JobPaths, EngineError> {
        let root = self.root.join(job_id);
        let paths = JobPaths {
            source: root.join("source"),
            chunks: root.join("chunks"),
            dubbed: root.join("dubbed"),
            output: root.join("output"),
            root: root.clone(),
        };

        if let Err(e) = self.create_scoped(&paths).await {
            let _ = tokio::fs::remove_dir_all(&root).await;
            return Err(EngineError::Storage(format!(
                "failed creating workspace for job {job_id}: {e}"
            )));
        }

        Ok(paths)
    }

    async fn create_scoped(&self, paths: &JobPaths) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&paths.source).await?;
        tokio::fs::create_dir_all(&paths.chunks).await?;
        tokio::fs::create_dir_all(&paths.dubbed).await?;
        tokio::fs::create_dir_all(&paths.output).await?;
        Ok(())
    }

    /// Immediate teardown, used on early cancel.
    pub async fn remove_job_dirs(&self, job_id: &str) {
        let root = self.root.join(job_id);
        if let Err(e) = tokio::fs::remove_dir_all(&root).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(job_id, error = %e, "failed to remove job workspace");
            }
        }
    }

    /// Schedules removal of the intermediate directories (and `output/` if
    /// not retained) after `delay`. Best-effort: failures are logged, not
    /// propagated, since nothing downstream observes this background task.
    pub fn schedule_output_cleanup(&self, paths: JobPaths, delay: Duration, keep_output: bool) {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            for dir in [&paths.source, &paths.chunks, &paths.dubbed] {
                remove_dir_logged(dir).await;
            }
            if !keep_output {
                remove_dir_logged(&paths.output).await;
            }
        });
    }
}

async fn remove_dir_logged(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!(path = %dir.display(), "cleaned up workspace directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %dir.display(), error = %e, "cleanup failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_job_dirs_creates_all_four() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = TempWorkspace::new(tmp.path());
        let paths = ws.create_job_dirs("job-1").await.unwrap();
        for dir in [&paths.source, &paths.chunks, &paths.dubbed, &paths.output] {
            assert!(dir.is_dir());
        }
    }

    #[tokio::test]
    async fn remove_job_dirs_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = TempWorkspace::new(tmp.path());
        ws.create_job_dirs("job-2").await.unwrap();
        ws.remove_job_dirs("job-2").await;
        ws.remove_job_dirs("job-2").await;
        assert!(!tmp.path().join("job-2").exists());
    }

    #[tokio::test]
    async fn scheduled_cleanup_removes_intermediates_but_keeps_output() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = TempWorkspace::new(tmp.path());
        let paths = ws.create_job_dirs("job-3").await.unwrap();
        ws.schedule_output_cleanup(paths.clone(), Duration::from_millis(10), true);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!paths.source.exists());
        assert!(!paths.chunks.exists());
        assert!(!paths.dubbed.exists());
        assert!(paths.output.exists());
    }
}
