//! Write-behind wrapper around a [`JobStore`] (spec §4.1 "updateProgress must
//! be cheap").
//!
//! Grounded on the "Disk Guardian" pattern: callers fire progress/log updates
//! into an `mpsc` channel and return immediately; a background task batches
//! them and flushes on a timer or when the buffer fills, so a burst of
//! per-chunk progress ticks from the scheduler never serializes on SQLite.
//! Unlike the per-chunk batch this was grounded on, progress updates here
//! coalesce to last-write-wins per job (only the latest progress matters),
//! while log appends are flushed in order so the ring-cap stays correct.

use crate::error::EngineError;
use crate::model::{JobError, JobProgress, JobStatus, LogEntry};
use crate::store::JobStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub flush_interval: std::time::Duration,
    pub channel_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            flush_interval: std::time::Duration::from_millis(500),
            channel_capacity: 10_000,
        }
    }
}

enum Update {
    Progress { job_id: String, progress: JobProgress },
    Log { job_id: String, entry: LogEntry },
}

/// Fire-and-forget façade over a [`JobStore`] for the hot progress/log path.
/// Status transitions and reads go straight through to the store since they
/// are rare and callers need to observe their result immediately.
pub struct JobManager {
    store: Arc<dyn JobStore>,
    update_tx: mpsc::Sender<Update>,
    shutdown_tx: RwLock<Option<oneshot::Sender<()>>>,
}

impl JobManager {
    pub fn spawn(store: Arc<dyn JobStore>) -> (Arc<Self>, JoinHandle<()>) {
        Self::spawn_with_config(store, ManagerConfig::default())
    }

    pub fn spawn_with_config(
        store: Arc<dyn JobStore>,
        config: ManagerConfig,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (update_tx, update_rx) = mpsc::channel(config.channel_capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let guardian_store = store.clone();
        let handle = tokio::spawn(async move {
            run_persistence_loop(guardian_store, update_rx, shutdown_rx, config).await;
        });

        let manager = Arc::new(Self {
            store,
            update_tx,
            shutdown_tx: RwLock::new(Some(shutdown_tx)),
        });

        (manager, handle)
    }

    /// Buffers a progress write; returns once the update is enqueued, not
    /// once it is durable. Errors only if the guardian task has stopped.
    pub async fn update_progress(&self, job_id: &str, progress: JobProgress) -> Result<(), EngineError> {
        self.update_tx
            .send(Update::Progress {
                job_id: job_id.to_string(),
                progress,
            })
            .await
            .map_err(|_| EngineError::Storage("write-behind guardian has stopped".into()))
    }

    pub async fn append_log(&self, job_id: &str, entry: LogEntry) -> Result<(), EngineError> {
        self.update_tx
            .send(Update::Log {
                job_id: job_id.to_string(),
                entry,
            })
            .await
            .map_err(|_| EngineError::Storage("write-behind guardian has stopped".into()))
    }

    /// Status transitions bypass the buffer: callers (the executor's state
    /// machine) need to know immediately whether the transition was accepted.
    pub async fn set_status(
        &self,
        job_id: &str,
        status: JobStatus,
        error: Option<JobError>,
    ) -> Result<(), EngineError> {
        self.store.set_status(job_id, status, error).await
    }

    pub async fn set_output_file(&self, job_id: &str, path: std::path::PathBuf) -> Result<(), EngineError> {
        self.store.set_output_file(job_id, path).await
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Signals the guardian to drain and flush every buffered update, then
    /// stop. Callers should await the `JoinHandle` returned by `spawn` to
    /// know the flush has completed.
    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.write().await.take() {
            let _ = tx.send(());
            info!("job manager shutdown signal sent");
        }
    }
}

async fn run_persistence_loop(
    store: Arc<dyn JobStore>,
    mut update_rx: mpsc::Receiver<Update>,
    mut shutdown_rx: oneshot::Receiver<()>,
    config: ManagerConfig,
) {
    let mut pending_progress: HashMap<String, JobProgress> = HashMap::new();
    let mut pending_logs: Vec<(String, LogEntry)> = Vec::new();
    let mut flush_timer = tokio::time::interval(config.flush_interval);
    flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            Some(update) = update_rx.recv() => {
                match update {
                    Update::Progress { job_id, progress } => {
                        pending_progress.insert(job_id, progress);
                    }
                    Update::Log { job_id, entry } => {
                        pending_logs.push((job_id, entry));
                    }
                }
            }
            _ = flush_timer.tick() => {
                flush(&store, &mut pending_progress, &mut pending_logs).await;
            }
            _ = &mut shutdown_rx => {
                debug!(pending = pending_progress.len() + pending_logs.len(), "guardian draining before shutdown");
                while let Ok(update) = update_rx.try_recv() {
                    match update {
                        Update::Progress { job_id, progress } => {
                            pending_progress.insert(job_id, progress);
                        }
                        Update::Log { job_id, entry } => {
                            pending_logs.push((job_id, entry));
                        }
                    }
                }
                flush(&store, &mut pending_progress, &mut pending_logs).await;
                info!("guardian stopped gracefully");
                break;
            }
        }
    }
}

async fn flush(
    store: &Arc<dyn JobStore>,
    pending_progress: &mut HashMap<String, JobProgress>,
    pending_logs: &mut Vec<(String, LogEntry)>,
) {
    for (job_id, entry) in pending_logs.drain(..) {
        if let Err(e) = store.append_log(&job_id, entry).await {
            error!(job_id, error = %e, "failed to flush log entry");
        }
    }
    for (job_id, progress) in pending_progress.drain() {
        if let Err(e) = store.update_progress(&job_id, &progress).await {
            error!(job_id, error = %e, "failed to flush progress update");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChunkingStrategy, JobConfig, JobPaths, OutputFormat, SourceMeta};
    use crate::store::memory::InMemoryJobStore;
    use crate::model::Job;

    fn sample_job(id: &str) -> Job {
        let now = chrono::Utc::now();
        Job {
            id: id.to_string(),
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            source_ref: "src".into(),
            source_meta: SourceMeta {
                title: "t".into(),
                duration_seconds: 60,
                resolution_label: "1080p".into(),
                codec_label: "h264".into(),
                file_size_bytes: None,
            },
            config: JobConfig::default(),
            progress: JobProgress::new(),
            paths: JobPaths {
                root: "/tmp/x".into(),
                source: "/tmp/x/source".into(),
                chunks: "/tmp/x/chunks".into(),
                dubbed: "/tmp/x/dubbed".into(),
                output: "/tmp/x/output".into(),
            },
            output_file: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn progress_update_is_flushed_and_visible_after_shutdown() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        store.create(sample_job("job-1")).await.unwrap();

        let (manager, handle) = JobManager::spawn_with_config(
            store.clone(),
            ManagerConfig {
                flush_interval: std::time::Duration::from_secs(10),
                channel_capacity: 16,
            },
        );

        let mut progress = JobProgress::new();
        progress.overall_percent = 42;
        manager.update_progress("job-1", progress).await.unwrap();

        manager.shutdown().await;
        handle.await.unwrap();

        let job = store.get("job-1").await.unwrap().unwrap();
        assert_eq!(job.progress.overall_percent, 42);
    }

    #[tokio::test]
    async fn coalesces_multiple_progress_updates_to_last_write() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        store.create(sample_job("job-1")).await.unwrap();

        let (manager, handle) = JobManager::spawn_with_config(
            store.clone(),
            ManagerConfig {
                flush_interval: std::time::Duration::from_secs(10),
                channel_capacity: 16,
            },
        );

        for pct in [10, 20, 30] {
            let mut progress = JobProgress::new();
            progress.overall_percent = pct;
            manager.update_progress("job-1", progress).await.unwrap();
        }

        manager.shutdown().await;
        handle.await.unwrap();

        let job = store.get("job-1").await.unwrap().unwrap();
        assert_eq!(job.progress.overall_percent, 30);
    }
}
