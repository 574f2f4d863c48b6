//! Bounded-concurrency chunk dubbing scheduler (spec §4.6 — "the hardest
//! subsystem").
//!
//! Grounded on the semaphore + `JoinSet` + `CancellationToken` worker-pool
//! shape used elsewhere in this codebase, narrowed to a fixed one-task-per-
//! chunk pool (no adaptive scaling — `maxParallelJobs` is a per-job config
//! value, not a runtime-tunable pool size). Retry backoff mirrors the
//! provider recovery module this crate's error classification was grounded
//! on: exponential with jitter, capped.

use crate::collaborators::{CreateDubRequest, DubbingProvider, DubbingState};
use crate::error::ProviderError;
use crate::model::{ChunkInfo, ChunkManifest, ChunkState, ChunkStatus, JobConfig, MAX_CHUNK_RETRIES};
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const POLL_MIN: std::time::Duration = std::time::Duration::from_secs(3);
const POLL_MAX: std::time::Duration = std::time::Duration::from_secs(20);
const RETRY_WAIT_CAP: std::time::Duration = std::time::Duration::from_secs(30);
const PROGRESS_COALESCE_INTERVAL: std::time::Duration = std::time::Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct DubbingResult {
    pub chunk_index: u32,
    pub output_path: Option<PathBuf>,
    pub provider_job_id: Option<String>,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SchedulerProgress {
    pub chunks: Vec<ChunkStatus>,
    pub active_jobs: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
}

pub struct DubScheduler {
    provider: Arc<dyn DubbingProvider>,
}

impl DubScheduler {
    pub fn new(provider: Arc<dyn DubbingProvider>) -> Self {
        Self { provider }
    }

    /// Runs every chunk in `manifest` (or, when `only_indices` is set, just
    /// those — the retry path) through the provider under a semaphore of
    /// size `config.max_parallel_jobs`. Returns results sorted ascending by
    /// `chunk_index` regardless of completion order.
    pub async fn run(
        &self,
        manifest: &ChunkManifest,
        config: &JobConfig,
        out_dir: &std::path::Path,
        ctx: CancellationToken,
        only_indices: Option<&[u32]>,
        progress_cb: Arc<dyn Fn(SchedulerProgress) + Send + Sync>,
    ) -> Vec<DubbingResult> {
        let targets: Vec<&ChunkInfo> = match only_indices {
            Some(indices) => manifest
                .chunks
                .iter()
                .filter(|c| indices.contains(&c.index))
                .collect(),
            None => manifest.chunks.iter().collect(),
        };

        let total = manifest.chunks.len();
        let statuses: Arc<Mutex<Vec<ChunkStatus>>> = Arc::new(Mutex::new(
            manifest.chunks.iter().map(|c| ChunkStatus::pending(c.index)).collect(),
        ));
        let last_emit = Arc::new(Mutex::new(tokio::time::Instant::now() - PROGRESS_COALESCE_INTERVAL));
        let semaphore = Arc::new(Semaphore::new(config.max_parallel_jobs.max(1) as usize));

        let mut join_set: JoinSet<DubbingResult> = JoinSet::new();
        for chunk in targets {
            let chunk = chunk.clone();
            let provider = self.provider.clone();
            let semaphore = semaphore.clone();
            let ctx = ctx.clone();
            let statuses = statuses.clone();
            let last_emit = last_emit.clone();
            let progress_cb = progress_cb.clone();
            let out_dir = out_dir.to_path_buf();
            let target_language = config.target_language.clone();
            let use_watermark = config.use_watermark;

            join_set.spawn(async move {
                run_chunk_task(
                    chunk,
                    target_language,
                    use_watermark,
                    out_dir,
                    provider,
                    semaphore,
                    ctx,
                    statuses,
                    last_emit,
                    progress_cb,
                    total,
                )
                .await
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "chunk task panicked"),
            }
        }

        results.sort_by_key(|r| r.chunk_index);
        results
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_chunk_task(
    chunk: ChunkInfo,
    target_language: String,
    use_watermark: bool,
    out_dir: PathBuf,
    provider: Arc<dyn DubbingProvider>,
    semaphore: Arc<Semaphore>,
    ctx: CancellationToken,
    statuses: Arc<Mutex<Vec<ChunkStatus>>>,
    last_emit: Arc<Mutex<tokio::time::Instant>>,
    progress_cb: Arc<dyn Fn(SchedulerProgress) + Send + Sync>,
    total: usize,
) -> DubbingResult {
    let _permit = tokio::select! {
        biased;
        _ = ctx.cancelled() => return cancelled_result(chunk.index),
        permit = semaphore.acquire_owned() => match permit {
            Ok(p) => p,
            Err(_) => return cancelled_result(chunk.index),
        },
    };

    let mut retry_count = 0u32;
    loop {
        if ctx.is_cancelled() {
            return cancelled_result(chunk.index);
        }

        set_state(&statuses, chunk.index, ChunkState::Uploading, None, retry_count).await;
        emit(&statuses, &last_emit, &progress_cb, total).await;

        let create_result = provider
            .create(CreateDubRequest {
                source_path: chunk.path.clone(),
                target_language: target_language.clone(),
                source_language: None,
                use_watermark,
                num_speakers: None,
            })
            .await;

        let provider_job_id = match create_result {
            Ok(id) => id,
            Err(e) => {
                if let Some(result) = handle_failure(
                    &statuses,
                    &last_emit,
                    &progress_cb,
                    total,
                    chunk.index,
                    &mut retry_count,
                    e,
                    &ctx,
                )
                .await
                {
                    return result;
                }
                continue;
            }
        };

        set_state(
            &statuses,
            chunk.index,
            ChunkState::Processing,
            Some(provider_job_id.clone()),
            retry_count,
        )
        .await;
        emit(&statuses, &last_emit, &progress_cb, total).await;

        let poll_result = poll_until_terminal(&provider, &provider_job_id, &ctx).await;

        match poll_result {
            Ok(()) => {}
            Err(PollOutcome::Cancelled) => return cancelled_result(chunk.index),
            Err(PollOutcome::Error(e)) => {
                if let Some(result) = handle_failure(
                    &statuses,
                    &last_emit,
                    &progress_cb,
                    total,
                    chunk.index,
                    &mut retry_count,
                    e,
                    &ctx,
                )
                .await
                {
                    return result;
                }
                continue;
            }
        }

        match provider.download(&provider_job_id, &target_language).await {
            Ok((bytes, ext)) => {
                let filename = ChunkInfo::filename_for(chunk.index, &ext);
                let dest = out_dir.join(filename);
                if let Err(e) = tokio::fs::write(&dest, &bytes).await {
                    warn!(chunk = chunk.index, error = %e, "failed writing dubbed chunk");
                    set_state(
                        &statuses,
                        chunk.index,
                        ChunkState::Failed,
                        Some(provider_job_id.clone()),
                        retry_count,
                    )
                    .await;
                    emit(&statuses, &last_emit, &progress_cb, total).await;
                    return DubbingResult {
                        chunk_index: chunk.index,
                        output_path: None,
                        provider_job_id: Some(provider_job_id),
                        success: false,
                        error: Some(e.to_string()),
                    };
                }
                set_state(
                    &statuses,
                    chunk.index,
                    ChunkState::Complete,
                    Some(provider_job_id.clone()),
                    retry_count,
                )
                .await;
                emit(&statuses, &last_emit, &progress_cb, total).await;
                return DubbingResult {
                    chunk_index: chunk.index,
                    output_path: Some(dest),
                    provider_job_id: Some(provider_job_id),
                    success: true,
                    error: None,
                };
            }
            Err(e) => {
                if let Some(result) = handle_failure(
                    &statuses,
                    &last_emit,
                    &progress_cb,
                    total,
                    chunk.index,
                    &mut retry_count,
                    e,
                    &ctx,
                )
                .await
                {
                    return result;
                }
                continue;
            }
        }
    }
}

enum PollOutcome {
    Cancelled,
    Error(ProviderError),
}

async fn poll_until_terminal(
    provider: &Arc<dyn DubbingProvider>,
    provider_job_id: &str,
    ctx: &CancellationToken,
) -> Result<(), PollOutcome> {
    let mut interval = POLL_MIN;
    loop {
        if ctx.is_cancelled() {
            return Err(PollOutcome::Cancelled);
        }

        match provider.status(provider_job_id).await {
            Ok(status) => match status.state {
                DubbingState::Dubbed => return Ok(()),
                DubbingState::Failed => {
                    let message = status.error_message.unwrap_or_else(|| "dubbing failed".into());
                    return Err(PollOutcome::Error(classify_status_failure(&message)));
                }
                DubbingState::Dubbing => {}
            },
            Err(e) => return Err(PollOutcome::Error(e)),
        }

        tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(PollOutcome::Cancelled),
            _ = tokio::time::sleep(jittered(interval)) => {}
        }
        interval = (interval * 2).min(POLL_MAX);
    }
}

/// Providers report terminal failures as free text; this is the boundary
/// where that text is classified per spec §7 (content-policy/invalid-
/// language/zero-duration are non-retriable, everything else is treated as
/// a one-shot transient failure worth retrying).
fn classify_status_failure(message: &str) -> ProviderError {
    let lower = message.to_lowercase();
    if lower.contains("content policy") || lower.contains("rejected") {
        ProviderError::ContentRejected(message.to_string())
    } else if lower.contains("language") {
        ProviderError::InvalidLanguage(message.to_string())
    } else if lower.contains("zero-duration") || lower.contains("zero duration") {
        ProviderError::ZeroDuration
    } else {
        ProviderError::Failed(message.to_string())
    }
}

/// Returns `Some(result)` when the chunk has exhausted retries or hit a
/// non-retriable error (the task should stop); `None` means the caller
/// should loop back to step 2 with a fresh attempt.
#[allow(clippy::too_many_arguments)]
async fn handle_failure(
    statuses: &Arc<Mutex<Vec<ChunkStatus>>>,
    last_emit: &Arc<Mutex<tokio::time::Instant>>,
    progress_cb: &Arc<dyn Fn(SchedulerProgress) + Send + Sync>,
    total: usize,
    chunk_index: u32,
    retry_count: &mut u32,
    error: ProviderError,
    ctx: &CancellationToken,
) -> Option<DubbingResult> {
    if ctx.is_cancelled() {
        return Some(cancelled_result(chunk_index));
    }

    if error.is_retriable() && *retry_count < MAX_CHUNK_RETRIES {
        *retry_count += 1;
        set_state(statuses, chunk_index, ChunkState::Retrying, None, *retry_count).await;
        emit(statuses, last_emit, progress_cb, total).await;

        let wait = RETRY_WAIT_CAP.min(std::time::Duration::from_secs(1u64 << (*retry_count).min(5)));
        tokio::select! {
            biased;
            _ = ctx.cancelled() => return Some(cancelled_result(chunk_index)),
            _ = tokio::time::sleep(jittered(wait)) => {}
        }
        None
    } else {
        debug!(chunk = chunk_index, error = %error, "chunk exhausted retries or non-retriable");
        set_state(statuses, chunk_index, ChunkState::Failed, None, *retry_count).await;
        emit(statuses, last_emit, progress_cb, total).await;
        Some(DubbingResult {
            chunk_index,
            output_path: None,
            provider_job_id: None,
            success: false,
            error: Some(error.to_string()),
        })
    }
}

fn cancelled_result(chunk_index: u32) -> DubbingResult {
    DubbingResult {
        chunk_index,
        output_path: None,
        provider_job_id: None,
        success: false,
        error: Some("cancelled".to_string()),
    }
}

async fn set_state(
    statuses: &Arc<Mutex<Vec<ChunkStatus>>>,
    index: u32,
    state: ChunkState,
    provider_job_id: Option<String>,
    retry_count: u32,
) {
    let mut guard = statuses.lock().await;
    if let Some(status) = guard.iter_mut().find(|s| s.index == index) {
        status.state = state;
        status.retry_count = retry_count;
        if provider_job_id.is_some() {
            status.provider_job_id = provider_job_id;
        }
        match state {
            ChunkState::Uploading if status.started_at.is_none() => {
                status.started_at = Some(chrono::Utc::now());
            }
            ChunkState::Complete | ChunkState::Failed => {
                status.completed_at = Some(chrono::Utc::now());
            }
            _ => {}
        }
    }
}

async fn emit(
    statuses: &Arc<Mutex<Vec<ChunkStatus>>>,
    last_emit: &Arc<Mutex<tokio::time::Instant>>,
    progress_cb: &Arc<dyn Fn(SchedulerProgress) + Send + Sync>,
    total: usize,
) {
    let mut last = last_emit.lock().await;
    if last.elapsed() < PROGRESS_COALESCE_INTERVAL {
        return;
    }
    *last = tokio::time::Instant::now();
    drop(last);

    let chunks = statuses.lock().await.clone();
    let completed = chunks.iter().filter(|c| c.state == ChunkState::Complete).count();
    let failed = chunks.iter().filter(|c| c.state == ChunkState::Failed).count();
    let active = chunks
        .iter()
        .filter(|c| matches!(c.state, ChunkState::Uploading | ChunkState::Processing))
        .count();
    let pending = total.saturating_sub(completed + failed + active);

    progress_cb(SchedulerProgress {
        chunks,
        active_jobs: active,
        completed,
        failed,
        pending,
    });
}

fn jittered(base: std::time::Duration) -> std::time::Duration {
    let jitter_factor = 0.1;
    let jitter = rand::rng().random_range(0.0..jitter_factor);
    let multiplier = 1.0 + jitter;
    std::time::Duration::from_secs_f64(base.as_secs_f64() * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::FakeDubbingProvider;
    use crate::model::ChunkManifest;

    fn manifest_with(indices: &[u32]) -> ChunkManifest {
        ChunkManifest {
            job_id: "job-1".into(),
            total_chunks: indices.len() as u32,
            chunk_duration_seconds: 60,
            chunks: indices
                .iter()
                .map(|&i| ChunkInfo {
                    index: i,
                    filename: ChunkInfo::filename_for(i, "mp4"),
                    start_time: (i * 60) as f64,
                    end_time: ((i + 1) * 60) as f64,
                    duration: 60.0,
                    path: PathBuf::from(ChunkInfo::filename_for(i, "mp4")),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn happy_path_returns_all_chunks_sorted_by_index() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeDubbingProvider::new(vec![]));
        let scheduler = DubScheduler::new(provider);
        let manifest = manifest_with(&[2, 0, 1]);
        let config = JobConfig::default();

        let results = scheduler
            .run(
                &manifest,
                &config,
                tmp.path(),
                CancellationToken::new(),
                None,
                Arc::new(|_| {}),
            )
            .await;

        assert_eq!(results.len(), 3);
        assert_eq!(results.iter().map(|r| r.chunk_index).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(results.iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn permanently_failing_chunk_is_reported_failed_without_blocking_others() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeDubbingProvider::new(vec![1]));
        let scheduler = DubScheduler::new(provider);
        let manifest = manifest_with(&[0, 1, 2]);
        let config = JobConfig::default();

        let results = scheduler
            .run(
                &manifest,
                &config,
                tmp.path(),
                CancellationToken::new(),
                None,
                Arc::new(|_| {}),
            )
            .await;

        let failed: Vec<_> = results.iter().filter(|r| !r.success).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].chunk_index, 1);
        assert_eq!(results.iter().filter(|r| r.success).count(), 2);
    }

    #[tokio::test]
    async fn transient_failures_recover_via_retry() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeDubbingProvider::new(vec![]).with_transient_failures(2));
        let scheduler = DubScheduler::new(provider);
        let manifest = manifest_with(&[0]);
        let config = JobConfig::default();

        let results = scheduler
            .run(
                &manifest,
                &config,
                tmp.path(),
                CancellationToken::new(),
                None,
                Arc::new(|_| {}),
            )
            .await;

        assert!(results[0].success);
    }

    #[tokio::test]
    async fn cancellation_yields_partial_results() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeDubbingProvider::new(vec![]));
        let scheduler = DubScheduler::new(provider);
        let manifest = manifest_with(&[0, 1, 2]);
        let config = JobConfig::default();
        let ctx = CancellationToken::new();
        ctx.cancel();

        let results = scheduler
            .run(&manifest, &config, tmp.path(), ctx, None, Arc::new(|_| {}))
            .await;

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| !r.success));
    }

    #[tokio::test]
    async fn only_indices_restricts_to_retry_set() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeDubbingProvider::new(vec![]));
        let scheduler = DubScheduler::new(provider);
        let manifest = manifest_with(&[0, 1, 2]);
        let config = JobConfig::default();

        let results = scheduler
            .run(
                &manifest,
                &config,
                tmp.path(),
                CancellationToken::new(),
                Some(&[1]),
                Arc::new(|_| {}),
            )
            .await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_index, 1);
    }
}
