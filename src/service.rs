//! Public engine entry point (spec §4.8).

use crate::bus::{ProgressBus, Subscription};
use crate::collaborators::{DubbingProvider, MediaToolkit, SourceResolver};
use crate::config::EngineConfig;
use crate::cost::{CostCalculator, CostEstimate, TimeEstimate};
use crate::error::EngineError;
use crate::executor::PipelineExecutor;
use crate::manager::JobManager;
use crate::model::{
    ChunkingStrategy, Job, JobConfig, JobStatus, OutputFormat, SourceMeta, ALLOWED_CHUNK_DURATIONS,
};
use crate::scheduler::DubScheduler;
use crate::store::{JobFilter, JobPage, JobStore};
use crate::workspace::TempWorkspace;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

const SUPPORTED_LANGUAGES: &[&str] = &[
    "en-US", "es-ES", "fr-FR", "de-DE", "pt-BR", "ja-JP", "ko-KR", "zh-CN", "hi-IN", "ar-SA",
];

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub source_ref: String,
    pub chunk_duration_seconds: u32,
    pub target_language: String,
    pub max_parallel_jobs: u32,
    pub video_quality: String,
    pub output_format: OutputFormat,
    pub use_watermark: bool,
    pub keep_intermediate_files: bool,
    pub chunking_strategy: ChunkingStrategy,
}

#[derive(Debug, Clone)]
pub struct StartResult {
    pub job_id: String,
    pub status: JobStatus,
    pub estimated_time: TimeEstimate,
    pub estimated_cost: CostEstimate,
}

#[derive(Debug, Clone)]
pub struct RetryResult {
    pub job_id: String,
    pub chunk_indices: Vec<u32>,
}

/// Orchestrates job creation, lifecycle control, and subscription over the
/// lower-level store/manager/bus/executor collaborators (spec §4.8). This is
/// the crate's only intended integration surface.
pub struct AutomationService {
    store: Arc<dyn JobStore>,
    manager: Arc<JobManager>,
    bus: Arc<ProgressBus>,
    workspace: TempWorkspace,
    resolver: Arc<dyn SourceResolver>,
    executor: Arc<PipelineExecutor>,
    config: EngineConfig,
    cancellations: Mutex<HashMap<String, CancellationToken>>,
}

impl AutomationService {
    pub fn new(
        store: Arc<dyn JobStore>,
        manager: Arc<JobManager>,
        bus: Arc<ProgressBus>,
        config: EngineConfig,
        resolver: Arc<dyn SourceResolver>,
        toolkit: Arc<dyn MediaToolkit>,
        provider: Arc<dyn DubbingProvider>,
    ) -> Self {
        let workspace = TempWorkspace::new(config.workspace_root.clone());
        let scheduler = Arc::new(DubScheduler::new(provider));
        let executor = Arc::new(PipelineExecutor::new(
            manager.clone(),
            bus.clone(),
            resolver.clone(),
            toolkit,
            scheduler,
        ));
        Self {
            store,
            manager,
            bus,
            workspace,
            resolver,
            executor,
            config,
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    /// Validates `req`, resolves source metadata, creates the job record and
    /// its workspace, then launches the executor asynchronously. Returns as
    /// soon as the job is durably `pending` — does not wait for the pipeline.
    pub async fn start(&self, req: StartRequest) -> Result<StartResult, EngineError> {
        validate_start_request(&req)?;

        let resolved = self.resolver.resolve(&req.source_ref).await?;
        let source_meta = SourceMeta {
            title: resolved.suggested_title,
            duration_seconds: resolved.duration_sec,
            resolution_label: resolved.resolution,
            codec_label: resolved.codec,
            file_size_bytes: resolved.content_length,
        };

        let config = JobConfig {
            chunk_duration_seconds: req.chunk_duration_seconds,
            target_language: req.target_language,
            max_parallel_jobs: req.max_parallel_jobs,
            video_quality: req.video_quality,
            output_format: req.output_format,
            use_watermark: req.use_watermark,
            keep_intermediate_files: req.keep_intermediate_files,
            chunking_strategy: req.chunking_strategy,
        };

        let estimated_time = CostCalculator::calculate_time(&source_meta, &config);
        let estimated_cost = CostCalculator::calculate_cost_with_rates(
            &source_meta,
            &config,
            self.config.dub_rate_per_minute,
            self.config.process_rate_per_chunk,
        );

        let job_id = uuid::Uuid::new_v4().to_string();
        let paths = self.workspace.create_job_dirs(&job_id).await?;
        let now = chrono::Utc::now();
        let job = Job {
            id: job_id.clone(),
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            source_ref: req.source_ref,
            source_meta,
            config,
            progress: crate::model::JobProgress::new(),
            paths,
            output_file: None,
            error: None,
        };
        self.store.create(job).await?;

        let ctx = CancellationToken::new();
        self.cancellations.lock().await.insert(job_id.clone(), ctx.clone());

        let executor = self.executor.clone();
        let spawned_id = job_id.clone();
        tokio::spawn(async move {
            executor.run(spawned_id, ctx).await;
        });

        info!(job_id, "job started");
        Ok(StartResult {
            job_id,
            status: JobStatus::Pending,
            estimated_time,
            estimated_cost,
        })
    }

    pub async fn get(&self, job_id: &str) -> Result<Job, EngineError> {
        self.store.get(job_id).await?.ok_or(EngineError::NotFound)
    }

    pub async fn list(&self, filter: JobFilter) -> Result<JobPage, EngineError> {
        self.store.list(filter).await
    }

    /// Signals the executor's cancellation token for `job_id`. A no-op (not
    /// an error) if the job has already reached a terminal state by the time
    /// this runs — the cancellation simply loses the race.
    pub async fn cancel(&self, job_id: &str) -> Result<(), EngineError> {
        let job = self.get(job_id).await?;
        if job.status.is_terminal() {
            return Err(EngineError::Conflict);
        }

        if let Some(ctx) = self.cancellations.lock().await.get(job_id) {
            ctx.cancel();
        }
        Ok(())
    }

    /// Re-enters the dubbing stage for the chunks that previously failed.
    /// Valid only when `job.status == failed` and `error.failed_chunk_indices`
    /// is populated; an empty `failed_chunk_indices` is itself a no-op that
    /// returns successfully with an empty `chunk_indices` (spec §4.8).
    pub async fn retry(&self, job_id: &str, chunk_indices: Option<Vec<u32>>) -> Result<RetryResult, EngineError> {
        let job = self.get(job_id).await?;
        if job.status != JobStatus::Failed {
            return Err(EngineError::Conflict);
        }
        let failed_indices = job
            .error
            .as_ref()
            .and_then(|e| e.failed_chunk_indices.clone())
            .ok_or(EngineError::Conflict)?;

        if failed_indices.is_empty() {
            return Ok(RetryResult {
                job_id: job_id.to_string(),
                chunk_indices: Vec::new(),
            });
        }

        let indices = chunk_indices.unwrap_or_else(|| failed_indices.clone());

        let ctx = CancellationToken::new();
        self.cancellations.lock().await.insert(job_id.to_string(), ctx.clone());
        self.manager.set_status(job_id, JobStatus::Dubbing, None).await?;

        let executor = self.executor.clone();
        let spawned_id = job_id.to_string();
        let spawned_indices = indices.clone();
        tokio::spawn(async move {
            executor.retry(spawned_id, spawned_indices, ctx).await;
        });

        Ok(RetryResult {
            job_id: job_id.to_string(),
            chunk_indices: indices,
        })
    }

    pub async fn subscribe(&self, job_id: &str) -> Subscription {
        self.bus.subscribe(job_id).await
    }
}

fn validate_start_request(req: &StartRequest) -> Result<(), EngineError> {
    if req.source_ref.trim().is_empty() {
        return Err(EngineError::Validation("sourceRef must not be empty".into()));
    }
    if !ALLOWED_CHUNK_DURATIONS.contains(&req.chunk_duration_seconds) {
        return Err(EngineError::Validation(format!(
            "chunkDurationSeconds must be one of {ALLOWED_CHUNK_DURATIONS:?}"
        )));
    }
    if !SUPPORTED_LANGUAGES.contains(&req.target_language.as_str()) {
        return Err(EngineError::Validation(format!(
            "targetLanguage '{}' is not supported",
            req.target_language
        )));
    }
    if !(1..=5).contains(&req.max_parallel_jobs) {
        return Err(EngineError::Validation("maxParallelJobs must be in 1..=5".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::{FakeDubbingProvider, FakeMediaToolkit, FakeSourceResolver};
    use crate::store::memory::InMemoryJobStore;

    fn default_request(source_ref: &str) -> StartRequest {
        StartRequest {
            source_ref: source_ref.to_string(),
            chunk_duration_seconds: 60,
            target_language: "en-US".to_string(),
            max_parallel_jobs: 2,
            video_quality: "1080p".to_string(),
            output_format: OutputFormat::Mp4,
            use_watermark: false,
            keep_intermediate_files: false,
            chunking_strategy: ChunkingStrategy::Fixed,
        }
    }

    fn service(tmp: &std::path::Path) -> Arc<AutomationService> {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let (manager, _handle) = JobManager::spawn(store.clone());
        let bus = ProgressBus::new();
        let mut config = EngineConfig::default();
        config.workspace_root = tmp.to_string_lossy().to_string();
        let resolver = Arc::new(FakeSourceResolver { duration_sec: 300 });
        let toolkit = Arc::new(FakeMediaToolkit);
        let provider = Arc::new(FakeDubbingProvider::new(vec![]));
        Arc::new(AutomationService::new(store, manager, bus, config, resolver, toolkit, provider))
    }

    #[tokio::test]
    async fn start_rejects_empty_source_ref() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path());
        let err = svc.start(default_request("")).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[tokio::test]
    async fn start_rejects_invalid_chunk_duration() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path());
        let mut req = default_request("https://example.com/video");
        req.chunk_duration_seconds = 45;
        let err = svc.start(req).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[tokio::test]
    async fn start_rejects_unsupported_language() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path());
        let mut req = default_request("https://example.com/video");
        req.target_language = "xx-XX".to_string();
        let err = svc.start(req).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[tokio::test]
    async fn start_returns_pending_job_with_estimates() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path());
        let result = svc.start(default_request("https://example.com/video")).await.unwrap();
        assert_eq!(result.status, JobStatus::Pending);
        assert!(result.estimated_cost.total_cost > 0.0);
        assert!(result.estimated_time.total_time > 0);

        let job = svc.get(&result.job_id).await.unwrap();
        assert_eq!(job.id, result.job_id);
    }

    #[tokio::test]
    async fn cancel_unknown_job_returns_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path());
        let err = svc.cancel("does-not-exist").await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn cancel_terminal_job_is_conflict() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path());
        let result = svc.start(default_request("https://example.com/video")).await.unwrap();
        svc.manager.set_status(&result.job_id, JobStatus::Complete, None).await.unwrap();

        let err = svc.cancel(&result.job_id).await.unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[tokio::test]
    async fn retry_on_non_failed_job_is_conflict() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path());
        let result = svc.start(default_request("https://example.com/video")).await.unwrap();
        let err = svc.retry(&result.job_id, None).await.unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[tokio::test]
    async fn retry_with_empty_failed_indices_is_a_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path());
        let result = svc.start(default_request("https://example.com/video")).await.unwrap();
        svc.manager
            .set_status(
                &result.job_id,
                JobStatus::Failed,
                Some(crate::model::JobError {
                    code: "DUB_ALL_FAILED".to_string(),
                    message: "all chunks failed".to_string(),
                    stage: crate::error::Stage::Dub,
                    recoverable: false,
                    failed_chunk_indices: Some(vec![]),
                    details: None,
                }),
            )
            .await
            .unwrap();

        let retry = svc.retry(&result.job_id, None).await.unwrap();
        assert!(retry.chunk_indices.is_empty());
    }
}
