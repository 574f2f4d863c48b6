//! Five-stage pipeline state machine (spec §4.7).

use crate::bus::{BusEvent, PipelineProgress, ProgressBus};
use crate::chunk_planner::{ChunkPlanner, ChunkPlanProgress};
use crate::collaborators::{FetchProgress, MediaToolkit, SourceResolver};
use crate::error::{EngineError, Stage};
use crate::manager::JobManager;
use crate::model::{
    ChunkManifest, Job, JobError, JobStatus, LogEntry, LogLevel, PipelineStage,
};
use crate::scheduler::{DubScheduler, SchedulerProgress};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct PipelineExecutor {
    manager: Arc<JobManager>,
    bus: Arc<ProgressBus>,
    resolver: Arc<dyn SourceResolver>,
    toolkit: Arc<dyn MediaToolkit>,
    scheduler: Arc<DubScheduler>,
}

impl PipelineExecutor {
    pub fn new(
        manager: Arc<JobManager>,
        bus: Arc<ProgressBus>,
        resolver: Arc<dyn SourceResolver>,
        toolkit: Arc<dyn MediaToolkit>,
        scheduler: Arc<DubScheduler>,
    ) -> Self {
        Self {
            manager,
            bus,
            resolver,
            toolkit,
            scheduler,
        }
    }

    /// Runs a job from `pending` through to a terminal state. Spawned by
    /// `AutomationService::start`; the caller does not await completion.
    pub async fn run(&self, job_id: String, ctx: CancellationToken) {
        let started = tokio::time::Instant::now();
        match self.run_stages(&job_id, &ctx, started).await {
            Ok(()) => {}
            Err(StageOutcome::Cancelled { stage }) => {
                self.finish_cancelled(&job_id, stage).await;
            }
            Err(StageOutcome::Failed { stage, error }) => {
                self.finish_failed(&job_id, stage, error).await;
            }
        }
    }

    /// Re-enters the `dubbing` stage for a failed job (spec §4.7 "Retry").
    pub async fn retry(&self, job_id: String, chunk_indices: Vec<u32>, ctx: CancellationToken) {
        let started = tokio::time::Instant::now();
        match self.run_from_dub(&job_id, &ctx, started, Some(chunk_indices)).await {
            Ok(()) => {}
            Err(StageOutcome::Cancelled { stage }) => self.finish_cancelled(&job_id, stage).await,
            Err(StageOutcome::Failed { stage, error }) => self.finish_failed(&job_id, stage, error).await,
        }
    }

    async fn run_stages(
        &self,
        job_id: &str,
        ctx: &CancellationToken,
        started: tokio::time::Instant,
    ) -> Result<(), StageOutcome> {
        check_cancelled(ctx, Stage::Download)?;
        let job = self.load_job(job_id).await?;

        self.transition(job_id, JobStatus::Downloading, PipelineStage::Download, 5).await?;
        self.download_stage(job_id, &job, ctx).await?;

        check_cancelled(ctx, Stage::Chunk)?;
        self.transition(job_id, JobStatus::Chunking, PipelineStage::Chunk, 20).await?;
        let manifest = self.chunk_stage(job_id, &job, ctx).await?;

        check_cancelled(ctx, Stage::Dub)?;
        self.transition(job_id, JobStatus::Dubbing, PipelineStage::Dub, 25).await?;
        let dub_results = self.dub_stage(job_id, &job, &manifest, ctx, None).await?;

        self.merge_and_finalize(job_id, &job, &manifest, &dub_results, ctx, started).await
    }

    async fn run_from_dub(
        &self,
        job_id: &str,
        ctx: &CancellationToken,
        started: tokio::time::Instant,
        only_indices: Option<Vec<u32>>,
    ) -> Result<(), StageOutcome> {
        let job = self.load_job(job_id).await?;
        check_cancelled(ctx, Stage::Dub)?;
        self.transition(job_id, JobStatus::Dubbing, PipelineStage::Dub, 25).await?;

        let manifest = self.rebuild_manifest(&job)?;
        let retried = self
            .dub_stage(job_id, &job, &manifest, ctx, only_indices.as_deref())
            .await?;
        let dub_results = self.overlay_dub_results(&job, &manifest, retried, only_indices.as_deref());
        self.merge_and_finalize(job_id, &job, &manifest, &dub_results, ctx, started).await
    }

    /// Builds the full per-chunk result set for a retry: chunks named in
    /// `only_indices` take the freshly retried result, every other chunk's
    /// result is reconstructed from the audio file its earlier successful
    /// attempt already wrote to `paths.dubbed` (spec §4.7 "overlays
    /// successful results on existing chunk outputs").
    fn overlay_dub_results(
        &self,
        job: &Job,
        manifest: &ChunkManifest,
        retried: Vec<crate::scheduler::DubbingResult>,
        only_indices: Option<&[u32]>,
    ) -> Vec<crate::scheduler::DubbingResult> {
        let retried_indices: std::collections::HashSet<u32> =
            only_indices.map(|i| i.iter().copied().collect()).unwrap_or_default();

        manifest
            .chunks
            .iter()
            .map(|chunk| {
                if retried_indices.contains(&chunk.index) {
                    retried
                        .iter()
                        .find(|r| r.chunk_index == chunk.index)
                        .cloned()
                        .unwrap_or_else(|| crate::scheduler::DubbingResult {
                            chunk_index: chunk.index,
                            output_path: None,
                            provider_job_id: None,
                            success: false,
                            error: Some("missing retry result".to_string()),
                        })
                } else {
                    match find_dubbed_file(&job.paths.dubbed, chunk.index) {
                        Some(path) => crate::scheduler::DubbingResult {
                            chunk_index: chunk.index,
                            output_path: Some(path),
                            provider_job_id: None,
                            success: true,
                            error: None,
                        },
                        None => crate::scheduler::DubbingResult {
                            chunk_index: chunk.index,
                            output_path: None,
                            provider_job_id: None,
                            success: false,
                            error: Some("no prior dubbed output on disk".to_string()),
                        },
                    }
                }
            })
            .collect()
    }

    async fn merge_and_finalize(
        &self,
        job_id: &str,
        job: &Job,
        manifest: &ChunkManifest,
        dub_results: &[crate::scheduler::DubbingResult],
        ctx: &CancellationToken,
        started: tokio::time::Instant,
    ) -> Result<(), StageOutcome> {
        check_cancelled(ctx, Stage::Merge)?;
        self.transition(job_id, JobStatus::Merging, PipelineStage::Merge, 95).await?;
        let output_path = self.merge_stage(job_id, job, manifest, dub_results, ctx).await?;

        check_cancelled(ctx, Stage::Finalize)?;
        self.transition(job_id, JobStatus::Finalizing, PipelineStage::Finalize, 98).await?;
        self.finalize_stage(job_id, job, output_path, started).await
    }

    async fn load_job(&self, job_id: &str) -> Result<Job, StageOutcome> {
        match self.manager.store().get(job_id).await {
            Ok(Some(job)) => Ok(job),
            Ok(None) => Err(failed(Stage::Download, EngineError::NotFound)),
            Err(e) => Err(failed(Stage::Download, e)),
        }
    }

    fn rebuild_manifest(&self, job: &Job) -> Result<ChunkManifest, StageOutcome> {
        let chunks_dir = &job.paths.chunks;
        let mut entries = std::fs::read_dir(chunks_dir)
            .map_err(|e| failed(Stage::Dub, EngineError::Storage(e.to_string())))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect::<Vec<_>>();
        entries.sort();

        let chunk_duration = job.config.chunk_duration_seconds;
        let chunks = entries
            .into_iter()
            .enumerate()
            .map(|(i, path)| crate::model::ChunkInfo {
                index: i as u32,
                filename: path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default(),
                start_time: (i as u32 * chunk_duration) as f64,
                end_time: ((i as u32 + 1) * chunk_duration) as f64,
                duration: chunk_duration as f64,
                path,
            })
            .collect::<Vec<_>>();

        Ok(ChunkManifest {
            job_id: job.id.clone(),
            total_chunks: chunks.len() as u32,
            chunk_duration_seconds: chunk_duration,
            chunks,
        })
    }

    async fn transition(
        &self,
        job_id: &str,
        status: JobStatus,
        stage: PipelineStage,
        percent: u8,
    ) -> Result<(), StageOutcome> {
        let error_stage = to_error_stage(stage);
        self.manager
            .set_status(job_id, status, None)
            .await
            .map_err(|e| failed(error_stage, e))?;

        let mut progress = self
            .manager
            .store()
            .get(job_id)
            .await
            .map_err(|e| failed(error_stage, e))?
            .map(|j| j.progress)
            .unwrap_or_else(crate::model::JobProgress::new);
        progress.stage = stage;
        progress.overall_percent = percent;

        self.manager
            .update_progress(job_id, progress)
            .await
            .map_err(|e| failed(error_stage, e))?;

        self.bus
            .publish(
                job_id,
                BusEvent::Progress(PipelineProgress {
                    stage,
                    overall_percent: percent,
                    chunks: None,
                }),
            )
            .await;
        Ok(())
    }

    async fn log(&self, job_id: &str, stage: Stage, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry::new(level, stage, message);
        let _ = self.manager.append_log(job_id, entry.clone()).await;
        self.bus.publish(job_id, BusEvent::Log(entry)).await;
    }

    async fn download_stage(
        &self,
        job_id: &str,
        job: &Job,
        ctx: &CancellationToken,
    ) -> Result<(), StageOutcome> {
        let resolved = self
            .resolver
            .resolve(&job.source_ref)
            .await
            .map_err(|e| failed(Stage::Download, e))?;

        check_cancelled(ctx, Stage::Download)?;

        let dest = job.paths.source.join("source");
        let progress_cb = |_p: FetchProgress| {};

        self.toolkit
            .fetch(&resolved.download_url, &dest, &progress_cb)
            .await
            .map_err(|e| failed(Stage::Download, e))?;

        check_cancelled(ctx, Stage::Download)?;
        self.log(job_id, Stage::Download, LogLevel::Info, "source downloaded").await;
        Ok(())
    }

    async fn chunk_stage(
        &self,
        job_id: &str,
        job: &Job,
        ctx: &CancellationToken,
    ) -> Result<ChunkManifest, StageOutcome> {
        let planner = ChunkPlanner::new(self.toolkit.clone());
        let progress_cb = |_p: ChunkPlanProgress| {};

        let manifest = planner
            .plan(
                job_id,
                &job.paths.source.join("source"),
                &job.paths.chunks,
                job.config.chunk_duration_seconds,
                job.config.chunking_strategy,
                &progress_cb,
            )
            .await
            .map_err(|e| failed(Stage::Chunk, e))?;

        check_cancelled(ctx, Stage::Chunk)?;
        self.log(
            job_id,
            Stage::Chunk,
            LogLevel::Info,
            format!("planned {} chunks", manifest.total_chunks),
        )
        .await;
        Ok(manifest)
    }

    async fn dub_stage(
        &self,
        job_id: &str,
        job: &Job,
        manifest: &ChunkManifest,
        ctx: &CancellationToken,
        only_indices: Option<&[u32]>,
    ) -> Result<Vec<crate::scheduler::DubbingResult>, StageOutcome> {
        let job_id_owned = job_id.to_string();
        let bus = self.bus.clone();
        let progress_cb: Arc<dyn Fn(SchedulerProgress) + Send + Sync> =
            Arc::new(move |snapshot: SchedulerProgress| {
                let bus = bus.clone();
                let job_id = job_id_owned.clone();
                tokio::spawn(async move {
                    bus.publish(
                        &job_id,
                        BusEvent::Progress(PipelineProgress {
                            stage: PipelineStage::Dub,
                            overall_percent: dub_percent(&snapshot),
                            chunks: Some(snapshot.chunks),
                        }),
                    )
                    .await;
                });
            });

        let results = self
            .scheduler
            .run(manifest, &job.config, &job.paths.dubbed, ctx.clone(), only_indices, progress_cb)
            .await;

        if ctx.is_cancelled() {
            return Err(StageOutcome::Cancelled { stage: Stage::Dub });
        }

        let failed_indices: Vec<u32> = results.iter().filter(|r| !r.success).map(|r| r.chunk_index).collect();
        if !failed_indices.is_empty() {
            if failed_indices.len() == results.len() {
                return Err(failed(Stage::Dub, EngineError::DubAllFailed));
            }
            return Err(failed(Stage::Dub, EngineError::DubChunkFailed { indices: failed_indices }));
        }

        self.log(job_id, Stage::Dub, LogLevel::Info, "all chunks dubbed").await;
        Ok(results)
    }

    async fn merge_stage(
        &self,
        job_id: &str,
        job: &Job,
        manifest: &ChunkManifest,
        dub_results: &[crate::scheduler::DubbingResult],
        ctx: &CancellationToken,
    ) -> Result<PathBuf, StageOutcome> {
        let mut merged_files = Vec::with_capacity(manifest.chunks.len());
        for chunk in &manifest.chunks {
            check_cancelled(ctx, Stage::Merge)?;
            let dubbed_audio = dub_results
                .iter()
                .find(|r| r.chunk_index == chunk.index)
                .and_then(|r| r.output_path.clone())
                .ok_or_else(|| {
                    failed(
                        Stage::Merge,
                        EngineError::MergeFailed(format!("missing dubbed audio for chunk {}", chunk.index)),
                    )
                })?;
            let ext = job.config.output_format_ext();
            let dest = job.paths.dubbed.join(crate::model::ChunkInfo::filename_for(chunk.index, &ext));
            self.toolkit
                .replace_audio(&chunk.path, &dubbed_audio, &dest)
                .await
                .map_err(|e| failed(Stage::Merge, e))?;
            merged_files.push(dest);
        }

        check_cancelled(ctx, Stage::Merge)?;
        let ext = job.config.output_format_ext();
        let output_path = job.paths.output.join(format!("final.{ext}"));
        self.toolkit
            .concat(&merged_files, &output_path)
            .await
            .map_err(|e| failed(Stage::Merge, e))?;

        self.log(job_id, Stage::Merge, LogLevel::Info, "chunks merged").await;
        Ok(output_path)
    }

    async fn finalize_stage(
        &self,
        job_id: &str,
        job: &Job,
        output_path: PathBuf,
        started: tokio::time::Instant,
    ) -> Result<(), StageOutcome> {
        self.manager
            .set_output_file(job_id, output_path.clone())
            .await
            .map_err(|e| failed(Stage::Finalize, e))?;
        self.manager
            .set_status(job_id, JobStatus::Complete, None)
            .await
            .map_err(|e| failed(Stage::Finalize, e))?;

        let workspace = crate::workspace::TempWorkspace::new(job.paths.root.parent().unwrap_or(&job.paths.root));
        if !job.config.keep_intermediate_files {
            workspace.schedule_output_cleanup(job.paths.clone(), std::time::Duration::from_secs(86_400), true);
        }

        self.log(job_id, Stage::Finalize, LogLevel::Info, "job complete").await;
        self.bus
            .publish(
                job_id,
                BusEvent::Complete {
                    output_file: output_path,
                    total_elapsed_ms: started.elapsed().as_millis() as u64,
                },
            )
            .await;
        Ok(())
    }

    async fn finish_failed(&self, job_id: &str, stage: Stage, error: EngineError) {
        let job_error = JobError {
            code: error.code().to_string(),
            message: error.to_string(),
            stage,
            recoverable: error.recoverable(),
            failed_chunk_indices: error.failed_chunk_indices().map(|v| v.to_vec()),
            details: None,
        };
        if let Err(e) = self.manager.set_status(job_id, JobStatus::Failed, Some(job_error.clone())).await {
            error!(job_id, error = %e, "failed to persist failure status");
        }
        self.cleanup_on_terminal(job_id).await;
        self.bus.publish(job_id, BusEvent::Error(job_error)).await;
        info!(job_id, code = %error.code(), "job failed");
    }

    async fn finish_cancelled(&self, job_id: &str, stage: Stage) {
        let job_error = JobError {
            code: "CANCELLED".to_string(),
            message: "job was cancelled".to_string(),
            stage,
            recoverable: false,
            failed_chunk_indices: None,
            details: None,
        };
        if let Err(e) = self.manager.set_status(job_id, JobStatus::Cancelled, Some(job_error.clone())).await {
            error!(job_id, error = %e, "failed to persist cancellation status");
        }
        self.cleanup_on_terminal(job_id).await;
        self.bus.publish(job_id, BusEvent::Error(job_error)).await;
        info!(job_id, "job cancelled");
    }

    /// Removes the job's intermediate workspace on a non-Complete terminal
    /// transition, same as `finalize_stage` does on success (spec §3
    /// invariant 7: intermediates are always reclaimed unless
    /// `keepIntermediateFiles` is set).
    async fn cleanup_on_terminal(&self, job_id: &str) {
        let job = match self.manager.store().get(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                error!(job_id, error = %e, "failed to load job for terminal cleanup");
                return;
            }
        };
        if job.config.keep_intermediate_files {
            return;
        }
        let workspace = crate::workspace::TempWorkspace::new(job.paths.root.parent().unwrap_or(&job.paths.root));
        workspace.schedule_output_cleanup(job.paths.clone(), std::time::Duration::from_secs(86_400), false);
    }
}

enum StageOutcome {
    Cancelled { stage: Stage },
    Failed { stage: Stage, error: EngineError },
}

fn check_cancelled(ctx: &CancellationToken, stage: Stage) -> Result<(), StageOutcome> {
    if ctx.is_cancelled() {
        Err(StageOutcome::Cancelled { stage })
    } else {
        Ok(())
    }
}

fn failed(stage: Stage, error: EngineError) -> StageOutcome {
    StageOutcome::Failed { stage, error }
}

fn to_error_stage(stage: PipelineStage) -> Stage {
    match stage {
        PipelineStage::Download => Stage::Download,
        PipelineStage::Chunk => Stage::Chunk,
        PipelineStage::Dub => Stage::Dub,
        PipelineStage::Merge => Stage::Merge,
        PipelineStage::Finalize => Stage::Finalize,
    }
}

/// Locates a chunk's dubbed-audio file by its zero-padded ordinal, regardless
/// of extension (the provider chooses the audio container format).
fn find_dubbed_file(dir: &std::path::Path, index: u32) -> Option<PathBuf> {
    let prefix = format!("{:04}", index + 1);
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| p.file_stem().and_then(|s| s.to_str()).map(|s| s == prefix).unwrap_or(false))
}

fn dub_percent(snapshot: &SchedulerProgress) -> u8 {
    let total = snapshot.completed + snapshot.failed + snapshot.active_jobs + snapshot.pending;
    if total == 0 {
        return 25;
    }
    let done = snapshot.completed + snapshot.failed;
    25 + ((done as f64 / total as f64) * 70.0) as u8
}

impl crate::model::JobConfig {
    fn output_format_ext(&self) -> String {
        match self.output_format {
            crate::model::OutputFormat::Mp4 => "mp4".to_string(),
            crate::model::OutputFormat::Webm => "webm".to_string(),
        }
    }
}
