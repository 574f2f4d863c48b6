//! Core data model (spec §3).

use crate::error::Stage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const LOG_CAP: usize = 1000;
pub const MAX_CHUNK_RETRIES: u32 = 3;
pub const ALLOWED_CHUNK_DURATIONS: [u32; 5] = [30, 60, 120, 180, 300];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Downloading,
    Chunking,
    Dubbing,
    Merging,
    Finalizing,
    Complete,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Downloading => "downloading",
            JobStatus::Chunking => "chunking",
            JobStatus::Dubbing => "dubbing",
            JobStatus::Merging => "merging",
            JobStatus::Finalizing => "finalizing",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub level: LogLevel,
    pub stage: Stage,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
}

impl LogEntry {
    pub fn new(level: LogLevel, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            level,
            stage,
            message: message.into(),
            metadata: None,
        }
    }
}

/// A ring buffer capped at [`LOG_CAP`] entries, oldest evicted first (invariant 3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogRing {
    entries: std::collections::VecDeque<LogEntry>,
}

impl LogRing {
    pub fn push(&mut self, entry: LogEntry) {
        if self.entries.len() >= LOG_CAP {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&LogEntry> {
        self.entries.back()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Mp4,
    Webm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkingStrategy {
    Fixed,
    Scene,
    Silence,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub chunk_duration_seconds: u32,
    pub target_language: String,
    pub max_parallel_jobs: u32,
    pub video_quality: String,
    pub output_format: OutputFormat,
    pub use_watermark: bool,
    pub keep_intermediate_files: bool,
    pub chunking_strategy: ChunkingStrategy,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            chunk_duration_seconds: 60,
            target_language: "en-US".to_string(),
            max_parallel_jobs: 3,
            video_quality: "1080p".to_string(),
            output_format: OutputFormat::Mp4,
            use_watermark: false,
            keep_intermediate_files: false,
            chunking_strategy: ChunkingStrategy::Fixed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMeta {
    pub title: String,
    pub duration_seconds: u64,
    pub resolution_label: String,
    pub codec_label: String,
    pub file_size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPaths {
    pub root: PathBuf,
    pub source: PathBuf,
    pub chunks: PathBuf,
    pub dubbed: PathBuf,
    pub output: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    Download,
    Chunk,
    Dub,
    Merge,
    Finalize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProgress {
    pub stage: PipelineStage,
    pub overall_percent: u8,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub estimated_completion: Option<chrono::DateTime<chrono::Utc>>,
    pub stage_detail: serde_json::Value,
    #[serde(skip)]
    pub logs: LogRing,
}

impl JobProgress {
    pub fn new() -> Self {
        Self {
            stage: PipelineStage::Download,
            overall_percent: 0,
            started_at: chrono::Utc::now(),
            estimated_completion: None,
            stage_detail: serde_json::Value::Null,
            logs: LogRing::default(),
        }
    }
}

impl Default for JobProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub code: String,
    pub message: String,
    pub stage: Stage,
    pub recoverable: bool,
    pub failed_chunk_indices: Option<Vec<u32>>,
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub source_ref: String,
    pub source_meta: SourceMeta,
    pub config: JobConfig,
    pub progress: JobProgress,
    pub paths: JobPaths,
    pub output_file: Option<PathBuf>,
    pub error: Option<JobError>,
}

impl Job {
    /// Invariant 5: `outputFile` is set iff `status = complete`.
    pub fn output_invariant_holds(&self) -> bool {
        (self.status == JobStatus::Complete) == self.output_file.is_some()
    }

    /// Invariant 6: `error` is set iff `status ∈ {failed, cancelled}`.
    pub fn error_invariant_holds(&self) -> bool {
        matches!(self.status, JobStatus::Failed | JobStatus::Cancelled) == self.error.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub index: u32,
    pub filename: String,
    pub start_time: f64,
    pub end_time: f64,
    pub duration: f64,
    pub path: PathBuf,
}

impl ChunkInfo {
    /// Zero-padded ordinal filename convention resolved in spec §9.
    pub fn filename_for(index: u32, ext: &str) -> String {
        format!("{:04}.{}", index + 1, ext)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkState {
    Pending,
    Uploading,
    Processing,
    Complete,
    Failed,
    Retrying,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkStatus {
    pub index: u32,
    pub state: ChunkState,
    pub provider_job_id: Option<String>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub error: Option<String>,
    pub retry_count: u32,
}

impl ChunkStatus {
    pub fn pending(index: u32) -> Self {
        Self {
            index,
            state: ChunkState::Pending,
            provider_job_id: None,
            started_at: None,
            completed_at: None,
            error: None,
            retry_count: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub job_id: String,
    pub total_chunks: u32,
    pub chunk_duration_seconds: u32,
    pub chunks: Vec<ChunkInfo>,
}
