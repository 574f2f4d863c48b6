//! Error taxonomy for the automation engine.
//!
//! `EngineError` carries the full set of job-level failure kinds; `ProviderError`
//! is the smaller transport-level taxonomy used inside [`crate::scheduler`] to
//! decide whether a chunk task should retry.

use thiserror::Error;

/// Pipeline stage a failure occurred in, mirrored into `Job.error.stage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Download,
    Chunk,
    Dub,
    Merge,
    Finalize,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Download => "download",
            Stage::Chunk => "chunk",
            Stage::Dub => "dub",
            Stage::Merge => "merge",
            Stage::Finalize => "finalize",
        };
        f.write_str(s)
    }
}

/// Top-level error taxonomy (spec §7).
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("chunking produced zero chunks")]
    ChunkingEmpty,

    #[error("chunking failed: {0}")]
    ChunkingFailed(String),

    #[error("chunk(s) failed after retries: {indices:?}")]
    DubChunkFailed { indices: Vec<u32> },

    #[error("all chunks failed")]
    DubAllFailed,

    #[error("merge failed: {0}")]
    MergeFailed(String),

    #[error("finalize failed: {0}")]
    FinalizeFailed(String),

    #[error("job was cancelled")]
    Cancelled,

    #[error("job store unavailable: {0}")]
    Storage(String),

    #[error("job not found")]
    NotFound,

    #[error("job in conflicting state")]
    Conflict,

    #[error("job already exists")]
    Duplicate,
}

impl EngineError {
    /// Machine-readable code, matching the abstract taxonomy in spec §7.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION",
            EngineError::SourceUnavailable(_) => "SOURCE_UNAVAILABLE",
            EngineError::DownloadFailed(_) => "DOWNLOAD_FAILED",
            EngineError::ChunkingEmpty => "CHUNKING_EMPTY",
            EngineError::ChunkingFailed(_) => "CHUNKING_FAILED",
            EngineError::DubChunkFailed { .. } => "DUB_CHUNK_FAILED",
            EngineError::DubAllFailed => "DUB_ALL_FAILED",
            EngineError::MergeFailed(_) => "MERGE_FAILED",
            EngineError::FinalizeFailed(_) => "FINALIZE_FAILED",
            EngineError::Cancelled => "CANCELLED",
            EngineError::Storage(_) => "STORAGE",
            EngineError::NotFound => "NOT_FOUND",
            EngineError::Conflict => "CONFLICT",
            EngineError::Duplicate => "DUPLICATE",
        }
    }

    /// Whether a job in this failure state may be retried via `AutomationService::retry`.
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::DubChunkFailed { .. }
                | EngineError::MergeFailed(_)
                | EngineError::FinalizeFailed(_)
                | EngineError::DownloadFailed(_)
        )
    }

    pub fn failed_chunk_indices(&self) -> Option<&[u32]> {
        match self {
            EngineError::DubChunkFailed { indices } => Some(indices),
            _ => None,
        }
    }
}

/// Transport-level errors surfaced by a `DubbingProvider` call, classified so the
/// scheduler can decide whether to retry a chunk task (spec §4.6 step 5, §7).
#[derive(Debug, Error, Clone)]
pub enum ProviderError {
    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("provider request timed out")]
    Timeout,

    #[error("provider rate limit exceeded")]
    RateLimited,

    #[error("provider rejected content: {0}")]
    ContentRejected(String),

    #[error("provider reported invalid language: {0}")]
    InvalidLanguage(String),

    #[error("provider reported zero-duration input")]
    ZeroDuration,

    #[error("provider job failed: {0}")]
    Failed(String),
}

impl ProviderError {
    /// Network/transient timeouts, 5xx, rate-limit responses are retriable (spec §7).
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ProviderError::Transient(_) | ProviderError::Timeout | ProviderError::RateLimited
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
