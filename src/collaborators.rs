//! Collaborator abstractions (spec §6): `SourceResolver`, `MediaToolkit`,
//! `DubbingProvider`. These are the seams the engine calls through; their real
//! implementations (HTTP clients, ffmpeg wrappers, provider SDKs) are out of
//! scope. `fakes` provides in-memory doubles used by this crate's own tests.

use crate::error::{EngineError, ProviderError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ResolvedSource {
    pub download_url: String,
    pub content_length: Option<u64>,
    pub content_type: String,
    pub suggested_title: String,
    pub duration_sec: u64,
    pub resolution: String,
    pub codec: String,
}

#[async_trait]
pub trait SourceResolver: Send + Sync {
    async fn resolve(&self, source_ref: &str) -> Result<ResolvedSource, EngineError>;
}

#[derive(Debug, Clone, Default)]
pub struct FetchProgress {
    pub bytes: u64,
    pub total: Option<u64>,
    pub speed: f64,
    pub eta_sec: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SplitChunk {
    pub path: PathBuf,
    pub start: f64,
    pub end: f64,
}

#[async_trait]
pub trait MediaToolkit: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        dest_file: &Path,
        progress_cb: &(dyn Fn(FetchProgress) + Send + Sync),
    ) -> Result<(), EngineError>;

    async fn split(
        &self,
        src_file: &Path,
        dest_dir: &Path,
        duration_sec: u32,
        strategy: crate::model::ChunkingStrategy,
        progress_cb: &(dyn Fn(u32, u32) + Send + Sync),
    ) -> Result<Vec<SplitChunk>, EngineError>;

    async fn replace_audio(
        &self,
        src_chunk_video: &Path,
        dubbed_audio: &Path,
        dest_file: &Path,
    ) -> Result<(), EngineError>;

    async fn concat(&self, ordered_files: &[PathBuf], dest_file: &Path) -> Result<(), EngineError>;
}

#[derive(Debug, Clone)]
pub struct CreateDubRequest {
    pub source_path: PathBuf,
    pub target_language: String,
    pub source_language: Option<String>,
    pub use_watermark: bool,
    pub num_speakers: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DubbingState {
    Dubbing,
    Dubbed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct DubbingStatusDto {
    pub state: DubbingState,
    pub error_message: Option<String>,
    pub progress: Option<u8>,
}

#[async_trait]
pub trait DubbingProvider: Send + Sync {
    async fn create(&self, req: CreateDubRequest) -> Result<String, ProviderError>;
    async fn status(&self, provider_job_id: &str) -> Result<DubbingStatusDto, ProviderError>;
    async fn download(
        &self,
        provider_job_id: &str,
        target_language: &str,
    ) -> Result<(Vec<u8>, String), ProviderError>;
}

/// In-memory test doubles for the three collaborator traits above. Not a
/// production implementation of anything — these exist purely so the
/// engine's own test suite can drive a five-stage job end to end (spec §8,
/// scenarios S5-S8) without a real network, ffmpeg, or dubbing SDK.
pub mod fakes {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::io::AsyncWriteExt;

    pub struct FakeSourceResolver {
        pub duration_sec: u64,
    }

    #[async_trait]
    impl SourceResolver for FakeSourceResolver {
        async fn resolve(&self, source_ref: &str) -> Result<ResolvedSource, EngineError> {
            if source_ref.is_empty() {
                return Err(EngineError::Validation("sourceRef is empty".into()));
            }
            Ok(ResolvedSource {
                download_url: source_ref.to_string(),
                content_length: Some(1024),
                content_type: "video/mp4".into(),
                suggested_title: "fixture".into(),
                duration_sec: self.duration_sec,
                resolution: "1080p".into(),
                codec: "h264".into(),
            })
        }
    }

    pub struct FakeMediaToolkit;

    #[async_trait]
    impl MediaToolkit for FakeMediaToolkit {
        async fn fetch(
            &self,
            _url: &str,
            dest_file: &Path,
            progress_cb: &(dyn Fn(FetchProgress) + Send + Sync),
        ) -> Result<(), EngineError> {
            let bytes = vec![0u8; 256];
            let mut file = tokio::fs::File::create(dest_file)
                .await
                .map_err(|e| EngineError::DownloadFailed(e.to_string()))?;
            file.write_all(&bytes)
                .await
                .map_err(|e| EngineError::DownloadFailed(e.to_string()))?;
            progress_cb(FetchProgress {
                bytes: bytes.len() as u64,
                total: Some(bytes.len() as u64),
                speed: 0.0,
                eta_sec: Some(0),
            });
            Ok(())
        }

        async fn split(
            &self,
            _src_file: &Path,
            dest_dir: &Path,
            duration_sec: u32,
            _strategy: crate::model::ChunkingStrategy,
            progress_cb: &(dyn Fn(u32, u32) + Send + Sync),
        ) -> Result<Vec<SplitChunk>, EngineError> {
            let total_duration = 300u32;
            let total_chunks = total_duration.div_ceil(duration_sec).max(1);
            let mut chunks = Vec::with_capacity(total_chunks as usize);
            for i in 0..total_chunks {
                let start = (i * duration_sec) as f64;
                let end = ((i + 1) * duration_sec).min(total_duration) as f64;
                let filename = crate::model::ChunkInfo::filename_for(i, "mp4");
                let path = dest_dir.join(&filename);
                tokio::fs::write(&path, b"chunk")
                    .await
                    .map_err(|e| EngineError::ChunkingFailed(e.to_string()))?;
                chunks.push(SplitChunk { path, start, end });
                progress_cb(i + 1, total_chunks);
            }
            Ok(chunks)
        }

        async fn replace_audio(
            &self,
            src_chunk_video: &Path,
            _dubbed_audio: &Path,
            dest_file: &Path,
        ) -> Result<(), EngineError> {
            tokio::fs::copy(src_chunk_video, dest_file)
                .await
                .map_err(|e| EngineError::MergeFailed(e.to_string()))?;
            Ok(())
        }

        async fn concat(
            &self,
            ordered_files: &[PathBuf],
            dest_file: &Path,
        ) -> Result<(), EngineError> {
            if ordered_files.is_empty() {
                return Err(EngineError::MergeFailed("no chunks to concat".into()));
            }
            tokio::fs::write(dest_file, b"final")
                .await
                .map_err(|e| EngineError::MergeFailed(e.to_string()))?;
            Ok(())
        }
    }

    /// A `DubbingProvider` double whose behavior per chunk is configured by
    /// index: a set of indices that always fail non-retriably, and a number
    /// of transient failures to inject before succeeding for the rest.
    pub struct FakeDubbingProvider {
        permanently_failing: Vec<u32>,
        transient_failures_before_success: u32,
        // Keyed by chunk index, not providerJobId: a retry mints a fresh
        // providerJobId each attempt (per spec §4.6 step 5 "new
        // providerJobId"), so the attempt count must survive that rotation
        // to ever converge on success.
        attempts: Mutex<std::collections::HashMap<u32, u32>>,
        next_id: AtomicU32,
    }

    impl FakeDubbingProvider {
        pub fn new(permanently_failing: Vec<u32>) -> Self {
            Self {
                permanently_failing,
                transient_failures_before_success: 0,
                attempts: Mutex::new(std::collections::HashMap::new()),
                next_id: AtomicU32::new(0),
            }
        }

        pub fn with_transient_failures(mut self, n: u32) -> Self {
            self.transient_failures_before_success = n;
            self
        }

        fn chunk_index_of(&self, provider_job_id: &str) -> u32 {
            provider_job_id
                .rsplit('-')
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0)
        }
    }

    #[async_trait]
    impl DubbingProvider for FakeDubbingProvider {
        async fn create(&self, req: CreateDubRequest) -> Result<String, ProviderError> {
            // Chunk source files are named by the zero-padded 1-based ordinal
            // (see `ChunkInfo::filename_for`); recover the 0-based chunk index.
            let ordinal: u32 = req
                .source_path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse().ok())
                .unwrap_or(1);
            let index = ordinal.saturating_sub(1);
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            Ok(format!("provider-job-{id}-{index}"))
        }

        async fn status(&self, provider_job_id: &str) -> Result<DubbingStatusDto, ProviderError> {
            let index = self.chunk_index_of(provider_job_id);
            if self.permanently_failing.contains(&index) {
                return Ok(DubbingStatusDto {
                    state: DubbingState::Failed,
                    error_message: Some("content policy rejection".into()),
                    progress: None,
                });
            }

            let mut attempts = self.attempts.lock().unwrap();
            let count = attempts.entry(index).or_insert(0);
            *count += 1;
            if *count <= self.transient_failures_before_success {
                return Err(ProviderError::Transient("upstream 503".into()));
            }
            Ok(DubbingStatusDto {
                state: DubbingState::Dubbed,
                error_message: None,
                progress: Some(100),
            })
        }

        async fn download(
            &self,
            provider_job_id: &str,
            _target_language: &str,
        ) -> Result<(Vec<u8>, String), ProviderError> {
            let index = self.chunk_index_of(provider_job_id);
            if self.permanently_failing.contains(&index) {
                return Err(ProviderError::Failed("no artifact produced".into()));
            }
            Ok((b"dubbed-audio".to_vec(), "mp3".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fakes::*;
    use super::*;

    #[tokio::test]
    async fn fake_resolver_rejects_empty_source() {
        let resolver = FakeSourceResolver { duration_sec: 60 };
        assert!(resolver.resolve("").await.is_err());
        assert!(resolver.resolve("https://example.com/video").await.is_ok());
    }

    #[tokio::test]
    async fn fake_provider_fails_configured_indices() {
        let provider = FakeDubbingProvider::new(vec![4]);
        let id = provider
            .create(CreateDubRequest {
                source_path: PathBuf::from("0005.mp4"),
                target_language: "es".into(),
                source_language: None,
                use_watermark: false,
                num_speakers: None,
            })
            .await
            .unwrap();
        let status = provider.status(&id).await.unwrap();
        assert_eq!(status.state, DubbingState::Failed);
    }
}
