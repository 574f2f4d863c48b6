//! Turns a source file into an ordered [`ChunkManifest`] (spec §4.5).

use crate::collaborators::MediaToolkit;
use crate::error::EngineError;
use crate::model::{ChunkInfo, ChunkManifest, ChunkingStrategy};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct ChunkPlanProgress {
    pub processed: u32,
    pub total_chunks: u32,
}

pub struct ChunkPlanner {
    toolkit: Arc<dyn MediaToolkit>,
}

impl ChunkPlanner {
    pub fn new(toolkit: Arc<dyn MediaToolkit>) -> Self {
        Self { toolkit }
    }

    /// Splits `src_file` into `out_dir`, synthesizing a [`ChunkInfo`] per
    /// produced file. A final chunk shorter than `chunk_duration_seconds` is
    /// valid, unpadded. Zero chunks is a hard failure (`CHUNKING_EMPTY`).
    pub async fn plan(
        &self,
        job_id: &str,
        src_file: &Path,
        out_dir: &Path,
        chunk_duration_seconds: u32,
        strategy: ChunkingStrategy,
        progress_cb: &(dyn Fn(ChunkPlanProgress) + Send + Sync),
    ) -> Result<ChunkManifest, EngineError> {
        let split_result = self
            .toolkit
            .split(
                src_file,
                out_dir,
                chunk_duration_seconds,
                strategy,
                &|processed, total_chunks| {
                    progress_cb(ChunkPlanProgress {
                        processed,
                        total_chunks,
                    })
                },
            )
            .await?;

        if split_result.is_empty() {
            return Err(EngineError::ChunkingEmpty);
        }

        let chunks: Vec<ChunkInfo> = split_result
            .iter()
            .enumerate()
            .map(|(i, c)| ChunkInfo {
                index: i as u32,
                filename: c
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default(),
                start_time: c.start,
                end_time: c.end,
                duration: c.end - c.start,
                path: c.path.clone(),
            })
            .collect();

        Ok(ChunkManifest {
            job_id: job_id.to_string(),
            total_chunks: chunks.len() as u32,
            chunk_duration_seconds,
            chunks,
        })
    }
}
