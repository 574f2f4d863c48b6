//! Basic usage example for redub
//!
//! Run with: cargo run --example basic_usage

use anyhow::Result;
use redub::bus::BusEvent;
use redub::collaborators::fakes::{FakeDubbingProvider, FakeMediaToolkit, FakeSourceResolver};
use redub::config::EngineConfig;
use redub::manager::JobManager;
use redub::model::{ChunkingStrategy, JobStatus, OutputFormat};
use redub::service::{AutomationService, StartRequest};
use redub::store::{InMemoryJobStore, JobStore};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    println!("=== redub Basic Usage Example ===\n");

    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let (manager, _guardian) = JobManager::spawn(store.clone());
    let bus = redub::bus::ProgressBus::new();

    let mut config = EngineConfig::default();
    config.workspace_root = std::env::temp_dir().join("redub-demo").to_string_lossy().to_string();

    let resolver = Arc::new(FakeSourceResolver { duration_sec: 420 });
    let toolkit = Arc::new(FakeMediaToolkit);
    let provider = Arc::new(FakeDubbingProvider::new(vec![]));

    let service = Arc::new(AutomationService::new(
        store.clone(),
        manager.clone(),
        bus,
        config,
        resolver,
        toolkit,
        provider,
    ));

    let request = StartRequest {
        source_ref: "https://example.com/source-video.mp4".to_string(),
        chunk_duration_seconds: 60,
        target_language: "es-ES".to_string(),
        max_parallel_jobs: 3,
        video_quality: "1080p".to_string(),
        output_format: OutputFormat::Mp4,
        use_watermark: false,
        keep_intermediate_files: false,
        chunking_strategy: ChunkingStrategy::Fixed,
    };

    let started = service.start(request).await?;
    println!("✓ Job started: {}", started.job_id);
    println!("  Estimated cost: ${:.2}", started.estimated_cost.total_cost);
    println!("  Estimated time: {}s", started.estimated_time.total_time);

    let mut sub = service.subscribe(&started.job_id).await;
    loop {
        match sub.next().await {
            Some(BusEvent::Progress(p)) => {
                println!("  [{:?}] {}%", p.stage, p.overall_percent);
            }
            Some(BusEvent::Log(entry)) => {
                println!("  log: {}", entry.message);
            }
            Some(BusEvent::Complete { output_file, total_elapsed_ms }) => {
                println!("✓ Complete in {}ms: {}", total_elapsed_ms, output_file.display());
                break;
            }
            Some(BusEvent::Error(err)) => {
                println!("✗ Job failed: {} ({})", err.message, err.code);
                break;
            }
            Some(BusEvent::Heartbeat) => {}
            None => break,
        }
    }

    let job = service.get(&started.job_id).await?;
    println!("\nFinal status: {}", job.status);
    if job.status == JobStatus::Complete {
        println!("Output file: {}", job.output_file.unwrap().display());
    }

    manager.shutdown().await;
    Ok(())
}
