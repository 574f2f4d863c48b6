use criterion::{criterion_group, criterion_main, Criterion};
use redub::cost::CostCalculator;
use redub::model::{ChunkingStrategy, JobConfig, OutputFormat, SourceMeta};
use std::hint::black_box;

fn sample_meta(duration_seconds: u64) -> SourceMeta {
    SourceMeta {
        title: "bench-source".into(),
        duration_seconds,
        resolution_label: "1080p".into(),
        codec_label: "h264".into(),
        file_size_bytes: None,
    }
}

fn sample_config(chunk_duration_seconds: u32) -> JobConfig {
    JobConfig {
        chunk_duration_seconds,
        target_language: "en-US".into(),
        max_parallel_jobs: 3,
        video_quality: "1080p".into(),
        output_format: OutputFormat::Mp4,
        use_watermark: false,
        keep_intermediate_files: false,
        chunking_strategy: ChunkingStrategy::Fixed,
    }
}

fn benchmark_calculate_cost(c: &mut Criterion) {
    let meta = sample_meta(3600);
    let config = sample_config(60);

    c.bench_function("calculate_cost_1h_60s_chunks", |b| {
        b.iter(|| black_box(CostCalculator::calculate_cost(black_box(&meta), black_box(&config))));
    });
}

fn benchmark_calculate_time(c: &mut Criterion) {
    let meta = sample_meta(3600);
    let config = sample_config(60);

    c.bench_function("calculate_time_1h_60s_chunks", |b| {
        b.iter(|| black_box(CostCalculator::calculate_time(black_box(&meta), black_box(&config))));
    });
}

fn benchmark_breakdown_percentages(c: &mut Criterion) {
    let meta = sample_meta(3600);
    let config = sample_config(60);
    let time = CostCalculator::calculate_time(&meta, &config);

    c.bench_function("get_time_breakdown_percentage", |b| {
        b.iter(|| black_box(CostCalculator::get_time_breakdown_percentage(black_box(time.breakdown))));
    });
}

criterion_group!(
    benches,
    benchmark_calculate_cost,
    benchmark_calculate_time,
    benchmark_breakdown_percentages
);
criterion_main!(benches);
