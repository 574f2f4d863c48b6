//! Pure cost and time estimation (spec §4.4).
//!
//! All methods are deterministic and side-effect-free: same inputs always
//! produce the same outputs, and no method performs I/O.

use crate::model::{JobConfig, SourceMeta};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostBreakdown {
    pub dubbing_cost: f64,
    pub processing_cost: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostEstimate {
    pub total_cost: f64,
    pub cost_per_chunk: f64,
    pub total_chunks: u32,
    pub video_duration: u64,
    pub breakdown: CostBreakdown,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeBreakdown {
    pub download: u64,
    pub chunking: u64,
    pub dubbing: u64,
    pub merging: u64,
    pub finalization: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeEstimate {
    pub total_time: u64,
    pub breakdown: TimeBreakdown,
}

/// Deterministic cost and time calculator. Unit struct: every method is a
/// pure associated function over its arguments.
///
/// # Example
///
/// ```
/// use redub::cost::CostCalculator;
/// use redub::model::{JobConfig, SourceMeta, OutputFormat, ChunkingStrategy};
///
/// let meta = SourceMeta {
///     title: "demo".into(),
///     duration_seconds: 600,
///     resolution_label: "1080p".into(),
///     codec_label: "h264".into(),
///     file_size_bytes: None,
/// };
/// let config = JobConfig {
///     chunk_duration_seconds: 60,
///     target_language: "en-US".into(),
///     max_parallel_jobs: 3,
///     video_quality: "1080p".into(),
///     output_format: OutputFormat::Mp4,
///     use_watermark: false,
///     keep_intermediate_files: false,
///     chunking_strategy: ChunkingStrategy::Fixed,
/// };
/// let cost = CostCalculator::calculate_cost(&meta, &config);
/// assert_eq!(cost.total_chunks, 10);
/// assert_eq!(cost.total_cost, 2.5);
/// ```
pub struct CostCalculator;

impl CostCalculator {
    pub const RATE_DUB_PER_MINUTE: f64 = 0.24;
    pub const RATE_PER_CHUNK: f64 = 0.01;

    pub fn calculate_chunk_count(duration_seconds: u64, chunk_duration_seconds: u32) -> u32 {
        let chunk = chunk_duration_seconds as f64;
        ((duration_seconds as f64) / chunk).ceil() as u32
    }

    pub fn calculate_cost(meta: &SourceMeta, config: &JobConfig) -> CostEstimate {
        Self::calculate_cost_with_rates(
            meta,
            config,
            Self::RATE_DUB_PER_MINUTE,
            Self::RATE_PER_CHUNK,
        )
    }

    /// As [`Self::calculate_cost`] but with explicit rates, so callers that
    /// loaded `DUB_RATE_PER_MINUTE`/`PROCESS_RATE_PER_CHUNK` from
    /// [`crate::config::EngineConfig`] can override the built-in constants.
    pub fn calculate_cost_with_rates(
        meta: &SourceMeta,
        config: &JobConfig,
        rate_dub_per_minute: f64,
        rate_per_chunk: f64,
    ) -> CostEstimate {
        let total_chunks =
            Self::calculate_chunk_count(meta.duration_seconds, config.chunk_duration_seconds);
        let minutes = meta.duration_seconds as f64 / 60.0;
        let watermark_multiplier = if config.use_watermark { 0.5 } else { 1.0 };
        let dubbing_cost = minutes * rate_dub_per_minute * watermark_multiplier;
        let processing_cost = total_chunks as f64 * rate_per_chunk;
        let total_cost = dubbing_cost + processing_cost;
        let cost_per_chunk = if total_chunks > 0 {
            total_cost / total_chunks as f64
        } else {
            0.0
        };

        CostEstimate {
            total_cost: round_cents(total_cost),
            cost_per_chunk: round_cents(cost_per_chunk),
            total_chunks,
            video_duration: meta.duration_seconds,
            breakdown: CostBreakdown {
                dubbing_cost: round_cents(dubbing_cost),
                processing_cost: round_cents(processing_cost),
            },
        }
    }

    pub fn calculate_time(meta: &SourceMeta, config: &JobConfig) -> TimeEstimate {
        let minutes = meta.duration_seconds as f64 / 60.0;
        let total_chunks =
            Self::calculate_chunk_count(meta.duration_seconds, config.chunk_duration_seconds);

        let download = (minutes * 45.0).round() as u64;
        let chunking = (minutes * 1.0).round() as u64;
        let merging = (minutes * 2.0).round() as u64;
        let finalization = 5u64;
        let parallel_batches =
            (total_chunks as f64 / config.max_parallel_jobs.max(1) as f64).ceil();
        let dubbing = (parallel_batches * config.chunk_duration_seconds as f64 * 2.5) as u64;

        let total_time = download + chunking + dubbing + merging + finalization;

        TimeEstimate {
            total_time,
            breakdown: TimeBreakdown {
                download,
                chunking,
                dubbing,
                merging,
                finalization,
            },
        }
    }

    pub fn calculate_optimal_chunk_duration(duration_seconds: u64) -> u32 {
        if duration_seconds < 300 {
            60
        } else if duration_seconds < 900 {
            120
        } else if duration_seconds < 1800 {
            180
        } else {
            300
        }
    }

    /// `"$X.XX"`, rounded half-away-from-zero to two decimals.
    pub fn format_cost(value: f64) -> String {
        format!("${:.2}", round_cents(value))
    }

    /// `<60 "Ns"`, `<3600 "Mm"`/`"Mm Ss"`, `else "Hh"`/`"Hh Mm"` — zero
    /// components omitted except the leading one.
    pub fn format_time(seconds: u64) -> String {
        if seconds < 60 {
            format!("{seconds}s")
        } else if seconds < 3600 {
            let m = seconds / 60;
            let s = seconds % 60;
            if s == 0 {
                format!("{m}m")
            } else {
                format!("{m}m {s}s")
            }
        } else {
            let h = seconds / 3600;
            let m = (seconds % 3600) / 60;
            if m == 0 {
                format!("{h}h")
            } else {
                format!("{h}h {m}m")
            }
        }
    }

    /// Integer percentages summing to 100 within ±1, largest-remainder rounding.
    pub fn get_cost_breakdown_percentage(breakdown: CostBreakdown) -> (u8, u8) {
        percentage_pair(breakdown.dubbing_cost, breakdown.processing_cost)
    }

    pub fn get_time_breakdown_percentage(breakdown: TimeBreakdown) -> [u8; 5] {
        let parts = [
            breakdown.download as f64,
            breakdown.chunking as f64,
            breakdown.dubbing as f64,
            breakdown.merging as f64,
            breakdown.finalization as f64,
        ];
        percentage_many(&parts)
    }
}

/// Rounds to the nearest cent, round-half-up. `value * 100.0` can land a hair
/// below the intended half-cent boundary due to binary float representation
/// (`1.005 * 100.0 == 100.49999999999999`), so nudge by a tiny epsilon scaled
/// to the value's magnitude before rounding.
fn round_cents(value: f64) -> f64 {
    let scaled = value * 100.0;
    let nudged = scaled + f64::EPSILON * scaled.abs().max(1.0) * 100.0;
    nudged.round() / 100.0
}

fn percentage_pair(a: f64, b: f64) -> (u8, u8) {
    let parts = percentage_many(&[a, b]);
    (parts[0], parts[1])
}

/// Largest-remainder method: floor each share, then distribute the remaining
/// points to the entries with the largest fractional remainder until the
/// total reaches 100.
fn percentage_many(parts: &[f64]) -> [u8; 5] {
    let mut out = [0u8; 5];
    let total: f64 = parts.iter().sum();
    if total <= 0.0 {
        return out;
    }

    let mut shares: Vec<(usize, f64)> = parts
        .iter()
        .enumerate()
        .map(|(i, v)| (i, v / total * 100.0))
        .collect();

    let mut assigned = 0u32;
    for (i, share) in &shares {
        out[*i] = share.floor() as u8;
        assigned += out[*i] as u32;
    }

    shares.sort_by(|a, b| {
        let ra = a.1 - a.1.floor();
        let rb = b.1 - b.1.floor();
        rb.partial_cmp(&ra).unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut remaining = 100i32 - assigned as i32;
    let mut idx = 0;
    while remaining > 0 && idx < shares.len() {
        out[shares[idx].0] += 1;
        remaining -= 1;
        idx += 1;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChunkingStrategy, OutputFormat};

    fn meta(duration_seconds: u64) -> SourceMeta {
        SourceMeta {
            title: "t".into(),
            duration_seconds,
            resolution_label: "1080p".into(),
            codec_label: "h264".into(),
            file_size_bytes: None,
        }
    }

    fn config(chunk_duration_seconds: u32, max_parallel_jobs: u32, use_watermark: bool) -> JobConfig {
        JobConfig {
            chunk_duration_seconds,
            target_language: "en-US".into(),
            max_parallel_jobs,
            video_quality: "1080p".into(),
            output_format: OutputFormat::Mp4,
            use_watermark,
            keep_intermediate_files: false,
            chunking_strategy: ChunkingStrategy::Fixed,
        }
    }

    /// S1 — Cost math, 10-min video, 60s chunks, no watermark.
    #[test]
    fn s1_cost_and_time() {
        let m = meta(600);
        let c = config(60, 3, false);

        let cost = CostCalculator::calculate_cost(&m, &c);
        assert_eq!(cost.total_chunks, 10);
        assert_eq!(cost.video_duration, 600);
        assert_eq!(cost.breakdown.dubbing_cost, 2.4);
        assert_eq!(cost.breakdown.processing_cost, 0.1);
        assert_eq!(cost.total_cost, 2.5);
        assert_eq!(cost.cost_per_chunk, 0.25);

        let time = CostCalculator::calculate_time(&m, &c);
        assert_eq!(time.breakdown.download, 450);
        assert_eq!(time.breakdown.chunking, 10);
        assert_eq!(time.breakdown.dubbing, 600);
        assert_eq!(time.breakdown.merging, 20);
        assert_eq!(time.breakdown.finalization, 5);
        assert_eq!(time.total_time, 1085);
    }

    /// S2 — Watermark discount.
    #[test]
    fn s2_watermark_discount() {
        let m = meta(600);
        let c = config(60, 3, true);
        let cost = CostCalculator::calculate_cost(&m, &c);
        assert_eq!(cost.total_cost, 1.3);
        assert_eq!(cost.breakdown.dubbing_cost, 1.2);
    }

    /// S3 — Fractional chunks.
    #[test]
    fn s3_fractional_chunks() {
        let m = meta(650);
        let c = config(60, 3, false);
        let cost = CostCalculator::calculate_cost(&m, &c);
        assert_eq!(cost.total_chunks, 11);
        assert_eq!(cost.breakdown.processing_cost, 0.11);
    }

    /// S4 — Optimal chunk duration.
    #[test]
    fn s4_optimal_chunk_duration() {
        assert_eq!(CostCalculator::calculate_optimal_chunk_duration(299), 60);
        assert_eq!(CostCalculator::calculate_optimal_chunk_duration(300), 120);
        assert_eq!(CostCalculator::calculate_optimal_chunk_duration(900), 180);
        assert_eq!(CostCalculator::calculate_optimal_chunk_duration(1800), 300);
    }

    #[test]
    fn format_cost_examples() {
        assert_eq!(CostCalculator::format_cost(0.0), "$0.00");
        assert_eq!(CostCalculator::format_cost(2.5), "$2.50");
        assert_eq!(CostCalculator::format_cost(1.005), "$1.01");
    }

    #[test]
    fn format_time_examples() {
        assert_eq!(CostCalculator::format_time(45), "45s");
        assert_eq!(CostCalculator::format_time(60), "1m");
        assert_eq!(CostCalculator::format_time(90), "1m 30s");
        assert_eq!(CostCalculator::format_time(3600), "1h");
        assert_eq!(CostCalculator::format_time(5400), "1h 30m");
    }

    #[test]
    fn cost_calculator_is_pure() {
        let m = meta(600);
        let c = config(60, 3, false);
        let a = CostCalculator::calculate_cost(&m, &c);
        let b = CostCalculator::calculate_cost(&m, &c);
        assert_eq!(a, b);
    }

    #[test]
    fn percentage_breakdowns_sum_to_100() {
        let time = CostCalculator::calculate_time(&meta(600), &config(60, 3, false));
        let pct = CostCalculator::get_time_breakdown_percentage(time.breakdown);
        let sum: u32 = pct.iter().map(|&p| p as u32).sum();
        assert_eq!(sum, 100);

        let cost = CostCalculator::calculate_cost(&meta(600), &config(60, 3, false));
        let (d, p) = CostCalculator::get_cost_breakdown_percentage(cost.breakdown);
        assert_eq!(d as u32 + p as u32, 100);
    }
}
