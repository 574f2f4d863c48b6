//! Engine configuration.
//!
//! Mirrors the env-var loading style used to build `ServerConfig` in the
//! control-plane binary this engine was extracted from: `env::var(...).ok()`
//! chains with typed defaults, no external config crate.

use std::env;
use std::time::Duration;

/// Tunable knobs recognized by the engine (spec §6 "Environment configuration").
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Base path under which per-job directories are created.
    pub workspace_root: String,
    /// SQLite database file backing `SqliteJobStore` (spec §4.1).
    pub db_path: String,
    /// USD per minute of source video dubbed.
    pub dub_rate_per_minute: f64,
    /// USD per chunk processed.
    pub process_rate_per_chunk: f64,
    /// Floor of the provider status-poll backoff.
    pub provider_poll_min: Duration,
    /// Ceiling of the provider status-poll backoff.
    pub provider_poll_max: Duration,
    /// How long terminal job artifacts are retained before cleanup.
    pub cleanup_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace_root: "./temp/automation".to_string(),
            db_path: "./data/redub.sqlite3".to_string(),
            dub_rate_per_minute: 0.24,
            process_rate_per_chunk: 0.01,
            provider_poll_min: Duration::from_secs(3),
            provider_poll_max: Duration::from_secs(20),
            cleanup_delay: Duration::from_secs(86_400),
        }
    }
}

impl EngineConfig {
    /// Load configuration from the process environment, falling back to
    /// [`EngineConfig::default`] for anything unset or unparseable.
    ///
    /// ```
    /// let cfg = redub::config::EngineConfig::from_env();
    /// assert!(cfg.dub_rate_per_minute > 0.0);
    /// ```
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            workspace_root: env::var("WORKSPACE_ROOT").unwrap_or(defaults.workspace_root),
            db_path: env::var("DB_PATH").unwrap_or(defaults.db_path),
            dub_rate_per_minute: env::var("DUB_RATE_PER_MINUTE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.dub_rate_per_minute),
            process_rate_per_chunk: env::var("PROCESS_RATE_PER_CHUNK")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.process_rate_per_chunk),
            provider_poll_min: env::var("PROVIDER_POLL_MIN_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.provider_poll_min),
            provider_poll_max: env::var("PROVIDER_POLL_MAX_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.provider_poll_max),
            cleanup_delay: env::var("CLEANUP_DELAY_SEC")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.cleanup_delay),
        }
    }
}
