//! Engine configuration
//!
//! All knobs recognized by the engine, loadable from the environment with
//! sane defaults. The engine handle owns one immutable `EngineConfig`; there
//! is no hidden global state.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{EngineError, Result};

/// Inclusive band over `[0, 1]` used for severity and uncertainty gates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Band {
    /// Lower edge, inclusive
    pub low: f64,
    /// Upper edge, inclusive
    pub high: f64,
}

impl Band {
    /// Build a band, rejecting inverted or out-of-range edges.
    pub fn new(low: f64, high: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&low) || !(0.0..=1.0).contains(&high) || low > high {
            return Err(EngineError::Validation(format!(
                "invalid band [{low}, {high}]"
            )));
        }
        Ok(Self { low, high })
    }

    /// Whether a value falls inside the band.
    pub fn contains(&self, value: f64) -> bool {
        value >= self.low && value <= self.high
    }
}

/// Per-operation-kind request quotas, requests per minute. Zero disables the
/// limiter for that kind.
#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub retrieve_per_minute: u32,
    pub write_per_minute: u32,
    pub consolidate_per_minute: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            retrieve_per_minute: 600,
            write_per_minute: 1200,
            consolidate_per_minute: 30,
        }
    }
}

/// Retrieval tuning defaults. Callers can override the weights per request;
/// the structural knobs (ceiling, multiplier) are engine-wide.
#[derive(Debug, Clone, Copy)]
pub struct RetrievalConfig {
    /// Weight of the dense (embedding) score in the blend
    pub dense_weight: f64,
    /// Weight of the lexical (BM25) score in the blend
    pub lexical_weight: f64,
    /// Maximum recency bonus added on top of the blend
    pub recency_weight: f64,
    /// Half-life of the recency boost
    pub recency_half_life: Duration,
    /// Candidate pool multiplier: each stage fetches `multiplier * k` rows
    pub candidate_multiplier: usize,
    /// Hard ceiling on `k`; larger requests are clamped and annotated
    pub k_ceiling: usize,
    /// Reciprocal-rank fusion constant
    pub rrf_k: f64,
    /// Budget for the optional rerank stage
    pub rerank_timeout: Duration,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            dense_weight: 0.7,
            lexical_weight: 0.3,
            recency_weight: 0.1,
            recency_half_life: Duration::from_secs(7 * 24 * 3600),
            candidate_multiplier: 4,
            k_ceiling: 100,
            rrf_k: 60.0,
            rerank_timeout: Duration::from_secs(10),
        }
    }
}

/// Consolidation tuning.
#[derive(Debug, Clone, Copy)]
pub struct ConsolidationConfig {
    /// How far back the cohort sampler looks
    pub lookback_window: Duration,
    /// Consecutive events within this gap form one temporal chain
    pub chain_gap: Duration,
    /// Laplace prior for pre-validation confidence
    pub laplace_prior: f64,
    /// Confidence band in which the validator is consulted
    pub uncertainty_band: Band,
    /// Minimum support before a workflow pattern spawns a procedure
    pub procedure_min_support: usize,
    /// Ceiling on patterns emitted per run when the caller gives none
    pub default_max_patterns: usize,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            lookback_window: Duration::from_secs(7 * 24 * 3600),
            chain_gap: Duration::from_secs(10 * 60),
            laplace_prior: 2.0,
            uncertainty_band: Band {
                low: 0.3,
                high: 0.7,
            },
            procedure_min_support: 8,
            default_max_patterns: 50,
        }
    }
}

/// Contradiction-arbitration tuning.
#[derive(Debug, Clone, Copy)]
pub struct ArbiterConfig {
    /// Cosine similarity floor for assertion contradictions
    pub assertion_similarity_threshold: f64,
    /// Severity band that forces `inhibit_both`
    pub severity_band: Band,
    /// Time-decay horizon in the severity formula
    pub severity_horizon: Duration,
    /// Minimum age gap before `keep_latest` applies
    pub keep_latest_min_gap: Duration,
    /// Minimum quality gap before `keep_highest_quality` applies
    pub quality_gap: f64,
    /// Survivor-score margin below which `auto` falls back to `inhibit_both`
    pub near_tie_margin: f64,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            assertion_similarity_threshold: 0.85,
            severity_band: Band {
                low: 0.3,
                high: 0.6,
            },
            severity_horizon: Duration::from_secs(30 * 24 * 3600),
            keep_latest_min_gap: Duration::from_secs(24 * 3600),
            quality_gap: 0.3,
            near_tie_margin: 0.05,
        }
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Database file location. `None` uses the platform data directory.
    pub db_path: Option<PathBuf>,
    /// Minimum pool size; startup fails `Unavailable` below this
    pub pool_min: usize,
    /// Maximum pool size
    pub pool_max: usize,
    /// Budget for reaching `pool_min` at startup
    pub startup_timeout: Duration,
    /// Default per-operation deadline when the caller supplies none
    pub default_deadline: Duration,
    /// Embedding vector dimension, fixed at process start
    pub embedding_dimensions: usize,
    /// Bound on the query-embedding LRU cache
    pub embedding_cache_size: usize,
    /// Embedder provider identifier, informational
    pub embedder_provider: Option<String>,
    /// Validator provider identifier, informational
    pub validator_provider: Option<String>,
    /// How long a record stays labile after activation
    pub reconsolidation_window: Duration,
    /// Foreground quiet period before background consolidation may run
    pub idle_quiet_window: Duration,
    /// Unconsolidated-event count that triggers background consolidation
    pub consolidation_threshold: u64,
    /// Staleness bound on the last consolidation run
    pub consolidation_max_age: Duration,
    /// Scheduler tick period
    pub scheduler_tick: Duration,
    /// Working-set cap N: attended Facts/Patterns per project
    pub working_set_cap: usize,
    /// Archived records older than this may be hard-deleted
    pub retention_horizon: Duration,
    /// Bounded-backoff ceiling for transient substrate failures
    pub substrate_retry_limit: u32,
    /// Per-operation request quotas
    pub rate_limits: RateLimits,
    /// Retrieval knobs
    pub retrieval: RetrievalConfig,
    /// Consolidation knobs
    pub consolidation: ConsolidationConfig,
    /// Arbitration knobs
    pub arbiter: ArbiterConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            pool_min: 2,
            pool_max: 10,
            startup_timeout: Duration::from_secs(10),
            default_deadline: Duration::from_secs(30),
            embedding_dimensions: 256,
            embedding_cache_size: 5000,
            embedder_provider: None,
            validator_provider: None,
            reconsolidation_window: Duration::from_secs(60 * 60),
            idle_quiet_window: Duration::from_secs(5 * 60),
            consolidation_threshold: 1000,
            consolidation_max_age: Duration::from_secs(24 * 3600),
            scheduler_tick: Duration::from_secs(60),
            working_set_cap: 7,
            retention_horizon: Duration::from_secs(30 * 24 * 3600),
            substrate_retry_limit: 5,
            rate_limits: RateLimits::default(),
            retrieval: RetrievalConfig::default(),
            consolidation: ConsolidationConfig::default(),
            arbiter: ArbiterConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from `ENGRAM_*` environment variables, falling back
    /// to defaults for anything unset. Malformed values are rejected rather
    /// than silently ignored.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = env_var("ENGRAM_DB_PATH") {
            config.db_path = Some(PathBuf::from(path));
        }
        if let Some(v) = env_var("ENGRAM_POOL_MIN") {
            config.pool_min = parse_env("ENGRAM_POOL_MIN", &v)?;
        }
        if let Some(v) = env_var("ENGRAM_POOL_MAX") {
            config.pool_max = parse_env("ENGRAM_POOL_MAX", &v)?;
        }
        if let Some(v) = env_var("ENGRAM_EMBEDDING_DIMENSIONS") {
            config.embedding_dimensions = parse_env("ENGRAM_EMBEDDING_DIMENSIONS", &v)?;
        }
        config.embedder_provider = env_var("ENGRAM_EMBEDDER_PROVIDER");
        config.validator_provider = env_var("ENGRAM_VALIDATOR_PROVIDER");
        if let Some(v) = env_var("ENGRAM_RECONSOLIDATION_WINDOW_MINUTES") {
            let minutes: u64 = parse_env("ENGRAM_RECONSOLIDATION_WINDOW_MINUTES", &v)?;
            config.reconsolidation_window = Duration::from_secs(minutes * 60);
        }
        if let Some(v) = env_var("ENGRAM_IDLE_QUIET_WINDOW_SECONDS") {
            let secs: u64 = parse_env("ENGRAM_IDLE_QUIET_WINDOW_SECONDS", &v)?;
            config.idle_quiet_window = Duration::from_secs(secs);
        }
        if let Some(v) = env_var("ENGRAM_CONSOLIDATION_THRESHOLD") {
            config.consolidation_threshold = parse_env("ENGRAM_CONSOLIDATION_THRESHOLD", &v)?;
        }
        if let Some(v) = env_var("ENGRAM_CONSOLIDATION_MAX_AGE_HOURS") {
            let hours: u64 = parse_env("ENGRAM_CONSOLIDATION_MAX_AGE_HOURS", &v)?;
            config.consolidation_max_age = Duration::from_secs(hours * 3600);
        }
        if let Some(v) = env_var("ENGRAM_WORKING_SET_CAP") {
            config.working_set_cap = parse_env("ENGRAM_WORKING_SET_CAP", &v)?;
        }
        if let Some(v) = env_var("ENGRAM_SEVERITY_BAND") {
            config.arbiter.severity_band = parse_band("ENGRAM_SEVERITY_BAND", &v)?;
        }
        if let Some(v) = env_var("ENGRAM_RETRIEVE_PER_MINUTE") {
            config.rate_limits.retrieve_per_minute = parse_env("ENGRAM_RETRIEVE_PER_MINUTE", &v)?;
        }
        if let Some(v) = env_var("ENGRAM_WRITE_PER_MINUTE") {
            config.rate_limits.write_per_minute = parse_env("ENGRAM_WRITE_PER_MINUTE", &v)?;
        }
        if let Some(v) = env_var("ENGRAM_CONSOLIDATE_PER_MINUTE") {
            config.rate_limits.consolidate_per_minute =
                parse_env("ENGRAM_CONSOLIDATE_PER_MINUTE", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Structural sanity checks applied after load.
    pub fn validate(&self) -> Result<()> {
        if self.pool_min == 0 || self.pool_min > self.pool_max {
            return Err(EngineError::Validation(format!(
                "pool bounds min={} max={} are inverted or zero",
                self.pool_min, self.pool_max
            )));
        }
        if self.embedding_dimensions == 0 {
            return Err(EngineError::Validation(
                "embedding_dimensions must be positive".to_string(),
            ));
        }
        if self.working_set_cap == 0 {
            return Err(EngineError::Validation(
                "working_set_cap must be positive".to_string(),
            ));
        }
        if self.retrieval.candidate_multiplier < 4 {
            return Err(EngineError::Validation(
                "candidate_multiplier must be at least 4".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| EngineError::Validation(format!("{name}={value} is not a valid value")))
}

fn parse_band(name: &str, value: &str) -> Result<Band> {
    let (low, high) = value
        .split_once(',')
        .ok_or_else(|| EngineError::Validation(format!("{name} expects \"low,high\"")))?;
    Band::new(
        parse_env(name, low.trim())?,
        parse_env(name, high.trim())?,
    )
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pool_min, 2);
        assert_eq!(config.pool_max, 10);
        assert_eq!(config.working_set_cap, 7);
        assert_eq!(config.reconsolidation_window, Duration::from_secs(3600));
    }

    #[test]
    fn test_band_contains() {
        let band = Band::new(0.3, 0.6).unwrap();
        assert!(band.contains(0.3));
        assert!(band.contains(0.45));
        assert!(band.contains(0.6));
        assert!(!band.contains(0.29));
        assert!(!band.contains(0.61));
    }

    #[test]
    fn test_band_rejects_inverted() {
        assert!(Band::new(0.7, 0.3).is_err());
        assert!(Band::new(-0.1, 0.5).is_err());
    }

    #[test]
    fn test_inverted_pool_bounds_rejected() {
        let config = EngineConfig {
            pool_min: 12,
            pool_max: 4,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_band() {
        let band = parse_band("X", "0.2, 0.8").unwrap();
        assert_eq!(band.low, 0.2);
        assert_eq!(band.high, 0.8);
        assert!(parse_band("X", "0.2").is_err());
    }
}
