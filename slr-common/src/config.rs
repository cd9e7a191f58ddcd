//! Configuration for the SLR pipeline.
//!
//! All tunables form a closed set with defaults — there is no
//! string-keyed option bag. Values are resolved in three layers:
//! built-in defaults, then a TOML file, then `SLR_*` environment
//! variables. The source of each key is tracked for `dry_run` reporting,
//! and the resolved configuration is validated on startup.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ── Defaults ─────────────────────────────────────────────────────────────

/// Coverage fraction below which a sub-requirement is a gap.
pub const DEFAULT_GAP_THRESHOLD: f64 = 0.7;
/// Upper bound on convergence loop iterations.
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;
/// Governor per-minute API call ceiling.
pub const DEFAULT_API_CALLS_PER_MINUTE: u32 = 20;
/// Governor monetary ceiling in USD.
pub const DEFAULT_BUDGET_USD: f64 = 25.0;
/// Judge batch size.
pub const DEFAULT_CLAIM_BATCH_SIZE: usize = 10;
/// Journal reviewer chunking threshold (characters).
pub const DEFAULT_JOURNAL_CHUNK_SIZE: usize = 48_000;
/// Deep requirements analyzer chunking threshold (characters).
pub const DEFAULT_DRA_CHUNK_SIZE: usize = 24_000;
/// Deep reviewer chunking threshold (characters).
pub const DEFAULT_DEEP_REVIEWER_CHUNK_SIZE: usize = 16_000;
/// Fractional overlap between adjacent chunks.
pub const DEFAULT_CHUNK_OVERLAP: f64 = 0.1;
/// Token-level Jaccard similarity above which two claims are duplicates.
pub const DEFAULT_DEDUP_SIMILARITY: f64 = 0.85;
/// Recency window in years for `is_recent` and temporal metrics.
pub const DEFAULT_RECENCY_WINDOW_YEARS: i32 = 5;
/// Per-paper cap on claims produced by the journal reviewer.
pub const DEFAULT_MAX_CLAIMS_PER_PAPER: usize = 40;
/// Fuzzy-match confidence below which resolution quarantines the claim.
pub const DEFAULT_MATCH_CONFIDENCE_THRESHOLD: f64 = 0.6;
/// Composite band (inclusive) that triggers consensus re-evaluation.
pub const DEFAULT_CONSENSUS_BAND: (f64, f64) = (2.5, 3.5);
/// Saturation cap: papers at or above this many claims on a gap are not
/// revisited by the deep reviewer.
pub const DEFAULT_SATURATION_CLAIM_CAP: usize = 8;
/// LLM wall-clock timeout per call, seconds.
pub const DEFAULT_LLM_TIMEOUT_SECS: u64 = 120;
/// LLM retry attempts (including the first call).
pub const DEFAULT_LLM_MAX_ATTEMPTS: u32 = 3;
/// LLM retry base delay, seconds.
pub const DEFAULT_LLM_BASE_DELAY_SECS: u64 = 5;

// ── Enumerations ─────────────────────────────────────────────────────────

/// How borderline claims are re-evaluated for consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusStrategy {
    /// One re-ask with an alternate prompt framing; disagreement holds
    /// the claim as borderline.
    #[default]
    SingleReeval,
    /// Three framings, majority wins; only a split with high score
    /// variance holds the claim.
    MultiVote3,
}

impl fmt::Display for ConsensusStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SingleReeval => write!(f, "single_reeval"),
            Self::MultiVote3 => write!(f, "multi_vote_3"),
        }
    }
}

/// Where a resolved configuration value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    Default,
    File,
    Env,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::File => write!(f, "file"),
            Self::Env => write!(f, "env"),
        }
    }
}

/// Severity of a configuration validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// A validation finding for one configuration key.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigWarning {
    pub key: &'static str,
    pub severity: Severity,
    pub message: String,
}

// ── Errors ───────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config file {path} is not valid TOML: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("environment variable {var} has invalid value {value:?}: {reason}")]
    Env {
        var: String,
        value: String,
        reason: String,
    },

    #[error("configuration invalid: {0}")]
    Validation(String),
}

// ── LLM Section ──────────────────────────────────────────────────────────

/// Provider settings for the LLM gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of the chat-completions API.
    pub api_base_url: String,
    /// Model identifier sent with each request.
    pub model: String,
    /// Environment variable holding the API key (the key itself never
    /// appears in configuration files).
    pub api_key_env: String,
    /// Wall-clock timeout per call, seconds.
    pub timeout_secs: u64,
    /// Retry attempts per call, including the first.
    pub max_attempts: u32,
    /// Base delay for exponential backoff, seconds.
    pub base_delay_secs: u64,
    /// Maximum concurrent in-flight calls within a stage.
    pub max_concurrency: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            api_key_env: "SLR_API_KEY".to_string(),
            timeout_secs: DEFAULT_LLM_TIMEOUT_SECS,
            max_attempts: DEFAULT_LLM_MAX_ATTEMPTS,
            base_delay_secs: DEFAULT_LLM_BASE_DELAY_SECS,
            max_concurrency: 1,
        }
    }
}

// ── Config ───────────────────────────────────────────────────────────────

/// Resolved pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory scanned for papers (PDF/CSV).
    pub data_dir: PathBuf,
    /// Location of the version store JSON document.
    pub version_history_path: PathBuf,
    /// Pillar catalog JSON document.
    pub pillar_definitions_path: PathBuf,
    /// Where reports, CSV exports, checkpoints, and caches go.
    pub output_dir: PathBuf,
    /// Coverage fraction below which a sub-requirement is a gap.
    pub gap_threshold: f64,
    /// Upper bound on convergence loop iterations.
    pub max_iterations: u32,
    /// Governor per-minute API call ceiling.
    pub api_calls_per_minute: u32,
    /// Governor cumulative monetary ceiling (USD).
    pub budget_usd: f64,
    /// Judge batch size.
    pub claim_batch_size: usize,
    /// Journal reviewer chunking threshold (characters).
    pub journal_chunk_size: usize,
    /// Deep requirements analyzer chunking threshold (characters).
    pub dra_chunk_size: usize,
    /// Deep reviewer chunking threshold (characters).
    pub deep_reviewer_chunk_size: usize,
    /// Fractional overlap between adjacent chunks (0.0–0.5).
    pub chunk_overlap: f64,
    /// Whether the deduplication policy runs at all.
    pub deduplication_enabled: bool,
    /// Token-level Jaccard similarity duplicate threshold.
    pub dedup_similarity: f64,
    /// Recency window in years.
    pub recency_window_years: i32,
    /// Pillar identifiers receiving the foundational bottleneck bonus.
    pub foundational_pillars: BTreeSet<String>,
    /// Inclusive composite band triggering consensus review.
    pub consensus_review_threshold: (f64, f64),
    /// Consensus re-evaluation strategy.
    pub consensus_strategy: ConsensusStrategy,
    /// Per-paper cap on journal reviewer claims.
    pub max_claims_per_paper: usize,
    /// Fuzzy-match confidence threshold for catalog resolution.
    pub match_confidence_threshold: f64,
    /// Deep reviewer saturation cap (claims per (gap, paper)).
    pub saturation_claim_cap: usize,
    /// Validate configuration and print the plan without LLM calls.
    pub dry_run: bool,
    /// Ignore existing analyzer results; re-run analyzers.
    pub force: bool,
    /// Delete the LLM response cache at start.
    pub clear_cache: bool,
    /// LLM provider settings.
    pub llm: LlmConfig,

    /// Per-key provenance of resolved values (not serialized).
    #[serde(skip)]
    sources: BTreeMap<&'static str, ConfigSource>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("papers"),
            version_history_path: PathBuf::from("output/version_history.json"),
            pillar_definitions_path: PathBuf::from("pillar_definitions.json"),
            output_dir: PathBuf::from("output"),
            gap_threshold: DEFAULT_GAP_THRESHOLD,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            api_calls_per_minute: DEFAULT_API_CALLS_PER_MINUTE,
            budget_usd: DEFAULT_BUDGET_USD,
            claim_batch_size: DEFAULT_CLAIM_BATCH_SIZE,
            journal_chunk_size: DEFAULT_JOURNAL_CHUNK_SIZE,
            dra_chunk_size: DEFAULT_DRA_CHUNK_SIZE,
            deep_reviewer_chunk_size: DEFAULT_DEEP_REVIEWER_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            deduplication_enabled: true,
            dedup_similarity: DEFAULT_DEDUP_SIMILARITY,
            recency_window_years: DEFAULT_RECENCY_WINDOW_YEARS,
            foundational_pillars: BTreeSet::new(),
            consensus_review_threshold: DEFAULT_CONSENSUS_BAND,
            consensus_strategy: ConsensusStrategy::default(),
            max_claims_per_paper: DEFAULT_MAX_CLAIMS_PER_PAPER,
            match_confidence_threshold: DEFAULT_MATCH_CONFIDENCE_THRESHOLD,
            saturation_claim_cap: DEFAULT_SATURATION_CLAIM_CAP,
            dry_run: false,
            force: false,
            clear_cache: false,
            llm: LlmConfig::default(),
            sources: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load configuration: defaults, overlaid by the TOML file at `path`
    /// (when present), overlaid by `SLR_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(path) = path {
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
            let file: Config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
            config.merge_file(file);
        }

        config.apply_env_overrides(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    /// Load from a TOML string (used by tests).
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        let file: Config = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        config.merge_file(file);
        Ok(config)
    }

    fn merge_file(&mut self, file: Config) {
        let defaults = Config::default();
        macro_rules! take {
            ($field:ident, $key:literal) => {
                if file.$field != defaults.$field {
                    self.$field = file.$field;
                    self.sources.insert($key, ConfigSource::File);
                }
            };
        }
        take!(data_dir, "data_dir");
        take!(version_history_path, "version_history_path");
        take!(pillar_definitions_path, "pillar_definitions_path");
        take!(output_dir, "output_dir");
        take!(gap_threshold, "gap_threshold");
        take!(max_iterations, "max_iterations");
        take!(api_calls_per_minute, "api_calls_per_minute");
        take!(budget_usd, "budget_usd");
        take!(claim_batch_size, "claim_batch_size");
        take!(journal_chunk_size, "journal_chunk_size");
        take!(dra_chunk_size, "dra_chunk_size");
        take!(deep_reviewer_chunk_size, "deep_reviewer_chunk_size");
        take!(chunk_overlap, "chunk_overlap");
        take!(deduplication_enabled, "deduplication_enabled");
        take!(dedup_similarity, "dedup_similarity");
        take!(recency_window_years, "recency_window_years");
        take!(foundational_pillars, "foundational_pillars");
        take!(consensus_review_threshold, "consensus_review_threshold");
        take!(consensus_strategy, "consensus_strategy");
        take!(max_claims_per_paper, "max_claims_per_paper");
        take!(match_confidence_threshold, "match_confidence_threshold");
        take!(saturation_claim_cap, "saturation_claim_cap");
        take!(dry_run, "dry_run");
        take!(force, "force");
        take!(clear_cache, "clear_cache");
        take!(llm, "llm");
    }

    /// Apply `SLR_*` environment overrides. `lookup` abstracts
    /// `std::env::var` so tests can inject values without touching the
    /// process environment.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        fn parse<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError>
        where
            T::Err: fmt::Display,
        {
            value.parse().map_err(|e: T::Err| ConfigError::Env {
                var: var.to_string(),
                value: value.to_string(),
                reason: e.to_string(),
            })
        }

        macro_rules! env_override {
            ($field:ident, $var:literal, $key:literal, path) => {
                if let Some(v) = lookup($var) {
                    self.$field = PathBuf::from(v);
                    self.sources.insert($key, ConfigSource::Env);
                }
            };
            ($field:ident, $var:literal, $key:literal, $ty:ty) => {
                if let Some(v) = lookup($var) {
                    self.$field = parse::<$ty>($var, &v)?;
                    self.sources.insert($key, ConfigSource::Env);
                }
            };
        }

        env_override!(data_dir, "SLR_DATA_DIR", "data_dir", path);
        env_override!(
            version_history_path,
            "SLR_VERSION_HISTORY_PATH",
            "version_history_path",
            path
        );
        env_override!(
            pillar_definitions_path,
            "SLR_PILLAR_DEFINITIONS_PATH",
            "pillar_definitions_path",
            path
        );
        env_override!(output_dir, "SLR_OUTPUT_DIR", "output_dir", path);
        env_override!(gap_threshold, "SLR_GAP_THRESHOLD", "gap_threshold", f64);
        env_override!(max_iterations, "SLR_MAX_ITERATIONS", "max_iterations", u32);
        env_override!(
            api_calls_per_minute,
            "SLR_API_CALLS_PER_MINUTE",
            "api_calls_per_minute",
            u32
        );
        env_override!(budget_usd, "SLR_BUDGET_USD", "budget_usd", f64);
        env_override!(
            claim_batch_size,
            "SLR_CLAIM_BATCH_SIZE",
            "claim_batch_size",
            usize
        );
        env_override!(dedup_similarity, "SLR_DEDUP_SIMILARITY", "dedup_similarity", f64);
        env_override!(
            recency_window_years,
            "SLR_RECENCY_WINDOW_YEARS",
            "recency_window_years",
            i32
        );

        Ok(())
    }

    /// Source of a resolved key.
    pub fn source_of(&self, key: &str) -> ConfigSource {
        self.sources.get(key).copied().unwrap_or(ConfigSource::Default)
    }

    /// Validate the resolved configuration. `Error`-severity findings
    /// make the configuration unusable.
    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut findings = Vec::new();

        if !(0.0..=1.0).contains(&self.gap_threshold) {
            findings.push(ConfigWarning {
                key: "gap_threshold",
                severity: Severity::Error,
                message: format!("must be within 0.0–1.0, got {}", self.gap_threshold),
            });
        }
        if self.budget_usd <= 0.0 {
            findings.push(ConfigWarning {
                key: "budget_usd",
                severity: Severity::Error,
                message: format!("must be positive, got {}", self.budget_usd),
            });
        }
        if self.api_calls_per_minute == 0 {
            findings.push(ConfigWarning {
                key: "api_calls_per_minute",
                severity: Severity::Error,
                message: "must be at least 1".to_string(),
            });
        }
        if self.claim_batch_size == 0 {
            findings.push(ConfigWarning {
                key: "claim_batch_size",
                severity: Severity::Error,
                message: "must be at least 1".to_string(),
            });
        }
        if !(0.0..=0.5).contains(&self.chunk_overlap) {
            findings.push(ConfigWarning {
                key: "chunk_overlap",
                severity: Severity::Error,
                message: format!("must be within 0.0–0.5, got {}", self.chunk_overlap),
            });
        }
        if !(0.0..=1.0).contains(&self.dedup_similarity) {
            findings.push(ConfigWarning {
                key: "dedup_similarity",
                severity: Severity::Error,
                message: format!("must be within 0.0–1.0, got {}", self.dedup_similarity),
            });
        }
        if self.dedup_similarity < 0.5 && self.deduplication_enabled {
            findings.push(ConfigWarning {
                key: "dedup_similarity",
                severity: Severity::Warning,
                message: format!(
                    "threshold {} is aggressive; distinct claims may be merged",
                    self.dedup_similarity
                ),
            });
        }
        let (low, high) = self.consensus_review_threshold;
        if low > high {
            findings.push(ConfigWarning {
                key: "consensus_review_threshold",
                severity: Severity::Error,
                message: format!("band is inverted: {low} > {high}"),
            });
        }
        if self.max_iterations == 0 {
            findings.push(ConfigWarning {
                key: "max_iterations",
                severity: Severity::Error,
                message: "must be at least 1".to_string(),
            });
        }
        if self.llm.max_attempts == 0 {
            findings.push(ConfigWarning {
                key: "llm.max_attempts",
                severity: Severity::Error,
                message: "must be at least 1".to_string(),
            });
        }
        if self.llm.max_concurrency == 0 {
            findings.push(ConfigWarning {
                key: "llm.max_concurrency",
                severity: Severity::Error,
                message: "must be at least 1".to_string(),
            });
        }
        if !self.data_dir.exists() {
            findings.push(ConfigWarning {
                key: "data_dir",
                severity: Severity::Warning,
                message: format!("{} does not exist yet", self.data_dir.display()),
            });
        }

        findings
    }

    /// Validate and fail on any `Error`-severity finding.
    pub fn ensure_valid(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        let findings = self.validate();
        let errors: Vec<&ConfigWarning> = findings
            .iter()
            .filter(|f| f.severity == Severity::Error)
            .collect();
        if errors.is_empty() {
            return Ok(findings);
        }
        let summary = errors
            .iter()
            .map(|f| format!("{}: {}", f.key, f.message))
            .collect::<Vec<_>>()
            .join("; ");
        Err(ConfigError::Validation(summary))
    }

    // Derived locations under `output_dir`.

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.output_dir.join("checkpoints")
    }

    pub fn llm_cache_dir(&self) -> PathBuf {
        self.output_dir.join("llm_cache")
    }

    pub fn csv_database_path(&self) -> PathBuf {
        self.output_dir.join("claims_database.csv")
    }

    pub fn gap_report_path(&self) -> PathBuf {
        self.output_dir.join("gap_report.json")
    }

    pub fn gap_summary_md_path(&self) -> PathBuf {
        self.output_dir.join("gap_report.md")
    }

    pub fn cost_report_path(&self) -> PathBuf {
        self.output_dir.join("cost_report.json")
    }

    pub fn quarantine_path(&self) -> PathBuf {
        self.output_dir.join("quarantine.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.output_dir.join("run.lock")
    }
}
