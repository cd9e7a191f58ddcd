//! Pipeline checkpoints: per-run state for resume.
//!
//! A checkpoint is written atomically after every stage transition. On
//! startup the controller scans the checkpoint directory for prior runs;
//! `--resume` continues the newest resumable one, skipping completed
//! stages. Checkpoint documents carry a schema version — older versions
//! migrate forward at load, newer ones are refused.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, warn};

use slr_common::util::atomic_write_json;

/// Current checkpoint schema version.
pub const SCHEMA_VERSION: u32 = 2;

// ── Stages ───────────────────────────────────────────────────────────────

/// The closed set of pipeline stages, in nominal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    JournalReview,
    Judge,
    Dra,
    SyncToCsv,
    GapAnalysis,
    DeepReview,
}

impl Stage {
    /// The linear stage sequence of a full run (loop stages excluded).
    pub const LINEAR_SEQUENCE: [Stage; 5] = [
        Stage::JournalReview,
        Stage::Judge,
        Stage::Dra,
        Stage::SyncToCsv,
        Stage::GapAnalysis,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::JournalReview => "journal_review",
            Self::Judge => "judge",
            Self::Dra => "dra",
            Self::SyncToCsv => "sync_to_csv",
            Self::GapAnalysis => "gap_analysis",
            Self::DeepReview => "deep_review",
        }
    }

    /// Whether a failure here halts the pipeline. The appeal and
    /// deep-review stages are best-effort: the gap report is still
    /// produced from whatever approved claims exist.
    pub fn is_required(self) -> bool {
        !matches!(self, Self::Dra | Self::DeepReview)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "journal_review" => Ok(Self::JournalReview),
            "judge" => Ok(Self::Judge),
            "dra" => Ok(Self::Dra),
            "sync_to_csv" => Ok(Self::SyncToCsv),
            "gap_analysis" => Ok(Self::GapAnalysis),
            "deep_review" => Ok(Self::DeepReview),
            other => Err(format!("unknown stage {other:?}")),
        }
    }
}

/// Stage lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Execution record for one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_s: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Default for StageRecord {
    fn default() -> Self {
        Self {
            status: StageStatus::Pending,
            started_at: None,
            completed_at: None,
            duration_s: None,
            exit_code: None,
            error: None,
        }
    }
}

// ── Checkpoint Document ──────────────────────────────────────────────────

/// Full run vs. incremental top-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    #[default]
    Full,
    Incremental,
}

/// Aggregate gap metrics stored alongside the stage table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GapMetrics {
    pub gap_count: usize,
    pub sub_requirement_count: usize,
    pub bottleneck_severity: f64,
}

/// Execution counters for the run summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub total_papers: usize,
    pub claims_created: usize,
    pub claims_approved: usize,
    pub claims_rejected: usize,
    pub provider_calls: u64,
    pub total_cost_usd: f64,
}

/// The checkpoint document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    pub schema_version: u32,
    pub job_type: JobType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Convergence loop iteration (0 before the first gap analysis).
    #[serde(default)]
    pub iteration: u32,
    /// Stage records keyed by stage name.
    pub stages: BTreeMap<String, StageRecord>,
    #[serde(default)]
    pub gap_metrics: GapMetrics,
    #[serde(default)]
    pub execution_metrics: ExecutionMetrics,
    #[serde(default)]
    pub coverage_by_pillar: BTreeMap<String, f64>,
    #[serde(default)]
    pub overall_coverage: f64,
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to read checkpoint at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint at {path} is malformed: {reason}")]
    Malformed { path: String, reason: String },

    #[error(
        "checkpoint at {path} has schema version {found}, newer than supported {supported}"
    )]
    SchemaTooNew {
        path: String,
        found: u32,
        supported: u32,
    },

    #[error("failed to write checkpoint at {path}: {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl Checkpoint {
    /// Fresh checkpoint for a new run.
    pub fn new(run_id: impl Into<String>, job_type: JobType, now: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.into(),
            schema_version: SCHEMA_VERSION,
            job_type,
            parent_run_id: None,
            started_at: now,
            updated_at: now,
            iteration: 0,
            stages: BTreeMap::new(),
            gap_metrics: GapMetrics::default(),
            execution_metrics: ExecutionMetrics::default(),
            coverage_by_pillar: BTreeMap::new(),
            overall_coverage: 0.0,
        }
    }

    pub fn stage(&self, stage: Stage) -> StageRecord {
        self.stages
            .get(stage.as_str())
            .cloned()
            .unwrap_or_default()
    }

    /// Mark a stage running.
    pub fn stage_started(&mut self, stage: Stage, now: DateTime<Utc>) {
        let record = StageRecord {
            status: StageStatus::Running,
            started_at: Some(now),
            ..StageRecord::default()
        };
        self.stages.insert(stage.as_str().to_string(), record);
        self.updated_at = now;
    }

    /// Mark a stage completed.
    pub fn stage_completed(&mut self, stage: Stage, now: DateTime<Utc>) {
        let entry = self
            .stages
            .entry(stage.as_str().to_string())
            .or_default();
        entry.status = StageStatus::Completed;
        entry.completed_at = Some(now);
        entry.duration_s = entry
            .started_at
            .map(|s| (now - s).num_milliseconds() as f64 / 1000.0);
        entry.exit_code = Some(0);
        entry.error = None;
        self.updated_at = now;
    }

    /// Mark a stage failed with a reason.
    pub fn stage_failed(
        &mut self,
        stage: Stage,
        exit_code: i32,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        let entry = self
            .stages
            .entry(stage.as_str().to_string())
            .or_default();
        entry.status = StageStatus::Failed;
        entry.completed_at = Some(now);
        entry.duration_s = entry
            .started_at
            .map(|s| (now - s).num_milliseconds() as f64 / 1000.0);
        entry.exit_code = Some(exit_code);
        entry.error = Some(error.into());
        self.updated_at = now;
    }

    /// Whether a resumed run may skip this stage.
    pub fn can_skip(&self, stage: Stage) -> bool {
        self.stage(stage).status == StageStatus::Completed
    }

    /// Whether any stage failed.
    pub fn has_failures(&self) -> bool {
        self.stages
            .values()
            .any(|r| r.status == StageStatus::Failed)
    }

    /// Persist atomically.
    pub fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        atomic_write_json(path, self).map_err(|source| CheckpointError::WriteFailed {
            path: path.display().to_string(),
            source,
        })
    }

    /// Load, migrating older schema versions forward.
    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let raw = std::fs::read_to_string(path).map_err(|source| CheckpointError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut value: serde_json::Value =
            serde_json::from_str(&raw).map_err(|err| CheckpointError::Malformed {
                path: path.display().to_string(),
                reason: err.to_string(),
            })?;

        let found = value
            .get("schema_version")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(1) as u32;
        if found > SCHEMA_VERSION {
            return Err(CheckpointError::SchemaTooNew {
                path: path.display().to_string(),
                found,
                supported: SCHEMA_VERSION,
            });
        }
        if found < SCHEMA_VERSION {
            migrate(&mut value, found);
            info!(
                path = %path.display(),
                from = found,
                to = SCHEMA_VERSION,
                "checkpoint schema migrated"
            );
        }

        serde_json::from_value(value).map_err(|err| CheckpointError::Malformed {
            path: path.display().to_string(),
            reason: err.to_string(),
        })
    }
}

/// In-place migration of older checkpoint documents.
fn migrate(value: &mut serde_json::Value, from: u32) {
    if from < 2 {
        // v1 predates job typing and run lineage.
        if let Some(obj) = value.as_object_mut() {
            obj.entry("job_type").or_insert_with(|| "full".into());
            obj.entry("parent_run_id")
                .or_insert(serde_json::Value::Null);
            obj.insert("schema_version".to_string(), SCHEMA_VERSION.into());
        }
    }
}

// ── Scanning ─────────────────────────────────────────────────────────────

/// All checkpoints in a directory, newest (by `updated_at`) first.
/// Unreadable entries are skipped with a warning.
pub fn scan_checkpoints(dir: &Path) -> Vec<(PathBuf, Checkpoint)> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        debug!(path = %dir.display(), "checkpoint directory absent");
        return Vec::new();
    };
    let mut found = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match Checkpoint::load(&path) {
            Ok(checkpoint) => found.push((path, checkpoint)),
            Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable checkpoint"),
        }
    }
    found.sort_by(|a, b| b.1.updated_at.cmp(&a.1.updated_at));
    found
}

/// Checkpoint file path for a run id.
pub fn checkpoint_path(dir: &Path, run_id: &str) -> PathBuf {
    dir.join(format!("{run_id}.json"))
}
