//! Pipeline controller: stage sequencing, checkpointing, resume, and
//! the convergence loop.
//!
//! A full run executes `journal_review → judge → (dra → judge) →
//! sync_to_csv → gap_analysis`, then loops `deep_review → judge →
//! gap_analysis` while the trigger evaluator says the next pass has
//! positive expected value, until coverage converges or the iteration
//! cap is reached. A checkpoint is written atomically around every
//! stage transition; `--resume` skips completed stages, and an existing
//! resumable checkpoint is never silently overwritten.
//!
//! Failure policy: required-stage failures halt with exit 3; the appeal
//! and deep-review stages are best-effort; budget exhaustion aborts at
//! a claim/paper/batch boundary with exit 4; cooperative cancellation
//! checkpoints and exits 130.

use chrono::Utc;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::ResponseCache;
use crate::cancellation::CancellationToken;
use crate::checkpoint::{
    checkpoint_path, scan_checkpoints, Checkpoint, CheckpointError, JobType, Stage,
};
use crate::corpus::{discover_papers, PaperFile, PaperTextSource};
use crate::dedup::{deduplicate, filter_new_against_existing};
use crate::deep_review::review_gap_pair;
use crate::dra::{appeal_rejections, appealable_claims};
use crate::gap::{analyze, GapReport};
use crate::gateway::{Gateway, GatewayConfig, GatewayError};
use crate::governor::{Governor, GovernorConfig};
use crate::judge::judge_pending;
use crate::lock::{LockError, RunLock};
use crate::oracle::OracleProvider;
use crate::quarantine::QuarantineStore;
use crate::report::{render_run_summary, write_cost_report, write_gap_report};
use crate::reviewer::review_paper;
use crate::store::{
    apply_judge_updates, apply_new_claims, extract_pending, extract_rejected, register_paper,
    VersionStore,
};
use crate::trigger::evaluate as evaluate_trigger;
use crate::{csv_sync, report};
use slr_common::catalog::PillarCatalog;
use slr_common::config::Config;
use slr_common::types::{ChangeStatus, VersionHistory};

// ── Exit Codes ───────────────────────────────────────────────────────────

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_CONFIG_ERROR: i32 = 2;
pub const EXIT_STAGE_FAILED: i32 = 3;
pub const EXIT_BUDGET_EXHAUSTED: i32 = 4;
pub const EXIT_NO_CHECKPOINT: i32 = 5;
pub const EXIT_INTERRUPTED: i32 = 130;

// ── Options / Outcome / Errors ───────────────────────────────────────────

/// Resume-related options from the CLI.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Continue the newest resumable checkpoint, skipping completed
    /// stages.
    pub resume: bool,
    /// Ignore prior stage status; start at this stage.
    pub resume_from: Option<Stage>,
    /// Resume a specific checkpoint file instead of the newest.
    pub resume_checkpoint: Option<PathBuf>,
    /// Run exactly one stage, then stop.
    pub single_stage: Option<Stage>,
}

/// Where a run ended up.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub exit_code: i32,
    pub checkpoint: Checkpoint,
    pub checkpoint_path: PathBuf,
    /// Single-page human-readable summary.
    pub summary: String,
}

/// Failures that prevent a run from even starting (no checkpoint to
/// report against).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration invalid: {0}")]
    Config(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("no checkpoint found in {dir}; nothing to resume")]
    NoCheckpoint { dir: String },

    #[error(
        "a resumable checkpoint already exists at {path} (run {run_id}); \
         pass --resume to continue it, or move it aside to start fresh"
    )]
    WouldClobber { path: String, run_id: String },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

impl PipelineError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::WouldClobber { .. } => EXIT_CONFIG_ERROR,
            Self::Lock(_) | Self::Checkpoint(_) => EXIT_STAGE_FAILED,
            Self::NoCheckpoint { .. } => EXIT_NO_CHECKPOINT,
        }
    }
}

/// Why a stage stopped.
#[derive(Debug)]
enum StageStop {
    /// Budget exhausted; no further progress is possible this run.
    Budget(String),
    /// Cooperative cancellation.
    Cancelled,
    /// Stage-level failure (oracle exhaustion, store write failure, …).
    Failed(String),
}

// ── Pipeline ─────────────────────────────────────────────────────────────

/// The assembled pipeline with all collaborators.
pub struct Pipeline {
    config: Config,
    catalog: PillarCatalog,
    store: VersionStore,
    gateway: Gateway,
    governor: Arc<Governor>,
    cache: ResponseCache,
    quarantine: QuarantineStore,
    text_source: Arc<dyn PaperTextSource>,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Assemble a pipeline from configuration and collaborators. The
    /// governor and response cache are constructed here — process-wide
    /// state with an explicit lifecycle, owned by the controller.
    pub fn new(
        config: Config,
        catalog: PillarCatalog,
        provider: Arc<dyn OracleProvider>,
        text_source: Arc<dyn PaperTextSource>,
        cancel: CancellationToken,
    ) -> Self {
        let governor = Arc::new(Governor::new(GovernorConfig {
            calls_per_minute: config.api_calls_per_minute,
            budget_usd: config.budget_usd,
        }));
        let cache = ResponseCache::new(config.llm_cache_dir());
        let gateway = Gateway::new(
            provider,
            Arc::clone(&governor),
            cache.clone(),
            GatewayConfig::from(&config.llm),
        );
        let store = VersionStore::new(config.version_history_path.clone());
        let quarantine = QuarantineStore::new(config.quarantine_path());
        Self {
            config,
            catalog,
            store,
            gateway,
            governor,
            cache,
            quarantine,
            text_source,
            cancel,
        }
    }

    /// Execute the run described by `options`.
    pub async fn run(&mut self, options: RunOptions) -> Result<PipelineOutcome, PipelineError> {
        self.config
            .ensure_valid()
            .map_err(|err| PipelineError::Config(err.to_string()))?;

        let _lock = RunLock::acquire(self.config.lock_path())?;

        if self.config.clear_cache {
            if let Err(err) = self.cache.clear() {
                warn!(error = %err, "failed to clear response cache");
            }
        }

        let ckpt_dir = self.config.checkpoint_dir();
        let (mut checkpoint, ckpt_path) = self.open_checkpoint(&options)?;

        info!(
            run_id = %checkpoint.run_id,
            job_type = ?checkpoint.job_type,
            resume = options.resume,
            "pipeline starting"
        );
        std::fs::create_dir_all(&ckpt_dir).ok();
        checkpoint.save(&ckpt_path)?;

        let exit_code = self.drive(&mut checkpoint, &ckpt_path, &options).await;

        // Teardown: flush cost accounting into the checkpoint and the
        // cost report.
        let snapshot = self.governor.snapshot();
        checkpoint.execution_metrics.provider_calls = snapshot.provider_calls;
        checkpoint.execution_metrics.total_cost_usd = snapshot.total_cost_usd;
        checkpoint.save(&ckpt_path)?;
        self.governor.log_teardown();
        if let Err(err) = write_cost_report(
            &checkpoint.run_id,
            &snapshot,
            &self.config.cost_report_path(),
            Utc::now(),
        ) {
            warn!(error = %err, "failed to write cost report");
        }

        let summary = render_run_summary(&checkpoint, &ckpt_path);
        Ok(PipelineOutcome {
            exit_code,
            checkpoint,
            checkpoint_path: ckpt_path,
            summary,
        })
    }

    /// Resolve which checkpoint this run works against.
    fn open_checkpoint(
        &self,
        options: &RunOptions,
    ) -> Result<(Checkpoint, PathBuf), PipelineError> {
        let ckpt_dir = self.config.checkpoint_dir();
        let now = Utc::now();

        if let Some(path) = &options.resume_checkpoint {
            if !path.exists() {
                return Err(PipelineError::NoCheckpoint {
                    dir: path.display().to_string(),
                });
            }
            let checkpoint = Checkpoint::load(path)?;
            return Ok((checkpoint, path.clone()));
        }

        let existing = scan_checkpoints(&ckpt_dir);
        let resuming = options.resume || options.resume_from.is_some();
        if resuming {
            let Some((path, checkpoint)) = existing.into_iter().next() else {
                return Err(PipelineError::NoCheckpoint {
                    dir: ckpt_dir.display().to_string(),
                });
            };
            return Ok((checkpoint, path));
        }

        // Fresh run: refuse to proceed past an interrupted run silently.
        if let Some((path, newest)) = existing.first() {
            let resumable = newest.has_failures()
                || newest
                    .stages
                    .values()
                    .any(|r| r.status == crate::checkpoint::StageStatus::Running);
            if resumable && options.single_stage.is_none() {
                return Err(PipelineError::WouldClobber {
                    path: path.display().to_string(),
                    run_id: newest.run_id.clone(),
                });
            }
        }

        let run_id = format!("run-{}", Uuid::new_v4());
        let mut checkpoint = Checkpoint::new(run_id.clone(), JobType::Full, now);
        // Lineage: a fresh run after a completed one is an incremental
        // descendant.
        if let Some((_, newest)) = scan_checkpoints(&ckpt_dir).into_iter().next() {
            checkpoint.job_type = JobType::Incremental;
            checkpoint.parent_run_id = Some(newest.run_id);
        }
        let path = checkpoint_path(&ckpt_dir, &run_id);
        Ok((checkpoint, path))
    }

    /// Drive the stage sequence; returns the process exit code.
    async fn drive(
        &mut self,
        checkpoint: &mut Checkpoint,
        ckpt_path: &PathBuf,
        options: &RunOptions,
    ) -> i32 {
        let mut history = self.store.load();

        if let Some(stage) = options.single_stage {
            return match self.execute_stage(stage, checkpoint, ckpt_path, &mut history).await {
                Ok(()) => EXIT_SUCCESS,
                Err(stop) => self.record_stop(stage, stop, checkpoint, ckpt_path),
            };
        }

        // Linear sequence with resume skipping. The judge runs a second
        // time after the appeal stage so amended claims get verdicts
        // before the CSV sync and gap analysis.
        let linear = [
            Stage::JournalReview,
            Stage::Judge,
            Stage::Dra,
            Stage::Judge,
            Stage::SyncToCsv,
            Stage::GapAnalysis,
        ];
        let start_at = options.resume_from;
        let mut reached_start = start_at.is_none();
        for stage in linear {
            if let Some(start) = start_at {
                if stage == start {
                    reached_start = true;
                }
                if !reached_start {
                    info!(stage = %stage, "skipped (--resume-from)");
                    continue;
                }
            } else if (options.resume || options.resume_checkpoint.is_some())
                && checkpoint.can_skip(stage)
                // A completed judge record never skips live pending
                // claims (e.g. appeals written after the recorded pass).
                && !(stage == Stage::Judge && !extract_pending(&history).is_empty())
            {
                info!(stage = %stage, "skipped (already completed)");
                continue;
            }

            match self.execute_stage(stage, checkpoint, ckpt_path, &mut history).await {
                Ok(()) => {}
                Err(stop) => {
                    let exit = self.record_stop(stage, stop, checkpoint, ckpt_path);
                    if exit != EXIT_SUCCESS {
                        return exit;
                    }
                }
            }
        }

        // Convergence loop.
        let mut previous_state: Option<(usize, u64)> = None;
        loop {
            let claims = history.all_current_claims();
            let gap_report = analyze(&self.catalog, &self.config, &claims, Utc::now());
            self.absorb_gap_report(checkpoint, &gap_report);
            checkpoint.save(ckpt_path).ok();

            // An iteration that changed neither the claim set nor the
            // coverage will not change them next time either.
            let state = (claims.len(), gap_report.overall_coverage.to_bits());
            if previous_state == Some(state) {
                info!("convergence iteration made no progress; stopping");
                break;
            }
            previous_state = Some(state);

            let target = 1.0 - self.config.gap_threshold;
            if gap_report.overall_coverage >= target {
                info!(
                    coverage = gap_report.overall_coverage,
                    target, "coverage target reached; converged"
                );
                break;
            }
            if checkpoint.iteration >= self.config.max_iterations {
                info!(
                    iteration = checkpoint.iteration,
                    "iteration cap reached; stopping"
                );
                break;
            }
            let decision = evaluate_trigger(&self.config, &gap_report, &claims);
            if let Err(err) = slr_common::util::atomic_write_json(
                &self.config.output_dir.join("trigger_decision.json"),
                &decision,
            ) {
                warn!(error = %err, "failed to write trigger decision");
            }
            if !decision.should_trigger {
                info!("trigger evaluator declined further deep review; stopping");
                break;
            }
            if let Err(err) = slr_common::util::atomic_write_json(
                &self.config.output_dir.join("deep_review_directions.json"),
                &decision.directions,
            ) {
                warn!(error = %err, "failed to write deep-review directions");
            }

            checkpoint.iteration += 1;
            info!(iteration = checkpoint.iteration, "convergence iteration starting");

            for stage in [Stage::DeepReview, Stage::Judge, Stage::GapAnalysis] {
                match self.execute_stage(stage, checkpoint, ckpt_path, &mut history).await {
                    Ok(()) => {}
                    Err(stop) => {
                        let exit = self.record_stop(stage, stop, checkpoint, ckpt_path);
                        if exit != EXIT_SUCCESS {
                            return exit;
                        }
                    }
                }
            }
        }

        EXIT_SUCCESS
    }

    /// Convert a stage stop into checkpoint state and an exit code.
    /// Optional stages absorb plain failures (exit 0 continues).
    fn record_stop(
        &self,
        stage: Stage,
        stop: StageStop,
        checkpoint: &mut Checkpoint,
        ckpt_path: &PathBuf,
    ) -> i32 {
        let now = Utc::now();
        let exit = match stop {
            StageStop::Budget(reason) => {
                checkpoint.stage_failed(stage, EXIT_BUDGET_EXHAUSTED, reason, now);
                EXIT_BUDGET_EXHAUSTED
            }
            StageStop::Cancelled => {
                // The stage record stays `running`; resume re-runs it.
                checkpoint.updated_at = now;
                EXIT_INTERRUPTED
            }
            StageStop::Failed(reason) => {
                checkpoint.stage_failed(stage, EXIT_STAGE_FAILED, reason.clone(), now);
                if stage.is_required() {
                    error!(stage = %stage, reason = %reason, "required stage failed; halting");
                    EXIT_STAGE_FAILED
                } else {
                    warn!(stage = %stage, reason = %reason, "optional stage failed; continuing");
                    EXIT_SUCCESS
                }
            }
        };
        checkpoint.save(ckpt_path).ok();
        exit
    }

    /// Execute one stage against the shared history, checkpointing
    /// around it.
    async fn execute_stage(
        &mut self,
        stage: Stage,
        checkpoint: &mut Checkpoint,
        ckpt_path: &PathBuf,
        history: &mut VersionHistory,
    ) -> Result<(), StageStop> {
        if self.cancel.is_cancelled() {
            return Err(StageStop::Cancelled);
        }
        info!(stage = %stage, "stage starting");
        checkpoint.stage_started(stage, Utc::now());
        checkpoint.save(ckpt_path).ok();

        match stage {
            Stage::JournalReview => self.stage_journal_review(checkpoint, history).await?,
            Stage::Judge => self.stage_judge(checkpoint, history).await?,
            Stage::Dra => self.stage_dra(history).await?,
            Stage::SyncToCsv => self.stage_sync_to_csv(history)?,
            Stage::GapAnalysis => self.stage_gap_analysis(checkpoint, history)?,
            Stage::DeepReview => self.stage_deep_review(history).await?,
        }

        checkpoint.stage_completed(stage, Utc::now());
        checkpoint.save(ckpt_path).ok();
        info!(stage = %stage, "stage completed");
        Ok(())
    }

    // ── Stage Bodies ─────────────────────────────────────────────────

    async fn stage_journal_review(
        &mut self,
        checkpoint: &mut Checkpoint,
        history: &mut VersionHistory,
    ) -> Result<(), StageStop> {
        let papers = discover_papers(&self.config.data_dir)
            .map_err(|err| StageStop::Failed(err.to_string()))?;
        checkpoint.execution_metrics.total_papers = papers.len();
        info!(total_papers = papers.len(), "journal review over corpus");

        let mut paper_failures = 0usize;
        for paper in &papers {
            if self.cancel.is_cancelled() {
                return Err(StageStop::Cancelled);
            }
            if !self.config.force && history.papers.contains_key(&paper.paper_id) {
                info!(paper_id = %paper.paper_id, "already ingested; skipped");
                continue;
            }

            let text = match self.text_source.text_for(paper) {
                Ok(text) => text,
                Err(err) => {
                    warn!(paper_id = %paper.paper_id, error = %err, "paper unreadable; skipped");
                    paper_failures += 1;
                    continue;
                }
            };

            let yielded = match review_paper(
                &self.gateway,
                &self.catalog,
                &self.config,
                paper,
                &text,
            )
            .await
            {
                Ok(yielded) => yielded,
                Err(GatewayError::BackPressure(reason)) => {
                    return Err(StageStop::Budget(reason.to_string()));
                }
                Err(err) => {
                    warn!(paper_id = %paper.paper_id, error = %err, "extraction failed; paper skipped");
                    paper_failures += 1;
                    continue;
                }
            };

            if let Err(err) = self.quarantine.append(&yielded.quarantined) {
                warn!(error = %err, "failed to persist quarantine entries");
            }

            let claims = if self.config.deduplication_enabled {
                filter_new_against_existing(
                    yielded.claims,
                    &history.current_claims(&paper.paper_id),
                    self.config.dedup_similarity,
                )
            } else {
                yielded.claims
            };

            let updated = if claims.is_empty() {
                register_paper(history, &paper.paper_id, Utc::now())
            } else {
                checkpoint.execution_metrics.claims_created += claims.len();
                apply_new_claims(history, &claims, ChangeStatus::Initial, Utc::now())
                    .map_err(|err| StageStop::Failed(err.to_string()))?
            };
            self.store
                .save(&updated)
                .map_err(|err| StageStop::Failed(err.to_string()))?;
            *history = updated;
        }

        if paper_failures > 0 && paper_failures == papers.len() && !papers.is_empty() {
            return Err(StageStop::Failed(format!(
                "all {paper_failures} papers failed journal review"
            )));
        }
        Ok(())
    }

    async fn stage_judge(
        &mut self,
        checkpoint: &mut Checkpoint,
        history: &mut VersionHistory,
    ) -> Result<(), StageStop> {
        let pending = extract_pending(history);
        if pending.is_empty() {
            info!("no pending claims to judge");
            return Ok(());
        }
        info!(pending = pending.len(), "judging pending claims");

        let outcome = judge_pending(
            &self.gateway,
            &self.config,
            pending,
            Utc::now(),
            &self.cancel,
        )
        .await;

        // Persist whatever was judged before deciding how the stage
        // ended; successful batches are never thrown away.
        if !outcome.judged.is_empty() {
            let updated = apply_judge_updates(history, &outcome.judged, Utc::now())
                .map_err(|err| StageStop::Failed(err.to_string()))?;
            self.store
                .save(&updated)
                .map_err(|err| StageStop::Failed(err.to_string()))?;
            *history = updated;
            checkpoint.execution_metrics.claims_approved += outcome.approved_count();
            checkpoint.execution_metrics.claims_rejected += outcome.rejected_count();

            self.supersede_duplicates(history)?;
        }

        if outcome.aborted_by_budget {
            return Err(StageStop::Budget("budget exhausted mid-judge".to_string()));
        }
        if outcome.cancelled {
            return Err(StageStop::Cancelled);
        }
        if outcome.batches_failed > 0 {
            return Err(StageStop::Failed(format!(
                "{} judge batch(es) failed twice and were skipped",
                outcome.batches_failed
            )));
        }
        Ok(())
    }

    async fn stage_dra(&mut self, history: &mut VersionHistory) -> Result<(), StageStop> {
        let rejected = extract_rejected(history);
        let all_claims = history.all_current_claims();
        let eligible = appealable_claims(&rejected, &all_claims);
        if eligible.is_empty() {
            info!("no appealable rejections");
            return Ok(());
        }

        let papers = self.paper_index()?;
        let mut by_paper: BTreeMap<String, Vec<slr_common::types::Claim>> = BTreeMap::new();
        for claim in eligible {
            by_paper.entry(claim.paper_id.clone()).or_default().push(claim);
        }

        for (paper_id, rejections) in by_paper {
            if self.cancel.is_cancelled() {
                return Err(StageStop::Cancelled);
            }
            let Some(paper) = papers.get(&paper_id) else {
                warn!(paper_id = %paper_id, "paper no longer in corpus; appeals skipped");
                continue;
            };
            let text = match self.text_source.text_for(paper) {
                Ok(text) => text,
                Err(err) => {
                    warn!(paper_id = %paper_id, error = %err, "paper unreadable; appeals skipped");
                    continue;
                }
            };

            let yielded =
                match appeal_rejections(&self.gateway, &self.config, paper, &text, &rejections)
                    .await
                {
                    Ok(yielded) => yielded,
                    Err(GatewayError::BackPressure(reason)) => {
                        return Err(StageStop::Budget(reason.to_string()));
                    }
                    Err(err) => {
                        warn!(paper_id = %paper_id, error = %err, "appeal failed; paper skipped");
                        continue;
                    }
                };

            if yielded.amended.is_empty() {
                continue;
            }
            let mut claims = yielded.amended;
            claims.extend(yielded.appealed_originals);
            let updated = apply_new_claims(history, &claims, ChangeStatus::DraAppeal, Utc::now())
                .map_err(|err| StageStop::Failed(err.to_string()))?;
            self.store
                .save(&updated)
                .map_err(|err| StageStop::Failed(err.to_string()))?;
            *history = updated;
        }
        Ok(())
    }

    fn stage_sync_to_csv(&self, history: &VersionHistory) -> Result<(), StageStop> {
        csv_sync::sync_to_csv(history, &self.config.csv_database_path())
            .map(|_| ())
            .map_err(|err| StageStop::Failed(err.to_string()))
    }

    fn stage_gap_analysis(
        &self,
        checkpoint: &mut Checkpoint,
        history: &VersionHistory,
    ) -> Result<(), StageStop> {
        let claims = history.all_current_claims();
        let report = analyze(&self.catalog, &self.config, &claims, Utc::now());
        write_gap_report(&report, &self.config.gap_report_path())
            .map_err(|err| StageStop::Failed(err.to_string()))?;
        let markdown = report::render_gap_markdown(&report, self.config.gap_threshold);
        if let Err(err) = slr_common::util::atomic_write(
            &self.config.gap_summary_md_path(),
            markdown.as_bytes(),
        ) {
            warn!(error = %err, "failed to write markdown gap summary");
        }
        self.absorb_gap_report(checkpoint, &report);
        Ok(())
    }

    async fn stage_deep_review(&mut self, history: &mut VersionHistory) -> Result<(), StageStop> {
        let claims = history.all_current_claims();
        let gap_report = analyze(&self.catalog, &self.config, &claims, Utc::now());
        let decision = evaluate_trigger(&self.config, &gap_report, &claims);
        if decision.directions.gaps.is_empty() {
            info!("no deep-review directions; stage is a no-op");
            return Ok(());
        }

        let papers = self.paper_index()?;
        for (gap, paper_id) in decision.directions.pairs() {
            if self.cancel.is_cancelled() {
                return Err(StageStop::Cancelled);
            }
            let Some(paper) = papers.get(paper_id) else {
                warn!(paper_id = %paper_id, "paper no longer in corpus; gap pair skipped");
                continue;
            };
            let text = match self.text_source.text_for(paper) {
                Ok(text) => text,
                Err(err) => {
                    warn!(paper_id = %paper_id, error = %err, "paper unreadable; gap pair skipped");
                    continue;
                }
            };

            let existing = history.all_current_claims();
            let yielded = match review_gap_pair(
                &self.gateway,
                &self.catalog,
                &self.config,
                gap,
                paper,
                &text,
                &existing,
            )
            .await
            {
                Ok(yielded) => yielded,
                Err(GatewayError::BackPressure(reason)) => {
                    return Err(StageStop::Budget(reason.to_string()));
                }
                Err(err) => {
                    warn!(
                        paper_id = %paper_id,
                        gap = %gap.sub_requirement_id,
                        error = %err,
                        "deep review pair failed; skipped"
                    );
                    continue;
                }
            };

            if let Err(err) = self.quarantine.append(&yielded.quarantined) {
                warn!(error = %err, "failed to persist quarantine entries");
            }
            if yielded.claims.is_empty() {
                continue;
            }
            let updated = apply_new_claims(
                history,
                &yielded.claims,
                ChangeStatus::DeepReviewUpdate,
                Utc::now(),
            )
            .map_err(|err| StageStop::Failed(err.to_string()))?;
            self.store
                .save(&updated)
                .map_err(|err| StageStop::Failed(err.to_string()))?;
            *history = updated;
        }
        Ok(())
    }

    // ── Helpers ──────────────────────────────────────────────────────

    /// Post-judge dedup sweep: near-duplicate claims that slipped in
    /// through different analyzers (e.g. an appeal restating an already
    /// approved claim) are transitioned to `superseded` with a link to
    /// the survivor.
    fn supersede_duplicates(&self, history: &mut VersionHistory) -> Result<(), StageStop> {
        if !self.config.deduplication_enabled {
            return Ok(());
        }
        let current = history.all_current_claims();
        let outcome = deduplicate(current, self.config.dedup_similarity);
        if outcome.newly_superseded.is_empty() {
            return Ok(());
        }
        let superseded: Vec<slr_common::types::Claim> = outcome
            .claims
            .into_iter()
            .filter(|c| outcome.newly_superseded.contains(&c.claim_id))
            .collect();
        info!(count = superseded.len(), "duplicate claims superseded");
        let updated = apply_judge_updates(history, &superseded, Utc::now())
            .map_err(|err| StageStop::Failed(err.to_string()))?;
        self.store
            .save(&updated)
            .map_err(|err| StageStop::Failed(err.to_string()))?;
        *history = updated;
        Ok(())
    }

    fn paper_index(&self) -> Result<BTreeMap<String, PaperFile>, StageStop> {
        let papers = discover_papers(&self.config.data_dir)
            .map_err(|err| StageStop::Failed(err.to_string()))?;
        Ok(papers
            .into_iter()
            .map(|p| (p.paper_id.clone(), p))
            .collect())
    }

    fn absorb_gap_report(&self, checkpoint: &mut Checkpoint, report: &GapReport) {
        checkpoint.overall_coverage = report.overall_coverage;
        checkpoint.coverage_by_pillar = report
            .pillars
            .iter()
            .map(|(id, p)| (id.clone(), p.completeness_percent / 100.0))
            .collect();
        checkpoint.gap_metrics.sub_requirement_count = report.sub_requirements.len();
        checkpoint.gap_metrics.gap_count = report.gaps(self.config.gap_threshold).len();
        checkpoint.gap_metrics.bottleneck_severity = report
            .sub_requirements
            .values()
            .map(|c| c.bottleneck_score)
            .sum();
    }

    /// Render the dry-run plan: resolved configuration with sources,
    /// validation findings, and the stage sequence.
    pub fn render_plan(&self) -> String {
        let mut out = String::new();
        out.push_str("dry run: no LLM calls will be made\n\nplan:\n");
        for stage in Stage::LINEAR_SEQUENCE {
            out.push_str(&format!("  {}\n", stage.as_str()));
        }
        out.push_str("  (then deep_review → judge → gap_analysis while triggered)\n\n");
        out.push_str("configuration:\n");
        for (key, value) in [
            ("data_dir", self.config.data_dir.display().to_string()),
            (
                "version_history_path",
                self.config.version_history_path.display().to_string(),
            ),
            (
                "pillar_definitions_path",
                self.config.pillar_definitions_path.display().to_string(),
            ),
            ("output_dir", self.config.output_dir.display().to_string()),
            ("gap_threshold", self.config.gap_threshold.to_string()),
            ("max_iterations", self.config.max_iterations.to_string()),
            (
                "api_calls_per_minute",
                self.config.api_calls_per_minute.to_string(),
            ),
            ("budget_usd", self.config.budget_usd.to_string()),
            ("claim_batch_size", self.config.claim_batch_size.to_string()),
            ("dedup_similarity", self.config.dedup_similarity.to_string()),
            (
                "consensus_strategy",
                self.config.consensus_strategy.to_string(),
            ),
        ] {
            out.push_str(&format!(
                "  {key:<24} {value}  [{}]\n",
                self.config.source_of(key)
            ));
        }
        let findings = self.config.validate();
        if !findings.is_empty() {
            out.push_str("\nvalidation findings:\n");
            for finding in findings {
                out.push_str(&format!(
                    "  {:?}: {}: {}\n",
                    finding.severity, finding.key, finding.message
                ));
            }
        }
        out
    }
}
