//! Report rendering: gap report artifacts, the cost report, and the
//! end-of-run summary page.
//!
//! The gap report JSON is canonical; the Markdown rendering is a
//! derived convenience and carries no authority. The cost report is
//! flushed at governor teardown. The run summary is the single page a
//! user sees after any run: per-stage outcomes, failure one-liners, the
//! checkpoint location, and the exact command to resume.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use tracing::info;

use crate::checkpoint::{Checkpoint, Stage, StageStatus};
use crate::gap::GapReport;
use crate::governor::CostSnapshot;
use slr_common::util::atomic_write_json;

// ── Gap Report Artifacts ─────────────────────────────────────────────────

/// Write the canonical gap report JSON.
pub fn write_gap_report(report: &GapReport, path: &Path) -> std::io::Result<()> {
    atomic_write_json(path, report)?;
    info!(path = %path.display(), "gap report written");
    Ok(())
}

/// Render the derived Markdown summary of a gap report.
pub fn render_gap_markdown(report: &GapReport, gap_threshold: f64) -> String {
    let mut out = String::new();
    out.push_str("# Gap Report\n\n");
    out.push_str(&format!(
        "Generated: {}\n\nOverall coverage: **{:.1}%**\n\n",
        report.generated_at.to_rfc3339(),
        report.overall_coverage * 100.0
    ));

    out.push_str("## Pillars\n\n");
    out.push_str("| Pillar | Completeness | Sub-requirements | Gaps |\n");
    out.push_str("|---|---|---|---|\n");
    for (pillar_id, pillar) in &report.pillars {
        out.push_str(&format!(
            "| {} | {:.1}% | {} | {} |\n",
            pillar_id,
            pillar.completeness_percent,
            pillar.sub_requirement_count,
            pillar.gap_count
        ));
    }

    let gaps = report.gaps(gap_threshold);
    out.push_str(&format!("\n## Gaps ({})\n\n", gaps.len()));
    if gaps.is_empty() {
        out.push_str("No sub-requirement is below the coverage threshold.\n");
    } else {
        out.push_str("| Sub-requirement | Completeness | Evidence | Papers | Bottleneck |\n");
        out.push_str("|---|---|---|---|---|\n");
        for (sub_id, coverage) in &gaps {
            out.push_str(&format!(
                "| {} | {:.0}% | {} | {} | {:.1} |\n",
                sub_id,
                coverage.completeness_percent,
                coverage.evidence_count,
                coverage.contributing_papers.len(),
                coverage.bottleneck_score
            ));
        }
    }

    let mut bottlenecks: Vec<_> = report
        .sub_requirements
        .iter()
        .filter(|(_, c)| c.bottleneck_score > 0.0)
        .collect();
    bottlenecks.sort_by(|a, b| {
        b.1.bottleneck_score
            .partial_cmp(&a.1.bottleneck_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    if !bottlenecks.is_empty() {
        out.push_str("\n## Top bottlenecks\n\n");
        for (sub_id, coverage) in bottlenecks.iter().take(5) {
            out.push_str(&format!(
                "- {} (score {:.1}, completeness {:.0}%)\n",
                sub_id, coverage.bottleneck_score, coverage.completeness_percent
            ));
        }
    }
    out
}

// ── Cost Report ──────────────────────────────────────────────────────────

/// Cost report document flushed at teardown.
#[derive(Debug, Clone, Serialize)]
pub struct CostReport {
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub total_cost_usd: f64,
    pub budget_usd: f64,
    pub provider_calls: u64,
    pub cached_calls: u64,
    pub cache_hit_rate: f64,
    pub cache_savings_usd: f64,
    pub calls_by_stage: std::collections::BTreeMap<String, u64>,
}

/// Write the cost report from a governor snapshot.
pub fn write_cost_report(
    run_id: &str,
    snapshot: &CostSnapshot,
    path: &Path,
    now: DateTime<Utc>,
) -> std::io::Result<()> {
    let report = CostReport {
        run_id: run_id.to_string(),
        generated_at: now,
        total_cost_usd: snapshot.total_cost_usd,
        budget_usd: snapshot.budget_usd,
        provider_calls: snapshot.provider_calls,
        cached_calls: snapshot.cached_calls,
        cache_hit_rate: snapshot.cache_hit_rate(),
        cache_savings_usd: snapshot.cache_savings_usd,
        calls_by_stage: snapshot.calls_by_stage.clone(),
    };
    atomic_write_json(path, &report)?;
    info!(path = %path.display(), "cost report written");
    Ok(())
}

// ── Run Summary ──────────────────────────────────────────────────────────

/// Render the single-page end-of-run summary.
pub fn render_run_summary(checkpoint: &Checkpoint, checkpoint_path: &Path) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "run {}  ({})\n",
        checkpoint.run_id,
        if checkpoint.has_failures() {
            "FAILED"
        } else {
            "completed"
        }
    ));
    out.push_str(&format!(
        "started {}  updated {}\n\n",
        checkpoint.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
        checkpoint.updated_at.format("%Y-%m-%d %H:%M:%S UTC"),
    ));

    out.push_str("stages:\n");
    let all_stages = [
        Stage::JournalReview,
        Stage::Judge,
        Stage::Dra,
        Stage::SyncToCsv,
        Stage::GapAnalysis,
        Stage::DeepReview,
    ];
    for stage in all_stages {
        let record = checkpoint.stage(stage);
        let duration = record
            .duration_s
            .map(|s| {
                format!(
                    " ({})",
                    humantime::format_duration(std::time::Duration::from_secs(s.round() as u64))
                )
            })
            .unwrap_or_default();
        match record.status {
            StageStatus::Pending => {
                out.push_str(&format!("  {:<16} pending\n", stage.as_str()));
            }
            StageStatus::Running => {
                out.push_str(&format!("  {:<16} interrupted while running\n", stage.as_str()));
            }
            StageStatus::Completed => {
                out.push_str(&format!("  {:<16} completed{duration}\n", stage.as_str()));
            }
            StageStatus::Failed => {
                out.push_str(&format!(
                    "  {:<16} failed{duration}: {}\n",
                    stage.as_str(),
                    record.error.as_deref().unwrap_or("unknown error")
                ));
            }
        }
    }

    out.push_str(&format!(
        "\npapers: {}  claims: {} created / {} approved / {} rejected\n",
        checkpoint.execution_metrics.total_papers,
        checkpoint.execution_metrics.claims_created,
        checkpoint.execution_metrics.claims_approved,
        checkpoint.execution_metrics.claims_rejected,
    ));
    out.push_str(&format!(
        "overall coverage: {:.1}%  (iteration {})\n",
        checkpoint.overall_coverage * 100.0,
        checkpoint.iteration
    ));
    out.push_str(&format!(
        "cost: ${:.4} over {} provider calls\n",
        checkpoint.execution_metrics.total_cost_usd,
        checkpoint.execution_metrics.provider_calls,
    ));
    out.push_str(&format!("\ncheckpoint: {}\n", checkpoint_path.display()));
    if checkpoint.has_failures() {
        out.push_str("resume with: slr resume\n");
    }
    out
}
