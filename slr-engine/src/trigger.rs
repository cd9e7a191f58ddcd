//! Trigger evaluator: is another deep-review pass worth its cost?
//!
//! Computes six metrics from the gap report and the current claim set,
//! compares each against its trigger threshold, and decides whether the
//! deep reviewer should run. The decision requires at least three
//! passing metrics with no critical blocker, or a single metric at its
//! exceptional threshold; a critical blocker (very low paper reuse, or
//! near-saturated coverage) suppresses triggering outright. The full
//! metric vector and every reason for and against are always logged.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

use crate::deep_review::{DeepReviewDirections, GapDirection};
use crate::gap::GapReport;
use slr_common::config::Config;
use slr_common::types::{Claim, ClaimStatus, EvidenceConfidence};

// ── Thresholds ───────────────────────────────────────────────────────────

const GAP_OPPORTUNITY_TRIGGER: f64 = 60.0;
const GAP_OPPORTUNITY_EXCEPTIONAL: f64 = 85.0;
const PAPER_REUSE_TRIGGER: f64 = 0.4;
const PAPER_REUSE_EXCEPTIONAL: f64 = 0.7;
const PAPER_REUSE_BLOCKER: f64 = 0.2;
const BOTTLENECK_TRIGGER: f64 = 5.0;
const BOTTLENECK_EXCEPTIONAL: f64 = 10.0;
const SATURATION_TRIGGER_BELOW: f64 = 0.6;
const SATURATION_BLOCKER: f64 = 0.85;
const EXPECTED_YIELD_TRIGGER: f64 = 15.0;
const COST_BENEFIT_TRIGGER: f64 = 3.0;
const COST_BENEFIT_EXCEPTIONAL: f64 = 5.0;

/// Base expected yield per (gap, paper) pair.
const BASE_YIELD: f64 = 2.0;
/// Completeness band considered ideal for targeted re-reading.
const IDEAL_BAND_MAX: f64 = 50.0;
/// Gaps below this completeness count for paper-reuse eligibility.
const REUSE_GAP_MAX: f64 = 80.0;
/// Papers at this many total claims are considered large for the size
/// multiplier.
const SIZE_MULTIPLIER_SCALE: f64 = 10.0;
/// Contributing papers for full triangulation credit.
const TRIANGULATION_TARGET: f64 = 3.0;

// ── Decision Types ───────────────────────────────────────────────────────

/// The six-metric vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerMetrics {
    /// Percent of sub-requirements in the ideal band.
    pub gap_opportunity_score: f64,
    /// Fraction of papers still worth re-reading.
    pub paper_reuse_efficiency: f64,
    /// Sum of bottleneck scores across the report.
    pub bottleneck_severity: f64,
    /// Weighted coverage saturation (0–1); triggers when LOW.
    pub coverage_saturation: f64,
    /// Expected new unique claims across (gap, paper) pairs.
    pub expected_claim_yield: f64,
    /// Estimated benefit points per cost point.
    pub cost_benefit_ratio: f64,
}

/// The decision, with the full reasoning trail.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerDecision {
    pub should_trigger: bool,
    pub metrics: TriggerMetrics,
    /// Metric names that met their trigger threshold.
    pub passing: Vec<&'static str>,
    /// Metric names that met their exceptional threshold.
    pub exceptional: Vec<&'static str>,
    /// Critical blockers, when any.
    pub blockers: Vec<String>,
    /// Human-readable reasons for and against.
    pub reasons: Vec<String>,
    /// Prioritized directions for the deep reviewer when triggered.
    pub directions: DeepReviewDirections,
}

// ── Evaluation ───────────────────────────────────────────────────────────

/// Evaluate the trigger from the gap report and current claims.
pub fn evaluate(config: &Config, report: &GapReport, claims: &[Claim]) -> TriggerDecision {
    let metrics = compute_metrics(config, report, claims);
    let directions = build_directions(config, report, claims);

    let mut passing = Vec::new();
    let mut exceptional = Vec::new();
    let mut reasons = Vec::new();

    if metrics.gap_opportunity_score >= GAP_OPPORTUNITY_TRIGGER {
        passing.push("gap_opportunity_score");
    }
    if metrics.gap_opportunity_score >= GAP_OPPORTUNITY_EXCEPTIONAL {
        exceptional.push("gap_opportunity_score");
    }
    if metrics.paper_reuse_efficiency >= PAPER_REUSE_TRIGGER {
        passing.push("paper_reuse_efficiency");
    }
    if metrics.paper_reuse_efficiency >= PAPER_REUSE_EXCEPTIONAL {
        exceptional.push("paper_reuse_efficiency");
    }
    if metrics.bottleneck_severity >= BOTTLENECK_TRIGGER {
        passing.push("bottleneck_severity");
    }
    if metrics.bottleneck_severity >= BOTTLENECK_EXCEPTIONAL {
        exceptional.push("bottleneck_severity");
    }
    if metrics.coverage_saturation < SATURATION_TRIGGER_BELOW {
        passing.push("coverage_saturation");
    }
    if metrics.expected_claim_yield >= EXPECTED_YIELD_TRIGGER {
        passing.push("expected_claim_yield");
    }
    if metrics.cost_benefit_ratio >= COST_BENEFIT_TRIGGER {
        passing.push("cost_benefit_ratio");
    }
    if metrics.cost_benefit_ratio >= COST_BENEFIT_EXCEPTIONAL {
        exceptional.push("cost_benefit_ratio");
    }

    let mut blockers = Vec::new();
    if metrics.paper_reuse_efficiency < PAPER_REUSE_BLOCKER {
        blockers.push(format!(
            "paper_reuse_efficiency {:.2} < {PAPER_REUSE_BLOCKER} (critical blocker)",
            metrics.paper_reuse_efficiency
        ));
    }
    if metrics.coverage_saturation >= SATURATION_BLOCKER {
        blockers.push(format!(
            "coverage_saturation {:.2} ≥ {SATURATION_BLOCKER} (critical blocker)",
            metrics.coverage_saturation
        ));
    }

    // A critical blocker suppresses triggering regardless of how strong
    // the other signals are: saturated corpora do not get re-read.
    let should_trigger =
        blockers.is_empty() && (passing.len() >= 3 || !exceptional.is_empty());

    for name in &passing {
        reasons.push(format!("{name} met its trigger threshold"));
    }
    for name in &exceptional {
        reasons.push(format!("{name} met its exceptional threshold"));
    }
    for blocker in &blockers {
        reasons.push(blocker.clone());
    }
    if passing.len() < 3 && exceptional.is_empty() {
        reasons.push(format!(
            "only {}/6 metrics passed (3 required)",
            passing.len()
        ));
    }

    info!(
        should_trigger,
        gap_opportunity_score = metrics.gap_opportunity_score,
        paper_reuse_efficiency = metrics.paper_reuse_efficiency,
        bottleneck_severity = metrics.bottleneck_severity,
        coverage_saturation = metrics.coverage_saturation,
        expected_claim_yield = metrics.expected_claim_yield,
        cost_benefit_ratio = metrics.cost_benefit_ratio,
        passing = passing.len(),
        exceptional = exceptional.len(),
        blockers = blockers.len(),
        "trigger evaluation"
    );
    for reason in &reasons {
        info!(reason = %reason, "trigger reasoning");
    }

    TriggerDecision {
        should_trigger,
        metrics,
        passing,
        exceptional,
        blockers,
        reasons,
        directions,
    }
}

fn compute_metrics(config: &Config, report: &GapReport, claims: &[Claim]) -> TriggerMetrics {
    let subs = &report.sub_requirements;
    let total_subs = subs.len().max(1) as f64;

    // gap_opportunity_score: sub-requirements in the ideal band.
    let ideal = subs
        .values()
        .filter(|c| {
            c.completeness_percent > 0.0
                && c.completeness_percent <= IDEAL_BAND_MAX
                && !c.contributing_papers.is_empty()
                && c.confidence_level != EvidenceConfidence::Low
        })
        .count() as f64;
    let gap_opportunity_score = ideal / total_subs * 100.0;

    // Claim counts per paper (live claims only).
    let mut claims_per_paper: BTreeMap<&str, usize> = BTreeMap::new();
    let mut approved_papers: BTreeMap<&str, bool> = BTreeMap::new();
    for claim in claims {
        if claim.status == ClaimStatus::Superseded {
            continue;
        }
        *claims_per_paper.entry(claim.paper_id.as_str()).or_default() += 1;
        if claim.status == ClaimStatus::Approved {
            approved_papers.insert(claim.paper_id.as_str(), true);
        }
    }

    // Papers contributing to at least one open gap.
    let open_gap_papers: std::collections::BTreeSet<&str> = subs
        .values()
        .filter(|c| c.completeness_percent < REUSE_GAP_MAX)
        .flat_map(|c| c.contributing_papers.iter().map(|p| p.paper_id.as_str()))
        .collect();

    let total_papers = claims_per_paper.len().max(1) as f64;
    let reusable = claims_per_paper
        .iter()
        .filter(|(paper, count)| {
            approved_papers.contains_key(*paper)
                && open_gap_papers.contains(*paper)
                && **count < config.saturation_claim_cap
        })
        .count() as f64;
    let paper_reuse_efficiency = if claims_per_paper.is_empty() {
        0.0
    } else {
        reusable / total_papers
    };

    let bottleneck_severity: f64 = subs.values().map(|c| c.bottleneck_score).sum();

    // coverage_saturation: weighted mean of completeness, claim density,
    // and triangulation, each scaled to 0–100.
    let saturation_sum: f64 = subs
        .values()
        .map(|c| {
            let density =
                (c.evidence_count as f64 / config.saturation_claim_cap as f64 * 100.0).min(100.0);
            let triangulation =
                (c.contributing_papers.len() as f64 / TRIANGULATION_TARGET * 100.0).min(100.0);
            (0.4 * c.completeness_percent + 0.3 * density + 0.3 * triangulation) / 100.0
        })
        .sum();
    let coverage_saturation = saturation_sum / total_subs;

    // expected_claim_yield over (gap, paper) pairs.
    let mut expected_claim_yield = 0.0;
    let mut pair_count = 0usize;
    for coverage in subs
        .values()
        .filter(|c| c.completeness_percent < config.gap_threshold * 100.0)
    {
        for paper in &coverage.contributing_papers {
            let total_claims = claims_per_paper
                .get(paper.paper_id.as_str())
                .copied()
                .unwrap_or(0);
            if total_claims >= config.saturation_claim_cap {
                continue;
            }
            let size_multiplier =
                1.0 + (total_claims as f64 / SIZE_MULTIPLIER_SCALE).min(1.0);
            let saturation_penalty = 1.0
                - (paper.claim_ids.len() as f64 / config.saturation_claim_cap as f64).min(1.0);
            expected_claim_yield += BASE_YIELD * size_multiplier * saturation_penalty;
            pair_count += 1;
        }
    }

    let cost_benefit_ratio = if pair_count == 0 {
        0.0
    } else {
        expected_claim_yield / pair_count as f64
    };

    TriggerMetrics {
        gap_opportunity_score,
        paper_reuse_efficiency,
        bottleneck_severity,
        coverage_saturation,
        expected_claim_yield,
        cost_benefit_ratio,
    }
}

/// Build the deep-review directions: gaps worst-first, each listing the
/// papers still below saturation for it.
fn build_directions(config: &Config, report: &GapReport, claims: &[Claim]) -> DeepReviewDirections {
    let mut claims_per_paper: BTreeMap<&str, usize> = BTreeMap::new();
    for claim in claims {
        if claim.status != ClaimStatus::Superseded {
            *claims_per_paper.entry(claim.paper_id.as_str()).or_default() += 1;
        }
    }

    let gaps = report
        .gaps(config.gap_threshold)
        .into_iter()
        .filter_map(|(sub_id, coverage)| {
            let papers: Vec<String> = coverage
                .contributing_papers
                .iter()
                .filter(|p| p.claim_ids.len() < config.saturation_claim_cap)
                .map(|p| p.paper_id.clone())
                .collect();
            if papers.is_empty() {
                return None;
            }
            Some(GapDirection {
                sub_requirement_id: sub_id.clone(),
                statement: format!(
                    "Completeness is {:.0}% with {} approved claim(s) from {} paper(s); \
                     additional specific evidence is needed.",
                    coverage.completeness_percent,
                    coverage.evidence_count,
                    coverage.contributing_papers.len(),
                ),
                completeness_percent: coverage.completeness_percent,
                papers,
            })
        })
        .collect();

    DeepReviewDirections { gaps }
}
