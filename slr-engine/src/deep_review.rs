//! Deep reviewer: gap-targeted re-analysis of ingested papers.
//!
//! Consumes a directions document — prioritized sub-requirements with
//! the papers already contributing to them below saturation — and
//! re-reads each (gap, paper) pair with the gap statement as explicit
//! context, extracting additional specific claims (short text spans
//! with exact page numbers). Deduplication against the union of
//! existing claims is mandatory before anything is written; a pass that
//! yields nothing new for a paper logs the condition and moves on.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::corpus::PaperFile;
use crate::dedup::filter_new_against_existing;
use crate::gateway::{Gateway, GatewayError};
use crate::reviewer::{extract_claims, ExtractionYield};
use slr_common::catalog::PillarCatalog;
use slr_common::config::Config;
use slr_common::types::{Claim, ClaimSource};

// ── Directions ───────────────────────────────────────────────────────────

/// One prioritized gap with the papers worth revisiting for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapDirection {
    /// The under-covered sub-requirement.
    pub sub_requirement_id: String,
    /// Human gap statement given to the oracle as context.
    pub statement: String,
    /// Current completeness (0–100) for prioritization.
    pub completeness_percent: f64,
    /// Papers already contributing below the saturation cap.
    pub papers: Vec<String>,
}

/// The full directions document handed over by the trigger evaluator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeepReviewDirections {
    /// Gaps ordered most-promising first.
    pub gaps: Vec<GapDirection>,
}

impl DeepReviewDirections {
    /// All (gap, paper) pairs in priority order.
    pub fn pairs(&self) -> Vec<(&GapDirection, &str)> {
        self.gaps
            .iter()
            .flat_map(|gap| gap.papers.iter().map(move |p| (gap, p.as_str())))
            .collect()
    }
}

// ── Deep Review Pass ─────────────────────────────────────────────────────

/// Re-read one paper for one gap. Returns only claims that survive
/// deduplication against `existing_claims`; an empty yield is normal
/// and logged.
pub async fn review_gap_pair(
    gateway: &Gateway,
    catalog: &PillarCatalog,
    config: &Config,
    gap: &GapDirection,
    paper: &PaperFile,
    text: &str,
    existing_claims: &[Claim],
) -> Result<ExtractionYield, GatewayError> {
    let system = format!(
        "You are performing a focused second pass over an already-reviewed \
         paper for a systematic literature review. One sub-requirement is \
         under-covered; your task is to find additional, specific evidence \
         for it that the first pass missed. Extract only short claims of \
         one to five sentences, each with its exact verbatim supporting \
         quote. Do not restate evidence already known:\n{}",
        render_known_evidence(gap, existing_claims)
    );
    let gap_context = format!(
        "Coverage gap: {} ({}) is at {:.0}% completeness.\n{}",
        gap.sub_requirement_id,
        catalog
            .get(&gap.sub_requirement_id)
            .map(|s| s.title.as_str())
            .unwrap_or("unknown"),
        gap.completeness_percent,
        gap.statement,
    );

    let paper_id = paper.paper_id.clone();
    let mut yielded = extract_claims(
        gateway,
        catalog,
        config,
        "deep_review",
        "deep_review_claims",
        ClaimSource::DeepReviewer,
        paper,
        text,
        config.deep_reviewer_chunk_size,
        &system,
        |chunk| {
            format!(
                "{}\n\nPaper: {}\nText (chunk {}):\n\n{}",
                gap_context, paper_id, chunk.index, chunk.text
            )
        },
    )
    .await?;

    // Keep only claims for the targeted gap; a focused pass sometimes
    // wanders into neighboring sub-requirements.
    yielded
        .claims
        .retain(|claim| claim.sub_requirement_id == gap.sub_requirement_id);

    // Mandatory dedup against everything already in the store.
    let before = yielded.claims.len();
    yielded.claims = filter_new_against_existing(
        yielded.claims,
        existing_claims,
        config.dedup_similarity,
    );

    if yielded.claims.is_empty() {
        info!(
            paper_id = %paper.paper_id,
            gap = %gap.sub_requirement_id,
            extracted = before,
            "deep review yielded no new unique claims"
        );
    } else {
        info!(
            paper_id = %paper.paper_id,
            gap = %gap.sub_requirement_id,
            new_claims = yielded.claims.len(),
            dropped_duplicates = before - yielded.claims.len(),
            "deep review found additional evidence"
        );
    }
    Ok(yielded)
}

/// Compact listing of known evidence for the gap, so the oracle avoids
/// re-extracting it.
fn render_known_evidence(gap: &GapDirection, existing: &[Claim]) -> String {
    let known: Vec<&Claim> = existing
        .iter()
        .filter(|c| c.sub_requirement_id == gap.sub_requirement_id)
        .collect();
    if known.is_empty() {
        return "(no evidence recorded yet)".to_string();
    }
    let mut out = String::new();
    for claim in known.iter().take(20) {
        out.push_str(&format!("- {}\n", slr_common::util::truncate_chars(&claim.text, 160)));
    }
    if known.len() > 20 {
        warn!(
            gap = %gap.sub_requirement_id,
            known = known.len(),
            "known-evidence listing truncated at 20 entries"
        );
        out.push_str(&format!("… and {} more\n", known.len() - 20));
    }
    out
}
