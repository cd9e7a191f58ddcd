//! Core data model: claims, evidence quality, provenance, and the
//! append-only per-paper version history.
//!
//! A [`Claim`] is the atomic unit of evidence extracted from a paper and
//! mapped to one sub-requirement of the pillar taxonomy. Claims move
//! through a small state machine ([`ClaimStatus`]); every mutation of a
//! paper's claim set is recorded as a new [`PaperVersion`] — versions are
//! never rewritten in place.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::util::normalize_for_identity;

// ── Claim Identity ───────────────────────────────────────────────────────

/// Deterministic content-hash identifier for a claim.
///
/// Derived from `(paper_id, sub_requirement_id, normalized_text)` so that
/// replaying the pipeline on identical inputs reproduces identical ids.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(transparent)]
pub struct ClaimId(String);

impl ClaimId {
    /// Compute the claim id for the given identity triple.
    ///
    /// The text is normalized (lowercased, whitespace-collapsed,
    /// punctuation-stripped) before hashing so trivial formatting
    /// differences do not mint new identities.
    pub fn compute(paper_id: &str, sub_requirement_id: &str, text: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(paper_id.as_bytes());
        hasher.update(&[0x1f]);
        hasher.update(sub_requirement_id.as_bytes());
        hasher.update(&[0x1f]);
        hasher.update(normalize_for_identity(text).as_bytes());
        let hash = hasher.finalize();
        Self(hash.to_hex().as_str()[..32].to_string())
    }

    /// Wrap an already-computed id (e.g. read back from disk).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClaimId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Claim Status State Machine ───────────────────────────────────────────

/// Lifecycle status of a claim.
///
/// Terminal statuses are `Approved`, `Rejected` (without appeal), and
/// `Superseded`. `Appealed` marks a rejected claim whose critique has been
/// taken up by the deep requirements analyzer; the amended claim is a new
/// claim linked back via `prior_rejection_id`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    /// Created by an analyzer, awaiting a judge verdict.
    PendingJudgeReview,
    /// Judge approved the claim; it counts toward coverage.
    Approved,
    /// Judge rejected the claim.
    Rejected,
    /// Rejected claim whose rejection has been appealed.
    Appealed,
    /// Displaced by a duplicate that won deduplication.
    Superseded,
}

impl ClaimStatus {
    /// Whether a transition from `self` to `to` is legal.
    ///
    /// Deduplication may supersede a claim in any non-terminal state;
    /// everything else follows the judge/appeal flow.
    pub fn can_transition_to(self, to: ClaimStatus) -> bool {
        use ClaimStatus::*;
        match (self, to) {
            (PendingJudgeReview, Approved)
            | (PendingJudgeReview, Rejected)
            | (Rejected, Appealed) => true,
            (PendingJudgeReview, Superseded)
            | (Approved, Superseded)
            | (Rejected, Superseded)
            | (Appealed, Superseded) => true,
            _ => false,
        }
    }

    /// Whether the status is terminal (no further transitions except
    /// supersession).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ClaimStatus::Approved | ClaimStatus::Rejected | ClaimStatus::Superseded
        )
    }
}

impl fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PendingJudgeReview => write!(f, "pending_judge_review"),
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
            Self::Appealed => write!(f, "appealed"),
            Self::Superseded => write!(f, "superseded"),
        }
    }
}

// ── Claim Source ─────────────────────────────────────────────────────────

/// Which analyzer produced a claim.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ClaimSource {
    /// First-pass extraction over the full paper.
    JournalReviewer,
    /// Appeal-stage amendment of a rejected claim.
    Dra,
    /// Gap-targeted re-analysis of an already-ingested paper.
    DeepReviewer,
}

impl fmt::Display for ClaimSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::JournalReviewer => write!(f, "journal_reviewer"),
            Self::Dra => write!(f, "dra"),
            Self::DeepReviewer => write!(f, "deep_reviewer"),
        }
    }
}

// ── Provenance ───────────────────────────────────────────────────────────

/// Positional attribution of a claim within its source document.
///
/// Character offsets always reference the *original* document, even when
/// the claim was extracted from an overlapping chunk.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct Provenance {
    /// 1-based page numbers the supporting text spans.
    pub page_numbers: Vec<u32>,
    /// Section heading the text falls under, when detectable.
    pub section: Option<String>,
    /// Character offset of the supporting span in the original document.
    pub char_start: usize,
    /// Exclusive end offset of the supporting span.
    pub char_end: usize,
    /// Verbatim supporting quote.
    pub supporting_quote: String,
    /// Up to a few hundred characters preceding the quote.
    pub context_before: String,
    /// Up to a few hundred characters following the quote.
    pub context_after: String,
}

// ── Evidence Quality ─────────────────────────────────────────────────────

/// Judge confidence bucket for an evidence assessment.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceConfidence {
    Low,
    Medium,
    High,
}

impl fmt::Display for EvidenceConfidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Composite weight applied to the strength dimension.
pub const WEIGHT_STRENGTH: f64 = 0.30;
/// Composite weight applied to the rigor dimension.
pub const WEIGHT_RIGOR: f64 = 0.25;
/// Composite weight applied to the relevance dimension.
pub const WEIGHT_RELEVANCE: f64 = 0.25;
/// Composite weight applied to directness (normalized to its 1–3 scale).
pub const WEIGHT_DIRECTNESS: f64 = 0.10;
/// Composite weight applied to the recency flag.
pub const WEIGHT_RECENT: f64 = 0.05;
/// Composite weight applied to the reproducibility dimension.
pub const WEIGHT_REPRODUCIBILITY: f64 = 0.05;

/// Six-dimension quality vector produced by the judge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EvidenceQuality {
    /// Evidential strength, 1–5.
    pub strength: u8,
    /// Methodological rigor, 1–5.
    pub rigor: u8,
    /// Relevance to the mapped sub-requirement, 1–5.
    pub relevance: u8,
    /// Directness of support, 1–3.
    pub directness: u8,
    /// Whether the source falls inside the configured recency window.
    pub is_recent: bool,
    /// Reproducibility of the reported result, 1–5.
    pub reproducibility: u8,
    /// Free-form study type label (e.g. "experimental", "review").
    pub study_type: String,
    /// Weighted composite score; drives approval.
    pub composite: f64,
    /// Judge confidence in the assessment.
    pub confidence: EvidenceConfidence,
}

impl EvidenceQuality {
    /// Compute the weighted composite from the dimensional scores.
    ///
    /// `composite = 0.30·strength + 0.25·rigor + 0.25·relevance
    ///  + 0.10·(directness/3) + 0.05·recent + 0.05·reproducibility`
    pub fn compute_composite(&self) -> f64 {
        WEIGHT_STRENGTH * f64::from(self.strength)
            + WEIGHT_RIGOR * f64::from(self.rigor)
            + WEIGHT_RELEVANCE * f64::from(self.relevance)
            + WEIGHT_DIRECTNESS * (f64::from(self.directness) / 3.0)
            + WEIGHT_RECENT * if self.is_recent { 1.0 } else { 0.0 }
            + WEIGHT_REPRODUCIBILITY * f64::from(self.reproducibility)
    }

    /// Recompute and store the composite, returning the updated value.
    pub fn finalize(&mut self) -> f64 {
        self.composite = self.compute_composite();
        self.composite
    }

    /// Whether the dimensional scores disagree significantly (used for
    /// consensus-review routing). Measured as the population standard
    /// deviation of the three 1–5 dimensions exceeding 1.5.
    pub fn dimensions_disagree(&self) -> bool {
        let dims = [
            f64::from(self.strength),
            f64::from(self.rigor),
            f64::from(self.relevance),
        ];
        let mean = dims.iter().sum::<f64>() / dims.len() as f64;
        let var = dims.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / dims.len() as f64;
        var.sqrt() > 1.5
    }
}

// ── Consensus Metadata ───────────────────────────────────────────────────

/// Metadata recorded when consensus review could not settle a verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConsensusMetadata {
    /// Fraction of evaluations agreeing with the majority verdict.
    pub agreement_rate: f64,
    /// Verdict label per evaluation, in evaluation order.
    pub vote_breakdown: Vec<String>,
    /// Standard deviation of composite scores across evaluations.
    pub std_dev: f64,
}

// ── Claim ────────────────────────────────────────────────────────────────

/// Atomic unit of evidence mapped to one sub-requirement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Claim {
    /// Deterministic content-hash identity.
    pub claim_id: ClaimId,
    /// Source paper filename (stable paper identifier).
    pub paper_id: String,
    /// Resolved sub-requirement identifier.
    pub sub_requirement_id: String,
    /// Fuzzy-match confidence of the sub-requirement resolution (0–1).
    pub match_confidence: f64,
    /// Verbatim or near-verbatim excerpt.
    pub text: String,
    /// Current lifecycle status.
    pub status: ClaimStatus,
    /// Which analyzer produced the claim.
    pub source: ClaimSource,
    /// Positional attribution.
    pub provenance: Provenance,
    /// Quality vector; populated by the judge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_quality: Option<EvidenceQuality>,
    /// Judge rationale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_notes: Option<String>,
    /// When the judge last evaluated the claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_timestamp: Option<DateTime<Utc>>,
    /// For DRA amendments: the rejected ancestor claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_rejection_id: Option<ClaimId>,
    /// For superseded claims: the surviving duplicate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<ClaimId>,
    /// Unsettled consensus-review evidence, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus: Option<ConsensusMetadata>,
    /// Publication year of the source paper, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publication_year: Option<i32>,
    /// When the claim was first created.
    pub created_at: DateTime<Utc>,
}

impl Claim {
    /// Construct a freshly extracted claim in `pending_judge_review`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        paper_id: impl Into<String>,
        sub_requirement_id: impl Into<String>,
        match_confidence: f64,
        text: impl Into<String>,
        source: ClaimSource,
        provenance: Provenance,
        now: DateTime<Utc>,
    ) -> Self {
        let paper_id = paper_id.into();
        let sub_requirement_id = sub_requirement_id.into();
        let text = text.into();
        let claim_id = ClaimId::compute(&paper_id, &sub_requirement_id, &text);
        Self {
            claim_id,
            paper_id,
            sub_requirement_id,
            match_confidence,
            text,
            status: ClaimStatus::PendingJudgeReview,
            source,
            provenance,
            evidence_quality: None,
            judge_notes: None,
            judge_timestamp: None,
            prior_rejection_id: None,
            superseded_by: None,
            consensus: None,
            publication_year: None,
            created_at: now,
        }
    }

    /// Whether this claim counts toward coverage.
    pub fn is_approved(&self) -> bool {
        self.status == ClaimStatus::Approved
    }
}

// ── Version History ──────────────────────────────────────────────────────

/// What kind of change a version records.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    /// First extraction pass for the paper.
    Initial,
    /// Judge verdicts applied.
    JudgeUpdate,
    /// Appeal claims produced by the deep requirements analyzer.
    DraAppeal,
    /// Additional claims from a gap-targeted deep review.
    DeepReviewUpdate,
}

impl fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initial => write!(f, "initial"),
            Self::JudgeUpdate => write!(f, "judge_update"),
            Self::DraAppeal => write!(f, "dra_appeal"),
            Self::DeepReviewUpdate => write!(f, "deep_review_update"),
        }
    }
}

/// Change descriptor attached to a version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionChange {
    /// Kind of change.
    pub status: ChangeStatus,
    /// Claims touched by this version.
    pub claim_ids: Vec<ClaimId>,
    /// Optional human-readable note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// The claim set recorded in one version, grouped by sub-requirement.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PaperReview {
    /// Paper filename.
    pub paper_id: String,
    /// Claims grouped by sub-requirement identifier. A `BTreeMap` keeps
    /// the serialized key order stable across saves.
    pub requirements: BTreeMap<String, Vec<Claim>>,
}

impl PaperReview {
    /// Iterate over all claims in the review.
    pub fn claims(&self) -> impl Iterator<Item = &Claim> {
        self.requirements.values().flatten()
    }

    /// Total number of claims across sub-requirements.
    pub fn claim_count(&self) -> usize {
        self.requirements.values().map(Vec::len).sum()
    }

    /// Insert a claim under its sub-requirement.
    pub fn insert(&mut self, claim: Claim) {
        self.requirements
            .entry(claim.sub_requirement_id.clone())
            .or_default()
            .push(claim);
    }
}

/// One immutable entry in a paper's version list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperVersion {
    /// Monotonically increasing version number (1-based).
    pub version: u32,
    /// When the version was written.
    pub timestamp: DateTime<Utc>,
    /// The full claim set as of this version.
    pub review: PaperReview,
    /// What changed relative to the previous version.
    pub changes: VersionChange,
}

/// The complete append-only history: paper filename → ordered versions.
///
/// This is the single source of truth. All derived artifacts (CSV
/// database, gap reports) must be reconstructible from it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionHistory {
    pub papers: BTreeMap<String, Vec<PaperVersion>>,
}

impl VersionHistory {
    /// Number of papers with at least one version.
    pub fn paper_count(&self) -> usize {
        self.papers.len()
    }

    /// Latest version for a paper, if any.
    pub fn latest_version(&self, paper_id: &str) -> Option<&PaperVersion> {
        self.papers.get(paper_id).and_then(|vs| vs.last())
    }

    /// Current claim set for a paper: union across all versions with
    /// latest-wins per claim id.
    pub fn current_claims(&self, paper_id: &str) -> Vec<Claim> {
        let mut merged: BTreeMap<ClaimId, Claim> = BTreeMap::new();
        if let Some(versions) = self.papers.get(paper_id) {
            for version in versions {
                for claim in version.review.claims() {
                    merged.insert(claim.claim_id.clone(), claim.clone());
                }
            }
        }
        merged.into_values().collect()
    }

    /// Current claims across every paper.
    pub fn all_current_claims(&self) -> Vec<Claim> {
        self.papers
            .keys()
            .flat_map(|paper_id| self.current_claims(paper_id))
            .collect()
    }

    /// Verify version-number monotonicity and timestamp ordering for every
    /// paper. Returns the first violation found.
    pub fn check_monotonic(&self) -> Result<(), String> {
        for (paper_id, versions) in &self.papers {
            for pair in versions.windows(2) {
                if pair[1].version <= pair[0].version {
                    return Err(format!(
                        "paper {}: version {} does not exceed {}",
                        paper_id, pair[1].version, pair[0].version
                    ));
                }
                if pair[1].timestamp < pair[0].timestamp {
                    return Err(format!(
                        "paper {}: timestamp regressed at version {}",
                        paper_id, pair[1].version
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provenance() -> Provenance {
        Provenance {
            page_numbers: vec![3],
            section: Some("Results".to_string()),
            char_start: 120,
            char_end: 180,
            supporting_quote: "X achieves Y at Z=0.9".to_string(),
            context_before: "We evaluated X.".to_string(),
            context_after: "This exceeds the baseline.".to_string(),
        }
    }

    #[test]
    fn claim_id_is_deterministic() {
        let a = ClaimId::compute("paper_a.pdf", "Sub-1.1.1", "X achieves Y at Z=0.9");
        let b = ClaimId::compute("paper_a.pdf", "Sub-1.1.1", "X achieves Y at Z=0.9");
        assert_eq!(a, b);
    }

    #[test]
    fn claim_id_normalizes_formatting() {
        let a = ClaimId::compute("p.pdf", "Sub-1.1.1", "X achieves  Y\n at Z=0.9");
        let b = ClaimId::compute("p.pdf", "Sub-1.1.1", "x achieves y at z=0.9");
        assert_eq!(a, b);
    }

    #[test]
    fn claim_id_differs_across_papers() {
        let a = ClaimId::compute("paper_a.pdf", "Sub-1.1.1", "same text");
        let b = ClaimId::compute("paper_b.pdf", "Sub-1.1.1", "same text");
        assert_ne!(a, b);
    }

    #[test]
    fn status_transitions_follow_state_machine() {
        use ClaimStatus::*;
        assert!(PendingJudgeReview.can_transition_to(Approved));
        assert!(PendingJudgeReview.can_transition_to(Rejected));
        assert!(Rejected.can_transition_to(Appealed));
        assert!(Approved.can_transition_to(Superseded));
        assert!(!Approved.can_transition_to(Rejected));
        assert!(!Rejected.can_transition_to(Approved));
        assert!(!Superseded.can_transition_to(Approved));
        assert!(!Appealed.can_transition_to(Rejected));
    }

    #[test]
    fn composite_matches_worked_example() {
        // strength 4, rigor 3, relevance 4, directness 2, recent, repro 3
        let mut q = EvidenceQuality {
            strength: 4,
            rigor: 3,
            relevance: 4,
            directness: 2,
            is_recent: true,
            reproducibility: 3,
            study_type: "experimental".to_string(),
            composite: 0.0,
            confidence: EvidenceConfidence::Medium,
        };
        let composite = q.finalize();
        assert!((composite - 3.216_666_6).abs() < 1e-6);
    }

    #[test]
    fn quality_round_trips_through_json() {
        let mut q = EvidenceQuality {
            strength: 5,
            rigor: 4,
            relevance: 5,
            directness: 3,
            is_recent: false,
            reproducibility: 2,
            study_type: "review".to_string(),
            composite: 0.0,
            confidence: EvidenceConfidence::High,
        };
        q.finalize();
        let json = serde_json::to_string(&q).unwrap();
        let back: EvidenceQuality = serde_json::from_str(&json).unwrap();
        assert_eq!(q, back);
    }

    #[test]
    fn current_claims_latest_wins() {
        let now = Utc::now();
        let mut claim = Claim::new(
            "paper_a.pdf",
            "Sub-1.1.1",
            0.95,
            "X achieves Y at Z=0.9",
            ClaimSource::JournalReviewer,
            provenance(),
            now,
        );

        let mut v1_review = PaperReview {
            paper_id: "paper_a.pdf".to_string(),
            requirements: BTreeMap::new(),
        };
        v1_review.insert(claim.clone());

        claim.status = ClaimStatus::Approved;
        let mut v2_review = PaperReview {
            paper_id: "paper_a.pdf".to_string(),
            requirements: BTreeMap::new(),
        };
        v2_review.insert(claim.clone());

        let mut history = VersionHistory::default();
        history.papers.insert(
            "paper_a.pdf".to_string(),
            vec![
                PaperVersion {
                    version: 1,
                    timestamp: now,
                    review: v1_review,
                    changes: VersionChange {
                        status: ChangeStatus::Initial,
                        claim_ids: vec![claim.claim_id.clone()],
                        notes: None,
                    },
                },
                PaperVersion {
                    version: 2,
                    timestamp: now,
                    review: v2_review,
                    changes: VersionChange {
                        status: ChangeStatus::JudgeUpdate,
                        claim_ids: vec![claim.claim_id.clone()],
                        notes: None,
                    },
                },
            ],
        );

        let current = history.current_claims("paper_a.pdf");
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].status, ClaimStatus::Approved);
        history.check_monotonic().unwrap();
    }

    #[test]
    fn monotonicity_violation_detected() {
        let now = Utc::now();
        let review = PaperReview {
            paper_id: "p.pdf".to_string(),
            requirements: BTreeMap::new(),
        };
        let version = |n: u32| PaperVersion {
            version: n,
            timestamp: now,
            review: review.clone(),
            changes: VersionChange {
                status: ChangeStatus::Initial,
                claim_ids: vec![],
                notes: None,
            },
        };
        let mut history = VersionHistory::default();
        history
            .papers
            .insert("p.pdf".to_string(), vec![version(2), version(2)]);
        assert!(history.check_monotonic().is_err());
    }
}
