//! Judge: multi-dimensional evaluation of pending claims.
//!
//! Pending claims are evaluated in batches. The oracle scores six
//! quality dimensions per claim; the verdict itself is computed here
//! from the composite rule, so approval is deterministic given the
//! scores. Borderline results (composite inside the configured band, or
//! strongly disagreeing dimensions) go through consensus review with an
//! alternate prompt framing; unsettled disagreements hold the claim in
//! its pending state with consensus metadata attached, awaiting a
//! further evaluation or human arbitration.
//!
//! Failure semantics: a batch whose oracle call fails is retried once
//! wholesale; a second failure skips the batch — its claims simply stay
//! pending — and the stage reports failure. Budget back-pressure aborts
//! the stage at a batch boundary.

use chrono::{DateTime, Datelike, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::cancellation::CancellationToken;
use crate::gateway::{Gateway, GatewayError, TypedPrompt};
use slr_common::config::{Config, ConsensusStrategy};
use slr_common::types::{
    Claim, ClaimStatus, ConsensusMetadata, EvidenceConfidence, EvidenceQuality,
};

/// Approval rule constants.
const APPROVAL_COMPOSITE_MIN: f64 = 3.0;
const APPROVAL_STRENGTH_MIN: u8 = 3;
const APPROVAL_RELEVANCE_MIN: u8 = 3;
/// Composite std-dev above which a 2–1 consensus vote is held anyway.
const CONSENSUS_STD_DEV_HOLD: f64 = 0.75;

// ── Oracle Payloads ──────────────────────────────────────────────────────

/// Scores for one claim as returned by the oracle.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ClaimScoresPayload {
    /// The claim id being scored (echoed back).
    pub claim_id: String,
    /// Evidential strength, 1–5.
    pub strength: u8,
    /// Methodological rigor, 1–5.
    pub rigor: u8,
    /// Relevance to the sub-requirement, 1–5.
    pub relevance: u8,
    /// Directness of support, 1–3.
    pub directness: u8,
    /// Whether the source is recent.
    pub is_recent: bool,
    /// Reproducibility, 1–5.
    pub reproducibility: u8,
    /// Study type label: experimental, review, theoretical, or other.
    pub study_type: String,
    /// Assessment confidence: low, medium, or high.
    pub confidence: String,
    /// Short rationale for the scores.
    pub notes: String,
}

/// Batch response shape.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JudgmentResponse {
    pub judgments: Vec<ClaimScoresPayload>,
}

// ── Verdict ──────────────────────────────────────────────────────────────

/// Deterministic verdict from a quality vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Approve,
    Reject,
}

impl Verdict {
    fn label(self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }
}

/// Apply the approval rule to a finalized quality vector.
pub fn verdict_for(quality: &EvidenceQuality) -> Verdict {
    if quality.composite >= APPROVAL_COMPOSITE_MIN
        && quality.strength >= APPROVAL_STRENGTH_MIN
        && quality.relevance >= APPROVAL_RELEVANCE_MIN
    {
        Verdict::Approve
    } else {
        Verdict::Reject
    }
}

// ── Judge Outcome ────────────────────────────────────────────────────────

/// What a judge pass over the pending queue produced.
#[derive(Debug, Default)]
pub struct JudgeOutcome {
    /// Claims with verdicts applied (approved/rejected) or held with
    /// consensus metadata.
    pub judged: Vec<Claim>,
    /// Batches skipped after retry exhaustion.
    pub batches_failed: usize,
    /// Whether the stage stopped early on budget back-pressure.
    pub aborted_by_budget: bool,
    /// Whether the stage stopped early on cooperative cancellation.
    pub cancelled: bool,
}

impl JudgeOutcome {
    pub fn approved_count(&self) -> usize {
        self.judged
            .iter()
            .filter(|c| c.status == ClaimStatus::Approved)
            .count()
    }

    pub fn rejected_count(&self) -> usize {
        self.judged
            .iter()
            .filter(|c| c.status == ClaimStatus::Rejected)
            .count()
    }
}

// ── Judge Pass ───────────────────────────────────────────────────────────

/// Judge all pending claims in batches.
pub async fn judge_pending(
    gateway: &Gateway,
    config: &Config,
    pending: Vec<Claim>,
    now: DateTime<Utc>,
    cancel: &CancellationToken,
) -> JudgeOutcome {
    let mut outcome = JudgeOutcome::default();

    // Claims already holding consensus metadata await arbitration; they
    // are not re-batched.
    let (held, judgeable): (Vec<Claim>, Vec<Claim>) =
        pending.into_iter().partition(|c| c.consensus.is_some());
    if !held.is_empty() {
        debug!(held = held.len(), "claims awaiting arbitration skipped");
    }

    let batch_size = config.claim_batch_size.max(1);
    for batch in judgeable.chunks(batch_size) {
        if cancel.is_cancelled() {
            outcome.cancelled = true;
            break;
        }
        match judge_batch(gateway, config, batch, now).await {
            Ok(mut judged) => outcome.judged.append(&mut judged),
            Err(GatewayError::BackPressure(reason)) => {
                warn!(%reason, "budget back-pressure; judge stage aborting at batch boundary");
                outcome.aborted_by_budget = true;
                break;
            }
            Err(first_err) => {
                warn!(error = %first_err, "judge batch failed; retrying once");
                match judge_batch(gateway, config, batch, now).await {
                    Ok(mut judged) => outcome.judged.append(&mut judged),
                    Err(GatewayError::BackPressure(reason)) => {
                        warn!(%reason, "budget back-pressure on retry; aborting");
                        outcome.aborted_by_budget = true;
                        break;
                    }
                    Err(second_err) => {
                        error!(
                            error = %second_err,
                            claims = batch.len(),
                            "judge batch failed twice; claims remain pending"
                        );
                        outcome.batches_failed += 1;
                    }
                }
            }
        }
    }

    info!(
        judged = outcome.judged.len(),
        approved = outcome.approved_count(),
        rejected = outcome.rejected_count(),
        batches_failed = outcome.batches_failed,
        aborted_by_budget = outcome.aborted_by_budget,
        "judge pass complete"
    );
    outcome
}

/// Judge one batch, including consensus review for borderline claims.
async fn judge_batch(
    gateway: &Gateway,
    config: &Config,
    batch: &[Claim],
    now: DateTime<Utc>,
) -> Result<Vec<Claim>, GatewayError> {
    let prompt = batch_prompt(batch, PromptFraming::Primary);
    let response = gateway.call("judge", &prompt).await?;

    let mut judged = Vec::new();
    for claim in batch {
        let Some(payload) = response
            .judgments
            .iter()
            .find(|j| j.claim_id == claim.claim_id.as_str())
        else {
            warn!(claim_id = %claim.claim_id, "no judgment returned for claim; stays pending");
            continue;
        };

        let quality = quality_from_payload(payload, claim, config);
        let verdict = verdict_for(&quality);

        if needs_consensus(&quality, config) {
            let claim = consensus_review(gateway, config, claim, quality, verdict, now).await?;
            judged.push(claim);
        } else {
            judged.push(apply_verdict(claim, quality, verdict, payload.notes.clone(), now));
        }
    }
    Ok(judged)
}

/// Build a finalized quality vector from oracle scores, clamping each
/// dimension to its scale and overriding `is_recent` from paper
/// metadata when available.
fn quality_from_payload(
    payload: &ClaimScoresPayload,
    claim: &Claim,
    config: &Config,
) -> EvidenceQuality {
    let is_recent = match claim.publication_year {
        Some(year) => year >= Utc::now().year() - config.recency_window_years,
        None => payload.is_recent,
    };
    let mut quality = EvidenceQuality {
        strength: payload.strength.clamp(1, 5),
        rigor: payload.rigor.clamp(1, 5),
        relevance: payload.relevance.clamp(1, 5),
        directness: payload.directness.clamp(1, 3),
        is_recent,
        reproducibility: payload.reproducibility.clamp(1, 5),
        study_type: payload.study_type.clone(),
        composite: 0.0,
        confidence: parse_confidence(&payload.confidence),
    };
    quality.finalize();
    quality
}

fn parse_confidence(raw: &str) -> EvidenceConfidence {
    match raw.to_ascii_lowercase().as_str() {
        "low" => EvidenceConfidence::Low,
        "high" => EvidenceConfidence::High,
        _ => EvidenceConfidence::Medium,
    }
}

/// Whether a result falls in the consensus-review band.
fn needs_consensus(quality: &EvidenceQuality, config: &Config) -> bool {
    let (low, high) = config.consensus_review_threshold;
    (quality.composite >= low && quality.composite <= high) || quality.dimensions_disagree()
}

fn apply_verdict(
    claim: &Claim,
    quality: EvidenceQuality,
    verdict: Verdict,
    notes: String,
    now: DateTime<Utc>,
) -> Claim {
    let mut updated = claim.clone();
    updated.status = match verdict {
        Verdict::Approve => ClaimStatus::Approved,
        Verdict::Reject => ClaimStatus::Rejected,
    };
    updated.evidence_quality = Some(quality);
    updated.judge_notes = Some(notes);
    updated.judge_timestamp = Some(now);
    updated
}

// ── Consensus Review ─────────────────────────────────────────────────────

/// Re-evaluate a borderline claim per the configured strategy.
async fn consensus_review(
    gateway: &Gateway,
    config: &Config,
    claim: &Claim,
    first_quality: EvidenceQuality,
    first_verdict: Verdict,
    now: DateTime<Utc>,
) -> Result<Claim, GatewayError> {
    match config.consensus_strategy {
        ConsensusStrategy::SingleReeval => {
            let (second_quality, second_verdict) =
                reevaluate(gateway, config, claim, PromptFraming::Skeptical).await?;
            if second_verdict == first_verdict {
                debug!(claim_id = %claim.claim_id, verdict = first_verdict.label(), "consensus re-evaluation agreed");
                return Ok(apply_verdict(
                    claim,
                    first_quality,
                    first_verdict,
                    "confirmed by consensus re-evaluation".to_string(),
                    now,
                ));
            }
            let composites = [first_quality.composite, second_quality.composite];
            let metadata = ConsensusMetadata {
                agreement_rate: 0.5,
                vote_breakdown: vec![
                    first_verdict.label().to_string(),
                    second_verdict.label().to_string(),
                ],
                std_dev: std_dev(&composites),
            };
            info!(
                claim_id = %claim.claim_id,
                "consensus re-evaluation disagreed; claim held for arbitration"
            );
            let mut held = claim.clone();
            held.consensus = Some(metadata);
            held.evidence_quality = Some(first_quality);
            Ok(held)
        }
        ConsensusStrategy::MultiVote3 => {
            let (second_quality, second_verdict) =
                reevaluate(gateway, config, claim, PromptFraming::Skeptical).await?;
            let (third_quality, third_verdict) =
                reevaluate(gateway, config, claim, PromptFraming::Charitable).await?;

            let votes = [first_verdict, second_verdict, third_verdict];
            let approvals = votes.iter().filter(|v| **v == Verdict::Approve).count();
            let majority = if approvals >= 2 {
                Verdict::Approve
            } else {
                Verdict::Reject
            };
            let agreement = votes.iter().filter(|v| **v == majority).count() as f64 / 3.0;
            let composites = [
                first_quality.composite,
                second_quality.composite,
                third_quality.composite,
            ];
            let deviation = std_dev(&composites);

            if agreement < 1.0 && deviation > CONSENSUS_STD_DEV_HOLD {
                let metadata = ConsensusMetadata {
                    agreement_rate: agreement,
                    vote_breakdown: votes.iter().map(|v| v.label().to_string()).collect(),
                    std_dev: deviation,
                };
                info!(
                    claim_id = %claim.claim_id,
                    agreement_rate = agreement,
                    std_dev = deviation,
                    "split vote with high variance; claim held for arbitration"
                );
                let mut held = claim.clone();
                held.consensus = Some(metadata);
                held.evidence_quality = Some(first_quality);
                return Ok(held);
            }

            // Adopt the scores of the first evaluation agreeing with the
            // majority.
            let quality = [
                (first_verdict, first_quality),
                (second_verdict, second_quality),
                (third_verdict, third_quality),
            ]
            .into_iter()
            .find(|(v, _)| *v == majority)
            .map(|(_, q)| q)
            .expect("majority verdict has at least two voters");
            Ok(apply_verdict(
                claim,
                quality,
                majority,
                format!("majority verdict ({}/3)", (agreement * 3.0).round() as u32),
                now,
            ))
        }
    }
}

/// One consensus re-evaluation call for a single claim.
async fn reevaluate(
    gateway: &Gateway,
    config: &Config,
    claim: &Claim,
    framing: PromptFraming,
) -> Result<(EvidenceQuality, Verdict), GatewayError> {
    let prompt = batch_prompt(std::slice::from_ref(claim), framing);
    let response = gateway.call("judge", &prompt).await?;
    let payload = response
        .judgments
        .iter()
        .find(|j| j.claim_id == claim.claim_id.as_str())
        .cloned()
        .ok_or_else(|| GatewayError::SchemaInvalid {
            task: prompt.task.clone(),
            message: format!("re-evaluation omitted claim {}", claim.claim_id),
        })?;
    let quality = quality_from_payload(&payload, claim, config);
    let verdict = verdict_for(&quality);
    Ok((quality, verdict))
}

fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

// ── Prompts ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PromptFraming {
    Primary,
    Skeptical,
    Charitable,
}

impl PromptFraming {
    fn task(self) -> &'static str {
        match self {
            Self::Primary => "judge_claims",
            Self::Skeptical => "judge_claims_skeptical",
            Self::Charitable => "judge_claims_charitable",
        }
    }

    fn system(self) -> &'static str {
        match self {
            Self::Primary => {
                "You are an evidence judge for a systematic literature review. \
                 Score each claim on six dimensions: strength (1-5), rigor (1-5), \
                 relevance to its sub-requirement (1-5), directness (1-3), \
                 is_recent, and reproducibility (1-5). Also classify the study \
                 type (experimental, review, theoretical, or other) and state \
                 your confidence. Score strictly from the supporting quote and \
                 context; do not reward rhetorical confidence."
            }
            Self::Skeptical => {
                "You are a skeptical methodological reviewer re-examining a \
                 borderline evidence claim. Actively look for weaknesses: \
                 overgeneralization, missing baselines, unclear measurement, \
                 unsupported causal language. Score the same six dimensions \
                 (strength, rigor, relevance, directness, is_recent, \
                 reproducibility), classify the study type, and state your \
                 confidence."
            }
            Self::Charitable => {
                "You are a domain expert re-examining a borderline evidence \
                 claim with attention to what the authors did demonstrate. \
                 Credit concrete results even when narrowly scoped. Score the \
                 same six dimensions (strength, rigor, relevance, directness, \
                 is_recent, reproducibility), classify the study type, and \
                 state your confidence."
            }
        }
    }
}

fn batch_prompt(batch: &[Claim], framing: PromptFraming) -> TypedPrompt<JudgmentResponse> {
    let mut user = String::from("Evaluate the following claims. Echo each claim_id exactly.\n");
    for claim in batch {
        user.push_str(&format!(
            "\nclaim_id: {}\nsub_requirement: {}\nclaim: {}\nsupporting_quote: {}\ncontext: …{}…\n",
            claim.claim_id,
            claim.sub_requirement_id,
            claim.text,
            claim.provenance.supporting_quote,
            claim.provenance.context_after,
        ));
    }
    TypedPrompt::new(framing.task(), framing.system(), user)
}
