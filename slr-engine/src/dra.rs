//! Deep requirements analyzer: the appeal stage.
//!
//! Takes the rejected claims from the last judge pass, re-reads the
//! relevant portion of each paper guided by the claim's provenance and
//! the judge's critique, and produces amended claims that address the
//! rejection. Amended claims are brand-new claims (`source = dra`)
//! linked to their rejected ancestor via `prior_rejection_id` and enter
//! the normal judge flow. A claim is appealed at most once: amended
//! claims that get rejected again are final.

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::corpus::PaperFile;
use crate::gateway::{Gateway, GatewayError, TypedPrompt};
use slr_common::chunking::PageMap;
use slr_common::config::Config;
use slr_common::types::{Claim, ClaimSource, ClaimStatus, Provenance};

// ── Oracle Payloads ──────────────────────────────────────────────────────

/// Amended claim produced for one rejection.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AmendedClaimPayload {
    /// Whether an amendment addressing the critique was possible.
    pub amendable: bool,
    /// The amended claim text (when amendable).
    #[serde(default)]
    pub text: Option<String>,
    /// Verbatim supporting quote from the provided excerpt.
    #[serde(default)]
    pub supporting_quote: Option<String>,
}

// ── Appeal Selection ─────────────────────────────────────────────────────

/// Rejected claims eligible for appeal: not produced by a prior appeal,
/// and not already appealed (no existing claim links back to them).
pub fn appealable_claims(rejected: &[Claim], all_claims: &[Claim]) -> Vec<Claim> {
    rejected
        .iter()
        .filter(|claim| claim.source != ClaimSource::Dra)
        .filter(|claim| {
            !all_claims
                .iter()
                .any(|other| other.prior_rejection_id.as_ref() == Some(&claim.claim_id))
        })
        .cloned()
        .collect()
}

// ── Appeal Pass ──────────────────────────────────────────────────────────

/// Outcome of appealing one paper's rejections.
#[derive(Debug, Default)]
pub struct AppealYield {
    /// Amended claims in `pending_judge_review`.
    pub amended: Vec<Claim>,
    /// The originals, transitioned `rejected -> appealed`.
    pub appealed_originals: Vec<Claim>,
}

/// Re-read the relevant portion of `text` for each rejected claim and
/// attempt an amendment addressing the judge's critique.
pub async fn appeal_rejections(
    gateway: &Gateway,
    config: &Config,
    paper: &PaperFile,
    text: &str,
    rejections: &[Claim],
) -> Result<AppealYield, GatewayError> {
    let page_map = PageMap::from_text(text);
    let chars: Vec<char> = text.chars().collect();
    let mut yielded = AppealYield::default();

    for rejected in rejections {
        let excerpt = focused_excerpt(&chars, rejected, config.dra_chunk_size);
        let critique = rejected
            .judge_notes
            .clone()
            .unwrap_or_else(|| "No detailed critique was recorded.".to_string());

        let prompt = TypedPrompt::<AmendedClaimPayload>::new(
            "amend_claim",
            "You are revising a rejected evidence claim from a systematic \
             literature review. Read the judge's critique and the paper \
             excerpt, then produce an amended claim that addresses the \
             critique using only evidence actually present in the excerpt. \
             If the excerpt cannot support a stronger claim, say so rather \
             than overstating.",
            format!(
                "Paper: {}\nSub-requirement: {}\n\nRejected claim:\n{}\n\n\
                 Judge critique:\n{}\n\nPaper excerpt:\n{}",
                paper.paper_id,
                rejected.sub_requirement_id,
                rejected.text,
                critique,
                excerpt.text,
            ),
        );

        let payload = gateway.call("dra", &prompt).await?;
        if !payload.amendable {
            debug!(claim_id = %rejected.claim_id, "no viable amendment; rejection stands");
            continue;
        }
        let Some(amended_text) = payload.text.filter(|t| !t.trim().is_empty()) else {
            debug!(claim_id = %rejected.claim_id, "amendable without text; treated as unamendable");
            continue;
        };

        let quote = payload.supporting_quote.unwrap_or_default();
        let provenance = excerpt.anchor_quote(&quote, &page_map);

        let mut amended = Claim::new(
            rejected.paper_id.clone(),
            rejected.sub_requirement_id.clone(),
            rejected.match_confidence,
            amended_text,
            ClaimSource::Dra,
            provenance,
            Utc::now(),
        );
        amended.prior_rejection_id = Some(rejected.claim_id.clone());
        amended.publication_year = rejected.publication_year.or(paper.publication_year);

        let mut original = rejected.clone();
        original.status = ClaimStatus::Appealed;

        yielded.amended.push(amended);
        yielded.appealed_originals.push(original);
    }

    info!(
        paper_id = %paper.paper_id,
        rejections = rejections.len(),
        amended = yielded.amended.len(),
        "appeal pass complete"
    );
    Ok(yielded)
}

// ── Focused Excerpts ─────────────────────────────────────────────────────

struct FocusedExcerpt {
    text: String,
    char_start: usize,
    char_end: usize,
}

impl FocusedExcerpt {
    /// Anchor a quote inside the excerpt back to original-document
    /// provenance; falls back to the excerpt bounds when the quote is
    /// not found verbatim.
    fn anchor_quote(&self, quote: &str, page_map: &PageMap) -> Provenance {
        let (start, end) = if quote.is_empty() {
            (self.char_start, self.char_end)
        } else {
            match self.text.find(quote) {
                Some(byte_idx) => {
                    let offset = self.text[..byte_idx].chars().count();
                    let start = self.char_start + offset;
                    (start, start + quote.chars().count())
                }
                None => (self.char_start, self.char_end),
            }
        };
        Provenance {
            page_numbers: page_map.pages_for_range(start, end),
            section: None,
            char_start: start,
            char_end: end,
            supporting_quote: quote.to_string(),
            context_before: String::new(),
            context_after: String::new(),
        }
    }
}

/// Window of up to `budget` characters centered on the rejected claim's
/// provenance span.
fn focused_excerpt(chars: &[char], rejected: &Claim, budget: usize) -> FocusedExcerpt {
    let total = chars.len();
    if total == 0 {
        return FocusedExcerpt {
            text: String::new(),
            char_start: 0,
            char_end: 0,
        };
    }
    let center = ((rejected.provenance.char_start + rejected.provenance.char_end) / 2).min(total);
    let half = (budget / 2).max(1);
    let start = center.saturating_sub(half);
    let end = (center + half).min(total);
    FocusedExcerpt {
        text: chars[start..end].iter().collect(),
        char_start: start,
        char_end: end,
    }
}
