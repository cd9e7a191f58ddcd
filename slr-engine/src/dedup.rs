//! Claim deduplication.
//!
//! Two claims are duplicates when they share `(paper_id,
//! sub_requirement_id)` and their normalized texts have token-level
//! Jaccard similarity at or above the configured threshold. The
//! earlier-approved claim wins; among unapproved claims the earlier
//! created one wins, with the claim id as the final deterministic
//! tie-break. Losers are marked `superseded` with a link to the
//! survivor. The pass is idempotent: already-superseded claims keep
//! their links and never displace a survivor.

use slr_common::types::{Claim, ClaimStatus};
use slr_common::util::jaccard_similarity;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Outcome of a deduplication pass.
#[derive(Debug, Default)]
pub struct DedupOutcome {
    /// All claims, with losers transitioned to `superseded`.
    pub claims: Vec<Claim>,
    /// Claim ids newly marked superseded in this pass.
    pub newly_superseded: Vec<slr_common::types::ClaimId>,
}

/// Precedence between two duplicate claims: the winner compares `Less`.
fn precedence(a: &Claim, b: &Claim) -> Ordering {
    // Approved beats everything else; earlier approval beats later.
    let a_approved = a.status == ClaimStatus::Approved;
    let b_approved = b.status == ClaimStatus::Approved;
    match (a_approved, b_approved) {
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        (true, true) => {
            let at = a.judge_timestamp.unwrap_or(a.created_at);
            let bt = b.judge_timestamp.unwrap_or(b.created_at);
            if at != bt {
                return at.cmp(&bt);
            }
        }
        (false, false) => {}
    }
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.claim_id.cmp(&b.claim_id))
}

/// Deduplicate a claim set in place.
///
/// Claims already superseded pass through untouched (their supersession
/// links are preserved), which is what makes a second run over the same
/// set a no-op.
pub fn deduplicate(claims: Vec<Claim>, threshold: f64) -> DedupOutcome {
    // Group live claims by (paper, sub-requirement); carry superseded
    // claims straight through.
    let mut outcome = DedupOutcome::default();
    let mut groups: BTreeMap<(String, String), Vec<Claim>> = BTreeMap::new();
    for claim in claims {
        if claim.status == ClaimStatus::Superseded {
            outcome.claims.push(claim);
            continue;
        }
        groups
            .entry((claim.paper_id.clone(), claim.sub_requirement_id.clone()))
            .or_default()
            .push(claim);
    }

    for (_, mut group) in groups {
        group.sort_by(precedence);
        let mut resolved: Vec<Claim> = Vec::with_capacity(group.len());
        for mut claim in group {
            let survivor = resolved.iter().find(|kept| {
                kept.status != ClaimStatus::Superseded
                    && is_duplicate(kept, &claim, threshold)
            });
            if let Some(survivor) = survivor {
                if survivor.claim_id == claim.claim_id {
                    // Identical ids with different surviving text would be
                    // a hash collision; the earlier claim is preferred.
                    warn!(
                        claim_id = %claim.claim_id,
                        "claim id collision during dedup; preferring earlier claim"
                    );
                }
                debug!(
                    loser = %claim.claim_id,
                    survivor = %survivor.claim_id,
                    "duplicate claim superseded"
                );
                claim.superseded_by = Some(survivor.claim_id.clone());
                claim.status = ClaimStatus::Superseded;
                outcome.newly_superseded.push(claim.claim_id.clone());
            }
            resolved.push(claim);
        }
        outcome.claims.append(&mut resolved);
    }

    outcome
}

fn is_duplicate(a: &Claim, b: &Claim, threshold: f64) -> bool {
    if a.claim_id == b.claim_id {
        return true;
    }
    jaccard_similarity(&a.text, &b.text) >= threshold
}

/// Filter newly extracted claims against the existing claim set:
/// returns the claims that are genuinely new. Used by the deep reviewer,
/// where dedup before writing is mandatory.
pub fn filter_new_against_existing(
    new_claims: Vec<Claim>,
    existing: &[Claim],
    threshold: f64,
) -> Vec<Claim> {
    let mut unique = Vec::new();
    for claim in new_claims {
        let duplicate_of_existing = existing.iter().any(|e| {
            e.paper_id == claim.paper_id
                && e.sub_requirement_id == claim.sub_requirement_id
                && e.status != ClaimStatus::Superseded
                && is_duplicate(e, &claim, threshold)
        });
        let duplicate_of_sibling = unique.iter().any(|u: &Claim| {
            u.paper_id == claim.paper_id
                && u.sub_requirement_id == claim.sub_requirement_id
                && is_duplicate(u, &claim, threshold)
        });
        if duplicate_of_existing || duplicate_of_sibling {
            debug!(claim_id = %claim.claim_id, "extracted claim duplicates existing evidence; dropped");
            continue;
        }
        unique.push(claim);
    }
    unique
}
