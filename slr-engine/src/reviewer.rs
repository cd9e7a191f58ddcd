//! Shared claim-extraction machinery and the journal reviewer.
//!
//! The three analyzers that create claims (journal reviewer, deep
//! requirements analyzer, deep reviewer) share one capability set:
//! chunk the document, ask the oracle for claims under task-specific
//! guidance, resolve each claim's sub-requirement against the catalog,
//! attach provenance anchored in the original document, and merge
//! duplicates produced across overlapping chunks. They differ only in
//! the guidance they inject — the pillar catalog here, the rejection
//! rationale in the DRA, the gap directions in the deep reviewer.

use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::corpus::PaperFile;
use crate::dedup::filter_new_against_existing;
use crate::gateway::{Gateway, GatewayError, TypedPrompt};
use crate::quarantine::QuarantinedClaim;
use slr_common::catalog::{CatalogError, PillarCatalog};
use slr_common::chunking::{chunk_document, DocumentChunk, PageMap};
use slr_common::config::Config;
use slr_common::types::{Claim, ClaimSource, Provenance};

/// Characters of context captured on each side of a supporting quote.
const CONTEXT_CHARS: usize = 200;

// ── Oracle Payloads ──────────────────────────────────────────────────────

/// One claim as returned by the oracle.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedClaimPayload {
    /// Sub-requirement identifier or title the claim supports.
    pub sub_requirement: String,
    /// The atomic claim, one to five sentences.
    pub text: String,
    /// Verbatim quote from the provided text supporting the claim.
    pub supporting_quote: String,
    /// Section heading the quote falls under, when identifiable.
    #[serde(default)]
    pub section: Option<String>,
}

/// Response shape for every extraction task.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExtractionResponse {
    pub claims: Vec<ExtractedClaimPayload>,
}

// ── Extraction Yield ─────────────────────────────────────────────────────

/// What one extraction pass over one paper produced.
#[derive(Debug, Default)]
pub struct ExtractionYield {
    /// Resolved claims in `pending_judge_review`.
    pub claims: Vec<Claim>,
    /// Claims whose sub-requirement fell below the match threshold.
    pub quarantined: Vec<QuarantinedClaim>,
}

// ── Shared Extraction ────────────────────────────────────────────────────

/// Run one extraction task over a full document: chunk, call the oracle
/// per chunk, resolve and anchor each claim, and merge cross-chunk
/// duplicates.
#[allow(clippy::too_many_arguments)]
pub async fn extract_claims(
    gateway: &Gateway,
    catalog: &PillarCatalog,
    config: &Config,
    stage: &str,
    task: &str,
    source: ClaimSource,
    paper: &PaperFile,
    text: &str,
    chunk_size: usize,
    system: &str,
    guidance: impl Fn(&DocumentChunk) -> String,
) -> Result<ExtractionYield, GatewayError> {
    let chunks = chunk_document(text, chunk_size, config.chunk_overlap);
    let page_map = PageMap::from_text(text);
    let mut yielded = ExtractionYield::default();

    // Chunk calls run with bounded concurrency; `buffered` keeps chunk
    // order, so claims land in document order regardless of completion
    // order.
    let concurrency = config.llm.max_concurrency.max(1);
    let responses: Vec<ExtractionResponse> = stream::iter(chunks.iter().map(|chunk| {
        let prompt = TypedPrompt::<ExtractionResponse>::new(
            task.to_string(),
            system.to_string(),
            guidance(chunk),
        );
        async move { gateway.call(stage, &prompt).await }
    }))
    .buffered(concurrency)
    .try_collect()
    .await?;

    for (chunk, response) in chunks.iter().zip(responses) {
        debug!(
            paper_id = %paper.paper_id,
            chunk = chunk.index,
            claims = response.claims.len(),
            "chunk extracted"
        );

        for payload in response.claims {
            match catalog.resolve(&payload.sub_requirement, config.match_confidence_threshold) {
                Ok((sub, confidence)) => {
                    let provenance = anchor_provenance(&payload, chunk, text, &page_map);
                    let mut claim = Claim::new(
                        paper.paper_id.clone(),
                        sub.id.clone(),
                        confidence,
                        payload.text,
                        source,
                        provenance,
                        Utc::now(),
                    );
                    claim.publication_year = paper.publication_year;
                    yielded.claims.push(claim);
                }
                Err(CatalogError::UnresolvedSubRequirement {
                    query,
                    candidate,
                    confidence,
                    threshold,
                }) => {
                    let provenance = anchor_provenance(&payload, chunk, text, &page_map);
                    yielded.quarantined.push(QuarantinedClaim {
                        paper_id: paper.paper_id.clone(),
                        query,
                        best_candidate: candidate,
                        confidence,
                        threshold,
                        text: payload.text,
                        provenance,
                        source,
                        created_at: Utc::now(),
                    });
                }
                Err(err) => {
                    warn!(
                        paper_id = %paper.paper_id,
                        error = %err,
                        "catalog resolution failed unexpectedly; claim dropped"
                    );
                }
            }
        }
    }

    // Overlapping chunks re-surface the same evidence; merge before the
    // claims ever reach the store.
    if config.deduplication_enabled {
        yielded.claims =
            filter_new_against_existing(yielded.claims, &[], config.dedup_similarity);
    }

    Ok(yielded)
}

/// Anchor a payload's supporting quote in the original document:
/// absolute char offsets, surrounding context, and page numbers.
fn anchor_provenance(
    payload: &ExtractedClaimPayload,
    chunk: &DocumentChunk,
    full_text: &str,
    page_map: &PageMap,
) -> Provenance {
    let chars: Vec<char> = full_text.chars().collect();

    let (abs_start, abs_end) = match find_char_offset(&chunk.text, &payload.supporting_quote) {
        Some((start, len)) => (chunk.char_start + start, chunk.char_start + start + len),
        // Quote not found verbatim (oracle paraphrased); fall back to
        // the chunk bounds so provenance stays truthful about locality.
        None => (chunk.char_start, chunk.char_end),
    };

    let ctx_start = abs_start.saturating_sub(CONTEXT_CHARS);
    let ctx_end = (abs_end + CONTEXT_CHARS).min(chars.len());
    let context_before: String = chars[ctx_start..abs_start.min(chars.len())].iter().collect();
    let context_after: String = chars[abs_end.min(chars.len())..ctx_end].iter().collect();

    Provenance {
        page_numbers: page_map.pages_for_range(abs_start, abs_end),
        section: payload.section.clone(),
        char_start: abs_start,
        char_end: abs_end,
        supporting_quote: payload.supporting_quote.clone(),
        context_before,
        context_after,
    }
}

/// Find `needle` in `haystack`, returning (char offset, char length).
fn find_char_offset(haystack: &str, needle: &str) -> Option<(usize, usize)> {
    if needle.is_empty() {
        return None;
    }
    let byte_idx = haystack.find(needle)?;
    let char_start = haystack[..byte_idx].chars().count();
    Some((char_start, needle.chars().count()))
}

// ── Journal Reviewer ─────────────────────────────────────────────────────

/// System context for the first-pass extraction.
fn journal_system(catalog: &PillarCatalog) -> String {
    format!(
        "You are a systematic literature reviewer. Extract atomic, \
         evidence-bearing claims from research paper text and map each \
         one to a sub-requirement of the evaluation taxonomy below. \
         Favor breadth: attempt at least one claim for every pillar the \
         paper plausibly covers before going deep on any single one. \
         Each claim must quote the supporting passage verbatim.\n\n\
         Taxonomy:\n{}",
        render_catalog_guidance(catalog)
    )
}

/// Compact taxonomy rendering injected into extraction prompts.
pub fn render_catalog_guidance(catalog: &PillarCatalog) -> String {
    let mut out = String::new();
    for (pillar_id, pillar) in catalog.pillars() {
        out.push_str(&format!("{} — {}\n", pillar_id, pillar.title));
        for requirement in pillar.requirements.values() {
            for sub in requirement.sub_requirements.values() {
                if sub.keywords.is_empty() {
                    out.push_str(&format!("  {} — {}\n", sub.id, sub.title));
                } else {
                    out.push_str(&format!(
                        "  {} — {} (keywords: {})\n",
                        sub.id,
                        sub.title,
                        sub.keywords.join(", ")
                    ));
                }
            }
        }
    }
    out
}

/// First-pass review of one paper. The caller owns persistence and the
/// per-paper loop; this function owns prompting and the claim cap.
pub async fn review_paper(
    gateway: &Gateway,
    catalog: &PillarCatalog,
    config: &Config,
    paper: &PaperFile,
    text: &str,
) -> Result<ExtractionYield, GatewayError> {
    let system = journal_system(catalog);
    let paper_id = paper.paper_id.clone();
    let mut yielded = extract_claims(
        gateway,
        catalog,
        config,
        "journal_review",
        "extract_claims",
        ClaimSource::JournalReviewer,
        paper,
        text,
        config.journal_chunk_size,
        &system,
        |chunk| {
            format!(
                "Paper: {}\nText (chunk {} of the paper):\n\n{}",
                paper_id, chunk.index, chunk.text
            )
        },
    )
    .await?;

    // Cost containment: the union of claims for a paper is capped.
    if yielded.claims.len() > config.max_claims_per_paper {
        warn!(
            paper_id = %paper.paper_id,
            extracted = yielded.claims.len(),
            cap = config.max_claims_per_paper,
            "per-paper claim cap applied"
        );
        yielded.claims.truncate(config.max_claims_per_paper);
    }

    info!(
        paper_id = %paper.paper_id,
        claims = yielded.claims.len(),
        quarantined = yielded.quarantined.len(),
        "journal review produced claims"
    );
    Ok(yielded)
}
