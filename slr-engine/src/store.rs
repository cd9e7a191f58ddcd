//! Append-only version store: the single source of truth.
//!
//! One JSON document maps paper filenames to ordered version lists.
//! Every mutation appends a new version carrying the full merged claim
//! set for the paper; nothing is ever rewritten in place. Physical
//! writes are atomic (temp file + fsync + rename), so a crashed run can
//! never leave a torn document behind.
//!
//! The store is single-writer: the pipeline controller owns the handle
//! and hands immutable snapshots to the analyzers.

use chrono::{DateTime, Utc};
use slr_common::types::{
    ChangeStatus, Claim, ClaimId, ClaimStatus, PaperReview, PaperVersion, VersionChange,
    VersionHistory,
};
use slr_common::util::atomic_write_json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

// ── Errors ───────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to write version store at {path}: {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "illegal status transition for claim {claim_id}: {from} -> {to}"
    )]
    IllegalTransition {
        claim_id: ClaimId,
        from: ClaimStatus,
        to: ClaimStatus,
    },

}

// ── Version Store ────────────────────────────────────────────────────────

/// Handle to the version store document on disk.
///
/// All operations are total functions of the loaded [`VersionHistory`];
/// the handle only owns the path and the write discipline.
#[derive(Debug, Clone)]
pub struct VersionStore {
    path: PathBuf,
}

impl VersionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the history document. A missing or malformed file yields an
    /// empty history with a warning — the store never silently salvages
    /// partial data, and an empty history is always safe because writes
    /// are append-only.
    pub fn load(&self) -> VersionHistory {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "version store absent; starting empty");
            return VersionHistory::default();
        }
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => match serde_json::from_str::<VersionHistory>(&raw) {
                Ok(history) => history,
                Err(err) => {
                    warn!(
                        path = %self.path.display(),
                        error = %err,
                        "version store JSON malformed; treating as empty"
                    );
                    VersionHistory::default()
                }
            },
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "version store unreadable; treating as empty"
                );
                VersionHistory::default()
            }
        }
    }

    /// Persist the history atomically. Failure is fatal to the caller —
    /// a half-written store must be impossible.
    pub fn save(&self, history: &VersionHistory) -> Result<(), StoreError> {
        atomic_write_json(&self.path, history).map_err(|source| StoreError::WriteFailed {
            path: self.path.display().to_string(),
            source,
        })
    }
}

// ── Pure History Operations ──────────────────────────────────────────────

/// Claims whose latest state is `pending_judge_review`, across all papers.
pub fn extract_pending(history: &VersionHistory) -> Vec<Claim> {
    let mut pending = Vec::new();
    for paper_id in history.papers.keys() {
        for claim in history.current_claims(paper_id) {
            if claim.status == ClaimStatus::PendingJudgeReview {
                pending.push(claim);
            }
        }
    }
    pending
}

/// Claims whose latest state is `rejected` (appeal candidates), across
/// all papers. Claims that already carry an appeal (status `appealed`)
/// are excluded by construction.
pub fn extract_rejected(history: &VersionHistory) -> Vec<Claim> {
    let mut rejected = Vec::new();
    for paper_id in history.papers.keys() {
        for claim in history.current_claims(paper_id) {
            if claim.status == ClaimStatus::Rejected {
                rejected.push(claim);
            }
        }
    }
    rejected
}

/// Apply judge verdicts: for each touched paper, append one new version
/// whose review merges the judged claims with the untouched claims from
/// the paper's current state.
///
/// Status transitions are validated against the claim state machine; an
/// illegal transition aborts the whole update (the input history is
/// returned untouched via the error path, since this is a pure function
/// of its inputs).
pub fn apply_judge_updates(
    history: &VersionHistory,
    judged_claims: &[Claim],
    now: DateTime<Utc>,
) -> Result<VersionHistory, StoreError> {
    apply_claim_updates(history, judged_claims, ChangeStatus::JudgeUpdate, now)
}

/// Append newly extracted claims, grouped by paper, with the given
/// change status (`initial`, `dra_appeal`, or `deep_review_update`).
pub fn apply_new_claims(
    history: &VersionHistory,
    new_claims: &[Claim],
    change: ChangeStatus,
    now: DateTime<Utc>,
) -> Result<VersionHistory, StoreError> {
    apply_claim_updates(history, new_claims, change, now)
}

fn apply_claim_updates(
    history: &VersionHistory,
    claims: &[Claim],
    change: ChangeStatus,
    now: DateTime<Utc>,
) -> Result<VersionHistory, StoreError> {
    let mut updated = history.clone();

    let mut by_paper: BTreeMap<String, Vec<&Claim>> = BTreeMap::new();
    for claim in claims {
        by_paper
            .entry(claim.paper_id.clone())
            .or_default()
            .push(claim);
    }

    for (paper_id, paper_claims) in by_paper {
        // Current merged state before this update.
        let current = updated.current_claims(&paper_id);
        let current_by_id: BTreeMap<ClaimId, &Claim> =
            current.iter().map(|c| (c.claim_id.clone(), c)).collect();

        // Validate transitions for claims that already exist.
        if change == ChangeStatus::JudgeUpdate {
            for claim in &paper_claims {
                if let Some(existing) = current_by_id.get(&claim.claim_id) {
                    if existing.status != claim.status
                        && !existing.status.can_transition_to(claim.status)
                    {
                        return Err(StoreError::IllegalTransition {
                            claim_id: claim.claim_id.clone(),
                            from: existing.status,
                            to: claim.status,
                        });
                    }
                }
            }
        }

        // Merge: updated claims override, untouched claims carry over.
        let mut review = PaperReview {
            paper_id: paper_id.clone(),
            requirements: BTreeMap::new(),
        };
        let mut merged: BTreeMap<ClaimId, Claim> = current
            .iter()
            .map(|c| (c.claim_id.clone(), c.clone()))
            .collect();
        let mut touched = Vec::new();
        for claim in &paper_claims {
            merged.insert(claim.claim_id.clone(), (*claim).clone());
            touched.push(claim.claim_id.clone());
        }
        for claim in merged.into_values() {
            review.insert(claim);
        }

        let versions = updated.papers.entry(paper_id.clone()).or_default();
        let next_version = versions.last().map(|v| v.version + 1).unwrap_or(1);
        // Timestamps never regress even if the wall clock does.
        let timestamp = versions
            .last()
            .map(|v| v.timestamp.max(now))
            .unwrap_or(now);
        versions.push(PaperVersion {
            version: next_version,
            timestamp,
            review,
            changes: VersionChange {
                status: change,
                claim_ids: touched,
                notes: None,
            },
        });
        debug!(
            paper_id = %paper_id,
            version = next_version,
            change = %change,
            claims = paper_claims.len(),
            "version appended"
        );
    }

    Ok(updated)
}

/// Latest-wins claim set for one paper (delegates to the history).
pub fn current_claims_for(history: &VersionHistory, paper_id: &str) -> Vec<Claim> {
    history.current_claims(paper_id)
}

/// Ensure a paper is tracked even when extraction yielded nothing:
/// absent papers get an empty initial version so incremental runs know
/// the paper was ingested. Already-tracked papers are left untouched.
pub fn register_paper(
    history: &VersionHistory,
    paper_id: &str,
    now: DateTime<Utc>,
) -> VersionHistory {
    if history.papers.contains_key(paper_id) {
        return history.clone();
    }
    let mut updated = history.clone();
    updated.papers.insert(
        paper_id.to_string(),
        vec![PaperVersion {
            version: 1,
            timestamp: now,
            review: PaperReview {
                paper_id: paper_id.to_string(),
                requirements: BTreeMap::new(),
            },
            changes: VersionChange {
                status: ChangeStatus::Initial,
                claim_ids: Vec::new(),
                notes: Some("no claims extracted".to_string()),
            },
        }],
    );
    updated
}

#[cfg(test)]
mod tests {
    use super::*;
    use slr_common::types::{ClaimSource, Provenance};

    fn claim(paper: &str, sub: &str, text: &str) -> Claim {
        Claim::new(
            paper,
            sub,
            0.9,
            text,
            ClaimSource::JournalReviewer,
            Provenance::default(),
            Utc::now(),
        )
    }

    #[test]
    fn load_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = VersionStore::new(dir.path().join("vh.json"));
        assert_eq!(store.load().paper_count(), 0);
    }

    #[test]
    fn load_malformed_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vh.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = VersionStore::new(&path);
        assert_eq!(store.load().paper_count(), 0);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = VersionStore::new(dir.path().join("vh.json"));

        let history = apply_new_claims(
            &VersionHistory::default(),
            &[claim("a.pdf", "Sub-1.1.1", "claim one")],
            ChangeStatus::Initial,
            Utc::now(),
        )
        .unwrap();
        store.save(&history).unwrap();

        let loaded = store.load();
        assert_eq!(loaded, history);
        assert_eq!(loaded.current_claims("a.pdf").len(), 1);
    }

    #[test]
    fn new_claims_create_initial_version() {
        let history = apply_new_claims(
            &VersionHistory::default(),
            &[
                claim("a.pdf", "Sub-1.1.1", "claim one"),
                claim("a.pdf", "Sub-1.1.2", "claim two"),
                claim("b.pdf", "Sub-1.1.1", "claim three"),
            ],
            ChangeStatus::Initial,
            Utc::now(),
        )
        .unwrap();

        assert_eq!(history.paper_count(), 2);
        let a = history.latest_version("a.pdf").unwrap();
        assert_eq!(a.version, 1);
        assert_eq!(a.changes.status, ChangeStatus::Initial);
        assert_eq!(a.review.claim_count(), 2);
    }

    #[test]
    fn judge_update_appends_version_and_merges_untouched() {
        let now = Utc::now();
        let c1 = claim("a.pdf", "Sub-1.1.1", "claim one");
        let c2 = claim("a.pdf", "Sub-1.1.2", "claim two");
        let history = apply_new_claims(
            &VersionHistory::default(),
            &[c1.clone(), c2.clone()],
            ChangeStatus::Initial,
            now,
        )
        .unwrap();

        let mut judged = c1.clone();
        judged.status = ClaimStatus::Approved;
        let updated = apply_judge_updates(&history, &[judged], now).unwrap();

        let latest = updated.latest_version("a.pdf").unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.changes.status, ChangeStatus::JudgeUpdate);
        // Untouched claim carried over into the merged review.
        assert_eq!(latest.review.claim_count(), 2);

        let current = updated.current_claims("a.pdf");
        let approved = current
            .iter()
            .find(|c| c.claim_id == c1.claim_id)
            .unwrap();
        assert_eq!(approved.status, ClaimStatus::Approved);
        let untouched = current
            .iter()
            .find(|c| c.claim_id == c2.claim_id)
            .unwrap();
        assert_eq!(untouched.status, ClaimStatus::PendingJudgeReview);
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let now = Utc::now();
        let c1 = claim("a.pdf", "Sub-1.1.1", "claim one");
        let history = apply_new_claims(
            &VersionHistory::default(),
            &[c1.clone()],
            ChangeStatus::Initial,
            now,
        )
        .unwrap();

        let mut approved = c1.clone();
        approved.status = ClaimStatus::Approved;
        let history = apply_judge_updates(&history, &[approved.clone()], now).unwrap();

        // Approved -> Rejected is not legal.
        let mut rejected = approved;
        rejected.status = ClaimStatus::Rejected;
        let err = apply_judge_updates(&history, &[rejected], now).unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }

    #[test]
    fn extract_pending_returns_only_latest_pending() {
        let now = Utc::now();
        let c1 = claim("a.pdf", "Sub-1.1.1", "claim one");
        let c2 = claim("b.pdf", "Sub-1.1.1", "claim two");
        let history = apply_new_claims(
            &VersionHistory::default(),
            &[c1.clone(), c2.clone()],
            ChangeStatus::Initial,
            now,
        )
        .unwrap();

        let mut judged = c1.clone();
        judged.status = ClaimStatus::Approved;
        let history = apply_judge_updates(&history, &[judged], now).unwrap();

        let pending = extract_pending(&history);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].claim_id, c2.claim_id);
        assert_eq!(pending[0].paper_id, "b.pdf");
    }

    #[test]
    fn versions_stay_monotonic_under_repeated_updates() {
        let now = Utc::now();
        let mut history = VersionHistory::default();
        for round in 0..5 {
            let c = claim("a.pdf", "Sub-1.1.1", &format!("claim {round}"));
            history =
                apply_new_claims(&history, &[c], ChangeStatus::DeepReviewUpdate, now).unwrap();
        }
        history.check_monotonic().unwrap();
        assert_eq!(history.latest_version("a.pdf").unwrap().version, 5);
    }

    #[test]
    fn timestamps_never_regress() {
        let early = Utc::now();
        let later = early + chrono::Duration::seconds(10);

        let c1 = claim("a.pdf", "Sub-1.1.1", "one");
        let history = apply_new_claims(
            &VersionHistory::default(),
            &[c1],
            ChangeStatus::Initial,
            later,
        )
        .unwrap();

        // Wall clock goes backwards; stored timestamp must not.
        let c2 = claim("a.pdf", "Sub-1.1.2", "two");
        let history =
            apply_new_claims(&history, &[c2], ChangeStatus::DeepReviewUpdate, early).unwrap();
        history.check_monotonic().unwrap();
    }
}
