//! Derived CSV database export.
//!
//! The CSV is a view over the version store, regenerated wholesale on
//! every sync — the store is always the source of truth, and any
//! discrepancy resolves in its favor. Column order is fixed for
//! downstream consumers; legacy claims that predate the quality vector
//! serialize with empty quality cells.

use std::path::Path;
use thiserror::Error;
use tracing::info;

use slr_common::types::{Claim, VersionHistory};

/// Fixed column order expected by downstream consumers.
pub const COLUMNS: [&str; 18] = [
    "FILENAME",
    "CLAIM_ID",
    "SUB_REQUIREMENT_ID",
    "STATUS",
    "EVIDENCE_COMPOSITE_SCORE",
    "EVIDENCE_STRENGTH_SCORE",
    "EVIDENCE_RIGOR_SCORE",
    "EVIDENCE_RELEVANCE_SCORE",
    "EVIDENCE_DIRECTNESS_SCORE",
    "EVIDENCE_IS_RECENT",
    "EVIDENCE_REPRODUCIBILITY_SCORE",
    "EVIDENCE_CONFIDENCE",
    "STUDY_TYPE",
    "JUDGE_NOTES",
    "PROVENANCE_PAGE_NUMBERS",
    "PROVENANCE_SECTION",
    "SOURCE",
    "JUDGE_TIMESTAMP",
];

#[derive(Debug, Error)]
pub enum CsvSyncError {
    #[error("failed to write CSV database at {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: csv::Error,
    },

    #[error("failed to finalize CSV database at {path}: {source}")]
    Flush {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Export the current claim set (latest-wins across versions, all
/// statuses) to the CSV database. Returns the number of rows written.
pub fn sync_to_csv(history: &VersionHistory, path: &Path) -> Result<usize, CsvSyncError> {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let mut writer = csv::Writer::from_path(path).map_err(|source| CsvSyncError::Write {
        path: path.display().to_string(),
        source,
    })?;
    writer
        .write_record(COLUMNS)
        .map_err(|source| CsvSyncError::Write {
            path: path.display().to_string(),
            source,
        })?;

    let mut rows = 0;
    for paper_id in history.papers.keys() {
        for claim in history.current_claims(paper_id) {
            writer
                .write_record(claim_row(&claim))
                .map_err(|source| CsvSyncError::Write {
                    path: path.display().to_string(),
                    source,
                })?;
            rows += 1;
        }
    }

    writer.flush().map_err(|source| CsvSyncError::Flush {
        path: path.display().to_string(),
        source,
    })?;
    info!(rows, path = %path.display(), "CSV database synced");
    Ok(rows)
}

fn claim_row(claim: &Claim) -> Vec<String> {
    let quality = claim.evidence_quality.as_ref();
    let pages = serde_json::to_string(&claim.provenance.page_numbers).unwrap_or_default();
    vec![
        claim.paper_id.clone(),
        claim.claim_id.to_string(),
        claim.sub_requirement_id.clone(),
        claim.status.to_string(),
        quality
            .map(|q| format!("{:.4}", q.composite))
            .unwrap_or_default(),
        quality.map(|q| q.strength.to_string()).unwrap_or_default(),
        quality.map(|q| q.rigor.to_string()).unwrap_or_default(),
        quality.map(|q| q.relevance.to_string()).unwrap_or_default(),
        quality.map(|q| q.directness.to_string()).unwrap_or_default(),
        quality.map(|q| q.is_recent.to_string()).unwrap_or_default(),
        quality
            .map(|q| q.reproducibility.to_string())
            .unwrap_or_default(),
        quality.map(|q| q.confidence.to_string()).unwrap_or_default(),
        quality.map(|q| q.study_type.clone()).unwrap_or_default(),
        claim.judge_notes.clone().unwrap_or_default(),
        pages,
        claim.provenance.section.clone().unwrap_or_default(),
        claim.source.to_string(),
        claim
            .judge_timestamp
            .map(|t| t.to_rfc3339())
            .unwrap_or_default(),
    ]
}
