//! Quarantine for claims whose sub-requirement could not be resolved.
//!
//! When fuzzy catalog resolution falls below the confidence threshold,
//! the claim is not written to the version store; it lands here for
//! human review instead, persisted next to the other run artifacts.
//! Quarantined claims never block the rest of a stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use slr_common::types::{ClaimSource, Provenance};
use slr_common::util::atomic_write_json;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One quarantined claim awaiting human mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantinedClaim {
    /// Source paper.
    pub paper_id: String,
    /// The analyzer's sub-requirement label that failed to resolve.
    pub query: String,
    /// Best catalog candidate found.
    pub best_candidate: String,
    /// Confidence of the best candidate (below threshold).
    pub confidence: f64,
    /// Threshold the match fell short of.
    pub threshold: f64,
    /// Claim text.
    pub text: String,
    /// Positional attribution.
    pub provenance: Provenance,
    /// Which analyzer produced the claim.
    pub source: ClaimSource,
    pub created_at: DateTime<Utc>,
}

/// Persistent quarantine list.
#[derive(Debug, Clone)]
pub struct QuarantineStore {
    path: PathBuf,
}

impl QuarantineStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the current quarantine list; missing or malformed files
    /// yield an empty list with a warning.
    pub fn load(&self) -> Vec<QuarantinedClaim> {
        if !self.path.exists() {
            return Vec::new();
        }
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                warn!(path = %self.path.display(), error = %err, "quarantine list malformed; starting empty");
                Vec::new()
            }),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "quarantine list unreadable; starting empty");
                Vec::new()
            }
        }
    }

    /// Append new entries and persist atomically.
    pub fn append(&self, new_entries: &[QuarantinedClaim]) -> std::io::Result<()> {
        if new_entries.is_empty() {
            return Ok(());
        }
        let mut entries = self.load();
        entries.extend(new_entries.iter().cloned());
        atomic_write_json(&self.path, &entries)?;
        info!(
            added = new_entries.len(),
            total = entries.len(),
            path = %self.path.display(),
            "claims quarantined for human review"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(query: &str) -> QuarantinedClaim {
        QuarantinedClaim {
            paper_id: "a.pdf".to_string(),
            query: query.to_string(),
            best_candidate: "Sub-1.1.1".to_string(),
            confidence: 0.42,
            threshold: 0.6,
            text: "some claim".to_string(),
            provenance: Provenance::default(),
            source: ClaimSource::JournalReviewer,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn append_accumulates_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let store = QuarantineStore::new(dir.path().join("quarantine.json"));
        store.append(&[entry("first")]).unwrap();
        store.append(&[entry("second"), entry("third")]).unwrap();
        let entries = store.load();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].query, "first");
    }

    #[test]
    fn malformed_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quarantine.json");
        std::fs::write(&path, "not json").unwrap();
        let store = QuarantineStore::new(&path);
        assert!(store.load().is_empty());
    }
}
