//! Corpus discovery and paper text access.
//!
//! The engine scans `data_dir` for papers (PDF and CSV) and addresses
//! each one by filename — the filename is the stable paper identifier
//! everywhere downstream. Actual PDF text extraction is an external
//! collaborator; the engine consumes text through [`PaperTextSource`],
//! whose default implementation reads a `<paper>.txt` sidecar produced
//! by the extractor.

use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

// ── Paper Files ──────────────────────────────────────────────────────────

/// Kind of corpus file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaperKind {
    Pdf,
    Csv,
}

/// One discovered paper.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaperFile {
    /// Filename; the stable paper identifier.
    pub paper_id: String,
    /// Full path on disk.
    pub path: PathBuf,
    pub kind: PaperKind,
    /// Publication year parsed from the filename, when present.
    pub publication_year: Option<i32>,
}

#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("data directory {path} is unreadable: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "no text available for {paper_id}: expected extracted-text sidecar at {expected}"
    )]
    MissingText { paper_id: String, expected: String },

    #[error("failed to read text for {paper_id}: {source}")]
    ReadFailed {
        paper_id: String,
        #[source]
        source: std::io::Error,
    },
}

/// Scan `data_dir` for papers, sorted by filename. Missing directories
/// yield an empty corpus (the empty-corpus run is a valid, successful
/// run).
pub fn discover_papers(data_dir: &Path) -> Result<Vec<PaperFile>, CorpusError> {
    if !data_dir.exists() {
        info!(path = %data_dir.display(), "data directory absent; empty corpus");
        return Ok(Vec::new());
    }

    let entries = std::fs::read_dir(data_dir).map_err(|source| CorpusError::Unreadable {
        path: data_dir.display().to_string(),
        source,
    })?;

    let mut papers = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        let kind = match ext.as_deref() {
            Some("pdf") => PaperKind::Pdf,
            Some("csv") => PaperKind::Csv,
            _ => continue,
        };
        papers.push(PaperFile {
            paper_id: name.to_string(),
            path: path.clone(),
            kind,
            publication_year: year_from_filename(name),
        });
    }
    papers.sort_by(|a, b| a.paper_id.cmp(&b.paper_id));
    debug!(count = papers.len(), "corpus discovered");
    Ok(papers)
}

/// Publication-year heuristic: first plausible 4-digit year in the
/// filename (1900–2099).
pub fn year_from_filename(name: &str) -> Option<i32> {
    let re = Regex::new(r"(19|20)\d{2}").expect("static regex");
    re.find(name).and_then(|m| m.as_str().parse().ok())
}

// ── Text Source ──────────────────────────────────────────────────────────

/// Provides the extracted text of a paper. PDF extraction itself is an
/// external collaborator behind this seam.
pub trait PaperTextSource: Send + Sync {
    fn text_for(&self, paper: &PaperFile) -> Result<String, CorpusError>;
}

/// Default text source: reads a `<filename>.txt` sidecar next to the
/// paper (e.g. `paper_a.pdf.txt`); CSV papers are read directly.
#[derive(Debug, Default, Clone)]
pub struct SidecarTextSource;

impl PaperTextSource for SidecarTextSource {
    fn text_for(&self, paper: &PaperFile) -> Result<String, CorpusError> {
        match paper.kind {
            PaperKind::Csv => {
                std::fs::read_to_string(&paper.path).map_err(|source| CorpusError::ReadFailed {
                    paper_id: paper.paper_id.clone(),
                    source,
                })
            }
            PaperKind::Pdf => {
                let sidecar = PathBuf::from(format!("{}.txt", paper.path.display()));
                if !sidecar.exists() {
                    return Err(CorpusError::MissingText {
                        paper_id: paper.paper_id.clone(),
                        expected: sidecar.display().to_string(),
                    });
                }
                std::fs::read_to_string(&sidecar).map_err(|source| CorpusError::ReadFailed {
                    paper_id: paper.paper_id.clone(),
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_or_missing_dir_yields_empty_corpus() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover_papers(dir.path()).unwrap().is_empty());
        assert!(discover_papers(&dir.path().join("nope")).unwrap().is_empty());
    }

    #[test]
    fn discovers_pdf_and_csv_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b_2021.pdf"), b"x").unwrap();
        std::fs::write(dir.path().join("a_study.csv"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.md"), b"x").unwrap();

        let papers = discover_papers(dir.path()).unwrap();
        assert_eq!(papers.len(), 2);
        assert_eq!(papers[0].paper_id, "a_study.csv");
        assert_eq!(papers[0].kind, PaperKind::Csv);
        assert_eq!(papers[1].paper_id, "b_2021.pdf");
        assert_eq!(papers[1].publication_year, Some(2021));
    }

    #[test]
    fn year_heuristic() {
        assert_eq!(year_from_filename("smith_2019_results.pdf"), Some(2019));
        assert_eq!(year_from_filename("no-year-here.pdf"), None);
        assert_eq!(year_from_filename("v2_2024.pdf"), Some(2024));
    }

    #[test]
    fn sidecar_text_source_reads_extracted_text() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("paper_a.pdf");
        std::fs::write(&pdf, b"%PDF").unwrap();
        std::fs::write(dir.path().join("paper_a.pdf.txt"), "extracted text").unwrap();

        let paper = PaperFile {
            paper_id: "paper_a.pdf".to_string(),
            path: pdf,
            kind: PaperKind::Pdf,
            publication_year: None,
        };
        let text = SidecarTextSource.text_for(&paper).unwrap();
        assert_eq!(text, "extracted text");
    }

    #[test]
    fn missing_sidecar_is_typed_error() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("paper_a.pdf");
        std::fs::write(&pdf, b"%PDF").unwrap();
        let paper = PaperFile {
            paper_id: "paper_a.pdf".to_string(),
            path: pdf,
            kind: PaperKind::Pdf,
            publication_year: None,
        };
        assert!(matches!(
            SidecarTextSource.text_for(&paper),
            Err(CorpusError::MissingText { .. })
        ));
    }
}
