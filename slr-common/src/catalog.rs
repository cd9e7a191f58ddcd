//! Pillar catalog: the requirement taxonomy claims are adjudicated
//! against.
//!
//! The catalog is a three-level tree (pillar → requirement →
//! sub-requirement) loaded from a JSON document and read-only at run
//! time. Sub-requirement identifiers are resolved with fuzzy matching so
//! analyzer output that names a sub-requirement slightly differently (or
//! by title) still lands on the right node; matches below the confidence
//! threshold fail resolution and the claim is quarantined for human
//! review instead.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

use crate::util::longest_common_substring;

// ── Tree Nodes ───────────────────────────────────────────────────────────

/// Leaf node: one evaluatable sub-requirement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubRequirement {
    /// Stable identifier, e.g. `Sub-1.1.1`.
    #[serde(default)]
    pub id: String,
    /// Human title.
    pub title: String,
    /// Evaluative keywords used to guide extraction prompts.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Optional named quantitative thresholds.
    #[serde(default)]
    pub thresholds: BTreeMap<String, f64>,
    /// Identifiers of sub-requirements this one depends on.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Mid-level node: a requirement grouping several sub-requirements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    pub title: String,
    /// Sub-requirements keyed by identifier.
    pub sub_requirements: BTreeMap<String, SubRequirement>,
}

/// Top-level node: a pillar of the evaluation taxonomy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pillar {
    pub title: String,
    /// Requirements keyed by identifier.
    pub requirements: BTreeMap<String, Requirement>,
}

// ── Errors ───────────────────────────────────────────────────────────────

/// Catalog loading and resolution failures.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("pillar definitions not found at {path}")]
    NotFound { path: String },

    #[error("failed to read pillar definitions at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("pillar definitions at {path} are not valid JSON: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("duplicate sub-requirement identifier {id}")]
    DuplicateIdentifier { id: String },

    #[error("malformed sub-requirement identifier {id} (expected e.g. Sub-1.1.1)")]
    MalformedIdentifier { id: String },

    #[error("sub-requirement {id} depends on unknown sub-requirement {dependency}")]
    UnknownDependency { id: String, dependency: String },

    #[error(
        "could not resolve sub-requirement for {query:?}: best candidate {candidate} \
         at confidence {confidence:.2} is below threshold {threshold:.2}"
    )]
    UnresolvedSubRequirement {
        query: String,
        candidate: String,
        confidence: f64,
        threshold: f64,
    },
}

// ── Catalog ──────────────────────────────────────────────────────────────

/// Loaded and validated pillar taxonomy with a flat sub-requirement index.
#[derive(Debug, Clone)]
pub struct PillarCatalog {
    /// Pillars keyed by identifier, in stable order.
    pillars: BTreeMap<String, Pillar>,
    /// Flat index: sub-requirement id → (pillar id, requirement id).
    index: HashMap<String, (String, String)>,
    /// Reverse dependency counts: sub-requirement id → number of
    /// downstream dependents (for bottleneck analysis).
    dependents: HashMap<String, usize>,
    /// Bumped on every load so cached coverage computations keyed by the
    /// generation are invalidated when the catalog is reloaded.
    generation: u64,
}

impl PillarCatalog {
    /// Load and validate the catalog from a JSON document.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        Self::load_with_generation(path, 1)
    }

    /// Reload, bumping the generation past `previous`.
    pub fn reload(path: &Path, previous: &PillarCatalog) -> Result<Self, CatalogError> {
        Self::load_with_generation(path, previous.generation + 1)
    }

    fn load_with_generation(path: &Path, generation: u64) -> Result<Self, CatalogError> {
        if !path.exists() {
            return Err(CatalogError::NotFound {
                path: path.display().to_string(),
            });
        }
        let raw = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let pillars: BTreeMap<String, Pillar> =
            serde_json::from_str(&raw).map_err(|source| CatalogError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        let catalog = Self::from_pillars(pillars, generation)?;
        debug!(
            pillars = catalog.pillars.len(),
            sub_requirements = catalog.index.len(),
            generation,
            "pillar catalog loaded"
        );
        Ok(catalog)
    }

    /// Build a catalog from an in-memory pillar map (used by tests).
    pub fn from_pillars(
        mut pillars: BTreeMap<String, Pillar>,
        generation: u64,
    ) -> Result<Self, CatalogError> {
        let mut index = HashMap::new();

        for (pillar_id, pillar) in &mut pillars {
            for (req_id, requirement) in &mut pillar.requirements {
                for (sub_id, sub) in &mut requirement.sub_requirements {
                    // Identifier lives in the map key; mirror it into the
                    // node so flat consumers don't need the path.
                    sub.id = sub_id.clone();
                    if !is_well_formed_sub_id(sub_id) {
                        return Err(CatalogError::MalformedIdentifier { id: sub_id.clone() });
                    }
                    if index
                        .insert(sub_id.clone(), (pillar_id.clone(), req_id.clone()))
                        .is_some()
                    {
                        return Err(CatalogError::DuplicateIdentifier { id: sub_id.clone() });
                    }
                }
            }
        }

        // Validate dependency references and count dependents.
        let mut dependents: HashMap<String, usize> = HashMap::new();
        for pillar in pillars.values() {
            for requirement in pillar.requirements.values() {
                for sub in requirement.sub_requirements.values() {
                    for dep in &sub.depends_on {
                        if !index.contains_key(dep) {
                            return Err(CatalogError::UnknownDependency {
                                id: sub.id.clone(),
                                dependency: dep.clone(),
                            });
                        }
                        *dependents.entry(dep.clone()).or_default() += 1;
                    }
                }
            }
        }

        Ok(Self {
            pillars,
            index,
            dependents,
            generation,
        })
    }

    /// Catalog generation (bumped on reload).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Pillars in stable identifier order.
    pub fn pillars(&self) -> &BTreeMap<String, Pillar> {
        &self.pillars
    }

    /// All sub-requirements in stable identifier order.
    pub fn list_sub_requirements(&self) -> Vec<&SubRequirement> {
        let mut subs: Vec<&SubRequirement> = self
            .pillars
            .values()
            .flat_map(|p| p.requirements.values())
            .flat_map(|r| r.sub_requirements.values())
            .collect();
        subs.sort_by(|a, b| a.id.cmp(&b.id));
        subs
    }

    /// Look up a sub-requirement by exact identifier.
    pub fn get(&self, sub_id: &str) -> Option<&SubRequirement> {
        let (pillar_id, req_id) = self.index.get(sub_id)?;
        self.pillars
            .get(pillar_id)?
            .requirements
            .get(req_id)?
            .sub_requirements
            .get(sub_id)
    }

    /// Pillar identifier owning a sub-requirement.
    pub fn pillar_of(&self, sub_id: &str) -> Option<&str> {
        self.index.get(sub_id).map(|(p, _)| p.as_str())
    }

    /// Direct dependencies of a sub-requirement.
    pub fn dependencies_of(&self, sub_id: &str) -> &[String] {
        self.get(sub_id).map(|s| s.depends_on.as_slice()).unwrap_or(&[])
    }

    /// Number of sub-requirements that depend on `sub_id`.
    pub fn dependent_count(&self, sub_id: &str) -> usize {
        self.dependents.get(sub_id).copied().unwrap_or(0)
    }

    /// Fuzzy-resolve an identifier or title to a sub-requirement.
    ///
    /// Scores every candidate over both its identifier and its title with
    /// normalized Levenshtein similarity. An exact (case-insensitive)
    /// identifier match short-circuits at confidence 1.0. Ties are broken
    /// by exact-identifier preference, then longest common substring with
    /// the query, then lexical identifier order. A best score below
    /// `threshold` fails with [`CatalogError::UnresolvedSubRequirement`].
    pub fn resolve(
        &self,
        query: &str,
        threshold: f64,
    ) -> Result<(&SubRequirement, f64), CatalogError> {
        let trimmed = query.trim();

        // Exact identifier match wins outright.
        for sub in self.list_sub_requirements() {
            if sub.id.eq_ignore_ascii_case(trimmed) {
                return Ok((self.get(&sub.id).expect("indexed"), 1.0));
            }
        }

        let query_lower = trimmed.to_lowercase();
        let mut best: Option<(&SubRequirement, f64, usize)> = None;
        for sub in self.list_sub_requirements() {
            let id_score = strsim::normalized_levenshtein(&query_lower, &sub.id.to_lowercase());
            let title_score =
                strsim::normalized_levenshtein(&query_lower, &sub.title.to_lowercase());
            let score = id_score.max(title_score);
            let lcs = longest_common_substring(&query_lower, &sub.id.to_lowercase())
                .max(longest_common_substring(&query_lower, &sub.title.to_lowercase()));

            let better = match &best {
                None => true,
                Some((cur, cur_score, cur_lcs)) => {
                    score > *cur_score + 1e-12
                        || ((score - *cur_score).abs() <= 1e-12
                            && (lcs > *cur_lcs
                                || (lcs == *cur_lcs && sub.id < cur.id)))
                }
            };
            if better {
                best = Some((sub, score, lcs));
            }
        }

        match best {
            Some((sub, score, _)) if score >= threshold => {
                let resolved = self.get(&sub.id).expect("indexed");
                Ok((resolved, score))
            }
            Some((sub, score, _)) => Err(CatalogError::UnresolvedSubRequirement {
                query: trimmed.to_string(),
                candidate: sub.id.clone(),
                confidence: score,
                threshold,
            }),
            None => Err(CatalogError::UnresolvedSubRequirement {
                query: trimmed.to_string(),
                candidate: "<empty catalog>".to_string(),
                confidence: 0.0,
                threshold,
            }),
        }
    }
}

/// Identifier shape check: a short alphabetic prefix followed by a dotted
/// numeric path, e.g. `Sub-1.1.1`.
fn is_well_formed_sub_id(id: &str) -> bool {
    let Some((prefix, path)) = id.split_once('-') else {
        return false;
    };
    if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_alphabetic()) {
        return false;
    }
    !path.is_empty()
        && path
            .split('.')
            .all(|seg| !seg.is_empty() && seg.chars().all(|c| c.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_catalog() -> PillarCatalog {
        let json = serde_json::json!({
            "Pillar-1": {
                "title": "Model Capability",
                "requirements": {
                    "Req-1.1": {
                        "title": "Accuracy",
                        "sub_requirements": {
                            "Sub-1.1.1": {
                                "title": "Benchmark accuracy exceeds baseline",
                                "keywords": ["accuracy", "benchmark"],
                                "thresholds": {"accuracy": 0.9}
                            },
                            "Sub-1.1.2": {
                                "title": "Generalization across domains",
                                "keywords": ["generalization"],
                                "depends_on": ["Sub-1.1.1"]
                            }
                        }
                    }
                }
            },
            "Pillar-2": {
                "title": "Safety",
                "requirements": {
                    "Req-2.1": {
                        "title": "Robustness",
                        "sub_requirements": {
                            "Sub-2.1.1": {
                                "title": "Adversarial robustness evaluation",
                                "keywords": ["adversarial", "robustness"],
                                "depends_on": ["Sub-1.1.1"]
                            }
                        }
                    }
                }
            }
        });
        let pillars: BTreeMap<String, Pillar> = serde_json::from_value(json).unwrap();
        PillarCatalog::from_pillars(pillars, 1).unwrap()
    }

    #[test]
    fn load_validates_and_indexes() {
        let catalog = sample_catalog();
        assert_eq!(catalog.list_sub_requirements().len(), 3);
        assert_eq!(catalog.pillar_of("Sub-2.1.1"), Some("Pillar-2"));
        assert_eq!(catalog.dependent_count("Sub-1.1.1"), 2);
        assert_eq!(catalog.dependencies_of("Sub-1.1.2"), &["Sub-1.1.1".to_string()]);
    }

    #[test]
    fn duplicate_identifiers_rejected() {
        // Two pillars carrying the same sub id.
        let json = serde_json::json!({
            "Pillar-1": {
                "title": "A",
                "requirements": {
                    "Req-1.1": {
                        "title": "r",
                        "sub_requirements": {
                            "Sub-1.1.1": {"title": "x"}
                        }
                    }
                }
            },
            "Pillar-2": {
                "title": "B",
                "requirements": {
                    "Req-2.1": {
                        "title": "r",
                        "sub_requirements": {
                            "Sub-1.1.1": {"title": "y"}
                        }
                    }
                }
            }
        });
        let pillars: BTreeMap<String, Pillar> = serde_json::from_value(json).unwrap();
        let err = PillarCatalog::from_pillars(pillars, 1).unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateIdentifier { .. }));
    }

    #[test]
    fn malformed_identifier_rejected() {
        let json = serde_json::json!({
            "Pillar-1": {
                "title": "A",
                "requirements": {
                    "Req-1.1": {
                        "title": "r",
                        "sub_requirements": {
                            "sub requirement one": {"title": "x"}
                        }
                    }
                }
            }
        });
        let pillars: BTreeMap<String, Pillar> = serde_json::from_value(json).unwrap();
        let err = PillarCatalog::from_pillars(pillars, 1).unwrap_err();
        assert!(matches!(err, CatalogError::MalformedIdentifier { .. }));
    }

    #[test]
    fn unknown_dependency_rejected() {
        let json = serde_json::json!({
            "Pillar-1": {
                "title": "A",
                "requirements": {
                    "Req-1.1": {
                        "title": "r",
                        "sub_requirements": {
                            "Sub-1.1.1": {"title": "x", "depends_on": ["Sub-9.9.9"]}
                        }
                    }
                }
            }
        });
        let pillars: BTreeMap<String, Pillar> = serde_json::from_value(json).unwrap();
        let err = PillarCatalog::from_pillars(pillars, 1).unwrap_err();
        assert!(matches!(err, CatalogError::UnknownDependency { .. }));
    }

    #[test]
    fn resolve_exact_identifier() {
        let catalog = sample_catalog();
        let (sub, confidence) = catalog.resolve("Sub-1.1.1", 0.7).unwrap();
        assert_eq!(sub.id, "Sub-1.1.1");
        assert!((confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn resolve_exact_identifier_case_insensitive() {
        let catalog = sample_catalog();
        let (sub, confidence) = catalog.resolve("sub-2.1.1", 0.7).unwrap();
        assert_eq!(sub.id, "Sub-2.1.1");
        assert!((confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn resolve_by_title() {
        let catalog = sample_catalog();
        let (sub, confidence) = catalog
            .resolve("Adversarial robustness evaluations", 0.7)
            .unwrap();
        assert_eq!(sub.id, "Sub-2.1.1");
        assert!(confidence > 0.9);
    }

    #[test]
    fn resolve_below_threshold_fails() {
        let catalog = sample_catalog();
        let err = catalog.resolve("completely unrelated topic", 0.7).unwrap_err();
        match err {
            CatalogError::UnresolvedSubRequirement { confidence, .. } => {
                assert!(confidence < 0.7);
            }
            other => panic!("expected unresolved, got {other:?}"),
        }
    }

    #[test]
    fn resolve_tie_breaks_lexically() {
        // "Sub-1.1" is equidistant from Sub-1.1.1 and Sub-1.1.2; lexical
        // order picks the first.
        let catalog = sample_catalog();
        let (sub, _) = catalog.resolve("Sub-1.1", 0.5).unwrap();
        assert_eq!(sub.id, "Sub-1.1.1");
    }

    #[test]
    fn reload_bumps_generation() {
        let catalog = sample_catalog();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pillars.json");
        std::fs::write(&path, serde_json::to_string(catalog.pillars()).unwrap()).unwrap();
        let reloaded = PillarCatalog::reload(&path, &catalog).unwrap();
        assert_eq!(reloaded.generation(), catalog.generation() + 1);
    }
}
