//! Error catalog for the SLR pipeline.
//!
//! Every user-visible failure maps to a stable `SLR-Exxx` code with a
//! message template and remediation steps, categorized by subsystem.
//!
//! # Error Code Ranges
//!
//! | Range      | Category    | Description                              |
//! |------------|-------------|------------------------------------------|
//! | E001-E099  | Config      | Configuration and setup errors           |
//! | E100-E199  | Catalog     | Pillar taxonomy errors                   |
//! | E200-E299  | Store       | Version store and checkpoint errors      |
//! | E300-E399  | Gateway     | LLM provider and response errors         |
//! | E400-E499  | Budget      | Rate/budget governor errors              |
//! | E500-E599  | Pipeline    | Stage sequencing and internal errors     |

use serde::{Deserialize, Serialize};
use std::fmt;

/// Subsystem category of an error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Config,
    Catalog,
    Store,
    Gateway,
    Budget,
    Pipeline,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config => write!(f, "config"),
            Self::Catalog => write!(f, "catalog"),
            Self::Store => write!(f, "store"),
            Self::Gateway => write!(f, "gateway"),
            Self::Budget => write!(f, "budget"),
            Self::Pipeline => write!(f, "pipeline"),
        }
    }
}

/// Error code enumeration covering catalogued SLR failure scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // =========================================================================
    // Config Errors (E001-E099)
    // =========================================================================
    /// Configuration file could not be read
    ConfigReadError,
    /// Configuration file contains invalid TOML syntax
    ConfigParseError,
    /// Configuration contains invalid values
    ConfigValidationError,
    /// Environment variable has invalid value
    ConfigEnvError,

    // =========================================================================
    // Catalog Errors (E100-E199)
    // =========================================================================
    /// Pillar definitions file not found
    CatalogNotFound,
    /// Pillar definitions are malformed
    CatalogMalformed,
    /// Sub-requirement identifier could not be resolved
    CatalogUnresolved,

    // =========================================================================
    // Store Errors (E200-E299)
    // =========================================================================
    /// Version store JSON is malformed
    StoreMalformed,
    /// Version store write failed
    StoreWriteFailed,
    /// Illegal claim status transition
    StoreIllegalTransition,
    /// Checkpoint missing when resume was requested
    CheckpointMissing,
    /// Checkpoint exists but no resume flag was given
    CheckpointWouldClobber,
    /// Checkpoint schema version is newer than this binary understands
    CheckpointSchemaTooNew,
    /// Another run holds the state lock
    RunLockHeld,

    // =========================================================================
    // Gateway Errors (E300-E399)
    // =========================================================================
    /// Provider call failed after all retries
    GatewayRetriesExhausted,
    /// Provider returned a permanent error
    GatewayPermanent,
    /// Provider response failed schema validation
    GatewaySchemaInvalid,
    /// Provider call timed out
    GatewayTimeout,
    /// API key environment variable is unset
    GatewayMissingApiKey,

    // =========================================================================
    // Budget Errors (E400-E499)
    // =========================================================================
    /// Monetary budget exhausted
    BudgetExhausted,

    // =========================================================================
    // Pipeline Errors (E500-E599)
    // =========================================================================
    /// Required stage failed
    StageFailed,
    /// Run interrupted by signal
    Interrupted,
    /// Internal invariant violated
    Internal,
}

/// Catalog entry for an error code.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    /// Stable code, e.g. `SLR-E301`.
    pub code: &'static str,
    /// Subsystem category.
    pub category: ErrorCategory,
    /// Human-readable message template.
    pub message: &'static str,
    /// Remediation steps.
    pub remediation: &'static [&'static str],
}

impl ErrorCode {
    /// Catalog entry for this code.
    pub fn entry(self) -> ErrorEntry {
        match self {
            Self::ConfigReadError => ErrorEntry {
                code: "SLR-E001",
                category: ErrorCategory::Config,
                message: "configuration file could not be read",
                remediation: &[
                    "Check that the path passed via --config exists and is readable",
                ],
            },
            Self::ConfigParseError => ErrorEntry {
                code: "SLR-E002",
                category: ErrorCategory::Config,
                message: "configuration file is not valid TOML",
                remediation: &["Fix the reported TOML syntax error"],
            },
            Self::ConfigValidationError => ErrorEntry {
                code: "SLR-E003",
                category: ErrorCategory::Config,
                message: "configuration contains invalid values",
                remediation: &["Run with --dry-run to see every validation finding"],
            },
            Self::ConfigEnvError => ErrorEntry {
                code: "SLR-E004",
                category: ErrorCategory::Config,
                message: "environment variable override has an invalid value",
                remediation: &["Unset or correct the reported SLR_* variable"],
            },
            Self::CatalogNotFound => ErrorEntry {
                code: "SLR-E100",
                category: ErrorCategory::Catalog,
                message: "pillar definitions file not found",
                remediation: &["Set pillar_definitions_path to an existing JSON document"],
            },
            Self::CatalogMalformed => ErrorEntry {
                code: "SLR-E101",
                category: ErrorCategory::Catalog,
                message: "pillar definitions are malformed",
                remediation: &[
                    "Ensure identifiers are unique and shaped like Sub-1.1.1",
                    "Ensure every depends_on reference names an existing sub-requirement",
                ],
            },
            Self::CatalogUnresolved => ErrorEntry {
                code: "SLR-E102",
                category: ErrorCategory::Catalog,
                message: "sub-requirement identifier could not be resolved",
                remediation: &[
                    "Inspect quarantine.json and map the claim manually",
                    "Lower match_confidence_threshold if matches are systematically near-misses",
                ],
            },
            Self::StoreMalformed => ErrorEntry {
                code: "SLR-E200",
                category: ErrorCategory::Store,
                message: "version store JSON is malformed",
                remediation: &[
                    "Restore version_history.json from backup; the store is never salvaged silently",
                ],
            },
            Self::StoreWriteFailed => ErrorEntry {
                code: "SLR-E201",
                category: ErrorCategory::Store,
                message: "version store write failed",
                remediation: &["Check disk space and permissions on the output directory"],
            },
            Self::StoreIllegalTransition => ErrorEntry {
                code: "SLR-E202",
                category: ErrorCategory::Store,
                message: "illegal claim status transition",
                remediation: &["This is a bug; file an issue with the logged transition"],
            },
            Self::CheckpointMissing => ErrorEntry {
                code: "SLR-E210",
                category: ErrorCategory::Store,
                message: "no checkpoint found for resume",
                remediation: &["Run `slr checkpoints` to list resumable runs"],
            },
            Self::CheckpointWouldClobber => ErrorEntry {
                code: "SLR-E211",
                category: ErrorCategory::Store,
                message: "a checkpoint already exists for this output directory",
                remediation: &[
                    "Pass --resume to continue the interrupted run",
                    "Or move the existing checkpoint aside to start fresh",
                ],
            },
            Self::CheckpointSchemaTooNew => ErrorEntry {
                code: "SLR-E212",
                category: ErrorCategory::Store,
                message: "checkpoint was written by a newer version",
                remediation: &["Upgrade slr to at least the version that wrote the checkpoint"],
            },
            Self::RunLockHeld => ErrorEntry {
                code: "SLR-E220",
                category: ErrorCategory::Store,
                message: "another run holds the state lock",
                remediation: &[
                    "Wait for the other run to finish",
                    "If the process is dead, the stale lock is reclaimed automatically on retry",
                ],
            },
            Self::GatewayRetriesExhausted => ErrorEntry {
                code: "SLR-E300",
                category: ErrorCategory::Gateway,
                message: "LLM call failed after all retry attempts",
                remediation: &["Check provider status and network connectivity, then resume"],
            },
            Self::GatewayPermanent => ErrorEntry {
                code: "SLR-E301",
                category: ErrorCategory::Gateway,
                message: "LLM provider returned a permanent error",
                remediation: &["Inspect the provider error body; the request will not be retried"],
            },
            Self::GatewaySchemaInvalid => ErrorEntry {
                code: "SLR-E302",
                category: ErrorCategory::Gateway,
                message: "LLM response failed schema validation",
                remediation: &["Permanent for this request; consider a different model"],
            },
            Self::GatewayTimeout => ErrorEntry {
                code: "SLR-E303",
                category: ErrorCategory::Gateway,
                message: "LLM call exceeded its wall-clock timeout",
                remediation: &["Raise llm.timeout_secs for very large prompts"],
            },
            Self::GatewayMissingApiKey => ErrorEntry {
                code: "SLR-E304",
                category: ErrorCategory::Gateway,
                message: "API key environment variable is unset",
                remediation: &["Export the variable named by llm.api_key_env"],
            },
            Self::BudgetExhausted => ErrorEntry {
                code: "SLR-E400",
                category: ErrorCategory::Budget,
                message: "monetary budget exhausted",
                remediation: &[
                    "Raise budget_usd and resume; completed work is checkpointed",
                ],
            },
            Self::StageFailed => ErrorEntry {
                code: "SLR-E500",
                category: ErrorCategory::Pipeline,
                message: "required pipeline stage failed",
                remediation: &["See the stage error in the run summary, then resume"],
            },
            Self::Interrupted => ErrorEntry {
                code: "SLR-E501",
                category: ErrorCategory::Pipeline,
                message: "run interrupted by signal",
                remediation: &["Resume with `slr resume` to continue from the checkpoint"],
            },
            Self::Internal => ErrorEntry {
                code: "SLR-E599",
                category: ErrorCategory::Pipeline,
                message: "internal invariant violated",
                remediation: &["This is a bug; file an issue with the full log"],
            },
        }
    }

    /// Stable code string, e.g. `SLR-E400`.
    pub fn code(self) -> &'static str {
        self.entry().code
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entry = self.entry();
        write!(f, "{}: {}", entry.code, entry.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: &[ErrorCode] = &[
        ErrorCode::ConfigReadError,
        ErrorCode::ConfigParseError,
        ErrorCode::ConfigValidationError,
        ErrorCode::ConfigEnvError,
        ErrorCode::CatalogNotFound,
        ErrorCode::CatalogMalformed,
        ErrorCode::CatalogUnresolved,
        ErrorCode::StoreMalformed,
        ErrorCode::StoreWriteFailed,
        ErrorCode::StoreIllegalTransition,
        ErrorCode::CheckpointMissing,
        ErrorCode::CheckpointWouldClobber,
        ErrorCode::CheckpointSchemaTooNew,
        ErrorCode::RunLockHeld,
        ErrorCode::GatewayRetriesExhausted,
        ErrorCode::GatewayPermanent,
        ErrorCode::GatewaySchemaInvalid,
        ErrorCode::GatewayTimeout,
        ErrorCode::GatewayMissingApiKey,
        ErrorCode::BudgetExhausted,
        ErrorCode::StageFailed,
        ErrorCode::Interrupted,
        ErrorCode::Internal,
    ];

    #[test]
    fn codes_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for code in ALL {
            assert!(seen.insert(code.entry().code), "duplicate {}", code.entry().code);
        }
    }

    #[test]
    fn codes_sit_in_their_category_range() {
        for code in ALL {
            let entry = code.entry();
            let number: u32 = entry.code.trim_start_matches("SLR-E").parse().unwrap();
            let expected = match entry.category {
                ErrorCategory::Config => 1..100,
                ErrorCategory::Catalog => 100..200,
                ErrorCategory::Store => 200..300,
                ErrorCategory::Gateway => 300..400,
                ErrorCategory::Budget => 400..500,
                ErrorCategory::Pipeline => 500..600,
            };
            assert!(
                expected.contains(&number),
                "{} out of range for {:?}",
                entry.code,
                entry.category
            );
        }
    }

    #[test]
    fn every_entry_has_remediation() {
        for code in ALL {
            assert!(!code.entry().remediation.is_empty(), "{:?}", code);
        }
    }
}
