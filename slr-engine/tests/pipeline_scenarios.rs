//! End-to-end pipeline scenarios against a scripted oracle.
//!
//! Each test assembles a full pipeline over a temp directory: a corpus
//! of sidecar-text papers, a pillar catalog on disk, and a mock oracle
//! whose handler is a pure function of the request — so replays and
//! resumed runs are exactly reproducible.

use std::collections::BTreeMap;
use std::sync::Arc;

use slr_common::catalog::PillarCatalog;
use slr_common::config::Config;
use slr_common::types::{ClaimStatus, VersionHistory};
use slr_engine::cancellation::CancellationToken;
use slr_engine::checkpoint::{scan_checkpoints, Stage, StageStatus};
use slr_engine::corpus::SidecarTextSource;
use slr_engine::mock_oracle::{ok_response, MockOracle};
use slr_engine::oracle::{OracleError, OracleRequest, OracleResponse};
use slr_engine::pipeline::{Pipeline, RunOptions};
use slr_engine::store::VersionStore;

// ── Fixtures ─────────────────────────────────────────────────────────────

const CATALOG_JSON: &str = r#"{
    "Pillar-1": {
        "title": "Model Capability",
        "requirements": {
            "Req-1.1": {
                "title": "Accuracy",
                "sub_requirements": {
                    "Sub-1.1.1": {
                        "title": "Benchmark accuracy exceeds baseline",
                        "keywords": ["accuracy", "benchmark"]
                    },
                    "Sub-1.1.2": {
                        "title": "Generalization across domains",
                        "keywords": ["generalization"]
                    }
                }
            }
        }
    }
}"#;

struct TestEnv {
    dir: tempfile::TempDir,
    config: Config,
}

impl TestEnv {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("papers")).unwrap();
        std::fs::create_dir_all(root.join("output")).unwrap();
        std::fs::write(root.join("pillar_definitions.json"), CATALOG_JSON).unwrap();

        let mut config = Config::default();
        config.data_dir = root.join("papers");
        config.output_dir = root.join("output");
        config.version_history_path = root.join("output/version_history.json");
        config.pillar_definitions_path = root.join("pillar_definitions.json");
        config.budget_usd = 100.0;
        config.api_calls_per_minute = 100_000;
        Self { dir, config }
    }

    fn add_paper(&self, name: &str, text: &str) {
        let path = self.dir.path().join("papers").join(name);
        std::fs::write(&path, b"%PDF").unwrap();
        std::fs::write(
            self.dir.path().join("papers").join(format!("{name}.txt")),
            text,
        )
        .unwrap();
    }

    fn catalog(&self) -> PillarCatalog {
        PillarCatalog::load(&self.config.pillar_definitions_path).unwrap()
    }

    fn pipeline(
        &self,
        handler: impl Fn(&OracleRequest) -> Result<OracleResponse, OracleError>
            + Send
            + Sync
            + 'static,
    ) -> Pipeline {
        Pipeline::new(
            self.config.clone(),
            self.catalog(),
            Arc::new(MockOracle::with_handler(handler)),
            Arc::new(SidecarTextSource),
            CancellationToken::new(),
        )
    }

    fn history(&self) -> VersionHistory {
        VersionStore::new(self.config.version_history_path.clone()).load()
    }
}

/// Parse (claim_id, claim_text) pairs out of a judge prompt.
fn claims_in_prompt(user: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut current_id: Option<String> = None;
    for line in user.lines() {
        if let Some(id) = line.strip_prefix("claim_id: ") {
            current_id = Some(id.trim().to_string());
        } else if let Some(text) = line.strip_prefix("claim: ") {
            if let Some(id) = current_id.take() {
                pairs.push((id, text.trim().to_string()));
            }
        }
    }
    pairs
}

/// Build a judgment entry with the given dimensional scores.
fn judgment(
    claim_id: &str,
    scores: (u8, u8, u8, u8, bool, u8),
    study_type: &str,
) -> serde_json::Value {
    let (strength, rigor, relevance, directness, is_recent, reproducibility) = scores;
    serde_json::json!({
        "claim_id": claim_id,
        "strength": strength,
        "rigor": rigor,
        "relevance": relevance,
        "directness": directness,
        "is_recent": is_recent,
        "reproducibility": reproducibility,
        "study_type": study_type,
        "confidence": "medium",
        "notes": "scored by scripted oracle"
    })
}

/// Judge handler: pick scores per claim text.
fn judge_response(
    req: &OracleRequest,
    score_for: impl Fn(&str) -> (u8, u8, u8, u8, bool, u8),
) -> Result<OracleResponse, OracleError> {
    let judgments: Vec<serde_json::Value> = claims_in_prompt(&req.user)
        .into_iter()
        .map(|(id, text)| judgment(&id, score_for(&text), "experimental"))
        .collect();
    ok_response(serde_json::json!({ "judgments": judgments }), 0.01)
}

fn extraction(sub: &str, text: &str, quote: &str) -> serde_json::Value {
    serde_json::json!({
        "sub_requirement": sub,
        "text": text,
        "supporting_quote": quote
    })
}

// ── Scenario 1: empty corpus ─────────────────────────────────────────────

#[tokio::test]
async fn empty_corpus_exits_zero_with_empty_gap_report() {
    let env = TestEnv::new();
    let mut pipeline = env.pipeline(|_req| {
        panic!("no oracle calls expected for an empty corpus");
    });

    let outcome = pipeline.run(RunOptions::default()).await.unwrap();
    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.checkpoint.execution_metrics.total_papers, 0);

    let report: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(env.config.gap_report_path()).unwrap(),
    )
    .unwrap();
    for (_, coverage) in report["sub_requirements"].as_object().unwrap() {
        assert_eq!(coverage["completeness_percent"], 0.0);
        assert_eq!(coverage["contributing_papers"].as_array().unwrap().len(), 0);
    }
    // The derived CSV exists with just the header.
    let csv = std::fs::read_to_string(env.config.csv_database_path()).unwrap();
    assert_eq!(csv.lines().count(), 1);
}

// ── Scenario 2: single paper, single approved claim ──────────────────────

#[tokio::test]
async fn single_paper_single_approved_claim() {
    let env = TestEnv::new();
    env.add_paper(
        "paper_a.pdf",
        "Introduction. X achieves Y at Z=0.9 on the benchmark. Conclusion.",
    );

    let mut pipeline = env.pipeline(|req| match req.task.as_str() {
        "extract_claims" => ok_response(
            serde_json::json!({
                "claims": [extraction(
                    "Sub-1.1.1",
                    "X achieves Y at Z=0.9",
                    "X achieves Y at Z=0.9"
                )]
            }),
            0.02,
        ),
        // Primary and consensus framings agree.
        "judge_claims" | "judge_claims_skeptical" | "judge_claims_charitable" => {
            judge_response(req, |_| (4, 3, 4, 2, true, 3))
        }
        "deep_review_claims" => ok_response(serde_json::json!({"claims": []}), 0.01),
        other => panic!("unexpected task {other}"),
    });

    let outcome = pipeline.run(RunOptions::default()).await.unwrap();
    assert_eq!(outcome.exit_code, 0);

    let history = env.history();
    let versions = &history.papers["paper_a.pdf"];
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].changes.status.to_string(), "initial");
    assert_eq!(versions[1].changes.status.to_string(), "judge_update");

    let claims = history.current_claims("paper_a.pdf");
    assert_eq!(claims.len(), 1);
    let claim = &claims[0];
    assert_eq!(claim.status, ClaimStatus::Approved);
    let quality = claim.evidence_quality.as_ref().unwrap();
    assert!((quality.composite - 3.216_666_6).abs() < 1e-3);

    // Gap report: first-claim bonus only (publication year unknown).
    let report: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(env.config.gap_report_path()).unwrap(),
    )
    .unwrap();
    assert_eq!(
        report["sub_requirements"]["Sub-1.1.1"]["completeness_percent"],
        35.0
    );
    assert_eq!(
        report["sub_requirements"]["Sub-1.1.2"]["completeness_percent"],
        0.0
    );

    // The CSV row matches the store.
    let csv = std::fs::read_to_string(env.config.csv_database_path()).unwrap();
    assert!(csv.contains(claim.claim_id.as_str()));
    assert!(csv.contains("approved"));
}

// ── Scenario 3: rejection, appeal, approval ──────────────────────────────

const WEAK_TEXT: &str = "the approach seems promising for accuracy";
const AMENDED_TEXT: &str = "the approach improves benchmark accuracy by 12 points over baseline";

#[tokio::test]
async fn rejection_then_appeal_then_approval() {
    let env = TestEnv::new();
    env.add_paper(
        "paper_b.pdf",
        "Results: the approach improves benchmark accuracy by 12 points over baseline in all runs.",
    );

    let mut pipeline = env.pipeline(|req| match req.task.as_str() {
        "extract_claims" => ok_response(
            serde_json::json!({
                "claims": [extraction("Sub-1.1.1", WEAK_TEXT, "seems promising")]
            }),
            0.02,
        ),
        "amend_claim" => ok_response(
            serde_json::json!({
                "amendable": true,
                "text": AMENDED_TEXT,
                "supporting_quote": "improves benchmark accuracy by 12 points"
            }),
            0.02,
        ),
        "judge_claims" | "judge_claims_skeptical" | "judge_claims_charitable" => {
            judge_response(req, |text| {
                if text == AMENDED_TEXT {
                    (4, 4, 4, 2, true, 4) // composite 3.52: approve
                } else {
                    (2, 3, 3, 1, false, 2) // composite 2.23: reject
                }
            })
        }
        "deep_review_claims" => ok_response(serde_json::json!({"claims": []}), 0.01),
        other => panic!("unexpected task {other}"),
    });

    let outcome = pipeline.run(RunOptions::default()).await.unwrap();
    assert_eq!(outcome.exit_code, 0);

    let history = env.history();
    let versions = &history.papers["paper_b.pdf"];
    let changes: Vec<String> = versions
        .iter()
        .map(|v| v.changes.status.to_string())
        .collect();
    assert_eq!(
        changes,
        vec!["initial", "judge_update", "dra_appeal", "judge_update"]
    );

    let claims = history.current_claims("paper_b.pdf");
    assert_eq!(claims.len(), 2);
    let original = claims.iter().find(|c| c.text == WEAK_TEXT).unwrap();
    let amended = claims.iter().find(|c| c.text == AMENDED_TEXT).unwrap();

    // Version 2 recorded the rejection; the current original carries the
    // appealed marker.
    let v2_claims: Vec<_> = versions[1].review.claims().collect();
    assert!(v2_claims
        .iter()
        .any(|c| c.text == WEAK_TEXT && c.status == ClaimStatus::Rejected));
    assert_eq!(original.status, ClaimStatus::Appealed);

    assert_eq!(amended.status, ClaimStatus::Approved);
    assert_eq!(
        amended.prior_rejection_id.as_ref(),
        Some(&original.claim_id)
    );

    // A second DRA round never re-appeals the amended claim's lineage.
    let rejected_now: Vec<_> = claims
        .iter()
        .filter(|c| c.status == ClaimStatus::Rejected)
        .collect();
    assert!(rejected_now.is_empty());
}

// ── Scenario 4: budget exhaustion mid-judge, then resume ─────────────────

fn budget_scenario_handler(req: &OracleRequest) -> Result<OracleResponse, OracleError> {
    match req.task.as_str() {
        // Journal review burns most of the budget.
        "extract_claims" => {
            let claims: Vec<serde_json::Value> = [
                "alpha finding about benchmark numbers",
                "beta observation concerning datasets used",
                "gamma result regarding training cost",
                "delta conclusion on evaluation protocol",
            ]
            .iter()
            .enumerate()
            .map(|(i, text)| {
                extraction(
                    if i % 2 == 0 { "Sub-1.1.1" } else { "Sub-1.1.2" },
                    text,
                    "finding",
                )
            })
            .collect();
            let mut response = ok_response(serde_json::json!({ "claims": claims }), 0.45)?;
            response.cost_usd = 0.45;
            Ok(response)
        }
        "judge_claims" | "judge_claims_skeptical" | "judge_claims_charitable" => {
            let mut response = judge_response(req, |_| (5, 4, 5, 3, true, 4))?;
            response.cost_usd = 0.06;
            Ok(response)
        }
        other => panic!("unexpected task {other}"),
    }
}

#[tokio::test]
async fn budget_exhaustion_mid_judge_then_resume_completes() {
    let env = TestEnv::new();
    env.add_paper("paper_c.pdf", "A paper with several distinct findings inside.");

    let mut config = env.config.clone();
    config.budget_usd = 0.50;
    config.claim_batch_size = 2;
    let mut pipeline = Pipeline::new(
        config,
        env.catalog(),
        Arc::new(MockOracle::with_handler(budget_scenario_handler)),
        Arc::new(SidecarTextSource),
        CancellationToken::new(),
    );

    let outcome = pipeline.run(RunOptions::default()).await.unwrap();
    assert_eq!(outcome.exit_code, 4);
    assert_eq!(
        outcome.checkpoint.stage(Stage::Judge).status,
        StageStatus::Failed
    );
    assert_eq!(outcome.checkpoint.stage(Stage::Judge).exit_code, Some(4));

    // First batch judged and persisted; second remains pending.
    let history = env.history();
    let claims = history.current_claims("paper_c.pdf");
    let approved = claims
        .iter()
        .filter(|c| c.status == ClaimStatus::Approved)
        .count();
    let pending = claims
        .iter()
        .filter(|c| c.status == ClaimStatus::PendingJudgeReview)
        .count();
    assert_eq!(approved, 2);
    assert_eq!(pending, 2);

    // Resume with a raised budget completes the run.
    let mut raised = env.config.clone();
    raised.budget_usd = 5.0;
    raised.claim_batch_size = 2;
    let mut resumed = Pipeline::new(
        raised,
        env.catalog(),
        Arc::new(MockOracle::with_handler(budget_scenario_handler)),
        Arc::new(SidecarTextSource),
        CancellationToken::new(),
    );
    let outcome = resumed
        .run(RunOptions {
            resume: true,
            ..RunOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(outcome.exit_code, 0);

    let history = env.history();
    let claims = history.current_claims("paper_c.pdf");
    assert!(claims
        .iter()
        .all(|c| c.status == ClaimStatus::Approved));
}

// ── Scenario 6: resume after crash reproduces the uninterrupted run ──────

fn deterministic_handler(req: &OracleRequest) -> Result<OracleResponse, OracleError> {
    match req.task.as_str() {
        "extract_claims" => ok_response(
            serde_json::json!({
                "claims": [
                    extraction("Sub-1.1.1", WEAK_TEXT, "seems promising"),
                    extraction(
                        "Sub-1.1.2",
                        "generalization holds across two domains in testing",
                        "across two domains"
                    )
                ]
            }),
            0.02,
        ),
        "amend_claim" => ok_response(
            serde_json::json!({
                "amendable": true,
                "text": AMENDED_TEXT,
                "supporting_quote": "improves benchmark accuracy"
            }),
            0.02,
        ),
        "judge_claims" | "judge_claims_skeptical" | "judge_claims_charitable" => {
            judge_response(req, |text| {
                if text == WEAK_TEXT {
                    (2, 3, 3, 1, false, 2)
                } else {
                    (4, 4, 4, 2, true, 4)
                }
            })
        }
        "deep_review_claims" => ok_response(serde_json::json!({"claims": []}), 0.01),
        other => panic!("unexpected task {other}"),
    }
}

#[tokio::test]
async fn resume_after_crash_matches_uninterrupted_run() {
    // Uninterrupted reference run.
    let reference = TestEnv::new();
    reference.add_paper(
        "paper_d.pdf",
        "Results: the approach improves benchmark accuracy by 12 points over baseline; \
         generalization holds across two domains in testing.",
    );
    let mut pipeline = reference.pipeline(deterministic_handler);
    let uninterrupted = pipeline.run(RunOptions::default()).await.unwrap();
    assert_eq!(uninterrupted.exit_code, 0);

    // Crashed run: execute journal_review and judge as individual
    // stages, then resume the rest.
    let crashed = TestEnv::new();
    crashed.add_paper(
        "paper_d.pdf",
        "Results: the approach improves benchmark accuracy by 12 points over baseline; \
         generalization holds across two domains in testing.",
    );
    for stage in [Stage::JournalReview, Stage::Judge] {
        let mut partial = crashed.pipeline(deterministic_handler);
        let outcome = partial
            .run(RunOptions {
                single_stage: Some(stage),
                ..RunOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
    }

    // The rejections visible now are exactly what the DRA will consume
    // on resume.
    let rejected_before: Vec<String> = crashed
        .history()
        .all_current_claims()
        .into_iter()
        .filter(|c| c.status == ClaimStatus::Rejected)
        .map(|c| c.claim_id.to_string())
        .collect();
    assert_eq!(rejected_before.len(), 1);

    let mut resumed = crashed.pipeline(deterministic_handler);
    let outcome = resumed
        .run(RunOptions {
            resume: true,
            ..RunOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(outcome.exit_code, 0);

    // Final coverage matches the uninterrupted run exactly.
    assert!(
        (outcome.checkpoint.overall_coverage - uninterrupted.checkpoint.overall_coverage).abs()
            < 1e-9
    );

    // And the claim-level outcome is identical.
    let claims_of = |history: &VersionHistory| -> BTreeMap<String, ClaimStatus> {
        history
            .all_current_claims()
            .into_iter()
            .map(|c| (c.claim_id.to_string(), c.status))
            .collect()
    };
    assert_eq!(
        claims_of(&reference.history()),
        claims_of(&crashed.history())
    );
}

// ── Checkpoint listing over multiple runs ────────────────────────────────

#[tokio::test]
async fn completed_checkpoint_allows_incremental_follow_up() {
    let env = TestEnv::new();
    let mut first = env.pipeline(|_req| panic!("no calls on empty corpus"));
    let outcome = first.run(RunOptions::default()).await.unwrap();
    assert_eq!(outcome.exit_code, 0);

    // A completed run does not block a fresh one; the follow-up records
    // lineage to its parent.
    let mut second = env.pipeline(|_req| panic!("no calls on empty corpus"));
    let follow_up = second.run(RunOptions::default()).await.unwrap();
    assert_eq!(follow_up.exit_code, 0);
    assert_eq!(
        follow_up.checkpoint.parent_run_id.as_ref(),
        Some(&outcome.checkpoint.run_id)
    );

    let checkpoints = scan_checkpoints(&env.config.checkpoint_dir());
    assert_eq!(checkpoints.len(), 2);
}
