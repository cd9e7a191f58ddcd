//! SLR — systematic literature review pipeline.
//!
//! Single executable driving the convergence engine: full runs,
//! resume, individual stages, checkpoint inspection, corpus scanning,
//! and the CSV sync.

#![forbid(unsafe_code)]

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use slr_common::catalog::PillarCatalog;
use slr_common::config::Config;
use slr_engine::cancellation::install_signal_handler;
use slr_engine::checkpoint::{scan_checkpoints, Stage};
use slr_engine::corpus::{discover_papers, SidecarTextSource};
use slr_engine::csv_sync::sync_to_csv;
use slr_engine::oracle::HttpOracle;
use slr_engine::pipeline::{
    Pipeline, RunOptions, EXIT_CONFIG_ERROR, EXIT_INTERRUPTED, EXIT_SUCCESS,
};
use slr_engine::store::VersionStore;

#[derive(Parser)]
#[command(name = "slr")]
#[command(author, version, about = "Systematic literature review pipeline")]
struct Cli {
    /// Path to the configuration file (TOML).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full pipeline to convergence.
    Run {
        /// Validate configuration and print the plan; make no LLM calls.
        #[arg(long)]
        dry_run: bool,
        /// Re-run analyzers over already-ingested papers.
        #[arg(long)]
        force: bool,
        /// Delete the LLM response cache before starting.
        #[arg(long)]
        clear_cache: bool,
    },
    /// Resume an interrupted pipeline from its checkpoint.
    Resume {
        /// Start at this stage, ignoring earlier stages' status.
        #[arg(long, value_name = "STAGE")]
        from_stage: Option<String>,
        /// Resume a specific checkpoint file instead of the newest.
        #[arg(long, value_name = "PATH")]
        checkpoint: Option<PathBuf>,
    },
    /// Run a single pipeline stage.
    Stage {
        /// Stage name (journal_review, judge, dra, sync_to_csv,
        /// gap_analysis, deep_review).
        name: String,
    },
    /// List checkpoints, newest first.
    Checkpoints,
    /// Scan the data directory for papers.
    Scan,
    /// Sync the version store to the CSV database.
    SyncCsv,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("SLR_LOG").unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let code = dispatch(cli).await;
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

async fn dispatch(cli: Cli) -> i32 {
    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(code) => return code,
    };

    match cli.command {
        Command::Run {
            dry_run,
            force,
            clear_cache,
        } => {
            let mut config = config;
            config.dry_run |= dry_run;
            config.force |= force;
            config.clear_cache |= clear_cache;
            run_pipeline(config, RunOptions::default()).await
        }
        Command::Resume {
            from_stage,
            checkpoint,
        } => {
            let from = match from_stage.as_deref().map(str::parse::<Stage>).transpose() {
                Ok(stage) => stage,
                Err(err) => {
                    report_error(&err);
                    return EXIT_CONFIG_ERROR;
                }
            };
            run_pipeline(
                config,
                RunOptions {
                    resume: true,
                    resume_from: from,
                    resume_checkpoint: checkpoint,
                    single_stage: None,
                },
            )
            .await
        }
        Command::Stage { name } => {
            let stage = match name.parse::<Stage>() {
                Ok(stage) => stage,
                Err(err) => {
                    report_error(&err);
                    return EXIT_CONFIG_ERROR;
                }
            };
            run_pipeline(
                config,
                RunOptions {
                    single_stage: Some(stage),
                    ..RunOptions::default()
                },
            )
            .await
        }
        Command::Checkpoints => list_checkpoints(&config),
        Command::Scan => scan_corpus(&config),
        Command::SyncCsv => sync_csv(&config),
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config, i32> {
    match Config::load(path) {
        Ok(config) => Ok(config),
        Err(err) => {
            report_error(&err.to_string());
            Err(EXIT_CONFIG_ERROR)
        }
    }
}

async fn run_pipeline(config: Config, options: RunOptions) -> i32 {
    let catalog = match PillarCatalog::load(&config.pillar_definitions_path) {
        Ok(catalog) => catalog,
        Err(err) => {
            report_error(&err.to_string());
            return EXIT_CONFIG_ERROR;
        }
    };

    if config.dry_run {
        // The plan needs no provider and makes no calls.
        let pipeline = Pipeline::new(
            config.clone(),
            catalog,
            Arc::new(slr_engine::mock_oracle::MockOracle::returning(
                serde_json::json!({}),
                0.0,
            )),
            Arc::new(SidecarTextSource),
            install_signal_handler(),
        );
        if let Err(err) = config.ensure_valid() {
            println!("{}", pipeline.render_plan());
            report_error(&err.to_string());
            return EXIT_CONFIG_ERROR;
        }
        println!("{}", pipeline.render_plan());
        return EXIT_SUCCESS;
    }

    let provider = match HttpOracle::from_config(&config.llm) {
        Ok(provider) => Arc::new(provider),
        Err(err) => {
            report_error(&err.to_string());
            return EXIT_CONFIG_ERROR;
        }
    };

    let cancel = install_signal_handler();
    let mut pipeline = Pipeline::new(
        config,
        catalog,
        provider,
        Arc::new(SidecarTextSource),
        cancel.clone(),
    );

    match pipeline.run(options).await {
        Ok(outcome) => {
            println!("{}", outcome.summary);
            if outcome.exit_code == EXIT_INTERRUPTED {
                info!("interrupted; checkpoint written");
            }
            print_remediation(outcome.exit_code);
            outcome.exit_code
        }
        Err(err) => {
            report_error(&err.to_string());
            print_remediation(err.exit_code());
            err.exit_code()
        }
    }
}

/// Print catalogued remediation steps for a failing exit code.
fn print_remediation(exit_code: i32) {
    use slr_common::errors::ErrorCode;
    let code = match exit_code {
        x if x == slr_engine::pipeline::EXIT_STAGE_FAILED => ErrorCode::StageFailed,
        x if x == slr_engine::pipeline::EXIT_BUDGET_EXHAUSTED => ErrorCode::BudgetExhausted,
        x if x == slr_engine::pipeline::EXIT_NO_CHECKPOINT => ErrorCode::CheckpointMissing,
        x if x == EXIT_INTERRUPTED => ErrorCode::Interrupted,
        _ => return,
    };
    let entry = code.entry();
    eprintln!("{}: {}", entry.code, entry.message);
    for step in entry.remediation {
        eprintln!("  - {step}");
    }
}

fn list_checkpoints(config: &Config) -> i32 {
    let checkpoints = scan_checkpoints(&config.checkpoint_dir());
    if checkpoints.is_empty() {
        println!(
            "no checkpoints under {}",
            config.checkpoint_dir().display()
        );
        return EXIT_SUCCESS;
    }
    println!("{:<44} {:<22} {:<10} {}", "RUN", "UPDATED", "COVERAGE", "STATE");
    for (path, checkpoint) in checkpoints {
        let state = if checkpoint.has_failures() {
            "resumable (failed stage)"
        } else if checkpoint
            .stages
            .values()
            .any(|r| r.status == slr_engine::checkpoint::StageStatus::Running)
        {
            "resumable (interrupted)"
        } else {
            "completed"
        };
        println!(
            "{:<44} {:<22} {:<10.1} {}",
            checkpoint.run_id,
            checkpoint.updated_at.format("%Y-%m-%d %H:%M:%S"),
            checkpoint.overall_coverage * 100.0,
            state,
        );
        println!("    {}", path.display());
    }
    EXIT_SUCCESS
}

fn scan_corpus(config: &Config) -> i32 {
    match discover_papers(&config.data_dir) {
        Ok(papers) => {
            println!(
                "{} paper(s) under {}",
                papers.len(),
                config.data_dir.display()
            );
            for paper in papers {
                let year = paper
                    .publication_year
                    .map(|y| y.to_string())
                    .unwrap_or_else(|| "----".to_string());
                println!("  [{year}] {}", paper.paper_id);
            }
            EXIT_SUCCESS
        }
        Err(err) => {
            report_error(&err.to_string());
            EXIT_CONFIG_ERROR
        }
    }
}

fn sync_csv(config: &Config) -> i32 {
    let store = VersionStore::new(config.version_history_path.clone());
    let history = store.load();
    match sync_to_csv(&history, &config.csv_database_path()) {
        Ok(rows) => {
            println!(
                "{} row(s) written to {}",
                rows,
                config.csv_database_path().display()
            );
            EXIT_SUCCESS
        }
        Err(err) => {
            report_error(&err.to_string());
            slr_engine::pipeline::EXIT_STAGE_FAILED
        }
    }
}

/// Render an error through miette's fancy reporter.
fn report_error(message: &str) {
    let report = miette::Report::msg(message.to_string());
    eprintln!("{report:?}");
}
