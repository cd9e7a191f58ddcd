//! SLR convergence engine.
//!
//! Everything between the corpus and the reports: the append-only
//! version store, the rate/budget governor, the typed LLM gateway with
//! its response cache, the four analyzers (journal reviewer, judge,
//! deep requirements analyzer, deep reviewer), deduplication, gap
//! analysis, the ROI trigger evaluator, and the pipeline controller
//! that sequences it all with checkpoint/resume semantics.

pub mod cache;
pub mod cancellation;
pub mod checkpoint;
pub mod corpus;
pub mod csv_sync;
pub mod dedup;
pub mod deep_review;
pub mod dra;
pub mod gap;
pub mod gateway;
pub mod governor;
pub mod judge;
pub mod lock;
pub mod mock_oracle;
pub mod oracle;
pub mod pipeline;
pub mod quarantine;
pub mod report;
pub mod reviewer;
pub mod store;
pub mod trigger;

pub use pipeline::{Pipeline, PipelineError, PipelineOutcome, RunOptions};
