//! Rate and budget governor for outbound LLM calls.
//!
//! Process-wide state with an explicit lifecycle: constructed once by
//! the pipeline controller from configuration, consulted by the LLM
//! gateway before every outbound call, updated after every completed
//! call. Calls are never reordered — the governor only paces them.
//!
//! The per-minute ceiling is a sliding window over the timestamps of
//! recent permits, not a calendar minute. The monetary ceiling is
//! checked against the running total plus the caller's estimate before
//! the call is admitted, so a completed run can overshoot the budget by
//! at most one in-flight call.

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Width of the sliding rate window.
const WINDOW: Duration = Duration::from_secs(60);

// ── Config ───────────────────────────────────────────────────────────────

/// Governor limits, taken from configuration at run start.
#[derive(Debug, Clone, Copy)]
pub struct GovernorConfig {
    /// Maximum permits granted within any sliding 60-second window.
    pub calls_per_minute: u32,
    /// Cumulative monetary ceiling in USD.
    pub budget_usd: f64,
}

// ── Back-Pressure ────────────────────────────────────────────────────────

/// Why a permit was refused outright (as opposed to paced).
///
/// Budget refusal is not retryable at the call level: the caller must
/// abort the current high-level operation at a claim/paper boundary.
#[derive(Debug, Clone, Error, Serialize)]
pub enum BackPressure {
    #[error(
        "budget exhausted: spent ${spent:.4} of ${budget:.2}, next call estimated ${estimated:.4}"
    )]
    BudgetExhausted {
        spent: f64,
        budget: f64,
        estimated: f64,
    },
}

/// Proof that the governor admitted one call.
#[derive(Debug)]
pub struct Permit {
    /// Estimated cost the permit was granted against.
    pub estimated_cost: f64,
}

// ── Cost Snapshot ────────────────────────────────────────────────────────

/// Point-in-time accounting, flushed to the cost report at teardown.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CostSnapshot {
    /// Total actual spend so far (USD).
    pub total_cost_usd: f64,
    /// Budget ceiling (USD).
    pub budget_usd: f64,
    /// Calls that went to the provider.
    pub provider_calls: u64,
    /// Calls satisfied from the response cache.
    pub cached_calls: u64,
    /// Estimated spend avoided by cache hits (USD).
    pub cache_savings_usd: f64,
    /// Provider calls per pipeline stage.
    pub calls_by_stage: BTreeMap<String, u64>,
}

impl CostSnapshot {
    /// Cache hit rate across all gateway lookups.
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.provider_calls + self.cached_calls;
        if total == 0 {
            return 0.0;
        }
        self.cached_calls as f64 / total as f64
    }
}

// ── Governor ─────────────────────────────────────────────────────────────

#[derive(Debug)]
struct GovernorState {
    /// Permit grant times inside the sliding window.
    window: VecDeque<Instant>,
    total_cost: f64,
    provider_calls: u64,
    cached_calls: u64,
    cache_savings: f64,
    calls_by_stage: BTreeMap<String, u64>,
    budget_warned: bool,
}

/// Paces and meters outbound LLM calls.
#[derive(Debug)]
pub struct Governor {
    config: GovernorConfig,
    state: Mutex<GovernorState>,
}

impl Governor {
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(GovernorState {
                window: VecDeque::new(),
                total_cost: 0.0,
                provider_calls: 0,
                cached_calls: 0,
                cache_savings: 0.0,
                calls_by_stage: BTreeMap::new(),
                budget_warned: false,
            }),
        }
    }

    /// Acquire a permit for one outbound call.
    ///
    /// Waits cooperatively while the sliding window is full. Returns
    /// [`BackPressure::BudgetExhausted`] when admitting the call would
    /// push the running total past the budget; the caller must then
    /// abort its high-level operation, not retry the single call.
    pub async fn acquire(&self, estimated_cost: f64) -> Result<Permit, BackPressure> {
        loop {
            let wait_until = {
                let mut state = self.state.lock().expect("governor lock");

                if state.total_cost + estimated_cost > self.config.budget_usd {
                    if !state.budget_warned {
                        state.budget_warned = true;
                        warn!(
                            spent = state.total_cost,
                            budget = self.config.budget_usd,
                            estimated = estimated_cost,
                            "budget exhausted; refusing further calls"
                        );
                    }
                    return Err(BackPressure::BudgetExhausted {
                        spent: state.total_cost,
                        budget: self.config.budget_usd,
                        estimated: estimated_cost,
                    });
                }

                let now = Instant::now();
                while let Some(front) = state.window.front() {
                    if now.duration_since(*front) >= WINDOW {
                        state.window.pop_front();
                    } else {
                        break;
                    }
                }

                if (state.window.len() as u32) < self.config.calls_per_minute {
                    state.window.push_back(now);
                    return Ok(Permit { estimated_cost });
                }

                // Window full: wait until the oldest permit ages out.
                let oldest = *state.window.front().expect("non-empty window");
                oldest + WINDOW
            };

            debug!("rate window full; pacing");
            tokio::time::sleep_until(wait_until).await;
        }
    }

    /// Record the outcome of one gateway lookup.
    ///
    /// For provider calls, `actual_cost` is the billed amount. For cache
    /// hits, pass `cached = true` and `actual_cost = 0.0`;
    /// `would_have_cost` is then credited to the savings ledger.
    pub fn record(&self, stage: &str, actual_cost: f64, cached: bool, would_have_cost: f64) {
        let mut state = self.state.lock().expect("governor lock");
        if cached {
            state.cached_calls += 1;
            state.cache_savings += would_have_cost;
        } else {
            state.provider_calls += 1;
            state.total_cost += actual_cost;
            *state.calls_by_stage.entry(stage.to_string()).or_default() += 1;
        }
    }

    /// Whether the budget still has room for a call of the given size.
    pub fn has_budget_for(&self, estimated_cost: f64) -> bool {
        let state = self.state.lock().expect("governor lock");
        state.total_cost + estimated_cost <= self.config.budget_usd
    }

    /// Current accounting snapshot.
    pub fn snapshot(&self) -> CostSnapshot {
        let state = self.state.lock().expect("governor lock");
        CostSnapshot {
            total_cost_usd: state.total_cost,
            budget_usd: self.config.budget_usd,
            provider_calls: state.provider_calls,
            cached_calls: state.cached_calls,
            cache_savings_usd: state.cache_savings,
            calls_by_stage: state.calls_by_stage.clone(),
        }
    }

    /// Log the final accounting at teardown.
    pub fn log_teardown(&self) {
        let snapshot = self.snapshot();
        info!(
            total_cost_usd = snapshot.total_cost_usd,
            budget_usd = snapshot.budget_usd,
            provider_calls = snapshot.provider_calls,
            cached_calls = snapshot.cached_calls,
            cache_savings_usd = snapshot.cache_savings_usd,
            cache_hit_rate = snapshot.cache_hit_rate(),
            "governor teardown"
        );
    }
}
