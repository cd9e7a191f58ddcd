//! Typed LLM gateway: prompt in, validated struct out.
//!
//! Call path for a cache miss: acquire a governor permit, issue the
//! provider call under a wall-clock timeout, classify any failure
//! (transient errors retry with exponential backoff and jitter,
//! honoring provider `retry-after`; permanent errors surface
//! immediately), re-issue continuations for truncated output, validate
//! the JSON against the expected response type, persist to the
//! response cache, and record the billed cost. Cache hits skip the
//! governor's rate window entirely and credit the savings ledger.

use rand::Rng;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::ResponseCache;
use crate::governor::{BackPressure, Governor};
use crate::oracle::{
    OracleError, OracleProvider, OracleRequest, OracleResponse, COMPLETION_COST_PER_1K,
    PROMPT_COST_PER_1K,
};

/// Assumed completion size for pre-call cost estimates (tokens).
const ESTIMATED_COMPLETION_TOKENS: f64 = 800.0;
/// Maximum continuation rounds for truncated output.
const MAX_CONTINUATIONS: u32 = 2;

// ── Typed Prompt ─────────────────────────────────────────────────────────

/// A declarative prompt whose response deserializes into `T`.
///
/// The JSON schema for `T` is derived and embedded into the request, so
/// the provider is asked for exactly the shape the caller will parse.
#[derive(Debug, Clone)]
pub struct TypedPrompt<T> {
    /// Short task label; namespaces the cache and logs.
    pub task: String,
    /// System context.
    pub system: String,
    /// User content.
    pub user: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T: JsonSchema + DeserializeOwned> TypedPrompt<T> {
    pub fn new(
        task: impl Into<String>,
        system: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            task: task.into(),
            system: system.into(),
            user: user.into(),
            _marker: PhantomData,
        }
    }

    /// Render the provider request, deriving the response schema.
    pub fn to_request(&self) -> OracleRequest {
        let schema = schemars::gen::SchemaGenerator::default().into_root_schema_for::<T>();
        OracleRequest {
            task: self.task.clone(),
            system: self.system.clone(),
            user: self.user.clone(),
            schema: serde_json::to_value(schema).unwrap_or_default(),
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The governor refused the call; the stage must abort at a
    /// claim/paper boundary.
    #[error(transparent)]
    BackPressure(#[from] BackPressure),

    /// Transient failures persisted through every retry attempt.
    #[error("task {task}: retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        task: String,
        attempts: u32,
        last_error: String,
    },

    /// The provider rejected the request permanently.
    #[error("task {task}: permanent provider failure: {message}")]
    Permanent { task: String, message: String },

    /// The response parsed as JSON but not as the expected type. Counts
    /// as permanent; never retried.
    #[error("task {task}: response failed schema validation: {message}")]
    SchemaInvalid { task: String, message: String },
}

// ── Gateway Config ───────────────────────────────────────────────────────

/// Retry and timeout policy.
#[derive(Debug, Clone, Copy)]
pub struct GatewayConfig {
    /// Attempts per call, including the first (default 3).
    pub max_attempts: u32,
    /// Base delay for exponential backoff (default 5 s).
    pub base_delay: Duration,
    /// Wall-clock timeout per attempt (default 120 s).
    pub timeout: Duration,
}

impl From<&slr_common::config::LlmConfig> for GatewayConfig {
    fn from(llm: &slr_common::config::LlmConfig) -> Self {
        Self {
            max_attempts: llm.max_attempts.max(1),
            base_delay: Duration::from_secs(llm.base_delay_secs),
            timeout: Duration::from_secs(llm.timeout_secs),
        }
    }
}

// ── Gateway ──────────────────────────────────────────────────────────────

/// The typed gateway shared by every analyzer.
pub struct Gateway {
    provider: Arc<dyn OracleProvider>,
    governor: Arc<Governor>,
    cache: ResponseCache,
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(
        provider: Arc<dyn OracleProvider>,
        governor: Arc<Governor>,
        cache: ResponseCache,
        config: GatewayConfig,
    ) -> Self {
        Self {
            provider,
            governor,
            cache,
            config,
        }
    }

    /// Governor handle (for boundary checks in long stages).
    pub fn governor(&self) -> &Governor {
        &self.governor
    }

    /// Issue a typed call on behalf of `stage`.
    pub async fn call<T: JsonSchema + DeserializeOwned>(
        &self,
        stage: &str,
        prompt: &TypedPrompt<T>,
    ) -> Result<T, GatewayError> {
        let request = prompt.to_request();
        let key = ResponseCache::key(&request, self.provider.model_id());

        if let Some(entry) = self.cache.get(&key) {
            let saved = if entry.cost_usd > 0.0 {
                entry.cost_usd
            } else {
                estimate_cost(&request)
            };
            self.governor.record(stage, 0.0, true, saved);
            return deserialize_content(&prompt.task, entry.content);
        }

        let response = self.call_provider(stage, &request).await?;

        // Truncated output: re-issue bounded continuations and merge.
        let mut content = response.content;
        let mut total_cost = response.cost_usd;
        let mut truncated = response.truncated;
        let mut rounds = 0;
        while truncated && rounds < MAX_CONTINUATIONS {
            rounds += 1;
            let continuation_request = continuation_of(&request, &content);
            let continuation = self.call_provider(stage, &continuation_request).await?;
            content = merge_continuation(content, continuation.content);
            total_cost += continuation.cost_usd;
            truncated = continuation.truncated;
        }
        if truncated {
            warn!(
                task = %request.task,
                rounds,
                "output still truncated after continuation budget; using partial result"
            );
        }

        let merged = OracleResponse {
            content: content.clone(),
            cost_usd: total_cost,
            truncated,
        };
        if let Err(err) = self.cache.put(
            &key,
            &request,
            self.provider.model_id(),
            &merged,
            chrono::Utc::now(),
        ) {
            warn!(error = %err, "failed to persist response cache entry");
        }

        deserialize_content(&prompt.task, content)
    }

    /// One metered provider call with retry classification.
    async fn call_provider(
        &self,
        stage: &str,
        request: &OracleRequest,
    ) -> Result<OracleResponse, GatewayError> {
        let estimate = estimate_cost(request);
        let mut last_error = String::new();

        for attempt in 1..=self.config.max_attempts {
            let _permit = self.governor.acquire(estimate).await?;

            let outcome = tokio::time::timeout(self.config.timeout, self.provider.call(request))
                .await
                .unwrap_or(Err(OracleError::Timeout {
                    after: self.config.timeout,
                }));

            match outcome {
                Ok(response) => {
                    self.governor.record(stage, response.cost_usd, false, 0.0);
                    return Ok(response);
                }
                Err(err @ OracleError::Permanent { .. }) => {
                    return Err(GatewayError::Permanent {
                        task: request.task.clone(),
                        message: err.to_string(),
                    });
                }
                Err(err) => {
                    last_error = err.to_string();
                    if attempt == self.config.max_attempts {
                        break;
                    }
                    let delay = match &err {
                        OracleError::Transient {
                            retry_after: Some(after),
                            ..
                        } => *after,
                        _ => backoff_delay(self.config.base_delay, attempt),
                    };
                    debug!(
                        task = %request.task,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %last_error,
                        "transient provider failure; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(GatewayError::RetriesExhausted {
            task: request.task.clone(),
            attempts: self.config.max_attempts,
            last_error,
        })
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

/// Pre-call cost estimate from prompt size (4 chars ≈ 1 token) plus an
/// assumed completion.
fn estimate_cost(request: &OracleRequest) -> f64 {
    let prompt_chars = request.system.len() + request.user.len();
    let prompt_tokens = prompt_chars as f64 / 4.0;
    prompt_tokens / 1000.0 * PROMPT_COST_PER_1K
        + ESTIMATED_COMPLETION_TOKENS / 1000.0 * COMPLETION_COST_PER_1K
}

/// Exponential backoff with uniform jitter up to half the base delay.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    let jitter_ceiling = (base.as_millis() as u64 / 2).max(1);
    let jitter = rand::thread_rng().gen_range(0..jitter_ceiling);
    exp + Duration::from_millis(jitter)
}

/// Build the follow-up request for truncated output.
fn continuation_of(request: &OracleRequest, partial: &serde_json::Value) -> OracleRequest {
    let rendered = serde_json::to_string(partial).unwrap_or_default();
    OracleRequest {
        task: format!("{}_continuation", request.task),
        system: request.system.clone(),
        user: format!(
            "{}\n\nYour previous response was truncated. It ended with:\n{}\n\n\
             Continue from where it stopped. Output only the remaining items, \
             in the same JSON shape.",
            request.user,
            tail(&rendered, 2000),
        ),
        schema: request.schema.clone(),
    }
}

fn tail(s: &str, max_chars: usize) -> &str {
    let count = s.chars().count();
    if count <= max_chars {
        return s;
    }
    let skip = count - max_chars;
    let byte = s
        .char_indices()
        .nth(skip)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &s[byte..]
}

/// Merge a continuation payload into the partial one: arrays
/// concatenate, objects merge per key (array values concatenate,
/// everything else takes the continuation's value).
fn merge_continuation(
    base: serde_json::Value,
    continuation: serde_json::Value,
) -> serde_json::Value {
    use serde_json::Value;
    match (base, continuation) {
        (Value::Array(mut a), Value::Array(b)) => {
            a.extend(b);
            Value::Array(a)
        }
        (Value::Object(mut a), Value::Object(b)) => {
            for (key, value) in b {
                match (a.remove(&key), value) {
                    (Some(Value::Array(mut left)), Value::Array(right)) => {
                        left.extend(right);
                        a.insert(key, Value::Array(left));
                    }
                    (_, value) => {
                        a.insert(key, value);
                    }
                }
            }
            Value::Object(a)
        }
        (_, continuation) => continuation,
    }
}

fn deserialize_content<T: DeserializeOwned>(
    task: &str,
    content: serde_json::Value,
) -> Result<T, GatewayError> {
    serde_json::from_value(content).map_err(|err| GatewayError::SchemaInvalid {
        task: task.to_string(),
        message: err.to_string(),
    })
}
