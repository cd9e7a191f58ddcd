//! LLM provider abstraction.
//!
//! The engine treats the LLM as an external oracle: a provider takes a
//! fully rendered request (system context, user content, response
//! schema) and returns raw JSON plus billing data. Everything above
//! this trait — caching, pacing, retries, schema validation — lives in
//! the gateway.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

// ── Request / Response ───────────────────────────────────────────────────

/// A fully rendered oracle request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OracleRequest {
    /// Short task label, e.g. `extract_claims`; namespaces the response
    /// cache and shows up in provider logs.
    pub task: String,
    /// System context.
    pub system: String,
    /// User content.
    pub user: String,
    /// JSON schema the response must satisfy.
    pub schema: serde_json::Value,
}

/// Raw oracle response before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleResponse {
    /// Parsed response body.
    pub content: serde_json::Value,
    /// Billed cost of the call in USD (0.0 when unknown).
    pub cost_usd: f64,
    /// Whether the provider stopped early (truncated output); the
    /// gateway re-issues a continuation when set.
    pub truncated: bool,
}

// ── Error Classification ─────────────────────────────────────────────────

/// Provider-level failures, classified for retry handling.
#[derive(Debug, Clone, Error)]
pub enum OracleError {
    /// Worth retrying with backoff: network failures, 5xx, 429.
    #[error("transient provider error: {message}")]
    Transient {
        message: String,
        /// Provider-requested delay before the next attempt (429).
        retry_after: Option<Duration>,
    },

    /// Not worth retrying: 4xx (other than 429), malformed body.
    #[error("permanent provider error (status {status:?}): {message}")]
    Permanent { status: Option<u16>, message: String },

    /// Wall-clock timeout; retryable.
    #[error("provider call timed out after {after:?}")]
    Timeout { after: Duration },
}

impl OracleError {
    /// Whether the gateway may retry this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }
}

// ── Provider Trait ───────────────────────────────────────────────────────

/// An LLM provider. Implementations must be cheap to share across a
/// stage's bounded-concurrency calls.
#[async_trait]
pub trait OracleProvider: Send + Sync {
    /// Issue one call. The implementation enforces no pacing, caching,
    /// or retries of its own.
    async fn call(&self, request: &OracleRequest) -> Result<OracleResponse, OracleError>;

    /// Provider label for logs and cache keys (model identifier).
    fn model_id(&self) -> &str;
}

// ── HTTP Provider ────────────────────────────────────────────────────────

/// Chat-completions HTTP provider.
#[derive(Debug)]
pub struct HttpOracle {
    client: reqwest::Client,
    api_base_url: String,
    model: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    response_format: serde_json::Value,
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Rough blended pricing used when the provider does not bill inline:
/// USD per 1k prompt tokens.
pub const PROMPT_COST_PER_1K: f64 = 0.0025;
/// USD per 1k completion tokens.
pub const COMPLETION_COST_PER_1K: f64 = 0.01;

impl HttpOracle {
    /// Build the provider, reading the API key from the environment
    /// variable named in configuration.
    pub fn from_config(llm: &slr_common::config::LlmConfig) -> Result<Self, OracleError> {
        let api_key = std::env::var(&llm.api_key_env).map_err(|_| OracleError::Permanent {
            status: None,
            message: format!("API key environment variable {} is unset", llm.api_key_env),
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(llm.timeout_secs))
            .build()
            .map_err(|e| OracleError::Permanent {
                status: None,
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            api_base_url: llm.api_base_url.trim_end_matches('/').to_string(),
            model: llm.model.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl OracleProvider for HttpOracle {
    async fn call(&self, request: &OracleRequest) -> Result<OracleResponse, OracleError> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
            response_format: serde_json::json!({
                "type": "json_schema",
                "json_schema": {
                    "name": request.task,
                    "schema": request.schema,
                }
            }),
            temperature: 0.0,
        };

        let url = format!("{}/chat/completions", self.api_base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    OracleError::Timeout {
                        after: Duration::from_secs(0),
                    }
                } else {
                    OracleError::Transient {
                        message: err.to_string(),
                        retry_after: None,
                    }
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(OracleError::Transient {
                message: "provider rate limit (429)".to_string(),
                retry_after,
            });
        }
        if status.is_server_error() {
            return Err(OracleError::Transient {
                message: format!("provider server error (HTTP {status})"),
                retry_after: None,
            });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(OracleError::Permanent {
                status: Some(status.as_u16()),
                message: text,
            });
        }

        let chat: ChatResponse = response.json().await.map_err(|err| OracleError::Permanent {
            status: None,
            message: format!("provider response body malformed: {err}"),
        })?;

        let choice = chat.choices.into_iter().next().ok_or_else(|| {
            OracleError::Permanent {
                status: None,
                message: "provider returned no choices".to_string(),
            }
        })?;

        let truncated = choice.finish_reason.as_deref() == Some("length");
        let content: serde_json::Value = serde_json::from_str(&choice.message.content)
            .map_err(|err| OracleError::Permanent {
                status: None,
                message: format!("provider returned non-JSON content: {err}"),
            })?;

        let cost_usd = chat
            .usage
            .map(|u| {
                u.prompt_tokens as f64 / 1000.0 * PROMPT_COST_PER_1K
                    + u.completion_tokens as f64 / 1000.0 * COMPLETION_COST_PER_1K
            })
            .unwrap_or(0.0);

        debug!(task = %request.task, cost_usd, truncated, "oracle call completed");
        Ok(OracleResponse {
            content,
            cost_usd,
            truncated,
        })
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_timeout_are_retryable() {
        assert!(OracleError::Transient {
            message: "x".into(),
            retry_after: None
        }
        .is_retryable());
        assert!(OracleError::Timeout {
            after: Duration::from_secs(1)
        }
        .is_retryable());
        assert!(!OracleError::Permanent {
            status: Some(400),
            message: "x".into()
        }
        .is_retryable());
    }
}
