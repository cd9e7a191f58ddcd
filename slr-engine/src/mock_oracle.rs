//! Scripted oracle provider for tests.
//!
//! Mirrors the real provider's contract without any network: responses
//! are either a fixed fallback, a scripted failure prefix, or computed
//! by a handler closure inspecting the request. Every request is
//! recorded for assertions.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::oracle::{OracleError, OracleProvider, OracleRequest, OracleResponse};

type Handler =
    Box<dyn Fn(&OracleRequest) -> Result<OracleResponse, OracleError> + Send + Sync>;

/// Scripted in-memory oracle.
pub struct MockOracle {
    /// Scripted outcomes consumed first, in order.
    scripted: Mutex<VecDeque<Result<OracleResponse, OracleError>>>,
    /// Returned once the script is drained (when present).
    fallback: Option<OracleResponse>,
    /// Computes responses when neither script nor fallback apply.
    handler: Option<Handler>,
    /// Every request seen, in order.
    calls: Arc<Mutex<Vec<OracleRequest>>>,
    model: String,
}

impl MockOracle {
    fn empty() -> Self {
        Self {
            scripted: Mutex::new(VecDeque::new()),
            fallback: None,
            handler: None,
            calls: Arc::new(Mutex::new(Vec::new())),
            model: "mock-model".to_string(),
        }
    }

    /// Always return `content` at the given cost.
    pub fn returning(content: serde_json::Value, cost_usd: f64) -> Self {
        let mut mock = Self::empty();
        mock.fallback = Some(OracleResponse {
            content,
            cost_usd,
            truncated: false,
        });
        mock
    }

    /// Fail the first `failures` calls with clones of `error`, then
    /// return `content` forever.
    pub fn failing_then(
        failures: usize,
        error: OracleError,
        content: serde_json::Value,
    ) -> Self {
        let mut mock = Self::empty();
        {
            let mut script = mock.scripted.lock().unwrap();
            for _ in 0..failures {
                script.push_back(Err(error.clone()));
            }
        }
        mock.fallback = Some(OracleResponse {
            content,
            cost_usd: 0.01,
            truncated: false,
        });
        mock
    }

    /// First call returns `first` marked truncated; the follow-up call
    /// returns `rest` complete.
    pub fn truncated_then(first: serde_json::Value, rest: serde_json::Value) -> Self {
        let mut mock = Self::empty();
        {
            let mut script = mock.scripted.lock().unwrap();
            script.push_back(Ok(OracleResponse {
                content: first,
                cost_usd: 0.01,
                truncated: true,
            }));
            script.push_back(Ok(OracleResponse {
                content: rest,
                cost_usd: 0.01,
                truncated: false,
            }));
        }
        mock
    }

    /// Compute responses per request; used by integration tests to
    /// script an entire pipeline run.
    pub fn with_handler(
        handler: impl Fn(&OracleRequest) -> Result<OracleResponse, OracleError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        let mut mock = Self::empty();
        mock.handler = Some(Box::new(handler));
        mock
    }

    /// Shared log of every request seen.
    pub fn call_log(&self) -> Arc<Mutex<Vec<OracleRequest>>> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl OracleProvider for MockOracle {
    async fn call(&self, request: &OracleRequest) -> Result<OracleResponse, OracleError> {
        self.calls.lock().unwrap().push(request.clone());

        if let Some(outcome) = self.scripted.lock().unwrap().pop_front() {
            return outcome;
        }
        if let Some(fallback) = &self.fallback {
            return Ok(fallback.clone());
        }
        if let Some(handler) = &self.handler {
            return handler(request);
        }
        Err(OracleError::Permanent {
            status: None,
            message: "mock oracle has no scripted response".to_string(),
        })
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

/// Convenience for handler-based mocks: a successful response.
pub fn ok_response(content: serde_json::Value, cost_usd: f64) -> Result<OracleResponse, OracleError> {
    Ok(OracleResponse {
        content,
        cost_usd,
        truncated: false,
    })
}
