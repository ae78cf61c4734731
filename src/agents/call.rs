//! Retry-then-degrade agent call
//!
//! PENDING → VALID | INVALID_RETRY → VALID | MISSING
//!
//! Timeouts and transport failures count as invalid replies. A call never
//! raises: the worst outcome is a missing report.

use super::{strict_json_instruction, AgentBackend, AgentRequest, AgentRole};
use crate::error::OrchestrationError;
use crate::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallState {
    Pending,
    Valid,
    InvalidRetry,
    Missing,
}

impl CallState {
    fn next(self, attempt_ok: bool) -> CallState {
        match (self, attempt_ok) {
            (CallState::Pending, true) | (CallState::InvalidRetry, true) => CallState::Valid,
            (CallState::Pending, false) => CallState::InvalidRetry,
            (CallState::InvalidRetry, false) => CallState::Missing,
            (terminal, _) => terminal,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Valid | CallState::Missing)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CallOutcome<T> {
    pub role: AgentRole,
    pub report: Option<T>,
    pub trace: Vec<CallState>,
    pub errors: Vec<String>,
}

impl<T> CallOutcome<T> {
    pub fn state(&self) -> CallState {
        self.trace.last().copied().unwrap_or(CallState::Pending)
    }

    /// Outcome for a call that was never attempted (deadline already passed).
    pub fn aborted(role: AgentRole, reason: &str) -> Self {
        Self {
            role,
            report: None,
            trace: vec![CallState::Pending, CallState::Missing],
            errors: vec![reason.to_string()],
        }
    }
}

/// Shared settings for every agent call inside one cycle.
#[derive(Clone)]
pub struct AgentCall {
    backend: Arc<dyn AgentBackend>,
    attempt_timeout: Duration,
    deadline: Instant,
}

impl AgentCall {
    pub fn new(backend: Arc<dyn AgentBackend>, attempt_timeout: Duration, deadline: Instant) -> Self {
        Self {
            backend,
            attempt_timeout,
            deadline,
        }
    }

    pub fn deadline_passed(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Run the call: one attempt, one stricter retry, then give up.
    pub async fn run<T, F>(&self, request: AgentRequest, schema_hint: &str, validate: F) -> CallOutcome<T>
    where
        F: Fn(&str) -> Result<T>,
    {
        let role = request.role;
        let mut state = CallState::Pending;
        let mut trace = vec![state];
        let mut errors = Vec::new();

        while !state.is_terminal() {
            let attempt_request = match state {
                CallState::Pending => request.clone(),
                _ => AgentRequest {
                    prompt: format!(
                        "{}\n\n{}",
                        request.prompt,
                        strict_json_instruction(schema_hint, errors.last().map(String::as_str).unwrap_or(""))
                    ),
                    ..request.clone()
                },
            };

            let result = self
                .attempt(&attempt_request)
                .await
                .and_then(|raw| validate(&raw));

            match result {
                Ok(report) => {
                    state = state.next(true);
                    trace.push(state);
                    info!(role = %role, attempts = trace.len() - 1, "Agent report accepted");
                    return CallOutcome {
                        role,
                        report: Some(report),
                        trace,
                        errors,
                    };
                }
                Err(e) => {
                    warn!(role = %role, state = ?state, error = %e, "Agent reply rejected");
                    errors.push(e.to_string());
                    state = state.next(false);
                    trace.push(state);
                }
            }
        }

        warn!(role = %role, "Agent report missing after retry");
        CallOutcome {
            role,
            report: None,
            trace,
            errors,
        }
    }

    async fn attempt(&self, request: &AgentRequest) -> Result<String> {
        let now = Instant::now();
        if now >= self.deadline {
            return Err(OrchestrationError::AgentError(format!(
                "{}: cycle deadline passed before the call",
                request.role
            )));
        }

        let budget = self.attempt_timeout.min(self.deadline - now);
        debug!(
            role = %request.role,
            prompt_len = request.prompt.len(),
            budget_ms = budget.as_millis() as u64,
            "Calling agent backend"
        );

        match tokio::time::timeout(budget, self.backend.complete(request)).await {
            Ok(reply) => reply,
            Err(_) => Err(OrchestrationError::Timeout(budget.as_millis() as u64)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{ScriptedBackend, ScriptedReply};

    fn request() -> AgentRequest {
        AgentRequest {
            role: AgentRole::Quant,
            system: "sys".to_string(),
            prompt: "prompt".to_string(),
        }
    }

    fn parse_number(raw: &str) -> Result<u32> {
        raw.trim()
            .parse::<u32>()
            .map_err(|e| OrchestrationError::SchemaError(e.to_string()))
    }

    fn call(backend: Arc<ScriptedBackend>, timeout_ms: u64) -> AgentCall {
        AgentCall::new(
            backend,
            Duration::from_millis(timeout_ms),
            Instant::now() + Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_valid_first_attempt() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push(AgentRole::Quant, ScriptedReply::Text("7".into())).await;

        let outcome = call(backend, 1_000).run(request(), "number", parse_number).await;
        assert_eq!(outcome.report, Some(7));
        assert_eq!(outcome.trace, vec![CallState::Pending, CallState::Valid]);
    }

    #[tokio::test]
    async fn test_retry_uses_strict_instruction() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push(AgentRole::Quant, ScriptedReply::Text("seven".into())).await;
        backend.push(AgentRole::Quant, ScriptedReply::Text("7".into())).await;

        let outcome = call(backend.clone(), 1_000).run(request(), "number", parse_number).await;
        assert_eq!(outcome.report, Some(7));
        assert_eq!(
            outcome.trace,
            vec![CallState::Pending, CallState::InvalidRetry, CallState::Valid]
        );

        let requests = backend.requests().await;
        assert_eq!(requests.len(), 2);
        assert!(requests[1].prompt.contains("Return ONLY valid JSON"));
    }

    #[tokio::test]
    async fn test_second_failure_is_missing_not_default() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push(AgentRole::Quant, ScriptedReply::Text("x".into())).await;
        backend.push(AgentRole::Quant, ScriptedReply::Fail("down".into())).await;

        let outcome = call(backend.clone(), 1_000).run(request(), "number", parse_number).await;
        assert_eq!(outcome.report, None);
        assert_eq!(outcome.state(), CallState::Missing);
        assert_eq!(outcome.errors.len(), 2);
        assert_eq!(backend.requests_for(AgentRole::Quant).await, 2);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_invalid() {
        let backend = Arc::new(ScriptedBackend::new());
        backend
            .push(AgentRole::Quant, ScriptedReply::Stall(Duration::from_secs(2)))
            .await;
        backend.push(AgentRole::Quant, ScriptedReply::Text("3".into())).await;

        let outcome = call(backend, 50).run(request(), "number", parse_number).await;
        assert_eq!(outcome.report, Some(3));
        assert!(outcome.errors[0].contains("timed out"));
    }

    #[tokio::test]
    async fn test_expired_deadline_skips_backend() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push(AgentRole::Quant, ScriptedReply::Text("3".into())).await;

        let expired = AgentCall::new(backend.clone(), Duration::from_millis(100), Instant::now());
        let outcome = expired.run(request(), "number", parse_number).await;
        assert_eq!(outcome.state(), CallState::Missing);
        assert_eq!(backend.requests_for(AgentRole::Quant).await, 0);
    }
}
