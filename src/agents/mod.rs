//! Agent backend trait and specialist agents
//!
//! Each agent renders a prompt from the immutable cycle context, sends it
//! to an `AgentBackend` (LLM controlled) and validates the raw reply into a
//! strict report. Invalid optional fields are dropped, never coerced.

use crate::error::OrchestrationError;
use crate::gemini::GeminiClient;
use crate::models::AssetClass;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::env;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub mod call;
pub mod narrative;
pub mod quant;
pub mod risk;
pub mod sub_allocator;

pub use call::{AgentCall, CallOutcome, CallState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentRole {
    Quant,
    Narrative,
    Risk,
    Supervisor,
    SubAllocator(AssetClass),
    /// Single call choosing every Sub-MP at once.
    SubAllocatorLegacy,
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentRole::Quant => write!(f, "quant"),
            AgentRole::Narrative => write!(f, "narrative"),
            AgentRole::Risk => write!(f, "risk"),
            AgentRole::Supervisor => write!(f, "supervisor"),
            AgentRole::SubAllocator(class) => write!(f, "sub_allocator:{}", class),
            AgentRole::SubAllocatorLegacy => write!(f, "sub_allocator:all"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub role: AgentRole,
    pub system: String,
    pub prompt: String,
}

/// Trait for the LLM transport behind every agent
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn complete(&self, request: &AgentRequest) -> Result<String>;
}

//
// ================= Scripted backend =================
//

#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    Fail(String),
    /// Sleeps before answering; used to exercise timeouts.
    Stall(Duration),
}

/// Backend replaying canned replies per role, for tests and offline runs.
/// A role with no queued reply fails, which agents treat as a missing report.
#[derive(Default)]
pub struct ScriptedBackend {
    replies: Mutex<HashMap<AgentRole, VecDeque<ScriptedReply>>>,
    requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, role: AgentRole, reply: ScriptedReply) {
        let mut replies = self.replies.lock().await;
        replies.entry(role).or_default().push_back(reply);
    }

    pub async fn push_json(&self, role: AgentRole, value: Value) {
        self.push(role, ScriptedReply::Text(value.to_string())).await;
    }

    /// Load `{ "<role>": [ <reply json>, ... ] }`; role keys use the `Display` form.
    pub async fn from_script(script: &Value) -> Result<Self> {
        let backend = Self::new();
        let object = script.as_object().ok_or_else(|| {
            OrchestrationError::SourceError("agent script must be a JSON object".to_string())
        })?;

        for (key, replies) in object {
            let role = parse_role(key).ok_or_else(|| {
                OrchestrationError::SourceError(format!("unknown agent role '{}'", key))
            })?;
            for reply in replies.as_array().into_iter().flatten() {
                backend.push_json(role, reply.clone()).await;
            }
        }

        Ok(backend)
    }

    pub async fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().await.clone()
    }

    pub async fn requests_for(&self, role: AgentRole) -> usize {
        self.requests
            .lock()
            .await
            .iter()
            .filter(|r| r.role == role)
            .count()
    }
}

fn parse_role(key: &str) -> Option<AgentRole> {
    match key {
        "quant" => Some(AgentRole::Quant),
        "narrative" => Some(AgentRole::Narrative),
        "risk" => Some(AgentRole::Risk),
        "supervisor" => Some(AgentRole::Supervisor),
        "sub_allocator:all" => Some(AgentRole::SubAllocatorLegacy),
        other => other
            .strip_prefix("sub_allocator:")
            .and_then(|class| class.parse::<AssetClass>().ok())
            .map(AgentRole::SubAllocator),
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    async fn complete(&self, request: &AgentRequest) -> Result<String> {
        self.requests.lock().await.push(request.clone());

        let next = {
            let mut replies = self.replies.lock().await;
            replies.get_mut(&request.role).and_then(VecDeque::pop_front)
        };

        match next {
            Some(ScriptedReply::Text(text)) => Ok(text),
            Some(ScriptedReply::Fail(reason)) => Err(OrchestrationError::LlmError(reason)),
            Some(ScriptedReply::Stall(duration)) => {
                tokio::time::sleep(duration).await;
                Err(OrchestrationError::LlmError("stalled reply".to_string()))
            }
            None => Err(OrchestrationError::LlmError(format!(
                "no scripted reply for {}",
                request.role
            ))),
        }
    }
}

/// Gemini when `GEMINI_API_KEY` is set, else the scripted replies in
/// `MP_AGENT_SCRIPT`, else an empty script (every agent degrades to missing).
pub async fn build_backend() -> Result<Arc<dyn AgentBackend>> {
    if env::var("GEMINI_API_KEY").map(|k| !k.trim().is_empty()).unwrap_or(false) {
        info!("Agent backend: gemini");
        return Ok(Arc::new(GeminiClient::from_env()?));
    }

    match env::var("MP_AGENT_SCRIPT") {
        Ok(path) if !path.trim().is_empty() => {
            let bytes = tokio::fs::read(path.trim()).await.map_err(|e| {
                OrchestrationError::SourceError(format!("cannot read agent script {}: {}", path, e))
            })?;
            let script: Value = serde_json::from_slice(&bytes)?;
            info!(path = %path, "Agent backend: scripted");
            Ok(Arc::new(ScriptedBackend::from_script(&script).await?))
        }
        _ => {
            warn!("No GEMINI_API_KEY or MP_AGENT_SCRIPT configured, agents will report missing");
            Ok(Arc::new(ScriptedBackend::new()))
        }
    }
}

//
// ================= Reply parsing helpers =================
//

/// Strip markdown fences and parse the reply as a JSON object.
pub fn parse_json_object(raw: &str) -> Result<Map<String, Value>> {
    let cleaned = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let value: Value = serde_json::from_str(cleaned).map_err(|e| {
        OrchestrationError::SchemaError(format!("reply is not valid JSON: {}", e))
    })?;

    match value {
        Value::Object(map) => Ok(map),
        other => Err(OrchestrationError::SchemaError(format!(
            "expected a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub(crate) fn required<'a>(map: &'a Map<String, Value>, key: &str) -> Result<&'a Value> {
    map.get(key)
        .filter(|v| !v.is_null())
        .ok_or_else(|| OrchestrationError::SchemaError(format!("missing field '{}'", key)))
}

pub(crate) fn required_f64(map: &Map<String, Value>, key: &str) -> Result<f64> {
    let value = required(map, key)?;
    value
        .as_f64()
        .filter(|v| v.is_finite())
        .ok_or_else(|| {
            OrchestrationError::SchemaError(format!(
                "field '{}' must be a number, got {}",
                key,
                json_kind(value)
            ))
        })
}

pub(crate) fn required_str<'a>(map: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    let value = required(map, key)?;
    value.as_str().ok_or_else(|| {
        OrchestrationError::SchemaError(format!(
            "field '{}' must be a string, got {}",
            key,
            json_kind(value)
        ))
    })
}

pub(crate) fn optional_str<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    map.get(key).and_then(Value::as_str)
}

/// Strings of an optional array field; non-string entries are dropped.
pub(crate) fn string_list(map: &Map<String, Value>, key: &str) -> Vec<String> {
    map.get(key)
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Instruction appended on the single retry after a schema failure.
pub(crate) fn strict_json_instruction(schema_hint: &str, error: &str) -> String {
    format!(
        "Your previous reply was rejected: {}\n\
         Return ONLY valid JSON. No markdown, no commentary.\n\
         The JSON must match exactly:\n{}",
        error, schema_hint
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_json_object_strips_fences() {
        let map = parse_json_object("```json\n{\"a\": 1}\n```").unwrap();
        assert_eq!(map.get("a"), Some(&json!(1)));
    }

    #[test]
    fn test_parse_json_object_rejects_arrays() {
        let err = parse_json_object("[1, 2]").unwrap_err();
        assert!(matches!(err, OrchestrationError::SchemaError(_)));
    }

    #[test]
    fn test_required_f64_rejects_strings() {
        let map = parse_json_object(r#"{"confidence": "high"}"#).unwrap();
        assert!(required_f64(&map, "confidence").is_err());
        assert!(required_f64(&map, "missing").is_err());
    }

    #[test]
    fn test_parse_role_round_trips_display() {
        for role in [
            AgentRole::Quant,
            AgentRole::Narrative,
            AgentRole::Risk,
            AgentRole::Supervisor,
            AgentRole::SubAllocator(AssetClass::Bonds),
            AgentRole::SubAllocatorLegacy,
        ] {
            assert_eq!(parse_role(&role.to_string()), Some(role));
        }
    }

    #[tokio::test]
    async fn test_scripted_backend_replays_in_order() {
        let backend = ScriptedBackend::new();
        backend.push(AgentRole::Quant, ScriptedReply::Text("one".into())).await;
        backend.push(AgentRole::Quant, ScriptedReply::Fail("boom".into())).await;

        let request = AgentRequest {
            role: AgentRole::Quant,
            system: String::new(),
            prompt: String::new(),
        };

        assert_eq!(backend.complete(&request).await.unwrap(), "one");
        assert!(backend.complete(&request).await.is_err());
        assert!(backend.complete(&request).await.is_err());
        assert_eq!(backend.requests_for(AgentRole::Quant).await, 3);
    }
}
