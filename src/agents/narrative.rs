//! Narrative agent: themes, causal risk chains and weak signals from
//! narrative summary and graph evidence only.
//!
//! Citations are checked against the evidence block. A claim with no
//! traceable citation is rewritten as a possibility and contributes no ids.

use super::{
    parse_json_object, required, required_str, string_list, AgentCall, AgentRequest, AgentRole,
    CallOutcome,
};
use crate::context::{extract_evidence_ids, normalize_evidence_id};
use crate::error::OrchestrationError;
use crate::models::{DecisionContext, NarrativeReport, Sentiment};
use crate::Result;
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::warn;

const SYSTEM_PROMPT: &str = r#"You are the narrative analyst of a portfolio committee.
You only use the narrative summary and the graph evidence you are given.
Every claim must cite evidence ids that appear verbatim in the evidence block.
If you cannot cite evidence for a claim, phrase it as a possibility and cite nothing.
Never invent evidence ids."#;

pub const SCHEMA_HINT: &str = r#"{
  "dominant_themes": ["<theme>", ...],
  "sentiment": "positive|neutral|negative|mixed",
  "causal_risks": [ { "text": "<cause -> effect>", "evidence_ids": ["evidence:<id>"] } ],
  "weak_signals": [ { "text": "<signal>", "evidence_ids": [] } ],
  "evidence_ids": ["evidence:<id>", ...]
}"#;

const POSSIBILITY_PREFIX: &str = "Possibility: ";

pub struct NarrativeAgent;

impl NarrativeAgent {
    pub async fn run(call: &AgentCall, ctx: &DecisionContext) -> CallOutcome<NarrativeReport> {
        let request = Self::build_request(ctx);
        let valid_ids = extract_evidence_ids(&ctx.graph_evidence);
        call.run(request, SCHEMA_HINT, |raw| validate_report(raw, &valid_ids))
            .await
    }

    fn build_request(ctx: &DecisionContext) -> AgentRequest {
        let summary = non_empty_or(&ctx.narrative_summary, "(no narrative summary available)");
        let evidence = non_empty_or(
            &ctx.graph_evidence,
            "(no graph evidence available; every claim must be a possibility without citations)",
        );

        let prompt = format!(
            r#"AS OF: {}

NARRATIVE SUMMARY:
{}

GRAPH EVIDENCE:
{}

Rules:
- Order dominant_themes from most to least important
- Cite only ids of the form evidence:<id> that appear above
- Return ONLY valid JSON in this format:

{}
"#,
            ctx.as_of, summary, evidence, SCHEMA_HINT
        );

        AgentRequest {
            role: AgentRole::Narrative,
            system: SYSTEM_PROMPT.to_string(),
            prompt,
        }
    }
}

fn non_empty_or<'a>(text: &'a str, fallback: &'a str) -> &'a str {
    if text.trim().is_empty() {
        fallback
    } else {
        text
    }
}

/// Validate a raw narrative reply against the ids present in the evidence block.
pub fn validate_report(raw: &str, valid_ids: &BTreeSet<String>) -> Result<NarrativeReport> {
    let map = parse_json_object(raw)?;

    if !required(&map, "dominant_themes")?.is_array() {
        return Err(OrchestrationError::SchemaError(
            "field 'dominant_themes' must be an array".to_string(),
        ));
    }
    let dominant_themes = string_list(&map, "dominant_themes");

    let sentiment = required_str(&map, "sentiment")?
        .parse::<Sentiment>()
        .map_err(OrchestrationError::SchemaError)?;

    let mut cited = BTreeSet::new();
    let causal_risks = claims(map.get("causal_risks"), valid_ids, &mut cited);
    let weak_signals = claims(map.get("weak_signals"), valid_ids, &mut cited);

    for id in string_list(&map, "evidence_ids") {
        let id = normalize_evidence_id(&id);
        if valid_ids.contains(&id) {
            cited.insert(id);
        } else {
            warn!(evidence_id = %id, "Dropping fabricated evidence id");
        }
    }

    Ok(NarrativeReport {
        dominant_themes,
        sentiment,
        causal_risks,
        weak_signals,
        evidence_ids: cited.into_iter().collect(),
    })
}

/// Claims may be plain strings or `{text, evidence_ids}` objects.
fn claims(value: Option<&Value>, valid_ids: &BTreeSet<String>, cited: &mut BTreeSet<String>) -> Vec<String> {
    let Some(items) = value.and_then(Value::as_array) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let (text, ids): (&str, Vec<String>) = match item {
                Value::String(text) => (text.as_str(), Vec::new()),
                Value::Object(obj) => {
                    let text = obj.get("text").and_then(Value::as_str)?;
                    let ids = obj
                        .get("evidence_ids")
                        .and_then(Value::as_array)
                        .map(|arr| arr.iter().filter_map(Value::as_str).map(str::to_string).collect())
                        .unwrap_or_default();
                    (text, ids)
                }
                _ => return None,
            };

            let text = text.trim();
            if text.is_empty() {
                return None;
            }

            let mut traced: Vec<String> = ids
                .iter()
                .map(|id| normalize_evidence_id(id))
                .filter(|id| {
                    let ok = valid_ids.contains(id);
                    if !ok {
                        warn!(evidence_id = %id, "Dropping fabricated claim citation");
                    }
                    ok
                })
                .collect();
            traced.extend(
                extract_evidence_ids(text)
                    .into_iter()
                    .filter(|id| valid_ids.contains(id)),
            );

            if traced.is_empty() {
                Some(as_possibility(text))
            } else {
                cited.extend(traced);
                Some(text.to_string())
            }
        })
        .collect()
}

fn as_possibility(text: &str) -> String {
    if text.to_lowercase().starts_with("possibility") {
        text.to_string()
    } else {
        format!("{}{}", POSSIBILITY_PREFIX, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids() -> BTreeSet<String> {
        extract_evidence_ids("AI capex rising evidence:101 and chip supply evidence:102")
    }

    #[test]
    fn test_fabricated_ids_are_dropped() {
        let raw = json!({
            "dominant_themes": ["AI Capex", 7],
            "sentiment": "bullish",
            "causal_risks": [
                { "text": "Capex overbuild -> margin squeeze", "evidence_ids": ["evidence:101", "evidence:999"] }
            ],
            "weak_signals": [
                { "text": "Power grid constraints", "evidence_ids": ["evidence:555"] },
                "Rate cut chatter"
            ],
            "evidence_ids": ["102", "evidence:404"]
        })
        .to_string();

        let report = validate_report(&raw, &ids()).unwrap();
        assert_eq!(report.dominant_themes, vec!["AI Capex".to_string()]);
        assert_eq!(report.sentiment, Sentiment::Positive);
        assert_eq!(
            report.evidence_ids,
            vec!["evidence:101".to_string(), "evidence:102".to_string()]
        );
        assert_eq!(report.causal_risks[0], "Capex overbuild -> margin squeeze");
        assert_eq!(report.weak_signals[0], "Possibility: Power grid constraints");
        assert_eq!(report.weak_signals[1], "Possibility: Rate cut chatter");
    }

    #[test]
    fn test_empty_evidence_yields_no_ids() {
        let raw = json!({
            "dominant_themes": ["Recession fear"],
            "sentiment": "negative",
            "causal_risks": [{ "text": "Possibility: credit spreads widen", "evidence_ids": ["evidence:1"] }],
            "evidence_ids": ["evidence:1"]
        })
        .to_string();

        let report = validate_report(&raw, &BTreeSet::new()).unwrap();
        assert!(report.evidence_ids.is_empty());
        assert_eq!(report.causal_risks[0], "Possibility: credit spreads widen");
    }

    #[test]
    fn test_missing_sentiment_is_schema_error() {
        let raw = json!({ "dominant_themes": [] }).to_string();
        assert!(matches!(
            validate_report(&raw, &ids()),
            Err(OrchestrationError::SchemaError(_))
        ));
    }
}
