//! Quant agent: macro regime scoring and MP fit from quant signals only

use super::{
    parse_json_object, required, required_f64, required_str, AgentCall, AgentRequest, AgentRole,
    CallOutcome,
};
use crate::error::OrchestrationError;
use crate::models::{
    CandidateCatalog, DecisionContext, GrowthRegime, InflationRegime, LiquidityRegime,
    QuantReport, RegimeLabels, RegimeScores,
};
use crate::Result;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::warn;

const SYSTEM_PROMPT: &str = r#"You are the quantitative macro analyst of a portfolio committee.
You only use the quantitative signals you are given. You never use news or narrative.
Score the macro regime and how well each candidate Model Portfolio fits it."#;

pub const SCHEMA_HINT: &str = r#"{
  "scores": { "growth": 0-10, "inflation": 0-10, "liquidity": 0-10 },
  "regime_labels": {
    "growth": "expansion|recovery|slowdown|contraction",
    "inflation": "low|moderate|high",
    "liquidity": "loose|neutral|tight"
  },
  "mp_fit": { "<candidate MP id>": 0-1 },
  "confidence": 0-1
}"#;

pub struct QuantAgent;

impl QuantAgent {
    pub async fn run(call: &AgentCall, ctx: &DecisionContext) -> CallOutcome<QuantReport> {
        let request = Self::build_request(ctx);
        call.run(request, SCHEMA_HINT, |raw| validate_report(raw, &ctx.catalog))
            .await
    }

    fn build_request(ctx: &DecisionContext) -> AgentRequest {
        let signals = if ctx.quant_signals.is_empty() {
            "(no quantitative signals available this cycle)".to_string()
        } else {
            ctx.quant_signals
                .iter()
                .map(|(code, value)| format!("- {}: {}", code, value))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let candidates = ctx
            .catalog
            .mps
            .iter()
            .map(|(id, mp)| {
                let weights = mp
                    .allocation
                    .iter()
                    .map(|(class, w)| format!("{} {:.0}%", class, w))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("- {} ({}): {}", id, mp.name, weights)
            })
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            r#"AS OF: {}

QUANT SIGNALS:
{}

CANDIDATE MODEL PORTFOLIOS:
{}

Rules:
- Scores are 0-10, mp_fit values are 0-1, confidence is 0-1
- mp_fit keys must be candidate ids listed above, nothing else
- Return ONLY valid JSON in this format:

{}
"#,
            ctx.as_of, signals, candidates, SCHEMA_HINT
        );

        AgentRequest {
            role: AgentRole::Quant,
            system: SYSTEM_PROMPT.to_string(),
            prompt,
        }
    }
}

/// Validate a raw quant reply against the cycle's catalog.
pub fn validate_report(raw: &str, catalog: &CandidateCatalog) -> Result<QuantReport> {
    let map = parse_json_object(raw)?;

    let scores = object_field(&map, "scores")?;
    let scores = RegimeScores {
        growth: required_f64(scores, "growth")?,
        inflation: required_f64(scores, "inflation")?,
        liquidity: required_f64(scores, "liquidity")?,
    }
    .clamped();

    let labels = object_field(&map, "regime_labels")?;
    let regime_labels = RegimeLabels {
        growth: required_str(labels, "growth")?
            .parse::<GrowthRegime>()
            .map_err(OrchestrationError::SchemaError)?,
        inflation: required_str(labels, "inflation")?
            .parse::<InflationRegime>()
            .map_err(OrchestrationError::SchemaError)?,
        liquidity: required_str(labels, "liquidity")?
            .parse::<LiquidityRegime>()
            .map_err(OrchestrationError::SchemaError)?,
    };

    let mut mp_fit = BTreeMap::new();
    for (mp_id, fit) in object_field(&map, "mp_fit")? {
        if !catalog.contains_mp(mp_id) {
            warn!(mp_id = %mp_id, "Dropping mp_fit entry outside the candidate set");
            continue;
        }
        match fit.as_f64().filter(|v| v.is_finite()) {
            Some(value) => {
                mp_fit.insert(mp_id.clone(), value.clamp(0.0, 1.0));
            }
            None => warn!(mp_id = %mp_id, "Dropping non-numeric mp_fit entry"),
        }
    }

    if mp_fit.is_empty() {
        return Err(OrchestrationError::SchemaError(
            "mp_fit has no valid candidate entries".to_string(),
        ));
    }

    let confidence = required_f64(&map, "confidence")?.clamp(0.0, 1.0);

    Ok(QuantReport {
        scores,
        regime_labels,
        mp_fit,
        confidence,
    })
}

fn object_field<'a>(map: &'a Map<String, Value>, key: &str) -> Result<&'a Map<String, Value>> {
    required(map, key)?.as_object().ok_or_else(|| {
        OrchestrationError::SchemaError(format!("field '{}' must be an object", key))
    })
}
