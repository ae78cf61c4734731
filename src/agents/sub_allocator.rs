//! Sub-allocator agents: one Sub-MP per funded asset class
//!
//! Each funded, delegated class gets its own agent call; calls run
//! concurrently after the MP is fixed. Cash is never delegated. Weak signals
//! abstain, and a new pick only replaces the previous one when it clears the
//! materiality threshold.

use super::{
    json_kind, optional_str, parse_json_object, required, required_f64, required_str,
    string_list, AgentCall, AgentRequest, AgentRole, CallState,
};
use crate::config::EngineConfig;
use crate::context::normalize_evidence_id;
use crate::error::OrchestrationError;
use crate::models::{AssetClass, DecisionContext, NarrativeReport, QuantReport};
use crate::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, warn};

const SYSTEM_PROMPT: &str = r#"You are a sub-portfolio allocator for a single asset class.
You choose exactly one Sub-Model-Portfolio id from the candidate list you are given.
Prefer the previous selection unless the new evidence is material.
If the signal is weak, say so with a low confidence."#;

pub const SCHEMA_HINT: &str = r#"{
  "sub_mp_id": "<candidate id>",
  "confidence": 0-1,
  "reasoning": "<one paragraph>",
  "evidence_ids": ["evidence:<id>", ...]
}"#;

pub const LEGACY_SCHEMA_HINT: &str = r#"{
  "selections": { "<asset class>": "<candidate id>", ... },
  "confidence": 0-1,
  "reasoning": "<one paragraph>",
  "evidence_ids": ["evidence:<id>", ...]
}"#;

/// Validated reply of one sub-allocator call (id not yet closed-set checked).
#[derive(Debug, Clone, PartialEq)]
pub struct SubAllocatorReply {
    pub sub_mp_id: String,
    pub confidence: f64,
    pub reasoning: String,
    pub evidence_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionSource {
    Agent,
    KeptPrevious,
    Abstained,
}

/// Per-class proposal handed to the merger.
#[derive(Debug, Clone, Serialize)]
pub struct SubAllocation {
    pub asset_class: AssetClass,
    pub sub_mp_id: Option<String>,
    pub confidence: f64,
    pub reasoning: String,
    pub evidence_ids: Vec<String>,
    pub source: SelectionSource,
    pub call_state: CallState,
}

/// Read-only inputs shared by every sub-allocator task.
#[derive(Clone)]
pub struct SubAllocationInputs {
    pub ctx: Arc<DecisionContext>,
    pub config: Arc<EngineConfig>,
    pub mp_id: String,
    pub quant: Option<QuantReport>,
    pub narrative: Option<NarrativeReport>,
}

impl SubAllocationInputs {
    /// Delegated classes funded by the selected MP.
    pub fn delegated_classes(&self) -> Vec<AssetClass> {
        let Some(mp) = self.ctx.catalog.mps.get(&self.mp_id) else {
            return Vec::new();
        };
        AssetClass::ALL
            .iter()
            .copied()
            .filter(|c| c.is_delegated() && mp.is_funded(*c))
            .collect()
    }
}

pub struct SubAllocatorAgent;

impl SubAllocatorAgent {
    /// One concurrent call per delegated class; waits for all of them.
    pub async fn allocate_parallel(call: &AgentCall, inputs: &SubAllocationInputs) -> Vec<SubAllocation> {
        let mut tasks = JoinSet::new();

        for class in inputs.delegated_classes() {
            let call = call.clone();
            let inputs = inputs.clone();
            tasks.spawn(async move { Self::allocate_one(&call, &inputs, class).await });
        }

        let mut allocations = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(allocation) => allocations.push(allocation),
                Err(e) => warn!(error = %e, "Sub-allocator task aborted"),
            }
        }

        // A class whose task died still needs a proposal.
        for class in inputs.delegated_classes() {
            if !allocations.iter().any(|a| a.asset_class == class) {
                allocations.push(apply_policy(class, None, CallState::Missing, inputs));
            }
        }

        allocations.sort_by_key(|a| a.asset_class);
        allocations
    }

    pub async fn allocate_one(call: &AgentCall, inputs: &SubAllocationInputs, class: AssetClass) -> SubAllocation {
        let request = build_request(inputs, class);
        let outcome = call.run(request, SCHEMA_HINT, validate_reply).await;
        let state = outcome.state();
        apply_policy(class, outcome.report, state, inputs)
    }

    /// Single call choosing every delegated class at once.
    pub async fn allocate_legacy(call: &AgentCall, inputs: &SubAllocationInputs) -> Vec<SubAllocation> {
        let classes = inputs.delegated_classes();
        if classes.is_empty() {
            return Vec::new();
        }

        let request = build_legacy_request(inputs, &classes);
        let outcome = call.run(request, LEGACY_SCHEMA_HINT, validate_legacy_reply).await;
        let state = outcome.state();

        classes
            .into_iter()
            .map(|class| {
                let reply = outcome.report.as_ref().and_then(|replies| replies.get(&class).cloned());
                apply_policy(class, reply, state, inputs)
            })
            .collect()
    }
}

/// Abstain and whipsaw-dampening policy for one class.
fn apply_policy(
    class: AssetClass,
    reply: Option<SubAllocatorReply>,
    call_state: CallState,
    inputs: &SubAllocationInputs,
) -> SubAllocation {
    let config = &inputs.config;
    let previous = previous_selection(inputs, class);

    let Some(reply) = reply else {
        let fallback = previous.clone().or_else(|| neutral_selection(inputs, class));
        warn!(asset_class = %class, fallback = ?fallback, "Sub-allocator report missing, abstaining");
        return SubAllocation {
            asset_class: class,
            sub_mp_id: fallback,
            confidence: 0.0,
            reasoning: "No valid sub-allocator report; abstained.".to_string(),
            evidence_ids: Vec::new(),
            source: SelectionSource::Abstained,
            call_state,
        };
    };

    if reply.confidence < config.sub_mp_abstain_floor {
        let fallback = previous.clone().or_else(|| neutral_selection(inputs, class));
        info!(asset_class = %class, confidence = reply.confidence, "Weak sub-allocation signal, abstaining");
        return SubAllocation {
            asset_class: class,
            sub_mp_id: fallback,
            confidence: reply.confidence,
            reasoning: format!("Weak signal ({:.2}); abstained. {}", reply.confidence, reply.reasoning),
            evidence_ids: Vec::new(),
            source: SelectionSource::Abstained,
            call_state,
        };
    }

    if let Some(prev) = previous {
        if prev != reply.sub_mp_id && reply.confidence < config.sub_mp_materiality {
            info!(
                asset_class = %class,
                previous = %prev,
                proposed = %reply.sub_mp_id,
                confidence = reply.confidence,
                "Change below materiality threshold, keeping previous Sub-MP"
            );
            return SubAllocation {
                asset_class: class,
                sub_mp_id: Some(prev),
                confidence: reply.confidence,
                reasoning: format!(
                    "Kept previous selection; proposed {} not material ({:.2} < {:.2}).",
                    reply.sub_mp_id, reply.confidence, config.sub_mp_materiality
                ),
                evidence_ids: Vec::new(),
                source: SelectionSource::KeptPrevious,
                call_state,
            };
        }
    }

    SubAllocation {
        asset_class: class,
        sub_mp_id: Some(reply.sub_mp_id),
        confidence: reply.confidence,
        reasoning: reply.reasoning,
        evidence_ids: reply.evidence_ids,
        source: SelectionSource::Agent,
        call_state,
    }
}

/// Previous cycle's pick for `class`, if it is still a candidate.
fn previous_selection(inputs: &SubAllocationInputs, class: AssetClass) -> Option<String> {
    inputs
        .ctx
        .previous_decision
        .as_ref()
        .and_then(|d| d.sub_mp_for(class))
        .filter(|id| inputs.ctx.catalog.contains_sub_mp(class, id))
        .map(str::to_string)
}

/// Configured neutral Sub-MP, else the first candidate in id order.
pub fn neutral_selection(inputs: &SubAllocationInputs, class: AssetClass) -> Option<String> {
    neutral_sub_mp(&inputs.ctx, &inputs.config, class)
}

pub fn neutral_sub_mp(ctx: &DecisionContext, config: &EngineConfig, class: AssetClass) -> Option<String> {
    config
        .neutral_sub_mps
        .get(&class)
        .filter(|id| ctx.catalog.contains_sub_mp(class, id))
        .cloned()
        .or_else(|| {
            ctx.catalog
                .sub_candidates(class)
                .and_then(|c| c.keys().next().cloned())
        })
}

fn describe_candidates(ctx: &DecisionContext, class: AssetClass) -> String {
    ctx.catalog
        .sub_candidates(class)
        .map(|candidates| {
            candidates
                .iter()
                .map(|(id, sub)| {
                    let composition = sub
                        .composition
                        .iter()
                        .map(|(instrument, w)| format!("{} {:.0}%", instrument, w))
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("- {} ({}): {}", id, sub.name, composition)
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

fn describe_signals(inputs: &SubAllocationInputs) -> (String, String) {
    let themes = inputs
        .narrative
        .as_ref()
        .map(|n| n.dominant_themes.join(", "))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "(narrative report missing)".to_string());

    let trend = inputs
        .quant
        .as_ref()
        .map(|q| {
            format!(
                "growth {:.1} ({:?}), inflation {:.1} ({:?}), liquidity {:.1} ({:?})",
                q.scores.growth,
                q.regime_labels.growth,
                q.scores.inflation,
                q.regime_labels.inflation,
                q.scores.liquidity,
                q.regime_labels.liquidity
            )
        })
        .unwrap_or_else(|| "(quant report missing)".to_string());

    (themes, trend)
}

fn build_request(inputs: &SubAllocationInputs, class: AssetClass) -> AgentRequest {
    let ctx = &inputs.ctx;
    let weight = ctx
        .catalog
        .mps
        .get(&inputs.mp_id)
        .map(|mp| mp.weight(class))
        .unwrap_or(0.0);
    let (themes, trend) = describe_signals(inputs);
    let previous = previous_selection(inputs, class).unwrap_or_else(|| "none".to_string());
    let neutral = neutral_selection(inputs, class).unwrap_or_else(|| "none".to_string());

    let prompt = format!(
        r#"AS OF: {}
ASSET CLASS: {}
SELECTED MODEL PORTFOLIO: {} ({:.0}% in {})

CANDIDATES:
{}

NARRATIVE THEMES: {}
QUANT TREND: {}

PREVIOUS SELECTION: {}
NEUTRAL CANDIDATE: {}

Rules:
- sub_mp_id must be one of the candidate ids above
- Keep the previous selection unless the evidence is material
- When the signal is weak, choose the neutral candidate with low confidence
- Return ONLY valid JSON in this format:

{}
"#,
        ctx.as_of,
        class,
        inputs.mp_id,
        weight,
        class,
        describe_candidates(ctx, class),
        themes,
        trend,
        previous,
        neutral,
        SCHEMA_HINT
    );

    AgentRequest {
        role: AgentRole::SubAllocator(class),
        system: SYSTEM_PROMPT.to_string(),
        prompt,
    }
}

fn build_legacy_request(inputs: &SubAllocationInputs, classes: &[AssetClass]) -> AgentRequest {
    let ctx = &inputs.ctx;
    let (themes, trend) = describe_signals(inputs);

    let sections = classes
        .iter()
        .map(|class| {
            format!(
                "{} (previous: {}):\n{}",
                class,
                previous_selection(inputs, *class).unwrap_or_else(|| "none".to_string()),
                describe_candidates(ctx, *class)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    let prompt = format!(
        r#"AS OF: {}
SELECTED MODEL PORTFOLIO: {}

CANDIDATES BY ASSET CLASS:
{}

NARRATIVE THEMES: {}
QUANT TREND: {}

Rules:
- Choose exactly one candidate id per asset class listed above
- Keep previous selections unless the evidence is material
- Return ONLY valid JSON in this format:

{}
"#,
        ctx.as_of, inputs.mp_id, sections, themes, trend, LEGACY_SCHEMA_HINT
    );

    AgentRequest {
        role: AgentRole::SubAllocatorLegacy,
        system: SYSTEM_PROMPT.to_string(),
        prompt,
    }
}

pub fn validate_reply(raw: &str) -> Result<SubAllocatorReply> {
    let map = parse_json_object(raw)?;

    let sub_mp_id = required_str(&map, "sub_mp_id")?.trim().to_string();
    if sub_mp_id.is_empty() {
        return Err(OrchestrationError::SchemaError("empty sub_mp_id".to_string()));
    }

    Ok(SubAllocatorReply {
        sub_mp_id,
        confidence: required_f64(&map, "confidence")?.clamp(0.0, 1.0),
        reasoning: optional_str(&map, "reasoning").unwrap_or_default().to_string(),
        evidence_ids: string_list(&map, "evidence_ids")
            .iter()
            .map(|id| normalize_evidence_id(id))
            .collect(),
    })
}

pub fn validate_legacy_reply(raw: &str) -> Result<BTreeMap<AssetClass, SubAllocatorReply>> {
    let map = parse_json_object(raw)?;

    let selections = required(&map, "selections")?;
    let selections = selections.as_object().ok_or_else(|| {
        OrchestrationError::SchemaError(format!(
            "field 'selections' must be an object, got {}",
            json_kind(selections)
        ))
    })?;

    let confidence = required_f64(&map, "confidence")?.clamp(0.0, 1.0);
    let reasoning = optional_str(&map, "reasoning").unwrap_or_default().to_string();
    let evidence_ids: Vec<String> = string_list(&map, "evidence_ids")
        .iter()
        .map(|id| normalize_evidence_id(id))
        .collect();

    let mut replies = BTreeMap::new();
    for (key, value) in selections {
        let Ok(class) = key.parse::<AssetClass>() else {
            warn!(asset_class = %key, "Dropping selection for unknown asset class");
            continue;
        };
        let Some(id) = value.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
            warn!(asset_class = %class, "Dropping non-string selection");
            continue;
        };
        replies.insert(
            class,
            SubAllocatorReply {
                sub_mp_id: id.to_string(),
                confidence,
                reasoning: reasoning.clone(),
                evidence_ids: evidence_ids.clone(),
            },
        );
    }

    Ok(replies)
}
