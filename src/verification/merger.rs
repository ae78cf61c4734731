//! Decision merger
//!
//! Folds the per-class sub-allocations into one `Decision`, corrects any id
//! outside the closed candidate sets and applies the final quality gate.

use super::{create_default_validator, DecisionValidator, ValidationReport};
use crate::agents::sub_allocator::{neutral_sub_mp, SubAllocation};
use crate::audit::compute_decision_id;
use crate::config::EngineConfig;
use crate::context::extract_evidence_ids;
use crate::error::OrchestrationError;
use crate::models::{
    AssetClass, Decision, DecisionContext, DecisionOutcome, ModelPortfolio, NarrativeReport,
    QuantReport, RecommendedAction, RegimeScores, RiskLevel, RiskReport, SubMpSelection,
};
use crate::supervisor::{neutral_mp, MpSelection, SelectionSource};
use crate::Result;
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

/// Weight of the supervisor's confidence in the overall decision confidence.
const SUPERVISOR_WEIGHT: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateReason {
    SupervisorHold,
    LowConfidence,
    HighRisk,
    ValidationFailed,
}

pub struct MergeInputs<'a> {
    pub ctx: &'a DecisionContext,
    pub config: &'a EngineConfig,
    pub selection: &'a MpSelection,
    pub allocations: &'a [SubAllocation],
    pub quant: Option<&'a QuantReport>,
    pub narrative: Option<&'a NarrativeReport>,
    pub risk: &'a RiskReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeOutcome {
    pub decision: Decision,
    pub corrections: Vec<String>,
    pub gate: Option<GateReason>,
    pub validation: ValidationReport,
}

pub struct DecisionMerger {
    validator: DecisionValidator,
}

impl DecisionMerger {
    pub fn new() -> Self {
        Self {
            validator: create_default_validator(),
        }
    }

    pub fn merge(&self, inputs: &MergeInputs<'_>) -> Result<MergeOutcome> {
        let ctx = inputs.ctx;
        let selection = inputs.selection;

        if selection.held_previous() {
            if let Some(previous) = &ctx.previous_decision {
                let decision = held_decision(
                    previous,
                    inputs,
                    selection.confidence,
                    selection.reasoning.clone(),
                );
                let validation = self.validator.validate(&decision, ctx);
                if validation.valid || ctx.catalog.is_empty() {
                    return Ok(MergeOutcome {
                        decision,
                        corrections: Vec::new(),
                        gate: Some(GateReason::SupervisorHold),
                        validation,
                    });
                }
                return self.fallback(inputs, GateReason::ValidationFailed, selection.confidence, Vec::new());
            }
        }

        let mut corrections = Vec::new();

        let Some(mp) = ctx.candidate_mps().get(&selection.mp_id) else {
            corrections.push(format!("MP {} is not a candidate", selection.mp_id));
            return self.fallback(inputs, GateReason::ValidationFailed, selection.confidence, corrections);
        };

        let sub_mp = merge_sub_mps(inputs, mp, &mut corrections);
        let confidence = overall_confidence(selection.confidence, inputs.allocations);

        if inputs.risk.risk_level == RiskLevel::High {
            return self.fallback(inputs, GateReason::HighRisk, confidence, corrections);
        }
        if confidence < inputs.config.confidence_floor {
            return self.fallback(inputs, GateReason::LowConfidence, confidence, corrections);
        }

        let cold_start_hold = selection.source == SelectionSource::Neutral
            && inputs.risk.recommended_action == Some(RecommendedAction::HoldPrevious);

        let decision = Decision {
            decision_id: compute_decision_id(ctx.as_of, &selection.mp_id, &sub_mp),
            as_of: ctx.as_of,
            mp_id: selection.mp_id.clone(),
            reasoning: compose_reasoning(&selection.reasoning, inputs.allocations, &corrections),
            sub_mp,
            confidence,
            used_evidence_ids: used_evidence(inputs),
            outcome: if cold_start_hold {
                DecisionOutcome::NeutralFallback
            } else {
                DecisionOutcome::Selected
            },
            risk_level: inputs.risk.risk_level,
            regime_scores: regime_scores(inputs),
            created_at: Utc::now(),
        };

        let validation = self.validator.validate(&decision, ctx);
        if !validation.valid {
            warn!(issues = ?validation.issues, "Merged decision failed validation");
            corrections.extend(validation.issues);
            return self.fallback(inputs, GateReason::ValidationFailed, confidence, corrections);
        }

        info!(
            decision_id = %decision.decision_id,
            mp_id = %decision.mp_id,
            confidence = decision.confidence,
            corrections = corrections.len(),
            "Decision merged"
        );

        Ok(MergeOutcome {
            decision,
            corrections,
            gate: None,
            validation,
        })
    }

    /// Collapse to the previous decision while it still fits the catalog,
    /// to the neutral one otherwise.
    fn fallback(
        &self,
        inputs: &MergeInputs<'_>,
        reason: GateReason,
        confidence: f64,
        mut corrections: Vec<String>,
    ) -> Result<MergeOutcome> {
        let ctx = inputs.ctx;

        if let Some(previous) = &ctx.previous_decision {
            let held = held_decision(
                previous,
                inputs,
                confidence,
                format!("Quality gate ({:?}): holding previous decision.", reason),
            );
            let validation = self.validator.validate(&held, ctx);

            // An empty catalog cannot be checked against; the hold stands.
            if validation.valid || ctx.catalog.is_empty() {
                warn!(
                    reason = ?reason,
                    confidence,
                    risk_level = ?inputs.risk.risk_level,
                    mp_id = %previous.mp_id,
                    "Quality gate: holding previous decision"
                );
                return Ok(MergeOutcome {
                    decision: held,
                    corrections,
                    gate: Some(reason),
                    validation,
                });
            }

            warn!(
                reason = ?reason,
                mp_id = %previous.mp_id,
                issues = ?validation.issues,
                "Previous decision no longer fits the catalog, using neutral decision"
            );
            corrections.extend(
                validation
                    .issues
                    .into_iter()
                    .map(|issue| format!("previous decision {}: {}", previous.decision_id, issue)),
            );
        } else {
            warn!(reason = ?reason, "Quality gate on cold start, using neutral decision");
        }

        let decision = neutral_decision(inputs, confidence, reason)?;
        let validation = self.validator.validate(&decision, ctx);
        if !validation.valid {
            warn!(
                decision_id = %decision.decision_id,
                issues = ?validation.issues,
                "Neutral decision does not satisfy the current catalog"
            );
        }

        Ok(MergeOutcome {
            decision,
            corrections,
            gate: Some(reason),
            validation,
        })
    }
}

impl Default for DecisionMerger {
    fn default() -> Self {
        Self::new()
    }
}

/// Every asset class: null when unfunded, a candidate id otherwise.
fn merge_sub_mps(inputs: &MergeInputs<'_>, mp: &ModelPortfolio, corrections: &mut Vec<String>) -> SubMpSelection {
    let ctx = inputs.ctx;
    let mut sub_mp = BTreeMap::new();

    for class in AssetClass::ALL {
        if !mp.is_funded(class) {
            sub_mp.insert(class, None);
            continue;
        }

        if !class.is_delegated() {
            sub_mp.insert(class, neutral_sub_mp(ctx, inputs.config, class));
            continue;
        }

        let proposed = inputs
            .allocations
            .iter()
            .find(|a| a.asset_class == class)
            .and_then(|a| a.sub_mp_id.clone());

        let chosen = match proposed {
            Some(id) if ctx.catalog.contains_sub_mp(class, &id) => Some(id),
            other => {
                let replacement = ctx
                    .previous_decision
                    .as_ref()
                    .and_then(|d| d.sub_mp_for(class))
                    .filter(|id| ctx.catalog.contains_sub_mp(class, id))
                    .map(str::to_string)
                    .or_else(|| neutral_sub_mp(ctx, inputs.config, class));

                let note = format!(
                    "{}: {} replaced by {}",
                    class,
                    other.as_deref().unwrap_or("no selection"),
                    replacement.as_deref().unwrap_or("nothing")
                );
                warn!(asset_class = %class, proposed = ?other, replacement = ?replacement, "Closed-set correction");
                corrections.push(note);
                replacement
            }
        };

        sub_mp.insert(class, chosen);
    }

    sub_mp
}

fn overall_confidence(supervisor: f64, allocations: &[SubAllocation]) -> f64 {
    let delegated: Vec<f64> = allocations
        .iter()
        .filter(|a| a.asset_class.is_delegated())
        .map(|a| a.confidence)
        .collect();

    if delegated.is_empty() {
        return supervisor.clamp(0.0, 1.0);
    }

    let mean = delegated.iter().sum::<f64>() / delegated.len() as f64;
    (SUPERVISOR_WEIGHT * supervisor + (1.0 - SUPERVISOR_WEIGHT) * mean).clamp(0.0, 1.0)
}

/// Cited ids from every agent, restricted to ids present in the evidence block.
fn used_evidence(inputs: &MergeInputs<'_>) -> Vec<String> {
    let known = extract_evidence_ids(&inputs.ctx.graph_evidence);

    let cited = inputs
        .narrative
        .into_iter()
        .flat_map(|n| n.evidence_ids.iter())
        .chain(inputs.allocations.iter().flat_map(|a| a.evidence_ids.iter()));

    cited
        .filter(|id| known.contains(*id))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// This cycle's scores, carried forward from the previous decision when Quant is missing.
fn regime_scores(inputs: &MergeInputs<'_>) -> Option<RegimeScores> {
    inputs.quant.map(|q| q.scores).or_else(|| {
        inputs
            .ctx
            .previous_decision
            .as_ref()
            .and_then(|d| d.regime_scores)
    })
}

fn held_decision(previous: &Decision, inputs: &MergeInputs<'_>, confidence: f64, reasoning: String) -> Decision {
    let ctx = inputs.ctx;
    Decision {
        decision_id: compute_decision_id(ctx.as_of, &previous.mp_id, &previous.sub_mp),
        as_of: ctx.as_of,
        mp_id: previous.mp_id.clone(),
        sub_mp: previous.sub_mp.clone(),
        reasoning,
        confidence: confidence.clamp(0.0, 1.0),
        used_evidence_ids: used_evidence(inputs),
        outcome: DecisionOutcome::HeldPrevious,
        risk_level: inputs.risk.risk_level,
        regime_scores: regime_scores(inputs),
        created_at: Utc::now(),
    }
}

fn neutral_decision(inputs: &MergeInputs<'_>, confidence: f64, reason: GateReason) -> Result<Decision> {
    let ctx = inputs.ctx;
    let mp_id = neutral_mp(ctx, inputs.config).ok_or_else(|| {
        OrchestrationError::ConfigurationError(format!(
            "cold start on {} with no viable neutral MP ('{}')",
            ctx.as_of, inputs.config.neutral_mp_id
        ))
    })?;

    let sub_mp: SubMpSelection = match ctx.candidate_mps().get(&mp_id) {
        Some(mp) => AssetClass::ALL
            .iter()
            .map(|class| {
                let id = if mp.is_funded(*class) {
                    neutral_sub_mp(ctx, inputs.config, *class)
                } else {
                    None
                };
                (*class, id)
            })
            .collect(),
        None => AssetClass::ALL.iter().map(|c| (*c, None)).collect(),
    };

    Ok(Decision {
        decision_id: compute_decision_id(ctx.as_of, &mp_id, &sub_mp),
        as_of: ctx.as_of,
        reasoning: format!(
            "Quality gate ({:?}) without a usable previous decision: neutral {} with neutral Sub-MPs.",
            reason, mp_id
        ),
        mp_id,
        sub_mp,
        confidence: confidence.clamp(0.0, 1.0),
        used_evidence_ids: Vec::new(),
        outcome: DecisionOutcome::NeutralFallback,
        risk_level: inputs.risk.risk_level,
        regime_scores: regime_scores(inputs),
        created_at: Utc::now(),
    })
}

fn compose_reasoning(supervisor: &str, allocations: &[SubAllocation], corrections: &[String]) -> String {
    let mut lines = vec![supervisor.to_string()];
    for allocation in allocations {
        if let Some(id) = &allocation.sub_mp_id {
            lines.push(format!("{} -> {}: {}", allocation.asset_class, id, allocation.reasoning));
        }
    }
    if !corrections.is_empty() {
        lines.push(format!("Corrections: {}", corrections.join("; ")));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::sub_allocator::SelectionSource as SubSource;
    use crate::agents::CallState;
    use crate::models::{CandidateCatalog, Objective, Sentiment, SubModelPortfolio};
    use chrono::NaiveDate;

    fn candidates(ids: &[&str]) -> BTreeMap<String, SubModelPortfolio> {
        ids.iter()
            .map(|id| (id.to_string(), SubModelPortfolio::default()))
            .collect()
    }

    fn ctx(previous: Option<Decision>) -> DecisionContext {
        DecisionContext {
            as_of: NaiveDate::from_ymd_opt(2024, 7, 2).unwrap(),
            objective: Objective::default(),
            quant_signals: BTreeMap::new(),
            narrative_summary: String::new(),
            graph_evidence: "AI capex evidence:10, power demand evidence:11".to_string(),
            catalog: CandidateCatalog {
                mps: BTreeMap::from([
                    (
                        "MP-1".to_string(),
                        ModelPortfolio {
                            name: "Growth".to_string(),
                            allocation: BTreeMap::from([
                                (AssetClass::Stocks, 70.0),
                                (AssetClass::Bonds, 20.0),
                                (AssetClass::Alternatives, 10.0),
                            ]),
                        },
                    ),
                    (
                        "MP-3".to_string(),
                        ModelPortfolio {
                            name: "Neutral".to_string(),
                            allocation: BTreeMap::from([
                                (AssetClass::Stocks, 30.0),
                                (AssetClass::Bonds, 50.0),
                                (AssetClass::Cash, 20.0),
                            ]),
                        },
                    ),
                ]),
                sub_mps: BTreeMap::from([
                    (AssetClass::Stocks, candidates(&["Eq-A", "Eq-B"])),
                    (AssetClass::Bonds, candidates(&["Bd-A", "Bd-B"])),
                    (AssetClass::Alternatives, candidates(&["Alt-A"])),
                    (AssetClass::Cash, candidates(&["Cash-A"])),
                ]),
            },
            previous_decision: previous,
            degraded_inputs: Vec::new(),
        }
    }

    fn previous() -> Decision {
        let sub_mp = BTreeMap::from([
            (AssetClass::Stocks, Some("Eq-B".to_string())),
            (AssetClass::Bonds, Some("Bd-B".to_string())),
            (AssetClass::Alternatives, Some("Alt-A".to_string())),
            (AssetClass::Cash, None),
        ]);
        Decision {
            decision_id: "prev".to_string(),
            as_of: NaiveDate::from_ymd_opt(2024, 7, 1).unwrap(),
            mp_id: "MP-1".to_string(),
            sub_mp,
            reasoning: String::new(),
            confidence: 0.7,
            used_evidence_ids: vec![],
            outcome: DecisionOutcome::Selected,
            risk_level: RiskLevel::Low,
            regime_scores: None,
            created_at: Utc::now(),
        }
    }

    fn selection(mp_id: &str, confidence: f64, source: SelectionSource) -> MpSelection {
        MpSelection {
            mp_id: mp_id.to_string(),
            confidence,
            reasoning: "base".to_string(),
            source,
        }
    }

    fn allocation(class: AssetClass, id: &str, evidence: &[&str]) -> SubAllocation {
        SubAllocation {
            asset_class: class,
            sub_mp_id: Some(id.to_string()),
            confidence: 0.8,
            reasoning: "fit".to_string(),
            evidence_ids: evidence.iter().map(|e| e.to_string()).collect(),
            source: SubSource::Agent,
            call_state: CallState::Valid,
        }
    }

    fn risk(level: RiskLevel) -> RiskReport {
        RiskReport {
            divergence_detected: false,
            risk_level: level,
            constraint_violations: vec![],
            whipsaw_warning: false,
            recommended_action: None,
        }
    }

    fn narrative() -> NarrativeReport {
        NarrativeReport {
            dominant_themes: vec!["AI Capex".to_string()],
            sentiment: Sentiment::Positive,
            causal_risks: vec![],
            weak_signals: vec![],
            evidence_ids: vec!["evidence:10".to_string()],
        }
    }

    fn merge(
        context: &DecisionContext,
        selection: &MpSelection,
        allocations: &[SubAllocation],
        risk: &RiskReport,
    ) -> MergeOutcome {
        let config = EngineConfig::default();
        let narrative = narrative();
        let inputs = MergeInputs {
            ctx: context,
            config: &config,
            selection,
            allocations,
            quant: None,
            narrative: Some(&narrative),
            risk,
        };
        DecisionMerger::new().merge(&inputs).unwrap()
    }

    #[test]
    fn test_invalid_id_replaced_by_previous_value() {
        let context = ctx(Some(previous()));
        let allocations = vec![
            allocation(AssetClass::Stocks, "Eq-A", &["evidence:11", "evidence:99"]),
            allocation(AssetClass::Bonds, "Bd-Z", &[]),
            allocation(AssetClass::Alternatives, "Alt-A", &[]),
        ];

        let outcome = merge(
            &context,
            &selection("MP-1", 0.8, SelectionSource::QuantTop),
            &allocations,
            &risk(RiskLevel::Low),
        );

        let decision = &outcome.decision;
        assert_eq!(decision.outcome, DecisionOutcome::Selected);
        assert_eq!(decision.sub_mp_for(AssetClass::Stocks), Some("Eq-A"));
        assert_eq!(decision.sub_mp_for(AssetClass::Bonds), Some("Bd-B"));
        assert_eq!(decision.sub_mp.get(&AssetClass::Cash), Some(&None));
        assert_eq!(outcome.corrections.len(), 1);
        assert_eq!(
            decision.used_evidence_ids,
            vec!["evidence:10".to_string(), "evidence:11".to_string()]
        );
        assert!(outcome.validation.valid);
    }

    #[test]
    fn test_cash_is_assigned_directly() {
        let context = ctx(None);
        let allocations = vec![
            allocation(AssetClass::Stocks, "Eq-A", &[]),
            allocation(AssetClass::Bonds, "Bd-A", &[]),
        ];

        let outcome = merge(
            &context,
            &selection("MP-3", 0.8, SelectionSource::QuantTop),
            &allocations,
            &risk(RiskLevel::Low),
        );
        assert_eq!(outcome.decision.sub_mp_for(AssetClass::Cash), Some("Cash-A"));
        assert_eq!(outcome.decision.sub_mp.get(&AssetClass::Alternatives), Some(&None));
        assert_eq!(outcome.decision.sub_mp.len(), 4);
    }

    #[test]
    fn test_high_risk_collapses_to_previous() {
        let prev = previous();
        let context = ctx(Some(prev.clone()));
        let allocations = vec![allocation(AssetClass::Stocks, "Eq-A", &[])];

        let outcome = merge(
            &context,
            &selection("MP-3", 0.9, SelectionSource::QuantTop),
            &allocations,
            &risk(RiskLevel::High),
        );

        assert_eq!(outcome.gate, Some(GateReason::HighRisk));
        assert_eq!(outcome.decision.mp_id, prev.mp_id);
        assert_eq!(outcome.decision.sub_mp, prev.sub_mp);
        assert_eq!(outcome.decision.outcome, DecisionOutcome::HeldPrevious);
    }

    #[test]
    fn test_low_confidence_cold_start_is_neutral() {
        let context = ctx(None);
        let allocations = vec![allocation(AssetClass::Stocks, "Eq-B", &[])];

        let outcome = merge(
            &context,
            &selection("MP-1", 0.1, SelectionSource::QuantTop),
            &allocations,
            &risk(RiskLevel::Low),
        );

        let decision = &outcome.decision;
        assert_eq!(outcome.gate, Some(GateReason::LowConfidence));
        assert_eq!(decision.outcome, DecisionOutcome::NeutralFallback);
        assert_eq!(decision.mp_id, "MP-3");
        assert_eq!(decision.sub_mp_for(AssetClass::Stocks), Some("Eq-A"));
        assert_eq!(decision.sub_mp_for(AssetClass::Cash), Some("Cash-A"));
        assert!(outcome.validation.valid);
    }

    #[test]
    fn test_supervisor_hold_keeps_previous_exactly() {
        let prev = previous();
        let context = ctx(Some(prev.clone()));

        let outcome = merge(
            &context,
            &selection("MP-1", 0.7, SelectionSource::HeldPrevious),
            &[],
            &risk(RiskLevel::Medium),
        );

        assert_eq!(outcome.gate, Some(GateReason::SupervisorHold));
        assert_eq!(outcome.decision.sub_mp, prev.sub_mp);
        assert_ne!(outcome.decision.decision_id, prev.decision_id);
        assert!(outcome.decision.decision_id.starts_with("20240702-MP-1-"));
    }

    #[test]
    fn test_hold_of_retired_mp_becomes_neutral_fallback() {
        let mut prev = previous();
        prev.mp_id = "MP-9".to_string();
        let context = ctx(Some(prev));

        let outcome = merge(
            &context,
            &selection("MP-9", 0.7, SelectionSource::HeldPrevious),
            &[],
            &risk(RiskLevel::Medium),
        );

        let decision = &outcome.decision;
        assert_eq!(outcome.gate, Some(GateReason::ValidationFailed));
        assert_eq!(decision.outcome, DecisionOutcome::NeutralFallback);
        assert_eq!(decision.mp_id, "MP-3");
        assert!(outcome.validation.valid);
        assert!(outcome.corrections.iter().any(|c| c.contains("MP-9")));
    }

    #[test]
    fn test_gate_does_not_restore_retired_sub_mp() {
        let mut prev = previous();
        prev.sub_mp.insert(AssetClass::Stocks, Some("Eq-OLD".to_string()));
        let context = ctx(Some(prev));
        let allocations = vec![allocation(AssetClass::Stocks, "Eq-A", &[])];

        let outcome = merge(
            &context,
            &selection("MP-1", 0.9, SelectionSource::QuantTop),
            &allocations,
            &risk(RiskLevel::High),
        );

        let decision = &outcome.decision;
        assert_eq!(outcome.gate, Some(GateReason::HighRisk));
        assert_eq!(decision.outcome, DecisionOutcome::NeutralFallback);
        assert_ne!(decision.sub_mp_for(AssetClass::Stocks), Some("Eq-OLD"));
        assert!(context.catalog.contains_mp(&decision.mp_id));
        assert!(outcome.validation.valid);
    }
}
