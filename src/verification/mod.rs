//! Decision validation and merging
//!
//! Rules-based checks every decision must pass before it is persisted.
//! Deterministic enforcement.

use crate::context::extract_evidence_ids;
use crate::models::{AssetClass, Decision, DecisionContext};
use serde::Serialize;
use tracing::info;

pub mod merger;

pub use merger::{DecisionMerger, GateReason, MergeInputs, MergeOutcome};

/// Trait for decision rules
pub trait DecisionRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn verify(&self, decision: &Decision, ctx: &DecisionContext) -> RuleCheckResult;
}

pub struct RuleCheckResult {
    pub passed: bool,
    pub details: String,
}

impl RuleCheckResult {
    fn pass(details: impl Into<String>) -> Self {
        Self {
            passed: true,
            details: details.into(),
        }
    }

    fn fail(details: impl Into<String>) -> Self {
        Self {
            passed: false,
            details: details.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleCheck {
    pub rule_name: String,
    pub passed: bool,
    pub details: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub checks: Vec<RuleCheck>,
    pub issues: Vec<String>,
}

/// Validator that enforces the decision invariants
pub struct DecisionValidator {
    rules: Vec<Box<dyn DecisionRule>>,
}

impl DecisionValidator {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn add_rule(&mut self, rule: Box<dyn DecisionRule>) {
        self.rules.push(rule);
    }

    pub fn validate(&self, decision: &Decision, ctx: &DecisionContext) -> ValidationReport {
        let mut checks = Vec::with_capacity(self.rules.len());
        let mut issues = Vec::new();

        for rule in &self.rules {
            let result = rule.verify(decision, ctx);
            if !result.passed {
                issues.push(format!("{}: {}", rule.name(), result.details));
            }
            checks.push(RuleCheck {
                rule_name: rule.name().to_string(),
                passed: result.passed,
                details: result.details,
            });
        }

        let valid = issues.is_empty();

        info!(
            decision_id = %decision.decision_id,
            rule_count = self.rules.len(),
            valid,
            "Decision validation completed"
        );

        ValidationReport {
            valid,
            checks,
            issues,
        }
    }
}

impl Default for DecisionValidator {
    fn default() -> Self {
        Self::new()
    }
}

//
// ================= Rules =================
//

/// Rule: the MP is a catalog candidate
pub struct MpInCatalogRule;

impl DecisionRule for MpInCatalogRule {
    fn name(&self) -> &'static str {
        "mp_in_catalog"
    }

    fn verify(&self, decision: &Decision, ctx: &DecisionContext) -> RuleCheckResult {
        if ctx.catalog.contains_mp(&decision.mp_id) {
            RuleCheckResult::pass(format!("{} is a candidate", decision.mp_id))
        } else {
            RuleCheckResult::fail(format!("{} is not a candidate MP", decision.mp_id))
        }
    }
}

/// Rule: unfunded classes are null, funded classes hold a candidate id
pub struct SubMpAllocationRule;

impl DecisionRule for SubMpAllocationRule {
    fn name(&self) -> &'static str {
        "sub_mp_allocation"
    }

    fn verify(&self, decision: &Decision, ctx: &DecisionContext) -> RuleCheckResult {
        let Some(mp) = ctx.catalog.mps.get(&decision.mp_id) else {
            return RuleCheckResult::fail("MP unknown, cannot check Sub-MPs");
        };

        let mut problems = Vec::new();
        for class in AssetClass::ALL {
            let selected = decision.sub_mp_for(class);
            match (mp.is_funded(class), selected) {
                (false, None) => {}
                (false, Some(id)) => problems.push(format!("{} is unfunded but maps to {}", class, id)),
                (true, None) => problems.push(format!("{} is funded but has no Sub-MP", class)),
                (true, Some(id)) if !ctx.catalog.contains_sub_mp(class, id) => {
                    problems.push(format!("{} maps to unknown Sub-MP {}", class, id))
                }
                (true, Some(_)) => {}
            }
        }

        if problems.is_empty() {
            RuleCheckResult::pass("all asset classes consistent with MP allocation")
        } else {
            RuleCheckResult::fail(problems.join("; "))
        }
    }
}

/// Rule: cited evidence appears in the cycle's graph evidence
pub struct EvidenceTraceableRule;

impl DecisionRule for EvidenceTraceableRule {
    fn name(&self) -> &'static str {
        "evidence_traceable"
    }

    fn verify(&self, decision: &Decision, ctx: &DecisionContext) -> RuleCheckResult {
        let known = extract_evidence_ids(&ctx.graph_evidence);
        let untraced: Vec<&str> = decision
            .used_evidence_ids
            .iter()
            .filter(|id| !known.contains(*id))
            .map(String::as_str)
            .collect();

        if untraced.is_empty() {
            RuleCheckResult::pass(format!("{} evidence ids traced", decision.used_evidence_ids.len()))
        } else {
            RuleCheckResult::fail(format!("untraced evidence ids: {}", untraced.join(", ")))
        }
    }
}

/// Rule: confidence is a probability
pub struct ConfidenceRangeRule;

impl DecisionRule for ConfidenceRangeRule {
    fn name(&self) -> &'static str {
        "confidence_range"
    }

    fn verify(&self, decision: &Decision, _ctx: &DecisionContext) -> RuleCheckResult {
        if (0.0..=1.0).contains(&decision.confidence) {
            RuleCheckResult::pass(format!("confidence {:.2}", decision.confidence))
        } else {
            RuleCheckResult::fail(format!("confidence {} outside [0, 1]", decision.confidence))
        }
    }
}

/// Create a validator with the standard decision invariants
pub fn create_default_validator() -> DecisionValidator {
    let mut validator = DecisionValidator::new();
    validator.add_rule(Box::new(MpInCatalogRule));
    validator.add_rule(Box::new(SubMpAllocationRule));
    validator.add_rule(Box::new(EvidenceTraceableRule));
    validator.add_rule(Box::new(ConfidenceRangeRule));
    validator
}

//
// ================= Tests =================
//
