//! Risk agent: divergence, constraint and whipsaw review
//!
//! The three checks run deterministically on the upstream reports. An LLM
//! review may add suspected constraint violations and raise the risk level;
//! it can never lower it or cancel a hold.

use super::{
    parse_json_object, required_str, string_list, AgentCall, AgentRequest, AgentRole,
    CallOutcome,
};
use crate::config::EngineConfig;
use crate::error::OrchestrationError;
use crate::models::{
    DecisionContext, GrowthRegime, InflationRegime, LiquidityRegime, NarrativeReport,
    QuantReport, RecommendedAction, RiskLevel, RiskReport, Sentiment,
};
use crate::Result;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

const SYSTEM_PROMPT: &str = r#"You are the risk officer of a portfolio committee.
You review the quant and narrative reports against the portfolio's stated limits.
You have no portfolio simulator: every violation you list is a suspicion, not a certainty."#;

pub const SCHEMA_HINT: &str = r#"{
  "risk_level": "low|medium|high",
  "divergence_detected": true|false,
  "constraint_violations": ["<suspected violation>", ...]
}"#;

/// Rough peak-to-trough loss of the risky sleeve in a stress scenario.
const STRESS_LOSS_BASE: f64 = 0.25;
const STRESS_LOSS_BEARISH: f64 = 0.35;

const NEGATIVE_THEME_KEYWORDS: &[&str] = &[
    "recession", "fear", "crisis", "default", "slowdown", "layoff", "war", "contraction",
    "stagflation", "selloff", "sell-off", "downgrade", "bankruptcy", "credit stress", "tightening",
];

const POSITIVE_THEME_KEYWORDS: &[&str] = &[
    "boom", "rally", "capex", "expansion", "easing", "recovery", "soft landing", "rate cut",
    "earnings beat", "productivity", "growth",
];

/// LLM review of the deterministic risk picture.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RiskReview {
    pub risk_level: RiskLevel,
    pub divergence_detected: bool,
    pub constraint_violations: Vec<String>,
}

pub struct RiskAgent;

impl RiskAgent {
    /// Deterministic checks plus optional LLM review.
    pub async fn run(
        call: &AgentCall,
        ctx: &DecisionContext,
        quant: Option<&QuantReport>,
        narrative: Option<&NarrativeReport>,
        config: &EngineConfig,
    ) -> (RiskReport, CallOutcome<RiskReview>) {
        let base = assess(ctx, quant, narrative, config);

        if quant.is_none() && narrative.is_none() {
            return (base, CallOutcome::aborted(AgentRole::Risk, "no upstream reports to review"));
        }
        if call.deadline_passed() {
            return (base, CallOutcome::aborted(AgentRole::Risk, "cycle deadline passed"));
        }

        let request = build_request(ctx, quant, narrative, &base);
        let review = call.run(request, SCHEMA_HINT, validate_review).await;

        let report = match &review.report {
            Some(r) => merge_review(base, r, quant, narrative, ctx, config),
            None => {
                warn!("Risk review missing, keeping deterministic assessment");
                base
            }
        };

        info!(
            divergence = report.divergence_detected,
            risk_level = ?report.risk_level,
            violations = report.constraint_violations.len(),
            whipsaw_warning = report.whipsaw_warning,
            action = ?report.recommended_action,
            "Risk report ready"
        );

        (report, review)
    }
}

/// Deterministic risk assessment. Never fails.
pub fn assess(
    ctx: &DecisionContext,
    quant: Option<&QuantReport>,
    narrative: Option<&NarrativeReport>,
    config: &EngineConfig,
) -> RiskReport {
    let divergence_detected = match (quant, narrative) {
        (Some(q), Some(n)) => quant_polarity(q) * narrative_polarity(n) < 0,
        _ => false,
    };

    let constraint_violations = constraint_violations(ctx, quant, narrative, divergence_detected);
    let (small_move, whipsaw_warning) = whipsaw_check(ctx, quant, config);

    let mut report = RiskReport {
        divergence_detected,
        risk_level: RiskLevel::Low,
        constraint_violations,
        whipsaw_warning,
        recommended_action: None,
    };
    report.risk_level = base_risk_level(&report, quant.is_none() || narrative.is_none());
    report.recommended_action = recommend(&report, quant.is_none() || narrative.is_none(), small_move);
    report
}

fn base_risk_level(report: &RiskReport, missing_upstream: bool) -> RiskLevel {
    let violations = report.constraint_violations.len();
    let mut level = RiskLevel::Low;

    if report.divergence_detected || violations > 0 {
        level = RiskLevel::Medium;
    }
    if violations >= 2 || (report.divergence_detected && violations > 0) {
        level = RiskLevel::High;
    }
    if missing_upstream {
        level = level.max(RiskLevel::Medium);
    }
    level
}

fn recommend(report: &RiskReport, missing_upstream: bool, small_move: bool) -> Option<RecommendedAction> {
    if missing_upstream || small_move {
        Some(RecommendedAction::HoldPrevious)
    } else if report.divergence_detected || report.risk_level == RiskLevel::High {
        Some(RecommendedAction::ShiftDefensive)
    } else if !report.constraint_violations.is_empty() {
        Some(RecommendedAction::ShiftNeutral)
    } else {
        None
    }
}

/// -1 contractionary, 0 mixed, +1 expansionary.
pub fn quant_polarity(report: &QuantReport) -> i8 {
    let labels = report.regime_labels;
    let growth = match labels.growth {
        GrowthRegime::Expansion | GrowthRegime::Recovery => 1.0,
        GrowthRegime::Slowdown => 0.0,
        GrowthRegime::Contraction => -1.0,
    };
    let liquidity = match labels.liquidity {
        LiquidityRegime::Loose => 0.5,
        LiquidityRegime::Neutral => 0.0,
        LiquidityRegime::Tight => -0.5,
    };
    let inflation = match labels.inflation {
        InflationRegime::High => -0.5,
        _ => 0.0,
    };
    signum(growth + liquidity + inflation)
}

/// Sentiment dominates; themes decide when sentiment is neutral or mixed.
pub fn narrative_polarity(report: &NarrativeReport) -> i8 {
    let sentiment = match report.sentiment {
        Sentiment::Positive => 2.0,
        Sentiment::Negative => -2.0,
        Sentiment::Neutral | Sentiment::Mixed => 0.0,
    };

    let themes: f64 = report
        .dominant_themes
        .iter()
        .map(|theme| {
            let theme = theme.to_lowercase();
            let pos = POSITIVE_THEME_KEYWORDS.iter().filter(|k| theme.contains(**k)).count() as f64;
            let neg = NEGATIVE_THEME_KEYWORDS.iter().filter(|k| theme.contains(**k)).count() as f64;
            pos - neg
        })
        .sum();

    signum(sentiment + themes.clamp(-1.0, 1.0))
}

fn signum(value: f64) -> i8 {
    if value > 0.0 {
        1
    } else if value < 0.0 {
        -1
    } else {
        0
    }
}

/// Suspected breaches of the objective's limits, as free text.
fn constraint_violations(
    ctx: &DecisionContext,
    quant: Option<&QuantReport>,
    narrative: Option<&NarrativeReport>,
    divergence: bool,
) -> Vec<String> {
    let constraints = &ctx.objective.constraints;
    let mut violations = Vec::new();

    let nominal = quant
        .and_then(|q| q.top_mp())
        .map(|(id, _)| id.to_string())
        .or_else(|| ctx.previous_decision.as_ref().map(|d| d.mp_id.clone()));
    let Some(nominal_id) = nominal else {
        return violations;
    };
    let Some(nominal_mp) = ctx.catalog.mps.get(&nominal_id) else {
        return violations;
    };

    if let Some(limit) = constraints.max_drawdown_pct {
        let bearish = divergence || narrative.map(|n| n.sentiment == Sentiment::Negative).unwrap_or(false);
        let stress = if bearish { STRESS_LOSS_BEARISH } else { STRESS_LOSS_BASE };
        let estimate = nominal_mp.risky_share() * stress;
        if estimate > limit {
            violations.push(format!(
                "Possible max drawdown breach: {} risky share {:.0}% implies ~{:.1}% stress drawdown vs {:.1}% limit",
                nominal_id,
                nominal_mp.risky_share(),
                estimate,
                limit
            ));
        }
    }

    if let (Some(budget), Some(previous)) = (constraints.turnover_budget_pct, ctx.previous_decision.as_ref()) {
        if previous.mp_id != nominal_id {
            if let Some(previous_mp) = ctx.catalog.mps.get(&previous.mp_id) {
                let turnover = previous_mp.turnover_to(nominal_mp);
                if turnover > budget {
                    violations.push(format!(
                        "Possible turnover budget breach: {} -> {} moves ~{:.1}% vs {:.1}% budget",
                        previous.mp_id, nominal_id, turnover, budget
                    ));
                }
            }
        }
    }

    violations
}

/// Returns (scores moved less than the materiality band, whipsaw warning).
fn whipsaw_check(ctx: &DecisionContext, quant: Option<&QuantReport>, config: &EngineConfig) -> (bool, bool) {
    let (Some(quant), Some(previous)) = (quant, ctx.previous_decision.as_ref()) else {
        return (false, false);
    };
    let Some(previous_scores) = previous.regime_scores else {
        return (false, false);
    };

    let delta = quant.scores.max_delta(&previous_scores);
    let small_move = delta <= config.score_materiality;
    let would_switch = quant
        .top_mp()
        .map(|(id, _)| id != previous.mp_id)
        .unwrap_or(false);

    if small_move {
        info!(delta, materiality = config.score_materiality, "Score move within materiality band");
    }

    (small_move, small_move && would_switch)
}

fn build_request(
    ctx: &DecisionContext,
    quant: Option<&QuantReport>,
    narrative: Option<&NarrativeReport>,
    base: &RiskReport,
) -> AgentRequest {
    let to_json = |value: Option<Value>| {
        value
            .map(|v| serde_json::to_string_pretty(&v).unwrap_or_else(|_| v.to_string()))
            .unwrap_or_else(|| "null (report missing)".to_string())
    };

    let quant_json = to_json(quant.and_then(|q| serde_json::to_value(q).ok()));
    let narrative_json = to_json(narrative.and_then(|n| serde_json::to_value(n).ok()));
    let base_json = to_json(serde_json::to_value(base).ok());
    let previous = ctx
        .previous_decision
        .as_ref()
        .map(|d| format!("{} on {}", d.mp_id, d.as_of))
        .unwrap_or_else(|| "none (cold start)".to_string());

    let prompt = format!(
        r#"OBJECTIVE:
{}

CONSTRAINTS:
max_drawdown_pct = {:?}
turnover_budget_pct = {:?}
notes = {:?}

PREVIOUS DECISION:
{}

QUANT REPORT:
{}

NARRATIVE REPORT:
{}

DETERMINISTIC CHECKS:
{}

Rules:
- Flag divergence when the two reports imply opposite market conditions
- List suspected constraint violations as possibilities
- Return ONLY valid JSON in this format:

{}
"#,
        ctx.objective.goal,
        ctx.objective.constraints.max_drawdown_pct,
        ctx.objective.constraints.turnover_budget_pct,
        ctx.objective.constraints.notes,
        previous,
        quant_json,
        narrative_json,
        base_json,
        SCHEMA_HINT
    );

    AgentRequest {
        role: AgentRole::Risk,
        system: SYSTEM_PROMPT.to_string(),
        prompt,
    }
}

pub fn validate_review(raw: &str) -> Result<RiskReview> {
    let map = parse_json_object(raw)?;

    let risk_level = required_str(&map, "risk_level")?
        .parse::<RiskLevel>()
        .map_err(OrchestrationError::SchemaError)?;

    let divergence_detected = match map.get("divergence_detected") {
        Some(Value::Bool(b)) => *b,
        Some(_) => {
            warn!("Dropping non-boolean divergence_detected");
            false
        }
        None => false,
    };

    Ok(RiskReview {
        risk_level,
        divergence_detected,
        constraint_violations: string_list(&map, "constraint_violations"),
    })
}

/// Fold an LLM review into the deterministic report. Only escalates.
fn merge_review(
    base: RiskReport,
    review: &RiskReview,
    quant: Option<&QuantReport>,
    narrative: Option<&NarrativeReport>,
    ctx: &DecisionContext,
    config: &EngineConfig,
) -> RiskReport {
    let missing_upstream = quant.is_none() || narrative.is_none();
    let (small_move, _) = whipsaw_check(ctx, quant, config);

    let mut merged = base;
    merged.divergence_detected |= review.divergence_detected;
    for violation in &review.constraint_violations {
        if !merged.constraint_violations.contains(violation) {
            merged.constraint_violations.push(violation.clone());
        }
    }

    merged.risk_level = base_risk_level(&merged, missing_upstream).max(review.risk_level);
    merged.recommended_action = recommend(&merged, missing_upstream, small_move);
    merged
}
