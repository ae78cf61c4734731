//! Supervisor (MP selector)
//!
//! AWAITING_REPORTS → EVALUATING → DECIDED
//!
//! Quant's top candidate is the base decision. An LLM proposal may override
//! it when narrative evidence supports another candidate, but a
//! HOLD_PREVIOUS recommendation from risk always wins.

use crate::agents::{
    optional_str, parse_json_object, required_f64, required_str, AgentCall, AgentRequest,
    AgentRole, CallOutcome,
};
use crate::config::EngineConfig;
use crate::error::OrchestrationError;
use crate::models::{
    DecisionContext, NarrativeReport, QuantReport, RecommendedAction, RiskReport,
};
use crate::Result;
use serde::Serialize;
use tracing::{info, warn};

const SYSTEM_PROMPT: &str = r#"You are the chair of a portfolio committee.
You select exactly one Model Portfolio id from the candidate list.
Start from the quant analyst's best-fit candidate and only depart from it when the
narrative evidence strongly supports another candidate."#;

pub const SCHEMA_HINT: &str = r#"{
  "mp_id": "<candidate MP id>",
  "confidence": 0-1,
  "reasoning": "<one paragraph>"
}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SupervisorState {
    AwaitingReports,
    Evaluating,
    Decided,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionSource {
    QuantTop,
    NarrativeOverride,
    HeldPrevious,
    Neutral,
    Defensive,
}

#[derive(Debug, Clone, Serialize)]
pub struct MpSelection {
    pub mp_id: String,
    pub confidence: f64,
    pub reasoning: String,
    pub source: SelectionSource,
}

impl MpSelection {
    pub fn held_previous(&self) -> bool {
        self.source == SelectionSource::HeldPrevious
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorProposal {
    pub mp_id: String,
    pub confidence: f64,
    pub reasoning: String,
}

struct StageOneReports {
    quant: Option<QuantReport>,
    narrative: Option<NarrativeReport>,
    risk: RiskReport,
}

pub struct Supervisor<'a> {
    state: SupervisorState,
    ctx: &'a DecisionContext,
    config: &'a EngineConfig,
    reports: Option<StageOneReports>,
    proposal_outcome: Option<CallOutcome<SupervisorProposal>>,
}

impl<'a> Supervisor<'a> {
    pub fn new(ctx: &'a DecisionContext, config: &'a EngineConfig) -> Self {
        Self {
            state: SupervisorState::AwaitingReports,
            ctx,
            config,
            reports: None,
            proposal_outcome: None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn proposal_outcome(&self) -> Option<&CallOutcome<SupervisorProposal>> {
        self.proposal_outcome.as_ref()
    }

    pub fn receive_reports(
        &mut self,
        quant: Option<QuantReport>,
        narrative: Option<NarrativeReport>,
        risk: RiskReport,
    ) -> Result<()> {
        if self.state != SupervisorState::AwaitingReports {
            return Err(OrchestrationError::InvalidTransition(format!(
                "reports received in state {:?}",
                self.state
            )));
        }
        self.reports = Some(StageOneReports { quant, narrative, risk });
        self.state = SupervisorState::Evaluating;
        Ok(())
    }

    /// Select the MP. The call is skipped when the gate already decides.
    pub async fn decide(&mut self, call: &AgentCall) -> Result<MpSelection> {
        if self.state != SupervisorState::Evaluating {
            return Err(OrchestrationError::InvalidTransition(format!(
                "decide called in state {:?}",
                self.state
            )));
        }
        let reports = self.reports.take().ok_or_else(|| {
            OrchestrationError::InvalidTransition("evaluating without reports".to_string())
        })?;

        let selection = self.evaluate(call, &reports).await?;
        self.state = SupervisorState::Decided;

        info!(
            mp_id = %selection.mp_id,
            source = ?selection.source,
            confidence = selection.confidence,
            "Supervisor decided"
        );
        Ok(selection)
    }

    async fn evaluate(&mut self, call: &AgentCall, reports: &StageOneReports) -> Result<MpSelection> {
        let ctx = self.ctx;
        let action = reports.risk.recommended_action;

        if action == Some(RecommendedAction::HoldPrevious) {
            let holdable = ctx
                .previous_decision
                .as_ref()
                .filter(|p| ctx.catalog.is_empty() || ctx.catalog.contains_mp(&p.mp_id));
            if let Some(previous) = holdable {
                return Ok(MpSelection {
                    mp_id: previous.mp_id.clone(),
                    confidence: previous.confidence,
                    reasoning: format!(
                        "Risk review recommends holding: keeping {} from {}.",
                        previous.mp_id, previous.as_of
                    ),
                    source: SelectionSource::HeldPrevious,
                });
            }
            let neutral = self.neutral_mp()?;
            warn!(
                mp_id = %neutral,
                previous = ?ctx.previous_decision.as_ref().map(|p| p.mp_id.as_str()),
                "Hold recommended without a holdable previous MP, using neutral MP"
            );
            return Ok(MpSelection {
                confidence: self.combined_confidence(reports, None),
                reasoning: format!(
                    "Risk review recommends holding but there is no previous decision in the catalog; defaulting to neutral {}.",
                    neutral
                ),
                mp_id: neutral,
                source: SelectionSource::Neutral,
            });
        }

        if ctx.catalog.is_empty() {
            return match &ctx.previous_decision {
                Some(previous) => {
                    warn!("Catalog unavailable, holding previous MP");
                    Ok(MpSelection {
                        mp_id: previous.mp_id.clone(),
                        confidence: previous.confidence,
                        reasoning: "Candidate catalog unavailable; holding previous decision.".to_string(),
                        source: SelectionSource::HeldPrevious,
                    })
                }
                None => Err(self.unrecoverable()),
            };
        }

        let (mut mp_id, mut source, mut notes) = match reports.quant.as_ref().and_then(|q| q.top_mp()) {
            Some((id, fit)) => (
                id.to_string(),
                SelectionSource::QuantTop,
                vec![format!("Quant best fit is {} ({:.2}).", id, fit)],
            ),
            None => {
                let neutral = self.neutral_mp()?;
                let note = format!("No quant fit available; starting from neutral {}.", neutral);
                (neutral, SelectionSource::Neutral, vec![note])
            }
        };

        let mut proposal_confidence = None;
        if call.deadline_passed() {
            warn!("Cycle deadline passed, skipping supervisor proposal");
        } else {
            let request = self.build_request(reports, &mp_id);
            let outcome = call.run(request, SCHEMA_HINT, validate_proposal).await;

            if let Some(proposal) = &outcome.report {
                if self.accept_override(reports.quant.as_ref(), &mp_id, proposal) {
                    if proposal.mp_id != mp_id {
                        notes.push(format!(
                            "Narrative override to {}: {}",
                            proposal.mp_id, proposal.reasoning
                        ));
                        mp_id = proposal.mp_id.clone();
                        source = SelectionSource::NarrativeOverride;
                    } else if !proposal.reasoning.is_empty() {
                        notes.push(proposal.reasoning.clone());
                    }
                    proposal_confidence = Some(proposal.confidence);
                }
            }
            self.proposal_outcome = Some(outcome);
        }

        match action {
            Some(RecommendedAction::ShiftNeutral) => {
                let neutral = self.neutral_mp()?;
                notes.push(format!("Risk review recommends shifting to neutral {}.", neutral));
                mp_id = neutral;
                source = SelectionSource::Neutral;
            }
            Some(RecommendedAction::ShiftDefensive) => {
                let defensive = self.defensive_choice(reports.quant.as_ref(), &mp_id)?;
                if defensive != mp_id {
                    notes.push(format!("Risk review recommends defensive shift to {}.", defensive));
                    mp_id = defensive;
                    source = SelectionSource::Defensive;
                }
            }
            _ => {}
        }

        if reports.risk.divergence_detected {
            notes.push("Quant and narrative views diverge; confidence penalised.".to_string());
        }

        Ok(MpSelection {
            confidence: self.combined_confidence(reports, proposal_confidence),
            reasoning: notes.join(" "),
            mp_id,
            source,
        })
    }

    /// An override must stay in the catalog and near Quant's top fit.
    fn accept_override(&self, quant: Option<&QuantReport>, base: &str, proposal: &SupervisorProposal) -> bool {
        if !self.ctx.catalog.contains_mp(&proposal.mp_id) {
            warn!(mp_id = %proposal.mp_id, "Supervisor proposed an MP outside the candidate set, ignoring");
            return false;
        }
        if proposal.mp_id == base {
            return true;
        }
        match quant.and_then(|q| q.top_mp()) {
            Some((_, top_fit)) => {
                let fit = quant.map(|q| q.fit_of(&proposal.mp_id)).unwrap_or(0.0);
                let accepted = fit >= top_fit - self.config.narrative_override_margin;
                if !accepted {
                    info!(
                        proposed = %proposal.mp_id,
                        fit,
                        top_fit,
                        "Override rejected, quant fit too far below best"
                    );
                }
                accepted
            }
            None => true,
        }
    }

    /// Configured neutral MP, else the most defensive candidate.
    fn neutral_mp(&self) -> Result<String> {
        neutral_mp(self.ctx, self.config).ok_or_else(|| self.unrecoverable())
    }

    fn unrecoverable(&self) -> OrchestrationError {
        OrchestrationError::ConfigurationError(format!(
            "cold start on {} with no candidate catalog and no viable neutral MP ('{}')",
            self.ctx.as_of, self.config.neutral_mp_id
        ))
    }

    /// Keep `current` if it is no riskier than neutral, else the best-fitting
    /// candidate that is, else the most defensive one.
    fn defensive_choice(&self, quant: Option<&QuantReport>, current: &str) -> Result<String> {
        let catalog = &self.ctx.catalog;
        let neutral_id = self.neutral_mp()?;
        let ceiling = catalog
            .mps
            .get(&neutral_id)
            .map(|mp| mp.risky_share())
            .unwrap_or(0.0);

        if catalog.mps.get(current).map(|mp| mp.risky_share() <= ceiling).unwrap_or(false) {
            return Ok(current.to_string());
        }

        let best = catalog
            .mps
            .iter()
            .filter(|(_, mp)| mp.risky_share() <= ceiling)
            .max_by(|(a_id, _), (b_id, _)| {
                let fit = |id: &str| quant.map(|q| q.fit_of(id)).unwrap_or(0.0);
                fit(a_id).total_cmp(&fit(b_id)).then_with(|| b_id.cmp(a_id))
            })
            .map(|(id, _)| id.clone());

        best.or_else(|| catalog.most_defensive().map(str::to_string))
            .ok_or_else(|| self.unrecoverable())
    }

    fn combined_confidence(&self, reports: &StageOneReports, proposal: Option<f64>) -> f64 {
        let base = reports.quant.as_ref().map(|q| q.confidence).unwrap_or(0.5);
        let mut confidence = match proposal {
            Some(p) => (base + p) / 2.0,
            None => base,
        };
        if reports.quant.is_none() || reports.narrative.is_none() {
            confidence *= 1.0 - self.config.missing_report_penalty;
        }
        if reports.risk.divergence_detected {
            confidence *= 1.0 - self.config.divergence_penalty;
        }
        confidence.clamp(0.0, 1.0)
    }

    fn build_request(&self, reports: &StageOneReports, base: &str) -> AgentRequest {
        let ctx = self.ctx;
        let candidates = ctx
            .catalog
            .mps
            .iter()
            .map(|(id, mp)| {
                let fit = reports
                    .quant
                    .as_ref()
                    .map(|q| format!("{:.2}", q.fit_of(id)))
                    .unwrap_or_else(|| "n/a".to_string());
                format!("- {} ({}), quant fit {}, risky share {:.0}%", id, mp.name, fit, mp.risky_share())
            })
            .collect::<Vec<_>>()
            .join("\n");

        let narrative = reports
            .narrative
            .as_ref()
            .map(|n| {
                format!(
                    "themes: {}\nsentiment: {:?}\ncausal risks: {}\nevidence: {}",
                    n.dominant_themes.join(", "),
                    n.sentiment,
                    n.causal_risks.join("; "),
                    n.evidence_ids.join(", ")
                )
            })
            .unwrap_or_else(|| "(narrative report missing)".to_string());

        let risk = serde_json::to_string(&reports.risk).unwrap_or_default();

        let prompt = format!(
            r#"AS OF: {}
OBJECTIVE: {}

CANDIDATES:
{}

QUANT BEST FIT: {}

NARRATIVE:
{}

RISK REVIEW:
{}

Rules:
- mp_id must be one of the candidate ids above
- Keep the quant best fit unless the narrative strongly supports another candidate
- Return ONLY valid JSON in this format:

{}
"#,
            ctx.as_of, ctx.objective.goal, candidates, base, narrative, risk, SCHEMA_HINT
        );

        AgentRequest {
            role: AgentRole::Supervisor,
            system: SYSTEM_PROMPT.to_string(),
            prompt,
        }
    }
}

/// Configured neutral MP when it is a candidate, else the most defensive one.
pub fn neutral_mp(ctx: &DecisionContext, config: &EngineConfig) -> Option<String> {
    if ctx.catalog.contains_mp(&config.neutral_mp_id) {
        Some(config.neutral_mp_id.clone())
    } else {
        ctx.catalog.most_defensive().map(str::to_string)
    }
}

pub fn validate_proposal(raw: &str) -> Result<SupervisorProposal> {
    let map = parse_json_object(raw)?;
    Ok(SupervisorProposal {
        mp_id: required_str(&map, "mp_id")?.trim().to_string(),
        confidence: required_f64(&map, "confidence")?.clamp(0.0, 1.0),
        reasoning: optional_str(&map, "reasoning").unwrap_or_default().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::ScriptedBackend;
    use crate::models::{
        AssetClass, CandidateCatalog, Decision, DecisionOutcome, GrowthRegime, InflationRegime,
        LiquidityRegime, ModelPortfolio, Objective, RegimeLabels, RegimeScores, RiskLevel,
        Sentiment,
    };
    use chrono::{NaiveDate, Utc};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    fn mp(stocks: f64) -> ModelPortfolio {
        ModelPortfolio {
            name: String::new(),
            allocation: BTreeMap::from([
                (AssetClass::Stocks, stocks),
                (AssetClass::Bonds, 100.0 - stocks),
            ]),
        }
    }

    fn ctx(previous: Option<Decision>) -> DecisionContext {
        DecisionContext {
            as_of: NaiveDate::from_ymd_opt(2024, 7, 1).unwrap(),
            objective: Objective::default(),
            quant_signals: BTreeMap::new(),
            narrative_summary: String::new(),
            graph_evidence: String::new(),
            catalog: CandidateCatalog {
                mps: BTreeMap::from([
                    ("MP-1".to_string(), mp(80.0)),
                    ("MP-2".to_string(), mp(60.0)),
                    ("MP-3".to_string(), mp(40.0)),
                    ("MP-4".to_string(), mp(30.0)),
                    ("MP-5".to_string(), mp(20.0)),
                ]),
                sub_mps: BTreeMap::new(),
            },
            previous_decision: previous,
            degraded_inputs: Vec::new(),
        }
    }

    fn quant() -> QuantReport {
        QuantReport {
            scores: RegimeScores { growth: 8.0, inflation: 3.0, liquidity: 7.0 },
            regime_labels: RegimeLabels {
                growth: GrowthRegime::Expansion,
                inflation: InflationRegime::Low,
                liquidity: LiquidityRegime::Loose,
            },
            mp_fit: BTreeMap::from([
                ("MP-1".to_string(), 0.9),
                ("MP-2".to_string(), 0.8),
                ("MP-4".to_string(), 0.7),
                ("MP-5".to_string(), 0.2),
            ]),
            confidence: 0.8,
        }
    }

    fn narrative() -> NarrativeReport {
        NarrativeReport {
            dominant_themes: vec!["AI Capex".to_string()],
            sentiment: Sentiment::Positive,
            causal_risks: vec![],
            weak_signals: vec![],
            evidence_ids: vec![],
        }
    }

    fn risk(action: Option<RecommendedAction>) -> RiskReport {
        RiskReport {
            divergence_detected: false,
            risk_level: RiskLevel::Low,
            constraint_violations: vec![],
            whipsaw_warning: false,
            recommended_action: action,
        }
    }

    fn previous() -> Decision {
        Decision {
            decision_id: "prev".to_string(),
            as_of: NaiveDate::from_ymd_opt(2024, 6, 30).unwrap(),
            mp_id: "MP-2".to_string(),
            sub_mp: BTreeMap::new(),
            reasoning: String::new(),
            confidence: 0.66,
            used_evidence_ids: vec![],
            outcome: DecisionOutcome::Selected,
            risk_level: RiskLevel::Low,
            regime_scores: None,
            created_at: Utc::now(),
        }
    }

    fn call(backend: Arc<ScriptedBackend>) -> AgentCall {
        AgentCall::new(backend, Duration::from_millis(500), Instant::now() + Duration::from_secs(5))
    }

    async fn decide(
        context: &DecisionContext,
        backend: Arc<ScriptedBackend>,
        action: Option<RecommendedAction>,
    ) -> Result<MpSelection> {
        let config = EngineConfig::default();
        let mut supervisor = Supervisor::new(context, &config);
        supervisor.receive_reports(Some(quant()), Some(narrative()), risk(action))?;
        let selection = supervisor.decide(&call(backend)).await;
        if selection.is_ok() {
            assert_eq!(supervisor.state(), SupervisorState::Decided);
        }
        selection
    }

    #[tokio::test]
    async fn test_hold_beats_agent_preference() {
        let backend = Arc::new(ScriptedBackend::new());
        backend
            .push_json(AgentRole::Supervisor, json!({ "mp_id": "MP-1", "confidence": 0.99 }))
            .await;

        let selection = decide(&ctx(Some(previous())), backend.clone(), Some(RecommendedAction::HoldPrevious))
            .await
            .unwrap();
        assert_eq!(selection.mp_id, "MP-2");
        assert!(selection.held_previous());
        assert_eq!(backend.requests_for(AgentRole::Supervisor).await, 0);
    }

    #[tokio::test]
    async fn test_cold_start_hold_uses_neutral() {
        let selection = decide(&ctx(None), Arc::new(ScriptedBackend::new()), Some(RecommendedAction::HoldPrevious))
            .await
            .unwrap();
        assert_eq!(selection.mp_id, "MP-3");
        assert_eq!(selection.source, SelectionSource::Neutral);
    }

    #[tokio::test]
    async fn test_hold_of_retired_mp_uses_neutral() {
        let mut prev = previous();
        prev.mp_id = "MP-9".to_string();

        let selection = decide(&ctx(Some(prev)), Arc::new(ScriptedBackend::new()), Some(RecommendedAction::HoldPrevious))
            .await
            .unwrap();
        assert_eq!(selection.mp_id, "MP-3");
        assert_eq!(selection.source, SelectionSource::Neutral);
        assert!(!selection.held_previous());
    }

    #[tokio::test]
    async fn test_out_of_set_proposal_falls_back_to_quant_top() {
        let backend = Arc::new(ScriptedBackend::new());
        backend
            .push_json(AgentRole::Supervisor, json!({ "mp_id": "MP-42", "confidence": 0.9 }))
            .await;

        let selection = decide(&ctx(None), backend, None).await.unwrap();
        assert_eq!(selection.mp_id, "MP-1");
        assert_eq!(selection.source, SelectionSource::QuantTop);
    }

    #[tokio::test]
    async fn test_override_within_margin_accepted() {
        let backend = Arc::new(ScriptedBackend::new());
        backend
            .push_json(
                AgentRole::Supervisor,
                json!({ "mp_id": "MP-2", "confidence": 0.7, "reasoning": "capex broadening" }),
            )
            .await;

        let selection = decide(&ctx(None), backend, None).await.unwrap();
        assert_eq!(selection.mp_id, "MP-2");
        assert_eq!(selection.source, SelectionSource::NarrativeOverride);
        assert!((selection.confidence - 0.75).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_override_far_below_top_rejected() {
        let backend = Arc::new(ScriptedBackend::new());
        backend
            .push_json(AgentRole::Supervisor, json!({ "mp_id": "MP-5", "confidence": 0.9 }))
            .await;

        let selection = decide(&ctx(None), backend, None).await.unwrap();
        assert_eq!(selection.mp_id, "MP-1");
    }

    #[tokio::test]
    async fn test_defensive_shift_picks_best_fit_under_neutral_risk() {
        let selection = decide(&ctx(None), Arc::new(ScriptedBackend::new()), Some(RecommendedAction::ShiftDefensive))
            .await
            .unwrap();
        assert_eq!(selection.mp_id, "MP-4");
        assert_eq!(selection.source, SelectionSource::Defensive);
    }

    #[tokio::test]
    async fn test_cold_start_without_catalog_is_unrecoverable() {
        let mut context = ctx(None);
        context.catalog = CandidateCatalog::default();
        let result = decide(&context, Arc::new(ScriptedBackend::new()), Some(RecommendedAction::HoldPrevious)).await;
        assert!(matches!(result, Err(OrchestrationError::ConfigurationError(_))));
    }

    #[tokio::test]
    async fn test_decide_before_reports_is_invalid() {
        let context = ctx(None);
        let config = EngineConfig::default();
        let mut supervisor = Supervisor::new(&context, &config);
        let result = supervisor.decide(&call(Arc::new(ScriptedBackend::new()))).await;
        assert!(matches!(result, Err(OrchestrationError::InvalidTransition(_))));
    }
}
