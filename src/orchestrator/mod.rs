//! Main orchestrator - runs one decision cycle
//!
//! CONTEXT → {QUANT ∥ NARRATIVE} → RISK → SUPERVISOR → {SUB-ALLOCATORS ∥} → MERGE → PERSIST → MIRROR

use crate::agents::narrative::NarrativeAgent;
use crate::agents::quant::QuantAgent;
use crate::agents::risk::RiskAgent;
use crate::agents::sub_allocator::{SubAllocation, SubAllocationInputs, SubAllocatorAgent};
use crate::agents::{AgentBackend, AgentCall, AgentRole, CallOutcome, CallState};
use crate::audit::{AgentCallRecord, AuditLog, CycleAuditRecord};
use crate::config::EngineConfig;
use crate::context::{ContextBuilder, ContextSource};
use crate::mirror::GraphMirror;
use crate::models::{Decision, DecisionContext, NarrativeReport, Objective, QuantReport, RiskReport};
use crate::replay::ReplayEvaluator;
use crate::state::DecisionStore;
use crate::supervisor::{MpSelection, Supervisor};
use crate::verification::{DecisionMerger, GateReason, MergeInputs};
use crate::Result;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Everything one cycle produced, for callers and the audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct CycleOutcome {
    pub cycle_id: Uuid,
    pub decision: Decision,
    pub quant: Option<QuantReport>,
    pub narrative: Option<NarrativeReport>,
    pub risk: RiskReport,
    pub selection: MpSelection,
    pub allocations: Vec<SubAllocation>,
    pub corrections: Vec<String>,
    pub gate: Option<GateReason>,
    pub mirrored: bool,
    pub reasoning_trace: Vec<String>,
    pub elapsed_ms: u64,
}

/// Main orchestrator that coordinates the decision pipeline
pub struct Orchestrator {
    config: Arc<EngineConfig>,
    backend: Arc<dyn AgentBackend>,
    context: ContextBuilder,
    store: Arc<dyn DecisionStore>,
    mirror: Arc<dyn GraphMirror>,
    merger: DecisionMerger,
    audit_log: Arc<AuditLog>,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        backend: Arc<dyn AgentBackend>,
        source: Arc<dyn ContextSource>,
        objective: Objective,
        store: Arc<dyn DecisionStore>,
        mirror: Arc<dyn GraphMirror>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            backend,
            context: ContextBuilder::new(source, store.clone(), objective),
            store,
            mirror,
            merger: DecisionMerger::new(),
            audit_log: Arc::new(AuditLog::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn DecisionStore> {
        self.store.clone()
    }

    pub fn audit_log(&self) -> Arc<AuditLog> {
        self.audit_log.clone()
    }

    pub fn replay_evaluator(&self) -> ReplayEvaluator {
        ReplayEvaluator::new(self.store.clone(), self.config.replay.clone())
    }

    /// Build the context for `as_of` from the sources, then run the cycle.
    pub async fn run_cycle(&self, as_of: NaiveDate) -> Result<CycleOutcome> {
        let ctx = self.context.build(as_of).await?;
        self.run_with_context(ctx).await
    }

    /// Run the pipeline over an already assembled context.
    pub async fn run_with_context(&self, ctx: DecisionContext) -> Result<CycleOutcome> {
        let started = Instant::now();
        let cycle_id = Uuid::new_v4();
        let ctx = Arc::new(ctx);
        let config = self.config.clone();
        let deadline = tokio::time::Instant::now() + config.cycle_timeout();
        let call = AgentCall::new(self.backend.clone(), config.agent_timeout(), deadline);

        let mut reasoning_trace = Vec::new();
        let mut agent_calls = Vec::new();

        info!(
            cycle_id = %cycle_id,
            as_of = %ctx.as_of,
            candidates = ctx.catalog.mps.len(),
            cold_start = ctx.previous_decision.is_none(),
            degraded = ctx.degraded_inputs.len(),
            "Orchestrator: starting cycle"
        );

        reasoning_trace.push(format!(
            "CONTEXT: {} signals, {} candidate MPs, previous: {}",
            ctx.quant_signals.len(),
            ctx.catalog.mps.len(),
            ctx.previous_decision
                .as_ref()
                .map(|d| d.mp_id.as_str())
                .unwrap_or("none")
        ));
        if !ctx.degraded_inputs.is_empty() {
            reasoning_trace.push(format!("DEGRADED: {}", ctx.degraded_inputs.join("; ")));
        }

        // === QUANT ∥ NARRATIVE ===
        let (quant_outcome, narrative_outcome) = tokio::join!(
            QuantAgent::run(&call, &ctx),
            NarrativeAgent::run(&call, &ctx),
        );
        agent_calls.push(call_record(&quant_outcome));
        agent_calls.push(call_record(&narrative_outcome));

        reasoning_trace.push(format!(
            "ANALYSTS: quant {:?}, narrative {:?}",
            quant_outcome.state(),
            narrative_outcome.state()
        ));

        let quant = quant_outcome.report;
        let narrative = narrative_outcome.report;

        // === RISK ===
        let (risk, review) = RiskAgent::run(&call, &ctx, quant.as_ref(), narrative.as_ref(), &config).await;
        agent_calls.push(call_record(&review));

        reasoning_trace.push(format!(
            "RISK: level {:?}, divergence {}, {} violation(s), action {:?}",
            risk.risk_level,
            risk.divergence_detected,
            risk.constraint_violations.len(),
            risk.recommended_action
        ));

        // === SUPERVISOR ===
        let selection = {
            let mut supervisor = Supervisor::new(&ctx, &config);
            supervisor.receive_reports(quant.clone(), narrative.clone(), risk.clone())?;
            let selection = supervisor.decide(&call).await?;
            if let Some(outcome) = supervisor.proposal_outcome() {
                agent_calls.push(call_record(outcome));
            }
            selection
        };

        reasoning_trace.push(format!(
            "SUPERVISOR: {} ({:?}, confidence {:.2})",
            selection.mp_id, selection.source, selection.confidence
        ));

        // === SUB-ALLOCATORS ===
        let allocations = if selection.held_previous() {
            debug!("Holding previous decision, sub-allocators skipped");
            Vec::new()
        } else {
            let inputs = SubAllocationInputs {
                ctx: ctx.clone(),
                config: config.clone(),
                mp_id: selection.mp_id.clone(),
                quant: quant.clone(),
                narrative: narrative.clone(),
            };
            if config.parallel_sub_allocators {
                SubAllocatorAgent::allocate_parallel(&call, &inputs).await
            } else {
                SubAllocatorAgent::allocate_legacy(&call, &inputs).await
            }
        };

        for allocation in &allocations {
            let role = if config.parallel_sub_allocators {
                AgentRole::SubAllocator(allocation.asset_class)
            } else {
                AgentRole::SubAllocatorLegacy
            };
            agent_calls.push(AgentCallRecord {
                role,
                trace: vec![CallState::Pending, allocation.call_state],
                errors: Vec::new(),
            });
        }

        reasoning_trace.push(format!("SUB-ALLOCATORS: {} class(es) allocated", allocations.len()));

        // === MERGE & VALIDATE ===
        let merged = self.merger.merge(&MergeInputs {
            ctx: &ctx,
            config: &config,
            selection: &selection,
            allocations: &allocations,
            quant: quant.as_ref(),
            narrative: narrative.as_ref(),
            risk: &risk,
        })?;

        reasoning_trace.push(format!(
            "MERGE: {} -> {} ({} correction(s), gate {:?})",
            merged.decision.decision_id,
            merged.decision.mp_id,
            merged.corrections.len(),
            merged.gate
        ));

        // === PERSIST ===
        self.store.upsert(&merged.decision).await?;
        reasoning_trace.push("PERSIST: decision upserted".to_string());

        // === MIRROR (best effort) ===
        let mirrored = match self.mirror.mirror(&merged.decision).await {
            Ok(()) => true,
            Err(e) => {
                warn!(decision_id = %merged.decision.decision_id, error = %e, "Graph mirror failed");
                false
            }
        };
        reasoning_trace.push(format!("MIRROR: {}", if mirrored { "ok" } else { "skipped" }));

        let elapsed_ms = started.elapsed().as_millis() as u64;

        self.audit_log
            .record(CycleAuditRecord {
                cycle_id,
                as_of: ctx.as_of,
                decision_id: merged.decision.decision_id.clone(),
                outcome: merged.decision.outcome,
                stages: reasoning_trace.clone(),
                agent_calls,
                corrections: merged.corrections.clone(),
                degraded_inputs: ctx.degraded_inputs.clone(),
                persisted: true,
                mirrored,
                elapsed_ms,
                created_at: Utc::now(),
            })
            .await?;

        info!(
            cycle_id = %cycle_id,
            decision_id = %merged.decision.decision_id,
            mp_id = %merged.decision.mp_id,
            outcome = ?merged.decision.outcome,
            confidence = merged.decision.confidence,
            elapsed_ms,
            "Orchestrator: cycle complete"
        );

        Ok(CycleOutcome {
            cycle_id,
            decision: merged.decision,
            quant,
            narrative,
            risk,
            selection,
            allocations,
            corrections: merged.corrections,
            gate: merged.gate,
            mirrored,
            reasoning_trace,
            elapsed_ms,
        })
    }
}

fn call_record<T>(outcome: &CallOutcome<T>) -> AgentCallRecord {
    AgentCallRecord {
        role: outcome.role,
        trace: outcome.trace.clone(),
        errors: outcome.errors.clone(),
    }
}
