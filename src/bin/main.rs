use chrono::{NaiveDate, Utc};
use mp_decision_orchestrator::{
    agents::build_backend,
    config::EngineConfig,
    context::FileContextSource,
    mirror::build_mirror,
    orchestrator::Orchestrator,
    state::build_store,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("MP Decision Orchestrator - single cycle");

    let config = EngineConfig::from_env()?;

    let snapshot = std::env::var("MP_CONTEXT_SNAPSHOT").unwrap_or_else(|_| "context.json".to_string());
    let source = FileContextSource::new(&snapshot);
    let objective = source.objective().await?;

    // First argument, when present, is the cycle date (YYYY-MM-DD).
    let as_of = match std::env::args().nth(1) {
        Some(arg) => NaiveDate::parse_from_str(&arg, "%Y-%m-%d")?,
        None => Utc::now().date_naive(),
    };

    let orchestrator = Orchestrator::new(
        config,
        build_backend().await?,
        Arc::new(source),
        objective,
        build_store(),
        build_mirror()?,
    );

    info!(%as_of, snapshot = %snapshot, "Running decision cycle");

    match orchestrator.run_cycle(as_of).await {
        Ok(outcome) => {
            println!("\n=== DECISION ===");
            println!("{}", serde_json::to_string_pretty(&outcome.decision)?);
            println!("\nRisk: {:?} (action {:?})", outcome.risk.risk_level, outcome.risk.recommended_action);
            if let Some(gate) = outcome.gate {
                println!("Quality gate: {:?}", gate);
            }
            for correction in &outcome.corrections {
                println!("Correction: {}", correction);
            }
            println!("\nReasoning Trace:");
            for (i, stage) in outcome.reasoning_trace.iter().enumerate() {
                println!("  {}: {}", i + 1, stage);
            }

            let report = orchestrator.replay_evaluator().evaluate_until(as_of, None).await?;
            println!("\n=== REPLAY ===");
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("Cycle failed: {}", e);
            Err(Box::new(e) as Box<dyn std::error::Error>)
        }
    }
}
