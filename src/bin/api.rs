use mp_decision_orchestrator::{
    agents::build_backend,
    api::start_server,
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
    // Load environment variables
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let api_port: u16 = std::env::var("PORT")
        .or_else(|_| std::env::var("API_PORT"))
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;

    info!("MP Decision Orchestrator - API Server");
    info!("Port: {}", api_port);

    let config = EngineConfig::from_env()?;
    let snapshot = std::env::var("MP_CONTEXT_SNAPSHOT").unwrap_or_else(|_| "context.json".to_string());
    let source = FileContextSource::new(&snapshot);
    let objective = source.objective().await?;

    let orchestrator = Arc::new(Orchestrator::new(
        config,
        build_backend().await?,
        Arc::new(source),
        objective,
        build_store(),
        build_mirror()?,
    ));

    info!(snapshot = %snapshot, "Orchestrator initialized");

    start_server(orchestrator, api_port).await?;

    Ok(())
}
