//! REST API Server for the MP Decision Orchestrator
//!
//! Exposes cycle runs, the latest decision and the replay report via HTTP

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::error::OrchestrationError;
use crate::orchestrator::Orchestrator;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct CycleRequest {
    /// Defaults to today (UTC).
    #[serde(default)]
    pub as_of: Option<NaiveDate>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReplayQuery {
    pub lookback_days: Option<i64>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
    /// Cycles for the same portfolio never overlap.
    cycle_lock: Arc<Mutex<()>>,
}

fn status_for(e: &OrchestrationError) -> StatusCode {
    match e {
        OrchestrationError::ConfigurationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
        OrchestrationError::PersistenceError(_) | OrchestrationError::DatabaseError(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Decision Endpoints
/// =============================

async fn latest_decision(State(state): State<ApiState>) -> (StatusCode, Json<ApiResponse>) {
    match state.orchestrator.store().latest().await {
        Ok(Some(decision)) => (StatusCode::OK, Json(ApiResponse::success(decision))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error("No decision recorded yet".to_string())),
        ),
        Err(e) => {
            error!(error = %e, "Failed to load latest decision");
            (status_for(&e), Json(ApiResponse::error(e.to_string())))
        }
    }
}

async fn run_cycle(
    State(state): State<ApiState>,
    body: Option<Json<CycleRequest>>,
) -> (StatusCode, Json<ApiResponse>) {
    let as_of = body
        .and_then(|Json(req)| req.as_of)
        .unwrap_or_else(|| Utc::now().date_naive());

    info!(%as_of, "Received cycle request");

    let _guard = state.cycle_lock.lock().await;
    match state.orchestrator.run_cycle(as_of).await {
        Ok(outcome) => (StatusCode::OK, Json(ApiResponse::success(outcome))),
        Err(e) => {
            error!(%as_of, error = %e, "Cycle failed");
            (status_for(&e), Json(ApiResponse::error(format!("Cycle failed: {}", e))))
        }
    }
}

/// =============================
/// Replay Endpoint
/// =============================

async fn replay_report(
    State(state): State<ApiState>,
    Query(query): Query<ReplayQuery>,
) -> (StatusCode, Json<ApiResponse>) {
    match state.orchestrator.replay_evaluator().evaluate(query.lookback_days).await {
        Ok(report) => (StatusCode::OK, Json(ApiResponse::success(report))),
        Err(OrchestrationError::ConfigurationError(message)) => {
            (StatusCode::BAD_REQUEST, Json(ApiResponse::error(message)))
        }
        Err(e) => {
            error!(error = %e, "Replay evaluation failed");
            (status_for(&e), Json(ApiResponse::error(e.to_string())))
        }
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = ApiState {
        orchestrator,
        cycle_lock: Arc::new(Mutex::new(())),
    };

    Router::new()
        .route("/health", get(health))
        .route("/api/decisions/latest", get(latest_decision))
        .route("/api/replay", get(replay_report))
        .route("/api/cycles", post(run_cycle))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    orchestrator: Arc<Orchestrator>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(orchestrator);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::ScriptedBackend;
    use crate::config::EngineConfig;
    use crate::context::{RawInputs, StaticContextSource};
    use crate::mirror::NoopMirror;
    use crate::models::{AssetClass, CandidateCatalog, ModelPortfolio, Objective, SubModelPortfolio};
    use crate::state::InMemoryDecisionStore;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::collections::BTreeMap;
    use tower::ServiceExt;

    fn router(catalog: CandidateCatalog) -> Router {
        let orchestrator = Orchestrator::new(
            EngineConfig::default(),
            Arc::new(ScriptedBackend::new()),
            Arc::new(StaticContextSource::new(RawInputs {
                catalog,
                ..RawInputs::default()
            })),
            Objective::default(),
            Arc::new(InMemoryDecisionStore::new()),
            Arc::new(NoopMirror),
        );
        create_router(Arc::new(orchestrator))
    }

    fn neutral_catalog() -> CandidateCatalog {
        CandidateCatalog {
            mps: BTreeMap::from([(
                "MP-3".to_string(),
                ModelPortfolio {
                    name: "Neutral".to_string(),
                    allocation: BTreeMap::from([(AssetClass::Cash, 100.0)]),
                },
            )]),
            sub_mps: BTreeMap::from([(
                AssetClass::Cash,
                BTreeMap::from([("Cash-A".to_string(), SubModelPortfolio::default())]),
            )]),
        }
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = router(neutral_catalog())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_latest_decision_not_found_before_first_cycle() {
        let response = router(neutral_catalog())
            .oneshot(Request::get("/api/decisions/latest").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cycle_then_latest() {
        let app = router(neutral_catalog());

        let response = app
            .clone()
            .oneshot(
                Request::post("/api/cycles")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"as_of":"2024-07-01"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        // Every agent is missing, so the cycle degrades to the neutral MP.
        assert_eq!(body["data"]["decision"]["mp_id"], "MP-3");

        let response = app
            .oneshot(Request::get("/api/decisions/latest").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["as_of"], "2024-07-01");
    }

    #[tokio::test]
    async fn test_cycle_without_catalog_is_unprocessable() {
        let response = router(CandidateCatalog::default())
            .oneshot(Request::post("/api/cycles").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_replay_rejects_non_positive_lookback() {
        let response = router(neutral_catalog())
            .oneshot(Request::get("/api/replay?lookback_days=0").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
