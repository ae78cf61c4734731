//! Knowledge-graph mirroring of decisions
//!
//! Best effort: the orchestrator logs mirror failures and carries on.

use crate::error::OrchestrationError;
use crate::models::Decision;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[async_trait]
pub trait GraphMirror: Send + Sync {
    async fn mirror(&self, decision: &Decision) -> Result<()>;
}

/// Mirror that does nothing
pub struct NoopMirror;

#[async_trait]
impl GraphMirror for NoopMirror {
    async fn mirror(&self, decision: &Decision) -> Result<()> {
        debug!(decision_id = %decision.decision_id, "Graph mirror disabled");
        Ok(())
    }
}

/// Keeps mirrored decisions in memory; can be told to fail.
#[derive(Default)]
pub struct RecordingMirror {
    mirrored: Mutex<Vec<Decision>>,
    fail: bool,
}

impl RecordingMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            mirrored: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub async fn mirrored(&self) -> Vec<Decision> {
        self.mirrored.lock().await.clone()
    }
}

#[async_trait]
impl GraphMirror for RecordingMirror {
    async fn mirror(&self, decision: &Decision) -> Result<()> {
        if self.fail {
            return Err(OrchestrationError::MirrorError("graph store unavailable".to_string()));
        }
        self.mirrored.lock().await.push(decision.clone());
        Ok(())
    }
}

#[derive(Serialize)]
struct MirrorPayload<'a> {
    decision: &'a Decision,
    /// Graph nodes the decision links to.
    evidence_ids: &'a [String],
}

/// POSTs each decision with its cited evidence ids to a graph service.
pub struct HttpGraphMirror {
    client: Client,
    url: String,
}

impl HttpGraphMirror {
    pub fn new(url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl GraphMirror for HttpGraphMirror {
    async fn mirror(&self, decision: &Decision) -> Result<()> {
        let payload = MirrorPayload {
            decision,
            evidence_ids: &decision.used_evidence_ids,
        };

        let response = self.client.post(&self.url).json(&payload).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OrchestrationError::MirrorError(format!(
                "graph mirror returned {}: {}",
                status, body
            )));
        }

        debug!(decision_id = %decision.decision_id, "Decision mirrored");
        Ok(())
    }
}

/// HTTP mirror when `GRAPH_MIRROR_URL` is set, else no-op.
pub fn build_mirror() -> Result<Arc<dyn GraphMirror>> {
    match env::var("GRAPH_MIRROR_URL") {
        Ok(url) if !url.trim().is_empty() => {
            info!(url = %url, "Graph mirror backend: http");
            Ok(Arc::new(HttpGraphMirror::new(url.trim().to_string())?))
        }
        _ => {
            info!("Graph mirror backend: disabled");
            Ok(Arc::new(NoopMirror))
        }
    }
}
