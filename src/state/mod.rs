//! Decision persistence layer
//!
//! One `Decision` per cycle, keyed by `decision_id` and never rewritten. The in-memory store
//! serves tests and local runs; `PgDecisionStore` is used when a database
//! URL is configured.

use crate::models::Decision;
use crate::Result;
use chrono::NaiveDate;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub mod postgres;

pub use postgres::PgDecisionStore;

/// Trait for decision persistence
#[async_trait::async_trait]
pub trait DecisionStore: Send + Sync {
    /// Insert by `decision_id`. A decision already stored is left untouched.
    async fn upsert(&self, decision: &Decision) -> Result<()>;

    /// Most recent decision strictly before `as_of`.
    async fn latest_before(&self, as_of: NaiveDate) -> Result<Option<Decision>>;

    async fn latest(&self) -> Result<Option<Decision>>;

    /// Decisions with `from <= as_of <= to`, oldest first.
    async fn load_window(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<Decision>>;

    async fn count(&self) -> Result<usize>;
}

/// Order by `as_of`, then `created_at`, then id.
pub fn chronological(a: &Decision, b: &Decision) -> Ordering {
    a.as_of
        .cmp(&b.as_of)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.decision_id.cmp(&b.decision_id))
}

/// In-memory decision store for development and tests
pub struct InMemoryDecisionStore {
    decisions: Arc<RwLock<HashMap<String, Decision>>>,
}

impl InMemoryDecisionStore {
    pub fn new() -> Self {
        Self {
            decisions: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryDecisionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DecisionStore for InMemoryDecisionStore {
    async fn upsert(&self, decision: &Decision) -> Result<()> {
        let mut decisions = self.decisions.write().await;

        // persisted decisions are immutable: a re-run keeps the stored row
        if decisions.contains_key(&decision.decision_id) {
            debug!(decision_id = %decision.decision_id, "Decision already persisted");
            return Ok(());
        }
        decisions.insert(decision.decision_id.clone(), decision.clone());
        Ok(())
    }

    async fn latest_before(&self, as_of: NaiveDate) -> Result<Option<Decision>> {
        let decisions = self.decisions.read().await;
        Ok(decisions
            .values()
            .filter(|d| d.as_of < as_of)
            .max_by(|a, b| chronological(a, b))
            .cloned())
    }

    async fn latest(&self) -> Result<Option<Decision>> {
        let decisions = self.decisions.read().await;
        Ok(decisions.values().max_by(|a, b| chronological(a, b)).cloned())
    }

    async fn load_window(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<Decision>> {
        let decisions = self.decisions.read().await;
        let mut window: Vec<Decision> = decisions
            .values()
            .filter(|d| d.as_of >= from && d.as_of <= to)
            .cloned()
            .collect();
        window.sort_by(chronological);
        Ok(window)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.decisions.read().await.len())
    }
}

/// Postgres when `POSTGRES_URL`/`DATABASE_URL` is set, else in-memory.
pub fn build_store() -> Arc<dyn DecisionStore> {
    let database_url = env::var("POSTGRES_URL")
        .or_else(|_| env::var("DATABASE_URL"))
        .ok();

    if let Some(url) = database_url {
        match PgDecisionStore::connect_lazy(&url) {
            Ok(store) => {
                info!("Decision store backend: postgres");
                return Arc::new(store);
            }
            Err(error) => {
                warn!(
                    "Failed to initialize postgres decision store, falling back to in-memory: {}",
                    error
                );
            }
        }
    }

    info!("Decision store backend: in-memory");
    Arc::new(InMemoryDecisionStore::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AssetClass, DecisionOutcome, RiskLevel};
    use chrono::{Duration, Utc};
    use std::collections::BTreeMap;
    use tokio_test::assert_ok;

    fn decision(id: &str, day: u32, mp_id: &str) -> Decision {
        Decision {
            decision_id: id.to_string(),
            as_of: NaiveDate::from_ymd_opt(2024, 5, day).unwrap(),
            mp_id: mp_id.to_string(),
            sub_mp: BTreeMap::from([(AssetClass::Stocks, Some("Eq-A".to_string()))]),
            reasoning: String::new(),
            confidence: 0.7,
            used_evidence_ids: vec![],
            outcome: DecisionOutcome::Selected,
            risk_level: RiskLevel::Low,
            regime_scores: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_rerun_keeps_persisted_decision() {
        let store = InMemoryDecisionStore::new();
        let d = decision("20240501-MP-1-abc", 1, "MP-1");
        assert_ok!(store.upsert(&d).await);

        let mut again = d.clone();
        again.created_at = d.created_at + Duration::seconds(30);
        again.reasoning = "second run".to_string();
        again.confidence = 0.2;
        assert_ok!(store.upsert(&again).await);

        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.latest().await.unwrap(), Some(d));
    }

    #[tokio::test]
    async fn test_latest_before_is_strict() {
        let store = InMemoryDecisionStore::new();
        store.upsert(&decision("a", 1, "MP-1")).await.unwrap();
        store.upsert(&decision("b", 2, "MP-2")).await.unwrap();
        store.upsert(&decision("c", 3, "MP-3")).await.unwrap();

        let as_of = NaiveDate::from_ymd_opt(2024, 5, 3).unwrap();
        let previous = store.latest_before(as_of).await.unwrap().unwrap();
        assert_eq!(previous.mp_id, "MP-2");

        let first_day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        assert!(store.latest_before(first_day).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_window_is_sorted_and_inclusive() {
        let store = InMemoryDecisionStore::new();
        store.upsert(&decision("c", 3, "MP-3")).await.unwrap();
        store.upsert(&decision("a", 1, "MP-1")).await.unwrap();
        store.upsert(&decision("b", 2, "MP-2")).await.unwrap();

        let window = store
            .load_window(
                NaiveDate::from_ymd_opt(2024, 5, 2).unwrap(),
                NaiveDate::from_ymd_opt(2024, 5, 3).unwrap(),
            )
            .await
            .unwrap();
        let ids: Vec<_> = window.iter().map(|d| d.mp_id.as_str()).collect();
        assert_eq!(ids, vec!["MP-2", "MP-3"]);
    }
}
