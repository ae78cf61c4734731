//! Postgres-backed decision store

use super::DecisionStore;
use crate::error::OrchestrationError;
use crate::models::{Decision, DecisionOutcome, RegimeScores, RiskLevel, SubMpSelection};
use crate::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

const SELECT_COLUMNS: &str = "decision_id, as_of, mp_id, sub_mp, reasoning, confidence, \
     used_evidence_ids, outcome, risk_level, regime_scores, created_at";

pub struct PgDecisionStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PgDecisionStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    /// Pool is created without connecting; the first query connects.
    pub fn connect_lazy(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(5).connect_lazy(url)?;
        Ok(Self::new(pool))
    }

    async fn ensure_schema(&self) -> Result<()> {
        let pool = &self.pool;
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS mp_decisions (
                      decision_id TEXT PRIMARY KEY,
                      as_of DATE NOT NULL,
                      mp_id TEXT NOT NULL,
                      sub_mp TEXT NOT NULL,
                      reasoning TEXT NOT NULL,
                      confidence DOUBLE PRECISION NOT NULL,
                      used_evidence_ids TEXT NOT NULL,
                      outcome TEXT NOT NULL,
                      risk_level TEXT NOT NULL,
                      regime_scores TEXT,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_mp_decisions_as_of
                    ON mp_decisions (as_of, created_at);
                    "#,
                )
                .execute(pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                OrchestrationError::PersistenceError(format!(
                    "Failed to initialize decision schema: {}",
                    e
                ))
            })?;

        Ok(())
    }

    async fn fetch(&self, sql: String, bind: Vec<NaiveDate>) -> Result<Vec<Decision>> {
        self.ensure_schema().await?;

        let mut query = sqlx::query(&sql);
        for date in bind {
            query = query.bind(date);
        }

        let rows = query.fetch_all(&self.pool).await.map_err(|e| {
            OrchestrationError::PersistenceError(format!("Failed to load decisions: {}", e))
        })?;

        rows.iter().map(decision_from_row).collect()
    }
}

#[async_trait::async_trait]
impl DecisionStore for PgDecisionStore {
    async fn upsert(&self, decision: &Decision) -> Result<()> {
        self.ensure_schema().await?;

        let regime_scores = decision
            .regime_scores
            .map(|s| serde_json::to_string(&s))
            .transpose()?;

        // a stored decision is never rewritten
        let result = sqlx::query(
            r#"
            INSERT INTO mp_decisions
              (decision_id, as_of, mp_id, sub_mp, reasoning, confidence, used_evidence_ids, outcome, risk_level, regime_scores, created_at)
            VALUES
              ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (decision_id) DO NOTHING
            "#,
        )
        .bind(&decision.decision_id)
        .bind(decision.as_of)
        .bind(&decision.mp_id)
        .bind(serde_json::to_string(&decision.sub_mp)?)
        .bind(&decision.reasoning)
        .bind(decision.confidence)
        .bind(serde_json::to_string(&decision.used_evidence_ids)?)
        .bind(enum_to_db(&decision.outcome)?)
        .bind(enum_to_db(&decision.risk_level)?)
        .bind(regime_scores)
        .bind(decision.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            OrchestrationError::PersistenceError(format!(
                "Failed to upsert decision {}: {}",
                decision.decision_id, e
            ))
        })?;

        if result.rows_affected() == 0 {
            debug!(decision_id = %decision.decision_id, "Decision already persisted");
        }
        Ok(())
    }

    async fn latest_before(&self, as_of: NaiveDate) -> Result<Option<Decision>> {
        let sql = format!(
            "SELECT {} FROM mp_decisions WHERE as_of < $1 \
             ORDER BY as_of DESC, created_at DESC, decision_id DESC LIMIT 1",
            SELECT_COLUMNS
        );
        Ok(self.fetch(sql, vec![as_of]).await?.into_iter().next())
    }

    async fn latest(&self) -> Result<Option<Decision>> {
        let sql = format!(
            "SELECT {} FROM mp_decisions \
             ORDER BY as_of DESC, created_at DESC, decision_id DESC LIMIT 1",
            SELECT_COLUMNS
        );
        Ok(self.fetch(sql, vec![]).await?.into_iter().next())
    }

    async fn load_window(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<Decision>> {
        let sql = format!(
            "SELECT {} FROM mp_decisions WHERE as_of >= $1 AND as_of <= $2 \
             ORDER BY as_of ASC, created_at ASC, decision_id ASC",
            SELECT_COLUMNS
        );
        self.fetch(sql, vec![from, to]).await
    }

    async fn count(&self) -> Result<usize> {
        self.ensure_schema().await?;
        let row = sqlx::query("SELECT COUNT(*) AS n FROM mp_decisions")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as usize)
    }
}

fn decision_from_row(row: &PgRow) -> Result<Decision> {
    let sub_mp: String = row.try_get("sub_mp")?;
    let evidence: String = row.try_get("used_evidence_ids")?;
    let outcome: String = row.try_get("outcome")?;
    let risk_level: String = row.try_get("risk_level")?;
    let regime_scores: Option<String> = row.try_get("regime_scores")?;

    Ok(Decision {
        decision_id: row.try_get("decision_id")?,
        as_of: row.try_get::<NaiveDate, _>("as_of")?,
        mp_id: row.try_get("mp_id")?,
        sub_mp: serde_json::from_str::<SubMpSelection>(&sub_mp)?,
        reasoning: row.try_get("reasoning")?,
        confidence: row.try_get("confidence")?,
        used_evidence_ids: serde_json::from_str(&evidence)?,
        outcome: enum_from_db::<DecisionOutcome>(outcome)?,
        risk_level: enum_from_db::<RiskLevel>(risk_level)?,
        regime_scores: regime_scores
            .map(|s| serde_json::from_str::<RegimeScores>(&s))
            .transpose()?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

/// Unit enums are stored as their serde string form.
fn enum_to_db<T: Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        Value::String(s) => Ok(s),
        other => Err(OrchestrationError::PersistenceError(format!(
            "expected a string-serialized enum, got {}",
            other
        ))),
    }
}

fn enum_from_db<T: DeserializeOwned>(raw: String) -> Result<T> {
    Ok(serde_json::from_value(Value::String(raw))?)
}
