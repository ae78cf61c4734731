//! Audit logging and decision identity
//!
//! Every cycle leaves a record of how its decision was reached, and every
//! decision gets an id derived from its content so re-runs upsert in place.

use crate::agents::{AgentRole, CallState};
use crate::models::{DecisionOutcome, SubMpSelection};
use crate::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Hex digits of the sub-MP hash kept in the decision id.
const SUB_MP_HASH_LEN: usize = 12;

/// One agent call as seen by the audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct AgentCallRecord {
    pub role: AgentRole,
    pub trace: Vec<CallState>,
    pub errors: Vec<String>,
}

impl AgentCallRecord {
    pub fn final_state(&self) -> CallState {
        self.trace.last().copied().unwrap_or(CallState::Pending)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleAuditRecord {
    pub cycle_id: Uuid,
    pub as_of: NaiveDate,
    pub decision_id: String,
    pub outcome: DecisionOutcome,
    /// Stage names in execution order.
    pub stages: Vec<String>,
    pub agent_calls: Vec<AgentCallRecord>,
    /// Closed-set corrections and quality-gate notes.
    pub corrections: Vec<String>,
    /// Inputs the context builder had to replace with a fallback.
    pub degraded_inputs: Vec<String>,
    pub persisted: bool,
    pub mirrored: bool,
    pub elapsed_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Audit trail storage
pub struct AuditLog {
    records: Arc<RwLock<HashMap<Uuid, CycleAuditRecord>>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Store a cycle record
    pub async fn record(&self, record: CycleAuditRecord) -> Result<Uuid> {
        let cycle_id = record.cycle_id;
        let mut records = self.records.write().await;
        records.insert(cycle_id, record);
        Ok(cycle_id)
    }

    pub async fn get(&self, cycle_id: Uuid) -> Result<Option<CycleAuditRecord>> {
        let records = self.records.read().await;
        Ok(records.get(&cycle_id).cloned())
    }

    /// Cycles that produced `decision_id`, oldest first
    pub async fn list_for_decision(&self, decision_id: &str) -> Result<Vec<CycleAuditRecord>> {
        let records = self.records.read().await;

        let mut items: Vec<_> = records
            .values()
            .filter(|record| record.decision_id == decision_id)
            .cloned()
            .collect();

        items.sort_by_key(|record| record.created_at);
        Ok(items)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

/// `YYYYMMDD-<mp_id>-<hash>` where the hash covers the sub-MP selection.
pub fn compute_decision_id(as_of: NaiveDate, mp_id: &str, sub_mp: &SubMpSelection) -> String {
    let digest = compute_selection_hash(sub_mp);
    let short = &digest[..SUB_MP_HASH_LEN.min(digest.len())];
    format!("{}-{}-{}", as_of.format("%Y%m%d"), mp_id, short)
}

/// SHA-256 of the selection's canonical JSON (keys in asset-class order).
/// Streams JSON directly into the hasher.
pub fn compute_selection_hash(sub_mp: &SubMpSelection) -> String {
    let mut hasher = Sha256::new();

    if serde_json::to_writer(&mut HashWriter(&mut hasher), sub_mp).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AssetClass;
    use std::collections::BTreeMap;

    fn selection(stocks: &str) -> SubMpSelection {
        BTreeMap::from([
            (AssetClass::Stocks, Some(stocks.to_string())),
            (AssetClass::Bonds, Some("Bd-A".to_string())),
            (AssetClass::Alternatives, None),
            (AssetClass::Cash, None),
        ])
    }

    #[test]
    fn test_decision_id_is_deterministic() {
        let as_of = NaiveDate::from_ymd_opt(2024, 7, 1).unwrap();
        let a = compute_decision_id(as_of, "MP-1", &selection("Eq-A"));
        let b = compute_decision_id(as_of, "MP-1", &selection("Eq-A"));
        assert_eq!(a, b);
        assert!(a.starts_with("20240701-MP-1-"));
        assert_eq!(a.len(), "20240701-MP-1-".len() + SUB_MP_HASH_LEN);
    }

    #[test]
    fn test_decision_id_tracks_sub_mp_selection() {
        let as_of = NaiveDate::from_ymd_opt(2024, 7, 1).unwrap();
        assert_ne!(
            compute_decision_id(as_of, "MP-1", &selection("Eq-A")),
            compute_decision_id(as_of, "MP-1", &selection("Eq-B"))
        );
    }

    #[tokio::test]
    async fn test_audit_log_lists_by_decision() {
        let log = AuditLog::new();
        let record = CycleAuditRecord {
            cycle_id: Uuid::new_v4(),
            as_of: NaiveDate::from_ymd_opt(2024, 7, 1).unwrap(),
            decision_id: "20240701-MP-1-abc".to_string(),
            outcome: DecisionOutcome::Selected,
            stages: vec!["context".to_string()],
            agent_calls: vec![AgentCallRecord {
                role: AgentRole::Quant,
                trace: vec![CallState::Pending, CallState::Valid],
                errors: vec![],
            }],
            corrections: vec![],
            degraded_inputs: vec![],
            persisted: true,
            mirrored: false,
            elapsed_ms: 12,
            created_at: Utc::now(),
        };

        let id = log.record(record.clone()).await.unwrap();
        log.record(CycleAuditRecord {
            cycle_id: Uuid::new_v4(),
            ..record
        })
        .await
        .unwrap();

        assert_eq!(log.get(id).await.unwrap().unwrap().agent_calls[0].final_state(), CallState::Valid);
        assert_eq!(log.list_for_decision("20240701-MP-1-abc").await.unwrap().len(), 2);
        assert_eq!(log.len().await, 2);
    }
}
