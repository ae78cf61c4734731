//! Context builder
//!
//! Gathers the raw inputs of a cycle from injected sources and assembles the
//! immutable `DecisionContext`. Upstream outages never fail the cycle: missing
//! feeds become empty inputs and a missing catalog is served from the last
//! good snapshot.

use crate::error::OrchestrationError;
use crate::models::{AssetClass, CandidateCatalog, Decision, DecisionContext, Objective};
use crate::state::DecisionStore;
use crate::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

const EVIDENCE_PREFIX: &str = "evidence:";

/// Allocation sums further than this from 100% are rejected.
const ALLOCATION_TOLERANCE_PCT: f64 = 0.5;

/// Upstream collaborators feeding a cycle (all fallible)
#[async_trait]
pub trait ContextSource: Send + Sync {
    async fn quant_signals(&self, as_of: NaiveDate) -> Result<BTreeMap<String, f64>>;
    async fn narrative_summary(&self, as_of: NaiveDate) -> Result<String>;
    async fn graph_evidence(&self, as_of: NaiveDate) -> Result<String>;
    async fn catalog(&self) -> Result<CandidateCatalog>;

    /// Every feed for one cycle, fetched concurrently.
    async fn snapshot(&self, as_of: NaiveDate) -> FeedSnapshot {
        let (quant_signals, narrative_summary, graph_evidence, catalog) = tokio::join!(
            self.quant_signals(as_of),
            self.narrative_summary(as_of),
            self.graph_evidence(as_of),
            self.catalog(),
        );
        FeedSnapshot {
            quant_signals,
            narrative_summary,
            graph_evidence,
            catalog,
        }
    }
}

/// Per-feed results of one fetch; each feed fails independently.
pub struct FeedSnapshot {
    pub quant_signals: Result<BTreeMap<String, f64>>,
    pub narrative_summary: Result<String>,
    pub graph_evidence: Result<String>,
    pub catalog: Result<CandidateCatalog>,
}

impl FeedSnapshot {
    fn unavailable(reason: &str) -> Self {
        let err = || OrchestrationError::SourceError(reason.to_string());
        Self {
            quant_signals: Err(err()),
            narrative_summary: Err(err()),
            graph_evidence: Err(err()),
            catalog: Err(err()),
        }
    }
}

impl From<RawInputs> for FeedSnapshot {
    fn from(raw: RawInputs) -> Self {
        Self {
            quant_signals: Ok(raw.quant_signals),
            narrative_summary: Ok(raw.narrative_summary),
            graph_evidence: Ok(raw.graph_evidence),
            catalog: Ok(raw.catalog),
        }
    }
}

/// Raw inputs for one cycle, before assembly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawInputs {
    #[serde(default)]
    pub objective: Objective,
    #[serde(default)]
    pub quant_signals: BTreeMap<String, f64>,
    #[serde(default)]
    pub narrative_summary: String,
    #[serde(default)]
    pub graph_evidence: String,
    #[serde(default)]
    pub catalog: CandidateCatalog,
}

/// Snapshot file source. The file is read once per cycle, so edits are
/// picked up by the next one.
pub struct FileContextSource {
    path: PathBuf,
}

impl FileContextSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<RawInputs> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            OrchestrationError::SourceError(format!(
                "cannot read context snapshot {}: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn objective(&self) -> Result<Objective> {
        Ok(self.load().await?.objective)
    }
}

#[async_trait]
impl ContextSource for FileContextSource {
    async fn quant_signals(&self, _as_of: NaiveDate) -> Result<BTreeMap<String, f64>> {
        Ok(self.load().await?.quant_signals)
    }

    async fn narrative_summary(&self, _as_of: NaiveDate) -> Result<String> {
        Ok(self.load().await?.narrative_summary)
    }

    async fn graph_evidence(&self, _as_of: NaiveDate) -> Result<String> {
        Ok(self.load().await?.graph_evidence)
    }

    async fn catalog(&self) -> Result<CandidateCatalog> {
        Ok(self.load().await?.catalog)
    }

    async fn snapshot(&self, _as_of: NaiveDate) -> FeedSnapshot {
        match self.load().await {
            Ok(raw) => raw.into(),
            Err(e) => FeedSnapshot::unavailable(&e.to_string()),
        }
    }
}

/// Serves a fixed in-memory snapshot for every `as_of`.
#[derive(Debug, Clone)]
pub struct StaticContextSource {
    inputs: RawInputs,
}

impl StaticContextSource {
    pub fn new(inputs: RawInputs) -> Self {
        Self { inputs }
    }
}

#[async_trait]
impl ContextSource for StaticContextSource {
    async fn quant_signals(&self, _as_of: NaiveDate) -> Result<BTreeMap<String, f64>> {
        Ok(self.inputs.quant_signals.clone())
    }

    async fn narrative_summary(&self, _as_of: NaiveDate) -> Result<String> {
        Ok(self.inputs.narrative_summary.clone())
    }

    async fn graph_evidence(&self, _as_of: NaiveDate) -> Result<String> {
        Ok(self.inputs.graph_evidence.clone())
    }

    async fn catalog(&self) -> Result<CandidateCatalog> {
        Ok(self.inputs.catalog.clone())
    }
}

pub struct ContextBuilder {
    source: Arc<dyn ContextSource>,
    store: Arc<dyn DecisionStore>,
    objective: Objective,
    last_catalog: RwLock<Option<CandidateCatalog>>,
}

impl ContextBuilder {
    pub fn new(source: Arc<dyn ContextSource>, store: Arc<dyn DecisionStore>, objective: Objective) -> Self {
        Self {
            source,
            store,
            objective,
            last_catalog: RwLock::new(None),
        }
    }

    /// Fetch every input for `as_of` and assemble the context.
    pub async fn build(&self, as_of: NaiveDate) -> Result<DecisionContext> {
        let snapshot = self.source.snapshot(as_of).await;
        let mut degraded = Vec::new();

        let quant_signals = snapshot.quant_signals.unwrap_or_else(|e| {
            warn!(%as_of, error = %e, "Quant feed unavailable, using empty signals");
            degraded.push(format!("quant_signals: {}", e));
            BTreeMap::new()
        });
        let narrative_summary = snapshot.narrative_summary.unwrap_or_else(|e| {
            warn!(%as_of, error = %e, "News feed unavailable, using empty narrative");
            degraded.push(format!("narrative_summary: {}", e));
            String::new()
        });
        let graph_evidence = snapshot.graph_evidence.unwrap_or_else(|e| {
            warn!(%as_of, error = %e, "Graph evidence unavailable, using empty evidence");
            degraded.push(format!("graph_evidence: {}", e));
            String::new()
        });

        let catalog = match snapshot.catalog.map(validate_catalog) {
            Ok(catalog) if !catalog.is_empty() => {
                *self.last_catalog.write().await = Some(catalog.clone());
                catalog
            }
            outcome => {
                let reason = match &outcome {
                    Err(e) => {
                        warn!(error = %e, "Catalog feed unavailable");
                        e.to_string()
                    }
                    Ok(_) => "no valid candidates".to_string(),
                };
                let stale = self.last_catalog.read().await.clone();
                match stale {
                    Some(catalog) => {
                        warn!("Serving last good catalog snapshot");
                        degraded.push(format!("catalog: {}; serving last good snapshot", reason));
                        catalog
                    }
                    None => {
                        degraded.push(format!("catalog: {}", reason));
                        CandidateCatalog::default()
                    }
                }
            }
        };

        let previous_decision = match self.store.latest_before(as_of).await {
            Ok(previous) => previous,
            Err(e) => {
                warn!(%as_of, error = %e, "Decision store unavailable, continuing as cold start");
                degraded.push(format!("previous_decision: {}", e));
                None
            }
        };

        let mut ctx = assemble(
            as_of,
            RawInputs {
                objective: self.objective.clone(),
                quant_signals,
                narrative_summary,
                graph_evidence,
                catalog,
            },
            previous_decision,
        );
        ctx.degraded_inputs = degraded;

        info!(
            %as_of,
            signals = ctx.quant_signals.len(),
            candidates = ctx.catalog.mps.len(),
            evidence_ids = extract_evidence_ids(&ctx.graph_evidence).len(),
            has_previous = ctx.previous_decision.is_some(),
            degraded = ctx.degraded_inputs.len(),
            "Decision context assembled"
        );

        Ok(ctx)
    }
}

/// Pure assembly of a cycle's context.
pub fn assemble(as_of: NaiveDate, raw: RawInputs, previous_decision: Option<Decision>) -> DecisionContext {
    DecisionContext {
        as_of,
        objective: raw.objective,
        quant_signals: raw
            .quant_signals
            .into_iter()
            .filter(|(_, v)| v.is_finite())
            .collect(),
        narrative_summary: raw.narrative_summary,
        graph_evidence: raw.graph_evidence,
        catalog: validate_catalog(raw.catalog),
        previous_decision,
        degraded_inputs: Vec::new(),
    }
}

/// Drop MPs that cannot yield a valid decision: bad allocation sums, or a
/// funded asset class without Sub-MP candidates.
pub fn validate_catalog(mut catalog: CandidateCatalog) -> CandidateCatalog {
    let sub_mps = catalog.sub_mps.clone();
    catalog.mps.retain(|mp_id, mp| {
        let total: f64 = mp.allocation.values().sum();
        if (total - 100.0).abs() > ALLOCATION_TOLERANCE_PCT
            || mp.allocation.values().any(|w| !w.is_finite() || *w < 0.0)
        {
            warn!(mp_id = %mp_id, total, "Dropping MP with invalid allocation");
            return false;
        }

        let unfunded: Vec<AssetClass> = AssetClass::ALL
            .iter()
            .copied()
            .filter(|c| mp.is_funded(*c))
            .filter(|c| sub_mps.get(c).map(|s| s.is_empty()).unwrap_or(true))
            .collect();

        if !unfunded.is_empty() {
            warn!(mp_id = %mp_id, ?unfunded, "Dropping MP with no Sub-MP candidates for a funded class");
            return false;
        }
        true
    });
    catalog
}

/// Citable ids in a graph-evidence block (`evidence:<id>` tokens).
pub fn extract_evidence_ids(text: &str) -> BTreeSet<String> {
    let mut ids = BTreeSet::new();
    let mut rest = text;

    while let Some(pos) = rest.find(EVIDENCE_PREFIX) {
        let after = &rest[pos + EVIDENCE_PREFIX.len()..];
        let token: String = after
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();

        if !token.is_empty() {
            ids.insert(format!("{}{}", EVIDENCE_PREFIX, token));
        }
        rest = after;
    }

    ids
}

/// Canonical form of an agent-cited id (`123` → `evidence:123`).
pub fn normalize_evidence_id(id: &str) -> String {
    let id = id.trim();
    if id.starts_with(EVIDENCE_PREFIX) {
        id.to_string()
    } else {
        format!("{}{}", EVIDENCE_PREFIX, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelPortfolio;
    use crate::models::SubModelPortfolio;
    use crate::state::InMemoryDecisionStore;
    use tokio_test::{assert_err, assert_ok};

    struct FlakySource {
        catalog_up: std::sync::atomic::AtomicBool,
    }

    fn sample_catalog() -> CandidateCatalog {
        CandidateCatalog {
            mps: BTreeMap::from([(
                "MP-1".to_string(),
                ModelPortfolio {
                    name: "Growth".to_string(),
                    allocation: BTreeMap::from([(AssetClass::Stocks, 100.0)]),
                },
            )]),
            sub_mps: BTreeMap::from([(
                AssetClass::Stocks,
                BTreeMap::from([("Eq-A".to_string(), SubModelPortfolio::default())]),
            )]),
        }
    }

    #[async_trait]
    impl ContextSource for FlakySource {
        async fn quant_signals(&self, _as_of: NaiveDate) -> Result<BTreeMap<String, f64>> {
            Ok(BTreeMap::from([("CPI_YOY".to_string(), 2.1), ("BAD".to_string(), f64::NAN)]))
        }

        async fn narrative_summary(&self, _as_of: NaiveDate) -> Result<String> {
            Err(OrchestrationError::SourceError("news down".to_string()))
        }

        async fn graph_evidence(&self, _as_of: NaiveDate) -> Result<String> {
            Err(OrchestrationError::SourceError("graph down".to_string()))
        }

        async fn catalog(&self) -> Result<CandidateCatalog> {
            if self.catalog_up.load(std::sync::atomic::Ordering::SeqCst) {
                Ok(sample_catalog())
            } else {
                Err(OrchestrationError::SourceError("catalog down".to_string()))
            }
        }
    }

    #[test]
    fn test_extract_evidence_ids() {
        let text = "Capex surge (evidence:123) confirmed by evidence:ab-9; see evidence: none.";
        let ids = extract_evidence_ids(text);
        assert_eq!(
            ids.into_iter().collect::<Vec<_>>(),
            vec!["evidence:123".to_string(), "evidence:ab-9".to_string()]
        );
    }

    #[test]
    fn test_normalize_evidence_id() {
        assert_eq!(normalize_evidence_id("123"), "evidence:123");
        assert_eq!(normalize_evidence_id(" evidence:7 "), "evidence:7");
    }

    #[test]
    fn test_validate_catalog_drops_unbacked_mps() {
        let mut catalog = sample_catalog();
        catalog.mps.insert(
            "MP-2".to_string(),
            ModelPortfolio {
                name: String::new(),
                allocation: BTreeMap::from([(AssetClass::Stocks, 50.0), (AssetClass::Bonds, 50.0)]),
            },
        );
        catalog.mps.insert(
            "MP-3".to_string(),
            ModelPortfolio {
                name: String::new(),
                allocation: BTreeMap::from([(AssetClass::Stocks, 70.0)]),
            },
        );

        let validated = validate_catalog(catalog);
        assert_eq!(validated.mps.keys().collect::<Vec<_>>(), vec!["MP-1"]);
    }

    #[tokio::test]
    async fn test_builder_degrades_on_outage_and_serves_stale_catalog() {
        let source = Arc::new(FlakySource {
            catalog_up: std::sync::atomic::AtomicBool::new(true),
        });
        let store = Arc::new(InMemoryDecisionStore::new());
        let builder = ContextBuilder::new(source.clone(), store, Objective::default());
        let as_of = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();

        let first = builder.build(as_of).await.unwrap();
        assert_eq!(first.graph_evidence, "");
        assert_eq!(first.narrative_summary, "");
        assert_eq!(first.quant_signals.len(), 1);
        assert!(first.catalog.contains_mp("MP-1"));

        source
            .catalog_up
            .store(false, std::sync::atomic::Ordering::SeqCst);
        let second = builder.build(as_of).await.unwrap();
        assert!(second.catalog.contains_mp("MP-1"));
        assert!(second.previous_decision.is_none());
        assert!(second.degraded_inputs.iter().any(|d| d.contains("last good snapshot")));
    }

    struct UnreachableStore;

    #[async_trait]
    impl DecisionStore for UnreachableStore {
        async fn upsert(&self, _decision: &Decision) -> Result<()> {
            Err(OrchestrationError::PersistenceError("connection refused".to_string()))
        }

        async fn latest_before(&self, _as_of: NaiveDate) -> Result<Option<Decision>> {
            Err(OrchestrationError::PersistenceError("connection refused".to_string()))
        }

        async fn latest(&self) -> Result<Option<Decision>> {
            Err(OrchestrationError::PersistenceError("connection refused".to_string()))
        }

        async fn load_window(&self, _from: NaiveDate, _to: NaiveDate) -> Result<Vec<Decision>> {
            Err(OrchestrationError::PersistenceError("connection refused".to_string()))
        }

        async fn count(&self) -> Result<usize> {
            Err(OrchestrationError::PersistenceError("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_store_outage_builds_a_cold_start_context() {
        let source = Arc::new(StaticContextSource::new(RawInputs {
            catalog: sample_catalog(),
            ..RawInputs::default()
        }));
        let builder = ContextBuilder::new(source, Arc::new(UnreachableStore), Objective::default());
        let as_of = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();

        let ctx = assert_ok!(builder.build(as_of).await);
        assert!(ctx.previous_decision.is_none());
        assert!(ctx.catalog.contains_mp("MP-1"));
        assert_eq!(ctx.degraded_inputs.len(), 1);
        assert!(ctx.degraded_inputs[0].starts_with("previous_decision:"));
        assert!(ctx.degraded_inputs[0].contains("connection refused"));
    }

    #[tokio::test]
    async fn test_file_source_serves_every_feed_from_one_read() {
        let path = std::env::temp_dir().join(format!("mp-context-{}.json", uuid::Uuid::new_v4()));
        let raw = RawInputs {
            quant_signals: BTreeMap::from([("PMI".to_string(), 55.0)]),
            narrative_summary: "Capex up".to_string(),
            graph_evidence: "evidence:1".to_string(),
            catalog: sample_catalog(),
            ..RawInputs::default()
        };
        tokio::fs::write(&path, serde_json::to_vec(&raw).unwrap()).await.unwrap();

        let source = FileContextSource::new(&path);
        let as_of = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let snapshot = source.snapshot(as_of).await;

        // later edits are not seen by a snapshot already taken
        tokio::fs::remove_file(&path).await.unwrap();

        assert_eq!(snapshot.quant_signals.unwrap()["PMI"], 55.0);
        assert_eq!(snapshot.narrative_summary.unwrap(), "Capex up");
        assert_eq!(snapshot.graph_evidence.unwrap(), "evidence:1");
        assert!(snapshot.catalog.unwrap().contains_mp("MP-1"));

        let missing = source.snapshot(as_of).await;
        assert_err!(missing.quant_signals);
        assert_err!(missing.catalog);
    }

    #[tokio::test]
    async fn test_missing_snapshot_file_degrades_every_feed() {
        let path = std::env::temp_dir().join(format!("mp-context-{}.json", uuid::Uuid::new_v4()));
        let source = Arc::new(FileContextSource::new(&path));
        let builder = ContextBuilder::new(source, Arc::new(InMemoryDecisionStore::new()), Objective::default());

        let ctx = assert_ok!(builder.build(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()).await);
        assert!(ctx.catalog.is_empty());
        assert_eq!(ctx.degraded_inputs.len(), 4);
    }
}
