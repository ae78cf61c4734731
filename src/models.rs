//! Core data models for the decision engine

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

//
// ================= Asset classes =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AssetClass {
    Stocks,
    Bonds,
    Alternatives,
    Cash,
}

impl AssetClass {
    pub const ALL: [AssetClass; 4] = [
        AssetClass::Stocks,
        AssetClass::Bonds,
        AssetClass::Alternatives,
        AssetClass::Cash,
    ];

    /// Cash is assigned directly and never handed to a sub-allocator.
    pub fn is_delegated(self) -> bool {
        !matches!(self, AssetClass::Cash)
    }

    /// Stocks and Alternatives count towards drawdown exposure.
    pub fn is_risky(self) -> bool {
        matches!(self, AssetClass::Stocks | AssetClass::Alternatives)
    }
}

impl fmt::Display for AssetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AssetClass::Stocks => "Stocks",
            AssetClass::Bonds => "Bonds",
            AssetClass::Alternatives => "Alternatives",
            AssetClass::Cash => "Cash",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for AssetClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "stocks" | "stock" | "equity" | "equities" => Ok(AssetClass::Stocks),
            "bonds" | "bond" | "fixed_income" | "fixed income" => Ok(AssetClass::Bonds),
            "alternatives" | "alternative" | "alts" => Ok(AssetClass::Alternatives),
            "cash" => Ok(AssetClass::Cash),
            other => Err(format!("unknown asset class '{}'", other)),
        }
    }
}

//
// ================= Candidate catalog =================
//

/// A Model Portfolio: target weights (percent) per asset class.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelPortfolio {
    #[serde(default)]
    pub name: String,
    pub allocation: BTreeMap<AssetClass, f64>,
}

impl ModelPortfolio {
    pub fn weight(&self, class: AssetClass) -> f64 {
        self.allocation.get(&class).copied().unwrap_or(0.0)
    }

    pub fn is_funded(&self, class: AssetClass) -> bool {
        self.weight(class) > 0.0
    }

    /// Share of Stocks + Alternatives, in percent.
    pub fn risky_share(&self) -> f64 {
        AssetClass::ALL
            .iter()
            .filter(|c| c.is_risky())
            .map(|c| self.weight(*c))
            .sum()
    }

    /// One-way turnover (percent) when moving from `self` to `other`.
    pub fn turnover_to(&self, other: &ModelPortfolio) -> f64 {
        AssetClass::ALL
            .iter()
            .map(|c| (self.weight(*c) - other.weight(*c)).abs())
            .sum::<f64>()
            / 2.0
    }
}

/// A Sub-Model-Portfolio: instrument weights inside one asset class.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SubModelPortfolio {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub composition: BTreeMap<String, f64>,
}

/// Closed candidate sets for one cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CandidateCatalog {
    pub mps: BTreeMap<String, ModelPortfolio>,
    #[serde(default)]
    pub sub_mps: BTreeMap<AssetClass, BTreeMap<String, SubModelPortfolio>>,
}

impl CandidateCatalog {
    pub fn is_empty(&self) -> bool {
        self.mps.is_empty()
    }

    pub fn contains_mp(&self, mp_id: &str) -> bool {
        self.mps.contains_key(mp_id)
    }

    pub fn sub_candidates(&self, class: AssetClass) -> Option<&BTreeMap<String, SubModelPortfolio>> {
        self.sub_mps.get(&class)
    }

    pub fn contains_sub_mp(&self, class: AssetClass, sub_mp_id: &str) -> bool {
        self.sub_candidates(class)
            .map(|c| c.contains_key(sub_mp_id))
            .unwrap_or(false)
    }

    /// Lowest-risk candidate: smallest risky share, ties broken by id.
    pub fn most_defensive(&self) -> Option<&str> {
        self.mps
            .iter()
            .min_by(|(a_id, a), (b_id, b)| {
                a.risky_share()
                    .total_cmp(&b.risky_share())
                    .then_with(|| a_id.cmp(b_id))
            })
            .map(|(id, _)| id.as_str())
    }
}

//
// ================= Objective =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Constraints {
    /// Maximum tolerated drawdown, percent.
    #[serde(default)]
    pub max_drawdown_pct: Option<f64>,
    /// One-way turnover budget per cycle, percent.
    #[serde(default)]
    pub turnover_budget_pct: Option<f64>,
    #[serde(default)]
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Objective {
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub constraints: Constraints,
}

//
// ================= Context =================
//

/// Everything one cycle decides from. Built once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionContext {
    pub as_of: NaiveDate,
    pub objective: Objective,
    pub quant_signals: BTreeMap<String, f64>,
    pub narrative_summary: String,
    pub graph_evidence: String,
    pub catalog: CandidateCatalog,
    pub previous_decision: Option<Decision>,
    /// Inputs replaced by a fallback while building this context.
    #[serde(default)]
    pub degraded_inputs: Vec<String>,
}

impl DecisionContext {
    pub fn candidate_mps(&self) -> &BTreeMap<String, ModelPortfolio> {
        &self.catalog.mps
    }
}

//
// ================= Agent reports =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RegimeScores {
    pub growth: f64,
    pub inflation: f64,
    pub liquidity: f64,
}

impl RegimeScores {
    pub fn clamped(self) -> Self {
        Self {
            growth: self.growth.clamp(0.0, 10.0),
            inflation: self.inflation.clamp(0.0, 10.0),
            liquidity: self.liquidity.clamp(0.0, 10.0),
        }
    }

    /// Largest absolute move across the three axes.
    pub fn max_delta(&self, other: &RegimeScores) -> f64 {
        (self.growth - other.growth)
            .abs()
            .max((self.inflation - other.inflation).abs())
            .max((self.liquidity - other.liquidity).abs())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GrowthRegime {
    Expansion,
    Recovery,
    Slowdown,
    Contraction,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InflationRegime {
    Low,
    Moderate,
    High,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LiquidityRegime {
    Loose,
    Neutral,
    Tight,
}

impl FromStr for GrowthRegime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_label(s).as_str() {
            "expansion" | "expanding" | "boom" => Ok(GrowthRegime::Expansion),
            "recovery" | "recovering" => Ok(GrowthRegime::Recovery),
            "slowdown" | "slowing" | "late_cycle" => Ok(GrowthRegime::Slowdown),
            "contraction" | "recession" | "contracting" => Ok(GrowthRegime::Contraction),
            other => Err(format!("unknown growth regime '{}'", other)),
        }
    }
}

impl FromStr for InflationRegime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_label(s).as_str() {
            "low" | "low_inflation" | "disinflation" => Ok(InflationRegime::Low),
            "moderate" | "stable" | "moderate_inflation" => Ok(InflationRegime::Moderate),
            "high" | "high_inflation" | "rising" => Ok(InflationRegime::High),
            other => Err(format!("unknown inflation regime '{}'", other)),
        }
    }
}

impl FromStr for LiquidityRegime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_label(s).as_str() {
            "loose" | "loose_liquidity" | "easing" | "abundant" => Ok(LiquidityRegime::Loose),
            "neutral" => Ok(LiquidityRegime::Neutral),
            "tight" | "tight_liquidity" | "tightening" => Ok(LiquidityRegime::Tight),
            other => Err(format!("unknown liquidity regime '{}'", other)),
        }
    }
}

fn normalize_label(s: &str) -> String {
    s.trim().to_lowercase().replace(['-', ' '], "_")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegimeLabels {
    pub growth: GrowthRegime,
    pub inflation: InflationRegime,
    pub liquidity: LiquidityRegime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuantReport {
    pub scores: RegimeScores,
    pub regime_labels: RegimeLabels,
    pub mp_fit: BTreeMap<String, f64>,
    pub confidence: f64,
}

impl QuantReport {
    /// Highest-fit candidate, ties broken by id.
    pub fn top_mp(&self) -> Option<(&str, f64)> {
        self.mp_fit
            .iter()
            .max_by(|(a_id, a), (b_id, b)| a.total_cmp(b).then_with(|| b_id.cmp(a_id)))
            .map(|(id, fit)| (id.as_str(), *fit))
    }

    pub fn fit_of(&self, mp_id: &str) -> f64 {
        self.mp_fit.get(mp_id).copied().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
    Mixed,
}

impl FromStr for Sentiment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_label(s).as_str() {
            "positive" | "bullish" | "risk_on" | "optimistic" => Ok(Sentiment::Positive),
            "neutral" => Ok(Sentiment::Neutral),
            "negative" | "bearish" | "risk_off" | "pessimistic" | "fear" => Ok(Sentiment::Negative),
            "mixed" => Ok(Sentiment::Mixed),
            other => Err(format!("unknown sentiment '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NarrativeReport {
    pub dominant_themes: Vec<String>,
    pub sentiment: Sentiment,
    pub causal_risks: Vec<String>,
    pub weak_signals: Vec<String>,
    pub evidence_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_label(s).as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" | "moderate" => Ok(RiskLevel::Medium),
            "high" | "critical" => Ok(RiskLevel::High),
            other => Err(format!("unknown risk level '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecommendedAction {
    HoldPrevious,
    ShiftNeutral,
    ShiftDefensive,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskReport {
    pub divergence_detected: bool,
    pub risk_level: RiskLevel,
    pub constraint_violations: Vec<String>,
    pub whipsaw_warning: bool,
    /// `None` means no intervention: the supervisor proceeds on agent preference.
    pub recommended_action: Option<RecommendedAction>,
}

//
// ================= Decision =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    Selected,
    HeldPrevious,
    NeutralFallback,
}

pub type SubMpSelection = BTreeMap<AssetClass, Option<String>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub decision_id: String,
    pub as_of: NaiveDate,
    pub mp_id: String,
    pub sub_mp: SubMpSelection,
    pub reasoning: String,
    pub confidence: f64,
    pub used_evidence_ids: Vec<String>,
    pub outcome: DecisionOutcome,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub regime_scores: Option<RegimeScores>,
    pub created_at: DateTime<Utc>,
}

impl Decision {
    pub fn sub_mp_for(&self, class: AssetClass) -> Option<&str> {
        self.sub_mp.get(&class).and_then(|v| v.as_deref())
    }
}

//
// ================= Replay =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Stable,
    Caution,
    Warning,
    Insufficient,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplayMetrics {
    pub decision_count: usize,
    pub transition_count: usize,
    pub mp_changes: usize,
    pub mp_change_rate: f64,
    pub sub_mp_change_rate: BTreeMap<AssetClass, f64>,
    pub overall_sub_mp_change_rate: f64,
    pub whipsaw_count: usize,
    pub whipsaw_rate: f64,
    pub sub_mp_whipsaw_count: BTreeMap<AssetClass, usize>,
}
