//! Replay / regression evaluator
//!
//! Offline stability report over a trailing window of persisted decisions.
//! Read-only: decisions are loaded, never mutated.

use crate::config::ReplayConfig;
use crate::error::OrchestrationError;
use crate::models::{AssetClass, Decision, ReplayMetrics, Verdict};
use crate::state::{chronological, DecisionStore};
use crate::Result;
use chrono::{Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Upper bounds of the stable and caution bands; anything above is a warning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Band {
    pub stable_max: f64,
    pub caution_max: f64,
}

impl Band {
    pub const fn new(stable_max: f64, caution_max: f64) -> Self {
        Self {
            stable_max,
            caution_max,
        }
    }

    pub fn classify(&self, value: f64) -> Verdict {
        if value <= self.stable_max {
            Verdict::Stable
        } else if value <= self.caution_max {
            Verdict::Caution
        } else {
            Verdict::Warning
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplayBaselines {
    pub mp_change_rate: Band,
    pub sub_mp_change_rate: Band,
    pub whipsaw_rate: Band,
}

impl Default for ReplayBaselines {
    fn default() -> Self {
        Self {
            mp_change_rate: Band::new(0.10, 0.25),
            sub_mp_change_rate: Band::new(0.15, 0.30),
            whipsaw_rate: Band::new(0.05, 0.15),
        }
    }
}

impl ReplayBaselines {
    pub fn validate(&self) -> Result<()> {
        let bands = [
            ("mp_change_rate", self.mp_change_rate),
            ("sub_mp_change_rate", self.sub_mp_change_rate),
            ("whipsaw_rate", self.whipsaw_rate),
        ];
        for (name, band) in bands {
            let ordered = 0.0 <= band.stable_max
                && band.stable_max <= band.caution_max
                && band.caution_max <= 1.0;
            if !ordered {
                return Err(OrchestrationError::ConfigurationError(format!(
                    "replay band {} must satisfy 0 <= stable ({}) <= caution ({}) <= 1",
                    name, band.stable_max, band.caution_max
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplayEvaluation {
    pub overall: Verdict,
    pub per_metric: BTreeMap<String, Verdict>,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplayReport {
    pub lookback_days: i64,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub metrics: ReplayMetrics,
    pub baselines: ReplayBaselines,
    pub evaluation: ReplayEvaluation,
}

pub struct ReplayEvaluator {
    store: Arc<dyn DecisionStore>,
    config: ReplayConfig,
}

impl ReplayEvaluator {
    pub fn new(store: Arc<dyn DecisionStore>, config: ReplayConfig) -> Self {
        Self { store, config }
    }

    /// Evaluate the window ending today.
    pub async fn evaluate(&self, lookback_days: Option<i64>) -> Result<ReplayReport> {
        self.evaluate_until(Utc::now().date_naive(), lookback_days).await
    }

    pub async fn evaluate_until(&self, window_end: NaiveDate, lookback_days: Option<i64>) -> Result<ReplayReport> {
        let lookback_days = lookback_days.unwrap_or(self.config.lookback_days);
        if lookback_days <= 0 {
            return Err(OrchestrationError::ConfigurationError(format!(
                "lookback_days must be positive, got {}",
                lookback_days
            )));
        }

        // `lookback_days` dates, `window_end` included
        let window_start = window_end
            .checked_sub_days(Days::new(lookback_days as u64 - 1))
            .unwrap_or(NaiveDate::MIN);

        let decisions = self.store.load_window(window_start, window_end).await?;
        let report = self.report(lookback_days, window_start, window_end, &decisions);

        info!(
            lookback_days,
            decisions = report.metrics.decision_count,
            overall = ?report.evaluation.overall,
            mp_change_rate = report.metrics.mp_change_rate,
            whipsaw_count = report.metrics.whipsaw_count,
            "Replay evaluation completed"
        );

        Ok(report)
    }

    /// Pure evaluation over an already-loaded history.
    pub fn report(
        &self,
        lookback_days: i64,
        window_start: NaiveDate,
        window_end: NaiveDate,
        decisions: &[Decision],
    ) -> ReplayReport {
        let metrics = compute_metrics(decisions);
        let evaluation = evaluate_metrics(&metrics, &self.config.baselines, self.config.min_sample);

        ReplayReport {
            lookback_days,
            window_start,
            window_end,
            metrics,
            baselines: self.config.baselines.clone(),
            evaluation,
        }
    }
}

pub fn compute_metrics(decisions: &[Decision]) -> ReplayMetrics {
    let mut history: Vec<&Decision> = decisions.iter().collect();
    history.sort_by(|a, b| chronological(a, b));

    let n = history.len();
    let transitions = n.saturating_sub(1);
    let windows = n.saturating_sub(2);

    let mp_changes = history
        .windows(2)
        .filter(|pair| pair[0].mp_id != pair[1].mp_id)
        .count();

    let whipsaw_count = history
        .windows(3)
        .filter(|w| is_reversal(&w[0].mp_id, &w[1].mp_id, &w[2].mp_id))
        .count();

    let mut sub_mp_change_rate = BTreeMap::new();
    let mut sub_mp_whipsaw_count = BTreeMap::new();
    let mut total_sub_changes = 0usize;

    for class in AssetClass::ALL {
        let changes = history
            .windows(2)
            .filter(|pair| pair[0].sub_mp_for(class) != pair[1].sub_mp_for(class))
            .count();
        let reversals = history
            .windows(3)
            .filter(|w| is_reversal(&w[0].sub_mp_for(class), &w[1].sub_mp_for(class), &w[2].sub_mp_for(class)))
            .count();

        total_sub_changes += changes;
        sub_mp_change_rate.insert(class, rate(changes, transitions));
        sub_mp_whipsaw_count.insert(class, reversals);
    }

    ReplayMetrics {
        decision_count: n,
        transition_count: transitions,
        mp_changes,
        mp_change_rate: rate(mp_changes, transitions),
        sub_mp_change_rate,
        overall_sub_mp_change_rate: rate(total_sub_changes, transitions * AssetClass::ALL.len()),
        whipsaw_count,
        whipsaw_rate: rate(whipsaw_count, windows),
        sub_mp_whipsaw_count,
    }
}

/// A → B → A within two steps.
fn is_reversal<T: PartialEq>(a: &T, b: &T, c: &T) -> bool {
    a == c && a != b
}

fn rate(count: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        count as f64 / denominator as f64
    }
}

pub fn evaluate_metrics(metrics: &ReplayMetrics, baselines: &ReplayBaselines, min_sample: usize) -> ReplayEvaluation {
    let mut per_metric = BTreeMap::new();
    let mut notes = Vec::new();

    let mut scored: Vec<(String, f64, Band)> = vec![
        ("mp_change_rate".to_string(), metrics.mp_change_rate, baselines.mp_change_rate),
        (
            "sub_mp_change_rate".to_string(),
            metrics.overall_sub_mp_change_rate,
            baselines.sub_mp_change_rate,
        ),
        ("whipsaw_rate".to_string(), metrics.whipsaw_rate, baselines.whipsaw_rate),
    ];
    for (class, value) in &metrics.sub_mp_change_rate {
        scored.push((
            format!("sub_mp_change_rate.{}", class),
            *value,
            baselines.sub_mp_change_rate,
        ));
    }

    if metrics.decision_count < min_sample {
        for (name, _, _) in scored {
            per_metric.insert(name, Verdict::Insufficient);
        }
        notes.push(format!(
            "Only {} decisions in window; at least {} required for a verdict.",
            metrics.decision_count, min_sample
        ));
        return ReplayEvaluation {
            overall: Verdict::Insufficient,
            per_metric,
            notes,
        };
    }

    let mut overall = Verdict::Stable;
    for (name, value, band) in scored {
        let verdict = band.classify(value);
        match verdict {
            Verdict::Caution => notes.push(format!(
                "{} = {:.3} is above the stable band ({:.2}).",
                name, value, band.stable_max
            )),
            Verdict::Warning => notes.push(format!(
                "{} = {:.3} is above the caution band ({:.2}).",
                name, value, band.caution_max
            )),
            _ => {}
        }
        overall = overall.max(verdict);
        per_metric.insert(name, verdict);
    }

    if metrics.whipsaw_count > 0 {
        notes.push(format!("{} MP reversal(s) (A -> B -> A) detected.", metrics.whipsaw_count));
    }

    ReplayEvaluation {
        overall,
        per_metric,
        notes,
    }
}
