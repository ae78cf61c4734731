//! Engine configuration
//!
//! Every tunable threshold lives here and can be overridden from the
//! environment (`MP_*` variables, `.env` honoured by the binaries).

use crate::error::OrchestrationError;
use crate::models::AssetClass;
use crate::replay::ReplayBaselines;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Window length in dates, the end date included.
    pub lookback_days: i64,
    /// Below this many decisions every verdict is `insufficient`.
    pub min_sample: usize,
    pub baselines: ReplayBaselines,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            lookback_days: 90,
            min_sample: 10,
            baselines: ReplayBaselines::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Lowest-risk MP used on cold start and for SHIFT_NEUTRAL.
    pub neutral_mp_id: String,
    /// Sub-MP used when a sub-allocator abstains.
    pub neutral_sub_mps: BTreeMap<AssetClass, String>,
    /// Decisions below this confidence collapse to the previous decision.
    pub confidence_floor: f64,
    /// Max score move (0-10 scale) still considered noise by the whipsaw check.
    pub score_materiality: f64,
    /// Confidence a sub-allocator needs to move off its previous selection.
    pub sub_mp_materiality: f64,
    /// Below this confidence a sub-allocator abstains.
    pub sub_mp_abstain_floor: f64,
    pub divergence_penalty: f64,
    pub missing_report_penalty: f64,
    /// How far below Quant's top fit a narrative-driven override may land.
    pub narrative_override_margin: f64,
    pub agent_timeout_ms: u64,
    pub cycle_timeout_ms: u64,
    pub parallel_sub_allocators: bool,
    pub replay: ReplayConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            neutral_mp_id: "MP-3".to_string(),
            neutral_sub_mps: BTreeMap::new(),
            confidence_floor: 0.40,
            score_materiality: 0.5,
            sub_mp_materiality: 0.65,
            sub_mp_abstain_floor: 0.35,
            divergence_penalty: 0.25,
            missing_report_penalty: 0.15,
            narrative_override_margin: 0.15,
            agent_timeout_ms: 30_000,
            cycle_timeout_ms: 120_000,
            parallel_sub_allocators: true,
            replay: ReplayConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from `MP_*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(id) = env::var("MP_NEUTRAL_MP_ID") {
            if !id.trim().is_empty() {
                config.neutral_mp_id = id.trim().to_string();
            }
        }
        if let Ok(raw) = env::var("MP_NEUTRAL_SUB_MPS") {
            config.neutral_sub_mps = parse_neutral_sub_mps(&raw);
        }

        env_override("MP_CONFIDENCE_FLOOR", &mut config.confidence_floor);
        env_override("MP_SCORE_MATERIALITY", &mut config.score_materiality);
        env_override("MP_SUB_MP_MATERIALITY", &mut config.sub_mp_materiality);
        env_override("MP_SUB_MP_ABSTAIN_FLOOR", &mut config.sub_mp_abstain_floor);
        env_override("MP_DIVERGENCE_PENALTY", &mut config.divergence_penalty);
        env_override("MP_MISSING_REPORT_PENALTY", &mut config.missing_report_penalty);
        env_override("MP_NARRATIVE_OVERRIDE_MARGIN", &mut config.narrative_override_margin);
        env_override("MP_AGENT_TIMEOUT_MS", &mut config.agent_timeout_ms);
        env_override("MP_CYCLE_TIMEOUT_MS", &mut config.cycle_timeout_ms);
        env_override("MP_PARALLEL_SUB_ALLOCATORS", &mut config.parallel_sub_allocators);
        env_override("MP_REPLAY_LOOKBACK_DAYS", &mut config.replay.lookback_days);
        env_override("MP_REPLAY_MIN_SAMPLE", &mut config.replay.min_sample);

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let unit_fields = [
            ("confidence_floor", self.confidence_floor),
            ("sub_mp_materiality", self.sub_mp_materiality),
            ("sub_mp_abstain_floor", self.sub_mp_abstain_floor),
            ("divergence_penalty", self.divergence_penalty),
            ("missing_report_penalty", self.missing_report_penalty),
            ("narrative_override_margin", self.narrative_override_margin),
        ];
        for (name, value) in unit_fields {
            if !(0.0..=1.0).contains(&value) {
                return Err(OrchestrationError::ConfigurationError(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }

        if !(0.0..=10.0).contains(&self.score_materiality) {
            return Err(OrchestrationError::ConfigurationError(format!(
                "score_materiality must be within [0, 10], got {}",
                self.score_materiality
            )));
        }

        if self.agent_timeout_ms == 0 || self.cycle_timeout_ms < self.agent_timeout_ms {
            return Err(OrchestrationError::ConfigurationError(format!(
                "timeouts invalid: agent={}ms cycle={}ms",
                self.agent_timeout_ms, self.cycle_timeout_ms
            )));
        }

        if self.replay.lookback_days <= 0 {
            return Err(OrchestrationError::ConfigurationError(
                "replay lookback_days must be positive".to_string(),
            ));
        }

        self.replay.baselines.validate()
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_timeout_ms)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_millis(self.cycle_timeout_ms)
    }
}

fn env_override<T: FromStr>(key: &str, slot: &mut T) {
    let Ok(raw) = env::var(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => warn!(key, value = %raw, "Ignoring unparsable config value"),
    }
}

/// Parses `Stocks=Eq-N,Bonds=Bd-N`.
fn parse_neutral_sub_mps(raw: &str) -> BTreeMap<AssetClass, String> {
    raw.split(',')
        .filter(|pair| !pair.trim().is_empty())
        .filter_map(|pair| {
            let (class, id) = pair.split_once('=')?;
            match class.parse::<AssetClass>() {
                Ok(class) if !id.trim().is_empty() => Some((class, id.trim().to_string())),
                _ => {
                    warn!(entry = pair, "Ignoring malformed neutral sub-MP entry");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_out_of_range_floor() {
        let config = EngineConfig {
            confidence_floor: 1.5,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(OrchestrationError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_rejects_cycle_timeout_below_agent_timeout() {
        let config = EngineConfig {
            agent_timeout_ms: 5_000,
            cycle_timeout_ms: 1_000,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_neutral_sub_mps() {
        let parsed = parse_neutral_sub_mps("Stocks=Eq-N, bonds = Bd-N,bogus=X,Cash=");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.get(&AssetClass::Stocks).map(String::as_str), Some("Eq-N"));
        assert_eq!(parsed.get(&AssetClass::Bonds).map(String::as_str), Some("Bd-N"));
    }
}
