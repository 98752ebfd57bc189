use crate::domain::asset::AssetClass;
use crate::domain::profile::RiskType;
use crate::optimizer::{OptimizerConfig, DEFAULT_RISK_FREE_RATE};
use crate::scoring::ScoringWeights;
use crate::selector::SectorCaps;
use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: Option<String>,
    pub sentry_dsn: Option<String>,
    pub data_provider_base_url: Option<String>,
    pub data_provider_api_key: Option<String>,
    pub config_path: Option<String>,
    pub universe_path: Option<String>,
    pub risk_free_rate: Option<f64>,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        let risk_free_rate = match std::env::var("LUMIA_RISK_FREE_RATE") {
            Ok(raw) => Some(
                raw.trim()
                    .parse::<f64>()
                    .with_context(|| format!("invalid LUMIA_RISK_FREE_RATE: {raw}"))?,
            ),
            Err(_) => None,
        };

        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            sentry_dsn: std::env::var("SENTRY_DSN").ok(),
            data_provider_base_url: std::env::var("DATA_PROVIDER_BASE_URL").ok(),
            data_provider_api_key: std::env::var("DATA_PROVIDER_API_KEY").ok(),
            config_path: std::env::var("LUMIA_CONFIG_PATH").ok(),
            universe_path: std::env::var("LUMIA_UNIVERSE_PATH").ok(),
            risk_free_rate,
        })
    }

    pub fn require_database_url(&self) -> anyhow::Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL is required")
    }

    pub fn require_data_provider_base_url(&self) -> anyhow::Result<&str> {
        self.data_provider_base_url
            .as_deref()
            .context("DATA_PROVIDER_BASE_URL is required")
    }

    pub fn require_universe_path(&self) -> anyhow::Result<&str> {
        self.universe_path
            .as_deref()
            .context("LUMIA_UNIVERSE_PATH is required")
    }

    /// Recommender tuning: the JSON file at `LUMIA_CONFIG_PATH` if set,
    /// otherwise defaults, with `LUMIA_RISK_FREE_RATE` applied on top.
    pub fn recommender_config(&self) -> anyhow::Result<RecommenderConfig> {
        let mut config = match self.config_path.as_deref() {
            Some(path) => RecommenderConfig::from_json_file(path)?,
            None => RecommenderConfig::default(),
        };
        if let Some(rf) = self.risk_free_rate {
            config.risk_free_rate = rf;
        }
        config.validate()?;
        Ok(config)
    }
}

/// How many assets to hold in a class: `clamp(floor(base_count × weight), min, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SelectionRule {
    pub base_count: f64,
    pub min: usize,
    pub max: usize,
}

impl SelectionRule {
    fn is_valid(&self) -> bool {
        self.min <= self.max && self.base_count >= 0.0 && self.base_count.is_finite()
    }

    pub fn count(&self, weight: f64) -> usize {
        let raw = (self.base_count * weight).floor();
        let raw = if raw.is_finite() && raw > 0.0 { raw as usize } else { 0 };
        raw.clamp(self.min, self.max)
    }
}

/// Empirically tuned constants for the recommendation pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommenderConfig {
    pub risk_free_rate: f64,
    pub min_scores: BTreeMap<RiskType, f64>,
    /// Classes with patchier source data get a lower threshold.
    pub noisy_classes: BTreeSet<AssetClass>,
    pub noisy_class_allowance: f64,
    pub min_score_floor: f64,
    pub selection: BTreeMap<AssetClass, SelectionRule>,
    pub default_selection: SelectionRule,
    pub class_returns: BTreeMap<AssetClass, f64>,
    pub class_risks: BTreeMap<AssetClass, f64>,
    pub sector_caps: BTreeMap<RiskType, SectorCaps>,
    /// Classes whose selections are sector-capped.
    pub capped_classes: BTreeSet<AssetClass>,
    pub scoring_weights: ScoringWeights,
    pub optimizer: OptimizerConfig,
}

impl Default for RecommenderConfig {
    fn default() -> Self {
        use AssetClass::*;
        let risk_types = [
            RiskType::Conservative,
            RiskType::Moderate,
            RiskType::Aggressive,
            RiskType::VeryAggressive,
        ];

        Self {
            risk_free_rate: DEFAULT_RISK_FREE_RATE,
            min_scores: risk_types.into_iter().zip([52.0, 50.0, 48.0, 45.0]).collect(),
            noisy_classes: [Stock, MutualFund].into_iter().collect(),
            noisy_class_allowance: 5.0,
            min_score_floor: 45.0,
            selection: [
                (
                    Crypto,
                    SelectionRule {
                        base_count: 5.0,
                        min: 1,
                        max: 3,
                    },
                ),
                (
                    MutualFund,
                    SelectionRule {
                        base_count: 10.0,
                        min: 2,
                        max: 5,
                    },
                ),
            ]
            .into_iter()
            .collect(),
            default_selection: SelectionRule {
                base_count: 15.0,
                min: 3,
                max: 8,
            },
            class_returns: [(Stock, 0.15), (Etf, 0.12), (MutualFund, 0.11), (Crypto, 0.25), (Bond, 0.06)]
                .into_iter()
                .collect(),
            class_risks: [(Stock, 0.20), (Etf, 0.15), (MutualFund, 0.12), (Crypto, 0.60), (Bond, 0.05)]
                .into_iter()
                .collect(),
            sector_caps: risk_types
                .into_iter()
                .map(|r| (r, SectorCaps::for_risk_type(r)))
                .collect(),
            capped_classes: [Stock].into_iter().collect(),
            scoring_weights: ScoringWeights::default(),
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl RecommenderConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("invalid recommender config in {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.risk_free_rate.is_finite(), "risk_free_rate must be finite");
        for (risk_type, score) in &self.min_scores {
            ensure!(
                (0.0..=100.0).contains(score),
                "min score for {risk_type} must be within 0..=100"
            );
        }
        ensure!(
            self.noisy_class_allowance >= 0.0,
            "noisy_class_allowance must be non-negative"
        );
        for (class, rule) in &self.selection {
            ensure!(rule.is_valid(), "invalid selection rule for {class}");
        }
        ensure!(self.default_selection.is_valid(), "invalid default selection rule");
        for (class, risk) in &self.class_risks {
            ensure!(*risk >= 0.0 && risk.is_finite(), "class risk for {class} must be non-negative");
        }
        for caps in self.sector_caps.values() {
            caps.validate()?;
        }
        self.scoring_weights.validate()?;
        self.optimizer
            .validate()
            .map_err(|e| anyhow::anyhow!("optimizer config: {e}"))?;
        Ok(())
    }

    /// Minimum composite score for a class under a risk profile.
    pub fn min_score(&self, risk_type: RiskType, class: AssetClass) -> f64 {
        let base = self.min_scores.get(&risk_type).copied().unwrap_or(50.0);
        if self.noisy_classes.contains(&class) {
            (base - self.noisy_class_allowance).max(self.min_score_floor)
        } else {
            base
        }
    }

    pub fn selection_count(&self, class: AssetClass, weight: f64) -> usize {
        self.selection
            .get(&class)
            .unwrap_or(&self.default_selection)
            .count(weight)
    }

    /// Sector caps for `class`, if that class is capped at all.
    pub fn sector_caps_for(&self, risk_type: RiskType, class: AssetClass) -> Option<SectorCaps> {
        if !self.capped_classes.contains(&class) {
            return None;
        }
        Some(
            self.sector_caps
                .get(&risk_type)
                .cloned()
                .unwrap_or_else(|| SectorCaps::for_risk_type(risk_type)),
        )
    }

    pub fn class_return(&self, class: AssetClass) -> f64 {
        self.class_returns.get(&class).copied().unwrap_or(0.0)
    }

    pub fn class_risk(&self, class: AssetClass) -> f64 {
        self.class_risks.get(&class).copied().unwrap_or(0.15)
    }

    pub fn optimizer_config(&self) -> OptimizerConfig {
        self.optimizer.with_risk_free_rate(self.risk_free_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_thresholds() {
        let c = RecommenderConfig::default();
        assert_eq!(c.min_score(RiskType::Conservative, AssetClass::Etf), 52.0);
        assert_eq!(c.min_score(RiskType::Conservative, AssetClass::Stock), 47.0);
        assert_eq!(c.min_score(RiskType::Moderate, AssetClass::MutualFund), 45.0);
        assert_eq!(c.min_score(RiskType::Aggressive, AssetClass::Stock), 45.0);
        assert_eq!(c.min_score(RiskType::VeryAggressive, AssetClass::Crypto), 45.0);
        assert_eq!(c.min_score(RiskType::VeryAggressive, AssetClass::Stock), 45.0);
    }

    #[test]
    fn default_selection_counts() {
        let c = RecommenderConfig::default();
        assert_eq!(c.selection_count(AssetClass::Crypto, 0.10), 1);
        assert_eq!(c.selection_count(AssetClass::Crypto, 0.90), 3);
        assert_eq!(c.selection_count(AssetClass::MutualFund, 0.20), 2);
        assert_eq!(c.selection_count(AssetClass::MutualFund, 0.35), 3);
        assert_eq!(c.selection_count(AssetClass::Stock, 0.40), 6);
        assert_eq!(c.selection_count(AssetClass::Etf, 0.30), 4);
        assert_eq!(c.selection_count(AssetClass::Stock, 0.05), 3);
        assert_eq!(c.selection_count(AssetClass::Stock, 0.90), 8);
    }

    #[test]
    fn only_stocks_are_sector_capped_by_default() {
        let c = RecommenderConfig::default();
        assert!(c.sector_caps_for(RiskType::Moderate, AssetClass::Stock).is_some());
        assert!(c.sector_caps_for(RiskType::Moderate, AssetClass::Etf).is_none());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let c: RecommenderConfig = serde_json::from_value(serde_json::json!({
            "risk_free_rate": 0.05,
            "min_scores": {"moderate": 55.0}
        }))
        .unwrap();
        c.validate().unwrap();
        assert_eq!(c.risk_free_rate, 0.05);
        assert_eq!(c.min_score(RiskType::Moderate, AssetClass::Etf), 55.0);
        assert_eq!(c.class_return(AssetClass::Crypto), 0.25);
        assert_eq!(c.optimizer_config().risk_free_rate, 0.05);
    }

    #[test]
    fn rejects_inverted_selection_rule() {
        let mut c = RecommenderConfig::default();
        c.default_selection.min = 9;
        assert!(c.validate().is_err());
    }
}
