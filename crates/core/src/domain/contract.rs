use crate::domain::asset::{AssetClass, AssetSummary};
use crate::domain::profile::{Exclusion, RiskType, UserProfile};
use crate::error::PortfolioError;
use crate::scoring::{self, Fundamentals, ScoreBreakdown, ScoringWeights};
use anyhow::{ensure, Context};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Recommendation request as received from callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileRequest {
    pub capital: f64,
    pub risk_score: i64,
    pub years: i64,
    /// Annual fraction (0.12 = 12%).
    pub expected_return: f64,
    #[serde(default)]
    pub exclusions: Vec<String>,
}

impl ProfileRequest {
    pub fn validate_and_into_profile(self) -> Result<UserProfile, PortfolioError> {
        let exclusions = self
            .exclusions
            .iter()
            .filter_map(|s| Exclusion::parse(s))
            .collect();
        UserProfile::new(
            self.capital,
            self.risk_score,
            self.years,
            self.expected_return,
            exclusions,
        )
    }
}

/// Scored asset universe as published by the data collectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetSnapshot {
    pub as_of_date: NaiveDate,
    #[serde(default)]
    pub generated_at: Option<DateTime<Utc>>,
    pub items: Vec<AssetSnapshotItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetSnapshotItem {
    pub symbol: String,
    pub name: String,
    pub asset_class: String,
    #[serde(default)]
    pub sector: Option<String>,
    /// Precomputed composite; derived from the breakdown when absent.
    #[serde(default)]
    pub score: Option<f64>,
    /// Precomputed sub-scores; derived from `inputs` when absent.
    #[serde(default)]
    pub breakdown: Option<ScoreBreakdown>,
    #[serde(default)]
    pub inputs: Option<ScoreInputs>,
    #[serde(default)]
    pub details: BTreeMap<String, f64>,
}

/// Raw market data for feeds that do not ship precomputed sub-scores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreInputs {
    /// Daily closes, oldest first.
    pub closes: Vec<f64>,
    pub fundamentals: Fundamentals,
    /// Per-article sentiment in [0, 1].
    pub article_sentiments: Vec<f64>,
    /// Average true range as a percentage of price.
    pub daily_range_pct: Option<f64>,
}

impl ScoreInputs {
    /// Stored breakdowns are profile-independent, so the risk fit is scored
    /// against a moderate investor.
    pub fn breakdown(&self) -> ScoreBreakdown {
        ScoreBreakdown {
            technical: scoring::technical_score(&self.closes),
            fundamental: scoring::fundamental_score(&self.fundamentals),
            sentiment: scoring::sentiment_score(&self.article_sentiments),
            risk: scoring::risk_score(self.daily_range_pct, RiskType::Moderate),
        }
    }
}

impl AssetSnapshot {
    pub fn validate_and_into_assets(
        self,
        weights: &ScoringWeights,
    ) -> anyhow::Result<Vec<AssetSummary>> {
        ensure!(!self.items.is_empty(), "snapshot must contain at least one asset");

        let mut seen = BTreeSet::<String>::new();
        let mut out = Vec::with_capacity(self.items.len());
        for item in self.items {
            out.push(item.validate_and_into_asset(weights, &mut seen)?);
        }
        Ok(out)
    }
}

impl AssetSnapshotItem {
    fn validate_and_into_asset(
        self,
        weights: &ScoringWeights,
        seen: &mut BTreeSet<String>,
    ) -> anyhow::Result<AssetSummary> {
        let symbol = self.symbol.trim().to_string();
        ensure!(!symbol.is_empty(), "symbol must be non-empty");
        ensure!(seen.insert(symbol.clone()), "duplicate symbol: {symbol}");

        let name = self.name.trim().to_string();
        ensure!(!name.is_empty(), "name must be non-empty ({symbol})");

        let class = self
            .asset_class
            .parse::<AssetClass>()
            .with_context(|| format!("invalid asset_class for {symbol}"))?;

        let breakdown = match (self.breakdown, &self.inputs) {
            (Some(breakdown), _) => {
                ensure!(
                    breakdown.is_within_range(),
                    "breakdown sub-scores must be within 0..=100 ({symbol})"
                );
                breakdown
            }
            (None, Some(inputs)) => inputs.breakdown(),
            (None, None) => ScoreBreakdown::default(),
        };

        let score = match self.score {
            Some(score) => {
                ensure!(
                    score.is_finite() && (0.0..=100.0).contains(&score),
                    "score must be between 0 and 100 (got {score} for {symbol})"
                );
                score
            }
            None => weights.composite(&breakdown),
        };

        ensure!(
            self.details.values().all(|v| v.is_finite()),
            "details must be finite numbers ({symbol})"
        );

        let sector = self
            .sector
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Ok(AssetSummary {
            symbol,
            name,
            class,
            sector,
            score,
            breakdown,
            details: self.details,
        })
    }
}
