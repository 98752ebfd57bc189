use crate::allocation::AllocationPlan;
use crate::domain::asset::{AssetClass, AssetSummary};
use crate::domain::profile::UserProfile;
use crate::scoring::{self, ScoreBreakdown, Signal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One recommended holding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioItem {
    pub symbol: String,
    pub name: String,
    pub class: AssetClass,
    pub sector: Option<String>,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
    pub signal: Signal,
    /// Currency amount.
    pub allocation_amount: f64,
    /// Fraction of total capital.
    pub allocation_percentage: f64,
}

impl PortfolioItem {
    pub fn from_asset(asset: AssetSummary, allocation_amount: f64, allocation_percentage: f64) -> Self {
        let signal = scoring::signal(asset.score, &asset.breakdown);
        Self {
            symbol: asset.symbol,
            name: asset.name,
            class: asset.class,
            sector: asset.sector,
            score: asset.score,
            breakdown: asset.breakdown,
            signal,
            allocation_amount,
            allocation_percentage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioMetrics {
    pub expected_return: f64,
    /// Standard deviation.
    pub expected_risk: f64,
    pub sharpe_ratio: f64,
    pub risk_adjusted_return: f64,
    /// 0-10.
    pub diversification_score: f64,
    /// Capital compounded at the expected return over the horizon.
    pub projected_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub profile: UserProfile,
    /// Strategic plan before asset selection.
    pub target_allocation: AllocationPlan,
    /// Plan actually funded, after dropping classes without eligible assets.
    pub allocation: AllocationPlan,
    pub portfolio: BTreeMap<AssetClass, Vec<PortfolioItem>>,
    pub skipped_classes: Vec<AssetClass>,
    pub sector_allocation: BTreeMap<String, f64>,
    pub metrics: PortfolioMetrics,
    pub summary: String,
}

impl Recommendation {
    pub fn holdings(&self) -> impl Iterator<Item = &PortfolioItem> {
        self.portfolio.values().flatten()
    }

    pub fn total_holdings(&self) -> usize {
        self.portfolio.values().map(Vec::len).sum()
    }

    pub fn total_allocated(&self) -> f64 {
        self.holdings().map(|i| i.allocation_amount).sum()
    }
}
