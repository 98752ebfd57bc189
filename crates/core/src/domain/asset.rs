use crate::error::PortfolioError;
use crate::scoring::ScoreBreakdown;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Closed set of asset classes, used end-to-end (allocation keys, universe
/// queries, storage, wire format).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    Stock,
    Etf,
    MutualFund,
    Crypto,
    Bond,
}

impl AssetClass {
    pub const ALL: [AssetClass; 5] = [
        AssetClass::Stock,
        AssetClass::Etf,
        AssetClass::MutualFund,
        AssetClass::Crypto,
        AssetClass::Bond,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AssetClass::Stock => "stock",
            AssetClass::Etf => "etf",
            AssetClass::MutualFund => "mutual_fund",
            AssetClass::Crypto => "crypto",
            AssetClass::Bond => "bond",
        }
    }

    /// Human-readable plural label.
    pub fn label(self) -> &'static str {
        match self {
            AssetClass::Stock => "Stocks",
            AssetClass::Etf => "ETFs",
            AssetClass::MutualFund => "Mutual Funds",
            AssetClass::Crypto => "Crypto",
            AssetClass::Bond => "Bonds",
        }
    }
}

impl fmt::Display for AssetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetClass {
    type Err = PortfolioError;

    // Accepts singular and plural spellings so that user input and external
    // feeds map onto the enum once, at the boundary.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "stock" | "stocks" | "equity" | "equities" => Ok(AssetClass::Stock),
            "etf" | "etfs" => Ok(AssetClass::Etf),
            "mutual_fund" | "mutual_funds" | "mf" => Ok(AssetClass::MutualFund),
            "crypto" | "cryptos" | "cryptocurrency" => Ok(AssetClass::Crypto),
            "bond" | "bonds" => Ok(AssetClass::Bond),
            _ => Err(PortfolioError::InvalidInput(format!(
                "unknown asset class: {s:?}"
            ))),
        }
    }
}

/// Read-only view of an asset as exposed by the universe provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetSummary {
    pub symbol: String,
    pub name: String,
    pub class: AssetClass,
    pub sector: Option<String>,
    /// Composite 0-100 score.
    pub score: f64,
    pub breakdown: ScoreBreakdown,
    /// Class-specific numeric attributes (NAV, circulating supply, expense ratio, ...).
    #[serde(default)]
    pub details: BTreeMap<String, f64>,
}

impl AssetSummary {
    /// Sector label used for grouping; unclassified assets share "Unknown".
    pub fn sector_label(&self) -> &str {
        match self.sector.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => s,
            _ => "Unknown",
        }
    }
}
