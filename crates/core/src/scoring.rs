//! Composite asset scoring.
//!
//! Every sub-score lives on a 0-100 scale. The composite is a weighted blend
//! (technical 25%, fundamental 30%, sentiment 25%, risk 20% by default). The
//! helpers below derive sub-scores from raw inputs for feeds that do not ship
//! precomputed breakdowns; missing data maps to a neutral score.

use crate::domain::profile::RiskType;
use serde::{Deserialize, Serialize};

const NEUTRAL: f64 = 50.0;
const TRADING_DAYS: f64 = 252.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub technical: f64,
    pub fundamental: f64,
    pub sentiment: f64,
    pub risk: f64,
}

impl Default for ScoreBreakdown {
    fn default() -> Self {
        Self {
            technical: NEUTRAL,
            fundamental: NEUTRAL,
            sentiment: NEUTRAL,
            risk: NEUTRAL,
        }
    }
}

impl ScoreBreakdown {
    fn components(&self) -> [f64; 4] {
        [self.technical, self.fundamental, self.sentiment, self.risk]
    }

    pub fn is_within_range(&self) -> bool {
        self.components()
            .iter()
            .all(|v| v.is_finite() && (0.0..=100.0).contains(v))
    }

    /// Spread between the strongest and weakest sub-score.
    pub fn dispersion(&self) -> f64 {
        let c = self.components();
        let max = c.iter().copied().fold(f64::MIN, f64::max);
        let min = c.iter().copied().fold(f64::MAX, f64::min);
        max - min
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub technical: f64,
    pub fundamental: f64,
    pub sentiment: f64,
    pub risk: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            technical: 0.25,
            fundamental: 0.30,
            sentiment: 0.25,
            risk: 0.20,
        }
    }
}

impl ScoringWeights {
    pub fn validate(&self) -> anyhow::Result<()> {
        let w = [self.technical, self.fundamental, self.sentiment, self.risk];
        anyhow::ensure!(
            w.iter().all(|v| v.is_finite() && *v >= 0.0),
            "scoring weights must be non-negative"
        );
        let total: f64 = w.iter().sum();
        anyhow::ensure!(total > 0.0, "scoring weights must not all be zero");
        Ok(())
    }

    /// Weighted 0-100 composite. Sub-scores are clamped first and the weights
    /// are normalized, so the result always stays on the 0-100 scale.
    pub fn composite(&self, b: &ScoreBreakdown) -> f64 {
        let parts = [
            (b.technical, self.technical),
            (b.fundamental, self.fundamental),
            (b.sentiment, self.sentiment),
            (b.risk, self.risk),
        ];
        let total_weight: f64 = parts.iter().map(|(_, w)| *w).sum();
        if total_weight <= 0.0 {
            return NEUTRAL;
        }
        let weighted: f64 = parts
            .iter()
            .map(|(score, w)| clamp_score(*score) * w)
            .sum();
        clamp_score(weighted / total_weight)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Buy,
    Hold,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub action: Action,
    /// 30-95.
    pub confidence: f64,
}

/// Trading signal from a composite score; disagreement between sub-scores
/// lowers the confidence.
pub fn signal(composite: f64, breakdown: &ScoreBreakdown) -> Signal {
    let spread = breakdown.dispersion();
    let (action, confidence) = if composite >= 70.0 {
        (Action::Buy, composite - spread * 0.2)
    } else if composite >= 65.0 {
        (Action::Buy, composite - spread * 0.3 - 5.0)
    } else if composite <= 35.0 {
        (Action::Sell, (100.0 - composite) - spread * 0.2)
    } else if composite <= 40.0 {
        (Action::Sell, (100.0 - composite) - spread * 0.3 - 5.0)
    } else {
        (
            Action::Hold,
            100.0 - (50.0 - composite).abs() * 2.0 - spread * 0.2,
        )
    };

    Signal {
        action,
        confidence: confidence.clamp(30.0, 95.0),
    }
}

/// Technical score from daily closes: momentum, volatility band and moving
/// average alignment (a third of the score each).
pub fn technical_score(closes: &[f64]) -> f64 {
    let closes: Vec<f64> = closes
        .iter()
        .copied()
        .filter(|p| p.is_finite() && *p > 0.0)
        .collect();
    if closes.len() < 50 {
        return NEUTRAL;
    }

    let returns: Vec<f64> = closes.windows(2).map(|w| (w[1] - w[0]) / w[0]).collect();
    let recent = &returns[returns.len().saturating_sub(60)..];
    let mean = recent.iter().sum::<f64>() / recent.len() as f64;
    let variance = recent.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / recent.len() as f64;
    let volatility = variance.sqrt() * TRADING_DAYS.sqrt();

    let mut points: f64 = 0.0;

    points += if mean > 0.002 {
        10.0
    } else if mean > 0.0 {
        7.0
    } else if mean > -0.002 {
        3.0
    } else {
        0.0
    };

    points += if (0.10..=0.25).contains(&volatility) {
        10.0
    } else if volatility > 0.25 && volatility <= 0.40 {
        7.0
    } else if volatility < 0.10 {
        5.0
    } else {
        3.0
    };

    if closes.len() >= 200 {
        let sma = |n: usize| closes[closes.len() - n..].iter().sum::<f64>() / n as f64;
        let (sma_20, sma_50, sma_200) = (sma(20), sma(50), sma(200));
        let price = closes[closes.len() - 1];
        points += if price > sma_20 && sma_20 > sma_50 && sma_50 > sma_200 {
            10.0
        } else if price > sma_50 {
            7.0
        } else if price > sma_200 {
            5.0
        } else {
            0.0
        };
    } else {
        points += 5.0;
    }

    clamp_score(points / 30.0 * 100.0)
}

/// Latest reported fundamentals. Ratios are fractions (0.15 = 15%).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fundamentals {
    pub pe_ratio: Option<f64>,
    pub pb_ratio: Option<f64>,
    pub return_on_equity: Option<f64>,
    pub return_on_assets: Option<f64>,
    pub profit_margin: Option<f64>,
    pub debt_to_equity: Option<f64>,
    pub current_ratio: Option<f64>,
    pub quick_ratio: Option<f64>,
    pub revenue_growth: Option<f64>,
    pub earnings_growth: Option<f64>,
}

impl Fundamentals {
    fn is_empty(&self) -> bool {
        *self == Fundamentals::default()
    }
}

/// Fundamental score on a 40-point rubric (valuation 12, profitability 12,
/// financial health 10, growth 6), rescaled to 0-100.
pub fn fundamental_score(f: &Fundamentals) -> f64 {
    if f.is_empty() {
        // 25 of 40: lets assets with strong technicals through.
        return 62.5;
    }

    let mut points: f64 = 0.0;

    if let Some(pe) = f.pe_ratio {
        points += if (10.0..=25.0).contains(&pe) {
            6.0
        } else if pe > 25.0 && pe <= 35.0 {
            4.0
        } else if pe > 5.0 && pe < 10.0 {
            3.0
        } else if pe > 35.0 {
            1.0
        } else {
            0.0
        };
    }

    if let Some(pb) = f.pb_ratio.filter(|v| *v > 0.0) {
        points += if (1.0..=3.0).contains(&pb) {
            6.0
        } else if pb > 3.0 && pb <= 5.0 {
            4.0
        } else if pb < 1.0 {
            5.0
        } else {
            2.0
        };
    }

    points += tiered(f.return_on_equity, &[(0.20, 6.0), (0.15, 5.0), (0.10, 3.0), (0.05, 1.0)]);
    points += tiered(f.return_on_assets, &[(0.15, 3.0), (0.10, 2.0), (0.05, 1.0)]);
    points += tiered(f.profit_margin, &[(0.20, 3.0), (0.10, 2.0), (0.05, 1.0)]);

    if let Some(de) = f.debt_to_equity {
        points += if de < 0.3 {
            5.0
        } else if de < 0.5 {
            4.0
        } else if de < 1.0 {
            3.0
        } else if de < 2.0 {
            1.0
        } else {
            0.0
        };
    }

    if let Some(cr) = f.current_ratio {
        points += if (1.5..=3.0).contains(&cr) {
            3.0
        } else if (1.0..1.5).contains(&cr) || cr > 3.0 {
            2.0
        } else {
            0.0
        };
    }

    if let Some(qr) = f.quick_ratio {
        points += if qr >= 1.0 {
            2.0
        } else if qr >= 0.5 {
            1.0
        } else {
            0.0
        };
    }

    points += tiered(f.revenue_growth, &[(0.20, 3.0), (0.10, 2.0), (0.05, 1.0)]);
    points += tiered(f.earnings_growth, &[(0.20, 3.0), (0.10, 2.0), (0.05, 1.0)]);

    clamp_score(points.min(40.0) / 40.0 * 100.0)
}

/// Sentiment score from per-article sentiment values in [0, 1], with a small
/// bonus for news volume.
pub fn sentiment_score(article_sentiments: &[f64]) -> f64 {
    let values: Vec<f64> = article_sentiments
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .map(|v| v.clamp(0.0, 1.0))
        .collect();
    if values.is_empty() {
        return NEUTRAL;
    }

    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let mut points = mean * 30.0;
    if values.len() > 10 {
        points += 2.0;
    }
    if values.len() > 20 {
        points += 3.0;
    }
    clamp_score(points.min(30.0) / 30.0 * 100.0)
}

/// How well an asset's volatility suits the investor. `daily_range_pct` is
/// the average true range as a percentage of price.
pub fn risk_score(daily_range_pct: Option<f64>, risk_type: RiskType) -> f64 {
    #[derive(Clone, Copy)]
    enum Level {
        Low,
        Moderate,
        High,
    }

    let level = match daily_range_pct.filter(|v| v.is_finite() && *v > 0.0) {
        Some(v) if v < 2.0 => Level::Low,
        Some(v) if v < 4.0 => Level::Moderate,
        Some(_) => Level::High,
        None => Level::Moderate,
    };

    match (risk_type, level) {
        (RiskType::Conservative, Level::Low) => 90.0,
        (RiskType::Conservative, Level::Moderate) => 60.0,
        (RiskType::Conservative, Level::High) => 30.0,
        (RiskType::Moderate, Level::Low) => 70.0,
        (RiskType::Moderate, Level::Moderate) => 85.0,
        (RiskType::Moderate, Level::High) => 50.0,
        (RiskType::Aggressive | RiskType::VeryAggressive, Level::Low) => 50.0,
        (RiskType::Aggressive | RiskType::VeryAggressive, Level::Moderate) => 70.0,
        (RiskType::Aggressive | RiskType::VeryAggressive, Level::High) => 90.0,
    }
}

fn tiered(value: Option<f64>, tiers: &[(f64, f64)]) -> f64 {
    let Some(v) = value.filter(|v| v.is_finite()) else {
        return 0.0;
    };
    tiers
        .iter()
        .find(|(threshold, _)| v > *threshold)
        .map(|(_, points)| *points)
        .unwrap_or(0.0)
}

fn clamp_score(v: f64) -> f64 {
    if v.is_nan() {
        return NEUTRAL;
    }
    v.clamp(0.0, 100.0)
}
