use crate::domain::asset::AssetClass;
use crate::error::PortfolioError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskType {
    Conservative,
    Moderate,
    Aggressive,
    VeryAggressive,
}

impl RiskType {
    /// Thresholds: <25 conservative, <60 moderate, <85 aggressive, else very aggressive.
    pub fn from_score(risk_score: u8) -> Self {
        match risk_score {
            0..=24 => RiskType::Conservative,
            25..=59 => RiskType::Moderate,
            60..=84 => RiskType::Aggressive,
            _ => RiskType::VeryAggressive,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskType::Conservative => "conservative",
            RiskType::Moderate => "moderate",
            RiskType::Aggressive => "aggressive",
            RiskType::VeryAggressive => "very_aggressive",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            RiskType::Conservative => "stable and low-risk",
            RiskType::Moderate => "balanced with moderate risk",
            RiskType::Aggressive => "growth-focused with higher risk",
            RiskType::VeryAggressive => "maximum growth with high volatility",
        }
    }
}

impl fmt::Display for RiskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HorizonBracket {
    ShortTerm,
    MidTerm,
    LongTerm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvestmentGoal {
    Wealth,
    Growth,
    Retirement,
}

impl InvestmentGoal {
    pub fn description(self) -> &'static str {
        match self {
            InvestmentGoal::Wealth => "wealth creation",
            InvestmentGoal::Growth => "capital growth",
            InvestmentGoal::Retirement => "retirement planning",
        }
    }
}

/// Something the user does not want in the portfolio.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Exclusion {
    Class(AssetClass),
    Sector(String),
}

impl Exclusion {
    /// Asset class names win over sector names; blank input yields `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        match trimmed.parse::<AssetClass>() {
            Ok(class) => Some(Exclusion::Class(class)),
            Err(_) => Some(Exclusion::Sector(trimmed.to_string())),
        }
    }
}

/// One validated investment request. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserProfile {
    capital: f64,
    risk_score: u8,
    risk_type: RiskType,
    years: u32,
    expected_return: f64,
    exclusions: Vec<Exclusion>,
    horizon: HorizonBracket,
    goal: InvestmentGoal,
}

impl UserProfile {
    pub fn new(
        capital: f64,
        risk_score: i64,
        years: i64,
        expected_return: f64,
        exclusions: Vec<Exclusion>,
    ) -> Result<Self, PortfolioError> {
        if !capital.is_finite() || capital <= 0.0 {
            return Err(PortfolioError::InvalidProfile(format!(
                "capital must be a positive amount (got {capital})"
            )));
        }
        if !(0..=100).contains(&risk_score) {
            return Err(PortfolioError::InvalidProfile(format!(
                "risk_score must be between 0 and 100 (got {risk_score})"
            )));
        }
        if years <= 0 || years > i64::from(u32::MAX) {
            return Err(PortfolioError::InvalidProfile(format!(
                "years must be a positive integer (got {years})"
            )));
        }
        if !expected_return.is_finite() {
            return Err(PortfolioError::InvalidProfile(
                "expected_return must be a finite annual fraction".to_string(),
            ));
        }

        let risk_score = risk_score as u8;
        let years = years as u32;
        let (horizon, goal) = match years {
            0..=5 => (HorizonBracket::ShortTerm, InvestmentGoal::Wealth),
            6..=15 => (HorizonBracket::MidTerm, InvestmentGoal::Growth),
            _ => (HorizonBracket::LongTerm, InvestmentGoal::Retirement),
        };

        let mut exclusions = exclusions;
        exclusions.sort();
        exclusions.dedup();

        Ok(Self {
            capital,
            risk_score,
            risk_type: RiskType::from_score(risk_score),
            years,
            expected_return,
            exclusions,
            horizon,
            goal,
        })
    }

    pub fn capital(&self) -> f64 {
        self.capital
    }

    pub fn risk_score(&self) -> u8 {
        self.risk_score
    }

    pub fn risk_type(&self) -> RiskType {
        self.risk_type
    }

    pub fn years(&self) -> u32 {
        self.years
    }

    pub fn expected_return(&self) -> f64 {
        self.expected_return
    }

    pub fn exclusions(&self) -> &[Exclusion] {
        &self.exclusions
    }

    pub fn horizon(&self) -> HorizonBracket {
        self.horizon
    }

    pub fn goal(&self) -> InvestmentGoal {
        self.goal
    }

    pub fn excluded_classes(&self) -> BTreeSet<AssetClass> {
        self.exclusions
            .iter()
            .filter_map(|e| match e {
                Exclusion::Class(c) => Some(*c),
                Exclusion::Sector(_) => None,
            })
            .collect()
    }

    pub fn excludes_sector(&self, sector: Option<&str>) -> bool {
        let Some(sector) = sector.map(str::trim).filter(|s| !s.is_empty()) else {
            return false;
        };
        self.exclusions.iter().any(|e| match e {
            Exclusion::Sector(s) => s.eq_ignore_ascii_case(sector),
            Exclusion::Class(_) => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_type_thresholds() {
        assert_eq!(RiskType::from_score(0), RiskType::Conservative);
        assert_eq!(RiskType::from_score(24), RiskType::Conservative);
        assert_eq!(RiskType::from_score(25), RiskType::Moderate);
        assert_eq!(RiskType::from_score(59), RiskType::Moderate);
        assert_eq!(RiskType::from_score(60), RiskType::Aggressive);
        assert_eq!(RiskType::from_score(84), RiskType::Aggressive);
        assert_eq!(RiskType::from_score(85), RiskType::VeryAggressive);
        assert_eq!(RiskType::from_score(100), RiskType::VeryAggressive);
    }

    #[test]
    fn derives_horizon_and_goal_from_years() {
        let p = UserProfile::new(1000.0, 50, 5, 0.1, vec![]).unwrap();
        assert_eq!(p.horizon(), HorizonBracket::ShortTerm);
        assert_eq!(p.goal(), InvestmentGoal::Wealth);

        let p = UserProfile::new(1000.0, 50, 15, 0.1, vec![]).unwrap();
        assert_eq!(p.horizon(), HorizonBracket::MidTerm);
        assert_eq!(p.goal(), InvestmentGoal::Growth);

        let p = UserProfile::new(1000.0, 50, 16, 0.1, vec![]).unwrap();
        assert_eq!(p.horizon(), HorizonBracket::LongTerm);
        assert_eq!(p.goal(), InvestmentGoal::Retirement);
    }

    #[test]
    fn rejects_invalid_profiles() {
        for (capital, score, years) in [(0.0, 50, 5), (-1.0, 50, 5), (1000.0, 101, 5), (1000.0, -1, 5), (1000.0, 50, 0)] {
            let err = UserProfile::new(capital, score, years, 0.1, vec![]).unwrap_err();
            assert!(matches!(err, PortfolioError::InvalidProfile(_)), "{err}");
        }
        assert!(UserProfile::new(f64::NAN, 50, 5, 0.1, vec![]).is_err());
    }

    #[test]
    fn exclusions_split_into_classes_and_sectors() {
        let exclusions = ["crypto", "Energy", "", "bonds"]
            .iter()
            .filter_map(|s| Exclusion::parse(s))
            .collect();
        let p = UserProfile::new(1000.0, 50, 5, 0.1, exclusions).unwrap();
        let classes = p.excluded_classes();
        assert!(classes.contains(&AssetClass::Crypto));
        assert!(classes.contains(&AssetClass::Bond));
        assert_eq!(classes.len(), 2);
        assert!(p.excludes_sector(Some("energy")));
        assert!(!p.excludes_sector(Some("Technology")));
        assert!(!p.excludes_sector(None));
    }
}
