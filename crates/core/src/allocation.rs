//! Strategic asset-class allocation.
//!
//! A fixed base matrix per risk type, nudged by investment horizon and by the
//! return target, then trimmed by the user's class exclusions.

use crate::domain::asset::AssetClass;
use crate::domain::profile::{RiskType, UserProfile};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Target weight per asset class. Classes with zero weight are kept so callers
/// can see the full plan; excluded classes are absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllocationPlan(BTreeMap<AssetClass, f64>);

impl AllocationPlan {
    pub fn from_weights(weights: impl IntoIterator<Item = (AssetClass, f64)>) -> Self {
        Self(weights.into_iter().collect())
    }

    pub fn weight(&self, class: AssetClass) -> f64 {
        self.0.get(&class).copied().unwrap_or(0.0)
    }

    pub fn contains(&self, class: AssetClass) -> bool {
        self.0.contains_key(&class)
    }

    pub fn iter(&self) -> impl Iterator<Item = (AssetClass, f64)> + '_ {
        self.0.iter().map(|(c, w)| (*c, *w))
    }

    /// Classes carrying a strictly positive weight.
    pub fn funded(&self) -> impl Iterator<Item = (AssetClass, f64)> + '_ {
        self.iter().filter(|(_, w)| *w > 0.0)
    }

    pub fn total(&self) -> f64 {
        self.0.values().sum()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when nothing is left to invest in.
    pub fn is_empty(&self) -> bool {
        self.total() <= 0.0
    }

    pub fn remove(&mut self, class: AssetClass) -> Option<f64> {
        self.0.remove(&class)
    }

    /// Rescales weights to sum to 1. A plan with no weight becomes empty.
    pub fn renormalize(&mut self) {
        let total = self.total();
        if total > 0.0 && total.is_finite() {
            for w in self.0.values_mut() {
                *w /= total;
            }
        } else {
            self.0.clear();
        }
    }

    fn scale(&mut self, class: AssetClass, factor: f64) {
        if let Some(w) = self.0.get_mut(&class) {
            *w *= factor;
        }
    }

    fn scale_capped(&mut self, class: AssetClass, factor: f64, cap: f64) {
        if let Some(w) = self.0.get_mut(&class) {
            *w = (*w * factor).min(cap);
        }
    }

    fn raise_with_floor(&mut self, class: AssetClass, add: f64, floor: f64) {
        if let Some(w) = self.0.get_mut(&class) {
            *w = (*w + add).max(floor);
        }
    }
}

pub fn base_allocation(risk_type: RiskType) -> AllocationPlan {
    use AssetClass::*;
    let row = match risk_type {
        RiskType::Conservative => [0.20, 0.35, 0.35, 0.05, 0.05],
        RiskType::Moderate => [0.40, 0.30, 0.20, 0.10, 0.00],
        RiskType::Aggressive => [0.55, 0.25, 0.10, 0.10, 0.00],
        RiskType::VeryAggressive => [0.60, 0.15, 0.05, 0.20, 0.00],
    };
    AllocationPlan::from_weights([Stock, Etf, MutualFund, Crypto, Bond].into_iter().zip(row))
}

/// Base matrix adjusted for horizon and return target, normalized to 1.
/// `expected_return` is an annual fraction.
pub fn strategic_allocation(risk_type: RiskType, years: u32, expected_return: f64) -> AllocationPlan {
    use AssetClass::*;
    let mut plan = base_allocation(risk_type);

    if years > 15 {
        tracing::debug!(years, "long horizon: tilting towards equity");
        plan.scale_capped(Stock, 1.1, 0.70);
        plan.scale_capped(Etf, 1.1, 0.40);
        plan.scale(MutualFund, 0.9);
        plan.scale(Bond, 0.8);
    } else if years < 5 {
        tracing::debug!(years, "short horizon: reducing volatility");
        plan.scale(Stock, 0.8);
        plan.scale(Crypto, 0.5);
        plan.scale_capped(MutualFund, 1.2, 0.50);
        plan.raise_with_floor(Bond, 0.05, 0.10);
    }
    plan.renormalize();

    if expected_return > 0.20 {
        tracing::debug!(expected_return, "aggressive return target");
        plan.scale_capped(Stock, 1.3, 0.70);
        plan.scale_capped(Crypto, 1.5, 0.25);
        plan.scale(Bond, 0.5);
        plan.scale(MutualFund, 0.8);
    } else if expected_return > 0.15 {
        tracing::debug!(expected_return, "high return target");
        plan.scale_capped(Stock, 1.15, 0.60);
        plan.scale_capped(Etf, 1.1, 0.40);
        plan.scale(MutualFund, 0.9);
    } else if expected_return < 0.08 {
        tracing::debug!(expected_return, "conservative return target");
        plan.scale_capped(MutualFund, 1.2, 0.50);
        plan.raise_with_floor(Bond, 0.10, 0.15);
        plan.scale(Stock, 0.8);
        plan.scale(Crypto, 0.5);
    }
    plan.renormalize();
    plan
}

/// Drops excluded classes and renormalizes what remains.
pub fn apply_exclusions(mut plan: AllocationPlan, excluded: &BTreeSet<AssetClass>) -> AllocationPlan {
    if excluded.is_empty() {
        return plan;
    }
    for class in excluded {
        plan.remove(*class);
    }
    plan.renormalize();
    if plan.is_empty() {
        tracing::warn!(excluded = ?excluded, "exclusions removed every funded asset class");
    }
    plan
}

/// Full allocation for a validated profile.
pub fn asset_allocation(profile: &UserProfile) -> AllocationPlan {
    let plan = strategic_allocation(profile.risk_type(), profile.years(), profile.expected_return());
    apply_exclusions(plan, &profile.excluded_classes())
}

/// Weighted combination of per-class return estimates.
pub fn expected_plan_return(plan: &AllocationPlan, class_returns: &BTreeMap<AssetClass, f64>) -> f64 {
    plan.iter()
        .map(|(c, w)| w * class_returns.get(&c).copied().unwrap_or(0.0))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::profile::Exclusion;
    use approx::assert_abs_diff_eq;

    const RISK_TYPES: [RiskType; 4] = [
        RiskType::Conservative,
        RiskType::Moderate,
        RiskType::Aggressive,
        RiskType::VeryAggressive,
    ];

    #[test]
    fn weights_sum_to_one_for_every_profile() {
        for risk_type in RISK_TYPES {
            for years in [1, 4, 5, 10, 15, 16, 30] {
                for ret in [0.02, 0.079, 0.08, 0.12, 0.15, 0.18, 0.20, 0.35] {
                    let plan = strategic_allocation(risk_type, years, ret);
                    assert_abs_diff_eq!(plan.total(), 1.0, epsilon = 1e-9);
                    assert!(plan.iter().all(|(_, w)| w >= 0.0));
                    assert_eq!(plan.len(), 5);
                }
            }
        }
    }

    #[test]
    fn partial_exclusions_keep_sum_at_one() {
        let all: Vec<AssetClass> = AssetClass::ALL.to_vec();
        for risk_type in RISK_TYPES {
            for mask in 1u32..(1 << all.len()) {
                let excluded: BTreeSet<AssetClass> = all
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| mask & (1 << i) != 0)
                    .map(|(_, c)| *c)
                    .collect();
                let plan = apply_exclusions(strategic_allocation(risk_type, 8, 0.1), &excluded);
                for class in &excluded {
                    assert!(!plan.contains(*class));
                }
                if !plan.is_empty() {
                    assert_abs_diff_eq!(plan.total(), 1.0, epsilon = 1e-9);
                }
            }
        }
    }

    #[test]
    fn moderate_mid_horizon_keeps_base_matrix() {
        let profile = UserProfile::new(100_000.0, 50, 5, 0.12, vec![]).unwrap();
        let plan = asset_allocation(&profile);

        assert_abs_diff_eq!(plan.weight(AssetClass::Stock), 0.40, epsilon = 1e-12);
        assert_abs_diff_eq!(plan.weight(AssetClass::Etf), 0.30, epsilon = 1e-12);
        assert_abs_diff_eq!(plan.weight(AssetClass::MutualFund), 0.20, epsilon = 1e-12);
        assert_abs_diff_eq!(plan.weight(AssetClass::Crypto), 0.10, epsilon = 1e-12);
        assert_eq!(plan.weight(AssetClass::Bond), 0.0);
        assert!(plan.contains(AssetClass::Bond));
    }

    #[test]
    fn crypto_exclusion_renormalizes_remaining_classes() {
        let profile = UserProfile::new(
            100_000.0,
            50,
            5,
            0.12,
            vec![Exclusion::Class(AssetClass::Crypto)],
        )
        .unwrap();
        let plan = asset_allocation(&profile);

        assert!(!plan.contains(AssetClass::Crypto));
        assert_abs_diff_eq!(plan.weight(AssetClass::Stock), 0.4 / 0.9, epsilon = 1e-12);
        assert_abs_diff_eq!(plan.weight(AssetClass::Etf), 0.3 / 0.9, epsilon = 1e-12);
        assert_abs_diff_eq!(plan.weight(AssetClass::MutualFund), 0.2 / 0.9, epsilon = 1e-12);
        assert_eq!(plan.weight(AssetClass::Bond), 0.0);
        assert_abs_diff_eq!(plan.total(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn excluding_every_funded_class_empties_the_plan() {
        let excluded: BTreeSet<AssetClass> = [
            AssetClass::Stock,
            AssetClass::Etf,
            AssetClass::MutualFund,
            AssetClass::Crypto,
        ]
        .into_iter()
        .collect();
        let plan = apply_exclusions(strategic_allocation(RiskType::Moderate, 10, 0.12), &excluded);
        assert!(plan.is_empty());
        assert_eq!(plan.funded().count(), 0);
    }

    #[test]
    fn short_horizon_shifts_towards_bonds() {
        let base = strategic_allocation(RiskType::Moderate, 10, 0.12);
        let short = strategic_allocation(RiskType::Moderate, 2, 0.12);
        assert!(short.weight(AssetClass::Bond) > base.weight(AssetClass::Bond));
        assert!(short.weight(AssetClass::Crypto) < base.weight(AssetClass::Crypto));
        assert!(short.weight(AssetClass::Stock) < base.weight(AssetClass::Stock));
    }

    #[test]
    fn long_horizon_and_high_target_tilt_towards_stocks() {
        let base = strategic_allocation(RiskType::Conservative, 10, 0.12);
        let long = strategic_allocation(RiskType::Conservative, 20, 0.12);
        assert!(long.weight(AssetClass::Stock) > base.weight(AssetClass::Stock));

        let aggressive_target = strategic_allocation(RiskType::Conservative, 10, 0.25);
        assert!(aggressive_target.weight(AssetClass::Crypto) > base.weight(AssetClass::Crypto));
        assert!(aggressive_target.weight(AssetClass::Bond) < base.weight(AssetClass::Bond));
    }

    #[test]
    fn low_return_target_raises_bond_floor() {
        let plan = strategic_allocation(RiskType::VeryAggressive, 10, 0.05);
        // 0.15 bond floor before the final renormalization.
        assert!(plan.weight(AssetClass::Bond) > 0.12);
    }

    #[test]
    fn allocation_is_deterministic() {
        let a = strategic_allocation(RiskType::Aggressive, 3, 0.22);
        let b = strategic_allocation(RiskType::Aggressive, 3, 0.22);
        assert_eq!(a, b);
    }

    #[test]
    fn plan_serializes_as_class_map() {
        let plan = base_allocation(RiskType::Moderate);
        let v = serde_json::to_value(&plan).unwrap();
        assert_eq!(v["stock"], serde_json::json!(0.4));
        assert_eq!(v["bond"], serde_json::json!(0.0));
    }
}
