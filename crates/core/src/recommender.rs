//! Top-level recommendation pipeline: allocation plan, per-class asset
//! selection, equal-weight sizing, then portfolio analytics.

use crate::allocation::{self, AllocationPlan};
use crate::config::RecommenderConfig;
use crate::domain::asset::{AssetClass, AssetSummary};
use crate::domain::profile::UserProfile;
use crate::domain::recommendation::{PortfolioItem, PortfolioMetrics, Recommendation};
use crate::error::PortfolioError;
use crate::selector::AssetSelector;
use crate::universe::AssetUniverse;
use std::collections::{BTreeMap, BTreeSet};

/// Sectors beyond this count add nothing to the diversification score.
const SECTOR_SPREAD_TARGET: f64 = 4.0;
const CLASS_SPREAD_TARGET: f64 = 4.0;

pub struct Recommender<U> {
    selector: AssetSelector<U>,
    config: RecommenderConfig,
}

impl<U: AssetUniverse> Recommender<U> {
    pub fn new(universe: U, config: RecommenderConfig) -> Self {
        Self {
            selector: AssetSelector::new(universe),
            config,
        }
    }

    pub fn config(&self) -> &RecommenderConfig {
        &self.config
    }

    pub fn universe(&self) -> &U {
        self.selector.universe()
    }

    pub fn generate_recommendation(
        &self,
        profile: &UserProfile,
    ) -> Result<Recommendation, PortfolioError> {
        let risk_type = profile.risk_type();
        let target = allocation::asset_allocation(profile);
        tracing::info!(
            risk_type = %risk_type,
            years = profile.years(),
            expected_return = profile.expected_return(),
            plan = ?target,
            "strategic allocation"
        );

        if target.is_empty() {
            tracing::error!("no asset class left to invest in");
            return Err(PortfolioError::EmptyPortfolio(
                "exclusions leave no asset class to invest in".to_string(),
            ));
        }

        let mut selections: BTreeMap<AssetClass, Vec<AssetSummary>> = BTreeMap::new();
        let mut skipped_classes = Vec::new();

        for (class, weight) in target.funded() {
            let limit = self.config.selection_count(class, weight);
            let min_score = self.config.min_score(risk_type, class);
            let caps = self.config.sector_caps_for(risk_type, class);

            let selected = match self.selector.select_filtered(
                class,
                limit,
                min_score,
                caps.as_ref(),
                |a| !profile.excludes_sector(a.sector.as_deref()),
            ) {
                Ok(selected) => selected,
                Err(err) => {
                    let provider = self.selector.universe().provider_name();
                    tracing::error!(
                        class = %class,
                        provider,
                        error = %format!("{err:#}"),
                        "asset universe query failed"
                    );
                    return Err(PortfolioError::UniverseUnavailable(format!(
                        "{provider} failed to list {class} assets: {err:#}"
                    )));
                }
            };

            if selected.is_empty() {
                tracing::warn!(class = %class, min_score, "no assets meet criteria; dropping class");
                skipped_classes.push(class);
                continue;
            }
            tracing::info!(class = %class, weight, limit, selected = selected.len(), min_score, "selected assets");
            selections.insert(class, selected);
        }

        if selections.is_empty() {
            tracing::error!(skipped = ?skipped_classes, "no holdings selected for any asset class");
            return Err(PortfolioError::EmptyPortfolio(format!(
                "no assets met the selection criteria for {} risk profile",
                risk_type
            )));
        }

        // Weight of dropped classes is spread over the classes that were filled.
        let mut funded = AllocationPlan::from_weights(
            selections.keys().map(|c| (*c, target.weight(*c))),
        );
        funded.renormalize();

        let capital = profile.capital();
        let portfolio: BTreeMap<AssetClass, Vec<PortfolioItem>> = selections
            .into_iter()
            .map(|(class, assets)| {
                let share = funded.weight(class) / assets.len() as f64;
                let items = assets
                    .into_iter()
                    .map(|a| PortfolioItem::from_asset(a, capital * share, share))
                    .collect();
                (class, items)
            })
            .collect();

        let metrics = self.portfolio_metrics(&funded, &portfolio, profile);
        let sector_allocation = sector_allocation(portfolio.values().flatten());
        let summary = summarize(profile, &portfolio, &metrics);

        tracing::info!(
            holdings = portfolio.values().map(Vec::len).sum::<usize>(),
            classes = portfolio.len(),
            expected_return = metrics.expected_return,
            expected_risk = metrics.expected_risk,
            sharpe = metrics.sharpe_ratio,
            "recommendation generated"
        );

        Ok(Recommendation {
            profile: profile.clone(),
            target_allocation: target,
            allocation: funded,
            portfolio,
            skipped_classes,
            sector_allocation,
            metrics,
            summary,
        })
    }

    fn portfolio_metrics(
        &self,
        funded: &AllocationPlan,
        portfolio: &BTreeMap<AssetClass, Vec<PortfolioItem>>,
        profile: &UserProfile,
    ) -> PortfolioMetrics {
        let expected_return = allocation::expected_plan_return(funded, &self.config.class_returns);
        // Classes treated as uncorrelated.
        let expected_risk = funded
            .iter()
            .map(|(c, w)| (w * self.config.class_risk(c)).powi(2))
            .sum::<f64>()
            .sqrt();

        let (sharpe_ratio, risk_adjusted_return) = if expected_risk > 0.0 {
            (
                (expected_return - self.config.risk_free_rate) / expected_risk,
                expected_return / expected_risk,
            )
        } else {
            (0.0, 0.0)
        };

        PortfolioMetrics {
            expected_return,
            expected_risk,
            sharpe_ratio,
            risk_adjusted_return,
            diversification_score: diversification_score(portfolio),
            projected_value: projected_value(profile.capital(), expected_return, profile.years()),
        }
    }
}

/// Share of capital per sector label; holdings without a sector go to "Unknown".
pub fn sector_allocation<'a>(items: impl IntoIterator<Item = &'a PortfolioItem>) -> BTreeMap<String, f64> {
    let mut out = BTreeMap::new();
    for item in items {
        let label = item
            .sector
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("Unknown");
        *out.entry(label.to_string()).or_insert(0.0) += item.allocation_percentage;
    }
    out
}

/// 0-10 score: 40% sector spread, 40% concentration, 20% asset-class spread.
pub fn diversification_score(portfolio: &BTreeMap<AssetClass, Vec<PortfolioItem>>) -> f64 {
    let items: Vec<&PortfolioItem> = portfolio.values().flatten().collect();
    if items.is_empty() {
        return 0.0;
    }

    let sectors: BTreeSet<&str> = items
        .iter()
        .filter_map(|i| i.sector.as_deref().map(str::trim).filter(|s| !s.is_empty()))
        .collect();
    let sector_spread = (sectors.len() as f64 / SECTOR_SPREAD_TARGET).min(1.0);

    let equal_share = 1.0 / items.len() as f64;
    let max_share = items
        .iter()
        .map(|i| i.allocation_percentage)
        .fold(0.0, f64::max);
    let concentration = (1.0 - (max_share - equal_share)).clamp(0.0, 1.0);

    let classes = portfolio.values().filter(|v| !v.is_empty()).count();
    let class_spread = (classes as f64 / CLASS_SPREAD_TARGET).min(1.0);

    let score = (0.4 * sector_spread + 0.4 * concentration + 0.2 * class_spread) * 10.0;
    (score * 10.0).round() / 10.0
}

/// Capital compounded annually at `annual_return` for `years`.
pub fn projected_value(capital: f64, annual_return: f64, years: u32) -> f64 {
    capital * (1.0 + annual_return).powi(years as i32)
}

fn summarize(
    profile: &UserProfile,
    portfolio: &BTreeMap<AssetClass, Vec<PortfolioItem>>,
    metrics: &PortfolioMetrics,
) -> String {
    let holdings: usize = portfolio.values().map(Vec::len).sum();
    let classes: Vec<&str> = portfolio.keys().map(|c| c.label()).collect();
    format!(
        "Your {risk} portfolio has been created for {years}-year {goal} with a capital of {capital:.0}. \
         Expected performance: annual return {ret:.2}%, portfolio risk {risk_pct:.2}%, Sharpe ratio {sharpe:.2}. \
         The portfolio holds {holdings} investments across {n} asset classes ({class_list}), \
         with a diversification score of {div:.1}/10 and a projected value of {projected:.0} after {years} years.",
        risk = profile.risk_type().description(),
        years = profile.years(),
        goal = profile.goal().description(),
        capital = profile.capital(),
        ret = metrics.expected_return * 100.0,
        risk_pct = metrics.expected_risk * 100.0,
        sharpe = metrics.sharpe_ratio,
        n = classes.len(),
        class_list = classes.join(", "),
        div = metrics.diversification_score,
        projected = metrics.projected_value,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::profile::Exclusion;
    use crate::scoring::ScoreBreakdown;
    use crate::universe::InMemoryUniverse;
    use approx::assert_abs_diff_eq;

    fn asset(symbol: &str, class: AssetClass, score: f64, sector: Option<&str>) -> AssetSummary {
        AssetSummary {
            symbol: symbol.to_string(),
            name: format!("{symbol} name"),
            class,
            sector: sector.map(str::to_string),
            score,
            breakdown: ScoreBreakdown::default(),
            details: BTreeMap::new(),
        }
    }

    /// 10 stocks, 5 ETFs, 5 mutual funds, 3 cryptos, all scoring at least 60.
    fn stub_universe() -> InMemoryUniverse {
        let sectors = [
            "Technology",
            "Healthcare",
            "Financial Services",
            "Energy",
            "Industrials",
        ];
        let mut assets = Vec::new();
        for i in 0..10 {
            assets.push(asset(
                &format!("STK{i}"),
                AssetClass::Stock,
                60.0 + i as f64 * 2.5,
                Some(sectors[i % sectors.len()]),
            ));
        }
        for i in 0..5 {
            assets.push(asset(&format!("ETF{i}"), AssetClass::Etf, 62.0 + i as f64, None));
            assets.push(asset(&format!("MF{i}"), AssetClass::MutualFund, 61.0 + i as f64, None));
        }
        for (i, sym) in ["BTC", "ETH", "SOL"].iter().enumerate() {
            assets.push(asset(sym, AssetClass::Crypto, 70.0 - i as f64, None));
        }
        InMemoryUniverse::new("stub", assets)
    }

    fn moderate_profile(exclusions: Vec<Exclusion>) -> UserProfile {
        UserProfile::new(100_000.0, 50, 5, 0.12, exclusions).unwrap()
    }

    #[test]
    fn moderate_profile_populates_every_funded_class() {
        let recommender = Recommender::new(stub_universe(), RecommenderConfig::default());
        let rec = recommender
            .generate_recommendation(&moderate_profile(vec![]))
            .unwrap();

        assert_abs_diff_eq!(rec.allocation.weight(AssetClass::Stock), 0.40, epsilon = 1e-9);
        assert_abs_diff_eq!(rec.allocation.weight(AssetClass::Etf), 0.30, epsilon = 1e-9);
        assert_abs_diff_eq!(rec.allocation.weight(AssetClass::MutualFund), 0.20, epsilon = 1e-9);
        assert_abs_diff_eq!(rec.allocation.weight(AssetClass::Crypto), 0.10, epsilon = 1e-9);
        assert_eq!(rec.target_allocation.weight(AssetClass::Bond), 0.0);

        for class in [AssetClass::Stock, AssetClass::Etf, AssetClass::MutualFund, AssetClass::Crypto] {
            assert!(!rec.portfolio[&class].is_empty(), "{class} should be populated");
        }
        assert!(!rec.portfolio.contains_key(&AssetClass::Bond));
        assert!(rec.skipped_classes.is_empty());

        assert_abs_diff_eq!(rec.total_allocated(), 100_000.0, epsilon = 1e-6);
        let pct: f64 = rec.holdings().map(|i| i.allocation_percentage).sum();
        assert_abs_diff_eq!(pct, 1.0, epsilon = 1e-9);

        // Equal weight within each class.
        let mfs = &rec.portfolio[&AssetClass::MutualFund];
        assert!(mfs.windows(2).all(|w| (w[0].allocation_amount - w[1].allocation_amount).abs() < 1e-9));
    }

    #[test]
    fn moderate_metrics_use_class_estimates() {
        let recommender = Recommender::new(stub_universe(), RecommenderConfig::default());
        let rec = recommender
            .generate_recommendation(&moderate_profile(vec![]))
            .unwrap();

        let expected_return = 0.4 * 0.15 + 0.3 * 0.12 + 0.2 * 0.11 + 0.1 * 0.25;
        let expected_risk = ((0.4f64 * 0.20).powi(2)
            + (0.3f64 * 0.15).powi(2)
            + (0.2f64 * 0.12).powi(2)
            + (0.1f64 * 0.60).powi(2))
        .sqrt();
        assert_abs_diff_eq!(rec.metrics.expected_return, expected_return, epsilon = 1e-9);
        assert_abs_diff_eq!(rec.metrics.expected_risk, expected_risk, epsilon = 1e-9);
        assert_abs_diff_eq!(
            rec.metrics.sharpe_ratio,
            (expected_return - 0.06) / expected_risk,
            epsilon = 1e-9
        );
        assert_abs_diff_eq!(
            rec.metrics.projected_value,
            100_000.0 * (1.0 + expected_return).powi(5),
            epsilon = 1e-6
        );
        assert!(rec.metrics.diversification_score > 0.0 && rec.metrics.diversification_score <= 10.0);
        assert!(rec.summary.contains("balanced with moderate risk"));
        assert!(rec.summary.contains("wealth creation"));
    }

    #[test]
    fn crypto_exclusion_removes_class() {
        let recommender = Recommender::new(stub_universe(), RecommenderConfig::default());
        let rec = recommender
            .generate_recommendation(&moderate_profile(vec![Exclusion::Class(AssetClass::Crypto)]))
            .unwrap();

        assert!(!rec.portfolio.contains_key(&AssetClass::Crypto));
        assert!(!rec.target_allocation.contains(AssetClass::Crypto));
        assert_abs_diff_eq!(rec.target_allocation.weight(AssetClass::Stock), 0.4 / 0.9, epsilon = 1e-9);
        assert_abs_diff_eq!(rec.target_allocation.total(), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(rec.total_allocated(), 100_000.0, epsilon = 1e-6);
    }

    #[test]
    fn sector_exclusion_filters_holdings() {
        let recommender = Recommender::new(stub_universe(), RecommenderConfig::default());
        let rec = recommender
            .generate_recommendation(&moderate_profile(vec![Exclusion::Sector("technology".into())]))
            .unwrap();
        assert!(rec
            .holdings()
            .all(|i| i.sector.as_deref() != Some("Technology")));
    }

    #[test]
    fn identical_inputs_give_identical_outputs() {
        let recommender = Recommender::new(stub_universe(), RecommenderConfig::default());
        let profile = moderate_profile(vec![]);
        let a = recommender.generate_recommendation(&profile).unwrap();
        let b = recommender.generate_recommendation(&profile).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn class_without_eligible_assets_is_dropped_and_rest_rescaled() {
        let universe = InMemoryUniverse::new(
            "thin",
            vec![
                asset("AAA", AssetClass::Stock, 80.0, None),
                asset("BBB", AssetClass::Etf, 80.0, None),
                asset("LOWMF", AssetClass::MutualFund, 10.0, None),
            ],
        );
        let recommender = Recommender::new(universe, RecommenderConfig::default());
        let rec = recommender
            .generate_recommendation(&moderate_profile(vec![]))
            .unwrap();

        assert_eq!(rec.skipped_classes, vec![AssetClass::MutualFund, AssetClass::Crypto]);
        assert_eq!(rec.total_holdings(), 2);
        assert_abs_diff_eq!(rec.allocation.weight(AssetClass::Stock), 0.4 / 0.7, epsilon = 1e-9);
        assert_abs_diff_eq!(rec.total_allocated(), 100_000.0, epsilon = 1e-6);
    }

    #[test]
    fn no_qualifying_assets_is_an_empty_portfolio_error() {
        let universe = InMemoryUniverse::new(
            "weak",
            vec![
                asset("AAA", AssetClass::Stock, 10.0, None),
                asset("BBB", AssetClass::Etf, 20.0, None),
            ],
        );
        let recommender = Recommender::new(universe, RecommenderConfig::default());
        let err = recommender
            .generate_recommendation(&moderate_profile(vec![]))
            .unwrap_err();
        assert_eq!(err.kind(), "empty_portfolio");
    }

    #[test]
    fn excluding_all_funded_classes_is_an_empty_portfolio_error() {
        let exclusions = [AssetClass::Stock, AssetClass::Etf, AssetClass::MutualFund, AssetClass::Crypto]
            .into_iter()
            .map(Exclusion::Class)
            .collect();
        let recommender = Recommender::new(stub_universe(), RecommenderConfig::default());
        let err = recommender
            .generate_recommendation(&moderate_profile(exclusions))
            .unwrap_err();
        assert!(matches!(err, PortfolioError::EmptyPortfolio(_)));
    }

    struct FailingUniverse;

    impl AssetUniverse for FailingUniverse {
        fn provider_name(&self) -> &str {
            "postgres:asset_scores"
        }

        fn assets_by_class(&self, class: AssetClass) -> anyhow::Result<Vec<AssetSummary>> {
            anyhow::bail!("connection reset while reading {class}")
        }
    }

    #[test]
    fn universe_failure_is_not_reported_as_empty_portfolio() {
        let recommender = Recommender::new(FailingUniverse, RecommenderConfig::default());
        let err = recommender
            .generate_recommendation(&moderate_profile(vec![]))
            .unwrap_err();
        assert!(matches!(err, PortfolioError::UniverseUnavailable(_)), "{err}");
        assert_eq!(err.kind(), "universe_unavailable");
        assert!(err.reason().contains("connection reset"));
    }

    #[test]
    fn holdings_carry_signals_from_their_scores() {
        let recommender = Recommender::new(stub_universe(), RecommenderConfig::default());
        let rec = recommender
            .generate_recommendation(&moderate_profile(vec![]))
            .unwrap();
        for item in rec.holdings() {
            assert_eq!(item.signal, crate::scoring::signal(item.score, &item.breakdown));
            assert!((30.0..=95.0).contains(&item.signal.confidence));
        }
        // Crypto scores 68-70 with flat breakdowns: all buys.
        assert!(rec.portfolio[&AssetClass::Crypto]
            .iter()
            .all(|i| i.signal.action == crate::scoring::Action::Buy));
    }

    #[test]
    fn diversification_score_rewards_spread() {
        let item = |sector: &str, pct: f64, class: AssetClass| PortfolioItem {
            symbol: sector.to_string(),
            name: sector.to_string(),
            class,
            sector: Some(sector.to_string()),
            score: 60.0,
            breakdown: ScoreBreakdown::default(),
            signal: crate::scoring::signal(60.0, &ScoreBreakdown::default()),
            allocation_amount: pct * 100.0,
            allocation_percentage: pct,
        };
        let mut concentrated = BTreeMap::new();
        concentrated.insert(AssetClass::Stock, vec![item("Energy", 1.0, AssetClass::Stock)]);

        let mut spread = BTreeMap::new();
        spread.insert(
            AssetClass::Stock,
            vec![
                item("Energy", 0.25, AssetClass::Stock),
                item("Technology", 0.25, AssetClass::Stock),
            ],
        );
        spread.insert(
            AssetClass::Etf,
            vec![
                item("Healthcare", 0.25, AssetClass::Etf),
                item("Industrials", 0.25, AssetClass::Etf),
            ],
        );

        let low = diversification_score(&concentrated);
        let high = diversification_score(&spread);
        assert!(high > low);
        // 0.4 * 1 + 0.4 * 1 + 0.2 * 0.5
        assert_abs_diff_eq!(high, 9.0, epsilon = 1e-9);
        assert_eq!(diversification_score(&BTreeMap::new()), 0.0);

        let sectors = sector_allocation(spread.values().flatten());
        assert_abs_diff_eq!(sectors["Energy"], 0.25, epsilon = 1e-12);
    }
}
