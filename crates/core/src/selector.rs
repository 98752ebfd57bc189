//! Top-N asset selection per class with sector diversification.

use crate::domain::asset::{AssetClass, AssetSummary};
use crate::domain::profile::RiskType;
use crate::universe::AssetUniverse;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Maximum share of a selection any single sector may take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectorCaps {
    #[serde(default)]
    pub caps: BTreeMap<String, f64>,
    #[serde(default = "default_sector_cap")]
    pub default_cap: f64,
}

fn default_sector_cap() -> f64 {
    0.2
}

impl Default for SectorCaps {
    fn default() -> Self {
        Self {
            caps: BTreeMap::new(),
            default_cap: default_sector_cap(),
        }
    }
}

impl SectorCaps {
    pub fn for_risk_type(risk_type: RiskType) -> Self {
        let caps: &[(&str, f64)] = match risk_type {
            RiskType::Conservative | RiskType::Moderate => &[
                ("Technology", 0.25),
                ("Healthcare", 0.20),
                ("Financial Services", 0.20),
                ("Consumer Defensive", 0.15),
                ("Industrials", 0.10),
                ("Energy", 0.10),
            ],
            RiskType::Aggressive | RiskType::VeryAggressive => &[
                ("Technology", 0.35),
                ("Healthcare", 0.20),
                ("Financial Services", 0.15),
                ("Consumer Cyclical", 0.15),
                ("Communication Services", 0.15),
            ],
        };
        Self {
            caps: caps.iter().map(|(s, c)| (s.to_string(), *c)).collect(),
            default_cap: default_sector_cap(),
        }
    }

    pub fn cap(&self, sector: &str) -> f64 {
        self.caps.get(sector).copied().unwrap_or(self.default_cap)
    }

    /// Number of slots a sector may occupy out of `limit`: `floor(limit · cap)`.
    /// Small selections can leave a tightly capped sector with no slot at all.
    pub fn max_count(&self, sector: &str, limit: usize) -> usize {
        let cap = self.cap(sector);
        if cap.is_nan() || cap <= 0.0 {
            return 0;
        }
        (limit as f64 * cap).floor() as usize
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.default_cap),
            "default sector cap must be within [0, 1]"
        );
        for (sector, cap) in &self.caps {
            anyhow::ensure!(
                (0.0..=1.0).contains(cap),
                "sector cap for {sector} must be within [0, 1]"
            );
        }
        Ok(())
    }
}

/// Sectors that are never capped: missing, blank, "Unknown" and "Other".
pub fn is_unclassified_sector(sector: Option<&str>) -> bool {
    match sector.map(str::trim) {
        None | Some("") => true,
        Some(s) => s.eq_ignore_ascii_case("unknown") || s.eq_ignore_ascii_case("other"),
    }
}

fn symbol_prefix(symbol: &str) -> &str {
    match symbol.char_indices().nth(3) {
        Some((idx, _)) => &symbol[..idx],
        None => symbol,
    }
}

/// Picks at most `limit` assets of `class` scoring at least `min_score`.
///
/// Candidates are ranked by score (ties by symbol). Sector caps, when given,
/// are hard limits on known sectors. When more assets qualify than fit, a first
/// pass favors distinct symbol prefixes and, for small selections, unseen
/// sectors; remaining slots are filled in score order. Never pads with
/// sub-threshold assets, so the result may be shorter than `limit`.
pub fn select_top_assets(
    candidates: &[AssetSummary],
    class: AssetClass,
    limit: usize,
    min_score: f64,
    sector_caps: Option<&SectorCaps>,
) -> Vec<AssetSummary> {
    if limit == 0 {
        return Vec::new();
    }

    let mut qualified: Vec<&AssetSummary> = candidates
        .iter()
        .filter(|a| a.class == class && a.score.is_finite() && a.score >= min_score)
        .collect();
    qualified.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.symbol.cmp(&b.symbol)));

    let mut seen_symbols = BTreeSet::new();
    qualified.retain(|&a| seen_symbols.insert(a.symbol.as_str()));

    let mut sector_counts: BTreeMap<&str, usize> = BTreeMap::new();
    let pool: Vec<&AssetSummary> = qualified
        .into_iter()
        .filter(|&a| {
            let Some(caps) = sector_caps else {
                return true;
            };
            let sector = a.sector.as_deref();
            if is_unclassified_sector(sector) {
                return true;
            }
            let sector = sector.unwrap_or_default().trim();
            let count = sector_counts.entry(sector).or_insert(0);
            if *count >= caps.max_count(sector, limit) {
                return false;
            }
            *count += 1;
            true
        })
        .collect();

    let mut picked = vec![false; pool.len()];
    if pool.len() > limit {
        let mut used_sectors = BTreeSet::new();
        let mut used_prefixes = BTreeSet::new();
        let mut n = 0;
        for (i, &asset) in pool.iter().enumerate() {
            if n >= limit {
                break;
            }
            let sector = asset.sector.as_deref();
            let known = !is_unclassified_sector(sector);
            if limit <= 5 && known && used_sectors.contains(&sector.map(str::trim)) {
                continue;
            }
            let prefix = symbol_prefix(&asset.symbol);
            if used_prefixes.contains(prefix) {
                continue;
            }
            if known {
                used_sectors.insert(sector.map(str::trim));
            }
            used_prefixes.insert(prefix);
            picked[i] = true;
            n += 1;
        }
    }

    let mut n = picked.iter().filter(|p| **p).count();
    for p in picked.iter_mut() {
        if n >= limit {
            break;
        }
        if !*p {
            *p = true;
            n += 1;
        }
    }

    // Pool is already in score order.
    pool.into_iter()
        .zip(picked)
        .filter(|(_, p)| *p)
        .map(|(a, _)| a.clone())
        .collect()
}

/// Selector bound to an asset universe.
pub struct AssetSelector<U> {
    universe: U,
}

impl<U: AssetUniverse> AssetSelector<U> {
    pub fn new(universe: U) -> Self {
        Self { universe }
    }

    pub fn universe(&self) -> &U {
        &self.universe
    }

    pub fn select_top_assets(
        &self,
        class: AssetClass,
        limit: usize,
        min_score: f64,
        sector_caps: Option<&SectorCaps>,
    ) -> anyhow::Result<Vec<AssetSummary>> {
        self.select_filtered(class, limit, min_score, sector_caps, |_| true)
    }

    /// Like [`Self::select_top_assets`], dropping candidates rejected by `keep`
    /// before ranking.
    pub fn select_filtered(
        &self,
        class: AssetClass,
        limit: usize,
        min_score: f64,
        sector_caps: Option<&SectorCaps>,
        keep: impl Fn(&AssetSummary) -> bool,
    ) -> anyhow::Result<Vec<AssetSummary>> {
        let mut candidates = self.universe.assets_by_class(class)?;
        candidates.retain(|a| keep(a));
        let selected = select_top_assets(&candidates, class, limit, min_score, sector_caps);
        tracing::debug!(
            provider = self.universe.provider_name(),
            class = %class,
            candidates = candidates.len(),
            selected = selected.len(),
            limit,
            min_score,
            "selected assets"
        );
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::ScoreBreakdown;
    use crate::universe::InMemoryUniverse;

    fn stock(symbol: &str, score: f64, sector: Option<&str>) -> AssetSummary {
        AssetSummary {
            symbol: symbol.to_string(),
            name: format!("{symbol} Ltd"),
            class: AssetClass::Stock,
            sector: sector.map(str::to_string),
            score,
            breakdown: ScoreBreakdown::default(),
            details: BTreeMap::new(),
        }
    }

    fn symbols(assets: &[AssetSummary]) -> Vec<&str> {
        assets.iter().map(|a| a.symbol.as_str()).collect()
    }

    #[test]
    fn never_returns_sub_threshold_assets() {
        // Deterministic pseudo-random score grid.
        let mut seed = 17u64;
        for round in 0..50 {
            let assets: Vec<AssetSummary> = (0..(round % 12))
                .map(|i| {
                    seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                    let score = (seed >> 33) as f64 % 101.0;
                    let sector = ["Technology", "Energy", "", "Other"][i % 4];
                    stock(&format!("S{round}X{i}"), score, Some(sector))
                })
                .collect();
            let caps = SectorCaps::for_risk_type(RiskType::Moderate);
            for caps in [None, Some(&caps)] {
                let out = select_top_assets(&assets, AssetClass::Stock, 5, 50.0, caps);
                assert!(out.len() <= 5);
                assert!(out.iter().all(|a| a.score >= 50.0));
            }
        }
    }

    #[test]
    fn returns_fewer_when_not_enough_qualify() {
        let assets = vec![
            stock("AAA", 70.0, None),
            stock("BBB", 40.0, None),
            stock("CCC", 55.0, None),
        ];
        let out = select_top_assets(&assets, AssetClass::Stock, 5, 50.0, None);
        assert_eq!(symbols(&out), vec!["AAA", "CCC"]);
    }

    #[test]
    fn ignores_other_classes_and_duplicates() {
        let mut etf = stock("NIFTY", 90.0, None);
        etf.class = AssetClass::Etf;
        let assets = vec![etf, stock("AAA", 70.0, None), stock("AAA", 65.0, None)];
        let out = select_top_assets(&assets, AssetClass::Stock, 5, 0.0, None);
        assert_eq!(symbols(&out), vec!["AAA"]);
        assert_eq!(out[0].score, 70.0);
    }

    #[test]
    fn sector_caps_limit_known_sectors() {
        let assets: Vec<AssetSummary> = (0..10)
            .map(|i| stock(&format!("T{i:02}"), 90.0 - i as f64, Some("Technology")))
            .chain((0..10).map(|i| stock(&format!("U{i:02}"), 60.0 - i as f64, None)))
            .collect();
        let caps = SectorCaps::for_risk_type(RiskType::Conservative);

        let out = select_top_assets(&assets, AssetClass::Stock, 8, 0.0, Some(&caps));
        let tech = out.iter().filter(|a| a.sector.as_deref() == Some("Technology")).count();
        assert_eq!(out.len(), 8);
        // floor(8 * 0.25)
        assert_eq!(tech, 2);
    }

    #[test]
    fn small_selection_prefers_distinct_sectors_and_prefixes() {
        let assets = vec![
            stock("XLKA", 95.0, Some("Technology")),
            stock("XLKB", 94.0, Some("Healthcare")),
            stock("INFY", 93.0, Some("Technology")),
            stock("HDFC", 92.0, Some("Financial Services")),
            stock("SUN", 91.0, Some("Healthcare")),
            stock("ONGC", 80.0, Some("Energy")),
        ];
        let out = select_top_assets(&assets, AssetClass::Stock, 3, 0.0, None);
        assert_eq!(symbols(&out), vec!["XLKA", "HDFC", "SUN"]);
    }

    #[test]
    fn fill_pass_tops_up_in_score_order() {
        let assets = vec![
            stock("ABC1", 90.0, Some("Energy")),
            stock("ABC2", 85.0, Some("Energy")),
            stock("ABC3", 80.0, Some("Energy")),
            stock("ABC4", 75.0, Some("Energy")),
        ];
        let out = select_top_assets(&assets, AssetClass::Stock, 3, 0.0, None);
        assert_eq!(symbols(&out), vec!["ABC1", "ABC2", "ABC3"]);
    }

    #[test]
    fn max_count_floors_limit_times_cap() {
        let caps = SectorCaps::for_risk_type(RiskType::Moderate);
        assert_eq!(caps.max_count("Energy", 3), 0);
        assert_eq!(caps.max_count("Energy", 10), 1);
        assert_eq!(caps.max_count("Technology", 8), 2);
        assert_eq!(caps.max_count("Materials", 10), 2);
        assert!(is_unclassified_sector(Some(" other ")));
        assert!(!is_unclassified_sector(Some("Energy")));
    }

    #[test]
    fn returned_sector_shares_never_exceed_caps() {
        let caps = SectorCaps::for_risk_type(RiskType::Moderate);

        let energy: Vec<AssetSummary> = (0..4)
            .map(|i| stock(&format!("NRG{i}"), 90.0 - i as f64, Some("Energy")))
            .collect();
        assert!(select_top_assets(&energy, AssetClass::Stock, 3, 0.0, Some(&caps)).is_empty());

        let sectors = [
            "Technology",
            "Healthcare",
            "Financial Services",
            "Energy",
            "Industrials",
            "Materials",
        ];
        let mixed: Vec<AssetSummary> = (0..24)
            .map(|i| stock(&format!("M{i:02}"), 99.0 - i as f64, Some(sectors[i % sectors.len()])))
            .collect();
        for limit in 1..=12 {
            let out = select_top_assets(&mixed, AssetClass::Stock, limit, 0.0, Some(&caps));
            let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
            for a in &out {
                *counts.entry(a.sector.as_deref().unwrap_or_default()).or_default() += 1;
            }
            for (sector, count) in counts {
                let share = count as f64 / limit as f64;
                assert!(
                    share <= caps.cap(sector),
                    "{sector} share {share:.3} exceeds cap {} at limit {limit}",
                    caps.cap(sector)
                );
            }
        }
    }

    #[test]
    fn selector_reads_from_universe() {
        let universe = InMemoryUniverse::new(
            "test",
            vec![stock("AAA", 70.0, None), stock("BBB", 60.0, None)],
        );
        let selector = AssetSelector::new(&universe);
        let out = selector.select_top_assets(AssetClass::Stock, 1, 50.0, None).unwrap();
        assert_eq!(symbols(&out), vec!["AAA"]);
        assert!(selector
            .select_top_assets(AssetClass::Crypto, 3, 0.0, None)
            .unwrap()
            .is_empty());
    }
}
