use super::MeanVariance;
use crate::error::PortfolioError;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use std::collections::BTreeMap;

/// Parametric (Gaussian) Value-at-Risk, reported as a positive magnitude:
/// `|amount × (r + z·σ)|` with `z = Φ⁻¹(1 − confidence)`.
pub fn calculate_var(
    weights: &[f64],
    returns: &[f64],
    cov_matrix: &[Vec<f64>],
    confidence_level: f64,
    investment_amount: f64,
) -> Result<f64, PortfolioError> {
    if !(confidence_level > 0.0 && confidence_level < 1.0) {
        return Err(PortfolioError::InvalidInput(format!(
            "confidence_level must be in (0, 1) (got {confidence_level})"
        )));
    }
    if !investment_amount.is_finite() {
        return Err(PortfolioError::InvalidInput(
            "investment_amount must be finite".to_string(),
        ));
    }
    let mv = MeanVariance::new(returns, cov_matrix)?;
    let w = mv.weights_vector(weights)?;

    let normal = Normal::new(0.0, 1.0)
        .map_err(|e| PortfolioError::InvalidInput(format!("standard normal: {e}")))?;
    let z = normal.inverse_cdf(1.0 - confidence_level);

    let portfolio_return = mv.portfolio_return(&w);
    let portfolio_std = mv.portfolio_variance(&w).max(0.0).sqrt();
    Ok((investment_amount * (portfolio_return + z * portfolio_std)).abs())
}

/// Sample statistics of simple returns derived from price histories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovarianceEstimate {
    /// Asset order for both `expected_returns` and `covariance`.
    pub symbols: Vec<String>,
    /// Mean simple return per period.
    pub expected_returns: Vec<f64>,
    pub covariance: Vec<Vec<f64>>,
    /// Return observations used per asset after truncation.
    pub observations: usize,
}

impl CovarianceEstimate {
    /// Scales per-period statistics to a longer period (252 for daily data).
    pub fn annualize(&self, periods_per_year: f64) -> Self {
        Self {
            symbols: self.symbols.clone(),
            expected_returns: self
                .expected_returns
                .iter()
                .map(|r| r * periods_per_year)
                .collect(),
            covariance: self
                .covariance
                .iter()
                .map(|row| row.iter().map(|c| c * periods_per_year).collect())
                .collect(),
            observations: self.observations,
        }
    }
}

/// Percentage change between consecutive prices. Fewer than two prices yields
/// a single zero return; a zero previous price contributes a zero return.
pub fn simple_returns(prices: &[f64]) -> Vec<f64> {
    if prices.len() < 2 {
        return vec![0.0];
    }
    prices
        .windows(2)
        .map(|w| if w[0] == 0.0 { 0.0 } else { w[1] / w[0] - 1.0 })
        .collect()
}

/// Sample covariance (n − 1 denominator) of simple returns, with every series
/// truncated to the shortest one. Symbols come out sorted.
pub fn estimate_covariance(
    prices: &BTreeMap<String, Vec<f64>>,
) -> Result<CovarianceEstimate, PortfolioError> {
    if prices.is_empty() {
        return Err(PortfolioError::InvalidInput(
            "at least one price series is required".to_string(),
        ));
    }
    if prices.values().flatten().any(|p| !p.is_finite()) {
        return Err(PortfolioError::InvalidInput(
            "prices must be finite numbers".to_string(),
        ));
    }

    let series: Vec<Vec<f64>> = prices.values().map(|p| simple_returns(p)).collect();
    let len = series.iter().map(Vec::len).min().unwrap_or(0);
    // Keep the earliest `len` observations of each series.
    let series: Vec<&[f64]> = series.iter().map(|s| &s[..len]).collect();

    let means: Vec<f64> = series
        .iter()
        .map(|s| if len == 0 { 0.0 } else { s.iter().sum::<f64>() / len as f64 })
        .collect();

    let n = series.len();
    let mut covariance = vec![vec![0.0; n]; n];
    if len >= 2 {
        for i in 0..n {
            for j in i..n {
                let c = series[i]
                    .iter()
                    .zip(series[j])
                    .map(|(a, b)| (a - means[i]) * (b - means[j]))
                    .sum::<f64>()
                    / (len as f64 - 1.0);
                covariance[i][j] = c;
                covariance[j][i] = c;
            }
        }
    }

    tracing::debug!(assets = n, observations = len, "estimated covariance");
    Ok(CovarianceEstimate {
        symbols: prices.keys().cloned().collect(),
        expected_returns: means,
        covariance,
        observations: len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn single_asset_var_matches_closed_form() {
        let var = calculate_var(&[1.0], &[0.10], &[vec![0.04]], 0.95, 100_000.0).unwrap();
        // z(0.05) = -1.6448536...
        assert_abs_diff_eq!(var, 22_897.07, epsilon = 1.0);
        assert!((var - 22_900.0).abs() < 10.0);
    }

    #[test]
    fn var_rejects_bad_inputs() {
        assert!(calculate_var(&[1.0], &[0.1], &[vec![0.04]], 1.0, 1.0).is_err());
        assert!(calculate_var(&[0.5, 0.5], &[0.1], &[vec![0.04]], 0.95, 1.0).is_err());
    }

    #[test]
    fn var_grows_with_confidence() {
        let w = [0.6, 0.4];
        let r = [0.08, 0.12];
        let cov = vec![vec![0.04, 0.01], vec![0.01, 0.09]];
        let v95 = calculate_var(&w, &r, &cov, 0.95, 1_000.0).unwrap();
        let v99 = calculate_var(&w, &r, &cov, 0.99, 1_000.0).unwrap();
        assert!(v99 > v95);
    }

    #[test]
    fn covariance_of_known_series() {
        let mut prices = BTreeMap::new();
        prices.insert("A".to_string(), vec![100.0, 110.0, 99.0, 108.9]);
        prices.insert("B".to_string(), vec![50.0, 55.0, 49.5, 54.45]);
        let est = estimate_covariance(&prices).unwrap();

        assert_eq!(est.symbols, vec!["A", "B"]);
        assert_eq!(est.observations, 3);
        // Returns: +10%, -10%, +10% for both.
        let mean: f64 = 0.1 / 3.0;
        let var = ((0.1 - mean).powi(2) * 2.0 + (-0.1 - mean).powi(2)) / 2.0;
        assert_abs_diff_eq!(est.expected_returns[0], mean, epsilon = 1e-12);
        assert_abs_diff_eq!(est.covariance[0][0], var, epsilon = 1e-12);
        assert_abs_diff_eq!(est.covariance[0][1], var, epsilon = 1e-12);
        assert_abs_diff_eq!(est.covariance[1][0], est.covariance[0][1], epsilon = 0.0);
    }

    #[test]
    fn truncates_to_shortest_series() {
        let mut prices = BTreeMap::new();
        prices.insert("LONG".to_string(), vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        prices.insert("SHORT".to_string(), vec![10.0, 11.0, 12.1]);
        let est = estimate_covariance(&prices).unwrap();
        assert_eq!(est.observations, 2);
        assert_eq!(est.covariance.len(), 2);
        // LONG returns are 100%, 50%, 33%, 25%; the first two are kept.
        assert_abs_diff_eq!(est.expected_returns[0], 0.75, epsilon = 1e-12);
        assert_abs_diff_eq!(est.covariance[0][0], 0.125, epsilon = 1e-12);
        assert_abs_diff_eq!(est.expected_returns[1], 0.1, epsilon = 1e-12);
    }

    #[test]
    fn short_series_degenerate_to_zero_returns() {
        assert_eq!(simple_returns(&[]), vec![0.0]);
        assert_eq!(simple_returns(&[42.0]), vec![0.0]);
        assert_eq!(simple_returns(&[0.0, 5.0]), vec![0.0]);

        let mut prices = BTreeMap::new();
        prices.insert("ONE".to_string(), vec![100.0]);
        prices.insert("TWO".to_string(), vec![100.0, 101.0, 102.0]);
        let est = estimate_covariance(&prices).unwrap();
        assert_eq!(est.observations, 1);
        assert_eq!(est.covariance, vec![vec![0.0; 2]; 2]);
    }

    #[test]
    fn annualize_scales_moments() {
        let est = CovarianceEstimate {
            symbols: vec!["A".into()],
            expected_returns: vec![0.001],
            covariance: vec![vec![0.0001]],
            observations: 10,
        };
        let yearly = est.annualize(252.0);
        assert_abs_diff_eq!(yearly.expected_returns[0], 0.252, epsilon = 1e-12);
        assert_abs_diff_eq!(yearly.covariance[0][0], 0.0252, epsilon = 1e-12);
    }

    #[test]
    fn rejects_empty_and_non_finite_prices() {
        assert!(estimate_covariance(&BTreeMap::new()).is_err());
        let mut prices = BTreeMap::new();
        prices.insert("X".to_string(), vec![1.0, f64::NAN]);
        assert!(estimate_covariance(&prices).is_err());
    }
}
