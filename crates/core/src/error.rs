use std::fmt;

/// Failures that invalidate a whole request.
///
/// Per-class problems (a class with no qualifying assets) and solver
/// non-convergence are not errors: the first is logged and the class dropped,
/// the second is reported through `OptimizationResult::success`.
#[derive(Debug, Clone, PartialEq)]
pub enum PortfolioError {
    /// Capital, risk score or horizon outside their valid ranges.
    InvalidProfile(String),
    /// No holdings could be selected for any asset class.
    EmptyPortfolio(String),
    /// Malformed numeric input (dimension mismatch, non-finite values, ...).
    InvalidInput(String),
    /// The asset universe could not be queried.
    UniverseUnavailable(String),
}

impl PortfolioError {
    pub fn kind(&self) -> &'static str {
        match self {
            PortfolioError::InvalidProfile(_) => "invalid_profile",
            PortfolioError::EmptyPortfolio(_) => "empty_portfolio",
            PortfolioError::InvalidInput(_) => "invalid_input",
            PortfolioError::UniverseUnavailable(_) => "universe_unavailable",
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            PortfolioError::InvalidProfile(r)
            | PortfolioError::EmptyPortfolio(r)
            | PortfolioError::InvalidInput(r)
            | PortfolioError::UniverseUnavailable(r) => r,
        }
    }
}

impl fmt::Display for PortfolioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortfolioError::InvalidProfile(r) => write!(f, "invalid profile: {r}"),
            PortfolioError::EmptyPortfolio(r) => write!(f, "empty portfolio: {r}"),
            PortfolioError::InvalidInput(r) => write!(f, "invalid input: {r}"),
            PortfolioError::UniverseUnavailable(r) => write!(f, "asset universe unavailable: {r}"),
        }
    }
}

impl std::error::Error for PortfolioError {}
