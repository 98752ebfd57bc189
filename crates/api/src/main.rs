use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use lumia_core::config::{RecommenderConfig, Settings};
use lumia_core::domain::contract::ProfileRequest;
use lumia_core::domain::recommendation::Recommendation;
use lumia_core::optimizer::{
    self, CovarianceEstimate, FrontierPoint, MeanVariance, OptimizationResult, Optimizer,
    DEFAULT_FRONTIER_POINTS,
};
use lumia_core::recommender::Recommender;
use lumia_core::universe::{AssetUniverse, InMemoryUniverse};
use lumia_core::PortfolioError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let config = settings.recommender_config()?;

    let pool: Option<PgPool> = match settings.require_database_url() {
        Ok(db_url) => match sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
        {
            Ok(pool) => match lumia_core::storage::migrate(&pool).await {
                Ok(()) => Some(pool),
                Err(e) => {
                    sentry_anyhow::capture_anyhow(&e);
                    tracing::error!(error = %e, "db migrations failed; starting API in degraded mode");
                    None
                }
            },
            Err(e) => {
                let err = anyhow::Error::new(e);
                sentry_anyhow::capture_anyhow(&err);
                tracing::error!(error = %err, "db connect failed; starting API in degraded mode");
                None
            }
        },
        Err(e) => {
            tracing::warn!(error = %e, "DATABASE_URL missing; starting API in degraded mode");
            None
        }
    };

    let state = AppState {
        pool,
        universe_path: settings.universe_path.clone(),
        config: Arc::new(config),
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/recommendations", post(create_recommendation))
        .route("/optimize", post(optimize))
        .route("/min-variance", post(min_variance))
        .route("/frontier", post(frontier))
        .route("/var", post(value_at_risk))
        .route("/covariance", post(covariance))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!(%addr, "api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Clone)]
struct AppState {
    pool: Option<PgPool>,
    universe_path: Option<String>,
    config: Arc<RecommenderConfig>,
}

#[derive(Debug)]
enum ApiError {
    Portfolio(PortfolioError),
    Unavailable(String),
    Internal(anyhow::Error),
}

impl From<PortfolioError> for ApiError {
    fn from(e: PortfolioError) -> Self {
        ApiError::Portfolio(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Portfolio(e) => {
                let status = match e {
                    PortfolioError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                    PortfolioError::InvalidProfile(_) | PortfolioError::EmptyPortfolio(_) => {
                        StatusCode::UNPROCESSABLE_ENTITY
                    }
                    PortfolioError::UniverseUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                };
                (
                    status,
                    ErrorBody {
                        error: e.reason().to_string(),
                        kind: e.kind(),
                    },
                )
            }
            ApiError::Unavailable(reason) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorBody {
                    error: reason,
                    kind: "unavailable",
                },
            ),
            ApiError::Internal(e) => {
                sentry_anyhow::capture_anyhow(&e);
                tracing::error!(error = %format!("{e:#}"), "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody {
                        error: "internal error".to_string(),
                        kind: "internal",
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

/// Latest stored snapshot when the database has one, otherwise the
/// configured universe file.
async fn load_universe(state: &AppState) -> Result<InMemoryUniverse, ApiError> {
    if let Some(pool) = &state.pool {
        if let Some((as_of_date, assets)) = lumia_core::storage::assets::load_latest_assets(pool).await? {
            return Ok(InMemoryUniverse::new(
                format!("postgres:asset_scores@{as_of_date}"),
                assets,
            ));
        }
        tracing::warn!("asset_scores is empty; falling back to universe file");
    }

    let Some(path) = state.universe_path.clone() else {
        return Err(ApiError::Unavailable(
            "no asset universe available (database empty or unreachable, LUMIA_UNIVERSE_PATH unset)"
                .to_string(),
        ));
    };
    let weights = state.config.scoring_weights;
    let universe = tokio::task::spawn_blocking(move || InMemoryUniverse::from_json_file(&path, &weights))
        .await
        .map_err(|e| ApiError::Internal(anyhow::Error::new(e)))??;
    Ok(universe)
}

#[derive(Debug, Serialize)]
struct RecommendationResponse {
    run_id: Option<Uuid>,
    generated_at: DateTime<Utc>,
    universe: String,
    recommendation: Recommendation,
}

async fn create_recommendation(
    State(state): State<AppState>,
    Json(req): Json<ProfileRequest>,
) -> Result<Json<RecommendationResponse>, ApiError> {
    let request_json = serde_json::to_value(&req).map_err(anyhow::Error::from)?;
    let profile = req.validate_and_into_profile()?;

    let universe = load_universe(&state).await?;
    let provider = universe.provider_name().to_string();
    let recommender = Recommender::new(universe, (*state.config).clone());
    let generated_at = Utc::now();

    match recommender.generate_recommendation(&profile) {
        Ok(recommendation) => {
            let run_id = match &state.pool {
                Some(pool) => persist_best_effort(
                    lumia_core::storage::recommendations::persist_success(
                        pool,
                        &recommendation,
                        request_json,
                        &provider,
                        generated_at,
                    )
                    .await,
                ),
                None => None,
            };
            Ok(Json(RecommendationResponse {
                run_id,
                generated_at,
                universe: provider,
                recommendation,
            }))
        }
        Err(err) => {
            if let Some(pool) = &state.pool {
                persist_best_effort(
                    lumia_core::storage::recommendations::persist_failure(
                        pool,
                        &err,
                        request_json,
                        &provider,
                        generated_at,
                    )
                    .await,
                );
            }
            tracing::warn!(kind = err.kind(), reason = err.reason(), "recommendation rejected");
            Err(err.into())
        }
    }
}

fn persist_best_effort(res: anyhow::Result<Uuid>) -> Option<Uuid> {
    match res {
        Ok(id) => Some(id),
        Err(e) => {
            sentry_anyhow::capture_anyhow(&e);
            tracing::error!(error = %format!("{e:#}"), "failed to persist recommendation run");
            None
        }
    }
}

/// Optimizer built from the configured solver settings, with the request's
/// risk-free rate when it gives one.
fn optimizer_for(state: &AppState, risk_free_rate: Option<f64>) -> Result<Optimizer, ApiError> {
    let mut config = state.config.optimizer_config();
    if let Some(rf) = risk_free_rate {
        config = config.with_risk_free_rate(rf);
    }
    config.validate()?;
    Ok(Optimizer::new(config))
}

/// Solves run on the blocking pool so long frontiers do not stall the runtime.
async fn solve_blocking<T, F>(solve: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, PortfolioError> + Send + 'static,
{
    let res = tokio::task::spawn_blocking(solve)
        .await
        .map_err(|e| ApiError::Internal(anyhow::Error::new(e)))?;
    Ok(res?)
}

#[derive(Debug, Deserialize)]
struct OptimizeRequest {
    returns: Vec<f64>,
    cov_matrix: Vec<Vec<f64>>,
    risk_free_rate: Option<f64>,
    target_return: Option<f64>,
}

async fn optimize(
    State(state): State<AppState>,
    Json(req): Json<OptimizeRequest>,
) -> Result<Json<OptimizationResult>, ApiError> {
    let optimizer = optimizer_for(&state, req.risk_free_rate)?;
    let result = solve_blocking(move || {
        let mv = MeanVariance::new(&req.returns, &req.cov_matrix)?;
        Ok(optimizer.optimize(&mv, req.target_return, None))
    })
    .await?;
    if !result.success {
        tracing::warn!(message = %result.message, "optimization did not succeed");
    }
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
struct MinVarianceRequest {
    returns: Vec<f64>,
    cov_matrix: Vec<Vec<f64>>,
    risk_free_rate: Option<f64>,
}

async fn min_variance(
    State(state): State<AppState>,
    Json(req): Json<MinVarianceRequest>,
) -> Result<Json<OptimizationResult>, ApiError> {
    let optimizer = optimizer_for(&state, req.risk_free_rate)?;
    let result = solve_blocking(move || {
        let mv = MeanVariance::new(&req.returns, &req.cov_matrix)?;
        Ok(optimizer.min_variance(&mv, None))
    })
    .await?;
    if !result.success {
        tracing::warn!(message = %result.message, "min-variance optimization did not succeed");
    }
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
struct FrontierRequest {
    returns: Vec<f64>,
    cov_matrix: Vec<Vec<f64>>,
    risk_free_rate: Option<f64>,
    n_points: Option<usize>,
}

#[derive(Debug, Serialize)]
struct FrontierResponse {
    points: Vec<FrontierPoint>,
}

const MAX_FRONTIER_POINTS: usize = 500;

async fn frontier(
    State(state): State<AppState>,
    Json(req): Json<FrontierRequest>,
) -> Result<Json<FrontierResponse>, ApiError> {
    let n_points = req.n_points.unwrap_or(DEFAULT_FRONTIER_POINTS);
    if n_points > MAX_FRONTIER_POINTS {
        return Err(PortfolioError::InvalidInput(format!(
            "n_points must be at most {MAX_FRONTIER_POINTS}"
        ))
        .into());
    }
    let optimizer = optimizer_for(&state, req.risk_free_rate)?;
    let points = solve_blocking(move || {
        let mv = MeanVariance::new(&req.returns, &req.cov_matrix)?;
        Ok(optimizer.efficient_frontier(&mv, n_points))
    })
    .await?;
    Ok(Json(FrontierResponse { points }))
}

#[derive(Debug, Deserialize)]
struct VarRequest {
    weights: Vec<f64>,
    returns: Vec<f64>,
    cov_matrix: Vec<Vec<f64>>,
    confidence_level: Option<f64>,
    investment_amount: Option<f64>,
}

#[derive(Debug, Serialize)]
struct VarResponse {
    var: f64,
    confidence_level: f64,
    investment_amount: f64,
}

async fn value_at_risk(Json(req): Json<VarRequest>) -> Result<Json<VarResponse>, ApiError> {
    let confidence_level = req.confidence_level.unwrap_or(0.95);
    // Without an amount the result is a fraction of the portfolio.
    let investment_amount = req.investment_amount.unwrap_or(1.0);
    let var = optimizer::calculate_var(
        &req.weights,
        &req.returns,
        &req.cov_matrix,
        confidence_level,
        investment_amount,
    )?;
    Ok(Json(VarResponse {
        var,
        confidence_level,
        investment_amount,
    }))
}

#[derive(Debug, Deserialize)]
struct CovarianceRequest {
    prices: BTreeMap<String, Vec<f64>>,
    /// Periods per year (252 for daily closes); raw per-period moments if absent.
    annualize: Option<f64>,
}

async fn covariance(Json(req): Json<CovarianceRequest>) -> Result<Json<CovarianceEstimate>, ApiError> {
    let prices = req.prices;
    let estimate = solve_blocking(move || optimizer::estimate_covariance(&prices)).await?;
    let estimate = match req.annualize {
        Some(periods) if periods > 0.0 && periods.is_finite() => estimate.annualize(periods),
        Some(periods) => {
            return Err(PortfolioError::InvalidInput(format!(
                "annualize must be a positive number (got {periods})"
            ))
            .into())
        }
        None => estimate,
    };
    Ok(Json(estimate))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_sentry(settings: &Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
