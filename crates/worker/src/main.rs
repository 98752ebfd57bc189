use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lumia_core::config::{RecommenderConfig, Settings};
use lumia_core::domain::contract::ProfileRequest;
use lumia_core::domain::recommendation::Recommendation;
use lumia_core::recommender::Recommender;
use lumia_core::universe::AssetUniverse;

mod ingest;
mod universe;

#[derive(Debug, Parser)]
#[command(name = "lumia_worker")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load a scored asset snapshot into `asset_scores`.
    Ingest {
        /// Snapshot JSON file.
        #[arg(long, required_unless_present = "provider")]
        file: Option<String>,

        /// Fetch the snapshot from the HTTP data provider instead of a file.
        #[arg(long, conflicts_with = "file")]
        provider: bool,

        /// Market as-of date (YYYY-MM-DD). Defaults to the latest closed trading day.
        #[arg(long)]
        as_of_date: Option<String>,

        /// Validate without writing to the database.
        #[arg(long)]
        dry_run: bool,
    },

    /// Build a portfolio for one investor profile and print it as JSON.
    Recommend {
        #[arg(long)]
        capital: f64,

        /// Risk appetite score, 0 (cautious) to 100 (speculative).
        #[arg(long)]
        risk_score: i64,

        /// Investment horizon in years.
        #[arg(long)]
        years: i64,

        /// Annual return target as a fraction (0.12 for 12%).
        #[arg(long)]
        expected_return: f64,

        /// Asset class (`crypto`, `bond`, ...) or sector name to leave out; repeatable.
        #[arg(long = "exclude")]
        exclusions: Vec<String>,

        /// Universe JSON file; overrides LUMIA_UNIVERSE_PATH and the database.
        #[arg(long)]
        universe_file: Option<String>,

        /// Print the recommendation without recording the run.
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(sentry_tracing::layer())
        .init();

    let args = Args::parse();
    let config = settings.recommender_config()?;

    let res = match args.command {
        Command::Ingest {
            file,
            provider: _,
            as_of_date,
            dry_run,
        } => run_ingest(&settings, &config, file.as_deref(), as_of_date.as_deref(), dry_run).await,
        Command::Recommend {
            capital,
            risk_score,
            years,
            expected_return,
            exclusions,
            universe_file,
            dry_run,
        } => {
            let request = ProfileRequest {
                capital,
                risk_score,
                years,
                expected_return,
                exclusions,
            };
            run_recommend(&settings, config, request, universe_file.as_deref(), dry_run).await
        }
    };

    if let Err(err) = &res {
        sentry_anyhow::capture_anyhow(err);
    }
    res
}

async fn run_ingest(
    settings: &Settings,
    config: &RecommenderConfig,
    file: Option<&str>,
    as_of_date_arg: Option<&str>,
    dry_run: bool,
) -> anyhow::Result<()> {
    let weights = &config.scoring_weights;
    let snapshot = match file {
        Some(path) => {
            let expected = as_of_date_arg
                .map(|s| lumia_core::time::resolve_as_of_date(Some(s), chrono::Utc::now()))
                .transpose()?;
            ingest::load_snapshot_file(path, expected, weights)?
        }
        None => {
            let as_of_date = lumia_core::time::resolve_as_of_date(as_of_date_arg, chrono::Utc::now())?;
            let provider = lumia_core::ingest::HttpSnapshotProvider::from_settings(settings)?;
            ingest::fetch_snapshot(&provider, as_of_date, weights).await?
        }
    };

    if dry_run {
        tracing::info!(
            as_of_date = %snapshot.as_of_date,
            provider = %snapshot.provider,
            assets = snapshot.assets.len(),
            dry_run = true,
            "snapshot validated"
        );
        return Ok(());
    }

    let pool = connect(settings).await?;
    ingest::persist_snapshot(&pool, &snapshot).await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct RecommendOutput<'a> {
    run_id: Option<String>,
    universe: &'a str,
    recommendation: &'a Recommendation,
}

async fn run_recommend(
    settings: &Settings,
    config: RecommenderConfig,
    request: ProfileRequest,
    universe_file: Option<&str>,
    dry_run: bool,
) -> anyhow::Result<()> {
    let request_json = serde_json::to_value(&request)?;
    let profile = request.validate_and_into_profile()?;

    let source = universe::UniverseSource::resolve(universe_file, settings);
    let needs_db = !dry_run || source == universe::UniverseSource::Database;
    let pool = if needs_db { Some(connect(settings).await?) } else { None };

    let universe = universe::load_universe(&source, pool.as_ref(), &config.scoring_weights).await?;
    let provider = universe.provider_name().to_string();
    let recommender = Recommender::new(universe, config);
    let generated_at = chrono::Utc::now();

    let recommendation = match recommender.generate_recommendation(&profile) {
        Ok(r) => r,
        Err(err) => {
            if let (Some(pool), false) = (pool.as_ref(), dry_run) {
                let run_id = lumia_core::storage::recommendations::persist_failure(
                    pool,
                    &err,
                    request_json,
                    &provider,
                    generated_at,
                )
                .await?;
                tracing::error!(%run_id, kind = err.kind(), reason = err.reason(), "recommendation failed");
            }
            return Err(anyhow::Error::new(err));
        }
    };

    let run_id = match (pool.as_ref(), dry_run) {
        (Some(pool), false) => {
            let run_id = lumia_core::storage::recommendations::persist_success(
                pool,
                &recommendation,
                request_json,
                &provider,
                generated_at,
            )
            .await?;
            tracing::info!(%run_id, holdings = recommendation.total_holdings(), "persisted recommendation");
            Some(run_id.to_string())
        }
        _ => None,
    };

    let out = RecommendOutput {
        run_id,
        universe: &provider,
        recommendation: &recommendation,
    };
    let stdout = std::io::stdout();
    serde_json::to_writer_pretty(stdout.lock(), &out).context("failed to write recommendation")?;
    Ok(())
}

async fn connect(settings: &Settings) -> anyhow::Result<sqlx::PgPool> {
    let db_url = settings.require_database_url()?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await
        .context("connect DATABASE_URL failed")?;
    lumia_core::storage::migrate(&pool).await?;
    Ok(pool)
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
