use anyhow::Context;
use lumia_core::config::Settings;
use lumia_core::scoring::ScoringWeights;
use lumia_core::universe::InMemoryUniverse;

/// Where the recommender reads candidate assets from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UniverseSource {
    File(String),
    Database,
}

impl UniverseSource {
    /// An explicit file wins, then `LUMIA_UNIVERSE_PATH`, then the latest
    /// `asset_scores` snapshot.
    pub fn resolve(file_arg: Option<&str>, settings: &Settings) -> Self {
        match file_arg.or(settings.universe_path.as_deref()) {
            Some(path) => UniverseSource::File(path.to_string()),
            None => UniverseSource::Database,
        }
    }
}

pub async fn load_universe(
    source: &UniverseSource,
    pool: Option<&sqlx::PgPool>,
    weights: &ScoringWeights,
) -> anyhow::Result<InMemoryUniverse> {
    let universe = match source {
        UniverseSource::File(path) => InMemoryUniverse::from_json_file(path, weights)?,
        UniverseSource::Database => {
            let pool = pool.context("DATABASE_URL is required to read the asset universe")?;
            let (as_of_date, assets) = lumia_core::storage::assets::load_latest_assets(pool)
                .await?
                .context("asset_scores is empty; run `ingest` first or pass --universe-file")?;
            InMemoryUniverse::new(format!("postgres:asset_scores@{as_of_date}"), assets)
        }
    };

    anyhow::ensure!(!universe.is_empty(), "asset universe is empty");
    tracing::info!(
        classes = ?universe.class_counts(),
        assets = universe.len(),
        "asset universe loaded"
    );
    Ok(universe)
}
