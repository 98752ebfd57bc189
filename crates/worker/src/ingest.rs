use anyhow::Context;
use chrono::NaiveDate;
use lumia_core::domain::asset::AssetSummary;
use lumia_core::domain::contract::AssetSnapshot;
use lumia_core::ingest::{HttpSnapshotProvider, SnapshotProvider};
use lumia_core::scoring::ScoringWeights;
use serde_json::Value;

/// A validated snapshot ready to be written to `asset_scores`.
#[derive(Debug)]
pub struct LoadedSnapshot {
    pub as_of_date: NaiveDate,
    pub provider: String,
    pub assets: Vec<AssetSummary>,
    pub raw: Value,
}

/// Reads a snapshot JSON file. The file's own `as_of_date` is used unless
/// one was requested explicitly, in which case they must agree.
pub fn load_snapshot_file(
    path: &str,
    expected: Option<NaiveDate>,
    weights: &ScoringWeights,
) -> anyhow::Result<LoadedSnapshot> {
    let raw_text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read snapshot file {path}"))?;
    let raw: Value = serde_json::from_str(&raw_text)
        .with_context(|| format!("snapshot file {path} is not valid JSON"))?;

    let snapshot: AssetSnapshot = match expected {
        Some(date) => lumia_core::ingest::provider::parse_snapshot(raw.clone(), date)?,
        None => serde_json::from_value(raw.clone())
            .with_context(|| format!("snapshot file {path} has an unexpected shape"))?,
    };

    let as_of_date = snapshot.as_of_date;
    let assets = snapshot.validate_and_into_assets(weights)?;
    Ok(LoadedSnapshot {
        as_of_date,
        provider: format!("file:{path}"),
        assets,
        raw,
    })
}

pub async fn fetch_snapshot(
    provider: &HttpSnapshotProvider,
    as_of_date: NaiveDate,
    weights: &ScoringWeights,
) -> anyhow::Result<LoadedSnapshot> {
    let (snapshot, raw) = provider.fetch_snapshot(as_of_date).await?;
    let assets = snapshot.validate_and_into_assets(weights)?;
    Ok(LoadedSnapshot {
        as_of_date,
        provider: provider.provider_name().to_string(),
        assets,
        raw,
    })
}

/// Writes the snapshot and its audit row. A failed upsert is still
/// recorded before the error is returned.
pub async fn persist_snapshot(pool: &sqlx::PgPool, snapshot: &LoadedSnapshot) -> anyhow::Result<u64> {
    let upserted = lumia_core::storage::assets::upsert_asset_scores_atomic(
        pool,
        snapshot.as_of_date,
        &snapshot.assets,
    )
    .await;

    match upserted {
        Ok(rows) => {
            let run_id = lumia_core::storage::assets::record_ingest_run(
                pool,
                snapshot.as_of_date,
                &snapshot.provider,
                Some(snapshot.assets.len() as i32),
                None,
                Some(snapshot.raw.clone()),
            )
            .await?;
            tracing::info!(
                as_of_date = %snapshot.as_of_date,
                %run_id,
                rows,
                "asset snapshot persisted"
            );
            Ok(rows)
        }
        Err(err) => {
            let msg = format!("{err:#}");
            if let Err(audit_err) = lumia_core::storage::assets::record_ingest_run(
                pool,
                snapshot.as_of_date,
                &snapshot.provider,
                None,
                Some(&msg),
                Some(snapshot.raw.clone()),
            )
            .await
            {
                tracing::error!(error = %format!("{audit_err:#}"), "failed to record ingest failure");
            }
            Err(err)
        }
    }
}
