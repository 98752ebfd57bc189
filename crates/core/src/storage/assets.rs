use crate::domain::asset::{AssetClass, AssetSummary};
use crate::scoring::ScoreBreakdown;
use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Upserts a validated snapshot into `asset_scores` in one transaction.
pub async fn upsert_asset_scores_atomic(
    pool: &sqlx::PgPool,
    as_of_date: NaiveDate,
    assets: &[AssetSummary],
) -> anyhow::Result<u64> {
    anyhow::ensure!(!assets.is_empty(), "assets must be non-empty");

    let chunk_size: usize = std::env::var("ASSET_SCORES_UPSERT_BATCH")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(200);
    anyhow::ensure!(chunk_size >= 1, "ASSET_SCORES_UPSERT_BATCH must be >= 1");

    // Serialize up front so the insert closure cannot fail.
    let rows = assets
        .iter()
        .map(|a| {
            let breakdown = serde_json::to_value(a.breakdown)
                .with_context(|| format!("serialize breakdown for {}", a.symbol))?;
            let details = serde_json::to_value(&a.details)
                .with_context(|| format!("serialize details for {}", a.symbol))?;
            Ok((a, breakdown, details))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut tx = pool.begin().await.context("begin transaction failed")?;
    let mut affected: u64 = 0;

    for (batch_idx, chunk) in rows.chunks(chunk_size).enumerate() {
        let t0 = std::time::Instant::now();
        let mut qb = sqlx::QueryBuilder::new(
            "INSERT INTO asset_scores (as_of_date, symbol, name, asset_class, sector, score, breakdown, details) ",
        );
        qb.push_values(chunk, |mut b, (asset, breakdown, details)| {
            b.push_bind(as_of_date)
                .push_bind(asset.symbol.as_str())
                .push_bind(asset.name.as_str())
                .push_bind(asset.class.as_str())
                .push_bind(asset.sector.as_deref())
                .push_bind(asset.score)
                .push_bind(breakdown.clone())
                .push_bind(details.clone());
        });
        qb.push(
            " ON CONFLICT (as_of_date, symbol) DO UPDATE \
               SET name = EXCLUDED.name, asset_class = EXCLUDED.asset_class, sector = EXCLUDED.sector, \
                   score = EXCLUDED.score, breakdown = EXCLUDED.breakdown, details = EXCLUDED.details, \
                   updated_at = now()",
        );

        let res = qb
            .build()
            .persistent(false)
            .execute(&mut *tx)
            .await
            .context("batch upsert asset_scores failed")?;
        affected += res.rows_affected();

        tracing::debug!(
            %as_of_date,
            batch_idx,
            batch_size = chunk.len(),
            elapsed_ms = t0.elapsed().as_millis(),
            "asset_scores batch upsert"
        );
    }

    tx.commit().await.context("commit transaction failed")?;
    Ok(affected)
}

type AssetRow = (String, String, String, Option<String>, f64, Value, Value);

/// Most recent snapshot in `asset_scores`, or `None` when the table is empty.
pub async fn load_latest_assets(
    pool: &sqlx::PgPool,
) -> anyhow::Result<Option<(NaiveDate, Vec<AssetSummary>)>> {
    let latest: Option<NaiveDate> = sqlx::query_scalar("SELECT max(as_of_date) FROM asset_scores")
        .persistent(false)
        .fetch_one(pool)
        .await
        .context("query latest asset_scores date failed")?;
    let Some(as_of_date) = latest else {
        return Ok(None);
    };

    let rows: Vec<AssetRow> = sqlx::query_as(
        "SELECT symbol, name, asset_class, sector, score, breakdown, details \
         FROM asset_scores WHERE as_of_date = $1 ORDER BY asset_class, symbol",
    )
    .persistent(false)
    .bind(as_of_date)
    .fetch_all(pool)
    .await
    .context("select asset_scores failed")?;

    let mut assets = Vec::with_capacity(rows.len());
    for (symbol, name, class, sector, score, breakdown, details) in rows {
        let class = class
            .parse::<AssetClass>()
            .with_context(|| format!("stored asset_class for {symbol} is invalid"))?;
        let breakdown: ScoreBreakdown = serde_json::from_value(breakdown)
            .with_context(|| format!("stored breakdown for {symbol} is invalid"))?;
        let details: BTreeMap<String, f64> = serde_json::from_value(details).unwrap_or_default();
        assets.push(AssetSummary {
            symbol,
            name,
            class,
            sector,
            score,
            breakdown,
            details,
        });
    }

    tracing::info!(%as_of_date, assets = assets.len(), "loaded latest asset snapshot");
    Ok(Some((as_of_date, assets)))
}

pub async fn record_ingest_run(
    pool: &sqlx::PgPool,
    as_of_date: NaiveDate,
    provider: &str,
    item_count: Option<i32>,
    error: Option<&str>,
    raw_response: Option<Value>,
) -> anyhow::Result<Uuid> {
    let id = Uuid::new_v4();
    let generated_at: DateTime<Utc> = Utc::now();
    let status = if error.is_some() { "error" } else { "success" };

    sqlx::query(
        "INSERT INTO asset_ingest_runs (id, as_of_date, generated_at, provider, status, item_count, error, raw_response) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .persistent(false)
    .bind(id)
    .bind(as_of_date)
    .bind(generated_at)
    .bind(provider)
    .bind(status)
    .bind(item_count)
    .bind(error)
    .bind(raw_response)
    .execute(pool)
    .await
    .context("insert asset_ingest_runs failed")?;

    Ok(id)
}
