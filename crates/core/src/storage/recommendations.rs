use crate::domain::recommendation::{PortfolioItem, Recommendation};
use crate::error::PortfolioError;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Stores a successful run with its holdings.
pub async fn persist_success(
    pool: &sqlx::PgPool,
    recommendation: &Recommendation,
    request: Value,
    provider: &str,
    generated_at: DateTime<Utc>,
) -> anyhow::Result<uuid::Uuid> {
    anyhow::ensure!(
        recommendation.total_holdings() > 0,
        "recommendation must have at least one holding"
    );

    let mut tx = pool.begin().await.context("begin transaction failed")?;

    let run_id: uuid::Uuid = sqlx::query_scalar(
        "INSERT INTO recommendation_runs \
           (generated_at, provider, status, request, risk_type, target_allocation, allocation, metrics, summary) \
         VALUES ($1, $2, 'success', $3, $4, $5, $6, $7, $8) \
         RETURNING id",
    )
    .bind(generated_at)
    .bind(provider)
    .bind(request)
    .bind(recommendation.profile.risk_type().as_str())
    .bind(serde_json::to_value(&recommendation.target_allocation)?)
    .bind(serde_json::to_value(&recommendation.allocation)?)
    .bind(serde_json::to_value(&recommendation.metrics)?)
    .bind(&recommendation.summary)
    .fetch_one(&mut *tx)
    .await
    .context("insert recommendation_runs failed")?;

    for (position, item) in recommendation.holdings().enumerate() {
        insert_item(&mut tx, run_id, position as i32, item).await?;
    }

    tx.commit().await.context("commit transaction failed")?;
    Ok(run_id)
}

/// Records a rejected request so failures stay visible next to successes.
pub async fn persist_failure(
    pool: &sqlx::PgPool,
    error: &PortfolioError,
    request: Value,
    provider: &str,
    generated_at: DateTime<Utc>,
) -> anyhow::Result<uuid::Uuid> {
    let run_id: uuid::Uuid = sqlx::query_scalar(
        "INSERT INTO recommendation_runs (generated_at, provider, status, error_kind, error, request) \
         VALUES ($1, $2, 'error', $3, $4, $5) \
         RETURNING id",
    )
    .bind(generated_at)
    .bind(provider)
    .bind(error.kind())
    .bind(error.reason())
    .bind(request)
    .fetch_one(pool)
    .await
    .context("insert error recommendation_runs failed")?;

    Ok(run_id)
}

async fn insert_item(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    run_id: uuid::Uuid,
    position: i32,
    item: &PortfolioItem,
) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO recommendation_items \
           (run_id, position, asset_class, symbol, name, sector, score, allocation_amount, allocation_percentage) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(run_id)
    .bind(position)
    .bind(item.class.as_str())
    .bind(&item.symbol)
    .bind(&item.name)
    .bind(&item.sector)
    .bind(item.score)
    .bind(item.allocation_amount)
    .bind(item.allocation_percentage)
    .execute(&mut **tx)
    .await
    .context("insert recommendation_items failed")?;

    Ok(())
}
