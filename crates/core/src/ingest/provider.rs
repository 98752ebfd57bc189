//! Pulls scored asset snapshots from an external HTTP JSON endpoint.

use crate::config::Settings;
use crate::domain::contract::AssetSnapshot;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_PATH: &str = "/v1/asset_scores";
const DEFAULT_RETRIES: u32 = 3;

#[async_trait::async_trait]
pub trait SnapshotProvider: Send + Sync {
    fn provider_name(&self) -> &'static str;

    /// Parsed snapshot plus the raw body, kept for the ingest audit trail.
    async fn fetch_snapshot(&self, as_of_date: NaiveDate) -> Result<(AssetSnapshot, Value)>;
}

#[derive(Debug, Clone)]
pub struct HttpSnapshotProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    path: String,
    retries: u32,
}

impl HttpSnapshotProvider {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let base_url = settings.require_data_provider_base_url()?.to_string();

        let timeout_secs = env_parse("DATA_PROVIDER_TIMEOUT_SECS").unwrap_or(DEFAULT_TIMEOUT_SECS);
        let retries = env_parse("DATA_PROVIDER_RETRIES").unwrap_or(DEFAULT_RETRIES);
        let path = std::env::var("DATA_PROVIDER_SNAPSHOT_PATH")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PATH.to_string());

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build data provider http client")?;

        Ok(Self {
            http,
            base_url,
            api_key: settings.data_provider_api_key.clone(),
            path,
            retries: retries.max(1),
        })
    }

    fn url(&self) -> String {
        let path = self.path.trim_start_matches('/');
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &self.api_key {
            headers.insert(
                "x-api-key",
                HeaderValue::from_str(api_key).context("DATA_PROVIDER_API_KEY is not a valid header")?,
            );
        }
        Ok(headers)
    }

    async fn fetch_once(&self, as_of_date: NaiveDate) -> Result<(AssetSnapshot, Value)> {
        let res = self
            .http
            .get(self.url())
            .headers(self.headers()?)
            .query(&[("as_of_date", as_of_date.to_string())])
            .send()
            .await
            .context("data provider request failed")?;

        let status = res.status();
        let text = res
            .text()
            .await
            .context("failed to read provider response")?;
        let raw = serde_json::from_str::<Value>(&text)
            .with_context(|| format!("provider response is not valid JSON: {}", truncate(&text, 512)))?;

        if !status.is_success() {
            anyhow::bail!("data provider HTTP {status}: {}", truncate(&raw.to_string(), 512));
        }

        let parsed = parse_snapshot(raw.clone(), as_of_date)?;
        Ok((parsed, raw))
    }
}

#[async_trait::async_trait]
impl SnapshotProvider for HttpSnapshotProvider {
    fn provider_name(&self) -> &'static str {
        "external_http_json"
    }

    async fn fetch_snapshot(&self, as_of_date: NaiveDate) -> Result<(AssetSnapshot, Value)> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.fetch_once(as_of_date).await {
                Ok(ok) => return Ok(ok),
                Err(err) => {
                    if attempt >= self.retries {
                        return Err(err.context(format!("gave up after {attempt} attempts")));
                    }
                    let backoff = Duration::from_secs(1 << (attempt - 1).min(5));
                    tracing::warn!(attempt, ?backoff, error = %err, "snapshot fetch failed; retrying");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

/// Parses a provider body and checks it is for the requested date.
pub fn parse_snapshot(raw: Value, expected: NaiveDate) -> Result<AssetSnapshot> {
    let snapshot = serde_json::from_value::<AssetSnapshot>(raw)
        .context("failed to parse provider response into AssetSnapshot")?;
    anyhow::ensure!(
        snapshot.as_of_date == expected,
        "provider as_of_date mismatch: expected {expected}, got {}",
        snapshot.as_of_date
    );
    anyhow::ensure!(!snapshot.items.is_empty(), "provider returned no assets");
    Ok(snapshot)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
