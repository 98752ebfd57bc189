use crate::domain::asset::{AssetClass, AssetSummary};
use crate::domain::contract::AssetSnapshot;
use crate::scoring::ScoringWeights;
use anyhow::Context;
use std::collections::BTreeMap;
use std::path::Path;

/// Read-only source of scored assets, queried one class at a time.
pub trait AssetUniverse: Send + Sync {
    fn provider_name(&self) -> &str;

    fn assets_by_class(&self, class: AssetClass) -> anyhow::Result<Vec<AssetSummary>>;
}

impl<T: AssetUniverse + ?Sized> AssetUniverse for &T {
    fn provider_name(&self) -> &str {
        (**self).provider_name()
    }

    fn assets_by_class(&self, class: AssetClass) -> anyhow::Result<Vec<AssetSummary>> {
        (**self).assets_by_class(class)
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryUniverse {
    name: String,
    by_class: BTreeMap<AssetClass, Vec<AssetSummary>>,
}

impl InMemoryUniverse {
    pub fn new(name: impl Into<String>, assets: impl IntoIterator<Item = AssetSummary>) -> Self {
        let mut by_class: BTreeMap<AssetClass, Vec<AssetSummary>> = BTreeMap::new();
        for asset in assets {
            by_class.entry(asset.class).or_default().push(asset);
        }
        Self {
            name: name.into(),
            by_class,
        }
    }

    pub fn from_snapshot(
        name: impl Into<String>,
        snapshot: AssetSnapshot,
        weights: &ScoringWeights,
    ) -> anyhow::Result<Self> {
        let assets = snapshot.validate_and_into_assets(weights)?;
        Ok(Self::new(name, assets))
    }

    pub fn from_json_file(path: impl AsRef<Path>, weights: &ScoringWeights) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read universe file {}", path.display()))?;
        let snapshot: AssetSnapshot = serde_json::from_str(&raw)
            .with_context(|| format!("invalid universe snapshot json in {}", path.display()))?;
        let universe = Self::from_snapshot(format!("file:{}", path.display()), snapshot, weights)
            .with_context(|| format!("invalid universe snapshot in {}", path.display()))?;
        tracing::info!(path = %path.display(), assets = universe.len(), "loaded asset universe");
        Ok(universe)
    }

    pub fn len(&self) -> usize {
        self.by_class.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn class_counts(&self) -> BTreeMap<AssetClass, usize> {
        self.by_class.iter().map(|(c, v)| (*c, v.len())).collect()
    }
}

impl AssetUniverse for InMemoryUniverse {
    fn provider_name(&self) -> &str {
        &self.name
    }

    fn assets_by_class(&self, class: AssetClass) -> anyhow::Result<Vec<AssetSummary>> {
        Ok(self.by_class.get(&class).cloned().unwrap_or_default())
    }
}
