//! Catalog item selection with recency exclusions.
//!
//! The primary path ranks precomputed item embeddings by cosine similarity to
//! the embedded query. Keyword search takes over when there is no embedder,
//! no item vectors, or the embedder fails.

use async_trait::async_trait;
use postforge_llm::Embedder;
use postforge_shared::{CatalogItem, PostforgeError, ProductSnapshot, ProductsConfig, Result};
use postforge_storage::Storage;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::dedupe::DedupSets;
use crate::json_repair::repair_chain;

const MAX_SNAPSHOT_SPECS: usize = 5;
const MAX_MARGIN: f64 = 0.95;

// ---------------------------------------------------------------------------
// Catalog index
// ---------------------------------------------------------------------------

/// Read-only search over catalog items.
#[async_trait]
pub trait CatalogIndex: Send + Sync {
    /// Active embedded items ranked by cosine similarity to `query`, best first.
    async fn nearest(
        &self,
        query: &[f32],
        category: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CatalogItem>>;

    /// Active items whose name, SKU or description contains `query`.
    async fn keyword(
        &self,
        query: &str,
        category: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CatalogItem>>;
}

#[async_trait]
impl CatalogIndex for Storage {
    async fn nearest(
        &self,
        query: &[f32],
        category: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CatalogItem>> {
        let items = self.list_embedded_items(category).await?;
        Ok(rank_by_similarity(items, query, limit))
    }

    async fn keyword(
        &self,
        query: &str,
        category: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CatalogItem>> {
        let limit = u32::try_from(limit).unwrap_or(u32::MAX);
        self.keyword_search_items(query, category, limit).await
    }
}

/// Cosine similarity; 0.0 for mismatched lengths or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Sort embedded items by similarity to `query` and keep the top `limit`.
pub fn rank_by_similarity(items: Vec<CatalogItem>, query: &[f32], limit: usize) -> Vec<CatalogItem> {
    let mut scored: Vec<(f32, CatalogItem)> = items
        .into_iter()
        .filter_map(|item| {
            let score = cosine_similarity(item.embedding.as_deref()?, query);
            Some((score, item))
        })
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));
    scored.into_iter().take(limit).map(|(_, item)| item).collect()
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Which path produced a selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionSource {
    Semantic,
    Keyword,
}

/// The chosen item.
#[derive(Debug, Clone, Serialize)]
pub struct SelectedProduct {
    pub id: String,
    pub category: String,
    pub snapshot: ProductSnapshot,
    /// Every candidate was excluded, so a recent item was reused.
    pub reused: bool,
    pub source: SelectionSource,
}

/// Picks one catalog item per post.
pub struct ProductSelector<'a> {
    index: &'a dyn CatalogIndex,
    embedder: Option<&'a dyn Embedder>,
    config: &'a ProductsConfig,
}

impl<'a> ProductSelector<'a> {
    pub fn new(
        index: &'a dyn CatalogIndex,
        embedder: Option<&'a dyn Embedder>,
        config: &'a ProductsConfig,
    ) -> Self {
        Self {
            index,
            embedder,
            config,
        }
    }

    /// Select the best non-excluded item for `query`, or `None` when nothing matches.
    #[instrument(skip_all, fields(%query, category = ?category))]
    pub async fn select(
        &self,
        query: &str,
        category: Option<&str>,
        sets: &DedupSets,
    ) -> Result<Option<SelectedProduct>> {
        let query = query.trim();
        let category = category.map(str::trim).filter(|c| !c.is_empty());

        let (candidates, source) = match self.semantic_candidates(query, category).await? {
            Some(items) if !items.is_empty() => (items, SelectionSource::Semantic),
            _ => (
                self.keyword_candidates(query, category).await?,
                SelectionSource::Keyword,
            ),
        };

        let Some((item, reused)) = self.pick(&candidates, sets) else {
            debug!(candidates = candidates.len(), "no selectable catalog item");
            return Ok(None);
        };

        let snapshot = self.snapshot(item);
        info!(
            product_id = %item.id,
            category = %item.category,
            reused,
            source = ?source,
            "product selected"
        );
        Ok(Some(SelectedProduct {
            id: item.id.clone(),
            category: item.category.clone(),
            snapshot,
            reused,
            source,
        }))
    }

    /// `None` when the semantic path is unavailable.
    async fn semantic_candidates(
        &self,
        query: &str,
        category: Option<&str>,
    ) -> Result<Option<Vec<CatalogItem>>> {
        let Some(embedder) = self.embedder else {
            return Ok(None);
        };
        if query.is_empty() {
            return Ok(None);
        }
        let vector = match embedder.embed(query).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "embedding failed, falling back to keyword search");
                return Ok(None);
            }
        };
        let items = self
            .index
            .nearest(&vector, category, self.config.candidate_window)
            .await?;
        Ok(Some(items))
    }

    async fn keyword_candidates(&self, query: &str, category: Option<&str>) -> Result<Vec<CatalogItem>> {
        let limit = self.config.candidate_window;
        let items = self.index.keyword(query, category, limit).await?;
        if !items.is_empty() {
            return Ok(items);
        }
        match query.split_whitespace().next() {
            Some(first) if first != query => self.index.keyword(first, category, limit).await,
            _ => Ok(items),
        }
    }

    /// First candidate passing the exclusions, else the first of the top
    /// `fallback_window` not already used in this run.
    fn pick<'c>(&self, candidates: &'c [CatalogItem], sets: &DedupSets) -> Option<(&'c CatalogItem, bool)> {
        let excluded = sets.excluded_ids();
        let usage = sets.category_usage();

        let fresh = candidates.iter().find(|item| {
            let used = usage
                .get(&item.category.to_lowercase())
                .copied()
                .unwrap_or(0);
            !excluded.contains(&item.id) && used < self.config.category_repeat_limit
        });
        if let Some(item) = fresh {
            return Some((item, false));
        }

        candidates
            .iter()
            .take(self.config.fallback_window)
            .find(|item| !sets.batch_ids.contains(&item.id))
            .map(|item| (item, true))
    }

    fn snapshot(&self, item: &CatalogItem) -> ProductSnapshot {
        ProductSnapshot {
            id: item.id.clone(),
            name: item.name.clone(),
            sku: item.sku.clone(),
            category: item.category.clone(),
            price: price_for(item, self.config),
            in_stock: item.stock > 0,
            specs: item.specs.iter().take(MAX_SNAPSHOT_SPECS).cloned().collect(),
        }
    }
}

/// `(cost + shipping) / (1 - margin)`, rounded to cents.
pub fn price_for(item: &CatalogItem, config: &ProductsConfig) -> f64 {
    let margin = item
        .margin
        .unwrap_or(config.default_margin)
        .max(config.min_margin)
        .min(MAX_MARGIN);
    let price = (item.cost + item.shipping_cost) / (1.0 - margin);
    (price * 100.0).round() / 100.0
}

/// Parse a catalog export: a bare array of items or an object with an
/// `items` array. Trailing commas, smart quotes and a truncated tail are
/// tolerated; the complete leading items are kept.
pub fn parse_catalog_export(text: &str) -> Result<Vec<CatalogItem>> {
    let value = repair_chain(text, "items")
        .ok_or_else(|| PostforgeError::validation("catalog export is not JSON"))?;
    let items = match value {
        Value::Array(items) => Value::Array(items),
        Value::Object(mut map) => map
            .remove("items")
            .filter(Value::is_array)
            .ok_or_else(|| PostforgeError::validation("catalog export has no `items` array"))?,
        _ => return Err(PostforgeError::validation("catalog export is not a list of items")),
    };
    serde_json::from_value(items)
        .map_err(|e| PostforgeError::validation(format!("invalid catalog item: {e}")))
}
