//! Queryable view over the models each provider exposes.
//!
//! The catalog is fetched once per session and cached. Queries are a stateless predicate
//! pipeline over the cached snapshot followed by a stable sort.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LLMError;

/// Pricing, limits, and capabilities of one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogModel {
    /// Unique within its provider. Filled from the catalog key when the payload omits it.
    #[serde(default)]
    pub model_id: String,
    pub display_name: String,
    /// USD per one million prompt tokens.
    #[serde(default)]
    pub input_cost_per_1m: f64,
    /// USD per one million completion tokens.
    #[serde(default)]
    pub output_cost_per_1m: f64,
    pub context_window: u64,
    #[serde(default)]
    pub max_output_tokens: u64,
    #[serde(default)]
    pub supports_vision: bool,
    #[serde(default)]
    pub supports_tools: bool,
    #[serde(default)]
    pub is_reasoning_model: bool,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub deprecated: Option<bool>,
    #[serde(default)]
    pub replacement_model: Option<String>,
}

impl CatalogModel {
    pub fn is_deprecated(&self) -> bool {
        self.deprecated.unwrap_or(false)
    }

    /// Estimated USD cost of a call from the per-million prices.
    ///
    /// # Examples
    ///
    /// ```
    /// # use conduit_llm::catalog::CatalogModel;
    /// let model: CatalogModel = serde_json::from_value(serde_json::json!({
    ///     "display_name": "GPT 4.1 mini",
    ///     "input_cost_per_1m": 0.4,
    ///     "output_cost_per_1m": 1.6,
    ///     "context_window": 1047576
    /// })).unwrap();
    /// let cost = model.estimate_cost(1_000_000, 500_000);
    /// assert!((cost - 1.2).abs() < 1e-9);
    /// ```
    pub fn estimate_cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        (prompt_tokens as f64 * self.input_cost_per_1m
            + completion_tokens as f64 * self.output_cost_per_1m)
            / 1_000_000.0
    }

    fn matches_search(&self, needle: &str) -> bool {
        needle.is_empty()
            || [&self.display_name, &self.model_id, &self.description]
                .iter()
                .any(|field| field.to_lowercase().contains(needle))
    }
}

/// Full catalog keyed by provider, then by model identifier.
pub type FullCatalog = BTreeMap<String, BTreeMap<String, CatalogModel>>;

/// Filter parameters for [`query`]. The default matches every model.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CatalogFilter {
    /// Restrict to one provider. `None` means all providers.
    pub provider: Option<String>,
    /// Case-insensitive substring matched against name, id, and description.
    /// Whitespace is significant; only the empty string matches everything.
    pub search: String,
    pub vision: bool,
    pub tools: bool,
    pub reasoning: bool,
    /// Minimum context window, inclusive.
    pub min_context_window: u64,
}

impl CatalogFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts results to `provider`. The literal `"all"` clears the restriction.
    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        let provider = provider.into();
        self.provider = if provider.is_empty() || provider.eq_ignore_ascii_case("all") {
            None
        } else {
            Some(provider)
        };
        self
    }

    pub fn search(mut self, search: impl Into<String>) -> Self {
        self.search = search.into();
        self
    }

    pub fn vision(mut self, enabled: bool) -> Self {
        self.vision = enabled;
        self
    }

    pub fn tools(mut self, enabled: bool) -> Self {
        self.tools = enabled;
        self
    }

    pub fn reasoning(mut self, enabled: bool) -> Self {
        self.reasoning = enabled;
        self
    }

    pub fn min_context_window(mut self, threshold: u64) -> Self {
        self.min_context_window = threshold;
        self
    }
}

/// One query result borrowed from a catalog.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CatalogHit<'a> {
    pub provider: &'a str,
    pub model: &'a CatalogModel,
}

/// Owned query result returned by [`CatalogIndex::query`].
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub provider: String,
    pub model: CatalogModel,
}

impl From<CatalogHit<'_>> for CatalogEntry {
    fn from(hit: CatalogHit<'_>) -> Self {
        Self {
            provider: hit.provider.to_string(),
            model: hit.model.clone(),
        }
    }
}

/// Applies `filter` to `catalog` and returns matches in display order.
///
/// Filters run in order: provider, free-text search, capability flags, context window.
/// Results put non-deprecated models first, then sort by provider and display name.
/// The sort is stable, so equal keys keep the catalog's iteration order.
pub fn query<'a>(catalog: &'a FullCatalog, filter: &CatalogFilter) -> Vec<CatalogHit<'a>> {
    let needle = filter.search.to_lowercase();

    let mut hits: Vec<CatalogHit<'a>> = catalog
        .iter()
        .filter(|(provider, _)| {
            filter
                .provider
                .as_deref()
                .is_none_or(|wanted| wanted == provider.as_str())
        })
        .flat_map(|(provider, models)| {
            models.values().map(move |model| CatalogHit {
                provider: provider.as_str(),
                model,
            })
        })
        .filter(|hit| hit.model.matches_search(&needle))
        .filter(|hit| !filter.vision || hit.model.supports_vision)
        .filter(|hit| !filter.tools || hit.model.supports_tools)
        .filter(|hit| !filter.reasoning || hit.model.is_reasoning_model)
        .filter(|hit| hit.model.context_window >= filter.min_context_window)
        .collect();

    hits.sort_by(display_order);
    hits
}

fn display_order(a: &CatalogHit<'_>, b: &CatalogHit<'_>) -> Ordering {
    a.model
        .is_deprecated()
        .cmp(&b.model.is_deprecated())
        .then_with(|| a.provider.cmp(b.provider))
        .then_with(|| a.model.display_name.cmp(&b.model.display_name))
}

/// Fills missing `model_id` fields from their catalog keys.
pub fn normalize(mut catalog: FullCatalog) -> FullCatalog {
    for models in catalog.values_mut() {
        for (key, model) in models.iter_mut() {
            if model.model_id.is_empty() {
                model.model_id = key.clone();
            }
        }
    }
    catalog
}

/// Source of the full catalog, normally [`crate::client::GatewayClient`].
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch_catalog(&self) -> Result<FullCatalog, LLMError>;
}

/// Session-scoped cache of the catalog.
#[derive(Debug, Default)]
pub struct CatalogIndex {
    catalog: RwLock<Option<Arc<FullCatalog>>>,
}

impl CatalogIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetches the catalog and replaces the cache on success.
    ///
    /// # Errors
    ///
    /// Forwards the source's error. The previously cached catalog stays in place.
    pub async fn load(&self, source: &dyn CatalogSource) -> Result<Arc<FullCatalog>, LLMError> {
        let catalog = match source.fetch_catalog().await {
            Ok(catalog) => Arc::new(normalize(catalog)),
            Err(err) => {
                tracing::warn!(error = %err, "catalog load failed; keeping cached catalog");
                return Err(err);
            }
        };

        let models: usize = catalog.values().map(BTreeMap::len).sum();
        tracing::info!(providers = catalog.len(), models, "catalog loaded");

        *self
            .catalog
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&catalog));
        Ok(catalog)
    }

    /// The cached catalog, if one has been loaded.
    pub fn snapshot(&self) -> Option<Arc<FullCatalog>> {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.snapshot().is_some()
    }

    /// Runs [`query`] against the cached catalog. Empty before the first load.
    pub fn query(&self, filter: &CatalogFilter) -> Vec<CatalogEntry> {
        match self.snapshot() {
            Some(catalog) => query(&catalog, filter)
                .into_iter()
                .map(CatalogEntry::from)
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn get(&self, provider: &str, model_id: &str) -> Option<CatalogModel> {
        let catalog = self.snapshot()?;
        catalog.get(provider)?.get(model_id).cloned()
    }

    /// Providers present in the cached catalog, sorted.
    pub fn providers(&self) -> Vec<String> {
        self.snapshot()
            .map(|catalog| catalog.keys().cloned().collect())
            .unwrap_or_default()
    }
}
