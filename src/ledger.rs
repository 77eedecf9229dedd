//! Running cost and token accounting across providers and models.
//!
//! The ledger is the only mutable shared state in the crate. Every mutation goes through
//! [`CostLedger::record`] or [`CostLedger::clear`] under a single lock, so the totals
//! always equal the sum of the per-provider entries and a reader never sees half of an
//! update.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::config::BudgetConfig;
use crate::error::LLMError;
use crate::types::UsageStats;

/// Additive counters for one provider or one model.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CostLedgerEntry {
    pub cost: f64,
    pub tokens: u64,
    pub calls: u64,
}

impl CostLedgerEntry {
    fn add(&mut self, cost: f64, tokens: u64) {
        self.cost += cost;
        self.tokens = self.tokens.saturating_add(tokens);
        self.calls += 1;
    }
}

/// Budget view derived from the running total. Never stored.
///
/// Every optional field is `None` when no budget is configured.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub budget_set: bool,
    pub total_cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent_used: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub over_budget: Option<bool>,
    /// Percentage of the limit at which callers should warn the user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_threshold: Option<f64>,
    /// `percent_used >= alert_threshold`, when a threshold is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_triggered: Option<bool>,
}

impl BudgetStatus {
    /// Computes the status of `total_cost` against an optional budget.
    ///
    /// # Examples
    ///
    /// ```
    /// # use conduit_llm::config::BudgetConfig;
    /// # use conduit_llm::ledger::BudgetStatus;
    /// let budget = BudgetConfig { limit_usd: 2.0, alert_threshold_percent: Some(50.0) };
    /// let status = BudgetStatus::compute(1.5, Some(&budget));
    /// assert_eq!(status.percent_used, Some(75.0));
    /// assert_eq!(status.remaining, Some(0.5));
    /// assert_eq!(status.over_budget, Some(false));
    /// assert_eq!(status.alert_triggered, Some(true));
    /// ```
    pub fn compute(total_cost: f64, budget: Option<&BudgetConfig>) -> Self {
        let Some(budget) = budget else {
            return Self {
                budget_set: false,
                total_cost,
                ..Self::default()
            };
        };

        let limit = budget.limit_usd;
        let percent_used = total_cost / limit * 100.0;
        Self {
            budget_set: true,
            total_cost,
            limit: Some(limit),
            remaining: Some((limit - total_cost).max(0.0)),
            percent_used: Some(percent_used),
            over_budget: Some(total_cost > limit),
            alert_threshold: budget.alert_threshold_percent,
            alert_triggered: budget
                .alert_threshold_percent
                .map(|threshold| percent_used >= threshold),
        }
    }
}

/// Snapshot returned by [`CostLedger::summarize`] and by `GET /cost`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CostSummary {
    pub total_cost: f64,
    pub total_tokens: u64,
    pub total_calls: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    #[serde(default)]
    pub cache_hit_rate_percent: f64,
    /// Keyed by provider identifier.
    #[serde(default)]
    pub by_provider: BTreeMap<String, CostLedgerEntry>,
    /// Keyed by model identifier.
    #[serde(default)]
    pub by_model: BTreeMap<String, CostLedgerEntry>,
    #[serde(default)]
    pub budget: BudgetStatus,
}

#[derive(Debug, Default)]
struct Counters {
    total_cost: f64,
    total_tokens: u64,
    total_calls: u64,
    cache_read_tokens: u64,
    cache_creation_tokens: u64,
    uncached_prompt_tokens: u64,
    by_provider: BTreeMap<String, CostLedgerEntry>,
    by_model: BTreeMap<String, CostLedgerEntry>,
}

impl Counters {
    fn cache_hit_rate_percent(&self) -> f64 {
        let denominator = self.cache_read_tokens.saturating_add(self.uncached_prompt_tokens);
        if denominator == 0 {
            return 0.0;
        }
        (self.cache_read_tokens as f64 / denominator as f64 * 100.0).clamp(0.0, 100.0)
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    counters: Counters,
    budget: Option<BudgetConfig>,
}

impl LedgerState {
    fn summary(&self) -> CostSummary {
        let counters = &self.counters;
        CostSummary {
            total_cost: counters.total_cost,
            total_tokens: counters.total_tokens,
            total_calls: counters.total_calls,
            cache_read_tokens: counters.cache_read_tokens,
            cache_creation_tokens: counters.cache_creation_tokens,
            cache_hit_rate_percent: counters.cache_hit_rate_percent(),
            by_provider: counters.by_provider.clone(),
            by_model: counters.by_model.clone(),
            budget: BudgetStatus::compute(counters.total_cost, self.budget.as_ref()),
        }
    }
}

/// Lock-guarded cost aggregate.
///
/// Create one per process (or per user session) and share it behind an `Arc`.
///
/// # Examples
///
/// ```
/// # use conduit_llm::ledger::CostLedger;
/// # use conduit_llm::types::UsageStats;
/// let ledger = CostLedger::new();
/// ledger.record(&UsageStats::new(100, 50, 0.002), "openai", "gpt-4.1-mini").unwrap();
/// let summary = ledger.summarize();
/// assert_eq!(summary.total_tokens, 150);
/// assert_eq!(summary.by_provider["openai"].calls, 1);
/// ```
#[derive(Debug, Default)]
pub struct CostLedger {
    state: Mutex<LedgerState>,
}

impl CostLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a ledger with a budget already configured.
    pub fn with_budget(budget: BudgetConfig) -> Result<Self, LLMError> {
        let ledger = Self::new();
        ledger.set_budget(budget)?;
        Ok(ledger)
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds one call's usage to the totals and to the provider and model entries.
    ///
    /// Returns the summary as it stands right after the update.
    ///
    /// # Errors
    ///
    /// Returns [`LLMError::InvalidUsage`] for negative, non-finite, or inconsistent
    /// values. A rejected call leaves the ledger untouched.
    pub fn record(
        &self,
        usage: &UsageStats,
        provider: &str,
        model: &str,
    ) -> Result<CostSummary, LLMError> {
        if let Err(err) = usage.validate() {
            tracing::warn!(provider, model, error = %err, "rejected usage record");
            return Err(err);
        }

        let tokens = non_negative(usage.total_tokens);
        let cache_read = usage.cache_read_tokens.map(non_negative).unwrap_or(0);
        let cache_creation = usage.cache_creation_tokens.map(non_negative).unwrap_or(0);
        let uncached_prompt = non_negative(usage.prompt_tokens).saturating_sub(cache_read);

        let mut state = self.lock();
        let before = BudgetStatus::compute(state.counters.total_cost, state.budget.as_ref());

        let counters = &mut state.counters;
        counters.total_cost += usage.cost_usd;
        counters.total_tokens = counters.total_tokens.saturating_add(tokens);
        counters.total_calls += 1;
        counters.cache_read_tokens = counters.cache_read_tokens.saturating_add(cache_read);
        counters.cache_creation_tokens =
            counters.cache_creation_tokens.saturating_add(cache_creation);
        counters.uncached_prompt_tokens =
            counters.uncached_prompt_tokens.saturating_add(uncached_prompt);
        counters
            .by_provider
            .entry(provider.to_string())
            .or_default()
            .add(usage.cost_usd, tokens);
        counters
            .by_model
            .entry(model.to_string())
            .or_default()
            .add(usage.cost_usd, tokens);

        let summary = state.summary();
        drop(state);

        tracing::debug!(
            provider,
            model,
            cost_usd = usage.cost_usd,
            tokens,
            total_cost = summary.total_cost,
            "recorded usage"
        );
        log_budget_transition(&before, &summary.budget);
        Ok(summary)
    }

    /// Returns the current totals, breakdowns, and budget status.
    pub fn summarize(&self) -> CostSummary {
        self.lock().summary()
    }

    /// Zeroes every counter and empties both breakdowns. The budget is kept.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.counters = Counters::default();
        tracing::info!("cost ledger cleared");
    }

    /// Installs or replaces the budget.
    ///
    /// # Errors
    ///
    /// Returns [`LLMError::InvalidConfig`] when the budget itself is invalid.
    pub fn set_budget(&self, budget: BudgetConfig) -> Result<(), LLMError> {
        budget.validate()?;
        self.lock().budget = Some(budget);
        Ok(())
    }

    pub fn clear_budget(&self) {
        self.lock().budget = None;
    }

    pub fn budget(&self) -> Option<BudgetConfig> {
        self.lock().budget.clone()
    }
}

fn non_negative(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn log_budget_transition(before: &BudgetStatus, after: &BudgetStatus) {
    if after.over_budget == Some(true) && before.over_budget != Some(true) {
        tracing::warn!(
            total_cost = after.total_cost,
            limit = after.limit,
            "budget exceeded"
        );
    } else if after.alert_triggered == Some(true) && before.alert_triggered != Some(true) {
        tracing::warn!(
            total_cost = after.total_cost,
            percent_used = after.percent_used,
            alert_threshold = after.alert_threshold,
            "budget alert threshold reached"
        );
    }
}
