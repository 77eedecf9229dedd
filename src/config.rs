use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::DynChannelConnector;
use crate::channel::websocket::default_dyn_connector;
use crate::client::GatewayClient;
use crate::error::LLMError;
use crate::http::DynHttpTransport;
use crate::http::reqwest::default_dyn_transport;
use crate::ledger::CostLedger;

pub const ENV_BASE_URL: &str = "CONDUIT_BASE_URL";
pub const ENV_STREAM_PATH: &str = "CONDUIT_STREAM_PATH";
pub const ENV_TIMEOUT_SECS: &str = "CONDUIT_TIMEOUT_SECS";
pub const ENV_BUDGET_USD: &str = "CONDUIT_BUDGET_USD";
pub const ENV_BUDGET_ALERT_PERCENT: &str = "CONDUIT_BUDGET_ALERT_PERCENT";

const DEFAULT_STREAM_PATH: &str = "/ws/chat";

/// 网关连接配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// REST 根地址 例如 `http://localhost:8000`
    pub base_url: String,
    /// 流式端点路径
    #[serde(default = "default_stream_path")]
    pub stream_path: String,
    /// 单次 REST 请求超时 留空则不限制
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub budget: Option<BudgetConfig>,
}

/// 预算配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Spending limit in USD. Must be positive.
    pub limit_usd: f64,
    /// Percentage of the limit, in `(0, 100]`, at which an alert is raised.
    #[serde(default)]
    pub alert_threshold_percent: Option<f64>,
}

fn default_stream_path() -> String {
    DEFAULT_STREAM_PATH.to_string()
}

impl BudgetConfig {
    pub fn validate(&self) -> Result<(), LLMError> {
        if !self.limit_usd.is_finite() || self.limit_usd <= 0.0 {
            return Err(invalid(
                "budget.limit_usd",
                format!("must be a positive number, got {}", self.limit_usd),
            ));
        }
        if let Some(threshold) = self.alert_threshold_percent {
            if !(threshold > 0.0 && threshold <= 100.0) {
                return Err(invalid(
                    "budget.alert_threshold_percent",
                    format!("must be within (0, 100], got {threshold}"),
                ));
            }
        }
        Ok(())
    }
}

impl GatewayConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            stream_path: default_stream_path(),
            request_timeout_secs: None,
            budget: None,
        }
    }

    /// Reads the configuration from `CONDUIT_*` environment variables.
    pub fn from_env() -> Result<Self, LLMError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    ///
    /// # Examples
    ///
    /// ```
    /// # use std::collections::HashMap;
    /// # use conduit_llm::config::GatewayConfig;
    /// let vars = HashMap::from([
    ///     ("CONDUIT_BASE_URL", "https://gateway.example.com"),
    ///     ("CONDUIT_BUDGET_USD", "5"),
    /// ]);
    /// let config = GatewayConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();
    /// assert_eq!(config.stream_url(), "wss://gateway.example.com/ws/chat");
    /// assert_eq!(config.budget.unwrap().limit_usd, 5.0);
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`LLMError::InvalidConfig`] for missing or unparsable values.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, LLMError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base_url = lookup(ENV_BASE_URL).ok_or_else(|| invalid(ENV_BASE_URL, "is not set"))?;
        let mut config = Self::new(base_url);

        if let Some(path) = lookup(ENV_STREAM_PATH) {
            config.stream_path = path;
        }
        if let Some(raw) = lookup(ENV_TIMEOUT_SECS) {
            let secs = raw
                .trim()
                .parse::<u64>()
                .map_err(|err| invalid(ENV_TIMEOUT_SECS, err.to_string()))?;
            config.request_timeout_secs = Some(secs);
        }
        if let Some(raw) = lookup(ENV_BUDGET_USD) {
            let limit_usd = raw
                .trim()
                .parse::<f64>()
                .map_err(|err| invalid(ENV_BUDGET_USD, err.to_string()))?;
            let alert_threshold_percent = lookup(ENV_BUDGET_ALERT_PERCENT)
                .map(|raw| {
                    raw.trim()
                        .parse::<f64>()
                        .map_err(|err| invalid(ENV_BUDGET_ALERT_PERCENT, err.to_string()))
                })
                .transpose()?;
            config.budget = Some(BudgetConfig {
                limit_usd,
                alert_threshold_percent,
            });
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LLMError> {
        let base = self.base_url.trim();
        if base.is_empty() {
            return Err(invalid("base_url", "must not be empty"));
        }
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(invalid(
                "base_url",
                format!("must start with http:// or https://, got {base}"),
            ));
        }
        if !self.stream_path.starts_with('/') {
            return Err(invalid("stream_path", "must start with '/'"));
        }
        if self.request_timeout_secs == Some(0) {
            return Err(invalid("request_timeout_secs", "must be positive"));
        }
        if let Some(budget) = &self.budget {
            budget.validate()?;
        }
        Ok(())
    }

    /// REST root without a trailing slash.
    pub fn rest_base(&self) -> String {
        self.base_url.trim().trim_end_matches('/').to_string()
    }

    /// WebSocket URL of the streaming endpoint, derived from `base_url`.
    pub fn stream_url(&self) -> String {
        let base = self.rest_base();
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base
        };
        format!("{ws_base}{}", self.stream_path)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

/// 根据配置构建 GatewayClient
pub fn build_client(
    config: &GatewayConfig,
    transport: DynHttpTransport,
    connector: DynChannelConnector,
) -> Result<GatewayClient, LLMError> {
    config.validate()?;

    let ledger = match &config.budget {
        Some(budget) => CostLedger::with_budget(budget.clone())?,
        None => CostLedger::new(),
    };

    Ok(GatewayClient::builder(config.rest_base(), transport)
        .stream_url(config.stream_url())
        .timeout(config.request_timeout())
        .connector(connector)
        .ledger(ledger.into())
        .build())
}

/// 使用 reqwest 与 WebSocket 默认实现构建 GatewayClient
pub fn build_default_client(config: &GatewayConfig) -> Result<GatewayClient, LLMError> {
    build_client(config, default_dyn_transport()?, default_dyn_connector())
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> LLMError {
    LLMError::InvalidConfig {
        field: field.into(),
        reason: reason.into(),
    }
}
