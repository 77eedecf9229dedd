use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::catalog::{CatalogIndex, CatalogSource, FullCatalog, normalize};
use crate::channel::DynChannelConnector;
use crate::config::GatewayConfig;
use crate::error::LLMError;
use crate::http::{self, DynHttpTransport, HttpRequest, HttpResponse};
use crate::ledger::{CostLedger, CostSummary};
use crate::session::{SessionHandle, SessionObserver, StreamingSession};
use crate::types::{ChatRequest, ChatResponse, HealthStatus, ModelsResponse};

mod error;

use error::parse_api_error;

/// Entry point for the gateway's REST and streaming surfaces.
///
/// Owns the local [`CostLedger`] that every completed call feeds, and the session's
/// [`CatalogIndex`].
pub struct GatewayClient {
    transport: DynHttpTransport,
    connector: Option<DynChannelConnector>,
    base_url: String,
    stream_url: String,
    timeout: Option<Duration>,
    ledger: Arc<CostLedger>,
    catalog: CatalogIndex,
}

impl GatewayClient {
    /// 创建 Builder
    pub fn builder(base_url: impl Into<String>, transport: DynHttpTransport) -> GatewayClientBuilder {
        GatewayClientBuilder {
            base_url: base_url.into(),
            transport,
            connector: None,
            stream_url: None,
            timeout: None,
            ledger: None,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn stream_url(&self) -> &str {
        &self.stream_url
    }

    pub fn ledger(&self) -> &Arc<CostLedger> {
        &self.ledger
    }

    pub fn catalog_index(&self) -> &CatalogIndex {
        &self.catalog
    }

    /// `GET /health`
    pub async fn health(&self) -> Result<HealthStatus, LLMError> {
        self.get_json("/health").await
    }

    /// `GET /providers`
    pub async fn providers(&self) -> Result<Vec<String>, LLMError> {
        self.get_json("/providers").await
    }

    /// `GET /models/{provider}`, including the backend's credential check.
    pub async fn models(&self, provider: &str) -> Result<ModelsResponse, LLMError> {
        let provider = provider.trim();
        if provider.is_empty() || provider.contains('/') {
            return Err(LLMError::validation(format!(
                "invalid provider identifier: {provider:?}"
            )));
        }
        self.get_json(&format!("/models/{provider}")).await
    }

    /// `GET /catalog`
    pub async fn catalog(&self) -> Result<FullCatalog, LLMError> {
        self.get_json("/catalog").await.map(normalize)
    }

    /// `GET /all-models`, same shape as [`GatewayClient::catalog`].
    pub async fn all_models(&self) -> Result<FullCatalog, LLMError> {
        self.get_json("/all-models").await.map(normalize)
    }

    /// Fetches the catalog into [`GatewayClient::catalog_index`].
    pub async fn refresh_catalog(&self) -> Result<Arc<FullCatalog>, LLMError> {
        self.catalog.load(self).await
    }

    /// `POST /chat` for the non-streaming path.
    ///
    /// The request goes out with `stream: false`. Usage in the response is recorded in
    /// the local ledger.
    ///
    /// # Errors
    ///
    /// [`LLMError::Validation`] before sending, [`LLMError::Provider`] for non-2xx
    /// responses, [`LLMError::Protocol`] for unreadable bodies.
    pub async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LLMError> {
        request.validate()?;
        let request = ChatRequest {
            stream: false,
            ..request
        };

        let response: ChatResponse = self.post_json("/chat", &request).await?;
        if let Some(usage) = &response.usage {
            // Rejections are logged by the ledger; the response is still returned.
            let _ = self.ledger.record(usage, &request.provider, &request.model);
        }
        Ok(response)
    }

    /// Opens a streaming session for `request`; completed usage lands in the ledger.
    ///
    /// # Errors
    ///
    /// [`LLMError::InvalidConfig`] when no connector is configured and
    /// [`LLMError::Validation`] for a malformed request.
    pub fn stream_chat<O: SessionObserver>(
        &self,
        request: ChatRequest,
        observer: O,
    ) -> Result<SessionHandle, LLMError> {
        self.streaming_session()?.open(request, observer)
    }

    /// Session opener bound to this client's endpoint and ledger.
    pub fn streaming_session(&self) -> Result<StreamingSession, LLMError> {
        let connector = self.connector.clone().ok_or_else(|| LLMError::InvalidConfig {
            field: "connector".to_string(),
            reason: "streaming requires a channel connector".to_string(),
        })?;
        Ok(StreamingSession::new(connector, self.stream_url.clone())
            .with_ledger(Arc::clone(&self.ledger)))
    }

    /// `GET /cost`: the backend's own ledger.
    pub async fn cost(&self) -> Result<CostSummary, LLMError> {
        self.get_json("/cost").await
    }

    /// `POST /cost/reset`, then clears the local ledger.
    pub async fn reset_cost(&self) -> Result<(), LLMError> {
        let response = http::post_json(
            self.transport.as_ref(),
            self.url("/cost/reset"),
            &serde_json::json!({}),
            self.timeout,
        )
        .await?;
        self.ensure_success("/cost/reset", response)?;
        self.ledger.clear();
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, LLMError> {
        let request = HttpRequest::get(self.url(path)).with_timeout(self.timeout);
        let response = self.transport.send(request).await?;
        self.ensure_success(path, response)?.json(path)
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, LLMError>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        let response =
            http::post_json(self.transport.as_ref(), self.url(path), body, self.timeout).await?;
        self.ensure_success(path, response)?.json(path)
    }

    fn ensure_success(&self, path: &str, response: HttpResponse) -> Result<HttpResponse, LLMError> {
        if response.is_success() {
            return Ok(response);
        }
        let err = parse_api_error(response.status, &response.headers, &response.text_lossy());
        tracing::warn!(path, status = response.status, error = %err, "gateway request failed");
        Err(err)
    }
}

#[async_trait]
impl CatalogSource for GatewayClient {
    async fn fetch_catalog(&self) -> Result<FullCatalog, LLMError> {
        self.catalog().await
    }
}

/// 负责组装 GatewayClient 的 Builder
pub struct GatewayClientBuilder {
    base_url: String,
    transport: DynHttpTransport,
    connector: Option<DynChannelConnector>,
    stream_url: Option<String>,
    timeout: Option<Duration>,
    ledger: Option<Arc<CostLedger>>,
}

impl GatewayClientBuilder {
    /// Enables [`GatewayClient::stream_chat`].
    pub fn connector(mut self, connector: DynChannelConnector) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Overrides the streaming endpoint. Defaults to `ws(s)://<base>/ws/chat`.
    pub fn stream_url(mut self, stream_url: impl Into<String>) -> Self {
        self.stream_url = Some(stream_url.into());
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Shares an existing ledger instead of creating a fresh one.
    pub fn ledger(mut self, ledger: Arc<CostLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn build(self) -> GatewayClient {
        let base_url = self.base_url.trim().trim_end_matches('/').to_string();
        let stream_url = self
            .stream_url
            .unwrap_or_else(|| GatewayConfig::new(base_url.clone()).stream_url());
        GatewayClient {
            transport: self.transport,
            connector: self.connector,
            base_url,
            stream_url,
            timeout: self.timeout,
            ledger: self.ledger.unwrap_or_default(),
            catalog: CatalogIndex::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use serde_json::{Value, json};

    use super::*;
    use crate::http::{HttpMethod, HttpTransport};
    use crate::types::{ChatMessage, UsageStats};

    /// Transport that replays canned responses by path and records every request.
    #[derive(Default)]
    struct MockTransport {
        routes: HashMap<String, (u16, Value)>,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl MockTransport {
        fn route(mut self, path: &str, status: u16, body: Value) -> Self {
            self.routes.insert(format!("http://gw.test{path}"), (status, body));
            self
        }

        fn seen(&self) -> Vec<HttpRequest> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpTransport for MockTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, LLMError> {
            self.seen.lock().unwrap().push(request.clone());
            let (status, body) = self
                .routes
                .get(&request.url)
                .cloned()
                .ok_or_else(|| LLMError::transport(format!("no route for {}", request.url)))?;
            Ok(HttpResponse {
                status,
                headers: HashMap::new(),
                body: serde_json::to_vec(&body).unwrap(),
            })
        }
    }

    fn client(transport: Arc<MockTransport>) -> GatewayClient {
        GatewayClient::builder("http://gw.test/", transport)
            .timeout(Some(Duration::from_secs(5)))
            .build()
    }

    fn chat_request() -> ChatRequest {
        ChatRequest::builder("openai", "gpt-4.1-mini")
            .message(ChatMessage::user("hi"))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn chat_posts_non_streaming_request_and_records_usage() {
        let transport = Arc::new(MockTransport::default().route(
            "/chat",
            200,
            json!({
                "content": "hello",
                "provider": "openai",
                "model": "gpt-4.1-mini",
                "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4, "cost_usd": 0.001}
            }),
        ));
        let client = client(Arc::clone(&transport));

        let response = client.chat(chat_request()).await.expect("chat");
        assert_eq!(response.content, "hello");
        assert_eq!(response.usage, Some(UsageStats::new(3, 1, 0.001)));

        let seen = transport.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].method, HttpMethod::Post);
        assert_eq!(seen[0].timeout, Some(Duration::from_secs(5)));
        let body: Value = serde_json::from_slice(seen[0].body.as_ref().unwrap()).unwrap();
        assert_eq!(body["stream"], json!(false));
        assert_eq!(body["messages"][0]["content"], json!("hi"));

        let summary = client.ledger().summarize();
        assert_eq!(summary.total_calls, 1);
        assert_eq!(summary.by_provider["openai"].tokens, 4);
    }

    #[tokio::test]
    async fn chat_validates_before_sending() {
        let transport = Arc::new(MockTransport::default());
        let client = client(Arc::clone(&transport));
        let mut request = chat_request();
        request.messages.clear();

        let err = client.chat(request).await.expect_err("empty messages");
        assert!(matches!(err, LLMError::Validation { .. }));
        assert!(transport.seen().is_empty());
    }

    #[tokio::test]
    async fn rest_failures_carry_status_and_message() {
        let transport = Arc::new(MockTransport::default().route(
            "/models/openai",
            401,
            json!({"error": "Invalid API key", "detail": "OPENAI_API_KEY rejected"}),
        ));
        let client = client(transport);

        let err = client.models("openai").await.expect_err("401");
        match err {
            LLMError::Provider {
                status,
                message,
                detail,
                ..
            } => {
                assert_eq!(status, 401);
                assert_eq!(message, "Invalid API key");
                assert_eq!(detail.as_deref(), Some("OPENAI_API_KEY rejected"));
            }
            other => panic!("unexpected error type: {other:?}"),
        }
    }

    #[tokio::test]
    async fn models_rejects_bad_provider_identifiers() {
        let client = client(Arc::new(MockTransport::default()));
        assert!(matches!(
            client.models("").await,
            Err(LLMError::Validation { .. })
        ));
        assert!(matches!(
            client.models("../cost").await,
            Err(LLMError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn unparsable_body_is_a_protocol_error() {
        let transport = Arc::new(MockTransport::default().route("/providers", 200, json!({"oops": 1})));
        let client = client(transport);
        let err = client.providers().await.expect_err("bad shape");
        assert!(matches!(err, LLMError::Protocol { .. }));
    }

    #[tokio::test]
    async fn reset_cost_clears_local_ledger_on_success() {
        let transport = Arc::new(MockTransport::default().route("/cost/reset", 200, json!({"status": "ok"})));
        let client = client(Arc::clone(&transport));
        client
            .ledger()
            .record(&UsageStats::new(1, 1, 0.2), "openai", "gpt")
            .unwrap();

        client.reset_cost().await.expect("reset");
        assert_eq!(client.ledger().summarize().total_calls, 0);
        assert_eq!(transport.seen()[0].url, "http://gw.test/cost/reset");
    }

    #[tokio::test]
    async fn failed_reset_keeps_local_ledger() {
        let transport = Arc::new(MockTransport::default().route(
            "/cost/reset",
            500,
            json!({"error": "ledger locked"}),
        ));
        let client = client(transport);
        client
            .ledger()
            .record(&UsageStats::new(1, 1, 0.2), "openai", "gpt")
            .unwrap();

        assert!(client.reset_cost().await.is_err());
        assert_eq!(client.ledger().summarize().total_calls, 1);
    }

    #[tokio::test]
    async fn refresh_catalog_populates_index() {
        let transport = Arc::new(MockTransport::default().route(
            "/catalog",
            200,
            json!({
                "openai": {
                    "gpt-4.1-mini": {
                        "display_name": "GPT-4.1 mini",
                        "context_window": 1047576,
                        "supports_vision": true
                    }
                }
            }),
        ));
        let client = client(transport);

        client.refresh_catalog().await.expect("catalog");
        let model = client
            .catalog_index()
            .get("openai", "gpt-4.1-mini")
            .expect("model");
        assert_eq!(model.model_id, "gpt-4.1-mini");
        assert!(model.supports_vision);
    }

    #[test]
    fn stream_chat_without_connector_is_a_config_error() {
        let client = client(Arc::new(MockTransport::default()));
        assert_eq!(client.stream_url(), "ws://gw.test/ws/chat");
        let err = client
            .streaming_session()
            .err()
            .expect("missing connector");
        assert!(matches!(err, LLMError::InvalidConfig { .. }));
    }
}
