//! Shared data structures describing chat requests, streamed fragments, and usage.
//!
//! These types mirror the gateway's JSON wire format. Provider-specific translation is
//! the backend's job, so nothing here branches on the provider identifier.

use serde::{Deserialize, Serialize};

use crate::error::LLMError;

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// Single message in a conversation. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// Inline document forwarded with a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub content: String,
    pub name: String,
}

/// Server-side chunking hints for large attachments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingOptions {
    pub enabled: bool,
    pub chunk_size: u32,
}

/// Chat request sent to the gateway, either over REST or as the first frame of a
/// streaming channel.
///
/// Requests are constructed once per user-initiated send and never mutated after
/// dispatch. Use [`ChatRequest::builder`] to get validation for free.
///
/// # Examples
///
/// ```
/// # use conduit_llm::types::{ChatMessage, ChatRequest};
/// let request = ChatRequest::builder("openai", "gpt-4.1-mini")
///     .message(ChatMessage::system("You are concise."))
///     .message(ChatMessage::user("Summarize Rust traits."))
///     .temperature(0.3)
///     .build()
///     .unwrap();
/// assert_eq!(request.messages.len(), 2);
/// assert!(request.stream);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Provider identifier, used only as a routing key.
    pub provider: String,
    /// Model identifier within the provider.
    pub model: String,
    /// Ordered conversation history.
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature within `0.0..=2.0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Upper bound on completion tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Whether the backend should stream fragments.
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunking: Option<ChunkingOptions>,
}

impl ChatRequest {
    /// Starts a builder for the given provider/model pair. Streaming is on by default.
    pub fn builder(provider: impl Into<String>, model: impl Into<String>) -> ChatRequestBuilder {
        ChatRequestBuilder {
            request: ChatRequest {
                provider: provider.into(),
                model: model.into(),
                messages: Vec::new(),
                temperature: None,
                max_tokens: None,
                stream: true,
                attachment: None,
                chunking: None,
            },
        }
    }

    /// Checks the request before anything is sent.
    ///
    /// # Errors
    ///
    /// Returns [`LLMError::Validation`] describing the first offending field.
    pub fn validate(&self) -> Result<(), LLMError> {
        if self.provider.trim().is_empty() {
            return Err(LLMError::validation("provider must not be empty"));
        }
        if self.model.trim().is_empty() {
            return Err(LLMError::validation("model must not be empty"));
        }
        if self.messages.is_empty() {
            return Err(LLMError::validation("messages must not be empty"));
        }
        if let Some(temperature) = self.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(LLMError::validation(format!(
                    "temperature must be within [0, 2], got {temperature}"
                )));
            }
        }
        if self.max_tokens == Some(0) {
            return Err(LLMError::validation("max_tokens must be positive"));
        }
        if let Some(chunking) = &self.chunking {
            if chunking.chunk_size == 0 {
                return Err(LLMError::validation("chunk_size must be positive"));
            }
        }
        if let Some(attachment) = &self.attachment {
            if attachment.name.trim().is_empty() {
                return Err(LLMError::validation("attachment name must not be empty"));
            }
        }
        Ok(())
    }
}

/// Builder returned by [`ChatRequest::builder`].
#[derive(Debug, Clone)]
pub struct ChatRequestBuilder {
    request: ChatRequest,
}

impl ChatRequestBuilder {
    pub fn message(mut self, message: ChatMessage) -> Self {
        self.request.messages.push(message);
        self
    }

    pub fn messages<I: IntoIterator<Item = ChatMessage>>(mut self, messages: I) -> Self {
        self.request.messages.extend(messages);
        self
    }

    pub fn temperature(mut self, temperature: f64) -> Self {
        self.request.temperature = Some(temperature);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.request.max_tokens = Some(max_tokens);
        self
    }

    pub fn stream(mut self, stream: bool) -> Self {
        self.request.stream = stream;
        self
    }

    pub fn attachment(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.request.attachment = Some(Attachment {
            content: content.into(),
            name: name.into(),
        });
        self
    }

    /// Enables server-side chunking of the attachment.
    pub fn chunking(mut self, chunk_size: u32) -> Self {
        self.request.chunking = Some(ChunkingOptions {
            enabled: true,
            chunk_size,
        });
        self
    }

    /// Validates and returns the finished request.
    pub fn build(self) -> Result<ChatRequest, LLMError> {
        self.request.validate()?;
        Ok(self.request)
    }
}

/// Token and cost accounting for a single call.
///
/// Produced exactly once per call, either on the terminal streaming fragment or with
/// the REST response. Counts are signed so that out-of-range values reported by a
/// backend can be rejected by the ledger instead of failing deserialization.
///
/// # Examples
///
/// ```
/// # use conduit_llm::types::UsageStats;
/// let usage = UsageStats::new(1200, 200, 0.0042);
/// assert_eq!(usage.total_tokens, 1400);
/// assert!(usage.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    /// Always `prompt_tokens + completion_tokens`.
    pub total_tokens: i64,
    pub cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    /// Prompt tokens served from the provider's prompt cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<i64>,
    /// Prompt tokens written into the provider's prompt cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_tokens: Option<i64>,
}

impl UsageStats {
    pub fn new(prompt_tokens: i64, completion_tokens: i64, cost_usd: f64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            cost_usd,
            latency_ms: None,
            cache_read_tokens: None,
            cache_creation_tokens: None,
        }
    }

    pub fn with_latency_ms(mut self, latency_ms: f64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn with_cache(mut self, read_tokens: i64, creation_tokens: i64) -> Self {
        self.cache_read_tokens = Some(read_tokens);
        self.cache_creation_tokens = Some(creation_tokens);
        self
    }

    /// Rejects negative, non-finite, or inconsistent values.
    ///
    /// # Errors
    ///
    /// Returns [`LLMError::InvalidUsage`] naming the offending field.
    pub fn validate(&self) -> Result<(), LLMError> {
        let counts = [
            ("prompt_tokens", Some(self.prompt_tokens)),
            ("completion_tokens", Some(self.completion_tokens)),
            ("total_tokens", Some(self.total_tokens)),
            ("cache_read_tokens", self.cache_read_tokens),
            ("cache_creation_tokens", self.cache_creation_tokens),
        ];
        for (field, value) in counts {
            if let Some(value) = value {
                if value < 0 {
                    return Err(LLMError::invalid_usage(
                        field,
                        format!("must be non-negative, got {value}"),
                    ));
                }
            }
        }

        if !self.cost_usd.is_finite() || self.cost_usd < 0.0 {
            return Err(LLMError::invalid_usage(
                "cost_usd",
                format!("must be a non-negative number, got {}", self.cost_usd),
            ));
        }
        if let Some(latency) = self.latency_ms {
            if !latency.is_finite() || latency < 0.0 {
                return Err(LLMError::invalid_usage(
                    "latency_ms",
                    format!("must be a non-negative number, got {latency}"),
                ));
            }
        }

        let expected = self.prompt_tokens.checked_add(self.completion_tokens);
        if expected != Some(self.total_tokens) {
            return Err(LLMError::invalid_usage(
                "total_tokens",
                format!(
                    "expected prompt_tokens + completion_tokens = {}, got {}",
                    self.prompt_tokens.saturating_add(self.completion_tokens),
                    self.total_tokens
                ),
            ));
        }
        Ok(())
    }
}

/// One incremental unit of a streamed response.
///
/// On the wire a fragment is a JSON object carrying exactly one of `content`,
/// `error`, or `done: true` (the latter optionally with `usage`). An `error` key wins
/// over `done`, which wins over `content`.
///
/// # Examples
///
/// ```
/// # use conduit_llm::types::StreamFragment;
/// let fragment: StreamFragment = serde_json::from_str(r#"{"content":"Hel"}"#).unwrap();
/// assert_eq!(fragment, StreamFragment::Content("Hel".into()));
/// assert!(!fragment.is_terminal());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawFragment", into = "RawFragment")]
pub enum StreamFragment {
    /// Text appended to the assistant message.
    Content(String),
    /// Terminal failure reported by the backend.
    Error(String),
    /// Terminal success marker.
    Done { usage: Option<UsageStats> },
}

impl StreamFragment {
    /// `error` and `done` fragments end the session.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamFragment::Content(_))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RawFragment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    done: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    usage: Option<UsageStats>,
}

impl TryFrom<RawFragment> for StreamFragment {
    type Error = String;

    fn try_from(raw: RawFragment) -> Result<Self, String> {
        if let Some(message) = raw.error {
            return Ok(StreamFragment::Error(message));
        }
        if raw.done == Some(true) {
            return Ok(StreamFragment::Done { usage: raw.usage });
        }
        match raw.content {
            Some(text) => Ok(StreamFragment::Content(text)),
            None => Err("fragment carries none of `content`, `error`, or `done`".to_string()),
        }
    }
}

impl From<StreamFragment> for RawFragment {
    fn from(fragment: StreamFragment) -> Self {
        match fragment {
            StreamFragment::Content(text) => RawFragment {
                content: Some(text),
                ..RawFragment::default()
            },
            StreamFragment::Error(message) => RawFragment {
                error: Some(message),
                ..RawFragment::default()
            },
            StreamFragment::Done { usage } => RawFragment {
                done: Some(true),
                usage,
                ..RawFragment::default()
            },
        }
    }
}

/// Non-streaming response returned by `POST /chat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub usage: Option<UsageStats>,
}

/// Model entry returned by `GET /models/{provider}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub context_window: Option<u64>,
    #[serde(default)]
    pub max_output_tokens: Option<u64>,
}

/// Credential check performed by the backend while listing a provider's models.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ValidationInfo {
    pub validated: bool,
    pub api_key_set: bool,
    #[serde(default)]
    pub validation_time_ms: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Body of `GET /models/{provider}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelInfo>,
    #[serde(default)]
    pub validation: ValidationInfo,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
}

/// Error payload returned by failing REST endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub error: String,
    #[serde(default)]
    pub detail: Option<String>,
}
