//! REST plumbing for the gateway.
//!
//! Every REST endpoint is one JSON request and one JSON response, so the transport only
//! has to move complete buffers. Streaming never goes through here; see
//! [`crate::channel`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::LLMError;

pub mod reqwest;

/// Sent with every request so gateway logs can tell clients apart.
pub const USER_AGENT: &str = concat!("conduit-llm/", env!("CARGO_PKG_VERSION"));

const JSON: &str = "application/json";

/// The gateway only exposes GET and POST endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

/// One REST call to the gateway.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
    /// Whole-request deadline. `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    fn new(method: HttpMethod, url: String, body: Option<Vec<u8>>) -> Self {
        let mut headers = HashMap::from([
            ("Accept".to_string(), JSON.to_string()),
            ("User-Agent".to_string(), USER_AGENT.to_string()),
        ]);
        if body.is_some() {
            headers.insert("Content-Type".to_string(), JSON.to_string());
        }
        Self {
            method,
            url,
            headers,
            body,
            timeout: None,
        }
    }

    /// `GET url`, expecting JSON back.
    ///
    /// # Examples
    ///
    /// ```
    /// use conduit_llm::http::{HttpMethod, HttpRequest};
    ///
    /// let request = HttpRequest::get("http://localhost:8000/providers");
    /// assert_eq!(request.method, HttpMethod::Get);
    /// assert!(request.body.is_none());
    /// assert!(!request.headers.contains_key("Content-Type"));
    /// ```
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url.into(), None)
    }

    /// `POST url` with an already-serialized JSON body.
    ///
    /// ```
    /// use conduit_llm::http::{HttpMethod, HttpRequest};
    ///
    /// let request = HttpRequest::post_json("http://localhost:8000/cost/reset", b"{}".to_vec());
    /// assert_eq!(request.method, HttpMethod::Post);
    /// assert_eq!(request.headers.get("Content-Type").map(String::as_str), Some("application/json"));
    /// ```
    pub fn post_json(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self::new(HttpMethod::Post, url.into(), Some(body))
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Fully buffered response. Header names are stored as received.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Looks up a header case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Body as text with invalid sequences replaced, for error reporting.
    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Decodes the body as JSON. `context` names the endpoint in the error message.
    ///
    /// ```
    /// use conduit_llm::http::HttpResponse;
    ///
    /// let response = HttpResponse { status: 200, headers: Default::default(), body: br#"["openai"]"#.to_vec() };
    /// let providers: Vec<String> = response.json("/providers").unwrap();
    /// assert_eq!(providers, ["openai"]);
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`LLMError::Protocol`] when the body does not match `T`.
    pub fn json<T: DeserializeOwned>(&self, context: &str) -> Result<T, LLMError> {
        serde_json::from_slice(&self.body).map_err(|err| {
            LLMError::protocol(format!("failed to parse response from {context}: {err}"))
        })
    }
}

/// Moves REST requests to the gateway.
///
/// [`reqwest::ReqwestTransport`] is the production implementation. Tests swap in
/// scripted transports.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Resolves once the whole response body has been read.
    ///
    /// # Examples
    ///
    /// ```
    /// # use async_trait::async_trait;
    /// # use conduit_llm::http::{HttpTransport, HttpRequest, HttpResponse};
    /// # use conduit_llm::error::LLMError;
    /// struct Healthy;
    ///
    /// #[async_trait]
    /// impl HttpTransport for Healthy {
    ///     async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, LLMError> {
    ///         let body = br#"{"status":"ok","version":"1.0.0"}"#.to_vec();
    ///         Ok(HttpResponse { status: 200, headers: Default::default(), body })
    ///     }
    /// }
    ///
    /// # tokio::runtime::Runtime::new().unwrap().block_on(async {
    /// let response = Healthy.send(HttpRequest::get("http://localhost:8000/health")).await.unwrap();
    /// assert!(response.is_success());
    /// # });
    /// ```
    ///
    /// # Errors
    ///
    /// Network failures and timeouts map to [`LLMError::Transport`]. Non-2xx statuses
    /// are ordinary responses.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, LLMError>;
}

pub type DynHttpTransport = Arc<dyn HttpTransport>;

/// Serializes `body` and POSTs it.
///
/// # Errors
///
/// Returns [`LLMError::Validation`] if `body` cannot be serialized; nothing is sent then.
pub async fn post_json<T: Serialize + ?Sized>(
    transport: &dyn HttpTransport,
    url: impl Into<String>,
    body: &T,
    timeout: Option<Duration>,
) -> Result<HttpResponse, LLMError> {
    let payload = serde_json::to_vec(body)
        .map_err(|err| LLMError::validation(format!("failed to serialize request: {err}")))?;
    transport
        .send(HttpRequest::post_json(url, payload).with_timeout(timeout))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::ser;

    struct Unreachable;

    #[async_trait]
    impl HttpTransport for Unreachable {
        async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, LLMError> {
            panic!("nothing should be sent");
        }
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(ser::Error::custom("no json form"))
        }
    }

    #[tokio::test]
    async fn unserializable_body_is_rejected_before_sending() {
        let err = post_json(&Unreachable, "http://gw.test/chat", &Unserializable, None)
            .await
            .expect_err("serialization fails");
        match err {
            LLMError::Validation { message } => assert!(message.contains("no json form")),
            other => panic!("unexpected error type: {other:?}"),
        }
    }

    #[test]
    fn requests_carry_user_agent() {
        let request = HttpRequest::get("http://gw.test/health");
        assert_eq!(
            request.headers.get("User-Agent").map(String::as_str),
            Some(USER_AGENT)
        );
        assert!(USER_AGENT.starts_with("conduit-llm/"));
    }

    #[test]
    fn response_helpers() {
        let response = HttpResponse {
            status: 429,
            headers: HashMap::from([("retry-after".to_string(), "7".to_string())]),
            body: b"{\"oops\"".to_vec(),
        };
        assert_eq!(response.header("Retry-After"), Some("7"));
        assert!(!response.is_success());
        assert_eq!(response.text_lossy(), "{\"oops\"");
        assert!(matches!(
            response.json::<serde_json::Value>("/chat"),
            Err(LLMError::Protocol { .. })
        ));
    }
}
