use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, RequestBuilder};

use crate::error::LLMError;

use super::{DynHttpTransport, HttpMethod, HttpRequest, HttpResponse, HttpTransport};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// 基于 reqwest 的 HttpTransport
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// 使用自定义 reqwest::Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// 默认 Client：仅限制建连时间，整体超时由每个请求决定
    pub fn default_client() -> Result<Self, LLMError> {
        Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map(Self::new)
            .map_err(|err| LLMError::transport(format!("failed to build http client: {err}")))
    }

    fn prepare(&self, request: HttpRequest) -> Result<RequestBuilder, LLMError> {
        let method = match request.method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
        };
        let mut headers = HeaderMap::with_capacity(request.headers.len());
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| LLMError::validation(format!("invalid header name {name:?}: {err}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| LLMError::validation(format!("invalid value for header {name}: {err}")))?;
            headers.insert(name, value);
        }

        let mut builder = self.client.request(method, &request.url).headers(headers);
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        Ok(builder)
    }
}

/// Header values that are not visible ASCII are dropped.
fn collect_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn describe(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        format!("request timed out: {err}")
    } else if err.is_connect() {
        format!("could not reach gateway: {err}")
    } else {
        err.to_string()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, LLMError> {
        let method = request.method;
        let url = request.url.clone();
        let started = Instant::now();

        let response = self.prepare(request)?.send().await.map_err(|err| {
            tracing::debug!(method = method.as_str(), %url, error = %err, "request failed");
            LLMError::transport(describe(&err))
        })?;

        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|err| LLMError::transport(format!("failed to read response body: {}", describe(&err))))?;

        tracing::debug!(
            method = method.as_str(),
            %url,
            status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request finished"
        );
        Ok(HttpResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }
}

/// 便捷构造线程安全 Transport
pub fn default_dyn_transport() -> Result<DynHttpTransport, LLMError> {
    Ok(Arc::new(ReqwestTransport::default_client()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_header_is_a_validation_error() {
        let transport = ReqwestTransport::new(Client::new());
        let mut request = HttpRequest::get("http://gw.test/health");
        request
            .headers
            .insert("X-Bad".to_string(), "line\nbreak".to_string());

        let err = transport.prepare(request).expect_err("newline in header");
        assert!(matches!(err, LLMError::Validation { .. }));
    }

    #[test]
    fn non_ascii_header_values_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("3"));
        headers.insert(
            "x-note",
            HeaderValue::from_bytes(b"caf\xc3\xa9").expect("opaque bytes are allowed"),
        );

        let collected = collect_headers(&headers);
        assert_eq!(collected.get("retry-after").map(String::as_str), Some("3"));
        assert!(!collected.contains_key("x-note"));
    }
}
