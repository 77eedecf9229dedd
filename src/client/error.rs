use std::collections::HashMap;
use std::time::Duration;

use crate::error::LLMError;
use crate::types::ApiErrorBody;

/// Maps a non-2xx REST response to [`LLMError::Provider`].
///
/// The backend's `{error, detail}` payload is forwarded verbatim. Bodies that do not
/// match it are surfaced as-is so nothing is lost.
pub(crate) fn parse_api_error(
    status: u16,
    headers: &HashMap<String, String>,
    body: &str,
) -> LLMError {
    let (message, detail) = match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) => (parsed.error, parsed.detail),
        Err(_) if body.trim().is_empty() => (format!("request failed with status {status}"), None),
        Err(_) => (body.trim().to_string(), None),
    };

    LLMError::Provider {
        status,
        message,
        detail,
        retry_after: retry_after_from_headers(headers),
    }
}

/// Extracts the `Retry-After` header (in seconds) if present.
///
/// HTTP-date values are ignored; the gateway only sends the numeric form.
pub(crate) fn retry_after_from_headers(headers: &HashMap<String, String>) -> Option<Duration> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("retry-after"))
        .and_then(|(_, value)| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
