use std::time::Duration;

use thiserror::Error;

/// Aggregates every failure mode exposed by the gateway client.
///
/// Streaming failures never surface as a returned error: the session folds them into
/// [`crate::session::SessionObserver::on_error`]. REST calls and ledger updates return
/// them directly so callers can decide on retries or user-facing messages.
#[derive(Debug, Error)]
pub enum LLMError {
    /// Represents connection-level failures. No partial data is trusted.
    #[error("transport error: {message}")]
    Transport { message: String },
    /// Raised when a fragment or response body does not match the expected shape.
    #[error("protocol error: {message}")]
    Protocol { message: String },
    /// Wraps a REST failure reported by the backend, kept verbatim.
    #[error("provider error (status {status}): {message}")]
    Provider {
        /// HTTP status code returned by the backend.
        status: u16,
        /// Human-readable `error` field from the payload, or the raw body.
        message: String,
        /// Optional `detail` field from the payload.
        detail: Option<String>,
        /// Wait duration suggested by a numeric `Retry-After` header.
        retry_after: Option<Duration>,
    },
    /// Rejects accounting values that are negative or inconsistent.
    #[error("invalid usage for {field}: {reason}")]
    InvalidUsage {
        /// Name of the usage field that failed validation.
        field: &'static str,
        /// Explanation of why the value was rejected.
        reason: String,
    },
    /// Signals a malformed request caught before anything was sent.
    #[error("invalid request: {message}")]
    Validation { message: String },
    /// Raised when building or validating configuration fails.
    #[error("invalid configuration for {field}: {reason}")]
    InvalidConfig {
        /// Name of the configuration field that failed validation.
        field: String,
        /// Additional context explaining why the field is invalid.
        reason: String,
    },
    /// Signals that a streaming channel closed before delivering a terminal fragment.
    #[error("stream closed unexpectedly: {message}")]
    StreamClosed { message: String },
}

impl LLMError {
    /// Creates an [`LLMError::Transport`] from a textual description.
    ///
    /// # Examples
    ///
    /// ```
    /// use conduit_llm::error::LLMError;
    ///
    /// let err = LLMError::transport("dns lookup failed");
    /// assert!(matches!(err, LLMError::Transport { .. }));
    /// ```
    pub fn transport<T: Into<String>>(message: T) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates an [`LLMError::Protocol`] from a textual description.
    pub fn protocol<T: Into<String>>(message: T) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates an [`LLMError::Validation`] from a textual description.
    ///
    /// # Examples
    ///
    /// ```
    /// use conduit_llm::error::LLMError;
    ///
    /// let err = LLMError::validation("messages must not be empty");
    /// assert_eq!(err.to_string(), "invalid request: messages must not be empty");
    /// ```
    pub fn validation<T: Into<String>>(message: T) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_usage<T: Into<String>>(field: &'static str, reason: T) -> Self {
        Self::InvalidUsage {
            field,
            reason: reason.into(),
        }
    }

    /// HTTP status attached to a backend failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Provider { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns `true` when the backend throttled the request.
    ///
    /// The client never retries on its own; this only helps callers pick a policy.
    pub fn is_rate_limited(&self) -> bool {
        self.status() == Some(429)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_exposes_status_and_rate_limit() {
        let err = LLMError::Provider {
            status: 429,
            message: "slow down".to_string(),
            detail: None,
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(err.status(), Some(429));
        assert!(err.is_rate_limited());
        assert_eq!(err.to_string(), "provider error (status 429): slow down");
    }

    #[test]
    fn non_provider_errors_have_no_status() {
        let err = LLMError::protocol("bad frame");
        assert_eq!(err.status(), None);
        assert!(!err.is_rate_limited());
    }
}
