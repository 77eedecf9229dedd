//! Bidirectional framed channel used by streaming sessions.
//!
//! The gateway's streaming endpoint accepts one serialized request right after the
//! connection opens and then pushes text frames until a terminal fragment. The traits
//! here only move frames; parsing and ordering guarantees live in [`crate::session`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::LLMError;

pub mod websocket;

/// Inbound unit read from a [`DuplexChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Text payload, expected to hold one JSON-encoded fragment.
    Text(String),
    /// A payload that could not be decoded as text. The reason is for logs only.
    Malformed(String),
    /// Close handshake initiated by the peer.
    Close,
}

/// An open, framed, bidirectional connection.
#[async_trait]
pub trait DuplexChannel: Send {
    /// Sends one text frame.
    ///
    /// # Errors
    ///
    /// Returns [`LLMError::Transport`] when the frame cannot be written.
    async fn send_text(&mut self, text: String) -> Result<(), LLMError>;

    /// Waits for the next inbound frame. `None` means the connection is gone.
    ///
    /// Implementations must be cancel-safe: dropping the returned future before it
    /// resolves must not lose a frame.
    async fn next_frame(&mut self) -> Option<Result<Frame, LLMError>>;

    /// Starts the close handshake. Calling it on a closed channel is a no-op.
    async fn close(&mut self) -> Result<(), LLMError>;
}

/// Boxed channel returned by [`ChannelConnector::connect`].
pub type BoxedChannel = Box<dyn DuplexChannel>;

/// Opens channels to a streaming endpoint.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    /// Completes the handshake with `url`.
    ///
    /// # Errors
    ///
    /// Returns [`LLMError::Transport`] when the handshake fails.
    async fn connect(&self, url: &str) -> Result<BoxedChannel, LLMError>;
}

/// Thread-safe handle to a connector implementation.
pub type DynChannelConnector = Arc<dyn ChannelConnector>;
