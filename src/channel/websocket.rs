use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::error::LLMError;

use super::{BoxedChannel, ChannelConnector, DuplexChannel, DynChannelConnector, Frame};

/// WebSocket connector backed by tokio-tungstenite.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl ChannelConnector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<BoxedChannel, LLMError> {
        let (stream, response) = connect_async(url)
            .await
            .map_err(|err| LLMError::transport(format!("websocket handshake failed: {err}")))?;
        tracing::debug!(%url, status = response.status().as_u16(), "websocket connected");
        Ok(Box::new(WebSocketChannel {
            stream,
            closed: false,
        }))
    }
}

struct WebSocketChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    closed: bool,
}

#[async_trait]
impl DuplexChannel for WebSocketChannel {
    async fn send_text(&mut self, text: String) -> Result<(), LLMError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|err| LLMError::transport(format!("failed to send frame: {err}")))
    }

    async fn next_frame(&mut self) -> Option<Result<Frame, LLMError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(err) => return Some(Err(LLMError::transport(err.to_string()))),
            };
            match message {
                Message::Text(text) => return Some(Ok(Frame::Text(text))),
                Message::Binary(bytes) => {
                    // Some gateways push JSON as binary frames.
                    return Some(Ok(match String::from_utf8(bytes) {
                        Ok(text) => Frame::Text(text),
                        Err(err) => Frame::Malformed(format!("binary frame is not UTF-8: {err}")),
                    }));
                }
                Message::Close(_) => {
                    self.closed = true;
                    return Some(Ok(Frame::Close));
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }

    async fn close(&mut self) -> Result<(), LLMError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .close(None)
            .await
            .map_err(|err| LLMError::transport(format!("failed to close websocket: {err}")))
    }
}

/// 便捷构造线程安全 Connector
pub fn default_dyn_connector() -> DynChannelConnector {
    Arc::new(WebSocketConnector)
}
