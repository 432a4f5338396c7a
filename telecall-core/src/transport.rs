//! Relay transport implementations
//!
//! [`WebSocketTransport`] speaks the JSON frame protocol from
//! [`crate::protocol`] over a WebSocket connection to the relay.

use crate::protocol::{ClientMessage, RelayMessage, MAX_FRAME_SIZE};
use crate::signaling::{RelayConnection, SignalingTransport};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection error
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Send error
    #[error("Send error: {0}")]
    SendError(String),

    /// Receive error
    #[error("Receive error: {0}")]
    ReceiveError(String),

    /// Frame could not be encoded or decoded
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

/// WebSocket transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Relay URL, e.g. `wss://relay.example.org/ws`
    pub url: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".to_string(),
        }
    }
}

/// WebSocket transport to the signaling relay
///
/// Every call to [`SignalingTransport::connect`] opens a fresh socket, which
/// is what the channel's reconnect loop relies on.
pub struct WebSocketTransport {
    config: TransportConfig,
}

impl WebSocketTransport {
    /// Create new WebSocket transport
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    /// Get transport configuration
    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

#[async_trait]
impl SignalingTransport for WebSocketTransport {
    #[tracing::instrument(skip(self), fields(url = %self.config.url))]
    async fn connect(&self) -> Result<Box<dyn RelayConnection>, TransportError> {
        let (stream, _) = connect_async(self.config.url.as_str())
            .await
            .map_err(|e| TransportError::ConnectionError(format!("websocket connect failed: {e}")))?;
        tracing::debug!("Relay websocket connected");
        Ok(Box::new(WebSocketConnection { stream }))
    }
}

struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WebSocketConnection {
    fn decode(text: &str) -> Result<RelayMessage, TransportError> {
        if text.len() > MAX_FRAME_SIZE {
            return Err(TransportError::InvalidFrame(format!(
                "frame of {} bytes exceeds limit of {} bytes",
                text.len(),
                MAX_FRAME_SIZE
            )));
        }
        serde_json::from_str(text).map_err(|e| TransportError::InvalidFrame(e.to_string()))
    }
}

#[async_trait]
impl RelayConnection for WebSocketConnection {
    async fn send(&mut self, frame: ClientMessage) -> Result<(), TransportError> {
        let text =
            serde_json::to_string(&frame).map_err(|e| TransportError::InvalidFrame(e.to_string()))?;
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::SendError(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<RelayMessage>, TransportError> {
        loop {
            let Some(message) = self.stream.next().await else {
                return Ok(None);
            };
            match message {
                Ok(Message::Text(text)) => match Self::decode(text.as_str()) {
                    Ok(frame) => return Ok(Some(frame)),
                    Err(e) => {
                        tracing::warn!(error = %e, "Dropping undecodable relay frame");
                    }
                },
                Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                    Ok(text) => match Self::decode(text) {
                        Ok(frame) => return Ok(Some(frame)),
                        Err(e) => {
                            tracing::warn!(error = %e, "Dropping undecodable relay frame");
                        }
                    },
                    Err(_) => tracing::warn!(len = data.len(), "Dropping non-UTF-8 binary frame"),
                },
                Ok(Message::Close(_)) => return Ok(None),
                Ok(_) => {}
                Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => return Ok(None),
                Err(e) => return Err(TransportError::ReceiveError(e.to_string())),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.stream.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::ConnectionError(e.to_string())),
        }
    }
}
