//! WebSocket client for Binance streams
//!
//! Handles connection and message reception for one stream URL.

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::Message,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::error::{ConnectorError, Result};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open a WebSocket, failing with `Transport` if the handshake outlives `deadline`
pub(crate) async fn connect_with_deadline(url: &str, deadline: Duration) -> Result<WsStream> {
    match timeout(deadline, connect_async(url)).await {
        Ok(Ok((stream, response))) => {
            info!(url = %url, status = ?response.status(), "WebSocket connected");
            Ok(stream)
        }
        Ok(Err(e)) => Err(ConnectorError::Transport(format!(
            "failed to connect to {}: {}",
            url, e
        ))),
        Err(_) => Err(ConnectorError::Transport(format!(
            "handshake with {} timed out after {:?}",
            url, deadline
        ))),
    }
}

/// WebSocket client for a single connection
pub struct WebSocketClient {
    stream: Option<WsStream>,
    url: String,
    handshake_timeout: Duration,
}

impl WebSocketClient {
    pub fn new(url: &str, handshake_timeout: Duration) -> Self {
        Self {
            stream: None,
            url: url.to_string(),
            handshake_timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Connect to the WebSocket endpoint
    pub async fn connect(&mut self) -> Result<()> {
        debug!(url = %self.url, "Connecting to Binance WebSocket");
        let stream = connect_with_deadline(&self.url, self.handshake_timeout).await?;
        self.stream = Some(stream);
        Ok(())
    }

    /// Receive the next message. `Ok(None)` for control frames.
    pub async fn recv(&mut self) -> Result<Option<String>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ConnectorError::Transport("not connected".to_string()))?;

        match stream.next().await {
            Some(Ok(Message::Text(text))) => Ok(Some(text)),
            Some(Ok(Message::Binary(data))) => Ok(Some(String::from_utf8_lossy(&data).to_string())),
            Some(Ok(Message::Ping(data))) => {
                debug!("Received ping, sending pong");
                if let Err(e) = stream.send(Message::Pong(data)).await {
                    warn!(error = %e, "Failed to answer ping");
                }
                Ok(None)
            }
            Some(Ok(Message::Pong(_))) => {
                debug!("Received pong");
                Ok(None)
            }
            Some(Ok(Message::Close(frame))) => {
                warn!(frame = ?frame, "Received close frame");
                self.stream = None;
                Err(ConnectorError::Transport("connection closed".to_string()))
            }
            Some(Ok(Message::Frame(_))) => Ok(None),
            Some(Err(e)) => {
                error!(error = %e, "WebSocket error");
                self.stream = None;
                Err(e.into())
            }
            None => {
                warn!("WebSocket stream ended");
                self.stream = None;
                Err(ConnectorError::Transport("stream ended".to_string()))
            }
        }
    }

    /// Send a ping to keep connection alive
    pub async fn ping(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.as_mut() {
            stream.send(Message::Ping(vec![])).await?;
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Close the connection
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }
}
