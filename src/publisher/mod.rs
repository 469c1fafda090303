//! Publisher module for IPC communication
//!
//! Forwards best-depth ticks to other system components over a Unix socket.
//! Frames are a 4-byte big-endian length followed by a MessagePack body.

use bytes::{BufMut, Bytes, BytesMut};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ConnectorError, Result};
use crate::orderbook::{BestDepth, BookManager};

/// Best bid/ask tick as published over IPC
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestDepthMessage {
    pub symbol: String,
    pub ask_price: Decimal,
    pub ask_size: Decimal,
    pub bid_price: Decimal,
    pub bid_size: Decimal,
    pub last_update_id: u64,
    pub event_time: u64,
}

impl BestDepthMessage {
    pub fn new(symbol: &str, depth: &BestDepth, last_update_id: u64, event_time: u64) -> Self {
        Self {
            symbol: symbol.to_string(),
            ask_price: depth.ask.price,
            ask_size: depth.ask.size,
            bid_price: depth.bid.price,
            bid_size: depth.bid.size,
            last_update_id,
            event_time,
        }
    }
}

/// Length-prefixed MessagePack frame
pub fn encode_frame(message: &BestDepthMessage) -> Result<Bytes> {
    let data = rmp_serde::to_vec(message)
        .map_err(|e| ConnectorError::Serialization(format!("Failed to serialize: {}", e)))?;

    let mut frame = BytesMut::with_capacity(4 + data.len());
    frame.put_u32(data.len() as u32);
    frame.put_slice(&data);
    Ok(frame.freeze())
}

/// Publisher for sending best-depth ticks via Unix socket
pub struct Publisher {
    socket_path: String,
    stream: Mutex<Option<UnixStream>>,
}

impl Publisher {
    pub async fn new(socket_path: &str) -> Self {
        let publisher = Self {
            socket_path: socket_path.to_string(),
            stream: Mutex::new(None),
        };

        // Consumer may not be up yet
        if let Err(e) = publisher.connect().await {
            warn!(error = %e, "Initial IPC connection failed, will retry on publish");
        }

        publisher
    }

    async fn connect(&self) -> Result<()> {
        let path = Path::new(&self.socket_path);
        if !path.exists() {
            return Err(ConnectorError::Ipc(format!(
                "Socket path does not exist: {}",
                self.socket_path
            )));
        }

        let stream = UnixStream::connect(path).await.map_err(|e| {
            ConnectorError::Ipc(format!("Failed to connect to {}: {}", self.socket_path, e))
        })?;
        *self.stream.lock().await = Some(stream);

        info!(path = %self.socket_path, "Connected to IPC socket");
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    /// Publish one tick. IPC failures are logged and swallowed.
    pub async fn publish(&self, message: &BestDepthMessage) -> Result<()> {
        let frame = encode_frame(message)?;

        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            drop(guard);
            if let Err(e) = self.connect().await {
                debug!(error = %e, "Failed to reconnect to IPC socket");
                return Ok(());
            }
            guard = self.stream.lock().await;
        }

        if let Some(stream) = guard.as_mut() {
            match stream.write_all(&frame).await {
                Ok(()) => debug!(
                    symbol = %message.symbol,
                    update_id = message.last_update_id,
                    "Published best depth"
                ),
                Err(e) => {
                    warn!(error = %e, "Failed to write to IPC socket");
                    *guard = None;
                }
            }
        }

        Ok(())
    }

    /// Drain ticks from book subscriptions and publish them with the book's
    /// current sequence id.
    pub fn spawn_forwarder(
        self: Arc<Self>,
        books: Arc<BookManager>,
        mut ticks: mpsc::UnboundedReceiver<(String, BestDepth)>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some((symbol, depth)) = ticks.recv().await {
                let view = match books.get_depth(&symbol, 0).await {
                    Ok(view) => view,
                    Err(e) => {
                        debug!(symbol = %symbol, error = %e, "Skipping tick for unavailable book");
                        continue;
                    }
                };
                let message =
                    BestDepthMessage::new(&symbol, &depth, view.last_update_id, view.event_time);
                if let Err(e) = self.publish(&message).await {
                    warn!(symbol = %symbol, error = %e, "Failed to publish best depth");
                }
            }
            debug!("Publisher forwarder stopped");
        })
    }
}
