//! Exchange adapter boundary
//!
//! Everything the book engine and the order executor need from a venue goes
//! through [`ExchangeAdapter`]: a depth-diff subscription, point-in-time
//! snapshots and signed order submission.

pub mod binance;

pub use binance::{BinanceAdapter, BinanceSettings};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::error::{ConnectorError, Result};
use crate::metrics;
use crate::order::{OrderStatus, OrderType, SequexId, Side, TimeInForce};
use crate::parser::{DepthEvent, DepthSnapshot};

/// Depth stream update speed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateSpeed {
    Ms100,
    Ms250,
    Ms500,
    Sec1,
}

impl UpdateSpeed {
    pub fn as_millis(&self) -> u64 {
        match self {
            Self::Ms100 => 100,
            Self::Ms250 => 250,
            Self::Ms500 => 500,
            Self::Sec1 => 1000,
        }
    }
}

impl FromStr for UpdateSpeed {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "100ms" => Ok(Self::Ms100),
            "250ms" => Ok(Self::Ms250),
            "500ms" => Ok(Self::Ms500),
            "1s" | "1000ms" => Ok(Self::Sec1),
            other => Err(ConnectorError::InvalidInput(format!(
                "unknown update speed {}",
                other
            ))),
        }
    }
}

/// Releases an adapter subscription. Called at most once.
pub type Unsubscribe = Box<dyn FnOnce() + Send + 'static>;

/// Item carried by a book's depth queue
#[derive(Debug)]
pub enum DepthMessage {
    Event(DepthEvent),
    Error(String),
}

/// Producer half of a book's bounded depth queue, handed to the adapter.
///
/// When the queue is full the newest event is dropped so the oldest
/// unconsumed events survive; the next admitted event then runs into the gap
/// branch and the book resynchronizes from a snapshot. Dropping every clone
/// of the sink signals stream end to the book.
#[derive(Debug, Clone)]
pub struct DepthSink {
    symbol: Arc<str>,
    tx: mpsc::Sender<DepthMessage>,
}

impl DepthSink {
    pub fn new(symbol: &str, tx: mpsc::Sender<DepthMessage>) -> Self {
        Self {
            symbol: Arc::from(symbol),
            tx,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Enqueue a diff event. Returns false once the book stopped consuming.
    pub fn push(&self, event: DepthEvent) -> bool {
        match self.tx.try_send(DepthMessage::Event(event)) {
            Ok(()) => true,
            Err(TrySendError::Full(DepthMessage::Event(dropped))) => {
                warn!(
                    symbol = %self.symbol,
                    first_update_id = dropped.first_update_id,
                    last_update_id = dropped.last_update_id,
                    "Depth queue full, dropping event"
                );
                metrics::global().depth_event(&self.symbol, "dropped_full");
                true
            }
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Forward an adapter-side error to the book's logger
    pub fn report(&self, error: &ConnectorError) -> bool {
        match self.tx.try_send(DepthMessage::Error(error.to_string())) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(symbol = %self.symbol, error = %error, "Depth queue full, error not forwarded");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Order as sent to the exchange; only market and limit kinds exist there
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSubmission {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub time_in_force: Option<TimeInForce>,
    pub client_order_id: SequexId,
}

impl OrderSubmission {
    pub fn market(client_order_id: SequexId, symbol: &str, side: Side, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            time_in_force: None,
            client_order_id,
        }
    }

    pub fn limit(
        client_order_id: SequexId,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        time_in_force: TimeInForce,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
            time_in_force: Some(time_in_force),
            client_order_id,
        }
    }

    /// Check the submission is expressible on the exchange
    pub fn validate(&self) -> Result<()> {
        match self.order_type {
            OrderType::Market => Ok(()),
            OrderType::Limit if self.price.is_some() && self.time_in_force.is_some() => Ok(()),
            OrderType::Limit => Err(ConnectorError::InvalidInput(
                "limit order requires price and time in force".to_string(),
            )),
            OrderType::StopMarket => Err(ConnectorError::InvalidInput(
                "stop-market orders are not submitted to the exchange".to_string(),
            )),
        }
    }
}

/// Exchange acknowledgement of a submitted order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub exchange_order_id: u64,
    pub client_order_id: String,
    pub status: OrderStatus,
    pub symbol: String,
}

/// Venue driver consumed by the book manager and the order executor
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Start feeding `symbol`'s depth diffs into `sink`
    async fn subscribe_depth(
        &self,
        symbol: &str,
        speed: UpdateSpeed,
        sink: DepthSink,
    ) -> Result<Unsubscribe>;

    /// Fetch a point-in-time image of the book
    async fn fetch_snapshot(&self, symbol: &str, limit: u32) -> Result<DepthSnapshot>;

    /// Submit a signed order and wait for the exchange's acknowledgement
    async fn submit_order(&self, order: OrderSubmission) -> Result<OrderAck>;
}
