//! Order module
//!
//! Order data model plus the per-account executor that submits market and
//! limit orders and realizes stop-market orders client-side.

mod accounts;
mod executor;
mod stop;

pub use accounts::AccountRegistry;
pub use executor::{ExecutorSettings, OrderExecutor};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{ConnectorError, Result};
use crate::orderbook::BestDepth;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_binance_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl FromStr for Side {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            other => Err(ConnectorError::InvalidInput(format!("unknown side {}", other))),
        }
    }
}

/// Order kind. Stop-market never reaches the exchange as such.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    StopMarket,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Market => "MARKET",
            Self::Limit => "LIMIT",
            Self::StopMarket => "STOP_MARKET",
        }
    }
}

/// Time in force for limit orders
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Good Till Canceled
    GTC,
    /// Immediate Or Cancel
    IOC,
    /// Fill Or Kill
    FOK,
}

impl TimeInForce {
    pub fn as_binance_str(&self) -> &'static str {
        match self {
            Self::GTC => "GTC",
            Self::IOC => "IOC",
            Self::FOK => "FOK",
        }
    }
}

impl FromStr for TimeInForce {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GTC" => Ok(Self::GTC),
            "IOC" => Ok(Self::IOC),
            "FOK" => Ok(Self::FOK),
            other => Err(ConnectorError::InvalidInput(format!(
                "invalid time in force {}",
                other
            ))),
        }
    }
}

/// Order status as reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Held locally; only stop-market orders waiting for their trigger
    LocalPending,
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
    PendingCancel,
}

impl OrderStatus {
    /// Convert from Binance string representation
    pub fn from_binance_str(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(Self::New),
            "PARTIALLY_FILLED" => Some(Self::PartiallyFilled),
            "FILLED" => Some(Self::Filled),
            "CANCELED" => Some(Self::Canceled),
            "REJECTED" => Some(Self::Rejected),
            "EXPIRED" => Some(Self::Expired),
            "PENDING_CANCEL" => Some(Self::PendingCancel),
            _ => None,
        }
    }
}

/// Locally generated client order id, echoed to the exchange
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequexId(String);

impl SequexId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SequexId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SequexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SequexId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// An order request, dispatched by kind at the executor entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Order {
    Market {
        symbol: String,
        side: Side,
        quantity: Decimal,
    },
    Limit {
        symbol: String,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        time_in_force: TimeInForce,
    },
    StopMarket {
        symbol: String,
        side: Side,
        quantity: Decimal,
        stop_price: Decimal,
    },
}

impl Order {
    pub fn kind(&self) -> OrderType {
        match self {
            Self::Market { .. } => OrderType::Market,
            Self::Limit { .. } => OrderType::Limit,
            Self::StopMarket { .. } => OrderType::StopMarket,
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            Self::Market { symbol, .. }
            | Self::Limit { symbol, .. }
            | Self::StopMarket { symbol, .. } => symbol,
        }
    }
}

/// An armed stop-market order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopMarketOrder {
    pub client_order_id: SequexId,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub stop_price: Decimal,
}

impl StopMarketOrder {
    /// BUY triggers once the best ask reaches the stop; SELL once the best bid falls to it.
    pub fn is_triggered_by(&self, depth: &BestDepth) -> bool {
        match self.side {
            Side::Buy => depth.ask.price >= self.stop_price,
            Side::Sell => depth.bid.price <= self.stop_price,
        }
    }
}

/// Result of an order operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResponse {
    pub sequex_id: SequexId,
    pub exchange_order_id: Option<u64>,
    pub status: OrderStatus,
    pub symbol: String,
}

/// Parse a decimal order field, reporting the field on failure
pub fn parse_decimal(field: &str, raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw.trim())
        .map_err(|e| ConnectorError::InvalidInput(format!("{} {:?}: {}", field, raw, e)))
}

pub(crate) fn validate_symbol(symbol: &str) -> Result<()> {
    if symbol.is_empty() || !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ConnectorError::InvalidInput(format!(
            "invalid symbol {:?}",
            symbol
        )));
    }
    Ok(())
}

pub(crate) fn validate_positive(field: &str, value: Decimal) -> Result<()> {
    if value <= Decimal::ZERO {
        return Err(ConnectorError::InvalidInput(format!(
            "{} must be positive, got {}",
            field, value
        )));
    }
    Ok(())
}
