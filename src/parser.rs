//! Parser module for Binance market-data and WebSocket-API messages
//!
//! Handles deserialization of depth diffs, REST snapshots and order
//! responses from the authenticated order channel.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::str::FromStr;

use crate::error::{ConnectorError, Result};

/// Binance depth diff event
#[derive(Debug, Clone, Deserialize)]
pub struct DepthEvent {
    /// Event type
    #[serde(rename = "e", default)]
    pub event_type: String,

    /// Event time (milliseconds)
    #[serde(rename = "E")]
    pub event_time: u64,

    /// Symbol
    #[serde(rename = "s")]
    pub symbol: String,

    /// First update ID in event
    #[serde(rename = "U")]
    pub first_update_id: u64,

    /// Final update ID in event
    #[serde(rename = "u")]
    pub last_update_id: u64,

    /// Bids to update
    #[serde(rename = "b", deserialize_with = "deserialize_price_levels")]
    pub bids: Vec<PriceLevel>,

    /// Asks to update
    #[serde(rename = "a", deserialize_with = "deserialize_price_levels")]
    pub asks: Vec<PriceLevel>,
}

/// Price level (price, size pair). A zero size removes the price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }

    /// Parse a level from its textual exchange representation
    pub fn parse(price: &str, size: &str) -> Result<Self> {
        Ok(Self {
            price: Decimal::from_str(price)?,
            size: Decimal::from_str(size)?,
        })
    }
}

/// Order book snapshot from REST API
#[derive(Debug, Clone, Deserialize)]
pub struct DepthSnapshot {
    /// Last update ID
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,

    /// Bids
    #[serde(deserialize_with = "deserialize_price_levels")]
    pub bids: Vec<PriceLevel>,

    /// Asks
    #[serde(deserialize_with = "deserialize_price_levels")]
    pub asks: Vec<PriceLevel>,
}

/// Combined stream message wrapper
#[derive(Debug, Clone, Deserialize)]
pub struct StreamMessage {
    /// Stream name
    pub stream: String,

    /// Data payload
    pub data: serde_json::Value,
}

/// Parsed market-data WebSocket message
#[derive(Debug, Clone)]
pub enum ParsedMessage {
    DepthUpdate(DepthEvent),
    Unknown(String),
}

impl ParsedMessage {
    /// Parse a raw WebSocket message
    pub fn parse(raw: &str) -> std::result::Result<Self, serde_json::Error> {
        // Combined streams wrap the payload in {"stream", "data"}
        if let Ok(stream_msg) = serde_json::from_str::<StreamMessage>(raw) {
            return Self::parse_stream_data(&stream_msg.stream, stream_msg.data);
        }

        if let Ok(depth) = serde_json::from_str::<DepthEvent>(raw) {
            if depth.event_type == "depthUpdate" {
                return Ok(ParsedMessage::DepthUpdate(depth));
            }
        }

        Ok(ParsedMessage::Unknown(raw.to_string()))
    }

    fn parse_stream_data(
        stream: &str,
        data: serde_json::Value,
    ) -> std::result::Result<Self, serde_json::Error> {
        if stream.contains("@depth") {
            let depth: DepthEvent = serde_json::from_value(data)?;
            Ok(ParsedMessage::DepthUpdate(depth))
        } else {
            Ok(ParsedMessage::Unknown(data.to_string()))
        }
    }
}

/// Binance error body, shared by REST and WebSocket-API responses
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub code: i64,
    pub msg: String,
}

impl From<ApiErrorBody> for ConnectorError {
    fn from(body: ApiErrorBody) -> Self {
        ConnectorError::ExchangeRejected {
            code: body.code,
            message: body.msg,
        }
    }
}

/// Envelope of every response on the WebSocket-API channel
#[derive(Debug, Clone, Deserialize)]
pub struct WsApiResponse {
    pub id: Option<String>,
    pub status: u16,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<ApiErrorBody>,
}

impl WsApiResponse {
    /// Split the envelope into its payload or the exchange's rejection
    pub fn into_result(self) -> Result<serde_json::Value> {
        if let Some(error) = self.error {
            return Err(error.into());
        }
        match self.result {
            Some(result) if (200..300).contains(&self.status) => Ok(result),
            _ => Err(ConnectorError::Parse(format!(
                "response {:?} with status {} carried no result",
                self.id, self.status
            ))),
        }
    }
}

/// `result` payload of an `order.place` response
#[derive(Debug, Clone, Deserialize)]
pub struct OrderPlaceResult {
    pub symbol: String,

    #[serde(rename = "orderId")]
    pub order_id: u64,

    #[serde(rename = "clientOrderId")]
    pub client_order_id: String,

    pub status: String,
}

/// Custom deserializer for price levels from array of string pairs
fn deserialize_price_levels<'de, D>(deserializer: D) -> std::result::Result<Vec<PriceLevel>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<Vec<String>> = Deserialize::deserialize(deserializer)?;
    raw.into_iter()
        .map(|pair| {
            if pair.len() != 2 {
                return Err(serde::de::Error::custom("Invalid price level format"));
            }
            Ok(PriceLevel {
                price: Decimal::from_str(&pair[0]).map_err(serde::de::Error::custom)?,
                size: Decimal::from_str(&pair[1]).map_err(serde::de::Error::custom)?,
            })
        })
        .collect()
}
