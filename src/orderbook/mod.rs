//! Order book module
//!
//! Maintains synchronized order book state from Binance depth diffs and
//! fans best bid/ask changes out to subscribers.

mod book;
mod manager;
mod worker;

pub use book::{OrderBook, Reconcile};
pub use manager::{BookManager, BookSettings};

use serde::{Deserialize, Serialize};

use crate::parser::PriceLevel;

/// Side of the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookSide {
    Bid,
    Ask,
}

/// Lifecycle of a single book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookState {
    /// No snapshot applied yet
    Fresh,
    /// At least one diff applied on top of a snapshot
    Synced,
    /// Shutdown requested, no further mutations
    Closing,
    Closed,
}

impl BookState {
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Fresh | Self::Synced)
    }
}

/// Best ask and best bid at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BestDepth {
    pub ask: PriceLevel,
    pub bid: PriceLevel,
}

/// Top-of-book view returned by depth queries, best level first
#[derive(Debug, Clone, Serialize)]
pub struct DepthView {
    pub symbol: String,
    pub event_time: u64,
    pub last_update_id: u64,
    pub asks: Vec<PriceLevel>,
    pub bids: Vec<PriceLevel>,
}
