//! Sequex spot connector
//!
//! Keeps live order books in sync with Binance depth diffs and executes
//! market, limit and client-side stop-market orders for multiple accounts.

use std::sync::Arc;

pub mod auth;
pub mod bus;
pub mod config;
pub mod error;
pub mod exchange;
pub mod metrics;
pub mod order;
pub mod orderbook;
pub mod parser;
pub mod publisher;
pub mod websocket;

pub use bus::{BestDepthBus, BestDepthSubscription};
pub use config::Config;
pub use error::{ConnectorError, ErrorKind, Result};
pub use exchange::{BinanceAdapter, ExchangeAdapter, UpdateSpeed};
pub use order::{AccountRegistry, Order, OrderExecutor, OrderResponse, OrderStatus, SequexId, Side};
pub use orderbook::{BestDepth, BookManager, BookState, OrderBook};
pub use parser::{DepthEvent, DepthSnapshot, PriceLevel};
pub use publisher::Publisher;

/// Application state shared across components
pub struct AppState {
    pub books: Arc<BookManager>,
    pub accounts: Arc<AccountRegistry>,
    pub config: Arc<Config>,
}
