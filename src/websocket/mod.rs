//! WebSocket module for Binance connection management

mod client;
mod depth_stream;
mod session;

pub use client::WebSocketClient;
pub use depth_stream::{DepthStream, ReconnectPolicy};
pub use session::{order_params, OrderSession, SessionSettings};
