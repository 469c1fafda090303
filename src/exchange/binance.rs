//! Binance spot adapter
//!
//! Public depth diffs over the market-data WebSocket, snapshots over REST
//! and signed orders over the WebSocket API.

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{DepthSink, ExchangeAdapter, OrderAck, OrderSubmission, Unsubscribe, UpdateSpeed};
use crate::auth::{ApiCredentials, RequestSigner};
use crate::error::{ConnectorError, Result};
use crate::parser::{ApiErrorBody, DepthSnapshot};
use crate::websocket::{DepthStream, OrderSession, ReconnectPolicy, SessionSettings, WebSocketClient};

/// Endpoints and deadlines for the Binance adapter
#[derive(Debug, Clone)]
pub struct BinanceSettings {
    pub ws_endpoint: String,
    pub ws_api_endpoint: String,
    pub rest_endpoint: String,
    pub rest_timeout: Duration,
    pub handshake_timeout: Duration,
    pub order_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for BinanceSettings {
    fn default() -> Self {
        Self {
            ws_endpoint: "wss://stream.binance.com:9443/ws".to_string(),
            ws_api_endpoint: "wss://ws-api.binance.com:443/ws-api/v3".to_string(),
            rest_endpoint: "https://api.binance.com/api/v3".to_string(),
            rest_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            order_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Stream name for a symbol's diff depth feed. Spot offers 100ms and 1s only.
pub fn depth_stream_name(symbol: &str, speed: UpdateSpeed) -> Result<String> {
    let symbol = symbol.to_lowercase();
    match speed {
        UpdateSpeed::Ms100 => Ok(format!("{}@depth@100ms", symbol)),
        UpdateSpeed::Sec1 => Ok(format!("{}@depth", symbol)),
        UpdateSpeed::Ms250 | UpdateSpeed::Ms500 => Err(ConnectorError::InvalidInput(format!(
            "update speed {}ms not offered on spot depth streams",
            speed.as_millis()
        ))),
    }
}

/// Binance spot adapter. Built with credentials it can also place orders.
pub struct BinanceAdapter {
    settings: BinanceSettings,
    http: reqwest::Client,
    session: Option<OrderSession>,
}

impl BinanceAdapter {
    /// Market data only
    pub fn public(settings: BinanceSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.rest_timeout)
            .build()?;
        Ok(Self {
            settings,
            http,
            session: None,
        })
    }

    /// Market data plus an order session signed with `credentials`
    pub fn with_credentials(settings: BinanceSettings, credentials: ApiCredentials) -> Result<Self> {
        let session = OrderSession::new(
            SessionSettings {
                url: settings.ws_api_endpoint.clone(),
                handshake_timeout: settings.handshake_timeout,
                request_timeout: settings.order_timeout,
            },
            RequestSigner::new(credentials),
        );
        let mut adapter = Self::public(settings)?;
        adapter.session = Some(session);
        Ok(adapter)
    }

    pub fn settings(&self) -> &BinanceSettings {
        &self.settings
    }

    pub fn session(&self) -> Option<&OrderSession> {
        self.session.as_ref()
    }

    fn stream_url(&self, symbol: &str, speed: UpdateSpeed) -> Result<String> {
        let stream = depth_stream_name(symbol, speed)?;
        Ok(format!(
            "{}/{}",
            self.settings.ws_endpoint.trim_end_matches('/'),
            stream
        ))
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    async fn subscribe_depth(
        &self,
        symbol: &str,
        speed: UpdateSpeed,
        sink: DepthSink,
    ) -> Result<Unsubscribe> {
        let url = self.stream_url(symbol, speed)?;

        // A refused first connection fails the subscription
        let mut client = WebSocketClient::new(&url, self.settings.handshake_timeout);
        client.connect().await?;

        let cancel = CancellationToken::new();
        let stream = DepthStream::new(
            client,
            sink,
            self.settings.reconnect.clone(),
            cancel.clone(),
        );
        tokio::spawn(stream.run());

        info!(symbol = %symbol, url = %url, "Subscribed to depth stream");
        Ok(Box::new(move || cancel.cancel()))
    }

    async fn fetch_snapshot(&self, symbol: &str, limit: u32) -> Result<DepthSnapshot> {
        let url = format!("{}/depth", self.settings.rest_endpoint.trim_end_matches('/'));
        let limit = limit.to_string();
        debug!(symbol = %symbol, limit = %limit, "Fetching depth snapshot");

        let response = self
            .http
            .get(&url)
            .query(&[("symbol", symbol), ("limit", limit.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match serde_json::from_str::<ApiErrorBody>(&body) {
                Ok(error) => error.into(),
                Err(_) => ConnectorError::Transport(format!(
                    "snapshot request failed with {}: {}",
                    status, body
                )),
            });
        }

        let snapshot: DepthSnapshot = response.json().await?;
        debug!(
            symbol = %symbol,
            last_update_id = snapshot.last_update_id,
            bid_levels = snapshot.bids.len(),
            ask_levels = snapshot.asks.len(),
            "Depth snapshot received"
        );
        Ok(snapshot)
    }

    async fn submit_order(&self, order: OrderSubmission) -> Result<OrderAck> {
        let session = self.session.as_ref().ok_or_else(|| {
            ConnectorError::InvalidInput("adapter has no account credentials".to_string())
        })?;
        order.validate()?;
        session.place_order(&order).await
    }
}
