//! Authenticated WebSocket-API order session
//!
//! One persistent connection per account. Requests carry a UUID id and are
//! matched to responses through a pending map of one-shot channels. The
//! connection is opened lazily and reopened by the next request after a drop.

use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::client::{connect_with_deadline, WsStream};
use crate::auth::RequestSigner;
use crate::error::{ConnectorError, Result};
use crate::exchange::{OrderAck, OrderSubmission};
use crate::order::{OrderStatus, OrderType};
use crate::parser::{OrderPlaceResult, WsApiResponse};

type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;
type PendingMap = DashMap<String, oneshot::Sender<Result<Value>>>;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub url: String,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
}

/// Signed request/response channel for one account
pub struct OrderSession {
    settings: SessionSettings,
    signer: RequestSigner,
    writer: Mutex<Option<WsWriter>>,
    pending: Arc<PendingMap>,
    connected: Arc<AtomicBool>,
    reader: StdMutex<Option<JoinHandle<()>>>,
    requests_sent: AtomicU64,
}

impl OrderSession {
    pub fn new(settings: SessionSettings, signer: RequestSigner) -> Self {
        Self {
            settings,
            signer,
            writer: Mutex::new(None),
            pending: Arc::new(DashMap::new()),
            connected: Arc::new(AtomicBool::new(false)),
            reader: StdMutex::new(None),
            requests_sent: AtomicU64::new(0),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Requests awaiting a response
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub fn requests_sent(&self) -> u64 {
        self.requests_sent.load(Ordering::Relaxed)
    }

    /// Submit `order.place` and wait for the exchange's answer
    pub async fn place_order(&self, order: &OrderSubmission) -> Result<OrderAck> {
        let params = order_params(order)?;
        let value = self.request("order.place", params).await?;
        let placed: OrderPlaceResult = serde_json::from_value(value)?;

        let status = OrderStatus::from_binance_str(&placed.status).ok_or_else(|| {
            ConnectorError::Parse(format!("unknown order status {}", placed.status))
        })?;

        Ok(OrderAck {
            exchange_order_id: placed.order_id,
            client_order_id: placed.client_order_id,
            status,
            symbol: placed.symbol,
        })
    }

    /// Send one signed request
    pub async fn request(&self, method: &str, params: BTreeMap<String, String>) -> Result<Value> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        if let Err(e) = self.send(&id, method, params, tx).await {
            self.pending.remove(&id);
            return Err(e);
        }
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
        debug!(request_id = %id, method, "WebSocket-API request sent");

        match timeout(self.settings.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConnectorError::Transport(
                "order session dropped the request".to_string(),
            )),
            Err(_) => {
                self.pending.remove(&id);
                Err(ConnectorError::Transport(format!(
                    "request {} timed out after {:?}",
                    id, self.settings.request_timeout
                )))
            }
        }
    }

    async fn send(
        &self,
        id: &str,
        method: &str,
        params: BTreeMap<String, String>,
        reply: oneshot::Sender<Result<Value>>,
    ) -> Result<()> {
        let mut writer = self.writer.lock().await;

        if writer.is_none() || !self.is_connected() {
            *writer = Some(self.connect().await?);
        }
        let Some(sink) = writer.as_mut() else {
            return Err(ConnectorError::Transport("order session not connected".to_string()));
        };

        // Timestamp taken once the socket is up so the handshake does not eat recvWindow
        let params = self
            .signer
            .sign_params(params, chrono::Utc::now().timestamp_millis());
        let payload = json!({ "id": id, "method": method, "params": params }).to_string();
        self.pending.insert(id.to_string(), reply);

        if let Err(e) = sink.send(Message::Text(payload)).await {
            *writer = None;
            self.connected.store(false, Ordering::Release);
            return Err(e.into());
        }
        Ok(())
    }

    async fn connect(&self) -> Result<WsWriter> {
        let stream =
            connect_with_deadline(&self.settings.url, self.settings.handshake_timeout).await?;
        let (writer, reader) = stream.split();

        self.connected.store(true, Ordering::Release);
        let task = tokio::spawn(read_responses(
            reader,
            self.pending.clone(),
            self.connected.clone(),
        ));
        let previous = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }

        info!(url = %self.settings.url, "Order session connected");
        Ok(writer)
    }

    /// Close the connection and fail anything still waiting
    pub async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.close().await;
        }
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            reader.abort();
        }
        self.connected.store(false, Ordering::Release);
        fail_pending(&self.pending, "order session closed");
        debug!(url = %self.settings.url, "Order session closed");
    }
}

impl Drop for OrderSession {
    fn drop(&mut self) {
        let reader = self
            .reader
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            reader.abort();
        }
    }
}

async fn read_responses(mut reader: WsReader, pending: Arc<PendingMap>, connected: Arc<AtomicBool>) {
    while let Some(message) = reader.next().await {
        match message {
            Ok(Message::Text(text)) => dispatch_response(&text, &pending),
            Ok(Message::Close(frame)) => {
                warn!(frame = ?frame, "Order session closed by exchange");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Order session read failed");
                break;
            }
        }
    }

    connected.store(false, Ordering::Release);
    fail_pending(&pending, "order session disconnected");
}

fn dispatch_response(text: &str, pending: &PendingMap) {
    let response: WsApiResponse = match serde_json::from_str(text) {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "Unparseable WebSocket-API response");
            return;
        }
    };

    let Some(id) = response.id.clone() else {
        trace!(status = response.status, "WebSocket-API message without id");
        return;
    };
    match pending.remove(&id) {
        Some((_, tx)) => {
            let _ = tx.send(response.into_result());
        }
        None => debug!(request_id = %id, "Response for unknown request"),
    }
}

fn fail_pending(pending: &PendingMap, reason: &str) {
    let ids: Vec<String> = pending.iter().map(|entry| entry.key().clone()).collect();
    for id in ids {
        if let Some((_, tx)) = pending.remove(&id) {
            let _ = tx.send(Err(ConnectorError::Transport(reason.to_string())));
        }
    }
}

/// `order.place` parameters, before signing
pub fn order_params(order: &OrderSubmission) -> Result<BTreeMap<String, String>> {
    order.validate()?;

    let mut params = BTreeMap::new();
    params.insert("symbol".to_string(), order.symbol.clone());
    params.insert("side".to_string(), order.side.as_binance_str().to_string());
    params.insert("type".to_string(), order.order_type.as_str().to_string());
    params.insert("quantity".to_string(), order.quantity.normalize().to_string());
    params.insert(
        "newClientOrderId".to_string(),
        order.client_order_id.to_string(),
    );
    params.insert("newOrderRespType".to_string(), "RESULT".to_string());

    if order.order_type == OrderType::Limit {
        if let Some(price) = order.price {
            params.insert("price".to_string(), price.normalize().to_string());
        }
        if let Some(tif) = order.time_in_force {
            params.insert("timeInForce".to_string(), tif.as_binance_str().to_string());
        }
    }

    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ApiCredentials;
    use crate::order::{SequexId, Side, TimeInForce};
    use rust_decimal_macros::dec;
    use tokio::net::TcpListener;

    fn session(url: &str) -> OrderSession {
        OrderSession::new(
            SessionSettings {
                url: url.to_string(),
                handshake_timeout: Duration::from_secs(2),
                request_timeout: Duration::from_secs(2),
            },
            RequestSigner::new(ApiCredentials::new("key".into(), "secret".into())),
        )
    }

    #[test]
    fn test_limit_params() {
        let order = OrderSubmission::limit(
            SequexId::from("abc"),
            "BTCUSDT",
            Side::Sell,
            dec!(1.500),
            dec!(42000.10),
            TimeInForce::FOK,
        );
        let params = order_params(&order).unwrap();

        assert_eq!(params["type"], "LIMIT");
        assert_eq!(params["side"], "SELL");
        assert_eq!(params["quantity"], "1.5");
        assert_eq!(params["price"], "42000.1");
        assert_eq!(params["timeInForce"], "FOK");
        assert_eq!(params["newClientOrderId"], "abc");
    }

    #[test]
    fn test_market_params_have_no_price() {
        let order = OrderSubmission::market(SequexId::new(), "ETHUSDT", Side::Buy, dec!(2));
        let params = order_params(&order).unwrap();
        assert_eq!(params["type"], "MARKET");
        assert!(!params.contains_key("price"));
        assert!(!params.contains_key("timeInForce"));
    }

    #[test]
    fn test_dispatch_routes_by_id() {
        let pending = PendingMap::new();
        let (tx, mut rx) = oneshot::channel();
        pending.insert("req-1".to_string(), tx);

        dispatch_response(
            r#"{"id":"req-1","status":400,"error":{"code":-1013,"msg":"Filter failure: LOT_SIZE"}}"#,
            &pending,
        );

        assert!(pending.is_empty());
        match rx.try_recv().unwrap() {
            Err(ConnectorError::ExchangeRejected { code, .. }) => assert_eq!(code, -1013),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_fail_pending_drains_everything() {
        let pending = PendingMap::new();
        let (tx, mut rx) = oneshot::channel();
        pending.insert("req-1".to_string(), tx);

        fail_pending(&pending, "gone");
        assert!(pending.is_empty());
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(ConnectorError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_place_order_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let Some(Ok(Message::Text(request))) = ws.next().await else {
                panic!("expected a text request");
            };
            let request: Value = serde_json::from_str(&request).unwrap();
            assert_eq!(request["method"], "order.place");
            assert!(request["params"]["signature"].is_string());
            assert_eq!(request["params"]["apiKey"], "key");

            let response = json!({
                "id": request["id"],
                "status": 200,
                "result": {
                    "symbol": "BTCUSDT",
                    "orderId": 7,
                    "clientOrderId": request["params"]["newClientOrderId"],
                    "status": "FILLED"
                }
            });
            ws.send(Message::Text(response.to_string())).await.unwrap();
            // Keep the socket open until the client is done
            let _ = ws.next().await;
        });

        let session = session(&format!("ws://{}", addr));
        assert!(!session.is_connected());

        let order = OrderSubmission::market(SequexId::from("cid-1"), "BTCUSDT", Side::Buy, dec!(1));
        let ack = session.place_order(&order).await.unwrap();

        assert_eq!(ack.exchange_order_id, 7);
        assert_eq!(ack.client_order_id, "cid-1");
        assert_eq!(ack.status, OrderStatus::Filled);
        assert!(session.is_connected());
        assert_eq!(session.in_flight(), 0);
        assert_eq!(session.requests_sent(), 1);

        session.close().await;
        assert!(!session.is_connected());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_is_signed_after_slow_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let accepted_at = chrono::Utc::now().timestamp_millis();

            let Some(Ok(Message::Text(request))) = ws.next().await else {
                panic!("expected a text request");
            };
            let request: Value = serde_json::from_str(&request).unwrap();
            let signed_at: i64 = request["params"]["timestamp"]
                .as_str()
                .unwrap()
                .parse()
                .unwrap();

            let response = json!({
                "id": request["id"],
                "status": 400,
                "error": {"code": -2010, "msg": "rejected"}
            });
            ws.send(Message::Text(response.to_string())).await.unwrap();
            let _ = ws.next().await;
            (accepted_at, signed_at)
        });

        let session = session(&format!("ws://{}", addr));
        let order = OrderSubmission::market(SequexId::new(), "BTCUSDT", Side::Buy, dec!(1));
        assert!(matches!(
            session.place_order(&order).await,
            Err(ConnectorError::ExchangeRejected { code: -2010, .. })
        ));
        session.close().await;

        let (accepted_at, signed_at) = server.await.unwrap();
        // Small slack for clock granularity
        assert!(
            signed_at + 50 >= accepted_at,
            "signed at {} but handshake finished at {}",
            signed_at,
            accepted_at
        );
    }

    #[tokio::test]
    async fn test_dropped_connection_fails_in_flight_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let _ = ws.next().await;
            // Drop without answering
        });

        let session = session(&format!("ws://{}", addr));
        let order = OrderSubmission::market(SequexId::new(), "BTCUSDT", Side::Buy, dec!(1));
        let result = session.place_order(&order).await;

        assert!(matches!(result, Err(ConnectorError::Transport(_))));
        assert_eq!(session.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let session = session(&format!("ws://{}", addr));
        let order = OrderSubmission::market(SequexId::new(), "BTCUSDT", Side::Buy, dec!(1));
        assert!(matches!(
            session.place_order(&order).await,
            Err(ConnectorError::Transport(_))
        ));
        assert_eq!(session.in_flight(), 0);
    }
}
