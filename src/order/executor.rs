//! Per-account order executor
//!
//! Market and limit orders are one synchronous round trip through the
//! account's exchange adapter. Stop-market orders never leave the process
//! until their trigger crosses; see [`super::stop`].

use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::stop::{run_watch, trigger_on, StopWatch, WatchContext};
use super::{
    validate_positive, validate_symbol, Order, OrderResponse, OrderStatus, SequexId, Side,
    StopMarketOrder, TimeInForce,
};
use crate::error::{ConnectorError, Result};
use crate::exchange::{ExchangeAdapter, OrderAck, OrderSubmission};
use crate::metrics;
use crate::orderbook::BookManager;

/// Executor tuning
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Deadline for one order round trip
    pub order_timeout: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            order_timeout: Duration::from_secs(10),
        }
    }
}

/// Submit an order, failing with `Transport` once the deadline passes
pub(super) async fn submit_with_deadline(
    adapter: &dyn ExchangeAdapter,
    deadline: Duration,
    submission: OrderSubmission,
) -> Result<OrderAck> {
    let client_order_id = submission.client_order_id.clone();
    match tokio::time::timeout(deadline, adapter.submit_order(submission)).await {
        Ok(result) => result,
        Err(_) => Err(ConnectorError::Transport(format!(
            "order {} timed out after {:?}",
            client_order_id, deadline
        ))),
    }
}

/// Order executor bound to one account's credentials
pub struct OrderExecutor {
    account: String,
    adapter: Arc<dyn ExchangeAdapter>,
    books: Arc<BookManager>,
    settings: ExecutorSettings,
    watchers: Arc<DashMap<SequexId, Arc<StopWatch>>>,
    root: CancellationToken,
    closed: AtomicBool,
}

impl OrderExecutor {
    /// `adapter` must carry this account's credentials
    pub fn new(
        account: &str,
        adapter: Arc<dyn ExchangeAdapter>,
        books: Arc<BookManager>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            account: account.to_string(),
            adapter,
            books,
            settings,
            watchers: Arc::new(DashMap::new()),
            root: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Dispatch an order by kind
    pub async fn place(&self, order: Order) -> Result<OrderResponse> {
        match order {
            Order::Market {
                symbol,
                side,
                quantity,
            } => self.place_market(&symbol, side, quantity).await,
            Order::Limit {
                symbol,
                side,
                quantity,
                price,
                time_in_force,
            } => {
                self.place_limit(&symbol, side, quantity, price, time_in_force)
                    .await
            }
            Order::StopMarket {
                symbol,
                side,
                quantity,
                stop_price,
            } => {
                self.place_stop_market(&symbol, side, quantity, stop_price)
                    .await
            }
        }
    }

    pub async fn place_market(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
    ) -> Result<OrderResponse> {
        self.ensure_open()?;
        let symbol = normalize(symbol)?;
        validate_positive("quantity", quantity)?;

        let submission = OrderSubmission::market(SequexId::new(), &symbol, side, quantity);
        self.submit("market", submission).await
    }

    pub async fn place_limit(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        time_in_force: TimeInForce,
    ) -> Result<OrderResponse> {
        self.ensure_open()?;
        let symbol = normalize(symbol)?;
        validate_positive("quantity", quantity)?;
        validate_positive("price", price)?;

        let submission = OrderSubmission::limit(
            SequexId::new(),
            &symbol,
            side,
            quantity,
            price,
            time_in_force,
        );
        self.submit("limit", submission).await
    }

    /// Arm a client-side stop-market order. Returns immediately with `LocalPending`.
    pub async fn place_stop_market(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        stop_price: Decimal,
    ) -> Result<OrderResponse> {
        self.ensure_open()?;
        let symbol = normalize(symbol)?;
        validate_positive("quantity", quantity)?;
        validate_positive("stop price", stop_price)?;

        let order = StopMarketOrder {
            client_order_id: SequexId::new(),
            symbol: symbol.clone(),
            side,
            quantity,
            stop_price,
        };
        let id = order.client_order_id.clone();

        let watch = StopWatch::new(order, self.root.child_token());
        // Visible to cancel before the first tick can arrive
        self.watchers.insert(id.clone(), watch.clone());

        let (tx, fired) = oneshot::channel();
        let subscription = match self
            .books
            .subscribe_best_depth(&symbol, trigger_on(watch.clone(), tx))
            .await
        {
            Ok(subscription) => subscription,
            Err(e) => {
                self.watchers.remove(&id);
                return Err(match e {
                    ConnectorError::NotFound(_) => {
                        ConnectorError::InvalidInput(format!("unknown symbol {}", symbol))
                    }
                    other => other,
                });
            }
        };

        let ctx = WatchContext {
            account: self.account.clone(),
            adapter: self.adapter.clone(),
            watchers: self.watchers.clone(),
            order_timeout: self.settings.order_timeout,
        };
        let task = tokio::spawn(run_watch(ctx, watch.clone(), subscription, fired));
        watch.set_task(task);

        metrics::global().stop_order(&self.account, "armed");
        info!(
            account = %self.account,
            symbol = %symbol,
            client_order_id = %id,
            side = ?side,
            quantity = %quantity,
            stop_price = %stop_price,
            "Stop order armed"
        );

        Ok(OrderResponse {
            sequex_id: id,
            exchange_order_id: None,
            status: OrderStatus::LocalPending,
            symbol,
        })
    }

    /// Tear down an armed stop-market order.
    ///
    /// Orders already submitted to the exchange are not cancellable here.
    pub async fn cancel(&self, client_order_id: &SequexId) -> Result<OrderResponse> {
        self.ensure_open()?;

        let not_found = || ConnectorError::NotFound(format!("stop order {}", client_order_id));
        let (_, watch) = self.watchers.remove(client_order_id).ok_or_else(not_found)?;

        if !watch.try_cancel() {
            // Fired between lookup and cancel
            return Err(not_found());
        }
        watch.stop().await;

        metrics::global().stop_order(&self.account, "cancelled");
        info!(
            account = %self.account,
            symbol = %watch.order().symbol,
            client_order_id = %client_order_id,
            "Stop order cancelled"
        );

        Ok(OrderResponse {
            sequex_id: client_order_id.clone(),
            exchange_order_id: None,
            status: OrderStatus::Canceled,
            symbol: watch.order().symbol.clone(),
        })
    }

    /// Stop-market orders still waiting for their trigger
    pub fn live_stop_orders(&self) -> Vec<StopMarketOrder> {
        self.watchers
            .iter()
            .filter(|entry| entry.value().is_armed())
            .map(|entry| entry.value().order().clone())
            .collect()
    }

    /// Cancel every armed watcher. Later calls fail with `Shutdown`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let ids: Vec<SequexId> = self.watchers.iter().map(|entry| entry.key().clone()).collect();
        let mut cancelled = 0usize;
        for id in ids {
            if let Some((_, watch)) = self.watchers.remove(&id) {
                if watch.try_cancel() {
                    metrics::global().stop_order(&self.account, "cancelled");
                    cancelled += 1;
                }
                watch.stop().await;
            }
        }

        self.root.cancel();
        info!(account = %self.account, cancelled, "Order executor closed");
    }

    async fn submit(&self, kind: &str, submission: OrderSubmission) -> Result<OrderResponse> {
        let client_order_id = submission.client_order_id.clone();
        let symbol = submission.symbol.clone();
        debug!(
            account = %self.account,
            symbol = %symbol,
            client_order_id = %client_order_id,
            kind,
            "Submitting order"
        );

        match submit_with_deadline(self.adapter.as_ref(), self.settings.order_timeout, submission)
            .await
        {
            Ok(ack) => {
                metrics::global().order(&self.account, kind, true);
                info!(
                    account = %self.account,
                    symbol = %symbol,
                    client_order_id = %client_order_id,
                    exchange_order_id = ack.exchange_order_id,
                    status = ?ack.status,
                    kind,
                    "Order placed"
                );
                Ok(OrderResponse {
                    sequex_id: client_order_id,
                    exchange_order_id: Some(ack.exchange_order_id),
                    status: ack.status,
                    symbol: ack.symbol,
                })
            }
            Err(e) => {
                metrics::global().order(&self.account, kind, false);
                warn!(
                    account = %self.account,
                    symbol = %symbol,
                    client_order_id = %client_order_id,
                    error = %e,
                    kind,
                    "Order submission failed"
                );
                Err(e)
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ConnectorError::Shutdown);
        }
        Ok(())
    }
}

fn normalize(symbol: &str) -> Result<String> {
    let symbol = symbol.trim().to_ascii_uppercase();
    validate_symbol(&symbol)?;
    Ok(symbol)
}
