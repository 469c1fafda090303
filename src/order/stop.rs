//! Client-side stop-market watchers
//!
//! A watcher listens to its symbol's best-depth ticks and, on the first tick
//! that crosses the stop price, submits a market order reusing the stop
//! order's client id. Fire and cancel race through one atomic latch, so
//! exactly one of them wins. The latch is taken inside the bus callback:
//! once a crossing tick has been delivered, cancel can no longer win.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

use super::executor::submit_with_deadline;
use super::{SequexId, StopMarketOrder};
use crate::bus::BestDepthSubscription;
use crate::exchange::{ExchangeAdapter, OrderSubmission};
use crate::metrics;
use crate::orderbook::BestDepth;

const ARMED: u8 = 0;
const TRIGGERED: u8 = 1;
const CANCELLED: u8 = 2;

pub(super) struct StopWatch {
    order: StopMarketOrder,
    state: AtomicU8,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StopWatch {
    pub(super) fn new(order: StopMarketOrder, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            order,
            state: AtomicU8::new(ARMED),
            cancel,
            task: Mutex::new(None),
        })
    }

    pub(super) fn order(&self) -> &StopMarketOrder {
        &self.order
    }

    pub(super) fn is_armed(&self) -> bool {
        self.state.load(Ordering::Acquire) == ARMED
    }

    fn is_triggered(&self) -> bool {
        self.state.load(Ordering::Acquire) == TRIGGERED
    }

    /// Armed -> Triggered. Only the winner of the race may fire.
    pub(super) fn try_trigger(&self) -> bool {
        self.transition(TRIGGERED)
    }

    /// Armed -> Cancelled
    pub(super) fn try_cancel(&self) -> bool {
        self.transition(CANCELLED)
    }

    fn transition(&self, to: u8) -> bool {
        self.state
            .compare_exchange(ARMED, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(super) fn set_task(&self, task: JoinHandle<()>) {
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    /// Signal the watcher task and wait for it to detach
    pub(super) async fn stop(&self) {
        self.cancel.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(
                    client_order_id = %self.order.client_order_id,
                    error = %e,
                    "Stop watcher terminated abnormally"
                );
            }
        }
    }
}

/// Everything a watcher task needs from its executor
pub(super) struct WatchContext {
    pub(super) account: String,
    pub(super) adapter: Arc<dyn ExchangeAdapter>,
    pub(super) watchers: Arc<DashMap<SequexId, Arc<StopWatch>>>,
    pub(super) order_timeout: Duration,
}

enum Outcome {
    Fire,
    Cancelled,
    Abandoned,
}

/// Bus callback for a watcher. Latches the trigger on the first crossing
/// tick and hands that tick to the watcher task.
pub(super) fn trigger_on(
    watch: Arc<StopWatch>,
    fired: oneshot::Sender<BestDepth>,
) -> impl FnMut(BestDepth) + Send + 'static {
    let mut fired = Some(fired);
    move |depth| {
        if fired.is_none() || !watch.order.is_triggered_by(&depth) {
            return;
        }
        if watch.try_trigger() {
            if let Some(fired) = fired.take() {
                let _ = fired.send(depth);
            }
        } else {
            // Cancelled meanwhile
            fired = None;
        }
    }
}

pub(super) async fn run_watch(
    ctx: WatchContext,
    watch: Arc<StopWatch>,
    subscription: BestDepthSubscription,
    fired: oneshot::Receiver<BestDepth>,
) {
    let order = watch.order().clone();

    let outcome = tokio::select! {
        biased;
        _ = watch.cancel.cancelled() => {
            if watch.is_triggered() {
                Outcome::Fire
            } else {
                Outcome::Cancelled
            }
        }
        tick = fired => match tick {
            Ok(depth) => {
                trace!(
                    client_order_id = %order.client_order_id,
                    ask = %depth.ask.price,
                    bid = %depth.bid.price,
                    "Stop price crossed"
                );
                Outcome::Fire
            }
            // Callback dropped with the bus
            Err(_) if watch.is_triggered() => Outcome::Fire,
            Err(_) => Outcome::Abandoned,
        },
    };

    subscription.detach();

    match outcome {
        Outcome::Fire => {
            ctx.watchers.remove(&order.client_order_id);
            fire(&ctx, &order).await;
        }
        Outcome::Cancelled => {
            ctx.watchers.remove(&order.client_order_id);
        }
        Outcome::Abandoned => {
            ctx.watchers.remove(&order.client_order_id);
            if watch.try_cancel() {
                metrics::global().stop_order(&ctx.account, "abandoned");
                warn!(
                    account = %ctx.account,
                    symbol = %order.symbol,
                    client_order_id = %order.client_order_id,
                    "Order book closed, stop order abandoned"
                );
            }
        }
    }
}

async fn fire(ctx: &WatchContext, order: &StopMarketOrder) {
    info!(
        account = %ctx.account,
        symbol = %order.symbol,
        client_order_id = %order.client_order_id,
        side = ?order.side,
        stop_price = %order.stop_price,
        "Stop order triggered, submitting market order"
    );
    metrics::global().stop_order(&ctx.account, "fired");

    let submission = OrderSubmission::market(
        order.client_order_id.clone(),
        &order.symbol,
        order.side,
        order.quantity,
    );
    match submit_with_deadline(ctx.adapter.as_ref(), ctx.order_timeout, submission).await {
        Ok(ack) => {
            metrics::global().order(&ctx.account, "stop_market", true);
            info!(
                account = %ctx.account,
                symbol = %order.symbol,
                client_order_id = %order.client_order_id,
                exchange_order_id = ack.exchange_order_id,
                status = ?ack.status,
                "Stop order market submission accepted"
            );
        }
        Err(e) => {
            metrics::global().order(&ctx.account, "stop_market", false);
            error!(
                account = %ctx.account,
                symbol = %order.symbol,
                client_order_id = %order.client_order_id,
                error = %e,
                "Stop order market submission failed"
            );
        }
    }
}
