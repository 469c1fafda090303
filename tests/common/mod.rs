//! Scripted exchange adapter shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sequex_connector::exchange::{DepthSink, OrderAck, OrderSubmission, Unsubscribe};
use sequex_connector::parser::{DepthEvent, DepthSnapshot, PriceLevel};
use sequex_connector::{ConnectorError, ExchangeAdapter, OrderStatus, Result, UpdateSpeed};

#[derive(Default)]
struct Inner {
    sinks: Mutex<HashMap<String, (usize, DepthSink)>>,
    // Superseded sinks stay open so their books keep streaming
    retired: Mutex<Vec<DepthSink>>,
    subscribe_delays: Mutex<HashMap<String, Duration>>,
    snapshots: Mutex<HashMap<String, VecDeque<Result<DepthSnapshot>>>>,
    submissions: Mutex<Vec<OrderSubmission>>,
    subscribes: AtomicUsize,
    unsubscribes: AtomicUsize,
    snapshot_requests: AtomicUsize,
    next_order_id: AtomicU64,
}

/// In-memory venue: tests push diffs, script snapshots and inspect orders
#[derive(Clone, Default)]
pub struct FakeAdapter {
    inner: Arc<Inner>,
}

impl FakeAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_snapshot(&self, symbol: &str, snapshot: Result<DepthSnapshot>) {
        self.inner
            .snapshots
            .lock()
            .unwrap()
            .entry(symbol.to_string())
            .or_default()
            .push_back(snapshot);
    }

    /// Make every `subscribe_depth` for `symbol` take `delay`
    pub fn delay_subscribe(&self, symbol: &str, delay: Duration) {
        self.inner
            .subscribe_delays
            .lock()
            .unwrap()
            .insert(symbol.to_string(), delay);
    }

    /// Deliver a diff through the book's sink. False if no live subscription.
    pub fn push(&self, symbol: &str, event: DepthEvent) -> bool {
        let sink = self
            .inner
            .sinks
            .lock()
            .unwrap()
            .get(symbol)
            .map(|(_, sink)| sink.clone());
        match sink {
            Some(sink) => sink.push(event),
            None => false,
        }
    }

    /// Drop the sink as a terminated stream would
    pub fn end_stream(&self, symbol: &str) {
        self.inner.sinks.lock().unwrap().remove(symbol);
    }

    pub fn is_streaming(&self, symbol: &str) -> bool {
        self.inner.sinks.lock().unwrap().contains_key(symbol)
    }

    pub fn submissions(&self) -> Vec<OrderSubmission> {
        self.inner.submissions.lock().unwrap().clone()
    }

    pub fn subscribes(&self) -> usize {
        self.inner.subscribes.load(Ordering::SeqCst)
    }

    pub fn unsubscribes(&self) -> usize {
        self.inner.unsubscribes.load(Ordering::SeqCst)
    }

    pub fn snapshot_requests(&self) -> usize {
        self.inner.snapshot_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExchangeAdapter for FakeAdapter {
    async fn subscribe_depth(
        &self,
        symbol: &str,
        _speed: UpdateSpeed,
        sink: DepthSink,
    ) -> Result<Unsubscribe> {
        let generation = self.inner.subscribes.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self
            .inner
            .subscribe_delays
            .lock()
            .unwrap()
            .get(symbol)
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let previous = self
            .inner
            .sinks
            .lock()
            .unwrap()
            .insert(symbol.to_string(), (generation, sink));
        if let Some((_, previous)) = previous {
            self.inner.retired.lock().unwrap().push(previous);
        }

        let inner = self.inner.clone();
        let symbol = symbol.to_string();
        Ok(Box::new(move || {
            inner.unsubscribes.fetch_add(1, Ordering::SeqCst);
            let mut sinks = inner.sinks.lock().unwrap();
            if matches!(sinks.get(&symbol), Some((current, _)) if *current == generation) {
                sinks.remove(&symbol);
            }
        }))
    }

    async fn fetch_snapshot(&self, symbol: &str, _limit: u32) -> Result<DepthSnapshot> {
        self.inner.snapshot_requests.fetch_add(1, Ordering::SeqCst);
        self.inner
            .snapshots
            .lock()
            .unwrap()
            .get_mut(symbol)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| {
                Err(ConnectorError::Transport(format!(
                    "no snapshot scripted for {}",
                    symbol
                )))
            })
    }

    async fn submit_order(&self, order: OrderSubmission) -> Result<OrderAck> {
        let exchange_order_id = self.inner.next_order_id.fetch_add(1, Ordering::SeqCst) + 1;
        let ack = OrderAck {
            exchange_order_id,
            client_order_id: order.client_order_id.to_string(),
            status: OrderStatus::Filled,
            symbol: order.symbol.clone(),
        };
        self.inner.submissions.lock().unwrap().push(order);
        Ok(ack)
    }
}

pub fn levels(pairs: &[(&str, &str)]) -> Vec<PriceLevel> {
    pairs
        .iter()
        .map(|(price, size)| PriceLevel::parse(price, size).unwrap())
        .collect()
}

pub fn snapshot(last_update_id: u64, asks: &[(&str, &str)], bids: &[(&str, &str)]) -> DepthSnapshot {
    DepthSnapshot {
        last_update_id,
        bids: levels(bids),
        asks: levels(asks),
    }
}

pub fn diff(
    symbol: &str,
    first_update_id: u64,
    last_update_id: u64,
    asks: &[(&str, &str)],
    bids: &[(&str, &str)],
) -> DepthEvent {
    DepthEvent {
        event_type: "depthUpdate".to_string(),
        event_time: 1_700_000_000_000 + last_update_id,
        symbol: symbol.to_string(),
        first_update_id,
        last_update_id,
        bids: levels(bids),
        asks: levels(asks),
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Give spawned tasks a chance to run before asserting a negative
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
