//! Per-book consumer task
//!
//! Drains the book's bounded depth queue in arrival order, reconciles each
//! diff against the ladder and publishes best-depth changes on the bus.

use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{BestDepth, BookState, OrderBook, Reconcile};
use crate::bus::BestDepthBus;
use crate::error::ConnectorError;
use crate::exchange::{DepthMessage, ExchangeAdapter, Unsubscribe};
use crate::metrics;
use crate::parser::DepthEvent;

/// Holds the adapter's unsubscribe function until it is called exactly once
pub(super) struct ReleaseLatch {
    unsubscribe: Mutex<Option<Unsubscribe>>,
}

impl ReleaseLatch {
    pub(super) fn new(unsubscribe: Unsubscribe) -> Self {
        Self {
            unsubscribe: Mutex::new(Some(unsubscribe)),
        }
    }

    /// Returns true for the call that actually released the subscription
    pub(super) fn release(&self) -> bool {
        let unsubscribe = self
            .unsubscribe
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match unsubscribe {
            Some(unsubscribe) => {
                unsubscribe();
                true
            }
            None => false,
        }
    }
}

pub(super) struct BookWorker {
    symbol: String,
    book: Arc<RwLock<OrderBook>>,
    bus: Arc<BestDepthBus>,
    adapter: Arc<dyn ExchangeAdapter>,
    snapshot_limit: u32,
    rx: mpsc::Receiver<DepthMessage>,
    cancel: CancellationToken,
    release: Arc<ReleaseLatch>,
    last_published: Option<BestDepth>,
}

impl BookWorker {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        symbol: &str,
        book: Arc<RwLock<OrderBook>>,
        bus: Arc<BestDepthBus>,
        adapter: Arc<dyn ExchangeAdapter>,
        snapshot_limit: u32,
        rx: mpsc::Receiver<DepthMessage>,
        cancel: CancellationToken,
        release: Arc<ReleaseLatch>,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            book,
            bus,
            adapter,
            snapshot_limit,
            rx,
            cancel,
            release,
            last_published: None,
        }
    }

    pub(super) async fn run(mut self) {
        debug!(symbol = %self.symbol, "Book worker started");

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(symbol = %self.symbol, "Book worker cancelled");
                    break;
                }
                message = self.rx.recv() => match message {
                    Some(DepthMessage::Event(event)) => self.handle_event(event).await,
                    Some(DepthMessage::Error(error)) => {
                        warn!(symbol = %self.symbol, error = %error, "Depth stream error");
                    }
                    None => {
                        self.on_stream_end().await;
                        break;
                    }
                },
            }
        }
    }

    async fn handle_event(&mut self, event: DepthEvent) {
        let mut resynced = false;

        loop {
            let mut book = self.book.write().await;
            if !book.state().is_live() {
                return;
            }

            match book.classify(&event) {
                Reconcile::Apply => {
                    book.apply_diff(&event);
                    metrics::global().depth_event(&self.symbol, "applied");
                    trace!(
                        symbol = %self.symbol,
                        first_update_id = event.first_update_id,
                        last_update_id = event.last_update_id,
                        "Applied depth diff"
                    );
                    break;
                }
                Reconcile::Stale => {
                    metrics::global().depth_event(&self.symbol, "stale");
                    trace!(
                        symbol = %self.symbol,
                        last_update_id = event.last_update_id,
                        local_id = book.last_update_id(),
                        "Dropping stale depth diff"
                    );
                    break;
                }
                Reconcile::Anomaly => {
                    metrics::global().depth_event(&self.symbol, "anomaly");
                    warn!(
                        symbol = %self.symbol,
                        first_update_id = event.first_update_id,
                        last_update_id = event.last_update_id,
                        local_id = book.last_update_id(),
                        "Depth diff ordering anomaly"
                    );
                    break;
                }
                Reconcile::Gap if resynced => {
                    warn!(
                        symbol = %self.symbol,
                        first_update_id = event.first_update_id,
                        local_id = book.last_update_id(),
                        "Depth diff still ahead of snapshot, dropping"
                    );
                    break;
                }
                Reconcile::Gap => {
                    metrics::global().depth_event(&self.symbol, "gap");
                    debug!(
                        symbol = %self.symbol,
                        first_update_id = event.first_update_id,
                        local_id = book.last_update_id(),
                        "Sequence gap, fetching snapshot"
                    );
                    // Readers stay unblocked while the snapshot is in flight
                    drop(book);
                    if !self.resync(&event).await {
                        return;
                    }
                    resynced = true;
                }
            }
        }

        self.publish_best_depth().await;
    }

    /// Fetch a snapshot and apply it unless it is older than the book.
    ///
    /// True when a snapshot was fetched, so the caller re-evaluates the
    /// event once. False means the fetch failed and the event is dropped.
    async fn resync(&self, event: &DepthEvent) -> bool {
        let fetch = self
            .adapter
            .fetch_snapshot(&self.symbol, self.snapshot_limit);
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return false,
            result = fetch => result,
        };

        match result {
            Ok(snapshot) => {
                metrics::global().snapshot(&self.symbol, true);
                let mut book = self.book.write().await;
                if !book.state().is_live() {
                    return false;
                }
                if book.apply_snapshot(&snapshot) {
                    info!(
                        symbol = %self.symbol,
                        snapshot_id = snapshot.last_update_id,
                        bids = book.bid_levels(),
                        asks = book.ask_levels(),
                        "Book resynchronized from snapshot"
                    );
                }
                true
            }
            Err(e) => {
                metrics::global().snapshot(&self.symbol, false);
                let error = ConnectorError::GapRecovery {
                    symbol: self.symbol.clone(),
                    reason: e.to_string(),
                };
                warn!(
                    symbol = %self.symbol,
                    first_update_id = event.first_update_id,
                    last_update_id = event.last_update_id,
                    error = %error,
                    "Dropping depth diff"
                );
                false
            }
        }
    }

    async fn publish_best_depth(&mut self) {
        let best = self.book.read().await.best_depth();
        let Some(best) = best else {
            return;
        };
        if self.last_published == Some(best) {
            return;
        }

        self.last_published = Some(best);
        self.bus.publish(best);
        metrics::global().best_depth_published(&self.symbol);
    }

    async fn on_stream_end(&self) {
        warn!(symbol = %self.symbol, "Depth stream ended, closing book");
        self.book.write().await.set_state(BookState::Closing);
        self.release.release();
        self.bus.clear();
        self.book.write().await.set_state(BookState::Closed);
    }
}
