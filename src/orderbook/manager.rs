//! Order book manager
//!
//! Owns at most one live book per symbol. Each book gets a bounded depth
//! queue fed by the exchange adapter, a consumer task and a best-depth bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::worker::{BookWorker, ReleaseLatch};
use super::{BestDepth, BookState, DepthView, OrderBook};
use crate::bus::{BestDepthBus, BestDepthSubscription};
use crate::error::{ConnectorError, Result};
use crate::exchange::{DepthSink, ExchangeAdapter, UpdateSpeed};
use crate::order::validate_symbol;

/// Per-book tuning
#[derive(Debug, Clone)]
pub struct BookSettings {
    /// Capacity of each book's depth queue
    pub queue_capacity: usize,
    /// Levels requested per snapshot
    pub snapshot_limit: u32,
}

impl Default for BookSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 500,
            snapshot_limit: 5000,
        }
    }
}

struct BookHandle {
    book: Arc<RwLock<OrderBook>>,
    bus: Arc<BestDepthBus>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    release: Arc<ReleaseLatch>,
}

impl BookHandle {
    async fn teardown(&self, symbol: &str) {
        {
            let mut book = self.book.write().await;
            if book.state() != BookState::Closed {
                book.set_state(BookState::Closing);
            }
        }

        self.cancel.cancel();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(symbol = %symbol, error = %e, "Book worker terminated abnormally");
            }
        }

        self.release.release();
        // Waits out any callback still running
        self.bus.clear();
        self.book.write().await.set_state(BookState::Closed);
    }
}

/// Manages order books for multiple symbols
pub struct BookManager {
    adapter: Arc<dyn ExchangeAdapter>,
    settings: BookSettings,
    books: RwLock<HashMap<String, Arc<BookHandle>>>,
    root: CancellationToken,
    closed: AtomicBool,
}

impl BookManager {
    pub fn new(adapter: Arc<dyn ExchangeAdapter>, settings: BookSettings) -> Self {
        Self {
            adapter,
            settings,
            books: RwLock::new(HashMap::new()),
            root: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &BookSettings {
        &self.settings
    }

    /// Start a book for `symbol`.
    ///
    /// Returns false if a live book already exists. A book whose stream
    /// ended is replaced.
    pub async fn create(&self, symbol: &str, speed: UpdateSpeed) -> Result<bool> {
        let symbol = normalize(symbol)?;
        if self.has_live_book(&symbol).await? {
            debug!(symbol = %symbol, "Order book already exists");
            return Ok(false);
        }

        // The map stays unlocked while the venue handshake runs
        let (tx, rx) = mpsc::channel(self.settings.queue_capacity.max(1));
        let sink = DepthSink::new(&symbol, tx);
        let unsubscribe = self.adapter.subscribe_depth(&symbol, speed, sink).await?;
        let release = Arc::new(ReleaseLatch::new(unsubscribe));

        let mut books = self.books.write().await;
        if self.closed.load(Ordering::Acquire) {
            drop(books);
            release.release();
            return Err(ConnectorError::Shutdown);
        }
        if let Some(existing) = books.get(&symbol) {
            if existing.book.read().await.state().is_live() {
                drop(books);
                release.release();
                debug!(symbol = %symbol, "Lost create race, releasing duplicate subscription");
                return Ok(false);
            }
            debug!(symbol = %symbol, "Replacing closed order book");
        }

        let book = Arc::new(RwLock::new(OrderBook::new(&symbol)));
        let bus = BestDepthBus::new(&symbol);
        let cancel = self.root.child_token();

        let worker = BookWorker::new(
            &symbol,
            book.clone(),
            bus.clone(),
            self.adapter.clone(),
            self.settings.snapshot_limit,
            rx,
            cancel.clone(),
            release.clone(),
        );
        let join = tokio::spawn(worker.run());

        books.insert(
            symbol.clone(),
            Arc::new(BookHandle {
                book,
                bus,
                cancel,
                worker: Mutex::new(Some(join)),
                release,
            }),
        );

        info!(symbol = %symbol, speed_ms = speed.as_millis(), "Order book created");
        Ok(true)
    }

    async fn has_live_book(&self, symbol: &str) -> Result<bool> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectorError::Shutdown);
        }
        let handle = self.books.read().await.get(symbol).cloned();
        match handle {
            Some(handle) => Ok(handle.book.read().await.state().is_live()),
            None => Ok(false),
        }
    }

    /// Stop a book and release its adapter subscription. Unknown symbols are a no-op.
    pub async fn close(&self, symbol: &str) -> Result<()> {
        let symbol = symbol.trim().to_ascii_uppercase();
        let handle = self.books.write().await.remove(&symbol);

        match handle {
            Some(handle) => {
                handle.teardown(&symbol).await;
                info!(symbol = %symbol, "Order book closed");
            }
            None => debug!(symbol = %symbol, "Close requested for unknown order book"),
        }
        Ok(())
    }

    /// Up to `depth` levels per side, best first
    pub async fn get_depth(&self, symbol: &str, depth: usize) -> Result<DepthView> {
        let handle = self.handle(symbol).await?;
        let book = handle.book.read().await;
        if !book.state().is_live() {
            return Err(ConnectorError::Shutdown);
        }
        Ok(book.depth(depth))
    }

    /// Current best ask/bid, `None` while a side is empty or the book is crossed
    pub async fn best_depth(&self, symbol: &str) -> Result<Option<BestDepth>> {
        let handle = self.handle(symbol).await?;
        let book = handle.book.read().await;
        if !book.state().is_live() {
            return Err(ConnectorError::Shutdown);
        }
        Ok(book.best_depth())
    }

    /// Register for best-depth changes on `symbol`
    pub async fn subscribe_best_depth<F>(
        &self,
        symbol: &str,
        callback: F,
    ) -> Result<BestDepthSubscription>
    where
        F: FnMut(BestDepth) + Send + 'static,
    {
        let handle = self.handle(symbol).await?;
        // Held across the subscribe so teardown cannot clear the bus in between
        let book = handle.book.read().await;
        if !book.state().is_live() {
            return Err(ConnectorError::Shutdown);
        }
        Ok(handle.bus.subscribe(callback))
    }

    pub async fn state(&self, symbol: &str) -> Option<BookState> {
        let handle = self.handle(symbol).await.ok()?;
        let state = handle.book.read().await.state();
        Some(state)
    }

    /// True if a live book exists for `symbol`
    pub async fn contains(&self, symbol: &str) -> bool {
        matches!(self.state(symbol).await, Some(state) if state.is_live())
    }

    /// Get list of symbols being tracked
    pub async fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.books.read().await.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Close every book. Later `create` calls fail with `Shutdown`.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let handles: Vec<(String, Arc<BookHandle>)> =
            self.books.write().await.drain().collect();

        for (symbol, handle) in handles {
            handle.teardown(&symbol).await;
            debug!(symbol = %symbol, "Order book closed on shutdown");
        }
        self.root.cancel();
        info!("Book manager shut down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn handle(&self, symbol: &str) -> Result<Arc<BookHandle>> {
        let symbol = symbol.trim().to_ascii_uppercase();
        self.books
            .read()
            .await
            .get(&symbol)
            .cloned()
            .ok_or_else(|| ConnectorError::NotFound(format!("order book {}", symbol)))
    }
}

fn normalize(symbol: &str) -> Result<String> {
    let symbol = symbol.trim().to_ascii_uppercase();
    validate_symbol(&symbol)?;
    Ok(symbol)
}
