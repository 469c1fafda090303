//! Best-Depth Bus
//!
//! Per-book fan-out of best bid/ask ticks. Each dispatch runs on its own
//! tokio task so a slow subscriber never stalls the book's consumer. The
//! registry holds subscribers only until their handle is released; once
//! [`BestDepthSubscription::detach`] returns the callback is never invoked
//! again.

use dashmap::DashMap;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, trace};

use crate::orderbook::BestDepth;

/// Subscriber callback
pub type DepthCallback = Box<dyn FnMut(BestDepth) + Send + 'static>;

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Id of the subscriber whose callback is running on this thread, 0 if none
    static DISPATCHING: Cell<u64> = const { Cell::new(0) };
}

struct DispatchGuard {
    previous: u64,
}

impl DispatchGuard {
    fn enter(id: u64) -> Self {
        let previous = DISPATCHING.with(|d| d.replace(id));
        Self { previous }
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        DISPATCHING.with(|d| d.set(self.previous));
    }
}

struct Subscriber {
    id: u64,
    detached: AtomicBool,
    callback: Mutex<Option<DepthCallback>>,
}

impl Subscriber {
    fn dispatch(&self, depth: BestDepth) {
        if self.detached.load(Ordering::Acquire) {
            return;
        }

        let mut slot = self.callback.lock().unwrap_or_else(PoisonError::into_inner);
        // Detach may have completed while we waited for the lock
        if self.detached.load(Ordering::Acquire) {
            slot.take();
            return;
        }

        if let Some(callback) = slot.as_mut() {
            let _guard = DispatchGuard::enter(self.id);
            callback(depth);
        }

        // Detached from inside the callback
        if self.detached.load(Ordering::Acquire) {
            slot.take();
        }
    }

    /// Returns false if already detached
    fn detach(&self) -> bool {
        if self.detached.swap(true, Ordering::AcqRel) {
            return false;
        }

        let reentrant = DISPATCHING.with(|d| d.get() == self.id);
        if !reentrant {
            // Blocks until an in-flight invocation returns
            self.callback
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
        }
        true
    }
}

/// Best-depth fan-out for one book
pub struct BestDepthBus {
    symbol: String,
    subscribers: DashMap<u64, Arc<Subscriber>>,
}

impl BestDepthBus {
    pub fn new(symbol: &str) -> Arc<Self> {
        Arc::new(Self {
            symbol: symbol.to_string(),
            subscribers: DashMap::new(),
        })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Register a callback. The returned handle detaches it when released or dropped.
    pub fn subscribe<F>(self: &Arc<Self>, callback: F) -> BestDepthSubscription
    where
        F: FnMut(BestDepth) + Send + 'static,
    {
        let id = NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed);
        let subscriber = Arc::new(Subscriber {
            id,
            detached: AtomicBool::new(false),
            callback: Mutex::new(Some(Box::new(callback))),
        });
        self.subscribers.insert(id, subscriber.clone());
        debug!(symbol = %self.symbol, subscription_id = id, "Best-depth subscriber attached");

        BestDepthSubscription {
            id,
            bus: Arc::downgrade(self),
            subscriber,
        }
    }

    /// Schedule one dispatch per current subscriber. Returns how many were scheduled.
    ///
    /// Outside a tokio runtime the callbacks run inline.
    pub fn publish(&self, depth: BestDepth) -> usize {
        // Snapshot first so no shard lock is held while callbacks run
        let targets: Vec<Arc<Subscriber>> = self
            .subscribers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let runtime = tokio::runtime::Handle::try_current().ok();
        for subscriber in &targets {
            let subscriber = subscriber.clone();
            match &runtime {
                Some(handle) => {
                    handle.spawn(async move { subscriber.dispatch(depth) });
                }
                None => subscriber.dispatch(depth),
            }
        }

        trace!(symbol = %self.symbol, subscribers = targets.len(), "Best depth published");
        targets.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_subscribed(&self, id: u64) -> bool {
        self.subscribers.contains_key(&id)
    }

    /// Detach every subscriber
    pub fn clear(&self) {
        let ids: Vec<u64> = self.subscribers.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, subscriber)) = self.subscribers.remove(&id) {
                subscriber.detach();
            }
        }
        debug!(symbol = %self.symbol, "Best-depth bus cleared");
    }
}

/// Opaque handle to a bus registration
pub struct BestDepthSubscription {
    id: u64,
    bus: Weak<BestDepthBus>,
    subscriber: Arc<Subscriber>,
}

impl BestDepthSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_detached(&self) -> bool {
        self.subscriber.detached.load(Ordering::Acquire)
    }

    /// Detach the callback. When this returns the callback will not run again.
    pub fn detach(self) {
        drop(self);
    }

    fn release(&self) {
        if self.subscriber.detach() {
            if let Some(bus) = self.bus.upgrade() {
                bus.subscribers.remove(&self.id);
                debug!(symbol = %bus.symbol, subscription_id = self.id, "Best-depth subscriber detached");
            }
        }
    }
}

impl Drop for BestDepthSubscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for BestDepthSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BestDepthSubscription")
            .field("id", &self.id)
            .field("detached", &self.is_detached())
            .finish()
    }
}
