//! Core order book implementation
//!
//! Uses BTreeMap for efficient sorted price level management. Keys are
//! exact decimals, so "10" and "10.0" land on the same level.

use rust_decimal::Decimal;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use tracing::{trace, warn};

use super::{BestDepth, BookSide, BookState, DepthView};
use crate::parser::{DepthEvent, DepthSnapshot, PriceLevel};

/// How an incoming diff relates to the local sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconcile {
    /// `U <= local <= u`: apply it
    Apply,
    /// `u < local`: already covered, drop
    Stale,
    /// `U > local`: updates were missed, resync from a snapshot
    Gap,
    /// Malformed id range
    Anomaly,
}

/// Order book for a single symbol
#[derive(Debug)]
pub struct OrderBook {
    symbol: String,
    /// Bids sorted by price descending (highest first)
    bids: BTreeMap<Reverse<Decimal>, Decimal>,
    /// Asks sorted by price ascending (lowest first)
    asks: BTreeMap<Decimal, Decimal>,
    /// Next update id this book expects (`u + 1` of the last applied diff)
    last_update_id: u64,
    /// Exchange time of the last applied event
    event_time: u64,
    snapshot_applied: bool,
    state: BookState,
}

impl OrderBook {
    /// Create a new empty order book
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: 0,
            event_time: 0,
            snapshot_applied: false,
            state: BookState::Fresh,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Classify a diff against the local sequence id
    pub fn classify(&self, event: &DepthEvent) -> Reconcile {
        let local = self.last_update_id;

        if self.snapshot_applied && event.last_update_id < local {
            return Reconcile::Stale;
        }
        if event.first_update_id > event.last_update_id {
            return Reconcile::Anomaly;
        }
        if !self.snapshot_applied {
            return Reconcile::Gap;
        }

        if event.first_update_id <= local && local <= event.last_update_id {
            Reconcile::Apply
        } else if event.first_update_id > local {
            Reconcile::Gap
        } else {
            Reconcile::Anomaly
        }
    }

    /// Apply a diff that classified as [`Reconcile::Apply`]
    pub fn apply_diff(&mut self, event: &DepthEvent) {
        for level in &event.asks {
            self.update_level(BookSide::Ask, level);
        }
        for level in &event.bids {
            self.update_level(BookSide::Bid, level);
        }

        // Sequence moves only after both sides are mutated
        self.last_update_id = self.last_update_id.max(event.last_update_id + 1);
        self.event_time = event.event_time;
        if self.state == BookState::Fresh {
            self.state = BookState::Synced;
        }
    }

    /// Replace both ladders with a snapshot.
    ///
    /// Returns false (book untouched) when the snapshot is older than what
    /// the book already reflects.
    pub fn apply_snapshot(&mut self, snapshot: &DepthSnapshot) -> bool {
        let next_id = snapshot.last_update_id + 1;
        if next_id < self.last_update_id {
            warn!(
                symbol = %self.symbol,
                snapshot_id = snapshot.last_update_id,
                local_id = self.last_update_id,
                "Ignoring snapshot older than local book"
            );
            return false;
        }

        self.bids.clear();
        self.asks.clear();

        for level in &snapshot.bids {
            if Self::is_valid_entry(level) {
                self.bids.insert(Reverse(level.price), level.size);
            }
        }

        for level in &snapshot.asks {
            if Self::is_valid_entry(level) {
                self.asks.insert(level.price, level.size);
            }
        }

        self.last_update_id = next_id;
        self.event_time = chrono::Utc::now().timestamp_millis().max(0) as u64;
        self.snapshot_applied = true;
        true
    }

    fn is_valid_entry(level: &PriceLevel) -> bool {
        level.price > Decimal::ZERO && level.size > Decimal::ZERO
    }

    /// Update a single price level
    fn update_level(&mut self, side: BookSide, level: &PriceLevel) {
        if level.size.is_zero() {
            match side {
                BookSide::Bid => self.bids.remove(&Reverse(level.price)),
                BookSide::Ask => self.asks.remove(&level.price),
            };
            return;
        }

        if !Self::is_valid_entry(level) {
            trace!(symbol = %self.symbol, side = ?side, price = %level.price, size = %level.size, "Skipping invalid level");
            return;
        }

        match side {
            BookSide::Bid => {
                self.bids.insert(Reverse(level.price), level.size);
            }
            BookSide::Ask => {
                self.asks.insert(level.price, level.size);
            }
        }
    }

    /// Get best bid level
    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids
            .first_key_value()
            .map(|(Reverse(p), s)| PriceLevel::new(*p, *s))
    }

    /// Get best ask level
    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks
            .first_key_value()
            .map(|(p, s)| PriceLevel::new(*p, *s))
    }

    /// Best ask and bid, if both sides exist and the book is not crossed
    pub fn best_depth(&self) -> Option<BestDepth> {
        let ask = self.best_ask()?;
        let bid = self.best_bid()?;
        if ask.price <= bid.price {
            return None;
        }
        Some(BestDepth { ask, bid })
    }

    pub fn is_crossed(&self) -> bool {
        match (self.best_ask(), self.best_bid()) {
            (Some(ask), Some(bid)) => ask.price <= bid.price,
            _ => false,
        }
    }

    /// Up to `levels` entries per side, best first
    pub fn depth(&self, levels: usize) -> DepthView {
        DepthView {
            symbol: self.symbol.clone(),
            event_time: self.event_time,
            last_update_id: self.last_update_id,
            asks: self
                .asks
                .iter()
                .take(levels)
                .map(|(p, s)| PriceLevel::new(*p, *s))
                .collect(),
            bids: self
                .bids
                .iter()
                .take(levels)
                .map(|(Reverse(p), s)| PriceLevel::new(*p, *s))
                .collect(),
        }
    }

    pub fn ask_levels(&self) -> usize {
        self.asks.len()
    }

    pub fn bid_levels(&self) -> usize {
        self.bids.len()
    }

    /// Get last update ID
    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    pub fn event_time(&self) -> u64 {
        self.event_time
    }

    pub fn state(&self) -> BookState {
        self.state
    }

    pub fn set_state(&mut self, state: BookState) {
        self.state = state;
    }
}
