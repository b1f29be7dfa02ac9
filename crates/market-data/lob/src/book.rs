//! Ordered bid/ask book with snapshot and delta application.

use common::{BookLevel, Side};
use serde::{Deserialize, Serialize};

/// Price-ordered order book for a single symbol.
///
/// Bids are kept strictly descending by price, asks strictly ascending;
/// prices within a side are unique and a level with amount zero is never
/// stored (zero signifies deletion on the wire, not a resting state).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    /// Buy side, descending by price
    pub bids: Vec<BookLevel>,
    /// Sell side, ascending by price
    pub asks: Vec<BookLevel>,
    /// Timestamp of the last applied snapshot or delta, milliseconds
    pub timestamp: Option<i64>,
    /// Exchange sequence number of the last applied update, when tracked
    pub nonce: Option<u64>,
}

impl OrderBook {
    /// Create an empty book
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the book wholesale from a full snapshot.
    ///
    /// Levels are sorted per side, zero-amount entries dropped, and
    /// duplicate prices resolved last-write-wins (exchanges do not emit
    /// duplicates in a snapshot, so the tie rule only matters for
    /// malformed input).
    pub fn apply_snapshot(
        &mut self,
        bids: Vec<BookLevel>,
        asks: Vec<BookLevel>,
        timestamp: Option<i64>,
    ) {
        self.bids = normalize_side(bids, true);
        self.asks = normalize_side(asks, false);
        self.timestamp = timestamp;
    }

    /// Apply one absolute delta: the incoming amount replaces whatever
    /// rests at that price. Amount zero deletes the level; zero on an
    /// absent price is a no-op.
    pub fn apply_delta(&mut self, side: Side, price: f64, amount: f64) {
        let (levels, descending) = self.side_mut(side);
        let index = search_insert_index(levels, price, descending);
        let found = index < levels.len() && levels[index].price == price;
        if found {
            if amount == 0.0 {
                levels.remove(index);
            } else {
                levels[index].amount = amount;
            }
        } else if amount != 0.0 {
            levels.insert(index, BookLevel::new(price, amount));
        }
    }

    /// Apply one relative delta: the incoming amount is added to the
    /// resting amount. An exact-zero result deletes the level; a delta
    /// for an absent price inserts it (unless the amount itself is zero).
    pub fn apply_delta_additive(&mut self, side: Side, price: f64, amount: f64) {
        let (levels, descending) = self.side_mut(side);
        let index = search_insert_index(levels, price, descending);
        let found = index < levels.len() && levels[index].price == price;
        if found {
            let next = levels[index].amount + amount;
            if next == 0.0 {
                levels.remove(index);
            } else {
                levels[index].amount = next;
            }
        } else if amount != 0.0 {
            levels.insert(index, BookLevel::new(price, amount));
        }
    }

    /// Copy of the book truncated to `limit` levels per side.
    ///
    /// Emitted snapshots are always clones so callers are insulated from
    /// further in-place mutation of the live book.
    #[must_use]
    pub fn clone_depth(&self, limit: Option<usize>) -> Self {
        let take = |levels: &Vec<BookLevel>| match limit {
            Some(n) => levels.iter().copied().take(n).collect(),
            None => levels.clone(),
        };
        Self {
            bids: take(&self.bids),
            asks: take(&self.asks),
            timestamp: self.timestamp,
            nonce: self.nonce,
        }
    }

    /// Best bid, if any
    #[must_use]
    pub fn best_bid(&self) -> Option<BookLevel> {
        self.bids.first().copied()
    }

    /// Best ask, if any
    #[must_use]
    pub fn best_ask(&self) -> Option<BookLevel> {
        self.asks.first().copied()
    }

    /// True when neither side holds a level
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Drop all levels and sequence state
    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.timestamp = None;
        self.nonce = None;
    }

    fn side_mut(&mut self, side: Side) -> (&mut Vec<BookLevel>, bool) {
        match side {
            Side::Bid => (&mut self.bids, true),
            Side::Ask => (&mut self.asks, false),
        }
    }
}

/// First index whose price compares at-or-after `price` in the side's
/// sort order; `levels.len()` when every level sorts before it. Equality
/// means the price is already present at the returned index.
fn search_insert_index(levels: &[BookLevel], price: f64, descending: bool) -> usize {
    levels
        .iter()
        .position(|level| {
            if descending {
                level.price <= price
            } else {
                level.price >= price
            }
        })
        .unwrap_or(levels.len())
}

fn normalize_side(mut levels: Vec<BookLevel>, descending: bool) -> Vec<BookLevel> {
    if descending {
        levels.sort_by(|a, b| b.price.total_cmp(&a.price));
    } else {
        levels.sort_by(|a, b| a.price.total_cmp(&b.price));
    }
    // Stable sort keeps arrival order within equal prices, so keeping the
    // last entry per price is last-write-wins.
    let mut out: Vec<BookLevel> = Vec::with_capacity(levels.len());
    for level in levels {
        if let Some(last) = out.last_mut() {
            if last.price == level.price {
                *last = level;
                continue;
            }
        }
        if level.amount != 0.0 {
            out.push(level);
        }
    }
    out.retain(|level| level.amount != 0.0);
    out
}
