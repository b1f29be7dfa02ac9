//! Sequence tracking and out-of-order delta buffering.
//!
//! Streaming order book feeds number their deltas. A delta can only be
//! applied when it directly follows the last applied sequence number;
//! anything arriving early is parked in a bounded [`DeltaCache`] and
//! drained once the gap closes. Overflowing the cache gives up on replay
//! entirely: the cache is dropped and the owner must fetch a fresh
//! snapshot.

use crate::book::OrderBook;
use common::{BookLevel, Side};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// One sequence-numbered order book delta
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookDelta {
    /// Strictly increasing exchange sequence number
    pub sequence: u64,
    /// Bid side changes
    pub bids: Vec<BookLevel>,
    /// Ask side changes
    pub asks: Vec<BookLevel>,
    /// Delta timestamp in milliseconds, when the exchange sends one
    pub timestamp: Option<i64>,
}

/// Result of feeding one delta into a [`SequencedBook`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The delta was applied in place; `drained` buffered deltas followed it
    Applied { drained: usize },
    /// The delta arrived early and was parked in the cache
    Buffered,
    /// The delta's sequence was already applied; discarded without error
    Stale,
    /// The cache overflowed (or a previous overflow is unresolved); the
    /// book is stale until [`SequencedBook::reset`] seeds a new snapshot
    ResyncRequired,
}

/// Bounded buffer of out-of-order deltas keyed by sequence number
#[derive(Debug, Clone)]
pub struct DeltaCache {
    entries: BTreeMap<u64, BookDelta>,
    max_entries: usize,
}

impl DeltaCache {
    /// Create a cache holding at most `max_entries` deltas
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            max_entries,
        }
    }

    /// Number of parked deltas
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is parked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Park a delta; returns false when the bound is now exceeded and the
    /// whole cache has been discarded
    fn insert(&mut self, delta: BookDelta) -> bool {
        self.entries.insert(delta.sequence, delta);
        if self.entries.len() > self.max_entries {
            self.entries.clear();
            return false;
        }
        true
    }

    /// Remove and return the delta for `sequence`, if parked
    fn take(&mut self, sequence: u64) -> Option<BookDelta> {
        self.entries.remove(&sequence)
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

/// An [`OrderBook`] plus the sequencing state of its feed
#[derive(Debug, Clone)]
pub struct SequencedBook {
    book: OrderBook,
    last_sequence: u64,
    cache: DeltaCache,
    /// Deltas add to resting amounts instead of replacing them
    additive: bool,
    needs_resync: bool,
    synced: bool,
}

impl SequencedBook {
    /// Create an unsynced book; `additive` selects relative-quantity delta
    /// semantics, `max_cached` bounds the out-of-order buffer
    #[must_use]
    pub fn new(additive: bool, max_cached: usize) -> Self {
        Self {
            book: OrderBook::new(),
            last_sequence: 0,
            cache: DeltaCache::new(max_cached),
            additive,
            needs_resync: false,
            synced: false,
        }
    }

    /// The live book. Callers that emit state must go through
    /// [`Self::snapshot`] instead.
    #[must_use]
    pub fn book(&self) -> &OrderBook {
        &self.book
    }

    /// Sequence number of the last applied update
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Number of currently buffered out-of-order deltas
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.cache.len()
    }

    /// True once a snapshot has been seeded and no resync is outstanding
    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.synced && !self.needs_resync
    }

    /// Detached copy of the live book truncated to `limit` levels per side
    #[must_use]
    pub fn snapshot(&self, limit: Option<usize>) -> OrderBook {
        self.book.clone_depth(limit)
    }

    /// Seed the book from a full snapshot at `sequence`, clearing any
    /// buffered deltas and an outstanding resync condition
    pub fn reset(
        &mut self,
        bids: Vec<BookLevel>,
        asks: Vec<BookLevel>,
        timestamp: Option<i64>,
        sequence: u64,
    ) {
        self.book.apply_snapshot(bids, asks, timestamp);
        self.book.nonce = Some(sequence);
        self.last_sequence = sequence;
        self.cache.clear();
        self.needs_resync = false;
        self.synced = true;
    }

    /// Feed one delta.
    ///
    /// In-order deltas apply immediately and drain any now-contiguous
    /// buffered run. Early deltas are buffered; overflowing the buffer
    /// abandons replay and demands a fresh snapshot. Late deltas are
    /// discarded as stale.
    pub fn apply(&mut self, delta: BookDelta) -> ApplyOutcome {
        if self.needs_resync {
            return ApplyOutcome::ResyncRequired;
        }
        if delta.sequence <= self.last_sequence {
            return ApplyOutcome::Stale;
        }
        if delta.sequence == self.last_sequence + 1 {
            self.apply_now(&delta);
            let mut drained = 0;
            while let Some(next) = self.cache.take(self.last_sequence + 1) {
                self.apply_now(&next);
                drained += 1;
            }
            return ApplyOutcome::Applied { drained };
        }
        if self.cache.insert(delta) {
            ApplyOutcome::Buffered
        } else {
            warn!(
                last_sequence = self.last_sequence,
                "delta cache overflow, dropping buffered deltas and requesting resync"
            );
            self.needs_resync = true;
            ApplyOutcome::ResyncRequired
        }
    }

    fn apply_now(&mut self, delta: &BookDelta) {
        for level in &delta.bids {
            if self.additive {
                self.book.apply_delta_additive(Side::Bid, level.price, level.amount);
            } else {
                self.book.apply_delta(Side::Bid, level.price, level.amount);
            }
        }
        for level in &delta.asks {
            if self.additive {
                self.book.apply_delta_additive(Side::Ask, level.price, level.amount);
            } else {
                self.book.apply_delta(Side::Ask, level.price, level.amount);
            }
        }
        if delta.timestamp.is_some() {
            self.book.timestamp = delta.timestamp;
        }
        self.last_sequence = delta.sequence;
        self.book.nonce = Some(delta.sequence);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn delta(sequence: u64, bid: (f64, f64)) -> BookDelta {
        BookDelta {
            sequence,
            bids: vec![BookLevel::new(bid.0, bid.1)],
            asks: Vec::new(),
            timestamp: None,
        }
    }

    fn seeded(max_cached: usize) -> SequencedBook {
        let mut book = SequencedBook::new(false, max_cached);
        book.reset(
            vec![BookLevel::new(100.0, 1.0)],
            vec![BookLevel::new(101.0, 1.0)],
            Some(1),
            1,
        );
        book
    }

    #[test]
    fn test_in_order_applies_immediately() {
        let mut book = seeded(10);
        assert_eq!(
            book.apply(delta(2, (99.0, 5.0))),
            ApplyOutcome::Applied { drained: 0 }
        );
        assert_eq!(book.last_sequence(), 2);
        assert_eq!(book.book().nonce, Some(2));
    }

    #[test]
    fn test_out_of_order_buffers_then_drains() {
        let mut book = seeded(10);

        // Sequence 3 arrives before 2.
        assert_eq!(book.apply(delta(3, (98.0, 3.0))), ApplyOutcome::Buffered);
        assert_eq!(book.buffered(), 1);
        assert_eq!(book.last_sequence(), 1);

        // 2 lands, 3 drains right behind it.
        assert_eq!(
            book.apply(delta(2, (99.0, 2.0))),
            ApplyOutcome::Applied { drained: 1 }
        );
        assert_eq!(book.last_sequence(), 3);
        assert_eq!(book.buffered(), 0);

        // Final state equals applying 1, 2, 3 in order.
        let mut ordered = seeded(10);
        ordered.apply(delta(2, (99.0, 2.0)));
        ordered.apply(delta(3, (98.0, 3.0)));
        assert_eq!(book.book(), ordered.book());
    }

    #[test]
    fn test_stale_sequence_discarded() {
        let mut book = seeded(10);
        book.apply(delta(2, (99.0, 2.0)));
        let before = book.book().clone();

        assert_eq!(book.apply(delta(2, (50.0, 9.0))), ApplyOutcome::Stale);
        assert_eq!(book.apply(delta(1, (50.0, 9.0))), ApplyOutcome::Stale);
        assert_eq!(book.book(), &before);
    }

    #[test]
    fn test_cache_overflow_drops_everything_and_requires_resync() {
        let mut book = seeded(2);
        let before = book.book().clone();

        assert_eq!(book.apply(delta(10, (90.0, 1.0))), ApplyOutcome::Buffered);
        assert_eq!(book.apply(delta(11, (91.0, 1.0))), ApplyOutcome::Buffered);
        assert_eq!(
            book.apply(delta(12, (92.0, 1.0))),
            ApplyOutcome::ResyncRequired
        );
        assert_eq!(book.buffered(), 0);
        assert!(!book.is_synced());

        // Nothing partial was applied, and nothing applies until reset.
        assert_eq!(book.book(), &before);
        assert_eq!(book.apply(delta(2, (99.0, 1.0))), ApplyOutcome::ResyncRequired);

        book.reset(vec![BookLevel::new(95.0, 1.0)], Vec::new(), Some(2), 20);
        assert!(book.is_synced());
        assert_eq!(
            book.apply(delta(21, (94.0, 1.0))),
            ApplyOutcome::Applied { drained: 0 }
        );
    }

    #[test]
    fn test_additive_book_uses_relative_semantics() {
        let mut book = SequencedBook::new(true, 10);
        book.reset(vec![BookLevel::new(100.0, 2.0)], Vec::new(), None, 1);

        book.apply(delta(2, (100.0, 3.0)));
        assert_eq!(book.book().bids[0].amount, 5.0);

        book.apply(delta(3, (100.0, -5.0)));
        assert!(book.book().bids.is_empty());
    }
}
