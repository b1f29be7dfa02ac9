//! Order book engine.
//!
//! A pure data structure, no I/O: ordered bid/ask containers with snapshot
//! and incremental delta application ([`book`]), and a sequence-tracking
//! wrapper that buffers out-of-order deltas with a bounded replay cache
//! ([`sequenced`]).

pub mod book;
pub mod sequenced;

pub use book::OrderBook;
pub use sequenced::{ApplyOutcome, BookDelta, DeltaCache, SequencedBook};
