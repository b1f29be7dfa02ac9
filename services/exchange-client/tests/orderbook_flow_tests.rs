//! Order book maintenance driven through the full streaming path:
//! inbound frames enter as connection signals, the scripted adapter
//! demultiplexes them, and the client emits detached snapshots.

mod support;

use common::{BookLevel, ClientOptions, EventKind, Symbol};
use exchange_client::ClientEvent;
use lob::OrderBook;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use support::{harness, harness_with_options, next_event, per_symbol_descriptor, settle};
use tokio::sync::mpsc;

async fn next_book(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> (Symbol, OrderBook) {
    match next_event(events).await {
        ClientEvent::OrderBook { symbol, book } => (symbol, book),
        other => panic!("expected an order book event, got {other:?}"),
    }
}

fn levels(pairs: &[(f64, f64)]) -> Vec<BookLevel> {
    pairs.iter().map(|&(p, a)| BookLevel::new(p, a)).collect()
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_emits_sorted_book_without_zero_amounts() {
    let mut h = harness(per_symbol_descriptor(), true, 1_000);
    h.client
        .subscribe(EventKind::OrderBook, "BTC/USDT", Value::Null)
        .await
        .unwrap();

    h.mocks.inject_message(
        &h.mocks.last_conn_id(),
        &json!({
            "op": "snapshot",
            "symbol": "BTC/USDT",
            "bids": [[99.0, 1.0], [101.0, 2.0], [100.0, 0.0]],
            "asks": [[103.0, 1.0], [102.0, 4.0]],
            "seq": 1,
            "ts": 1_700_000_000_000_i64,
        }),
    );

    let (symbol, book) = next_book(&mut h.events).await;
    assert_eq!(symbol.as_str(), "BTC/USDT");
    assert_eq!(book.bids, levels(&[(101.0, 2.0), (99.0, 1.0)]));
    assert_eq!(book.asks, levels(&[(102.0, 4.0), (103.0, 1.0)]));
    assert_eq!(book.timestamp, Some(1_700_000_000_000));
    assert_eq!(book.nonce, Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_out_of_order_deltas_buffer_and_drain() {
    let mut h = harness(per_symbol_descriptor(), true, 1_000);
    h.client
        .subscribe(EventKind::OrderBook, "BTC/USDT", Value::Null)
        .await
        .unwrap();
    let conn_id = h.mocks.last_conn_id();

    h.mocks.inject_message(
        &conn_id,
        &json!({
            "op": "snapshot",
            "symbol": "BTC/USDT",
            "bids": [[100.0, 1.0]],
            "asks": [[101.0, 1.0]],
            "seq": 1,
        }),
    );
    let _ = next_book(&mut h.events).await;

    // Sequence 3 arrives first and is parked without emission; 2 lands,
    // applies, and drains 3 right behind it, all in one event.
    h.mocks.inject_message(
        &conn_id,
        &json!({ "op": "delta", "symbol": "BTC/USDT", "seq": 3, "bids": [[98.0, 3.0]], "asks": [] }),
    );
    h.mocks.inject_message(
        &conn_id,
        &json!({ "op": "delta", "symbol": "BTC/USDT", "seq": 2, "bids": [[99.0, 2.0]], "asks": [] }),
    );

    let (_, book) = next_book(&mut h.events).await;
    assert_eq!(
        book.bids,
        levels(&[(100.0, 1.0), (99.0, 2.0), (98.0, 3.0)])
    );
    assert_eq!(book.nonce, Some(3));

    // A stale replay of sequence 2 is discarded silently.
    h.mocks.inject_message(
        &conn_id,
        &json!({ "op": "delta", "symbol": "BTC/USDT", "seq": 2, "bids": [[50.0, 9.0]], "asks": [] }),
    );
    h.mocks.inject_message(
        &conn_id,
        &json!({ "op": "delta", "symbol": "BTC/USDT", "seq": 4, "bids": [[99.0, 0.0]], "asks": [] }),
    );
    let (_, book) = next_book(&mut h.events).await;
    assert_eq!(book.bids, levels(&[(100.0, 1.0), (98.0, 3.0)]));
}

#[tokio::test(start_paused = true)]
async fn test_delta_cache_overflow_demands_fresh_snapshot() {
    let mut h = harness_with_options(
        per_symbol_descriptor(),
        true,
        ClientOptions {
            timeout_ms: 1_000,
            delta_cache_limit: 2,
            ..ClientOptions::default()
        },
    );
    h.client
        .subscribe(EventKind::OrderBook, "BTC/USDT", Value::Null)
        .await
        .unwrap();
    let conn_id = h.mocks.last_conn_id();

    h.mocks.inject_message(
        &conn_id,
        &json!({
            "op": "snapshot",
            "symbol": "BTC/USDT",
            "bids": [[100.0, 1.0]],
            "asks": [[101.0, 1.0]],
            "seq": 1,
        }),
    );
    let _ = next_book(&mut h.events).await;

    // Three gapped deltas against a bound of two: the third overflows the
    // cache and surfaces as an error event demanding a resync.
    for seq in [10, 11, 12] {
        h.mocks.inject_message(
            &conn_id,
            &json!({ "op": "delta", "symbol": "BTC/USDT", "seq": seq, "bids": [[90.0, 1.0]], "asks": [] }),
        );
    }
    match next_event(&mut h.events).await {
        ClientEvent::Error { error, .. } => {
            assert!(error.to_string().contains("lost sync"), "got {error}");
        }
        other => panic!("expected an error event, got {other:?}"),
    }

    // Nothing partial was applied while the book was out of sync.
    let stale = h
        .client
        .fetch_order_book("BTC/USDT", None)
        .await
        .unwrap_err();
    assert!(stale.to_string().contains("timed out"), "got {stale}");

    // A fresh snapshot reseeds the book and deltas flow again.
    h.mocks.inject_message(
        &conn_id,
        &json!({
            "op": "snapshot",
            "symbol": "BTC/USDT",
            "bids": [[95.0, 1.0]],
            "asks": [[96.0, 1.0]],
            "seq": 20,
        }),
    );
    let (_, book) = next_book(&mut h.events).await;
    assert_eq!(book.bids, levels(&[(95.0, 1.0)]));

    h.mocks.inject_message(
        &conn_id,
        &json!({ "op": "delta", "symbol": "BTC/USDT", "seq": 21, "bids": [[94.0, 2.0]], "asks": [] }),
    );
    let (_, book) = next_book(&mut h.events).await;
    assert_eq!(book.bids, levels(&[(95.0, 1.0), (94.0, 2.0)]));
}

#[tokio::test(start_paused = true)]
async fn test_fetch_order_book_waits_for_first_snapshot() {
    let h = harness(per_symbol_descriptor(), true, 1_000);

    let fetch = h.client.fetch_order_book("BTC/USDT", Some(1));
    let feed = async {
        settle().await;
        h.mocks.inject_message(
            &h.mocks.last_conn_id(),
            &json!({
                "op": "snapshot",
                "symbol": "BTC/USDT",
                "bids": [[100.0, 1.0], [99.0, 2.0]],
                "asks": [[101.0, 1.0], [102.0, 2.0]],
                "seq": 1,
            }),
        );
    };
    let (book, ()) = tokio::join!(fetch, feed);
    let book = book.unwrap();

    // Depth-limited detached copy of the first snapshot.
    assert_eq!(book.bids, levels(&[(100.0, 1.0)]));
    assert_eq!(book.asks, levels(&[(101.0, 1.0)]));

    // A second fetch resolves immediately from the synced live book.
    let book = h.client.fetch_order_book("BTC/USDT", None).await.unwrap();
    assert_eq!(book.bids.len(), 2);
}
