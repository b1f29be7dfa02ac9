//! In-memory test doubles for the client runtime.
//!
//! [`MockFactory`] produces [`MockConnection`]s instead of real sockets:
//! a connect attempt just flips a flag and emits `Open`, sends are
//! recorded, and tests push inbound traffic straight into the client's
//! signal channel. [`ScriptedAdapter`] is a minimal exchange plugin
//! speaking a tiny json protocol (`confirm`/`reject`/`snapshot`/`delta`/
//! `trade`) so every streaming path can be driven without a network.

#![allow(dead_code)]

use common::{
    BookLevel, ClientOptions, ConnectionTemplate, Credentials, EventKind, ExchangeDescriptor,
    ExchangeError, Symbol, Trade, TradeSide, WireProtocol,
};
use common::config::EventRoute;
use exchange_client::{
    AdapterContext, ClientEvent, ExchangeAdapter, SubscribedEntry, UnifiedClient,
};
use lob::{ApplyOutcome, BookDelta};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use transport::stream::{ConnectionFactory, ConnectionSignal, SignalKind};
use transport::StreamConnection;

/// One fake physical connection
pub struct MockConnection {
    conn_id: String,
    pub url: String,
    active: AtomicBool,
    sent: Mutex<Vec<String>>,
    signals: mpsc::UnboundedSender<ConnectionSignal>,
}

impl MockConnection {
    fn new(conn_id: &str, url: &str, signals: mpsc::UnboundedSender<ConnectionSignal>) -> Self {
        Self {
            conn_id: conn_id.to_string(),
            url: url.to_string(),
            active: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            signals,
        }
    }

    /// Frames written to this connection, in order
    pub fn sent_frames(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl StreamConnection for MockConnection {
    async fn connect(&self) -> Result<(), ExchangeError> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.signals.send(ConnectionSignal {
            conn_id: self.conn_id.clone(),
            kind: SignalKind::Open,
        });
        Ok(())
    }

    fn close(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    fn send(&self, payload: &str) -> Result<(), ExchangeError> {
        if !self.is_active() {
            return Err(ExchangeError::Network(format!(
                "mock connection {} is not connected",
                self.conn_id
            )));
        }
        self.sent.lock().unwrap().push(payload.to_string());
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Everything the factory observed, shared with the test body
#[derive(Default)]
pub struct MockState {
    created: Mutex<Vec<(String, Arc<MockConnection>)>>,
    signals: Mutex<Option<mpsc::UnboundedSender<ConnectionSignal>>>,
}

impl MockState {
    /// Number of physical connections created so far
    pub fn create_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    /// URLs the connections were created with, in creation order
    pub fn created_urls(&self) -> Vec<String> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .map(|(_, conn)| conn.url.clone())
            .collect()
    }

    /// The most recently created connection
    pub fn last_connection(&self) -> Arc<MockConnection> {
        self.created
            .lock()
            .unwrap()
            .last()
            .map(|(_, conn)| conn.clone())
            .expect("no connection was created")
    }

    /// The most recently created connection's logical id
    pub fn last_conn_id(&self) -> String {
        self.created
            .lock()
            .unwrap()
            .last()
            .map(|(conn_id, _)| conn_id.clone())
            .expect("no connection was created")
    }

    /// Connection created at `index`
    pub fn connection_at(&self, index: usize) -> Arc<MockConnection> {
        self.created.lock().unwrap()[index].1.clone()
    }

    /// Push one inbound signal for `conn_id` into the client
    pub fn inject(&self, conn_id: &str, kind: SignalKind) {
        let signals = self.signals.lock().unwrap();
        let sender = signals.as_ref().expect("no connection was created yet");
        let _ = sender.send(ConnectionSignal {
            conn_id: conn_id.to_string(),
            kind,
        });
    }

    /// Push one inbound application message for `conn_id`
    pub fn inject_message(&self, conn_id: &str, payload: &Value) {
        self.inject(conn_id, SignalKind::Message(payload.to_string()));
    }
}

/// Factory handing out [`MockConnection`]s and recording them
pub struct MockFactory {
    state: Arc<MockState>,
}

impl MockFactory {
    pub fn new(state: Arc<MockState>) -> Self {
        Self { state }
    }
}

impl ConnectionFactory for MockFactory {
    fn create(
        &self,
        conn_id: &str,
        url: &str,
        _template: &ConnectionTemplate,
        signals: mpsc::UnboundedSender<ConnectionSignal>,
    ) -> Arc<dyn StreamConnection> {
        *self.state.signals.lock().unwrap() = Some(signals.clone());
        let conn = Arc::new(MockConnection::new(conn_id, url, signals));
        self.state
            .created
            .lock()
            .unwrap()
            .push((conn_id.to_string(), conn.clone()));
        conn
    }
}

/// Scripted exchange plugin for tests.
///
/// Subscribe frames are written to the wire and their nonces recorded;
/// with `auto_confirm` the nonce resolves immediately, otherwise the test
/// injects a `confirm`/`reject` message carrying it. Unsubscribes are
/// frameless (the shared-stream protocol encodes the subscribed set in
/// the URL) and follow the same confirmation rule.
pub struct ScriptedAdapter {
    descriptor: ExchangeDescriptor,
    auto_confirm: bool,
    nonces: Mutex<HashMap<(EventKind, Symbol), u64>>,
}

impl ScriptedAdapter {
    pub fn new(descriptor: ExchangeDescriptor, auto_confirm: bool) -> Self {
        Self {
            descriptor,
            auto_confirm,
            nonces: Mutex::new(HashMap::new()),
        }
    }

    /// The nonce the adapter last sent for `(event, symbol)`
    pub fn nonce_for(&self, event: EventKind, symbol: &Symbol) -> Option<u64> {
        self.nonces
            .lock()
            .unwrap()
            .get(&(event, symbol.clone()))
            .copied()
    }
}

fn parse_levels(value: &Value) -> Vec<BookLevel> {
    value
        .as_array()
        .map(|levels| {
            levels
                .iter()
                .filter_map(|pair| {
                    Some(BookLevel::new(pair[0].as_f64()?, pair[1].as_f64()?))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait::async_trait]
impl ExchangeAdapter for ScriptedAdapter {
    fn descriptor(&self) -> ExchangeDescriptor {
        self.descriptor.clone()
    }

    fn combined_stream_url(
        &self,
        subscribed: &[SubscribedEntry],
        template: &ConnectionTemplate,
        _params: &Value,
    ) -> Result<String, ExchangeError> {
        let streams: Vec<String> = subscribed
            .iter()
            .map(|entry| {
                format!(
                    "{}@{}",
                    entry.symbol.as_str().to_lowercase().replace('/', ""),
                    entry.event.as_str()
                )
            })
            .collect();
        Ok(format!("{}/stream?streams={}", template.base_url, streams.join("/")))
    }

    async fn subscribe_frame(
        &self,
        ctx: &mut AdapterContext<'_>,
        conn_id: &str,
        event: EventKind,
        symbol: &Symbol,
        nonce: u64,
        _params: &Value,
    ) -> Result<(), ExchangeError> {
        self.nonces
            .lock()
            .unwrap()
            .insert((event, symbol.clone()), nonce);
        ctx.send_json(
            conn_id,
            &json!({
                "op": "subscribe",
                "event": event.as_str(),
                "symbol": symbol.as_str(),
                "nonce": nonce,
            }),
        )?;
        if self.auto_confirm {
            ctx.resolve_nonce(nonce, Ok(()));
        }
        Ok(())
    }

    async fn unsubscribe_frame(
        &self,
        ctx: &mut AdapterContext<'_>,
        _conn_id: &str,
        event: EventKind,
        symbol: &Symbol,
        nonce: u64,
        _params: &Value,
    ) -> Result<(), ExchangeError> {
        self.nonces
            .lock()
            .unwrap()
            .insert((event, symbol.clone()), nonce);
        if self.auto_confirm {
            ctx.resolve_nonce(nonce, Ok(()));
        }
        Ok(())
    }

    async fn handle_message(
        &self,
        ctx: &mut AdapterContext<'_>,
        conn_id: &str,
        raw: &str,
    ) -> Result<(), ExchangeError> {
        let message: Value = serde_json::from_str(raw).map_err(|e| {
            ExchangeError::Exchange(format!("unreadable frame on {conn_id}: {e}"))
        })?;
        match message["op"].as_str().unwrap_or_default() {
            "confirm" => {
                let nonce = message["nonce"].as_u64().unwrap_or_default();
                ctx.resolve_nonce(nonce, Ok(()));
            }
            "reject" => {
                let nonce = message["nonce"].as_u64().unwrap_or_default();
                let reason = message["reason"].as_str().unwrap_or("rejected").to_string();
                ctx.resolve_nonce(nonce, Err(ExchangeError::Exchange(reason)));
            }
            "snapshot" => {
                let symbol = Symbol::from(message["symbol"].as_str().unwrap_or_default());
                let snapshot = {
                    let book = ctx.ensure_book(conn_id, &symbol)?;
                    book.reset(
                        parse_levels(&message["bids"]),
                        parse_levels(&message["asks"]),
                        message["ts"].as_i64(),
                        message["seq"].as_u64().unwrap_or_default(),
                    );
                    book.snapshot(None)
                };
                ctx.emit_order_book(&symbol, snapshot);
            }
            "delta" => {
                let symbol = Symbol::from(message["symbol"].as_str().unwrap_or_default());
                let delta = BookDelta {
                    sequence: message["seq"].as_u64().unwrap_or_default(),
                    bids: parse_levels(&message["bids"]),
                    asks: parse_levels(&message["asks"]),
                    timestamp: message["ts"].as_i64(),
                };
                let (outcome, snapshot) = {
                    let book = ctx.ensure_book(conn_id, &symbol)?;
                    let outcome = book.apply(delta);
                    let snapshot = matches!(outcome, ApplyOutcome::Applied { .. })
                        .then(|| book.snapshot(None));
                    (outcome, snapshot)
                };
                if let Some(snapshot) = snapshot {
                    ctx.emit_order_book(&symbol, snapshot);
                } else if outcome == ApplyOutcome::ResyncRequired {
                    return Err(ExchangeError::Exchange(format!(
                        "order book for {symbol} lost sync, fetch a fresh snapshot"
                    )));
                }
            }
            "trade" => {
                let symbol = Symbol::from(message["symbol"].as_str().unwrap_or_default());
                let trade = Trade {
                    id: message["id"].as_str().map(str::to_string),
                    symbol: symbol.clone(),
                    timestamp: message["ts"].as_i64(),
                    price: message["price"].as_f64().unwrap_or_default(),
                    amount: message["amount"].as_f64().unwrap_or_default(),
                    side: match message["side"].as_str() {
                        Some("buy") => Some(TradeSide::Buy),
                        Some("sell") => Some(TradeSide::Sell),
                        _ => None,
                    },
                };
                ctx.emit_trade(&symbol, trade);
            }
            other => {
                return Err(ExchangeError::Exchange(format!(
                    "unknown op `{other}` on {conn_id}"
                )));
            }
        }
        Ok(())
    }
}

/// Descriptor for an exchange with one socket per event/symbol
pub fn per_symbol_descriptor() -> ExchangeDescriptor {
    ExchangeDescriptor::new("testex", 50)
        .with_api_url("https://api.testex.test")
        .with_event(
            EventKind::OrderBook,
            EventRoute::new("ws")
                .with_conn_id("{id}-{event}-{symbol}")
                .with_url("{baseurl}/{symbol}/{event}"),
        )
        .with_event(
            EventKind::Trade,
            EventRoute::new("ws")
                .with_conn_id("{id}-{event}-{symbol}")
                .with_url("{baseurl}/{symbol}/{event}"),
        )
        .with_template("ws", ConnectionTemplate::new(WireProtocol::Ws, "wss://ws.testex.test"))
}

/// Descriptor for an exchange multiplexing everything over one shared
/// socket whose URL encodes the subscribed set
pub fn shared_stream_descriptor() -> ExchangeDescriptor {
    ExchangeDescriptor::new("sharedex", 50)
        .with_api_url("https://api.sharedex.test")
        .with_event(EventKind::OrderBook, EventRoute::new("stream"))
        .with_event(EventKind::Trade, EventRoute::new("stream"))
        .with_template(
            "stream",
            ConnectionTemplate::new(WireProtocol::WsShared, "wss://stream.sharedex.test"),
        )
}

/// A client wired to mocks, plus every handle a test needs
pub struct Harness {
    pub client: UnifiedClient,
    pub events: mpsc::UnboundedReceiver<ClientEvent>,
    pub adapter: Arc<ScriptedAdapter>,
    pub mocks: Arc<MockState>,
}

/// Build a client around [`ScriptedAdapter`] and [`MockFactory`]
pub fn harness(descriptor: ExchangeDescriptor, auto_confirm: bool, timeout_ms: u64) -> Harness {
    harness_with_options(
        descriptor,
        auto_confirm,
        ClientOptions {
            timeout_ms,
            ..ClientOptions::default()
        },
    )
}

/// [`harness`] with full control over the client options
pub fn harness_with_options(
    descriptor: ExchangeDescriptor,
    auto_confirm: bool,
    options: ClientOptions,
) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let adapter = Arc::new(ScriptedAdapter::new(descriptor, auto_confirm));
    let mocks = Arc::new(MockState::default());
    let (client, events) = UnifiedClient::with_connection_factory(
        adapter.clone(),
        Credentials::default(),
        options,
        Box::new(MockFactory::new(mocks.clone())),
    )
    .expect("client construction");
    Harness {
        client,
        events,
        adapter,
        mocks,
    }
}

/// Receive the next client event, failing the test on a quiet channel
pub async fn next_event(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for a client event")
        .expect("event channel closed")
}

/// Yield to the runtime until spawned client tasks settle
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
