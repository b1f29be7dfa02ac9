//! Unified exchange client runtime.
//!
//! One [`UnifiedClient`] per exchange, built from an adapter plugin's
//! declaration. The client multiplexes logical subscriptions (order book,
//! trades, orders) over a smaller set of physical streaming connections,
//! correlates asynchronous subscribe/unsubscribe confirmations by nonce,
//! maintains per-symbol order books from sequenced deltas, and fronts all
//! REST traffic with a token-bucket rate governor.
//!
//! All mutable state lives in one [`ClientCore`] behind a single async
//! lock: transports run their own read tasks but only communicate through
//! a signal channel drained by the client's dispatcher, so state mutation
//! stays on one logical control flow.

pub mod adapter;
pub mod registry;
pub mod subscriptions;

pub use adapter::{AdapterContext, ExchangeAdapter};
pub use subscriptions::{PlannedAction, SubscribedEntry};

use common::{
    ClientConfig, ClientOptions, ConnectionTemplate, Credentials, EventKind, ExchangeError,
    OrderUpdate, Symbol, Trade,
};
use lob::OrderBook;
use registry::ConnectionRegistry;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, warn};
use transport::stream::{ConnectionFactory, ConnectionSignal, DefaultConnectionFactory, SignalKind};
use transport::{RestRequest, RestResponse, RestTransport, Throttle};

/// Events delivered to the caller over the client's event channel
#[derive(Debug)]
pub enum ClientEvent {
    /// A fresh detached order book snapshot for a symbol
    OrderBook {
        /// Symbol the book belongs to
        symbol: Symbol,
        /// Snapshot, insulated from further live-book mutation
        book: OrderBook,
    },
    /// A public trade print
    Trade {
        /// Symbol the trade happened on
        symbol: Symbol,
        /// The trade
        trade: Trade,
    },
    /// Own-order lifecycle updates
    Orders {
        /// Updated orders
        orders: Vec<OrderUpdate>,
    },
    /// A streaming-side error that does not belong to any one call
    Error {
        /// What went wrong
        error: ExchangeError,
        /// The connection it happened on, when attributable
        conn_id: Option<String>,
    },
    /// A connection closed (server side or after a failure)
    Closed {
        /// The connection that closed
        conn_id: String,
    },
}

/// A `fetch_order_book` caller waiting for the first snapshot
pub(crate) struct BookWaiter {
    pub(crate) symbol: Symbol,
    pub(crate) limit: Option<usize>,
    pub(crate) tx: oneshot::Sender<OrderBook>,
}

/// All mutable client state, guarded by one lock
pub(crate) struct ClientCore {
    pub(crate) registry: ConnectionRegistry,
    /// Connection ids whose open is deferred until the batch flush
    pub(crate) delayed: FxHashSet<String>,
    /// Outstanding subscribe/unsubscribe confirmations by nonce
    pub(crate) pending: FxHashMap<u64, oneshot::Sender<Result<(), ExchangeError>>>,
    pub(crate) book_waiters: Vec<BookWaiter>,
}

struct ClientShared {
    config: ClientConfig,
    credentials: Credentials,
    adapter: Arc<dyn ExchangeAdapter>,
    core: Mutex<ClientCore>,
    throttle: Throttle,
    rest: RestTransport,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    signals_tx: mpsc::UnboundedSender<ConnectionSignal>,
    factory: Box<dyn ConnectionFactory>,
    nonces: AtomicU64,
}

/// Unified client for one exchange
pub struct UnifiedClient {
    shared: Arc<ClientShared>,
}

impl UnifiedClient {
    /// Build a client around `adapter` using the real streaming
    /// transports. Returns the client and the event channel receiver.
    pub fn new(
        adapter: Arc<dyn ExchangeAdapter>,
        credentials: Credentials,
        options: ClientOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>), ExchangeError> {
        Self::with_connection_factory(adapter, credentials, options, Box::new(DefaultConnectionFactory))
    }

    /// Build a client with a custom connection factory. Tests use this to
    /// substitute in-memory connections for real sockets.
    pub fn with_connection_factory(
        adapter: Arc<dyn ExchangeAdapter>,
        credentials: Credentials,
        options: ClientOptions,
        factory: Box<dyn ConnectionFactory>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>), ExchangeError> {
        let config = ClientConfig::assemble(adapter.descriptor(), options);
        let throttle = Throttle::new(config.token_bucket);
        let rest = RestTransport::new(&config)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let registry = ConnectionRegistry::new(config.id.clone());
        let shared = Arc::new(ClientShared {
            config,
            credentials,
            adapter,
            core: Mutex::new(ClientCore {
                registry,
                delayed: FxHashSet::default(),
                pending: FxHashMap::default(),
                book_waiters: Vec::new(),
            }),
            throttle,
            rest,
            events_tx,
            signals_tx,
            factory,
            nonces: AtomicU64::new(0),
        });
        spawn_dispatcher(&shared, signals_rx);
        Ok((Self { shared }, events_rx))
    }

    /// The merged, immutable configuration
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// The REST transport, exposing last-response diagnostics
    #[must_use]
    pub fn rest_transport(&self) -> &RestTransport {
        &self.shared.rest
    }

    /// Subscribe to one `(event, symbol)` pair
    pub async fn subscribe(
        &self,
        event: EventKind,
        symbol: impl Into<Symbol>,
        params: Value,
    ) -> Result<(), ExchangeError> {
        self.subscribe_all(vec![SubscribedEntry::new(event, symbol).with_params(params)])
            .await
    }

    /// Unsubscribe from one `(event, symbol)` pair
    pub async fn unsubscribe(
        &self,
        event: EventKind,
        symbol: impl Into<Symbol>,
        params: Value,
    ) -> Result<(), ExchangeError> {
        self.unsubscribe_all(vec![SubscribedEntry::new(event, symbol).with_params(params)])
            .await
    }

    /// Subscribe to a whole batch atomically-validated and connected with
    /// a single flush per affected connection.
    ///
    /// The returned future resolves once every entry's confirmation
    /// arrived; one rejection or timeout fails the whole call, without
    /// disturbing the other entries' pending confirmations.
    pub async fn subscribe_all(&self, entries: Vec<SubscribedEntry>) -> Result<(), ExchangeError> {
        self.shared.subscribe_all(entries).await
    }

    /// Unsubscribe a whole batch; delayed connections are flushed once at
    /// the end regardless of the outcome
    pub async fn unsubscribe_all(&self, entries: Vec<SubscribedEntry>) -> Result<(), ExchangeError> {
        self.shared.unsubscribe_all(entries).await
    }

    /// Current order book clone for `symbol`, waiting (bounded by the
    /// client timeout) for the first snapshot when none has landed yet
    pub async fn fetch_order_book(
        &self,
        symbol: impl Into<Symbol>,
        limit: Option<usize>,
    ) -> Result<OrderBook, ExchangeError> {
        self.shared.fetch_order_book(symbol.into(), limit).await
    }

    /// Issue one throttled REST request through the adapter's sign and
    /// error hooks
    pub async fn request(&self, request: RestRequest) -> Result<RestResponse, ExchangeError> {
        self.shared.request(request).await
    }

    /// Error out unless every credential the exchange requires is set
    pub fn check_required_credentials(&self) -> Result<(), ExchangeError> {
        let required = &self.shared.config.required_credentials;
        let credentials = &self.shared.credentials;
        let checks = [
            (required.api_key, credentials.api_key.is_some(), "apiKey"),
            (required.secret, credentials.secret.is_some(), "secret"),
            (required.uid, credentials.uid.is_some(), "uid"),
            (required.password, credentials.password.is_some(), "password"),
            (required.token, credentials.token.is_some(), "token"),
        ];
        for (needed, present, name) in checks {
            if needed && !present {
                return Err(ExchangeError::Authentication(format!(
                    "{} requires `{name}` credential",
                    self.shared.config.id
                )));
            }
        }
        Ok(())
    }

    /// Close one connection locally and run the adapter's close hook
    pub async fn close_connection(&self, conn_id: &str) -> Result<(), ExchangeError> {
        self.shared.close_connection(conn_id).await
    }

    /// Close every known connection
    pub async fn close_all(&self) {
        let ids = {
            let core = self.shared.core.lock().await;
            core.registry.connection_ids()
        };
        for conn_id in ids {
            if let Err(error) = self.shared.close_connection(&conn_id).await {
                debug!(conn_id = %conn_id, %error, "close skipped");
            }
        }
    }

    /// Tear a connection down and resubscribe everything that was
    /// subscribed or subscribing on it
    pub async fn recover_connection(&self, conn_id: &str) -> Result<(), ExchangeError> {
        self.shared.recover_connection(conn_id).await
    }

    /// Ids of all known logical connections
    pub async fn connection_ids(&self) -> Vec<String> {
        let core = self.shared.core.lock().await;
        core.registry.connection_ids()
    }

    /// Whether `(event, symbol)` is confirmed subscribed
    pub async fn is_subscribed(
        &self,
        event: EventKind,
        symbol: &Symbol,
    ) -> Result<bool, ExchangeError> {
        let (conn_id, _) = subscriptions::conn_id_for_event(&self.shared.config, event, symbol)?;
        let core = self.shared.core.lock().await;
        Ok(core.registry.is_subscribed(&conn_id, event, symbol))
    }

    /// Whether `(event, symbol)` has a confirmation outstanding
    pub async fn is_subscribing(
        &self,
        event: EventKind,
        symbol: &Symbol,
    ) -> Result<bool, ExchangeError> {
        let (conn_id, _) = subscriptions::conn_id_for_event(&self.shared.config, event, symbol)?;
        let core = self.shared.core.lock().await;
        Ok(core.registry.is_subscribing(&conn_id, event, symbol))
    }
}

fn spawn_dispatcher(shared: &Arc<ClientShared>, mut signals_rx: mpsc::UnboundedReceiver<ConnectionSignal>) {
    let weak = Arc::downgrade(shared);
    tokio::spawn(async move {
        while let Some(signal) = signals_rx.recv().await {
            let Some(shared) = weak.upgrade() else { break };
            shared.handle_signal(signal).await;
        }
    });
}

impl ClientShared {
    fn adapter_context<'a>(&'a self, core: &'a mut ClientCore) -> AdapterContext<'a> {
        AdapterContext {
            core,
            config: &self.config,
            events: &self.events_tx,
        }
    }

    fn next_nonce(&self) -> u64 {
        self.nonces.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events_tx.send(event);
    }

    fn validate_events(&self, entries: &[SubscribedEntry]) -> Result<(), ExchangeError> {
        for entry in entries {
            if self.config.event_route(entry.event).is_none() {
                return Err(ExchangeError::Exchange(format!(
                    "event {} not available for exchange {}",
                    entry.event, self.config.id
                )));
            }
        }
        Ok(())
    }

    /// The central decision function: resolve the connection for
    /// `(event, symbol)`, compute the required transport action, carry it
    /// out against the registry, and either queue the connection open
    /// (`delayed`) or report that the caller must connect now.
    fn ensure_connection_active(
        &self,
        core: &mut ClientCore,
        event: EventKind,
        symbol: &Symbol,
        want_subscribed: bool,
        params: &Value,
        delayed: bool,
    ) -> Result<(String, bool), ExchangeError> {
        let (conn_id, template_name) = subscriptions::conn_id_for_event(&self.config, event, symbol)?;
        let template = self
            .config
            .template(&template_name)
            .ok_or_else(|| {
                ExchangeError::Exchange(format!(
                    "streaming connection template {template_name} does not exist in exchange {}",
                    self.config.id
                ))
            })?
            .clone();
        if !core.registry.has_context(&conn_id) {
            core.registry.reset_context(&conn_id, &template_name, &template);
        }

        let adapter = self.adapter.clone();
        let plan = subscriptions::action_for_event(
            &self.config,
            &core.registry,
            &conn_id,
            event,
            symbol,
            want_subscribed,
            |subscribed, template| adapter.combined_stream_url(subscribed, template, params),
        )?;
        let Some(plan) = plan else {
            return Ok((conn_id, false));
        };
        core.registry.ensure_symbol(&conn_id, event, symbol);

        match plan {
            PlannedAction::Reconnect { url } => {
                if let Some(conn) = core.registry.try_connection(&conn_id) {
                    conn.close();
                }
                if !delayed {
                    core.registry.reset_symbol(&conn_id, event, symbol);
                }
                self.install_connection(core, &conn_id, &template, url);
            }
            PlannedAction::Connect { url } => {
                let reusable = core
                    .registry
                    .try_connection(&conn_id)
                    .is_some_and(|conn| conn.is_active());
                if !reusable {
                    if let Some(conn) = core.registry.try_connection(&conn_id) {
                        conn.close();
                    }
                    core.registry.reset_context(&conn_id, &template_name, &template);
                    self.install_connection(core, &conn_id, &template, url);
                }
            }
            PlannedAction::Disconnect => {
                if let Some(conn) = core.registry.try_connection(&conn_id) {
                    conn.close();
                    core.registry.reset_context(&conn_id, &template_name, &template);
                }
                core.delayed.remove(&conn_id);
                return Ok((conn_id, false));
            }
        }

        if delayed {
            core.delayed.insert(conn_id.clone());
            Ok((conn_id, false))
        } else {
            Ok((conn_id, true))
        }
    }

    fn install_connection(
        &self,
        core: &mut ClientCore,
        conn_id: &str,
        template: &ConnectionTemplate,
        mut url: String,
    ) {
        let mut template = template.clone();
        self.adapter.on_init(conn_id, &mut template, &mut url);
        let conn = self
            .factory
            .create(conn_id, &url, &template, self.signals_tx.clone());
        core.registry.set_connection(conn_id, conn);
    }

    /// Open a connection and wait for readiness. Connections whose
    /// template names a `wait_for_event` only become ready once the
    /// adapter flags them so.
    async fn websocket_connect(&self, conn_id: &str) -> Result<(), ExchangeError> {
        let (conn, mut ready_rx, gated, already_ready) = {
            let core = self.core.lock().await;
            let handle = core.registry.handle(conn_id)?;
            let gated = core
                .registry
                .context(conn_id)
                .is_some_and(|context| context.template.wait_for_event.is_some());
            (
                handle.conn.clone(),
                handle.ready_changes(),
                gated,
                handle.is_ready(),
            )
        };
        if already_ready {
            return Ok(());
        }

        let timeout = Duration::from_millis(self.config.timeout_ms);
        tokio::time::timeout(timeout, conn.connect())
            .await
            .map_err(|_| {
                ExchangeError::RequestTimeout(format!(
                    "{} connect on <{conn_id}> timed out ({} ms)",
                    self.config.id, self.config.timeout_ms
                ))
            })??;

        if gated {
            let wait_ready = async {
                while !*ready_rx.borrow_and_update() {
                    if ready_rx.changed().await.is_err() {
                        break;
                    }
                }
            };
            tokio::time::timeout(timeout, wait_ready).await.map_err(|_| {
                ExchangeError::RequestTimeout(format!(
                    "{} readiness handshake on <{conn_id}> timed out ({} ms)",
                    self.config.id, self.config.timeout_ms
                ))
            })?;
        } else {
            let core = self.core.lock().await;
            core.registry.set_ready(conn_id, true);
        }
        Ok(())
    }

    /// Flush all queued delayed connections exactly once. Connect
    /// failures are emitted as error events tagged with the connection
    /// id, never thrown into the subscribing call stack.
    async fn connect_delayed(&self) {
        let queued: Vec<String> = {
            let mut core = self.core.lock().await;
            core.delayed.drain().collect()
        };
        for conn_id in queued {
            if let Err(error) = self.websocket_connect(&conn_id).await {
                warn!(conn_id = %conn_id, %error, "delayed connect failed");
                self.emit(ClientEvent::Error {
                    error,
                    conn_id: Some(conn_id),
                });
            }
        }
    }

    async fn subscribe_all(&self, entries: Vec<SubscribedEntry>) -> Result<(), ExchangeError> {
        self.validate_events(&entries)?;

        // Phase 1: register every subscription and compute the target
        // connection set without opening a single socket.
        let mut conn_ids = Vec::with_capacity(entries.len());
        {
            let mut core = self.core.lock().await;
            for entry in &entries {
                let (conn_id, _) = self.ensure_connection_active(
                    &mut core,
                    entry.event,
                    &entry.symbol,
                    true,
                    &entry.params,
                    true,
                )?;
                core.registry
                    .set_subscribing(&conn_id, entry.event, &entry.symbol, true);
                conn_ids.push(conn_id);
            }
        }

        // Phase 2: one flush opens each affected connection exactly once.
        self.connect_delayed().await;

        // Send the subscribe frames in list order, arming one pending
        // nonce per entry.
        let mut waits = Vec::with_capacity(entries.len());
        for (entry, conn_id) in entries.into_iter().zip(conn_ids) {
            let nonce = self.next_nonce();
            let (tx, rx) = oneshot::channel();
            {
                let mut core = self.core.lock().await;
                core.pending.insert(nonce, tx);
                let mut ctx = self.adapter_context(&mut core);
                let sent = self
                    .adapter
                    .subscribe_frame(&mut ctx, &conn_id, entry.event, &entry.symbol, nonce, &entry.params)
                    .await;
                if let Err(error) = sent {
                    core.pending.remove(&nonce);
                    core.registry
                        .set_subscribed(&conn_id, entry.event, &entry.symbol, false, Value::Null);
                    return Err(error);
                }
            }
            waits.push((entry, conn_id, nonce, rx));
        }

        // Confirmations may land in any order; each nonce races its own
        // timeout, and one failure fails the batch without cancelling the
        // other entries' confirmations.
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let outcomes = futures_util::future::join_all(waits.into_iter().map(
            |(entry, conn_id, nonce, rx)| async move {
                match tokio::time::timeout(timeout, rx).await {
                    Ok(Ok(Ok(()))) => {
                        let mut core = self.core.lock().await;
                        core.registry.set_subscribed(
                            &conn_id,
                            entry.event,
                            &entry.symbol,
                            true,
                            entry.params.clone(),
                        );
                        Ok(())
                    }
                    Ok(Ok(Err(error))) => {
                        let mut core = self.core.lock().await;
                        core.registry
                            .set_subscribed(&conn_id, entry.event, &entry.symbol, false, Value::Null);
                        Err(error)
                    }
                    Ok(Err(_)) => {
                        let mut core = self.core.lock().await;
                        core.registry
                            .set_subscribed(&conn_id, entry.event, &entry.symbol, false, Value::Null);
                        Err(ExchangeError::Exchange(format!(
                            "subscription confirmation dropped for {}({})",
                            entry.event, entry.symbol
                        )))
                    }
                    Err(_) => {
                        let mut core = self.core.lock().await;
                        core.pending.remove(&nonce);
                        core.registry
                            .set_subscribed(&conn_id, entry.event, &entry.symbol, false, Value::Null);
                        Err(ExchangeError::RequestTimeout(format!(
                            "{} subscribe {}({}) confirmation timed out ({} ms)",
                            self.config.id, entry.event, entry.symbol, self.config.timeout_ms
                        )))
                    }
                }
            },
        ))
        .await;
        outcomes.into_iter().collect::<Result<Vec<()>, _>>().map(|_| ())
    }

    async fn unsubscribe_all(&self, entries: Vec<SubscribedEntry>) -> Result<(), ExchangeError> {
        let validated = self.validate_events(&entries);
        let mut result = validated.clone();
        if validated.is_ok() {
            for entry in &entries {
                if let Err(error) = self.unsubscribe_one(entry).await {
                    result = Err(error);
                    break;
                }
            }
        }
        // The flush runs regardless of success, mirroring the batched
        // subscribe path's single-open guarantee.
        self.connect_delayed().await;
        result
    }

    async fn unsubscribe_one(&self, entry: &SubscribedEntry) -> Result<(), ExchangeError> {
        let (conn_id, needs_connect) = {
            let mut core = self.core.lock().await;
            self.ensure_connection_active(
                &mut core,
                entry.event,
                &entry.symbol,
                false,
                &entry.params,
                false,
            )?
        };
        if needs_connect {
            self.websocket_connect(&conn_id).await?;
        }

        let nonce = self.next_nonce();
        let (tx, rx) = oneshot::channel();
        {
            let mut core = self.core.lock().await;
            core.pending.insert(nonce, tx);
            let mut ctx = self.adapter_context(&mut core);
            let sent = self
                .adapter
                .unsubscribe_frame(&mut ctx, &conn_id, entry.event, &entry.symbol, nonce, &entry.params)
                .await;
            if let Err(error) = sent {
                core.pending.remove(&nonce);
                return Err(error);
            }
        }

        let timeout = Duration::from_millis(self.config.timeout_ms);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(()))) => {
                let mut core = self.core.lock().await;
                core.registry
                    .set_subscribed(&conn_id, entry.event, &entry.symbol, false, Value::Null);
                Ok(())
            }
            Ok(Ok(Err(error))) => Err(error),
            Ok(Err(_)) => Err(ExchangeError::Exchange(format!(
                "unsubscription confirmation dropped for {}({})",
                entry.event, entry.symbol
            ))),
            Err(_) => {
                let mut core = self.core.lock().await;
                core.pending.remove(&nonce);
                Err(ExchangeError::RequestTimeout(format!(
                    "{} unsubscribe {}({}) confirmation timed out ({} ms)",
                    self.config.id, entry.event, entry.symbol, self.config.timeout_ms
                )))
            }
        }
    }

    async fn fetch_order_book(
        &self,
        symbol: Symbol,
        limit: Option<usize>,
    ) -> Result<OrderBook, ExchangeError> {
        let (conn_id, needs_connect) = {
            let mut core = self.core.lock().await;
            self.ensure_connection_active(
                &mut core,
                EventKind::OrderBook,
                &symbol,
                true,
                &Value::Null,
                false,
            )?
        };
        if needs_connect {
            self.websocket_connect(&conn_id).await?;
        }

        let rx = {
            let mut core = self.core.lock().await;
            if let Some(registry::SubscriptionData::Book(book)) = core
                .registry
                .state(&conn_id, EventKind::OrderBook, &symbol)
                .map(|state| &state.data)
            {
                if book.is_synced() {
                    return Ok(book.snapshot(limit));
                }
            }
            let (tx, rx) = oneshot::channel();
            core.book_waiters.push(BookWaiter {
                symbol: symbol.clone(),
                limit,
                tx,
            });
            rx
        };

        let timeout = Duration::from_millis(self.config.timeout_ms);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(book)) => Ok(book),
            Ok(Err(_)) => Err(ExchangeError::Exchange(format!(
                "order book stream for {symbol} ended before the first snapshot"
            ))),
            Err(_) => Err(ExchangeError::RequestTimeout(format!(
                "{} fetch_order_book({symbol}) timed out ({} ms)",
                self.config.id, self.config.timeout_ms
            ))),
        }
    }

    async fn request(&self, request: RestRequest) -> Result<RestResponse, ExchangeError> {
        self.throttle.throttle(None).await;
        let request = self.adapter.sign(request, &self.credentials)?;
        let (url, body) = request.build(&self.config.api_url);
        let response = self
            .rest
            .execute(request.method.clone(), &url, &request.headers, body)
            .await?;
        self.adapter
            .handle_errors(response.status, &response.body, response.json.as_ref())?;
        self.raise_matched_business_error(&response)?;
        Ok(response)
    }

    /// Map exchange business errors from the response body through the
    /// descriptor's match tables: an exact match on the reported error
    /// string, then a substring scan over the whole body.
    fn raise_matched_business_error(&self, response: &RestResponse) -> Result<(), ExchangeError> {
        let reported = response.json.as_ref().and_then(|json| {
            json.get("error")
                .or_else(|| json.get("message"))
                .and_then(Value::as_str)
        });
        let kind = reported
            .and_then(|message| common::error::exact_match(&self.config.exact_errors, message))
            .or_else(|| common::error::broad_match(&self.config.broad_errors, &response.body));
        match kind {
            Some(kind) => Err(kind.into_error(format!(
                "{} {} {}",
                self.config.id, response.status, response.body
            ))),
            None => Ok(()),
        }
    }

    async fn close_connection(&self, conn_id: &str) -> Result<(), ExchangeError> {
        let mut core = self.core.lock().await;
        let conn = core.registry.connection(conn_id)?;
        conn.close();
        core.registry.set_ready(conn_id, false);
        core.registry.set_auth(conn_id, false);
        let mut ctx = self.adapter_context(&mut core);
        self.adapter.on_close(&mut ctx, conn_id).await;
        Ok(())
    }

    async fn recover_connection(&self, conn_id: &str) -> Result<(), ExchangeError> {
        let entries = {
            let core = self.core.lock().await;
            core.registry.subscribed_event_symbols(conn_id)
        };
        self.close_connection(conn_id).await?;
        {
            let mut core = self.core.lock().await;
            if let Some(context) = core.registry.context(conn_id) {
                let template_name = context.template_name.clone();
                let template = context.template.clone();
                core.registry.reset_context(conn_id, &template_name, &template);
            }
        }
        self.subscribe_all(entries).await
    }

    async fn handle_signal(&self, signal: ConnectionSignal) {
        let conn_id = signal.conn_id;
        match signal.kind {
            SignalKind::Open => {
                let mut core = self.core.lock().await;
                core.registry.set_auth(&conn_id, false);
                let mut ctx = self.adapter_context(&mut core);
                self.adapter.on_open(&mut ctx, &conn_id).await;
            }
            SignalKind::Message(raw) => {
                if self.config.verbose {
                    debug!(conn_id = %conn_id, raw = %raw, "inbound");
                }
                let mut core = self.core.lock().await;
                let mut ctx = self.adapter_context(&mut core);
                // A malformed message must never take the read loop down;
                // it surfaces as an error event instead.
                if let Err(error) = self.adapter.handle_message(&mut ctx, &conn_id, &raw).await {
                    drop(core);
                    self.emit(ClientEvent::Error {
                        error,
                        conn_id: Some(conn_id),
                    });
                }
            }
            SignalKind::Pong(data) => {
                let mut core = self.core.lock().await;
                let mut ctx = self.adapter_context(&mut core);
                self.adapter.on_pong(&mut ctx, &conn_id, &data).await;
            }
            SignalKind::Close => {
                let mut core = self.core.lock().await;
                core.registry.set_ready(&conn_id, false);
                core.registry.set_auth(&conn_id, false);
                let mut ctx = self.adapter_context(&mut core);
                self.adapter.on_close(&mut ctx, &conn_id).await;
                drop(core);
                self.emit(ClientEvent::Closed { conn_id });
            }
            SignalKind::Error(message) => {
                let mut core = self.core.lock().await;
                core.registry.set_auth(&conn_id, false);
                let mut ctx = self.adapter_context(&mut core);
                self.adapter.on_error(&mut ctx, &conn_id, &message).await;
                drop(core);
                self.emit(ClientEvent::Error {
                    error: ExchangeError::Network(message),
                    conn_id: Some(conn_id),
                });
            }
        }
    }
}
