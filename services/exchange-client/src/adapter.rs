//! Exchange adapter plugin contract.
//!
//! An adapter is the per-exchange plugin: it declares the exchange
//! ([`ExchangeAdapter::descriptor`]), translates subscriptions into wire
//! frames, and demultiplexes inbound messages back into order book and
//! trade events. The core hands every hook an [`AdapterContext`] — the
//! capability surface through which the adapter reads and mutates
//! registry state, sends frames, resolves pending nonces and emits
//! events. Adapters keep their own protocol bookkeeping in the
//! registry's scratch space rather than in `self`.

use crate::registry::{ConnectionRegistry, SubscriptionData};
use crate::subscriptions::SubscribedEntry;
use crate::{ClientCore, ClientEvent};
use common::{
    ClientConfig, ConnectionTemplate, Credentials, EventKind, ExchangeError, OrderUpdate, Symbol,
    Trade,
};
use lob::{OrderBook, SequencedBook};
use serde_json::Value;
use tokio::sync::mpsc;
use transport::RestRequest;

/// Per-exchange plugin driven by the client core
#[async_trait::async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// The exchange's static declaration
    fn descriptor(&self) -> common::ExchangeDescriptor;

    /// Produce the combined stream URL for a shared-socket connection.
    /// Only called for templates with the shared-stream protocol.
    fn combined_stream_url(
        &self,
        _subscribed: &[SubscribedEntry],
        _template: &ConnectionTemplate,
        _params: &Value,
    ) -> Result<String, ExchangeError> {
        Err(ExchangeError::NotSupported(
            "combined stream url generation not implemented for this exchange".to_string(),
        ))
    }

    /// Tweak the connection template or URL right before a physical
    /// connection is created
    fn on_init(&self, _conn_id: &str, _template: &mut ConnectionTemplate, _url: &mut String) {}

    /// Send the protocol-specific subscribe frame for one subscription.
    /// The adapter must later resolve `nonce` through the context once
    /// the exchange confirms or rejects.
    async fn subscribe_frame(
        &self,
        _ctx: &mut AdapterContext<'_>,
        _conn_id: &str,
        event: EventKind,
        symbol: &Symbol,
        _nonce: u64,
        _params: &Value,
    ) -> Result<(), ExchangeError> {
        Err(ExchangeError::NotSupported(format!(
            "subscribe {event}({symbol}) not supported for this exchange"
        )))
    }

    /// Send the protocol-specific unsubscribe frame; same nonce contract
    /// as [`Self::subscribe_frame`]
    async fn unsubscribe_frame(
        &self,
        _ctx: &mut AdapterContext<'_>,
        _conn_id: &str,
        event: EventKind,
        symbol: &Symbol,
        _nonce: u64,
        _params: &Value,
    ) -> Result<(), ExchangeError> {
        Err(ExchangeError::NotSupported(format!(
            "unsubscribe {event}({symbol}) not supported for this exchange"
        )))
    }

    /// Demultiplex one inbound message. Errors are caught by the core and
    /// re-emitted as error events; the read loop survives.
    async fn handle_message(
        &self,
        ctx: &mut AdapterContext<'_>,
        conn_id: &str,
        raw: &str,
    ) -> Result<(), ExchangeError>;

    /// Sign a REST request. Public endpoints pass through untouched.
    fn sign(
        &self,
        request: RestRequest,
        _credentials: &Credentials,
    ) -> Result<RestRequest, ExchangeError> {
        Ok(request)
    }

    /// Inspect a REST response for exchange business errors the generic
    /// status classification cannot see
    fn handle_errors(&self, _status: u16, _body: &str, _json: Option<&Value>) -> Result<(), ExchangeError> {
        Ok(())
    }

    /// The physical connection opened
    async fn on_open(&self, _ctx: &mut AdapterContext<'_>, _conn_id: &str) {}

    /// The physical connection closed
    async fn on_close(&self, _ctx: &mut AdapterContext<'_>, _conn_id: &str) {}

    /// The physical connection reported an error
    async fn on_error(&self, _ctx: &mut AdapterContext<'_>, _conn_id: &str, _message: &str) {}

    /// A protocol pong arrived
    async fn on_pong(&self, _ctx: &mut AdapterContext<'_>, _conn_id: &str, _data: &str) {}
}

/// Capability handle the core passes into every adapter hook.
///
/// Borrowed for the duration of one hook call; all registry mutation goes
/// through it, which keeps adapter state on the client's single control
/// flow.
pub struct AdapterContext<'a> {
    pub(crate) core: &'a mut ClientCore,
    pub(crate) config: &'a ClientConfig,
    pub(crate) events: &'a mpsc::UnboundedSender<ClientEvent>,
}

impl AdapterContext<'_> {
    /// The merged client configuration
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        self.config
    }

    /// Read-only registry access
    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.core.registry
    }

    /// Mutable registry access
    pub fn registry_mut(&mut self) -> &mut ConnectionRegistry {
        &mut self.core.registry
    }

    /// Send one raw text payload on a connection
    pub fn send_text(&self, conn_id: &str, payload: &str) -> Result<(), ExchangeError> {
        self.core.registry.connection(conn_id)?.send(payload)
    }

    /// Send one JSON payload on a connection
    pub fn send_json(&self, conn_id: &str, payload: &Value) -> Result<(), ExchangeError> {
        self.send_text(conn_id, &payload.to_string())
    }

    /// Resolve a pending subscribe/unsubscribe nonce. Unknown nonces are
    /// ignored: the confirmation may simply have lost its race against
    /// the timeout.
    pub fn resolve_nonce(&mut self, nonce: u64, result: Result<(), ExchangeError>) {
        if let Some(tx) = self.core.pending.remove(&nonce) {
            let _ = tx.send(result);
        }
    }

    /// Flip the connection's ready flag; connections whose template names
    /// a `wait_for_event` stay unready until the adapter calls this
    pub fn set_connection_ready(&mut self, conn_id: &str, ready: bool) {
        self.core.registry.set_ready(conn_id, ready);
    }

    /// Flip the connection's auth flag
    pub fn set_connection_auth(&mut self, conn_id: &str, auth: bool) {
        self.core.registry.set_auth(conn_id, auth);
    }

    /// The sequenced order book for `(conn_id, symbol)`, created on first
    /// use with the connection template's delta semantics and the
    /// configured cache bound
    pub fn ensure_book(
        &mut self,
        conn_id: &str,
        symbol: &Symbol,
    ) -> Result<&mut SequencedBook, ExchangeError> {
        let additive = self
            .core
            .registry
            .context(conn_id)
            .is_some_and(|context| context.template.additive_depth);
        let cache_limit = self.config.delta_cache_limit;
        let state = self
            .core
            .registry
            .ensure_symbol(conn_id, EventKind::OrderBook, symbol)
            .ok_or_else(|| {
                ExchangeError::Exchange(format!("unknown connection context {conn_id}"))
            })?;
        if !matches!(state.data, SubscriptionData::Book(_)) {
            state.data = SubscriptionData::Book(SequencedBook::new(additive, cache_limit));
        }
        match &mut state.data {
            SubscriptionData::Book(book) => Ok(book),
            _ => Err(ExchangeError::Exchange(format!(
                "order book storage unavailable for {symbol} on {conn_id}"
            ))),
        }
    }

    /// Emit an event to the caller
    pub fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    /// Emit a detached order book snapshot, also waking any
    /// `fetch_order_book` callers blocked on the first snapshot
    pub fn emit_order_book(&mut self, symbol: &Symbol, book: OrderBook) {
        let waiters = std::mem::take(&mut self.core.book_waiters);
        for waiter in waiters {
            if waiter.symbol == *symbol {
                let _ = waiter.tx.send(book.clone_depth(waiter.limit));
            } else {
                self.core.book_waiters.push(waiter);
            }
        }
        self.emit(ClientEvent::OrderBook {
            symbol: symbol.clone(),
            book,
        });
    }

    /// Emit one public trade
    pub fn emit_trade(&self, symbol: &Symbol, trade: Trade) {
        self.emit(ClientEvent::Trade {
            symbol: symbol.clone(),
            trade,
        });
    }

    /// Emit an own-orders update
    pub fn emit_orders(&self, orders: Vec<OrderUpdate>) {
        self.emit(ClientEvent::Orders { orders });
    }
}
