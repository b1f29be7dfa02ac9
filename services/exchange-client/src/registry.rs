//! Connection registry: pure bookkeeping of logical connections.
//!
//! One [`ConnectionContext`] per logical connection id holds the template
//! the connection was built from, the live transport handle with its
//! ready/auth flags, every subscription's state, and a free-form scratch
//! map adapters use for protocol bookkeeping (symbol-id lookup tables and
//! the like). No network I/O happens here; the registry is only ever
//! touched from the client's single control flow.

use crate::subscriptions::SubscribedEntry;
use common::{ConnectionTemplate, EventKind, ExchangeError, Symbol};
use lob::SequencedBook;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use transport::StreamConnection;

/// Event-specific payload stored per subscription
#[derive(Debug, Default)]
pub enum SubscriptionData {
    /// Nothing stored yet
    #[default]
    None,
    /// Live order book with sequencing state
    Book(SequencedBook),
    /// Pending own-order state keyed by order id
    Orders(FxHashMap<String, common::OrderUpdate>),
}

/// State of one `(connection, event, symbol)` subscription.
///
/// `subscribed` and `subscribing` are never both true; the setters below
/// enforce the exclusion.
#[derive(Debug, Default)]
pub struct SubscriptionState {
    /// Confirmed by the exchange
    pub subscribed: bool,
    /// Requested, confirmation outstanding
    pub subscribing: bool,
    /// Parameters the subscription was requested with; needed to
    /// recompute combined stream URLs on reconnect
    pub params: Value,
    /// Event-specific payload
    pub data: SubscriptionData,
}

impl SubscriptionState {
    fn reset(&mut self) {
        self.subscribed = false;
        self.subscribing = false;
        self.data = SubscriptionData::None;
    }
}

/// Live transport handle plus its readiness flags
pub struct ConnectionHandle {
    /// The physical connection
    pub conn: Arc<dyn StreamConnection>,
    /// Authenticated at the application level
    pub auth: bool,
    ready: watch::Sender<bool>,
}

impl ConnectionHandle {
    fn new(conn: Arc<dyn StreamConnection>) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            conn,
            auth: false,
            ready,
        }
    }

    /// Whether the connection finished its open/handshake dance
    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Flip the ready flag, waking anyone blocked on it
    pub fn set_ready(&self, ready: bool) {
        self.ready.send_replace(ready);
    }

    /// Watch for ready-flag changes
    #[must_use]
    pub fn ready_changes(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("ready", &self.is_ready())
            .field("auth", &self.auth)
            .field("active", &self.conn.is_active())
            .finish()
    }
}

/// Everything known about one logical connection
#[derive(Debug)]
pub struct ConnectionContext {
    /// Name of the template this connection was resolved from
    pub template_name: String,
    /// The template itself, frozen at resolution time
    pub template: ConnectionTemplate,
    /// Live transport, absent before the first connect attempt
    pub conn: Option<ConnectionHandle>,
    events: FxHashMap<EventKind, FxHashMap<Symbol, SubscriptionState>>,
    scratch: FxHashMap<String, Value>,
}

impl ConnectionContext {
    fn new(template_name: &str, template: &ConnectionTemplate) -> Self {
        Self {
            template_name: template_name.to_string(),
            template: template.clone(),
            conn: None,
            events: FxHashMap::default(),
            scratch: FxHashMap::default(),
        }
    }
}

/// Registry of all connection contexts of one client
#[derive(Debug)]
pub struct ConnectionRegistry {
    exchange_id: String,
    contexts: FxHashMap<String, ConnectionContext>,
}

impl ConnectionRegistry {
    /// Create an empty registry for `exchange_id`
    #[must_use]
    pub fn new(exchange_id: impl Into<String>) -> Self {
        Self {
            exchange_id: exchange_id.into(),
            contexts: FxHashMap::default(),
        }
    }

    /// Whether a context exists for `conn_id`
    #[must_use]
    pub fn has_context(&self, conn_id: &str) -> bool {
        self.contexts.contains_key(conn_id)
    }

    /// Create the context if absent; otherwise clear every subscription's
    /// flags and data and drop the transport handle, keeping only the
    /// template
    pub fn reset_context(
        &mut self,
        conn_id: &str,
        template_name: &str,
        template: &ConnectionTemplate,
    ) {
        match self.contexts.get_mut(conn_id) {
            None => {
                self.contexts
                    .insert(conn_id.to_string(), ConnectionContext::new(template_name, template));
            }
            Some(context) => {
                context.conn = None;
                for symbols in context.events.values_mut() {
                    for state in symbols.values_mut() {
                        state.reset();
                    }
                }
            }
        }
    }

    /// Context for `conn_id`, if any
    #[must_use]
    pub fn context(&self, conn_id: &str) -> Option<&ConnectionContext> {
        self.contexts.get(conn_id)
    }

    /// Mutable context for `conn_id`, if any
    pub fn context_mut(&mut self, conn_id: &str) -> Option<&mut ConnectionContext> {
        self.contexts.get_mut(conn_id)
    }

    /// Ids of all known contexts
    #[must_use]
    pub fn connection_ids(&self) -> Vec<String> {
        self.contexts.keys().cloned().collect()
    }

    /// The live transport, or `None` before any connect attempt
    #[must_use]
    pub fn try_connection(&self, conn_id: &str) -> Option<Arc<dyn StreamConnection>> {
        self.contexts
            .get(conn_id)?
            .conn
            .as_ref()
            .map(|handle| handle.conn.clone())
    }

    /// The live transport; an error when queried before any connect attempt
    pub fn connection(&self, conn_id: &str) -> Result<Arc<dyn StreamConnection>, ExchangeError> {
        self.try_connection(conn_id).ok_or_else(|| {
            ExchangeError::NotSupported(format!(
                "websocket <{conn_id}> not found in this exchange: {}",
                self.exchange_id
            ))
        })
    }

    /// The connection handle; an error before any connect attempt
    pub fn handle(&self, conn_id: &str) -> Result<&ConnectionHandle, ExchangeError> {
        self.contexts
            .get(conn_id)
            .and_then(|context| context.conn.as_ref())
            .ok_or_else(|| {
                ExchangeError::NotSupported(format!(
                    "websocket <{conn_id}> not found in this exchange: {}",
                    self.exchange_id
                ))
            })
    }

    /// Install a freshly created transport, resetting ready/auth
    pub fn set_connection(&mut self, conn_id: &str, conn: Arc<dyn StreamConnection>) {
        if let Some(context) = self.contexts.get_mut(conn_id) {
            context.conn = Some(ConnectionHandle::new(conn));
        }
    }

    /// Ready flag of the connection; false before any connect attempt
    #[must_use]
    pub fn is_ready(&self, conn_id: &str) -> bool {
        self.contexts
            .get(conn_id)
            .and_then(|context| context.conn.as_ref())
            .is_some_and(ConnectionHandle::is_ready)
    }

    /// Set the ready flag, waking waiters
    pub fn set_ready(&self, conn_id: &str, ready: bool) {
        if let Some(handle) = self.contexts.get(conn_id).and_then(|c| c.conn.as_ref()) {
            handle.set_ready(ready);
        }
    }

    /// Auth flag of the connection; false before any connect attempt
    #[must_use]
    pub fn is_auth(&self, conn_id: &str) -> bool {
        self.contexts
            .get(conn_id)
            .and_then(|context| context.conn.as_ref())
            .is_some_and(|handle| handle.auth)
    }

    /// Set the auth flag
    pub fn set_auth(&mut self, conn_id: &str, auth: bool) {
        if let Some(handle) = self
            .contexts
            .get_mut(conn_id)
            .and_then(|context| context.conn.as_mut())
        {
            handle.auth = auth;
        }
    }

    /// Store free-form per-connection scratch state
    pub fn scratch_set(&mut self, conn_id: &str, key: impl Into<String>, value: Value) {
        if let Some(context) = self.contexts.get_mut(conn_id) {
            context.scratch.insert(key.into(), value);
        }
    }

    /// Read free-form per-connection scratch state
    #[must_use]
    pub fn scratch_get(&self, conn_id: &str, key: &str) -> Option<&Value> {
        self.contexts.get(conn_id)?.scratch.get(key)
    }

    /// Make sure a subscription slot exists, returning it
    pub fn ensure_symbol(
        &mut self,
        conn_id: &str,
        event: EventKind,
        symbol: &Symbol,
    ) -> Option<&mut SubscriptionState> {
        let context = self.contexts.get_mut(conn_id)?;
        Some(
            context
                .events
                .entry(event)
                .or_default()
                .entry(symbol.clone())
                .or_default(),
        )
    }

    /// Clear one subscription slot back to its initial state
    pub fn reset_symbol(&mut self, conn_id: &str, event: EventKind, symbol: &Symbol) {
        if let Some(state) = self.state_mut(conn_id, event, symbol) {
            state.reset();
        }
    }

    /// Subscription state, if the slot exists
    #[must_use]
    pub fn state(&self, conn_id: &str, event: EventKind, symbol: &Symbol) -> Option<&SubscriptionState> {
        self.contexts.get(conn_id)?.events.get(&event)?.get(symbol)
    }

    /// Mutable subscription state, if the slot exists
    pub fn state_mut(
        &mut self,
        conn_id: &str,
        event: EventKind,
        symbol: &Symbol,
    ) -> Option<&mut SubscriptionState> {
        self.contexts
            .get_mut(conn_id)?
            .events
            .get_mut(&event)?
            .get_mut(symbol)
    }

    /// Whether the subscription is confirmed
    #[must_use]
    pub fn is_subscribed(&self, conn_id: &str, event: EventKind, symbol: &Symbol) -> bool {
        self.state(conn_id, event, symbol)
            .is_some_and(|state| state.subscribed)
    }

    /// Whether a confirmation is outstanding
    #[must_use]
    pub fn is_subscribing(&self, conn_id: &str, event: EventKind, symbol: &Symbol) -> bool {
        self.state(conn_id, event, symbol)
            .is_some_and(|state| state.subscribing)
    }

    /// Record a confirmed (or dropped) subscription. Setting `subscribed`
    /// always clears the transitional flag.
    pub fn set_subscribed(
        &mut self,
        conn_id: &str,
        event: EventKind,
        symbol: &Symbol,
        subscribed: bool,
        params: Value,
    ) {
        if let Some(state) = self.ensure_symbol(conn_id, event, symbol) {
            state.subscribed = subscribed;
            state.subscribing = false;
            if subscribed {
                state.params = params;
            }
        }
    }

    /// Record a subscription attempt in flight. A transitional
    /// subscription is by definition not yet subscribed.
    pub fn set_subscribing(&mut self, conn_id: &str, event: EventKind, symbol: &Symbol, subscribing: bool) {
        if let Some(state) = self.ensure_symbol(conn_id, event, symbol) {
            state.subscribing = subscribing;
            if subscribing {
                state.subscribed = false;
            }
        }
    }

    /// Everything subscribed or subscribing on the connection, with the
    /// parameters each subscription was requested with
    #[must_use]
    pub fn subscribed_event_symbols(&self, conn_id: &str) -> Vec<SubscribedEntry> {
        let Some(context) = self.contexts.get(conn_id) else {
            return Vec::new();
        };
        let mut entries = Vec::new();
        for (event, symbols) in &context.events {
            for (symbol, state) in symbols {
                if state.subscribed || state.subscribing {
                    entries.push(SubscribedEntry {
                        event: *event,
                        symbol: symbol.clone(),
                        params: state.params.clone(),
                    });
                }
            }
        }
        entries.sort_by(|a, b| (a.event.as_str(), &a.symbol).cmp(&(b.event.as_str(), &b.symbol)));
        entries
    }
}
