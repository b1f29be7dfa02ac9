//! Subscription state machine building blocks.
//!
//! Resolving a `(event, symbol)` pair to a logical connection id and
//! deciding what the transport has to do about a subscription change are
//! pure functions of the registry state and the client configuration;
//! they live here so the decision logic stays testable without I/O.

use crate::registry::ConnectionRegistry;
use common::config::fill_template;
use common::{ClientConfig, ConnectionTemplate, EventKind, ExchangeError, Symbol};
use serde_json::Value;

/// One entry of a batched subscribe/unsubscribe request
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribedEntry {
    /// Logical event
    pub event: EventKind,
    /// Symbol the event is scoped to
    pub symbol: Symbol,
    /// Protocol-specific request parameters
    pub params: Value,
}

impl SubscribedEntry {
    /// Entry without extra parameters
    #[must_use]
    pub fn new(event: EventKind, symbol: impl Into<Symbol>) -> Self {
        Self {
            event,
            symbol: symbol.into(),
            params: Value::Null,
        }
    }

    /// Attach request parameters
    #[must_use]
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

/// What the transport has to do for a subscription change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedAction {
    /// Open the connection on first use; an already active transport is
    /// reused without reconnecting
    Connect {
        /// Resolved connection URL
        url: String,
    },
    /// Tear the socket down and reopen it on a regenerated URL that
    /// encodes the full subscribed set
    Reconnect {
        /// Regenerated combined-stream URL
        url: String,
    },
    /// The subscribed set became empty; close the socket
    Disconnect,
}

/// Resolve the logical connection id and template name for an event.
///
/// The event route's id template is substituted with the event, symbol and
/// template name, so exchanges can choose between one shared connection
/// (`{id}`), one per symbol (`{id}-{symbol}`) or one per event and symbol.
pub fn conn_id_for_event(
    config: &ClientConfig,
    event: EventKind,
    symbol: &Symbol,
) -> Result<(String, String), ExchangeError> {
    let route = config.event_route(event).ok_or_else(|| {
        ExchangeError::Exchange(format!(
            "invalid streaming configuration for event {event} in exchange {}",
            config.id
        ))
    })?;
    let conn_id = fill_template(
        &route.conn_id_template,
        &[
            ("event", event.as_str()),
            ("symbol", symbol.as_str()),
            ("id", &route.template),
        ],
    );
    Ok((conn_id, route.template.clone()))
}

/// Resolve the connection URL for an event on its template
#[must_use]
pub fn url_for_event(
    config: &ClientConfig,
    template_name: &str,
    template: &ConnectionTemplate,
    event: EventKind,
    symbol: &Symbol,
) -> String {
    let url_template = config
        .event_route(event)
        .and_then(|route| route.url_template.clone())
        .unwrap_or_else(|| "{baseurl}".to_string());
    fill_template(
        &url_template,
        &[
            ("baseurl", &template.base_url),
            ("event", event.as_str()),
            ("symbol", symbol.as_str()),
            ("id", template_name),
        ],
    )
}

/// Decide the transport action for one subscription change, or `None`
/// when the registry already reflects the desired state.
///
/// For per-event/symbol protocols the answer is always `Connect`; for the
/// shared-stream protocol the caller supplies `regenerate`, which turns
/// the updated subscribed set into the combined URL (the adapter's
/// business), and the answer is a reconnect — or a disconnect when
/// unsubscribing empties the set.
pub fn action_for_event(
    config: &ClientConfig,
    registry: &ConnectionRegistry,
    conn_id: &str,
    event: EventKind,
    symbol: &Symbol,
    want_subscribed: bool,
    regenerate: impl FnOnce(&[SubscribedEntry], &ConnectionTemplate) -> Result<String, ExchangeError>,
) -> Result<Option<PlannedAction>, ExchangeError> {
    let is_subscribed = registry.is_subscribed(conn_id, event, symbol);
    let is_subscribing = registry.is_subscribing(conn_id, event, symbol);
    if want_subscribed && (is_subscribed || is_subscribing) {
        return Ok(None);
    }
    if !want_subscribed && !is_subscribed && !is_subscribing {
        return Ok(None);
    }

    let (_, template_name) = conn_id_for_event(config, event, symbol)?;
    let template = config.template(&template_name).ok_or_else(|| {
        ExchangeError::Exchange(format!(
            "streaming connection template {template_name} does not exist in exchange {}",
            config.id
        ))
    })?;

    if !template.protocol.is_shared_stream() {
        let url = url_for_event(config, &template_name, template, event, symbol);
        return Ok(Some(PlannedAction::Connect { url }));
    }

    let mut subscribed = registry.subscribed_event_symbols(conn_id);
    if want_subscribed {
        subscribed.push(SubscribedEntry::new(event, symbol.clone()));
    } else {
        subscribed.retain(|entry| !(entry.event == event && entry.symbol == *symbol));
        if subscribed.is_empty() {
            return Ok(Some(PlannedAction::Disconnect));
        }
    }
    let url = regenerate(&subscribed, template)?;
    Ok(Some(PlannedAction::Reconnect { url }))
}
