//! Client configuration assembly.
//!
//! An adapter supplies an [`ExchangeDescriptor`] — a static declaration of
//! who the exchange is, how it throttles, which streaming events exist and
//! which connection templates back them. [`ClientConfig::assemble`] merges
//! that declaration over built-in defaults into one immutable configuration
//! struct; nothing mutates the merged result after construction.

use crate::error::ErrorKind;
use crate::types::EventKind;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Default REST timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Default bound on buffered out-of-order order book deltas
pub const DEFAULT_DELTA_CACHE_LIMIT: usize = 10;

/// Wire protocol of a streaming connection template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WireProtocol {
    /// Plain websocket, one physical socket per event/symbol
    Ws,
    /// Shared websocket whose URL encodes the full subscribed set
    WsShared,
    /// Pusher-style pub/sub with a connection-established handshake
    Pusher,
    /// Socket.io-style transport with frame-type prefixes and a room join
    SocketIo,
    /// SignalR-style transport, carried over a plain websocket
    SignalR,
}

impl WireProtocol {
    /// Canonical short name as used in exchange declarations
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ws => "ws",
            Self::WsShared => "ws-s",
            Self::Pusher => "pusher",
            Self::SocketIo => "ws-io",
            Self::SignalR => "signalr",
        }
    }

    /// Whether every subscription shares one physical socket whose URL
    /// must be regenerated whenever the subscribed set changes
    #[must_use]
    pub const fn is_shared_stream(&self) -> bool {
        matches!(self, Self::WsShared)
    }
}

/// Template for one kind of physical streaming connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionTemplate {
    /// Wire protocol spoken on the socket
    pub protocol: WireProtocol,
    /// Base URL; event routes may extend it via their url template
    pub base_url: String,
    /// Adapter event that must fire before the connection counts as ready
    /// (an authentication or bootstrap dance on top of the protocol open)
    pub wait_for_event: Option<String>,
    /// Settle delay after the protocol-level open, in milliseconds
    pub wait_after_connect_ms: Option<u64>,
    /// Depth deltas add to resting amounts instead of replacing them
    pub additive_depth: bool,
}

impl ConnectionTemplate {
    /// Plain template for `protocol` at `base_url`
    #[must_use]
    pub fn new(protocol: WireProtocol, base_url: impl Into<String>) -> Self {
        Self {
            protocol,
            base_url: base_url.into(),
            wait_for_event: None,
            wait_after_connect_ms: None,
            additive_depth: false,
        }
    }

    /// Mark depth deltas as additive
    #[must_use]
    pub const fn additive(mut self) -> Self {
        self.additive_depth = true;
        self
    }
}

/// Routing of one logical event onto a connection template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRoute {
    /// Name of the backing [`ConnectionTemplate`]
    pub template: String,
    /// Template for the logical connection id; understands `{event}`,
    /// `{symbol}` and `{id}` placeholders
    pub conn_id_template: String,
    /// Optional URL template; understands the same placeholders plus
    /// `{baseurl}`
    pub url_template: Option<String>,
}

impl EventRoute {
    /// Route an event to `template`, one connection per template
    #[must_use]
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            conn_id_template: "{id}".to_string(),
            url_template: None,
        }
    }

    /// Override the connection id template
    #[must_use]
    pub fn with_conn_id(mut self, template: impl Into<String>) -> Self {
        self.conn_id_template = template.into();
        self
    }

    /// Override the URL template
    #[must_use]
    pub fn with_url(mut self, template: impl Into<String>) -> Self {
        self.url_template = Some(template.into());
        self
    }
}

/// Token bucket parameters for the REST rate governor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketConfig {
    /// Tokens accrued per elapsed millisecond
    pub refill_rate: f64,
    /// Steady-state clamp on accrued tokens
    pub capacity: f64,
    /// Sleep between retries while waiting for tokens, in milliseconds
    pub delay_ms: u64,
    /// Cost charged when the caller does not specify one
    pub default_cost: f64,
    /// Hard upper bound on the token count
    pub max_capacity: f64,
}

impl TokenBucketConfig {
    /// Derive bucket parameters from a declared request interval
    #[must_use]
    pub fn from_rate_limit_ms(rate_limit_ms: u64) -> Self {
        Self {
            refill_rate: 1.0 / rate_limit_ms.max(1) as f64,
            capacity: 1.0,
            delay_ms: 1,
            default_cost: 1.0,
            max_capacity: 1000.0,
        }
    }
}

/// API credentials for private endpoints
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: Option<String>,
    pub secret: Option<String>,
    pub uid: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
}

/// Which credential fields an exchange insists on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredCredentials {
    pub api_key: bool,
    pub secret: bool,
    pub uid: bool,
    pub password: bool,
    pub token: bool,
}

impl Default for RequiredCredentials {
    fn default() -> Self {
        Self {
            api_key: true,
            secret: true,
            uid: false,
            password: false,
            token: false,
        }
    }
}

/// Static declaration an exchange adapter supplies at construction
#[derive(Debug, Clone)]
pub struct ExchangeDescriptor {
    /// Exchange identifier, e.g. `"poloniex"`
    pub id: String,
    /// Base URL of the REST API
    pub api_url: String,
    /// Declared minimum interval between REST requests, in milliseconds
    pub rate_limit_ms: u64,
    /// Full token bucket override; derived from `rate_limit_ms` when absent
    pub token_bucket: Option<TokenBucketConfig>,
    /// HTTP status classification overrides, merged over the defaults
    pub http_status_errors: FxHashMap<u16, ErrorKind>,
    /// Declared streaming events and their routing
    pub events: FxHashMap<EventKind, EventRoute>,
    /// Connection templates by name
    pub connection_templates: FxHashMap<String, ConnectionTemplate>,
    /// User agent sent on REST requests
    pub user_agent: Option<String>,
    /// Extra headers sent on every REST request
    pub custom_headers: Vec<(String, String)>,
    /// Credential fields private calls require
    pub required_credentials: RequiredCredentials,
    /// Exact-string body match table for business errors
    pub exact_errors: FxHashMap<String, ErrorKind>,
    /// Substring body match table for business errors
    pub broad_errors: FxHashMap<String, ErrorKind>,
}

impl ExchangeDescriptor {
    /// Minimal descriptor for `id` with the given REST rate limit
    #[must_use]
    pub fn new(id: impl Into<String>, rate_limit_ms: u64) -> Self {
        Self {
            id: id.into(),
            api_url: String::new(),
            rate_limit_ms,
            token_bucket: None,
            http_status_errors: FxHashMap::default(),
            events: FxHashMap::default(),
            connection_templates: FxHashMap::default(),
            user_agent: None,
            custom_headers: Vec::new(),
            required_credentials: RequiredCredentials::default(),
            exact_errors: FxHashMap::default(),
            broad_errors: FxHashMap::default(),
        }
    }

    /// Set the REST API base URL
    #[must_use]
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    /// Declare a streaming event
    #[must_use]
    pub fn with_event(mut self, event: EventKind, route: EventRoute) -> Self {
        self.events.insert(event, route);
        self
    }

    /// Declare a connection template
    #[must_use]
    pub fn with_template(mut self, name: impl Into<String>, template: ConnectionTemplate) -> Self {
        self.connection_templates.insert(name.into(), template);
        self
    }
}

/// Per-client knobs independent of the exchange declaration
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Wall-clock timeout for REST calls and subscription confirmations
    pub timeout_ms: u64,
    /// Log raw wire traffic at debug level
    pub verbose: bool,
    /// Keep the last REST response around for diagnostics
    pub capture_last_response: bool,
    /// Bound on buffered out-of-order order book deltas
    pub delta_cache_limit: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            verbose: false,
            capture_last_response: false,
            delta_cache_limit: DEFAULT_DELTA_CACHE_LIMIT,
        }
    }
}

/// Immutable merged configuration of one client instance
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub id: String,
    pub api_url: String,
    pub timeout_ms: u64,
    pub verbose: bool,
    pub capture_last_response: bool,
    pub delta_cache_limit: usize,
    pub token_bucket: TokenBucketConfig,
    pub http_status_errors: FxHashMap<u16, ErrorKind>,
    pub events: FxHashMap<EventKind, EventRoute>,
    pub connection_templates: FxHashMap<String, ConnectionTemplate>,
    pub user_agent: Option<String>,
    pub custom_headers: Vec<(String, String)>,
    pub required_credentials: RequiredCredentials,
    pub exact_errors: FxHashMap<String, ErrorKind>,
    pub broad_errors: FxHashMap<String, ErrorKind>,
}

impl ClientConfig {
    /// Merge `descriptor` over the built-in defaults
    #[must_use]
    pub fn assemble(descriptor: ExchangeDescriptor, options: ClientOptions) -> Self {
        let mut http_status_errors = default_status_errors();
        http_status_errors.extend(descriptor.http_status_errors);

        let token_bucket = descriptor
            .token_bucket
            .unwrap_or_else(|| TokenBucketConfig::from_rate_limit_ms(descriptor.rate_limit_ms));

        Self {
            id: descriptor.id,
            api_url: descriptor.api_url,
            timeout_ms: options.timeout_ms,
            verbose: options.verbose,
            capture_last_response: options.capture_last_response,
            delta_cache_limit: options.delta_cache_limit,
            token_bucket,
            http_status_errors,
            events: descriptor.events,
            connection_templates: descriptor.connection_templates,
            user_agent: descriptor.user_agent,
            custom_headers: descriptor.custom_headers,
            required_credentials: descriptor.required_credentials,
            exact_errors: descriptor.exact_errors,
            broad_errors: descriptor.broad_errors,
        }
    }

    /// Route declared for `event`, if any
    #[must_use]
    pub fn event_route(&self, event: EventKind) -> Option<&EventRoute> {
        self.events.get(&event)
    }

    /// Template registered under `name`, if any
    #[must_use]
    pub fn template(&self, name: &str) -> Option<&ConnectionTemplate> {
        self.connection_templates.get(name)
    }
}

/// Built-in HTTP status classification shared by all exchanges
#[must_use]
pub fn default_status_errors() -> FxHashMap<u16, ErrorKind> {
    let mut table = FxHashMap::default();
    for status in [400, 403, 404, 405, 409, 500, 501, 502, 503, 520, 521, 522, 525, 526, 530] {
        table.insert(status, ErrorKind::ExchangeNotAvailable);
    }
    table.insert(418, ErrorKind::DDoSProtection);
    table.insert(429, ErrorKind::DDoSProtection);
    table.insert(408, ErrorKind::RequestTimeout);
    table.insert(504, ErrorKind::RequestTimeout);
    table.insert(401, ErrorKind::Authentication);
    table.insert(511, ErrorKind::Authentication);
    table.insert(422, ErrorKind::Exchange);
    table
}

/// Substitute `{placeholder}` occurrences in a template string
#[must_use]
pub fn fill_template(template: &str, params: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in params {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}
