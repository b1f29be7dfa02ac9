//! HTTP dispatch with uniform error classification.
//!
//! One keep-alive [`reqwest::Client`] per exchange client. Every response
//! is classified the same way regardless of exchange: a status-code table
//! merged from defaults and adapter overrides, plus keyword scans of the
//! body that recognize maintenance screens and anti-DDoS interstitials
//! even when the status table is ambiguous.

use common::{ClientConfig, ErrorKind, ExchangeError};
use regex::Regex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;
use tracing::debug;

pub use reqwest::Method;

static MAINTENANCE_PATTERN: OnceLock<Regex> = OnceLock::new();
static DDOS_PATTERN: OnceLock<Regex> = OnceLock::new();

fn maintenance_pattern() -> &'static Regex {
    MAINTENANCE_PATTERN.get_or_init(|| {
        Regex::new(r"(?i)offline|busy|retry|wait|unavailable|maintain|maintenance|maintenancing")
            .expect("static regex")
    })
}

fn ddos_pattern() -> &'static Regex {
    DDOS_PATTERN.get_or_init(|| {
        Regex::new(r"(?i)cloudflare|incapsula|overload|ddos").expect("static regex")
    })
}

const NOT_AVAILABLE_HINT: &str = "(possible reasons: invalid API keys, bad or old nonce, \
     exchange is down or offline, on maintenance, DDoS protection, rate-limiting)";

/// An explicit REST request description.
///
/// Replaces per-endpoint generated methods: callers name the namespace,
/// HTTP method and path template, and the transport does the rest.
#[derive(Debug, Clone)]
pub struct RestRequest {
    /// API namespace, e.g. `"public"` or `"private"`; adapters use it to
    /// decide signing
    pub namespace: String,
    /// HTTP method
    pub method: Method,
    /// Path template; `{param}` placeholders are substituted from `params`
    pub path: String,
    /// Request parameters; placeholder leftovers become the query string
    /// (GET) or the JSON body (other methods)
    pub params: serde_json::Map<String, Value>,
    /// Extra headers for this request only
    pub headers: Vec<(String, String)>,
    /// Explicit body; set by signing hooks, overrides param-derived bodies
    pub body: Option<String>,
}

impl RestRequest {
    /// Describe a request against `path` in `namespace`
    #[must_use]
    pub fn new(namespace: impl Into<String>, method: Method, path: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            method,
            path: path.into(),
            params: serde_json::Map::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Add one request parameter
    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Add one request header
    #[must_use]
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Set an explicit body
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Resolve the full URL and body against `base_url`.
    ///
    /// Path placeholders consume their parameters; whatever remains goes
    /// into the query string for GET requests and into a JSON body
    /// otherwise (unless an explicit body was set).
    #[must_use]
    pub fn build(&self, base_url: &str) -> (String, Option<String>) {
        let mut path = self.path.clone();
        let mut leftovers = serde_json::Map::new();
        for (key, value) in &self.params {
            let placeholder = format!("{{{key}}}");
            if path.contains(&placeholder) {
                path = path.replace(&placeholder, &value_as_plain_string(value));
            } else {
                leftovers.insert(key.clone(), value.clone());
            }
        }

        let mut url = format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'));
        let mut body = self.body.clone();

        if !leftovers.is_empty() {
            if self.method == Method::GET {
                let query: String = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(
                        leftovers
                            .iter()
                            .map(|(k, v)| (k.clone(), value_as_plain_string(v))),
                    )
                    .finish();
                url = format!("{url}?{query}");
            } else if body.is_none() {
                body = Some(Value::Object(leftovers).to_string());
            }
        }

        (url, body)
    }
}

fn value_as_plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A fully received HTTP response
#[derive(Debug, Clone)]
pub struct RestResponse {
    /// Numeric status code
    pub status: u16,
    /// Reason phrase, empty when unknown
    pub reason: String,
    /// Response headers in arrival order
    pub headers: Vec<(String, String)>,
    /// Raw body text
    pub body: String,
    /// Body parsed as JSON; `None` on parse failure, which is not an error
    pub json: Option<Value>,
}

#[derive(Debug, Default)]
struct Diagnostics {
    last_http_response: Option<String>,
    last_json_response: Option<Value>,
    last_response_headers: Option<Vec<(String, String)>>,
}

/// Keep-alive HTTP transport with uniform response classification
#[derive(Debug)]
pub struct RestTransport {
    id: String,
    timeout: Duration,
    client: reqwest::Client,
    status_errors: FxHashMap<u16, ErrorKind>,
    capture: bool,
    diagnostics: Mutex<Diagnostics>,
}

impl RestTransport {
    /// Build the transport from the merged client configuration
    pub fn new(config: &ClientConfig) -> Result<Self, ExchangeError> {
        let mut builder = reqwest::Client::builder();
        if let Some(agent) = &config.user_agent {
            builder = builder.user_agent(agent.clone());
        }
        if !config.custom_headers.is_empty() {
            let mut headers = reqwest::header::HeaderMap::new();
            for (key, value) in &config.custom_headers {
                let name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
                    .map_err(|e| ExchangeError::Network(format!("bad header name {key}: {e}")))?;
                let value = reqwest::header::HeaderValue::from_str(value)
                    .map_err(|e| ExchangeError::Network(format!("bad header value for {key}: {e}")))?;
                headers.insert(name, value);
            }
            builder = builder.default_headers(headers);
        }
        let client = builder
            .build()
            .map_err(|e| ExchangeError::Network(format!("failed to build http client: {e}")))?;

        Ok(Self {
            id: config.id.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            client,
            status_errors: config.http_status_errors.clone(),
            capture: config.capture_last_response,
            diagnostics: Mutex::new(Diagnostics::default()),
        })
    }

    /// Issue the call and classify the outcome.
    ///
    /// A hang beyond the configured timeout becomes `RequestTimeout`; a
    /// transport-level failure becomes `ExchangeNotAvailable`; non-2xx
    /// statuses are mapped through the status table and body keyword
    /// scans. A non-2xx response with no table entry and no keyword hit
    /// is returned to the caller, who may apply exchange-specific
    /// `handle_errors` logic.
    pub async fn execute(
        &self,
        method: Method,
        url: &str,
        headers: &[(String, String)],
        body: Option<String>,
    ) -> Result<RestResponse, ExchangeError> {
        debug!(id = %self.id, %method, url, "rest request");
        let mut request = self.client.request(method.clone(), url);
        for (key, value) in headers {
            request = request.header(key, value);
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        let exchange = async {
            let response = request.send().await.map_err(|e| {
                ExchangeError::ExchangeNotAvailable(format!("{} {} {} {}", self.id, method, url, e))
            })?;
            let status = response.status();
            let reason = status.canonical_reason().unwrap_or_default().to_string();
            let response_headers: Vec<(String, String)> = response
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.to_string(),
                        value.to_str().unwrap_or_default().to_string(),
                    )
                })
                .collect();
            let body = response.text().await.map_err(|e| {
                ExchangeError::Network(format!("{} {} {} {}", self.id, method, url, e))
            })?;
            let json = serde_json::from_str::<Value>(&body).ok();
            Ok::<RestResponse, ExchangeError>(RestResponse {
                status: status.as_u16(),
                reason,
                headers: response_headers,
                body,
                json,
            })
        };

        let response = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                ExchangeError::RequestTimeout(format!(
                    "{} {} {} request timed out ({} ms)",
                    self.id,
                    method,
                    url,
                    self.timeout.as_millis()
                ))
            })??;

        if self.capture {
            let mut diagnostics = self.diagnostics.lock().unwrap_or_else(|e| e.into_inner());
            diagnostics.last_http_response = Some(response.body.clone());
            diagnostics.last_json_response = response.json.clone();
            diagnostics.last_response_headers = Some(response.headers.clone());
        }

        if let Some(error) = classify(
            &self.id,
            method.as_str(),
            url,
            &self.status_errors,
            &response,
        ) {
            return Err(error);
        }
        Ok(response)
    }

    /// Raw body of the last captured response
    #[must_use]
    pub fn last_http_response(&self) -> Option<String> {
        let diagnostics = self.diagnostics.lock().unwrap_or_else(|e| e.into_inner());
        diagnostics.last_http_response.clone()
    }

    /// Parsed JSON of the last captured response
    #[must_use]
    pub fn last_json_response(&self) -> Option<Value> {
        let diagnostics = self.diagnostics.lock().unwrap_or_else(|e| e.into_inner());
        diagnostics.last_json_response.clone()
    }

    /// Headers of the last captured response
    #[must_use]
    pub fn last_response_headers(&self) -> Option<Vec<(String, String)>> {
        let diagnostics = self.diagnostics.lock().unwrap_or_else(|e| e.into_inner());
        diagnostics.last_response_headers.clone()
    }
}

/// Classify a non-2xx response into the error taxonomy.
///
/// The status table decides first; when the body never parsed as JSON, a
/// maintenance or DDoS keyword hit overrides the table, because those
/// screens arrive with all kinds of statuses.
fn classify(
    id: &str,
    method: &str,
    url: &str,
    status_errors: &FxHashMap<u16, ErrorKind>,
    response: &RestResponse,
) -> Option<ExchangeError> {
    if (200..300).contains(&response.status) {
        return None;
    }
    let mut kind = status_errors.get(&response.status).copied();
    let mut details = response.body.clone();
    if response.json.is_none() {
        if maintenance_pattern().is_match(&response.body) {
            kind = Some(ErrorKind::ExchangeNotAvailable);
            details.push_str(" offline, on maintenance, or unreachable from this location at the moment");
        }
        if ddos_pattern().is_match(&response.body) {
            kind = Some(ErrorKind::DDoSProtection);
        }
    }
    let kind = kind?;
    if kind == ErrorKind::ExchangeNotAvailable {
        details.push(' ');
        details.push_str(NOT_AVAILABLE_HINT);
    }
    Some(kind.into_error(format!(
        "{} {} {} {} {} {}",
        id, method, url, response.status, response.reason, details
    )))
}
