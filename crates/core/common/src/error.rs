//! Library-wide error taxonomy.
//!
//! Every fallible operation in the runtime returns [`ExchangeError`]. The
//! variants split into local policy errors (`RequestTimeout`, `NotSupported`),
//! transport failures (`Network`, `ExchangeNotAvailable`, `DDoSProtection`)
//! and exchange business errors mapped from response bodies by adapters
//! (`InvalidNonce`, `OrderNotFound`, ...).

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Unified error type for the whole client runtime
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExchangeError {
    /// Bad or missing credentials
    #[error("authentication error: {0}")]
    Authentication(String),

    /// Malformed funding address
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Symbol unknown to the exchange or the adapter
    #[error("bad symbol: {0}")]
    BadSymbol(String),

    /// Generic or unclassified exchange error
    #[error("exchange error: {0}")]
    Exchange(String),

    /// Capability not implemented by an adapter or the core
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Rate limiting or anti-DDoS screen, transient
    #[error("ddos protection: {0}")]
    DDoSProtection(String),

    /// Exchange unreachable or in maintenance, transient
    #[error("exchange not available: {0}")]
    ExchangeNotAvailable(String),

    /// Locally configured timeout fired
    #[error("request timeout: {0}")]
    RequestTimeout(String),

    /// Transport-level failure (DNS, refused connection, broken socket)
    #[error("network error: {0}")]
    Network(String),

    /// Exchange rejected the request nonce
    #[error("invalid nonce: {0}")]
    InvalidNonce(String),

    /// Referenced order does not exist
    #[error("order not found: {0}")]
    OrderNotFound(String),

    /// Balance too small for the requested operation
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    /// Cancellation already in flight for the order
    #[error("cancel pending: {0}")]
    CancelPending(String),
}

impl ExchangeError {
    /// The payload-free kind of this error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Authentication(_) => ErrorKind::Authentication,
            Self::InvalidAddress(_) => ErrorKind::InvalidAddress,
            Self::BadSymbol(_) => ErrorKind::BadSymbol,
            Self::Exchange(_) => ErrorKind::Exchange,
            Self::NotSupported(_) => ErrorKind::NotSupported,
            Self::DDoSProtection(_) => ErrorKind::DDoSProtection,
            Self::ExchangeNotAvailable(_) => ErrorKind::ExchangeNotAvailable,
            Self::RequestTimeout(_) => ErrorKind::RequestTimeout,
            Self::Network(_) => ErrorKind::Network,
            Self::InvalidNonce(_) => ErrorKind::InvalidNonce,
            Self::OrderNotFound(_) => ErrorKind::OrderNotFound,
            Self::InsufficientFunds(_) => ErrorKind::InsufficientFunds,
            Self::CancelPending(_) => ErrorKind::CancelPending,
        }
    }

    /// Whether retrying the same call later is reasonable
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::DDoSProtection(_)
                | Self::ExchangeNotAvailable(_)
                | Self::RequestTimeout(_)
                | Self::Network(_)
        )
    }
}

/// Error kind without a message payload.
///
/// Used in classification tables (HTTP status code tables, exact and
/// substring body-match tables) where the message is only known at match
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Authentication,
    InvalidAddress,
    BadSymbol,
    Exchange,
    NotSupported,
    DDoSProtection,
    ExchangeNotAvailable,
    RequestTimeout,
    Network,
    InvalidNonce,
    OrderNotFound,
    InsufficientFunds,
    CancelPending,
}

impl ErrorKind {
    /// Build the matching [`ExchangeError`] carrying `message`
    #[must_use]
    pub fn into_error(self, message: impl Into<String>) -> ExchangeError {
        let message = message.into();
        match self {
            Self::Authentication => ExchangeError::Authentication(message),
            Self::InvalidAddress => ExchangeError::InvalidAddress(message),
            Self::BadSymbol => ExchangeError::BadSymbol(message),
            Self::Exchange => ExchangeError::Exchange(message),
            Self::NotSupported => ExchangeError::NotSupported(message),
            Self::DDoSProtection => ExchangeError::DDoSProtection(message),
            Self::ExchangeNotAvailable => ExchangeError::ExchangeNotAvailable(message),
            Self::RequestTimeout => ExchangeError::RequestTimeout(message),
            Self::Network => ExchangeError::Network(message),
            Self::InvalidNonce => ExchangeError::InvalidNonce(message),
            Self::OrderNotFound => ExchangeError::OrderNotFound(message),
            Self::InsufficientFunds => ExchangeError::InsufficientFunds(message),
            Self::CancelPending => ExchangeError::CancelPending(message),
        }
    }
}

/// Look up `needle` in an exact-match error table
#[must_use]
pub fn exact_match(table: &FxHashMap<String, ErrorKind>, needle: &str) -> Option<ErrorKind> {
    table.get(needle).copied()
}

/// Find the first table key contained anywhere in `haystack`
#[must_use]
pub fn broad_match(table: &FxHashMap<String, ErrorKind>, haystack: &str) -> Option<ErrorKind> {
    table
        .iter()
        .find(|(key, _)| haystack.contains(key.as_str()))
        .map(|(_, kind)| *kind)
}
