//! Core market-data types shared across the runtime.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unified trading symbol, e.g. `BTC/USDT`.
///
/// Symbols are plain strings in the unified `BASE/QUOTE` form; translation
/// to exchange-native identifiers is an adapter concern.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Symbol(String);

impl Symbol {
    /// Create a new symbol from any string-like value
    #[must_use]
    pub fn new(symbol: impl Into<String>) -> Self {
        Self(symbol.into())
    }

    /// The unified symbol string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Logical streaming event kinds an exchange adapter can declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Incremental order book maintenance for one symbol
    OrderBook,
    /// Public trade prints for one symbol
    Trade,
    /// The caller's own order lifecycle updates
    Orders,
}

impl EventKind {
    /// Canonical lowercase name used in connection-id templates
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::OrderBook => "orderbook",
            Self::Trade => "trade",
            Self::Orders => "orders",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order book side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    /// Buy side, sorted descending by price
    Bid,
    /// Sell side, sorted ascending by price
    Ask,
}

/// One price level of an order book
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    /// Price of the level
    pub price: f64,
    /// Amount resting at that price
    pub amount: f64,
}

impl BookLevel {
    /// Create a new level
    #[must_use]
    pub const fn new(price: f64, amount: f64) -> Self {
        Self { price, amount }
    }
}

/// Taker side of a public trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    /// Trade initiated by a buy order
    Buy,
    /// Trade initiated by a sell order
    Sell,
}

/// A public trade print
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    /// Exchange-assigned trade id, when provided
    pub id: Option<String>,
    /// Unified symbol the trade happened on
    pub symbol: Symbol,
    /// Execution timestamp in milliseconds since epoch
    pub timestamp: Option<i64>,
    /// Execution price
    pub price: f64,
    /// Executed amount
    pub amount: f64,
    /// Taker side, when the exchange reports it
    pub side: Option<TradeSide>,
}

/// Lifecycle state of an own order as reported by the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Resting on the book
    Open,
    /// Fully filled
    Closed,
    /// Canceled before completion
    Canceled,
}

/// An update to one of the caller's own orders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    /// Exchange-assigned order id
    pub id: String,
    /// Unified symbol
    pub symbol: Symbol,
    /// Update timestamp in milliseconds since epoch
    pub timestamp: Option<i64>,
    /// Current lifecycle state
    pub status: OrderStatus,
    /// Limit price, if any
    pub price: Option<f64>,
    /// Original order amount
    pub amount: Option<f64>,
    /// Amount still unfilled
    pub remaining: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_roundtrip() {
        let symbol = Symbol::from("BTC/USDT");
        assert_eq!(symbol.as_str(), "BTC/USDT");
        assert_eq!(symbol.to_string(), "BTC/USDT");
    }

    #[test]
    fn test_symbol_serde() -> Result<(), Box<dyn std::error::Error>> {
        let symbol = Symbol::from("ETH/BTC");
        let encoded = serde_json::to_string(&symbol)?;
        let decoded: Symbol = serde_json::from_str(&encoded)?;
        assert_eq!(symbol, decoded);
        Ok(())
    }

    #[test]
    fn test_event_kind_names() {
        assert_eq!(EventKind::OrderBook.as_str(), "orderbook");
        assert_eq!(EventKind::Trade.as_str(), "trade");
        assert_eq!(EventKind::Orders.as_str(), "orders");
    }
}
