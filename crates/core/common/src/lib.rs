//! Shared vocabulary of the exchange client runtime.
//!
//! Everything the other crates agree on lives here: trading symbols and
//! market-data primitives, the library-wide error taxonomy, and the
//! immutable client configuration assembled from an exchange descriptor.

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    ClientConfig, ClientOptions, ConnectionTemplate, Credentials, EventRoute, ExchangeDescriptor,
    RequiredCredentials, TokenBucketConfig, WireProtocol,
};
pub use error::{ErrorKind, ExchangeError};
pub use types::{BookLevel, EventKind, OrderStatus, OrderUpdate, Side, Symbol, Trade, TradeSide};
