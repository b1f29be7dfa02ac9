//! Transport layer: REST dispatch behind a token-bucket rate governor, and
//! the physical streaming connection shims.
//!
//! Nothing here knows about subscriptions or order books; the REST side
//! classifies responses into the shared error taxonomy and the streaming
//! side moves frames and lifecycle signals, leaving all demultiplexing to
//! the exchange adapter.

pub mod rest;
pub mod stream;
pub mod throttle;

pub use rest::{RestRequest, RestResponse, RestTransport};
pub use stream::{
    ConnectionFactory, ConnectionSignal, DefaultConnectionFactory, SignalKind, StreamConnection,
};
pub use throttle::Throttle;
