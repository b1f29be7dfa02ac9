//! Streaming connection shims.
//!
//! Three interchangeable physical-protocol implementations of one
//! capability: a plain websocket, a pusher-style pub/sub link with a
//! server handshake and activity-timeout heartbeating, and a
//! socket.io-style link with frame-type prefixes and negotiated pings.
//!
//! A shim moves frames and lifecycle signals only; it never interprets
//! application payloads. Signals are pushed into an unbounded channel so
//! the read loops never block on a slow consumer.

pub mod pusher;
pub mod socketio;
pub mod ws;

use common::{ConnectionTemplate, ExchangeError, WireProtocol};
use futures_util::SinkExt;
use futures_util::stream::{SplitSink, SplitStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type WsSink = SplitSink<WsStream, Message>;
pub(crate) type WsSource = SplitStream<WsStream>;

/// Lifecycle signal kinds a connection can emit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalKind {
    /// The link is open (handshake included, where the protocol has one)
    Open,
    /// One application message, unwrapped from any protocol framing
    Message(String),
    /// A protocol-level pong
    Pong(String),
    /// The link closed
    Close,
    /// A transport or protocol error
    Error(String),
}

/// One lifecycle signal, tagged with the logical connection id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSignal {
    /// Logical connection id the signal belongs to
    pub conn_id: String,
    /// What happened
    pub kind: SignalKind,
}

/// Common capability of all physical streaming connections
#[async_trait::async_trait]
pub trait StreamConnection: Send + Sync {
    /// Open the link; resolves once the protocol considers it open.
    /// A no-op when the link is already active.
    async fn connect(&self) -> Result<(), ExchangeError>;

    /// Close the link. Idempotent; suppresses further signal emission.
    fn close(&self);

    /// Send one application payload, wrapped in protocol framing as needed
    fn send(&self, payload: &str) -> Result<(), ExchangeError>;

    /// Whether the link is currently usable
    fn is_active(&self) -> bool;
}

/// Builds physical connections for the subscription state machine.
///
/// The default factory maps the template's wire protocol onto the shims in
/// this module; tests substitute in-memory connections.
pub trait ConnectionFactory: Send + Sync {
    /// Create a connection for `conn_id` at the resolved `url`
    fn create(
        &self,
        conn_id: &str,
        url: &str,
        template: &ConnectionTemplate,
        signals: mpsc::UnboundedSender<ConnectionSignal>,
    ) -> Arc<dyn StreamConnection>;
}

/// Protocol-to-shim mapping used outside of tests
#[derive(Debug, Default)]
pub struct DefaultConnectionFactory;

impl ConnectionFactory for DefaultConnectionFactory {
    fn create(
        &self,
        conn_id: &str,
        url: &str,
        template: &ConnectionTemplate,
        signals: mpsc::UnboundedSender<ConnectionSignal>,
    ) -> Arc<dyn StreamConnection> {
        match template.protocol {
            WireProtocol::Ws | WireProtocol::WsShared | WireProtocol::SignalR => Arc::new(
                ws::WsConnection::new(conn_id, url, template.wait_after_connect_ms, signals),
            ),
            WireProtocol::Pusher => Arc::new(pusher::PusherConnection::new(
                conn_id,
                url,
                template.wait_after_connect_ms,
                signals,
            )),
            WireProtocol::SocketIo => Arc::new(socketio::SocketIoConnection::new(
                conn_id,
                url,
                template.wait_after_connect_ms,
                signals,
            )),
        }
    }
}

/// Shared link state of one physical connection.
///
/// Owns the writer handle and the closing/active latches. The closing
/// latch mirrors the shims' contract: once `close` is called, nothing is
/// emitted anymore and in-flight reads wind down silently.
pub(crate) struct Link {
    conn_id: String,
    signals: mpsc::UnboundedSender<ConnectionSignal>,
    writer: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    closing: AtomicBool,
    active: AtomicBool,
}

impl Link {
    pub(crate) fn new(conn_id: &str, signals: mpsc::UnboundedSender<ConnectionSignal>) -> Self {
        Self {
            conn_id: conn_id.to_string(),
            signals,
            writer: Mutex::new(None),
            closing: AtomicBool::new(false),
            active: AtomicBool::new(false),
        }
    }

    pub(crate) fn conn_id(&self) -> &str {
        &self.conn_id
    }

    /// Arm the link for a fresh connect attempt
    pub(crate) fn open_with(&self, writer: mpsc::UnboundedSender<Message>) {
        *self.writer.lock().unwrap_or_else(|e| e.into_inner()) = Some(writer);
        self.closing.store(false, Ordering::SeqCst);
        self.active.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn set_inactive(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Queue one frame for the writer task; false when not connected
    pub(crate) fn write(&self, frame: Message) -> bool {
        let writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        match writer.as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    pub(crate) fn emit(&self, kind: SignalKind) {
        let _ = self.signals.send(ConnectionSignal {
            conn_id: self.conn_id.clone(),
            kind,
        });
    }

    pub(crate) fn emit_unless_closing(&self, kind: SignalKind) {
        if !self.is_closing() {
            self.emit(kind);
        }
    }

    /// Idempotent close: latch, push a close frame, drop the writer
    pub(crate) fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = writer.take() {
            let _ = tx.send(Message::Close(None));
        }
        self.active.store(false, Ordering::SeqCst);
        debug!(conn_id = %self.conn_id, "connection closed locally");
    }
}

/// Drain queued frames into the websocket sink until the channel closes
pub(crate) fn spawn_writer(mut sink: WsSink, mut frames: mpsc::UnboundedReceiver<Message>) {
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let closing = matches!(frame, Message::Close(_));
            if sink.send(frame).await.is_err() {
                break;
            }
            if closing {
                break;
            }
        }
        let _ = sink.close().await;
    });
}
