//! Plain websocket shim.
//!
//! Raw message framing; protocol pings are answered automatically, pongs
//! are surfaced to the owner, and keep-alive beyond that is the caller's
//! business. Also carries the shared-stream (`ws-s`) and signalr template
//! types, which differ only in how their URLs are produced.

use super::{ConnectionSignal, Link, SignalKind, WsSource, spawn_writer};
use common::ExchangeError;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Plain websocket connection
pub struct WsConnection {
    url: String,
    wait_after_connect_ms: Option<u64>,
    link: Arc<Link>,
}

impl WsConnection {
    /// Create an unconnected shim for `url`
    #[must_use]
    pub fn new(
        conn_id: &str,
        url: &str,
        wait_after_connect_ms: Option<u64>,
        signals: mpsc::UnboundedSender<ConnectionSignal>,
    ) -> Self {
        Self {
            url: url.to_string(),
            wait_after_connect_ms,
            link: Arc::new(Link::new(conn_id, signals)),
        }
    }
}

#[async_trait::async_trait]
impl super::StreamConnection for WsConnection {
    async fn connect(&self) -> Result<(), ExchangeError> {
        if self.link.is_active() {
            return Ok(());
        }
        let (socket, _) = connect_async(&self.url)
            .await
            .map_err(|e| ExchangeError::Network(format!("{}: {e}", self.url)))?;
        let (sink, source) = socket.split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        self.link.open_with(writer_tx.clone());
        spawn_writer(sink, writer_rx);

        let link = self.link.clone();
        tokio::spawn(read_loop(source, link, writer_tx));

        if let Some(ms) = self.wait_after_connect_ms {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        self.link.emit(SignalKind::Open);
        Ok(())
    }

    fn close(&self) {
        self.link.close();
    }

    fn send(&self, payload: &str) -> Result<(), ExchangeError> {
        if self.link.is_closing() {
            return Ok(());
        }
        if self.link.write(Message::Text(payload.to_string())) {
            Ok(())
        } else {
            Err(ExchangeError::Network(format!(
                "websocket {} is not connected",
                self.link.conn_id()
            )))
        }
    }

    fn is_active(&self) -> bool {
        self.link.is_active()
    }
}

async fn read_loop(
    mut source: WsSource,
    link: Arc<Link>,
    writer: mpsc::UnboundedSender<Message>,
) {
    while let Some(frame) = source.next().await {
        if link.is_closing() {
            break;
        }
        match frame {
            Ok(Message::Text(text)) => link.emit_unless_closing(SignalKind::Message(text)),
            Ok(Message::Binary(raw)) => match String::from_utf8(raw) {
                Ok(text) => link.emit_unless_closing(SignalKind::Message(text)),
                Err(_) => link.emit_unless_closing(SignalKind::Error(
                    "binary frame was not valid utf-8".to_string(),
                )),
            },
            Ok(Message::Ping(data)) => {
                let _ = writer.send(Message::Pong(data));
            }
            Ok(Message::Pong(data)) => {
                link.emit_unless_closing(SignalKind::Pong(
                    String::from_utf8_lossy(&data).into_owned(),
                ));
            }
            Ok(Message::Close(_)) => {
                debug!(conn_id = %link.conn_id(), "server closed websocket");
                break;
            }
            Ok(Message::Frame(_)) => {}
            Err(e) => {
                link.emit_unless_closing(SignalKind::Error(e.to_string()));
                break;
            }
        }
    }
    link.set_inactive();
    link.emit_unless_closing(SignalKind::Close);
}
