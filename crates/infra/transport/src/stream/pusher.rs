//! Pusher-style pub/sub shim.
//!
//! The link only counts as open once the server sends its
//! `connection_established` handshake, which also negotiates the activity
//! timeout. After that much inactivity the shim pings on its own and
//! force-closes if the pong misses a shorter grace window. Subscribe and
//! unsubscribe sends are rewritten into pusher envelopes.

use super::{ConnectionSignal, Link, SignalKind, WsSource, spawn_writer};
use common::ExchangeError;
use futures_util::StreamExt;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

const CLIENT_NAME: &str = "unified-light-client";
const CLIENT_VERSION: &str = "1.0";
const PROTOCOL_VERSION: &str = "7";

/// Activity timeout assumed until the handshake negotiates one
const DEFAULT_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);
/// Grace window for the pong answering a self-initiated ping
const PONG_GRACE: Duration = Duration::from_secs(30);

/// Pusher-protocol connection
pub struct PusherConnection {
    url: String,
    wait_after_connect_ms: Option<u64>,
    link: Arc<Link>,
}

impl PusherConnection {
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
impl super::StreamConnection for PusherConnection {
    async fn connect(&self) -> Result<(), ExchangeError> {
        if self.link.is_active() {
            return Ok(());
        }
        let url = format!(
            "{}?client={CLIENT_NAME}&version={CLIENT_VERSION}&protocol={PROTOCOL_VERSION}",
            self.url
        );
        let (socket, _) = connect_async(&url)
            .await
            .map_err(|e| ExchangeError::Network(format!("{url}: {e}")))?;
        let (sink, source) = socket.split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        self.link.open_with(writer_tx.clone());
        spawn_writer(sink, writer_rx);

        let (ready_tx, ready_rx) = oneshot::channel();
        let link = self.link.clone();
        let wait_ms = self.wait_after_connect_ms;
        tokio::spawn(read_loop(source, link, writer_tx, ready_tx, wait_ms));

        ready_rx.await.map_err(|_| {
            ExchangeError::Network(format!(
                "pusher connection {} closed during handshake",
                self.link.conn_id()
            ))
        })
    }

    fn close(&self) {
        self.link.close();
    }

    /// Translate generic subscribe/unsubscribe payloads into pusher
    /// envelopes; anything else has no pusher representation and is
    /// dropped.
    fn send(&self, payload: &str) -> Result<(), ExchangeError> {
        if self.link.is_closing() {
            return Ok(());
        }
        let value: Value = serde_json::from_str(payload).map_err(|e| {
            ExchangeError::Exchange(format!("pusher send expects a json payload: {e}"))
        })?;
        let envelope = match value["event"].as_str() {
            Some("subscribe") => json!({
                "event": "pusher:subscribe",
                "data": { "channel": value["channel"] },
            }),
            Some("unsubscribe") => json!({
                "event": "pusher:unsubscribe",
                "data": { "channel": value["channel"] },
            }),
            _ => {
                debug!(conn_id = %self.link.conn_id(), "dropping non-subscription pusher send");
                return Ok(());
            }
        };
        if self.link.write(Message::Text(envelope.to_string())) {
            Ok(())
        } else {
            Err(ExchangeError::Network(format!(
                "pusher connection {} is not connected",
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
    ready: oneshot::Sender<()>,
    wait_after_connect_ms: Option<u64>,
) {
    let mut ready = Some(ready);
    let mut activity = DEFAULT_ACTIVITY_TIMEOUT;
    let mut awaiting_pong = false;
    let mut deadline = Instant::now() + activity;

    loop {
        tokio::select! {
            frame = source.next() => {
                let Some(frame) = frame else { break };
                if link.is_closing() {
                    break;
                }
                // Any traffic counts as activity.
                awaiting_pong = false;
                match frame {
                    Ok(Message::Text(text)) => {
                        handle_message(
                            &text,
                            &link,
                            &writer,
                            &mut ready,
                            &mut activity,
                            wait_after_connect_ms,
                        )
                        .await;
                    }
                    Ok(Message::Ping(data)) => {
                        let _ = writer.send(Message::Pong(data));
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        link.emit_unless_closing(SignalKind::Error(e.to_string()));
                        break;
                    }
                }
                deadline = Instant::now() + activity;
            }
            () = tokio::time::sleep_until(deadline) => {
                if link.is_closing() {
                    break;
                }
                if awaiting_pong {
                    link.emit_unless_closing(SignalKind::Error(
                        "pusher heartbeat went unanswered".to_string(),
                    ));
                    break;
                }
                debug!(conn_id = %link.conn_id(), "pusher activity timeout, pinging");
                let ping = json!({ "event": "pusher:ping", "data": {} });
                let _ = writer.send(Message::Text(ping.to_string()));
                awaiting_pong = true;
                deadline = Instant::now() + PONG_GRACE;
            }
        }
    }
    link.set_inactive();
    link.emit_unless_closing(SignalKind::Close);
}

async fn handle_message(
    text: &str,
    link: &Arc<Link>,
    writer: &mpsc::UnboundedSender<Message>,
    ready: &mut Option<oneshot::Sender<()>>,
    activity: &mut Duration,
    wait_after_connect_ms: Option<u64>,
) {
    let message: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            link.emit_unless_closing(SignalKind::Error(format!("malformed pusher frame: {e}")));
            return;
        }
    };
    match message["event"].as_str().unwrap_or_default() {
        "pusher:connection_established" => {
            // The handshake data arrives as a stringified json document.
            if let Some(data) = message["data"].as_str() {
                if let Ok(data) = serde_json::from_str::<Value>(data) {
                    if let Some(seconds) = data["activity_timeout"].as_f64() {
                        *activity = Duration::from_secs_f64(seconds);
                    }
                }
            }
            if let Some(ms) = wait_after_connect_ms {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            link.emit(SignalKind::Open);
            if let Some(tx) = ready.take() {
                let _ = tx.send(());
            }
        }
        "pusher:ping" => {
            let pong = json!({ "event": "pusher:pong", "data": {} });
            let _ = writer.send(Message::Text(pong.to_string()));
        }
        "pusher_internal:subscription_succeeded" => {
            let rewritten = json!({
                "event": "subscription_succeeded",
                "channel": message["channel"],
            });
            link.emit_unless_closing(SignalKind::Message(rewritten.to_string()));
        }
        "pusher:error" => {
            let detail = message["data"]["message"]
                .as_str()
                .unwrap_or("unspecified pusher error")
                .to_string();
            link.emit_unless_closing(SignalKind::Error(detail));
        }
        event => {
            let data = message["data"]
                .as_str()
                .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
                .unwrap_or_else(|| message["data"].clone());
            let unwrapped = json!({
                "event": event,
                "channel": message["channel"],
                "data": data,
            });
            link.emit_unless_closing(SignalKind::Message(unwrapped.to_string()));
        }
    }
}
