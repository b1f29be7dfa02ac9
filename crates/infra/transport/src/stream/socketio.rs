//! Socket.io-style shim.
//!
//! Frames carry a leading type character: `0` is the engine handshake
//! (negotiating ping interval and timeout), `40` the room-join ack that
//! makes the link usable, `42` an application message, `2`/`3` the
//! ping/pong pair, `1` a server-side disconnect. Application sends are
//! wrapped in the `42` prefix.

use super::{ConnectionSignal, Link, SignalKind, WsSource, spawn_writer};
use common::ExchangeError;
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Ping cadence assumed until the handshake negotiates one
const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(25_000);
/// Pong wait assumed until the handshake negotiates one
const DEFAULT_PING_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Socket.io-protocol connection
pub struct SocketIoConnection {
    url: String,
    wait_after_connect_ms: Option<u64>,
    link: Arc<Link>,
}

impl SocketIoConnection {
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
impl super::StreamConnection for SocketIoConnection {
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

        let (ready_tx, ready_rx) = oneshot::channel();
        let link = self.link.clone();
        let wait_ms = self.wait_after_connect_ms;
        tokio::spawn(read_loop(source, link, writer_tx, ready_tx, wait_ms));

        ready_rx.await.map_err(|_| {
            ExchangeError::Network(format!(
                "socket.io connection {} closed during handshake",
                self.link.conn_id()
            ))
        })
    }

    fn close(&self) {
        self.link.close();
    }

    fn send(&self, payload: &str) -> Result<(), ExchangeError> {
        if self.link.is_closing() {
            return Ok(());
        }
        if self.link.write(Message::Text(format!("42{payload}"))) {
            Ok(())
        } else {
            Err(ExchangeError::Network(format!(
                "socket.io connection {} is not connected",
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
    let mut ping_interval = DEFAULT_PING_INTERVAL;
    let mut ping_timeout = DEFAULT_PING_TIMEOUT;
    let mut next_ping: Option<Instant> = None;
    let mut pong_deadline: Option<Instant> = None;

    loop {
        let wake = match (next_ping, pong_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };
        tokio::select! {
            frame = source.next() => {
                let Some(frame) = frame else { break };
                if link.is_closing() {
                    break;
                }
                match frame {
                    Ok(Message::Text(data)) => {
                        match handle_frame(
                            &data,
                            &link,
                            &mut ready,
                            &mut ping_interval,
                            &mut ping_timeout,
                            &mut next_ping,
                            &mut pong_deadline,
                            wait_after_connect_ms,
                        )
                        .await
                        {
                            FrameOutcome::Continue => {}
                            FrameOutcome::Disconnect => break,
                        }
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
            }
            () = tokio::time::sleep_until(wake.unwrap_or_else(far_future)), if wake.is_some() => {
                if link.is_closing() {
                    break;
                }
                let now = Instant::now();
                if pong_deadline.is_some_and(|deadline| now >= deadline) {
                    link.emit_unless_closing(SignalKind::Error(
                        "pong not received from server".to_string(),
                    ));
                    break;
                }
                if next_ping.is_some_and(|at| now >= at) {
                    debug!(conn_id = %link.conn_id(), "socket.io ping");
                    let _ = writer.send(Message::Text("2".to_string()));
                    pong_deadline = Some(now + ping_timeout);
                    next_ping = Some(now + ping_interval);
                }
            }
        }
    }
    link.set_inactive();
    link.emit_unless_closing(SignalKind::Close);
}

enum FrameOutcome {
    Continue,
    Disconnect,
}

#[allow(clippy::too_many_arguments)]
async fn handle_frame(
    data: &str,
    link: &Arc<Link>,
    ready: &mut Option<oneshot::Sender<()>>,
    ping_interval: &mut Duration,
    ping_timeout: &mut Duration,
    next_ping: &mut Option<Instant>,
    pong_deadline: &mut Option<Instant>,
    wait_after_connect_ms: Option<u64>,
) -> FrameOutcome {
    let mut chars = data.chars();
    match chars.next() {
        // Engine handshake with negotiated ping parameters.
        Some('0') => {
            if let Ok(handshake) = serde_json::from_str::<Value>(&data[1..]) {
                if let Some(ms) = handshake["pingInterval"].as_u64() {
                    *ping_interval = Duration::from_millis(ms);
                }
                if let Some(ms) = handshake["pingTimeout"].as_u64() {
                    *ping_timeout = Duration::from_millis(ms);
                }
            }
            FrameOutcome::Continue
        }
        // Pong for a ping we sent.
        Some('3') => {
            *pong_deadline = None;
            FrameOutcome::Continue
        }
        Some('4') => {
            match chars.next() {
                // Application message.
                Some('2') => {
                    link.emit_unless_closing(SignalKind::Message(data[2..].to_string()));
                }
                // Room-join ack: the link is now usable.
                Some('0') => {
                    if let Some(ms) = wait_after_connect_ms {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                    }
                    *next_ping = Some(Instant::now() + *ping_interval);
                    link.emit(SignalKind::Open);
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(());
                    }
                }
                _ => debug!(conn_id = %link.conn_id(), frame = data, "unhandled socket.io frame"),
            }
            FrameOutcome::Continue
        }
        Some('1') => {
            link.emit_unless_closing(SignalKind::Error(
                "server sent disconnect message".to_string(),
            ));
            FrameOutcome::Disconnect
        }
        _ => {
            debug!(conn_id = %link.conn_id(), frame = data, "unknown socket.io frame");
            FrameOutcome::Continue
        }
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        link: Arc<Link>,
        signals_rx: mpsc::UnboundedReceiver<ConnectionSignal>,
        ping_interval: Duration,
        ping_timeout: Duration,
        next_ping: Option<Instant>,
        pong_deadline: Option<Instant>,
    }

    fn fixture() -> Fixture {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        Fixture {
            link: Arc::new(Link::new("socketio-test", signals_tx)),
            signals_rx,
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            next_ping: None,
            pong_deadline: None,
        }
    }

    impl Fixture {
        async fn feed(&mut self, data: &str, ready: &mut Option<oneshot::Sender<()>>) -> FrameOutcome {
            handle_frame(
                data,
                &self.link,
                ready,
                &mut self.ping_interval,
                &mut self.ping_timeout,
                &mut self.next_ping,
                &mut self.pong_deadline,
                None,
            )
            .await
        }
    }

    #[tokio::test]
    async fn test_handshake_negotiates_ping_parameters() {
        let mut fx = fixture();
        let mut ready = None;

        let outcome = fx
            .feed(r#"0{"sid":"abc","pingInterval":10000,"pingTimeout":4000}"#, &mut ready)
            .await;

        assert!(matches!(outcome, FrameOutcome::Continue));
        assert_eq!(fx.ping_interval, Duration::from_millis(10_000));
        assert_eq!(fx.ping_timeout, Duration::from_millis(4_000));
        // The link is not open until the room-join ack.
        assert!(fx.signals_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_room_join_ack_opens_and_arms_ping() {
        let mut fx = fixture();
        let (ready_tx, ready_rx) = oneshot::channel();
        let mut ready = Some(ready_tx);

        fx.feed(r#"0{"pingInterval":10000,"pingTimeout":4000}"#, &mut ready)
            .await;
        fx.feed("40", &mut ready).await;

        assert!(ready.is_none());
        assert!(ready_rx.await.is_ok());
        assert!(fx.next_ping.is_some());
        assert_eq!(fx.signals_rx.try_recv().unwrap().kind, SignalKind::Open);
    }

    #[tokio::test]
    async fn test_application_frame_unwraps_payload() {
        let mut fx = fixture();
        let mut ready = None;

        fx.feed(r#"42["trade",{"price":"100.5"}]"#, &mut ready).await;

        assert_eq!(
            fx.signals_rx.try_recv().unwrap().kind,
            SignalKind::Message(r#"["trade",{"price":"100.5"}]"#.to_string())
        );
    }

    #[tokio::test]
    async fn test_pong_clears_deadline() {
        let mut fx = fixture();
        let mut ready = None;
        fx.pong_deadline = Some(Instant::now() + Duration::from_secs(1));

        fx.feed("3", &mut ready).await;
        assert!(fx.pong_deadline.is_none());
    }

    #[tokio::test]
    async fn test_server_disconnect_surfaces_error() {
        let mut fx = fixture();
        let mut ready = None;

        let outcome = fx.feed("1", &mut ready).await;

        assert!(matches!(outcome, FrameOutcome::Disconnect));
        assert!(matches!(
            fx.signals_rx.try_recv().unwrap().kind,
            SignalKind::Error(_)
        ));
    }
}
