//! Byte transport under the signaling client.
//!
//! The signaling layer only needs ordered whole messages in both directions;
//! everything websocket-specific (frame types, keepalive, the split
//! sink/stream tasks) stays behind [`SignalingTransport`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use url::Url;

use crate::error::TransportError;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Ordered, reliable message transport to the signaling relay.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(&self, data: Vec<u8>) -> Result<(), TransportError>;
    /// Next inbound message. `None` once the transport has disconnected.
    async fn recv(&self) -> Option<Vec<u8>>;
    async fn close(&self);
}

/// WebSocket implementation of [`SignalingTransport`].
pub struct WebSocketTransport {
    tx_out: mpsc::UnboundedSender<Message>,
    rx_in: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    connected: Arc<AtomicBool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl WebSocketTransport {
    /// Connects to the relay. Accepts `http(s)` URLs as well and rewrites
    /// the scheme to `ws(s)`.
    pub async fn connect(relay_url: &str) -> Result<Self, TransportError> {
        let websocket_url = derive_websocket_url(relay_url)?;
        let (ws_stream, _) = connect_async(websocket_url.as_str())
            .await
            .map_err(|err| TransportError::Setup(err.to_string()))?;
        tracing::debug!(
            target: "causeway::transport",
            url = %websocket_url,
            "signaling websocket connected"
        );

        let (tx_out, rx_out) = mpsc::unbounded_channel::<Message>();
        let (tx_in, rx_in) = mpsc::unbounded_channel::<Vec<u8>>();
        let connected = Arc::new(AtomicBool::new(true));

        let ws_task = tokio::spawn(run_websocket(ws_stream, rx_out, tx_in, connected.clone()));

        let tx_heartbeat = tx_out.clone();
        let heartbeat_task = tokio::spawn(async move {
            let mut ticker = interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if tx_heartbeat.send(Message::Ping(Vec::new())).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            tx_out,
            rx_in: AsyncMutex::new(rx_in),
            connected,
            tasks: std::sync::Mutex::new(vec![ws_task, heartbeat_task]),
        })
    }

    fn abort_tasks(&self) {
        let mut tasks = match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl SignalingTransport for WebSocketTransport {
    async fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        self.tx_out
            .send(Message::Binary(data))
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        self.rx_in.lock().await.recv().await
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.abort_tasks();
        tracing::debug!(target: "causeway::transport", "signaling websocket closed");
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

async fn run_websocket(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut rx_out: mpsc::UnboundedReceiver<Message>,
    tx_in: mpsc::UnboundedSender<Vec<u8>>,
    connected: Arc<AtomicBool>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let send_task = tokio::spawn(async move {
        while let Some(message) = rx_out.recv().await {
            if ws_sender.send(message).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = ws_receiver.next().await {
        match message {
            Ok(Message::Binary(data)) => {
                if tx_in.send(data).is_err() {
                    break;
                }
            }
            Ok(Message::Text(text)) => {
                if tx_in.send(text.into_bytes()).is_err() {
                    break;
                }
            }
            Ok(Message::Close(frame)) => {
                tracing::debug!(
                    target: "causeway::transport",
                    frame = ?frame,
                    "relay closed the websocket"
                );
                break;
            }
            Err(err) => {
                tracing::warn!(
                    target: "causeway::transport",
                    error = %err,
                    "signaling websocket error"
                );
                break;
            }
            // Pings are answered by tungstenite on the next flush.
            _ => {}
        }
    }

    connected.store(false, Ordering::SeqCst);
    send_task.abort();
    let _ = send_task.await;
}

fn derive_websocket_url(relay_url: &str) -> Result<Url, TransportError> {
    let mut url =
        Url::parse(relay_url).map_err(|err| TransportError::Setup(err.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(url),
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(TransportError::Setup(format!(
                "unsupported relay url scheme: {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| TransportError::Setup("failed to rewrite relay url scheme".into()))?;
    Ok(url)
}
