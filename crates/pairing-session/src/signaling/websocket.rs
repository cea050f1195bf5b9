use super::SignalingChannel;
use crate::error::SignalingError;
use crate::protocol::SignalingMessage;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// `interval` panics on a zero period.
const MIN_HEARTBEAT: Duration = Duration::from_secs(1);

/// JSON-over-WebSocket connection to the relay.
///
/// A writer task serialises outbound messages and sends a ping frame every
/// heartbeat interval; a reader task decodes inbound text frames. Frames that
/// do not decode are logged and skipped.
pub struct WebSocketChannel {
    tx: Option<mpsc::UnboundedSender<SignalingMessage>>,
    rx: mpsc::UnboundedReceiver<SignalingMessage>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl WebSocketChannel {
    pub async fn connect(relay_url: &str, heartbeat: Duration) -> Result<Self, SignalingError> {
        let url = parse_relay_url(relay_url)?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| SignalingError::Connect(err.to_string()))?;
        debug!(target: "signaling", url = %url, "connected to relay");

        let (sink, source) = stream.split();
        let (tx_out, rx_out) = mpsc::unbounded_channel();
        let (tx_in, rx_in) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(sink, rx_out, heartbeat));
        let reader = tokio::spawn(read_loop(source, tx_in));

        Ok(Self {
            tx: Some(tx_out),
            rx: rx_in,
            writer,
            reader,
        })
    }
}

#[async_trait]
impl SignalingChannel for WebSocketChannel {
    async fn send(&mut self, message: SignalingMessage) -> Result<(), SignalingError> {
        let tx = self.tx.as_ref().ok_or(SignalingError::ChannelClosed)?;
        tx.send(message).map_err(|_| SignalingError::ChannelClosed)
    }

    async fn recv(&mut self) -> Option<SignalingMessage> {
        self.rx.recv().await
    }

    async fn close(&mut self) {
        // Dropping the sender lets the writer flush and send a close frame.
        if self.tx.take().is_some() {
            let _ = (&mut self.writer).await;
        }
        self.reader.abort();
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        self.writer.abort();
        self.reader.abort();
    }
}

/// Accepts `ws://` and `wss://` URLs; a bare `host:port` gets `ws://` for
/// loopback hosts and `wss://` otherwise.
pub(crate) fn parse_relay_url(raw: &str) -> Result<Url, SignalingError> {
    let raw = raw.trim();
    let candidate = if raw.contains("://") {
        raw.to_string()
    } else if raw.starts_with("localhost") || raw.starts_with("127.0.0.1") {
        format!("ws://{raw}")
    } else {
        format!("wss://{raw}")
    };
    let url = Url::parse(&candidate).map_err(|err| SignalingError::InvalidUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(SignalingError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<SignalingMessage>,
    heartbeat: Duration,
) {
    let mut ticker = interval(heartbeat.max(MIN_HEARTBEAT));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            message = outbound.recv() => {
                let Some(message) = message else {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(target: "signaling", kind = message.kind(), error = %err, "failed to encode message");
                        continue;
                    }
                };
                trace!(target: "signaling", kind = message.kind(), "sending");
                if let Err(err) = sink.send(Message::Text(text)).await {
                    warn!(target: "signaling", error = %err, "relay write failed");
                    break;
                }
            }
            _ = ticker.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn read_loop(
    mut source: SplitStream<WsStream>,
    inbound: mpsc::UnboundedSender<SignalingMessage>,
) {
    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<SignalingMessage>(&text) {
                Ok(message) => {
                    trace!(target: "signaling", kind = message.kind(), "received");
                    if inbound.send(message).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    debug!(target: "signaling", error = %err, "skipping undecodable frame");
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                warn!(target: "signaling", error = %err, "relay read failed");
                break;
            }
        }
    }
    debug!(target: "signaling", "relay connection closed");
}
