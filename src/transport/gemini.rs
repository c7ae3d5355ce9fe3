//! Gemini Live WebSocket transport

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::protocol::{ClientMessage, ServerMessage, Setup};
use super::{Connection, RealtimeInput, Transport, TransportEvent, TransportHandle};
use crate::config::LiveConfig;
use crate::{Error, Result};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Work for the socket writer task
enum Outbound {
    Text(String),
    Close,
}

/// Opens Gemini Live bidirectional streaming sessions
pub struct GeminiLiveTransport {
    api_key: SecretString,
}

impl GeminiLiveTransport {
    /// Create a transport authenticating with `api_key`
    #[must_use]
    pub const fn new(api_key: SecretString) -> Self {
        Self { api_key }
    }

    fn url(&self, endpoint: &str) -> Result<Url> {
        let mut url =
            Url::parse(endpoint).map_err(|e| Error::Config(format!("invalid endpoint: {e}")))?;
        url.query_pairs_mut()
            .append_pair("key", self.api_key.expose_secret());
        Ok(url)
    }
}

#[async_trait]
impl Transport for GeminiLiveTransport {
    fn name(&self) -> &'static str {
        "gemini-live"
    }

    async fn connect(&self, config: &LiveConfig) -> Result<Connection> {
        let url = self.url(&config.endpoint)?;

        tracing::debug!(
            endpoint = %config.endpoint,
            model = %config.model,
            "connecting to live session"
        );

        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        let (mut sink, stream) = socket.split();

        let setup = serde_json::to_string(&ClientMessage::Setup(Setup::from_config(config)))?;
        sink.send(Message::Text(setup))
            .await
            .map_err(|e| Error::Connection(format!("failed to send setup: {e}")))?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(write_loop(sink, outbound_rx));
        tokio::spawn(read_loop(stream, event_tx, Arc::clone(&closed)));

        Ok(Connection {
            handle: Arc::new(GeminiHandle {
                outbound: outbound_tx,
                closed,
            }),
            events: event_rx,
        })
    }
}

/// Outbound half of a Gemini Live connection
struct GeminiHandle {
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: Arc<AtomicBool>,
}

impl TransportHandle for GeminiHandle {
    fn send_realtime_input(&self, input: RealtimeInput) {
        if self.is_closed() {
            tracing::trace!("dropping audio frame on closed connection");
            return;
        }

        match serde_json::to_string(&ClientMessage::audio(input)) {
            Ok(json) => {
                if self.outbound.send(Outbound::Text(json)).is_err() {
                    tracing::debug!("writer gone, audio frame dropped");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize audio frame"),
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.outbound.send(Outbound::Close);
            tracing::debug!("live session close requested");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

async fn write_loop(
    mut sink: SplitSink<Socket, Message>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Text(json) => {
                if let Err(e) = sink.send(Message::Text(json)).await {
                    tracing::debug!(error = %e, "socket write failed");
                    break;
                }
            }
            Outbound::Close => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    mut stream: SplitStream<Socket>,
    events: mpsc::UnboundedSender<TransportEvent>,
    closed: Arc<AtomicBool>,
) {
    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            // The service also delivers JSON in binary frames
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    tracing::warn!("ignoring non-UTF-8 binary frame");
                    continue;
                }
            },
            Ok(Message::Close(frame)) => {
                let _ = events.send(close_event(frame.as_ref(), &closed));
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                let event = if closed.load(Ordering::SeqCst) {
                    TransportEvent::Closed
                } else {
                    TransportEvent::Error(e.to_string())
                };
                let _ = events.send(event);
                return;
            }
        };

        match ServerMessage::parse(&text) {
            Ok(message) => {
                for event in message.into_events() {
                    if events.send(event).is_err() {
                        return;
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "ignoring unparseable server message"),
        }
    }

    let _ = events.send(TransportEvent::Closed);
}

/// Map a close frame to the event the session sees
///
/// Abnormal remote closes carry the service's error reason.
fn close_event(frame: Option<&CloseFrame<'_>>, closed: &AtomicBool) -> TransportEvent {
    if closed.load(Ordering::SeqCst) {
        return TransportEvent::Closed;
    }
    match frame {
        Some(frame) if frame.code != CloseCode::Normal => {
            tracing::warn!(
                code = %frame.code,
                reason = %frame.reason,
                "live session closed by server"
            );
            TransportEvent::Error(format!("{}: {}", frame.code, frame.reason))
        }
        _ => TransportEvent::Closed,
    }
}
