//! WebSocket connection to a router.
//!
//! One task reads events and acknowledges them, another writes outgoing
//! frames and sends keep-alive pings.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{SinkExt as _, StreamExt as _};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, trace, warn};

use agentwire_protocol::{AgentError, AgentResult, Event};

use super::listen::PROTOCOL_ERROR_CLOSE;

/// Close code reported when the stream ends without a close frame.
pub const ABNORMAL_CLOSE: u16 = 1006;
const NO_STATUS_CLOSE: u16 = 1005;

/// Handler for events received by a router client.
///
/// An error leaves the event unacknowledged.
pub type EventHandler = Arc<dyn Fn(Event) -> anyhow::Result<()> + Send + Sync>;

/// Called once when the connection closes, with the close code and reason.
pub(crate) type CloseHandler = Arc<dyn Fn(u16, Option<String>) + Send + Sync>;

/// Failure to open a WebSocket.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ConnectError {
    /// The router answered the upgrade with an HTTP status.
    #[error("Unexpected response code: {0}")]
    Rejected(u16),
    #[error(transparent)]
    Failed(#[from] AgentError),
}

/// Open WebSocket with its reader and writer tasks.
pub(crate) struct WebSocketConnection {
    outbound: mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
}

impl fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("open", &self.is_open())
            .finish()
    }
}

impl WebSocketConnection {
    /// Connect to `url` and start the reader and writer tasks.
    pub(crate) async fn connect(
        url: &str,
        headers: &HashMap<String, String>,
        ping_interval: Duration,
        on_event: EventHandler,
        on_close: CloseHandler,
    ) -> Result<Self, ConnectError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| AgentError::InvalidArgument(format!("Invalid WebSocket URL {url}: {e}")))?;
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| AgentError::InvalidArgument(format!("Invalid header {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| AgentError::InvalidArgument(format!("Invalid header value: {e}")))?;
            request.headers_mut().insert(name, value);
        }

        let (stream, _response) = connect_async(request).await.map_err(|e| match e {
            WsError::Http(response) => ConnectError::Rejected(response.status().as_u16()),
            e => ConnectError::Failed(AgentError::ConnectivityFailure(e.to_string())),
        })?;
        let (mut writer, mut reader) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let open = Arc::new(AtomicBool::new(true));

        tokio::spawn(async move {
            debug!("WebSocket writer task started, ping every {:?}", ping_interval);
            let mut ticker = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
            loop {
                tokio::select! {
                    message = outbound_rx.recv() => {
                        let Some(message) = message else { break };
                        let closing = matches!(message, Message::Close(_));
                        if let Err(e) = writer.send(message).await {
                            debug!("WebSocket send failed: {}", e);
                            break;
                        }
                        if closing {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        trace!("Sending WebSocket keep-alive ping");
                        if let Err(e) = writer.send(Message::Ping(Vec::new().into())).await {
                            warn!("WebSocket keep-alive ping failed: {}", e);
                            break;
                        }
                    }
                }
            }
            debug!("WebSocket writer task stopped");
        });

        let acks = outbound.clone();
        let reader_open = open.clone();
        tokio::spawn(async move {
            debug!("WebSocket reader task started");
            let mut close = (ABNORMAL_CLOSE, None);
            while let Some(message) = reader.next().await {
                match message {
                    Ok(Message::Text(text)) => handle_text(text.as_str(), &on_event, &acks),
                    Ok(Message::Close(frame)) => {
                        close = match frame {
                            Some(frame) => {
                                let reason = frame.reason.to_string();
                                (u16::from(frame.code), Some(reason).filter(|r| !r.is_empty()))
                            }
                            None => (NO_STATUS_CLOSE, None),
                        };
                        break;
                    }
                    Ok(_) => {}
                    Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => break,
                    Err(e) => {
                        error!("WebSocket error ({})", e);
                        close = (PROTOCOL_ERROR_CLOSE, Some(e.to_string()));
                        break;
                    }
                }
            }
            reader_open.store(false, Ordering::SeqCst);
            on_close(close.0, close.1);
            debug!("WebSocket reader task stopped");
        });

        Ok(Self { outbound, open })
    }

    /// Whether the connection is still open.
    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Send a JSON text frame.
    pub(crate) fn send_json(&self, value: &Value) -> AgentResult<()> {
        if !self.is_open() {
            return Err(AgentError::ConnectivityFailure("WebSocket closed".into()));
        }
        self.outbound
            .send(Message::text(value.to_string()))
            .map_err(|_| AgentError::ConnectivityFailure("WebSocket closed".into()))
    }

    /// Start the close handshake.
    pub(crate) fn close(&self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        if self.outbound.send(Message::Close(Some(frame))).is_err() {
            debug!("WebSocket already closed");
        }
        self.open.store(false, Ordering::SeqCst);
    }
}

fn handle_text(text: &str, on_event: &EventHandler, acks: &mpsc::UnboundedSender<Message>) {
    let result = serde_json::from_str::<Event>(text)
        .map_err(anyhow::Error::from)
        .and_then(|event| {
            info!("Received EVENT {}", event);
            let uuid = event.uuid.clone();
            on_event(event)?;
            Ok(uuid)
        });
    match result {
        Ok(uuid) => {
            let _ = acks.send(Message::text(json!({ "ack": uuid }).to_string()));
        }
        Err(e) => error!("Failed handling WebSocket event: {}", e),
    }
}
