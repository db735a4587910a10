//! How a [`MessagingClient`](crate::client::MessagingClient) reaches a broker.
//!
//! A [`Transport`] produces a fresh [`Connection`] per session: a pair of
//! channels carrying [`ClientFrame`]s out and [`BrokerFrame`]s in.  The
//! session is over when the inbound channel closes; the client then asks the
//! transport for a new connection.
//!
//! - [`WsTransport`] – JSON frames over a WebSocket to a FieldOS broker.
//! - [`MemoryTransport`] – direct attachment to an in-process
//!   [`MessageBus`], used by the daemon's own components and by tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fieldos_types::FieldError;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::bus::MessageBus;
use crate::codec::{BrokerFrame, ClientFrame};

/// Channel capacity on each side of a connection.
const CONNECTION_CAPACITY: usize = 1024;

/// One live session with the broker.
pub struct Connection {
    pub outbound: mpsc::Sender<ClientFrame>,
    pub inbound: mpsc::Receiver<BrokerFrame>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a session as `client_id`.
    async fn connect(&self, client_id: &str) -> Result<Connection, FieldError>;

    /// Human-readable endpoint for logs.
    fn describe(&self) -> String;
}

// ────────────────────────────────────────────────────────────────────────────
// In-memory
// ────────────────────────────────────────────────────────────────────────────

/// Attaches straight to a [`MessageBus`] in the same process.
///
/// [`sever`](Self::sever) and [`restore`](Self::restore) simulate the broker
/// going away and coming back.
#[derive(Clone)]
pub struct MemoryTransport {
    bus: Arc<MessageBus>,
    available: Arc<AtomicBool>,
}

impl MemoryTransport {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self {
            bus,
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Drop every session and refuse new ones.
    pub fn sever(&self) {
        self.available.store(false, Ordering::SeqCst);
        self.bus.disconnect_all();
    }

    /// Accept connections again.
    pub fn restore(&self) {
        self.available.store(true, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, client_id: &str) -> Result<Connection, FieldError> {
        if !self.is_available() {
            return Err(FieldError::Connection("in-memory broker unavailable".into()));
        }
        let (generation, inbound) = self.bus.attach(client_id);
        let (outbound, mut out_rx) = mpsc::channel::<ClientFrame>(CONNECTION_CAPACITY);

        let bus = Arc::clone(&self.bus);
        let id = client_id.to_string();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                match bus.handle(&id, generation, frame) {
                    Ok(()) => {}
                    Err(FieldError::Closed) => break,
                    Err(e) => warn!(client = %id, error = %e, "frame rejected by broker"),
                }
            }
            bus.detach(&id, generation);
        });

        Ok(Connection { outbound, inbound })
    }

    fn describe(&self) -> String {
        "memory://local".to_string()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// WebSocket
// ────────────────────────────────────────────────────────────────────────────

/// Connects to a FieldOS broker over WebSocket, e.g. `ws://127.0.0.1:1883`.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
    token: Option<String>,
    handshake_timeout: Duration,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            handshake_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, client_id: &str) -> Result<Connection, FieldError> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| FieldError::Connection(format!("connect to {}: {e}", self.url)))?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let hello = ClientFrame::Connect {
            client_id: client_id.to_string(),
            token: self.token.clone(),
        };
        ws_tx
            .send(Message::Text(hello.to_text()?.into()))
            .await
            .map_err(|e| FieldError::Connection(e.to_string()))?;

        // The broker answers a connect with exactly one ConnAck or Error.
        let ack = tokio::time::timeout(self.handshake_timeout, ws_rx.next())
            .await
            .map_err(|_| FieldError::Timeout(format!("handshake with {}", self.url)))?;
        match ack {
            Some(Ok(Message::Text(text))) => match BrokerFrame::from_text(text.as_str())? {
                BrokerFrame::ConnAck { session } => {
                    debug!(url = %self.url, session, "broker session established");
                }
                BrokerFrame::Error { message } => return Err(FieldError::Unauthorized(message)),
                other => {
                    return Err(FieldError::Connection(format!(
                        "unexpected handshake frame {other:?}"
                    )));
                }
            },
            Some(Ok(_)) => return Err(FieldError::Connection("non-text handshake frame".into())),
            Some(Err(e)) => return Err(FieldError::Connection(e.to_string())),
            None => return Err(FieldError::Connection("closed during handshake".into())),
        }

        let (outbound, mut out_rx) = mpsc::channel::<ClientFrame>(CONNECTION_CAPACITY);
        let (in_tx, inbound) = mpsc::channel::<BrokerFrame>(CONNECTION_CAPACITY);

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let text = match frame.to_text() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "could not encode frame");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                match msg {
                    Ok(Message::Text(text)) => match BrokerFrame::from_text(text.as_str()) {
                        Ok(frame) => {
                            if in_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "malformed frame from broker"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        Ok(Connection { outbound, inbound })
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}
