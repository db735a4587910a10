//! The broker's WebSocket front end.
//!
//! [`BrokerServer`] accepts WebSocket connections on one or more listeners and
//! drives a shared [`MessageBus`].  Every session must open with a `connect`
//! frame; when an auth token is configured the frame must carry it.
//!
//! Retained messages are optionally persisted to a JSON file, rewritten a
//! couple of seconds after they change and once more on shutdown, and loaded
//! again on start.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fieldos_types::FieldError;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::{WebSocketStream, accept_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{MessageBus, RetainedMessage};
use crate::codec::{BrokerFrame, ClientFrame};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const PERSIST_INTERVAL: Duration = Duration::from_secs(2);

/// On-disk configuration of the native broker, as rendered by the
/// [`BrokerSupervisor`](crate::supervisor::BrokerSupervisor).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerServerConfig {
    /// `host:port` socket addresses to listen on.
    pub listeners: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistence_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default = "default_session_capacity")]
    pub session_capacity: usize,
}

fn default_session_capacity() -> usize {
    4096
}

impl BrokerServerConfig {
    pub fn load(path: &Path) -> Result<Self, FieldError> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| FieldError::ConfigValidation(format!("{}: {e}", path.display())))
    }
}

pub struct BrokerServer {
    bus: Arc<MessageBus>,
    config: BrokerServerConfig,
}

impl BrokerServer {
    /// Build a server, restoring persisted retained messages if present.
    pub fn new(config: BrokerServerConfig) -> Result<Self, FieldError> {
        let bus = Arc::new(MessageBus::new(config.session_capacity));
        if let Some(path) = &config.persistence_file {
            if path.exists() {
                let text = std::fs::read_to_string(path)?;
                let retained: Vec<RetainedMessage> = serde_json::from_str(&text)?;
                info!(count = retained.len(), path = %path.display(), "restored retained messages");
                bus.restore_retained(retained);
            }
        }
        Ok(Self { bus, config })
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Bind every configured listener and serve until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), FieldError> {
        let mut listeners = Vec::with_capacity(self.config.listeners.len());
        for addr in &self.config.listeners {
            let listener = TcpListener::bind(addr.as_str()).await.map_err(|e| {
                FieldError::BrokerUnavailable(format!("bind {addr}: {e}"))
            })?;
            info!(addr = %addr, "broker listening");
            listeners.push(listener);
        }
        self.run_with(listeners, shutdown).await
    }

    /// Serve on already-bound listeners until `shutdown` fires.
    pub async fn run_with(
        self,
        listeners: Vec<TcpListener>,
        shutdown: CancellationToken,
    ) -> Result<(), FieldError> {
        let server = Arc::new(self);
        let mut accept_tasks = JoinSet::new();
        for listener in listeners {
            accept_tasks.spawn(Arc::clone(&server).accept_loop(listener, shutdown.clone()));
        }

        let mut persist = tokio::time::interval(PERSIST_INTERVAL);
        let mut saved_version = server.bus.retained_version();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = persist.tick() => {
                    let version = server.bus.retained_version();
                    if version != saved_version {
                        match server.save_retained() {
                            Ok(()) => saved_version = version,
                            Err(e) => warn!(error = %e, "could not persist retained messages"),
                        }
                    }
                }
            }
        }

        accept_tasks.shutdown().await;
        server.bus.disconnect_all();
        server.save_retained()?;
        info!("broker stopped");
        Ok(())
    }

    fn save_retained(&self) -> Result<(), FieldError> {
        let Some(path) = &self.config.persistence_file else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(&self.bus.export_retained())?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&self);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_client(stream, peer, shutdown).await {
                                debug!(peer = %peer, error = %e, "broker client ended with error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "broker accept error"),
                },
            }
        }
    }

    async fn handle_client(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<(), FieldError> {
        let mut ws = accept_async(stream)
            .await
            .map_err(|e| FieldError::Connection(format!("ws handshake from {peer}: {e}")))?;

        let client_id = match self.read_connect(&mut ws).await {
            Ok(client_id) => client_id,
            Err(e) => {
                let reply = BrokerFrame::Error { message: e.to_string() };
                let _ = ws.send(Message::Text(reply.to_text()?.into())).await;
                let _ = ws.close(None).await;
                return Err(e);
            }
        };

        let (generation, mut deliveries) = self.bus.attach(&client_id);
        let ack = BrokerFrame::ConnAck { session: generation };
        let (mut ws_tx, mut ws_rx) = ws.split();
        let result = async {
            ws_tx
                .send(Message::Text(ack.to_text()?.into()))
                .await
                .map_err(|e| FieldError::Connection(e.to_string()))?;
            debug!(peer = %peer, client = %client_id, generation, "broker session started");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    frame = deliveries.recv() => {
                        let Some(frame) = frame else { break };
                        if ws_tx.send(Message::Text(frame.to_text()?.into())).await.is_err() {
                            break;
                        }
                    }
                    msg = ws_rx.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            let outcome = ClientFrame::from_text(text.as_str())
                                .and_then(|frame| self.bus.handle(&client_id, generation, frame));
                            match outcome {
                                Ok(()) => {}
                                Err(FieldError::Closed) => break,
                                Err(e) => {
                                    warn!(client = %client_id, error = %e, "rejected client frame");
                                    let reply = BrokerFrame::Error { message: e.to_string() };
                                    if ws_tx.send(Message::Text(reply.to_text()?.into())).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    },
                }
            }
            Ok::<(), FieldError>(())
        }
        .await;

        self.bus.detach(&client_id, generation);
        debug!(client = %client_id, "broker session ended");
        result
    }

    async fn read_connect(&self, ws: &mut WebSocketStream<TcpStream>) -> Result<String, FieldError> {
        let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, ws.next())
            .await
            .map_err(|_| FieldError::Timeout("waiting for connect frame".into()))?;
        let text = match first {
            Some(Ok(Message::Text(text))) => text,
            _ => return Err(FieldError::Connection("expected a connect frame".into())),
        };
        match ClientFrame::from_text(text.as_str())? {
            ClientFrame::Connect { client_id, token } => {
                if client_id.is_empty() {
                    return Err(FieldError::SchemaValidation("empty client_id".into()));
                }
                if let Some(expected) = &self.config.auth_token {
                    if token.as_deref() != Some(expected.as_str()) {
                        warn!(client = %client_id, "connect refused: bad token");
                        return Err(FieldError::Unauthorized("invalid broker token".into()));
                    }
                }
                Ok(client_id)
            }
            _ => Err(FieldError::SchemaValidation("first frame must be connect".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Transport, WsTransport};

    fn config(token: Option<&str>, persistence: Option<PathBuf>) -> BrokerServerConfig {
        BrokerServerConfig {
            listeners: vec![],
            persistence_file: persistence,
            auth_token: token.map(str::to_string),
            session_capacity: 64,
        }
    }

    async fn spawn_server(
        config: BrokerServerConfig,
    ) -> Result<(String, CancellationToken, tokio::task::JoinHandle<Result<(), FieldError>>), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("ws://{}", listener.local_addr()?);
        let server = BrokerServer::new(config)?;
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.run_with(vec![listener], shutdown.clone()));
        Ok((url, shutdown, handle))
    }

    #[tokio::test]
    async fn websocket_pubsub_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        let (url, shutdown, handle) = spawn_server(config(None, None)).await?;

        let transport = WsTransport::new(url);
        let mut sub = transport.connect("sub").await?;
        let publisher = transport.connect("pub").await?;

        sub.outbound.send(ClientFrame::Subscribe { filter: "weather/#".into() }).await?;
        // Give the broker a moment to register the subscription.
        tokio::time::sleep(Duration::from_millis(100)).await;
        publisher
            .outbound
            .send(ClientFrame::Publish {
                topic: "weather/wind".into(),
                qos: fieldos_types::QoS::AtLeastOnce,
                retain: false,
                body: crate::codec::Body::Json("{}".into()),
            })
            .await?;

        let frame = tokio::time::timeout(Duration::from_secs(2), sub.inbound.recv()).await?;
        assert!(matches!(frame, Some(BrokerFrame::Deliver { ref topic, .. }) if topic == "weather/wind"));

        shutdown.cancel();
        handle.await??;
        Ok(())
    }

    #[tokio::test]
    async fn bad_token_is_refused() -> Result<(), Box<dyn std::error::Error>> {
        let (url, shutdown, handle) = spawn_server(config(Some("s3cret"), None)).await?;

        let denied = WsTransport::new(url.clone()).with_token(Some("wrong".into()));
        assert!(matches!(denied.connect("x").await, Err(FieldError::Unauthorized(_))));

        let allowed = WsTransport::new(url).with_token(Some("s3cret".into()));
        assert!(allowed.connect("x").await.is_ok());

        shutdown.cancel();
        handle.await??;
        Ok(())
    }

    #[tokio::test]
    async fn retained_messages_survive_restart() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("retained.json");

        let server = BrokerServer::new(config(None, Some(file.clone())))?;
        server.bus().publish("power/battery", crate::codec::Body::Json("{}".into()), true)?;
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        server.run_with(vec![], shutdown).await?;
        assert!(file.exists());

        let restarted = BrokerServer::new(config(None, Some(file)))?;
        assert!(restarted.bus().retained("power/battery").is_some());
        Ok(())
    }
}
