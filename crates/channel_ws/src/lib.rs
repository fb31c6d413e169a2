//! Websocket ingress: every received frame becomes an [`InboundEvent`], every
//! outbound message is broadcast to all connected clients.

use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
};

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use ingress::{
    Envelope, InboundEvent, Ingress, IngressError, Outbound, SourceId, WorkflowInstanceId,
    message::{decode_utf8, parse_object, require_source_id},
};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    sync::mpsc::{UnboundedSender, unbounded_channel},
};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMsg};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod tls;

pub type ConnectionId = Uuid;

#[derive(Debug, Error)]
pub enum WsError {
    #[error("could not bind websocket server on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not read {path}: {source}")]
    ReadPem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no certificate found in {0}")]
    NoCertificate(PathBuf),
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),
    #[error(transparent)]
    Tls(#[from] rustls::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// How the workflow instance of an incoming frame is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Resolution {
    /// Look the source up in the session registry.
    #[default]
    Registry,
    /// Leave it empty; the ingress resolves it (snapshot workflows).
    Deferred,
}

#[derive(Debug, Clone)]
pub struct WsConfig {
    pub url: String,
    pub port: u16,
    pub certificate_path: Option<PathBuf>,
    pub private_key_path: Option<PathBuf>,
    pub resolution: Resolution,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            url: "localhost".to_string(),
            port: 5678,
            certificate_path: None,
            private_key_path: None,
            resolution: Resolution::Registry,
        }
    }
}

impl WsConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.url, self.port)
    }
}

/// A validated inbound frame: `{"source_id": ..., "message": ...}`.
#[derive(Debug, Clone, PartialEq)]
pub struct WsFrame {
    pub source_id: SourceId,
    pub message: Value,
}

impl WsFrame {
    pub fn parse(text: &str) -> Result<Self, IngressError> {
        let map = parse_object(text)?;
        let source_id = require_source_id(&map)?;
        let message = map
            .get("message")
            .cloned()
            .ok_or(IngressError::MissingField("message"))?;
        Ok(Self { source_id, message })
    }

    pub fn into_event(self, workflow_instance_id: Option<WorkflowInstanceId>) -> InboundEvent {
        InboundEvent::new(
            Some(self.source_id),
            workflow_instance_id,
            json!({ "message": self.message }),
        )
    }
}

/// Websocket server plus its connected client set.
pub struct WsIngress {
    ingress: Arc<dyn Ingress>,
    clients: DashMap<ConnectionId, UnboundedSender<WsMsg>>,
    resolution: Resolution,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl WsIngress {
    /// Bind the listener and start accepting connections in the background.
    pub async fn start(config: WsConfig, ingress: Arc<dyn Ingress>) -> Result<Arc<Self>, WsError> {
        let acceptor = tls::acceptor(
            config.certificate_path.as_deref(),
            config.private_key_path.as_deref(),
        )?;
        let addr = config.address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| WsError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        info!(
            "Starting websocket server on {}://{}",
            if acceptor.is_some() { "wss" } else { "ws" },
            local_addr
        );

        let ws = Arc::new(Self {
            ingress,
            clients: DashMap::new(),
            resolution: config.resolution,
            local_addr,
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(ws.clone().accept_loop(listener, acceptor));
        Ok(ws)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    #[cfg(test)]
    fn connection_ids(&self) -> Vec<ConnectionId> {
        self.clients.iter().map(|entry| *entry.key()).collect()
    }

    /// Stop accepting and close every open connection.
    pub fn stop(&self) {
        info!("websocket server stopping");
        self.shutdown.cancel();
    }

    /// Broadcast `{source_id, message}` to every connected client.
    pub async fn send(&self, source_id: &SourceId, message: &str) -> usize {
        let frame = Envelope::new(source_id.clone(), message).to_json();
        let mut delivered = 0;
        for client in self.clients.iter() {
            if client.value().send(WsMsg::Text(frame.clone().into())).is_ok() {
                delivered += 1;
            }
        }
        debug!(%source_id, delivered, "broadcast sent");
        delivered
    }

    /// Remove a connection from the client set and close its socket.
    /// Returns `false` if it was already gone.
    pub fn close_connection(&self, connection: ConnectionId) -> bool {
        // dropping the sender ends the connection's write loop
        let removed = self.clients.remove(&connection).is_some();
        if removed {
            debug!(%connection, "client removed");
        }
        removed
    }

    pub async fn link(&self, workflow_instance_id: WorkflowInstanceId, source_id: SourceId) {
        self.ingress.register_source(source_id, workflow_instance_id).await;
    }

    pub async fn unlink(&self, source_id: &SourceId) {
        self.ingress.unregister_source(source_id).await;
    }

    /// Validate one frame and hand it to the ingress. Malformed frames are
    /// dropped; nothing is reported back to the client.
    pub async fn process_message(&self, text: &str) -> bool {
        let frame = match WsFrame::parse(text) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(error = %err, "dropping websocket frame");
                return false;
            }
        };
        let workflow_instance_id = match self.resolution {
            Resolution::Registry => self.ingress.workflow_for_source(&frame.source_id).await,
            Resolution::Deferred => None,
        };
        match self.ingress.add_event(frame.into_event(workflow_instance_id)).await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "could not enqueue websocket event");
                false
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, acceptor: Option<TlsAcceptor>) {
        loop {
            let (stream, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                },
            };
            let this = self.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                match acceptor {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => this.serve_connection(tls_stream, peer).await,
                        Err(err) => warn!(%peer, error = %err, "TLS handshake failed"),
                    },
                    None => this.serve_connection(stream, peer).await,
                }
            });
        }
        info!("websocket server stopped");
    }

    async fn serve_connection<S>(self: Arc<Self>, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ws_stream = match accept_async(stream).await {
            Ok(ws_stream) => ws_stream,
            Err(err) => {
                warn!(%peer, error = %err, "websocket handshake failed");
                return;
            }
        };
        let (mut write, mut read) = ws_stream.split();
        let (tx_out, mut rx_out) = unbounded_channel();
        let connection = Uuid::new_v4();
        self.clients.insert(connection, tx_out);
        debug!(%peer, %connection, "client connected");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = write.send(WsMsg::Close(None)).await;
                    break;
                }
                inbound = read.next() => match inbound {
                    Some(Ok(WsMsg::Text(text))) => {
                        self.process_message(text.as_str()).await;
                    }
                    Some(Ok(WsMsg::Binary(bytes))) => match decode_utf8(&bytes) {
                        Ok(text) => {
                            self.process_message(text).await;
                        }
                        Err(err) => debug!(%peer, error = %err, "dropping binary frame"),
                    },
                    Some(Ok(WsMsg::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(%peer, error = %err, "connection closed abnormally");
                        break;
                    }
                },
                outbound = rx_out.recv() => match outbound {
                    Some(frame) => {
                        if let Err(err) = write.send(frame).await {
                            debug!(%peer, error = %err, "write failed");
                            break;
                        }
                    }
                    None => {
                        let _ = write.send(WsMsg::Close(None)).await;
                        break;
                    }
                },
            }
        }

        self.close_connection(connection);
        debug!(%peer, %connection, "client disconnected");
    }
}

#[async_trait]
impl Outbound for WsIngress {
    async fn send(&self, source_id: &SourceId, message: &str) -> Result<usize, IngressError> {
        Ok(WsIngress::send(self, source_id, message).await)
    }
}
