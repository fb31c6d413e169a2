//! HTTP webhook ingress. `POST <endpoint>` with a JSON body carrying
//! `source_id` enqueues one event and answers `200` right away.

use std::{net::SocketAddr, sync::Arc};

use axum::{Router, body::Bytes, extract::State, http::StatusCode, routing::post};
use ingress::{
    InboundEvent, Ingress, IngressError, SourceId, WorkflowInstanceId,
    message::{decode_utf8, parse_object, require_source_id},
};
use serde_json::Value;
use thiserror::Error;
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("could not bind webhook server on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("webhook endpoint `{0}` must start with `/`")]
    InvalidEndpoint(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub host: String,
    pub port: u16,
    pub endpoint: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            endpoint: "/start".to_string(),
        }
    }
}

/// A validated webhook body. `data` keeps every field of the request.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookBody {
    pub source_id: SourceId,
    pub data: Value,
}

impl WebhookBody {
    pub fn parse(body: &[u8]) -> Result<Self, IngressError> {
        let map = parse_object(decode_utf8(body)?)?;
        let source_id = require_source_id(&map)?;
        Ok(Self {
            source_id,
            data: Value::Object(map),
        })
    }
}

pub struct WebhookIngress {
    ingress: Arc<dyn Ingress>,
}

impl WebhookIngress {
    pub fn new(ingress: Arc<dyn Ingress>) -> Arc<Self> {
        Arc::new(Self { ingress })
    }

    /// Validate, resolve the linked workflow and enqueue.
    pub async fn process_webhook(&self, body: &[u8]) -> Result<(), IngressError> {
        let body = WebhookBody::parse(body)?;
        let workflow_instance_id = self.ingress.workflow_for_source(&body.source_id).await;
        let event = InboundEvent::new(Some(body.source_id), workflow_instance_id, body.data);
        self.ingress.add_event(event).await
    }

    pub async fn link(&self, workflow_instance_id: WorkflowInstanceId, source_id: SourceId) {
        self.ingress.register_source(source_id, workflow_instance_id).await;
    }

    pub async fn unlink(&self, source_id: &SourceId) {
        self.ingress.unregister_source(source_id).await;
    }

    pub fn router(self: Arc<Self>, endpoint: &str) -> Router {
        Router::new()
            .route(endpoint, post(webhook_listener))
            .with_state(self)
            .layer(TraceLayer::new_for_http())
    }

    /// Bind and serve in the background until [`WebhookServer::stop`].
    pub async fn start(
        config: WebhookConfig,
        ingress: Arc<dyn Ingress>,
    ) -> Result<WebhookServer, WebhookError> {
        if !config.endpoint.starts_with('/') {
            return Err(WebhookError::InvalidEndpoint(config.endpoint));
        }
        let webhook = WebhookIngress::new(ingress);
        let app = webhook.clone().router(&config.endpoint);

        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| WebhookError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        info!("Started webhook server on http://{}{}", local_addr, config.endpoint);

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(err) = result {
                error!(error = %err, "webhook server failed");
            }
        });

        Ok(WebhookServer {
            webhook,
            local_addr,
            shutdown,
            task,
        })
    }
}

/// Handle on a running webhook listener.
pub struct WebhookServer {
    webhook: Arc<WebhookIngress>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl WebhookServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn webhook(&self) -> Arc<WebhookIngress> {
        self.webhook.clone()
    }

    pub fn stop(&self) {
        info!("webhook server stopping");
        self.shutdown.cancel();
    }

    /// Stop and wait for in-flight requests to finish.
    pub async fn shutdown(self) {
        self.stop();
        let _ = self.task.await;
    }
}

async fn webhook_listener(State(webhook): State<Arc<WebhookIngress>>, body: Bytes) -> StatusCode {
    match webhook.process_webhook(&body).await {
        Ok(()) => StatusCode::OK,
        Err(err) if err.is_malformed() => {
            debug!(error = %err, "dropping webhook body");
            StatusCode::BAD_REQUEST
        }
        Err(err) => {
            warn!(error = %err, "webhook received while the ingress is closed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
