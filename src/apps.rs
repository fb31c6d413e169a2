use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Error};
use channel_webhook::{WebhookIngress, WebhookServer};
use channel_ws::{Resolution, WsIngress};
use ingress::MemoryIngress;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    config::RouterConfig,
    dispatch::{DispatchMode, Dispatcher, WorkflowRunner},
    hello_world::{BasicRunner, ChatRunner, ChatSnapshotRunner, GreetingResponder, Responder},
    workflow::MemoryEngine,
};

/// Which transport and workflow the router serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Demo {
    /// Webhook ingress, one `HelloWorldBasic` per request.
    Webhook,
    /// Websocket ingress, a long-lived `HelloWorldChat` per source.
    Websocket,
    /// Websocket ingress, `HelloWorldChatSnapshot` resumed turn by turn.
    WebsocketSnapshots,
}

pub struct App {
    ingress: Arc<MemoryIngress>,
    engine: Arc<MemoryEngine>,
    responder: Arc<dyn Responder>,
    webhook: Option<WebhookServer>,
    ws: Option<Arc<WsIngress>>,
    dispatch_task: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl App {
    pub fn new() -> Self {
        Self::with_responder(Arc::new(GreetingResponder))
    }

    pub fn with_responder(responder: Arc<dyn Responder>) -> Self {
        Self {
            ingress: MemoryIngress::new(),
            engine: MemoryEngine::new(),
            responder,
            webhook: None,
            ws: None,
            dispatch_task: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Start the transport for `demo` and the dispatch loop behind it.
    pub async fn bootstrap(&mut self, demo: Demo, config: &RouterConfig) -> Result<(), Error> {
        let max = config.ingress.max_concurrent_handlers;
        let responder = self.responder.clone();

        match demo {
            Demo::Webhook => {
                let server = WebhookIngress::start(config.webhook_config(), self.ingress.clone())
                    .await
                    .context("could not start the webhook server")?;
                self.webhook = Some(server);
                let dispatcher = Dispatcher::new(
                    BasicRunner::new(responder),
                    self.ingress.clone(),
                    self.engine.clone(),
                    DispatchMode::Stateless,
                    max,
                );
                self.spawn_dispatcher(dispatcher);
            }
            Demo::Websocket => {
                let ws = self.start_ws(config, Resolution::Registry).await?;
                let dispatcher = Dispatcher::new(
                    ChatRunner::new(responder),
                    self.ingress.clone(),
                    self.engine.clone(),
                    DispatchMode::Stateless,
                    max,
                )
                .with_outbound(ws);
                self.spawn_dispatcher(dispatcher);
            }
            Demo::WebsocketSnapshots => {
                let ws = self.start_ws(config, Resolution::Deferred).await?;
                let dispatcher = Dispatcher::new(
                    ChatSnapshotRunner::new(responder),
                    self.ingress.clone(),
                    self.engine.clone(),
                    DispatchMode::Snapshots,
                    max,
                )
                .with_outbound(ws);
                self.spawn_dispatcher(dispatcher);
            }
        }
        info!(?demo, "hello router started");
        Ok(())
    }

    async fn start_ws(
        &mut self,
        config: &RouterConfig,
        resolution: Resolution,
    ) -> Result<Arc<WsIngress>, Error> {
        let ws = WsIngress::start(config.ws_config(resolution), self.ingress.clone())
            .await
            .context("could not start the websocket server")?;
        self.ws = Some(ws.clone());
        Ok(ws)
    }

    fn spawn_dispatcher<R: WorkflowRunner>(&mut self, dispatcher: Dispatcher<R>) {
        let dispatcher = Arc::new(dispatcher);
        self.dispatch_task = Some(tokio::spawn(dispatcher.run()));
    }

    pub fn ingress(&self) -> Arc<MemoryIngress> {
        self.ingress.clone()
    }

    pub fn engine(&self) -> Arc<MemoryEngine> {
        self.engine.clone()
    }

    pub fn ws_addr(&self) -> Option<SocketAddr> {
        self.ws.as_ref().map(|ws| ws.local_addr())
    }

    pub fn webhook_addr(&self) -> Option<SocketAddr> {
        self.webhook.as_ref().map(|server| server.local_addr())
    }

    /// Cancelling this token makes [`App::wait`] return.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Block until Ctrl-C or the shutdown token.
    pub async fn wait(&self) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    error!(error = %err, "could not listen for Ctrl-C");
                }
                info!("Ctrl-C received");
            }
        }
    }

    /// Close the ingress, wait for the dispatch loop, stop the transports.
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        self.ingress.shutdown();
        if let Some(task) = self.dispatch_task.take() {
            if let Err(err) = task.await {
                error!(error = %err, "dispatch loop ended abnormally");
            }
        }
        if let Some(ws) = self.ws.take() {
            ws.stop();
        }
        if let Some(server) = self.webhook.take() {
            server.shutdown().await;
        }
        info!("hello router stopped");
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}
