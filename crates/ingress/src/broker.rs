use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{
    Mutex,
    mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::IngressError,
    message::{InboundEvent, SourceId, StartEvent, WorkflowInstanceId},
    registry::SessionRegistry,
};

/// Queue/broker between the transport adapters and the workflows.
#[async_trait]
pub trait Ingress: Send + Sync {
    /// Enqueue a canonical event.
    async fn add_event(&self, event: InboundEvent) -> Result<(), IngressError>;

    /// Block until the next event that is not claimed by a running workflow.
    async fn get_start_event(&self, use_snapshots: bool) -> Result<StartEvent, IngressError>;

    /// Block until the next event routed to one running workflow.
    async fn get_workflow_event(
        &self,
        workflow_instance_id: WorkflowInstanceId,
    ) -> Result<InboundEvent, IngressError>;

    async fn register_source(&self, source_id: SourceId, workflow_instance_id: WorkflowInstanceId);

    async fn unregister_source(&self, source_id: &SourceId);

    async fn workflow_for_source(&self, source_id: &SourceId) -> Option<WorkflowInstanceId>;

    /// The workflow stopped consuming events. Anything still queued for it
    /// goes back to the start queue.
    async fn release_workflow(&self, workflow_instance_id: WorkflowInstanceId);
}

struct Mailbox {
    tx: UnboundedSender<InboundEvent>,
    rx: Mutex<UnboundedReceiver<InboundEvent>>,
}

impl Mailbox {
    fn new() -> Arc<Self> {
        let (tx, rx) = unbounded_channel();
        Arc::new(Self {
            tx,
            rx: Mutex::new(rx),
        })
    }
}

/// In-process ingress.
///
/// Events for an instance with an open mailbox are delivered to that
/// mailbox; every other event lands on the start queue, tagged with the
/// instance its source is linked to (if any).
pub struct MemoryIngress {
    registry: Arc<SessionRegistry>,
    start_tx: UnboundedSender<InboundEvent>,
    start_rx: Mutex<UnboundedReceiver<InboundEvent>>,
    mailboxes: DashMap<WorkflowInstanceId, Arc<Mailbox>>,
    shutdown: CancellationToken,
}

impl MemoryIngress {
    pub fn new() -> Arc<Self> {
        Self::with_registry(SessionRegistry::new())
    }

    pub fn with_registry(registry: Arc<SessionRegistry>) -> Arc<Self> {
        let (start_tx, start_rx) = unbounded_channel();
        Arc::new(Self {
            registry,
            start_tx,
            start_rx: Mutex::new(start_rx),
            mailboxes: DashMap::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Whether `workflow_instance_id` currently consumes its own events.
    pub fn is_live(&self, workflow_instance_id: WorkflowInstanceId) -> bool {
        self.mailboxes.contains_key(&workflow_instance_id)
    }

    /// Wake every blocked consumer with [`IngressError::Closed`].
    pub fn shutdown(&self) {
        info!("ingress shutting down");
        self.shutdown.cancel();
    }

    fn mailbox(&self, workflow_instance_id: WorkflowInstanceId) -> Arc<Mailbox> {
        self.mailboxes
            .entry(workflow_instance_id)
            .or_insert_with(Mailbox::new)
            .clone()
    }
}

#[async_trait]
impl Ingress for MemoryIngress {
    async fn add_event(&self, mut event: InboundEvent) -> Result<(), IngressError> {
        if self.shutdown.is_cancelled() {
            return Err(IngressError::Closed);
        }

        let resolved = event.workflow_instance_id.or_else(|| {
            event
                .source_id
                .as_ref()
                .and_then(|source_id| self.registry.lookup(source_id))
        });
        event.workflow_instance_id = resolved;

        if let Some(id) = resolved {
            // clone out of the map before sending, never hold the shard guard
            let mailbox = self.mailboxes.get(&id).map(|entry| entry.value().clone());
            if let Some(mailbox) = mailbox {
                debug!(workflow_instance_id = %id, "event routed to running workflow");
                return mailbox.tx.send(event).map_err(|_| IngressError::Closed);
            }
        }

        debug!(workflow_instance_id = ?resolved, "event queued for dispatch");
        self.start_tx.send(event).map_err(|_| IngressError::Closed)
    }

    async fn get_start_event(&self, use_snapshots: bool) -> Result<StartEvent, IngressError> {
        let mut rx = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(IngressError::Closed),
            guard = self.start_rx.lock() => guard,
        };
        let event = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(IngressError::Closed),
            event = rx.recv() => event.ok_or(IngressError::Closed)?,
        };
        let new_workflow_needed = !(use_snapshots && event.workflow_instance_id.is_some());
        Ok(StartEvent {
            event,
            new_workflow_needed,
        })
    }

    async fn get_workflow_event(
        &self,
        workflow_instance_id: WorkflowInstanceId,
    ) -> Result<InboundEvent, IngressError> {
        let mailbox = self.mailbox(workflow_instance_id);
        let mut rx = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(IngressError::Closed),
            guard = mailbox.rx.lock() => guard,
        };
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(IngressError::Closed),
            event = rx.recv() => event.ok_or(IngressError::Closed),
        }
    }

    async fn register_source(&self, source_id: SourceId, workflow_instance_id: WorkflowInstanceId) {
        self.registry.link(workflow_instance_id, source_id);
        self.mailbox(workflow_instance_id);
    }

    async fn unregister_source(&self, source_id: &SourceId) {
        self.registry.unlink(source_id);
    }

    async fn workflow_for_source(&self, source_id: &SourceId) -> Option<WorkflowInstanceId> {
        self.registry.lookup(source_id)
    }

    async fn release_workflow(&self, workflow_instance_id: WorkflowInstanceId) {
        let Some((_, mailbox)) = self.mailboxes.remove(&workflow_instance_id) else {
            return;
        };
        let Ok(mut rx) = mailbox.rx.try_lock() else {
            warn!(%workflow_instance_id, "mailbox released while still being read");
            return;
        };
        let mut requeued = 0usize;
        while let Ok(event) = rx.try_recv() {
            if self.start_tx.send(event).is_ok() {
                requeued += 1;
            }
        }
        if requeued > 0 {
            debug!(%workflow_instance_id, requeued, "pending events moved to the start queue");
        }
    }
}
