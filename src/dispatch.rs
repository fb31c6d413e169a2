//! The dispatch loop: pulls start events off the ingress and runs one
//! handler task per event, creating or resuming the workflow instance the
//! event belongs to.

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Instant};

use anyhow::{Context, bail};
use async_trait::async_trait;
use futures_util::FutureExt;
use ingress::{
    InboundEvent, Ingress, IngressError, Outbound, SourceId, StartEvent, WorkflowInstanceId,
};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::workflow::{ConsoleKind, WorkflowEngine, WorkflowHandle, WorkflowStatus};

/// Sent to the source when its workflow fails.
pub const FAILURE_MESSAGE: &str =
    "An error occurred while running the workflow. Please try again later.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Every start event gets a fresh workflow instance.
    Stateless,
    /// Start events for a linked source resume the instance from its snapshot.
    Snapshots,
}

impl DispatchMode {
    pub fn use_snapshots(&self) -> bool {
        matches!(self, DispatchMode::Snapshots)
    }
}

/// How a workflow run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// Nothing more to do for now. In snapshot mode the instance is saved and
    /// resumed by the next event of its source.
    Suspended,
}

/// Final state of one handled start event, as reported on the `dispatch`
/// log target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerStatus {
    Completed,
    Suspended,
    Failed,
    Dropped,
}

impl HandlerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerStatus::Completed => "completed",
            HandlerStatus::Suspended => "suspended",
            HandlerStatus::Failed => "failed",
            HandlerStatus::Dropped => "dropped",
        }
    }
}

/// Everything a running workflow can reach.
pub struct RunContext {
    pub handle: WorkflowHandle,
    pub source_id: Option<SourceId>,
    ingress: Arc<dyn Ingress>,
    outbound: Option<Arc<dyn Outbound>>,
}

impl RunContext {
    pub fn workflow_instance_id(&self) -> WorkflowInstanceId {
        self.handle.id()
    }

    /// Wait for the next event routed to this workflow instance.
    pub async fn next_event(&self) -> Result<InboundEvent, IngressError> {
        self.ingress.get_workflow_event(self.handle.id()).await
    }

    /// Push a message back to the event's source.
    pub async fn reply(&self, message: &str) -> anyhow::Result<()> {
        match (&self.outbound, &self.source_id) {
            (Some(outbound), Some(source_id)) => {
                outbound
                    .send(source_id, message)
                    .await
                    .with_context(|| format!("could not reply to source {source_id}"))?;
            }
            _ => debug!(workflow_instance_id = %self.handle.id(), "no outbound channel, reply dropped"),
        }
        Ok(())
    }
}

/// Creates, resumes and runs one kind of workflow.
#[async_trait]
pub trait WorkflowRunner: Send + Sync + 'static {
    type Workflow: Send + 'static;

    fn name(&self) -> &'static str;

    async fn create(&self, handle: &WorkflowHandle) -> anyhow::Result<Self::Workflow>;

    async fn resume(&self, handle: &WorkflowHandle, snapshot: Value) -> anyhow::Result<Self::Workflow> {
        let _ = snapshot;
        bail!("{} cannot resume instance {} from a snapshot", self.name(), handle.id())
    }

    /// State saved when a run is suspended in snapshot mode.
    fn snapshot(&self, workflow: &Self::Workflow) -> anyhow::Result<Value> {
        let _ = workflow;
        Ok(Value::Null)
    }

    async fn run(
        &self,
        workflow: &mut Self::Workflow,
        ctx: &RunContext,
        event: &InboundEvent,
    ) -> anyhow::Result<RunOutcome>;
}

pub struct Dispatcher<R: WorkflowRunner> {
    runner: R,
    ingress: Arc<dyn Ingress>,
    engine: Arc<dyn WorkflowEngine>,
    outbound: Option<Arc<dyn Outbound>>,
    mode: DispatchMode,
    permits: Arc<Semaphore>,
}

impl<R: WorkflowRunner> Dispatcher<R> {
    pub fn new(
        runner: R,
        ingress: Arc<dyn Ingress>,
        engine: Arc<dyn WorkflowEngine>,
        mode: DispatchMode,
        max_concurrent_handlers: usize,
    ) -> Self {
        Self {
            runner,
            ingress,
            engine,
            outbound: None,
            mode,
            permits: Arc::new(Semaphore::new(max_concurrent_handlers.max(1))),
        }
    }

    /// Where replies and failure notices go.
    pub fn with_outbound(mut self, outbound: Arc<dyn Outbound>) -> Self {
        self.outbound = Some(outbound);
        self
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Handlers that could start right now without waiting.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run until the ingress closes. Handlers already spawned keep running.
    pub async fn run(self: Arc<Self>) {
        info!(
            workflow = self.runner.name(),
            mode = ?self.mode,
            "dispatch loop started"
        );
        loop {
            // take the permit first so a saturated loop leaves events queued
            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let start = match self.ingress.get_start_event(self.mode.use_snapshots()).await {
                Ok(start) => start,
                Err(IngressError::Closed) => break,
                Err(err) => {
                    warn!(error = %err, "could not take the next start event");
                    continue;
                }
            };
            let this = self.clone();
            tokio::spawn(async move {
                this.handle_event(start).await;
                drop(permit);
            });
        }
        info!(workflow = self.runner.name(), "dispatch loop stopped");
    }

    /// Handle one start event to the end. Never panics and never returns an
    /// error; the outcome is logged and returned.
    pub async fn handle_event(&self, start: StartEvent) -> HandlerStatus {
        let started = Instant::now();
        let source_id = start.event.source_id.clone();
        let (status, workflow_instance_id) = self.dispatch(start).await;

        let latency_ms = started.elapsed().as_secs_f64() * 1_000.0;
        let workflow_instance_id = workflow_instance_id
            .map(|id| id.to_string())
            .unwrap_or_default();
        tracing::event!(
            target: "dispatch",
            tracing::Level::INFO,
            workflow = self.runner.name(),
            workflow_instance_id = workflow_instance_id.as_str(),
            source_id = source_id.as_ref().map(SourceId::as_str).unwrap_or_default(),
            status = status.as_str(),
            latency_ms,
        );
        status
    }

    async fn dispatch(&self, start: StartEvent) -> (HandlerStatus, Option<WorkflowInstanceId>) {
        let StartEvent {
            event,
            new_workflow_needed,
        } = start;

        let opened = if new_workflow_needed || !self.mode.use_snapshots() {
            self.open_new(&event).await
        } else {
            match event.workflow_instance_id {
                Some(id) => self.open_existing(&event, id).await,
                None => {
                    error!("resume requested for an event without a workflow instance");
                    return (HandlerStatus::Dropped, None);
                }
            }
        };
        let (ctx, snapshot) = match opened {
            Opened::Fresh(ctx) => (ctx, None),
            Opened::Resumed(ctx, snapshot) => (ctx, Some(snapshot)),
            Opened::Dropped(id) => return (HandlerStatus::Dropped, id),
        };

        // from here on every runner call is contained
        let id = ctx.workflow_instance_id();
        let result = AssertUnwindSafe(self.drive(&ctx, snapshot, &event))
            .catch_unwind()
            .await;
        let status = match result {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => {
                self.fail(&ctx, &format!("{err:#}")).await;
                HandlerStatus::Failed
            }
            Err(panic) => {
                self.fail(&ctx, &panic_message(panic.as_ref())).await;
                HandlerStatus::Failed
            }
        };

        self.ingress.release_workflow(id).await;
        (status, Some(id))
    }

    /// Build or restore the workflow, run it and settle the outcome.
    async fn drive(
        &self,
        ctx: &RunContext,
        snapshot: Option<Value>,
        event: &InboundEvent,
    ) -> anyhow::Result<HandlerStatus> {
        let mut workflow = match snapshot {
            None => self.runner.create(&ctx.handle).await?,
            Some(snapshot) => self.runner.resume(&ctx.handle, snapshot).await?,
        };
        let outcome = self.runner.run(&mut workflow, ctx, event).await?;
        match outcome {
            RunOutcome::Completed => Ok(self.complete(ctx).await),
            RunOutcome::Suspended if !self.mode.use_snapshots() => {
                // nothing can resume it
                Ok(self.complete(ctx).await)
            }
            RunOutcome::Suspended => {
                // no borrow of the workflow lives across the save
                let state = self.runner.snapshot(&workflow)?;
                ctx.handle
                    .save_snapshot(&state)
                    .await
                    .context("could not save snapshot")?;
                debug!(workflow_instance_id = %ctx.handle.id(), "workflow suspended");
                Ok(HandlerStatus::Suspended)
            }
        }
    }

    async fn open_new(&self, event: &InboundEvent) -> Opened {
        let id = match self.engine.create().await {
            Ok(id) => id,
            Err(err) => {
                error!(error = %err, "could not create a workflow instance");
                return Opened::Dropped(None);
            }
        };
        info!(workflow = self.runner.name(), workflow_instance_id = %id, "starting new workflow instance");
        if let Some(source_id) = &event.source_id {
            self.ingress.register_source(source_id.clone(), id).await;
        }
        Opened::Fresh(self.context(id, event))
    }

    async fn open_existing(&self, event: &InboundEvent, id: WorkflowInstanceId) -> Opened {
        let snapshot = match self.engine.load_snapshot(id).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                error!(workflow_instance_id = %id, "workflow instance not found, event dropped");
                return Opened::Dropped(Some(id));
            }
            Err(err) => {
                error!(workflow_instance_id = %id, error = %err, "could not load snapshot, event dropped");
                return Opened::Dropped(Some(id));
            }
        };
        info!(workflow = self.runner.name(), workflow_instance_id = %id, "resuming workflow instance");
        // reopens the mailbox so follow-up events reach this handler
        if let Some(source_id) = &event.source_id {
            self.ingress.register_source(source_id.clone(), id).await;
        }
        Opened::Resumed(self.context(id, event), snapshot)
    }

    fn context(&self, id: WorkflowInstanceId, event: &InboundEvent) -> RunContext {
        RunContext {
            handle: WorkflowHandle::new(id, self.engine.clone()),
            source_id: event.source_id.clone(),
            ingress: self.ingress.clone(),
            outbound: self.outbound.clone(),
        }
    }

    async fn complete(&self, ctx: &RunContext) -> HandlerStatus {
        if let Err(err) = ctx.handle.close(WorkflowStatus::Completed).await {
            warn!(workflow_instance_id = %ctx.handle.id(), error = %err, "could not close workflow");
        }
        if self.mode.use_snapshots() {
            if let Err(err) = ctx.handle.delete_snapshot().await {
                warn!(workflow_instance_id = %ctx.handle.id(), error = %err, "could not delete snapshot");
            }
        }
        self.unlink_if_owned(ctx).await;
        HandlerStatus::Completed
    }

    async fn fail(&self, ctx: &RunContext, reason: &str) {
        let id = ctx.handle.id();
        error!(workflow = self.runner.name(), workflow_instance_id = %id, "workflow failed: {reason}");

        if let Err(err) = ctx.reply(FAILURE_MESSAGE).await {
            warn!(workflow_instance_id = %id, error = %err, "could not deliver failure notice");
        }
        ctx.handle.save_to_console(ConsoleKind::Error, reason).await;
        if let Err(err) = ctx.handle.close(WorkflowStatus::Failed).await {
            warn!(workflow_instance_id = %id, error = %err, "could not close failed workflow");
        }
        self.unlink_if_owned(ctx).await;
    }

    /// A newer instance may have taken over the source meanwhile.
    async fn unlink_if_owned(&self, ctx: &RunContext) {
        let Some(source_id) = &ctx.source_id else {
            return;
        };
        if self.ingress.workflow_for_source(source_id).await == Some(ctx.handle.id()) {
            self.ingress.unregister_source(source_id).await;
        }
    }
}

enum Opened {
    Fresh(RunContext),
    Resumed(RunContext, Value),
    Dropped(Option<WorkflowInstanceId>),
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("workflow panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("workflow panicked: {message}")
    } else {
        "workflow panicked".to_string()
    }
}
