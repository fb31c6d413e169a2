//! The seam to the workflow engine.
//!
//! Instance lifecycle, snapshots and the console belong to the engine; the
//! router only drives them through [`WorkflowEngine`]. [`MemoryEngine`] is
//! the in-process stand-in the demos and tests run against. It keeps
//! everything in memory and offers no durability.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ingress::WorkflowInstanceId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleKind {
    Output,
    ObservableOutput,
    Error,
}

/// One line in a workflow's console.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleEntry {
    pub kind: ConsoleKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ConsoleEntry {
    pub fn new(kind: ConsoleKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown workflow instance {0}")]
    UnknownInstance(WorkflowInstanceId),
    #[error("workflow instance {0} is already closed")]
    AlreadyClosed(WorkflowInstanceId),
    #[error("could not serialize snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),
}

#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    async fn create(&self) -> Result<WorkflowInstanceId, EngineError>;
    async fn close(
        &self,
        workflow_instance_id: WorkflowInstanceId,
        status: WorkflowStatus,
    ) -> Result<(), EngineError>;
    async fn save_snapshot(
        &self,
        workflow_instance_id: WorkflowInstanceId,
        state: Value,
    ) -> Result<(), EngineError>;
    /// `Ok(None)` when no snapshot exists for the instance.
    async fn load_snapshot(
        &self,
        workflow_instance_id: WorkflowInstanceId,
    ) -> Result<Option<Value>, EngineError>;
    async fn delete_snapshot(&self, workflow_instance_id: WorkflowInstanceId) -> Result<(), EngineError>;
    async fn console(&self, workflow_instance_id: WorkflowInstanceId, entry: ConsoleEntry);
}

/// What a running workflow sees of its engine instance.
#[derive(Clone)]
pub struct WorkflowHandle {
    id: WorkflowInstanceId,
    engine: Arc<dyn WorkflowEngine>,
}

impl WorkflowHandle {
    pub fn new(id: WorkflowInstanceId, engine: Arc<dyn WorkflowEngine>) -> Self {
        Self { id, engine }
    }

    pub fn id(&self) -> WorkflowInstanceId {
        self.id
    }

    pub async fn close(&self, status: WorkflowStatus) -> Result<(), EngineError> {
        self.engine.close(self.id, status).await
    }

    pub async fn save_snapshot<T: Serialize + Sync>(&self, state: &T) -> Result<(), EngineError> {
        let state = serde_json::to_value(state)?;
        self.engine.save_snapshot(self.id, state).await
    }

    pub async fn delete_snapshot(&self) -> Result<(), EngineError> {
        self.engine.delete_snapshot(self.id).await
    }

    pub async fn save_to_console(&self, kind: ConsoleKind, content: impl Into<String>) {
        self.engine.console(self.id, ConsoleEntry::new(kind, content)).await;
    }
}

impl fmt::Debug for WorkflowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowHandle").field("id", &self.id).finish()
    }
}

#[derive(Debug, Default)]
pub struct MemoryEngine {
    instances: DashMap<WorkflowInstanceId, WorkflowStatus>,
    snapshots: DashMap<WorkflowInstanceId, Value>,
    consoles: DashMap<WorkflowInstanceId, Vec<ConsoleEntry>>,
}

impl MemoryEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn status(&self, workflow_instance_id: WorkflowInstanceId) -> Option<WorkflowStatus> {
        self.instances.get(&workflow_instance_id).map(|entry| *entry.value())
    }

    pub fn snapshot(&self, workflow_instance_id: WorkflowInstanceId) -> Option<Value> {
        self.snapshots
            .get(&workflow_instance_id)
            .map(|entry| entry.value().clone())
    }

    pub fn console_entries(&self, workflow_instance_id: WorkflowInstanceId) -> Vec<ConsoleEntry> {
        self.consoles
            .get(&workflow_instance_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn instance_ids(&self) -> Vec<WorkflowInstanceId> {
        self.instances.iter().map(|entry| *entry.key()).collect()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn count_with_status(&self, status: WorkflowStatus) -> usize {
        self.instances
            .iter()
            .filter(|entry| *entry.value() == status)
            .count()
    }
}

#[async_trait]
impl WorkflowEngine for MemoryEngine {
    async fn create(&self) -> Result<WorkflowInstanceId, EngineError> {
        let id = Uuid::new_v4();
        self.instances.insert(id, WorkflowStatus::Running);
        info!(workflow_instance_id = %id, "workflow instance created");
        Ok(id)
    }

    async fn close(
        &self,
        workflow_instance_id: WorkflowInstanceId,
        status: WorkflowStatus,
    ) -> Result<(), EngineError> {
        let mut entry = self
            .instances
            .get_mut(&workflow_instance_id)
            .ok_or(EngineError::UnknownInstance(workflow_instance_id))?;
        if *entry.value() != WorkflowStatus::Running {
            return Err(EngineError::AlreadyClosed(workflow_instance_id));
        }
        *entry.value_mut() = status;
        info!(%workflow_instance_id, status = status.as_str(), "workflow instance closed");
        Ok(())
    }

    async fn save_snapshot(
        &self,
        workflow_instance_id: WorkflowInstanceId,
        state: Value,
    ) -> Result<(), EngineError> {
        if !self.instances.contains_key(&workflow_instance_id) {
            return Err(EngineError::UnknownInstance(workflow_instance_id));
        }
        self.snapshots.insert(workflow_instance_id, state);
        debug!(%workflow_instance_id, "snapshot saved");
        Ok(())
    }

    async fn load_snapshot(
        &self,
        workflow_instance_id: WorkflowInstanceId,
    ) -> Result<Option<Value>, EngineError> {
        Ok(self.snapshot(workflow_instance_id))
    }

    async fn delete_snapshot(&self, workflow_instance_id: WorkflowInstanceId) -> Result<(), EngineError> {
        self.snapshots.remove(&workflow_instance_id);
        Ok(())
    }

    async fn console(&self, workflow_instance_id: WorkflowInstanceId, entry: ConsoleEntry) {
        match entry.kind {
            ConsoleKind::Error => error!(%workflow_instance_id, "{}", entry.content),
            _ => info!(%workflow_instance_id, kind = ?entry.kind, "{}", entry.content),
        }
        self.consoles.entry(workflow_instance_id).or_default().push(entry);
    }
}
