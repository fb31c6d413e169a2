use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::message::{SourceId, WorkflowInstanceId};

/// Source → workflow instance links.
///
/// At most one instance per source. Every operation is a single map call and
/// never awaits, so handlers on different worker threads can link, unlink and
/// look up concurrently.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    links: DashMap<SourceId, WorkflowInstanceId>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Link `source_id` to `workflow_instance_id`. An existing link is
    /// replaced (last write wins); the previous instance is returned.
    pub fn link(
        &self,
        workflow_instance_id: WorkflowInstanceId,
        source_id: SourceId,
    ) -> Option<WorkflowInstanceId> {
        let previous = self.links.insert(source_id.clone(), workflow_instance_id);
        match previous {
            Some(old) if old != workflow_instance_id => {
                debug!(%source_id, %old, new = %workflow_instance_id, "source re-linked");
            }
            None => debug!(%source_id, %workflow_instance_id, "source linked"),
            _ => {}
        }
        previous
    }

    /// Remove the link of `source_id`. Absent links are not an error.
    pub fn unlink(&self, source_id: &SourceId) -> Option<WorkflowInstanceId> {
        let removed = self.links.remove(source_id).map(|(_, id)| id);
        if let Some(id) = removed {
            debug!(%source_id, workflow_instance_id = %id, "source unlinked");
        }
        removed
    }

    pub fn lookup(&self, source_id: &SourceId) -> Option<WorkflowInstanceId> {
        self.links.get(source_id).map(|entry| *entry.value())
    }

    /// All sources currently linked to `workflow_instance_id`.
    #[cfg(test)]
    fn sources_for(&self, workflow_instance_id: WorkflowInstanceId) -> Vec<SourceId> {
        self.links
            .iter()
            .filter(|entry| *entry.value() == workflow_instance_id)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}
