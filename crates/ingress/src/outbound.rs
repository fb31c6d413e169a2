use async_trait::async_trait;

use crate::{error::IngressError, message::SourceId};

/// Push side of a transport: replies to a source, failure notices.
#[async_trait]
pub trait Outbound: Send + Sync {
    /// Deliver `message` for `source_id`. Returns how many connections the
    /// message was queued for.
    async fn send(&self, source_id: &SourceId, message: &str) -> Result<usize, IngressError>;
}
