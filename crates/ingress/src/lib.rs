//! Canonical inbound events, the source → workflow session registry and the
//! in-process ingress broker shared by the channel adapters and the
//! dispatch loop.

pub mod broker;
pub mod error;
pub mod message;
pub mod outbound;
pub mod registry;

pub use broker::{Ingress, MemoryIngress};
pub use error::IngressError;
pub use message::{Envelope, InboundEvent, SourceId, StartEvent, WorkflowInstanceId};
pub use outbound::Outbound;
pub use registry::SessionRegistry;
