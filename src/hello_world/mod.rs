//! The hello-world demo workflows.

pub mod agent;
pub mod basic;
pub mod chat;

pub use agent::{GreetingResponder, HelloWorldAgent, Responder};
pub use basic::{BasicRunner, HelloWorldBasic};
pub use chat::{ChatRunner, ChatSnapshotRunner, HelloWorldChat, HelloWorldChatSnapshot};
