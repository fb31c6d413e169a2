use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use ingress::InboundEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{
    dispatch::{RunContext, RunOutcome, WorkflowRunner},
    hello_world::agent::{HelloWorldAgent, Message, Responder, date_variables},
    workflow::{ConsoleKind, WorkflowHandle},
};

/// The message that ends a chat session.
pub const END_MESSAGE: &str = "end";

/// Chat state shared by both chat workflows.
#[derive(Debug)]
pub struct ChatSession {
    agent: HelloWorldAgent,
}

impl ChatSession {
    fn new(responder: Arc<dyn Responder>) -> Self {
        let mut agent = HelloWorldAgent::new(responder);
        agent.substitute_variables(&date_variables());
        Self { agent }
    }

    pub fn agent(&self) -> &HelloWorldAgent {
        &self.agent
    }

    async fn respond(&mut self, ctx: &RunContext, input_message: &str, next_steps: Option<&str>) -> String {
        let response = self.agent.ask(input_message);
        let mut console = format!("Input message: {input_message}\nAgent responded with: {response}");
        if let Some(next_steps) = next_steps {
            console.push_str(&format!("\nNext steps: {next_steps}"));
        }
        ctx.handle
            .save_to_console(ConsoleKind::ObservableOutput, console)
            .await;
        response
    }
}

fn input_message(event: &InboundEvent) -> Option<&str> {
    event.message().filter(|message| !message.is_empty())
}

/// Long-lived chat: the handler stays on the workflow and reads follow-up
/// messages from its mailbox until `end`.
pub type HelloWorldChat = ChatSession;

pub struct ChatRunner {
    responder: Arc<dyn Responder>,
}

impl ChatRunner {
    pub fn new(responder: Arc<dyn Responder>) -> Self {
        Self { responder }
    }
}

#[async_trait]
impl WorkflowRunner for ChatRunner {
    type Workflow = HelloWorldChat;

    fn name(&self) -> &'static str {
        "hello_world_chat"
    }

    async fn create(&self, _handle: &WorkflowHandle) -> anyhow::Result<HelloWorldChat> {
        Ok(ChatSession::new(self.responder.clone()))
    }

    async fn run(
        &self,
        chat: &mut HelloWorldChat,
        ctx: &RunContext,
        event: &InboundEvent,
    ) -> anyhow::Result<RunOutcome> {
        let Some(first) = input_message(event) else {
            debug!("Event does not contain a message");
            return Ok(RunOutcome::Suspended);
        };
        let mut pending = Some(first.to_string());

        loop {
            let message = match pending.take() {
                Some(message) => message,
                None => {
                    let next = ctx
                        .next_event()
                        .await
                        .context("waiting for the next chat message")?;
                    match input_message(&next) {
                        Some(message) => message.to_string(),
                        None => {
                            debug!("skipping chat event without a message");
                            continue;
                        }
                    }
                }
            };
            if message == END_MESSAGE {
                return Ok(RunOutcome::Completed);
            }
            let response = chat.respond(ctx, &message, None).await;
            ctx.reply(&response).await?;
        }
    }
}

/// What a suspended snapshot chat keeps between turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSnapshot {
    pub thread: Vec<Message>,
}

/// Turn-based chat: one reply per dispatch, then the instance is saved and
/// the handler exits. The next message from the source resumes it.
pub type HelloWorldChatSnapshot = ChatSession;

pub struct ChatSnapshotRunner {
    responder: Arc<dyn Responder>,
}

impl ChatSnapshotRunner {
    pub fn new(responder: Arc<dyn Responder>) -> Self {
        Self { responder }
    }
}

#[async_trait]
impl WorkflowRunner for ChatSnapshotRunner {
    type Workflow = HelloWorldChatSnapshot;

    fn name(&self) -> &'static str {
        "hello_world_chat_snapshot"
    }

    async fn create(&self, _handle: &WorkflowHandle) -> anyhow::Result<HelloWorldChatSnapshot> {
        Ok(ChatSession::new(self.responder.clone()))
    }

    async fn resume(
        &self,
        handle: &WorkflowHandle,
        snapshot: Value,
    ) -> anyhow::Result<HelloWorldChatSnapshot> {
        let snapshot: ChatSnapshot = serde_json::from_value(snapshot)
            .with_context(|| format!("invalid chat snapshot for {}", handle.id()))?;
        Ok(ChatSession {
            agent: HelloWorldAgent::from_thread(snapshot.thread, self.responder.clone()),
        })
    }

    fn snapshot(&self, chat: &HelloWorldChatSnapshot) -> anyhow::Result<Value> {
        let snapshot = ChatSnapshot {
            thread: chat.agent.thread().to_vec(),
        };
        Ok(serde_json::to_value(snapshot)?)
    }

    async fn run(
        &self,
        chat: &mut HelloWorldChatSnapshot,
        ctx: &RunContext,
        event: &InboundEvent,
    ) -> anyhow::Result<RunOutcome> {
        let Some(message) = input_message(event) else {
            debug!("Event does not contain a message");
            return Ok(RunOutcome::Suspended);
        };
        if message == END_MESSAGE {
            return Ok(RunOutcome::Completed);
        }
        let response = chat
            .respond(ctx, message, Some("Wait for user input"))
            .await;
        ctx.reply(&response).await?;
        Ok(RunOutcome::Suspended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hello_world::agent::{GreetingResponder, SMILEY};

    #[test]
    fn chat_prompt_carries_the_date() {
        let mut session = ChatSession::new(Arc::new(GreetingResponder));
        let prompt = &session.agent().thread()[0].content;
        assert!(!prompt.contains("{todays_date}"));
        assert!(prompt.contains("Today's date is "));

        let reply = session.agent.ask("hi");
        assert_eq!(reply, "Hello world! You said: hi");
        assert!(!reply.starts_with(SMILEY));
    }
}
