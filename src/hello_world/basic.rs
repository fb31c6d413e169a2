use std::sync::Arc;

use async_trait::async_trait;
use ingress::InboundEvent;
use tracing::info;

use crate::{
    dispatch::{RunContext, RunOutcome, WorkflowRunner},
    hello_world::agent::{HelloWorldAgent, Responder, date_variables},
    workflow::{ConsoleKind, WorkflowHandle},
};

/// One-shot workflow started by a webhook: walks the agent through a direct
/// answer and an action, records both and completes.
#[derive(Debug)]
pub struct HelloWorldBasic {
    agent: HelloWorldAgent,
}

impl HelloWorldBasic {
    pub fn new(responder: Arc<dyn Responder>) -> Self {
        let mut agent = HelloWorldAgent::new(responder);
        agent.set_important_information();
        agent.substitute_variables(&date_variables());
        Self { agent }
    }

    pub fn agent(&self) -> &HelloWorldAgent {
        &self.agent
    }

    async fn direct_agent_action(&mut self, ctx: &RunContext) -> String {
        let response = self.agent.print_hello_world_response();
        info!("Direct agent action: {response}");
        ctx.handle
            .save_to_console(
                ConsoleKind::ObservableOutput,
                format!("Direct agent action was used with response: {response}"),
            )
            .await;
        response
    }

    async fn agent_taking_actions(&mut self, ctx: &RunContext) {
        let (response, action_result) = self.agent.respond_with_actions();
        info!("Response: {response}");
        info!("Using actions: {action_result}");
        ctx.handle
            .save_to_console(
                ConsoleKind::ObservableOutput,
                format!("The action result is: {action_result}"),
            )
            .await;
    }
}

pub struct BasicRunner {
    responder: Arc<dyn Responder>,
}

impl BasicRunner {
    pub fn new(responder: Arc<dyn Responder>) -> Self {
        Self { responder }
    }
}

#[async_trait]
impl WorkflowRunner for BasicRunner {
    type Workflow = HelloWorldBasic;

    fn name(&self) -> &'static str {
        "hello_world_basic"
    }

    async fn create(&self, _handle: &WorkflowHandle) -> anyhow::Result<HelloWorldBasic> {
        Ok(HelloWorldBasic::new(self.responder.clone()))
    }

    async fn run(
        &self,
        workflow: &mut HelloWorldBasic,
        ctx: &RunContext,
        event: &InboundEvent,
    ) -> anyhow::Result<RunOutcome> {
        info!(
            workflow_instance_id = %ctx.workflow_instance_id(),
            source_id = ?event.source_id,
            "hello world started"
        );
        workflow.direct_agent_action(ctx).await;
        workflow.agent_taking_actions(ctx).await;

        ctx.handle
            .save_to_console(
                ConsoleKind::Output,
                "Successfully completed the hello world examples!",
            )
            .await;
        Ok(RunOutcome::Completed)
    }
}
