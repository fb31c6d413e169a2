use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use hello_router::{
    dispatch::{
        DispatchMode, Dispatcher, FAILURE_MESSAGE, HandlerStatus, RunContext, RunOutcome,
        WorkflowRunner,
    },
    hello_world::{ChatRunner, ChatSnapshotRunner, GreetingResponder},
    workflow::{ConsoleKind, MemoryEngine, WorkflowEngine, WorkflowHandle, WorkflowStatus},
};
use ingress::{
    InboundEvent, Ingress, IngressError, MemoryIngress, Outbound, SourceId, StartEvent,
};
use serde_json::json;
use uuid::Uuid;

#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<(SourceId, String)>>,
}

impl Recorder {
    fn messages(&self) -> Vec<(SourceId, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Outbound for Recorder {
    async fn send(&self, source_id: &SourceId, message: &str) -> Result<usize, IngressError> {
        self.sent
            .lock()
            .unwrap()
            .push((source_id.clone(), message.to_string()));
        Ok(1)
    }
}

#[derive(Clone, Copy)]
enum Behavior {
    Complete,
    Suspend,
    Fail,
    Panic,
    PanicOnCreate,
    PanicOnResume,
    FailOnResume,
    Sleep(Duration),
}

struct ScriptedRunner {
    behavior: Behavior,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ScriptedRunner {
    fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl WorkflowRunner for ScriptedRunner {
    type Workflow = ();

    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn create(&self, _handle: &WorkflowHandle) -> anyhow::Result<()> {
        if let Behavior::PanicOnCreate = self.behavior {
            panic!("could not build workflow");
        }
        Ok(())
    }

    async fn resume(&self, _handle: &WorkflowHandle, _snapshot: serde_json::Value) -> anyhow::Result<()> {
        match self.behavior {
            Behavior::PanicOnResume => panic!("corrupt snapshot"),
            Behavior::FailOnResume => anyhow::bail!("snapshot has an unknown version"),
            _ => Ok(()),
        }
    }

    async fn run(
        &self,
        _workflow: &mut (),
        _ctx: &RunContext,
        _event: &InboundEvent,
    ) -> anyhow::Result<RunOutcome> {
        match self.behavior {
            Behavior::Complete
            | Behavior::PanicOnCreate
            | Behavior::PanicOnResume
            | Behavior::FailOnResume => Ok(RunOutcome::Completed),
            Behavior::Suspend => Ok(RunOutcome::Suspended),
            Behavior::Fail => anyhow::bail!("tool call failed"),
            Behavior::Panic => panic!("workflow blew up"),
            Behavior::Sleep(duration) => {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(duration).await;
                self.active.fetch_sub(1, Ordering::SeqCst);
                Ok(RunOutcome::Completed)
            }
        }
    }
}

struct Harness {
    ingress: Arc<MemoryIngress>,
    engine: Arc<MemoryEngine>,
    outbound: Arc<Recorder>,
}

impl Harness {
    fn new() -> Self {
        Self {
            ingress: MemoryIngress::new(),
            engine: MemoryEngine::new(),
            outbound: Arc::new(Recorder::default()),
        }
    }

    fn dispatcher<R: WorkflowRunner>(&self, runner: R, mode: DispatchMode, max: usize) -> Dispatcher<R> {
        Dispatcher::new(runner, self.ingress.clone(), self.engine.clone(), mode, max)
            .with_outbound(self.outbound.clone())
    }

    async fn send(&self, source: &str, message: &str) {
        self.ingress
            .add_event(chat_event(source, message))
            .await
            .unwrap();
    }
}

fn chat_event(source: &str, message: &str) -> InboundEvent {
    InboundEvent::new(Some(SourceId::from(source)), None, json!({ "message": message }))
}

fn start(event: InboundEvent, new_workflow_needed: bool) -> StartEvent {
    StartEvent {
        event,
        new_workflow_needed,
    }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn stateless_event_runs_a_fresh_workflow_to_completion() {
    let h = Harness::new();
    let dispatcher = h.dispatcher(ScriptedRunner::new(Behavior::Complete), DispatchMode::Stateless, 4);

    let status = dispatcher.handle_event(start(chat_event("abc", "hi"), true)).await;

    assert_eq!(status, HandlerStatus::Completed);
    assert_eq!(h.engine.instance_count(), 1);
    assert_eq!(h.engine.count_with_status(WorkflowStatus::Completed), 1);
    assert_eq!(h.ingress.workflow_for_source(&SourceId::from("abc")).await, None);
    assert!(h.outbound.messages().is_empty());
}

#[tokio::test]
async fn failing_workflow_is_contained_and_the_source_notified() {
    let h = Harness::new();
    let dispatcher = h.dispatcher(ScriptedRunner::new(Behavior::Fail), DispatchMode::Stateless, 4);

    let status = dispatcher.handle_event(start(chat_event("c1", "hi"), true)).await;

    assert_eq!(status, HandlerStatus::Failed);
    let id = h.engine.instance_ids()[0];
    assert_eq!(h.engine.status(id), Some(WorkflowStatus::Failed));
    assert_eq!(
        h.outbound.messages(),
        vec![(SourceId::from("c1"), FAILURE_MESSAGE.to_string())]
    );
    let console = h.engine.console_entries(id);
    assert!(console
        .iter()
        .any(|entry| entry.kind == ConsoleKind::Error && entry.content.contains("tool call failed")));
    assert_eq!(h.ingress.workflow_for_source(&SourceId::from("c1")).await, None);
}

#[tokio::test]
async fn panicking_workflow_is_handled_like_a_failure() {
    let h = Harness::new();
    let dispatcher = h.dispatcher(ScriptedRunner::new(Behavior::Panic), DispatchMode::Stateless, 4);

    let status = dispatcher.handle_event(start(chat_event("c1", "hi"), true)).await;

    assert_eq!(status, HandlerStatus::Failed);
    assert_eq!(h.engine.count_with_status(WorkflowStatus::Failed), 1);
    assert_eq!(h.outbound.messages().len(), 1);
    assert_eq!(h.ingress.workflow_for_source(&SourceId::from("c1")).await, None);
}

#[tokio::test]
async fn panic_while_creating_is_contained_by_the_loop() {
    let h = Harness::new();
    let dispatcher = Arc::new(h.dispatcher(
        ScriptedRunner::new(Behavior::PanicOnCreate),
        DispatchMode::Stateless,
        4,
    ));
    let loop_task = tokio::spawn(dispatcher.clone().run());

    h.send("c1", "hi").await;
    wait_until("failure", || h.engine.count_with_status(WorkflowStatus::Failed) == 1).await;
    let id = h.engine.instance_ids()[0];
    wait_until("unlink", || h.ingress.registry().lookup(&SourceId::from("c1")).is_none()).await;
    wait_until("mailbox release", || !h.ingress.is_live(id)).await;
    assert_eq!(
        h.outbound.messages(),
        vec![(SourceId::from("c1"), FAILURE_MESSAGE.to_string())]
    );
    assert!(h
        .engine
        .console_entries(id)
        .iter()
        .any(|entry| entry.kind == ConsoleKind::Error && entry.content.contains("could not build workflow")));

    h.ingress.shutdown();
    loop_task.await.unwrap();
}

/// A suspended instance of `c1` with a stored snapshot.
async fn suspended_instance(h: &Harness) -> Uuid {
    let id = h.engine.create().await.unwrap();
    h.engine.save_snapshot(id, json!({"thread": []})).await.unwrap();
    h.ingress.register_source(SourceId::from("c1"), id).await;
    h.ingress.release_workflow(id).await;
    id
}

#[tokio::test]
async fn panic_while_resuming_fails_the_instance() {
    let h = Harness::new();
    let dispatcher = h.dispatcher(ScriptedRunner::new(Behavior::PanicOnResume), DispatchMode::Snapshots, 4);
    let id = suspended_instance(&h).await;

    let event = InboundEvent::new(Some(SourceId::from("c1")), Some(id), json!({"message": "again"}));
    let status = dispatcher.handle_event(start(event, false)).await;

    assert_eq!(status, HandlerStatus::Failed);
    assert_eq!(h.engine.status(id), Some(WorkflowStatus::Failed));
    assert_eq!(h.outbound.messages().len(), 1);
    assert_eq!(h.ingress.workflow_for_source(&SourceId::from("c1")).await, None);
    assert!(!h.ingress.is_live(id));
}

#[tokio::test]
async fn resume_error_fails_the_instance() {
    let h = Harness::new();
    let dispatcher = h.dispatcher(ScriptedRunner::new(Behavior::FailOnResume), DispatchMode::Snapshots, 4);
    let id = suspended_instance(&h).await;

    let event = InboundEvent::new(Some(SourceId::from("c1")), Some(id), json!({"message": "again"}));
    let status = dispatcher.handle_event(start(event, false)).await;

    assert_eq!(status, HandlerStatus::Failed);
    assert_eq!(h.engine.status(id), Some(WorkflowStatus::Failed));
    assert!(h
        .engine
        .console_entries(id)
        .iter()
        .any(|entry| entry.content.contains("unknown version")));
    assert_eq!(
        h.outbound.messages(),
        vec![(SourceId::from("c1"), FAILURE_MESSAGE.to_string())]
    );
    assert_eq!(h.ingress.workflow_for_source(&SourceId::from("c1")).await, None);
    assert!(!h.ingress.is_live(id));
}

#[tokio::test]
async fn resume_with_unknown_instance_is_dropped() {
    let h = Harness::new();
    let dispatcher = h.dispatcher(ScriptedRunner::new(Behavior::Complete), DispatchMode::Snapshots, 4);

    let ghost = Uuid::new_v4();
    let event = InboundEvent::new(Some(SourceId::from("c1")), Some(ghost), json!({"message": "hi"}));
    let status = dispatcher.handle_event(start(event, false)).await;

    assert_eq!(status, HandlerStatus::Dropped);
    assert_eq!(h.engine.instance_count(), 0);
    assert!(h.outbound.messages().is_empty());

    // without any instance id at all
    let status = dispatcher.handle_event(start(chat_event("c1", "hi"), false)).await;
    assert_eq!(status, HandlerStatus::Dropped);
    assert_eq!(h.engine.instance_count(), 0);
}

#[tokio::test]
async fn suspension_without_snapshots_completes() {
    let h = Harness::new();
    let dispatcher = h.dispatcher(ScriptedRunner::new(Behavior::Suspend), DispatchMode::Stateless, 4);

    let status = dispatcher.handle_event(start(chat_event("c1", ""), true)).await;

    assert_eq!(status, HandlerStatus::Completed);
    assert_eq!(h.engine.count_with_status(WorkflowStatus::Completed), 1);
    assert_eq!(h.ingress.workflow_for_source(&SourceId::from("c1")).await, None);
}

#[tokio::test]
async fn suspension_with_snapshots_keeps_link_and_snapshot() {
    let h = Harness::new();
    let dispatcher = h.dispatcher(ScriptedRunner::new(Behavior::Suspend), DispatchMode::Snapshots, 4);

    let status = dispatcher.handle_event(start(chat_event("c1", "hi"), true)).await;

    assert_eq!(status, HandlerStatus::Suspended);
    let id = h.engine.instance_ids()[0];
    assert_eq!(h.engine.status(id), Some(WorkflowStatus::Running));
    assert!(h.engine.snapshot(id).is_some());
    assert_eq!(h.ingress.workflow_for_source(&SourceId::from("c1")).await, Some(id));
    assert!(!h.ingress.is_live(id));
}

#[tokio::test]
async fn end_message_on_a_linked_session_completes_its_workflow() {
    let h = Harness::new();
    let dispatcher = Arc::new(h.dispatcher(
        ChatRunner::new(Arc::new(GreetingResponder)),
        DispatchMode::Stateless,
        4,
    ));
    let loop_task = tokio::spawn(dispatcher.clone().run());

    h.send("c1", "hello").await;
    wait_until("first reply", || h.outbound.messages().len() == 1).await;
    let w1 = h
        .ingress
        .workflow_for_source(&SourceId::from("c1"))
        .await
        .expect("c1 is linked");
    assert!(h.ingress.is_live(w1));

    h.send("c1", "how are you").await;
    wait_until("second reply", || h.outbound.messages().len() == 2).await;
    assert_eq!(h.engine.instance_count(), 1);

    h.send("c1", "end").await;
    wait_until("completion", || h.engine.status(w1) == Some(WorkflowStatus::Completed)).await;

    assert_eq!(h.engine.instance_count(), 1);
    wait_until("unlink", || h.ingress.registry().lookup(&SourceId::from("c1")).is_none()).await;
    assert_eq!(
        h.outbound.messages()[1],
        (SourceId::from("c1"), "Hello world! You said: how are you".to_string())
    );

    h.ingress.shutdown();
    loop_task.await.unwrap();
}

#[tokio::test]
async fn snapshot_chat_resumes_the_same_instance_every_turn() {
    let h = Harness::new();
    let dispatcher = Arc::new(h.dispatcher(
        ChatSnapshotRunner::new(Arc::new(GreetingResponder)),
        DispatchMode::Snapshots,
        4,
    ));
    let loop_task = tokio::spawn(dispatcher.clone().run());

    h.send("c1", "first").await;
    wait_until("first reply", || h.outbound.messages().len() == 1).await;
    let w1 = h.engine.instance_ids()[0];
    wait_until("snapshot", || h.engine.snapshot(w1).is_some()).await;

    h.send("c1", "second").await;
    wait_until("second reply", || h.outbound.messages().len() == 2).await;
    assert_eq!(h.engine.instance_count(), 1);

    h.send("c1", "end").await;
    wait_until("completion", || h.engine.status(w1) == Some(WorkflowStatus::Completed)).await;
    wait_until("snapshot removal", || h.engine.snapshot(w1).is_none()).await;
    wait_until("unlink", || h.ingress.registry().lookup(&SourceId::from("c1")).is_none()).await;

    // the thread carried both turns
    let console = h.engine.console_entries(w1);
    let observed: Vec<_> = console
        .iter()
        .filter(|entry| entry.kind == ConsoleKind::ObservableOutput)
        .collect();
    assert_eq!(observed.len(), 2);
    assert!(observed[1].content.contains("Next steps: Wait for user input"));

    h.ingress.shutdown();
    loop_task.await.unwrap();
}

#[tokio::test]
async fn concurrent_handlers_never_exceed_the_limit() {
    let h = Harness::new();
    let runner = ScriptedRunner::new(Behavior::Sleep(Duration::from_millis(50)));
    let peak = runner.peak.clone();
    let dispatcher = Arc::new(h.dispatcher(runner, DispatchMode::Stateless, 2));
    let loop_task = tokio::spawn(dispatcher.clone().run());

    for i in 0..6 {
        h.send(&format!("source-{i}"), "hi").await;
    }
    wait_until("all handlers", || {
        h.engine.count_with_status(WorkflowStatus::Completed) == 6
    })
    .await;

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);
    // the idle loop holds one permit while it waits for the next event
    wait_until("permits returned", || dispatcher.available_permits() == 1).await;

    h.ingress.shutdown();
    loop_task.await.unwrap();
}
