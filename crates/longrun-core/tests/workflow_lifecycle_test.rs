//! End-to-end lifecycle tests: start, actions, data fields, event log,
//! repository interplay, cancel and stop semantics.

use std::sync::Arc;

use futures::future::LocalBoxFuture;
use longrun_core::prelude::*;
use longrun_core::repository::TerminalMark;

/// Counts "Increment" executions into a data field until "Stop" arrives
struct CounterLogic;

impl WorkflowLogic for CounterLogic {
    fn on_init(&mut self, ctx: &WorkflowCtx) -> Result<()> {
        ctx.declare_data_field(DataFieldDescriptor::persistent("Counter", ValueKind::Int))?;
        ctx.declare_data_field(DataFieldDescriptor::transient("Note", ValueKind::String))
    }

    fn on_actions_init(&mut self, ctx: &WorkflowCtx) -> Result<()> {
        ctx.configure_action(ActionConfig::new("Increment").with_synonym("Inc").with_handler(
            |ctx, _params| async move {
                let current: i64 = ctx.get_data_field("Counter")?;
                ctx.set_data_field("Counter", current + 1)?;
                Ok(Some(Value::Int(current + 1)))
            },
        ))?;
        ctx.configure_action(ActionConfig::new("Stop"))
    }

    fn run(&mut self, ctx: WorkflowCtx) -> LocalBoxFuture<'static, Result<()>> {
        Box::pin(async move {
            ctx.wait_for_action("Stop").await?;
            Ok(())
        })
    }
}

fn counter_workflow(repo: Arc<InMemoryRepository>) -> Workflow {
    Workflow::new(
        CounterLogic,
        WorkflowOptions::named("counter").with_repository(repo),
    )
}

#[tokio::test]
async fn test_start_execute_and_complete() {
    let repo = Arc::new(InMemoryRepository::new());
    let workflow = counter_workflow(repo.clone());

    workflow.start().unwrap();
    workflow.wait_for_started().await.unwrap();
    assert!(workflow.id().is_some(), "repository should assign the id");
    workflow.wait_for_ready().await.unwrap();

    let first: i64 = workflow
        .execute_action_as("Increment", NamedValues::new())
        .await
        .unwrap();
    assert_eq!(first, 1);

    // synonyms resolve to the primary name
    let second: i64 = workflow
        .execute_action_as("Inc", NamedValues::new())
        .await
        .unwrap();
    assert_eq!(second, 2);
    assert_eq!(workflow.times_executed("Increment"), 2);

    workflow.execute_action("Stop").await.unwrap();
    workflow.wait_for_completed().await.unwrap();
    assert_eq!(workflow.status(), WorkflowStatus::Completed);

    // one save at start, one per action, exactly one terminal mark
    assert!(repo.save_count() >= 4);
    let marks = repo.marks();
    assert_eq!(marks.len(), 1);
    assert!(matches!(marks[0], TerminalMark::Completed(Some(_))));

    let snapshot = repo.last_snapshot().unwrap();
    assert_eq!(snapshot.data.get_as::<i64>("Counter").unwrap(), 2);
    // transient data never reaches the repository
    assert!(!snapshot.data.contains("Note"));
}

#[tokio::test]
async fn test_action_parameters_land_in_data_fields() {
    let repo = Arc::new(InMemoryRepository::new());
    let workflow = counter_workflow(repo.clone());
    workflow.start().unwrap();
    workflow.wait_for_started().await.unwrap();

    let params = NamedValues::new().with("Note", Value::String("from test".into()));
    workflow
        .execute_action_with("Increment", params, true)
        .await
        .unwrap();

    let note: String = workflow.get_data_field("Note").await.unwrap();
    assert_eq!(note, "from test");
}

#[tokio::test]
async fn test_unknown_action_is_not_found() {
    let workflow = counter_workflow(Arc::new(InMemoryRepository::new()));
    workflow.start().unwrap();

    let err = workflow.execute_action("Missing").await.unwrap_err();
    assert!(matches!(err, WorkflowError::NotFound(_)));
}

#[tokio::test]
async fn test_event_log_records_actions_and_truncates() {
    let repo = Arc::new(InMemoryRepository::new());
    let workflow = Workflow::new(
        CounterLogic,
        WorkflowOptions::named("bounded")
            .with_repository(repo)
            .with_event_log_capacity(2),
    );
    workflow.start().unwrap();
    workflow.wait_for_started().await.unwrap();

    for _ in 0..3 {
        workflow.execute_action("Increment").await.unwrap();
    }

    let log = workflow.event_log();
    assert_eq!(log.len(), 2, "capacity drops the oldest entries");
    assert!(log.iter().all(|e| e.name == "ActionExecuted"));
    assert_eq!(log[1].parameters.get("Action").unwrap(), "Increment");
}

#[tokio::test]
async fn test_cancel_is_idempotent_and_marks_once() {
    let repo = Arc::new(InMemoryRepository::new());
    let workflow = counter_workflow(repo.clone());
    workflow.start().unwrap();
    workflow.wait_for_started().await.unwrap();

    workflow.cancel().await;
    assert_eq!(workflow.status(), WorkflowStatus::Canceled);

    // a second cancel is a no-op
    workflow.cancel().await;
    assert_eq!(repo.marks().len(), 1);
    assert!(matches!(repo.marks()[0], TerminalMark::Canceled(_)));

    let log = workflow.event_log();
    assert!(log.iter().any(|e| e.name == "WorkflowCanceled"));
}

#[tokio::test]
async fn test_cancel_before_start() {
    let repo = Arc::new(InMemoryRepository::new());
    let workflow = counter_workflow(repo.clone());

    workflow.cancel().await;
    assert_eq!(workflow.status(), WorkflowStatus::Canceled);
    assert!(workflow.start().is_err(), "start after cancel must fail");
}

#[tokio::test]
async fn test_stop_forces_faulted_and_rejects_after_terminal() {
    let repo = Arc::new(InMemoryRepository::new());
    let workflow = counter_workflow(repo.clone());
    workflow.start().unwrap();
    workflow.wait_for_started().await.unwrap();

    workflow
        .stop(WorkflowError::fault(anyhow::anyhow!("operator request")))
        .await
        .unwrap();
    assert_eq!(workflow.status(), WorkflowStatus::Faulted);
    assert!(matches!(repo.marks()[0], TerminalMark::Failed(_, _)));
    assert!(workflow
        .event_log()
        .iter()
        .any(|e| e.name == "WorkflowFaulted"));

    let err = workflow
        .stop(WorkflowError::fault(anyhow::anyhow!("again")))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidUsage(_)));
}

#[tokio::test]
async fn test_terminal_workflow_rejects_actions() {
    let workflow = counter_workflow(Arc::new(InMemoryRepository::new()));
    workflow.start().unwrap();
    workflow.wait_for_started().await.unwrap();
    workflow.execute_action("Stop").await.unwrap();
    workflow.wait_for_completed().await.unwrap();

    let err = workflow.execute_action("Increment").await.unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test]
async fn test_before_start_hook_failure_faults_workflow() {
    let repo = Arc::new(InMemoryRepository::new());
    let workflow = counter_workflow(repo.clone());

    workflow
        .start_with(StartOptions {
            before_start: Some(Box::new(|_ctx| {
                Err(WorkflowError::fault(anyhow::anyhow!("bad wiring")))
            })),
            ..Default::default()
        })
        .unwrap();

    let err = workflow.wait_for_started().await.unwrap_err();
    assert!(err.is_cancelled(), "started signal is cancelled");

    let outcome = workflow.wait_for_completed().await;
    assert!(outcome.is_err());
    assert_eq!(workflow.status(), WorkflowStatus::Faulted);
    assert!(matches!(repo.marks()[0], TerminalMark::Failed(_, _)));
}

#[tokio::test]
async fn test_initial_data_applied_before_body() {
    let repo = Arc::new(InMemoryRepository::new());
    let workflow = counter_workflow(repo.clone());

    workflow
        .start_with(StartOptions {
            initial_data: Some(NamedValues::new().with("Counter", Value::Int(10))),
            ..Default::default()
        })
        .unwrap();
    workflow.wait_for_started().await.unwrap();

    let value: i64 = workflow
        .execute_action_as("Increment", NamedValues::new())
        .await
        .unwrap();
    assert_eq!(value, 11);
}

/// A workflow whose init is broken: the same action configured twice
struct DuplicateActionLogic;

impl WorkflowLogic for DuplicateActionLogic {
    fn on_actions_init(&mut self, ctx: &WorkflowCtx) -> Result<()> {
        ctx.configure_action(ActionConfig::new("Ping"))?;
        ctx.configure_action(ActionConfig::new("Ping"))
    }

    fn run(&mut self, _ctx: WorkflowCtx) -> LocalBoxFuture<'static, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

#[tokio::test]
async fn test_duplicate_action_faults_on_start() {
    let workflow = Workflow::new(DuplicateActionLogic, WorkflowOptions::named("dup"));
    workflow.start().unwrap();

    assert!(workflow.wait_for_completed().await.is_err());
    assert_eq!(workflow.status(), WorkflowStatus::Faulted);
    let fault = workflow.fault().unwrap();
    assert!(matches!(fault, WorkflowError::InvalidUsage(_)));
}

/// "Approve" is gated on a data flag; "Hidden" never shows up
struct GatedLogic;

impl WorkflowLogic for GatedLogic {
    fn on_init(&mut self, ctx: &WorkflowCtx) -> Result<()> {
        ctx.declare_data_field(DataFieldDescriptor::persistent("Ready", ValueKind::Bool))
    }

    fn on_actions_init(&mut self, ctx: &WorkflowCtx) -> Result<()> {
        ctx.configure_action(ActionConfig::new("Arm").with_sync_handler(|ctx, _| {
            ctx.set_data_field("Ready", true)
        }))?;
        ctx.configure_action(
            ActionConfig::new("Approve")
                .allowed_when(|ctx, _| ctx.get_data_field::<bool>("Ready").unwrap_or(false)),
        )?;
        ctx.configure_action(ActionConfig::new("Audit").hidden())?;
        ctx.configure_action(ActionConfig::new("Stop"))
    }

    fn run(&mut self, ctx: WorkflowCtx) -> LocalBoxFuture<'static, Result<()>> {
        Box::pin(async move {
            ctx.wait_for_action("Stop").await?;
            Ok(())
        })
    }
}

#[tokio::test]
async fn test_action_allowance_and_available_actions() {
    let workflow = Workflow::new(GatedLogic, WorkflowOptions::named("gated"));
    workflow.start().unwrap();
    workflow.wait_for_started().await.unwrap();

    let available = workflow
        .get_available_actions(NamedValues::new())
        .await
        .unwrap();
    assert_eq!(available, vec!["Arm", "Stop"], "hidden and disallowed excluded");

    let err = workflow.execute_action("Approve").await.unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidUsage(_)));

    // non-throwing form is a silent no-op
    workflow
        .execute_action_with("Approve", NamedValues::new(), false)
        .await
        .unwrap();
    assert_eq!(workflow.times_executed("Approve"), 0);

    workflow.execute_action("Arm").await.unwrap();
    let available = workflow
        .get_available_actions(NamedValues::new())
        .await
        .unwrap();
    assert_eq!(available, vec!["Arm", "Approve", "Stop"]);

    workflow.execute_action("Approve").await.unwrap();
    assert_eq!(workflow.times_executed("Approve"), 1);
}

/// The body itself observes an action's parameters
struct EchoLogic;

impl WorkflowLogic for EchoLogic {
    fn on_init(&mut self, ctx: &WorkflowCtx) -> Result<()> {
        ctx.declare_data_field(DataFieldDescriptor::persistent("Who", ValueKind::String))
    }

    fn on_actions_init(&mut self, ctx: &WorkflowCtx) -> Result<()> {
        ctx.configure_action(ActionConfig::new("Go"))
    }

    fn run(&mut self, ctx: WorkflowCtx) -> LocalBoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let params = ctx.wait_for_action("Go").await?;
            assert_eq!(params.get_as::<String>("Action").unwrap(), "Go");
            Ok(())
        })
    }
}

#[tokio::test]
async fn test_wait_for_action_receives_parameters() {
    let repo = Arc::new(InMemoryRepository::new());
    let workflow = Workflow::new(
        EchoLogic,
        WorkflowOptions::named("echo").with_repository(repo.clone()),
    );
    workflow.start().unwrap();
    workflow.wait_for_started().await.unwrap();

    let params = NamedValues::new().with("Who", Value::String("tester".into()));
    workflow
        .execute_action_with("Go", params, true)
        .await
        .unwrap();

    workflow.wait_for_completed().await.unwrap();
    let snapshot = repo.last_snapshot().unwrap();
    assert_eq!(snapshot.data.get_as::<String>("Who").unwrap(), "tester");
}
