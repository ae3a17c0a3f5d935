//! Operators exercised through real workflow bodies: racing actions,
//! clock-driven waits, was-executed checks, and exported action operations.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::future::LocalBoxFuture;
use longrun_core::prelude::*;
use longrun_core::{ACTION_OPERATION_PARAMETER, OperationHandle};

/// Races "Approve" against "Reject" and records which one won
struct DecisionLogic;

impl WorkflowLogic for DecisionLogic {
    fn on_init(&mut self, ctx: &WorkflowCtx) -> Result<()> {
        ctx.declare_data_field(DataFieldDescriptor::persistent(
            "Decision",
            ValueKind::String,
        ))
    }

    fn on_actions_init(&mut self, ctx: &WorkflowCtx) -> Result<()> {
        ctx.configure_action(ActionConfig::new("Approve"))?;
        ctx.configure_action(ActionConfig::new("Reject"))
    }

    fn run(&mut self, ctx: WorkflowCtx) -> LocalBoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let approve = ctx.clone();
            let reject = ctx.clone();
            let winner = wait_for_any(vec![
                Branch::required(move || async move {
                    approve.wait_for_action("Approve").await.map(|_| ())
                }),
                Branch::required(move || async move {
                    reject.wait_for_action("Reject").await.map(|_| ())
                }),
            ])
            .await?;
            let decision = if winner == 0 { "approved" } else { "rejected" };
            ctx.set_data_field("Decision", decision.to_string())?;
            Ok(())
        })
    }
}

#[tokio::test]
async fn test_race_between_actions() {
    let repo = Arc::new(InMemoryRepository::new());
    let workflow = Workflow::new(
        DecisionLogic,
        WorkflowOptions::named("decision").with_repository(repo.clone()),
    );
    workflow.start().unwrap();
    workflow.wait_for_started().await.unwrap();

    workflow.execute_action("Reject").await.unwrap();
    workflow.wait_for_completed().await.unwrap();

    let snapshot = repo.last_snapshot().unwrap();
    assert_eq!(snapshot.data.get_as::<String>("Decision").unwrap(), "rejected");
}

/// Sleeps on the workflow clock until the reminder is due
struct ReminderLogic {
    remind_at: DateTime<Utc>,
}

impl WorkflowLogic for ReminderLogic {
    fn run(&mut self, ctx: WorkflowCtx) -> LocalBoxFuture<'static, Result<()>> {
        let remind_at = self.remind_at;
        Box::pin(async move { ctx.wait_for_date(remind_at).await })
    }
}

#[tokio::test]
async fn test_wait_for_date_completes_on_test_clock() {
    let start = Utc.with_ymd_and_hms(2025, 1, 10, 9, 0, 0).unwrap();
    let remind_at = start + chrono::Duration::days(30);
    let clock = TestClock::new(start);
    let workflow = Workflow::new(
        ReminderLogic { remind_at },
        WorkflowOptions::named("reminder").with_clock(Arc::new(clock.clone())),
    );
    workflow.start().unwrap();
    workflow.wait_for_started().await.unwrap();

    // halfway there is not due yet
    clock.set_current_time(start + chrono::Duration::days(15));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(workflow.status(), WorkflowStatus::Running);

    clock.set_current_time(remind_at);
    workflow.wait_for_completed().await.unwrap();
}

/// Checks a priming action that may have happened before the body got there
struct PrimedLogic;

impl WorkflowLogic for PrimedLogic {
    fn on_actions_init(&mut self, ctx: &WorkflowCtx) -> Result<()> {
        ctx.configure_action(ActionConfig::new("Prime"))?;
        ctx.configure_action(ActionConfig::new("Go"))
    }

    fn run(&mut self, ctx: WorkflowCtx) -> LocalBoxFuture<'static, Result<()>> {
        Box::pin(async move {
            ctx.wait_for_action("Go").await?;
            // Prime already ran by now, so this completes without waiting
            let params = ctx.wait_for_action_with_was_executed_check("Prime").await?;
            assert_eq!(params.get_as::<String>("Action").unwrap(), "Prime");
            Ok(())
        })
    }
}

#[tokio::test]
async fn test_was_executed_check_completes_immediately() {
    let workflow = Workflow::new(PrimedLogic, WorkflowOptions::named("primed"));
    workflow.start().unwrap();
    workflow.wait_for_started().await.unwrap();

    workflow.execute_action("Prime").await.unwrap();
    workflow.execute_action("Go").await.unwrap();
    workflow.wait_for_completed().await.unwrap();
}

/// Work done while holding the exported operation is visible to the action
/// caller as soon as `execute_action` returns
struct AtomicLogic;

impl WorkflowLogic for AtomicLogic {
    fn on_init(&mut self, ctx: &WorkflowCtx) -> Result<()> {
        ctx.declare_data_field(DataFieldDescriptor::persistent("Processed", ValueKind::Bool))
    }

    fn on_actions_init(&mut self, ctx: &WorkflowCtx) -> Result<()> {
        ctx.configure_action(ActionConfig::new("Submit"))
    }

    fn run(&mut self, ctx: WorkflowCtx) -> LocalBoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let params = ctx.wait_for_action_with_operation("Submit").await?;
            ctx.set_data_field("Processed", true)?;
            let handle: OperationHandle = params.get_as(ACTION_OPERATION_PARAMETER)?;
            handle.dispose();
            Ok(())
        })
    }
}

#[tokio::test]
async fn test_exported_operation_blocks_action_until_disposed() {
    let repo = Arc::new(InMemoryRepository::new());
    let workflow = Workflow::new(
        AtomicLogic,
        WorkflowOptions::named("atomic").with_repository(repo.clone()),
    );
    workflow.start().unwrap();
    workflow.wait_for_started().await.unwrap();

    workflow.execute_action("Submit").await.unwrap();

    // the awaiter's write happened before execute_action returned
    let snapshot = repo.last_snapshot().unwrap();
    assert!(snapshot.data.get_as::<bool>("Processed").unwrap());
}
