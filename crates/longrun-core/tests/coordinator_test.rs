//! Cross-workflow coordination tests

use std::sync::Arc;
use std::time::Duration;

use futures::future::LocalBoxFuture;
use longrun_core::coordinator::{DependencyConfig, WorkflowsCoordinator};
use longrun_core::prelude::*;

/// Sits waiting for "Stop"; every other configured action just counts
struct RelayLogic {
    actions: Vec<&'static str>,
}

impl WorkflowLogic for RelayLogic {
    fn on_actions_init(&mut self, ctx: &WorkflowCtx) -> Result<()> {
        for action in &self.actions {
            ctx.configure_action(ActionConfig::new(*action))?;
        }
        ctx.configure_action(ActionConfig::new("Stop"))
    }

    fn run(&mut self, ctx: WorkflowCtx) -> LocalBoxFuture<'static, Result<()>> {
        Box::pin(async move {
            ctx.wait_for_action("Stop").await?;
            Ok(())
        })
    }
}

fn relay(name: &str, actions: Vec<&'static str>) -> Workflow {
    let workflow = Workflow::new(RelayLogic { actions }, WorkflowOptions::named(name));
    workflow.start().unwrap();
    workflow
}

async fn eventually(description: &str, mut probe: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if probe() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting: {description}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_action_dependency_routes_to_destination() {
    let coordinator = WorkflowsCoordinator::new();
    coordinator.register_dependency(DependencyConfig::on_action(
        "source",
        "Ping",
        "destination",
        |event| async move {
            event
                .destination
                .execute_action("Pong")
                .await
                .map(|_| ())
                .map_err(anyhow::Error::from)
        },
    ));

    let source = relay("source", vec!["Ping"]);
    let destination = relay("destination", vec!["Pong"]);
    coordinator
        .add_workflow("source", source.clone(), true)
        .await
        .unwrap();
    coordinator
        .add_workflow("destination", destination.clone(), true)
        .await
        .unwrap();

    source.wait_for_started().await.unwrap();
    source.execute_action("Ping").await.unwrap();

    eventually("destination executed Pong", || {
        destination.times_executed("Pong") == 1
    })
    .await;
}

#[tokio::test]
async fn test_duplicate_workflow_name_fails() {
    let coordinator = WorkflowsCoordinator::new();
    let first = relay("twin-a", vec![]);
    let second = relay("twin-b", vec![]);

    coordinator.add_workflow("twin", first, true).await.unwrap();
    let err = coordinator
        .add_workflow("twin", second, true)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidUsage(_)));
}

#[tokio::test]
async fn test_historically_satisfied_dependency_fires_on_add() {
    let coordinator = WorkflowsCoordinator::new();
    coordinator.register_dependency(DependencyConfig::on_action(
        "early",
        "Ping",
        "late",
        |event| async move {
            event
                .destination
                .execute_action("Pong")
                .await
                .map(|_| ())
                .map_err(anyhow::Error::from)
        },
    ));

    let source = relay("early", vec!["Ping"]);
    coordinator
        .add_workflow("early", source.clone(), true)
        .await
        .unwrap();
    source.wait_for_started().await.unwrap();
    source.execute_action("Ping").await.unwrap();

    // the destination arrives after the trigger already happened
    let destination = relay("late", vec!["Pong"]);
    coordinator
        .add_workflow("late", destination.clone(), true)
        .await
        .unwrap();

    eventually("late destination caught up", || {
        destination.times_executed("Pong") == 1
    })
    .await;
}

#[tokio::test]
async fn test_source_cancellation_clears_counter_and_notifies() {
    let coordinator = WorkflowsCoordinator::new();
    coordinator.register_dependency(
        DependencyConfig::on_action("feeder", "Ping", "sink", |event| async move {
            event
                .destination
                .execute_action("Pong")
                .await
                .map(|_| ())
                .map_err(anyhow::Error::from)
        })
        .with_clear_times_executed("Pong")
        .with_on_source_canceled(|event| async move {
            event
                .destination
                .execute_action("SourceGone")
                .await
                .map(|_| ())
                .map_err(anyhow::Error::from)
        }),
    );

    let source = relay("feeder", vec!["Ping"]);
    let destination = relay("sink", vec!["Pong", "SourceGone"]);
    coordinator
        .add_workflow("feeder", source.clone(), true)
        .await
        .unwrap();
    coordinator
        .add_workflow("sink", destination.clone(), true)
        .await
        .unwrap();

    source.wait_for_started().await.unwrap();
    source.execute_action("Ping").await.unwrap();
    eventually("sink saw Pong", || destination.times_executed("Pong") == 1).await;

    source.cancel().await;

    eventually("sink notified of cancellation", || {
        destination.times_executed("SourceGone") == 1
    })
    .await;
    assert_eq!(destination.times_executed("Pong"), 0, "counter cleared");
}

#[tokio::test]
async fn test_handler_errors_surface_as_unhandled() {
    let coordinator = WorkflowsCoordinator::new();
    let mut errors = coordinator.subscribe_unhandled_errors();

    coordinator.register_dependency(DependencyConfig::on_action(
        "err-src",
        "Ping",
        "err-dst",
        |_event| async move { Err(anyhow::anyhow!("handler exploded")) },
    ));

    let source = relay("err-src", vec!["Ping"]);
    let destination = relay("err-dst", vec![]);
    coordinator
        .add_workflow("err-src", source.clone(), true)
        .await
        .unwrap();
    coordinator
        .add_workflow("err-dst", destination, true)
        .await
        .unwrap();

    source.wait_for_started().await.unwrap();
    source.execute_action("Ping").await.unwrap();

    let reported = tokio::time::timeout(Duration::from_secs(5), errors.recv())
        .await
        .expect("unhandled error should be reported")
        .unwrap();
    assert!(reported.contains("handler exploded"));
}

#[tokio::test]
async fn test_state_dependency_fires_on_state_entry() {
    use longrun_core::machine::StateId;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Phase {
        Draft,
        Review,
        Done,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Hidden {}

    struct PhasedLogic;

    impl WorkflowLogic for PhasedLogic {
        fn on_actions_init(&mut self, ctx: &WorkflowCtx) -> Result<()> {
            ctx.configure_action(ActionConfig::new("Submit"))?;
            ctx.configure_action(ActionConfig::new("Finish"))
        }

        fn run(&mut self, ctx: WorkflowCtx) -> LocalBoxFuture<'static, Result<()>> {
            Box::pin(async move {
                let machine: StateMachine<Phase, Hidden> = StateMachine::new();
                let draft = machine.configure_state(Phase::Draft);
                let review = machine.configure_state(Phase::Review);
                draft
                    .on_action("Submit")
                    .go_to(StateId::Public(Phase::Review));
                review
                    .on_action("Finish")
                    .go_to(StateId::Public(Phase::Done));

                let instance = machine.run(&ctx, StateId::Public(Phase::Draft), false, None)?;
                instance.completion().await?;
                Ok(())
            })
        }
    }

    let coordinator = WorkflowsCoordinator::new();
    coordinator.register_dependency(DependencyConfig::on_state(
        "phased",
        "Review",
        "observer",
        |event| async move {
            event
                .destination
                .execute_action("Pong")
                .await
                .map(|_| ())
                .map_err(anyhow::Error::from)
        },
    ));

    let phased = Workflow::new(PhasedLogic, WorkflowOptions::named("phased"));
    phased.start().unwrap();
    let observer = relay("observer", vec!["Pong"]);

    coordinator
        .add_workflow("phased", phased.clone(), true)
        .await
        .unwrap();
    coordinator
        .add_workflow("observer", observer.clone(), true)
        .await
        .unwrap();

    phased.wait_for_started().await.unwrap();
    phased.execute_action("Submit").await.unwrap();

    eventually("observer saw the Review entry", || {
        observer.times_executed("Pong") == 1
    })
    .await;
}
