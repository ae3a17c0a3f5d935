//! Composable waiting primitives
//!
//! Every operator propagates cancellation through the ambient
//! [`CancelScope`](crate::cancel::CancelScope). `wait_for_any` is the
//! combinator the rest hang off: it races branch factories under a private
//! child scope, cancels the losers once a winner exists, and never returns
//! before every sibling has settled.

use std::future::Future;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::LocalBoxFuture;
use futures::task::noop_waker;
use tracing::trace;

use crate::cancel::{current_scope, with_scope, with_scope_sync};
use crate::error::{Result, WorkflowError};
use crate::gate::Operation;
use crate::values::{NamedValues, Value};
use crate::workflow::{WorkflowCtx, ACTION_PARAMETER};

/// One competitor in a [`wait_for_any`] race
pub struct Branch {
    factory: Box<dyn FnOnce() -> LocalBoxFuture<'static, Result<()>>>,
    optional: bool,
}

impl Branch {
    /// A branch whose successful completion wins the race
    pub fn required<F, Fut>(factory: F) -> Self
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        Self {
            factory: Box::new(move || Box::pin(factory())),
            optional: false,
        }
    }

    /// An optional branch: its completion never wins the race, but any
    /// failure (including an unexpected cancellation) fails the composite
    pub fn optional<F, Fut>(factory: F) -> Self
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        Self {
            factory: Box::new(move || Box::pin(factory())),
            optional: true,
        }
    }
}

/// Race the branches and return the declaration index of the winner
///
/// Contract:
/// - factories start in declaration order under a private child scope;
///   creation stops early once a non-optional branch is already complete
/// - the first non-optional success wins; ties go to the lowest index
/// - once a winner or fault exists the private scope cancels, and the call
///   returns only after every started sibling has settled
/// - a child cancellation not caused by the private scope is reported as
///   `InvalidUsage`
/// - with no branches (or only completed optional ones) the call waits until
///   the ambient scope cancels
pub async fn wait_for_any(branches: Vec<Branch>) -> Result<usize> {
    let outer = current_scope();
    let inner = outer.child();

    let mut futs: Vec<Option<LocalBoxFuture<'static, Result<()>>>> = Vec::new();
    let mut optional_flags: Vec<bool> = Vec::new();
    let mut results: Vec<Option<Result<()>>> = Vec::new();
    let mut winner: Option<usize> = None;
    let mut fault: Option<WorkflowError> = None;

    let probe_waker = noop_waker();
    let mut probe_cx = Context::from_waker(&probe_waker);

    for branch in branches {
        let index = futs.len();
        optional_flags.push(branch.optional);
        let factory = branch.factory;
        let fut = with_scope_sync(inner.clone(), factory);
        let mut fut: LocalBoxFuture<'static, Result<()>> =
            Box::pin(with_scope(inner.clone(), fut));

        match fut.as_mut().poll(&mut probe_cx) {
            Poll::Ready(result) => {
                let failed = result.is_err();
                let completed_ok = result.is_ok();
                record_result(
                    index,
                    result,
                    &optional_flags,
                    &inner,
                    &mut results,
                    &mut winner,
                    &mut fault,
                );
                futs.push(None);
                // a completed non-optional branch or an immediate failure
                // means later factories are never invoked
                if (completed_ok && !optional_flags[index]) || failed {
                    break;
                }
            }
            Poll::Pending => {
                futs.push(Some(fut));
                results.push(None);
            }
        }
    }

    if winner.is_some() || fault.is_some() {
        inner.cancel();
    }

    // drive the remaining branches; re-evaluate after every completion
    futures::future::poll_fn(|cx: &mut Context<'_>| {
        let mut progressed = true;
        while progressed {
            progressed = false;
            for index in 0..futs.len() {
                let Some(fut) = futs[index].as_mut() else {
                    continue;
                };
                if let Poll::Ready(result) = fut.as_mut().poll(cx) {
                    futs[index] = None;
                    let had_decision = winner.is_some() || fault.is_some();
                    record_result(
                        index,
                        result,
                        &optional_flags,
                        &inner,
                        &mut results,
                        &mut winner,
                        &mut fault,
                    );
                    if !had_decision && (winner.is_some() || fault.is_some()) {
                        inner.cancel();
                        progressed = true;
                    }
                }
            }
        }
        if futs.iter().all(Option::is_none) {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    })
    .await;

    if let Some(fault) = fault {
        trace!("wait_for_any re-raising first fault");
        return Err(fault);
    }
    if let Some(winner) = winner {
        return Ok(winner);
    }
    if outer.is_cancelled() {
        return Err(WorkflowError::Cancelled);
    }
    // nothing left to win: hold until the ambient scope cancels
    outer.cancelled().await;
    Err(WorkflowError::Cancelled)
}

fn record_result(
    index: usize,
    result: Result<()>,
    optional_flags: &[bool],
    inner: &crate::cancel::CancelScope,
    results: &mut Vec<Option<Result<()>>>,
    winner: &mut Option<usize>,
    fault: &mut Option<WorkflowError>,
) {
    if results.len() <= index {
        results.resize_with(index + 1, || None);
    }
    match &result {
        Ok(()) => {
            if !optional_flags[index] {
                let better = winner.map_or(true, |w| index < w);
                if fault.is_none() && better {
                    *winner = Some(index);
                }
            }
        }
        Err(WorkflowError::Cancelled) if inner.is_cancelled() => {
            // expected: the losing side of the race
        }
        Err(WorkflowError::Cancelled) => {
            if fault.is_none() {
                *fault = Some(WorkflowError::invalid_usage(
                    "a child task was cancelled unexpectedly",
                ));
            }
        }
        Err(err) => {
            if fault.is_none() {
                *fault = Some(err.clone());
            }
        }
    }
    results[index] = Some(result);
}

/// Run `cont` on the successful result of `task`; cancellation and faults
/// propagate without invoking `cont`
pub async fn then<T, U, Fut>(
    task: impl Future<Output = Result<T>>,
    cont: impl FnOnce(T) -> Fut,
) -> Result<U>
where
    Fut: Future<Output = Result<U>>,
{
    let value = task.await?;
    cont(value).await
}

/// Bound `task` by wall-clock `timeout`
///
/// Timing uses the real timer, not the workflow's pluggable clock. A task
/// that completes or cancels first surfaces its own outcome.
pub async fn with_timeout<T>(
    task: impl Future<Output = Result<T>>,
    timeout: Duration,
) -> Result<T> {
    match tokio::time::timeout(timeout, task).await {
        Ok(result) => result,
        Err(_) => Err(WorkflowError::Timeout(timeout)),
    }
}

impl WorkflowCtx {
    /// Wait until the workflow clock reaches `date`
    ///
    /// Registers the date with the activation-dates manager while waiting so
    /// the repository sees it as the next wake-up. `DateTime::MAX_UTC` never
    /// completes.
    pub async fn wait_for_date(&self, date: DateTime<Utc>) -> Result<()> {
        let scope = current_scope();
        if date == DateTime::<Utc>::MAX_UTC {
            scope.cancelled().await;
            return Err(WorkflowError::Cancelled);
        }
        let activation = self.activation();
        activation.add_activation_date(&scope, date);
        let result = self.clock().wait_until(date, &scope).await;
        if scope.is_cancelled() {
            activation.on_scope_canceled(&scope);
        } else {
            activation.remove_activation_date(&scope, date);
        }
        result
    }

    /// Completes when `action` (primary name or synonym) executes, yielding
    /// the invocation parameters augmented with `"Action"`
    pub async fn wait_for_action(&self, action: &str) -> Result<NamedValues> {
        self.wait_for_action_internal(action, false).await
    }

    /// Like [`Self::wait_for_action`], but the returned parameters carry an
    /// `"ActionOperation"` handle; the action's `execute_action` call does
    /// not finish until the handle is disposed
    pub async fn wait_for_action_with_operation(&self, action: &str) -> Result<NamedValues> {
        self.wait_for_action_internal(action, true).await
    }

    /// Completes immediately when the action has already executed at least
    /// once, otherwise waits like [`Self::wait_for_action`]
    pub async fn wait_for_action_with_was_executed_check(
        &self,
        action: &str,
    ) -> Result<NamedValues> {
        let primary = self.resolve_action(action)?;
        if self.times_executed(&primary) > 0 {
            return Ok(NamedValues::new().with(ACTION_PARAMETER, Value::String(primary)));
        }
        self.wait_for_action_internal(action, false).await
    }

    async fn wait_for_action_internal(
        &self,
        action: &str,
        export_operation: bool,
    ) -> Result<NamedValues> {
        let primary = self.resolve_action(action)?;
        let scope = current_scope();
        let rx = self.register_action_waiter(&primary, export_operation);
        tokio::select! {
            payload = rx => payload.map_err(|_| WorkflowError::Cancelled),
            _ = scope.cancelled() => Err(WorkflowError::Cancelled),
        }
    }

    /// Await gate readiness and start an operation; see
    /// [`OperationGate::wait_for_ready_and_start_operation`](crate::gate::OperationGate::wait_for_ready_and_start_operation)
    pub async fn wait_for_ready_and_start_operation(&self) -> Result<Operation> {
        let gate = self.gate();
        gate.wait_for_ready_and_start_operation().await
    }
}
