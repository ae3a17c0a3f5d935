//! Operation gate
//!
//! An *operation* marks "a unit of work is in progress, do not observe yet".
//! The gate tracks at most one root operation per workflow plus a count of
//! nested inner operations, and hands out a readiness future that external
//! observers await before interacting with the workflow. Everything here runs
//! on the workflow thread; the types are deliberately not `Send`.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tracing::trace;

use crate::cancel::current_scope;
use crate::error::{Result, WorkflowError};
use crate::scheduler;
use crate::time::Clock;

struct OperationCore {
    created_at: DateTime<Utc>,
    parent: Option<Rc<OperationCore>>,
    inner_count: Cell<usize>,
}

impl OperationCore {
    fn is_inner(&self) -> bool {
        self.parent.is_some()
    }
}

struct GateState {
    current: Option<Rc<OperationCore>>,
    pending_create: bool,
    cancelled: bool,
    inner_active: usize,
    ready_waiters: VecDeque<oneshot::Sender<()>>,
    counter_waiters: Vec<oneshot::Sender<()>>,
}

impl GateState {
    fn is_idle(&self) -> bool {
        self.current.is_none() && self.inner_active == 0 && !self.pending_create
    }
}

/// Readiness/operation tracking for one workflow
pub struct OperationGate {
    state: Rc<RefCell<GateState>>,
    clock: Arc<dyn Clock>,
    scheduler_id: u64,
}

/// A scoped acquisition; dropping (or disposing) releases it
///
/// Disposing twice is a no-op.
pub struct Operation {
    core: Rc<OperationCore>,
    state: Rc<RefCell<GateState>>,
    disposed: Cell<bool>,
}

impl Operation {
    /// Timestamp the operation was started at, per the workflow's clock
    pub fn created_at(&self) -> DateTime<Utc> {
        self.core.created_at
    }

    /// True for a nested (inner) operation
    pub fn is_inner(&self) -> bool {
        self.core.is_inner()
    }

    /// Release the operation
    pub fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        let mut state = self.state.borrow_mut();
        if let Some(parent) = &self.core.parent {
            parent.inner_count.set(parent.inner_count.get().saturating_sub(1));
            state.inner_active = state.inner_active.saturating_sub(1);
        } else if state
            .current
            .as_ref()
            .is_some_and(|cur| Rc::ptr_eq(cur, &self.core))
        {
            state.current = None;
        }
        wake_after_change(&mut state);
    }
}

impl Drop for Operation {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn wake_after_change(state: &mut GateState) {
    for waiter in state.counter_waiters.drain(..) {
        let _ = waiter.send(());
    }
    if state.is_idle() {
        for waiter in state.ready_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

impl OperationGate {
    pub(crate) fn new(clock: Arc<dyn Clock>, scheduler_id: u64) -> Self {
        Self {
            state: Rc::new(RefCell::new(GateState {
                current: None,
                pending_create: false,
                cancelled: false,
                inner_active: 0,
                ready_waiters: VecDeque::new(),
                counter_waiters: Vec::new(),
            })),
            clock,
            scheduler_id,
        }
    }

    fn ensure_workflow_thread(&self) -> Result<()> {
        if self.scheduler_id != 0 && scheduler::current_scheduler_id() != self.scheduler_id {
            return Err(WorkflowError::invalid_usage(
                "operation gate touched off the workflow thread",
            ));
        }
        Ok(())
    }

    /// Arm the gate so the next `try_start_operation` produces a new root
    ///
    /// Fails when a new-operation slot is already pending without a matching
    /// start or reset.
    pub fn create_operation(&self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.pending_create {
            return Err(WorkflowError::invalid_usage(
                "a new operation is already pending",
            ));
        }
        state.pending_create = true;
        Ok(())
    }

    /// Clear the pending new-operation slot
    pub fn reset_operation(&self) {
        let mut state = self.state.borrow_mut();
        state.pending_create = false;
        wake_after_change(&mut state);
    }

    /// Start an operation: a new root when one is pending, an inner one when
    /// a root is active, `None` otherwise (and always `None` once cancelled)
    pub fn try_start_operation(&self) -> Result<Option<Operation>> {
        self.ensure_workflow_thread()?;
        let mut state = self.state.borrow_mut();
        if state.cancelled {
            return Ok(None);
        }

        if state.pending_create && state.current.is_none() {
            state.pending_create = false;
            let core = Rc::new(OperationCore {
                created_at: self.clock.now(),
                parent: None,
                inner_count: Cell::new(0),
            });
            state.current = Some(core.clone());
            trace!("root operation started");
            return Ok(Some(Operation {
                core,
                state: self.state.clone(),
                disposed: Cell::new(false),
            }));
        }

        if let Some(current) = state.current.clone() {
            current.inner_count.set(current.inner_count.get() + 1);
            state.inner_active += 1;
            let core = Rc::new(OperationCore {
                created_at: self.clock.now(),
                parent: Some(current),
                inner_count: Cell::new(0),
            });
            trace!("inner operation started");
            return Ok(Some(Operation {
                core,
                state: self.state.clone(),
                disposed: Cell::new(false),
            }));
        }

        Ok(None)
    }

    /// Install a previously started root as the current operation
    ///
    /// Used when a transition carries the workflow operation across state
    /// boundaries.
    pub fn import_operation(&self, op: &Operation) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.current.is_some() {
            return Err(WorkflowError::invalid_usage(
                "cannot import an operation while another is active",
            ));
        }
        state.current = Some(op.core.clone());
        Ok(())
    }

    /// True while a root operation is active
    pub fn has_current_operation(&self) -> bool {
        self.state.borrow().current.is_some()
    }

    /// Completes when no operation (root, inner, or pending) is active;
    /// fails with `Cancelled` when the gate cancels
    pub async fn ready(&self) -> Result<()> {
        loop {
            let rx = {
                let mut state = self.state.borrow_mut();
                if state.cancelled {
                    return Err(WorkflowError::Cancelled);
                }
                if state.is_idle() {
                    return Ok(());
                }
                let (tx, rx) = oneshot::channel();
                state.ready_waiters.push_back(tx);
                rx
            };
            if rx.await.is_err() {
                // waiters are dropped when the gate cancels
                return Err(WorkflowError::Cancelled);
            }
        }
    }

    /// Await readiness, then start and return an operation
    ///
    /// When an operation is already in progress the caller joins it as an
    /// inner operation without waiting. Respects the ambient cancel scope.
    pub async fn wait_for_ready_and_start_operation(&self) -> Result<Operation> {
        let scope = current_scope();
        loop {
            {
                let state = self.state.borrow();
                if state.cancelled {
                    return Err(WorkflowError::Cancelled);
                }
                if state.current.is_some() {
                    drop(state);
                    return self.try_start_operation()?.ok_or(WorkflowError::Cancelled);
                }
            }

            tokio::select! {
                ready = self.ready() => ready?,
                _ = scope.cancelled() => return Err(WorkflowError::Cancelled),
            }

            // no awaits between the readiness check and the start below, so
            // the slot cannot be stolen on this single-threaded executor
            if self.state.borrow().is_idle() {
                self.create_operation()?;
                match self.try_start_operation()? {
                    Some(op) => return Ok(op),
                    None => return Err(WorkflowError::Cancelled),
                }
            }
        }
    }

    /// Completes when `op` has no live inner operations; fails with
    /// `Cancelled` when the gate cancels
    pub async fn wait_for_all_inner_operations_completion(&self, op: &Operation) -> Result<()> {
        loop {
            let rx = {
                let mut state = self.state.borrow_mut();
                if state.cancelled {
                    return Err(WorkflowError::Cancelled);
                }
                if op.core.inner_count.get() == 0 {
                    return Ok(());
                }
                let (tx, rx) = oneshot::channel();
                state.counter_waiters.push(tx);
                rx
            };
            if rx.await.is_err() {
                return Err(WorkflowError::Cancelled);
            }
        }
    }

    /// Cancel the gate; all current and future waiters fail with `Cancelled`
    pub fn cancel(&self) {
        let mut state = self.state.borrow_mut();
        state.cancelled = true;
        state.ready_waiters.clear();
        state.counter_waiters.clear();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.borrow().cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::SystemClock;
    use futures::FutureExt;

    fn gate() -> OperationGate {
        // scheduler id 0 disables the thread check for unit tests
        OperationGate::new(Arc::new(SystemClock::new()), 0)
    }

    #[tokio::test]
    async fn test_single_root_operation() {
        let gate = gate();
        gate.create_operation().unwrap();
        let root = gate.try_start_operation().unwrap().unwrap();
        assert!(!root.is_inner());
        assert!(gate.has_current_operation());

        // a second start while a root is active yields an inner operation
        let inner = gate.try_start_operation().unwrap().unwrap();
        assert!(inner.is_inner());
    }

    #[tokio::test]
    async fn test_create_operation_twice_fails() {
        let gate = gate();
        gate.create_operation().unwrap();
        let err = gate.create_operation().unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidUsage(_)));

        gate.reset_operation();
        gate.create_operation().unwrap();
    }

    #[tokio::test]
    async fn test_try_start_without_pending_returns_none() {
        let gate = gate();
        assert!(gate.try_start_operation().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ready_iff_idle() {
        let gate = gate();
        assert!(gate.ready().now_or_never().is_some());

        gate.create_operation().unwrap();
        assert!(gate.ready().now_or_never().is_none());

        let root = gate.try_start_operation().unwrap().unwrap();
        let inner = gate.try_start_operation().unwrap().unwrap();

        inner.dispose();
        assert!(gate.ready().now_or_never().is_none());

        root.dispose();
        assert!(gate.ready().now_or_never().is_some());
    }

    #[tokio::test]
    async fn test_root_dispose_with_live_inner_keeps_gate_busy() {
        let gate = gate();
        gate.create_operation().unwrap();
        let root = gate.try_start_operation().unwrap().unwrap();
        let inner = gate.try_start_operation().unwrap().unwrap();

        root.dispose();
        assert!(gate.ready().now_or_never().is_none());
        inner.dispose();
        assert!(gate.ready().now_or_never().is_some());
    }

    #[tokio::test]
    async fn test_dispose_twice_is_noop() {
        let gate = gate();
        gate.create_operation().unwrap();
        let root = gate.try_start_operation().unwrap().unwrap();
        let inner = gate.try_start_operation().unwrap().unwrap();

        inner.dispose();
        inner.dispose();

        // the counter only dropped once
        gate.wait_for_all_inner_operations_completion(&root)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_inner_completion() {
        let gate = gate();
        gate.create_operation().unwrap();
        let root = gate.try_start_operation().unwrap().unwrap();
        let inner = gate.try_start_operation().unwrap().unwrap();

        let mut wait = Box::pin(gate.wait_for_all_inner_operations_completion(&root));
        assert!((&mut wait).now_or_never().is_none());

        inner.dispose();
        wait.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_gate() {
        let gate = gate();
        gate.cancel();
        assert!(gate.try_start_operation().unwrap().is_none());
        assert!(gate.ready().await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_import_operation() {
        let gate = gate();
        gate.create_operation().unwrap();
        let root = gate.try_start_operation().unwrap().unwrap();

        // simulate carrying the operation across a state boundary
        let carried = Operation {
            core: root.core.clone(),
            state: root.state.clone(),
            disposed: Cell::new(false),
        };
        root.dispose();
        assert!(!gate.has_current_operation());

        gate.import_operation(&carried).unwrap();
        assert!(gate.has_current_operation());

        gate.create_operation().unwrap();
        carried.dispose();
    }

    #[tokio::test]
    async fn test_wait_for_ready_and_start_operation_joins_current() {
        let gate = gate();
        gate.create_operation().unwrap();
        let _root = gate.try_start_operation().unwrap().unwrap();

        let op = crate::cancel::with_scope(
            crate::cancel::CancelScope::new_root(),
            gate.wait_for_ready_and_start_operation(),
        )
        .await
        .unwrap();
        assert!(op.is_inner());
    }

    #[tokio::test]
    async fn test_wait_for_ready_and_start_operation_creates_root_when_idle() {
        let gate = gate();
        let op = crate::cancel::with_scope(
            crate::cancel::CancelScope::new_root(),
            gate.wait_for_ready_and_start_operation(),
        )
        .await
        .unwrap();
        assert!(!op.is_inner());
        assert!(gate.has_current_operation());
    }
}
