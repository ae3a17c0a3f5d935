//! Run phase of the state machine engine

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use futures::future::LocalBoxFuture;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, trace};

use crate::cancel::current_scope;
use crate::error::{Result, WorkflowError};
use crate::machine::state::{
    ChainStep, StateCtx, TriggerConf, TriggerPayload, TriggerSource,
};
use crate::machine::{StateId, StateKey, StateMachine};
use crate::operators::{wait_for_any, Branch};
use crate::values::{NamedValues, Value};
use crate::workflow::{WorkflowCtx, ACTION_OPERATION_PARAMETER, ACTION_PARAMETER};

/// A transition request that left the machine: the target is not configured
/// here, so the instance exited all states and handed the request back
#[derive(Debug, Clone, PartialEq)]
pub struct StateTransition<S, I> {
    pub target: StateId<S, I>,
}

struct StateWaiter<S: StateKey, I: StateKey> {
    target: Option<StateId<S, I>>,
    tx: oneshot::Sender<()>,
}

pub(crate) struct InstanceState<S: StateKey, I: StateKey> {
    pub(crate) machine: StateMachine<S, I>,
    pub(crate) ctx: WorkflowCtx,
    pub(crate) path: RefCell<Vec<StateId<S, I>>>,
    pub(crate) redirect: RefCell<Option<StateId<S, I>>>,
    restoring: Cell<bool>,
    last_settled: RefCell<Option<StateId<S, I>>>,
    external_requests: RefCell<VecDeque<StateId<S, I>>>,
    external_notify: Notify,
    state_waiters: RefCell<Vec<StateWaiter<S, I>>>,
    on_entered: Option<Box<dyn Fn(&StateId<S, I>)>>,
}

impl<S: StateKey, I: StateKey> InstanceState<S, I> {
    fn state_ctx(self: &Rc<Self>) -> StateCtx<S, I> {
        StateCtx {
            workflow: self.ctx.clone(),
            instance: self.clone(),
        }
    }

    fn allowance(&self, action: &str) -> Option<bool> {
        let path = self.path.borrow();
        for id in path.iter().rev() {
            let Some(handle) = self.machine.state(id) else {
                continue;
            };
            let conf = handle.conf.borrow();
            if conf.disallowed_actions.iter().any(|a| a == action) {
                return Some(false);
            }
            if conf.allowed_actions.iter().any(|a| a == action) {
                return Some(true);
            }
        }
        None
    }

    fn leaf(&self) -> Option<StateId<S, I>> {
        self.path.borrow().last().cloned()
    }
}

/// Handle to a running state machine
pub struct StateMachineInstance<S: StateKey, I: StateKey> {
    st: Rc<InstanceState<S, I>>,
    task: RefCell<Option<LocalBoxFuture<'static, Result<StateTransition<S, I>>>>>,
}

impl<S: StateKey, I: StateKey> StateMachineInstance<S, I> {
    /// Drive the machine to termination: a fault, workflow cancellation, or
    /// a transition that leaves the machine
    pub async fn completion(&self) -> Result<StateTransition<S, I>> {
        let task = self.task.borrow_mut().take().ok_or_else(|| {
            WorkflowError::invalid_usage("state machine completion already awaited")
        })?;
        task.await
    }

    /// Request a transition; targets outside the machine stop the instance
    pub fn initiate_transition_to(&self, target: StateId<S, I>) {
        self.st.external_requests.borrow_mut().push_back(target);
        self.st.external_notify.notify_one();
    }

    /// The current leaf state, when entered
    pub fn current_state(&self) -> Option<StateId<S, I>> {
        self.st.leaf()
    }

    /// Path from root to the current leaf
    pub fn current_path(&self) -> Vec<StateId<S, I>> {
        self.st.path.borrow().clone()
    }

    /// Completes when the machine is in `target` (immediately when already
    /// there, compound states included)
    pub async fn wait_for_state(&self, target: StateId<S, I>) -> Result<()> {
        if self.st.path.borrow().contains(&target) {
            return Ok(());
        }
        self.wait_for_settle(Some(target)).await
    }

    /// Completes on the next state change, whatever the target
    pub async fn wait_for_any_state_change(&self) -> Result<()> {
        self.wait_for_settle(None).await
    }

    async fn wait_for_settle(&self, target: Option<StateId<S, I>>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.st
            .state_waiters
            .borrow_mut()
            .push(StateWaiter { target, tx });
        let scope = current_scope();
        tokio::select! {
            settled = rx => settled.map_err(|_| WorkflowError::Cancelled),
            _ = scope.cancelled() => Err(WorkflowError::Cancelled),
        }
    }
}

pub(crate) fn start<S: StateKey, I: StateKey>(
    machine: StateMachine<S, I>,
    ctx: WorkflowCtx,
    initial_state: StateId<S, I>,
    is_restoring: bool,
    on_state_entered: Option<Box<dyn Fn(&StateId<S, I>)>>,
) -> StateMachineInstance<S, I> {
    let st = Rc::new(InstanceState {
        machine,
        ctx: ctx.clone(),
        path: RefCell::new(Vec::new()),
        redirect: RefCell::new(None),
        restoring: Cell::new(is_restoring),
        last_settled: RefCell::new(None),
        external_requests: RefCell::new(VecDeque::new()),
        external_notify: Notify::new(),
        state_waiters: RefCell::new(Vec::new()),
        on_entered: on_state_entered,
    });

    let weak = Rc::downgrade(&st);
    ctx.set_state_allowance(Some(Rc::new(move |action: &str| {
        weak.upgrade().and_then(|st| st.allowance(action))
    })));

    let engine_st = st.clone();
    let task: LocalBoxFuture<'static, Result<StateTransition<S, I>>> = Box::pin(async move {
        let result = engine(engine_st.clone(), initial_state).await;
        engine_st.ctx.set_state_allowance(None);
        engine_st.state_waiters.borrow_mut().clear();
        result
    });

    StateMachineInstance {
        st,
        task: RefCell::new(Some(task)),
    }
}

enum Fired<S: StateKey, I: StateKey> {
    External(StateId<S, I>),
    Trigger {
        trigger: Rc<RefCell<TriggerConf<S, I>>>,
        payload: TriggerPayload,
    },
}

async fn engine<S: StateKey, I: StateKey>(
    st: Rc<InstanceState<S, I>>,
    initial_state: StateId<S, I>,
) -> Result<StateTransition<S, I>> {
    descend(&st, initial_state).await?;
    st.restoring.set(false);

    loop {
        settle(&st).await?;

        match wait_for_trigger(&st).await? {
            Fired::External(target) => {
                if st.machine.contains(&target) {
                    transition(&st, target).await?;
                } else {
                    return stop_instance(&st, target).await;
                }
            }
            Fired::Trigger { trigger, payload } => {
                // an exported action operation keeps the action's
                // execute_action call blocked until the transition settles
                let action_operation = payload
                    .downcast_ref::<NamedValues>()
                    .and_then(|p| match p.get(ACTION_OPERATION_PARAMETER) {
                        Some(Value::Handle(handle)) => Some(handle.clone()),
                        _ => None,
                    });

                let outcome = process_trigger(&st, &trigger, payload).await;
                match outcome {
                    Ok(Some(target)) => {
                        let stopped = stop_instance(&st, target).await;
                        if let Some(handle) = action_operation {
                            handle.dispose();
                        }
                        return stopped;
                    }
                    Ok(None) => {
                        if let Some(handle) = action_operation {
                            handle.dispose();
                        }
                    }
                    Err(err) => {
                        if let Some(handle) = action_operation {
                            handle.dispose();
                        }
                        return Err(err);
                    }
                }
            }
        }
    }
}

/// Run the trigger's handlers and any resulting transition; returns the
/// target when it leaves the machine
async fn process_trigger<S: StateKey, I: StateKey>(
    st: &Rc<InstanceState<S, I>>,
    trigger: &Rc<RefCell<TriggerConf<S, I>>>,
    payload: TriggerPayload,
) -> Result<Option<StateId<S, I>>> {
    let handlers = trigger.borrow().handlers.clone();
    for handler in handlers {
        handler(st.state_ctx(), payload.clone()).await?;
    }

    let target = {
        let sctx = st.state_ctx();
        let conf = trigger.borrow();
        let mut chosen = None;
        for branch in &conf.branches {
            if (branch.guard.predicate)(&sctx) {
                chosen = Some(branch.target.clone());
                break;
            }
        }
        if chosen.is_none() && conf.main_guards.iter().all(|g| (g.predicate)(&sctx)) {
            chosen = conf.main_target.clone();
        }
        chosen
    };

    let Some(target) = target else {
        return Ok(None);
    };
    if st.leaf().as_ref() == Some(&target) {
        // transitioning to the current state is a stay, not a re-entry
        return Ok(None);
    }
    if !st.machine.contains(&target) {
        return Ok(Some(target));
    }
    transition(st, target).await?;
    Ok(None)
}

/// Exit and enter under a workflow operation so exit handlers may execute
/// actions; when an action is mid-execution its operation is already current
async fn transition<S: StateKey, I: StateKey>(
    st: &Rc<InstanceState<S, I>>,
    target: StateId<S, I>,
) -> Result<()> {
    let gate = st.ctx.gate();
    let op = if gate.has_current_operation() {
        None
    } else {
        gate.create_operation()?;
        gate.try_start_operation()?
    };
    let result = descend(st, target).await;
    if let Some(op) = op {
        op.dispose();
    }
    result
}

async fn stop_instance<S: StateKey, I: StateKey>(
    st: &Rc<InstanceState<S, I>>,
    target: StateId<S, I>,
) -> Result<StateTransition<S, I>> {
    debug!(target = %target.display_name(), "state machine stopping for external target");
    let gate = st.ctx.gate();
    let op = if gate.has_current_operation() {
        None
    } else {
        gate.create_operation()?;
        gate.try_start_operation()?
    };
    let result = exit_all(st).await;
    if let Some(op) = op {
        op.dispose();
    }
    result?;
    Ok(StateTransition { target })
}

fn current_is_prefix<S: StateKey, I: StateKey>(
    st: &InstanceState<S, I>,
    target_path: &[StateId<S, I>],
) -> bool {
    let path = st.path.borrow();
    path.len() <= target_path.len() && path.iter().zip(target_path.iter()).all(|(a, b)| a == b)
}

/// Enter states from the current position to `target`, exiting any levels
/// off the target path first; handles redirects from enter chains
async fn descend<S: StateKey, I: StateKey>(
    st: &Rc<InstanceState<S, I>>,
    mut target: StateId<S, I>,
) -> Result<()> {
    'recompute: loop {
        let target_path = st.machine.path_of(&target)?;

        while !current_is_prefix(st, &target_path) {
            exit_top(st).await?;
        }

        while st.path.borrow().len() < target_path.len() {
            let next = target_path[st.path.borrow().len()].clone();
            st.path.borrow_mut().push(next.clone());
            trace!(state = %next.display_name(), "entering state");

            let steps = {
                let handle = st.machine.state(&next).ok_or_else(|| {
                    WorkflowError::not_found(format!("state '{}'", next.display_name()))
                })?;
                let conf = handle.conf.borrow();
                if st.restoring.get() {
                    conf.on_activate.clone()
                } else {
                    conf.on_enter.clone()
                }
            };

            for step in steps {
                let redirect = match step {
                    ChainStep::Run(handler) => {
                        handler(st.state_ctx()).await?;
                        st.redirect.borrow_mut().take()
                    }
                    ChainStep::GoTo(declared) => Some(declared),
                };
                if let Some(redirect) = redirect {
                    if redirect == next {
                        // self-redirect: stay, keep entering the original path
                        continue;
                    }
                    target = redirect;
                    continue 'recompute;
                }
            }
        }
        return Ok(());
    }
}

/// Run the leaf's exit handlers in declaration order and pop it
async fn exit_top<S: StateKey, I: StateKey>(st: &Rc<InstanceState<S, I>>) -> Result<()> {
    let Some(leaf) = st.leaf() else {
        return Ok(());
    };
    trace!(state = %leaf.display_name(), "exiting state");
    let steps = {
        let handle = st.machine.state(&leaf).ok_or_else(|| {
            WorkflowError::not_found(format!("state '{}'", leaf.display_name()))
        })?;
        let on_exit = handle.conf.borrow().on_exit.clone();
        on_exit
    };
    for step in steps {
        if let ChainStep::Run(handler) = step {
            handler(st.state_ctx()).await?;
            // redirects have no meaning on the way out
            st.redirect.borrow_mut().take();
        }
    }
    st.path.borrow_mut().pop();
    Ok(())
}

async fn exit_all<S: StateKey, I: StateKey>(st: &Rc<InstanceState<S, I>>) -> Result<()> {
    while !st.path.borrow().is_empty() {
        exit_top(st).await?;
    }
    Ok(())
}

/// Publish the settled leaf: workflow state mirror, entered callback, state
/// waiters, recorded history, repository save
async fn settle<S: StateKey, I: StateKey>(st: &Rc<InstanceState<S, I>>) -> Result<()> {
    let Some(leaf) = st.leaf() else {
        return Ok(());
    };
    if st.last_settled.borrow().as_ref() == Some(&leaf) {
        return Ok(());
    }
    *st.last_settled.borrow_mut() = Some(leaf.clone());

    st.ctx.notify_state_changed(leaf.display_name());
    if let Some(on_entered) = &st.on_entered {
        on_entered(&leaf);
    }

    {
        let path = st.path.borrow();
        let mut waiters = st.state_waiters.borrow_mut();
        let mut kept = Vec::with_capacity(waiters.len());
        for waiter in waiters.drain(..) {
            let matched = match &waiter.target {
                None => true,
                Some(target) => path.contains(target),
            };
            if matched {
                let _ = waiter.tx.send(());
            } else if !waiter.tx.is_closed() {
                kept.push(waiter);
            }
        }
        *waiters = kept;
    }

    if st.ctx.has_data_field("StatesHistory") {
        let history = st.ctx.visited_state_names();
        let encoded = serde_json::to_string(&history).unwrap_or_default();
        st.ctx.set_data_field("StatesHistory", encoded)?;
    }

    st.ctx.save_workflow_data().await
}

fn set_slot<S: StateKey, I: StateKey>(
    slot: &Rc<RefCell<Option<Fired<S, I>>>>,
    fired: Fired<S, I>,
) {
    let mut slot = slot.borrow_mut();
    if slot.is_none() {
        *slot = Some(fired);
    }
}

/// Race every trigger along the current path (leaf first) against external
/// transition requests
async fn wait_for_trigger<S: StateKey, I: StateKey>(
    st: &Rc<InstanceState<S, I>>,
) -> Result<Fired<S, I>> {
    let slot: Rc<RefCell<Option<Fired<S, I>>>> = Rc::new(RefCell::new(None));
    let mut branches = Vec::new();

    {
        let st = st.clone();
        let slot = slot.clone();
        branches.push(Branch::required(move || async move {
            loop {
                let pending = st.external_requests.borrow_mut().pop_front();
                if let Some(target) = pending {
                    set_slot(&slot, Fired::External(target));
                    return Ok(());
                }
                let scope = current_scope();
                let cancelled = scope.cancelled();
                tokio::select! {
                    _ = st.external_notify.notified() => {}
                    _ = cancelled => return Err(WorkflowError::Cancelled),
                }
            }
        }));
    }

    let path = st.path.borrow().clone();
    for id in path.iter().rev() {
        let Some(handle) = st.machine.state(id) else {
            continue;
        };
        let triggers = handle.conf.borrow().triggers.clone();
        for trigger in triggers {
            let st = st.clone();
            let slot = slot.clone();
            branches.push(Branch::required(move || arm_trigger(st, trigger, slot)));
        }
    }

    wait_for_any(branches).await?;
    let fired = slot
        .borrow_mut()
        .take()
        .ok_or_else(|| WorkflowError::invalid_usage("trigger race settled without a payload"));
    fired
}

async fn arm_trigger<S: StateKey, I: StateKey>(
    st: Rc<InstanceState<S, I>>,
    trigger: Rc<RefCell<TriggerConf<S, I>>>,
    slot: Rc<RefCell<Option<Fired<S, I>>>>,
) -> Result<()> {
    enum Armed<S: StateKey, I: StateKey> {
        Async(crate::machine::state::AsyncFactory<S, I>),
        Actions(Vec<String>, bool),
        Date(crate::machine::state::DateFactory<S, I>),
    }

    let armed = {
        let conf = trigger.borrow();
        match &conf.source {
            TriggerSource::Async(factory) => Armed::Async(factory.clone()),
            TriggerSource::Actions {
                names,
                any_execution,
            } => Armed::Actions(names.clone(), *any_execution),
            TriggerSource::Date(factory) => Armed::Date(factory.clone()),
        }
    };

    let payload: TriggerPayload = match armed {
        Armed::Async(factory) => factory(st.state_ctx()).await?,
        Armed::Date(factory) => {
            let deadline = factory(&st.state_ctx());
            st.ctx.wait_for_date(deadline).await?;
            Rc::new(())
        }
        Armed::Actions(names, any_execution) => {
            if any_execution {
                let executed = names.iter().find_map(|name| {
                    let primary = st.ctx.resolve_action(name).ok()?;
                    (st.ctx.times_executed(&primary) > 0).then_some(primary)
                });
                if let Some(primary) = executed {
                    let payload =
                        NamedValues::new().with(ACTION_PARAMETER, Value::String(primary));
                    set_slot(&slot, Fired::Trigger { trigger, payload: Rc::new(payload) });
                    return Ok(());
                }
            }
            let parameters = if names.len() == 1 {
                st.ctx.wait_for_action_with_operation(&names[0]).await?
            } else {
                let waits: Vec<LocalBoxFuture<'static, Result<NamedValues>>> = names
                    .iter()
                    .map(|name| {
                        let ctx = st.ctx.clone();
                        let name = name.clone();
                        Box::pin(async move { ctx.wait_for_action_with_operation(&name).await })
                            as LocalBoxFuture<'static, Result<NamedValues>>
                    })
                    .collect();
                let (first, _, _) = futures::future::select_all(waits).await;
                first?
            };
            Rc::new(parameters)
        }
    };

    set_slot(&slot, Fired::Trigger { trigger, payload });
    Ok(())
}
