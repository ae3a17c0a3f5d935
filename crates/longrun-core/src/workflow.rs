//! Workflow core
//!
//! A [`Workflow`] is a long-running, resumable process instance: it owns a
//! dedicated scheduler, mutable named data, an action registry, an event log,
//! and a lifecycle that ends in exactly one terminal status. User logic is
//! supplied as a [`WorkflowLogic`] strategy object; its `run` body composes
//! the operators in [`crate::operators`] until it completes, fails, or is
//! cancelled.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::LocalBoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::activation::ActivationDatesManager;
use crate::cancel::{with_scope, CancelScope};
use crate::error::{Result, WorkflowError};
use crate::fields::{DataFieldDescriptor, WorkflowMetadata};
use crate::gate::{Operation, OperationGate};
use crate::repository::{WorkflowId, WorkflowRepository, WorkflowSnapshot};
use crate::time::{Clock, SystemClock};
use crate::scheduler::Scheduler;
use crate::values::{NamedValues, OperationHandle, Value, ValueCodec};

/// Parameter name carrying the resolved primary action name
pub const ACTION_PARAMETER: &str = "Action";

/// Parameter name carrying an exported action operation handle
pub const ACTION_OPERATION_PARAMETER: &str = "ActionOperation";

/// Lifecycle status of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    NotStarted,
    Running,
    Completed,
    Canceled,
    Faulted,
}

impl WorkflowStatus {
    /// Terminal statuses freeze all further mutation
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Canceled | WorkflowStatus::Faulted
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartSignal {
    NotStarted,
    Started,
    Failed,
}

/// One entry of the bounded event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedEvent {
    pub name: String,
    pub parameters: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

/// Broadcast payload for every successful action execution
#[derive(Debug, Clone)]
pub struct ActionEvent {
    pub name: String,
    pub parameters: NamedValues,
}

/// Broadcast payload for state machine settlements
#[derive(Debug, Clone)]
pub struct StateChangeEvent {
    pub from: Option<String>,
    pub to: String,
}

/// User-supplied workflow logic
///
/// The substrate owns the machinery; the logic supplies behavior. All methods
/// run on the workflow thread.
pub trait WorkflowLogic: Send + 'static {
    /// Declare data fields and other construction-time configuration
    fn on_init(&mut self, _ctx: &WorkflowCtx) -> Result<()> {
        Ok(())
    }

    /// Configure the action registry
    fn on_actions_init(&mut self, _ctx: &WorkflowCtx) -> Result<()> {
        Ok(())
    }

    /// The workflow body; runs under the root cancellation scope
    fn run(&mut self, ctx: WorkflowCtx) -> LocalBoxFuture<'static, Result<()>>;

    /// Invoked after the body returns successfully, before the repository is
    /// notified
    fn on_completed(&mut self, _ctx: &WorkflowCtx) -> Result<()> {
        Ok(())
    }

    /// Workflow-level allowance veto; `None` defers to state and action rules
    fn is_action_allowed(
        &self,
        _ctx: &WorkflowCtx,
        _action: &str,
        _parameters: &NamedValues,
    ) -> Option<bool> {
        None
    }

    /// Event log filter; events returning `false` are not recorded
    fn filter_event(&self, _name: &str) -> bool {
        true
    }
}

type ActionHandler = Rc<dyn Fn(WorkflowCtx, NamedValues) -> LocalBoxFuture<'static, Result<Option<Value>>>>;
type AllowancePredicate = Rc<dyn Fn(&WorkflowCtx, &NamedValues) -> bool>;
type StateAllowanceHook = Rc<dyn Fn(&str) -> Option<bool>>;

/// Declarative description of one action
pub struct ActionConfig {
    name: String,
    synonyms: Vec<String>,
    metadata: NamedValues,
    hidden: bool,
    handler: Option<ActionHandler>,
    allowed: Option<AllowancePredicate>,
}

impl ActionConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            synonyms: Vec::new(),
            metadata: NamedValues::new(),
            hidden: false,
            handler: None,
            allowed: None,
        }
    }

    pub fn with_synonym(mut self, synonym: impl Into<String>) -> Self {
        self.synonyms.push(synonym.into());
        self
    }

    pub fn with_synonyms<I: IntoIterator<Item = S>, S: Into<String>>(mut self, synonyms: I) -> Self {
        self.synonyms.extend(synonyms.into_iter().map(Into::into));
        self
    }

    pub fn with_metadata(mut self, metadata: NamedValues) -> Self {
        self.metadata = metadata;
        self
    }

    /// Hidden actions never appear in `get_available_actions`
    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    /// Gate the action on a predicate evaluated per invocation
    pub fn allowed_when(
        mut self,
        predicate: impl Fn(&WorkflowCtx, &NamedValues) -> bool + 'static,
    ) -> Self {
        self.allowed = Some(Rc::new(predicate));
        self
    }

    /// Attach an async handler; its return value becomes the action result
    pub fn with_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(WorkflowCtx, NamedValues) -> Fut + 'static,
        Fut: std::future::Future<Output = Result<Option<Value>>> + 'static,
    {
        self.handler = Some(Rc::new(move |ctx, params| Box::pin(handler(ctx, params))));
        self
    }

    /// Attach a synchronous handler with no result value
    pub fn with_sync_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&WorkflowCtx, &NamedValues) -> Result<()> + 'static,
    {
        self.handler = Some(Rc::new(move |ctx, params| {
            let outcome = handler(&ctx, &params).map(|_| None);
            Box::pin(async move { outcome })
        }));
        self
    }
}

struct ActionDescriptor {
    primary: String,
    synonyms: Vec<String>,
    metadata: NamedValues,
    hidden: bool,
    handler: Option<ActionHandler>,
    allowed: Option<AllowancePredicate>,
}

struct ActionWaiter {
    tx: oneshot::Sender<NamedValues>,
    export_operation: bool,
}

struct ExportedOperation {
    op: Operation,
    disposed_tx: oneshot::Sender<()>,
}

pub(crate) struct LocalState {
    logic: Rc<RefCell<Box<dyn WorkflowLogic>>>,
    metadata: WorkflowMetadata,
    data: NamedValues,
    transient: NamedValues,
    actions: Vec<ActionDescriptor>,
    action_lookup: HashMap<String, String>,
    gate: Rc<OperationGate>,
    activation: Rc<ActivationDatesManager>,
    action_waiters: HashMap<String, Vec<ActionWaiter>>,
    exported: HashMap<u64, ExportedOperation>,
    next_export_id: u64,
    state_allowance: Option<StateAllowanceHook>,
    repository: Option<Arc<dyn WorkflowRepository>>,
    init_error: Option<WorkflowError>,
}

pub(crate) struct Shared {
    name: String,
    scheduler: Scheduler,
    clock: Arc<dyn Clock>,
    root_scope: CancelScope,
    status_tx: watch::Sender<WorkflowStatus>,
    started_tx: watch::Sender<StartSignal>,
    id: Mutex<Option<WorkflowId>>,
    fault: Mutex<Option<WorkflowError>>,
    cancel_requested: AtomicBool,
    stop_requested: Mutex<Option<WorkflowError>>,
    start_claimed: AtomicBool,
    action_stats: Mutex<HashMap<String, u64>>,
    event_log: Mutex<VecDeque<LoggedEvent>>,
    event_capacity: usize,
    action_executed_tx: broadcast::Sender<ActionEvent>,
    state_changed_tx: broadcast::Sender<StateChangeEvent>,
    current_state: Mutex<Option<String>>,
    visited_states: Mutex<Vec<String>>,
    next_activation: Mutex<Option<DateTime<Utc>>>,
}

thread_local! {
    static CURRENT_CTX: RefCell<Option<WorkflowCtx>> = const { RefCell::new(None) };
}

/// Construction options for a workflow
pub struct WorkflowOptions {
    pub name: String,
    pub event_log_capacity: usize,
    pub clock: Arc<dyn Clock>,
    pub repository: Option<Arc<dyn WorkflowRepository>>,
}

impl Default for WorkflowOptions {
    fn default() -> Self {
        Self {
            name: "workflow".to_string(),
            event_log_capacity: 100,
            clock: Arc::new(SystemClock::new()),
            repository: None,
        }
    }
}

impl WorkflowOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_repository(mut self, repository: Arc<dyn WorkflowRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn with_event_log_capacity(mut self, capacity: usize) -> Self {
        self.event_log_capacity = capacity;
        self
    }
}

/// Start-time options
#[derive(Default)]
pub struct StartOptions {
    pub initial_data: Option<NamedValues>,
    pub initial_transient_data: Option<NamedValues>,
    pub before_start: Option<Box<dyn FnOnce(&WorkflowCtx) -> Result<()> + Send>>,
}

/// External, thread-safe handle to a workflow instance
#[derive(Clone)]
pub struct Workflow {
    shared: Arc<Shared>,
}

/// Workflow context available to user callbacks on the workflow thread
///
/// Not `Send`: it only exists on the owning workflow's scheduler.
#[derive(Clone)]
pub struct WorkflowCtx {
    local: Rc<RefCell<LocalState>>,
    shared: Arc<Shared>,
}

impl Workflow {
    /// Create a workflow and bootstrap its scheduler thread
    ///
    /// `on_init` and `on_actions_init` run on the workflow thread before any
    /// other job.
    pub fn new(logic: impl WorkflowLogic, options: WorkflowOptions) -> Self {
        let scheduler = Scheduler::new(&options.name);
        let scheduler_id = scheduler.id();
        let (status_tx, _) = watch::channel(WorkflowStatus::NotStarted);
        let (started_tx, _) = watch::channel(StartSignal::NotStarted);
        let (action_executed_tx, _) = broadcast::channel(64);
        let (state_changed_tx, _) = broadcast::channel(64);

        let shared = Arc::new(Shared {
            name: options.name.clone(),
            scheduler,
            clock: options.clock.clone(),
            root_scope: CancelScope::new_root(),
            status_tx,
            started_tx,
            id: Mutex::new(None),
            fault: Mutex::new(None),
            cancel_requested: AtomicBool::new(false),
            stop_requested: Mutex::new(None),
            start_claimed: AtomicBool::new(false),
            action_stats: Mutex::new(HashMap::new()),
            event_log: Mutex::new(VecDeque::new()),
            event_capacity: options.event_log_capacity,
            action_executed_tx,
            state_changed_tx,
            current_state: Mutex::new(None),
            visited_states: Mutex::new(Vec::new()),
            next_activation: Mutex::new(None),
        });

        let boot_shared = shared.clone();
        let repository = options.repository;
        let logic = Box::new(logic) as Box<dyn WorkflowLogic>;
        let boot = move || {
            let gate = Rc::new(OperationGate::new(boot_shared.clock.clone(), scheduler_id));
            let local = Rc::new(RefCell::new(LocalState {
                logic: Rc::new(RefCell::new(logic)),
                metadata: WorkflowMetadata::new(),
                data: NamedValues::new(),
                transient: NamedValues::new(),
                actions: Vec::new(),
                action_lookup: HashMap::new(),
                gate,
                activation: Rc::new(ActivationDatesManager::new()),
                action_waiters: HashMap::new(),
                exported: HashMap::new(),
                next_export_id: 1,
                state_allowance: None,
                repository,
                init_error: None,
            }));
            let ctx = WorkflowCtx {
                local,
                shared: boot_shared,
            };
            CURRENT_CTX.with(|c| *c.borrow_mut() = Some(ctx.clone()));

            let logic = ctx.logic();
            let init = logic.borrow_mut().on_init(&ctx);
            let init = init.and_then(|_| logic.borrow_mut().on_actions_init(&ctx));
            if let Err(err) = init {
                warn!(workflow = %ctx.shared.name, %err, "workflow initialization failed");
                ctx.local.borrow_mut().init_error = Some(err);
            }
        };
        if shared.scheduler.enqueue(boot).is_err() {
            error!(workflow = %shared.name, "failed to bootstrap workflow thread");
        }

        Self { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn status(&self) -> WorkflowStatus {
        *self.shared.status_tx.borrow()
    }

    pub fn id(&self) -> Option<WorkflowId> {
        *self.shared.id.lock()
    }

    /// The terminal fault, once the workflow is `Faulted`
    pub fn fault(&self) -> Option<WorkflowError> {
        self.shared.fault.lock().clone()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.shared.clock.clone()
    }

    /// Earliest future wake-up registered by pending waits
    pub fn next_activation_date(&self) -> Option<DateTime<Utc>> {
        *self.shared.next_activation.lock()
    }

    /// Successful executions of `action` since construction or the last clear
    pub fn times_executed(&self, action: &str) -> u64 {
        self.shared
            .action_stats
            .lock()
            .get(action)
            .copied()
            .unwrap_or(0)
    }

    /// Reset the execution counter for `action`
    pub async fn clear_times_executed(&self, action: &str) -> Result<()> {
        let shared = self.shared.clone();
        let action = action.to_string();
        self.shared
            .scheduler
            .run_via_scheduler(move || {
                shared.action_stats.lock().remove(&action);
            })
            .await
    }

    /// Observe lifecycle status changes
    pub fn subscribe_status(&self) -> watch::Receiver<WorkflowStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Observe successful action executions
    pub fn subscribe_actions(&self) -> broadcast::Receiver<ActionEvent> {
        self.shared.action_executed_tx.subscribe()
    }

    /// Observe state machine settlements
    pub fn subscribe_state_changes(&self) -> broadcast::Receiver<StateChangeEvent> {
        self.shared.state_changed_tx.subscribe()
    }

    /// Display name of the current leaf state, when a machine is running
    pub fn current_state_name(&self) -> Option<String> {
        self.shared.current_state.lock().clone()
    }

    /// Display names of every state the workflow has ever entered
    pub fn visited_state_names(&self) -> Vec<String> {
        self.shared.visited_states.lock().clone()
    }

    /// Completes once the body has begun running and an id is assigned;
    /// fails with `Cancelled` when startup aborts
    pub async fn wait_for_started(&self) -> Result<()> {
        let mut rx = self.shared.started_tx.subscribe();
        loop {
            match *rx.borrow_and_update() {
                StartSignal::Started => return Ok(()),
                StartSignal::Failed => return Err(WorkflowError::Cancelled),
                StartSignal::NotStarted => {}
            }
            if rx.changed().await.is_err() {
                return Err(WorkflowError::Cancelled);
            }
        }
    }

    /// Completes on `Completed`, fails with `Cancelled` on `Canceled`, and
    /// re-raises the fault on `Faulted`
    pub async fn wait_for_completed(&self) -> Result<()> {
        let mut rx = self.shared.status_tx.subscribe();
        loop {
            let status = *rx.borrow_and_update();
            match status {
                WorkflowStatus::Completed => return Ok(()),
                WorkflowStatus::Canceled => return Err(WorkflowError::Cancelled),
                WorkflowStatus::Faulted => {
                    let fault = self.shared.fault.lock().clone();
                    return Err(fault.unwrap_or(WorkflowError::Cancelled));
                }
                WorkflowStatus::NotStarted | WorkflowStatus::Running => {}
            }
            if rx.changed().await.is_err() {
                return Err(WorkflowError::Cancelled);
            }
        }
    }

    async fn wait_for_terminal(&self) {
        let mut rx = self.shared.status_tx.subscribe();
        loop {
            if rx.borrow_and_update().is_terminal() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Start the workflow with default options
    pub fn start(&self) -> Result<()> {
        self.start_with(StartOptions::default())
    }

    /// Start the workflow
    ///
    /// Assigns initial data, runs the before-start hook, then awaits the
    /// logic's `run` body. Starting twice fails.
    #[instrument(skip_all, fields(workflow = %self.shared.name))]
    pub fn start_with(&self, options: StartOptions) -> Result<()> {
        if self.shared.start_claimed.swap(true, Ordering::AcqRel) {
            return Err(WorkflowError::invalid_usage("workflow already started"));
        }
        self.shared.status_tx.send_replace(WorkflowStatus::Running);
        info!(workflow = %self.shared.name, "starting workflow");

        let shared = self.shared.clone();
        self.shared.scheduler.spawn(move || {
            Box::pin(async move {
                let Some(ctx) = WorkflowCtx::current() else {
                    error!(workflow = %shared.name, "workflow thread lost its context");
                    return;
                };
                run_lifecycle(ctx, options).await;
            })
        })
    }

    /// Cancel the workflow; idempotent, a no-op once terminal
    #[instrument(skip_all, fields(workflow = %self.shared.name))]
    pub async fn cancel(&self) {
        if self.status().is_terminal() {
            return;
        }
        self.shared.cancel_requested.store(true, Ordering::Release);
        self.shared.root_scope.cancel();

        if !self.shared.start_claimed.swap(true, Ordering::AcqRel) {
            // never started: settle directly on the scheduler
            let shared = self.shared.clone();
            let _ = self.shared.scheduler.spawn(move || {
                Box::pin(async move {
                    if let Some(ctx) = WorkflowCtx::current() {
                        settle(&ctx, Err(WorkflowError::Cancelled), false).await;
                    } else {
                        shared.status_tx.send_replace(WorkflowStatus::Canceled);
                    }
                })
            });
        }
        self.wait_for_terminal().await;
    }

    /// Force the workflow into `Faulted` with `error`, overriding any natural
    /// completion; fails once the workflow is terminal
    #[instrument(skip_all, fields(workflow = %self.shared.name))]
    pub async fn stop(&self, error: WorkflowError) -> Result<()> {
        if self.status().is_terminal() {
            return Err(WorkflowError::invalid_usage(
                "cannot stop a workflow in a terminal status",
            ));
        }
        *self.shared.stop_requested.lock() = Some(error);
        self.shared.root_scope.cancel();

        if !self.shared.start_claimed.swap(true, Ordering::AcqRel) {
            let _ = self.shared.scheduler.spawn(move || {
                Box::pin(async move {
                    if let Some(ctx) = WorkflowCtx::current() {
                        settle(&ctx, Err(WorkflowError::Cancelled), false).await;
                    }
                })
            });
        }
        self.wait_for_terminal().await;
        Ok(())
    }

    async fn wait_for_started_or_cancelled(&self) -> Result<()> {
        tokio::select! {
            started = self.wait_for_started() => started,
            _ = self.shared.root_scope.cancelled() => Err(WorkflowError::Cancelled),
        }
    }

    /// Execute `action` (primary name or synonym) with empty parameters
    pub async fn execute_action(&self, action: &str) -> Result<Option<Value>> {
        self.execute_action_with(action, NamedValues::new(), true)
            .await
    }

    /// Execute `action` with parameters
    ///
    /// Resolution failures raise `NotFound`; a disallowed action raises
    /// `InvalidUsage` when `throw_not_allowed`, and is a silent no-op
    /// otherwise.
    #[instrument(skip(self, parameters), fields(workflow = %self.shared.name))]
    pub async fn execute_action_with(
        &self,
        action: &str,
        parameters: NamedValues,
        throw_not_allowed: bool,
    ) -> Result<Option<Value>> {
        // resolve on the scheduler so the registry is never touched off-thread
        let name = action.to_string();
        let primary = self
            .shared
            .scheduler
            .run_via_scheduler(move || {
                WorkflowCtx::current()
                    .ok_or_else(|| WorkflowError::invalid_usage("workflow thread unavailable"))
                    .and_then(|ctx| ctx.resolve_action(&name))
            })
            .await??;

        self.wait_for_started_or_cancelled().await?;

        let shared = self.shared.clone();
        self.shared
            .scheduler
            .run_task_via_scheduler(move || {
                Box::pin(async move {
                    let Some(ctx) = WorkflowCtx::current() else {
                        return Err(WorkflowError::invalid_usage("workflow thread unavailable"));
                    };
                    with_scope(
                        shared.root_scope.clone(),
                        ctx.execute_action_on_thread(primary, parameters, throw_not_allowed),
                    )
                    .await
                })
            })
            .await
    }

    /// Primary names of actions currently allowed and not hidden, in
    /// configuration order; synonyms are never listed
    pub async fn get_available_actions(&self, parameters: NamedValues) -> Result<Vec<String>> {
        self.wait_for_started_or_cancelled().await?;
        self.shared
            .scheduler
            .run_via_scheduler(move || {
                WorkflowCtx::current()
                    .ok_or_else(|| WorkflowError::invalid_usage("workflow thread unavailable"))
                    .map(|ctx| ctx.available_actions(&parameters))
            })
            .await?
    }

    /// Snapshot of the event log; readable even after a terminal status
    pub fn event_log(&self) -> Vec<LoggedEvent> {
        self.shared.event_log.lock().iter().cloned().collect()
    }

    /// Execute an action and decode its result value; an action without a
    /// result yields the type's zero value
    pub async fn execute_action_as<T: ValueCodec>(
        &self,
        action: &str,
        parameters: NamedValues,
    ) -> Result<T> {
        match self.execute_action_with(action, parameters, true).await? {
            Some(value) => T::from_value(&value),
            None => Ok(T::zero()),
        }
    }

    /// Read a data field from outside the workflow
    pub async fn get_data_field<T: ValueCodec + Send + 'static>(&self, name: &str) -> Result<T> {
        let name = name.to_string();
        self.do_workflow_task(move |ctx| ctx.get_data_field(&name), false)
            .await
    }

    /// Run `f` on the workflow thread once the workflow has started
    ///
    /// With `force_execution` the job runs even before start and after
    /// cancellation; without it, a cancelled workflow yields `Cancelled`
    /// without enqueuing.
    pub async fn do_workflow_task<R, F>(&self, f: F, force_execution: bool) -> Result<R>
    where
        F: FnOnce(&WorkflowCtx) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        if !force_execution {
            self.wait_for_started_or_cancelled().await?;
            if self.shared.root_scope.is_cancelled() {
                return Err(WorkflowError::Cancelled);
            }
        }
        self.shared
            .scheduler
            .run_via_scheduler(move || {
                WorkflowCtx::current()
                    .ok_or_else(|| WorkflowError::invalid_usage("workflow thread unavailable"))
                    .and_then(|ctx| f(&ctx))
            })
            .await?
    }

    /// Async variant of [`Self::do_workflow_task`]
    pub async fn do_workflow_task_async<R, F>(&self, f: F, force_execution: bool) -> Result<R>
    where
        F: FnOnce(WorkflowCtx) -> LocalBoxFuture<'static, Result<R>> + Send + 'static,
        R: Send + 'static,
    {
        if !force_execution {
            self.wait_for_started_or_cancelled().await?;
            if self.shared.root_scope.is_cancelled() {
                return Err(WorkflowError::Cancelled);
            }
        }
        let shared = self.shared.clone();
        self.shared
            .scheduler
            .run_task_via_scheduler(move || {
                Box::pin(async move {
                    let Some(ctx) = WorkflowCtx::current() else {
                        return Err(WorkflowError::invalid_usage("workflow thread unavailable"));
                    };
                    with_scope(shared.root_scope.clone(), f(ctx)).await
                })
            })
            .await
    }

    /// Completes when the workflow is ready: no operation (root, inner, or
    /// pending) is active on its gate
    pub async fn wait_for_ready(&self) -> Result<()> {
        self.do_workflow_task_async(
            |ctx| Box::pin(async move { ctx.gate().ready().await }),
            false,
        )
        .await
    }

    /// The workflow's root cancellation scope
    pub fn root_scope(&self) -> CancelScope {
        self.shared.root_scope.clone()
    }
}

async fn run_lifecycle(ctx: WorkflowCtx, options: StartOptions) {
    let shared = ctx.shared.clone();

    let init_error = ctx.local.borrow_mut().init_error.take();
    if let Some(err) = init_error {
        shared.started_tx.send_replace(StartSignal::Failed);
        settle(&ctx, Err(err), false).await;
        return;
    }

    if let Some(initial) = options.initial_data {
        for (name, value) in initial.iter() {
            ctx.apply_parameter(name, value.clone());
        }
    }
    if let Some(initial) = options.initial_transient_data {
        let mut local = ctx.local.borrow_mut();
        for (name, value) in initial.iter() {
            local.transient.set(name, value.clone());
        }
    }

    if let Some(hook) = options.before_start {
        if let Err(err) = hook(&ctx) {
            debug!(workflow = %shared.name, %err, "before-start hook failed");
            shared.started_tx.send_replace(StartSignal::Failed);
            settle(&ctx, Err(err), false).await;
            return;
        }
    }

    // first save gives the repository a chance to assign the id
    if let Err(err) = ctx.save_workflow_data().await {
        shared.started_tx.send_replace(StartSignal::Failed);
        settle(&ctx, Err(err), false).await;
        return;
    }
    if shared.id.lock().is_none() {
        *shared.id.lock() = Some(WorkflowId::new());
    }
    shared.started_tx.send_replace(StartSignal::Started);
    debug!(workflow = %shared.name, id = ?shared.id.lock(), "workflow started");

    let body = {
        let logic = ctx.logic();
        let fut = logic.borrow_mut().run(ctx.clone());
        fut
    };
    let result = with_scope(shared.root_scope.clone(), body).await;
    settle(&ctx, result, true).await;
}

enum Outcome {
    Completed,
    Canceled,
    Faulted(WorkflowError),
}

async fn settle(ctx: &WorkflowCtx, body_result: Result<()>, ran_body: bool) {
    let shared = ctx.shared.clone();
    if shared.status_tx.borrow().is_terminal() {
        return;
    }

    let cancel_requested = shared.cancel_requested.load(Ordering::Acquire);
    let stop_error = shared.stop_requested.lock().take();

    let mut outcome = if let Some(err) = stop_error {
        Outcome::Faulted(err)
    } else {
        match body_result {
            Ok(()) if cancel_requested => Outcome::Canceled,
            Ok(()) => Outcome::Completed,
            Err(WorkflowError::Cancelled) if cancel_requested => Outcome::Canceled,
            Err(WorkflowError::Cancelled) => Outcome::Faulted(WorkflowError::invalid_usage(
                "workflow was cancelled unexpectedly",
            )),
            // workflow authors may convert cancellation into invalid usage
            Err(WorkflowError::InvalidUsage(_)) if cancel_requested => Outcome::Canceled,
            Err(err) => Outcome::Faulted(err),
        }
    };

    if ran_body {
        if let Outcome::Completed = outcome {
            let logic = ctx.logic();
            let completed = logic.borrow_mut().on_completed(ctx);
            if let Err(err) = completed {
                outcome = Outcome::Faulted(err);
            }
        }
    }

    let id = *shared.id.lock();
    let repository = ctx.local.borrow().repository.clone();

    let status = match outcome {
        Outcome::Completed => {
            ctx.log_event("WorkflowCompleted", None);
            let mark = match &repository {
                Some(repo) => repo.mark_workflow_as_completed(id).await,
                None => Ok(()),
            };
            match mark {
                Ok(()) => WorkflowStatus::Completed,
                Err(err) => {
                    // completion demoted; the failed mark was the one
                    // terminal callback this workflow gets
                    warn!(workflow = %shared.name, %err, "mark-completed failed");
                    let fault = WorkflowError::fault(err);
                    ctx.log_event_with_error("WorkflowFaulted", &fault);
                    *shared.fault.lock() = Some(fault);
                    WorkflowStatus::Faulted
                }
            }
        }
        Outcome::Canceled => {
            ctx.log_event("WorkflowCanceled", None);
            if let Some(repo) = &repository {
                if let Err(err) = repo.mark_workflow_as_canceled(id).await {
                    warn!(workflow = %shared.name, %err, "mark-canceled failed");
                }
            }
            WorkflowStatus::Canceled
        }
        Outcome::Faulted(fault) => {
            ctx.log_event_with_error("WorkflowFaulted", &fault);
            if let Some(repo) = &repository {
                if let Err(err) = repo.mark_workflow_as_failed(id, fault.to_string()).await {
                    warn!(workflow = %shared.name, %err, "mark-failed failed");
                }
            }
            *shared.fault.lock() = Some(fault);
            WorkflowStatus::Faulted
        }
    };

    // freeze the instance: cancel the scope tree, the gate, and pending
    // waiters, then stop accepting jobs
    shared.root_scope.cancel();
    {
        let mut local = ctx.local.borrow_mut();
        local.gate.cancel();
        local.activation.on_scope_canceled(&shared.root_scope);
        local.action_waiters.clear();
        local.exported.clear();
    }
    if *shared.started_tx.borrow() == StartSignal::NotStarted {
        shared.started_tx.send_replace(StartSignal::Failed);
    }
    info!(workflow = %shared.name, ?status, "workflow reached terminal status");
    shared.status_tx.send_replace(status);

    // tasks woken by the freeze (in-flight actions waiting on exported
    // operations) must observe it before the job queue closes
    tokio::task::yield_now().await;
    shared.scheduler.shutdown();
}

impl WorkflowCtx {
    /// The context of the calling workflow thread, when there is one
    pub fn current() -> Option<WorkflowCtx> {
        CURRENT_CTX.with(|c| c.borrow().clone())
    }

    pub fn name(&self) -> String {
        self.shared.name.clone()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.shared.clock.clone()
    }

    pub fn status(&self) -> WorkflowStatus {
        *self.shared.status_tx.borrow()
    }

    pub fn id(&self) -> Option<WorkflowId> {
        *self.shared.id.lock()
    }

    /// Assign the workflow id; a second assignment fails
    pub fn set_id(&self, id: WorkflowId) -> Result<()> {
        let mut slot = self.shared.id.lock();
        if slot.is_some() {
            return Err(WorkflowError::invalid_usage("workflow id is already set"));
        }
        *slot = Some(id);
        Ok(())
    }

    /// The workflow's root cancellation scope
    pub fn root_scope(&self) -> CancelScope {
        self.shared.root_scope.clone()
    }

    pub(crate) fn logic(&self) -> Rc<RefCell<Box<dyn WorkflowLogic>>> {
        self.local.borrow().logic.clone()
    }

    pub(crate) fn gate(&self) -> Rc<OperationGate> {
        self.local.borrow().gate.clone()
    }

    pub(crate) fn activation(&self) -> Rc<ActivationDatesManager> {
        self.local.borrow().activation.clone()
    }

    /// Declare a data field; valid during `on_init`
    pub fn declare_data_field(&self, descriptor: DataFieldDescriptor) -> Result<()> {
        self.local.borrow_mut().metadata.declare(descriptor)
    }

    /// Field declarations, for inspection
    pub fn data_field_names(&self) -> Vec<String> {
        self.local
            .borrow()
            .metadata
            .fields()
            .map(|d| d.name.clone())
            .collect()
    }

    /// Typed data field read; an absent field yields the type's zero value
    pub fn get_data_field<T: ValueCodec>(&self, name: &str) -> Result<T> {
        let local = self.local.borrow();
        let Some(descriptor) = local.metadata.get(name) else {
            return Err(WorkflowError::not_found(format!("data field '{name}'")));
        };
        let store = if descriptor.transient {
            &local.transient
        } else {
            &local.data
        };
        match store.get(name) {
            Some(value) => T::from_value(value),
            None => Ok(T::zero()),
        }
    }

    /// Typed data field write; writing a zero value to a persistent field
    /// removes the entry
    pub fn set_data_field<T: ValueCodec>(&self, name: &str, value: T) -> Result<()> {
        let encoded = value.to_value();
        let mut local = self.local.borrow_mut();
        let Some(descriptor) = local.metadata.get(name) else {
            return Err(WorkflowError::not_found(format!("data field '{name}'")));
        };
        let transient = descriptor.transient;
        if transient {
            local.transient.set(name, encoded);
        } else if encoded.is_zero() {
            local.data.remove(name);
        } else {
            local.data.set(name, encoded);
        }
        Ok(())
    }

    fn apply_parameter(&self, name: &str, value: Value) {
        let mut local = self.local.borrow_mut();
        let Some(descriptor) = local.metadata.get(name) else {
            return;
        };
        let transient = descriptor.transient;
        if transient {
            local.transient.set(name, value);
        } else if value.is_zero() {
            local.data.remove(name);
        } else {
            local.data.set(name, value);
        }
    }

    /// Register an action; a duplicate primary name or synonym fails
    pub fn configure_action(&self, config: ActionConfig) -> Result<()> {
        let mut local = self.local.borrow_mut();
        if local.action_lookup.contains_key(&config.name) {
            return Err(WorkflowError::invalid_usage(format!(
                "action '{}' is already configured",
                config.name
            )));
        }
        for synonym in &config.synonyms {
            if local.action_lookup.contains_key(synonym) {
                return Err(WorkflowError::invalid_usage(format!(
                    "action synonym '{synonym}' is already configured"
                )));
            }
        }
        local
            .action_lookup
            .insert(config.name.clone(), config.name.clone());
        for synonym in &config.synonyms {
            local
                .action_lookup
                .insert(synonym.clone(), config.name.clone());
        }
        local.actions.push(ActionDescriptor {
            primary: config.name,
            synonyms: config.synonyms,
            metadata: config.metadata,
            hidden: config.hidden,
            handler: config.handler,
            allowed: config.allowed,
        });
        Ok(())
    }

    /// Metadata attached to a configured action
    pub fn action_metadata(&self, action: &str) -> Result<NamedValues> {
        let primary = self.resolve_action(action)?;
        let local = self.local.borrow();
        local
            .actions
            .iter()
            .find(|a| a.primary == primary)
            .map(|a| a.metadata.clone())
            .ok_or_else(|| WorkflowError::not_found(format!("action '{action}'")))
    }

    /// Synonyms registered for a configured action
    pub fn action_synonyms(&self, action: &str) -> Result<Vec<String>> {
        let primary = self.resolve_action(action)?;
        let local = self.local.borrow();
        local
            .actions
            .iter()
            .find(|a| a.primary == primary)
            .map(|a| a.synonyms.clone())
            .ok_or_else(|| WorkflowError::not_found(format!("action '{action}'")))
    }

    pub(crate) fn resolve_action(&self, name: &str) -> Result<String> {
        self.local
            .borrow()
            .action_lookup
            .get(name)
            .cloned()
            .ok_or_else(|| WorkflowError::not_found(format!("action '{name}'")))
    }

    fn action_allowed(&self, primary: &str, parameters: &NamedValues) -> bool {
        let logic = self.logic();
        if let Some(decision) = logic.borrow().is_action_allowed(self, primary, parameters) {
            if !decision {
                return false;
            }
        }
        let (state_hook, predicate) = {
            let local = self.local.borrow();
            let predicate = local
                .actions
                .iter()
                .find(|a| a.primary == primary)
                .and_then(|a| a.allowed.clone());
            (local.state_allowance.clone(), predicate)
        };
        if let Some(hook) = state_hook {
            if let Some(decision) = hook(primary) {
                if !decision {
                    return false;
                }
            }
        }
        if let Some(predicate) = predicate {
            if !predicate(self, parameters) {
                return false;
            }
        }
        true
    }

    fn available_actions(&self, parameters: &NamedValues) -> Vec<String> {
        let primaries: Vec<(String, bool)> = self
            .local
            .borrow()
            .actions
            .iter()
            .map(|a| (a.primary.clone(), a.hidden))
            .collect();
        primaries
            .into_iter()
            .filter(|(_, hidden)| !hidden)
            .map(|(name, _)| name)
            .filter(|name| self.action_allowed(name, parameters))
            .collect()
    }

    /// Execute an action from workflow code (state handlers, continuations)
    pub async fn execute_action(&self, action: &str, parameters: NamedValues) -> Result<Option<Value>> {
        let primary = self.resolve_action(action)?;
        self.execute_action_on_thread(primary, parameters, true).await
    }

    pub(crate) async fn execute_action_on_thread(
        &self,
        primary: String,
        mut parameters: NamedValues,
        throw_not_allowed: bool,
    ) -> Result<Option<Value>> {
        if !self.action_allowed(&primary, &parameters) {
            if throw_not_allowed {
                return Err(WorkflowError::invalid_usage(format!(
                    "action '{primary}' is not allowed"
                )));
            }
            debug!(workflow = %self.shared.name, action = %primary, "disallowed action ignored");
            return Ok(None);
        }

        let gate = self.gate();
        let op = if gate.has_current_operation() {
            gate.try_start_operation()?
        } else {
            gate.create_operation()?;
            gate.try_start_operation()?
        };
        let Some(op) = op else {
            return Err(WorkflowError::Cancelled);
        };

        parameters.set(ACTION_PARAMETER, Value::String(primary.clone()));
        for (name, value) in parameters.clone().iter() {
            self.apply_parameter(name, value.clone());
        }

        let handler = {
            let local = self.local.borrow();
            local
                .actions
                .iter()
                .find(|a| a.primary == primary)
                .and_then(|a| a.handler.clone())
        };

        let invoked = match handler {
            Some(handler) => handler(self.clone(), parameters.clone()).await,
            None => Ok(None),
        };

        match invoked {
            Ok(result) => {
                {
                    let mut stats = self.shared.action_stats.lock();
                    *stats.entry(primary.clone()).or_insert(0) += 1;
                }
                self.log_event("ActionExecuted", Some(&parameters));
                let _ = self.shared.action_executed_tx.send(ActionEvent {
                    name: primary.clone(),
                    parameters: parameters.clone(),
                });

                let disposals = self.notify_action_waiters(&primary, &parameters);
                for rx in disposals {
                    // an error means the gate shut down; either way the
                    // exported operation is gone
                    let _ = rx.await;
                }

                op.dispose();
                self.save_workflow_data().await?;
                Ok(result)
            }
            Err(err) => {
                op.dispose();
                Err(err)
            }
        }
    }

    pub(crate) fn register_action_waiter(
        &self,
        primary: &str,
        export_operation: bool,
    ) -> oneshot::Receiver<NamedValues> {
        let (tx, rx) = oneshot::channel();
        self.local
            .borrow_mut()
            .action_waiters
            .entry(primary.to_string())
            .or_default()
            .push(ActionWaiter {
                tx,
                export_operation,
            });
        rx
    }

    fn notify_action_waiters(
        &self,
        primary: &str,
        parameters: &NamedValues,
    ) -> Vec<oneshot::Receiver<()>> {
        let waiters = self
            .local
            .borrow_mut()
            .action_waiters
            .remove(primary)
            .unwrap_or_default();
        let mut disposals = Vec::new();

        for waiter in waiters {
            if waiter.tx.is_closed() {
                continue;
            }
            let mut payload = parameters.clone();
            if waiter.export_operation {
                if let Some(handle) = self.export_operation(&mut disposals) {
                    payload.set(ACTION_OPERATION_PARAMETER, Value::Handle(handle));
                }
            }
            let _ = waiter.tx.send(payload);
        }
        disposals
    }

    fn export_operation(&self, disposals: &mut Vec<oneshot::Receiver<()>>) -> Option<OperationHandle> {
        let gate = self.gate();
        let op = match gate.try_start_operation() {
            Ok(Some(op)) => op,
            _ => return None,
        };
        let (disposed_tx, disposed_rx) = oneshot::channel();
        let id = {
            let mut local = self.local.borrow_mut();
            let id = local.next_export_id;
            local.next_export_id += 1;
            local.exported.insert(id, ExportedOperation { op, disposed_tx });
            id
        };
        disposals.push(disposed_rx);

        let shared = self.shared.clone();
        Some(OperationHandle::new(id, move |id| {
            let _ = shared.scheduler.enqueue(move || {
                if let Some(ctx) = WorkflowCtx::current() {
                    ctx.dispose_exported(id);
                }
            });
        }))
    }

    fn dispose_exported(&self, id: u64) {
        let entry = self.local.borrow_mut().exported.remove(&id);
        if let Some(entry) = entry {
            entry.op.dispose();
            let _ = entry.disposed_tx.send(());
        }
    }

    /// Append an event to the bounded log, subject to the logic's filter
    pub fn log_event(&self, name: &str, parameters: Option<&NamedValues>) {
        let logic = self.logic();
        if !logic.borrow().filter_event(name) {
            return;
        }
        let event = LoggedEvent {
            name: name.to_string(),
            parameters: parameters.map(|p| p.to_display_map()).unwrap_or_default(),
            timestamp: self.shared.clock.now(),
        };
        let mut log = self.shared.event_log.lock();
        log.push_back(event);
        while log.len() > self.shared.event_capacity {
            log.pop_front();
        }
    }

    fn log_event_with_error(&self, name: &str, error: &WorkflowError) {
        let params = NamedValues::new().with("exception", Value::String(error.to_string()));
        self.log_event(name, Some(&params));
    }

    /// Persist the durable view through the repository, if one is configured
    ///
    /// The repository may assign the workflow id on first save.
    pub async fn save_workflow_data(&self) -> Result<()> {
        let next_activation = self.activation().next_activation_date();
        *self.shared.next_activation.lock() = next_activation;

        let repository = self.local.borrow().repository.clone();
        let Some(repository) = repository else {
            return Ok(());
        };
        let snapshot = WorkflowSnapshot {
            id: self.id(),
            data: self.local.borrow().data.clone(),
            next_activation,
        };
        let assigned = repository
            .save_workflow_data(snapshot)
            .await
            .map_err(WorkflowError::fault)?;
        if let Some(id) = assigned {
            if self.id().is_none() {
                self.set_id(id)?;
            }
        }
        Ok(())
    }

    pub(crate) fn set_state_allowance(&self, hook: Option<StateAllowanceHook>) {
        self.local.borrow_mut().state_allowance = hook;
    }

    pub(crate) fn notify_state_changed(&self, to: String) {
        let from = {
            let mut current = self.shared.current_state.lock();
            current.replace(to.clone())
        };
        {
            let mut visited = self.shared.visited_states.lock();
            if !visited.contains(&to) {
                visited.push(to.clone());
            }
        }
        let _ = self
            .shared
            .state_changed_tx
            .send(StateChangeEvent { from, to });
    }

    pub(crate) fn current_state_name(&self) -> Option<String> {
        self.shared.current_state.lock().clone()
    }

    pub(crate) fn has_data_field(&self, name: &str) -> bool {
        self.local.borrow().metadata.contains(name)
    }

    pub(crate) fn visited_state_names(&self) -> Vec<String> {
        self.shared.visited_states.lock().clone()
    }

    /// Counter access for operators
    pub fn times_executed(&self, action: &str) -> u64 {
        self.shared
            .action_stats
            .lock()
            .get(action)
            .copied()
            .unwrap_or(0)
    }
}
