//! Cross-workflow coordination
//!
//! The coordinator is the only shared mutable state between workflows: a
//! named registry plus a list of dependencies keyed by (source, trigger).
//! When a source workflow executes a matching action or enters a matching
//! state, the dependency handler runs on the destination workflow's
//! scheduler. Ordering across workflows exists only through these
//! dependencies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

use crate::error::{Result, WorkflowError};
use crate::values::NamedValues;
use crate::workflow::{Workflow, WorkflowStatus};

/// What fires a dependency on the source workflow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyTrigger {
    /// A successful execution of the named action
    Action(String),

    /// Entry into the named state (display form of the state key)
    State(String),
}

/// Payload handed to dependency handlers
#[derive(Clone)]
pub struct DependencyEvent {
    pub source: Workflow,
    pub destination: Workflow,

    /// Action parameters for action triggers, `None` for state triggers
    pub parameters: Option<NamedValues>,
}

type DependencyHandler =
    Arc<dyn Fn(DependencyEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Declarative description of one cross-workflow dependency
pub struct DependencyConfig {
    source: String,
    trigger: DependencyTrigger,
    destination: String,
    handler: DependencyHandler,
    on_source_canceled: Option<DependencyHandler>,
    clear_times_executed_for_action: Option<String>,
}

impl DependencyConfig {
    /// Dependency fired by an action on the source workflow
    pub fn on_action<F, Fut>(
        source: impl Into<String>,
        action: impl Into<String>,
        destination: impl Into<String>,
        handler: F,
    ) -> Self
    where
        F: Fn(DependencyEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            source: source.into(),
            trigger: DependencyTrigger::Action(action.into()),
            destination: destination.into(),
            handler: Arc::new(move |event| Box::pin(handler(event))),
            on_source_canceled: None,
            clear_times_executed_for_action: None,
        }
    }

    /// Dependency fired when the source workflow enters a state
    pub fn on_state<F, Fut>(
        source: impl Into<String>,
        state: impl Into<String>,
        destination: impl Into<String>,
        handler: F,
    ) -> Self
    where
        F: Fn(DependencyEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            source: source.into(),
            trigger: DependencyTrigger::State(state.into()),
            destination: destination.into(),
            handler: Arc::new(move |event| Box::pin(handler(event))),
            on_source_canceled: None,
            clear_times_executed_for_action: None,
        }
    }

    /// Invoke `handler` when the source workflow is cancelled
    pub fn with_on_source_canceled<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(DependencyEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_source_canceled = Some(Arc::new(move |event| Box::pin(handler(event))));
        self
    }

    /// Reset the destination's counter for `action` when the source cancels
    pub fn with_clear_times_executed(mut self, action: impl Into<String>) -> Self {
        self.clear_times_executed_for_action = Some(action.into());
        self
    }
}

struct Dependency {
    config: DependencyConfig,
    attached: AtomicBool,
}

struct Registry {
    workflows: HashMap<String, Workflow>,
    dependencies: Vec<Arc<Dependency>>,
}

struct CoordInner {
    registry: Mutex<Registry>,
    unhandled_tx: broadcast::Sender<String>,
}

/// Cross-workflow dependency registry and event router
#[derive(Clone)]
pub struct WorkflowsCoordinator {
    inner: Arc<CoordInner>,
}

impl Default for WorkflowsCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowsCoordinator {
    pub fn new() -> Self {
        let (unhandled_tx, _) = broadcast::channel(32);
        Self {
            inner: Arc::new(CoordInner {
                registry: Mutex::new(Registry {
                    workflows: HashMap::new(),
                    dependencies: Vec::new(),
                }),
                unhandled_tx,
            }),
        }
    }

    /// Register a dependency; attaches immediately when the source workflow
    /// is already known
    pub fn register_dependency(&self, config: DependencyConfig) {
        let dependency = Arc::new(Dependency {
            config,
            attached: AtomicBool::new(false),
        });
        let source = {
            let mut registry = self.inner.registry.lock();
            registry.dependencies.push(dependency.clone());
            registry.workflows.get(&dependency.config.source).cloned()
        };
        if let Some(source) = source {
            self.attach(dependency, source);
        }
    }

    /// Observe handler errors that nobody else catches
    pub fn subscribe_unhandled_errors(&self) -> broadcast::Receiver<String> {
        self.inner.unhandled_tx.subscribe()
    }

    /// Registered workflow lookup
    pub fn workflow(&self, name: &str) -> Option<Workflow> {
        self.inner.registry.lock().workflows.get(name).cloned()
    }

    /// Add a workflow under `name`; a duplicate name fails
    ///
    /// Attaches observers for every dependency sourced at this workflow, and
    /// with `initialize_dependencies`, fires handlers of dependencies whose
    /// source already satisfied the trigger historically.
    #[instrument(skip_all, fields(workflow = name))]
    pub async fn add_workflow(
        &self,
        name: &str,
        workflow: Workflow,
        initialize_dependencies: bool,
    ) -> Result<()> {
        let (sourced, incoming) = {
            let mut registry = self.inner.registry.lock();
            if registry.workflows.contains_key(name) {
                return Err(WorkflowError::invalid_usage(format!(
                    "workflow '{name}' is already registered"
                )));
            }
            registry.workflows.insert(name.to_string(), workflow.clone());

            let sourced: Vec<Arc<Dependency>> = registry
                .dependencies
                .iter()
                .filter(|d| d.config.source == name)
                .cloned()
                .collect();
            let incoming: Vec<(Arc<Dependency>, Option<Workflow>)> = registry
                .dependencies
                .iter()
                .filter(|d| d.config.destination == name)
                .map(|d| (d.clone(), registry.workflows.get(&d.config.source).cloned()))
                .collect();
            (sourced, incoming)
        };

        for dependency in sourced {
            self.attach(dependency, workflow.clone());
        }

        if initialize_dependencies {
            for (dependency, source) in incoming {
                let Some(source) = source else {
                    continue;
                };
                let satisfied = match &dependency.config.trigger {
                    DependencyTrigger::Action(action) => source.times_executed(action) > 0,
                    DependencyTrigger::State(state) => {
                        source.visited_state_names().iter().any(|s| s == state)
                    }
                };
                if satisfied {
                    debug!(
                        source = %dependency.config.source,
                        destination = %dependency.config.destination,
                        "initializing historically satisfied dependency"
                    );
                    self.spawn_invoke(dependency.clone(), source, None);
                }
            }
        }

        Ok(())
    }

    fn attach(&self, dependency: Arc<Dependency>, source: Workflow) {
        if dependency.attached.swap(true, Ordering::AcqRel) {
            return;
        }

        // subscribe before spawning so events fired right after attachment
        // are never missed
        match dependency.config.trigger.clone() {
            DependencyTrigger::Action(action) => {
                let mut rx = source.subscribe_actions();
                let coordinator = self.clone();
                let dependency = dependency.clone();
                let source = source.clone();
                tokio::spawn(async move {
                    loop {
                        match rx.recv().await {
                            Ok(event) if event.name == action => {
                                coordinator.spawn_invoke(
                                    dependency.clone(),
                                    source.clone(),
                                    Some(event.parameters),
                                );
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "dependency observer lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                });
            }
            DependencyTrigger::State(state) => {
                let mut rx = source.subscribe_state_changes();
                let coordinator = self.clone();
                let dependency = dependency.clone();
                let source = source.clone();
                tokio::spawn(async move {
                    loop {
                        match rx.recv().await {
                            Ok(event) if event.to == state => {
                                coordinator.spawn_invoke(dependency.clone(), source.clone(), None);
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "dependency observer lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                });
            }
        }

        // cancellation observer
        {
            let mut rx = source.subscribe_status();
            let coordinator = self.clone();
            tokio::spawn(async move {
                loop {
                    let status = *rx.borrow_and_update();
                    if status == WorkflowStatus::Canceled {
                        coordinator.handle_source_canceled(&dependency, &source).await;
                        return;
                    }
                    if status.is_terminal() || rx.changed().await.is_err() {
                        return;
                    }
                }
            });
        }
    }

    async fn handle_source_canceled(&self, dependency: &Arc<Dependency>, source: &Workflow) {
        let destination = self.workflow(&dependency.config.destination);
        let Some(destination) = destination else {
            return;
        };

        if let Some(action) = &dependency.config.clear_times_executed_for_action {
            if let Err(err) = destination.clear_times_executed(action).await {
                self.report_unhandled(&dependency.config, &err.to_string());
            }
        }
        if let Some(handler) = dependency.config.on_source_canceled.clone() {
            let event = DependencyEvent {
                source: source.clone(),
                destination: destination.clone(),
                parameters: None,
            };
            let outcome = run_on_destination(&destination, handler, event).await;
            if let Err(err) = outcome {
                self.report_unhandled(&dependency.config, &err.to_string());
            }
        }
    }

    fn spawn_invoke(
        &self,
        dependency: Arc<Dependency>,
        source: Workflow,
        parameters: Option<NamedValues>,
    ) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let Some(destination) = coordinator.workflow(&dependency.config.destination) else {
                debug!(
                    destination = %dependency.config.destination,
                    "dependency fired before destination was registered"
                );
                return;
            };
            let event = DependencyEvent {
                source,
                destination: destination.clone(),
                parameters,
            };
            let handler = dependency.config.handler.clone();
            let outcome = run_on_destination(&destination, handler, event).await;
            if let Err(err) = outcome {
                coordinator.report_unhandled(&dependency.config, &err.to_string());
            }
        });
    }

    fn report_unhandled(&self, config: &DependencyConfig, error: &str) {
        warn!(
            source = %config.source,
            destination = %config.destination,
            %error,
            "unhandled dependency error"
        );
        let _ = self.inner.unhandled_tx.send(format!(
            "dependency {} -> {}: {}",
            config.source, config.destination, error
        ));
    }
}

/// Dependency handlers run on the destination workflow's scheduler
async fn run_on_destination(
    destination: &Workflow,
    handler: DependencyHandler,
    event: DependencyEvent,
) -> Result<()> {
    destination
        .do_workflow_task_async(
            move |_ctx| {
                Box::pin(async move { handler(event).await.map_err(WorkflowError::fault) })
            },
            false,
        )
        .await
}
