//! State descriptors and fluent configuration chains

use std::any::Any;
use std::cell::RefCell;
use std::future::Future;
use std::marker::PhantomData;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use futures::future::LocalBoxFuture;

use crate::error::{Result, WorkflowError};
use crate::machine::instance::InstanceState;
use crate::machine::{StateId, StateKey};
use crate::values::NamedValues;
use crate::workflow::WorkflowCtx;

/// Erased payload a trigger fired with
pub type TriggerPayload = Rc<dyn Any>;

pub(crate) type EnterHandler<S, I> =
    Rc<dyn Fn(StateCtx<S, I>) -> LocalBoxFuture<'static, Result<()>>>;
pub(crate) type TriggerHandler<S, I> =
    Rc<dyn Fn(StateCtx<S, I>, TriggerPayload) -> LocalBoxFuture<'static, Result<()>>>;
pub(crate) type GuardPredicate<S, I> = Rc<dyn Fn(&StateCtx<S, I>) -> bool>;
pub(crate) type AsyncFactory<S, I> =
    Rc<dyn Fn(StateCtx<S, I>) -> LocalBoxFuture<'static, Result<TriggerPayload>>>;
pub(crate) type DateFactory<S, I> = Rc<dyn Fn(&StateCtx<S, I>) -> DateTime<Utc>>;

/// Context handed to state handlers; wraps the workflow context and the
/// running instance
pub struct StateCtx<S: StateKey, I: StateKey> {
    pub(crate) workflow: WorkflowCtx,
    pub(crate) instance: Rc<InstanceState<S, I>>,
}

impl<S: StateKey, I: StateKey> Clone for StateCtx<S, I> {
    fn clone(&self) -> Self {
        Self {
            workflow: self.workflow.clone(),
            instance: self.instance.clone(),
        }
    }
}

impl<S: StateKey, I: StateKey> StateCtx<S, I> {
    /// The owning workflow's context
    pub fn workflow(&self) -> &WorkflowCtx {
        &self.workflow
    }

    /// Path from root to the current leaf
    pub fn current_path(&self) -> Vec<StateId<S, I>> {
        self.instance.path.borrow().clone()
    }

    /// Redirect the in-progress entry to another state
    ///
    /// Applied after the current handler returns; redirecting to the state
    /// being entered is a stay, not a re-entry.
    pub fn go_to(&self, target: StateId<S, I>) {
        *self.instance.redirect.borrow_mut() = Some(target);
    }
}

pub(crate) enum ChainStep<S: StateKey, I: StateKey> {
    Run(EnterHandler<S, I>),
    GoTo(StateId<S, I>),
}

impl<S: StateKey, I: StateKey> Clone for ChainStep<S, I> {
    fn clone(&self) -> Self {
        match self {
            ChainStep::Run(handler) => ChainStep::Run(handler.clone()),
            ChainStep::GoTo(target) => ChainStep::GoTo(target.clone()),
        }
    }
}

pub(crate) struct Guard<S: StateKey, I: StateKey> {
    pub(crate) predicate: GuardPredicate<S, I>,
    pub(crate) description: String,
}

pub(crate) struct TransitionBranch<S: StateKey, I: StateKey> {
    pub(crate) guard: Guard<S, I>,
    pub(crate) target: StateId<S, I>,
}

pub(crate) enum TriggerSource<S: StateKey, I: StateKey> {
    Async(AsyncFactory<S, I>),
    Actions {
        names: Vec<String>,
        any_execution: bool,
    },
    Date(DateFactory<S, I>),
}

pub(crate) struct TriggerConf<S: StateKey, I: StateKey> {
    pub(crate) source: TriggerSource<S, I>,
    pub(crate) description: Option<String>,
    pub(crate) hidden: bool,
    pub(crate) handlers: Vec<TriggerHandler<S, I>>,
    pub(crate) branches: Vec<TransitionBranch<S, I>>,
    pub(crate) main_guards: Vec<Guard<S, I>>,
    pub(crate) main_target: Option<StateId<S, I>>,
}

impl<S: StateKey, I: StateKey> TriggerConf<S, I> {
    pub(crate) fn display_description(&self) -> String {
        if let Some(description) = &self.description {
            return description.clone();
        }
        match &self.source {
            TriggerSource::Actions { names, .. } => names.join(" | "),
            TriggerSource::Async(_) => "<async>".to_string(),
            TriggerSource::Date(_) => "<date>".to_string(),
        }
    }
}

pub(crate) struct StateConf<S: StateKey, I: StateKey> {
    pub(crate) id: StateId<S, I>,
    pub(crate) parent: Option<StateId<S, I>>,
    pub(crate) description: Option<String>,
    pub(crate) hidden: bool,
    pub(crate) on_enter: Vec<ChainStep<S, I>>,
    pub(crate) on_activate: Vec<ChainStep<S, I>>,
    pub(crate) on_exit: Vec<ChainStep<S, I>>,
    pub(crate) triggers: Vec<Rc<RefCell<TriggerConf<S, I>>>>,
    pub(crate) allowed_actions: Vec<String>,
    pub(crate) disallowed_actions: Vec<String>,
}

impl<S: StateKey, I: StateKey> StateConf<S, I> {
    pub(crate) fn new(id: StateId<S, I>) -> Self {
        Self {
            id,
            parent: None,
            description: None,
            hidden: false,
            on_enter: Vec::new(),
            on_activate: Vec::new(),
            on_exit: Vec::new(),
            triggers: Vec::new(),
            allowed_actions: Vec::new(),
            disallowed_actions: Vec::new(),
        }
    }
}

/// Fluent handle to one configured state
pub struct StateHandle<S: StateKey, I: StateKey> {
    pub(crate) conf: Rc<RefCell<StateConf<S, I>>>,
}

impl<S: StateKey, I: StateKey> Clone for StateHandle<S, I> {
    fn clone(&self) -> Self {
        Self {
            conf: self.conf.clone(),
        }
    }
}

#[derive(Clone, Copy)]
pub(crate) enum HandlerKind {
    Enter,
    Activate,
    Exit,
}

impl<S: StateKey, I: StateKey> StateHandle<S, I> {
    /// The configured key
    pub fn id(&self) -> StateId<S, I> {
        self.conf.borrow().id.clone()
    }

    /// Make this state a child of `parent`
    pub fn substate_of(&self, parent: &StateHandle<S, I>) -> Self {
        self.substate_of_key(parent.id())
    }

    /// Make this state a child of the state keyed `parent`
    pub fn substate_of_key(&self, parent: StateId<S, I>) -> Self {
        self.conf.borrow_mut().parent = Some(parent);
        self.clone()
    }

    /// Attach a human-readable description, used by graph export
    pub fn has_description(&self, description: impl Into<String>) -> Self {
        self.conf.borrow_mut().description = Some(description.into());
        self.clone()
    }

    /// Hide the state from graph export
    pub fn hide(&self) -> Self {
        self.conf.borrow_mut().hidden = true;
        self.clone()
    }

    /// Allow the listed actions while this state is on the current path
    pub fn allow_actions<A: IntoIterator<Item = N>, N: Into<String>>(&self, actions: A) -> Self {
        self.conf
            .borrow_mut()
            .allowed_actions
            .extend(actions.into_iter().map(Into::into));
        self.clone()
    }

    /// Disallow the listed actions; a child's disallow beats a parent's allow
    pub fn disallow_actions<A: IntoIterator<Item = N>, N: Into<String>>(&self, actions: A) -> Self {
        self.conf
            .borrow_mut()
            .disallowed_actions
            .extend(actions.into_iter().map(Into::into));
        self.clone()
    }

    /// Chain of handlers run when the state is entered
    pub fn on_enter(&self) -> HandlerChain<S, I> {
        HandlerChain {
            conf: self.conf.clone(),
            kind: HandlerKind::Enter,
        }
    }

    /// Chain of handlers run instead of `on_enter` on the first entry of a
    /// restored run
    pub fn on_activate(&self) -> HandlerChain<S, I> {
        HandlerChain {
            conf: self.conf.clone(),
            kind: HandlerKind::Activate,
        }
    }

    /// Chain of handlers run when the state is exited
    pub fn on_exit(&self) -> HandlerChain<S, I> {
        HandlerChain {
            conf: self.conf.clone(),
            kind: HandlerKind::Exit,
        }
    }

    /// Trigger firing when the factory's task completes
    pub fn on_async<T, F, Fut>(&self, factory: F) -> TriggerChain<S, I, T>
    where
        T: 'static,
        F: Fn(StateCtx<S, I>) -> Fut + 'static,
        Fut: Future<Output = Result<T>> + 'static,
    {
        let erased: AsyncFactory<S, I> = Rc::new(move |ctx| {
            let fut = factory(ctx);
            Box::pin(async move {
                let value = fut.await?;
                Ok(Rc::new(value) as TriggerPayload)
            })
        });
        self.push_trigger(TriggerSource::Async(erased))
    }

    /// Trigger firing when the named action executes
    pub fn on_action(&self, action: impl Into<String>) -> TriggerChain<S, I, NamedValues> {
        let name = action.into();
        let mut chain = self.push_trigger(TriggerSource::Actions {
            names: vec![name.clone()],
            any_execution: false,
        });
        chain = chain.with_description(name);
        chain
    }

    /// Trigger firing when any of the named actions executes
    ///
    /// With `any_execution`, an action that already ran before the state was
    /// entered fires the trigger immediately.
    pub fn on_actions<A: IntoIterator<Item = N>, N: Into<String>>(
        &self,
        description: impl Into<String>,
        any_execution: bool,
        actions: A,
    ) -> TriggerChain<S, I, NamedValues> {
        self.push_trigger(TriggerSource::Actions {
            names: actions.into_iter().map(Into::into).collect(),
            any_execution,
        })
        .with_description(description)
    }

    /// Trigger firing when the clock reaches the computed date; the date is
    /// re-evaluated every time the trigger is armed
    pub fn on_date<F>(&self, date: F) -> TriggerChain<S, I, ()>
    where
        F: Fn(&StateCtx<S, I>) -> DateTime<Utc> + 'static,
    {
        self.push_trigger(TriggerSource::Date(Rc::new(date)))
    }

    fn push_trigger<T>(&self, source: TriggerSource<S, I>) -> TriggerChain<S, I, T> {
        let trigger = Rc::new(RefCell::new(TriggerConf {
            source,
            description: None,
            hidden: false,
            handlers: Vec::new(),
            branches: Vec::new(),
            main_guards: Vec::new(),
            main_target: None,
        }));
        self.conf.borrow_mut().triggers.push(trigger.clone());
        TriggerChain {
            trigger,
            _payload: PhantomData,
        }
    }
}

/// Builder for enter/activate/exit handler chains
pub struct HandlerChain<S: StateKey, I: StateKey> {
    conf: Rc<RefCell<StateConf<S, I>>>,
    kind: HandlerKind,
}

impl<S: StateKey, I: StateKey> HandlerChain<S, I> {
    fn push(&self, step: ChainStep<S, I>) {
        let mut conf = self.conf.borrow_mut();
        match self.kind {
            HandlerKind::Enter => conf.on_enter.push(step),
            HandlerKind::Activate => conf.on_activate.push(step),
            HandlerKind::Exit => conf.on_exit.push(step),
        }
    }

    /// Append a handler; declaration order is execution order
    pub fn run<F, Fut>(self, handler: F) -> Self
    where
        F: Fn(StateCtx<S, I>) -> Fut + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.push(ChainStep::Run(Rc::new(move |ctx| Box::pin(handler(ctx)))));
        self
    }

    /// Append a synchronous handler
    pub fn run_sync<F>(self, handler: F) -> Self
    where
        F: Fn(&StateCtx<S, I>) -> Result<()> + 'static,
    {
        self.push(ChainStep::Run(Rc::new(move |ctx| {
            let outcome = handler(&ctx);
            Box::pin(async move { outcome })
        })));
        self
    }

    /// Append a redirect evaluated after the preceding handlers
    pub fn go_to(self, target: StateId<S, I>) -> Self {
        self.push(ChainStep::GoTo(target));
        self
    }
}

/// Builder for one trigger's handlers, guards, and transition branches
pub struct TriggerChain<S: StateKey, I: StateKey, T> {
    trigger: Rc<RefCell<TriggerConf<S, I>>>,
    _payload: PhantomData<T>,
}

impl<S: StateKey, I: StateKey, T: Clone + 'static> TriggerChain<S, I, T> {
    /// Consume the trigger's payload when it fires
    pub fn run<F, Fut>(self, handler: F) -> Self
    where
        F: Fn(StateCtx<S, I>, T) -> Fut + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        let typed: TriggerHandler<S, I> = Rc::new(move |ctx, payload| {
            match payload.downcast_ref::<T>() {
                Some(value) => Box::pin(handler(ctx, value.clone())),
                None => Box::pin(async {
                    Err(WorkflowError::invalid_usage(
                        "trigger payload type mismatch",
                    ))
                }),
            }
        });
        self.trigger.borrow_mut().handlers.push(typed);
        self
    }
}

impl<S: StateKey, I: StateKey, T> TriggerChain<S, I, T> {
    /// Attach the event description used in graph labels
    pub fn with_description(self, description: impl Into<String>) -> Self {
        self.trigger.borrow_mut().description = Some(description.into());
        self
    }

    /// Hide the trigger's transitions from graph export
    pub fn hide(self) -> Self {
        self.trigger.borrow_mut().hidden = true;
        self
    }

    /// Conjunctive guard on the main transition branch
    pub fn when<F>(self, predicate: F, description: impl Into<String>) -> Self
    where
        F: Fn(&StateCtx<S, I>) -> bool + 'static,
    {
        self.trigger.borrow_mut().main_guards.push(Guard {
            predicate: Rc::new(predicate),
            description: description.into(),
        });
        self
    }

    /// An ordered branch evaluated before the main `go_to`
    pub fn when_then_go_to<F>(
        self,
        predicate: F,
        target: StateId<S, I>,
        description: impl Into<String>,
    ) -> Self
    where
        F: Fn(&StateCtx<S, I>) -> bool + 'static,
    {
        self.trigger.borrow_mut().branches.push(TransitionBranch {
            guard: Guard {
                predicate: Rc::new(predicate),
                description: description.into(),
            },
            target,
        });
        self
    }

    /// The main transition target; without one the trigger handles its
    /// payload and stays in the current state
    pub fn go_to(self, target: StateId<S, I>) -> Self {
        self.trigger.borrow_mut().main_target = Some(target);
        self
    }
}
