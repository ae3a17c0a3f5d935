//! Hierarchical state machine engine
//!
//! States form a forest: each state may have a parent, and entering a leaf
//! enters every ancestor first. A machine is configured through the fluent
//! API on [`StateHandle`] and then driven under a workflow with
//! [`StateMachine::run`]. The engine guarantees root-to-leaf enter order and
//! leaf-to-root exit order, routes actions leaf-first along the current path,
//! and supports restoration from recorded history.

mod instance;
mod state;

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkflowError};
use crate::workflow::WorkflowCtx;

pub use instance::{StateMachineInstance, StateTransition};
pub use state::{HandlerChain, StateCtx, StateHandle, TriggerChain, TriggerPayload};

use state::{StateConf, TriggerConf};

/// Requirements on a state key type
pub trait StateKey: Clone + Eq + Hash + fmt::Debug + 'static {}

impl<T: Clone + Eq + Hash + fmt::Debug + 'static> StateKey for T {}

/// A state identifier: public keys are the workflow's visible state space,
/// internal keys carry private substructure
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateId<S, I> {
    Public(S),
    Internal(I),
}

impl<S: StateKey, I: StateKey> StateId<S, I> {
    /// Display form used for the workflow state mirror and graph export
    pub fn display_name(&self) -> String {
        match self {
            StateId::Public(key) => format!("{key:?}"),
            StateId::Internal(key) => format!("{key:?}"),
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, StateId::Internal(_))
    }
}

/// One state in a graph export
#[derive(Debug, Clone, PartialEq)]
pub struct StateExport {
    pub name: String,
    pub description: Option<String>,
    pub parent: Option<String>,
    pub hidden: bool,
    pub internal: bool,
    pub transitions: Vec<TransitionExport>,
}

/// One transition edge in a graph export
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionExport {
    pub label: String,
    pub target: String,
    pub hidden: bool,
}

pub(crate) struct MachineShared<S: StateKey, I: StateKey> {
    pub(crate) states: RefCell<HashMap<StateId<S, I>, StateHandle<S, I>>>,
    pub(crate) order: RefCell<Vec<StateId<S, I>>>,
}

/// A configured hierarchical state machine
pub struct StateMachine<S: StateKey, I: StateKey> {
    pub(crate) shared: Rc<MachineShared<S, I>>,
}

impl<S: StateKey, I: StateKey> Clone for StateMachine<S, I> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<S: StateKey, I: StateKey> Default for StateMachine<S, I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: StateKey, I: StateKey> StateMachine<S, I> {
    pub fn new() -> Self {
        Self {
            shared: Rc::new(MachineShared {
                states: RefCell::new(HashMap::new()),
                order: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Configure (or retrieve) a public state
    pub fn configure_state(&self, key: S) -> StateHandle<S, I> {
        self.configure(StateId::Public(key))
    }

    /// Configure (or retrieve) an internal state used for substructure
    pub fn configure_internal_state(&self, key: I) -> StateHandle<S, I> {
        self.configure(StateId::Internal(key))
    }

    fn configure(&self, id: StateId<S, I>) -> StateHandle<S, I> {
        let mut states = self.shared.states.borrow_mut();
        if let Some(handle) = states.get(&id) {
            return handle.clone();
        }
        let handle = StateHandle {
            conf: Rc::new(RefCell::new(StateConf::new(id.clone()))),
        };
        states.insert(id.clone(), handle.clone());
        self.shared.order.borrow_mut().push(id);
        handle
    }

    /// Look up a configured state
    pub fn state(&self, id: &StateId<S, I>) -> Option<StateHandle<S, I>> {
        self.shared.states.borrow().get(id).cloned()
    }

    pub fn contains(&self, id: &StateId<S, I>) -> bool {
        self.shared.states.borrow().contains_key(id)
    }

    /// Root-to-target path following parent links
    ///
    /// Fails with `NotFound` for an unconfigured state and `InvalidUsage`
    /// when parent links form a cycle.
    pub(crate) fn path_of(&self, target: &StateId<S, I>) -> Result<Vec<StateId<S, I>>> {
        let limit = self.shared.states.borrow().len();
        let mut path = Vec::new();
        let mut cursor = Some(target.clone());
        while let Some(id) = cursor {
            if path.len() > limit {
                return Err(WorkflowError::invalid_usage(
                    "state parent links form a cycle",
                ));
            }
            let handle = self.state(&id).ok_or_else(|| {
                WorkflowError::not_found(format!("state '{}'", id.display_name()))
            })?;
            cursor = handle.conf.borrow().parent.clone();
            path.push(id);
        }
        path.reverse();
        Ok(path)
    }

    /// Run the machine under `ctx`, starting from `initial_state`
    ///
    /// With `is_restoring`, the first entry runs `on_activate` handlers
    /// instead of `on_enter`. `on_state_entered` observes every settled leaf.
    /// The returned instance's [`completion`](StateMachineInstance::completion)
    /// future resolves when the machine stops.
    pub fn run(
        &self,
        ctx: &WorkflowCtx,
        initial_state: StateId<S, I>,
        is_restoring: bool,
        on_state_entered: Option<Box<dyn Fn(&StateId<S, I>)>>,
    ) -> Result<StateMachineInstance<S, I>> {
        if !self.contains(&initial_state) {
            return Err(WorkflowError::not_found(format!(
                "initial state '{}'",
                initial_state.display_name()
            )));
        }
        Ok(instance::start(
            self.clone(),
            ctx.clone(),
            initial_state,
            is_restoring,
            on_state_entered,
        ))
    }

    /// Metadata view of the configured machine, for graph rendering
    pub fn export(&self) -> Vec<StateExport> {
        let order = self.shared.order.borrow().clone();
        order
            .iter()
            .filter_map(|id| self.state(id))
            .map(|handle| {
                let conf = handle.conf.borrow();
                StateExport {
                    name: conf.id.display_name(),
                    description: conf.description.clone(),
                    parent: conf.parent.as_ref().map(StateId::display_name),
                    hidden: conf.hidden,
                    internal: conf.id.is_internal(),
                    transitions: conf
                        .triggers
                        .iter()
                        .flat_map(|t| export_trigger(&t.borrow()))
                        .collect(),
                }
            })
            .collect()
    }
}

fn export_trigger<S: StateKey, I: StateKey>(trigger: &TriggerConf<S, I>) -> Vec<TransitionExport> {
    let description = trigger.display_description();
    let mut edges: Vec<(String, Vec<String>)> = Vec::new();

    for branch in &trigger.branches {
        edges.push((
            branch.target.display_name(),
            vec![branch.guard.description.clone()],
        ));
    }
    if let Some(target) = &trigger.main_target {
        edges.push((
            target.display_name(),
            trigger
                .main_guards
                .iter()
                .map(|g| g.description.clone())
                .collect(),
        ));
    }

    let numbered = edges.len() > 1;
    edges
        .into_iter()
        .enumerate()
        .map(|(index, (target, guards))| {
            let mut label = String::new();
            if numbered {
                label.push_str(&format!("{}: ", index + 1));
            }
            label.push_str(&description);
            if !guards.is_empty() {
                label.push_str(&format!(" [{}]", guards.join(" AND ")));
            }
            TransitionExport {
                label,
                target,
                hidden: trigger.hidden,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Key {
        A,
        B,
        C,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Hidden {
        Sub,
    }

    type Machine = StateMachine<Key, Hidden>;

    fn id(key: Key) -> StateId<Key, Hidden> {
        StateId::Public(key)
    }

    #[test]
    fn test_configure_is_idempotent() {
        let machine = Machine::new();
        machine.configure_state(Key::A).has_description("first");
        let again = machine.configure_state(Key::A);
        assert_eq!(again.conf.borrow().description.as_deref(), Some("first"));
    }

    #[test]
    fn test_path_of_walks_parents() {
        let machine = Machine::new();
        let a = machine.configure_state(Key::A);
        let b = machine.configure_state(Key::B).substate_of(&a);
        machine.configure_state(Key::C).substate_of(&b);

        let path = machine.path_of(&id(Key::C)).unwrap();
        assert_eq!(path, vec![id(Key::A), id(Key::B), id(Key::C)]);
    }

    #[test]
    fn test_path_of_unconfigured_state() {
        let machine = Machine::new();
        machine.configure_state(Key::A);
        let err = machine.path_of(&id(Key::B)).unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound(_)));
    }

    #[test]
    fn test_path_of_detects_cycles() {
        let machine = Machine::new();
        machine
            .configure_state(Key::A)
            .substate_of_key(id(Key::B));
        machine
            .configure_state(Key::B)
            .substate_of_key(id(Key::A));

        let err = machine.path_of(&id(Key::A)).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidUsage(_)));
    }

    #[test]
    fn test_guarded_transition_label() {
        let machine = Machine::new();
        machine.configure_state(Key::B);
        machine
            .configure_state(Key::A)
            .on_async(|_ctx| async { Ok(()) })
            .with_description("E1")
            .when(|_| true, "C1")
            .when(|_| true, "C2")
            .go_to(id(Key::B));

        let export = machine.export();
        let a = export.iter().find(|s| s.name == "A").unwrap();
        assert_eq!(a.transitions.len(), 1);
        assert_eq!(a.transitions[0].label, "E1 [C1 AND C2]");
        assert_eq!(a.transitions[0].target, "B");
    }

    #[test]
    fn test_multiple_target_labels_are_numbered() {
        let machine = Machine::new();
        machine.configure_state(Key::B);
        machine.configure_state(Key::C);
        machine
            .configure_state(Key::A)
            .on_async(|_ctx| async { Ok(()) })
            .with_description("E1")
            .when_then_go_to(|_| true, id(Key::C), "C1")
            .go_to(id(Key::B));

        let export = machine.export();
        let a = export.iter().find(|s| s.name == "A").unwrap();
        let labels: Vec<&str> = a.transitions.iter().map(|t| t.label.as_str()).collect();
        assert_eq!(labels, vec!["1: E1 [C1]", "2: E1"]);
        assert_eq!(a.transitions[0].target, "C");
        assert_eq!(a.transitions[1].target, "B");
    }

    #[test]
    fn test_internal_states_are_flagged() {
        let machine = Machine::new();
        let a = machine.configure_state(Key::A);
        machine
            .configure_internal_state(Hidden::Sub)
            .substate_of(&a)
            .hide();

        let export = machine.export();
        let sub = export.iter().find(|s| s.name == "Sub").unwrap();
        assert!(sub.internal);
        assert!(sub.hidden);
        assert_eq!(sub.parent.as_deref(), Some("A"));
    }
}
