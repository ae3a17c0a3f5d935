//! # Longrun workflow substrate
//!
//! A library for authoring long-running, resumable workflows: stateful,
//! event-driven processes whose lifetimes span from milliseconds to months.
//! Each workflow owns mutable named data, runs user logic that awaits
//! external stimuli (time, named actions, other workflows), and survives
//! process restarts by persisting through a pluggable repository.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Workflow                             │
//! │  (lifecycle, action registry, data fields, event log)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Scheduler + OperationGate                  │
//! │  (one thread per workflow; readiness for observers)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Operators + StateMachine engine                │
//! │  (wait_for_any / action / date; hierarchical states)        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use longrun_core::prelude::*;
//!
//! struct Approval;
//!
//! impl WorkflowLogic for Approval {
//!     fn on_actions_init(&mut self, ctx: &WorkflowCtx) -> Result<()> {
//!         ctx.configure_action(ActionConfig::new("Approve"))?;
//!         ctx.configure_action(ActionConfig::new("Reject"))
//!     }
//!
//!     fn run(&mut self, ctx: WorkflowCtx) -> LocalBoxFuture<'static, Result<()>> {
//!         Box::pin(async move {
//!             let ctx2 = ctx.clone();
//!             let winner = wait_for_any(vec![
//!                 Branch::required(move || async move {
//!                     ctx.wait_for_action("Approve").await.map(|_| ())
//!                 }),
//!                 Branch::required(move || async move {
//!                     ctx2.wait_for_action("Reject").await.map(|_| ())
//!                 }),
//!             ])
//!             .await?;
//!             // 0 = approved, 1 = rejected
//!             let _ = winner;
//!             Ok(())
//!         })
//!     }
//! }
//! ```

pub mod activation;
pub mod cancel;
pub mod coordinator;
pub mod error;
pub mod fields;
pub mod gate;
pub mod machine;
pub mod operators;
pub mod repository;
pub mod scheduler;
pub mod time;
pub mod values;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::cancel::{current_scope, with_scope, CancelScope};
    pub use crate::error::{Result, WorkflowError};
    pub use crate::fields::DataFieldDescriptor;
    pub use crate::machine::{StateId, StateMachine, StateMachineInstance};
    pub use crate::operators::{then, wait_for_any, with_timeout, Branch};
    pub use crate::repository::{InMemoryRepository, WorkflowId, WorkflowRepository};
    pub use crate::time::{Clock, SystemClock, TestClock};
    pub use crate::values::{NamedValues, Value, ValueCodec, ValueKind};
    pub use crate::workflow::{
        ActionConfig, StartOptions, Workflow, WorkflowCtx, WorkflowLogic, WorkflowOptions,
        WorkflowStatus,
    };
    pub use futures::future::LocalBoxFuture;
}

// Re-export key types at crate root
pub use activation::ActivationDatesManager;
pub use cancel::{current_scope, with_scope, CancelScope, ScopeId};
pub use coordinator::{DependencyConfig, DependencyEvent, DependencyTrigger, WorkflowsCoordinator};
pub use error::{Result, WorkflowError};
pub use fields::{DataFieldDescriptor, WorkflowMetadata};
pub use gate::{Operation, OperationGate};
pub use machine::{
    StateExport, StateId, StateMachine, StateMachineInstance, StateTransition, TransitionExport,
};
pub use operators::{then, wait_for_any, with_timeout, Branch};
pub use repository::{
    InMemoryRepository, TerminalMark, WorkflowId, WorkflowRepository, WorkflowSnapshot,
};
pub use time::{Clock, SystemClock, TestClock};
pub use values::{NamedValues, OperationHandle, Value, ValueCodec, ValueKind};
pub use workflow::{
    ActionConfig, ActionEvent, LoggedEvent, StartOptions, StateChangeEvent, Workflow, WorkflowCtx,
    WorkflowLogic, WorkflowOptions, WorkflowStatus, ACTION_OPERATION_PARAMETER, ACTION_PARAMETER,
};
