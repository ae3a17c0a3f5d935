//! State repository contract
//!
//! The substrate persists nothing itself. It calls a repository at lifecycle
//! milestones: after every action (a save opportunity), and exactly once with
//! a terminal mark. The in-memory implementation here backs the test suites.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::values::NamedValues;

/// Identity of a workflow instance, assigned at most once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(Uuid);

impl WorkflowId {
    /// A fresh time-ordered id
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Durable view of a workflow handed to the repository on save
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    /// Current id, `None` until assigned
    pub id: Option<WorkflowId>,

    /// Persistent data fields only; transient data is excluded
    pub data: NamedValues,

    /// Earliest future wake-up, for re-activation scheduling
    pub next_activation: Option<DateTime<Utc>>,
}

/// Persistence collaborator, implemented outside the substrate
///
/// All methods are invoked on the workflow scheduler. A repository may assign
/// the workflow id by returning it from `save_workflow_data`.
#[async_trait]
pub trait WorkflowRepository: Send + Sync + 'static {
    /// Persist the snapshot; returns a newly assigned id when the workflow
    /// does not have one yet
    async fn save_workflow_data(
        &self,
        snapshot: WorkflowSnapshot,
    ) -> anyhow::Result<Option<WorkflowId>>;

    /// Terminal mark: completed
    async fn mark_workflow_as_completed(&self, id: Option<WorkflowId>) -> anyhow::Result<()>;

    /// Terminal mark: cancelled
    async fn mark_workflow_as_canceled(&self, id: Option<WorkflowId>) -> anyhow::Result<()>;

    /// Terminal mark: failed
    async fn mark_workflow_as_failed(
        &self,
        id: Option<WorkflowId>,
        error: String,
    ) -> anyhow::Result<()>;
}

/// Terminal mark recorded by [`InMemoryRepository`]
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalMark {
    Completed(Option<WorkflowId>),
    Canceled(Option<WorkflowId>),
    Failed(Option<WorkflowId>, String),
}

#[derive(Default)]
struct InMemoryState {
    saves: Vec<WorkflowSnapshot>,
    marks: Vec<TerminalMark>,
}

/// Recording repository for tests
///
/// Assigns a fresh id on the first save of an id-less workflow, and records
/// every call for assertions.
#[derive(Default)]
pub struct InMemoryRepository {
    state: Mutex<InMemoryState>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_count(&self) -> usize {
        self.state.lock().saves.len()
    }

    pub fn last_snapshot(&self) -> Option<WorkflowSnapshot> {
        self.state.lock().saves.last().cloned()
    }

    pub fn marks(&self) -> Vec<TerminalMark> {
        self.state.lock().marks.clone()
    }
}

#[async_trait]
impl WorkflowRepository for InMemoryRepository {
    async fn save_workflow_data(
        &self,
        snapshot: WorkflowSnapshot,
    ) -> anyhow::Result<Option<WorkflowId>> {
        let mut state = self.state.lock();
        let assigned = if snapshot.id.is_none() {
            Some(WorkflowId::new())
        } else {
            None
        };
        state.saves.push(snapshot);
        Ok(assigned)
    }

    async fn mark_workflow_as_completed(&self, id: Option<WorkflowId>) -> anyhow::Result<()> {
        self.state.lock().marks.push(TerminalMark::Completed(id));
        Ok(())
    }

    async fn mark_workflow_as_canceled(&self, id: Option<WorkflowId>) -> anyhow::Result<()> {
        self.state.lock().marks.push(TerminalMark::Canceled(id));
        Ok(())
    }

    async fn mark_workflow_as_failed(
        &self,
        id: Option<WorkflowId>,
        error: String,
    ) -> anyhow::Result<()> {
        self.state.lock().marks.push(TerminalMark::Failed(id, error));
        Ok(())
    }
}
