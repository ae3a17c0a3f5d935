//! Per-workflow single-threaded scheduler
//!
//! Every workflow instance owns one dedicated OS thread running a
//! current-thread tokio runtime inside a `LocalSet`. All callbacks enqueued
//! through the scheduler start in FIFO order on that thread, and because the
//! runtime is single-threaded, every poll of every workflow task is
//! serialized. That is the backbone of the "all mutations happen on the
//! workflow thread" guarantee.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use futures::future::LocalBoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::error::{Result, WorkflowError};

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_SCHEDULER: Cell<u64> = const { Cell::new(0) };
}

/// Scheduler id of the calling thread, 0 when not a workflow thread
pub(crate) fn current_scheduler_id() -> u64 {
    CURRENT_SCHEDULER.with(|c| c.get())
}

enum Job {
    Sync(Box<dyn FnOnce() + Send>),
    Task(Box<dyn FnOnce() -> LocalBoxFuture<'static, ()> + Send>),
}

/// Handle to a workflow's dedicated executor thread
pub struct Scheduler {
    id: u64,
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
}

impl Scheduler {
    /// Spawn the executor thread
    pub fn new(name: &str) -> Self {
        let id = NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let thread_name = format!("workflow-{name}");

        let spawned = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                CURRENT_SCHEDULER.with(|c| c.set(id));
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(err) => {
                        error!(%err, "failed to build workflow runtime");
                        return;
                    }
                };
                let local = tokio::task::LocalSet::new();
                local.block_on(&runtime, async move {
                    while let Some(job) = rx.recv().await {
                        match job {
                            Job::Sync(f) => f(),
                            Job::Task(f) => {
                                tokio::task::spawn_local(f());
                            }
                        }
                    }
                });
                debug!(scheduler = id, "workflow thread stopped");
            });
        if let Err(err) = spawned {
            error!(%err, "failed to spawn workflow thread");
        }

        Self {
            id,
            tx: Mutex::new(Some(tx)),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// True when the caller is on this scheduler's thread
    pub fn is_on_workflow_thread(&self) -> bool {
        CURRENT_SCHEDULER.with(|c| c.get()) == self.id
    }

    /// Fail with `InvalidUsage` off the workflow thread
    pub fn ensure_workflow_thread(&self) -> Result<()> {
        if self.is_on_workflow_thread() {
            Ok(())
        } else {
            Err(WorkflowError::invalid_usage(
                "this call is only valid on the workflow thread",
            ))
        }
    }

    fn send(&self, job: Job) -> Result<()> {
        let guard = self.tx.lock();
        match guard.as_ref() {
            Some(tx) => tx.send(job).map_err(|_| WorkflowError::Cancelled),
            None => Err(WorkflowError::Cancelled),
        }
    }

    /// Enqueue a synchronous callback; FIFO with respect to other jobs
    pub fn enqueue(&self, f: impl FnOnce() + Send + 'static) -> Result<()> {
        self.send(Job::Sync(Box::new(f)))
    }

    /// Enqueue an asynchronous job; it starts in FIFO order and then
    /// cooperates with other workflow tasks at its await points
    pub fn spawn(
        &self,
        f: impl FnOnce() -> LocalBoxFuture<'static, ()> + Send + 'static,
    ) -> Result<()> {
        self.send(Job::Task(Box::new(f)))
    }

    /// Run `f` on the workflow thread: inline when already there, otherwise
    /// enqueued, completing once `f` has run
    pub async fn run_via_scheduler<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_on_workflow_thread() {
            return Ok(f());
        }
        let (tx, rx) = oneshot::channel();
        self.enqueue(move || {
            let _ = tx.send(f());
        })?;
        rx.await.map_err(|_| WorkflowError::Cancelled)
    }

    /// Run an async job on the workflow thread and await its result
    pub async fn run_task_via_scheduler<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> LocalBoxFuture<'static, Result<R>> + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.spawn(move || {
            Box::pin(async move {
                let _ = tx.send(f().await);
            })
        })?;
        rx.await.map_err(|_| WorkflowError::Cancelled)?
    }

    /// Stop accepting jobs; the thread exits after draining the queue
    pub fn shutdown(&self) {
        self.tx.lock().take();
    }

    /// True once `shutdown` has been called
    pub fn is_shut_down(&self) -> bool {
        self.tx.lock().is_none()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
