//! Cancellation scopes
//!
//! Every workflow owns a root cancellation source. Operators derive child
//! scopes from it, forming a tree: cancelling a parent cancels every
//! descendant. The scope active for the currently running code is ambient,
//! carried in task-local storage, so composed operators pick it up without
//! threading an explicit parameter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use tokio_util::sync::CancellationToken;

/// Stable identity of a [`CancelScope`]
///
/// Tokens themselves expose no identity; the activation-dates manager keys
/// its registrations by this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u64);

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

fn next_scope_id() -> ScopeId {
    ScopeId(NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed))
}

/// A node in a workflow's cancellation tree
#[derive(Debug, Clone)]
pub struct CancelScope {
    id: ScopeId,
    token: CancellationToken,
}

impl CancelScope {
    /// A fresh root scope (workflow root token)
    pub fn new_root() -> Self {
        Self {
            id: next_scope_id(),
            token: CancellationToken::new(),
        }
    }

    /// Derive a child scope; cancelling `self` cancels the child
    pub fn child(&self) -> Self {
        Self {
            id: next_scope_id(),
            token: self.token.child_token(),
        }
    }

    pub fn id(&self) -> ScopeId {
        self.id
    }

    /// Cancel this scope and all descendants
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes when the scope is cancelled
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

tokio::task_local! {
    static CURRENT_SCOPE: CancelScope;
}

fn detached_scope() -> &'static CancelScope {
    static DETACHED: OnceLock<CancelScope> = OnceLock::new();
    DETACHED.get_or_init(CancelScope::new_root)
}

/// The ambient scope for the running code
///
/// Outside any installed scope this is a process-wide never-cancelled scope,
/// so library code can always ask for "the current token".
pub fn current_scope() -> CancelScope {
    CURRENT_SCOPE
        .try_with(Clone::clone)
        .unwrap_or_else(|_| detached_scope().clone())
}

/// Install `scope` as the ambient scope for the duration of `fut`
///
/// Restoration is LIFO and happens on every exit path: normal return, error,
/// and cooperative cancellation all restore the previous scope exactly.
pub async fn with_scope<F: std::future::Future>(scope: CancelScope, fut: F) -> F::Output {
    CURRENT_SCOPE.scope(scope, fut).await
}

/// Synchronous variant of [`with_scope`] for plain callbacks
pub fn with_scope_sync<R>(scope: CancelScope, f: impl FnOnce() -> R) -> R {
    CURRENT_SCOPE.sync_scope(scope, f)
}
