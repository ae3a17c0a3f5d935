//! Activation dates
//!
//! A workflow waiting on one or more future dates tells its repository the
//! earliest one, so an unloaded workflow can be re-activated in time. The
//! manager aggregates dates registered under cancellation scopes and tracks
//! the minimum across all scopes that are still live.

use std::cell::RefCell;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::trace;

use crate::cancel::{CancelScope, ScopeId};

struct ScopeDates {
    scope: CancelScope,
    dates: Vec<DateTime<Utc>>,
}

/// Aggregates (scope, future date) registrations and exposes the minimum
pub struct ActivationDatesManager {
    entries: RefCell<HashMap<ScopeId, ScopeDates>>,
    next_tx: watch::Sender<Option<DateTime<Utc>>>,
}

impl ActivationDatesManager {
    pub fn new() -> Self {
        let (next_tx, _) = watch::channel(None);
        Self {
            entries: RefCell::new(HashMap::new()),
            next_tx,
        }
    }

    /// Register `date` under `scope`; `DateTime::MAX` ("never") is ignored
    pub fn add_activation_date(&self, scope: &CancelScope, date: DateTime<Utc>) {
        if date == DateTime::<Utc>::MAX_UTC {
            return;
        }
        {
            let mut entries = self.entries.borrow_mut();
            entries
                .entry(scope.id())
                .or_insert_with(|| ScopeDates {
                    scope: scope.clone(),
                    dates: Vec::new(),
                })
                .dates
                .push(date);
        }
        self.publish();
    }

    /// Drop one registration of `date` under `scope`
    pub fn remove_activation_date(&self, scope: &CancelScope, date: DateTime<Utc>) {
        {
            let mut entries = self.entries.borrow_mut();
            if let Some(entry) = entries.get_mut(&scope.id()) {
                if let Some(idx) = entry.dates.iter().position(|d| *d == date) {
                    entry.dates.remove(idx);
                }
                if entry.dates.is_empty() {
                    entries.remove(&scope.id());
                }
            }
        }
        self.publish();
    }

    /// Drop every registration under `scope`; idempotent
    pub fn on_scope_canceled(&self, scope: &CancelScope) {
        let removed = self.entries.borrow_mut().remove(&scope.id()).is_some();
        if removed {
            trace!(scope = ?scope.id(), "activation dates dropped for cancelled scope");
        }
        self.publish();
    }

    /// Current minimum across live scopes, or `None` when nothing is pending
    pub fn next_activation_date(&self) -> Option<DateTime<Utc>> {
        *self.next_tx.borrow()
    }

    /// Observe `NextActivationDateChanged`; the receiver yields the new
    /// minimum each time it moves
    pub fn subscribe(&self) -> watch::Receiver<Option<DateTime<Utc>>> {
        self.next_tx.subscribe()
    }

    fn compute_min(&self) -> Option<DateTime<Utc>> {
        self.entries
            .borrow()
            .values()
            .filter(|e| !e.scope.is_cancelled())
            .flat_map(|e| e.dates.iter().copied())
            .min()
    }

    fn publish(&self) {
        let min = self.compute_min();
        self.next_tx.send_if_modified(|current| {
            if *current == min {
                false
            } else {
                *current = min;
                true
            }
        });
    }
}

impl Default for ActivationDatesManager {
    fn default() -> Self {
        Self::new()
    }
}
