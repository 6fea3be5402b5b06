//! Detects whether a resource is already being modified by a change in
//! progress, so that two changes never operate on the same thing at once.
//!
//! A task or change claims a resource by carrying its name under the
//! [`RESOURCE_KEY`] data key, either as a string or as a list of strings.
//! Managers can also declare that every task of a given kind touches some
//! resources, computed from the task itself, with
//! [`ConflictChecker::add_affected_by_kind`].

use keel_store::{Change, ChangeId, DataBag, StateGuard, StoreError, Task};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Data key naming the resource(s) a task or change operates on.
pub const RESOURCE_KEY: &str = "resource";

#[derive(Debug, Error)]
pub enum ConflictError {
    #[error("{resource:?} has {change_kind:?} change in progress (change {change_id})")]
    ChangeInProgress {
        resource: String,
        change_id: ChangeId,
        change_kind: String,
    },
}

/// Computes the resources a task affects beyond those named in its data.
pub type AffectedFn = Box<dyn Fn(&Task) -> Vec<String> + Send + Sync>;

/// Claim `resource` for `task`.
pub fn set_resource(task: &mut Task, resource: &str) -> Result<(), StoreError> {
    task.set(RESOURCE_KEY, resource)
}

fn named_resources(data: &DataBag) -> Vec<String> {
    match data.raw(RESOURCE_KEY) {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_owned))
            .collect(),
        _ => Vec::new(),
    }
}

#[derive(Default)]
pub struct ConflictChecker {
    affected: HashMap<String, AffectedFn>,
}

impl ConflictChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that tasks of `kind` affect the resources returned by `f`.
    pub fn add_affected_by_kind<F>(&mut self, kind: &str, f: F)
    where
        F: Fn(&Task) -> Vec<String> + Send + Sync + 'static,
    {
        self.affected.insert(kind.to_owned(), Box::new(f));
    }

    fn task_resources(&self, task: &Task) -> Vec<String> {
        let mut out = named_resources(task.data());
        if let Some(f) = self.affected.get(task.kind()) {
            out.extend(f(task));
        }
        out
    }

    fn change_claims(&self, guard: &StateGuard<'_>, chg: &Change, resource: &str) -> bool {
        named_resources(chg.data()).iter().any(|r| r == resource)
            || guard
                .change_tasks(chg.id())
                .into_iter()
                .any(|t| self.task_resources(t).iter().any(|r| r == resource))
    }

    /// Fail if any change that is not ready, other than `ignore`, operates on
    /// one of `resources`. Never modifies state.
    pub fn check(
        &self,
        guard: &StateGuard<'_>,
        resources: &[&str],
        ignore: Option<&ChangeId>,
    ) -> Result<(), ConflictError> {
        for chg in guard.changes() {
            if Some(chg.id()) == ignore || guard.is_change_ready(chg.id()) {
                continue;
            }
            for resource in resources {
                if self.change_claims(guard, chg, resource) {
                    return Err(ConflictError::ChangeInProgress {
                        resource: (*resource).to_owned(),
                        change_id: chg.id().clone(),
                        change_kind: chg.kind().to_owned(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Fail if a change in progress operates on `resource`.
pub fn check_change_conflict(
    guard: &StateGuard<'_>,
    resource: &str,
    ignore: Option<&ChangeId>,
) -> Result<(), ConflictError> {
    ConflictChecker::default().check(guard, &[resource], ignore)
}

pub fn check_change_conflict_many(
    guard: &StateGuard<'_>,
    resources: &[&str],
    ignore: Option<&ChangeId>,
) -> Result<(), ConflictError> {
    ConflictChecker::default().check(guard, resources, ignore)
}
