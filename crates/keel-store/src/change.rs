use crate::data::DataBag;
use crate::types::{ChangeId, TaskId};
use crate::StoreError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Opaque label marking a significant position inside a task set.
///
/// Edges carry no scheduling meaning; tooling queries them to decide, for
/// example, whether a change can still be abandoned safely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeKind(&'static str);

impl EdgeKind {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

/// First task of a set.
pub const BEGIN_EDGE: EdgeKind = EdgeKind::new("begin");
/// Last task before anything on the local system is modified.
pub const LAST_BEFORE_LOCAL_MODIFICATIONS_EDGE: EdgeKind =
    EdgeKind::new("last-before-local-modifications");
/// Task after which a reboot may be required before continuing.
pub const MAYBE_REBOOT_EDGE: EdgeKind = EdgeKind::new("maybe-reboot");

/// An ordered group of tasks built by a manager before it is attached to a change.
#[derive(Debug, Clone, Default)]
pub struct TaskSet {
    tasks: Vec<TaskId>,
    edges: BTreeMap<EdgeKind, TaskId>,
}

impl TaskSet {
    pub fn new(tasks: impl IntoIterator<Item = TaskId>) -> Self {
        let mut ts = Self::default();
        for t in tasks {
            ts.add_task(t);
        }
        ts
    }

    pub fn add_task(&mut self, task: TaskId) {
        if !self.tasks.contains(&task) {
            self.tasks.push(task);
        }
    }

    /// Append another set's tasks; its edges are merged, keeping ours on collision.
    pub fn add_all(&mut self, other: &TaskSet) {
        for t in &other.tasks {
            self.add_task(t.clone());
        }
        for (edge, t) in &other.edges {
            self.edges.entry(*edge).or_insert_with(|| t.clone());
        }
    }

    /// Label `task` with `edge`. The task should belong to this set.
    pub fn mark_edge(&mut self, task: &TaskId, edge: EdgeKind) {
        self.edges.insert(edge, task.clone());
    }

    pub fn edge(&self, edge: EdgeKind) -> Option<&TaskId> {
        self.edges.get(&edge)
    }

    pub fn edges(&self) -> impl Iterator<Item = (EdgeKind, &TaskId)> {
        self.edges.iter().map(|(k, v)| (*k, v))
    }

    pub fn tasks(&self) -> &[TaskId] {
        &self.tasks
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// A named, user-visible unit of work.
///
/// The change status is derived from its tasks; see
/// [`StateGuard::change_status`](crate::StateGuard::change_status).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Change {
    id: ChangeId,
    kind: String,
    summary: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    task_ids: Vec<TaskId>,
    #[serde(default, skip_serializing_if = "DataBag::is_empty")]
    data: DataBag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    err: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    edges: BTreeMap<String, TaskId>,
    spawn_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ready_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    deadline: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    rollback_stopped: bool,
}

impl Change {
    pub(crate) fn new(id: ChangeId, kind: &str, summary: &str, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: kind.to_owned(),
            summary: summary.to_owned(),
            task_ids: Vec::new(),
            data: DataBag::new(),
            err: None,
            edges: BTreeMap::new(),
            spawn_time: now,
            ready_time: None,
            deadline: None,
            rollback_stopped: false,
        }
    }

    pub fn id(&self) -> &ChangeId {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn task_ids(&self) -> &[TaskId] {
        &self.task_ids
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        self.data.get(key)
    }

    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<(), StoreError> {
        self.data.set(key, value)
    }

    pub fn data(&self) -> &DataBag {
        &self.data
    }

    /// Change-level failure text, set for failures not owned by a single task.
    pub fn failure(&self) -> Option<&str> {
        self.err.as_deref()
    }

    pub fn set_failure(&mut self, message: impl Into<String>) {
        self.err = Some(message.into());
    }

    pub fn edge(&self, edge: EdgeKind) -> Option<&TaskId> {
        self.edges.get(edge.as_str())
    }

    pub fn edges(&self) -> impl Iterator<Item = (&str, &TaskId)> {
        self.edges.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn spawn_time(&self) -> DateTime<Utc> {
        self.spawn_time
    }

    pub fn ready_time(&self) -> Option<DateTime<Utc>> {
        self.ready_time
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    /// Fail the change with a timeout error if it is not ready by `deadline`.
    pub fn set_deadline(&mut self, deadline: DateTime<Utc>) {
        self.deadline = Some(deadline);
    }

    /// Set once an undo handler of this change failed. Completed tasks of
    /// such a change are never scheduled for undo again.
    pub fn rollback_stopped(&self) -> bool {
        self.rollback_stopped
    }

    pub(crate) fn set_rollback_stopped(&mut self) {
        self.rollback_stopped = true;
    }

    pub(crate) fn push_task(&mut self, task: TaskId) {
        if !self.task_ids.contains(&task) {
            self.task_ids.push(task);
        }
    }

    pub(crate) fn set_edge(&mut self, edge: EdgeKind, task: TaskId) {
        self.edges.insert(edge.as_str().to_owned(), task);
    }

    pub(crate) fn set_ready_time(&mut self, at: Option<DateTime<Utc>>) {
        self.ready_time = at;
    }
}
